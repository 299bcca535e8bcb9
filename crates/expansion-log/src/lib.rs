//! Structured logging for Expansion War.
//!
//! Console output carries uptime, target and level; when enabled, a JSON copy
//! goes to a log file for post-mortem analysis of network sessions. The filter
//! comes from `RUST_LOG` if set, else from the config's `debug.log_level`.

use std::path::{Path, PathBuf};

use expansion_config::Config;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Filter used when neither `RUST_LOG` nor the config set one.
pub const DEFAULT_FILTER: &str = "info,expansion_net=debug";

/// File name of the JSON log inside the log directory.
pub const LOG_FILE: &str = "expansion-war.log";

/// Filter string for `config`, falling back to [`DEFAULT_FILTER`].
pub fn filter_directive(config: Option<&Config>) -> String {
    match config {
        Some(config) if !config.debug.log_level.trim().is_empty() => {
            config.debug.log_level.trim().to_string()
        }
        _ => DEFAULT_FILTER.to_string(),
    }
}

/// Create the log directory and file. `None` if either fails.
fn open_log_file(log_dir: &Path) -> Option<(PathBuf, std::fs::File)> {
    std::fs::create_dir_all(log_dir).ok()?;
    let path = log_dir.join(LOG_FILE);
    let file = std::fs::File::create(&path).ok()?;
    Some((path, file))
}

/// Install the global tracing subscriber.
///
/// * `log_dir` - directory for the JSON log file
/// * `file_logging` - whether to write the file at all
/// * `config` - source of the log level when `RUST_LOG` is unset
///
/// Returns the log file path when file logging is active. Calling this twice
/// panics inside `tracing-subscriber`, so binaries call it once at startup.
///
/// ```no_run
/// use expansion_config::Config;
/// use expansion_log::init_logging;
///
/// let config = Config::default();
/// init_logging(Some(std::path::Path::new("./logs")), true, Some(&config));
/// ```
pub fn init_logging(
    log_dir: Option<&Path>,
    file_logging: bool,
    config: Option<&Config>,
) -> Option<PathBuf> {
    let filter_str = filter_directive(config);
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&filter_str));

    let console_layer = fmt::layer()
        .with_target(true)
        .with_thread_ids(false)
        .with_thread_names(true)
        .with_level(true)
        .with_timer(fmt::time::uptime());

    let subscriber = tracing_subscriber::registry()
        .with(env_filter)
        .with(console_layer);

    if file_logging
        && let Some(log_dir) = log_dir
        && let Some((path, log_file)) = open_log_file(log_dir)
    {
        let file_layer = fmt::layer()
            .with_writer(log_file)
            .with_ansi(false)
            .with_target(true)
            .with_timer(fmt::time::uptime())
            .json();

        subscriber.with(file_layer).init();
        return Some(path);
    }

    subscriber.init();
    None
}

/// An `EnvFilter` with [`DEFAULT_FILTER`].
pub fn default_env_filter() -> EnvFilter {
    EnvFilter::new(DEFAULT_FILTER)
}
