//! Configuration structs with sensible defaults and RON persistence.

use std::fmt;
use std::net::{Ipv4Addr, SocketAddrV4};
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// File name of the persisted configuration inside the config directory.
pub const CONFIG_FILE: &str = "config.ron";

/// Lowest port a game may listen on.
const MIN_PORT: u16 = 1024;

/// Platform config directory for the game, e.g. `~/.config/expansion-war`.
pub fn default_config_dir() -> Result<PathBuf, ConfigError> {
    dirs::config_dir()
        .map(|dir| dir.join("expansion-war"))
        .ok_or(ConfigError::NoConfigDir)
}

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Config {
    /// Network play settings.
    pub network: NetworkConfig,
    /// Debug/development settings.
    pub debug: DebugConfig,
}

/// Which side of the connection this instance plays.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum PeerRole {
    /// Listens and sends the opening state.
    #[default]
    Host,
    /// Connects to a host.
    Joiner,
}

impl fmt::Display for PeerRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PeerRole::Host => f.write_str("host"),
            PeerRole::Joiner => f.write_str("joiner"),
        }
    }
}

/// Network play configuration.
///
/// All durations are in milliseconds so the RON file stays plain integers.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct NetworkConfig {
    /// Host or joiner.
    pub role: PeerRole,
    /// Host: address to bind. Joiner: address to dial.
    pub address: String,
    /// TCP port, 1024 to 65535.
    pub port: u16,
    /// Game identifier both peers must agree on.
    pub game_id: String,
    /// Protocol version both peers must agree on.
    pub protocol_version: String,
    /// Timeout of a single connect attempt.
    pub connect_timeout_ms: u64,
    /// Connect attempts before giving up on the host.
    pub connect_attempts: u32,
    /// Pause between connect attempts.
    pub connect_retry_delay_ms: u64,
    /// How long either side waits for the other's handshake message.
    pub handshake_timeout_ms: u64,
    /// Bound on a single blocking write.
    pub write_timeout_ms: u64,
    /// Reconnection attempts after a lost connection.
    pub reconnect_attempts: u32,
    /// Delay before the first reconnection attempt.
    pub reconnect_initial_delay_ms: u64,
    /// Upper bound on the reconnection backoff.
    pub reconnect_max_delay_ms: u64,
    /// How long a host waits for the joiner on each reconnection attempt.
    pub reconnect_accept_window_ms: u64,
    /// Pause between background reachability probes.
    pub probe_interval_ms: u64,
    /// Timeout of one reachability probe.
    pub probe_timeout_ms: u64,
    /// Consecutive protocol errors tolerated before dropping the connection.
    pub max_protocol_errors: u32,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            role: PeerRole::Host,
            address: "127.0.0.1".to_string(),
            port: 5000,
            game_id: "ExpansionWar".to_string(),
            protocol_version: "1.0".to_string(),
            connect_timeout_ms: 15_000,
            connect_attempts: 3,
            connect_retry_delay_ms: 2_000,
            handshake_timeout_ms: 10_000,
            write_timeout_ms: 5_000,
            reconnect_attempts: 5,
            reconnect_initial_delay_ms: 2_000,
            reconnect_max_delay_ms: 10_000,
            reconnect_accept_window_ms: 10_000,
            probe_interval_ms: 2_000,
            probe_timeout_ms: 3_000,
            max_protocol_errors: 5,
        }
    }
}

impl NetworkConfig {
    /// Check the address and port before anything touches the network.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.socket_addr().map(|_| ())
    }

    /// The validated socket address.
    pub fn socket_addr(&self) -> Result<SocketAddrV4, ConfigError> {
        let ip: Ipv4Addr = self
            .address
            .trim()
            .parse()
            .map_err(|_| ConfigError::InvalidAddress(self.address.clone()))?;
        if self.port < MIN_PORT {
            return Err(ConfigError::InvalidPort(self.port));
        }
        Ok(SocketAddrV4::new(ip, self.port))
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn connect_retry_delay(&self) -> Duration {
        Duration::from_millis(self.connect_retry_delay_ms)
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }

    pub fn write_timeout(&self) -> Duration {
        Duration::from_millis(self.write_timeout_ms)
    }

    pub fn reconnect_initial_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_initial_delay_ms)
    }

    pub fn reconnect_max_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_max_delay_ms)
    }

    pub fn reconnect_accept_window(&self) -> Duration {
        Duration::from_millis(self.reconnect_accept_window_ms)
    }

    pub fn probe_interval(&self) -> Duration {
        Duration::from_millis(self.probe_interval_ms)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }
}

/// Debug/development configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DebugConfig {
    /// Log filter override (e.g., "debug", "info,expansion_net=trace").
    pub log_level: String,
    /// Also write JSON logs next to the config file.
    pub log_to_file: bool,
}

impl Default for DebugConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            log_to_file: cfg!(debug_assertions),
        }
    }
}

// --- Load / Save ---

impl Config {
    /// Load config from the given directory, or create a default config file.
    pub fn load_or_create(config_dir: &Path) -> Result<Self, ConfigError> {
        let config_path = config_dir.join(CONFIG_FILE);

        if config_path.exists() {
            let contents = std::fs::read_to_string(&config_path).map_err(ConfigError::ReadError)?;
            let config: Config = ron::from_str(&contents).map_err(ConfigError::ParseError)?;
            log::info!("Loaded config from {}", config_path.display());
            Ok(config)
        } else {
            let config = Config::default();
            config.save(config_dir)?;
            log::info!("Created default config at {}", config_path.display());
            Ok(config)
        }
    }

    /// Save config to the given directory as `config.ron`.
    pub fn save(&self, config_dir: &Path) -> Result<(), ConfigError> {
        std::fs::create_dir_all(config_dir).map_err(ConfigError::WriteError)?;

        let config_path = config_dir.join(CONFIG_FILE);
        let pretty = ron::ser::PrettyConfig::new()
            .depth_limit(2)
            .enumerate_arrays(false);

        let serialized =
            ron::ser::to_string_pretty(self, pretty).map_err(ConfigError::SerializeError)?;

        std::fs::write(&config_path, serialized).map_err(ConfigError::WriteError)?;
        Ok(())
    }

    /// Validate everything the network core relies on.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.network.validate()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_serializes() {
        let config = Config::default();
        let ron_str =
            ron::ser::to_string_pretty(&config, ron::ser::PrettyConfig::new().depth_limit(2))
                .unwrap();
        assert!(ron_str.contains("port: 5000"));
        assert!(ron_str.contains("role: host"));
        assert!(ron_str.contains("game_id: \"ExpansionWar\""));
    }

    #[test]
    fn test_defaults_are_valid() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert_eq!(
            config.network.socket_addr().unwrap(),
            SocketAddrV4::new(Ipv4Addr::LOCALHOST, 5000)
        );
    }

    #[test]
    fn test_missing_field_uses_default() {
        let ron_str = "(network: (port: 6000))";
        let config: Config = ron::from_str(ron_str).unwrap();
        assert_eq!(config.network.port, 6000);
        assert_eq!(config.network.address, "127.0.0.1");
        assert_eq!(config.debug, DebugConfig::default());
    }

    #[test]
    fn test_extra_field_ignored() {
        let result: Result<Config, _> = ron::from_str("(future_setting: true)");
        assert!(result.is_ok());
    }

    #[test]
    fn test_role_parses_from_ron() {
        let config: Config = ron::from_str("(network: (role: joiner))").unwrap();
        assert_eq!(config.network.role, PeerRole::Joiner);
        assert_eq!(config.network.role.to_string(), "joiner");
    }

    #[test]
    fn test_rejects_non_ipv4_address() {
        for bad in ["localhost", "256.0.0.1", "10.0.0", "::1", ""] {
            let network = NetworkConfig {
                address: bad.to_string(),
                ..NetworkConfig::default()
            };
            assert!(
                matches!(network.validate(), Err(ConfigError::InvalidAddress(_))),
                "{bad:?} should be rejected"
            );
        }
    }

    #[test]
    fn test_port_range() {
        let low = NetworkConfig {
            port: 80,
            ..NetworkConfig::default()
        };
        assert!(matches!(low.validate(), Err(ConfigError::InvalidPort(80))));

        for ok in [1024, 5000, 65535] {
            let network = NetworkConfig {
                port: ok,
                ..NetworkConfig::default()
            };
            assert!(network.validate().is_ok(), "port {ok} should be accepted");
        }
    }

    #[test]
    fn test_durations_follow_millis() {
        let network = NetworkConfig {
            handshake_timeout_ms: 2500,
            ..NetworkConfig::default()
        };
        assert_eq!(network.handshake_timeout(), Duration::from_millis(2500));
        assert_eq!(network.connect_timeout(), Duration::from_secs(15));
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = Config::default();
        config.network.role = PeerRole::Joiner;
        config.network.address = "10.0.0.1".to_string();
        config.debug.log_level = "debug".to_string();

        config.save(dir.path()).unwrap();
        let loaded = Config::load_or_create(dir.path()).unwrap();
        assert_eq!(config, loaded);
    }

    #[test]
    fn test_load_creates_default_file() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::load_or_create(dir.path()).unwrap();
        assert_eq!(config, Config::default());
        assert!(dir.path().join(CONFIG_FILE).exists());
    }

    #[test]
    fn test_hand_edited_file_is_read_on_next_start() {
        let dir = tempfile::tempdir().unwrap();
        Config::load_or_create(dir.path()).unwrap();

        let path = dir.path().join(CONFIG_FILE);
        std::fs::write(&path, "(network: (role: joiner, port: 7000))").unwrap();

        let config = Config::load_or_create(dir.path()).unwrap();
        assert_eq!(config.network.role, PeerRole::Joiner);
        assert_eq!(config.network.port, 7000);
        assert_eq!(config.network.address, "127.0.0.1", "Unset fields keep defaults");
        assert_eq!(
            std::fs::read_to_string(&path).unwrap(),
            "(network: (role: joiner, port: 7000))",
            "Loading never rewrites an existing file"
        );
    }

    #[test]
    fn test_invalid_ron_produces_error() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(CONFIG_FILE), "{{not valid}}").unwrap();
        assert!(matches!(
            Config::load_or_create(dir.path()),
            Err(ConfigError::ParseError(_))
        ));
    }
}
