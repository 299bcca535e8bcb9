//! Configuration error types.

/// Errors that can occur when loading, saving, parsing or validating
/// configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Failed to read the config file from disk.
    #[error("failed to read config: {0}")]
    ReadError(#[source] std::io::Error),

    /// Failed to write the config file to disk.
    #[error("failed to write config: {0}")]
    WriteError(#[source] std::io::Error),

    /// Failed to parse RON content.
    #[error("failed to parse config: {0}")]
    ParseError(#[source] ron::error::SpannedError),

    /// Failed to serialize config to RON.
    #[error("failed to serialize config: {0}")]
    SerializeError(#[source] ron::Error),

    /// The address is not an IPv4 dotted quad.
    #[error("invalid address {0:?}: expected an IPv4 address such as 127.0.0.1")]
    InvalidAddress(String),

    /// The port is outside the unprivileged range.
    #[error("invalid port {0}: choose a port between 1024 and 65535")]
    InvalidPort(u16),

    /// No platform config directory could be determined.
    #[error("no config directory available on this platform")]
    NoConfigDir,
}
