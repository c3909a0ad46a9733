//! TimeFleet Error Types

use thiserror::Error;

/// Result type alias for TimeFleet operations
pub type Result<T> = std::result::Result<T, Error>;

/// TimeFleet error types
#[derive(Error, Debug)]
pub enum Error {
    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid configuration file: {0}")]
    ConfigParse(#[from] toml::de::Error),

    #[error("Invalid peer address '{0}'")]
    InvalidAddress(String),

    #[error("Address {0} is not a configured peer")]
    UnknownPeer(String),

    // Network errors
    #[error("Failed to bind {address}: {source}")]
    Bind {
        address: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Network error: {0}")]
    Network(String),

    // Coordinator directory errors
    #[error("Coordinator directory error: {0}")]
    Directory(String),

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Whether this error should abort the process rather than be logged
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Error::Bind { .. } | Error::Config(_) | Error::ConfigParse(_)
        )
    }
}
