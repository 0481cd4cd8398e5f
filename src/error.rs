use thiserror::Error;

/// Errors raised while talking to the upstream event stream
///
/// Every variant except a persistence failure is retried by the connection
/// manager with exponential backoff.
#[derive(Error, Debug)]
pub enum ConnectionError {
    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Unexpected handshake message: {0}")]
    Handshake(String),

    #[error("Connection closed by server")]
    Closed,

    #[error("Failed to decode message: {0}")]
    Decode(String),

    #[error("Authentication failed: {0}")]
    Authentication(String),
}

impl From<tokio_tungstenite::tungstenite::Error> for ConnectionError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        ConnectionError::Transport(err.to_string())
    }
}

/// Errors that can occur during root-cause analysis
#[derive(Error, Debug, Clone, PartialEq)]
pub enum AnalysisError {
    #[error("Backend communication failed: {0}")]
    BackendError(String),

    #[error("Request timeout")]
    Timeout,

    #[error("Invalid response format: {0}")]
    InvalidResponse(String),

    #[error("HTTP error: {0}")]
    HttpError(String),
}

impl From<reqwest::Error> for AnalysisError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            AnalysisError::Timeout
        } else {
            AnalysisError::HttpError(err.to_string())
        }
    }
}

/// Errors writing or reading the problem log
///
/// These indicate an environment fault (disk full, permissions) and are never
/// retried.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to serialize record: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Errors that can occur during configuration loading
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    ReadError(String),

    #[error("Invalid configuration value: {0}")]
    ValidationError(String),

    #[error("TOML parse error: {0}")]
    TomlError(#[from] toml::de::Error),
}

/// Top-level pipeline failure
#[derive(Error, Debug)]
pub enum MonitorError {
    #[error(transparent)]
    Connection(#[from] ConnectionError),

    #[error("Problem log failure: {0}")]
    Storage(#[from] StoreError),
}
