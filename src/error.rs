//! Error types for setu-net

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;

/// setu-net error types
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Invalid configuration (bad host/port, malformed settings blob)
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Operation attempted while the connection is not open
    #[error("Network connection is not open")]
    NotOpen,

    /// TCP connect failed
    #[error("Connect failed: {0}")]
    Connect(std::io::Error),

    /// Read or write failed for a reason other than a clean disconnect
    #[error("Transport error: {0}")]
    Transport(std::io::Error),

    /// Peer reset, broken pipe or end-of-stream
    #[error("Peer disconnected")]
    Disconnected,

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
