use thiserror::Error;

use crate::protocol::ParseError;

/// Error types that can occur while talking to a gateway.
///
/// Most of these never escape the session boundary: the session logs them,
/// closes the connection and reports a plain failure to its caller. They are
/// still returned as values internally so every step can use `?`.
#[derive(Error, Debug)]
pub enum CubeError {
    /// The gateway could not be reached (refused, unresolvable, unreachable)
    #[error("Could not connect to {addr}: {source}")]
    Connect {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    /// I/O operation failed mid-session
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A read or write did not complete within the configured I/O timeout
    #[error("Timed out waiting for the gateway")]
    Timeout,

    /// An inbound line could not be decoded
    #[error("Parse error: {0}")]
    Parse(#[from] ParseError),

    /// A well-formed message whose content does not fit the current state
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// The command queue is at capacity
    #[error("Command queue full ({capacity} entries)")]
    QueueFull { capacity: usize },

    /// Configuration validation failed
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// A communication channel was closed unexpectedly
    #[error("Channel closed unexpectedly")]
    ChannelClosed,
}

pub type Result<T> = std::result::Result<T, CubeError>;
