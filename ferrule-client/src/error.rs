//! Error types for the Ferrule client

use thiserror::Error;

/// Result type alias for Ferrule client operations
pub type Result<T> = std::result::Result<T, Error>;

/// Ferrule client error types
#[derive(Error, Debug)]
pub enum Error {
    /// The connection terminated before (or after) the command could complete
    #[error("connection closed")]
    ConnectionClosed,

    /// Socket level failure
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// TCP connect did not finish within the configured timeout
    #[error("connect timeout: {0}")]
    ConnectTimeout(String),

    /// Malformed bytes received from the server
    #[error("protocol error: {0}")]
    Protocol(String),

    /// The server answered with an error reply; carries the raw status text
    #[error("{0}")]
    Reply(String),

    /// A reply did not have the shape the caller required
    #[error("unexpected reply: {0}")]
    UnexpectedReply(String),

    /// Address is not of the form `host:port`
    #[error("invalid address: {0}")]
    InvalidAddress(String),

    /// The cluster has no usable connection left
    #[error("no connection available")]
    NoConnectionAvailable,

    /// Every sentinel endpoint failed to resolve the requested role
    #[error("no endpoints available")]
    NoEndpointsAvailable,

    /// Invalid configuration
    #[error("configuration error: {0}")]
    Config(String),
}

impl Error {
    /// True when the failure came from a terminated connection
    pub fn is_connection_closed(&self) -> bool {
        matches!(self, Error::ConnectionClosed)
    }

    /// Raw status text of a server error reply
    pub fn reply_text(&self) -> Option<&str> {
        match self {
            Error::Reply(text) => Some(text),
            _ => None,
        }
    }

    /// True for transport level failures (socket, framing, closed connection)
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            Error::ConnectionClosed | Error::Io(_) | Error::ConnectTimeout(_) | Error::Protocol(_)
        )
    }
}
