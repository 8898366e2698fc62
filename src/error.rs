use std::io;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum PingError {
    /// The host could not be resolved to an address of the requested family.
    #[error("cannot resolve '{host}': {reason}")]
    Resolution { host: String, reason: String },

    #[error("failed to open {mode} ICMP socket: {source}")]
    SocketOpen {
        mode: &'static str,
        #[source]
        source: io::Error,
    },

    /// Binding to a source address or interface failed.
    #[error("failed to bind to {target}: {source}")]
    Bind {
        target: String,
        #[source]
        source: io::Error,
    },

    #[error("invalid payload: {0}")]
    Encode(String),

    /// An inbound message was malformed. The receive loop drops it and continues.
    #[error("malformed ICMP message: {0}")]
    Decode(&'static str),

    /// A read deadline expired before anything arrived.
    #[error("read deadline expired")]
    Timeout,

    #[error("socket I/O failed: {0}")]
    Io(#[from] io::Error),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("ping session already started")]
    AlreadyStarted,
}

impl PingError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, PingError::Timeout)
    }
}
