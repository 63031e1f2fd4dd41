//! Crate-wide error taxonomy.
//!
//! Leaf modules (`config`, `storage`) define their own precise error types;
//! the engine and the CLI entrypoint only ever see `CoreError`.

use crate::message::EventTag;

/// The six error kinds the core distinguishes, per the error handling design.
#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    /// Peer closed the connection or the socket raised a fatal I/O error.
    #[error("connection closed: {0}")]
    ConnectionClosed(#[source] std::io::Error),

    /// A session's idle time exceeded the configured timeout.
    ///
    /// Not fatal; delivered to the session as an exception message. The
    /// engine constructs this purely to log it with the rest of the
    /// taxonomy's `Display` output, not to propagate it as an `Err`.
    #[error("connection timed out")]
    ConnectionTimeout,

    /// A pipe `recv` returned end-of-stream or an I/O error.
    #[error("pipe broken")]
    PipeBroken,

    /// `accept()` was refused because `MAX_CONNECTIONS` was reached.
    #[error("refused new connection; maximum reached")]
    Refused,

    /// A session posted an event tag the core does not recognize.
    ///
    /// Fatal: a silent drop would mask bugs in session code, so the core
    /// surfaces this instead of swallowing it.
    #[error("protocol violation: unhandled event tag {0:?}")]
    ProtocolViolation(EventTag),

    /// Missing or invalid configuration at startup.
    #[error("configuration error: {0}")]
    ConfigError(#[from] ConfigError),
}

impl From<std::io::Error> for CoreError {
    fn from(err: std::io::Error) -> Self {
        CoreError::ConnectionClosed(err)
    }
}

/// Errors raised while resolving and parsing the configuration document.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read configuration file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse configuration file {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: ini::Error,
    },

    #[error("missing required configuration key [{section}] {key}")]
    MissingKey { section: String, key: String },

    #[error("invalid value for [{section}] {key}: {value:?}")]
    InvalidValue {
        section: String,
        key: String,
        value: String,
    },
}

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, CoreError>;
