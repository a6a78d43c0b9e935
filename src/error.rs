//! Error types surfaced by the transport.

use thiserror::Error;

/// Result type for transport operations
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Error raised by the transport.
///
/// The three categories map to how callers are expected to react:
/// configuration problems are programmer errors raised synchronously at
/// construction, transport errors are runtime failures of the server or the
/// client and may be retried by the caller, logic errors are precondition
/// violations detected during setup.
#[derive(Error, Debug)]
pub enum Error {
    /// Invalid options or a malformed DSN. Raised at construction, never
    /// recovered.
    #[error("invalid transport configuration: {0}")]
    Config(String),

    /// Any server or client failure during add/get/ack/reject/setup/cleanup.
    /// The underlying cause, when there is one, rides along as the source.
    #[error("{message}")]
    Transport {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync + 'static>>,
    },

    /// A precondition violation detected at setup time.
    #[error("{0}")]
    Logic(String),
}

impl Error {
    /// Create a configuration error
    pub fn config(message: impl Into<String>) -> Self {
        Error::Config(message.into())
    }

    /// Create a transport error without an underlying cause
    pub fn transport(message: impl Into<String>) -> Self {
        Error::Transport {
            message: message.into(),
            source: None,
        }
    }

    /// Create a transport error wrapping its cause
    pub fn transport_with(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Error::Transport {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Create a logic error
    pub fn logic(message: impl Into<String>) -> Self {
        Error::Logic(message.into())
    }
}

impl From<redis::RedisError> for Error {
    fn from(err: redis::RedisError) -> Self {
        Error::Transport {
            message: format!("redis error: {err}"),
            source: Some(Box::new(err)),
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Transport {
            message: format!("serialization error: {err}"),
            source: Some(Box::new(err)),
        }
    }
}
