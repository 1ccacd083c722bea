//! Connection Errors
//!
//! Every dispatch resolves with either a result or exactly one of these
//! errors. Errors are `Clone` because a single teardown fans the same error
//! out to every pending operation on the connection.
//!
//! | Error           | Surfaced to caller | Destroys connection        |
//! |-----------------|--------------------|----------------------------|
//! | `Transport`     | yes                | yes                        |
//! | `Timeout`       | yes                | yes, fails all pending ops |
//! | `Protocol`      | yes                | only when `fatal`          |
//! | `ServerCommand` | yes                | no                         |
//! | `Closed`        | yes                | already closed             |

use crate::protocol::FrameError;
use bson::{doc, Document};
use std::sync::Arc;
use std::time::Duration;

/// Errors that can occur while dispatching a command on a connection.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ConnectionError {
    /// Write or read failure on the underlying stream
    #[error("I/O error: {0}")]
    Transport(Arc<std::io::Error>),

    /// No outcome arrived within the socket timeout
    #[error("socket timeout after {0:?}")]
    Timeout(Duration),

    /// The server reply did not have the expected shape
    #[error("protocol error: {message}")]
    Protocol { message: String, fatal: bool },

    /// The server executed the command and reported a failure
    #[error("command failed with code {code}: {message}")]
    ServerCommand {
        code: i32,
        message: String,
        response: Document,
    },

    /// The connection is closing or closed
    #[error("connection closed")]
    Closed,
}

impl ConnectionError {
    /// Creates a server command error.
    pub fn server_command(code: i32, message: impl Into<String>, response: Document) -> Self {
        ConnectionError::ServerCommand {
            code,
            message: message.into(),
            response,
        }
    }

    /// Creates a protocol error that leaves the stream usable.
    pub fn protocol(message: impl Into<String>) -> Self {
        ConnectionError::Protocol {
            message: message.into(),
            fatal: false,
        }
    }

    /// Returns true if this error must tear the connection down.
    pub fn is_fatal(&self) -> bool {
        match self {
            ConnectionError::Transport(_) | ConnectionError::Timeout(_) => true,
            ConnectionError::Protocol { fatal, .. } => *fatal,
            ConnectionError::ServerCommand { .. } | ConnectionError::Closed => false,
        }
    }

    /// Returns true for socket timeouts.
    pub fn is_timeout(&self) -> bool {
        matches!(self, ConnectionError::Timeout(_))
    }

    /// Returns the payload reported in a command failed event.
    ///
    /// Server failures report the server's response; everything else reports a
    /// synthesized `{ok: 0, errmsg}` document.
    pub fn to_failure_document(&self) -> Document {
        match self {
            ConnectionError::ServerCommand { response, .. } => response.clone(),
            other => doc! { "ok": 0, "errmsg": other.to_string() },
        }
    }
}

impl From<std::io::Error> for ConnectionError {
    fn from(err: std::io::Error) -> Self {
        ConnectionError::Transport(Arc::new(err))
    }
}

impl From<FrameError> for ConnectionError {
    fn from(err: FrameError) -> Self {
        ConnectionError::Protocol {
            message: err.to_string(),
            fatal: true,
        }
    }
}

/// Result type for dispatch operations.
pub type Result<T> = std::result::Result<T, ConnectionError>;
