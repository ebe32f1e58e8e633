//! Error types for command execution.

use std::io;
use std::time::Duration;

use lodestar_bson::{BsonError, Document};
use thiserror::Error;

use crate::topology::TopologySnapshot;

/// Phase reported when no pooled connection frees up in time.
pub const CHECKOUT_TIMEOUT: &str = "connection checkout";

/// Result type for driver operations.
pub type DriverResult<T> = Result<T, DriverError>;

/// Errors that can occur while selecting a server, checking out a channel or
/// exchanging a command.
#[derive(Error, Debug)]
pub enum DriverError {
    /// The operation or client was configured inconsistently.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// No server satisfied the selector before the deadline.
    #[error("server selection failed for {selector} after {}ms; topology: {}", .elapsed.as_millis(), .topology.summary())]
    Selection {
        /// Description of the selector that found nothing.
        selector: String,
        /// The last snapshot the selector saw.
        topology: Box<TopologySnapshot>,
        /// Time spent waiting.
        elapsed: Duration,
    },

    /// Establishing or using a connection failed.
    #[error("connection error: {0}")]
    Connection(String),

    /// The peer closed the connection mid-exchange.
    #[error("connection closed: {0}")]
    ConnectionClosed(String),

    /// The reply frame did not match the request or was malformed.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// The server answered with `ok: 0`.
    #[error("command failed with code {code} ({code_name}): {message}")]
    Command {
        /// Numeric server error code.
        code: i32,
        /// Symbolic error name, empty if the server sent none.
        code_name: String,
        /// Server message.
        message: String,
        /// Full reply document.
        reply: Box<Document>,
    },

    /// A value could not be encoded or decoded.
    #[error("serialization error: {0}")]
    Serialization(#[from] BsonError),

    /// A deadline expired.
    #[error("{what} timed out after {}ms", .elapsed.as_millis())]
    Timeout {
        /// The phase that timed out.
        what: &'static str,
        /// The budget that was exhausted.
        elapsed: Duration,
    },
}

impl DriverError {
    /// Create a configuration error.
    pub fn config(message: impl Into<String>) -> Self {
        Self::Configuration(message.into())
    }

    /// Create a connection error.
    pub fn connection(message: impl Into<String>) -> Self {
        Self::Connection(message.into())
    }

    /// Create a connection closed error.
    pub fn connection_closed(message: impl Into<String>) -> Self {
        Self::ConnectionClosed(message.into())
    }

    /// Create a protocol error.
    pub fn protocol(message: impl Into<String>) -> Self {
        Self::Protocol(message.into())
    }

    /// Create a timeout error.
    pub fn timeout(what: &'static str, elapsed: Duration) -> Self {
        Self::Timeout { what, elapsed }
    }

    /// Build a command error from an `ok: 0` reply.
    pub fn command(reply: Document) -> Self {
        let code = reply
            .get_number("code")
            .map(|c| c as i32)
            .unwrap_or_default();
        let code_name = reply.get_str("codeName").unwrap_or_default().to_string();
        let message = reply
            .get_str("errmsg")
            .or_else(|| reply.get_str("$err"))
            .unwrap_or("unknown server error")
            .to_string();
        Self::Command {
            code,
            code_name,
            message,
            reply: Box::new(reply),
        }
    }

    /// Check if this is a connection error.
    pub fn is_connection_error(&self) -> bool {
        matches!(self, Self::Connection(_) | Self::ConnectionClosed(_))
    }

    /// Check if this is a timeout error.
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }

    /// Check if this is a server-side command failure.
    pub fn is_command_error(&self) -> bool {
        matches!(self, Self::Command { .. })
    }

    /// Server error code, for command errors.
    pub fn code(&self) -> Option<i32> {
        match self {
            Self::Command { code, .. } => Some(*code),
            _ => None,
        }
    }

    /// Whether a channel that saw this error must be closed rather than
    /// returned to its pool.
    pub fn discards_channel(&self) -> bool {
        matches!(
            self,
            Self::Connection(_)
                | Self::ConnectionClosed(_)
                | Self::Protocol(_)
                | Self::Timeout { .. }
        )
    }

    /// Whether a caller may retry the whole operation without risking a
    /// duplicate write: the command never left the client. Socket and
    /// operation timeouts are excluded because the server may have applied
    /// the command. The core itself never retries.
    pub fn is_retryable_by_caller(&self) -> bool {
        matches!(
            self,
            Self::Selection { .. }
                | Self::Timeout {
                    what: CHECKOUT_TIMEOUT,
                    ..
                }
        )
    }
}

impl From<io::Error> for DriverError {
    fn from(err: io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::UnexpectedEof
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::BrokenPipe => Self::ConnectionClosed(err.to_string()),
            _ => Self::Connection(err.to_string()),
        }
    }
}
