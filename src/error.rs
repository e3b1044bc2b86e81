//! Error types for the Tor control client.
//!
//! Every fallible operation in the crate returns [`TorControlError`]. Errors
//! fall into four groups: discovery (cookie and port files), transport
//! (connect, read, write), protocol framing, and application-level replies
//! from Tor.

use std::io;
use thiserror::Error;

/// The main error type for all Tor control operations.
#[derive(Error, Debug)]
pub enum TorControlError {
    /// I/O error occurred during communication.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Connection to the Tor control port failed.
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// Authentication with Tor failed.
    #[error("Authentication failed: {0}")]
    AuthenticationFailed(String),

    /// Command was answered with a non-success reply.
    #[error("Command rejected (status {status}): {message}")]
    CommandRejected {
        /// The three-digit status returned by Tor.
        status: String,
        /// The body of the final reply line.
        message: String,
    },

    /// Framing or grammar violation on the control connection.
    #[error("Protocol error: {0}")]
    ProtocolError(String),

    /// Parsing error when interpreting a value in Tor's response.
    #[error("Parse error: {0}")]
    ParseError(String),

    /// Configuration error.
    #[error("Configuration error: {0}")]
    ConfigurationError(String),

    /// The cookie or port file is missing, malformed or stale.
    #[error("Control port discovery failed: {0}")]
    Discovery(String),

    /// The data directory could not be watched.
    #[error("Failed to watch directory: {0}")]
    WatchFailed(String),

    /// Timeout waiting for the control port.
    #[error("Operation timed out")]
    Timeout,

    /// The connection was closed before the command completed.
    #[error("Connection closed")]
    ConnectionClosed,

    /// A command was issued while no authenticated connection exists.
    #[error("Not connected to the control port")]
    NotConnected,

    /// Too many commands are already waiting for a reply.
    #[error("Too many pending commands (limit {limit})")]
    QueueFull {
        /// The configured queue limit.
        limit: usize,
    },

    /// `start` was called on a session that is already running.
    #[error("Session is already running")]
    AlreadyRunning,

    /// The session's background tasks are gone.
    #[error("Session task has shut down")]
    ChannelClosed,

    /// Invalid argument provided to an operation.
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),
}

impl TorControlError {
    /// Build a [`TorControlError::CommandRejected`] from a final reply.
    pub fn rejected(status: impl Into<String>, message: impl Into<String>) -> Self {
        TorControlError::CommandRejected {
            status: status.into(),
            message: message.into(),
        }
    }
}

/// Result type alias for Tor control operations.
pub type Result<T> = std::result::Result<T, TorControlError>;

/// The reply statuses the client distinguishes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusCode {
    /// `250`
    Ok,
    /// `514`, sent when a command arrives before `AUTHENTICATE`.
    AuthenticationRequired,
    /// `515`, the cookie or SAFECOOKIE hash was wrong.
    BadAuthentication,
    /// `552`, e.g. an unknown `GETINFO` key or event name.
    UnrecognizedEntity,
    /// Anything else.
    Other,
}

impl StatusCode {
    /// Classify a three-digit wire status.
    pub fn from_status(status: &str) -> Self {
        match status {
            "250" => StatusCode::Ok,
            "514" => StatusCode::AuthenticationRequired,
            "515" => StatusCode::BadAuthentication,
            "552" => StatusCode::UnrecognizedEntity,
            _ => StatusCode::Other,
        }
    }

    /// Whether Tor refused the credentials rather than the command.
    pub fn is_auth_failure(&self) -> bool {
        matches!(
            self,
            StatusCode::AuthenticationRequired | StatusCode::BadAuthentication
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_code_parsing() {
        assert_eq!(StatusCode::from_status("250"), StatusCode::Ok);
        assert_eq!(StatusCode::from_status("515"), StatusCode::BadAuthentication);
        assert_eq!(StatusCode::from_status("552"), StatusCode::UnrecognizedEntity);
        assert_eq!(StatusCode::from_status("251"), StatusCode::Other);
        assert_eq!(StatusCode::from_status("25"), StatusCode::Other);
    }

    #[test]
    fn test_status_code_auth_failure() {
        assert!(StatusCode::AuthenticationRequired.is_auth_failure());
        assert!(StatusCode::BadAuthentication.is_auth_failure());
        assert!(!StatusCode::Ok.is_auth_failure());
        assert!(!StatusCode::UnrecognizedEntity.is_auth_failure());
    }

    #[test]
    fn test_rejected_display() {
        let err = TorControlError::rejected("552", "Unrecognized key \"foo\"");
        assert_eq!(
            err.to_string(),
            "Command rejected (status 552): Unrecognized key \"foo\""
        );
    }
}
