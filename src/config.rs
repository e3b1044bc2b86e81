//! Configuration for the control session.
//!
//! Tor announces its control port by writing two files into its data
//! directory. The configuration names those files, bounds the command
//! pipeline and selects the authentication handshake.

use crate::error::{Result, TorControlError};
use std::path::PathBuf;
use std::time::Duration;

/// Default name of the authentication cookie file.
pub const DEFAULT_COOKIE_FILE: &str = "control_auth_cookie";

/// Default name of the control port file.
pub const DEFAULT_PORT_FILE: &str = "controlport";

/// How the session proves knowledge of the cookie.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum AuthMethod {
    /// `AUTHENTICATE <hex cookie>`.
    #[default]
    Cookie,
    /// `AUTHCHALLENGE SAFECOOKIE` followed by an HMAC response.
    SafeCookie,
}

/// Configuration for a [`ControlSession`](crate::ControlSession).
#[derive(Debug, Clone)]
pub struct TorControlConfig {
    /// Directory to watch when `start` is called without a path override.
    pub watch_dir: Option<PathBuf>,
    /// File name of the authentication cookie inside the watch directory.
    pub cookie_file_name: String,
    /// File name of the control port file inside the watch directory.
    pub port_file_name: String,
    /// Capacity of the line reassembly buffer. Longer lines are fatal.
    pub read_buffer_size: usize,
    /// Maximum number of commands waiting for a reply.
    pub max_pending_commands: usize,
    /// Connection timeout.
    pub connect_timeout: Duration,
    /// Authentication handshake.
    pub auth_method: AuthMethod,
    /// Issue `TAKEOWNERSHIP` after authenticating.
    pub take_ownership: bool,
}

impl Default for TorControlConfig {
    fn default() -> Self {
        Self {
            watch_dir: None,
            cookie_file_name: DEFAULT_COOKIE_FILE.to_string(),
            port_file_name: DEFAULT_PORT_FILE.to_string(),
            read_buffer_size: 4096,
            max_pending_commands: 100,
            connect_timeout: Duration::from_secs(30),
            auth_method: AuthMethod::Cookie,
            take_ownership: false,
        }
    }
}

impl TorControlConfig {
    /// Create a new configuration with default settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the directory to watch.
    pub fn watch_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.watch_dir = Some(dir.into());
        self
    }

    /// Set the cookie file name.
    pub fn cookie_file_name(mut self, name: impl Into<String>) -> Self {
        self.cookie_file_name = name.into();
        self
    }

    /// Set the control port file name.
    pub fn port_file_name(mut self, name: impl Into<String>) -> Self {
        self.port_file_name = name.into();
        self
    }

    /// Set the read buffer capacity.
    pub fn read_buffer_size(mut self, size: usize) -> Self {
        self.read_buffer_size = size;
        self
    }

    /// Set the pending command limit.
    pub fn max_pending_commands(mut self, limit: usize) -> Self {
        self.max_pending_commands = limit;
        self
    }

    /// Set the connection timeout.
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Select the authentication handshake.
    pub fn auth_method(mut self, method: AuthMethod) -> Self {
        self.auth_method = method;
        self
    }

    /// Use SAFECOOKIE authentication.
    pub fn safe_cookie(self) -> Self {
        self.auth_method(AuthMethod::SafeCookie)
    }

    /// Take ownership of the Tor process once authenticated.
    pub fn take_ownership(mut self, enabled: bool) -> Self {
        self.take_ownership = enabled;
        self
    }

    /// Check the configuration for values the session cannot work with.
    pub fn validate(&self) -> Result<()> {
        if self.cookie_file_name.is_empty() || self.port_file_name.is_empty() {
            return Err(TorControlError::ConfigurationError(
                "cookie and port file names must not be empty".to_string(),
            ));
        }
        // A status line needs at least four bytes plus CRLF.
        if self.read_buffer_size < 6 {
            return Err(TorControlError::ConfigurationError(format!(
                "read buffer of {} bytes cannot hold a reply line",
                self.read_buffer_size
            )));
        }
        if self.max_pending_commands == 0 {
            return Err(TorControlError::ConfigurationError(
                "max_pending_commands must be at least 1".to_string(),
            ));
        }
        if self.connect_timeout.is_zero() {
            return Err(TorControlError::ConfigurationError(
                "connect_timeout must be non-zero".to_string(),
            ));
        }
        Ok(())
    }
}
