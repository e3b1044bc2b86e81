//! # tor-control-client
//!
//! An async client for the control port of a Tor daemon that the embedding
//! application launched itself.
//!
//! Tor publishes its control port and authentication cookie as files in its
//! data directory. A [`ControlSession`] watches that directory, connects as
//! soon as both files are present and fresh, authenticates with the cookie,
//! and reconnects whenever the connection drops. On top of the connection it
//! provides:
//!
//! - A pipelined command queue with replies delivered in order
//! - Reference-counted event subscriptions (`SETEVENTS`)
//! - Observer callbacks for lifecycle changes, events and raw traffic
//! - Typed queries for the version, SOCKS listeners and circuit status
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use tor_control_client::{
//!     ControlSession, EventType, SessionState, TorControlConfig, TorControlObserver, TorEvent,
//! };
//!
//! struct Bootstrap;
//!
//! impl TorControlObserver for Bootstrap {
//!     fn on_event(&self, event: &TorEvent) {
//!         if let Some(progress) = event.bootstrap_progress() {
//!             println!("bootstrapped {progress}%");
//!         }
//!     }
//! }
//!
//! #[tokio::main]
//! async fn main() -> tor_control_client::Result<()> {
//!     let session = ControlSession::new(TorControlConfig::new())?;
//!     session.add_observer(Arc::new(Bootstrap));
//!     session.start("/var/lib/tor").await?;
//!
//!     session.wait_for_state(SessionState::Connected).await?;
//!     println!("Connected to Tor {}", session.get_version().await?);
//!     session.subscribe(EventType::StatusClient).await?;
//!     Ok(())
//! }
//! ```
//!
//! ## Authentication
//!
//! Plain cookie authentication is used by default. SAFECOOKIE, which never
//! sends the cookie itself over the socket, is one builder call away:
//!
//! ```rust
//! use tor_control_client::{AuthMethod, TorControlConfig};
//!
//! let config = TorControlConfig::new().safe_cookie().take_ownership(true);
//! assert_eq!(config.auth_method, AuthMethod::SafeCookie);
//! ```
//!
//! ## Feature Flags
//!
//! - `tokio-runtime` (default): the session, its I/O task and the directory
//!   watcher. Without it only the protocol, event and credential helpers are
//!   available.

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![warn(rust_2018_idioms)]
#![warn(clippy::all)]

pub mod auth;
pub mod config;
pub mod error;
pub mod events;
pub mod observer;
pub mod protocol;

#[cfg(feature = "tokio-runtime")]
mod connection;
#[cfg(feature = "tokio-runtime")]
mod session;
#[cfg(feature = "tokio-runtime")]
mod watcher;

// Re-export main types for convenience
pub use error::{Result, StatusCode, TorControlError};

#[cfg(feature = "tokio-runtime")]
pub use session::{ControlSession, PendingReply};
#[cfg(feature = "tokio-runtime")]
pub use watcher::SessionState;

pub use auth::ControlCredentials;
pub use config::{AuthMethod, TorControlConfig};
pub use events::{EventType, TorEvent};
pub use observer::{ObserverId, TorControlObserver};
pub use protocol::{FinalReply, ReplyLine};

/// Library version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
