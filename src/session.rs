//! The public handle of a control session.
//!
//! [`ControlSession`] spawns two tasks: a watcher that waits for Tor to
//! publish its control port, and an I/O task that owns the connection. The
//! handle only posts messages to them, so every method returns immediately;
//! results arrive through [`PendingReply`] futures.

use crate::config::TorControlConfig;
use crate::connection::{Completion, ControlConnection, IoMsg};
use crate::error::{Result, TorControlError};
use crate::events::EventType;
use crate::observer::{ObserverId, TorControlObserver};
use crate::protocol::{format_command, quote_bytes, FinalReply};
use crate::watcher::{DirWatcher, SessionState, WatchMsg};

use std::future::Future;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::sync::{mpsc, oneshot, watch};

/// The eventual result of a queued request.
///
/// Resolves to [`TorControlError::ChannelClosed`] if the session was
/// dropped before answering.
#[must_use = "the reply is lost unless the future is awaited"]
#[derive(Debug)]
pub struct PendingReply<T> {
    rx: oneshot::Receiver<Result<T>>,
}

impl<T> PendingReply<T> {
    fn channel() -> (oneshot::Sender<Result<T>>, Self) {
        let (tx, rx) = oneshot::channel();
        (tx, Self { rx })
    }
}

impl<T> Future for PendingReply<T> {
    type Output = Result<T>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx)
            .poll(cx)
            .map(|received| received.unwrap_or(Err(TorControlError::ChannelClosed)))
    }
}

/// A watching, reconnecting client for Tor's control port.
///
/// # Example
///
/// ```rust,no_run
/// use tor_control_client::{ControlSession, EventType, SessionState, TorControlConfig};
///
/// # async fn example() -> tor_control_client::Result<()> {
/// let session = ControlSession::new(TorControlConfig::new())?;
/// session.start("/var/lib/tor").await?;
/// session.wait_for_state(SessionState::Connected).await?;
///
/// println!("Tor {}", session.get_version().await?);
/// session.subscribe(EventType::StatusClient).await?;
/// # Ok(())
/// # }
/// ```
pub struct ControlSession {
    config: Arc<TorControlConfig>,
    io_tx: mpsc::UnboundedSender<IoMsg>,
    watch_tx: mpsc::UnboundedSender<WatchMsg>,
    state_rx: watch::Receiver<SessionState>,
    next_observer: AtomicU64,
}

impl ControlSession {
    /// Validate `config` and spawn the session tasks.
    ///
    /// Must be called from within a tokio runtime.
    pub fn new(config: TorControlConfig) -> Result<Self> {
        config.validate()?;
        let config = Arc::new(config);

        let (io_tx, io_rx) = mpsc::unbounded_channel();
        let (watch_tx, watch_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(SessionState::Stopped);

        let connection =
            ControlConnection::new(Arc::clone(&config), io_rx, io_tx.clone(), watch_tx.clone());
        let watcher = DirWatcher::new(
            Arc::clone(&config),
            watch_rx,
            watch_tx.clone(),
            io_tx.clone(),
            state_tx,
        );
        tokio::spawn(connection.run());
        tokio::spawn(watcher.run());

        Ok(Self {
            config,
            io_tx,
            watch_tx,
            state_rx,
            next_observer: AtomicU64::new(1),
        })
    }

    /// Start watching `dir` for the control port and connect when it appears.
    ///
    /// Fails with [`TorControlError::WatchFailed`] if the directory cannot be
    /// watched and [`TorControlError::AlreadyRunning`] if already started.
    pub async fn start(&self, dir: impl Into<PathBuf>) -> Result<()> {
        let (respond_to, reply) = PendingReply::channel();
        let _ = self.watch_tx.send(WatchMsg::Start {
            dir: dir.into(),
            respond_to,
        });
        reply.await
    }

    /// Start watching the directory named in the configuration.
    pub async fn start_configured(&self) -> Result<()> {
        let dir = self.config.watch_dir.clone().ok_or_else(|| {
            TorControlError::ConfigurationError("no watch_dir configured".to_string())
        })?;
        self.start(dir).await
    }

    /// Stop watching, close the connection and fail pending commands.
    ///
    /// Subscriptions are forgotten; the session can be started again.
    pub fn stop(&self) {
        let _ = self.watch_tx.send(WatchMsg::Stop);
    }

    /// Send a command, calling `per_line` for each intermediate reply line.
    ///
    /// The reply resolves with the final line, whatever its status.
    pub fn cmd<F>(&self, text: impl Into<String>, per_line: F) -> PendingReply<FinalReply>
    where
        F: FnMut(&str, &str) + Send + 'static,
    {
        let (respond_to, reply) = PendingReply::channel();
        self.send_command(
            text.into(),
            Completion::Caller {
                per_line: Some(Box::new(per_line)),
                respond_to,
            },
        );
        reply
    }

    /// Send a command, ignoring intermediate reply lines.
    pub fn cmd1(&self, text: impl Into<String>) -> PendingReply<FinalReply> {
        let (respond_to, reply) = PendingReply::channel();
        self.send_command(
            text.into(),
            Completion::Caller {
                per_line: None,
                respond_to,
            },
        );
        reply
    }

    /// Subscribe to an event. Nested subscriptions are counted.
    pub fn subscribe(&self, event: EventType) -> PendingReply<()> {
        let (respond_to, reply) = PendingReply::channel();
        let _ = self.io_tx.send(IoMsg::Subscribe { event, respond_to });
        reply
    }

    /// Undo one [`subscribe`](Self::subscribe).
    pub fn unsubscribe(&self, event: EventType) -> PendingReply<()> {
        let (respond_to, reply) = PendingReply::channel();
        let _ = self.io_tx.send(IoMsg::Unsubscribe { event, respond_to });
        reply
    }

    /// Ask Tor for its version.
    pub fn get_version(&self) -> PendingReply<String> {
        let (respond_to, reply) = PendingReply::channel();
        self.send_command(
            "GETINFO version".to_string(),
            Completion::Version {
                version: None,
                respond_to,
            },
        );
        reply
    }

    /// Addresses of Tor's SOCKS listeners.
    pub fn get_socks_listeners(&self) -> PendingReply<Vec<String>> {
        let (respond_to, reply) = PendingReply::channel();
        self.send_command(
            "GETINFO net/listeners/socks".to_string(),
            Completion::SocksListeners {
                listeners: Vec::new(),
                respond_to,
            },
        );
        reply
    }

    /// Whether Tor currently believes it can build circuits.
    pub fn get_circuit_established(&self) -> PendingReply<bool> {
        let (respond_to, reply) = PendingReply::channel();
        self.send_command(
            "GETINFO status/circuit-established".to_string(),
            Completion::CircuitEstablished {
                value: None,
                respond_to,
            },
        );
        reply
    }

    /// Configure bridge lines, or turn bridges off when `bridges` is empty.
    pub fn setup_bridges<S: AsRef<str>>(&self, bridges: &[S]) -> PendingReply<()> {
        let (respond_to, reply) = PendingReply::channel();
        self.send_command(bridges_command(bridges), Completion::Confirm { respond_to });
        reply
    }

    /// Register the snowflake and obfs4 transport binaries with Tor.
    ///
    /// Resolves with `InvalidArgument`, without touching the connection,
    /// when either path is empty.
    pub fn setup_pluggable_transport(&self, snowflake: &Path, obfs4: &Path) -> PendingReply<()> {
        let (respond_to, reply) = PendingReply::channel();
        match pluggable_transport_command(snowflake, obfs4) {
            Some(text) => self.send_command(text, Completion::Confirm { respond_to }),
            None => {
                let _ = respond_to.send(Err(TorControlError::InvalidArgument(
                    "pluggable transport path is empty".to_string(),
                )));
            }
        }
        reply
    }

    /// Register an observer. Observers are called in registration order.
    pub fn add_observer(&self, observer: Arc<dyn TorControlObserver>) -> ObserverId {
        let id = ObserverId(self.next_observer.fetch_add(1, Ordering::Relaxed));
        let _ = self.io_tx.send(IoMsg::AddObserver { id, observer });
        id
    }

    /// Unregister an observer.
    pub fn remove_observer(&self, id: ObserverId) {
        let _ = self.io_tx.send(IoMsg::RemoveObserver { id });
    }

    /// The current session state.
    pub fn state(&self) -> SessionState {
        *self.state_rx.borrow()
    }

    /// A receiver that is notified on every state change.
    pub fn state_changes(&self) -> watch::Receiver<SessionState> {
        self.state_rx.clone()
    }

    /// Wait until the session reaches `target`.
    pub async fn wait_for_state(&self, target: SessionState) -> Result<()> {
        let mut rx = self.state_rx.clone();
        rx.wait_for(|state| *state == target)
            .await
            .map(|_| ())
            .map_err(|_| TorControlError::ChannelClosed)
    }

    /// The configuration this session was created with.
    pub fn config(&self) -> &TorControlConfig {
        &self.config
    }

    fn send_command(&self, text: String, completion: Completion) {
        // A closed channel drops the completion, which resolves the reply
        // with `ChannelClosed`.
        let _ = self.io_tx.send(IoMsg::Command { text, completion });
    }
}

impl Drop for ControlSession {
    fn drop(&mut self) {
        let _ = self.watch_tx.send(WatchMsg::Shutdown);
        let _ = self.io_tx.send(IoMsg::Shutdown);
    }
}

impl std::fmt::Debug for ControlSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ControlSession")
            .field("state", &self.state())
            .finish()
    }
}

/// `SETCONF` for a bridge list, or `RESETCONF` to disable bridges.
fn bridges_command<S: AsRef<str>>(bridges: &[S]) -> String {
    if bridges.is_empty() {
        return format_command("RESETCONF", &["UseBridges", "Bridge", "ClientTransportPlugin"]);
    }
    let mut args: Vec<String> = bridges
        .iter()
        .map(|bridge| format!("Bridge={}", quote_bytes(bridge.as_ref().as_bytes())))
        .collect();
    args.push("UseBridges=1".to_string());
    format_command("SETCONF", &args)
}

const SNOWFLAKE_ARGS: &str = "-url https://snowflake-broker.torproject.net.global.prod.fastly.net/ \
     -front cdn.sstatic.net \
     -ice stun:stun.l.google.com:19302,stun:stun.voip.blackberry.com:3478,\
     stun:stun.altar.com.pl:3478,stun:stun.antisip.com:3478,stun:stun.bluesip.net:3478,\
     stun:stun.dus.net:3478,stun:stun.epygi.com:3478,stun:stun.sonetel.com:3478,\
     stun:stun.sonetel.net:3478,stun:stun.stunprotocol.org:3478,stun:stun.uls.co.za:3478,\
     stun:stun.voipgate.com:3478,stun:stun.voys.nl:3478";

const OBFS4_TRANSPORTS: &str = "meek_lite,obfs2,obfs3,obfs4,scramblesuit";

/// `SETCONF` with one `ClientTransportPlugin` per binary, or `None` when a
/// path is empty.
fn pluggable_transport_command(snowflake: &Path, obfs4: &Path) -> Option<String> {
    let snowflake = transport_path(snowflake)?;
    let obfs4 = transport_path(obfs4)?;
    let plugins = [
        format!("snowflake exec {snowflake} {SNOWFLAKE_ARGS}"),
        format!("{OBFS4_TRANSPORTS} exec {obfs4}"),
    ];
    let args: Vec<String> = plugins
        .iter()
        .map(|plugin| format!("ClientTransportPlugin={}", quote_bytes(plugin.as_bytes())))
        .collect();
    Some(format_command("SETCONF", &args))
}

/// Tor wants forward slashes on every platform.
fn transport_path(path: &Path) -> Option<String> {
    let path = path.to_string_lossy();
    if path.is_empty() {
        None
    } else {
        Some(path.replace('\\', "/"))
    }
}
