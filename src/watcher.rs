//! Directory watcher: decides when the control port is worth trying.
//!
//! The watcher task owns the `notify` handle on Tor's data directory. Every
//! relevant change triggers a poll of the cookie and port files on the
//! blocking pool; a successful poll hands the credentials to the I/O task.
//! Changes that arrive while a poll or connect attempt is in flight are
//! remembered so the attempt is repeated once it fails.
//!
//! The watcher is the only publisher of [`SessionState`].

use crate::auth::{discover, ControlCredentials};
use crate::config::TorControlConfig;
use crate::connection::IoMsg;
use crate::error::{Result, TorControlError};

use notify::{EventKind, RecommendedWatcher, RecursiveMode, Watcher as _};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, trace, warn};

/// Lifecycle of a control session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Not started, or stopped.
    Stopped,
    /// Watching the directory, nothing in flight.
    Watching,
    /// A poll or connect attempt is in flight.
    Connecting,
    /// An attempt is in flight and the directory changed again since.
    ConnectingRepoll,
    /// Authenticated and ready for commands.
    Connected,
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            SessionState::Stopped => "stopped",
            SessionState::Watching => "watching",
            SessionState::Connecting => "connecting",
            SessionState::ConnectingRepoll => "connecting (repoll)",
            SessionState::Connected => "connected",
        };
        f.write_str(name)
    }
}

/// Messages handled by the watcher task.
///
/// Everything reported back from a poll or connection carries the
/// generation of the `start` it belongs to, so results from before a
/// `stop` are ignored.
pub(crate) enum WatchMsg {
    Start {
        dir: PathBuf,
        respond_to: oneshot::Sender<Result<()>>,
    },
    Stop,
    DirChanged {
        generation: u64,
    },
    PollDone {
        generation: u64,
        result: Result<ControlCredentials>,
    },
    /// The TCP connect failed.
    ConnectFailed {
        generation: u64,
    },
    /// Authentication succeeded.
    Ready {
        generation: u64,
    },
    /// An established connection failed.
    Closed {
        generation: u64,
    },
    /// Tor refused the cookie.
    AuthFailed {
        generation: u64,
    },
    Shutdown,
}

pub(crate) struct DirWatcher {
    config: Arc<TorControlConfig>,
    rx: mpsc::UnboundedReceiver<WatchMsg>,
    /// Handed to `notify` callbacks and poll tasks.
    self_tx: mpsc::UnboundedSender<WatchMsg>,
    io_tx: mpsc::UnboundedSender<IoMsg>,
    state_tx: watch::Sender<SessionState>,

    generation: u64,
    running: bool,
    dir: Option<PathBuf>,
    fs_watcher: Option<RecommendedWatcher>,
    polling: bool,
    repoll: bool,
    connected: bool,
}

impl DirWatcher {
    pub(crate) fn new(
        config: Arc<TorControlConfig>,
        rx: mpsc::UnboundedReceiver<WatchMsg>,
        self_tx: mpsc::UnboundedSender<WatchMsg>,
        io_tx: mpsc::UnboundedSender<IoMsg>,
        state_tx: watch::Sender<SessionState>,
    ) -> Self {
        Self {
            config,
            rx,
            self_tx,
            io_tx,
            state_tx,
            generation: 0,
            running: false,
            dir: None,
            fs_watcher: None,
            polling: false,
            repoll: false,
            connected: false,
        }
    }

    pub(crate) async fn run(mut self) {
        debug!("watcher task starting");

        while let Some(msg) = self.rx.recv().await {
            if let WatchMsg::Shutdown = msg {
                break;
            }
            self.handle_message(msg);
            self.publish();
        }

        self.stop();
        self.publish();
        debug!("watcher task stopped");
    }

    fn handle_message(&mut self, msg: WatchMsg) {
        match msg {
            WatchMsg::Start { dir, respond_to } => {
                let result = self.start(dir);
                self.publish();
                let _ = respond_to.send(result);
            }
            WatchMsg::Stop => self.stop(),
            WatchMsg::DirChanged { generation } if self.is_current(generation) => {
                trace!("watch directory changed");
                if self.polling {
                    self.repoll = true;
                } else {
                    self.polling = true;
                    self.poll();
                }
            }
            WatchMsg::PollDone { generation, result } if self.is_current(generation) => {
                match result {
                    Ok(credentials) => {
                        let _ = self.io_tx.send(IoMsg::Open {
                            generation,
                            credentials,
                        });
                    }
                    Err(e) => {
                        debug!(error = %e, "control port not ready");
                        self.polled();
                    }
                }
            }
            WatchMsg::ConnectFailed { generation } if self.is_current(generation) => {
                self.polled()
            }
            WatchMsg::Ready { generation } if self.is_current(generation) => {
                self.connected = true;
            }
            WatchMsg::Closed { generation } if self.is_current(generation) => {
                self.connected = false;
                self.repoll = false;
                self.polling = true;
                self.poll();
            }
            WatchMsg::AuthFailed { generation } if self.is_current(generation) => {
                warn!("control port authentication failed, waiting for directory changes");
                self.connected = false;
                self.polling = false;
                self.repoll = false;
            }
            WatchMsg::Shutdown => {}
            _ => trace!("ignoring message from a previous start"),
        }
    }

    fn is_current(&self, generation: u64) -> bool {
        self.running && generation == self.generation
    }

    fn start(&mut self, dir: PathBuf) -> Result<()> {
        if self.running {
            return Err(TorControlError::AlreadyRunning);
        }

        self.generation += 1;
        let generation = self.generation;
        let tx = self.self_tx.clone();
        let mut fs_watcher =
            notify::recommended_watcher(move |event: notify::Result<notify::Event>| match event {
                Ok(event) if !event.need_rescan() && ignore_event_kind(&event.kind) => {}
                Ok(_) => {
                    let _ = tx.send(WatchMsg::DirChanged { generation });
                }
                Err(e) => warn!(error = %e, "directory watch error"),
            })
            .map_err(|e| TorControlError::WatchFailed(e.to_string()))?;
        fs_watcher
            .watch(&dir, RecursiveMode::NonRecursive)
            .map_err(|e| TorControlError::WatchFailed(format!("{}: {}", dir.display(), e)))?;

        debug!(dir = %dir.display(), "watching for control port");
        self.fs_watcher = Some(fs_watcher);
        self.dir = Some(dir);
        self.running = true;
        self.connected = false;
        self.repoll = false;
        self.polling = true;
        self.poll();
        Ok(())
    }

    fn stop(&mut self) {
        if self.running {
            debug!("stopping control port watch");
        }
        self.running = false;
        self.fs_watcher = None;
        self.dir = None;
        self.polling = false;
        self.repoll = false;
        self.connected = false;
        let _ = self.io_tx.send(IoMsg::Stop);
    }

    /// Read the cookie and port files off the async threads.
    fn poll(&self) {
        let Some(dir) = self.dir.clone() else {
            return;
        };
        let cookie_file = self.config.cookie_file_name.clone();
        let port_file = self.config.port_file_name.clone();
        let generation = self.generation;
        let tx = self.self_tx.clone();

        trace!(generation, "polling for control port");
        tokio::task::spawn_blocking(move || {
            let result = discover(&dir, &cookie_file, &port_file);
            let _ = tx.send(WatchMsg::PollDone { generation, result });
        });
    }

    /// An attempt failed before a connection was established.
    fn polled(&mut self) {
        if self.repoll {
            self.repoll = false;
            self.poll();
        } else {
            self.polling = false;
        }
    }

    fn state(&self) -> SessionState {
        if !self.running {
            SessionState::Stopped
        } else if self.connected {
            SessionState::Connected
        } else if self.polling && self.repoll {
            SessionState::ConnectingRepoll
        } else if self.polling {
            SessionState::Connecting
        } else {
            SessionState::Watching
        }
    }

    fn publish(&self) {
        let state = self.state();
        let previous = self.state_tx.send_replace(state);
        if previous != state {
            debug!(from = %previous, to = %state, "session state changed");
        }
    }
}

/// Reads and catch-all events never mean Tor rewrote its files.
fn ignore_event_kind(kind: &EventKind) -> bool {
    matches!(kind, EventKind::Access(_) | EventKind::Any | EventKind::Other)
}

#[cfg(test)]
mod tests {
    use super::*;
    use notify::event::{AccessKind, CreateKind, ModifyKind};

    #[test]
    fn test_ignore_event_kind() {
        assert!(ignore_event_kind(&EventKind::Access(AccessKind::Any)));
        assert!(ignore_event_kind(&EventKind::Other));
        assert!(!ignore_event_kind(&EventKind::Create(CreateKind::File)));
        assert!(!ignore_event_kind(&EventKind::Modify(ModifyKind::Any)));
    }

    #[test]
    fn test_session_state_display() {
        assert_eq!(SessionState::ConnectingRepoll.to_string(), "connecting (repoll)");
        assert_eq!(SessionState::Stopped.to_string(), "stopped");
    }

    fn watcher() -> (
        DirWatcher,
        mpsc::UnboundedReceiver<IoMsg>,
        watch::Receiver<SessionState>,
    ) {
        let (tx, rx) = mpsc::unbounded_channel();
        let (io_tx, io_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(SessionState::Stopped);
        let watcher = DirWatcher::new(
            Arc::new(TorControlConfig::default()),
            rx,
            tx,
            io_tx,
            state_tx,
        );
        (watcher, io_rx, state_rx)
    }

    #[tokio::test]
    async fn test_repoll_after_failed_poll() {
        let dir = tempfile::tempdir().unwrap();
        let (mut watcher, _io_rx, state) = watcher();

        watcher.start(dir.path().to_path_buf()).unwrap();
        watcher.publish();
        assert_eq!(*state.borrow(), SessionState::Connecting);

        let generation = watcher.generation;
        watcher.handle_message(WatchMsg::DirChanged { generation });
        watcher.publish();
        assert_eq!(*state.borrow(), SessionState::ConnectingRepoll);

        // The first poll fails; the remembered change causes another.
        watcher.handle_message(WatchMsg::PollDone {
            generation,
            result: Err(TorControlError::Discovery("missing".to_string())),
        });
        watcher.publish();
        assert_eq!(*state.borrow(), SessionState::Connecting);

        watcher.handle_message(WatchMsg::ConnectFailed { generation });
        watcher.publish();
        assert_eq!(*state.borrow(), SessionState::Watching);
    }

    #[tokio::test]
    async fn test_ready_closed_and_auth_failure() {
        let dir = tempfile::tempdir().unwrap();
        let (mut watcher, mut io_rx, state) = watcher();

        watcher.start(dir.path().to_path_buf()).unwrap();
        let generation = watcher.generation;
        watcher.handle_message(WatchMsg::PollDone {
            generation,
            result: Ok(ControlCredentials {
                port: 9151,
                cookie: vec![1; 32],
            }),
        });
        assert!(matches!(
            io_rx.try_recv(),
            Ok(IoMsg::Open { generation: g, .. }) if g == generation
        ));

        watcher.handle_message(WatchMsg::Ready { generation });
        watcher.publish();
        assert_eq!(*state.borrow(), SessionState::Connected);

        // Directory churn while connected does not disturb the connection.
        watcher.handle_message(WatchMsg::DirChanged { generation });
        watcher.publish();
        assert_eq!(*state.borrow(), SessionState::Connected);

        watcher.handle_message(WatchMsg::Closed { generation });
        watcher.publish();
        assert_eq!(*state.borrow(), SessionState::Connecting);

        watcher.handle_message(WatchMsg::AuthFailed { generation });
        watcher.publish();
        assert_eq!(*state.borrow(), SessionState::Watching);
    }

    #[tokio::test]
    async fn test_stale_generation_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let (mut watcher, mut io_rx, state) = watcher();

        watcher.start(dir.path().to_path_buf()).unwrap();
        let old = watcher.generation;
        watcher.stop();
        assert!(matches!(io_rx.try_recv(), Ok(IoMsg::Stop)));

        watcher.start(dir.path().to_path_buf()).unwrap();
        watcher.handle_message(WatchMsg::Ready { generation: old });
        watcher.publish();
        assert_eq!(*state.borrow(), SessionState::Connecting);
    }

    #[tokio::test]
    async fn test_start_twice_and_missing_dir() {
        let dir = tempfile::tempdir().unwrap();
        let (mut watcher, _io_rx, _state) = watcher();

        assert!(matches!(
            watcher.start(dir.path().join("does-not-exist")),
            Err(TorControlError::WatchFailed(_))
        ));
        assert_eq!(watcher.state(), SessionState::Stopped);

        watcher.start(dir.path().to_path_buf()).unwrap();
        assert!(matches!(
            watcher.start(dir.path().to_path_buf()),
            Err(TorControlError::AlreadyRunning)
        ));
    }
}
