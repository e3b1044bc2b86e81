//! Observers of session lifecycle, events and raw control traffic.

use crate::events::TorEvent;
use std::sync::Arc;

/// Receives notifications from a [`ControlSession`](crate::ControlSession).
///
/// Callbacks run on the session's I/O task and must not block. Every method
/// has an empty default so implementors only override what they need.
pub trait TorControlObserver: Send + Sync {
    /// The connection is authenticated and accepting commands.
    fn on_ready(&self) {}

    /// The connection was torn down or a connect attempt failed.
    ///
    /// `was_running` is false when the teardown came from `stop`.
    fn on_closed(&self, _was_running: bool) {}

    /// A subscribed event arrived.
    fn on_event(&self, _event: &TorEvent) {}

    /// A command line is about to be sent.
    fn on_raw_cmd(&self, _cmd: &str) {}

    /// An asynchronous reply line was received.
    fn on_raw_async(&self, _status: &str, _body: &str) {}

    /// An intermediate synchronous reply line was received.
    fn on_raw_mid(&self, _status: &str, _body: &str) {}

    /// A final synchronous reply line was received.
    fn on_raw_end(&self, _status: &str, _body: &str) {}
}

/// Handle returned by `add_observer`, used to remove it again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObserverId(pub(crate) u64);

/// Observers in registration order.
#[derive(Default)]
pub struct ObserverList {
    entries: Vec<(ObserverId, Arc<dyn TorControlObserver>)>,
}

impl ObserverList {
    /// Create an empty list.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an observer.
    pub fn add(&mut self, id: ObserverId, observer: Arc<dyn TorControlObserver>) {
        self.entries.push((id, observer));
    }

    /// Unregister an observer. Returns false if it was not registered.
    pub fn remove(&mut self, id: ObserverId) -> bool {
        let before = self.entries.len();
        self.entries.retain(|(entry, _)| *entry != id);
        self.entries.len() != before
    }

    /// Call `f` on every observer in registration order.
    pub fn notify(&self, mut f: impl FnMut(&dyn TorControlObserver)) {
        for (_, observer) in &self.entries {
            f(observer.as_ref());
        }
    }

    /// Number of registered observers.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether no observers are registered.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl std::fmt::Debug for ObserverList {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ObserverList")
            .field("len", &self.entries.len())
            .finish()
    }
}
