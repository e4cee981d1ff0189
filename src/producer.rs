use async_trait::async_trait;
use tokio::sync::watch;
use tracing::debug;

use crate::events::ControlFrame;
use crate::types::ConnectionState;

pub type StatusListener = Box<dyn FnMut(ConnectionState) + Send>;

/// Multicasts connection state transitions to registered listeners and keeps
/// the latest value observable through a watch channel.
pub struct StatusBus {
    listeners: Vec<StatusListener>,
    tx: watch::Sender<ConnectionState>,
}

impl std::fmt::Debug for StatusBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StatusBus")
            .field("listeners", &self.listeners.len())
            .field("current", &self.current())
            .finish()
    }
}

impl Default for StatusBus {
    fn default() -> Self {
        Self::new()
    }
}

impl StatusBus {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            listeners: Vec::new(),
            tx,
        }
    }

    pub fn listen<F>(&mut self, listener: F)
    where
        F: FnMut(ConnectionState) + Send + 'static,
    {
        self.listeners.push(Box::new(listener));
    }

    pub(crate) fn push(&mut self, listener: StatusListener) {
        self.listeners.push(listener);
    }

    pub fn subscribe(&self) -> watch::Receiver<ConnectionState> {
        self.tx.subscribe()
    }

    pub fn current(&self) -> ConnectionState {
        *self.tx.borrow()
    }

    /// Record a transition and notify every listener before returning.
    /// Setting the current state again is a no-op.
    pub(crate) fn set(&mut self, next: ConnectionState) {
        let prev = self.tx.send_replace(next);
        if prev == next {
            return;
        }
        debug!(from = %prev, to = %next, "connection state");
        for listener in self.listeners.iter_mut() {
            listener(next);
        }
    }
}

/// A source of scan events feeding an [`EventRouter`](crate::router::EventRouter).
///
/// The live socket and the simulated script both implement this, and the
/// consumer holds one behind `Box<dyn EventProducer>` without knowing which.
#[async_trait]
pub trait EventProducer: Send {
    /// Begin producing. Idempotent while already running.
    fn start(&mut self);

    /// Restart from scratch, resetting any retry budget.
    fn reconnect(&mut self);

    /// Stop producing and wait until every timer and socket is released.
    async fn disconnect(&mut self);

    /// Fire-and-forget outbound frame. Returns whether it was accepted.
    fn send(&self, frame: &ControlFrame) -> bool;

    fn status(&self) -> watch::Receiver<ConnectionState>;

    /// Non-blocking teardown for `Drop` paths.
    fn shutdown(&mut self);
}
