use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};

use tracing::{debug, error, warn};

use crate::events::{Envelope, EventType};

/// Handler invoked for each envelope of the type it was registered for.
/// Returning `Err` is logged and does not stop delivery to other handlers.
pub type Handler = Box<dyn FnMut(&Envelope) -> anyhow::Result<()> + Send>;

/// Token returned by [`EventRouter::on`]; pass it to [`EventRouter::off`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandlerId(u64);

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RouterStats {
    pub emitted: u64,
    pub dropped: u64,
    pub handler_failures: u64,
}

/// Parses raw frames into envelopes and fans them out per event type.
#[derive(Default)]
pub struct EventRouter {
    handlers: HashMap<EventType, Vec<(HandlerId, Handler)>>,
    next_id: u64,
    stats: RouterStats,
}

impl std::fmt::Debug for EventRouter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventRouter")
            .field("handlers", &self.handler_count())
            .field("stats", &self.stats)
            .finish()
    }
}

impl EventRouter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Deserialize and validate one frame. Rejected frames are logged and
    /// counted, never returned as errors.
    pub fn parse(&mut self, raw: &str) -> Option<Envelope> {
        match Envelope::from_frame(raw) {
            Ok(env) => Some(env),
            Err(reason) => {
                self.stats.dropped += 1;
                debug!(%reason, "dropping inbound frame");
                None
            }
        }
    }

    pub fn on<F>(&mut self, event_type: EventType, handler: F) -> HandlerId
    where
        F: FnMut(&Envelope) -> anyhow::Result<()> + Send + 'static,
    {
        let id = HandlerId(self.next_id);
        self.next_id += 1;
        self.handlers
            .entry(event_type)
            .or_default()
            .push((id, Box::new(handler)));
        id
    }

    /// Remove a handler. Returns false if it was already gone.
    pub fn off(&mut self, id: HandlerId) -> bool {
        for list in self.handlers.values_mut() {
            if let Some(pos) = list.iter().position(|(h, _)| *h == id) {
                list.remove(pos);
                return true;
            }
        }
        false
    }

    /// Deliver to every handler for the envelope's type, in registration order.
    /// Returns how many handlers completed without error.
    pub fn emit(&mut self, envelope: &Envelope) -> usize {
        self.stats.emitted += 1;
        let event_type = envelope.event_type();
        let Some(list) = self.handlers.get_mut(&event_type) else {
            return 0;
        };

        let mut delivered = 0;
        for (id, handler) in list.iter_mut() {
            match panic::catch_unwind(AssertUnwindSafe(|| handler(envelope))) {
                Ok(Ok(())) => delivered += 1,
                Ok(Err(e)) => {
                    self.stats.handler_failures += 1;
                    warn!(?id, %event_type, error = %e, "event handler failed");
                }
                Err(_) => {
                    self.stats.handler_failures += 1;
                    error!(?id, %event_type, "event handler panicked");
                }
            }
        }
        delivered
    }

    /// `parse` then `emit`.
    pub fn dispatch(&mut self, raw: &str) -> Option<usize> {
        let envelope = self.parse(raw)?;
        Some(self.emit(&envelope))
    }

    pub fn handler_count(&self) -> usize {
        self.handlers.values().map(Vec::len).sum()
    }

    pub fn stats(&self) -> RouterStats {
        self.stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    fn frame(kind: &str, id: &str) -> String {
        serde_json::json!({
            "type": kind,
            "payload": {"message": id, "workerId": id},
            "timestamp": "2024-01-01T00:00:00Z",
            "eventId": id,
        })
        .to_string()
    }

    fn recorder(router: &mut EventRouter, ty: EventType) -> Arc<Mutex<Vec<String>>> {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        router.on(ty, move |env| {
            sink.lock().unwrap().push(env.event_id.clone());
            Ok(())
        });
        seen
    }

    #[test]
    fn handlers_see_only_their_type_in_order() {
        let mut router = EventRouter::new();
        let logs = recorder(&mut router, EventType::ScanLog);
        let workers = recorder(&mut router, EventType::WorkerStarted);

        let input = [
            ("SCAN_LOG", "1"),
            ("WORKER_STARTED", "2"),
            ("SCAN_LOG", "3"),
            ("PONG", "4"),
            ("SCAN_LOG", "5"),
            ("WORKER_STARTED", "6"),
        ];
        for (kind, id) in input {
            router.dispatch(&frame(kind, id));
        }

        assert_eq!(*logs.lock().unwrap(), vec!["1", "3", "5"]);
        assert_eq!(*workers.lock().unwrap(), vec!["2", "6"]);
        assert_eq!(router.stats().emitted, 6);
    }

    #[test]
    fn malformed_frames_never_reach_handlers() {
        let mut router = EventRouter::new();
        let all: Vec<_> = EventType::ALL
            .into_iter()
            .map(|t| recorder(&mut router, t))
            .collect();

        let bad = [
            "{".to_string(),
            r#"{"payload":{},"timestamp":"t"}"#.to_string(),
            r#"{"type":"SCAN_LOG","payload":{"message":"x"}}"#.to_string(),
            r#"{"type":42,"timestamp":"t"}"#.to_string(),
            r#"{"type":"NOT_A_TYPE","timestamp":"t"}"#.to_string(),
        ];
        for raw in &bad {
            assert_eq!(router.dispatch(raw), None);
        }

        assert!(all.iter().all(|seen| seen.lock().unwrap().is_empty()));
        assert_eq!(router.stats().emitted, 0);
        assert_eq!(router.stats().dropped, bad.len() as u64);
    }

    #[test]
    fn failing_handler_does_not_block_the_rest() {
        let mut router = EventRouter::new();
        router.on(EventType::ScanLog, |_| anyhow::bail!("nope"));
        router.on(EventType::ScanLog, |_| panic!("handler blew up"));
        let seen = recorder(&mut router, EventType::ScanLog);

        let delivered = router.dispatch(&frame("SCAN_LOG", "a"));
        assert_eq!(delivered, Some(1));
        assert_eq!(*seen.lock().unwrap(), vec!["a"]);
        assert_eq!(router.stats().handler_failures, 2);

        // Still works after a panic.
        router.dispatch(&frame("SCAN_LOG", "b"));
        assert_eq!(*seen.lock().unwrap(), vec!["a", "b"]);
    }

    #[test]
    fn off_removes_only_that_handler() {
        let mut router = EventRouter::new();
        let first = Arc::new(Mutex::new(0));
        let counter = first.clone();
        let id = router.on(EventType::Pong, move |_| {
            *counter.lock().unwrap() += 1;
            Ok(())
        });
        let second = recorder(&mut router, EventType::Pong);

        router.dispatch(&frame("PONG", "x"));
        assert!(router.off(id));
        assert!(!router.off(id));
        router.dispatch(&frame("PONG", "y"));

        assert_eq!(*first.lock().unwrap(), 1);
        assert_eq!(*second.lock().unwrap(), vec!["x", "y"]);
        assert_eq!(router.handler_count(), 1);
    }
}
