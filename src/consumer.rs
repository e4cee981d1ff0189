//! Stream consumer: one subscription's read model.
//!
//! The consumer wires an [`EventRouter`] and a [`StatusBus`] into a single
//! aggregation point, hands both to whichever [`EventProducer`] the config
//! selects, and exposes the resulting [`ReadModel`] to rendering layers.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use ::time::OffsetDateTime;
use serde::Serialize;
use tokio::sync::watch;
use tracing::debug;

use crate::config::{StreamConfig, StreamMode};
use crate::connection::ConnectionManager;
use crate::error::Result;
use crate::events::{ControlFrame, Envelope, EventType, ScanEvent};
use crate::history::LogHistory;
use crate::producer::{EventProducer, StatusBus};
use crate::router::EventRouter;
use crate::simulated::{default_script, SimulatedSource};
use crate::transport::{Connector, WsConnector};
use crate::types::{
    ConnectionState, Finding, LogRecord, ProgressSnapshot, ReportReady, ScanOutcome,
    StreamErrorEvent, WorkerState, WorkerStatus, WorkerUpdate,
};

/// Aggregated, consumer-facing state derived from the event stream.
#[derive(Serialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ReadModel {
    pub logs: LogHistory,
    pub progress: Option<ProgressSnapshot>,
    pub workers: BTreeMap<String, WorkerStatus>,
    pub latest_finding: Option<Finding>,
    pub status: ConnectionState,
}

impl ReadModel {
    pub fn new(log_capacity: usize) -> Self {
        Self {
            logs: LogHistory::new(log_capacity),
            progress: None,
            workers: BTreeMap::new(),
            latest_finding: None,
            status: ConnectionState::Disconnected,
        }
    }
}

type Callback<T> = Box<dyn FnMut(&T) + Send>;

/// Optional hooks fired after the read model has been updated.
#[derive(Default)]
pub struct ConsumerCallbacks {
    on_log: Option<Callback<LogRecord>>,
    on_finding: Option<Callback<Finding>>,
    on_error: Option<Callback<StreamErrorEvent>>,
    on_report: Option<Callback<ReportReady>>,
    on_status: Option<Box<dyn FnMut(ConnectionState) + Send>>,
    on_complete: Option<Box<dyn FnOnce(ScanOutcome) + Send>>,
}

impl std::fmt::Debug for ConsumerCallbacks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConsumerCallbacks")
            .field("on_log", &self.on_log.is_some())
            .field("on_finding", &self.on_finding.is_some())
            .field("on_error", &self.on_error.is_some())
            .field("on_report", &self.on_report.is_some())
            .field("on_status", &self.on_status.is_some())
            .field("on_complete", &self.on_complete.is_some())
            .finish()
    }
}

impl ConsumerCallbacks {
    pub fn on_log(mut self, f: impl FnMut(&LogRecord) + Send + 'static) -> Self {
        self.on_log = Some(Box::new(f));
        self
    }

    pub fn on_finding(mut self, f: impl FnMut(&Finding) + Send + 'static) -> Self {
        self.on_finding = Some(Box::new(f));
        self
    }

    /// Explicit `ERROR` events. Non-recoverable errors do not close the stream.
    pub fn on_error(mut self, f: impl FnMut(&StreamErrorEvent) + Send + 'static) -> Self {
        self.on_error = Some(Box::new(f));
        self
    }

    pub fn on_report(mut self, f: impl FnMut(&ReportReady) + Send + 'static) -> Self {
        self.on_report = Some(Box::new(f));
        self
    }

    pub fn on_status(mut self, f: impl FnMut(ConnectionState) + Send + 'static) -> Self {
        self.on_status = Some(Box::new(f));
        self
    }

    /// Called at most once, on the first `SCAN_COMPLETED` or `SCAN_FAILED`.
    pub fn on_complete(mut self, f: impl FnOnce(ScanOutcome) + Send + 'static) -> Self {
        self.on_complete = Some(Box::new(f));
        self
    }
}

struct Aggregator {
    scan_id: String,
    model: watch::Sender<ReadModel>,
    callbacks: Mutex<ConsumerCallbacks>,
}

impl Aggregator {
    fn callbacks(&self) -> MutexGuard<'_, ConsumerCallbacks> {
        self.callbacks.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn apply(&self, envelope: &Envelope) -> anyhow::Result<()> {
        if !envelope.belongs_to(&self.scan_id) {
            debug!(
                event = %envelope.event_type(),
                scope = ?envelope.scope(),
                "ignoring event for another scan"
            );
            return Ok(());
        }

        match &envelope.event {
            ScanEvent::ScanLog(record) => {
                self.model.send_modify(|m| m.logs.push(record.clone()));
                if let Some(f) = self.callbacks().on_log.as_mut() {
                    f(record);
                }
            }
            ScanEvent::ScanProgress(snapshot) => {
                self.model.send_modify(|m| m.progress = Some(snapshot.clone()));
            }
            ScanEvent::WorkerStarted(update) | ScanEvent::WorkerProgress(update) => {
                self.upsert_worker(update, WorkerState::Running);
            }
            ScanEvent::WorkerCompleted(update) => self.upsert_worker(update, WorkerState::Completed),
            ScanEvent::WorkerFailed(update) => self.upsert_worker(update, WorkerState::Failed),
            ScanEvent::FindingDiscovered(finding) => {
                self.model
                    .send_modify(|m| m.latest_finding = Some(finding.clone()));
                if let Some(f) = self.callbacks().on_finding.as_mut() {
                    f(finding);
                }
            }
            ScanEvent::ScanCompleted(summary) => {
                self.complete(ScanOutcome::Completed(summary.clone()));
            }
            ScanEvent::ScanFailed(summary) => self.complete(ScanOutcome::Failed(summary.clone())),
            ScanEvent::Error(err) => {
                if let Some(f) = self.callbacks().on_error.as_mut() {
                    f(err);
                }
            }
            ScanEvent::ReportReady(report) => {
                if let Some(f) = self.callbacks().on_report.as_mut() {
                    f(report);
                }
            }
            ScanEvent::ScanStarted(_) | ScanEvent::Ping | ScanEvent::Pong => {}
        }
        Ok(())
    }

    fn upsert_worker(&self, update: &WorkerUpdate, implied: WorkerState) {
        let (id, status) = update.clone().into_status(implied);
        self.model.send_modify(|m| {
            m.workers.insert(id, status);
        });
    }

    fn complete(&self, outcome: ScanOutcome) {
        let callback = self.callbacks().on_complete.take();
        match callback {
            Some(f) => f(outcome),
            None => debug!(?outcome, "scan finished"),
        }
    }

    fn status_changed(&self, state: ConnectionState) {
        self.model.send_modify(|m| m.status = state);
        if let Some(f) = self.callbacks().on_status.as_mut() {
            f(state);
        }
    }
}

/// Builder for [`StreamConsumer`]; the producer is chosen from `config.mode`.
pub struct ConsumerBuilder {
    config: StreamConfig,
    scan_id: String,
    callbacks: ConsumerCallbacks,
    connector: Arc<dyn Connector>,
    script: Option<Vec<LogRecord>>,
}

impl ConsumerBuilder {
    pub fn callbacks(mut self, callbacks: ConsumerCallbacks) -> Self {
        self.callbacks = callbacks;
        self
    }

    /// Socket implementation for live mode. Defaults to WebSocket.
    pub fn connector(mut self, connector: Arc<dyn Connector>) -> Self {
        self.connector = connector;
        self
    }

    /// Log script for simulated mode. Defaults to the built-in demo run.
    pub fn script(mut self, script: Vec<LogRecord>) -> Self {
        self.script = Some(script);
        self
    }

    /// Build the producer and start it. Must be called inside a tokio runtime.
    pub fn subscribe(self) -> Result<StreamConsumer> {
        let ConsumerBuilder {
            config,
            scan_id,
            callbacks,
            connector,
            script,
        } = self;

        let url = match config.mode {
            StreamMode::Live => Some(config.scan_url(&scan_id)?),
            StreamMode::Simulated => None,
        };

        let (model_tx, model_rx) = watch::channel(ReadModel::new(config.log_capacity));
        let aggregator = Arc::new(Aggregator {
            scan_id: scan_id.clone(),
            model: model_tx,
            callbacks: Mutex::new(callbacks),
        });

        let mut router = EventRouter::new();
        for event_type in EventType::ALL {
            let agg = Arc::clone(&aggregator);
            router.on(event_type, move |env| agg.apply(env));
        }
        let mut bus = StatusBus::new();
        let agg = Arc::clone(&aggregator);
        bus.listen(move |state| agg.status_changed(state));

        let mut producer: Box<dyn EventProducer> = match url {
            Some(url) => Box::new(ConnectionManager::new(
                config.connection.clone(),
                connector,
                url,
                Some(scan_id.clone()),
                router,
                bus,
            )),
            None => Box::new(SimulatedSource::new(
                scan_id.clone(),
                script.unwrap_or_else(|| default_script(OffsetDateTime::now_utc())),
                config.simulation.pacing(),
                router,
                bus,
            )),
        };
        producer.start();

        Ok(StreamConsumer {
            scan_id,
            producer,
            model: model_rx,
            aggregator,
        })
    }
}

/// One scan subscription and its read model. Dropping it tears the producer
/// down.
pub struct StreamConsumer {
    scan_id: String,
    producer: Box<dyn EventProducer>,
    model: watch::Receiver<ReadModel>,
    aggregator: Arc<Aggregator>,
}

impl std::fmt::Debug for StreamConsumer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamConsumer")
            .field("scan_id", &self.scan_id)
            .field("status", &self.status())
            .finish()
    }
}

impl StreamConsumer {
    pub fn builder(config: &StreamConfig, scan_id: impl Into<String>) -> ConsumerBuilder {
        ConsumerBuilder {
            config: config.clone(),
            scan_id: scan_id.into(),
            callbacks: ConsumerCallbacks::default(),
            connector: Arc::new(WsConnector),
            script: None,
        }
    }

    pub fn subscribe(
        config: &StreamConfig,
        scan_id: impl Into<String>,
        callbacks: ConsumerCallbacks,
    ) -> Result<Self> {
        Self::builder(config, scan_id).callbacks(callbacks).subscribe()
    }

    pub fn scan_id(&self) -> &str {
        &self.scan_id
    }

    pub fn snapshot(&self) -> ReadModel {
        self.model.borrow().clone()
    }

    /// Receiver that wakes on every read-model change.
    pub fn watch(&self) -> watch::Receiver<ReadModel> {
        self.model.clone()
    }

    pub fn logs(&self) -> Vec<LogRecord> {
        self.model.borrow().logs.to_vec()
    }

    pub fn progress(&self) -> Option<ProgressSnapshot> {
        self.model.borrow().progress.clone()
    }

    pub fn workers(&self) -> BTreeMap<String, WorkerStatus> {
        self.model.borrow().workers.clone()
    }

    pub fn latest_finding(&self) -> Option<Finding> {
        self.model.borrow().latest_finding.clone()
    }

    pub fn status(&self) -> ConnectionState {
        self.model.borrow().status
    }

    /// Empty the log history only.
    pub fn clear(&self) {
        self.aggregator.model.send_modify(|m| m.logs.clear());
    }

    pub fn reconnect(&mut self) {
        self.producer.reconnect();
    }

    pub fn send(&self, frame: &ControlFrame) -> bool {
        self.producer.send(frame)
    }

    /// Stop the producer; every socket and timer is released on return.
    pub async fn disconnect(&mut self) {
        self.producer.disconnect().await;
    }
}

impl Drop for StreamConsumer {
    fn drop(&mut self) {
        self.producer.shutdown();
    }
}
