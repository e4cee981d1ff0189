//! Offline producer that replays a fixed log script at a constant pace.
//!
//! Each tick emits the same envelopes a live server would send for that
//! step (`SCAN_LOG`, then `SCAN_PROGRESS`, plus `SCAN_COMPLETED` on the last
//! tick) through the same [`EventRouter`], so consumers cannot tell the two
//! producers apart.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use ::time::OffsetDateTime;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{self, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

use crate::events::{ControlFrame, Envelope, ScanEvent};
use crate::producer::{EventProducer, StatusBus};
use crate::router::EventRouter;
use crate::types::{
    format_rfc3339, ConnectionState, LogLevel, LogRecord, ProgressSnapshot, ScanStatus,
    ScanSummary,
};

struct Parts {
    router: EventRouter,
    bus: StatusBus,
}

struct Replay {
    cancel: CancellationToken,
    task: JoinHandle<Option<Parts>>,
}

pub struct SimulatedSource {
    scan_id: String,
    ticks: Arc<Vec<Vec<Envelope>>>,
    pacing: Duration,
    state: watch::Receiver<ConnectionState>,
    parked: Option<Parts>,
    replay: Option<Replay>,
}

impl std::fmt::Debug for SimulatedSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SimulatedSource")
            .field("scan_id", &self.scan_id)
            .field("ticks", &self.ticks.len())
            .field("pacing", &self.pacing)
            .field("running", &self.replay.is_some())
            .finish()
    }
}

impl SimulatedSource {
    pub fn new(
        scan_id: impl Into<String>,
        script: Vec<LogRecord>,
        pacing: Duration,
        router: EventRouter,
        bus: StatusBus,
    ) -> Self {
        let scan_id = scan_id.into();
        let ticks = Arc::new(script_ticks(&scan_id, &script));
        Self {
            scan_id,
            ticks,
            pacing,
            state: bus.subscribe(),
            parked: Some(Parts { router, bus }),
            replay: None,
        }
    }

    pub fn is_running(&self) -> bool {
        self.replay.is_some()
    }

    fn spawn(&mut self, parts: impl std::future::Future<Output = Option<Parts>> + Send + 'static) {
        let cancel = CancellationToken::new();
        let ticks = Arc::clone(&self.ticks);
        let pacing = self.pacing;
        let token = cancel.clone();
        let task = tokio::spawn(async move {
            let parts = parts.await?;
            Some(replay(parts, ticks, pacing, token).await)
        });
        self.replay = Some(Replay { cancel, task });
    }
}

#[async_trait]
impl EventProducer for SimulatedSource {
    fn start(&mut self) {
        if self.replay.is_some() {
            return;
        }
        match self.parked.take() {
            Some(parts) => self.spawn(async move { Some(parts) }),
            None => error!(scan_id = %self.scan_id, "simulated source lost its router"),
        }
    }

    fn reconnect(&mut self) {
        let Some(previous) = self.replay.take() else {
            self.start();
            return;
        };
        previous.cancel.cancel();
        self.spawn(async move { rejoin(previous.task).await });
    }

    async fn disconnect(&mut self) {
        if let Some(running) = self.replay.take() {
            running.cancel.cancel();
            self.parked = rejoin(running.task).await;
        }
    }

    fn send(&self, frame: &ControlFrame) -> bool {
        debug!(?frame, "simulated source discards outbound frame");
        self.replay.is_some()
    }

    fn status(&self) -> watch::Receiver<ConnectionState> {
        self.state.clone()
    }

    fn shutdown(&mut self) {
        if let Some(running) = self.replay.take() {
            running.cancel.cancel();
        }
    }
}

impl Drop for SimulatedSource {
    fn drop(&mut self) {
        self.shutdown();
    }
}

async fn rejoin(task: JoinHandle<Option<Parts>>) -> Option<Parts> {
    match task.await {
        Ok(parts) => parts,
        Err(e) => {
            error!(error = %e, "simulated replay task failed");
            None
        }
    }
}

async fn replay(
    mut parts: Parts,
    ticks: Arc<Vec<Vec<Envelope>>>,
    pacing: Duration,
    cancel: CancellationToken,
) -> Parts {
    parts.bus.set(ConnectionState::Connecting);
    parts.bus.set(ConnectionState::Connected);

    let mut ticker = time::interval_at(Instant::now() + pacing, pacing);
    for tick in ticks.iter() {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                parts.bus.set(ConnectionState::Disconnected);
                return parts;
            }
            _ = ticker.tick() => {}
        }
        for envelope in tick {
            parts.router.emit(envelope);
        }
    }
    drop(ticker);
    debug!(ticks = ticks.len(), "simulated script exhausted");

    cancel.cancelled().await;
    parts.bus.set(ConnectionState::Disconnected);
    parts
}

/// Envelopes emitted per tick. Progress is `round(position / len * 100)` and
/// the last tick reports `COMPLETED`.
pub fn script_ticks(scan_id: &str, script: &[LogRecord]) -> Vec<Vec<Envelope>> {
    let total = script.len();
    script
        .iter()
        .enumerate()
        .map(|(idx, record)| {
            let position = idx + 1;
            let last = position == total;
            let mut record = record.clone();
            if record.scan_id.is_empty() {
                record.scan_id = scan_id.to_string();
            }
            let at = record.timestamp.clone();
            let progress = ProgressSnapshot {
                scan_id: scan_id.to_string(),
                progress: (position as f64 / total as f64 * 100.0).round(),
                status: if last {
                    ScanStatus::Completed
                } else {
                    ScanStatus::Running
                },
                workers_completed: 0,
                workers_total: 0,
                current_task: Some(record.message.clone()),
            };

            let mut tick = vec![
                Envelope::new(ScanEvent::ScanLog(record), at.clone(), format!("sim-{position}-log"))
                    .with_scan_id(scan_id),
                Envelope::new(
                    ScanEvent::ScanProgress(progress),
                    at.clone(),
                    format!("sim-{position}-progress"),
                )
                .with_scan_id(scan_id),
            ];
            if last {
                let summary = ScanSummary {
                    scan_id: Some(scan_id.to_string()),
                    status: Some(ScanStatus::Completed),
                    findings_count: None,
                    error: None,
                };
                tick.push(
                    Envelope::new(ScanEvent::ScanCompleted(summary), at, format!("sim-{position}-done"))
                        .with_scan_id(scan_id),
                );
            }
            tick
        })
        .collect()
}

/// A plausible reconnaissance run, stamped one second apart from `epoch`.
pub fn default_script(epoch: OffsetDateTime) -> Vec<LogRecord> {
    const LINES: &[(LogLevel, &str, &str)] = &[
        (LogLevel::Info, "orchestrator", "Scan accepted, preparing workers"),
        (LogLevel::Info, "orchestrator", "Resolving target scope"),
        (LogLevel::Debug, "resolver", "3 hosts resolved from scope definition"),
        (LogLevel::Info, "subfinder", "Enumerating subdomains"),
        (LogLevel::Success, "subfinder", "Found 14 subdomains"),
        (LogLevel::Info, "httpx", "Probing live HTTP services"),
        (LogLevel::Warn, "httpx", "2 hosts timed out after 10s"),
        (LogLevel::Success, "httpx", "12 live services identified"),
        (LogLevel::Info, "nuclei", "Running template scan (1843 templates)"),
        (LogLevel::Warn, "nuclei", "Rate limited by target, slowing down"),
        (LogLevel::Success, "nuclei", "Template scan finished with 3 matches"),
        (LogLevel::Info, "reporter", "Correlating findings"),
        (LogLevel::Success, "reporter", "Report generated"),
    ];
    LINES
        .iter()
        .enumerate()
        .map(|(i, (level, source, message))| LogRecord {
            scan_id: String::new(),
            level: *level,
            message: (*message).to_string(),
            source: (*source).to_string(),
            timestamp: format_rfc3339(epoch + ::time::Duration::seconds(i as i64)),
            metadata: None,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use ::time::macros::datetime;

    #[test]
    fn progress_is_rounded_share_of_script() {
        let script = default_script(datetime!(2024-01-01 0:00 UTC));
        let ticks = script_ticks("abc", &script[..3]);
        let progress: Vec<f64> = ticks
            .iter()
            .map(|t| match &t[1].event {
                ScanEvent::ScanProgress(p) => p.progress,
                other => panic!("unexpected {other:?}"),
            })
            .collect();
        assert_eq!(progress, vec![33.0, 67.0, 100.0]);
    }

    #[test]
    fn only_last_tick_completes() {
        let script = default_script(datetime!(2024-01-01 0:00 UTC));
        let ticks = script_ticks("abc", &script);
        assert_eq!(ticks.len(), script.len());
        for (i, tick) in ticks.iter().enumerate() {
            let last = i + 1 == ticks.len();
            assert_eq!(tick.len(), if last { 3 } else { 2 });
            match &tick[1].event {
                ScanEvent::ScanProgress(p) => assert_eq!(p.status == ScanStatus::Completed, last),
                other => panic!("unexpected {other:?}"),
            }
        }
        assert!(matches!(ticks.last().unwrap()[2].event, ScanEvent::ScanCompleted(_)));
    }

    #[test]
    fn script_is_reproducible_from_epoch() {
        let epoch = datetime!(2024-03-01 12:00 UTC);
        let a = default_script(epoch);
        assert_eq!(a, default_script(epoch));
        assert_eq!(a[0].timestamp, "2024-03-01T12:00:00Z");
        assert_eq!(a[2].timestamp, "2024-03-01T12:00:02Z");
    }
}
