use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use time::{format_description::well_known, OffsetDateTime};

/// Lifecycle state of one subscription's connection.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConnectionState {
    Connecting,
    Connected,
    #[default]
    Disconnected,
    Reconnecting,
    Errored,
}

impl ConnectionState {
    /// Short banner text for status lines.
    pub fn label(self) -> &'static str {
        match self {
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "live",
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Reconnecting => "reconnecting",
            ConnectionState::Errored => "connection failed",
        }
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.label())
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LogLevel {
    Debug,
    #[default]
    Info,
    #[serde(alias = "WARNING")]
    Warn,
    Error,
    Success,
}

impl LogLevel {
    pub fn badge(self) -> &'static str {
        match self {
            LogLevel::Debug => "DBG",
            LogLevel::Info => "INF",
            LogLevel::Warn => "WRN",
            LogLevel::Error => "ERR",
            LogLevel::Success => "OK ",
        }
    }
}

/// One line of scan output.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct LogRecord {
    #[serde(default)]
    pub scan_id: String,
    #[serde(default)]
    pub level: LogLevel,
    pub message: String,
    #[serde(default)]
    pub source: String,
    #[serde(default)]
    pub timestamp: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WorkerState {
    Pending,
    Running,
    Completed,
    Failed,
}

/// Latest known state of one worker. Replaced wholesale on every update.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct WorkerStatus {
    #[serde(rename = "type")]
    pub worker_type: String,
    pub status: WorkerState,
    pub progress: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result_count: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Wire payload of the `WORKER_*` events.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct WorkerUpdate {
    pub worker_id: String,
    #[serde(rename = "type", default)]
    pub worker_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<WorkerState>,
    #[serde(default)]
    pub progress: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result_count: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl WorkerUpdate {
    /// Resolve into a map entry; `implied` fills in a status the frame left out.
    pub fn into_status(self, implied: WorkerState) -> (String, WorkerStatus) {
        (
            self.worker_id,
            WorkerStatus {
                worker_type: self.worker_type,
                status: self.status.unwrap_or(implied),
                progress: self.progress,
                result_count: self.result_count,
                error: self.error,
            },
        )
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ScanStatus {
    #[default]
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

/// Current overall progress of a scan. Each `SCAN_PROGRESS` replaces it.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct ProgressSnapshot {
    #[serde(default)]
    pub scan_id: String,
    #[serde(default)]
    pub progress: f64,
    #[serde(default)]
    pub status: ScanStatus,
    #[serde(default)]
    pub workers_completed: u32,
    #[serde(default)]
    pub workers_total: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_task: Option<String>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct Finding {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub severity: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(flatten)]
    pub details: Map<String, Value>,
}

/// Payload of an explicit `ERROR` event. `recoverable = false` is advisory.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct StreamErrorEvent {
    #[serde(default)]
    pub code: String,
    pub message: String,
    #[serde(default)]
    pub recoverable: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scan_id: Option<String>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct ScanStarted {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scan_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workers_total: Option<u32>,
}

/// Payload shared by `SCAN_COMPLETED` and `SCAN_FAILED`.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct ScanSummary {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scan_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<ScanStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub findings_count: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct ReportReady {
    #[serde(default)]
    pub report_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub format: Option<String>,
}

/// How a scan ended, delivered once to the completion callback.
#[derive(Debug, Clone, PartialEq)]
pub enum ScanOutcome {
    Completed(ScanSummary),
    Failed(ScanSummary),
}

pub(crate) fn now_rfc3339() -> String {
    format_rfc3339(OffsetDateTime::now_utc())
}

pub(crate) fn format_rfc3339(at: OffsetDateTime) -> String {
    at.format(&well_known::Rfc3339)
        .unwrap_or_else(|_| String::from("1970-01-01T00:00:00Z"))
}
