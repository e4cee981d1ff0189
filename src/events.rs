//! Inbound event envelopes and outbound control frames.
//!
//! Inbound frames are JSON objects of the form
//! `{type, payload, timestamp, eventId, scanId?}`. Only the closed set of
//! [`EventType`]s is accepted; anything else is rejected at parse time.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::types::{
    Finding, LogRecord, ProgressSnapshot, ReportReady, ScanStarted, ScanSummary,
    StreamErrorEvent, WorkerUpdate,
};

/// The closed set of inbound event kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum EventType {
    ScanStarted,
    ScanProgress,
    ScanCompleted,
    ScanFailed,
    ScanLog,
    WorkerStarted,
    WorkerProgress,
    WorkerCompleted,
    WorkerFailed,
    FindingDiscovered,
    ReportReady,
    Error,
    Ping,
    Pong,
}

impl EventType {
    pub const ALL: [EventType; 14] = [
        EventType::ScanStarted,
        EventType::ScanProgress,
        EventType::ScanCompleted,
        EventType::ScanFailed,
        EventType::ScanLog,
        EventType::WorkerStarted,
        EventType::WorkerProgress,
        EventType::WorkerCompleted,
        EventType::WorkerFailed,
        EventType::FindingDiscovered,
        EventType::ReportReady,
        EventType::Error,
        EventType::Ping,
        EventType::Pong,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            EventType::ScanStarted => "SCAN_STARTED",
            EventType::ScanProgress => "SCAN_PROGRESS",
            EventType::ScanCompleted => "SCAN_COMPLETED",
            EventType::ScanFailed => "SCAN_FAILED",
            EventType::ScanLog => "SCAN_LOG",
            EventType::WorkerStarted => "WORKER_STARTED",
            EventType::WorkerProgress => "WORKER_PROGRESS",
            EventType::WorkerCompleted => "WORKER_COMPLETED",
            EventType::WorkerFailed => "WORKER_FAILED",
            EventType::FindingDiscovered => "FINDING_DISCOVERED",
            EventType::ReportReady => "REPORT_READY",
            EventType::Error => "ERROR",
            EventType::Ping => "PING",
            EventType::Pong => "PONG",
        }
    }

    pub fn from_wire(s: &str) -> Option<EventType> {
        EventType::ALL.into_iter().find(|t| t.as_str() == s)
    }
}

impl std::fmt::Display for EventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A decoded inbound event, one variant per [`EventType`].
#[derive(Debug, Clone, PartialEq)]
pub enum ScanEvent {
    ScanStarted(ScanStarted),
    ScanProgress(ProgressSnapshot),
    ScanCompleted(ScanSummary),
    ScanFailed(ScanSummary),
    ScanLog(LogRecord),
    WorkerStarted(WorkerUpdate),
    WorkerProgress(WorkerUpdate),
    WorkerCompleted(WorkerUpdate),
    WorkerFailed(WorkerUpdate),
    FindingDiscovered(Finding),
    ReportReady(ReportReady),
    Error(StreamErrorEvent),
    Ping,
    Pong,
}

impl ScanEvent {
    pub fn event_type(&self) -> EventType {
        match self {
            ScanEvent::ScanStarted(_) => EventType::ScanStarted,
            ScanEvent::ScanProgress(_) => EventType::ScanProgress,
            ScanEvent::ScanCompleted(_) => EventType::ScanCompleted,
            ScanEvent::ScanFailed(_) => EventType::ScanFailed,
            ScanEvent::ScanLog(_) => EventType::ScanLog,
            ScanEvent::WorkerStarted(_) => EventType::WorkerStarted,
            ScanEvent::WorkerProgress(_) => EventType::WorkerProgress,
            ScanEvent::WorkerCompleted(_) => EventType::WorkerCompleted,
            ScanEvent::WorkerFailed(_) => EventType::WorkerFailed,
            ScanEvent::FindingDiscovered(_) => EventType::FindingDiscovered,
            ScanEvent::ReportReady(_) => EventType::ReportReady,
            ScanEvent::Error(_) => EventType::Error,
            ScanEvent::Ping => EventType::Ping,
            ScanEvent::Pong => EventType::Pong,
        }
    }

    /// Scan id carried inside the payload, if the event kind has one.
    pub fn payload_scan_id(&self) -> Option<&str> {
        let id = match self {
            ScanEvent::ScanStarted(p) => p.scan_id.as_deref(),
            ScanEvent::ScanProgress(p) => Some(p.scan_id.as_str()),
            ScanEvent::ScanCompleted(p) | ScanEvent::ScanFailed(p) => p.scan_id.as_deref(),
            ScanEvent::ScanLog(r) => Some(r.scan_id.as_str()),
            ScanEvent::Error(e) => e.scan_id.as_deref(),
            ScanEvent::WorkerStarted(_)
            | ScanEvent::WorkerProgress(_)
            | ScanEvent::WorkerCompleted(_)
            | ScanEvent::WorkerFailed(_)
            | ScanEvent::FindingDiscovered(_)
            | ScanEvent::ReportReady(_)
            | ScanEvent::Ping
            | ScanEvent::Pong => None,
        };
        id.filter(|s| !s.is_empty())
    }

    fn decode(kind: EventType, payload: Value) -> serde_json::Result<ScanEvent> {
        let payload = match payload {
            Value::Null => Value::Object(Map::new()),
            other => other,
        };
        Ok(match kind {
            EventType::ScanStarted => ScanEvent::ScanStarted(serde_json::from_value(payload)?),
            EventType::ScanProgress => ScanEvent::ScanProgress(serde_json::from_value(payload)?),
            EventType::ScanCompleted => ScanEvent::ScanCompleted(serde_json::from_value(payload)?),
            EventType::ScanFailed => ScanEvent::ScanFailed(serde_json::from_value(payload)?),
            EventType::ScanLog => ScanEvent::ScanLog(serde_json::from_value(payload)?),
            EventType::WorkerStarted => ScanEvent::WorkerStarted(serde_json::from_value(payload)?),
            EventType::WorkerProgress => ScanEvent::WorkerProgress(serde_json::from_value(payload)?),
            EventType::WorkerCompleted => ScanEvent::WorkerCompleted(serde_json::from_value(payload)?),
            EventType::WorkerFailed => ScanEvent::WorkerFailed(serde_json::from_value(payload)?),
            EventType::FindingDiscovered => ScanEvent::FindingDiscovered(serde_json::from_value(payload)?),
            EventType::ReportReady => ScanEvent::ReportReady(serde_json::from_value(payload)?),
            EventType::Error => ScanEvent::Error(serde_json::from_value(payload)?),
            EventType::Ping => ScanEvent::Ping,
            EventType::Pong => ScanEvent::Pong,
        })
    }

    fn payload(&self) -> serde_json::Result<Value> {
        match self {
            ScanEvent::ScanStarted(p) => serde_json::to_value(p),
            ScanEvent::ScanProgress(p) => serde_json::to_value(p),
            ScanEvent::ScanCompleted(p) | ScanEvent::ScanFailed(p) => serde_json::to_value(p),
            ScanEvent::ScanLog(r) => serde_json::to_value(r),
            ScanEvent::WorkerStarted(w)
            | ScanEvent::WorkerProgress(w)
            | ScanEvent::WorkerCompleted(w)
            | ScanEvent::WorkerFailed(w) => serde_json::to_value(w),
            ScanEvent::FindingDiscovered(f) => serde_json::to_value(f),
            ScanEvent::ReportReady(r) => serde_json::to_value(r),
            ScanEvent::Error(e) => serde_json::to_value(e),
            ScanEvent::Ping | ScanEvent::Pong => Ok(Value::Object(Map::new())),
        }
    }
}

/// Typed wrapper around every inbound event. Immutable once parsed.
#[derive(Debug, Clone, PartialEq)]
pub struct Envelope {
    pub event: ScanEvent,
    pub timestamp: String,
    pub event_id: String,
    pub scan_id: Option<String>,
}

#[derive(Deserialize, Serialize)]
struct WireEnvelope {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    payload: Value,
    timestamp: String,
    #[serde(rename = "eventId", default)]
    event_id: String,
    #[serde(rename = "scanId", default, skip_serializing_if = "Option::is_none")]
    scan_id: Option<String>,
}

/// Why a raw frame was rejected.
#[derive(Debug)]
pub enum Rejected {
    Malformed(serde_json::Error),
    UnknownType(String),
    BadPayload(EventType, serde_json::Error),
}

impl std::fmt::Display for Rejected {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Rejected::Malformed(e) => write!(f, "malformed frame: {e}"),
            Rejected::UnknownType(t) => write!(f, "unknown event type {t:?}"),
            Rejected::BadPayload(t, e) => write!(f, "bad {t} payload: {e}"),
        }
    }
}

impl Envelope {
    pub fn new(event: ScanEvent, timestamp: impl Into<String>, event_id: impl Into<String>) -> Self {
        Self {
            event,
            timestamp: timestamp.into(),
            event_id: event_id.into(),
            scan_id: None,
        }
    }

    pub fn with_scan_id(mut self, scan_id: impl Into<String>) -> Self {
        self.scan_id = Some(scan_id.into());
        self
    }

    pub fn event_type(&self) -> EventType {
        self.event.event_type()
    }

    /// Decode one text frame. Requires string `type` and `timestamp` fields
    /// and a `type` from the closed enumeration.
    pub fn from_frame(raw: &str) -> Result<Envelope, Rejected> {
        let wire: WireEnvelope = serde_json::from_str(raw).map_err(Rejected::Malformed)?;
        let kind = EventType::from_wire(&wire.kind).ok_or(Rejected::UnknownType(wire.kind))?;
        let mut event =
            ScanEvent::decode(kind, wire.payload).map_err(|e| Rejected::BadPayload(kind, e))?;

        // Log lines inherit the envelope's scan id and timestamp when they omit them.
        if let ScanEvent::ScanLog(record) = &mut event {
            if record.scan_id.is_empty() {
                if let Some(id) = &wire.scan_id {
                    record.scan_id = id.clone();
                }
            }
            if record.timestamp.is_empty() {
                record.timestamp = wire.timestamp.clone();
            }
        }

        Ok(Envelope {
            event,
            timestamp: wire.timestamp,
            event_id: wire.event_id,
            scan_id: wire.scan_id.filter(|s| !s.is_empty()),
        })
    }

    pub fn to_frame(&self) -> serde_json::Result<String> {
        let wire = WireEnvelope {
            kind: self.event_type().as_str().to_string(),
            payload: self.event.payload()?,
            timestamp: self.timestamp.clone(),
            event_id: self.event_id.clone(),
            scan_id: self.scan_id.clone(),
        };
        serde_json::to_string(&wire)
    }

    /// The scan this event is about: the envelope's `scanId`, else the payload's.
    pub fn scope(&self) -> Option<&str> {
        self.scan_id.as_deref().or_else(|| self.event.payload_scan_id())
    }

    /// Unscoped events belong to every subscription on the connection.
    pub fn belongs_to(&self, scan_id: &str) -> bool {
        self.scope().map_or(true, |s| s == scan_id)
    }
}

/// Frames the client sends to the server.
#[derive(Serialize, Debug, Clone, PartialEq)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ControlFrame {
    Ping {
        timestamp: String,
    },
    Subscribe {
        #[serde(rename = "scanId")]
        scan_id: String,
    },
    Unsubscribe {
        #[serde(rename = "scanId")]
        scan_id: String,
    },
}

impl ControlFrame {
    pub fn ping() -> Self {
        ControlFrame::Ping {
            timestamp: crate::types::now_rfc3339(),
        }
    }

    pub fn to_text(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}
