#![allow(dead_code)]

use std::collections::VecDeque;
use std::future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use scan_stream_rs::error::{Result, StreamError};
use scan_stream_rs::transport::{Connector, Inbound, Transport};
use scan_stream_rs::types::ConnectionState;
use serde_json::json;
use url::Url;

/// How a scripted session ends once its frames are drained.
#[derive(Debug, Clone, Copy)]
pub enum End {
    Clean,
    Unclean,
    /// Stay open and silent.
    Hold,
}

#[derive(Debug, Clone)]
pub enum Session {
    /// The open attempt is refused.
    Fail,
    /// The open attempt never completes.
    Stall,
    Open { frames: Vec<String>, end: End },
}

impl Session {
    pub fn open(frames: Vec<String>, end: End) -> Self {
        Session::Open { frames, end }
    }
}

/// Connector that plays back one [`Session`] per open attempt. Attempts past
/// the end of the script are refused.
#[derive(Clone, Default)]
pub struct ScriptedConnector {
    sessions: Arc<Mutex<VecDeque<Session>>>,
    opens: Arc<AtomicUsize>,
    sent: Arc<Mutex<Vec<String>>>,
}

impl ScriptedConnector {
    pub fn new(sessions: Vec<Session>) -> Self {
        Self {
            sessions: Arc::new(Mutex::new(sessions.into())),
            ..Self::default()
        }
    }

    pub fn opens(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }

    /// Every frame written by the client, across sessions.
    pub fn sent(&self) -> Vec<String> {
        self.sent.lock().unwrap().clone()
    }
}

#[async_trait]
impl Connector for ScriptedConnector {
    async fn open(&self, _url: &Url) -> Result<Box<dyn Transport>> {
        self.opens.fetch_add(1, Ordering::SeqCst);
        let next = self.sessions.lock().unwrap().pop_front();
        match next {
            None | Some(Session::Fail) => Err(StreamError::Transport("connection refused".into())),
            Some(Session::Stall) => future::pending().await,
            Some(Session::Open { frames, end }) => Ok(Box::new(ScriptedTransport {
                frames: frames.into(),
                end,
                sent: Arc::clone(&self.sent),
                closed: false,
            })),
        }
    }
}

struct ScriptedTransport {
    frames: VecDeque<String>,
    end: End,
    sent: Arc<Mutex<Vec<String>>>,
    closed: bool,
}

#[async_trait]
impl Transport for ScriptedTransport {
    async fn send_text(&mut self, text: String) -> Result<()> {
        if self.closed {
            return Err(StreamError::Transport("closed".into()));
        }
        self.sent.lock().unwrap().push(text);
        Ok(())
    }

    async fn recv(&mut self) -> Inbound {
        if self.closed {
            return future::pending().await;
        }
        if let Some(frame) = self.frames.pop_front() {
            return Inbound::Frame(frame);
        }
        match self.end {
            End::Clean => Inbound::Closed { clean: true },
            End::Unclean => Inbound::Closed { clean: false },
            End::Hold => future::pending().await,
        }
    }

    async fn close(&mut self) {
        self.closed = true;
    }
}

/// Records every state a status listener sees.
#[derive(Clone, Default)]
pub struct Transitions(Arc<Mutex<Vec<ConnectionState>>>);

impl Transitions {
    pub fn listener(&self) -> impl FnMut(ConnectionState) + Send + 'static {
        let seen = Arc::clone(&self.0);
        move |state| seen.lock().unwrap().push(state)
    }

    pub fn all(&self) -> Vec<ConnectionState> {
        self.0.lock().unwrap().clone()
    }

    pub fn count(&self, state: ConnectionState) -> usize {
        self.all().iter().filter(|s| **s == state).count()
    }
}

/// Poll `cond` on the (paused) tokio clock until it holds or `limit` passes.
pub async fn eventually(limit: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + limit;
    loop {
        if cond() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

pub fn log_frame(scan_id: &str, message: &str) -> String {
    json!({
        "type": "SCAN_LOG",
        "payload": {"message": message, "level": "INFO", "source": "test"},
        "timestamp": "2024-01-01T00:00:00Z",
        "eventId": format!("log-{message}"),
        "scanId": scan_id,
    })
    .to_string()
}

pub fn progress_frame(scan_id: &str, progress: f64, status: &str, task: Option<&str>) -> String {
    let mut payload = json!({
        "scanId": scan_id,
        "progress": progress,
        "status": status,
        "workersCompleted": 1,
        "workersTotal": 4,
    });
    if let Some(task) = task {
        payload["currentTask"] = json!(task);
    }
    json!({
        "type": "SCAN_PROGRESS",
        "payload": payload,
        "timestamp": "2024-01-01T00:00:01Z",
        "eventId": format!("progress-{progress}"),
    })
    .to_string()
}

pub fn frame(kind: &str, payload: serde_json::Value, scan_id: Option<&str>) -> String {
    let mut raw = json!({
        "type": kind,
        "payload": payload,
        "timestamp": "2024-01-01T00:00:02Z",
        "eventId": format!("{kind}-1"),
    });
    if let Some(id) = scan_id {
        raw["scanId"] = json!(id);
    }
    raw.to_string()
}
