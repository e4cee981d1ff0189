use std::time::Duration;

use serde::{Deserialize, Serialize};
use url::Url;

use crate::error::{Result, StreamError};
use crate::history::DEFAULT_LOG_CAPACITY;

/// Which producer backs a subscription. Chosen once, at construction.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum StreamMode {
    #[default]
    Live,
    Simulated,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct StreamConfig {
    /// Server root, e.g. `ws://127.0.0.1:8000`. `http(s)` is mapped to `ws(s)`.
    pub base_url: String,
    pub mode: StreamMode,
    pub log_capacity: usize,
    pub connection: ConnectionConfig,
    pub simulation: SimulationConfig,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            base_url: "ws://127.0.0.1:8000".into(),
            mode: StreamMode::Live,
            log_capacity: DEFAULT_LOG_CAPACITY,
            connection: ConnectionConfig::default(),
            simulation: SimulationConfig::default(),
        }
    }
}

impl StreamConfig {
    /// Socket address for one scan: `<base>/ws/scan/<scan_id>`.
    pub fn scan_url(&self, scan_id: &str) -> Result<Url> {
        let mut url = Url::parse(self.base_url.trim())?;
        let scheme = match url.scheme() {
            "http" | "ws" => "ws",
            "https" | "wss" => "wss",
            other => return Err(StreamError::UnsupportedUrl(format!("scheme {other}"))),
        };
        url.set_scheme(scheme)
            .map_err(|_| StreamError::UnsupportedUrl(self.base_url.clone()))?;
        url.path_segments_mut()
            .map_err(|_| StreamError::UnsupportedUrl(self.base_url.clone()))?
            .pop_if_empty()
            .extend(["ws", "scan", scan_id]);
        Ok(url)
    }
}

/// Connection manager tuning. Reconnects use a fixed delay, not exponential.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct ConnectionConfig {
    pub max_attempts: u32,
    pub reconnect_interval_ms: u64,
    pub ping_interval_ms: u64,
    pub connect_timeout_ms: u64,
    /// Treat this much inbound silence while connected as a dropped socket.
    /// `None` disables the check.
    pub liveness_timeout_ms: Option<u64>,
    /// Send SUBSCRIBE after each open and UNSUBSCRIBE before a requested close.
    pub subscribe_on_open: bool,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            reconnect_interval_ms: 3_000,
            ping_interval_ms: 30_000,
            connect_timeout_ms: 10_000,
            liveness_timeout_ms: None,
            subscribe_on_open: true,
        }
    }
}

impl ConnectionConfig {
    pub fn reconnect_interval(&self) -> Duration {
        Duration::from_millis(self.reconnect_interval_ms)
    }

    pub fn ping_interval(&self) -> Duration {
        Duration::from_millis(self.ping_interval_ms.max(1))
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn liveness_timeout(&self) -> Option<Duration> {
        self.liveness_timeout_ms.map(Duration::from_millis)
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct SimulationConfig {
    pub pacing_ms: u64,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self { pacing_ms: 800 }
    }
}

impl SimulationConfig {
    pub fn pacing(&self) -> Duration {
        Duration::from_millis(self.pacing_ms.max(1))
    }
}
