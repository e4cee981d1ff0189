use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::Parser;
use scan_stream_rs::config::{ConnectionConfig, SimulationConfig, StreamConfig, StreamMode};
use scan_stream_rs::consumer::{ConsumerCallbacks, ReadModel, StreamConsumer};
use scan_stream_rs::feed::RenderFeed;
use scan_stream_rs::server;
use scan_stream_rs::types::{ConnectionState, LogRecord, ScanOutcome};
use tokio::sync::{mpsc, oneshot};
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Live log tail for a running scan.
#[derive(Debug, Clone, Parser)]
#[command(
    name = "scan-stream",
    version,
    about = "Follow a scan's progress, workers and log output over its event stream.",
    long_about = None
)]
struct Cli {
    /// Scan identifier to subscribe to.
    scan_id: String,

    /// Server root; the socket is opened at <base-url>/ws/scan/<scan-id>.
    #[arg(long, env = "SCAN_STREAM_BASE_URL", default_value = "ws://127.0.0.1:8000")]
    base_url: String,

    /// Replay a built-in demo script instead of connecting.
    #[arg(long, env = "SCAN_STREAM_SIMULATED", default_value_t = false)]
    simulated: bool,

    /// Open attempts, the first included, before giving up.
    #[arg(long, env = "SCAN_STREAM_MAX_ATTEMPTS", default_value_t = 5)]
    max_attempts: u32,

    /// Fixed delay between reconnect attempts, in milliseconds.
    #[arg(long = "reconnect-ms", env = "SCAN_STREAM_RECONNECT_MS", default_value_t = 3_000)]
    reconnect_ms: u64,

    /// Keepalive PING interval, in milliseconds.
    #[arg(long = "ping-ms", env = "SCAN_STREAM_PING_MS", default_value_t = 30_000)]
    ping_ms: u64,

    /// Treat this much inbound silence as a dead connection (off by default).
    #[arg(long = "liveness-ms", env = "SCAN_STREAM_LIVENESS_MS")]
    liveness_ms: Option<u64>,

    /// Pacing of the simulated script, in milliseconds.
    #[arg(long = "pacing-ms", default_value_t = 800)]
    pacing_ms: u64,

    /// Log lines kept in memory.
    #[arg(long, default_value_t = 1000)]
    capacity: usize,

    /// Visible log rows.
    #[arg(long, default_value_t = 20)]
    rows: u16,

    /// Do not keep the newest line in view.
    #[arg(long = "no-follow", default_value_t = false)]
    no_follow: bool,

    /// Also serve the read model over HTTP at this address (e.g. 127.0.0.1:8080).
    #[arg(long)]
    serve: Option<String>,

    /// Write the final log history as pretty JSON to this path.
    #[arg(long)]
    output: Option<PathBuf>,
}

impl Cli {
    fn stream_config(&self) -> StreamConfig {
        StreamConfig {
            base_url: self.base_url.clone(),
            mode: if self.simulated {
                StreamMode::Simulated
            } else {
                StreamMode::Live
            },
            log_capacity: self.capacity,
            connection: ConnectionConfig {
                max_attempts: self.max_attempts,
                reconnect_interval_ms: self.reconnect_ms,
                ping_interval_ms: self.ping_ms,
                liveness_timeout_ms: self.liveness_ms,
                ..ConnectionConfig::default()
            },
            simulation: SimulationConfig {
                pacing_ms: self.pacing_ms,
            },
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "scan_stream_rs=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();
    let config = cli.stream_config();
    info!(
        scan_id = %cli.scan_id,
        mode = ?config.mode,
        base_url = %config.base_url,
        max_attempts = config.connection.max_attempts,
        "starting scan stream"
    );

    let (done_tx, mut done_rx) = oneshot::channel::<ScanOutcome>();
    let (ended_tx, mut ended_rx) = mpsc::unbounded_channel::<ConnectionState>();
    let mut end = StreamEnd::default();
    let callbacks = ConsumerCallbacks::default()
        .on_complete(move |outcome| {
            let _ = done_tx.send(outcome);
        })
        .on_status(move |state| {
            if end.observe(state) {
                let _ = ended_tx.send(state);
            }
        })
        .on_error(|e| warn!(code = %e.code, recoverable = e.recoverable, "{}", e.message))
        .on_finding(|f| info!(id = %f.id, severity = %f.severity, "finding: {}", f.title))
        .on_report(|r| info!(report_id = %r.report_id, url = ?r.url, "report ready"));

    let mut consumer = StreamConsumer::subscribe(&config, cli.scan_id.clone(), callbacks)
        .context("failed to start scan stream")?;

    if let Some(bind) = cli.serve.clone() {
        let model = consumer.watch();
        tokio::spawn(async move {
            if let Err(e) = server::spawn_server(&bind, model).await {
                warn!(error = %e, "read-model server stopped");
            }
        });
    }

    let mut feed = RenderFeed::new(cli.rows, 1).with_follow(!cli.no_follow);
    let mut updates = consumer.watch();
    let mut outcome = None;
    loop {
        tokio::select! {
            changed = updates.changed() => {
                if changed.is_err() {
                    break;
                }
                let lines = screen(&cli.scan_id, &mut feed, &updates.borrow_and_update());
                paint(&lines)?;
            }
            result = &mut done_rx => {
                outcome = result.ok();
                break;
            }
            Some(state) = ended_rx.recv() => {
                info!(%state, "stream ended");
                break;
            }
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    let lines = screen(&cli.scan_id, &mut feed, &updates.borrow());
    paint(&lines)?;
    consumer.disconnect().await;

    match &outcome {
        Some(ScanOutcome::Completed(s)) => println!(
            "\nScan completed ({} findings)",
            s.findings_count.map_or_else(|| "?".to_string(), |n| n.to_string())
        ),
        Some(ScanOutcome::Failed(s)) => println!(
            "\nScan failed: {}",
            s.error.as_deref().unwrap_or("no reason given")
        ),
        None => println!("\nStream closed"),
    }

    if let Some(path) = cli.output.as_deref() {
        let logs = consumer.logs();
        match write_logs_json(path, &logs) {
            Ok(()) => println!("Wrote {} log lines to {}", logs.len(), path.display()),
            Err(e) => eprintln!("Failed to write JSON to {}: {e:#}", path.display()),
        }
    }

    Ok(())
}

/// Tracks status transitions and reports when the stream has ended on its
/// own: retries exhausted, or a clean close after it had started.
#[derive(Debug, Default)]
struct StreamEnd {
    started: bool,
}

impl StreamEnd {
    fn observe(&mut self, state: ConnectionState) -> bool {
        match state {
            ConnectionState::Errored => true,
            ConnectionState::Disconnected => self.started,
            ConnectionState::Connecting
            | ConnectionState::Connected
            | ConnectionState::Reconnecting => {
                self.started = true;
                false
            }
        }
    }
}

/// Banner plus the visible feed rows. Only the viewport is formatted, so the
/// cost does not grow with the history.
fn screen(scan_id: &str, feed: &mut RenderFeed, model: &ReadModel) -> Vec<String> {
    let (pct, task) = model
        .progress
        .as_ref()
        .map(|p| (p.progress, p.current_task.as_deref().unwrap_or("")))
        .unwrap_or((0.0, ""));
    let mut lines = vec![format!("scan {scan_id}  [{}]  {pct:>3.0}%  {task}", model.status)];
    if !model.workers.is_empty() {
        let summary: Vec<String> = model
            .workers
            .iter()
            .map(|(id, w)| format!("{id}:{:?} {:.0}%", w.status, w.progress))
            .collect();
        lines.push(format!("workers  {}", summary.join("  ")));
    }
    if let Some(f) = &model.latest_finding {
        lines.push(format!("latest   [{}] {}", f.severity, f.title));
    }
    lines.push("-".repeat(72));
    lines.extend(feed.render(&model.logs));
    lines
}

fn paint(lines: &[String]) -> Result<()> {
    let mut out = std::io::stdout().lock();
    // Clear screen, cursor home.
    write!(out, "\x1b[2J\x1b[H")?;
    for line in lines {
        writeln!(out, "{line}")?;
    }
    out.flush()?;
    Ok(())
}

fn write_logs_json(path: &Path, logs: &[LogRecord]) -> Result<()> {
    let file = File::create(path).with_context(|| format!("creating {}", path.display()))?;
    serde_json::to_writer_pretty(file, logs)?;
    Ok(())
}
