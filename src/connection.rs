//! Connection manager: one persistent socket per subscription.
//!
//! A single driver task owns the socket, the router, the status listeners,
//! and every timer (reconnect delay, keepalive, liveness). The public
//! [`ConnectionManager`] handle talks to it over a command channel, so a
//! disconnect is processed strictly between driver steps and cannot race a
//! scheduled reconnect.
//!
//! State machine:
//!
//! ```text
//! Disconnected -> Connecting -> Connected
//!                     |             | clean close / disconnect() -> Disconnected
//!                     |             | unclean close, attempts <  max -> Reconnecting
//!                     |             | unclean close, attempts >= max -> Errored
//!                     +-- failed open: same rule as an unclean close
//! Reconnecting -> Connecting  (after the fixed reconnect interval)
//! ```
//!
//! `attempts` counts opens since the last successful one, the first included,
//! so `max_attempts` consecutive failed opens end in `Errored`.

use std::future;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{self, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use url::Url;

use crate::config::ConnectionConfig;
use crate::error::{Result, StreamError};
use crate::events::ControlFrame;
use crate::producer::{EventProducer, StatusBus, StatusListener};
use crate::router::EventRouter;
use crate::transport::{Connector, Inbound, Transport};
use crate::types::ConnectionState;

enum Command {
    Connect(Url),
    Reconnect,
    Send(String),
    Listen(StatusListener),
    Disconnect(oneshot::Sender<()>),
}

/// Handle to a running connection driver.
pub struct ConnectionManager {
    commands: mpsc::UnboundedSender<Command>,
    state: watch::Receiver<ConnectionState>,
    url: Url,
    cancel: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl std::fmt::Debug for ConnectionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionManager")
            .field("url", &self.url.as_str())
            .field("state", &self.state())
            .finish()
    }
}

impl ConnectionManager {
    /// Spawn the driver on the current tokio runtime. Nothing is opened until
    /// [`connect`](Self::connect) or [`EventProducer::start`].
    ///
    /// `scan_id` is announced with SUBSCRIBE/UNSUBSCRIBE frames when
    /// `config.subscribe_on_open` is set.
    pub fn new(
        config: ConnectionConfig,
        connector: Arc<dyn Connector>,
        url: Url,
        scan_id: Option<String>,
        router: EventRouter,
        bus: StatusBus,
    ) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();
        let state = bus.subscribe();
        let driver = Driver {
            config,
            connector,
            router,
            bus,
            commands: rx,
            cancel: cancel.clone(),
            url: url.clone(),
            scan_id,
            attempts: 0,
        };
        let task = tokio::spawn(driver.run());
        Self {
            commands: tx,
            state,
            url,
            cancel,
            task: Some(task),
        }
    }

    /// Open the socket. No-op while connecting or connected; otherwise resets
    /// the retry budget.
    pub fn connect(&self, url: Url) {
        self.command(Command::Connect(url));
    }

    /// Drop any current socket and start over with a fresh retry budget.
    pub fn reconnect(&self) {
        self.command(Command::Reconnect);
    }

    /// Serialize and queue one outbound frame. Returns false when not
    /// connected; nothing is retried or buffered for later.
    pub fn send<T: Serialize>(&self, payload: &T) -> bool {
        if self.state() != ConnectionState::Connected {
            return false;
        }
        match encode(payload) {
            Ok(text) => self.commands.send(Command::Send(text)).is_ok(),
            Err(e) => {
                warn!(error = %e, "outbound payload dropped");
                false
            }
        }
    }

    /// Close cleanly and cancel any pending reconnect or keepalive. Returns
    /// once the driver has processed the request.
    pub async fn disconnect(&self) {
        let (ack, done) = oneshot::channel();
        if self.commands.send(Command::Disconnect(ack)).is_ok() {
            let _ = done.await;
        }
    }

    pub fn on_status<F>(&self, listener: F)
    where
        F: FnMut(ConnectionState) + Send + 'static,
    {
        self.command(Command::Listen(Box::new(listener)));
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    /// Stop the driver task and wait for it to exit.
    pub async fn stop(&mut self) {
        self.cancel.cancel();
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }

    fn command(&self, cmd: Command) {
        if self.commands.send(cmd).is_err() {
            debug!("connection driver already stopped");
        }
    }
}

impl Drop for ConnectionManager {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

#[async_trait]
impl EventProducer for ConnectionManager {
    fn start(&mut self) {
        self.connect(self.url.clone());
    }

    fn reconnect(&mut self) {
        ConnectionManager::reconnect(self);
    }

    async fn disconnect(&mut self) {
        ConnectionManager::disconnect(self).await;
    }

    fn send(&self, frame: &ControlFrame) -> bool {
        ConnectionManager::send(self, frame)
    }

    fn status(&self) -> watch::Receiver<ConnectionState> {
        self.state.clone()
    }

    fn shutdown(&mut self) {
        self.cancel.cancel();
    }
}

enum Link {
    Idle,
    Backoff(Instant),
    Open(Box<dyn Transport>),
    Stopped,
}

struct Driver {
    config: ConnectionConfig,
    connector: Arc<dyn Connector>,
    router: EventRouter,
    bus: StatusBus,
    commands: mpsc::UnboundedReceiver<Command>,
    cancel: CancellationToken,
    url: Url,
    scan_id: Option<String>,
    attempts: u32,
}

impl Driver {
    async fn run(mut self) {
        let mut link = Link::Idle;
        loop {
            link = match link {
                Link::Stopped => break,
                Link::Idle => self.down(None).await,
                Link::Backoff(at) => self.down(Some(at)).await,
                Link::Open(transport) => self.pump(transport).await,
            };
        }
        self.bus.set(ConnectionState::Disconnected);
        debug!(url = %self.url, stats = ?self.router.stats(), "connection driver stopped");
    }

    /// No socket: wait for a command or, in backoff, for the retry deadline.
    async fn down(&mut self, retry_at: Option<Instant>) -> Link {
        let retry = async move {
            match retry_at {
                Some(at) => time::sleep_until(at).await,
                None => future::pending().await,
            }
        };
        let resume = || retry_at.map_or(Link::Idle, Link::Backoff);

        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Link::Stopped,
            cmd = self.commands.recv() => match cmd {
                None => Link::Stopped,
                Some(Command::Connect(url)) => {
                    self.url = url;
                    self.attempts = 0;
                    self.open().await
                }
                Some(Command::Reconnect) => {
                    self.attempts = 0;
                    self.open().await
                }
                Some(Command::Send(_)) => {
                    debug!("not connected; outbound frame dropped");
                    resume()
                }
                Some(Command::Listen(listener)) => {
                    self.bus.push(listener);
                    resume()
                }
                Some(Command::Disconnect(ack)) => {
                    self.bus.set(ConnectionState::Disconnected);
                    let _ = ack.send(());
                    Link::Idle
                }
            },
            _ = retry => self.open().await,
        }
    }

    async fn open(&mut self) -> Link {
        self.attempts += 1;
        self.bus.set(ConnectionState::Connecting);
        let connector = Arc::clone(&self.connector);
        let url = self.url.clone();
        let limit = self.config.connect_timeout();
        let attempt = async move {
            match time::timeout(limit, connector.open(&url)).await {
                Ok(result) => result,
                Err(_) => Err(StreamError::ConnectTimeout(limit.as_millis() as u64)),
            }
        };
        tokio::pin!(attempt);

        loop {
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return Link::Stopped,
                cmd = self.commands.recv() => match cmd {
                    None => return Link::Stopped,
                    Some(Command::Disconnect(ack)) => {
                        self.bus.set(ConnectionState::Disconnected);
                        let _ = ack.send(());
                        return Link::Idle;
                    }
                    Some(Command::Listen(listener)) => self.bus.push(listener),
                    Some(Command::Send(_)) => debug!("still connecting; outbound frame dropped"),
                    Some(Command::Connect(_)) | Some(Command::Reconnect) => {
                        debug!("connect already in progress")
                    }
                },
                result = &mut attempt => {
                    return match result {
                        Ok(transport) => self.opened(transport).await,
                        Err(e) => {
                            warn!(url = %self.url, error = %e, "stream connect failed");
                            self.retry_or_fail()
                        }
                    };
                }
            }
        }
    }

    async fn opened(&mut self, mut transport: Box<dyn Transport>) -> Link {
        self.attempts = 0;
        info!(url = %self.url, "stream connected");
        self.bus.set(ConnectionState::Connected);
        if let Some(scan_id) = self.subscription() {
            send_control(&mut *transport, &ControlFrame::Subscribe { scan_id }).await;
        }
        Link::Open(transport)
    }

    async fn pump(&mut self, mut transport: Box<dyn Transport>) -> Link {
        let period = self.config.ping_interval();
        let mut keepalive = time::interval_at(Instant::now() + period, period);
        keepalive.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let liveness = self.config.liveness_timeout();
        let mut last_inbound = Instant::now();

        loop {
            let silent_at = liveness.map(|limit| last_inbound + limit);
            let silence = async move {
                match silent_at {
                    Some(at) => time::sleep_until(at).await,
                    None => future::pending().await,
                }
            };

            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => {
                    transport.close().await;
                    return Link::Stopped;
                }
                cmd = self.commands.recv() => match cmd {
                    None => {
                        transport.close().await;
                        return Link::Stopped;
                    }
                    Some(Command::Send(text)) => {
                        if let Err(e) = transport.send_text(text).await {
                            warn!(error = %e, "outbound frame not sent");
                        }
                    }
                    Some(Command::Listen(listener)) => self.bus.push(listener),
                    Some(Command::Connect(_)) => debug!("already connected"),
                    Some(Command::Reconnect) => {
                        transport.close().await;
                        self.attempts = 0;
                        return self.open().await;
                    }
                    Some(Command::Disconnect(ack)) => {
                        if let Some(scan_id) = self.subscription() {
                            send_control(&mut *transport, &ControlFrame::Unsubscribe { scan_id }).await;
                        }
                        transport.close().await;
                        self.bus.set(ConnectionState::Disconnected);
                        let _ = ack.send(());
                        return Link::Idle;
                    }
                },
                inbound = transport.recv() => match inbound {
                    Inbound::Frame(text) => {
                        last_inbound = Instant::now();
                        self.router.dispatch(&text);
                    }
                    Inbound::Closed { clean: true } => {
                        info!(url = %self.url, "stream closed by server");
                        self.bus.set(ConnectionState::Disconnected);
                        return Link::Idle;
                    }
                    Inbound::Closed { clean: false } => {
                        warn!(url = %self.url, "stream dropped");
                        return self.retry_or_fail();
                    }
                },
                _ = keepalive.tick() => {
                    send_control(&mut *transport, &ControlFrame::ping()).await;
                }
                _ = silence => {
                    warn!(url = %self.url, ?liveness, "no inbound traffic; treating stream as dead");
                    transport.close().await;
                    return self.retry_or_fail();
                }
            }
        }
    }

    fn retry_or_fail(&mut self) -> Link {
        if self.attempts < self.config.max_attempts {
            let delay = self.config.reconnect_interval();
            info!(
                attempt = self.attempts,
                max = self.config.max_attempts,
                ?delay,
                "scheduling reconnect"
            );
            self.bus.set(ConnectionState::Reconnecting);
            Link::Backoff(Instant::now() + delay)
        } else {
            error!(url = %self.url, attempts = self.attempts, "open attempts exhausted");
            self.bus.set(ConnectionState::Errored);
            Link::Idle
        }
    }

    fn subscription(&self) -> Option<String> {
        if self.config.subscribe_on_open {
            self.scan_id.clone()
        } else {
            None
        }
    }
}

async fn send_control(transport: &mut dyn Transport, frame: &ControlFrame) {
    if let Err(e) = write_control(transport, frame).await {
        warn!(error = %e, ?frame, "control frame not sent");
    }
}

async fn write_control(transport: &mut dyn Transport, frame: &ControlFrame) -> Result<()> {
    let text = frame.to_text()?;
    transport.send_text(text).await
}

fn encode<T: Serialize>(payload: &T) -> Result<String> {
    Ok(serde_json::to_string(payload)?)
}
