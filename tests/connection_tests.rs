mod common;

use std::sync::{Arc, Mutex};
use std::time::Duration;

use common::{eventually, log_frame, End, ScriptedConnector, Session, Transitions};
use scan_stream_rs::config::ConnectionConfig;
use scan_stream_rs::connection::ConnectionManager;
use scan_stream_rs::events::{ControlFrame, Envelope, EventType};
use scan_stream_rs::producer::StatusBus;
use scan_stream_rs::router::EventRouter;
use scan_stream_rs::types::ConnectionState;
use url::Url;

const WAIT: Duration = Duration::from_secs(120);

struct Harness {
    manager: ConnectionManager,
    connector: ScriptedConnector,
    transitions: Transitions,
    logs: Arc<Mutex<Vec<Envelope>>>,
}

fn harness(config: ConnectionConfig, sessions: Vec<Session>) -> Harness {
    let connector = ScriptedConnector::new(sessions);
    let transitions = Transitions::default();
    let logs = Arc::new(Mutex::new(Vec::new()));

    let mut router = EventRouter::new();
    let sink = Arc::clone(&logs);
    router.on(EventType::ScanLog, move |env| {
        sink.lock().unwrap().push(env.clone());
        Ok(())
    });
    let mut bus = StatusBus::new();
    bus.listen(transitions.listener());

    let url = Url::parse("ws://scanner.test/ws/scan/abc").unwrap();
    let manager = ConnectionManager::new(
        config,
        Arc::new(connector.clone()),
        url,
        Some("abc".into()),
        router,
        bus,
    );
    Harness {
        manager,
        connector,
        transitions,
        logs,
    }
}

fn config(max_attempts: u32) -> ConnectionConfig {
    ConnectionConfig {
        max_attempts,
        reconnect_interval_ms: 3_000,
        ..ConnectionConfig::default()
    }
}

#[tokio::test(start_paused = true)]
async fn reconnects_after_unclean_close_and_keeps_history() {
    let h = harness(
        config(5),
        vec![
            Session::open(vec![log_frame("abc", "hello")], End::Unclean),
            Session::open(vec![], End::Hold),
        ],
    );
    h.manager.connect(h.manager.url().clone());

    assert!(eventually(WAIT, || h.connector.opens() == 2 && h.manager.state() == ConnectionState::Connected).await);
    assert_eq!(
        h.transitions.all(),
        vec![
            ConnectionState::Connecting,
            ConnectionState::Connected,
            ConnectionState::Reconnecting,
            ConnectionState::Connecting,
            ConnectionState::Connected,
        ]
    );
    let logs = h.logs.lock().unwrap();
    assert_eq!(logs.len(), 1);
    assert_eq!(logs[0].scan_id.as_deref(), Some("abc"));
}

#[tokio::test(start_paused = true)]
async fn gives_up_after_max_attempts() {
    let h = harness(config(3), vec![]);
    h.manager.connect(h.manager.url().clone());

    assert!(eventually(WAIT, || h.manager.state() == ConnectionState::Errored).await);
    assert_eq!(h.connector.opens(), 3);
    assert_eq!(
        h.transitions.all(),
        vec![
            ConnectionState::Connecting,
            ConnectionState::Reconnecting,
            ConnectionState::Connecting,
            ConnectionState::Reconnecting,
            ConnectionState::Connecting,
            ConnectionState::Errored,
        ]
    );

    // No timer keeps running after giving up.
    tokio::time::sleep(Duration::from_secs(600)).await;
    assert_eq!(h.connector.opens(), 3);
    assert_eq!(h.manager.state(), ConnectionState::Errored);

    // An explicit reconnect starts a fresh budget.
    h.manager.reconnect();
    assert!(eventually(WAIT, || h.connector.opens() == 6).await);
    assert!(eventually(WAIT, || h.manager.state() == ConnectionState::Errored).await);
}

#[tokio::test(start_paused = true)]
async fn single_attempt_budget_never_retries() {
    let h = harness(config(1), vec![Session::Fail, Session::open(vec![], End::Hold)]);
    h.manager.connect(h.manager.url().clone());

    assert!(eventually(WAIT, || h.manager.state() == ConnectionState::Errored).await);
    tokio::time::sleep(Duration::from_secs(60)).await;
    assert_eq!(h.connector.opens(), 1);
    assert_eq!(h.transitions.count(ConnectionState::Reconnecting), 0);
}

#[tokio::test(start_paused = true)]
async fn zero_attempts_fails_immediately() {
    let h = harness(config(0), vec![Session::Fail]);
    h.manager.connect(h.manager.url().clone());

    assert!(eventually(WAIT, || h.manager.state() == ConnectionState::Errored).await);
    assert_eq!(h.connector.opens(), 1);
    assert_eq!(h.transitions.count(ConnectionState::Reconnecting), 0);
}

#[tokio::test(start_paused = true)]
async fn successful_open_resets_the_budget() {
    let h = harness(
        config(2),
        vec![
            Session::Fail,
            Session::open(vec![], End::Unclean),
            Session::open(vec![], End::Hold),
        ],
    );
    h.manager.connect(h.manager.url().clone());

    // Without the reset the drop would land on attempt 2 of 2 and fail.
    assert!(eventually(WAIT, || h.connector.opens() == 3 && h.manager.state() == ConnectionState::Connected).await);
    assert_eq!(h.transitions.count(ConnectionState::Errored), 0);
}

#[tokio::test(start_paused = true)]
async fn clean_close_does_not_reconnect() {
    let h = harness(config(5), vec![Session::open(vec![], End::Clean)]);
    h.manager.connect(h.manager.url().clone());

    assert!(eventually(WAIT, || h.transitions.all().contains(&ConnectionState::Connected)).await);
    assert!(eventually(WAIT, || h.manager.state() == ConnectionState::Disconnected).await);
    tokio::time::sleep(Duration::from_secs(60)).await;
    assert_eq!(h.connector.opens(), 1);
    assert_eq!(h.transitions.count(ConnectionState::Reconnecting), 0);
}

#[tokio::test(start_paused = true)]
async fn disconnect_cancels_pending_reconnect() {
    let h = harness(config(5), vec![Session::open(vec![], End::Unclean)]);
    h.manager.connect(h.manager.url().clone());

    assert!(eventually(WAIT, || h.manager.state() == ConnectionState::Reconnecting).await);
    h.manager.disconnect().await;
    assert_eq!(h.manager.state(), ConnectionState::Disconnected);

    tokio::time::sleep(Duration::from_secs(60)).await;
    assert_eq!(h.connector.opens(), 1);
    assert_eq!(h.manager.state(), ConnectionState::Disconnected);
}

#[tokio::test(start_paused = true)]
async fn subscribes_on_open_and_unsubscribes_on_disconnect() {
    let h = harness(config(5), vec![Session::open(vec![], End::Hold)]);
    assert!(!h.manager.send(&ControlFrame::ping()), "nothing sent before connecting");

    h.manager.connect(h.manager.url().clone());
    assert!(eventually(WAIT, || h.manager.state() == ConnectionState::Connected).await);
    assert!(h.manager.send(&ControlFrame::ping()));
    h.manager.disconnect().await;

    let sent = h.connector.sent();
    assert_eq!(sent.first().map(String::as_str), Some(r#"{"type":"SUBSCRIBE","scanId":"abc"}"#));
    assert_eq!(sent.last().map(String::as_str), Some(r#"{"type":"UNSUBSCRIBE","scanId":"abc"}"#));
    assert!(sent.iter().any(|f| f.contains(r#""type":"PING""#)));
    assert!(!h.manager.send(&ControlFrame::ping()));
}

#[tokio::test(start_paused = true)]
async fn keepalive_pings_while_connected() {
    let cfg = ConnectionConfig {
        ping_interval_ms: 1_000,
        subscribe_on_open: false,
        ..config(5)
    };
    let h = harness(cfg, vec![Session::open(vec![], End::Hold)]);
    h.manager.connect(h.manager.url().clone());
    assert!(eventually(WAIT, || h.manager.state() == ConnectionState::Connected).await);

    tokio::time::sleep(Duration::from_millis(3_500)).await;
    let pings = h.connector.sent().iter().filter(|f| f.contains("PING")).count();
    assert!((3..=4).contains(&pings), "got {pings} pings");

    h.manager.disconnect().await;
    let after = h.connector.sent().len();
    tokio::time::sleep(Duration::from_secs(10)).await;
    assert_eq!(h.connector.sent().len(), after);
}

#[tokio::test(start_paused = true)]
async fn connect_timeout_counts_as_failed_attempt() {
    let cfg = ConnectionConfig {
        connect_timeout_ms: 2_000,
        ..config(5)
    };
    let h = harness(cfg, vec![Session::Stall, Session::open(vec![], End::Hold)]);
    h.manager.connect(h.manager.url().clone());

    assert!(eventually(WAIT, || h.manager.state() == ConnectionState::Connected).await);
    assert_eq!(h.connector.opens(), 2);
    assert_eq!(h.transitions.count(ConnectionState::Reconnecting), 1);
}

#[tokio::test(start_paused = true)]
async fn silent_stream_is_treated_as_dropped() {
    let cfg = ConnectionConfig {
        liveness_timeout_ms: Some(5_000),
        ping_interval_ms: 60_000,
        ..config(5)
    };
    let h = harness(
        cfg,
        vec![
            Session::open(vec![], End::Hold),
            Session::open(vec![], End::Hold),
        ],
    );
    h.manager.connect(h.manager.url().clone());

    assert!(eventually(WAIT, || h.connector.opens() == 2 && h.manager.state() == ConnectionState::Connected).await);
    assert_eq!(h.transitions.count(ConnectionState::Reconnecting), 1);
}

#[tokio::test(start_paused = true)]
async fn malformed_frames_are_skipped() {
    let h = harness(
        config(5),
        vec![Session::open(
            vec![
                "not json".into(),
                r#"{"type":"NOT_A_TYPE","payload":{},"timestamp":"t"}"#.into(),
                log_frame("abc", "kept"),
            ],
            End::Hold,
        )],
    );
    h.manager.connect(h.manager.url().clone());

    assert!(eventually(WAIT, || h.logs.lock().unwrap().len() == 1).await);
    assert_eq!(h.manager.state(), ConnectionState::Connected);
}

#[tokio::test(start_paused = true)]
async fn connect_while_connected_is_a_noop() {
    let h = harness(config(5), vec![Session::open(vec![], End::Hold)]);
    h.manager.connect(h.manager.url().clone());
    assert!(eventually(WAIT, || h.manager.state() == ConnectionState::Connected).await);

    h.manager.connect(h.manager.url().clone());
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(h.connector.opens(), 1);
    assert_eq!(h.manager.state(), ConnectionState::Connected);
}

#[tokio::test(start_paused = true)]
async fn stop_ends_the_driver() {
    let mut h = harness(config(5), vec![Session::open(vec![], End::Hold)]);
    h.manager.connect(h.manager.url().clone());
    assert!(eventually(WAIT, || h.manager.state() == ConnectionState::Connected).await);

    h.manager.stop().await;
    assert_eq!(h.manager.state(), ConnectionState::Disconnected);
    h.manager.connect(h.manager.url().clone());
    tokio::time::sleep(Duration::from_secs(5)).await;
    assert_eq!(h.connector.opens(), 1);
}
