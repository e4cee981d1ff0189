use std::collections::BTreeMap;

use anyhow::Result;
use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::consumer::ReadModel;
use crate::feed::RenderFeed;
use crate::types::{ConnectionState, LogRecord, WorkerStatus};

/// Read-only view over one subscription's read model.
#[derive(Clone)]
pub struct AppState {
    model: watch::Receiver<ReadModel>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct StatusView {
    pub status: ConnectionState,
    pub log_count: usize,
    pub logs_evicted: u64,
    pub worker_count: usize,
}

#[derive(Debug, Default, Deserialize)]
pub struct LogWindowQuery {
    #[serde(default)]
    pub viewport: Option<u16>,
    #[serde(default)]
    pub row_height: Option<u16>,
    /// First row to show; omitted means "tail".
    #[serde(default)]
    pub offset: Option<usize>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LogWindow {
    pub start: usize,
    pub end: usize,
    pub total: usize,
    pub records: Vec<LogRecord>,
}

pub fn router(model: watch::Receiver<ReadModel>) -> Router {
    let api = Router::new()
        .route("/snapshot", get(get_snapshot))
        .route("/status", get(get_status))
        .route("/progress", get(get_progress))
        .route("/workers", get(get_workers))
        .route("/logs", get(get_logs))
        .with_state(AppState { model });

    Router::new()
        .nest("/api", api)
        .layer(TraceLayer::new_for_http())
}

pub async fn spawn_server(bind: &str, model: watch::Receiver<ReadModel>) -> Result<()> {
    let app = router(model);
    let listener = tokio::net::TcpListener::bind(bind).await?;
    info!(%bind, "serving read model");
    axum::serve(listener, app).await?;
    Ok(())
}

async fn get_snapshot(State(app): State<AppState>) -> Json<ReadModel> {
    let model = app.model.borrow().clone();
    Json(model)
}

async fn get_status(State(app): State<AppState>) -> Json<StatusView> {
    let view = {
        let m = app.model.borrow();
        StatusView {
            status: m.status,
            log_count: m.logs.len(),
            logs_evicted: m.logs.evicted(),
            worker_count: m.workers.len(),
        }
    };
    Json(view)
}

async fn get_progress(State(app): State<AppState>) -> impl IntoResponse {
    let progress = app.model.borrow().progress.clone();
    match progress {
        Some(p) => (StatusCode::OK, Json(p)).into_response(),
        None => StatusCode::NO_CONTENT.into_response(),
    }
}

async fn get_workers(State(app): State<AppState>) -> Json<BTreeMap<String, WorkerStatus>> {
    let workers = app.model.borrow().workers.clone();
    Json(workers)
}

async fn get_logs(
    State(app): State<AppState>,
    Query(q): Query<LogWindowQuery>,
) -> Json<LogWindow> {
    let window = {
        let m = app.model.borrow();
        let total = m.logs.len();
        let mut feed = RenderFeed::new(q.viewport.unwrap_or(50), q.row_height.unwrap_or(1));
        match q.offset {
            Some(offset) => feed = feed.with_follow(false).with_offset(offset),
            None => feed.scroll_to_tail(total),
        }
        let range = feed.visible_range(total);
        LogWindow {
            start: range.start,
            end: range.end,
            total,
            records: m.logs.slice(range).cloned().collect(),
        }
    };
    Json(window)
}
