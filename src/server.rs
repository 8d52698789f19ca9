use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use axum::{
    extract::State,
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::{error, info};

use crate::scanner::SharedProgress;
use crate::sink;

/// Read-only view of a running scan plus its cancel switch.
#[derive(Clone)]
pub struct AppState {
    inner: Arc<Inner>,
}

struct Inner {
    progress: SharedProgress,
    cancel: CancellationToken,
    output: PathBuf,
}

impl AppState {
    pub fn new(progress: SharedProgress, cancel: CancellationToken, output: PathBuf) -> Self {
        Self {
            inner: Arc::new(Inner {
                progress,
                cancel,
                output,
            }),
        }
    }
}

pub fn router(state: AppState) -> Router {
    let api = Router::new()
        .route("/status", get(get_status))
        .route("/results", get(get_results))
        .route("/cancel", post(post_cancel))
        .with_state(state);

    Router::new().nest("/api", api).layer(TraceLayer::new_for_http())
}

pub async fn spawn_server(bind: &str, state: AppState) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(bind).await?;
    info!(addr = %listener.local_addr()?, "status API listening");
    axum::serve(listener, router(state)).await?;
    Ok(())
}

async fn get_status(State(app): State<AppState>) -> impl IntoResponse {
    (StatusCode::OK, Json(app.inner.progress.snapshot()))
}

// 204 until the merge has produced the canonical table.
async fn get_results(State(app): State<AppState>) -> impl IntoResponse {
    let path = app.inner.output.clone();
    if !path.exists() {
        return StatusCode::NO_CONTENT.into_response();
    }
    match tokio::task::spawn_blocking(move || sink::read_canonical(&path)).await {
        Ok(Ok(rows)) => (StatusCode::OK, Json(rows)).into_response(),
        Ok(Err(e)) => {
            error!(error = %e, "reading result table failed");
            (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response()
        }
        Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response(),
    }
}

async fn post_cancel(State(app): State<AppState>) -> impl IntoResponse {
    if !app.inner.cancel.is_cancelled() {
        info!("cancel requested over status API");
        app.inner.cancel.cancel();
    }
    (StatusCode::ACCEPTED, Json(app.inner.progress.snapshot()))
}
