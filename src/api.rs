use std::sync::Arc;

use axum::{extract::State, routing::get, Json, Router};
use frame_bus::PipelineStats;
use serde::Serialize;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use crate::media::pipe::Pipe;

#[derive(Debug, Default, Serialize)]
pub(crate) struct StatsResponse {
    running: bool,
    submitted: u64,
    dispatched: u64,
    fallbacks: u64,
    allocation_failures: u64,
    analysis_failures: u64,
    forwarded: u64,
    gaps: u64,
    stale_dropped: u64,
    sink_errors: u64,
    fps: f64,
}

impl StatsResponse {
    fn new(running: bool, stats: PipelineStats) -> Self {
        Self {
            running,
            submitted: stats.submitted,
            dispatched: stats.dispatched,
            fallbacks: stats.fallbacks,
            allocation_failures: stats.allocation_failures,
            analysis_failures: stats.analysis_failures,
            forwarded: stats.forwarded,
            gaps: stats.gaps,
            stale_dropped: stats.stale_dropped,
            sink_errors: stats.sink_errors,
            fps: stats.fps,
        }
    }
}

pub(crate) fn router(pipe: Arc<Pipe>) -> Router {
    Router::new()
        .route("/", get(index))
        .route("/stats", get(stats))
        .with_state(pipe)
}

pub(crate) fn start_api_server(cancel: CancellationToken, addr: String, pipe: Arc<Pipe>) {
    tokio::spawn(async move {
        let listener = match TcpListener::bind(&addr).await {
            Ok(listener) => listener,
            Err(e) => {
                log::error!("API server bind {} failed: {}", addr, e);
                return;
            }
        };
        log::info!("API server started on {}", addr);
        if let Err(e) = axum::serve(listener, router(pipe))
            .with_graceful_shutdown(shutdown_signal(cancel))
            .await
        {
            log::error!("Error starting API server: {}", e);
        }
    });
}

async fn shutdown_signal(cancel: CancellationToken) {
    cancel.cancelled().await;
    log::info!("Shutting down API server...");
}

async fn index() -> &'static str {
    "lite-detect"
}

async fn stats(State(pipe): State<Arc<Pipe>>) -> Json<StatsResponse> {
    let stats = pipe.stats().unwrap_or_default();
    Json(StatsResponse::new(pipe.is_started(), stats))
}
