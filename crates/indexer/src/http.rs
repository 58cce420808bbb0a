//! Indexer HTTP surface
//!
//! The only layer that converts error kinds into status codes. Everything
//! else returns typed results.

use std::net::SocketAddr;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use axum::{
    extract::State,
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Json},
    routing::{get, post},
    Router,
};
use serde_json::json;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::info;

use secondlayer_core::{Error, Result};

use crate::ingest::{BlockSource, IngestOutcome, IngestService};
use crate::integrity::IntegrityService;
use crate::parse::NewBlockPayload;
use crate::tip_follower::TipFollowerState;

/// Header marking self-sourced replays; suppresses the tip-follower clock
const SOURCE_HEADER: &str = "X-Source";

/// Shared handler state
#[derive(Clone)]
pub struct AppState {
    pub ingest: Arc<IngestService>,
    pub integrity: Arc<IntegrityService>,
    pub tip: Arc<TipFollowerState>,
}

/// Build the router
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/health/integrity", get(health_integrity))
        .route("/new_block", post(new_block))
        .route("/new_burn_block", post(upstream_noop))
        .route("/new_mempool_tx", post(upstream_noop))
        .route("/drop_mempool_tx", post(upstream_noop))
        .route("/attachments/new", post(upstream_noop))
        .layer(tower_http::trace::TraceLayer::new_for_http())
        .with_state(state)
}

/// Serve until the shutdown signal flips
pub async fn serve(
    addr: SocketAddr,
    state: AppState,
    mut shutdown: watch::Receiver<bool>,
) -> Result<()> {
    let app = router(state);

    info!("Indexer listening on {}", addr);
    let listener = TcpListener::bind(addr)
        .await
        .map_err(|e| Error::network(format!("Failed to bind {}: {}", addr, e)))?;

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = shutdown.wait_for(|stop| *stop).await;
        })
        .await
        .map_err(|e| Error::network(format!("Server error: {}", e)))?;
    Ok(())
}

/// Liveness plus ingest observability
async fn health(State(state): State<AppState>) -> impl IntoResponse {
    let metrics = state.ingest.metrics();
    Json(json!({
        "status": "ok",
        "blocksReceivedOutOfOrder": metrics.blocks_received_out_of_order.load(Ordering::Relaxed),
        "lastSeenHeight": metrics.last_seen_height.load(Ordering::Relaxed),
        "tipFollower": state.tip.mode(),
        "lastBlockReceivedSecondsAgo": state.tip.seconds_since_last_block(),
        "blocksFetchedViaPoll": metrics.blocks_fetched_via_poll.load(Ordering::Relaxed),
    }))
}

/// Gap and watermark report, live from the store
async fn health_integrity(State(state): State<AppState>) -> impl IntoResponse {
    match state.integrity.check().await {
        Ok(report) => {
            let backfill = state.integrity.backfill_progress();
            Json(json!({
                "status": report.status(),
                "lastContiguousBlock": report.last_contiguous,
                "lastIndexedBlock": report.last_indexed,
                "gapCount": report.gaps.len(),
                "totalMissingBlocks": report.total_missing,
                "autoBackfillEnabled": state.integrity.auto_backfill_enabled(),
                "autoBackfillProgress": {
                    "remaining": backfill.remaining.load(Ordering::Relaxed),
                    "inProgress": backfill.in_progress.load(Ordering::Relaxed),
                },
            }))
            .into_response()
        }
        Err(e) => error_response(&e),
    }
}

/// Accept one pushed block
async fn new_block(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(payload): Json<NewBlockPayload>,
) -> impl IntoResponse {
    let source = if headers.contains_key(SOURCE_HEADER) {
        BlockSource::SelfReplay
    } else {
        state.tip.record_push();
        BlockSource::Push
    };

    match state.ingest.ingest_block(payload, source).await {
        Ok(IngestOutcome::Ok {
            block_height,
            transactions,
            events,
            jobs_enqueued,
        }) => Json(json!({
            "status": "ok",
            "block_height": block_height,
            "transactions": transactions,
            "events": events,
            "jobs_enqueued": jobs_enqueued,
        }))
        .into_response(),
        Ok(IngestOutcome::Duplicate) => {
            Json(json!({"status": "ok", "message": "duplicate"})).into_response()
        }
        Err(e) => error_response(&e),
    }
}

/// Contract endpoints the upstream requires; intentionally no-ops
async fn upstream_noop() -> impl IntoResponse {
    Json(json!({"status": "ok"}))
}

fn error_response(error: &Error) -> axum::response::Response {
    let status = match error {
        Error::Validation(_) | Error::Parse(_) => StatusCode::BAD_REQUEST,
        Error::NotFound(_) => StatusCode::NOT_FOUND,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (status, Json(json!({"status": "error", "error": error.to_string()}))).into_response()
}
