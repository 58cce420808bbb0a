//! Development webhook receiver
//!
//! Accepts deliveries, verifies the signature header against a shared
//! secret, and logs what arrived. Useful as the far end of a stream while
//! developing handlers and filters.

use std::net::SocketAddr;

use anyhow::Result;
use axum::{
    body::Bytes,
    extract::State,
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Json},
    routing::post,
    Router,
};
use serde_json::json;
use tokio::net::TcpListener;
use tracing::{info, warn};

use secondlayer_core::signing;

#[derive(Clone)]
struct ReceiverState {
    secret: String,
}

/// Serve the receiver until interrupted
pub async fn run(port: u16, secret: String) -> Result<()> {
    let app = Router::new()
        .route("/", post(receive))
        .route("/webhook", post(receive))
        .with_state(ReceiverState { secret });

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    info!("Webhook receiver listening on {}", addr);

    let listener = TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await?;
    Ok(())
}

async fn receive(
    State(state): State<ReceiverState>,
    headers: HeaderMap,
    body: Bytes,
) -> impl IntoResponse {
    let body_text = String::from_utf8_lossy(&body);

    let signature = headers
        .get(signing::SIGNATURE_HEADER)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();
    let delivery_id = headers
        .get("X-Delivery-Id")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("-");

    if !signing::verify(&state.secret, signature, &body_text) {
        warn!(delivery_id, "Rejected delivery with bad signature");
        return (
            StatusCode::UNAUTHORIZED,
            Json(json!({"status": "invalid signature"})),
        );
    }

    let summary = serde_json::from_str::<serde_json::Value>(&body_text)
        .map(|payload| {
            format!(
                "block {} ({} events, {} transactions)",
                payload["block_height"],
                payload["events"].as_array().map(|a| a.len()).unwrap_or(0),
                payload["transactions"]
                    .as_array()
                    .map(|a| a.len())
                    .unwrap_or(0),
            )
        })
        .unwrap_or_else(|_| format!("{} bytes (not JSON)", body.len()));

    info!(delivery_id, %summary, "Delivery verified");
    (StatusCode::OK, Json(json!({"status": "ok"})))
}
