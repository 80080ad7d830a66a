//! Gateway webhook intake
//!
//! Verified deliveries are only enqueued here. The worker's sweep applies
//! them, so a slow or failing handler never makes the gateway retry.

use axum::{body::Bytes, extract::State, http::HeaderMap, http::StatusCode};
use time::OffsetDateTime;

use crate::{
    error::{ApiError, ApiResult},
    security::SIGNATURE_HEADER,
    state::AppState,
};

/// Receive a signed gateway notification
pub async fn gateway_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> ApiResult<StatusCode> {
    let signature = headers
        .get(SIGNATURE_HEADER)
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| {
            tracing::warn!("Gateway webhook missing signature header");
            ApiError::InvalidSignature
        })?;

    state
        .webhook_verifier
        .verify(signature, &body, OffsetDateTime::now_utc())
        .map_err(|e| {
            tracing::warn!(error = %e, "Gateway webhook signature verification failed");
            ApiError::InvalidSignature
        })?;

    let payload: serde_json::Value = serde_json::from_slice(&body)
        .map_err(|e| ApiError::BadRequest(format!("Invalid JSON payload: {}", e)))?;

    let (event, inserted) = state.billing.webhooks.ingest(&payload).await?;

    tracing::info!(
        event_id = %event.external_event_id,
        event_type = %event.event_type,
        duplicate = !inserted,
        "Gateway webhook queued"
    );

    Ok(StatusCode::OK)
}
