//! Internal trigger for the recurring settlement run

use axum::{extract::State, http::HeaderMap, Json};
use learnhub_billing::SettlementSummary;
use serde::Serialize;

use crate::{
    error::{ApiError, ApiResult},
    security::bearer_token_matches,
    state::AppState,
};

#[derive(Debug, Serialize)]
pub struct SettlementRunResponse {
    pub attempted: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub waived: usize,
    pub deferred: usize,
    pub skipped: usize,
    pub expired: usize,
    pub errors: Vec<SettlementErrorResponse>,
}

#[derive(Debug, Serialize)]
pub struct SettlementErrorResponse {
    pub subscription_id: String,
    pub error: String,
}

impl From<SettlementSummary> for SettlementRunResponse {
    fn from(summary: SettlementSummary) -> Self {
        Self {
            attempted: summary.attempted,
            succeeded: summary.succeeded,
            failed: summary.failed,
            waived: summary.waived,
            deferred: summary.deferred,
            skipped: summary.skipped,
            expired: summary.expired,
            errors: summary
                .errors
                .into_iter()
                .map(|e| SettlementErrorResponse {
                    subscription_id: e.subscription_id.to_string(),
                    error: e.error,
                })
                .collect(),
        }
    }
}

/// Run settlement now (normally driven by the worker's schedule)
pub async fn run_settlement(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> ApiResult<Json<SettlementRunResponse>> {
    let authorization = headers
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok());
    if !bearer_token_matches(authorization, &state.config.settlement_token) {
        tracing::warn!("Settlement trigger rejected: bad token");
        return Err(ApiError::Unauthorized);
    }

    let summary = state.billing.settlement.run().await?;

    tracing::info!(
        attempted = summary.attempted,
        succeeded = summary.succeeded,
        failed = summary.failed,
        "Settlement run triggered over HTTP"
    );

    Ok(Json(summary.into()))
}
