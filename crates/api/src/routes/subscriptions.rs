//! Subscription endpoints

use axum::{
    extract::{Path, State},
    Json,
};
use learnhub_billing::ActorType;
use learnhub_shared::{SubscriptionId, UserId};
use serde::Deserialize;
use uuid::Uuid;

use super::checkout::SubscriptionResponse;
use crate::{
    error::{ApiError, ApiResult},
    state::AppState,
};

#[derive(Debug, Deserialize)]
pub struct CancelSubscriptionRequest {
    /// Owner of the subscription, as asserted by the upstream gateway
    pub user_id: UserId,
}

/// Stop future renewals; access continues until the end of the paid period
pub async fn cancel_subscription(
    State(state): State<AppState>,
    Path(subscription_id): Path<Uuid>,
    Json(req): Json<CancelSubscriptionRequest>,
) -> ApiResult<Json<SubscriptionResponse>> {
    let subscription_id = SubscriptionId(subscription_id);

    // Someone else's subscription looks exactly like a missing one
    let owned = state
        .billing
        .store
        .subscription(subscription_id)
        .await?
        .filter(|sub| sub.user_id == req.user_id)
        .ok_or(ApiError::NotFound)?;

    let cancelled = state
        .billing
        .checkout
        .cancel_subscription(owned.id, ActorType::User, Some(req.user_id.0))
        .await?;

    tracing::info!(
        user_id = %cancelled.user_id,
        subscription_id = %cancelled.id,
        "Subscription cancelled by user"
    );

    Ok(Json(SubscriptionResponse::from(&cancelled)))
}
