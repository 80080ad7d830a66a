//! Daily settlement of recurring subscriptions
//!
//! Each run renews every due subscription independently: one failure never
//! aborts the batch, and a subscription is only ever worked on by the run that
//! holds its renewal claim. Running twice on the same day is harmless because a
//! renewed subscription is no longer due.

use std::sync::Arc;

use futures::stream::{self, StreamExt};
use learnhub_shared::SubscriptionId;
use serde::Serialize;
use time::macros::format_description;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::audit::{ActorType, AuditLog, BillingEventBuilder, BillingEventType};
use crate::config::SettlementPolicy;
use crate::error::{BillingError, BillingResult};
use crate::payment::{
    ChargeInstrument, ChargeVerdict, NewPayment, PaymentKind, PaymentRecord, PaymentService,
    PaymentStatus, PaymentTransition,
};
use crate::store::{BillingStore, RenewalCommit, RenewalFailure, RenewalOutcome};
use crate::subscription::Subscription;
use crate::vault::BillingKeyVault;

/// What happened to one subscription in a run
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RenewalStep {
    Renewed {
        subscription: Box<Subscription>,
        waived: bool,
    },
    /// The cycle was already settled by a webhook or an earlier run
    AlreadyApplied,
    Failed {
        exhausted: bool,
    },
    /// Charge outcome unknown; left PENDING for the next run or a webhook
    Deferred,
    /// Not claimable or no longer due
    Skipped,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SettlementItemError {
    pub subscription_id: SubscriptionId,
    pub error: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SettlementSummary {
    pub attempted: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub waived: usize,
    pub deferred: usize,
    pub skipped: usize,
    pub expired: usize,
    pub errors: Vec<SettlementItemError>,
}

impl SettlementSummary {
    fn record(&mut self, subscription_id: SubscriptionId, step: BillingResult<RenewalStep>) {
        match step {
            Ok(RenewalStep::Skipped) => self.skipped += 1,
            Ok(step) => {
                self.attempted += 1;
                match step {
                    RenewalStep::Renewed { waived: true, .. } => self.waived += 1,
                    RenewalStep::Renewed { .. } | RenewalStep::AlreadyApplied => {
                        self.succeeded += 1
                    }
                    RenewalStep::Failed { .. } => self.failed += 1,
                    RenewalStep::Deferred => self.deferred += 1,
                    RenewalStep::Skipped => {}
                }
            }
            Err(e) => {
                self.attempted += 1;
                self.errors.push(SettlementItemError {
                    subscription_id,
                    error: e.to_string(),
                });
            }
        }
    }
}

/// A failed renewal attempt, with or without a payment record behind it
struct RenewalAttempt<'a> {
    order_id: Option<&'a str>,
    number: i32,
    reason: Option<&'a str>,
}

#[derive(Clone)]
pub struct SettlementJob {
    store: Arc<dyn BillingStore>,
    payments: PaymentService,
    vault: BillingKeyVault,
    audit: AuditLog,
    policy: SettlementPolicy,
}

impl SettlementJob {
    pub fn new(
        store: Arc<dyn BillingStore>,
        payments: PaymentService,
        vault: BillingKeyVault,
        audit: AuditLog,
        policy: SettlementPolicy,
    ) -> Self {
        Self {
            store,
            payments,
            vault,
            audit,
            policy,
        }
    }

    /// Renew everything due now, then expire what has lapsed
    pub async fn run(&self) -> BillingResult<SettlementSummary> {
        let run_id = Uuid::new_v4();
        let now = OffsetDateTime::now_utc();

        self.audit
            .emit(
                BillingEventBuilder::new(BillingEventType::SettlementStarted)
                    .data(serde_json::json!({ "run_id": run_id }))
                    .actor_type(ActorType::System),
            )
            .await;

        let due = match self.store.due_subscriptions(now).await {
            Ok(due) => due,
            Err(e) => {
                tracing::error!(run_id = %run_id, error = %e, "Settlement could not list due subscriptions");
                self.audit
                    .emit(
                        BillingEventBuilder::new(BillingEventType::SettlementError)
                            .data(serde_json::json!({ "run_id": run_id, "error": e.to_string() }))
                            .actor_type(ActorType::System),
                    )
                    .await;
                return Err(e);
            }
        };

        tracing::info!(run_id = %run_id, due = due.len(), "Settlement run started");

        let results: Vec<_> = stream::iter(due)
            .map(|sub| async move {
                let id = sub.id;
                (id, self.renew_one(sub, now).await)
            })
            .buffer_unordered(self.policy.concurrency.max(1))
            .collect()
            .await;

        let mut summary = SettlementSummary::default();
        for (id, step) in results {
            summary.record(id, step);
        }
        summary.expired = self.expire_lapsed(now).await;

        tracing::info!(
            run_id = %run_id,
            attempted = summary.attempted,
            succeeded = summary.succeeded,
            waived = summary.waived,
            failed = summary.failed,
            deferred = summary.deferred,
            expired = summary.expired,
            errors = summary.errors.len(),
            "Settlement run completed"
        );

        self.audit
            .emit(
                BillingEventBuilder::new(BillingEventType::SettlementCompleted)
                    .data(serde_json::json!({
                        "run_id": run_id,
                        "attempted": summary.attempted,
                        "succeeded": summary.succeeded,
                        "waived": summary.waived,
                        "failed": summary.failed,
                        "deferred": summary.deferred,
                        "skipped": summary.skipped,
                        "expired": summary.expired,
                        "errors": summary.errors.len(),
                    }))
                    .actor_type(ActorType::System),
            )
            .await;

        Ok(summary)
    }

    async fn renew_one(&self, sub: Subscription, now: OffsetDateTime) -> BillingResult<RenewalStep> {
        let Some(claimed) = self
            .store
            .claim_renewal(sub.id, now, self.policy.claim_lease)
            .await?
        else {
            tracing::debug!(subscription_id = %sub.id, "Renewal claimed elsewhere; skipping");
            return Ok(RenewalStep::Skipped);
        };

        let result = self.renew_claimed(&claimed, now).await;

        if let Err(e) = self.store.release_renewal(claimed.id).await {
            tracing::warn!(subscription_id = %claimed.id, error = %e, "Failed to release renewal claim");
        }

        if let Err(ref e) = result {
            if matches!(e, BillingError::Credential(_)) {
                tracing::warn!(
                    subscription_id = %claimed.id,
                    user_id = %claimed.user_id,
                    error = %e,
                    "Billing key unusable; renewal skipped"
                );
                // an unreadable key never heals on its own
                let reason = e.to_string();
                let attempt = RenewalAttempt {
                    order_id: None,
                    number: claimed.failure_count + 1,
                    reason: Some(&reason),
                };
                if let Err(record_err) = self.record_failure(&claimed, attempt, now).await {
                    tracing::error!(
                        subscription_id = %claimed.id,
                        error = %record_err,
                        "Failed to record credential failure"
                    );
                }
            } else {
                tracing::error!(
                    subscription_id = %claimed.id,
                    user_id = %claimed.user_id,
                    error = %e,
                    "Renewal errored"
                );
            }
            self.audit
                .emit(
                    BillingEventBuilder::new(BillingEventType::SettlementError)
                        .user(claimed.user_id)
                        .subscription(claimed.id)
                        .data(serde_json::json!({ "error": e.to_string() }))
                        .actor_type(ActorType::System),
                )
                .await;
        }
        result
    }

    async fn renew_claimed(&self, sub: &Subscription, now: OffsetDateTime) -> BillingResult<RenewalStep> {
        if !sub.is_due(now) {
            return Ok(RenewalStep::Skipped);
        }

        // an earlier attempt may still be waiting on the gateway
        if let Some(pending) = self.store.pending_renewal_payment(sub.id).await? {
            let verdict = if pending.final_amount == 0 {
                ChargeVerdict::Approved {
                    transition: PaymentTransition::waived(now),
                }
            } else {
                pending.judge(&self.payments.requery(&pending.order_id).await)
            };
            tracing::info!(
                subscription_id = %sub.id,
                order_id = %pending.order_id,
                "Resolving earlier renewal attempt"
            );
            return self.apply_renewal_verdict(&pending, verdict).await;
        }

        let envelope = sub.encrypted_credential.as_deref().ok_or_else(|| {
            BillingError::Credential(format!("subscription {} has no billing key", sub.id))
        })?;
        let billing_key = self.vault.decrypt(envelope)?;

        let plan = self
            .store
            .plan(sub.plan_id)
            .await?
            .ok_or_else(|| BillingError::NotFound(format!("plan {}", sub.plan_id)))?;
        let cycle = sub.next_billing_date.ok_or_else(|| {
            BillingError::Internal(format!("subscription {} has no billing date", sub.id))
        })?;

        let application = self
            .store
            .coupon_application(sub.id)
            .await?
            .filter(|app| app.is_active);
        let original_amount = plan.price_for(sub.currency);
        let discount_amount = match application {
            Some(ref app) => app.terms.quote(original_amount, sub.currency)?,
            None => 0,
        };

        let record = self
            .payments
            .create_pending(NewPayment {
                user_id: sub.user_id,
                plan_id: sub.plan_id,
                subscription_id: Some(sub.id),
                order_id: renewal_order_id(cycle)?,
                original_amount,
                discount_amount,
                currency: sub.currency,
                kind: PaymentKind::Recurring,
                applied_coupon_id: application.as_ref().map(|app| app.coupon_id),
                coupon_terms: application.as_ref().map(|app| app.terms),
                billing_cycle_due: Some(cycle),
                attempt_number: sub.failure_count + 1,
            })
            .await?;

        let verdict = if record.final_amount == 0 {
            ChargeVerdict::Approved {
                transition: PaymentTransition::waived(now),
            }
        } else {
            let result = self
                .payments
                .charge(
                    &record,
                    ChargeInstrument::BillingKey {
                        billing_key: &billing_key,
                        customer_key: &sub.customer_key,
                        order_name: &plan.name,
                    },
                )
                .await?;
            record.judge(&result)
        };

        self.apply_renewal_verdict(&record, verdict).await
    }

    /// Write the outcome of a RECURRING payment.
    ///
    /// Success settles the payment, extends the subscription and consumes the
    /// coupon cycle in one store commit. Shared with the webhook reconciler.
    pub async fn apply_renewal_verdict(
        &self,
        record: &PaymentRecord,
        verdict: ChargeVerdict,
    ) -> BillingResult<RenewalStep> {
        let now = OffsetDateTime::now_utc();
        let subscription_id = record.subscription_id.ok_or_else(|| {
            BillingError::InvalidInput(format!("order {} has no subscription", record.order_id))
        })?;
        let sub = self
            .store
            .subscription(subscription_id)
            .await?
            .ok_or_else(|| BillingError::NotFound(format!("subscription {}", subscription_id)))?;

        match verdict {
            ChargeVerdict::Approved { transition } => {
                self.commit(record, &sub, transition, now).await
            }
            ChargeVerdict::Rejected {
                transition,
                violation,
            } => {
                let failed = self.payments.apply_transition(record, &transition).await?;
                match violation {
                    Some(violation) => self.payments.report_violation(record, &violation).await,
                    None => {
                        tracing::warn!(
                            subscription_id = %sub.id,
                            order_id = %failed.order_id,
                            reason = ?failed.failure_reason,
                            "Renewal charge failed"
                        );
                        self.audit
                            .emit(
                                BillingEventBuilder::new(BillingEventType::PaymentFailed)
                                    .user(failed.user_id)
                                    .subscription(sub.id)
                                    .order(&failed.order_id)
                                    .data(serde_json::json!({
                                        "reason": failed.failure_reason,
                                        "attempt": failed.attempt_number,
                                    }))
                                    .actor_type(ActorType::System),
                            )
                            .await;
                    }
                }
                let attempt = RenewalAttempt {
                    order_id: Some(&failed.order_id),
                    number: failed.attempt_number,
                    reason: failed.failure_reason.as_deref(),
                };
                let exhausted = self.record_failure(&sub, attempt, now).await?;
                Ok(RenewalStep::Failed { exhausted })
            }
            ChargeVerdict::Unresolved { reason } => {
                tracing::warn!(
                    subscription_id = %sub.id,
                    order_id = %record.order_id,
                    reason = %reason,
                    "Renewal outcome unknown; deferring"
                );
                Ok(RenewalStep::Deferred)
            }
        }
    }

    async fn commit(
        &self,
        record: &PaymentRecord,
        sub: &Subscription,
        transition: PaymentTransition,
        now: OffsetDateTime,
    ) -> BillingResult<RenewalStep> {
        let plan = self
            .store
            .plan(sub.plan_id)
            .await?
            .ok_or_else(|| BillingError::NotFound(format!("plan {}", sub.plan_id)))?;
        let expected_next_billing_date = record.billing_cycle_due.ok_or_else(|| {
            BillingError::InvalidInput(format!("order {} has no billing cycle", record.order_id))
        })?;

        let coupon_application = match record.applied_coupon_id {
            Some(_) => self
                .store
                .coupon_application(sub.id)
                .await?
                .filter(|app| app.is_active)
                .map(|app| app.consume_cycle())
                .transpose()?,
            None => None,
        };

        let waived = transition.to == PaymentStatus::Waived;
        let outcome = self
            .store
            .commit_renewal(RenewalCommit {
                subscription_id: sub.id,
                payment_id: record.id,
                transition,
                expected_next_billing_date,
                new_end_date: sub.renewed(&plan, now).end_date,
                billed_at: now,
                coupon_application: coupon_application.clone(),
            })
            .await?;

        match outcome {
            RenewalOutcome::Committed(renewed) => {
                tracing::info!(
                    subscription_id = %renewed.id,
                    user_id = %renewed.user_id,
                    order_id = %record.order_id,
                    amount = record.final_amount,
                    end_date = %renewed.end_date,
                    "Subscription renewed"
                );
                self.audit_renewal(record, &renewed, waived).await;
                if let Some(app) = coupon_application.filter(|app| !app.is_active) {
                    self.audit
                        .emit(
                            BillingEventBuilder::new(BillingEventType::CouponExhausted)
                                .user(renewed.user_id)
                                .subscription(renewed.id)
                                .data(serde_json::json!({
                                    "coupon_id": app.coupon_id,
                                    "applied_count": app.applied_count,
                                }))
                                .actor_type(ActorType::System),
                        )
                        .await;
                }
                Ok(RenewalStep::Renewed {
                    subscription: Box::new(renewed),
                    waived,
                })
            }
            RenewalOutcome::AlreadyApplied => {
                tracing::debug!(order_id = %record.order_id, "Renewal already applied");
                Ok(RenewalStep::AlreadyApplied)
            }
            RenewalOutcome::Conflict(reason) => {
                let violation = BillingError::ConcurrentModification(reason);
                self.payments.report_violation(record, &violation).await;
                Err(violation)
            }
        }
    }

    async fn audit_renewal(&self, record: &PaymentRecord, renewed: &Subscription, waived: bool) {
        let payment_event = if waived {
            BillingEventType::PaymentWaived
        } else {
            BillingEventType::PaymentSucceeded
        };
        self.audit
            .emit(
                BillingEventBuilder::new(payment_event)
                    .user(record.user_id)
                    .subscription(renewed.id)
                    .order(&record.order_id)
                    .data(serde_json::json!({
                        "amount": record.final_amount,
                        "discount_amount": record.discount_amount,
                        "attempt": record.attempt_number,
                    }))
                    .actor_type(ActorType::System),
            )
            .await;
        self.audit
            .emit(
                BillingEventBuilder::new(BillingEventType::SubscriptionRenewed)
                    .user(renewed.user_id)
                    .subscription(renewed.id)
                    .order(&record.order_id)
                    .data(serde_json::json!({
                        "end_date": renewed.end_date.unix_timestamp(),
                        "next_billing_date": renewed.next_billing_date.map(|d| d.unix_timestamp()),
                    }))
                    .actor_type(ActorType::System),
            )
            .await;
    }

    /// Count a failed attempt; returns whether retries are exhausted
    async fn record_failure(
        &self,
        sub: &Subscription,
        attempt: RenewalAttempt<'_>,
        now: OffsetDateTime,
    ) -> BillingResult<bool> {
        let (updated, exhausted) = sub.with_renewal_failure(&self.policy, now);
        self.store
            .record_renewal_failure(RenewalFailure {
                subscription_id: sub.id,
                failure_count: updated.failure_count,
                next_retry_at: updated.next_retry_at,
                exhausted,
            })
            .await?;

        if exhausted {
            tracing::warn!(
                subscription_id = %sub.id,
                user_id = %sub.user_id,
                failures = updated.failure_count,
                "Renewal retries exhausted; auto-renew disabled"
            );
        }

        let mut event = BillingEventBuilder::new(BillingEventType::RenewalFailed)
            .user(sub.user_id)
            .subscription(sub.id)
            .data(serde_json::json!({
                "attempt": attempt.number,
                "failure_count": updated.failure_count,
                "exhausted": exhausted,
                "reason": attempt.reason,
                "next_retry_at": updated.next_retry_at.map(|d| d.unix_timestamp()),
            }))
            .actor_type(ActorType::System);
        if let Some(order_id) = attempt.order_id {
            event = event.order(order_id);
        }
        self.audit.emit(event).await;

        Ok(exhausted)
    }

    /// Expire subscriptions whose period ended with nothing left to retry
    async fn expire_lapsed(&self, now: OffsetDateTime) -> usize {
        let lapsed = match self
            .store
            .lapsed_subscriptions(now, self.policy.lapse_grace)
            .await
        {
            Ok(lapsed) => lapsed,
            Err(e) => {
                tracing::error!(error = %e, "Failed to list lapsed subscriptions");
                return 0;
            }
        };

        let mut expired = 0;
        for sub in lapsed {
            match self.store.expire_subscription(sub.id, now).await {
                Ok(Some(sub)) => {
                    expired += 1;
                    tracing::info!(subscription_id = %sub.id, user_id = %sub.user_id, "Subscription expired");
                    self.audit
                        .emit(
                            BillingEventBuilder::new(BillingEventType::SubscriptionExpired)
                                .user(sub.user_id)
                                .subscription(sub.id)
                                .data(serde_json::json!({
                                    "end_date": sub.end_date.unix_timestamp(),
                                    "failure_count": sub.failure_count,
                                }))
                                .actor_type(ActorType::System),
                        )
                        .await;
                }
                Ok(None) => {}
                Err(e) => {
                    tracing::error!(subscription_id = %sub.id, error = %e, "Failed to expire subscription");
                }
            }
        }
        expired
    }
}

/// `renew-<cycle yyyymmdd>-<random>`, unique per attempt
fn renewal_order_id(cycle: OffsetDateTime) -> BillingResult<String> {
    let day = cycle
        .format(format_description!("[year][month][day]"))
        .map_err(|e| BillingError::Internal(format!("failed to format billing date: {}", e)))?;
    Ok(format!("renew-{}-{}", day, Uuid::new_v4().simple()))
}
