//! Subscription plans (read-only from the engine's point of view)

use learnhub_shared::{Currency, PlanId};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Plan {
    pub id: PlanId,
    pub name: String,
    pub price_krw: i64,
    pub price_usd: i64,
    pub duration_days: i32,
    pub active: bool,
}

impl Plan {
    /// List price in minor units of the given currency
    pub fn price_for(&self, currency: Currency) -> i64 {
        match currency {
            Currency::Krw => self.price_krw,
            Currency::Usd => self.price_usd,
        }
    }

    pub fn duration(&self) -> time::Duration {
        time::Duration::days(i64::from(self.duration_days))
    }
}
