//! Common types used across LearnHub billing

use serde::{Deserialize, Serialize};
use uuid::Uuid;

// =============================================================================
// ID Wrappers
// =============================================================================

macro_rules! id_wrapper {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub Uuid);

        impl $name {
            pub fn new() -> Self {
                Self(Uuid::new_v4())
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl From<Uuid> for $name {
            fn from(id: Uuid) -> Self {
                Self(id)
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                self.0.fmt(f)
            }
        }
    };
}

id_wrapper!(
    /// Platform user ID
    UserId
);
id_wrapper!(
    /// Subscription plan ID
    PlanId
);
id_wrapper!(
    /// Payment record ID
    PaymentId
);
id_wrapper!(
    /// Subscription ID
    SubscriptionId
);
id_wrapper!(
    /// Discount coupon ID
    CouponId
);

impl UserId {
    /// Customer key presented to the payment gateway for this user.
    ///
    /// Billing keys are bound to the customer key they were issued for, so
    /// this must stay stable for the lifetime of the user.
    pub fn customer_key(&self) -> String {
        format!("cus_{}", self.0.simple())
    }
}

// =============================================================================
// Currency
// =============================================================================

/// Settlement currency. Amounts are always stored in minor units
/// (won for KRW, cents for USD).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "UPPERCASE")]
pub enum Currency {
    #[default]
    Krw,
    Usd,
}

impl Currency {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Krw => "KRW",
            Self::Usd => "USD",
        }
    }
}

impl std::fmt::Display for Currency {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Currency {
    type Err = crate::error::SharedError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_uppercase().as_str() {
            "KRW" => Ok(Self::Krw),
            "USD" => Ok(Self::Usd),
            _ => Err(crate::error::SharedError::Validation(format!(
                "Invalid currency: {}",
                s
            ))),
        }
    }
}
