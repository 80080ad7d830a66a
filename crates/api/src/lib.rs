//! LearnHub Billing API Library
//!
//! HTTP surface over the billing engine: checkout, card registration,
//! cancellation, gateway webhook intake and the internal settlement trigger.

#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

pub mod config;
pub mod error;
pub mod routes;
pub mod security;
pub mod state;

pub use config::Config;
pub use error::{ApiError, ApiResult};
pub use routes::create_router;
pub use state::AppState;
