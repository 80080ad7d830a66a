//! LearnHub billing worker
//!
//! Scheduled jobs: daily recurring settlement, webhook queue sweep and
//! webhook retention cleanup.

#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

pub mod config;
pub mod settlement_runner;
pub mod webhook_processor;

pub use config::{WorkerConfig, WorkerConfigError};
pub use settlement_runner::SettlementRunner;
