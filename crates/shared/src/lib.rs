//! LearnHub Shared Types and Utilities
//!
//! This crate contains types, errors, and utilities shared across the LearnHub
//! billing crates.

#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

pub mod db;
pub mod error;
pub mod types;

pub use db::*;
pub use error::*;
pub use types::*;
