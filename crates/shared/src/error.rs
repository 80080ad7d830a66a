//! Error types shared across LearnHub crates

use thiserror::Error;

#[derive(Debug, Error)]
pub enum SharedError {
    #[error("Validation error: {0}")]
    Validation(String),
}
