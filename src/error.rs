//! AK-005: Error taxonomy for the evaluation engine.
//!
//! Exactly one error surfaces per brew (the first observed). Cache writes are
//! atomic and only attempted after a bound function succeeds, so no error
//! path leaves a half-written `meta.json` behind.

use std::path::PathBuf;
use thiserror::Error;

/// Result type alias used throughout the crate.
pub type Result<T> = std::result::Result<T, AlkymiError>;

/// All errors that can surface from the engine.
#[derive(Error, Debug)]
pub enum AlkymiError {
    /// A bound function returned an error or panicked.
    #[error("recipe '{recipe}' failed: {message}")]
    UserCode { recipe: String, message: String },

    /// Unreadable or schema-violating cache metadata. Handled locally by
    /// treating the recipe as not evaluated; only surfaced when a store
    /// operation itself cannot proceed.
    #[error("corrupt cache entry at {path}: {reason}")]
    CacheCorruption { path: PathBuf, reason: String },

    /// A value could not be serialized or deserialized.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// A checksum could not be computed (e.g. a referenced file vanished
    /// mid-hash, or an opaque value with the opaque fallback disabled).
    #[error("checksum error: {0}")]
    Checksum(String),

    /// The brew was interrupted before completion.
    #[error("brew cancelled")]
    Cancelled,
}

impl AlkymiError {
    /// Build a user-code error for a recipe.
    pub fn user_code(recipe: &str, message: impl Into<String>) -> Self {
        Self::UserCode {
            recipe: recipe.to_string(),
            message: message.into(),
        }
    }
}
