//! Alkymi — incremental computation engine.
//!
//! Describe a DAG of pure-ish tasks ("recipes"), then brew any target: the
//! engine evaluates the minimum necessary, persisting outputs and
//! checksums to disk between runs. Dirtiness is decided by content
//! checksums, never timestamps.

pub mod cache;
pub mod checksum;
pub mod config;
pub mod core;
pub mod error;
pub mod lab;
pub mod recipes;

pub use crate::cache::serialization::OutputHandle;
pub use crate::checksum::fingerprint::FnFingerprint;
pub use crate::config::{AlkymiConfig, FileChecksumMethod};
pub use crate::core::foreach::{foreach, ForeachBuilder};
pub use crate::core::recipe::{recipe, Recipe, RecipeBuilder};
pub use crate::core::scheduler::CancelToken;
pub use crate::core::status::{Status, StatusReport};
pub use crate::core::value::{OpaqueValue, Outputs, Value, ValueKind};
pub use crate::error::{AlkymiError, Result};
pub use crate::lab::Lab;
