//! Error types for the streaming core

use thiserror::Error;

/// Main error type for the crate
///
/// Only construction-time misconfiguration and explicit API misuse surface
/// as errors. Misses during streaming are reported in result metadata.
#[derive(Debug, Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Unknown eviction policy: {0}")]
    UnknownPolicy(String),

    #[error("The critical cache tier cannot be evicted")]
    CriticalTierEviction,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Spatial query error: {0}")]
    Spatial(String),
}
