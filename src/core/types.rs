//! Core type aliases and re-exports

pub use glam::DVec3;

/// Standard Result type for the crate
pub type Result<T> = std::result::Result<T, crate::core::error::Error>;

/// Canonical property-map form of an object (sorted keys).
pub type PropertyMap = serde_json::Map<String, serde_json::Value>;
