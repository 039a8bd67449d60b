//! Progressive streaming of building objects
//!
//! Leaf components are synchronous and usable on their own:
//! binary encoding, differential compression, level-of-detail selection,
//! viewport tracking and the tiered cache. [`StreamingEngine`] composes
//! them behind an async API.

pub mod binary;
pub mod delta;
pub mod budget;
pub mod lod;
pub mod viewport;
pub mod cache;
pub mod loader;
pub mod config;
pub mod engine;

pub use binary::{BinaryBuffer, BinaryConfig, BinaryOptimizer, Compression, ElementType, Encoding};
pub use delta::{
    Compressed, CompressionConfig, CompressionTemplate, Decompressed,
    DifferentialCompressor, ObjectDelta, apply_delta,
};
pub use budget::{BundleBudget, UserRole, role_budget};
pub use lod::{LodConfig, LodLevel, ProgressiveDisclosure, SizeEstimate, LOD_BUDGETS, MAX_LOD};
pub use viewport::{QueryMode, ViewportBounds, ViewportConfig, ViewportManager};
pub use cache::{CacheConfig, CacheStatus, CacheTier, EvictionPolicy, SmartCache};
pub use loader::{LoadRequest, LoadResult, LoaderConfig, ObjectLoader};
pub use config::StreamingConfig;
pub use engine::{ObjectResponse, OptimizationReport, StreamBundle, StreamingEngine, StreamingStats};
