//! Building objects consumed by the streaming core
//!
//! Objects are produced upstream (geometry extraction, topology reasoning)
//! and reach this crate only through the [`SpatialQuery`] range-query
//! interface.

pub mod spatial_object;
pub mod index;

pub use spatial_object::{Dimensions, Geometry, Metadata, SpatialObject};
pub use index::{InMemorySpatialIndex, SpatialQuery};
