//! Geometric primitives used for spatial queries

pub mod aabb;

pub use aabb::Aabb;
