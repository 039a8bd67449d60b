//! Bimstream - viewport-driven progressive streaming of building objects

pub mod core;
pub mod math;
pub mod object;
pub mod streaming;
