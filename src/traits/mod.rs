//! Trait definitions for swappable infrastructure.

pub mod cache;

pub use cache::{Cache, CacheExt};
