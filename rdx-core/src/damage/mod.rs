//! Damage tracking: rectangles and the per-window batcher.

pub mod batcher;
pub mod rect;

pub use batcher::{DamageBatcher, DamageRegion, RegionBatch, should_merge};
pub use rect::Rect;
