//! Game module
//!
//! World-side services the marker registry depends on:
//! - Icon type catalog (per-type lifetime defaults)
//! - Spatial grid used for coarse relevance checks
//! - The icon world host loop

pub mod catalog;
pub mod grid;
pub mod world;
