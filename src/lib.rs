//! World Icon Server Library
//!
//! This library provides the server side of world icons: short-lived,
//! positioned markers (objectives, pings, loot beacons) that are broadcast to
//! the clients allowed to see them and cleared again when they no longer may.
//!
//! ## Modules
//!
//! - `config` - Server configuration management
//! - `error` - Error types and result definitions
//! - `game` - Icon type catalog, relevance grid and the world host loop
//! - `marker` - Marker instances, relevance rules and the marker registry
//! - `net` - Client directory and icon packet transport

pub mod config;
pub mod error;
pub mod game;
pub mod marker;
pub mod net;
pub mod state;

// Re-export commonly used types
pub use config::ServerConfig;
pub use error::{MarkerError, Result, WorldIconError};
pub use marker::{MarkerId, MarkerInstance, MarkerRegistry};
pub use state::AppState;

/// Server version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
