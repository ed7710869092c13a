//! World icon markers
//!
//! Ephemeral, positioned visuals pushed from the server to clients:
//! - `instance` - one marker, its position source, targeting and timing
//! - `relevance` - scope and spatial eligibility tests
//! - `registry` - type-grouped index, refresh loop and per-client corrections
//! - `position` - fallible position sources and poses
//!
//! Clients can only clear markers by type, never a single instance, so every
//! refresh happens per type group: clear the union of the group's previous
//! recipients, then respawn each surviving member.

pub mod flags;
pub mod instance;
mod pool;
pub mod position;
pub mod registry;
pub mod relevance;

use std::fmt;
use std::sync::Arc;

pub use flags::MarkerFlags;
pub use instance::{Lifetime, MarkerInstance, MarkerState, DEFAULT_TICK_INTERVAL_SECS};
pub use pool::SimThread;
pub use position::{OrientationOverride, Pose, PositionSource, TransformHandle, WorldObject};
pub use registry::{
    MarkerRegistry, RegistryCommand, RegistryHandle, RegistryServices, RegistrySettings,
    RegistryStats, TickSummary,
};
pub use relevance::{ScopePredicate, SpatialLimits, TargetScope};

/// Unique identifier for a marker instance, assigned by the registry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct MarkerId(pub u64);

impl MarkerId {
    /// Id carried by instances that have not been through `create_marker` yet
    pub const UNASSIGNED: MarkerId = MarkerId(0);

    pub fn is_assigned(&self) -> bool {
        self.0 != 0
    }
}

impl fmt::Display for MarkerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Identifier of a client-side icon visual.
///
/// Every marker with the same type id occupies the same client "slot", and a
/// clear always wipes all of them at once.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct IconTypeId(Arc<str>);

impl IconTypeId {
    pub fn new(name: impl AsRef<str>) -> Self {
        Self(Arc::from(name.as_ref()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for IconTypeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for IconTypeId {
    fn from(name: &str) -> Self {
        Self::new(name)
    }
}

impl From<String> for IconTypeId {
    fn from(name: String) -> Self {
        Self(Arc::from(name))
    }
}
