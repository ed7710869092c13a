//! Marker position sources
//!
//! A marker is either pinned to a fixed pose or follows something owned
//! elsewhere in the simulation. Followed objects can disappear at any time, so
//! resolution is always fallible.

use std::fmt;
use std::sync::{Arc, Weak};

use glam::{EulerRot, Quat, Vec3};
use parking_lot::RwLock;

/// World-space position and orientation
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Pose {
    pub position: Vec3,
    pub rotation: Quat,
}

impl Default for Pose {
    fn default() -> Self {
        Self::IDENTITY
    }
}

impl Pose {
    pub const IDENTITY: Pose = Pose {
        position: Vec3::ZERO,
        rotation: Quat::IDENTITY,
    };

    pub fn new(position: Vec3, rotation: Quat) -> Self {
        Self { position, rotation }
    }

    /// Unrotated pose at a position
    pub fn at(position: Vec3) -> Self {
        Self {
            position,
            rotation: Quat::IDENTITY,
        }
    }

    /// Rotation about the vertical (Y) axis only
    pub fn yaw(&self) -> Quat {
        let (yaw, _, _) = self.rotation.to_euler(EulerRot::YXZ);
        Quat::from_rotation_y(yaw)
    }
}

/// Shared, externally owned transform a marker can follow.
///
/// Markers only keep a weak reference; dropping the last strong handle kills
/// every marker attached to it.
pub type TransformHandle = Arc<RwLock<Pose>>;

/// A live simulation object (actor, vehicle, projectile...) a marker can follow
pub trait WorldObject: Send + Sync {
    /// Current pose, or `None` once the object has been despawned
    fn pose(&self) -> Option<Pose>;
}

/// Where a marker takes its base pose from
#[derive(Clone)]
pub enum PositionSource {
    /// A fixed point in the world
    Fixed(Pose),
    /// Follows a transform owned by gameplay code
    Transform(Weak<RwLock<Pose>>),
    /// Follows a dynamic world object
    Object(Weak<dyn WorldObject>),
}

impl PositionSource {
    /// Fixed, unrotated point
    pub fn fixed(position: Vec3) -> Self {
        Self::Fixed(Pose::at(position))
    }

    pub fn transform(handle: &TransformHandle) -> Self {
        Self::Transform(Arc::downgrade(handle))
    }

    pub fn object<T: WorldObject + 'static>(object: &Arc<T>) -> Self {
        let weak: Weak<dyn WorldObject> = Arc::downgrade(object) as Weak<dyn WorldObject>;
        Self::Object(weak)
    }

    /// Resolve the current base pose.
    ///
    /// Returns `None` when the backing transform or object no longer exists.
    pub fn try_resolve(&self) -> Option<Pose> {
        match self {
            Self::Fixed(pose) => Some(*pose),
            Self::Transform(weak) => weak.upgrade().map(|handle| *handle.read()),
            Self::Object(weak) => weak.upgrade().and_then(|object| object.pose()),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Fixed(_) => "fixed",
            Self::Transform(_) => "transform",
            Self::Object(_) => "object",
        }
    }
}

impl fmt::Debug for PositionSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Fixed(pose) => f.debug_tuple("Fixed").field(pose).finish(),
            Self::Transform(weak) => f
                .debug_struct("Transform")
                .field("live", &(weak.strong_count() > 0))
                .finish(),
            Self::Object(weak) => f
                .debug_struct("Object")
                .field("live", &(weak.strong_count() > 0))
                .finish(),
        }
    }
}

/// Optional orientation data sent alongside a marker.
///
/// Rotation, scale and tint are independent fields on the wire; a client that
/// renders billboards can ignore the rotation entirely.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct OrientationOverride {
    pub rotation: Option<Quat>,
    pub scale: f32,
    pub tint: Option<[u8; 4]>,
}

impl Default for OrientationOverride {
    fn default() -> Self {
        Self {
            rotation: None,
            scale: 1.0,
            tint: None,
        }
    }
}

impl OrientationOverride {
    pub fn with_rotation(mut self, rotation: Quat) -> Self {
        self.rotation = Some(rotation);
        self
    }

    pub fn with_scale(mut self, scale: f32) -> Self {
        self.scale = scale;
        self
    }

    pub fn with_tint(mut self, rgba: [u8; 4]) -> Self {
        self.tint = Some(rgba);
        self
    }
}
