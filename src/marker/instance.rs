//! Marker instance
//!
//! One world icon: where it is, who may see it, and when it last went out.
//! Instances know nothing about the registry; the registry drives them
//! through `resolve_pose`, `compute_subscribers`, `should_refresh` and
//! `is_expired`.

use glam::Vec3;
use rand::Rng;

use crate::error::PredicateError;
use crate::game::catalog::IconTypeInfo;
use crate::game::grid::GridIndex;
use crate::net::directory::{ClientDirectory, ClientView};
use crate::net::transport::{IconBroadcast, Recipients};

use super::flags::MarkerFlags;
use super::position::{OrientationOverride, Pose, PositionSource};
use super::relevance::{self, SpatialLimits, TargetScope};
use super::{IconTypeId, MarkerId};

/// Refresh interval used when the caller does not pick one
pub const DEFAULT_TICK_INTERVAL_SECS: f64 = 1.0;

/// Requested lifetime of a marker
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub enum Lifetime {
    /// Use the icon type's default lifetime (with its jitter)
    #[default]
    TypeDefault,
    /// Never expires
    Unlimited,
    /// Expires this many seconds after the first broadcast
    Seconds(f64),
}

/// Lifecycle state, derived from timing and flags
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MarkerState {
    /// Never broadcast
    Pending,
    /// Broadcast recently, within its interval
    Active,
    /// Interval elapsed, waiting for its group's next refresh
    Stale,
    /// Expired or dead, will be swept
    Retired,
}

/// A single world icon
#[derive(Debug)]
pub struct MarkerInstance {
    pub(crate) id: MarkerId,
    type_id: IconTypeId,
    source: PositionSource,
    offset: Vec3,
    scope: TargetScope,
    limits: SpatialLimits,
    tick_interval: f64,
    lifetime: Lifetime,
    /// Resolved lifetime in seconds, `None` for unlimited
    ttl: Option<f64>,
    payload: Option<OrientationOverride>,
    flags: MarkerFlags,
    last_broadcast: Option<f64>,
    last_position_update: Option<f64>,
    first_broadcast: Option<f64>,
    last_pose: Option<Pose>,
    /// Recipients of the last broadcast or clear for this instance
    pub(crate) previous_subscribers: Recipients,
}

impl MarkerInstance {
    pub fn new(type_id: impl Into<IconTypeId>, source: PositionSource) -> Self {
        Self {
            id: MarkerId::UNASSIGNED,
            type_id: type_id.into(),
            source,
            offset: Vec3::ZERO,
            scope: TargetScope::Everyone,
            limits: SpatialLimits::unlimited(),
            tick_interval: DEFAULT_TICK_INTERVAL_SECS,
            lifetime: Lifetime::TypeDefault,
            ttl: None,
            payload: None,
            flags: MarkerFlags::default(),
            last_broadcast: None,
            last_position_update: None,
            first_broadcast: None,
            last_pose: None,
            previous_subscribers: Recipients::new(),
        }
    }

    /// Fixed marker at a point
    pub fn at(type_id: impl Into<IconTypeId>, position: Vec3) -> Self {
        Self::new(type_id, PositionSource::fixed(position))
    }

    pub fn with_offset(mut self, offset: Vec3) -> Self {
        self.offset = offset;
        self
    }

    pub fn with_full_orientation(mut self, enabled: bool) -> Self {
        self.flags.set(MarkerFlags::FULL_ORIENTATION, enabled);
        self
    }

    pub fn with_scope(mut self, scope: TargetScope) -> Self {
        self.scope = scope;
        self
    }

    pub fn with_relevance_distance(mut self, distance: f32) -> Self {
        self.limits.distance = Some(distance);
        self
    }

    pub fn with_grid_radius(mut self, radius: u32) -> Self {
        self.limits.grid_radius = Some(radius);
        self
    }

    pub fn with_tick_interval(mut self, seconds: f64) -> Self {
        self.tick_interval = seconds.max(0.0);
        self
    }

    pub fn with_lifetime(mut self, lifetime: Lifetime) -> Self {
        self.lifetime = lifetime;
        self
    }

    pub fn with_ttl(self, seconds: f64) -> Self {
        self.with_lifetime(Lifetime::Seconds(seconds))
    }

    pub fn with_reliable(mut self, reliable: bool) -> Self {
        self.flags.set(MarkerFlags::RELIABLE, reliable);
        self
    }

    pub fn with_payload(mut self, payload: OrientationOverride) -> Self {
        self.payload = Some(payload);
        self
    }

    pub fn with_visible(mut self, visible: bool) -> Self {
        self.flags.set(MarkerFlags::VISIBLE, visible);
        self
    }

    pub fn id(&self) -> MarkerId {
        self.id
    }

    pub fn type_id(&self) -> &IconTypeId {
        &self.type_id
    }

    pub fn scope(&self) -> &TargetScope {
        &self.scope
    }

    pub fn limits(&self) -> &SpatialLimits {
        &self.limits
    }

    pub fn tick_interval(&self) -> f64 {
        self.tick_interval
    }

    pub fn lifetime(&self) -> Lifetime {
        self.lifetime
    }

    /// Resolved lifetime in seconds (`None` = unlimited)
    pub fn ttl(&self) -> Option<f64> {
        self.ttl
    }

    pub fn flags(&self) -> MarkerFlags {
        self.flags
    }

    pub fn is_visible(&self) -> bool {
        self.flags.is_visible()
    }

    /// Hidden markers stay indexed; their clients are cleared on the next
    /// group refresh.
    pub fn set_visible(&mut self, visible: bool) {
        self.flags.set(MarkerFlags::VISIBLE, visible);
    }

    pub fn is_alive(&self) -> bool {
        self.flags.is_alive()
    }

    /// Mark for removal on the next scan
    pub fn kill(&mut self) {
        self.flags.remove(MarkerFlags::ALIVE);
    }

    pub fn payload(&self) -> Option<&OrientationOverride> {
        self.payload.as_ref()
    }

    pub fn set_payload(&mut self, payload: Option<OrientationOverride>) {
        self.payload = payload;
    }

    pub fn set_offset(&mut self, offset: Vec3) {
        self.offset = offset;
    }

    pub fn set_scope(&mut self, scope: TargetScope) {
        self.scope = scope;
    }

    pub fn last_broadcast(&self) -> Option<f64> {
        self.last_broadcast
    }

    pub fn first_broadcast(&self) -> Option<f64> {
        self.first_broadcast
    }

    pub fn last_position_update(&self) -> Option<f64> {
        self.last_position_update
    }

    pub fn last_pose(&self) -> Option<Pose> {
        self.last_pose
    }

    pub fn previous_subscribers(&self) -> &Recipients {
        &self.previous_subscribers
    }

    /// Offset-adjusted world pose.
    ///
    /// A source that no longer resolves kills the marker.
    pub fn resolve_pose(&mut self) -> Option<Pose> {
        if !self.is_alive() {
            return None;
        }
        match self.source.try_resolve() {
            Some(base) => Some(self.apply_offset(base)),
            None => {
                self.kill();
                None
            }
        }
    }

    fn apply_offset(&self, base: Pose) -> Pose {
        let rotation = if self.flags.full_orientation() {
            base.rotation
        } else {
            base.yaw()
        };
        Pose {
            position: base.position + rotation * self.offset,
            rotation,
        }
    }

    /// Scope test, then spatial test against the given marker pose
    pub fn is_eligible(
        &self,
        client: &ClientView,
        pose: &Pose,
        grid: &dyn GridIndex,
    ) -> Result<bool, PredicateError> {
        relevance::is_relevant(&self.scope, &self.limits, pose.position, client, grid)
    }

    /// Fill `scratch` with the channels that should receive this marker now.
    ///
    /// `scratch` is cleared first. On a predicate error its content is
    /// unspecified.
    pub fn compute_subscribers(
        &self,
        pose: &Pose,
        directory: &dyn ClientDirectory,
        grid: &dyn GridIndex,
        scratch: &mut Recipients,
    ) -> Result<(), PredicateError> {
        scratch.clear();
        if !self.is_visible() {
            return Ok(());
        }

        match &self.scope {
            TargetScope::SinglePlayer(id) => {
                if let Some(client) = directory.client(*id) {
                    if relevance::spatial_allows(&self.limits, pose.position, &client, grid) {
                        scratch.insert(client.channel);
                    }
                }
                Ok(())
            }
            TargetScope::Everyone if self.limits.is_unlimited() => {
                directory.for_each_client(&mut |client| {
                    scratch.insert(client.channel);
                });
                Ok(())
            }
            _ => {
                let mut failure = None;
                directory.for_each_client(&mut |client| {
                    if failure.is_some() {
                        return;
                    }
                    match self.is_eligible(client, pose, grid) {
                        Ok(true) => {
                            scratch.insert(client.channel);
                        }
                        Ok(false) => {}
                        Err(e) => failure = Some(e),
                    }
                });
                match failure {
                    Some(e) => Err(e),
                    None => Ok(()),
                }
            }
        }
    }

    /// Whether the refresh interval has elapsed, give or take `tolerance`
    pub fn should_refresh(&self, now: f64, tolerance: f64) -> bool {
        match self.last_broadcast {
            None => true,
            Some(last) => now - last >= self.tick_interval - tolerance,
        }
    }

    /// Lifetime exceeded, or killed
    pub fn is_expired(&self, now: f64) -> bool {
        if !self.is_alive() {
            return true;
        }
        match (self.ttl, self.first_broadcast) {
            (Some(ttl), Some(first)) => now - first > ttl,
            _ => false,
        }
    }

    pub fn state(&self, now: f64, tolerance: f64) -> MarkerState {
        if self.is_expired(now) {
            MarkerState::Retired
        } else if self.last_broadcast.is_none() {
            MarkerState::Pending
        } else if self.should_refresh(now, tolerance) {
            MarkerState::Stale
        } else {
            MarkerState::Active
        }
    }

    /// Fix the lifetime against the icon type's defaults
    pub(crate) fn resolve_lifetime<R: Rng>(&mut self, info: &IconTypeInfo, rng: &mut R) {
        self.ttl = match self.lifetime {
            Lifetime::TypeDefault => info.roll_lifetime(rng),
            Lifetime::Unlimited => None,
            Lifetime::Seconds(seconds) => Some(seconds.max(0.0)),
        };
    }

    pub(crate) fn record_broadcast(&mut self, now: f64, pose: Pose) {
        self.last_broadcast = Some(now);
        self.last_position_update = Some(now);
        self.first_broadcast.get_or_insert(now);
        self.last_pose = Some(pose);
    }

    pub(crate) fn broadcast_for(&self, pose: &Pose) -> IconBroadcast {
        IconBroadcast {
            type_id: self.type_id.clone(),
            marker: self.id,
            position: pose.position,
            rotation: pose.rotation,
            payload: self.payload,
            reliable: self.flags.is_reliable(),
        }
    }

    pub(crate) fn take_subscribers(&mut self) -> Recipients {
        std::mem::take(&mut self.previous_subscribers)
    }
}
