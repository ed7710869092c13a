//! Marker relevance
//!
//! Decides whether a client should currently see a marker. The scope test is
//! always evaluated first since it is O(1) and rejects most pairs; the spatial
//! test only runs for clients that passed it.

use std::fmt;
use std::sync::Arc;

use glam::Vec3;

use crate::error::PredicateError;
use crate::game::grid::GridIndex;
use crate::net::directory::{ClientId, ClientView, TeamId};

/// Caller-supplied eligibility function
pub type ScopePredicate =
    Arc<dyn Fn(&ClientView) -> Result<bool, PredicateError> + Send + Sync>;

/// Which clients a marker is addressed to
#[derive(Clone, Default)]
pub enum TargetScope {
    /// Every connected client
    #[default]
    Everyone,
    /// One specific client
    SinglePlayer(ClientId),
    /// All members of a team
    Team(TeamId),
    /// Arbitrary gameplay rule
    Predicate(ScopePredicate),
}

impl TargetScope {
    pub fn predicate<F>(f: F) -> Self
    where
        F: Fn(&ClientView) -> Result<bool, PredicateError> + Send + Sync + 'static,
    {
        Self::Predicate(Arc::new(f))
    }

    /// Whether this scope names the client explicitly
    pub fn targets_client(&self, client: ClientId) -> bool {
        matches!(self, Self::SinglePlayer(id) if *id == client)
    }

    /// Whether this scope names the team explicitly
    pub fn targets_team(&self, team: TeamId) -> bool {
        matches!(self, Self::Team(t) if *t == team)
    }

    /// Whether a client moving between these two teams can change the outcome
    pub fn depends_on_team_change(&self, old_team: TeamId, new_team: TeamId) -> bool {
        match self {
            Self::Team(t) => *t == old_team || *t == new_team,
            Self::Predicate(_) => true,
            Self::Everyone | Self::SinglePlayer(_) => false,
        }
    }
}

impl fmt::Debug for TargetScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Everyone => write!(f, "Everyone"),
            Self::SinglePlayer(id) => f.debug_tuple("SinglePlayer").field(id).finish(),
            Self::Team(team) => f.debug_tuple("Team").field(team).finish(),
            Self::Predicate(_) => write!(f, "Predicate(..)"),
        }
    }
}

/// Optional spatial constraints; `None` means unlimited
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct SpatialLimits {
    /// Maximum Euclidean distance between marker and client
    pub distance: Option<f32>,
    /// Maximum grid-cell radius between marker and client
    pub grid_radius: Option<u32>,
}

impl SpatialLimits {
    pub fn unlimited() -> Self {
        Self::default()
    }

    pub fn is_unlimited(&self) -> bool {
        self.distance.is_none() && self.grid_radius.is_none()
    }
}

/// Scope test. Predicates are invoked exactly once per call.
pub fn scope_allows(scope: &TargetScope, client: &ClientView) -> Result<bool, PredicateError> {
    match scope {
        TargetScope::Everyone => Ok(true),
        TargetScope::SinglePlayer(id) => Ok(*id == client.id),
        TargetScope::Team(team) => Ok(*team == client.team),
        TargetScope::Predicate(predicate) => predicate(client),
    }
}

/// Spatial test. Every finite constraint must hold; a client without a known
/// position fails any finite constraint.
pub fn spatial_allows(
    limits: &SpatialLimits,
    marker_position: Vec3,
    client: &ClientView,
    grid: &dyn GridIndex,
) -> bool {
    if limits.is_unlimited() {
        return true;
    }

    let Some(client_position) = client.position else {
        return false;
    };

    // Integer cell math first, it rejects most far-away clients
    if let Some(radius) = limits.grid_radius {
        let marker_cell = grid.cell_of(marker_position);
        let client_cell = grid.cell_of(client_position);
        if !grid.within_radius(marker_cell, client_cell, radius) {
            return false;
        }
    }

    match limits.distance {
        Some(distance) => marker_position.distance_squared(client_position) <= distance * distance,
        None => true,
    }
}

/// Full relevance test: scope, then spatial
pub fn is_relevant(
    scope: &TargetScope,
    limits: &SpatialLimits,
    marker_position: Vec3,
    client: &ClientView,
    grid: &dyn GridIndex,
) -> Result<bool, PredicateError> {
    if !scope_allows(scope, client)? {
        return Ok(false);
    }
    Ok(spatial_allows(limits, marker_position, client, grid))
}
