//! Marker registry
//!
//! Owns every live marker, grouped by icon type. Clients can only wipe a whole
//! type at once, so all refresh work is done per group:
//! 1. clear the union of the group's previous recipients
//! 2. respawn every surviving member to its current recipients
//! 3. sweep members that expired or lost their position source
//!
//! The registry is owned by the simulation loop and mutated through
//! `&mut self` only. Other threads talk to it through a `RegistryHandle`;
//! queued commands are applied at the start of every `tick`.

use std::collections::HashMap;
use std::mem;
use std::sync::Arc;
use std::time::Duration;

use rand::rngs::StdRng;
use rand::SeedableRng;
use tokio::sync::mpsc;
use tracing::{debug, info, trace, warn};

use crate::error::MarkerError;
use crate::game::catalog::IconTypeRegistry;
use crate::game::grid::GridIndex;
use crate::net::directory::{ClientDirectory, ClientId, ClientView, TeamId};
use crate::net::transport::{IconTransport, Recipients};

use super::instance::{MarkerInstance, DEFAULT_TICK_INTERVAL_SECS};
use super::pool::{SimThread, SubscriberPool};
use super::{IconTypeId, MarkerId};

/// Default slack when comparing elapsed time against refresh intervals
pub const DEFAULT_REFRESH_TOLERANCE_SECS: f64 = 0.01;

/// Registry tuning
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RegistrySettings {
    /// Interval bounds reported while no marker exists
    pub default_interval: f64,
    /// Slack applied to `should_refresh`
    pub refresh_tolerance: f64,
}

impl Default for RegistrySettings {
    fn default() -> Self {
        Self {
            default_interval: DEFAULT_TICK_INTERVAL_SECS,
            refresh_tolerance: DEFAULT_REFRESH_TOLERANCE_SECS,
        }
    }
}

impl RegistrySettings {
    pub fn with_default_interval(mut self, seconds: f64) -> Self {
        self.default_interval = seconds;
        self
    }

    pub fn with_refresh_tolerance(mut self, seconds: f64) -> Self {
        self.refresh_tolerance = seconds;
        self
    }
}

/// Collaborators the registry reads from and writes to
#[derive(Clone)]
pub struct RegistryServices {
    pub clients: Arc<dyn ClientDirectory>,
    pub types: Arc<dyn IconTypeRegistry>,
    pub grid: Arc<dyn GridIndex>,
    pub transport: Arc<dyn IconTransport>,
}

impl RegistryServices {
    pub fn new(
        clients: Arc<dyn ClientDirectory>,
        types: Arc<dyn IconTypeRegistry>,
        grid: Arc<dyn GridIndex>,
        transport: Arc<dyn IconTransport>,
    ) -> Self {
        Self {
            clients,
            types,
            grid,
            transport,
        }
    }
}

/// Work queued from outside the simulation thread
#[derive(Debug)]
pub enum RegistryCommand {
    /// Index a new marker; rejections are logged on the simulation thread
    Create(Box<MarkerInstance>),
    Remove(MarkerId),
    RemoveAll,
    RefreshGroup(IconTypeId),
    SetVisible { marker: MarkerId, visible: bool },
}

/// Cloneable, thread-safe entry point into a registry
#[derive(Debug, Clone)]
pub struct RegistryHandle {
    tx: mpsc::UnboundedSender<RegistryCommand>,
}

impl RegistryHandle {
    /// Queue a command. Returns `false` once the registry is gone.
    pub fn send(&self, command: RegistryCommand) -> bool {
        self.tx.send(command).is_ok()
    }

    /// Queue a marker for creation. The id is assigned when the command is
    /// applied and is not reported back.
    pub fn create_marker(&self, instance: MarkerInstance) -> bool {
        self.send(RegistryCommand::Create(Box::new(instance)))
    }

    pub fn remove_marker(&self, id: MarkerId) -> bool {
        self.send(RegistryCommand::Remove(id))
    }

    pub fn remove_all_markers(&self) -> bool {
        self.send(RegistryCommand::RemoveAll)
    }

    pub fn refresh_marker_group(&self, type_id: impl Into<IconTypeId>) -> bool {
        self.send(RegistryCommand::RefreshGroup(type_id.into()))
    }

    pub fn set_visible(&self, marker: MarkerId, visible: bool) -> bool {
        self.send(RegistryCommand::SetVisible { marker, visible })
    }
}

/// What a tick (or an on-demand refresh) did
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TickSummary {
    pub commands: usize,
    pub groups_refreshed: usize,
    pub broadcasts: usize,
    pub clears: usize,
    pub swept: usize,
}

impl std::ops::AddAssign for TickSummary {
    fn add_assign(&mut self, other: Self) {
        self.commands += other.commands;
        self.groups_refreshed += other.groups_refreshed;
        self.broadcasts += other.broadcasts;
        self.clears += other.clears;
        self.swept += other.swept;
    }
}

/// Point-in-time registry statistics
#[derive(Debug, Clone, PartialEq)]
pub struct RegistryStats {
    pub markers: usize,
    pub groups: usize,
    pub visible: usize,
    pub hidden: usize,
    /// Member count per icon type, sorted by type id
    pub per_group: Vec<(IconTypeId, usize)>,
    pub min_interval: f64,
    pub max_interval: f64,
    pub pooled_sets: usize,
    /// Sets returned off the simulation thread, waiting for the next tick
    pub deferred_sets: usize,
}

/// All markers sharing one icon type
#[derive(Debug, Default)]
struct MarkerGroup {
    members: Vec<MarkerInstance>,
}

impl MarkerGroup {
    fn is_due(&self, now: f64, tolerance: f64) -> bool {
        self.members
            .iter()
            .any(|m| m.should_refresh(now, tolerance) || m.is_expired(now))
    }

    fn position_of(&self, id: MarkerId) -> Option<usize> {
        self.members.iter().position(|m| m.id == id)
    }
}

/// Type-grouped marker index and broadcast scheduler
pub struct MarkerRegistry {
    settings: RegistrySettings,
    services: RegistryServices,
    groups: HashMap<IconTypeId, MarkerGroup>,
    locator: HashMap<MarkerId, IconTypeId>,
    next_id: u64,
    running_min_interval: f64,
    running_max_interval: f64,
    pool: SubscriberPool,
    /// Reused per-recipient scratch set
    scratch: Recipients,
    /// Reused union of a group's previous recipients
    clear_union: Recipients,
    /// Reused list of groups due this tick
    due: Vec<IconTypeId>,
    commands_tx: mpsc::UnboundedSender<RegistryCommand>,
    commands_rx: mpsc::UnboundedReceiver<RegistryCommand>,
    rng: StdRng,
    sim: SimThread,
}

impl MarkerRegistry {
    pub fn new(settings: RegistrySettings, services: RegistryServices) -> Self {
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        info!(
            default_interval = settings.default_interval,
            refresh_tolerance = settings.refresh_tolerance,
            "Marker registry created"
        );
        Self {
            settings,
            services,
            groups: HashMap::new(),
            locator: HashMap::new(),
            next_id: 1,
            running_min_interval: settings.default_interval,
            running_max_interval: settings.default_interval,
            pool: SubscriberPool::default(),
            scratch: Recipients::new(),
            clear_union: Recipients::new(),
            due: Vec::new(),
            commands_tx,
            commands_rx,
            rng: StdRng::from_entropy(),
            sim: SimThread::current(),
        }
    }

    /// Seed lifetime jitter for reproducible runs
    pub fn with_rng_seed(mut self, seed: u64) -> Self {
        self.rng = StdRng::seed_from_u64(seed);
        self
    }

    /// Make the calling thread the owning simulation thread
    pub fn bind_to_current_thread(&mut self) {
        self.sim.rebind();
    }

    pub fn handle(&self) -> RegistryHandle {
        RegistryHandle {
            tx: self.commands_tx.clone(),
        }
    }

    pub fn settings(&self) -> &RegistrySettings {
        &self.settings
    }

    pub fn len(&self) -> usize {
        self.locator.len()
    }

    pub fn is_empty(&self) -> bool {
        self.locator.is_empty()
    }

    pub fn running_min_interval(&self) -> f64 {
        self.running_min_interval
    }

    pub fn running_max_interval(&self) -> f64 {
        self.running_max_interval
    }

    /// How long the host should wait before the next `tick`
    pub fn next_tick_delay(&self) -> Duration {
        Duration::try_from_secs_f64(self.running_min_interval.max(0.0)).unwrap_or(Duration::MAX)
    }

    pub fn marker(&self, id: MarkerId) -> Option<&MarkerInstance> {
        let type_id = self.locator.get(&id)?;
        self.groups
            .get(type_id)?
            .members
            .iter()
            .find(|m| m.id == id)
    }

    /// Mutable access for gameplay tweaks (scope, payload, offset, visibility).
    /// Changes go out with the group's next refresh.
    pub fn marker_mut(&mut self, id: MarkerId) -> Option<&mut MarkerInstance> {
        let type_id = self.locator.get(&id)?;
        self.groups
            .get_mut(type_id)?
            .members
            .iter_mut()
            .find(|m| m.id == id)
    }

    pub fn set_visible(&mut self, id: MarkerId, visible: bool) -> bool {
        match self.marker_mut(id) {
            Some(marker) => {
                marker.set_visible(visible);
                true
            }
            None => false,
        }
    }

    /// Index a new marker and send its first broadcast
    pub fn create_marker(
        &mut self,
        mut instance: MarkerInstance,
        now: f64,
    ) -> Result<MarkerId, MarkerError> {
        let type_id = instance.type_id().clone();
        let Some(info) = self.services.types.lookup(&type_id) else {
            warn!(type_id = %type_id, "Rejected marker with unknown icon type");
            return Err(MarkerError::UnknownType(type_id));
        };

        let Some(pose) = instance.resolve_pose() else {
            warn!(type_id = %type_id, "Rejected marker with dead position source");
            return Err(MarkerError::DeadOnArrival(type_id));
        };

        instance.resolve_lifetime(&info, &mut self.rng);
        let id = MarkerId(self.next_id);
        self.next_id += 1;
        instance.id = id;

        let mut subscribers = self.pool.acquire();
        if let Err(source) = instance.compute_subscribers(
            &pose,
            self.services.clients.as_ref(),
            self.services.grid.as_ref(),
            &mut subscribers,
        ) {
            Self::release_set(&mut self.pool, &self.sim, subscribers);
            warn!(marker_id = id.0, type_id = %type_id, error = %source, "Rejected marker with failing scope predicate");
            return Err(MarkerError::Predicate { marker: id, source });
        }

        if !subscribers.is_empty() {
            self.services
                .transport
                .broadcast(&instance.broadcast_for(&pose), &subscribers);
        }
        instance.record_broadcast(now, pose);
        instance.previous_subscribers = subscribers;

        let interval = instance.tick_interval();
        debug!(
            marker_id = id.0,
            type_id = %type_id,
            interval = interval,
            ttl = ?instance.ttl(),
            subscribers = instance.previous_subscribers.len(),
            "Marker created"
        );

        self.include_interval(interval);
        self.locator.insert(id, type_id.clone());
        self.groups.entry(type_id).or_default().members.push(instance);
        Ok(id)
    }

    /// Remove a marker and clear it from everyone who saw it.
    ///
    /// Returns `false` for unknown or already removed ids.
    pub fn remove_marker(&mut self, id: MarkerId) -> bool {
        let Some(type_id) = self.locator.remove(&id) else {
            return false;
        };
        let Some(group) = self.groups.get_mut(&type_id) else {
            return false;
        };
        let Some(index) = group.position_of(id) else {
            return false;
        };

        let mut removed = group.members.remove(index);
        let cleared = removed.take_subscribers();

        if !cleared.is_empty() {
            let transport = self.services.transport.as_ref();
            transport.clear(&type_id, &cleared);

            // The clear wiped every visual of this type for those clients;
            // put back the siblings they were still seeing.
            for sibling in &group.members {
                if !sibling.is_alive() || !sibling.is_visible() {
                    continue;
                }
                let Some(pose) = sibling.last_pose() else {
                    continue;
                };
                self.scratch.clear();
                self.scratch
                    .extend(sibling.previous_subscribers.intersection(&cleared));
                if !self.scratch.is_empty() {
                    transport.broadcast(&sibling.broadcast_for(&pose), &self.scratch);
                }
            }
        }

        if group.members.is_empty() {
            self.groups.remove(&type_id);
        }
        Self::release_set(&mut self.pool, &self.sim, cleared);

        debug!(marker_id = id.0, type_id = %type_id, "Marker removed");
        self.exclude_interval(removed.tick_interval());
        true
    }

    /// Clear and drop every marker
    pub fn remove_all_markers(&mut self) -> usize {
        let removed = self.locator.len();
        let transport = self.services.transport.as_ref();

        for (type_id, group) in self.groups.drain() {
            self.clear_union.clear();
            for mut member in group.members {
                let subscribers = member.take_subscribers();
                self.clear_union.extend(subscribers.iter().copied());
                Self::release_set(&mut self.pool, &self.sim, subscribers);
            }
            if !self.clear_union.is_empty() {
                transport.clear(&type_id, &self.clear_union);
            }
        }

        self.locator.clear();
        self.running_min_interval = self.settings.default_interval;
        self.running_max_interval = self.settings.default_interval;
        info!(removed = removed, "All markers removed");
        removed
    }

    /// Periodic pass: apply queued commands, then refresh every due group.
    ///
    /// A failing scope predicate never stops the pass; the offending marker
    /// is swept and the first error is returned once the pass is complete.
    pub fn tick(&mut self, now: f64) -> Result<TickSummary, MarkerError> {
        let mut summary = TickSummary::default();
        self.tick_into(now, &mut summary)?;
        Ok(summary)
    }

    /// Same pass as `tick`, adding its work to `summary`. The counts stay
    /// accurate when an error is returned.
    pub fn tick_into(&mut self, now: f64, summary: &mut TickSummary) -> Result<(), MarkerError> {
        let mut first_error = None;

        if self.sim.is_current() {
            let reclaimed = self.pool.reclaim_deferred();
            if reclaimed > 0 {
                trace!(reclaimed = reclaimed, "Reclaimed deferred subscriber sets");
            }
        }

        while let Ok(command) = self.commands_rx.try_recv() {
            summary.commands += 1;
            if let Err(e) = self.apply_command(command, now, summary) {
                first_error.get_or_insert(e);
            }
        }

        let tolerance = self.settings.refresh_tolerance;
        let mut due = mem::take(&mut self.due);
        due.clear();
        due.extend(
            self.groups
                .iter()
                .filter(|(_, group)| group.is_due(now, tolerance))
                .map(|(type_id, _)| type_id.clone()),
        );

        for type_id in &due {
            if let Err(e) = self.refresh_group(type_id, now, summary) {
                first_error.get_or_insert(e);
            }
        }
        due.clear();
        self.due = due;

        if summary.groups_refreshed > 0 || summary.commands > 0 {
            trace!(
                now = now,
                groups = summary.groups_refreshed,
                broadcasts = summary.broadcasts,
                clears = summary.clears,
                swept = summary.swept,
                "Marker tick"
            );
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Refresh one group right now, whether or not it is due
    pub fn refresh_marker_group(
        &mut self,
        type_id: &IconTypeId,
        now: f64,
    ) -> Result<TickSummary, MarkerError> {
        let mut summary = TickSummary::default();
        self.refresh_group(type_id, now, &mut summary)?;
        Ok(summary)
    }

    /// Send a newly connected client every marker it is eligible for.
    ///
    /// Returns how many markers were sent.
    pub fn on_client_connected(&mut self, client_id: ClientId) -> Result<usize, MarkerError> {
        let Some(client) = self.services.clients.client(client_id) else {
            return Ok(0);
        };
        let transport = self.services.transport.as_ref();
        let grid = self.services.grid.as_ref();

        self.scratch.clear();
        self.scratch.insert(client.channel);

        let mut sent = 0;
        let mut first_error = None;
        for group in self.groups.values_mut() {
            for member in group.members.iter_mut() {
                if !member.is_visible() || member.previous_subscribers.contains(&client.channel) {
                    continue;
                }
                let Some(pose) = member.resolve_pose() else {
                    continue;
                };
                match member.is_eligible(&client, &pose, grid) {
                    Ok(true) => {
                        transport.broadcast(&member.broadcast_for(&pose), &self.scratch);
                        member.previous_subscribers.insert(client.channel);
                        sent += 1;
                    }
                    Ok(false) => {}
                    Err(source) => {
                        member.kill();
                        first_error.get_or_insert(MarkerError::Predicate {
                            marker: member.id,
                            source,
                        });
                    }
                }
            }
        }

        debug!(client_id = client_id, markers = sent, "Markers sent to new client");
        match first_error {
            Some(e) => Err(e),
            None => Ok(sent),
        }
    }

    /// Forget a departed client.
    ///
    /// Returns how many private clears were issued.
    pub fn on_client_disconnected(&mut self, client: &ClientView) -> usize {
        let transport = self.services.transport.as_ref();
        self.scratch.clear();
        self.scratch.insert(client.channel);

        let mut clears = 0;
        for (type_id, group) in self.groups.iter_mut() {
            let mut targeted = false;
            for member in group.members.iter_mut() {
                member.previous_subscribers.remove(&client.channel);
                targeted |= member.scope().targets_client(client.id)
                    || member.scope().targets_team(client.team);
            }
            if targeted {
                transport.clear(type_id, &self.scratch);
                clears += 1;
            }
        }

        debug!(client_id = client.id, clears = clears, "Client removed from markers");
        clears
    }

    /// Re-evaluate team-dependent groups for a client that switched teams.
    ///
    /// Groups whose members cannot be affected by the move are left alone so
    /// the client never sees a duplicate. Returns how many markers were sent.
    pub fn on_client_team_changed(
        &mut self,
        client_id: ClientId,
        old_team: TeamId,
    ) -> Result<usize, MarkerError> {
        let Some(client) = self.services.clients.client(client_id) else {
            return Ok(0);
        };
        let new_team = client.team;
        let transport = self.services.transport.as_ref();
        let grid = self.services.grid.as_ref();

        self.scratch.clear();
        self.scratch.insert(client.channel);

        let mut sent = 0;
        let mut first_error = None;
        for (type_id, group) in self.groups.iter_mut() {
            let affected = group
                .members
                .iter()
                .any(|m| m.scope().depends_on_team_change(old_team, new_team));
            if !affected {
                continue;
            }

            let seeing = group
                .members
                .iter()
                .any(|m| m.previous_subscribers.contains(&client.channel));
            if seeing {
                transport.clear(type_id, &self.scratch);
                for member in group.members.iter_mut() {
                    member.previous_subscribers.remove(&client.channel);
                }
            }

            for member in group.members.iter_mut() {
                if !member.is_visible() {
                    continue;
                }
                let Some(pose) = member.resolve_pose() else {
                    continue;
                };
                match member.is_eligible(&client, &pose, grid) {
                    Ok(true) => {
                        transport.broadcast(&member.broadcast_for(&pose), &self.scratch);
                        member.previous_subscribers.insert(client.channel);
                        sent += 1;
                    }
                    Ok(false) => {}
                    Err(source) => {
                        member.kill();
                        first_error.get_or_insert(MarkerError::Predicate {
                            marker: member.id,
                            source,
                        });
                    }
                }
            }
        }

        debug!(
            client_id = client_id,
            old_team = old_team,
            new_team = new_team,
            markers = sent,
            "Markers re-evaluated after team change"
        );
        match first_error {
            Some(e) => Err(e),
            None => Ok(sent),
        }
    }

    pub fn stats(&self) -> RegistryStats {
        let mut per_group: Vec<(IconTypeId, usize)> = self
            .groups
            .iter()
            .map(|(type_id, group)| (type_id.clone(), group.members.len()))
            .collect();
        per_group.sort_by(|a, b| a.0.cmp(&b.0));

        let visible = self
            .groups
            .values()
            .flat_map(|g| g.members.iter())
            .filter(|m| m.is_visible())
            .count();

        RegistryStats {
            markers: self.locator.len(),
            groups: self.groups.len(),
            visible,
            hidden: self.locator.len().saturating_sub(visible),
            per_group,
            min_interval: self.running_min_interval,
            max_interval: self.running_max_interval,
            pooled_sets: self.pool.idle(),
            deferred_sets: self.pool.deferred(),
        }
    }

    fn apply_command(
        &mut self,
        command: RegistryCommand,
        now: f64,
        summary: &mut TickSummary,
    ) -> Result<(), MarkerError> {
        match command {
            RegistryCommand::Create(instance) => {
                self.create_marker(*instance, now)?;
            }
            RegistryCommand::Remove(id) => {
                self.remove_marker(id);
            }
            RegistryCommand::RemoveAll => {
                self.remove_all_markers();
            }
            RegistryCommand::RefreshGroup(type_id) => {
                self.refresh_group(&type_id, now, summary)?;
            }
            RegistryCommand::SetVisible { marker, visible } => {
                self.set_visible(marker, visible);
            }
        }
        Ok(())
    }

    /// Clear the group's previous recipients, respawn survivors, sweep the dead
    fn refresh_group(
        &mut self,
        type_id: &IconTypeId,
        now: f64,
        summary: &mut TickSummary,
    ) -> Result<(), MarkerError> {
        let Some(group) = self.groups.get_mut(type_id) else {
            return Ok(());
        };
        let clients = self.services.clients.as_ref();
        let grid = self.services.grid.as_ref();
        let transport = self.services.transport.as_ref();

        self.clear_union.clear();
        for member in &group.members {
            self.clear_union
                .extend(member.previous_subscribers.iter().copied());
        }
        if !self.clear_union.is_empty() {
            transport.clear(type_id, &self.clear_union);
            summary.clears += 1;
        }

        let mut first_error = None;
        for member in group.members.iter_mut() {
            member.previous_subscribers.clear();
            if member.is_expired(now) {
                continue;
            }
            let Some(pose) = member.resolve_pose() else {
                continue;
            };

            let mut subscribers = mem::take(&mut member.previous_subscribers);
            match member.compute_subscribers(&pose, clients, grid, &mut subscribers) {
                Ok(()) => {
                    if !subscribers.is_empty() {
                        transport.broadcast(&member.broadcast_for(&pose), &subscribers);
                        summary.broadcasts += 1;
                    }
                    member.record_broadcast(now, pose);
                }
                Err(source) => {
                    subscribers.clear();
                    member.kill();
                    first_error.get_or_insert(MarkerError::Predicate {
                        marker: member.id,
                        source,
                    });
                }
            }
            member.previous_subscribers = subscribers;
        }

        let mut rescan = false;
        let mut index = 0;
        while index < group.members.len() {
            if !group.members[index].is_expired(now) {
                index += 1;
                continue;
            }
            let mut dead = group.members.remove(index);
            let interval = dead.tick_interval();
            rescan |= interval <= self.running_min_interval || interval >= self.running_max_interval;
            self.locator.remove(&dead.id);
            Self::release_set(&mut self.pool, &self.sim, dead.take_subscribers());
            summary.swept += 1;
            debug!(marker_id = dead.id.0, type_id = %type_id, "Marker swept");
        }

        trace!(
            type_id = %type_id,
            members = group.members.len(),
            recipients_cleared = self.clear_union.len(),
            "Group refreshed"
        );
        summary.groups_refreshed += 1;

        if group.members.is_empty() {
            self.groups.remove(type_id);
        }
        if rescan {
            self.recompute_interval_bounds();
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    fn include_interval(&mut self, interval: f64) {
        if self.locator.is_empty() {
            self.running_min_interval = interval;
            self.running_max_interval = interval;
        } else {
            self.running_min_interval = self.running_min_interval.min(interval);
            self.running_max_interval = self.running_max_interval.max(interval);
        }
    }

    fn exclude_interval(&mut self, interval: f64) {
        if interval <= self.running_min_interval || interval >= self.running_max_interval {
            self.recompute_interval_bounds();
        }
    }

    fn recompute_interval_bounds(&mut self) {
        let mut bounds: Option<(f64, f64)> = None;
        for member in self.groups.values().flat_map(|g| g.members.iter()) {
            let interval = member.tick_interval();
            bounds = Some(match bounds {
                Some((lo, hi)) => (lo.min(interval), hi.max(interval)),
                None => (interval, interval),
            });
        }

        let (lo, hi) = bounds.unwrap_or((self.settings.default_interval, self.settings.default_interval));
        self.running_min_interval = lo;
        self.running_max_interval = hi;
    }

    fn release_set(pool: &mut SubscriberPool, sim: &SimThread, set: Recipients) {
        if sim.is_current() {
            pool.release(set);
        } else {
            pool.defer(set);
        }
    }
}

impl std::fmt::Debug for MarkerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MarkerRegistry")
            .field("markers", &self.locator.len())
            .field("groups", &self.groups.len())
            .field("min_interval", &self.running_min_interval)
            .field("max_interval", &self.running_max_interval)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::PredicateError;
    use crate::game::catalog::{IconCatalog, IconTypeInfo};
    use crate::game::grid::UniformGrid;
    use crate::marker::{Lifetime, TargetScope};
    use crate::net::directory::ClientRegistry;
    use crate::net::transport::RecordingTransport;
    use glam::Vec3;
    use pretty_assertions::assert_eq;

    struct Fixture {
        registry: MarkerRegistry,
        clients: Arc<ClientRegistry>,
        transport: Arc<RecordingTransport>,
    }

    fn fixture() -> Fixture {
        let clients = Arc::new(ClientRegistry::new(64));
        let transport = Arc::new(RecordingTransport::new());
        let catalog = IconCatalog::new()
            .with_type("objective", IconTypeInfo::new(None, 0.0))
            .with_type("ping", IconTypeInfo::new(Some(10.0), 0.0))
            .with_type("flag", IconTypeInfo::new(None, 0.0));
        let services = RegistryServices::new(
            clients.clone(),
            Arc::new(catalog),
            Arc::new(UniformGrid::new(64.0)),
            transport.clone(),
        );
        Fixture {
            registry: MarkerRegistry::new(RegistrySettings::default(), services),
            clients,
            transport,
        }
    }

    fn marker(type_id: &str, interval: f64) -> MarkerInstance {
        MarkerInstance::at(type_id, Vec3::ZERO)
            .with_tick_interval(interval)
            .with_lifetime(Lifetime::Unlimited)
    }

    #[test]
    fn test_create_rejects_unknown_type() {
        let mut f = fixture();
        let result = f.registry.create_marker(marker("missing", 1.0), 0.0);
        assert_eq!(
            result,
            Err(MarkerError::UnknownType(IconTypeId::new("missing")))
        );
        assert!(f.registry.is_empty());
    }

    #[test]
    fn test_create_rejects_dead_on_arrival() {
        let mut f = fixture();
        let handle = Arc::new(parking_lot::RwLock::new(crate::marker::Pose::IDENTITY));
        let instance = MarkerInstance::new("flag", crate::marker::PositionSource::transform(&handle));
        drop(handle);

        assert_eq!(
            f.registry.create_marker(instance, 0.0),
            Err(MarkerError::DeadOnArrival(IconTypeId::new("flag")))
        );
        assert!(f.registry.is_empty());
        assert_eq!(f.transport.broadcast_count(), 0);
    }

    #[test]
    fn test_create_broadcasts_once_and_applies_type_ttl() {
        let mut f = fixture();
        let c1 = f.clients.connect(1, 0, Some(Vec3::ZERO)).unwrap();

        let id = f
            .registry
            .create_marker(MarkerInstance::at("ping", Vec3::ZERO), 0.0)
            .unwrap();

        assert!(id.is_assigned());
        assert_eq!(f.transport.broadcasts_to(c1.channel, "ping"), 1);
        let created = f.registry.marker(id).unwrap();
        assert_eq!(created.ttl(), Some(10.0));
        assert!(created.previous_subscribers().contains(&c1.channel));
    }

    #[test]
    fn test_create_without_subscribers_sends_nothing() {
        let mut f = fixture();
        f.registry.create_marker(marker("flag", 1.0), 0.0).unwrap();
        assert!(f.transport.events().is_empty());
        assert_eq!(f.registry.len(), 1);
    }

    #[test]
    fn test_interval_bounds_track_inserts_and_removals() {
        let mut f = fixture();
        assert_eq!(f.registry.running_min_interval(), 1.0);

        let a = f.registry.create_marker(marker("flag", 2.0), 0.0).unwrap();
        assert_eq!(f.registry.running_min_interval(), 2.0);
        assert_eq!(f.registry.running_max_interval(), 2.0);

        let b = f.registry.create_marker(marker("ping", 0.5), 0.0).unwrap();
        let c = f.registry.create_marker(marker("flag", 4.0), 0.0).unwrap();
        assert_eq!(f.registry.running_min_interval(), 0.5);
        assert_eq!(f.registry.running_max_interval(), 4.0);

        assert!(f.registry.remove_marker(b));
        assert_eq!(f.registry.running_min_interval(), 2.0);
        assert!(f.registry.remove_marker(c));
        assert_eq!(f.registry.running_max_interval(), 2.0);
        assert!(f.registry.remove_marker(a));
        assert_eq!(f.registry.running_min_interval(), 1.0);
        assert_eq!(f.registry.next_tick_delay(), Duration::from_secs(1));
    }

    #[test]
    fn test_remove_respawns_siblings_for_cleared_clients() {
        let mut f = fixture();
        let c1 = f.clients.connect(1, 0, Some(Vec3::ZERO)).unwrap();

        let a = f.registry.create_marker(marker("flag", 1.0), 0.0).unwrap();
        let b = f.registry.create_marker(marker("flag", 1.0), 0.0).unwrap();
        f.transport.take();

        assert!(f.registry.remove_marker(a));
        assert_eq!(f.transport.clears_to(c1.channel, "flag"), 1);
        assert_eq!(f.transport.markers_sent_to(c1.channel), vec![b]);
        assert!(!f.registry.remove_marker(a));
    }

    #[test]
    fn test_tick_skips_groups_that_are_not_due() {
        let mut f = fixture();
        f.clients.connect(1, 0, Some(Vec3::ZERO)).unwrap();
        f.registry.create_marker(marker("flag", 2.0), 0.0).unwrap();
        f.transport.take();

        let summary = f.registry.tick(1.0).unwrap();
        assert_eq!(summary.groups_refreshed, 0);
        assert!(f.transport.events().is_empty());

        let summary = f.registry.tick(2.0).unwrap();
        assert_eq!(summary.groups_refreshed, 1);
        assert_eq!(summary.clears, 1);
        assert_eq!(summary.broadcasts, 1);
    }

    #[test]
    fn test_remove_off_thread_defers_pool_return() {
        let Fixture {
            mut registry,
            clients,
            transport,
        } = fixture();
        let c1 = clients.connect(1, 0, Some(Vec3::ZERO)).unwrap();
        let id = registry.create_marker(marker("flag", 1.0), 0.0).unwrap();

        let (mut registry, removed) = std::thread::spawn(move || {
            let removed = registry.remove_marker(id);
            (registry, removed)
        })
        .join()
        .unwrap();

        assert!(removed);
        assert_eq!(transport.clears_to(c1.channel, "flag"), 1);
        assert_eq!(registry.stats().pooled_sets, 0);
        assert_eq!(registry.stats().deferred_sets, 1);

        registry.tick(0.5).unwrap();
        assert_eq!(registry.stats().pooled_sets, 1);
        assert_eq!(registry.stats().deferred_sets, 0);
    }

    #[test]
    fn test_next_tick_delay_saturates() {
        let mut f = fixture();
        f.registry
            .create_marker(marker("flag", f64::INFINITY), 0.0)
            .unwrap();
        assert_eq!(f.registry.next_tick_delay(), Duration::MAX);

        f.registry.create_marker(marker("ping", 1e300), 0.0).unwrap();
        assert_eq!(f.registry.running_min_interval(), 1e300);
        assert_eq!(f.registry.next_tick_delay(), Duration::MAX);
    }

    #[test]
    fn test_handle_creates_markers() {
        let mut f = fixture();
        let c1 = f.clients.connect(1, 0, Some(Vec3::ZERO)).unwrap();
        let handle = f.registry.handle();

        let remote = std::thread::spawn(move || {
            handle.create_marker(marker("flag", 1.0)) && handle.create_marker(marker("missing", 1.0))
        });
        assert!(remote.join().unwrap());
        assert!(f.registry.is_empty());

        let mut summary = TickSummary::default();
        let err = f.registry.tick_into(0.0, &mut summary).unwrap_err();
        assert_eq!(err, MarkerError::UnknownType(IconTypeId::new("missing")));
        assert_eq!(summary.commands, 2);
        assert_eq!(f.registry.len(), 1);
        assert_eq!(f.transport.broadcasts_to(c1.channel, "flag"), 1);
    }

    #[test]
    fn test_refresh_marker_group_on_demand() {
        let mut f = fixture();
        let c1 = f.clients.connect(1, 0, Some(Vec3::ZERO)).unwrap();
        f.registry
            .create_marker(marker("flag", 5.0).with_relevance_distance(50.0), 0.0)
            .unwrap();
        f.transport.take();

        // Not due yet, but an explicit refresh runs anyway
        f.clients.set_position(1, Some(Vec3::new(200.0, 0.0, 0.0))).unwrap();
        let summary = f
            .registry
            .refresh_marker_group(&IconTypeId::new("flag"), 0.2)
            .unwrap();
        assert_eq!(summary.groups_refreshed, 1);
        assert_eq!(summary.clears, 1);
        assert_eq!(summary.broadcasts, 0);
        assert_eq!(f.transport.clears_to(c1.channel, "flag"), 1);

        let summary = f
            .registry
            .refresh_marker_group(&IconTypeId::new("missing"), 0.2)
            .unwrap();
        assert_eq!(summary, TickSummary::default());
    }

    #[test]
    fn test_handle_commands_apply_on_tick() {
        let mut f = fixture();
        let c1 = f.clients.connect(1, 0, Some(Vec3::ZERO)).unwrap();
        let a = f.registry.create_marker(marker("flag", 5.0), 0.0).unwrap();
        let b = f.registry.create_marker(marker("objective", 5.0), 0.0).unwrap();
        let handle = f.registry.handle();

        let remote = std::thread::spawn(move || {
            handle.remove_marker(a) && handle.set_visible(b, false)
        });
        assert!(remote.join().unwrap());
        assert_eq!(f.registry.len(), 2);

        let summary = f.registry.tick(0.5).unwrap();
        assert_eq!(summary.commands, 2);
        assert!(f.registry.marker(a).is_none());
        assert!(!f.registry.marker(b).unwrap().is_visible());

        // Hidden marker is cleared for its viewers on the next refresh
        f.transport.take();
        f.registry.handle().refresh_marker_group("objective");
        f.registry.tick(0.6).unwrap();
        assert_eq!(f.transport.clears_to(c1.channel, "objective"), 1);
        assert_eq!(f.transport.broadcasts_to(c1.channel, "objective"), 0);
        assert!(f.registry.marker(b).unwrap().previous_subscribers().is_empty());
    }

    #[test]
    fn test_predicate_error_sweeps_marker_and_continues() {
        let mut f = fixture();
        let c1 = f.clients.connect(1, 0, Some(Vec3::ZERO)).unwrap();

        let good = f.registry.create_marker(marker("flag", 1.0), 0.0).unwrap();
        let flaky = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let trigger = flaky.clone();
        let bad = f
            .registry
            .create_marker(
                marker("flag", 1.0).with_scope(TargetScope::predicate(move |_| {
                    if trigger.load(std::sync::atomic::Ordering::SeqCst) {
                        Err(PredicateError::new("lookup failed"))
                    } else {
                        Ok(true)
                    }
                })),
                0.0,
            )
            .unwrap();
        flaky.store(true, std::sync::atomic::Ordering::SeqCst);
        f.transport.take();

        let err = f.registry.tick(1.0).unwrap_err();
        assert_eq!(
            err,
            MarkerError::Predicate {
                marker: bad,
                source: PredicateError::new("lookup failed"),
            }
        );
        assert!(f.registry.marker(bad).is_none());
        assert!(f.registry.marker(good).is_some());
        assert_eq!(f.transport.markers_sent_to(c1.channel), vec![good]);
    }

    #[test]
    fn test_create_with_failing_predicate_is_rejected() {
        let mut f = fixture();
        f.clients.connect(1, 0, Some(Vec3::ZERO)).unwrap();

        let result = f.registry.create_marker(
            marker("flag", 1.0)
                .with_scope(TargetScope::predicate(|_| Err(PredicateError::new("nope")))),
            0.0,
        );
        assert!(matches!(result, Err(MarkerError::Predicate { .. })));
        assert!(f.registry.is_empty());
    }

    #[test]
    fn test_remove_all_markers() {
        let mut f = fixture();
        let c1 = f.clients.connect(1, 0, Some(Vec3::ZERO)).unwrap();
        f.registry.create_marker(marker("flag", 0.25), 0.0).unwrap();
        f.registry.create_marker(marker("flag", 1.0), 0.0).unwrap();
        f.registry.create_marker(marker("objective", 3.0), 0.0).unwrap();
        f.transport.take();

        assert_eq!(f.registry.remove_all_markers(), 3);
        assert_eq!(f.transport.clear_count(), 2);
        assert_eq!(f.transport.clears_to(c1.channel, "flag"), 1);
        assert_eq!(f.transport.clears_to(c1.channel, "objective"), 1);
        assert!(f.registry.is_empty());
        assert_eq!(f.registry.running_min_interval(), 1.0);
        assert_eq!(f.registry.running_max_interval(), 1.0);
        assert_eq!(f.registry.stats().pooled_sets, 3);
    }

    #[test]
    fn test_stats() {
        let mut f = fixture();
        f.registry.create_marker(marker("flag", 1.0), 0.0).unwrap();
        let hidden = f.registry.create_marker(marker("flag", 2.0), 0.0).unwrap();
        f.registry.create_marker(marker("objective", 0.5), 0.0).unwrap();
        assert!(f.registry.set_visible(hidden, false));

        let stats = f.registry.stats();
        assert_eq!(
            stats,
            RegistryStats {
                markers: 3,
                groups: 2,
                visible: 2,
                hidden: 1,
                per_group: vec![
                    (IconTypeId::new("flag"), 2),
                    (IconTypeId::new("objective"), 1)
                ],
                min_interval: 0.5,
                max_interval: 2.0,
                pooled_sets: 0,
                deferred_sets: 0,
            }
        );
    }
}
