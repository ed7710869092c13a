//! World module
//!
//! Hosts the marker registry:
//! - Tick loop paced by the registry's shortest refresh interval
//! - Session events (join, leave, team change) forwarded to the registry
//! - Graceful shutdown on the server-wide shutdown signal

use std::time::{Duration, Instant};

use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, info, warn};

use crate::config::ServerConfig;
use crate::marker::{MarkerRegistry, TickSummary};
use crate::net::directory::SessionEvent;

/// Shortest host sleep between ticks in milliseconds
pub const MIN_HOST_INTERVAL_MS: u64 = 50;

/// Longest host sleep between ticks in milliseconds
pub const MAX_HOST_INTERVAL_MS: u64 = 1000;

/// World settings
#[derive(Debug, Clone)]
pub struct WorldSettings {
    /// World name
    pub name: String,
    /// Lower clamp on the tick delay
    pub min_host_interval: Duration,
    /// Upper clamp on the tick delay
    pub max_host_interval: Duration,
}

impl Default for WorldSettings {
    fn default() -> Self {
        Self {
            name: "WorldIcon".to_string(),
            min_host_interval: Duration::from_millis(MIN_HOST_INTERVAL_MS),
            max_host_interval: Duration::from_millis(MAX_HOST_INTERVAL_MS),
        }
    }
}

impl WorldSettings {
    pub fn from_config(config: &ServerConfig) -> Self {
        Self::default()
            .with_name(config.server_name.clone())
            .with_host_interval(
                Duration::from_millis(config.markers.min_host_interval_ms),
                Duration::from_millis(config.markers.max_host_interval_ms),
            )
    }

    /// Set the world name
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Set the tick delay clamp
    pub fn with_host_interval(mut self, min: Duration, max: Duration) -> Self {
        self.min_host_interval = min;
        self.max_host_interval = max.max(min);
        self
    }
}

/// World state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorldState {
    /// Built, loop not started
    Initializing,
    /// Loop running
    Running,
    /// Loop has exited
    Stopped,
}

/// Drives a `MarkerRegistry` on the simulation thread
pub struct IconWorld {
    /// World settings
    pub settings: WorldSettings,
    registry: MarkerRegistry,
    state: WorldState,
    ticks: u64,
    totals: TickSummary,
    start_time: Option<Instant>,
}

impl IconWorld {
    pub fn new(settings: WorldSettings, registry: MarkerRegistry) -> Self {
        info!(name = %settings.name, "Creating icon world");
        Self {
            settings,
            registry,
            state: WorldState::Initializing,
            ticks: 0,
            totals: TickSummary::default(),
            start_time: None,
        }
    }

    pub fn registry(&self) -> &MarkerRegistry {
        &self.registry
    }

    pub fn registry_mut(&mut self) -> &mut MarkerRegistry {
        &mut self.registry
    }

    pub fn state(&self) -> WorldState {
        self.state
    }

    /// Ticks run so far
    pub fn ticks(&self) -> u64 {
        self.ticks
    }

    /// Accumulated tick work
    pub fn totals(&self) -> TickSummary {
        self.totals
    }

    /// Seconds since the loop started
    pub fn uptime_secs(&self) -> f64 {
        self.start_time
            .map(|t| t.elapsed().as_secs_f64())
            .unwrap_or(0.0)
    }

    /// Registry cadence clamped to the host bounds
    pub fn host_delay(&self) -> Duration {
        self.registry
            .next_tick_delay()
            .max(self.settings.min_host_interval)
            .min(self.settings.max_host_interval)
    }

    /// Run one registry tick at `now` seconds
    pub fn tick_at(&mut self, now: f64) {
        if let Err(e) = self.registry.tick_into(now, &mut self.totals) {
            warn!(error = %e, "Marker tick reported an error");
        }
        self.ticks += 1;

        if self.ticks % 1000 == 0 {
            debug!(
                ticks = self.ticks,
                markers = self.registry.len(),
                broadcasts = self.totals.broadcasts,
                "Icon world tick milestone"
            );
        }
    }

    /// Forward a session change to the registry
    pub fn apply_session_event(&mut self, event: SessionEvent) {
        let result = match event {
            SessionEvent::Connected(client) => self.registry.on_client_connected(client).map(|_| ()),
            SessionEvent::Disconnected(view) => {
                self.registry.on_client_disconnected(&view);
                Ok(())
            }
            SessionEvent::TeamChanged { client, old_team } => self
                .registry
                .on_client_team_changed(client, old_team)
                .map(|_| ()),
        };

        if let Err(e) = result {
            warn!(error = %e, "Marker update for session event failed");
        }
    }

    /// Run the tick loop until shutdown
    pub async fn run(
        &mut self,
        mut events: broadcast::Receiver<SessionEvent>,
        shutdown_rx: &mut broadcast::Receiver<()>,
    ) {
        info!(
            name = %self.settings.name,
            min_interval_ms = self.settings.min_host_interval.as_millis() as u64,
            max_interval_ms = self.settings.max_host_interval.as_millis() as u64,
            "Starting icon world"
        );

        self.registry.bind_to_current_thread();
        let start = Instant::now();
        self.start_time = Some(start);
        self.state = WorldState::Running;

        let mut deadline = tokio::time::Instant::now() + self.host_delay();
        let mut events_open = true;

        loop {
            tokio::select! {
                _ = tokio::time::sleep_until(deadline) => {
                    self.tick_at(start.elapsed().as_secs_f64());
                    deadline = tokio::time::Instant::now() + self.host_delay();
                }
                event = events.recv(), if events_open => {
                    match event {
                        Ok(event) => self.apply_session_event(event),
                        Err(RecvError::Lagged(skipped)) => {
                            warn!(skipped = skipped, "Session events lagged, markers may be stale until next refresh");
                        }
                        Err(RecvError::Closed) => {
                            debug!("Session event channel closed");
                            events_open = false;
                        }
                    }
                }
                _ = shutdown_rx.recv() => {
                    info!("Received shutdown signal");
                    break;
                }
            }
        }

        self.state = WorldState::Stopped;
        info!(
            total_ticks = self.ticks,
            markers = self.registry.len(),
            uptime_secs = self.uptime_secs(),
            "Icon world stopped"
        );
    }
}

impl std::fmt::Debug for IconWorld {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IconWorld")
            .field("name", &self.settings.name)
            .field("state", &self.state)
            .field("ticks", &self.ticks)
            .field("registry", &self.registry)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::game::catalog::{IconCatalog, IconTypeInfo};
    use crate::game::grid::UniformGrid;
    use crate::error::PredicateError;
    use crate::marker::{
        Lifetime, MarkerInstance, RegistryServices, RegistrySettings, TargetScope,
    };
    use crate::net::directory::ClientRegistry;
    use crate::net::transport::RecordingTransport;
    use glam::Vec3;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn world() -> (IconWorld, Arc<ClientRegistry>, Arc<RecordingTransport>) {
        let clients = Arc::new(ClientRegistry::new(16));
        let transport = Arc::new(RecordingTransport::new());
        let services = RegistryServices::new(
            clients.clone(),
            Arc::new(IconCatalog::new().with_type("flag", IconTypeInfo::default())),
            Arc::new(UniformGrid::default()),
            transport.clone(),
        );
        let registry = MarkerRegistry::new(RegistrySettings::default(), services);
        let settings = WorldSettings::default()
            .with_name("test")
            .with_host_interval(Duration::from_millis(5), Duration::from_millis(200));
        (IconWorld::new(settings, registry), clients, transport)
    }

    fn flag(interval: f64) -> MarkerInstance {
        MarkerInstance::at("flag", Vec3::ZERO)
            .with_tick_interval(interval)
            .with_lifetime(Lifetime::Unlimited)
    }

    #[test]
    fn test_world_settings_builder() {
        let settings = WorldSettings::default()
            .with_name("Arena")
            .with_host_interval(Duration::from_millis(100), Duration::from_millis(10));
        assert_eq!(settings.name, "Arena");
        assert_eq!(settings.max_host_interval, Duration::from_millis(100));
    }

    #[test]
    fn test_host_delay_is_clamped() {
        let (mut world, _, _) = world();
        // Empty registry reports the 1s default
        assert_eq!(world.host_delay(), Duration::from_millis(200));

        world.registry_mut().create_marker(flag(0.001), 0.0).unwrap();
        assert_eq!(world.host_delay(), Duration::from_millis(5));

        world.registry_mut().create_marker(flag(0.1), 0.0).unwrap();
        assert_eq!(world.host_delay(), Duration::from_millis(5));
    }

    #[test]
    fn test_session_events_reach_registry() {
        let (mut world, clients, transport) = world();
        let id = world.registry_mut().create_marker(flag(1.0), 0.0).unwrap();

        let view = clients.connect(1, 0, Some(Vec3::ZERO)).unwrap();
        world.apply_session_event(SessionEvent::Connected(1));
        assert_eq!(transport.broadcasts_to(view.channel, "flag"), 1);
        assert!(world.registry().marker(id).unwrap().previous_subscribers().contains(&view.channel));

        clients.disconnect(1);
        world.apply_session_event(SessionEvent::Disconnected(view));
        assert!(world.registry().marker(id).unwrap().previous_subscribers().is_empty());
    }

    #[test]
    fn test_tick_at_accumulates_totals() {
        let (mut world, clients, _) = world();
        clients.connect(1, 0, Some(Vec3::ZERO)).unwrap();
        world.registry_mut().create_marker(flag(1.0), 0.0).unwrap();

        world.tick_at(0.5);
        world.tick_at(1.0);
        assert_eq!(world.ticks(), 2);
        assert_eq!(world.totals().groups_refreshed, 1);
        assert_eq!(world.totals().broadcasts, 1);
    }

    #[test]
    fn test_host_delay_survives_unbounded_interval() {
        let (mut world, _, _) = world();
        world
            .registry_mut()
            .create_marker(flag(f64::INFINITY), 0.0)
            .unwrap();
        assert_eq!(world.registry().next_tick_delay(), Duration::MAX);
        assert_eq!(world.host_delay(), Duration::from_millis(200));
    }

    #[test]
    fn test_failed_tick_still_counts_work() {
        let (mut world, clients, _) = world();
        clients.connect(1, 0, Some(Vec3::ZERO)).unwrap();
        world.registry_mut().create_marker(flag(1.0), 0.0).unwrap();

        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let flaky = flag(1.0).with_scope(TargetScope::predicate(move |_| {
            if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                Ok(true)
            } else {
                Err(PredicateError::new("team lookup failed"))
            }
        }));
        world.registry_mut().create_marker(flaky, 0.0).unwrap();

        world.tick_at(1.0);
        assert_eq!(world.registry().len(), 1);
        assert_eq!(world.totals().groups_refreshed, 1);
        assert_eq!(world.totals().clears, 1);
        assert_eq!(world.totals().broadcasts, 1);
        assert_eq!(world.totals().swept, 1);
    }

    #[tokio::test]
    async fn test_run_until_shutdown() {
        let (mut world, clients, transport) = world();
        world.registry_mut().create_marker(flag(0.01), 0.0).unwrap();

        let events = clients.subscribe();
        let (shutdown_tx, mut shutdown_rx) = broadcast::channel(1);
        let task = tokio::spawn(async move {
            world.run(events, &mut shutdown_rx).await;
            world
        });

        let view = clients.connect(1, 0, Some(Vec3::ZERO)).unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        shutdown_tx.send(()).unwrap();

        let world = task.await.unwrap();
        assert_eq!(world.state(), WorldState::Stopped);
        assert!(world.ticks() > 0);
        assert!(transport.broadcasts_to(view.channel, "flag") >= 1);
    }
}
