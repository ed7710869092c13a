//! Application state module
//!
//! Contains the shared state used by session handlers and the icon world.

use std::sync::Arc;

use glam::Vec3;
use tokio::sync::{broadcast, mpsc};
use tracing::info;

use crate::config::ServerConfig;
use crate::error::{Result, WorldIconError};
use crate::game::catalog::IconCatalog;
use crate::game::grid::UniformGrid;
use crate::game::world::{IconWorld, WorldSettings};
use crate::marker::{MarkerRegistry, RegistryHandle, RegistryServices, RegistrySettings};
use crate::net::directory::{ClientId, ClientRegistry, ClientView, TeamId};
use crate::net::transport::SessionTransport;

/// Application state shared across all connections
pub struct AppState {
    /// Server configuration
    pub config: ServerConfig,
    /// Connected clients
    pub clients: Arc<ClientRegistry>,
    /// Known icon types
    pub catalog: Arc<IconCatalog>,
    /// Relevance grid
    pub grid: Arc<UniformGrid>,
    /// Outbound icon packet queues
    pub transport: Arc<SessionTransport>,
    /// Off-thread access to the marker registry
    pub registry: RegistryHandle,
    /// Shutdown signal sender
    pub shutdown_tx: broadcast::Sender<()>,
}

impl AppState {
    /// Build the shared state and the world that owns the registry.
    ///
    /// The world is returned separately since it must be moved onto the
    /// simulation thread.
    pub fn new(config: ServerConfig, shutdown_tx: broadcast::Sender<()>) -> (Self, IconWorld) {
        let clients = Arc::new(ClientRegistry::new(config.max_clients));
        let catalog = Arc::new(IconCatalog::from_config(&config.icon_types));
        let grid = Arc::new(UniformGrid::new(config.markers.grid_cell_size));
        let transport = Arc::new(SessionTransport::new(config.markers.outbound_buffer));

        info!(
            icon_types = catalog.len(),
            grid_cell_size = grid.cell_size(),
            "Icon catalog loaded"
        );

        let services = RegistryServices::new(
            clients.clone(),
            catalog.clone(),
            grid.clone(),
            transport.clone(),
        );
        let settings = RegistrySettings::default()
            .with_default_interval(config.markers.default_interval_secs)
            .with_refresh_tolerance(config.markers.refresh_tolerance_secs);
        let registry = MarkerRegistry::new(settings, services);
        let handle = registry.handle();

        let world = IconWorld::new(WorldSettings::from_config(&config), registry);

        let state = Self {
            config,
            clients,
            catalog,
            grid,
            transport,
            registry: handle,
            shutdown_tx,
        };
        (state, world)
    }

    /// Register a client and open its outbound packet queue
    pub fn connect_client(
        &self,
        id: ClientId,
        team: TeamId,
        position: Option<Vec3>,
    ) -> Result<(ClientView, mpsc::Receiver<Vec<u8>>)> {
        let mut outbound = None;
        let view = self.clients.connect_with(id, team, position, |view| {
            outbound = Some(self.transport.attach(view.channel));
        })?;

        let rx = outbound
            .ok_or_else(|| WorldIconError::Internal("outbound queue was not opened".to_string()))?;
        Ok((view, rx))
    }

    /// Remove a client and close its outbound queue
    pub fn disconnect_client(&self, id: ClientId) -> Option<ClientView> {
        let view = self.clients.disconnect(id)?;
        self.transport.detach(view.channel);
        Some(view)
    }
}
