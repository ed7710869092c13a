//! Client directory
//!
//! Tracks connected clients and the bits of their state relevance checks
//! need:
//! - Team membership
//! - Last known world position
//! - The outbound channel packets for them are written to
//!
//! Session changes are published as `SessionEvent`s so the simulation loop can
//! forward them to the marker registry.

use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use glam::Vec3;
use tokio::sync::broadcast;
use tracing::{debug, info};

use crate::error::{Result, SessionError};

/// Client identifier assigned by the session layer
pub type ClientId = u16;

/// Team identifier
pub type TeamId = u16;

/// Identifier of a client's outbound network channel
pub type ChannelId = u64;

/// Capacity of the session event channel
const SESSION_EVENT_CAPACITY: usize = 1024;

/// Snapshot of a connected client
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ClientView {
    pub id: ClientId,
    pub team: TeamId,
    /// `None` until the client has spawned
    pub position: Option<Vec3>,
    pub channel: ChannelId,
}

/// Read-only view of connected clients
pub trait ClientDirectory: Send + Sync {
    fn client(&self, id: ClientId) -> Option<ClientView>;

    fn for_each_client(&self, f: &mut dyn FnMut(&ClientView));

    fn client_count(&self) -> usize;
}

/// Session lifecycle notifications
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    Connected(ClientId),
    /// Carries the last view so the client can be cleaned up after removal
    Disconnected(ClientView),
    TeamChanged {
        client: ClientId,
        old_team: TeamId,
    },
}

/// Concurrent client directory backed by a `DashMap`
pub struct ClientRegistry {
    clients: DashMap<ClientId, ClientView>,
    next_channel: AtomicU64,
    max_clients: usize,
    events: broadcast::Sender<SessionEvent>,
}

impl ClientRegistry {
    pub fn new(max_clients: usize) -> Self {
        let (events, _) = broadcast::channel(SESSION_EVENT_CAPACITY);
        Self {
            clients: DashMap::new(),
            next_channel: AtomicU64::new(1),
            max_clients,
            events,
        }
    }

    /// Register a client and allocate its outbound channel
    pub fn connect(&self, id: ClientId, team: TeamId, position: Option<Vec3>) -> Result<ClientView> {
        self.connect_with(id, team, position, |_| {})
    }

    /// Like `connect`, running `on_register` after the client is indexed but
    /// before `SessionEvent::Connected` is published. Used to open the
    /// client's outbound queue before anything is sent to it.
    pub fn connect_with<F>(
        &self,
        id: ClientId,
        team: TeamId,
        position: Option<Vec3>,
        on_register: F,
    ) -> Result<ClientView>
    where
        F: FnOnce(&ClientView),
    {
        if self.clients.contains_key(&id) {
            return Err(SessionError::AlreadyConnected(id).into());
        }
        if self.clients.len() >= self.max_clients {
            return Err(SessionError::DirectoryFull(self.max_clients).into());
        }

        let view = ClientView {
            id,
            team,
            position,
            channel: self.next_channel.fetch_add(1, Ordering::SeqCst),
        };
        self.clients.insert(id, view);
        on_register(&view);

        info!(client_id = id, team = team, channel = view.channel, "Client connected");
        self.publish(SessionEvent::Connected(id));
        Ok(view)
    }

    /// Remove a client, returning its last view
    pub fn disconnect(&self, id: ClientId) -> Option<ClientView> {
        let (_, view) = self.clients.remove(&id)?;
        info!(client_id = id, channel = view.channel, "Client disconnected");
        self.publish(SessionEvent::Disconnected(view));
        Some(view)
    }

    pub fn set_position(&self, id: ClientId, position: Option<Vec3>) -> Result<()> {
        let mut entry = self
            .clients
            .get_mut(&id)
            .ok_or(SessionError::NotConnected(id))?;
        entry.position = position;
        Ok(())
    }

    /// Move a client to another team. Returns the previous team.
    pub fn set_team(&self, id: ClientId, team: TeamId) -> Result<TeamId> {
        let old_team = {
            let mut entry = self
                .clients
                .get_mut(&id)
                .ok_or(SessionError::NotConnected(id))?;
            std::mem::replace(&mut entry.team, team)
        };

        if old_team != team {
            debug!(client_id = id, old_team = old_team, new_team = team, "Client changed team");
            self.publish(SessionEvent::TeamChanged {
                client: id,
                old_team,
            });
        }
        Ok(old_team)
    }

    /// Subscribe to session events
    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    pub fn is_full(&self) -> bool {
        self.clients.len() >= self.max_clients
    }

    fn publish(&self, event: SessionEvent) {
        // No receivers is fine, e.g. before the world loop starts
        let _ = self.events.send(event);
    }
}

impl Default for ClientRegistry {
    fn default() -> Self {
        Self::new(usize::from(ClientId::MAX))
    }
}

impl ClientDirectory for ClientRegistry {
    fn client(&self, id: ClientId) -> Option<ClientView> {
        self.clients.get(&id).map(|entry| *entry)
    }

    fn for_each_client(&self, f: &mut dyn FnMut(&ClientView)) {
        for entry in self.clients.iter() {
            f(entry.value());
        }
    }

    fn client_count(&self) -> usize {
        self.clients.len()
    }
}

impl std::fmt::Debug for ClientRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientRegistry")
            .field("clients", &self.clients.len())
            .field("max_clients", &self.max_clients)
            .finish()
    }
}
