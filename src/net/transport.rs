//! Icon transport
//!
//! Delivers marker broadcasts and clears to client channels. Delivery is
//! fire-and-forget: a transport never reports failures back to the registry.

use std::collections::HashSet;

use dashmap::DashMap;
use glam::{Quat, Vec3};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, trace};

use crate::marker::{IconTypeId, MarkerId, OrientationOverride};

use super::directory::ChannelId;

/// Set of channels a message is addressed to
pub type Recipients = HashSet<ChannelId>;

/// One marker state update
#[derive(Debug, Clone, PartialEq)]
pub struct IconBroadcast {
    pub type_id: IconTypeId,
    pub marker: MarkerId,
    pub position: Vec3,
    pub rotation: Quat,
    pub payload: Option<OrientationOverride>,
    pub reliable: bool,
}

/// Outbound side of the marker system
pub trait IconTransport: Send + Sync {
    /// Show or update a marker for every recipient
    fn broadcast(&self, message: &IconBroadcast, recipients: &Recipients);

    /// Remove every visual of `type_id` for every recipient
    fn clear(&self, type_id: &IconTypeId, recipients: &Recipients);
}

/// Wire format of icon messages
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum IconPacket {
    Show {
        type_id: String,
        marker: u64,
        position: [f32; 3],
        rotation: [f32; 4],
        #[serde(default, skip_serializing_if = "Option::is_none")]
        orientation: Option<[f32; 4]>,
        #[serde(default = "default_scale")]
        scale: f32,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        tint: Option<[u8; 4]>,
        reliable: bool,
    },
    Clear {
        type_id: String,
    },
}

fn default_scale() -> f32 {
    1.0
}

impl IconPacket {
    pub fn show(message: &IconBroadcast) -> Self {
        let payload = message.payload.unwrap_or_default();
        Self::Show {
            type_id: message.type_id.to_string(),
            marker: message.marker.0,
            position: message.position.to_array(),
            rotation: message.rotation.to_array(),
            orientation: payload.rotation.map(|q| q.to_array()),
            scale: payload.scale,
            tint: payload.tint,
            reliable: message.reliable,
        }
    }

    pub fn clear(type_id: &IconTypeId) -> Self {
        Self::Clear {
            type_id: type_id.to_string(),
        }
    }

    pub fn encode(&self) -> serde_json::Result<Vec<u8>> {
        serde_json::to_vec(self)
    }

    pub fn decode(bytes: &[u8]) -> serde_json::Result<Self> {
        serde_json::from_slice(bytes)
    }
}

/// Transport writing JSON packets to per-client outbound queues
pub struct SessionTransport {
    outbound: DashMap<ChannelId, mpsc::Sender<Vec<u8>>>,
    buffer: usize,
}

impl SessionTransport {
    pub fn new(buffer: usize) -> Self {
        Self {
            outbound: DashMap::new(),
            buffer: buffer.max(1),
        }
    }

    /// Open the outbound queue for a channel. The network writer drains the
    /// returned receiver.
    pub fn attach(&self, channel: ChannelId) -> mpsc::Receiver<Vec<u8>> {
        let (tx, rx) = mpsc::channel(self.buffer);
        self.outbound.insert(channel, tx);
        rx
    }

    pub fn detach(&self, channel: ChannelId) {
        self.outbound.remove(&channel);
    }

    pub fn attached(&self) -> usize {
        self.outbound.len()
    }

    fn deliver(&self, packet: &IconPacket, recipients: &Recipients) {
        if recipients.is_empty() {
            return;
        }
        let bytes = match packet.encode() {
            Ok(bytes) => bytes,
            Err(e) => {
                debug!(error = %e, "Failed to encode icon packet");
                return;
            }
        };

        for channel in recipients {
            let Some(tx) = self.outbound.get(channel) else {
                trace!(channel = *channel, "No outbound queue for channel");
                continue;
            };
            if let Err(e) = tx.try_send(bytes.clone()) {
                debug!(channel = *channel, error = %e, "Dropped icon packet");
            }
        }
    }
}

impl IconTransport for SessionTransport {
    fn broadcast(&self, message: &IconBroadcast, recipients: &Recipients) {
        self.deliver(&IconPacket::show(message), recipients);
    }

    fn clear(&self, type_id: &IconTypeId, recipients: &Recipients) {
        self.deliver(&IconPacket::clear(type_id), recipients);
    }
}

impl std::fmt::Debug for SessionTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionTransport")
            .field("attached", &self.outbound.len())
            .field("buffer", &self.buffer)
            .finish()
    }
}

/// A call observed by `RecordingTransport`
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    Broadcast {
        message: IconBroadcast,
        recipients: Recipients,
    },
    Clear {
        type_id: IconTypeId,
        recipients: Recipients,
    },
}

/// Transport that records every call instead of sending anything
#[derive(Debug, Default)]
pub struct RecordingTransport {
    events: Mutex<Vec<TransportEvent>>,
}

impl RecordingTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Copy of everything recorded so far
    pub fn events(&self) -> Vec<TransportEvent> {
        self.events.lock().clone()
    }

    /// Drain recorded events
    pub fn take(&self) -> Vec<TransportEvent> {
        std::mem::take(&mut *self.events.lock())
    }

    pub fn broadcast_count(&self) -> usize {
        self.events
            .lock()
            .iter()
            .filter(|e| matches!(e, TransportEvent::Broadcast { .. }))
            .count()
    }

    pub fn clear_count(&self) -> usize {
        self.events
            .lock()
            .iter()
            .filter(|e| matches!(e, TransportEvent::Clear { .. }))
            .count()
    }

    /// Broadcasts of `type_id` that reached `channel`
    pub fn broadcasts_to(&self, channel: ChannelId, type_id: &str) -> usize {
        self.events
            .lock()
            .iter()
            .filter(|e| match e {
                TransportEvent::Broadcast {
                    message,
                    recipients,
                } => message.type_id.as_str() == type_id && recipients.contains(&channel),
                TransportEvent::Clear { .. } => false,
            })
            .count()
    }

    /// Clears of `type_id` that reached `channel`
    pub fn clears_to(&self, channel: ChannelId, type_id: &str) -> usize {
        self.events
            .lock()
            .iter()
            .filter(|e| match e {
                TransportEvent::Clear {
                    type_id: cleared,
                    recipients,
                } => cleared.as_str() == type_id && recipients.contains(&channel),
                TransportEvent::Broadcast { .. } => false,
            })
            .count()
    }

    /// Markers broadcast to `channel`, in order
    pub fn markers_sent_to(&self, channel: ChannelId) -> Vec<MarkerId> {
        self.events
            .lock()
            .iter()
            .filter_map(|e| match e {
                TransportEvent::Broadcast {
                    message,
                    recipients,
                } if recipients.contains(&channel) => Some(message.marker),
                _ => None,
            })
            .collect()
    }
}

impl IconTransport for RecordingTransport {
    fn broadcast(&self, message: &IconBroadcast, recipients: &Recipients) {
        self.events.lock().push(TransportEvent::Broadcast {
            message: message.clone(),
            recipients: recipients.clone(),
        });
    }

    fn clear(&self, type_id: &IconTypeId, recipients: &Recipients) {
        self.events.lock().push(TransportEvent::Clear {
            type_id: type_id.clone(),
            recipients: recipients.clone(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn sample_broadcast() -> IconBroadcast {
        IconBroadcast {
            type_id: IconTypeId::new("objective"),
            marker: MarkerId(4),
            position: Vec3::new(1.0, 2.0, 3.0),
            rotation: Quat::IDENTITY,
            payload: Some(OrientationOverride::default().with_tint([0, 255, 0, 255])),
            reliable: true,
        }
    }

    fn recipients(channels: &[ChannelId]) -> Recipients {
        channels.iter().copied().collect()
    }

    #[test]
    fn test_packet_json_shape() {
        let packet = IconPacket::show(&sample_broadcast());
        let json: serde_json::Value = serde_json::from_slice(&packet.encode().unwrap()).unwrap();

        assert_eq!(json["op"], "show");
        assert_eq!(json["type_id"], "objective");
        assert_eq!(json["marker"], 4);
        assert_eq!(json["tint"], serde_json::json!([0, 255, 0, 255]));
        assert!(json.get("orientation").is_none());

        let clear = IconPacket::clear(&IconTypeId::new("objective"));
        assert_eq!(
            String::from_utf8(clear.encode().unwrap()).unwrap(),
            r#"{"op":"clear","type_id":"objective"}"#
        );
    }

    #[tokio::test]
    async fn test_session_transport_delivers_to_attached_channels() {
        let transport = SessionTransport::new(4);
        let mut rx1 = transport.attach(1);
        let mut rx2 = transport.attach(2);

        transport.broadcast(&sample_broadcast(), &recipients(&[1, 3]));
        transport.clear(&IconTypeId::new("objective"), &recipients(&[1, 2]));

        let first = IconPacket::decode(&rx1.recv().await.unwrap()).unwrap();
        assert!(matches!(first, IconPacket::Show { marker: 4, .. }));
        let second = IconPacket::decode(&rx1.recv().await.unwrap()).unwrap();
        assert_eq!(second, IconPacket::clear(&IconTypeId::new("objective")));

        let only = IconPacket::decode(&rx2.recv().await.unwrap()).unwrap();
        assert!(matches!(only, IconPacket::Clear { .. }));
        assert!(rx2.try_recv().is_err());
    }

    #[test]
    fn test_session_transport_drops_when_full() {
        let transport = SessionTransport::new(1);
        let mut rx = transport.attach(1);
        let targets = recipients(&[1]);

        transport.broadcast(&sample_broadcast(), &targets);
        transport.broadcast(&sample_broadcast(), &targets);

        assert!(rx.try_recv().is_ok());
        assert!(rx.try_recv().is_err());

        transport.detach(1);
        assert_eq!(transport.attached(), 0);
    }

    #[test]
    fn test_recording_transport_counters() {
        let transport = RecordingTransport::new();
        transport.broadcast(&sample_broadcast(), &recipients(&[1, 2]));
        transport.clear(&IconTypeId::new("objective"), &recipients(&[2]));
        transport.clear(&IconTypeId::new("ping"), &recipients(&[1]));

        assert_eq!(transport.broadcast_count(), 1);
        assert_eq!(transport.clear_count(), 2);
        assert_eq!(transport.broadcasts_to(2, "objective"), 1);
        assert_eq!(transport.clears_to(2, "objective"), 1);
        assert_eq!(transport.clears_to(1, "objective"), 0);
        assert_eq!(transport.markers_sent_to(1), vec![MarkerId(4)]);

        assert_eq!(transport.take().len(), 3);
        assert!(transport.events().is_empty());
    }
}
