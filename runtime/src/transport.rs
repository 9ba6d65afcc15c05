//! Transport contract and an in-process implementation
//!
//! The room never touches sockets. It talks to a [`Transport`], which
//! delivers [`WireMessage`]s in per-sender order and reports peers coming
//! and going. Subscriptions are unbounded channels; dropping the receiver
//! unsubscribes.
//!
//! [`MemoryNetwork`] connects any number of participants inside one
//! process. Messages still go through the binary codec so that everything
//! a real transport would have to carry is exercised.

use log::{debug, info, warn};
use shared::{decode, encode, CodecError, WireMessage};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};
use thiserror::Error;
use tokio::sync::mpsc;

/// A message together with the peer it came from
#[derive(Debug, Clone, PartialEq)]
pub struct Envelope {
    pub from: String,
    pub message: WireMessage,
}

pub type Subscription<T> = mpsc::UnboundedReceiver<T>;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("transport is closed")]
    Closed,
    #[error("unknown peer `{0}`")]
    UnknownPeer(String),
    #[error("peer id `{0}` is already connected")]
    DuplicatePeer(String),
    #[error("room is locked to new participants")]
    Locked,
    #[error(transparent)]
    Codec(#[from] CodecError),
}

/// Counters a transport may expose for diagnostics
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TransportMetrics {
    pub connected: bool,
    pub peer_count: usize,
    pub messages_sent: u64,
    pub messages_received: u64,
    pub bytes_sent: u64,
}

pub trait Transport: Send + 'static {
    /// Sends to one peer, or to every other peer when `target` is `None`
    fn send(&self, message: &WireMessage, target: Option<&str>) -> Result<(), TransportError>;

    fn on_message(&self) -> Subscription<Envelope>;

    fn on_peer_join(&self) -> Subscription<String>;

    fn on_peer_leave(&self) -> Subscription<String>;

    fn player_id(&self) -> String;

    /// Ids of the other connected peers, in join order
    fn peer_ids(&self) -> Vec<String>;

    fn is_host(&self) -> bool;

    /// Best-effort refusal of further joins
    fn lock(&self) {}

    fn metrics(&self) -> Option<TransportMetrics> {
        None
    }
}

#[derive(Default)]
struct PeerSlot {
    messages: Vec<mpsc::UnboundedSender<Envelope>>,
    joins: Vec<mpsc::UnboundedSender<String>>,
    leaves: Vec<mpsc::UnboundedSender<String>>,
    metrics: TransportMetrics,
}

#[derive(Default)]
struct Hub {
    peers: BTreeMap<String, PeerSlot>,
    join_order: Vec<String>,
    host: Option<String>,
    locked: bool,
}

impl Hub {
    fn others(&self, player_id: &str) -> Vec<String> {
        self.join_order
            .iter()
            .filter(|id| id.as_str() != player_id)
            .cloned()
            .collect()
    }

    fn announce(&mut self, player_id: &str, joined: bool) {
        for (id, slot) in self.peers.iter_mut() {
            if id == player_id {
                continue;
            }
            let subscribers = if joined {
                &mut slot.joins
            } else {
                &mut slot.leaves
            };
            subscribers.retain(|tx| tx.send(player_id.to_string()).is_ok());
            slot.metrics.peer_count = self.join_order.len().saturating_sub(1);
        }
    }

    fn remove(&mut self, player_id: &str) -> bool {
        if self.peers.remove(player_id).is_none() {
            return false;
        }
        self.join_order.retain(|id| id != player_id);
        if self.host.as_deref() == Some(player_id) {
            self.host = None;
        }
        true
    }
}

/// In-process network shared by every participant of a room
///
/// The first participant to connect is the host.
#[derive(Clone, Default)]
pub struct MemoryNetwork {
    hub: Arc<Mutex<Hub>>,
}

impl MemoryNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    fn hub(&self) -> MutexGuard<'_, Hub> {
        match self.hub.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Joins the network under `player_id`
    pub fn connect(&self, player_id: impl Into<String>) -> Result<MemoryTransport, TransportError> {
        let player_id = player_id.into();
        let mut hub = self.hub();

        if hub.locked {
            return Err(TransportError::Locked);
        }
        if hub.peers.contains_key(&player_id) {
            return Err(TransportError::DuplicatePeer(player_id));
        }

        let slot = PeerSlot {
            metrics: TransportMetrics {
                connected: true,
                peer_count: hub.join_order.len(),
                ..TransportMetrics::default()
            },
            ..PeerSlot::default()
        };
        hub.peers.insert(player_id.clone(), slot);
        hub.join_order.push(player_id.clone());
        if hub.host.is_none() {
            hub.host = Some(player_id.clone());
        }
        hub.announce(&player_id, true);

        info!("Peer {} connected to memory network", player_id);
        Ok(MemoryTransport {
            network: self.clone(),
            player_id,
        })
    }

    /// Leaves the network, notifying the remaining peers
    pub fn disconnect(&self, player_id: &str) -> bool {
        let mut hub = self.hub();
        if !hub.remove(player_id) {
            return false;
        }
        hub.announce(player_id, false);
        info!("Peer {} disconnected from memory network", player_id);
        true
    }

    /// Vanishes without any leave notification, like a crashed peer
    pub fn drop_silently(&self, player_id: &str) -> bool {
        let removed = self.hub().remove(player_id);
        if removed {
            debug!("Peer {} dropped without notice", player_id);
        }
        removed
    }

    pub fn peer_ids(&self) -> Vec<String> {
        self.hub().join_order.clone()
    }

    pub fn is_locked(&self) -> bool {
        self.hub().locked
    }
}

/// One participant's endpoint on a [`MemoryNetwork`]
pub struct MemoryTransport {
    network: MemoryNetwork,
    player_id: String,
}

impl MemoryTransport {
    pub fn network(&self) -> &MemoryNetwork {
        &self.network
    }

    fn subscribe<T>(
        &self,
        pick: impl FnOnce(&mut PeerSlot) -> &mut Vec<mpsc::UnboundedSender<T>>,
    ) -> Subscription<T> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut hub = self.network.hub();
        match hub.peers.get_mut(&self.player_id) {
            Some(slot) => pick(slot).push(tx),
            None => warn!("Peer {} subscribed after leaving the network", self.player_id),
        }
        rx
    }
}

impl Transport for MemoryTransport {
    fn send(&self, message: &WireMessage, target: Option<&str>) -> Result<(), TransportError> {
        let bytes = encode(message)?;
        let mut hub = self.network.hub();

        if !hub.peers.contains_key(&self.player_id) {
            return Err(TransportError::Closed);
        }

        let recipients = match target {
            Some(peer) if hub.peers.contains_key(peer) => vec![peer.to_string()],
            Some(peer) => return Err(TransportError::UnknownPeer(peer.to_string())),
            None => hub.others(&self.player_id),
        };

        for recipient in &recipients {
            let delivered = decode(&bytes)?;
            if let Some(slot) = hub.peers.get_mut(recipient) {
                slot.messages.retain(|tx| {
                    tx.send(Envelope {
                        from: self.player_id.clone(),
                        message: delivered.clone(),
                    })
                    .is_ok()
                });
                slot.metrics.messages_received += 1;
            }
        }

        if let Some(slot) = hub.peers.get_mut(&self.player_id) {
            slot.metrics.messages_sent += recipients.len() as u64;
            slot.metrics.bytes_sent += (bytes.len() * recipients.len()) as u64;
        }
        Ok(())
    }

    fn on_message(&self) -> Subscription<Envelope> {
        self.subscribe(|slot| &mut slot.messages)
    }

    fn on_peer_join(&self) -> Subscription<String> {
        self.subscribe(|slot| &mut slot.joins)
    }

    fn on_peer_leave(&self) -> Subscription<String> {
        self.subscribe(|slot| &mut slot.leaves)
    }

    fn player_id(&self) -> String {
        self.player_id.clone()
    }

    fn peer_ids(&self) -> Vec<String> {
        self.network.hub().others(&self.player_id)
    }

    fn is_host(&self) -> bool {
        self.network.hub().host.as_deref() == Some(self.player_id.as_str())
    }

    fn lock(&self) {
        info!("Memory network locked by {}", self.player_id);
        self.network.hub().locked = true;
    }

    fn metrics(&self) -> Option<TransportMetrics> {
        self.network
            .hub()
            .peers
            .get(&self.player_id)
            .map(|slot| slot.metrics.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shared::Payload;

    #[test]
    fn test_first_peer_is_host() {
        let network = MemoryNetwork::new();
        let host = network.connect("host").unwrap();
        let client = network.connect("c1").unwrap();

        assert!(host.is_host());
        assert!(!client.is_host());
        assert_eq!(host.peer_ids(), vec!["c1".to_string()]);
        assert_eq!(client.peer_ids(), vec!["host".to_string()]);
    }

    #[test]
    fn test_duplicate_and_locked_connections() {
        let network = MemoryNetwork::new();
        let host = network.connect("host").unwrap();

        assert!(matches!(
            network.connect("host"),
            Err(TransportError::DuplicatePeer(_))
        ));

        host.lock();
        assert!(network.is_locked());
        assert!(matches!(network.connect("late"), Err(TransportError::Locked)));
    }

    #[test]
    fn test_broadcast_excludes_sender() {
        let network = MemoryNetwork::new();
        let host = network.connect("host").unwrap();
        let c1 = network.connect("c1").unwrap();
        let c2 = network.connect("c2").unwrap();

        let mut host_rx = host.on_message();
        let mut c1_rx = c1.on_message();
        let mut c2_rx = c2.on_message();

        host.send(&WireMessage::heartbeat(), None).unwrap();

        assert!(host_rx.try_recv().is_err());
        for rx in [&mut c1_rx, &mut c2_rx] {
            let envelope = rx.try_recv().unwrap();
            assert_eq!(envelope.from, "host");
            assert!(matches!(envelope.message.payload, Payload::Heartbeat { .. }));
        }
        assert_eq!(host.metrics().unwrap().messages_sent, 2);
    }

    #[test]
    fn test_targeted_send() {
        let network = MemoryNetwork::new();
        let host = network.connect("host").unwrap();
        let c1 = network.connect("c1").unwrap();
        let c2 = network.connect("c2").unwrap();

        let mut c1_rx = c1.on_message();
        let mut c2_rx = c2.on_message();

        host.send(&WireMessage::heartbeat(), Some("c2")).unwrap();
        assert!(c1_rx.try_recv().is_err());
        assert!(c2_rx.try_recv().is_ok());

        assert!(matches!(
            host.send(&WireMessage::heartbeat(), Some("nobody")),
            Err(TransportError::UnknownPeer(_))
        ));
    }

    #[test]
    fn test_join_and_leave_notifications() {
        let network = MemoryNetwork::new();
        let host = network.connect("host").unwrap();
        let mut joins = host.on_peer_join();
        let mut leaves = host.on_peer_leave();

        let _c1 = network.connect("c1").unwrap();
        assert_eq!(joins.try_recv().unwrap(), "c1");

        assert!(network.disconnect("c1"));
        assert_eq!(leaves.try_recv().unwrap(), "c1");
        assert!(host.peer_ids().is_empty());
    }

    #[test]
    fn test_silent_drop_sends_no_leave() {
        let network = MemoryNetwork::new();
        let host = network.connect("host").unwrap();
        let mut leaves = host.on_peer_leave();
        let c1 = network.connect("c1").unwrap();

        assert!(network.drop_silently("c1"));
        assert!(leaves.try_recv().is_err());
        assert!(host.peer_ids().is_empty());
        assert!(matches!(
            c1.send(&WireMessage::heartbeat(), None),
            Err(TransportError::Closed)
        ));
    }

    #[test]
    fn test_dropped_subscription_is_pruned() {
        let network = MemoryNetwork::new();
        let host = network.connect("host").unwrap();
        let c1 = network.connect("c1").unwrap();

        drop(c1.on_message());
        let mut live = c1.on_message();
        host.send(&WireMessage::heartbeat(), None).unwrap();
        host.send(&WireMessage::heartbeat(), None).unwrap();

        assert!(live.try_recv().is_ok());
        assert!(live.try_recv().is_ok());
    }
}
