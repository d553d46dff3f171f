use super::peer::PeerHandle;
use anyhow::{Result, bail};
use async_trait::async_trait;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::mpsc;

/// Something that arrived from the platform's device link
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    Message {
        sender_id: String,
        topic: String,
        payload: Vec<u8>,
    },
    /// The set of reachable peers changed; carries the new set
    PeersChanged(Vec<PeerHandle>),
}

/// Reliable datagram link to paired devices
///
/// One `send` is one topic + payload. Inbound traffic is delivered separately
/// as a stream of [`TransportEvent`]s handed out when the transport is built.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn connected_peers(&self) -> Result<Vec<PeerHandle>>;

    async fn send(&self, peer_id: &str, topic: &str, payload: &[u8]) -> Result<()>;
}

/// One end of an in-memory link between two processes
pub struct LoopbackTransport {
    local: PeerHandle,
    remote: PeerHandle,
    local_events: mpsc::UnboundedSender<TransportEvent>,
    remote_events: mpsc::UnboundedSender<TransportEvent>,
    connected: Arc<AtomicBool>,
}

pub type LoopbackEnd = (LoopbackTransport, mpsc::UnboundedReceiver<TransportEvent>);

/// Build a connected pair; each end gets the events addressed to it
pub fn loopback_pair(a: PeerHandle, b: PeerHandle) -> (LoopbackEnd, LoopbackEnd) {
    let (a_tx, a_rx) = mpsc::unbounded_channel();
    let (b_tx, b_rx) = mpsc::unbounded_channel();
    let connected = Arc::new(AtomicBool::new(true));

    let a_end = LoopbackTransport {
        local: a.clone(),
        remote: b.clone(),
        local_events: a_tx.clone(),
        remote_events: b_tx.clone(),
        connected: connected.clone(),
    };
    let b_end = LoopbackTransport {
        local: b,
        remote: a,
        local_events: b_tx,
        remote_events: a_tx,
        connected,
    };

    ((a_end, a_rx), (b_end, b_rx))
}

impl LoopbackTransport {
    pub fn local(&self) -> &PeerHandle {
        &self.local
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    /// Drop the link and tell both ends
    pub fn disconnect(&self) {
        if self.connected.swap(false, Ordering::AcqRel) {
            tracing::info!("Loopback link {} <-> {} disconnected", self.local, self.remote);
            let _ = self.local_events.send(TransportEvent::PeersChanged(Vec::new()));
            let _ = self.remote_events.send(TransportEvent::PeersChanged(Vec::new()));
        }
    }

    pub fn reconnect(&self) {
        if !self.connected.swap(true, Ordering::AcqRel) {
            tracing::info!("Loopback link {} <-> {} reconnected", self.local, self.remote);
            let _ = self
                .local_events
                .send(TransportEvent::PeersChanged(vec![self.remote.clone()]));
            let _ = self
                .remote_events
                .send(TransportEvent::PeersChanged(vec![self.local.clone()]));
        }
    }
}

#[async_trait]
impl Transport for LoopbackTransport {
    async fn connected_peers(&self) -> Result<Vec<PeerHandle>> {
        if self.is_connected() {
            Ok(vec![self.remote.clone()])
        } else {
            Ok(Vec::new())
        }
    }

    async fn send(&self, peer_id: &str, topic: &str, payload: &[u8]) -> Result<()> {
        if !self.is_connected() {
            bail!("link to {} is down", self.remote);
        }
        if peer_id != self.remote.id {
            bail!("unknown peer {}", peer_id);
        }

        self.remote_events
            .send(TransportEvent::Message {
                sender_id: self.local.id.clone(),
                topic: topic.to_string(),
                payload: payload.to_vec(),
            })
            .map_err(|_| anyhow::anyhow!("peer {} is no longer listening", self.remote))
    }
}
