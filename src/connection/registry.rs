use super::peer::PeerHandle;
use super::queue::DeliveryQueue;
use super::store::PeerStore;
use super::transport::Transport;
use crate::messages::Role;
use std::sync::Arc;
use tokio::sync::watch;

/// Store key for the selected peer record
pub const SELECTED_PEER_KEY: &str = "selected_wear_node";

/// Knows which device is "the peer" and keeps the delivery queue pointed at it
///
/// On the controller the peer is chosen by the user and persisted; on the
/// producer it is always the first currently connected device.
pub struct Registry {
    role: Role,
    transport: Arc<dyn Transport>,
    store: Arc<dyn PeerStore>,
    queue: DeliveryQueue,
    active: watch::Sender<Option<PeerHandle>>,
}

impl Registry {
    pub fn new(
        role: Role,
        transport: Arc<dyn Transport>,
        store: Arc<dyn PeerStore>,
        queue: DeliveryQueue,
    ) -> Self {
        let (active, _) = watch::channel(None);
        Self {
            role,
            transport,
            store,
            queue,
            active,
        }
    }

    pub fn role(&self) -> Role {
        self.role
    }

    /// The peer resolved by the last refresh
    pub fn active_peer(&self) -> Option<PeerHandle> {
        self.active.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<Option<PeerHandle>> {
        self.active.subscribe()
    }

    /// Persist `handle` as the selection and re-resolve the active peer
    pub async fn select_peer(&self, handle: PeerHandle) -> Option<PeerHandle> {
        tracing::info!("Selecting peer {}", handle);
        self.persist(&handle);
        self.refresh().await
    }

    pub async fn clear_selection(&self) {
        tracing::info!("Clearing selected peer");
        if let Err(e) = self.store.remove(SELECTED_PEER_KEY) {
            tracing::warn!("Failed to clear selected peer: {:#}", e);
        }
        self.refresh().await;
    }

    /// Resolve the selection and re-arm the queue with the result
    pub async fn refresh(&self) -> Option<PeerHandle> {
        let peer = self.resolve_selection(true).await;

        match &peer {
            Some(peer) => tracing::info!("Active peer is {}", peer),
            None => tracing::info!("No active peer"),
        }

        self.queue.set_peer(peer.clone());
        self.active.send_replace(peer.clone());
        peer
    }

    /// Current selection, optionally checked against the live device list
    ///
    /// A persisted peer whose id is gone but whose name is still connected is
    /// treated as the same device with a new id; the record is rewritten.
    pub async fn resolve_selection(&self, validate: bool) -> Option<PeerHandle> {
        if self.role == Role::Producer {
            return self.list_connected_peers().await.into_iter().next();
        }

        let saved = self.saved_peer()?;
        if !validate {
            return Some(saved);
        }

        let live = self.list_connected_peers().await;

        if live.iter().any(|peer| peer.id == saved.id) {
            return Some(saved);
        }

        if let Some(renamed) = live
            .iter()
            .find(|peer| peer.display_name == saved.display_name)
        {
            let updated = saved.with_id(renamed.id.clone());
            tracing::info!(
                "Peer {} reconnected with new id {}",
                saved.display_name,
                updated.id
            );
            self.persist(&updated);
            return Some(updated);
        }

        tracing::debug!("Selected peer {} is not connected", saved);
        None
    }

    /// Reachable peers; transport errors read as "none"
    pub async fn list_connected_peers(&self) -> Vec<PeerHandle> {
        match self.transport.connected_peers().await {
            Ok(peers) => peers,
            Err(e) => {
                tracing::warn!("Error getting connected devices: {:#}", e);
                Vec::new()
            }
        }
    }

    fn saved_peer(&self) -> Option<PeerHandle> {
        let json = self.store.get(SELECTED_PEER_KEY)?;
        match PeerHandle::from_json(&json) {
            Ok(peer) => Some(peer),
            Err(e) => {
                tracing::warn!("Ignoring malformed saved peer {:?}: {}", json, e);
                None
            }
        }
    }

    fn persist(&self, handle: &PeerHandle) {
        let result = handle
            .to_json()
            .map_err(anyhow::Error::from)
            .and_then(|json| self.store.set(SELECTED_PEER_KEY, &json));

        if let Err(e) = result {
            tracing::warn!("Failed to save selected peer {}: {:#}", handle, e);
        }
    }
}
