use super::peer::PeerHandle;
use super::registry::Registry;
use super::transport::TransportEvent;
use crate::messages::{Message, MessageKind, Role};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use tokio::sync::mpsc;

pub type Handler = Arc<dyn Fn(Message) + Send + Sync>;
pub type PeersHandler = Arc<dyn Fn(Vec<PeerHandle>) + Send + Sync>;

/// Routes decoded inbound messages to one handler per message kind
///
/// Nothing is dispatched while there is no active peer. On the controller,
/// messages from any device other than the active peer are dropped.
///
/// Capture traffic (`/sensor_capture_started`, `/sensor_data`) is owned by at
/// most one session at a time; see [`Dispatcher::claim_capture`].
pub struct Dispatcher {
    registry: Arc<Registry>,
    handlers: RwLock<HashMap<MessageKind, Handler>>,
    peers_handler: RwLock<Option<PeersHandler>>,
    capture_owner: Mutex<Option<u64>>,
}

const CAPTURE_KINDS: [MessageKind; 2] = [MessageKind::CaptureStarted, MessageKind::SensorData];

impl Dispatcher {
    pub fn new(registry: Arc<Registry>) -> Self {
        Self {
            registry,
            handlers: RwLock::new(HashMap::new()),
            peers_handler: RwLock::new(None),
            capture_owner: Mutex::new(None),
        }
    }

    /// Route capture traffic to `handler` on behalf of `owner`
    ///
    /// Fails while a different owner holds the route; the holder keeps its
    /// registration until it calls [`Dispatcher::release_capture`].
    pub fn claim_capture<F>(&self, owner: u64, handler: F) -> bool
    where
        F: Fn(Message) + Send + Sync + 'static,
    {
        let mut current = self
            .capture_owner
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if let Some(holder) = *current {
            if holder != owner {
                return false;
            }
        }

        let handler: Handler = Arc::new(handler);
        let mut handlers = self
            .handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        for kind in CAPTURE_KINDS {
            handlers.insert(kind, handler.clone());
        }
        *current = Some(owner);
        true
    }

    /// Drop the capture route if `owner` holds it
    pub fn release_capture(&self, owner: u64) {
        let mut current = self
            .capture_owner
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if *current != Some(owner) {
            return;
        }

        let mut handlers = self
            .handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        for kind in CAPTURE_KINDS {
            handlers.remove(&kind);
        }
        *current = None;
    }

    /// Install the handler for `kind`, replacing any previous one
    pub fn register<F>(&self, kind: MessageKind, handler: F) -> &Self
    where
        F: Fn(Message) + Send + Sync + 'static,
    {
        self.handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(kind, Arc::new(handler));
        self
    }

    /// Install the handler for changes to the reachable peer set
    pub fn on_peers_changed<F>(&self, handler: F) -> &Self
    where
        F: Fn(Vec<PeerHandle>) + Send + Sync + 'static,
    {
        *self
            .peers_handler
            .write()
            .unwrap_or_else(PoisonError::into_inner) = Some(Arc::new(handler));
        self
    }

    pub fn on_message(&self, sender_id: &str, topic: &str, payload: &[u8]) {
        let Some(peer) = self.registry.active_peer() else {
            return;
        };

        if self.registry.role() == Role::Controller && sender_id != peer.id {
            tracing::warn!(
                "Ignoring {} from {}, selected device is {}",
                topic,
                sender_id,
                peer
            );
            return;
        }

        let message = match Message::decode(topic, payload) {
            Ok(message) => message,
            Err(e) => {
                tracing::warn!("Dropping message on {}: {}", topic, e);
                return;
            }
        };

        let handler = self
            .handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&message.kind())
            .cloned();

        match handler {
            Some(handler) => handler(message),
            None => tracing::debug!("No handler for {}", topic),
        }
    }

    /// Re-resolve the active peer, then tell whoever is interested
    pub async fn on_peers_changed_event(&self, peers: Vec<PeerHandle>) {
        tracing::info!("Connected devices changed: {} reachable", peers.len());
        self.registry.refresh().await;

        let handler = self
            .peers_handler
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        if let Some(handler) = handler {
            handler(peers);
        }
    }

    /// Pump transport events until the transport goes away
    pub async fn run(self: Arc<Self>, mut events: mpsc::UnboundedReceiver<TransportEvent>) {
        while let Some(event) = events.recv().await {
            match event {
                TransportEvent::Message {
                    sender_id,
                    topic,
                    payload,
                } => self.on_message(&sender_id, &topic, &payload),
                TransportEvent::PeersChanged(peers) => self.on_peers_changed_event(peers).await,
            }
        }

        tracing::debug!("Transport event stream closed");
    }
}
