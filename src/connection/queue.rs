use super::peer::PeerHandle;
use super::transport::Transport;
use crate::messages::{Message, Role};
use crate::sensor::SensorPacket;
use std::collections::VecDeque;
use std::pin::pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use tokio::sync::Notify;

/// One outbound datagram waiting for its turn
#[derive(Debug, Clone, PartialEq)]
pub struct QueuedMessage {
    pub topic: String,
    pub payload: Vec<u8>,
}

/// Strictly ordered, single-flight outbound queue to the active peer
///
/// `enqueue` never blocks. A single drain task sends one message at a time
/// and is started on demand. Delivery is at most once: a send that fails is
/// logged and skipped so the rest of the queue keeps moving, and a message
/// dequeued while no peer is set is dropped.
#[derive(Clone)]
pub struct DeliveryQueue {
    inner: Arc<QueueInner>,
}

struct QueueInner {
    role: Role,
    transport: Arc<dyn Transport>,
    peer: RwLock<Option<PeerHandle>>,
    pending: Mutex<VecDeque<QueuedMessage>>,
    busy: AtomicBool,
    idle: Notify,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl DeliveryQueue {
    pub fn new(role: Role, transport: Arc<dyn Transport>) -> Self {
        Self {
            inner: Arc::new(QueueInner {
                role,
                transport,
                peer: RwLock::new(None),
                pending: Mutex::new(VecDeque::new()),
                busy: AtomicBool::new(false),
                idle: Notify::new(),
            }),
        }
    }

    pub fn role(&self) -> Role {
        self.inner.role
    }

    /// Swap the peer that subsequent dequeues will send to
    pub fn set_peer(&self, peer: Option<PeerHandle>) {
        *self
            .inner
            .peer
            .write()
            .unwrap_or_else(PoisonError::into_inner) = peer;
    }

    pub fn peer(&self) -> Option<PeerHandle> {
        self.inner.current_peer()
    }

    pub fn pending(&self) -> usize {
        lock(&self.inner.pending).len()
    }

    /// Append a raw datagram and make sure the drain task is running
    pub fn enqueue(&self, topic: impl Into<String>, payload: impl Into<Vec<u8>>) {
        lock(&self.inner.pending).push_back(QueuedMessage {
            topic: topic.into(),
            payload: payload.into(),
        });
        self.kick();
    }

    /// Encode and enqueue a protocol message
    ///
    /// Messages this role is not allowed to originate, and messages sent while
    /// no peer is selected, are dropped here.
    pub fn send(&self, message: Message) {
        let kind = message.kind();
        if kind.sender() != self.inner.role {
            tracing::warn!(
                "Refusing to send {} from the {:?} side",
                kind.topic(),
                self.inner.role
            );
            return;
        }

        if self.peer().is_none() {
            tracing::debug!("No device selected, not queueing {}", kind.topic());
            return;
        }

        self.enqueue(kind.topic(), message.encode());
    }

    pub fn request_capture_start(&self, samples_per_packet: usize) {
        self.send(Message::StartCapture { samples_per_packet });
    }

    pub fn confirm_more_sensor_data(&self) {
        self.send(Message::MoreSensorData);
    }

    pub fn request_capture_stop(&self) {
        self.send(Message::StopCapture);
    }

    pub fn confirm_capture_started(&self) {
        self.send(Message::CaptureStarted);
    }

    pub fn send_sensor_data(&self, packet: SensorPacket) {
        self.send(Message::SensorData(packet));
    }

    /// Resolves once the queue is empty and no drain task is running
    pub async fn wait_idle(&self) {
        loop {
            let mut notified = pin!(self.inner.idle.notified());
            notified.as_mut().enable();

            if !self.inner.busy.load(Ordering::Acquire) && self.pending() == 0 {
                return;
            }

            notified.await;
        }
    }

    fn kick(&self) {
        if self.inner.busy.swap(true, Ordering::AcqRel) {
            return;
        }

        let inner = self.inner.clone();
        tokio::spawn(async move { inner.drain().await });
    }
}

impl QueueInner {
    fn current_peer(&self) -> Option<PeerHandle> {
        self.peer
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    async fn drain(&self) {
        loop {
            let next = lock(&self.pending).pop_front();

            match next {
                Some(message) => self.deliver(message).await,
                None => {
                    self.busy.store(false, Ordering::Release);

                    // An enqueue may have slipped in after the pop but before
                    // the flag was cleared; pick it up unless another drain did.
                    let has_more = !lock(&self.pending).is_empty();
                    if !has_more || self.busy.swap(true, Ordering::AcqRel) {
                        break;
                    }
                }
            }
        }

        self.idle.notify_waiters();
    }

    async fn deliver(&self, message: QueuedMessage) {
        // Captured once per message so a concurrent set_peer cannot redirect it mid-send
        let Some(peer) = self.current_peer() else {
            tracing::debug!("No device selected, dropping {}", message.topic);
            return;
        };

        match self
            .transport
            .send(&peer.id, &message.topic, &message.payload)
            .await
        {
            Ok(()) => tracing::debug!("Message {} sent to {}", message.topic, peer.display_name),
            Err(e) => tracing::warn!(
                "Error sending {} to {}: {:#}",
                message.topic,
                peer.display_name,
                e
            ),
        }
    }
}
