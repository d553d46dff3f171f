use super::queue::DeliveryQueue;
use super::registry::Registry;
use crate::messages::{Message, Role};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::time::Instant;

pub const DEFAULT_PROBE_TIMEOUT: Duration = Duration::from_secs(10);

/// Values repeated in the probe reply so the round trip carries a realistic payload
const PROBE_COORDINATES: [f64; 6] = [
    2.3467607,
    4.299603,
    2.5082762,
    1.4981171,
    0.28894445,
    -0.7122414,
];
const PROBE_REPEAT: usize = 200;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProbeError {
    #[error("a connection test is already running")]
    Busy,

    #[error("no device selected")]
    NoPeer,

    #[error("connection tests are started from the controller")]
    WrongRole,

    #[error("no response within {0:?}")]
    Timeout(Duration),

    #[error("connection test cancelled")]
    Cancelled,
}

/// Round-trip liveness test against the active peer
pub struct ConnectivityProbe {
    registry: Arc<Registry>,
    queue: DeliveryQueue,
    timeout: Duration,
    in_progress: AtomicBool,
    pending: Mutex<Option<oneshot::Sender<()>>>,
}

/// Clears the probe slot however `test_connection` exits
struct ProbeGuard<'a> {
    probe: &'a ConnectivityProbe,
}

impl Drop for ProbeGuard<'_> {
    fn drop(&mut self) {
        self.probe.slot().take();
        self.probe.in_progress.store(false, Ordering::Release);
    }
}

impl ConnectivityProbe {
    pub fn new(registry: Arc<Registry>, queue: DeliveryQueue, timeout: Duration) -> Self {
        Self {
            registry,
            queue,
            timeout,
            in_progress: AtomicBool::new(false),
            pending: Mutex::new(None),
        }
    }

    fn slot(&self) -> MutexGuard<'_, Option<oneshot::Sender<()>>> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn is_testing(&self) -> bool {
        self.in_progress.load(Ordering::Acquire)
    }

    /// Send `/test_connection` and wait for the reply; returns the round-trip time
    pub async fn test_connection(&self) -> Result<Duration, ProbeError> {
        if self.registry.role() != Role::Controller {
            return Err(ProbeError::WrongRole);
        }
        if self.in_progress.swap(true, Ordering::AcqRel) {
            return Err(ProbeError::Busy);
        }
        let _guard = ProbeGuard { probe: self };

        if self.registry.active_peer().is_none() {
            return Err(ProbeError::NoPeer);
        }

        let (tx, rx) = oneshot::channel();
        *self.slot() = Some(tx);

        let started = Instant::now();
        self.queue.send(Message::TestConnection);

        match tokio::time::timeout(self.timeout, rx).await {
            Ok(Ok(())) => {
                let elapsed = started.elapsed();
                tracing::info!("Connection test succeeded in {:?}", elapsed);
                Ok(elapsed)
            }
            Ok(Err(_)) => {
                tracing::info!("Connection test cancelled");
                Err(ProbeError::Cancelled)
            }
            Err(_) => {
                tracing::warn!("Connection test timed out after {:?}", self.timeout);
                Err(ProbeError::Timeout(self.timeout))
            }
        }
    }

    /// Completes the pending test, if any
    pub fn on_response(&self) {
        if let Some(tx) = self.slot().take() {
            let _ = tx.send(());
        }
    }

    /// Abort the pending test without a result
    pub fn cancel(&self) {
        if self.slot().take().is_some() {
            tracing::debug!("Cancelling connection test");
        }
    }

    /// Producer side: answer a `/test_connection` with a large reply
    pub fn respond_to_test(&self) {
        if self.registry.role() != Role::Producer || self.registry.active_peer().is_none() {
            return;
        }

        tracing::debug!("Answering connection test");
        self.queue
            .send(Message::TestConnectionResponse(probe_response_payload()));
    }
}

pub fn probe_response_payload() -> String {
    let line = PROBE_COORDINATES
        .iter()
        .map(f64::to_string)
        .collect::<Vec<_>>()
        .join(",");
    line.repeat(PROBE_REPEAT)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::peer::PeerHandle;
    use crate::connection::store::MemoryStore;
    use crate::connection::testing::MockTransport;

    async fn probe(role: Role, timeout: Duration) -> (Arc<ConnectivityProbe>, Arc<MockTransport>) {
        let peer = PeerHandle::new("W", "Watch");
        let transport = Arc::new(MockTransport::new(vec![peer.clone()]));
        let queue = DeliveryQueue::new(role, transport.clone());
        let registry = Arc::new(Registry::new(
            role,
            transport.clone(),
            Arc::new(MemoryStore::new()),
            queue.clone(),
        ));
        registry.select_peer(peer).await;
        (
            Arc::new(ConnectivityProbe::new(registry, queue, timeout)),
            transport,
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_response_resolves_with_elapsed_time() {
        let (probe, transport) = probe(Role::Controller, DEFAULT_PROBE_TIMEOUT).await;

        let running = tokio::spawn({
            let probe = probe.clone();
            async move { probe.test_connection().await }
        });
        transport.wait_for_topic("/test_connection", 1).await;
        tokio::time::advance(Duration::from_millis(250)).await;
        probe.on_response();

        let elapsed = running.await.unwrap().unwrap();
        assert!(elapsed >= Duration::from_millis(250));
        assert!(!probe.is_testing());
    }

    #[tokio::test(start_paused = true)]
    async fn test_second_probe_is_refused_without_sending() {
        let (probe, transport) = probe(Role::Controller, DEFAULT_PROBE_TIMEOUT).await;

        let running = tokio::spawn({
            let probe = probe.clone();
            async move { probe.test_connection().await }
        });
        transport.wait_for_topic("/test_connection", 1).await;

        assert_eq!(probe.test_connection().await, Err(ProbeError::Busy));
        assert_eq!(transport.count_topic("/test_connection"), 1);

        probe.on_response();
        assert!(running.await.unwrap().is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_then_retry_is_allowed() {
        let (probe, transport) = probe(Role::Controller, Duration::from_secs(10)).await;

        let result = probe.test_connection().await;
        assert_eq!(result, Err(ProbeError::Timeout(Duration::from_secs(10))));
        assert!(!probe.is_testing());

        let running = tokio::spawn({
            let probe = probe.clone();
            async move { probe.test_connection().await }
        });
        transport.wait_for_topic("/test_connection", 2).await;
        probe.on_response();
        assert!(running.await.unwrap().is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_fails_the_pending_probe() {
        let (probe, transport) = probe(Role::Controller, DEFAULT_PROBE_TIMEOUT).await;

        let running = tokio::spawn({
            let probe = probe.clone();
            async move { probe.test_connection().await }
        });
        transport.wait_for_topic("/test_connection", 1).await;
        probe.cancel();

        assert_eq!(running.await.unwrap(), Err(ProbeError::Cancelled));
        assert!(!probe.is_testing());
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropped_probe_releases_the_slot() {
        let (probe, transport) = probe(Role::Controller, DEFAULT_PROBE_TIMEOUT).await;

        let running = tokio::spawn({
            let probe = probe.clone();
            async move { probe.test_connection().await }
        });
        transport.wait_for_topic("/test_connection", 1).await;
        running.abort();
        let _ = running.await;

        assert!(!probe.is_testing());
    }

    #[tokio::test]
    async fn test_producer_cannot_probe_but_answers() {
        let (probe, transport) = probe(Role::Producer, DEFAULT_PROBE_TIMEOUT).await;

        assert_eq!(probe.test_connection().await, Err(ProbeError::WrongRole));

        probe.respond_to_test();
        transport.wait_for_topic("/test_connection_response", 1).await;
        let reply = &transport.payloads()[0];
        let line = "2.3467607,4.299603,2.5082762,1.4981171,0.28894445,-0.7122414";
        assert_eq!(reply.len(), line.len() * PROBE_REPEAT);
        assert_eq!(reply.matches(line).count(), PROBE_REPEAT);
        assert!(!reply.contains('\n'));
    }
}
