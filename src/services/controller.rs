use crate::connection::{DeliveryQueue, Dispatcher};
use crate::messages::{
    ControllerState, Message, SessionCommand, SessionKind, SessionStatus, StopReason,
};
use crate::sensor::SensorPacket;
use crate::sink::SampleSink;
use anyhow::Result;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::{Instant, Interval, Sleep};

pub const DEFAULT_PEER_TIMEOUT: Duration = Duration::from_secs(15);

const COUNTDOWN_TICK: Duration = Duration::from_secs(1);

static NEXT_SESSION_ID: AtomicU64 = AtomicU64::new(1);

/// Packets per `/more_sensor_data`: `max(1, 500 / samples_per_packet)`
pub fn ack_interval(samples_per_packet: usize) -> u64 {
    (500 / samples_per_packet.max(1)).max(1) as u64
}

#[derive(Debug, Clone, PartialEq)]
pub struct SessionSettings {
    pub samples_per_packet: usize,
    /// Countdown before the capture request; 0 starts immediately
    pub delayed_start_secs: u32,
    /// Stop once this many samples have been handed to the sink
    pub stop_after: Option<u64>,
    pub peer_timeout: Duration,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            samples_per_packet: 10,
            delayed_start_secs: 5,
            stop_after: None,
            peer_timeout: DEFAULT_PEER_TIMEOUT,
        }
    }
}

/// Phone side of a capture session
///
/// Drives the countdown, asks the peer to start streaming, forwards packets
/// to the sink and acknowledges them, and supervises the peer with a
/// watchdog. Timers are owned by the run loop and dropped on every return
/// to `Idle`, so none can fire into a later session.
///
/// Sessions sharing a dispatcher take turns: a start only proceeds if no
/// other session holds the capture route, and the route is released on
/// every return to `Idle`.
pub struct ControllerSession {
    id: u64,
    kind: SessionKind,
    settings: SessionSettings,
    queue: DeliveryQueue,
    dispatcher: Arc<Dispatcher>,
    sink: Box<dyn SampleSink>,
    cmd_rx: mpsc::Receiver<SessionCommand>,
    inbound: mpsc::UnboundedSender<Message>,
    inbound_rx: mpsc::UnboundedReceiver<Message>,
    status: watch::Sender<SessionStatus>,
    state: ControllerState,
    stop_reason: Option<StopReason>,
    countdown: Option<Interval>,
    countdown_left: u32,
    watchdog: Option<Pin<Box<Sleep>>>,
    samples_captured: u64,
    packets_received: u64,
}

impl ControllerSession {
    pub fn new(
        kind: SessionKind,
        settings: SessionSettings,
        queue: DeliveryQueue,
        dispatcher: Arc<Dispatcher>,
        sink: Box<dyn SampleSink>,
        cmd_rx: mpsc::Receiver<SessionCommand>,
    ) -> Self {
        let (status, _) = watch::channel(SessionStatus::idle(kind));
        let (inbound, inbound_rx) = mpsc::unbounded_channel();
        Self {
            id: NEXT_SESSION_ID.fetch_add(1, Ordering::Relaxed),
            kind,
            settings,
            queue,
            dispatcher,
            sink,
            cmd_rx,
            inbound,
            inbound_rx,
            status,
            state: ControllerState::Idle,
            stop_reason: None,
            countdown: None,
            countdown_left: 0,
            watchdog: None,
            samples_captured: 0,
            packets_received: 0,
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<SessionStatus> {
        self.status.subscribe()
    }

    pub async fn run(mut self) {
        loop {
            tokio::select! {
                cmd = self.cmd_rx.recv() => match cmd {
                    Some(cmd) => self.handle_command(cmd).await,
                    None => break,
                },

                Some(message) = self.inbound_rx.recv() => {
                    self.handle_message(message).await;
                }

                _ = next_tick(&mut self.countdown) => {
                    self.on_countdown_tick();
                }

                _ = expired(&mut self.watchdog) => {
                    tracing::warn!(
                        "{:?} session: no response from peer in {:?}",
                        self.kind,
                        self.settings.peer_timeout
                    );
                    self.enter_idle(StopReason::NoResponseFromPeer).await;
                }
            }
        }

        if self.state != ControllerState::Idle {
            self.enter_idle(StopReason::ManualStop).await;
        }
        self.dispatcher.release_capture(self.id);
        tracing::debug!("{:?} session closed", self.kind);
    }

    async fn handle_command(&mut self, cmd: SessionCommand) {
        match cmd {
            SessionCommand::Start => self.start().await,

            SessionCommand::Stop(reply) => {
                if self.state != ControllerState::Idle {
                    self.enter_idle(StopReason::ManualStop).await;
                }
                let _ = reply.send(self.samples_captured);
            }
        }
    }

    async fn start(&mut self) {
        if self.state != ControllerState::Idle {
            tracing::debug!("{:?} session already running, ignoring start", self.kind);
            return;
        }

        self.samples_captured = 0;
        self.packets_received = 0;
        self.stop_reason = None;

        let inbound = self.inbound.clone();
        let claimed = self.dispatcher.claim_capture(self.id, move |message| {
            let _ = inbound.send(message);
        });
        if !claimed {
            tracing::warn!(
                "Cannot start {:?} session: another session is capturing",
                self.kind
            );
            self.refuse_start(StopReason::CaptureInUse);
            return;
        }

        if self.queue.peer().is_none() {
            tracing::warn!("Cannot start {:?} session: no device selected", self.kind);
            self.refuse_start(StopReason::NoPeerSelected);
            return;
        }

        if let Err(reason) = self.sink.open().await {
            tracing::warn!("Cannot start {:?} session: {:?}", self.kind, reason);
            self.refuse_start(reason);
            return;
        }

        if self.settings.delayed_start_secs == 0 {
            self.begin_capture();
            return;
        }

        tracing::info!(
            "{:?} session starting in {}s",
            self.kind,
            self.settings.delayed_start_secs
        );
        self.countdown_left = self.settings.delayed_start_secs;
        self.countdown = Some(tokio::time::interval_at(
            Instant::now() + COUNTDOWN_TICK,
            COUNTDOWN_TICK,
        ));
        self.state = ControllerState::DelayedStart {
            remaining: Duration::from_secs(self.countdown_left.into()),
        };
        self.publish();
    }

    fn refuse_start(&mut self, reason: StopReason) {
        self.dispatcher.release_capture(self.id);
        self.stop_reason = Some(reason);
        self.publish();
    }

    fn on_countdown_tick(&mut self) {
        self.countdown_left = self.countdown_left.saturating_sub(1);

        if self.countdown_left == 0 {
            self.countdown = None;
            self.begin_capture();
        } else {
            self.state = ControllerState::DelayedStart {
                remaining: Duration::from_secs(self.countdown_left.into()),
            };
            self.publish();
        }
    }

    fn begin_capture(&mut self) {
        tracing::info!(
            "{:?} session requesting capture, {} samples per packet",
            self.kind,
            self.settings.samples_per_packet
        );
        self.queue
            .request_capture_start(self.settings.samples_per_packet);
        self.watchdog = Some(Box::pin(tokio::time::sleep(self.settings.peer_timeout)));
        self.state = ControllerState::Waiting;
        self.publish();
    }

    fn feed_watchdog(&mut self) {
        if let Some(watchdog) = self.watchdog.as_mut() {
            watchdog
                .as_mut()
                .reset(Instant::now() + self.settings.peer_timeout);
        }
    }

    async fn handle_message(&mut self, message: Message) {
        match (self.state, message) {
            (ControllerState::Waiting, Message::CaptureStarted) => {
                tracing::info!("{:?} session: peer started capture", self.kind);
                self.feed_watchdog();
                self.state = ControllerState::Receiving;
                self.publish();
            }

            (ControllerState::Receiving, Message::SensorData(packet)) => {
                self.feed_watchdog();
                self.on_packet(packet).await;
            }

            (state, message) => {
                tracing::debug!(
                    "{:?} session ignoring {} in {:?}",
                    self.kind,
                    message.topic(),
                    state
                );
            }
        }
    }

    async fn on_packet(&mut self, packet: SensorPacket) {
        self.packets_received += 1;

        let pairs = packet.pairs();
        let take = match self.settings.stop_after {
            Some(cap) => {
                let room = cap.saturating_sub(self.samples_captured);
                pairs.len().min(usize::try_from(room).unwrap_or(usize::MAX))
            }
            None => pairs.len(),
        };

        if let Err(e) = self.sink.write_samples(&pairs[..take]) {
            tracing::error!("{:?} session: {}", self.kind, e);
            self.enter_idle(e.stop_reason()).await;
            return;
        }
        self.samples_captured += take as u64;

        if let Some(cap) = self.settings.stop_after {
            if self.samples_captured >= cap {
                tracing::info!("{:?} session reached {} samples", self.kind, cap);
                self.enter_idle(StopReason::StopAfterSampleCount).await;
                return;
            }
        }

        if self.packets_received % ack_interval(self.settings.samples_per_packet) == 0 {
            self.queue.confirm_more_sensor_data();
        }
        self.publish();
    }

    async fn enter_idle(&mut self, reason: StopReason) {
        let prior = self.state;
        self.countdown = None;
        self.watchdog = None;

        if prior.is_capturing() {
            self.queue.request_capture_stop();
        }

        self.state = ControllerState::Idle;
        self.stop_reason = Some(reason);
        self.dispatcher.release_capture(self.id);

        if prior != ControllerState::Idle {
            if let Err(e) = self.sink.finalize().await {
                tracing::error!("Failed to finalize {:?} session: {:#}", self.kind, e);
            }
        }

        tracing::info!(
            "{:?} session stopped ({:?}), {} samples in {} packets",
            self.kind,
            reason,
            self.samples_captured,
            self.packets_received
        );
        self.publish();
    }

    fn publish(&self) {
        self.status.send_replace(SessionStatus {
            kind: self.kind,
            state: self.state,
            stop_reason: self.stop_reason,
            samples_captured: self.samples_captured,
            packets_received: self.packets_received,
        });
    }
}

async fn next_tick(countdown: &mut Option<Interval>) {
    match countdown {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending().await,
    }
}

async fn expired(watchdog: &mut Option<Pin<Box<Sleep>>>) {
    match watchdog {
        Some(sleep) => sleep.as_mut().await,
        None => std::future::pending().await,
    }
}

/// Handle for communicating with a ControllerSession
#[derive(Clone)]
pub struct SessionHandle {
    tx: mpsc::Sender<SessionCommand>,
    status: watch::Receiver<SessionStatus>,
}

impl SessionHandle {
    pub fn new(tx: mpsc::Sender<SessionCommand>, status: watch::Receiver<SessionStatus>) -> Self {
        Self { tx, status }
    }

    /// Start the session
    ///
    /// A refused start (no device, busy link, sink failure) is reported as a
    /// stop reason on the status channel, not as an error here.
    pub async fn start(&self) -> Result<()> {
        self.tx
            .send(SessionCommand::Start)
            .await
            .map_err(|e| anyhow::anyhow!("Failed to send start command: {}", e))
    }

    /// Stop the session; returns the samples captured
    pub async fn stop(&self) -> Result<u64> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(SessionCommand::Stop(reply))
            .await
            .map_err(|e| anyhow::anyhow!("Failed to send stop command: {}", e))?;

        rx.await
            .map_err(|e| anyhow::anyhow!("Failed to receive stop response: {}", e))
    }

    pub fn status(&self) -> SessionStatus {
        self.status.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<SessionStatus> {
        self.status.clone()
    }
}

/// Build a session, spawn its loop, and return the handle
pub fn spawn_session(
    kind: SessionKind,
    settings: SessionSettings,
    queue: DeliveryQueue,
    dispatcher: Arc<Dispatcher>,
    sink: Box<dyn SampleSink>,
) -> SessionHandle {
    let (tx, cmd_rx) = mpsc::channel(10);

    let session = ControllerSession::new(kind, settings, queue, dispatcher, sink, cmd_rx);
    let handle = SessionHandle::new(tx, session.subscribe());
    tokio::spawn(session.run());

    handle
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::testing::MockTransport;
    use crate::connection::{MemoryStore, PeerHandle, Registry};
    use crate::messages::Role;
    use crate::sensor::SamplePair;
    use crate::sink::SinkError;
    use async_trait::async_trait;
    use std::sync::Mutex;

    #[derive(Default)]
    struct SinkLog {
        opened: usize,
        finalized: usize,
        samples: Vec<SamplePair>,
        open_error: Option<StopReason>,
        fail_writes: bool,
    }

    #[derive(Clone, Default)]
    struct MemorySink {
        log: Arc<Mutex<SinkLog>>,
    }

    impl MemorySink {
        fn samples(&self) -> usize {
            self.log.lock().unwrap().samples.len()
        }

        fn finalized(&self) -> usize {
            self.log.lock().unwrap().finalized
        }

        fn opened(&self) -> usize {
            self.log.lock().unwrap().opened
        }
    }

    #[async_trait]
    impl SampleSink for MemorySink {
        async fn open(&mut self) -> Result<(), StopReason> {
            let mut log = self.log.lock().unwrap();
            if let Some(reason) = log.open_error {
                return Err(reason);
            }
            log.opened += 1;
            Ok(())
        }

        fn write_samples(&mut self, samples: &[SamplePair]) -> Result<(), SinkError> {
            let mut log = self.log.lock().unwrap();
            if log.fail_writes {
                return Err(SinkError::Write("disk full".into()));
            }
            log.samples.extend_from_slice(samples);
            Ok(())
        }

        async fn finalize(&mut self) -> Result<()> {
            self.log.lock().unwrap().finalized += 1;
            Ok(())
        }
    }

    struct Fixture {
        handle: SessionHandle,
        transport: Arc<MockTransport>,
        dispatcher: Arc<Dispatcher>,
        queue: DeliveryQueue,
        sink: MemorySink,
    }

    impl Fixture {
        async fn new(settings: SessionSettings) -> Self {
            Self::build(settings, true, MemorySink::default()).await
        }

        async fn build(settings: SessionSettings, selected: bool, sink: MemorySink) -> Self {
            let watch = PeerHandle::new("W", "Watch");
            let transport = Arc::new(MockTransport::new(vec![watch.clone()]));
            let queue = DeliveryQueue::new(Role::Controller, transport.clone());
            let registry = Arc::new(Registry::new(
                Role::Controller,
                transport.clone(),
                Arc::new(MemoryStore::new()),
                queue.clone(),
            ));
            if selected {
                registry.select_peer(watch).await;
            }
            let dispatcher = Arc::new(Dispatcher::new(registry));
            let handle = spawn_session(
                SessionKind::Training,
                settings,
                queue.clone(),
                dispatcher.clone(),
                Box::new(sink.clone()),
            );

            Self {
                handle,
                transport,
                dispatcher,
                queue,
                sink,
            }
        }

        /// Another session on the same link, as the recognition flow would be
        fn spawn_recognition(&self, sink: MemorySink) -> SessionHandle {
            spawn_session(
                SessionKind::Recognition,
                immediate(10),
                self.queue.clone(),
                self.dispatcher.clone(),
                Box::new(sink),
            )
        }

        fn peer_says(&self, topic: &str, payload: &str) {
            self.dispatcher.on_message("W", topic, payload.as_bytes());
        }

        fn send_packets(&self, count: usize, pairs: usize) {
            let payload = SensorPacket::new(vec![SamplePair::default(); pairs]).encode();
            for _ in 0..count {
                self.peer_says("/sensor_data", &payload);
            }
        }

        async fn wait_status(&self, pred: impl Fn(&SessionStatus) -> bool) -> SessionStatus {
            let mut rx = self.handle.subscribe();
            let status = tokio::time::timeout(Duration::from_secs(600), rx.wait_for(|s| pred(s)))
                .await
                .expect("status never reached")
                .unwrap()
                .clone();
            status
        }

        async fn receiving(&self) {
            self.handle.start().await.unwrap();
            self.transport.wait_for_topic("/start_capture", 1).await;
            self.peer_says("/sensor_capture_started", "");
            self.wait_status(|s| s.state == ControllerState::Receiving)
                .await;
        }
    }

    fn immediate(samples_per_packet: usize) -> SessionSettings {
        SessionSettings {
            samples_per_packet,
            delayed_start_secs: 0,
            ..SessionSettings::default()
        }
    }

    #[test]
    fn test_ack_interval() {
        assert_eq!(ack_interval(10), 50);
        assert_eq!(ack_interval(100), 5);
        assert_eq!(ack_interval(600), 1);
        assert_eq!(ack_interval(0), 500);
    }

    #[tokio::test(start_paused = true)]
    async fn test_watchdog_aborts_waiting_session() {
        let fx = Fixture::new(immediate(10)).await;
        let started = Instant::now();

        fx.handle.start().await.unwrap();
        fx.transport.wait_for_topic("/start_capture", 1).await;
        assert_eq!(fx.transport.payloads(), vec!["10"]);

        tokio::time::sleep(Duration::from_millis(14_990)).await;
        assert_eq!(fx.handle.status().state, ControllerState::Waiting);

        let status = fx.wait_status(|s| s.stop_reason.is_some()).await;
        assert!(started.elapsed() >= Duration::from_millis(15_000));
        assert_eq!(status.state, ControllerState::Idle);
        assert_eq!(status.stop_reason, Some(StopReason::NoResponseFromPeer));

        fx.transport.wait_for_topic("/stop_capture", 1).await;
        assert_eq!(fx.sink.finalized(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_peer_traffic_feeds_the_watchdog() {
        let fx = Fixture::new(immediate(10)).await;
        fx.receiving().await;

        tokio::time::sleep(Duration::from_secs(10)).await;
        fx.send_packets(1, 10);
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(fx.handle.status().state, ControllerState::Receiving);

        let status = fx.wait_status(|s| s.stop_reason.is_some()).await;
        assert_eq!(status.stop_reason, Some(StopReason::NoResponseFromPeer));
        assert_eq!(status.samples_captured, 10);
    }

    #[tokio::test]
    async fn test_ack_every_fifty_packets_of_ten() {
        let fx = Fixture::new(immediate(10)).await;
        fx.receiving().await;

        fx.send_packets(49, 10);
        fx.wait_status(|s| s.packets_received == 49).await;
        fx.queue.wait_idle().await;
        assert_eq!(fx.transport.count_topic("/more_sensor_data"), 0);

        fx.send_packets(51, 10);
        fx.wait_status(|s| s.packets_received == 100).await;
        fx.transport.wait_for_topic("/more_sensor_data", 2).await;
        fx.queue.wait_idle().await;
        assert_eq!(fx.transport.count_topic("/more_sensor_data"), 2);
        assert_eq!(fx.sink.samples(), 1000);
    }

    #[tokio::test]
    async fn test_ack_every_packet_of_six_hundred() {
        let fx = Fixture::new(immediate(600)).await;
        fx.receiving().await;

        fx.send_packets(3, 600);
        fx.transport.wait_for_topic("/more_sensor_data", 3).await;
        assert_eq!(fx.handle.status().packets_received, 3);
    }

    #[tokio::test]
    async fn test_stop_after_caps_persisted_samples() {
        let fx = Fixture::new(SessionSettings {
            stop_after: Some(100),
            ..immediate(10)
        })
        .await;
        fx.receiving().await;

        fx.send_packets(15, 10);
        let status = fx.wait_status(|s| s.stop_reason.is_some()).await;
        fx.queue.wait_idle().await;

        assert_eq!(status.stop_reason, Some(StopReason::StopAfterSampleCount));
        assert_eq!(status.samples_captured, 100);
        assert_eq!(fx.sink.samples(), 100);
        assert_eq!(fx.transport.count_topic("/stop_capture"), 1);
        assert_eq!(fx.handle.stop().await.unwrap(), 100);
    }

    #[tokio::test]
    async fn test_stop_after_trims_partial_packet() {
        let fx = Fixture::new(SessionSettings {
            stop_after: Some(25),
            ..immediate(10)
        })
        .await;
        fx.receiving().await;

        fx.send_packets(3, 10);
        let status = fx.wait_status(|s| s.stop_reason.is_some()).await;

        assert_eq!(status.samples_captured, 25);
        assert_eq!(fx.sink.samples(), 25);
    }

    #[tokio::test(start_paused = true)]
    async fn test_countdown_then_capture_request() {
        let fx = Fixture::new(SessionSettings {
            delayed_start_secs: 3,
            ..immediate(10)
        })
        .await;
        let started = Instant::now();

        fx.handle.start().await.unwrap();
        fx.wait_status(|s| {
            s.state
                == ControllerState::DelayedStart {
                    remaining: Duration::from_secs(3),
                }
        })
        .await;

        tokio::time::sleep(Duration::from_millis(2_500)).await;
        assert_eq!(
            fx.handle.status().state,
            ControllerState::DelayedStart {
                remaining: Duration::from_secs(1)
            }
        );
        assert!(fx.transport.attempts().is_empty());

        fx.transport.wait_for_topic("/start_capture", 1).await;
        assert!(started.elapsed() >= Duration::from_secs(3));
        assert_eq!(fx.handle.status().state, ControllerState::Waiting);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_countdown_sends_nothing() {
        let fx = Fixture::new(SessionSettings::default()).await;

        fx.handle.start().await.unwrap();
        fx.wait_status(|s| matches!(s.state, ControllerState::DelayedStart { .. }))
            .await;

        assert_eq!(fx.handle.stop().await.unwrap(), 0);
        let status = fx.handle.status();
        assert_eq!(status.state, ControllerState::Idle);
        assert_eq!(status.stop_reason, Some(StopReason::ManualStop));

        tokio::time::sleep(Duration::from_secs(30)).await;
        fx.queue.wait_idle().await;
        assert!(fx.transport.attempts().is_empty());
        assert_eq!(fx.sink.finalized(), 1);
    }

    #[tokio::test]
    async fn test_manual_stop_while_receiving_stops_peer() {
        let fx = Fixture::new(immediate(10)).await;
        fx.receiving().await;
        fx.send_packets(2, 10);
        fx.wait_status(|s| s.packets_received == 2).await;

        assert_eq!(fx.handle.stop().await.unwrap(), 20);
        fx.transport.wait_for_topic("/stop_capture", 1).await;
        assert_eq!(fx.handle.status().stop_reason, Some(StopReason::ManualStop));

        // Late packets after the stop are ignored
        fx.send_packets(1, 10);
        fx.handle.stop().await.unwrap();
        assert_eq!(fx.sink.samples(), 20);
        assert_eq!(fx.transport.count_topic("/stop_capture"), 1);
    }

    #[tokio::test]
    async fn test_no_peer_selected() {
        let sink = MemorySink::default();
        let fx = Fixture::build(immediate(10), false, sink.clone()).await;

        fx.handle.start().await.unwrap();
        let status = fx.wait_status(|s| s.stop_reason.is_some()).await;

        assert_eq!(status.stop_reason, Some(StopReason::NoPeerSelected));
        assert_eq!(status.state, ControllerState::Idle);
        assert_eq!(sink.opened(), 0);
    }

    #[tokio::test]
    async fn test_sink_open_failure_aborts_start() {
        let sink = MemorySink::default();
        sink.log.lock().unwrap().open_error = Some(StopReason::CsvFileAlreadyExists);
        let fx = Fixture::build(immediate(10), true, sink).await;

        fx.handle.start().await.unwrap();
        let status = fx.wait_status(|s| s.stop_reason.is_some()).await;
        fx.queue.wait_idle().await;

        assert_eq!(status.stop_reason, Some(StopReason::CsvFileAlreadyExists));
        assert!(fx.transport.attempts().is_empty());
    }

    #[tokio::test]
    async fn test_sink_write_failure_ends_session() {
        let fx = Fixture::new(immediate(10)).await;
        fx.receiving().await;
        fx.sink.log.lock().unwrap().fail_writes = true;

        fx.send_packets(1, 10);
        let status = fx.wait_status(|s| s.stop_reason.is_some()).await;

        assert_eq!(status.stop_reason, Some(StopReason::CsvWriteFailed));
        fx.transport.wait_for_topic("/stop_capture", 1).await;
    }

    #[tokio::test]
    async fn test_data_before_ack_is_ignored() {
        let fx = Fixture::new(immediate(10)).await;
        fx.handle.start().await.unwrap();
        fx.transport.wait_for_topic("/start_capture", 1).await;

        fx.send_packets(1, 10);
        fx.peer_says("/sensor_capture_started", "");
        fx.wait_status(|s| s.state == ControllerState::Receiving)
            .await;

        assert_eq!(fx.handle.status().packets_received, 0);
        assert_eq!(fx.sink.samples(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_restart_after_stop() {
        let fx = Fixture::new(immediate(10)).await;
        fx.receiving().await;
        fx.send_packets(2, 10);
        fx.wait_status(|s| s.packets_received == 2).await;
        assert_eq!(fx.handle.stop().await.unwrap(), 20);

        fx.handle.start().await.unwrap();
        fx.transport.wait_for_topic("/start_capture", 2).await;
        let status = fx.wait_status(|s| s.state == ControllerState::Waiting).await;
        assert_eq!(status.stop_reason, None);
        assert_eq!(status.samples_captured, 0);
        assert_eq!(fx.sink.opened(), 2);
        assert_eq!(fx.sink.finalized(), 1);

        fx.peer_says("/sensor_capture_started", "");
        fx.wait_status(|s| s.state == ControllerState::Receiving)
            .await;
        fx.send_packets(1, 10);
        fx.wait_status(|s| s.packets_received == 1).await;
        assert_eq!(fx.sink.samples(), 30);

        // The second run has its own watchdog
        let started = Instant::now();
        let status = fx.wait_status(|s| s.stop_reason.is_some()).await;
        assert!(started.elapsed() >= Duration::from_secs(15));
        assert_eq!(status.stop_reason, Some(StopReason::NoResponseFromPeer));
        assert_eq!(status.samples_captured, 10);
        fx.transport.wait_for_topic("/stop_capture", 2).await;
        assert_eq!(fx.sink.finalized(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_second_session_cannot_take_over_capture() {
        let fx = Fixture::new(immediate(10)).await;
        fx.receiving().await;

        let other_sink = MemorySink::default();
        let other = fx.spawn_recognition(other_sink.clone());
        let mut other_status = other.subscribe();
        other.start().await.unwrap();
        let refused = other_status
            .wait_for(|s| s.stop_reason.is_some())
            .await
            .unwrap()
            .clone();
        assert_eq!(refused.state, ControllerState::Idle);
        assert_eq!(refused.stop_reason, Some(StopReason::CaptureInUse));
        assert_eq!(other_sink.opened(), 0);

        fx.send_packets(3, 10);
        fx.wait_status(|s| s.packets_received == 3).await;
        tokio::time::sleep(Duration::from_secs(10)).await;
        let status = fx.handle.status();
        assert_eq!(status.state, ControllerState::Receiving);
        assert_eq!(status.stop_reason, None);
        assert_eq!(fx.sink.samples(), 30);
        assert_eq!(fx.transport.count_topic("/start_capture"), 1);

        // Once the first session is idle the link is free again
        assert_eq!(fx.handle.stop().await.unwrap(), 30);
        other.start().await.unwrap();
        fx.transport.wait_for_topic("/start_capture", 2).await;
        fx.peer_says("/sensor_capture_started", "");
        other_status
            .wait_for(|s| s.state == ControllerState::Receiving)
            .await
            .unwrap();
        fx.send_packets(1, 10);
        other_status
            .wait_for(|s| s.packets_received == 1)
            .await
            .unwrap();

        assert_eq!(other_sink.samples(), 10);
        assert_eq!(fx.sink.samples(), 30);
        assert_eq!(fx.handle.status().packets_received, 3);
    }
}
