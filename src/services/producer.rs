use crate::connection::{DeliveryQueue, Dispatcher, Registry};
use crate::messages::{Message, MessageKind, ProducerCommand, ProducerInput, ProducerState};
use crate::sensor::{SensorEvent, SensorFusion, SensorSource};
use anyhow::Result;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::time::{Instant, Sleep};

pub const DEFAULT_PRODUCER_TIMEOUT: Duration = Duration::from_secs(15);

const SENSOR_CHANNEL_CAPACITY: usize = 100;

/// Watch side of a capture session
///
/// This service:
/// - Resolves the peer at startup and refuses to listen without one
/// - Starts the sensors on `/start_capture` and batches pairs into packets
/// - Stops silently when the controller stops acknowledging
/// - Ends for good when the set of connected devices changes
pub struct Producer {
    registry: Arc<Registry>,
    queue: DeliveryQueue,
    source: Box<dyn SensorSource>,
    cmd_rx: mpsc::Receiver<ProducerCommand>,
    inbound_rx: mpsc::UnboundedReceiver<ProducerInput>,
    sensor_rx: mpsc::Receiver<SensorEvent>,
    sensor_tx: mpsc::Sender<SensorEvent>,
    fusion: SensorFusion,
    state: watch::Sender<ProducerState>,
    watchdog: Option<Pin<Box<Sleep>>>,
    timeout: Duration,
}

impl Producer {
    pub fn new(
        registry: Arc<Registry>,
        queue: DeliveryQueue,
        source: Box<dyn SensorSource>,
        cmd_rx: mpsc::Receiver<ProducerCommand>,
        inbound_rx: mpsc::UnboundedReceiver<ProducerInput>,
        timeout: Duration,
    ) -> Self {
        let (sensor_tx, sensor_rx) = mpsc::channel(SENSOR_CHANNEL_CAPACITY);
        let (state, _) = watch::channel(ProducerState::Stopped);
        Self {
            registry,
            queue,
            source,
            cmd_rx,
            inbound_rx,
            sensor_rx,
            sensor_tx,
            fusion: SensorFusion::new(1),
            state,
            watchdog: None,
            timeout,
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<ProducerState> {
        self.state.subscribe()
    }

    fn current(&self) -> ProducerState {
        *self.state.borrow()
    }

    fn set_state(&self, state: ProducerState) {
        if self.current() != state {
            tracing::info!("Producer {:?}", state);
        }
        self.state.send_replace(state);
    }

    pub async fn run(mut self) {
        if !self.startup().await {
            return;
        }

        loop {
            let running = self.current() == ProducerState::Running;

            tokio::select! {
                cmd = self.cmd_rx.recv() => {
                    match cmd {
                        Some(ProducerCommand::Stop) => tracing::info!("Producer stop requested"),
                        None => tracing::debug!("Producer handle dropped"),
                    }
                    self.shutdown(ProducerState::Stopped);
                    break;
                }

                Some(input) = self.inbound_rx.recv() => {
                    if !self.handle_input(input) {
                        break;
                    }
                }

                Some(event) = self.sensor_rx.recv(), if running => {
                    if let Some(packet) = self.fusion.push(event) {
                        self.queue.send_sensor_data(packet);
                    }
                }

                _ = expired(&mut self.watchdog) => {
                    tracing::warn!("No acknowledgement from controller in {:?}, stopping sensors", self.timeout);
                    self.stop_capture();
                }
            }
        }
    }

    async fn startup(&mut self) -> bool {
        if self.registry.refresh().await.is_none() {
            tracing::warn!("No connected device, producer not listening");
            self.set_state(ProducerState::NotConnected);
            return false;
        }

        if !self.source.has_permission() {
            tracing::warn!("Body sensor permission missing, producer not listening");
            self.set_state(ProducerState::PermissionDenied);
            return false;
        }

        self.set_state(ProducerState::Listening);
        true
    }

    /// Returns false once the service should end
    fn handle_input(&mut self, input: ProducerInput) -> bool {
        match input {
            ProducerInput::Message(Message::StartCapture { samples_per_packet }) => {
                self.start_capture(samples_per_packet);
            }

            ProducerInput::Message(Message::MoreSensorData) => {
                if let Some(watchdog) = self.watchdog.as_mut() {
                    watchdog.as_mut().reset(Instant::now() + self.timeout);
                }
            }

            ProducerInput::Message(Message::StopCapture) => self.stop_capture(),

            ProducerInput::Message(message) => {
                tracing::debug!("Producer ignoring {}", message.topic());
            }

            ProducerInput::PeersChanged(peers) => {
                let state = if peers.is_empty() {
                    ProducerState::NotConnected
                } else {
                    ProducerState::Stopped
                };
                tracing::info!("Connected devices changed, ending producer");
                self.shutdown(state);
                return false;
            }
        }

        true
    }

    fn start_capture(&mut self, samples_per_packet: usize) {
        if self.current() == ProducerState::Running {
            tracing::info!("Capture restart requested");
            self.release_sensors();
        }

        self.fusion = SensorFusion::new(samples_per_packet);

        // No ack on failure; the controller's watchdog ends its session
        if let Err(e) = self.source.start(self.sensor_tx.clone()) {
            tracing::error!("Failed to start sensors: {:#}", e);
            self.set_state(ProducerState::Listening);
            return;
        }
        self.queue.confirm_capture_started();

        tracing::info!("Streaming {} samples per packet", samples_per_packet);
        self.watchdog = Some(Box::pin(tokio::time::sleep(self.timeout)));
        self.set_state(ProducerState::Running);
    }

    fn stop_capture(&mut self) {
        if self.current() == ProducerState::Running {
            self.release_sensors();
        }
        self.watchdog = None;
        self.set_state(ProducerState::Listening);
    }

    fn shutdown(&mut self, state: ProducerState) {
        self.release_sensors();
        self.watchdog = None;
        self.set_state(state);
    }

    /// Stop the listeners and drop whatever they had in flight
    fn release_sensors(&mut self) {
        self.source.stop();

        // A fresh channel makes any bridge still holding the old sender exit
        let (sensor_tx, sensor_rx) = mpsc::channel(SENSOR_CHANNEL_CAPACITY);
        self.sensor_tx = sensor_tx;
        self.sensor_rx = sensor_rx;

        self.fusion.reset();
    }
}

async fn expired(watchdog: &mut Option<Pin<Box<Sleep>>>) {
    match watchdog {
        Some(sleep) => sleep.as_mut().await,
        None => std::future::pending().await,
    }
}

/// Handle for communicating with the Producer
#[derive(Clone)]
pub struct ProducerHandle {
    tx: mpsc::Sender<ProducerCommand>,
    inbound: mpsc::UnboundedSender<ProducerInput>,
    state: watch::Receiver<ProducerState>,
}

impl ProducerHandle {
    pub fn new(
        tx: mpsc::Sender<ProducerCommand>,
        inbound: mpsc::UnboundedSender<ProducerInput>,
        state: watch::Receiver<ProducerState>,
    ) -> Self {
        Self { tx, inbound, state }
    }

    /// Route capture control and device changes to the producer
    pub fn register(&self, dispatcher: &Dispatcher) {
        for kind in [
            MessageKind::StartCapture,
            MessageKind::MoreSensorData,
            MessageKind::StopCapture,
        ] {
            let inbound = self.inbound.clone();
            dispatcher.register(kind, move |message| {
                let _ = inbound.send(ProducerInput::Message(message));
            });
        }

        let inbound = self.inbound.clone();
        dispatcher.on_peers_changed(move |peers| {
            let _ = inbound.send(ProducerInput::PeersChanged(peers));
        });
    }

    pub async fn stop(&self) -> Result<()> {
        if self.tx.send(ProducerCommand::Stop).await.is_err() {
            tracing::debug!("Producer already finished");
        }
        Ok(())
    }

    pub fn state(&self) -> ProducerState {
        *self.state.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<ProducerState> {
        self.state.clone()
    }
}

/// Build the producer, hook it to the dispatcher, and spawn it
pub fn spawn_producer(
    registry: Arc<Registry>,
    queue: DeliveryQueue,
    dispatcher: &Dispatcher,
    source: Box<dyn SensorSource>,
    timeout: Duration,
) -> ProducerHandle {
    let (tx, cmd_rx) = mpsc::channel(10);
    let (inbound, inbound_rx) = mpsc::unbounded_channel();

    let producer = Producer::new(registry, queue, source, cmd_rx, inbound_rx, timeout);
    let handle = ProducerHandle::new(tx, inbound, producer.subscribe());
    handle.register(dispatcher);
    tokio::spawn(producer.run());

    handle
}
