use crate::connection::{
    ConnectivityProbe, DeliveryQueue, Dispatcher, PeerStore, Registry, Transport, TransportEvent,
};
use crate::messages::{MessageKind, Role, SessionKind};
use crate::sensor::SensorSource;
use crate::services::{ProducerHandle, SessionHandle, SessionSettings, spawn_producer, spawn_session};
use crate::sink::{CsvSink, RecognitionSink};

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

/// Everything one device process owns: the link to its peer and the
/// services built on top of it
///
/// The registry, queue and dispatcher are constructed once here and shared
/// with the sessions by reference count.
pub struct App {
    role: Role,
    queue: DeliveryQueue,
    registry: Arc<Registry>,
    dispatcher: Arc<Dispatcher>,
    probe: Arc<ConnectivityProbe>,
}

impl App {
    pub async fn new(
        role: Role,
        transport: Arc<dyn Transport>,
        events: mpsc::UnboundedReceiver<TransportEvent>,
        store: Arc<dyn PeerStore>,
        probe_timeout: Duration,
    ) -> Self {
        let queue = DeliveryQueue::new(role, transport.clone());
        let registry = Arc::new(Registry::new(role, transport, store, queue.clone()));
        registry.refresh().await;

        let dispatcher = Arc::new(Dispatcher::new(registry.clone()));
        let probe = Arc::new(ConnectivityProbe::new(
            registry.clone(),
            queue.clone(),
            probe_timeout,
        ));

        let responder = probe.clone();
        match role {
            Role::Controller => {
                dispatcher.register(MessageKind::TestConnectionResponse, move |_| {
                    responder.on_response()
                });
            }
            Role::Producer => {
                dispatcher.register(MessageKind::TestConnection, move |_| {
                    responder.respond_to_test()
                });
            }
        }

        tokio::spawn(dispatcher.clone().run(events));
        tracing::info!("{:?} node ready", role);

        Self {
            role,
            queue,
            registry,
            dispatcher,
            probe,
        }
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn queue(&self) -> &DeliveryQueue {
        &self.queue
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }

    pub fn probe(&self) -> &Arc<ConnectivityProbe> {
        &self.probe
    }

    pub fn training_session(&self, settings: SessionSettings, sink: CsvSink) -> SessionHandle {
        spawn_session(
            SessionKind::Training,
            settings,
            self.queue.clone(),
            self.dispatcher.clone(),
            Box::new(sink),
        )
    }

    pub fn recognition_session(
        &self,
        settings: SessionSettings,
        sink: RecognitionSink,
    ) -> SessionHandle {
        spawn_session(
            SessionKind::Recognition,
            settings,
            self.queue.clone(),
            self.dispatcher.clone(),
            Box::new(sink),
        )
    }

    pub fn spawn_producer(
        &self,
        source: Box<dyn SensorSource>,
        timeout: Duration,
    ) -> ProducerHandle {
        spawn_producer(
            self.registry.clone(),
            self.queue.clone(),
            &self.dispatcher,
            source,
            timeout,
        )
    }
}
