use motionlink::app::App;
use motionlink::config::{Config, Mode};
use motionlink::connection::{JsonFileStore, MemoryStore, PeerHandle, loopback_pair};
use motionlink::labels::Action;
use motionlink::messages::{ControllerState, Role, SessionStatus};
use motionlink::sensor::SimulatedImu;
use motionlink::sink::{CsvSink, MotionEnergyClassifier, RecognitionSink};

use anyhow::Result;
use std::sync::Arc;
use tokio::sync::watch;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    tracing::info!("Starting motionlink sensor streaming daemon");

    let config = Config::load()?;
    config.validate()?;

    run(config).await
}

async fn run(config: Config) -> Result<()> {
    // Both devices live in this process, joined by an in-memory link
    let ((phone_link, phone_events), (watch_link, watch_events)) = loopback_pair(
        PeerHandle::new("phone-1", "Phone"),
        PeerHandle::new("watch-1", "Watch"),
    );

    let watch = App::new(
        Role::Producer,
        Arc::new(watch_link),
        watch_events,
        Arc::new(MemoryStore::new()),
        config.probe_timeout(),
    )
    .await;
    let producer = watch.spawn_producer(
        Box::new(SimulatedImu::new(config.sensor_rate_hz)),
        config.producer_timeout(),
    );

    let phone = App::new(
        Role::Controller,
        Arc::new(phone_link),
        phone_events,
        Arc::new(JsonFileStore::open(&config.store_path)),
        config.probe_timeout(),
    )
    .await;

    if phone.registry().active_peer().is_none() {
        let Some(peer) = phone.registry().list_connected_peers().await.into_iter().next() else {
            anyhow::bail!("No connected device to pair with");
        };
        phone.registry().select_peer(peer).await;
    }

    match phone.probe().test_connection().await {
        Ok(elapsed) => tracing::info!("Connection test took {:?}", elapsed),
        Err(e) => tracing::warn!("Connection test failed: {}", e),
    }

    let (session, mut labels) = match config.mode {
        Mode::Train => {
            let sink = CsvSink::new(&config.sessions_dir, config.training_metadata());
            (phone.training_session(config.training_settings(), sink), None)
        }
        Mode::Recognize => {
            let classifier = Arc::new(MotionEnergyClassifier::new(config.recognition_window));
            let sink = RecognitionSink::new(classifier, config.recognition_window);
            let labels = sink.subscribe();
            (
                phone.recognition_session(config.recognition_settings(), sink),
                Some(labels),
            )
        }
    };

    let mut status = session.subscribe();
    session.start().await?;

    tracing::info!("Ready! Press Ctrl+C to stop the session");

    loop {
        tokio::select! {
            changed = status.changed() => {
                if changed.is_err() {
                    break;
                }
                let current = status.borrow_and_update().clone();
                log_status(&current);
                if current.state == ControllerState::Idle && current.stop_reason.is_some() {
                    break;
                }
            }

            Some(action) = next_label(&mut labels) => {
                tracing::info!("Recognised activity: {}", action);
            }

            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Received Ctrl+C, shutting down");
                let samples = session.stop().await?;
                tracing::info!("Session stopped after {} samples", samples);
                break;
            }
        }
    }

    producer.stop().await?;
    phone.queue().wait_idle().await;
    watch.queue().wait_idle().await;

    tracing::info!("motionlink shutdown complete");
    Ok(())
}

fn log_status(status: &SessionStatus) {
    match status.state {
        ControllerState::DelayedStart { remaining } => {
            tracing::info!("Starting in {}s", remaining.as_secs());
        }
        ControllerState::Waiting => tracing::info!("Waiting for the watch to start capture"),
        ControllerState::Receiving => tracing::debug!(
            "{} samples in {} packets",
            status.samples_captured,
            status.packets_received
        ),
        ControllerState::Idle => match status.stop_reason {
            Some(reason) => tracing::info!(
                "Session ended ({:?}) with {} samples",
                reason,
                status.samples_captured
            ),
            None => tracing::debug!("Session idle"),
        },
    }
}

async fn next_label(labels: &mut Option<watch::Receiver<Option<Action>>>) -> Option<Action> {
    let Some(rx) = labels else {
        return std::future::pending().await;
    };
    if rx.changed().await.is_err() {
        return std::future::pending().await;
    }
    *rx.borrow_and_update()
}
