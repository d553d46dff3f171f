use super::fusion::SensorEvent;
use super::sample::Vector3;
use anyhow::{Context, Result};
use futures::StreamExt;
use futures::stream;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Source of accelerometer and gyroscope events
///
/// `start` registers the listeners and forwards events on `tx` until `stop`
/// is called (or the receiver is dropped).
pub trait SensorSource: Send {
    /// Whether the process may read the body sensors at all
    fn has_permission(&self) -> bool {
        true
    }

    fn start(&mut self, tx: mpsc::Sender<SensorEvent>) -> Result<()>;

    fn stop(&mut self);
}

/// Synthetic IMU that emits interleaved accelerometer/gyroscope events
///
/// Each tick produces one accelerometer event followed half a period later by
/// one gyroscope event, so a consumer sees `rate_hz` pairs per second.
pub struct SimulatedImu {
    rate_hz: u32,
    task: Option<JoinHandle<()>>,
}

impl SimulatedImu {
    pub fn new(rate_hz: u32) -> Self {
        Self {
            rate_hz: rate_hz.max(1),
            task: None,
        }
    }

    fn reading(step: u64, rate_hz: u32) -> SensorEvent {
        let t = (step / 2) as f32 / rate_hz as f32;
        let phase = std::f32::consts::TAU * 1.6 * t;

        if step % 2 == 0 {
            SensorEvent::Accelerometer(Vector3::new(
                2.0 * phase.sin(),
                1.5 * phase.cos(),
                9.81 + 0.3 * (2.0 * phase).sin(),
            ))
        } else {
            SensorEvent::Gyroscope(Vector3::new(
                0.8 * phase.cos(),
                0.4 * (0.5 * phase).sin(),
                -0.2 * phase.sin(),
            ))
        }
    }

    async fn bridge_task(rate_hz: u32, tx: mpsc::Sender<SensorEvent>) {
        let half_period = Duration::from_secs_f64(0.5 / rate_hz as f64);
        let mut interval = tokio::time::interval(half_period);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        let events = stream::unfold((interval, 0u64), move |(mut interval, step)| async move {
            interval.tick().await;
            Some((Self::reading(step, rate_hz), (interval, step + 1)))
        });
        tokio::pin!(events);

        while let Some(event) = events.next().await {
            if tx.send(event).await.is_err() {
                break;
            }
        }

        tracing::debug!("Simulated IMU bridge exited");
    }
}

impl SensorSource for SimulatedImu {
    fn start(&mut self, tx: mpsc::Sender<SensorEvent>) -> Result<()> {
        self.stop();

        let runtime = tokio::runtime::Handle::try_current()
            .context("Simulated IMU needs a running tokio runtime")?;
        self.task = Some(runtime.spawn(Self::bridge_task(self.rate_hz, tx)));

        tracing::info!("Simulated IMU started at {} Hz", self.rate_hz);
        Ok(())
    }

    fn stop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
            tracing::info!("Simulated IMU stopped");
        }
    }
}

impl Drop for SimulatedImu {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_emits_alternating_events() {
        let (tx, mut rx) = mpsc::channel(16);
        let mut imu = SimulatedImu::new(50);
        imu.start(tx).unwrap();

        let first = rx.recv().await.unwrap();
        let second = rx.recv().await.unwrap();
        let third = rx.recv().await.unwrap();

        assert!(matches!(first, SensorEvent::Accelerometer(_)));
        assert!(matches!(second, SensorEvent::Gyroscope(_)));
        assert!(matches!(third, SensorEvent::Accelerometer(_)));

        imu.stop();
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_closes_the_stream() {
        let (tx, mut rx) = mpsc::channel(16);
        let mut imu = SimulatedImu::new(10);
        imu.start(tx).unwrap();
        rx.recv().await.unwrap();

        imu.stop();

        // the aborted task drops its sender; buffered events may still drain
        while rx.recv().await.is_some() {}
    }
}
