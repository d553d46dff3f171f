use super::{SampleSink, SinkError};
use crate::labels::Action;
use crate::messages::StopReason;
use crate::sensor::{SamplePair, Vector3};
use anyhow::Result;
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::watch;

/// Values per timestep: three accelerometer axes then three gyroscope axes
pub const CHANNELS: usize = 6;

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ClassifierError {
    #[error("expected {expected} input values, got {actual}")]
    InputSize { expected: usize, actual: usize },

    #[error("model failed: {0}")]
    Model(String),
}

/// Activity model over a fixed window of sample pairs
///
/// `classify` receives `timesteps * channels` floats, row-major, and may block.
pub trait Classifier: Send + Sync {
    /// `(timesteps, channels)`
    fn input_shape(&self) -> (usize, usize);

    /// Number of output classes, in [`Action::ALL`] order
    fn label_count(&self) -> usize;

    fn classify(&self, input: &[f32]) -> Result<Action, ClassifierError>;
}

/// Threshold model over accelerometer variance and the gravity direction
///
/// Moving windows are split by how much the acceleration magnitude varies;
/// still windows by which axis gravity sits on.
pub struct MotionEnergyClassifier {
    window: usize,
}

impl MotionEnergyClassifier {
    const RUNNING_STDDEV: f32 = 6.0;
    const WALKING_STDDEV: f32 = 1.5;

    pub fn new(window: usize) -> Self {
        Self { window }
    }
}

impl Classifier for MotionEnergyClassifier {
    fn input_shape(&self) -> (usize, usize) {
        (self.window, CHANNELS)
    }

    fn label_count(&self) -> usize {
        Action::ALL.len()
    }

    fn classify(&self, input: &[f32]) -> Result<Action, ClassifierError> {
        let expected = self.window * CHANNELS;
        if input.len() != expected || expected == 0 {
            return Err(ClassifierError::InputSize {
                expected,
                actual: input.len(),
            });
        }

        let accel: Vec<Vector3> = input
            .chunks_exact(CHANNELS)
            .map(|row| Vector3::new(row[0], row[1], row[2]))
            .collect();
        let n = accel.len() as f32;

        let magnitudes: Vec<f32> = accel.iter().map(Vector3::magnitude).collect();
        let mean = magnitudes.iter().sum::<f32>() / n;
        let variance = magnitudes.iter().map(|m| (m - mean).powi(2)).sum::<f32>() / n;
        let stddev = variance.sqrt();

        if stddev >= Self::RUNNING_STDDEV {
            return Ok(Action::Running);
        }
        if stddev >= Self::WALKING_STDDEV {
            return Ok(Action::Walking);
        }

        let gravity = Vector3::new(
            accel.iter().map(|v| v.x).sum::<f32>() / n,
            accel.iter().map(|v| v.y).sum::<f32>() / n,
            accel.iter().map(|v| v.z).sum::<f32>() / n,
        );
        let (x, y, z) = (gravity.x.abs(), gravity.y.abs(), gravity.z.abs());

        let action = if z >= x && z >= y {
            Action::Lying
        } else if y >= x {
            Action::Standing
        } else {
            Action::Sitting
        };
        Ok(action)
    }
}

/// Feeds full windows to a classifier and publishes the latest label
///
/// Classification runs on the blocking pool. While one is in flight further
/// windows are skipped rather than queued. A classifier failure ends the
/// session on the next write.
pub struct RecognitionSink {
    classifier: Arc<dyn Classifier>,
    window: usize,
    in_flight: Arc<AtomicBool>,
    failure: Arc<Mutex<Option<String>>>,
    label: Arc<watch::Sender<Option<Action>>>,
}

impl RecognitionSink {
    pub fn new(classifier: Arc<dyn Classifier>, window: usize) -> Self {
        let (label, _) = watch::channel(None);
        Self {
            classifier,
            window,
            in_flight: Arc::new(AtomicBool::new(false)),
            failure: Arc::new(Mutex::new(None)),
            label: Arc::new(label),
        }
    }

    pub fn window(&self) -> usize {
        self.window
    }

    pub fn latest(&self) -> Option<Action> {
        *self.label.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<Option<Action>> {
        self.label.subscribe()
    }

    fn flatten(samples: &[SamplePair]) -> Vec<f32> {
        samples.iter().flat_map(SamplePair::to_array).collect()
    }
}

#[async_trait]
impl SampleSink for RecognitionSink {
    async fn open(&mut self) -> Result<(), StopReason> {
        let shape = self.classifier.input_shape();
        let labels = self.classifier.label_count();

        if shape != (self.window, CHANNELS) || labels != Action::ALL.len() {
            tracing::error!(
                "Model takes {:?} with {} labels, expected ({}, {}) with {}",
                shape,
                labels,
                self.window,
                CHANNELS,
                Action::ALL.len()
            );
            return Err(StopReason::ModelNotCompatible);
        }

        self.failure
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        self.label.send_replace(None);
        Ok(())
    }

    fn write_samples(&mut self, samples: &[SamplePair]) -> Result<(), SinkError> {
        if let Some(e) = self
            .failure
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            return Err(SinkError::Recognition(e));
        }

        if samples.len() != self.window {
            tracing::debug!(
                "Skipping packet of {} samples, model needs {}",
                samples.len(),
                self.window
            );
            return Ok(());
        }

        if self.in_flight.swap(true, Ordering::AcqRel) {
            tracing::debug!("Classifier busy, skipping window");
            return Ok(());
        }

        let input = Self::flatten(samples);
        let classifier = self.classifier.clone();
        let in_flight = self.in_flight.clone();
        let failure = self.failure.clone();
        let label = self.label.clone();

        tokio::task::spawn_blocking(move || {
            match classifier.classify(&input) {
                Ok(action) => {
                    tracing::debug!("Recognised {}", action);
                    label.send_replace(Some(action));
                }
                Err(e) => {
                    tracing::error!("Classification failed: {}", e);
                    *failure.lock().unwrap_or_else(PoisonError::into_inner) = Some(e.to_string());
                }
            }
            in_flight.store(false, Ordering::Release);
        });

        Ok(())
    }

    async fn finalize(&mut self) -> Result<()> {
        tracing::info!("Recognition stopped, last label {:?}", self.latest());
        Ok(())
    }
}
