pub mod csv;
pub mod recognition;

pub use csv::{CsvSink, TrainingMetadata};
pub use recognition::{Classifier, ClassifierError, MotionEnergyClassifier, RecognitionSink};

use crate::messages::StopReason;
use crate::sensor::SamplePair;
use anyhow::Result;
use async_trait::async_trait;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SinkError {
    #[error("failed to write samples: {0}")]
    Write(String),

    #[error("recognition failed: {0}")]
    Recognition(String),
}

impl SinkError {
    /// How a controller session reports this failure
    pub fn stop_reason(&self) -> StopReason {
        match self {
            SinkError::Write(_) => StopReason::CsvWriteFailed,
            SinkError::Recognition(_) => StopReason::RecognitionError,
        }
    }
}

/// Where a controller session puts the samples it receives
///
/// A sink is opened at the start of every session and finalized when the
/// session leaves capture, so one sink serves many sessions in turn.
#[async_trait]
pub trait SampleSink: Send {
    /// Prepare for a new session; the error is reported as the stop reason
    async fn open(&mut self) -> Result<(), StopReason>;

    /// Called from the session task for every accepted packet
    fn write_samples(&mut self, samples: &[SamplePair]) -> Result<(), SinkError>;

    async fn finalize(&mut self) -> Result<()>;
}
