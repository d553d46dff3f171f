pub mod fusion;
pub mod sample;
pub mod source;

pub use fusion::{SensorEvent, SensorFusion};
pub use sample::{PacketError, SamplePair, SensorPacket, Vector3};
pub use source::{SensorSource, SimulatedImu};
