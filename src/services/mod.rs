pub mod controller;
pub mod producer;

pub use controller::{
    ControllerSession, DEFAULT_PEER_TIMEOUT, SessionHandle, SessionSettings, ack_interval,
    spawn_session,
};
pub use producer::{DEFAULT_PRODUCER_TIMEOUT, Producer, ProducerHandle, spawn_producer};
