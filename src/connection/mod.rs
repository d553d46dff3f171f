pub mod dispatcher;
pub mod peer;
pub mod probe;
pub mod queue;
pub mod registry;
pub mod store;
pub mod transport;

#[cfg(test)]
pub(crate) mod testing;

pub use dispatcher::Dispatcher;
pub use peer::PeerHandle;
pub use probe::{ConnectivityProbe, ProbeError};
pub use queue::DeliveryQueue;
pub use registry::{Registry, SELECTED_PEER_KEY};
pub use store::{JsonFileStore, MemoryStore, PeerStore};
pub use transport::{LoopbackTransport, Transport, TransportEvent, loopback_pair};
