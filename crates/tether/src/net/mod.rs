pub mod codec;
mod config;
mod endpoint;
mod liveness;
mod ordering;
mod protocol;
mod reliability;
mod stats;
mod transport;

pub use codec::{CodecError, decode, digest, encode};
pub use config::NetConfig;
pub use endpoint::{Endpoint, EndpointEvent};
pub use liveness::{LivenessMonitor, LivenessTick};
pub use ordering::{FIRST_ORDER, OrderingFilter, Verdict};
pub use protocol::{
    DEFAULT_MATCHMAKER_PORT, DEFAULT_PORT, DEFAULT_TICK_RATE, Envelope, FieldValue, InstanceId,
    MAX_PACKET_SIZE, MessageType, Payload, PeerId, PeerInfo, Priority, Route, RouteStep,
    SERVER_PEER_ID, SpawnInfo, Transform, sequence_greater_than,
};
pub use reliability::{AckOutcome, PendingEnvelope, ReliabilityLayer};
pub use stats::{NetworkStats, PacketLossSimulation};
pub use transport::{Datagram, Transport};
