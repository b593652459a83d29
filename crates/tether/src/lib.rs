pub mod net;
pub mod replication;
pub mod session;

pub use net::{
    DEFAULT_MATCHMAKER_PORT, DEFAULT_PORT, DEFAULT_TICK_RATE, Endpoint, EndpointEvent, Envelope,
    FieldValue, InstanceId, MessageType, NetConfig, NetworkStats, PacketLossSimulation, Payload,
    PeerId, PeerInfo, Priority, Route, RouteStep, SERVER_PEER_ID, SpawnInfo, Transform,
};
pub use replication::{
    DynamicObject, EnumField, Field, PrefabFactory, Replicate, ReplicationEngine,
    ReplicationError, WireEnum,
};
pub use session::{
    ClientConfig, ClientEvent, ClientState, DisconnectReason, LaunchRequest, MatchState,
    Matchmaker, MatchmakerConfig, MatchmakerEvent, ProcessLauncher, ServerConfig, ServerEvent,
    ServerLauncher, SessionClient, SessionError, SessionServer,
};
