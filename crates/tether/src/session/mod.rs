mod client;
mod error;
mod events;
mod launcher;
mod matchmaker;
mod peer;
mod queue;
mod server;

pub use client::{ClientConfig, ClientState, SessionClient};
pub use error::SessionError;
pub use events::{ClientEvent, DisconnectReason, MatchmakerEvent, ServerEvent};
pub use launcher::{LaunchRequest, ProcessLauncher, ServerLauncher};
pub use matchmaker::{Matchmaker, MatchmakerConfig, SubSessionInfo};
pub use peer::{MAX_NAME_LEN, Peer, PeerTable, Rejection, is_valid_name, names_collide};
pub use queue::WaitingQueue;
pub use server::{MatchState, ServerConfig, ServerStats, SessionServer};
