use std::io;

use thiserror::Error;

use crate::net::CodecError;
use crate::replication::ReplicationError;

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("socket error: {0}")]
    Io(#[from] io::Error),

    #[error(transparent)]
    Codec(#[from] CodecError),

    #[error(transparent)]
    Replication(#[from] ReplicationError),

    #[error("invalid user name {0:?}")]
    InvalidName(String),

    #[error("not connected")]
    NotConnected,

    #[error("session is shut down")]
    ShutDown,

    #[error("failed to launch server on port {port}: {reason}")]
    Launch { port: u16, reason: String },

    #[error("no free port in {start}..={end}")]
    NoFreePort { start: u16, end: u16 },
}
