use thiserror::Error;

use crate::net::{InstanceId, PeerId};

/// Reasons a replicated write or spawn was refused.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ReplicationError {
    #[error("route does not name a field")]
    EmptyRoute,

    #[error("no replicated object with instance id {0}")]
    UnknownInstance(InstanceId),

    #[error("instance id {0} is already registered")]
    DuplicateInstance(InstanceId),

    #[error("no field with tag {0}")]
    UnknownField(u32),

    #[error("expected a {expected} value, got {found}")]
    TypeMismatch {
        expected: &'static str,
        found: &'static str,
    },

    #[error("{0} is not a valid discriminant")]
    UnknownEnumValue(u32),

    #[error("field {0} is not a collection but the route carries an index")]
    UnexpectedIndex(u32),

    #[error("collection element requires an index")]
    MissingIndex,

    #[error("route continues past a leaf")]
    RouteTooLong,

    #[error("index {index} is past the end of a collection of {len}")]
    IndexOutOfRange { index: u32, len: usize },

    #[error("collection is full")]
    TooManyElements,

    #[error("instance {0} is owned locally")]
    LocallyOwned(InstanceId),

    #[error("peer {from} may not write instance {instance_id} owned by {owner}")]
    NotOwner {
        instance_id: InstanceId,
        from: PeerId,
        owner: PeerId,
    },

    #[error("field {field_tag} of instance {instance_id} is written by the server only")]
    ServerOnly {
        instance_id: InstanceId,
        field_tag: u32,
    },

    #[error("no prefab registered for id {0}")]
    UnknownPrefab(u32),
}
