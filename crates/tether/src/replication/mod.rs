mod dynamic;
mod engine;
mod error;
mod field;
mod registry;

pub use dynamic::DynamicObject;
pub use engine::{PrefabFactory, ReplicationEngine};
pub use error::ReplicationError;
pub use field::{AsAny, EnumField, Field, MAX_COLLECTION_LEN, Replicate, RouteWalker, WireEnum};
pub use registry::{Replica, ReplicaRegistry};
