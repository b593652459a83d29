use super::error::ReplicationError;
use super::field::{Replicate, RouteWalker};
use super::registry::{Replica, ReplicaRegistry};
use crate::net::{FieldValue, InstanceId, PeerId, Route, SERVER_PEER_ID, SpawnInfo, Transform};

/// Builds the game-side object for a spawned prefab.
pub trait PrefabFactory: Send {
    fn create(&mut self, prefab_id: u32, transform: &Transform) -> Option<Box<dyn Replicate>>;
}

impl<F> PrefabFactory for F
where
    F: FnMut(u32, &Transform) -> Option<Box<dyn Replicate>> + Send,
{
    fn create(&mut self, prefab_id: u32, transform: &Transform) -> Option<Box<dyn Replicate>> {
        self(prefab_id, transform)
    }
}

/// Mirrors tagged object fields between peers. Every tick the owner's full
/// state is collected; remote writes are checked against ownership before
/// being applied.
pub struct ReplicationEngine {
    registry: ReplicaRegistry,
    factory: Box<dyn PrefabFactory>,
}

impl ReplicationEngine {
    pub fn new<F: PrefabFactory + 'static>(factory: F) -> Self {
        Self {
            registry: ReplicaRegistry::new(),
            factory: Box::new(factory),
        }
    }

    pub fn registry(&self) -> &ReplicaRegistry {
        &self.registry
    }

    pub fn registry_mut(&mut self) -> &mut ReplicaRegistry {
        &mut self.registry
    }

    pub fn get<T: Replicate + 'static>(&self, instance_id: InstanceId) -> Option<&T> {
        self.registry.get(instance_id)?.downcast_ref()
    }

    pub fn get_mut<T: Replicate + 'static>(&mut self, instance_id: InstanceId) -> Option<&mut T> {
        self.registry.get_mut(instance_id)?.downcast_mut()
    }

    /// Builds the prefab and registers it under `info.instance_id`.
    pub fn spawn(&mut self, info: SpawnInfo) -> Result<(), ReplicationError> {
        if self.registry.contains(info.instance_id) {
            return Err(ReplicationError::DuplicateInstance(info.instance_id));
        }
        let object = self
            .factory
            .create(info.prefab_id, &info.transform)
            .ok_or(ReplicationError::UnknownPrefab(info.prefab_id))?;
        self.registry.insert(info, object)
    }

    /// Server side of an instantiation request: assigns a fresh instance id,
    /// registers the object and returns the announcement to broadcast.
    pub fn instantiate(
        &mut self,
        owner_id: PeerId,
        prefab_id: u32,
        transform: Transform,
        parent_id: Option<InstanceId>,
    ) -> Result<SpawnInfo, ReplicationError> {
        if let Some(parent) = parent_id {
            if !self.registry.contains(parent) {
                return Err(ReplicationError::UnknownInstance(parent));
            }
        }
        let info = SpawnInfo {
            instance_id: self.registry.allocate_id(),
            owner_id,
            prefab_id,
            transform,
            parent_id,
        };
        self.spawn(info.clone())?;
        Ok(info)
    }

    /// Destroys the object and its children. Returns the removed ids.
    pub fn destroy(&mut self, instance_id: InstanceId) -> Vec<InstanceId> {
        self.registry.remove_tree(instance_id)
    }

    pub fn destroy_owned_by(&mut self, owner_id: PeerId) -> Vec<InstanceId> {
        self.registry.remove_owned_by(owner_id)
    }

    pub fn clear(&mut self) {
        self.registry.clear();
    }

    /// Full state of every leaf `local_peer` is authoritative for.
    ///
    /// Peers push their own objects except server-writable fields; the server
    /// pushes its own objects plus the server-writable fields of everyone's.
    pub fn collect_updates(&self, local_peer: PeerId) -> Vec<(Route, FieldValue)> {
        let is_server = local_peer == SERVER_PEER_ID;
        let mut updates = Vec::new();

        for replica in self.registry.iter() {
            let owned = replica.owner_id == local_peer;
            if !owned && !is_server {
                continue;
            }

            let object = replica.object();
            let mut walker = RouteWalker::new(replica.instance_id);
            object.walk(&mut walker);

            updates.extend(walker.finish().into_iter().filter(|(route, _)| {
                let server_writable = route
                    .field_path()
                    .first()
                    .is_some_and(|step| object.server_writable(step.field_tag));
                if is_server {
                    owned || server_writable
                } else {
                    !server_writable
                }
            }));
        }
        updates
    }

    /// Applies a field update received from `from`.
    pub fn apply_update(
        &mut self,
        from: PeerId,
        local_peer: PeerId,
        route: &Route,
        value: FieldValue,
    ) -> Result<(), ReplicationError> {
        let instance_id = route.instance_id().ok_or(ReplicationError::EmptyRoute)?;
        let step = route
            .field_path()
            .first()
            .ok_or(ReplicationError::EmptyRoute)?;
        let replica = self
            .registry
            .get_mut(instance_id)
            .ok_or(ReplicationError::UnknownInstance(instance_id))?;

        check_authority(replica, from, local_peer, step.field_tag)?;
        replica.object_mut().apply(route.field_path(), value)
    }

    /// Applies an update forwarded by the server. The server checked the
    /// author already, so the write is attributed to whoever may write the
    /// field: the server for server-writable fields, the owner otherwise.
    pub fn apply_relayed(
        &mut self,
        local_peer: PeerId,
        route: &Route,
        value: FieldValue,
    ) -> Result<(), ReplicationError> {
        let instance_id = route.instance_id().ok_or(ReplicationError::EmptyRoute)?;
        let step = route
            .field_path()
            .first()
            .ok_or(ReplicationError::EmptyRoute)?;
        let replica = self
            .registry
            .get(instance_id)
            .ok_or(ReplicationError::UnknownInstance(instance_id))?;
        let author = if replica.object().server_writable(step.field_tag) {
            SERVER_PEER_ID
        } else {
            replica.owner_id
        };
        self.apply_update(author, local_peer, route, value)
    }
}

fn check_authority(
    replica: &Replica,
    from: PeerId,
    local_peer: PeerId,
    field_tag: u32,
) -> Result<(), ReplicationError> {
    let server_writable = replica.object().server_writable(field_tag);
    if server_writable {
        if from != SERVER_PEER_ID {
            return Err(ReplicationError::ServerOnly {
                instance_id: replica.instance_id,
                field_tag,
            });
        }
        return Ok(());
    }

    if replica.owner_id == local_peer {
        return Err(ReplicationError::LocallyOwned(replica.instance_id));
    }
    if replica.owner_id != from {
        return Err(ReplicationError::NotOwner {
            instance_id: replica.instance_id,
            from,
            owner: replica.owner_id,
        });
    }
    Ok(())
}
