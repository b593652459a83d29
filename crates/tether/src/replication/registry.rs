use std::collections::BTreeMap;

use super::error::ReplicationError;
use super::field::Replicate;
use crate::net::{InstanceId, PeerId, SpawnInfo, Transform};

pub struct Replica {
    pub instance_id: InstanceId,
    pub owner_id: PeerId,
    pub prefab_id: u32,
    pub transform: Transform,
    pub parent_id: Option<InstanceId>,
    object: Box<dyn Replicate>,
}

impl Replica {
    pub fn object(&self) -> &dyn Replicate {
        self.object.as_ref()
    }

    pub fn object_mut(&mut self) -> &mut dyn Replicate {
        self.object.as_mut()
    }

    pub fn downcast_ref<T: Replicate + 'static>(&self) -> Option<&T> {
        self.object.as_ref().as_any().downcast_ref()
    }

    pub fn downcast_mut<T: Replicate + 'static>(&mut self) -> Option<&mut T> {
        self.object.as_mut().as_any_mut().downcast_mut()
    }

    pub fn spawn_info(&self) -> SpawnInfo {
        SpawnInfo {
            instance_id: self.instance_id,
            owner_id: self.owner_id,
            prefab_id: self.prefab_id,
            transform: self.transform,
            parent_id: self.parent_id,
        }
    }
}

impl std::fmt::Debug for Replica {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Replica")
            .field("instance_id", &self.instance_id)
            .field("owner_id", &self.owner_id)
            .field("prefab_id", &self.prefab_id)
            .field("parent_id", &self.parent_id)
            .finish_non_exhaustive()
    }
}

/// Every replicated object known to one participant, keyed by instance id.
#[derive(Debug)]
pub struct ReplicaRegistry {
    replicas: BTreeMap<InstanceId, Replica>,
    next_instance_id: InstanceId,
}

impl Default for ReplicaRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ReplicaRegistry {
    pub fn new() -> Self {
        Self {
            replicas: BTreeMap::new(),
            next_instance_id: 1,
        }
    }

    /// Hands out the next unused instance id. Only the server allocates.
    pub fn allocate_id(&mut self) -> InstanceId {
        while self.replicas.contains_key(&self.next_instance_id) || self.next_instance_id == 0 {
            self.next_instance_id = self.next_instance_id.wrapping_add(1);
        }
        let id = self.next_instance_id;
        self.next_instance_id = self.next_instance_id.wrapping_add(1);
        id
    }

    pub fn insert(
        &mut self,
        info: SpawnInfo,
        object: Box<dyn Replicate>,
    ) -> Result<(), ReplicationError> {
        if self.replicas.contains_key(&info.instance_id) {
            return Err(ReplicationError::DuplicateInstance(info.instance_id));
        }
        self.replicas.insert(
            info.instance_id,
            Replica {
                instance_id: info.instance_id,
                owner_id: info.owner_id,
                prefab_id: info.prefab_id,
                transform: info.transform,
                parent_id: info.parent_id,
                object,
            },
        );
        Ok(())
    }

    pub fn remove(&mut self, instance_id: InstanceId) -> Option<Replica> {
        self.replicas.remove(&instance_id)
    }

    /// Removes `instance_id` and every object parented below it. Returns the
    /// removed ids, root first.
    pub fn remove_tree(&mut self, instance_id: InstanceId) -> Vec<InstanceId> {
        let mut removed = Vec::new();
        let mut pending = vec![instance_id];
        while let Some(id) = pending.pop() {
            if self.replicas.remove(&id).is_none() {
                continue;
            }
            removed.push(id);
            pending.extend(
                self.replicas
                    .values()
                    .filter(|r| r.parent_id == Some(id))
                    .map(|r| r.instance_id),
            );
        }
        removed
    }

    /// Owner-disconnect cascade: removes everything the peer owns along with
    /// the children of those objects.
    pub fn remove_owned_by(&mut self, owner_id: PeerId) -> Vec<InstanceId> {
        let roots = self.owned_by(owner_id);
        let mut removed = Vec::new();
        for id in roots {
            removed.extend(self.remove_tree(id));
        }
        removed
    }

    pub fn get(&self, instance_id: InstanceId) -> Option<&Replica> {
        self.replicas.get(&instance_id)
    }

    pub fn get_mut(&mut self, instance_id: InstanceId) -> Option<&mut Replica> {
        self.replicas.get_mut(&instance_id)
    }

    pub fn contains(&self, instance_id: InstanceId) -> bool {
        self.replicas.contains_key(&instance_id)
    }

    pub fn owned_by(&self, owner_id: PeerId) -> Vec<InstanceId> {
        self.replicas
            .values()
            .filter(|r| r.owner_id == owner_id)
            .map(|r| r.instance_id)
            .collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Replica> {
        self.replicas.values()
    }

    /// Spawn announcements for everything registered, parents before children.
    pub fn spawn_infos(&self) -> Vec<SpawnInfo> {
        let mut infos = Vec::with_capacity(self.replicas.len());
        let mut emitted = std::collections::HashSet::new();
        let mut remaining: Vec<&Replica> = self.replicas.values().collect();

        while !remaining.is_empty() {
            let before = remaining.len();
            remaining.retain(|r| {
                let ready = match r.parent_id {
                    Some(parent) => emitted.contains(&parent) || !self.replicas.contains_key(&parent),
                    None => true,
                };
                if ready {
                    infos.push(r.spawn_info());
                    emitted.insert(r.instance_id);
                }
                !ready
            });
            if remaining.len() == before {
                // Parent cycle; emit the rest as-is.
                infos.extend(remaining.drain(..).map(Replica::spawn_info));
            }
        }
        infos
    }

    pub fn len(&self) -> usize {
        self.replicas.len()
    }

    pub fn is_empty(&self) -> bool {
        self.replicas.is_empty()
    }

    pub fn clear(&mut self) {
        self.replicas.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Default)]
    struct Marker {
        value: i32,
    }

    crate::impl_replicate!(Marker { 1 => value });

    fn info(instance_id: InstanceId, owner_id: PeerId, parent_id: Option<InstanceId>) -> SpawnInfo {
        SpawnInfo {
            instance_id,
            owner_id,
            prefab_id: 1,
            transform: Transform::default(),
            parent_id,
        }
    }

    fn registry_with(entries: &[(InstanceId, PeerId, Option<InstanceId>)]) -> ReplicaRegistry {
        let mut registry = ReplicaRegistry::new();
        for &(id, owner, parent) in entries {
            registry
                .insert(info(id, owner, parent), Box::new(Marker::default()))
                .unwrap();
        }
        registry
    }

    #[test]
    fn test_duplicate_instance_rejected() {
        let mut registry = registry_with(&[(1, 1, None)]);
        let err = registry
            .insert(info(1, 2, None), Box::new(Marker::default()))
            .unwrap_err();
        assert_eq!(err, ReplicationError::DuplicateInstance(1));
        assert_eq!(registry.get(1).unwrap().owner_id, 1);
    }

    #[test]
    fn test_allocate_skips_used_ids() {
        let mut registry = registry_with(&[(1, 0, None), (2, 0, None)]);
        assert_eq!(registry.allocate_id(), 3);
        assert_eq!(registry.allocate_id(), 4);
    }

    #[test]
    fn test_owner_cascade_removes_children() {
        let mut registry =
            registry_with(&[(1, 7, None), (2, 0, Some(1)), (3, 0, Some(2)), (4, 8, None)]);

        let mut removed = registry.remove_owned_by(7);
        removed.sort();
        assert_eq!(removed, vec![1, 2, 3]);
        assert_eq!(registry.len(), 1);
        assert!(registry.contains(4));
    }

    #[test]
    fn test_spawn_infos_put_parents_first() {
        let registry = registry_with(&[(1, 0, Some(3)), (2, 0, None), (3, 0, Some(2))]);
        let order: Vec<_> = registry.spawn_infos().iter().map(|i| i.instance_id).collect();
        assert_eq!(order, vec![2, 3, 1]);
    }

    #[test]
    fn test_downcast() {
        let mut registry = registry_with(&[(5, 1, None)]);
        registry
            .get_mut(5)
            .unwrap()
            .downcast_mut::<Marker>()
            .unwrap()
            .value = 12;
        assert_eq!(registry.get(5).unwrap().downcast_ref::<Marker>().unwrap().value, 12);
    }
}
