use std::collections::{BTreeMap, BTreeSet};

use super::error::ReplicationError;
use super::field::{MAX_COLLECTION_LEN, Replicate, RouteWalker};
use crate::net::{FieldValue, RouteStep};

/// An object without a compiled layout. Every leaf written to it is kept
/// under its field path, so a host can mirror prefabs it knows nothing about.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DynamicObject {
    leaves: BTreeMap<Vec<RouteStep>, FieldValue>,
    server_writable: BTreeSet<u32>,
}

impl DynamicObject {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_server_writable(tags: impl IntoIterator<Item = u32>) -> Self {
        Self {
            leaves: BTreeMap::new(),
            server_writable: tags.into_iter().collect(),
        }
    }

    pub fn get(&self, path: &[RouteStep]) -> Option<&FieldValue> {
        self.leaves.get(path)
    }

    pub fn set(&mut self, path: &[RouteStep], value: FieldValue) -> Result<(), ReplicationError> {
        if path.is_empty() {
            return Err(ReplicationError::EmptyRoute);
        }
        if !self.leaves.contains_key(path) && self.leaves.len() >= MAX_COLLECTION_LEN {
            return Err(ReplicationError::TooManyElements);
        }
        self.leaves.insert(path.to_vec(), value);
        Ok(())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&[RouteStep], &FieldValue)> {
        self.leaves.iter().map(|(path, value)| (path.as_slice(), value))
    }

    pub fn len(&self) -> usize {
        self.leaves.len()
    }

    pub fn is_empty(&self) -> bool {
        self.leaves.is_empty()
    }
}

impl Replicate for DynamicObject {
    fn walk(&self, walker: &mut RouteWalker) {
        for (path, value) in &self.leaves {
            walker.leaf_at(path, value.clone());
        }
    }

    fn apply(&mut self, path: &[RouteStep], value: FieldValue) -> Result<(), ReplicationError> {
        self.set(path, value)
    }

    fn server_writable(&self, field_tag: u32) -> bool {
        self.server_writable.contains(&field_tag)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::Route;

    #[test]
    fn test_walk_reproduces_written_leaves() {
        let mut object = DynamicObject::new();
        let hp = [RouteStep::field(1)];
        let slot = [RouteStep::indexed(2, 3), RouteStep::field(1)];
        object.apply(&hp, FieldValue::Int(10)).unwrap();
        object.apply(&slot, FieldValue::Str("sword".into())).unwrap();
        object.apply(&hp, FieldValue::Int(7)).unwrap();

        let mut walker = RouteWalker::new(5);
        Replicate::walk(&object, &mut walker);
        let leaves = walker.finish();

        assert_eq!(leaves.len(), 2);
        assert_eq!(
            leaves[0],
            (Route::new(5).with(RouteStep::field(1)), FieldValue::Int(7))
        );
        assert_eq!(leaves[1].0.field_path(), &slot);
    }

    #[test]
    fn test_rejects_empty_path_and_overflow() {
        let mut object = DynamicObject::new();
        assert_eq!(
            object.apply(&[], FieldValue::Bool(true)),
            Err(ReplicationError::EmptyRoute)
        );
        for i in 0..MAX_COLLECTION_LEN as u32 {
            object
                .apply(&[RouteStep::indexed(1, i)], FieldValue::Uint(i))
                .unwrap();
        }
        assert_eq!(
            object.apply(&[RouteStep::indexed(1, 9999)], FieldValue::Uint(0)),
            Err(ReplicationError::TooManyElements)
        );
        // Overwriting an existing leaf is still allowed.
        assert!(object
            .apply(&[RouteStep::indexed(1, 0)], FieldValue::Uint(1))
            .is_ok());
    }

    #[test]
    fn test_server_writable_tags() {
        let object = DynamicObject::with_server_writable([4]);
        assert!(object.server_writable(4));
        assert!(!object.server_writable(1));
    }
}
