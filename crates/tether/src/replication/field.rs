use std::any::Any;
use std::collections::BTreeMap;

use super::error::ReplicationError;
use crate::net::{FieldValue, InstanceId, Route, RouteStep};

/// Collections never grow past this many elements from remote writes.
pub const MAX_COLLECTION_LEN: usize = 1024;

/// Collects every leaf of an object together with the route that reaches it.
#[derive(Debug)]
pub struct RouteWalker {
    route: Route,
    leaves: Vec<(Route, FieldValue)>,
}

impl RouteWalker {
    pub fn new(instance_id: InstanceId) -> Self {
        Self {
            route: Route::new(instance_id),
            leaves: Vec::new(),
        }
    }

    /// Descends into the field `tag`.
    pub fn field<F: Field + ?Sized>(&mut self, tag: u32, field: &F) {
        self.route.push(RouteStep::field(tag));
        field.walk(self);
        self.route.pop();
    }

    /// Visits one element of the collection selected by the current step.
    pub fn element<F: Field + ?Sized>(&mut self, index: u32, element: &F) {
        self.route.set_last_index(Some(index));
        element.walk(self);
        self.route.set_last_index(None);
    }

    /// Records a leaf at the current route.
    pub fn leaf(&mut self, value: FieldValue) {
        self.leaves.push((self.route.clone(), value));
    }

    /// Records a leaf `path` steps below the current route.
    pub fn leaf_at(&mut self, path: &[RouteStep], value: FieldValue) {
        let mut route = self.route.clone();
        for step in path {
            route.push(*step);
        }
        self.leaves.push((route, value));
    }

    pub fn finish(self) -> Vec<(Route, FieldValue)> {
        self.leaves
    }
}

/// A replicated value: either a leaf or a branch that routes to leaves.
///
/// `index` is the element index carried by the route step that selected this
/// field, `rest` are the steps below it. A collection consumes the index of
/// its own step, so a collection of collections needs a wrapping struct.
pub trait Field {
    fn walk(&self, walker: &mut RouteWalker);

    fn apply(
        &mut self,
        index: Option<u32>,
        rest: &[RouteStep],
        value: FieldValue,
    ) -> Result<(), ReplicationError>;
}

pub trait AsAny {
    fn as_any(&self) -> &dyn Any;
    fn as_any_mut(&mut self) -> &mut dyn Any;
}

impl<T: Any> AsAny for T {
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

/// Per-type descriptor of a replicated struct. Usually implemented through
/// [`impl_replicate!`](crate::impl_replicate).
pub trait Replicate: AsAny + Send {
    fn walk(&self, walker: &mut RouteWalker);

    /// Routes a write to the leaf named by `path`; `path[0]` selects one of
    /// this type's fields.
    fn apply(&mut self, path: &[RouteStep], value: FieldValue) -> Result<(), ReplicationError>;

    /// Fields the server may write even though a peer owns the object.
    fn server_writable(&self, _field_tag: u32) -> bool {
        false
    }
}

impl<T: Replicate> Field for T {
    fn walk(&self, walker: &mut RouteWalker) {
        Replicate::walk(self, walker);
    }

    fn apply(
        &mut self,
        index: Option<u32>,
        rest: &[RouteStep],
        value: FieldValue,
    ) -> Result<(), ReplicationError> {
        if let Some(index) = index {
            return Err(ReplicationError::UnexpectedIndex(index));
        }
        Replicate::apply(self, rest, value)
    }
}

fn check_leaf(index: Option<u32>, rest: &[RouteStep]) -> Result<(), ReplicationError> {
    if let Some(index) = index {
        return Err(ReplicationError::UnexpectedIndex(index));
    }
    if !rest.is_empty() {
        return Err(ReplicationError::RouteTooLong);
    }
    Ok(())
}

macro_rules! leaf_field {
    ($ty:ty, $variant:ident, $kind:literal) => {
        impl Field for $ty {
            fn walk(&self, walker: &mut RouteWalker) {
                walker.leaf(FieldValue::$variant(*self));
            }

            fn apply(
                &mut self,
                index: Option<u32>,
                rest: &[RouteStep],
                value: FieldValue,
            ) -> Result<(), ReplicationError> {
                check_leaf(index, rest)?;
                match value {
                    FieldValue::$variant(v) => {
                        *self = v;
                        Ok(())
                    }
                    other => Err(ReplicationError::TypeMismatch {
                        expected: $kind,
                        found: other.kind(),
                    }),
                }
            }
        }
    };
}

leaf_field!(bool, Bool, "bool");
leaf_field!(i32, Int, "int");
leaf_field!(u32, Uint, "uint");
leaf_field!(f32, Float, "float");

impl Field for String {
    fn walk(&self, walker: &mut RouteWalker) {
        walker.leaf(FieldValue::Str(self.clone()));
    }

    fn apply(
        &mut self,
        index: Option<u32>,
        rest: &[RouteStep],
        value: FieldValue,
    ) -> Result<(), ReplicationError> {
        check_leaf(index, rest)?;
        match value {
            FieldValue::Str(v) => {
                *self = v;
                Ok(())
            }
            other => Err(ReplicationError::TypeMismatch {
                expected: "string",
                found: other.kind(),
            }),
        }
    }
}

/// Enums cross the wire as their `u32` discriminant.
pub trait WireEnum: Copy {
    fn to_wire(self) -> u32;
    fn from_wire(value: u32) -> Option<Self>;
}

/// Replicated wrapper around a [`WireEnum`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct EnumField<T>(pub T);

impl<T: WireEnum> Field for EnumField<T> {
    fn walk(&self, walker: &mut RouteWalker) {
        walker.leaf(FieldValue::Enum(self.0.to_wire()));
    }

    fn apply(
        &mut self,
        index: Option<u32>,
        rest: &[RouteStep],
        value: FieldValue,
    ) -> Result<(), ReplicationError> {
        check_leaf(index, rest)?;
        match value {
            FieldValue::Enum(raw) => {
                self.0 = T::from_wire(raw).ok_or(ReplicationError::UnknownEnumValue(raw))?;
                Ok(())
            }
            other => Err(ReplicationError::TypeMismatch {
                expected: "enum",
                found: other.kind(),
            }),
        }
    }
}

/// Ordered collection; the route index is the element position. A write one
/// past the end appends a default element.
impl<T: Field + Default> Field for Vec<T> {
    fn walk(&self, walker: &mut RouteWalker) {
        for (i, element) in self.iter().enumerate() {
            walker.element(i as u32, element);
        }
    }

    fn apply(
        &mut self,
        index: Option<u32>,
        rest: &[RouteStep],
        value: FieldValue,
    ) -> Result<(), ReplicationError> {
        let index = index.ok_or(ReplicationError::MissingIndex)?;
        let position = index as usize;
        if position == self.len() {
            if self.len() >= MAX_COLLECTION_LEN {
                return Err(ReplicationError::TooManyElements);
            }
            self.push(T::default());
        }
        let len = self.len();
        let element = self
            .get_mut(position)
            .ok_or(ReplicationError::IndexOutOfRange { index, len })?;
        element.apply(None, rest, value)
    }
}

/// Keyed collection; the route index is the key.
impl<T: Field + Default> Field for BTreeMap<u32, T> {
    fn walk(&self, walker: &mut RouteWalker) {
        for (key, element) in self {
            walker.element(*key, element);
        }
    }

    fn apply(
        &mut self,
        index: Option<u32>,
        rest: &[RouteStep],
        value: FieldValue,
    ) -> Result<(), ReplicationError> {
        let key = index.ok_or(ReplicationError::MissingIndex)?;
        if !self.contains_key(&key) && self.len() >= MAX_COLLECTION_LEN {
            return Err(ReplicationError::TooManyElements);
        }
        self.entry(key).or_default().apply(None, rest, value)
    }
}

/// Implements [`Replicate`] for a struct by listing `tag => field` pairs.
///
/// ```ignore
/// impl_replicate!(Player {
///     1 => health,
///     2 => name,
/// } server_writable [1]);
/// ```
#[macro_export]
macro_rules! impl_replicate {
    ($ty:ty { $($tag:literal => $field:ident),* $(,)? } $(server_writable [$($sw:literal),* $(,)?])?) => {
        impl $crate::replication::Replicate for $ty {
            fn walk(&self, walker: &mut $crate::replication::RouteWalker) {
                $( walker.field($tag, &self.$field); )*
            }

            fn apply(
                &mut self,
                path: &[$crate::net::RouteStep],
                value: $crate::net::FieldValue,
            ) -> ::std::result::Result<(), $crate::replication::ReplicationError> {
                let (step, rest) = path
                    .split_first()
                    .ok_or($crate::replication::ReplicationError::EmptyRoute)?;
                match step.field_tag {
                    $( $tag => $crate::replication::Field::apply(&mut self.$field, step.index, rest, value), )*
                    tag => ::std::result::Result::Err(
                        $crate::replication::ReplicationError::UnknownField(tag),
                    ),
                }
            }

            fn server_writable(&self, field_tag: u32) -> bool {
                let _ = field_tag;
                false $($(|| field_tag == $sw)*)?
            }
        }
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    enum Team {
        #[default]
        Red,
        Blue,
    }

    impl WireEnum for Team {
        fn to_wire(self) -> u32 {
            self as u32
        }

        fn from_wire(value: u32) -> Option<Self> {
            match value {
                0 => Some(Team::Red),
                1 => Some(Team::Blue),
                _ => None,
            }
        }
    }

    #[derive(Debug, Default, PartialEq)]
    struct Slot {
        count: u32,
        label: String,
    }

    crate::impl_replicate!(Slot {
        1 => count,
        2 => label,
    });

    #[derive(Debug, Default, PartialEq)]
    struct Ship {
        hull: i32,
        shielded: bool,
        team: EnumField<Team>,
        cargo: Vec<Slot>,
        scores: BTreeMap<u32, f32>,
    }

    crate::impl_replicate!(Ship {
        1 => hull,
        2 => shielded,
        3 => team,
        4 => cargo,
        5 => scores,
    } server_writable [1]);

    fn ship() -> Ship {
        Ship {
            hull: 75,
            shielded: true,
            team: EnumField(Team::Blue),
            cargo: vec![
                Slot {
                    count: 3,
                    label: "ore".into(),
                },
                Slot {
                    count: 9,
                    label: "ice".into(),
                },
            ],
            scores: BTreeMap::from([(7, 1.5)]),
        }
    }

    fn walk(object: &dyn Replicate) -> Vec<(Route, FieldValue)> {
        let mut walker = RouteWalker::new(42);
        object.walk(&mut walker);
        walker.finish()
    }

    #[test]
    fn test_walk_reports_every_leaf_with_its_route() {
        let leaves = walk(&ship());
        assert_eq!(leaves.len(), 8);

        let ice_label = Route::new(42)
            .with(RouteStep::indexed(4, 1))
            .with(RouteStep::field(2));
        assert!(leaves.contains(&(ice_label, FieldValue::Str("ice".into()))));

        let score = Route::new(42).with(RouteStep::indexed(5, 7));
        assert!(leaves.contains(&(score, FieldValue::Float(1.5))));

        let team = Route::new(42).with(RouteStep::field(3));
        assert!(leaves.contains(&(team, FieldValue::Enum(1))));
    }

    #[test]
    fn test_walked_leaves_rebuild_an_identical_mirror() {
        let source = ship();
        let mut mirror = Ship::default();
        for (route, value) in walk(&source) {
            Replicate::apply(&mut mirror, route.field_path(), value).unwrap();
        }
        assert_eq!(mirror, source);
    }

    #[test]
    fn test_type_mismatch_is_rejected() {
        let mut target = ship();
        let err = Replicate::apply(&mut target, &[RouteStep::field(1)], FieldValue::Bool(false))
            .unwrap_err();
        assert_eq!(
            err,
            ReplicationError::TypeMismatch {
                expected: "int",
                found: "bool"
            }
        );
        assert_eq!(target.hull, 75);
    }

    #[test]
    fn test_bad_routes_are_rejected() {
        let mut target = ship();
        assert_eq!(
            Replicate::apply(&mut target, &[], FieldValue::Int(1)),
            Err(ReplicationError::EmptyRoute)
        );
        assert_eq!(
            Replicate::apply(&mut target, &[RouteStep::field(99)], FieldValue::Int(1)),
            Err(ReplicationError::UnknownField(99))
        );
        assert_eq!(
            Replicate::apply(&mut target, &[RouteStep::field(4)], FieldValue::Uint(1)),
            Err(ReplicationError::MissingIndex)
        );
        assert_eq!(
            Replicate::apply(
                &mut target,
                &[RouteStep::indexed(4, 5), RouteStep::field(1)],
                FieldValue::Uint(1)
            ),
            Err(ReplicationError::IndexOutOfRange { index: 5, len: 2 })
        );
        assert_eq!(
            Replicate::apply(
                &mut target,
                &[RouteStep::field(1), RouteStep::field(1)],
                FieldValue::Int(1)
            ),
            Err(ReplicationError::RouteTooLong)
        );
        assert_eq!(
            Replicate::apply(&mut target, &[RouteStep::field(3)], FieldValue::Enum(9)),
            Err(ReplicationError::UnknownEnumValue(9))
        );
    }

    #[test]
    fn test_collections_grow_from_remote_writes() {
        let mut target = Ship::default();
        Replicate::apply(
            &mut target,
            &[RouteStep::indexed(4, 0), RouteStep::field(1)],
            FieldValue::Uint(4),
        )
        .unwrap();
        Replicate::apply(&mut target, &[RouteStep::indexed(5, 30)], FieldValue::Float(2.0))
            .unwrap();

        assert_eq!(target.cargo.len(), 1);
        assert_eq!(target.cargo[0].count, 4);
        assert_eq!(target.scores.get(&30), Some(&2.0));
    }

    #[test]
    fn test_server_writable_tags() {
        let target = ship();
        assert!(target.server_writable(1));
        assert!(!target.server_writable(2));
        assert!(!Slot::default().server_writable(1));
    }
}
