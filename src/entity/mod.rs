//! Entity instances and the identity scope that keeps them unique.

use std::cell::RefCell;
use std::collections::{BTreeMap, HashMap};
use std::rc::Rc;

use crate::core::{Value, ValueKey};
use crate::schema::ClassMeta;

/// Shared handle to a mutable entity instance.
///
/// Instances loaded together share one identity scope, so two relation
/// paths reaching the same row converge on one `Rc`.
pub type EntityRef = Rc<RefCell<EntityInstance>>;

/// Identity scope shared across a tree of loads.
pub type SharedScope = Rc<RefCell<IdentityScope>>;

/// The resolved state of one relation slot.
///
/// `Lazy` is an explicit marker: the relation exists in the schema but its
/// data was not fetched. Reading a lazy slot through the manager triggers a
/// load; detached instances never lazy-load.
#[derive(Debug, Clone, Default)]
pub enum RelationValue {
    #[default]
    Lazy,
    One(Option<EntityRef>),
    Many(Vec<EntityRef>),
}

impl RelationValue {
    pub fn is_lazy(&self) -> bool {
        matches!(self, Self::Lazy)
    }

    /// Append to a to-many slot, skipping refs already present.
    ///
    /// Indirect-relation fan-out projects the same related row more than
    /// once per source row; identity, not value, decides duplication.
    pub fn push_unique(&mut self, entity: EntityRef) {
        match self {
            Self::Many(items) => {
                if !items.iter().any(|e| Rc::ptr_eq(e, &entity)) {
                    items.push(entity);
                }
            }
            _ => *self = Self::Many(vec![entity]),
        }
    }
}

/// A mutable record of field values plus relation slots.
#[derive(Debug, Clone, Default)]
pub struct EntityInstance {
    class_name: String,
    fields: BTreeMap<String, Value>,
    relations: BTreeMap<String, RelationValue>,
    attached: bool,
}

impl EntityInstance {
    pub fn new(class_name: impl Into<String>) -> Self {
        Self {
            class_name: class_name.into(),
            ..Self::default()
        }
    }

    /// New instance with one lazy slot per relation the class declares or
    /// inherits.
    pub fn from_meta(meta: &ClassMeta) -> Self {
        let mut instance = Self::new(meta.name());
        for name in meta.all_relations().keys() {
            instance.relations.insert(name.clone(), RelationValue::Lazy);
        }
        instance
    }

    pub fn class_name(&self) -> &str {
        &self.class_name
    }

    pub fn set(&mut self, field: impl Into<String>, value: Value) {
        self.fields.insert(field.into(), value);
    }

    pub fn get(&self, field: &str) -> Option<&Value> {
        self.fields.get(field)
    }

    pub fn fields(&self) -> &BTreeMap<String, Value> {
        &self.fields
    }

    pub fn set_relation(&mut self, name: impl Into<String>, value: RelationValue) {
        self.relations.insert(name.into(), value);
    }

    pub fn relation(&self, name: &str) -> Option<&RelationValue> {
        self.relations.get(name)
    }

    pub fn relation_mut(&mut self, name: &str) -> Option<&mut RelationValue> {
        self.relations.get_mut(name)
    }

    pub fn relations(&self) -> &BTreeMap<String, RelationValue> {
        &self.relations
    }

    /// Whether the instance is backed by a store. Detached instances never
    /// trigger lazy loads.
    pub fn is_attached(&self) -> bool {
        self.attached
    }

    pub fn attach(&mut self) {
        self.attached = true;
    }

    pub fn detach(&mut self) {
        self.attached = false;
    }

    pub fn into_ref(self) -> EntityRef {
        Rc::new(RefCell::new(self))
    }
}

/// (class, identifier) → instance map ensuring object uniqueness within one
/// load operation or a chain of related loads.
#[derive(Debug, Default)]
pub struct IdentityScope {
    entries: HashMap<(String, ValueKey), EntityRef>,
}

impl IdentityScope {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn shared() -> SharedScope {
        Rc::new(RefCell::new(Self::new()))
    }

    /// Existing ref for (class, id), or register the one `init` builds.
    pub fn intern(
        &mut self,
        class: &str,
        id: &Value,
        init: impl FnOnce() -> EntityInstance,
    ) -> EntityRef {
        self.entries
            .entry((class.to_string(), ValueKey(id.clone())))
            .or_insert_with(|| init().into_ref())
            .clone()
    }

    pub fn get(&self, class: &str, id: &Value) -> Option<EntityRef> {
        self.entries
            .get(&(class.to_string(), ValueKey(id.clone())))
            .cloned()
    }

    /// Register an already-built ref, replacing any previous entry.
    pub fn insert(&mut self, class: &str, id: &Value, entity: EntityRef) {
        self.entries
            .insert((class.to_string(), ValueKey(id.clone())), entity);
    }

    pub fn remove(&mut self, class: &str, id: &Value) {
        self.entries
            .remove(&(class.to_string(), ValueKey(id.clone())));
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}
