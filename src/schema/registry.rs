use std::collections::BTreeMap;

use crate::core::{OrmError, Result};
use crate::schema::{EntityClass, FieldDef, RelationDef};

/// One registered class plus its derived views.
///
/// All derivations are computed once at registration time and treated as
/// immutable afterwards, so lookups never recompute and never observe
/// partially-resolved state.
#[derive(Debug, Clone)]
pub struct ClassMeta {
    class: EntityClass,
    /// Ancestor chain, hierarchy root first, excluding the class itself.
    parent_chain: Vec<String>,
    /// Own plus inherited fields.
    all_fields: BTreeMap<String, FieldDef>,
    /// Own plus inherited relations.
    all_relations: BTreeMap<String, RelationDef>,
    /// Resolved identifier field, inherited when not declared locally.
    id_field: Option<String>,
    /// Topmost ancestor; its table carries the discriminator column.
    root: String,
}

impl ClassMeta {
    pub fn class(&self) -> &EntityClass {
        &self.class
    }

    pub fn name(&self) -> &str {
        &self.class.name
    }

    pub fn table_name(&self) -> &str {
        &self.class.table_name
    }

    pub fn parent_chain(&self) -> &[String] {
        &self.parent_chain
    }

    pub fn all_fields(&self) -> &BTreeMap<String, FieldDef> {
        &self.all_fields
    }

    pub fn own_fields(&self) -> &BTreeMap<String, FieldDef> {
        &self.class.fields
    }

    pub fn all_relations(&self) -> &BTreeMap<String, RelationDef> {
        &self.all_relations
    }

    pub fn own_relations(&self) -> &BTreeMap<String, RelationDef> {
        &self.class.relations
    }

    pub fn id_field(&self) -> Option<&str> {
        self.id_field.as_deref()
    }

    pub fn root(&self) -> &str {
        &self.root
    }

    pub fn is_root(&self) -> bool {
        self.root == self.class.name
    }

    /// Declaring class of a field, walking own fields then the ancestor
    /// chain leaf-first. Levels above the declaring class never carry the
    /// column, so this decides which joined table a column lives in.
    pub fn field_level<'a>(&self, registry: &'a SchemaRegistry, field: &str) -> Option<&'a str> {
        if self.class.fields.contains_key(field) {
            return registry.get(&self.class.name).ok().map(ClassMeta::name);
        }
        for ancestor in self.parent_chain.iter().rev() {
            let meta = registry.get(ancestor).ok()?;
            if meta.class.fields.contains_key(field) {
                return Some(meta.name());
            }
        }
        None
    }

    /// Declaring class of a relation, walking leaf-first. The declaring
    /// level's table carries the relation's foreign-key column.
    pub fn relation_level<'a>(
        &self,
        registry: &'a SchemaRegistry,
        relation: &str,
    ) -> Option<&'a ClassMeta> {
        if self.class.relations.contains_key(relation) {
            return registry.get(&self.class.name).ok();
        }
        for ancestor in self.parent_chain.iter().rev() {
            let meta = registry.get(ancestor).ok()?;
            if meta.class.relations.contains_key(relation) {
                return Some(meta);
            }
        }
        None
    }
}

/// Append-only registry of entity classes.
///
/// Registration order must be parent-first; registering a class never
/// mutates an already-registered one.
#[derive(Debug, Default)]
pub struct SchemaRegistry {
    classes: BTreeMap<String, ClassMeta>,
}

impl SchemaRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, class: EntityClass) -> Result<()> {
        if self.classes.contains_key(&class.name) {
            return Err(OrmError::Validation(format!(
                "Entity class '{}' is already registered",
                class.name
            )));
        }

        let (parent_chain, mut all_fields, mut all_relations, inherited_id, root) =
            match &class.parent {
                Some(parent_name) => {
                    let parent = self.classes.get(parent_name).ok_or_else(|| {
                        OrmError::Validation(format!(
                            "Entity class '{}' names unregistered parent '{}'",
                            class.name, parent_name
                        ))
                    })?;
                    let mut chain = parent.parent_chain.clone();
                    chain.push(parent_name.clone());
                    (
                        chain,
                        parent.all_fields.clone(),
                        parent.all_relations.clone(),
                        parent.id_field.clone(),
                        parent.root.clone(),
                    )
                }
                None => (
                    Vec::new(),
                    BTreeMap::new(),
                    BTreeMap::new(),
                    None,
                    class.name.clone(),
                ),
            };

        for (name, field) in &class.fields {
            if all_fields.insert(name.clone(), field.clone()).is_some() {
                return Err(OrmError::Validation(format!(
                    "Field '{}' in entity class '{}' shadows an inherited field",
                    name, class.name
                )));
            }
        }
        for (name, relation) in &class.relations {
            if all_relations.insert(name.clone(), relation.clone()).is_some() {
                return Err(OrmError::Validation(format!(
                    "Relation '{}' in entity class '{}' shadows an inherited relation",
                    name, class.name
                )));
            }
        }

        let id_field = match (&class.id_field, inherited_id) {
            (Some(own), None) => Some(own.clone()),
            (None, inherited) => inherited,
            (Some(own), Some(inherited)) => {
                return Err(OrmError::Validation(format!(
                    "Entity class '{}' declares identifier '{}' but already inherits '{}'",
                    class.name, own, inherited
                )));
            }
        };

        if !class.is_abstract && id_field.is_none() {
            return Err(OrmError::Validation(format!(
                "Non-abstract entity class '{}' resolves no identifier field",
                class.name
            )));
        }

        let meta = ClassMeta {
            parent_chain,
            all_fields,
            all_relations,
            id_field,
            root,
            class,
        };
        self.classes.insert(meta.class.name.clone(), meta);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Result<&ClassMeta> {
        self.classes
            .get(name)
            .ok_or_else(|| OrmError::ClassNotFound(name.to_string()))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.classes.contains_key(name)
    }

    /// All registered classes, name order.
    pub fn classes(&self) -> impl Iterator<Item = &ClassMeta> {
        self.classes.values()
    }

    pub fn get_id(&self, class: &str) -> Result<&str> {
        let meta = self.get(class)?;
        meta.id_field().ok_or_else(|| {
            OrmError::Validation(format!("Entity class '{class}' has no identifier field"))
        })
    }

    pub fn is_relation(&self, class: &str, name: &str) -> bool {
        self.get(class)
            .map(|meta| meta.all_relations().contains_key(name))
            .unwrap_or(false)
    }

    pub fn get_relation<'a>(&'a self, class: &str, name: &str) -> Result<&'a RelationDef> {
        let meta = self.get(class)?;
        meta.all_relations().get(name).ok_or_else(|| {
            OrmError::MissingRelationDefinition(name.to_string(), class.to_string())
        })
    }

    pub fn get_target(&self, class: &str, relation: &str) -> Result<&ClassMeta> {
        let relation = self.get_relation(class, relation)?;
        self.get(&relation.target)
    }

    pub fn is_subclass(&self, sub: &str, ancestor: &str) -> bool {
        if sub == ancestor {
            return true;
        }
        self.get(sub)
            .map(|meta| meta.parent_chain().iter().any(|p| p == ancestor))
            .unwrap_or(false)
    }

    /// Hierarchy root of a class; the discriminator column lives on the
    /// root's table.
    pub fn hierarchy_root(&self, class: &str) -> Result<&ClassMeta> {
        let meta = self.get(class)?;
        self.get(meta.root())
    }
}
