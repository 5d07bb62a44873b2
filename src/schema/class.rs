use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::core::{DataType, OrmError, Result};

/// Identifier generation strategy for a generated field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GeneratorKind {
    /// Increment a per-table counter row, serialized through a table lock.
    SequenceTable,
    Uuid,
    UuidHex,
}

#[derive(Debug, Clone)]
pub struct FieldDef {
    pub name: String,
    pub data_type: DataType,
    pub nullable: bool,
    pub indexed: bool,
    pub mandatory: bool,
    pub generated: Option<GeneratorKind>,
}

impl FieldDef {
    pub fn new(name: impl Into<String>, data_type: DataType) -> Self {
        Self {
            name: name.into(),
            data_type,
            nullable: true,
            indexed: false,
            mandatory: false,
            generated: None,
        }
    }

    pub fn not_null(mut self) -> Self {
        self.nullable = false;
        self
    }

    pub fn indexed(mut self) -> Self {
        self.indexed = true;
        self
    }

    pub fn mandatory(mut self) -> Self {
        self.mandatory = true;
        self
    }

    pub fn generated(mut self, kind: GeneratorKind) -> Self {
        self.generated = Some(kind);
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Cardinality {
    ToOne,
    ToMany,
}

#[derive(Debug, Clone)]
pub struct RelationDef {
    pub name: String,
    pub target: String,
    pub reverse: Option<String>,
    pub cardinality: Cardinality,
    /// Explicit owning-side claim; `None` defers to convention.
    pub mapped: Option<bool>,
}

impl RelationDef {
    pub fn to_one(name: impl Into<String>, target: impl Into<String>) -> Self {
        Self::new(name, target, Cardinality::ToOne)
    }

    pub fn to_many(name: impl Into<String>, target: impl Into<String>) -> Self {
        Self::new(name, target, Cardinality::ToMany)
    }

    fn new(name: impl Into<String>, target: impl Into<String>, cardinality: Cardinality) -> Self {
        Self {
            name: name.into(),
            target: target.into(),
            reverse: None,
            cardinality,
            mapped: None,
        }
    }

    pub fn reverse(mut self, name: impl Into<String>) -> Self {
        self.reverse = Some(name.into());
        self
    }

    pub fn mapped(mut self, mapped: bool) -> Self {
        self.mapped = Some(mapped);
        self
    }
}

/// Table-mapping strategy for a class hierarchy.
///
/// Joined-table is the only strategy currently implemented: every
/// non-abstract class owns a table holding its own fields, linked to its
/// parent's table by the shared identifier value.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum InheritanceKind {
    #[default]
    Joined,
}

/// Static description of one persistable entity class.
#[derive(Debug, Clone)]
pub struct EntityClass {
    pub name: String,
    pub table_name: String,
    pub id_field: Option<String>,
    pub fields: BTreeMap<String, FieldDef>,
    pub relations: BTreeMap<String, RelationDef>,
    pub parent: Option<String>,
    pub is_abstract: bool,
    pub inheritance: InheritanceKind,
}

impl EntityClass {
    pub fn builder(name: impl Into<String>) -> EntityClassBuilder {
        EntityClassBuilder {
            name: name.into(),
            id_field: None,
            fields: Vec::new(),
            relations: Vec::new(),
            parent: None,
            is_abstract: false,
        }
    }
}

pub struct EntityClassBuilder {
    name: String,
    id_field: Option<String>,
    fields: Vec<FieldDef>,
    relations: Vec<RelationDef>,
    parent: Option<String>,
    is_abstract: bool,
}

impl EntityClassBuilder {
    /// Declare a field and mark it as this class's identifier.
    pub fn id(self, field: FieldDef) -> Self {
        let name = field.name.clone();
        let mut builder = self.field(field);
        builder.id_field = Some(name);
        builder
    }

    pub fn field(mut self, field: FieldDef) -> Self {
        self.fields.push(field);
        self
    }

    pub fn relation(mut self, relation: RelationDef) -> Self {
        self.relations.push(relation);
        self
    }

    /// Single inheritance: a class has at most one parent.
    pub fn parent(mut self, name: impl Into<String>) -> Self {
        self.parent = Some(name.into());
        self
    }

    pub fn abstract_class(mut self) -> Self {
        self.is_abstract = true;
        self
    }

    pub fn build(self) -> Result<EntityClass> {
        let mut fields = BTreeMap::new();
        for field in self.fields {
            if fields.insert(field.name.clone(), field.clone()).is_some() {
                return Err(OrmError::Validation(format!(
                    "Field '{}' declared twice in entity class '{}'",
                    field.name, self.name
                )));
            }
        }

        let mut relations = BTreeMap::new();
        for relation in self.relations {
            if fields.contains_key(&relation.name) {
                return Err(OrmError::Validation(format!(
                    "Relation '{}' collides with a field in entity class '{}'",
                    relation.name, self.name
                )));
            }
            if relations
                .insert(relation.name.clone(), relation.clone())
                .is_some()
            {
                return Err(OrmError::Validation(format!(
                    "Relation '{}' declared twice in entity class '{}'",
                    relation.name, self.name
                )));
            }
        }

        Ok(EntityClass {
            table_name: to_table_name(&self.name),
            name: self.name,
            id_field: self.id_field,
            fields,
            relations,
            parent: self.parent,
            is_abstract: self.is_abstract,
            inheritance: InheritanceKind::Joined,
        })
    }
}

/// Derive a table name from a class name (`RootEntity` -> `root_entity`).
///
/// Consecutive uppercase runs collapse into one word, so `HTTPLog` becomes
/// `http_log` rather than one underscore per letter.
pub fn to_table_name(class_name: &str) -> String {
    let chars: Vec<char> = class_name.chars().collect();
    let mut table = String::with_capacity(class_name.len() + 4);
    for (index, ch) in chars.iter().enumerate() {
        if ch.is_uppercase() {
            let prev_upper = index > 0 && chars[index - 1].is_uppercase();
            let next_lower = chars.get(index + 1).is_some_and(|c| c.is_lowercase());
            if index > 0 && (!prev_upper || next_lower) {
                table.push('_');
            }
            table.extend(ch.to_lowercase());
        } else {
            table.push(*ch);
        }
    }
    table
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_table_name_derivation() {
        assert_eq!(to_table_name("RootEntity"), "root_entity");
        assert_eq!(to_table_name("Person"), "person");
        assert_eq!(to_table_name("HTTPLog"), "http_log");
        assert_eq!(to_table_name("ID"), "id");
    }

    #[test]
    fn test_duplicate_field_rejected() {
        let result = EntityClass::builder("Person")
            .field(FieldDef::new("name", DataType::Text))
            .field(FieldDef::new("name", DataType::Text))
            .build();
        assert!(result.is_err());
    }

    #[test]
    fn test_relation_field_collision_rejected() {
        let result = EntityClass::builder("Person")
            .field(FieldDef::new("employer", DataType::Text))
            .relation(RelationDef::to_one("employer", "Company"))
            .build();
        assert!(result.is_err());
    }
}
