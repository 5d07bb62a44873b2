use std::collections::HashMap;

use crate::core::{OrmError, Result};
use crate::schema::{Cardinality, ClassMeta, RelationDef, SchemaRegistry};

/// Physical mapping of one relation, as seen from the source class.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelationMapping {
    /// Foreign key lives in the source class's table.
    Mapped,
    /// Foreign key lives in the target class's table.
    ReverseMapped,
    /// No owning side; rows live in a separate association table.
    Indirect { table: String },
}

/// Pre-resolved relation mappings for a whole registry.
///
/// Built once at schema-build time so configuration errors (both sides
/// claiming ownership, dangling reverse names) surface before any query or
/// DDL compile. Lookups afterwards are single map hits.
#[derive(Debug)]
pub struct MappingResolver {
    cache: HashMap<(String, String), RelationMapping>,
}

impl MappingResolver {
    pub fn build(registry: &SchemaRegistry) -> Result<Self> {
        let mut cache = HashMap::new();
        for meta in registry.classes() {
            for (name, relation) in meta.all_relations() {
                let mapping = resolve_relation(registry, meta, relation)?;
                cache.insert((meta.name().to_string(), name.clone()), mapping);
            }
        }
        Ok(Self { cache })
    }

    pub fn resolve(&self, class: &str, relation: &str) -> Result<&RelationMapping> {
        self.cache
            .get(&(class.to_string(), relation.to_string()))
            .ok_or_else(|| {
                OrmError::MissingRelationDefinition(relation.to_string(), class.to_string())
            })
    }

    /// Foreign-key column for a mapped to-one relation.
    pub fn foreign_key_column(relation: &str) -> String {
        format!("{relation}_id")
    }

    /// Association-table name for an indirect relation.
    ///
    /// Participant table names are sorted before joining so both sides
    /// compute the same name independently.
    pub fn association_table(table_a: &str, table_b: &str) -> String {
        if table_a <= table_b {
            format!("{table_a}_{table_b}")
        } else {
            format!("{table_b}_{table_a}")
        }
    }
}

fn resolve_relation(
    registry: &SchemaRegistry,
    source: &ClassMeta,
    relation: &RelationDef,
) -> Result<RelationMapping> {
    let target = registry.get(&relation.target)?;
    let reverse = lookup_reverse(registry, source, relation)?;

    let source_mapped = relation.mapped;
    let reverse_mapped = reverse.and_then(|r| r.mapped);

    // Explicit declarations always win over convention; two explicit claims
    // are a configuration error, not a tie to break.
    if source_mapped == Some(true) && reverse_mapped == Some(true) {
        return Err(OrmError::Validation(format!(
            "Relation '{}.{}' and its reverse both claim the owning side",
            source.name(),
            relation.name
        )));
    }
    // A foreign-key column holds one value, so an owning-side claim is only
    // valid on a to-one relation.
    if source_mapped == Some(true) && relation.cardinality == Cardinality::ToMany {
        return Err(OrmError::Validation(format!(
            "To-many relation '{}.{}' cannot claim the owning side",
            source.name(),
            relation.name
        )));
    }
    if reverse_mapped == Some(true)
        && reverse.is_some_and(|r| r.cardinality == Cardinality::ToMany)
    {
        return Err(OrmError::Validation(format!(
            "Reverse of relation '{}.{}' is to-many and cannot claim the owning side",
            source.name(),
            relation.name
        )));
    }
    if source_mapped == Some(true) {
        return Ok(RelationMapping::Mapped);
    }
    if reverse_mapped == Some(true) {
        return Ok(RelationMapping::ReverseMapped);
    }

    let indirect = || {
        let source_table = declaring_table(registry, source, &relation.name);
        RelationMapping::Indirect {
            table: MappingResolver::association_table(&source_table, target.table_name()),
        }
    };

    let source_to_one = relation.cardinality == Cardinality::ToOne && source_mapped.is_none();
    let reverse_to_one = reverse
        .map(|r| r.cardinality == Cardinality::ToOne && r.mapped.is_none())
        .unwrap_or(false);

    // Convention: exactly one to-one side owns the key.
    match (source_to_one, reverse_to_one) {
        (true, false) => Ok(RelationMapping::Mapped),
        (false, true) => Ok(RelationMapping::ReverseMapped),
        _ => Ok(indirect()),
    }
}

fn lookup_reverse<'a>(
    registry: &'a SchemaRegistry,
    source: &ClassMeta,
    relation: &RelationDef,
) -> Result<Option<&'a RelationDef>> {
    let Some(reverse_name) = &relation.reverse else {
        return Ok(None);
    };
    let target = registry.get(&relation.target)?;
    let reverse = target.all_relations().get(reverse_name).ok_or_else(|| {
        OrmError::MissingRelationDefinition(reverse_name.clone(), target.name().to_string())
    })?;
    // Reverse lookup must be symmetric
    if let Some(back) = &reverse.reverse
        && back != &relation.name
    {
        return Err(OrmError::Validation(format!(
            "Relation '{}.{}' declares reverse '{}.{}', which points back to '{}'",
            source.name(),
            relation.name,
            target.name(),
            reverse_name,
            back
        )));
    }
    Ok(Some(reverse))
}

/// Table of the class that declared the relation; inherited relations must
/// name the association table after the declaring level so both sides agree.
fn declaring_table(registry: &SchemaRegistry, meta: &ClassMeta, relation: &str) -> String {
    if meta.own_relations().contains_key(relation) {
        return meta.table_name().to_string();
    }
    for ancestor in meta.parent_chain().iter().rev() {
        if let Ok(ancestor_meta) = registry.get(ancestor)
            && ancestor_meta.own_relations().contains_key(relation)
        {
            return ancestor_meta.table_name().to_string();
        }
    }
    meta.table_name().to_string()
}
