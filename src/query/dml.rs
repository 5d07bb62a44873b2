use std::collections::BTreeMap;

use crate::connection::SqlDialect;
use crate::core::{OrmError, Result, Value};
use crate::mapping::{MappingResolver, RelationMapping};
use crate::schema::{
    ClassMeta, DISCRIMINATOR_COLUMN, MODIFIED_TIME_COLUMN, SchemaRegistry,
};

/// Write-side compiler, symmetric to the query compiler.
///
/// Joined-table inheritance turns every write into a per-level statement
/// sequence; statement order (ancestors first on insert, leaf first on
/// delete) is a correctness requirement, not a preference.
pub struct DmlCompiler<'a> {
    registry: &'a SchemaRegistry,
    resolver: &'a MappingResolver,
    dialect: &'a dyn SqlDialect,
}

impl<'a> DmlCompiler<'a> {
    pub fn new(
        registry: &'a SchemaRegistry,
        resolver: &'a MappingResolver,
        dialect: &'a dyn SqlDialect,
    ) -> Self {
        Self {
            registry,
            resolver,
            dialect,
        }
    }

    /// One INSERT per inheritance level, ancestors first, all sharing the
    /// identifier value. `fk_values` maps mapped to-one relation names to
    /// the related identifier.
    pub fn insert_statements(
        &self,
        class: &str,
        values: &BTreeMap<String, Value>,
        fk_values: &BTreeMap<String, Value>,
        mtime: f64,
    ) -> Result<Vec<String>> {
        let meta = self.registry.get(class)?;
        let id_field = required_id(meta)?;
        let id_value = values.get(id_field).ok_or_else(|| {
            OrmError::Validation(format!(
                "Entity '{class}' has no identifier value at insert time"
            ))
        })?;

        let mut statements = Vec::new();
        for level in self.levels_root_first(meta) {
            let level_meta = self.registry.get(&level)?;
            let mut columns = vec![id_field.to_string()];
            let mut literals = vec![self.literal(id_value)?];

            for (name, _) in level_meta.own_fields() {
                if name == id_field {
                    continue;
                }
                if let Some(value) = values.get(name) {
                    columns.push(name.clone());
                    literals.push(self.literal(value)?);
                }
            }
            for name in level_meta.own_relations().keys() {
                if let Some(value) = fk_values.get(name) {
                    columns.push(MappingResolver::foreign_key_column(name));
                    literals.push(self.literal(value)?);
                }
            }
            if level_meta.is_root() {
                columns.push(DISCRIMINATOR_COLUMN.to_string());
                literals.push(self.literal(&Value::Text(class.to_string()))?);
            }
            columns.push(MODIFIED_TIME_COLUMN.to_string());
            literals.push(self.literal(&Value::Date(mtime))?);

            statements.push(format!(
                "INSERT INTO {}({}) VALUES ({})",
                level_meta.table_name(),
                columns.join(", "),
                literals.join(", ")
            ));
        }
        Ok(statements)
    }

    /// One UPDATE per inheritance level that has at least one changed own
    /// field or foreign key; untouched levels are skipped entirely.
    pub fn update_statements(
        &self,
        class: &str,
        id: &Value,
        changed: &BTreeMap<String, Value>,
        fk_changes: &BTreeMap<String, Value>,
        mtime: f64,
    ) -> Result<Vec<String>> {
        let meta = self.registry.get(class)?;
        let id_field = required_id(meta)?;
        let id_literal = self.literal(id)?;

        let mut statements = Vec::new();
        for level in self.levels_root_first(meta) {
            let level_meta = self.registry.get(&level)?;
            let mut assignments = Vec::new();
            for (name, _) in level_meta.own_fields() {
                if name == id_field {
                    continue;
                }
                if let Some(value) = changed.get(name) {
                    assignments.push(format!("{name} = {}", self.literal(value)?));
                }
            }
            for name in level_meta.own_relations().keys() {
                if let Some(value) = fk_changes.get(name) {
                    assignments.push(format!(
                        "{} = {}",
                        MappingResolver::foreign_key_column(name),
                        self.literal(value)?
                    ));
                }
            }
            if assignments.is_empty() {
                continue;
            }
            assignments.push(format!(
                "{MODIFIED_TIME_COLUMN} = {}",
                self.literal(&Value::Date(mtime))?
            ));
            statements.push(format!(
                "UPDATE {} SET {} WHERE {id_field} = {id_literal}",
                level_meta.table_name(),
                assignments.join(", ")
            ));
        }
        Ok(statements)
    }

    /// One DELETE per inheritance level, leaf first; back ends without
    /// cascade support cannot drop a referenced parent row first.
    pub fn delete_statements(&self, class: &str, id: &Value) -> Result<Vec<String>> {
        let meta = self.registry.get(class)?;
        let id_field = required_id(meta)?;
        let id_literal = self.literal(id)?;

        let mut levels = self.levels_root_first(meta);
        levels.reverse();
        Ok(levels
            .iter()
            .filter_map(|level| self.registry.get(level).ok())
            .map(|level_meta| {
                format!(
                    "DELETE FROM {} WHERE {id_field} = {id_literal}",
                    level_meta.table_name()
                )
            })
            .collect())
    }

    /// Statements synchronizing one unmapped relation's rows: a full
    /// delete-then-insert of the association rows for indirect relations,
    /// or FK updates on the target side for reverse-mapped ones.
    ///
    /// The association-row shape is identical regardless of which side
    /// initiated the save; columns follow the sorted table-name order.
    pub fn relation_statements(
        &self,
        class: &str,
        relation: &str,
        id: &Value,
        target_ids: &[Value],
    ) -> Result<Vec<String>> {
        let meta = self.registry.get(class)?;
        let target = self.registry.get_target(class, relation)?;
        let target_id_field = required_id(target)?;
        let id_literal = self.literal(id)?;

        match self.resolver.resolve(class, relation)? {
            RelationMapping::Mapped => Ok(Vec::new()),
            RelationMapping::ReverseMapped => {
                let relation_def = meta.all_relations().get(relation).ok_or_else(|| {
                    OrmError::MissingRelationDefinition(relation.to_string(), class.to_string())
                })?;
                let reverse = relation_def.reverse.as_deref().ok_or_else(|| {
                    OrmError::Validation(format!(
                        "Reverse-mapped relation '{class}.{relation}' has no reverse name"
                    ))
                })?;
                let carrier = target
                    .relation_level(self.registry, reverse)
                    .unwrap_or(target);
                let fk = MappingResolver::foreign_key_column(reverse);
                let mut statements = vec![format!(
                    "UPDATE {} SET {fk} = NULL WHERE {fk} = {id_literal}",
                    carrier.table_name()
                )];
                if !target_ids.is_empty() {
                    let ids = target_ids
                        .iter()
                        .map(|v| self.literal(v))
                        .collect::<Result<Vec<_>>>()?;
                    statements.push(format!(
                        "UPDATE {} SET {fk} = {id_literal} WHERE {target_id_field} IN ({})",
                        carrier.table_name(),
                        ids.join(", ")
                    ));
                }
                Ok(statements)
            }
            RelationMapping::Indirect { table } => {
                let decl = meta.relation_level(self.registry, relation).unwrap_or(meta);
                let source_col = format!("{}_id", decl.table_name());
                let target_col = format!("{}_id", target.table_name());
                let mut statements = vec![format!(
                    "DELETE FROM {table} WHERE {source_col} = {id_literal}"
                )];
                // sorted column order keeps the row identical from both sides
                let source_first = source_col <= target_col;
                for target_id in target_ids {
                    let target_literal = self.literal(target_id)?;
                    let (columns, values) = if source_first {
                        (
                            format!("{source_col}, {target_col}"),
                            format!("{id_literal}, {target_literal}"),
                        )
                    } else {
                        (
                            format!("{target_col}, {source_col}"),
                            format!("{target_literal}, {id_literal}"),
                        )
                    };
                    statements.push(format!(
                        "INSERT INTO {table}({columns}) VALUES ({values})"
                    ));
                }
                Ok(statements)
            }
        }
    }

    /// Clear one relation's stored rows for an instance being removed.
    pub fn relation_clear_statements(
        &self,
        class: &str,
        relation: &str,
        id: &Value,
    ) -> Result<Vec<String>> {
        self.relation_statements(class, relation, id, &[])
    }

    fn levels_root_first(&self, meta: &ClassMeta) -> Vec<String> {
        let mut levels: Vec<String> = meta.parent_chain().to_vec();
        levels.push(meta.name().to_string());
        levels
    }

    fn literal(&self, value: &Value) -> Result<String> {
        value.sql_literal(self.dialect.escape_slash())
    }
}

fn required_id(meta: &ClassMeta) -> Result<&str> {
    meta.id_field().ok_or_else(|| {
        OrmError::Validation(format!(
            "Entity class '{}' has no identifier field",
            meta.name()
        ))
    })
}
