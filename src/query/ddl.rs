use crate::connection::SqlDialect;
use crate::core::{DataType, OrmError, Result};
use crate::mapping::{MappingResolver, RelationMapping};
use crate::schema::{
    Cardinality, ClassMeta, DISCRIMINATOR_COLUMN, MODIFIED_TIME_COLUMN, SchemaRegistry,
};

/// Emits CREATE/DROP statements for entity-class tables and association
/// tables.
///
/// A pure function of the schema model: the same class always produces the
/// same statement list. Idempotence against an existing schema is the
/// manager's job, checked through its existence cache.
pub struct DdlGenerator<'a> {
    registry: &'a SchemaRegistry,
    resolver: &'a MappingResolver,
    dialect: &'a dyn SqlDialect,
}

impl<'a> DdlGenerator<'a> {
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

    /// CREATE TABLE plus index statements for one class's own table.
    ///
    /// Inherited fields are not repeated; they live in ancestor tables. The
    /// identifier column is always present (shared across the joined
    /// chain), the discriminator only at the hierarchy root.
    pub fn create_class(&self, class: &str) -> Result<Vec<String>> {
        let meta = self.registry.get(class)?;
        let table = meta.table_name();
        let id_field = meta.id_field().ok_or_else(|| {
            OrmError::Validation(format!("Entity class '{class}' has no identifier field"))
        })?;
        let id_def = meta.all_fields().get(id_field).ok_or_else(|| {
            OrmError::FieldNotFound(id_field.to_string(), class.to_string())
        })?;

        let mut columns = Vec::new();
        let mut constraints = Vec::new();
        columns.push(format!("{id_field} {}", id_def.data_type.sql_type()));

        for (name, field) in meta.own_fields() {
            if name == id_field {
                continue;
            }
            let mut column = format!("{name} {}", field.data_type.sql_type());
            if !field.nullable {
                column.push_str(" NOT NULL");
            }
            columns.push(column);
        }

        // mapped to-one relations declared at this level carry their FK
        // column here
        for (name, relation) in meta.own_relations() {
            if relation.cardinality == Cardinality::ToOne
                && self.resolver.resolve(class, name)? == &RelationMapping::Mapped
            {
                let target = self.registry.get(&relation.target)?;
                let target_id = target.id_field().ok_or_else(|| {
                    OrmError::Validation(format!(
                        "Relation target '{}' has no identifier field",
                        relation.target
                    ))
                })?;
                let target_id_type = target
                    .all_fields()
                    .get(target_id)
                    .map(|f| f.data_type)
                    .unwrap_or(DataType::Integer);
                let fk_column = MappingResolver::foreign_key_column(name);
                columns.push(format!("{fk_column} {}", target_id_type.sql_type()));
                if self.dialect.enforce_foreign_keys() {
                    constraints.push(format!(
                        "CONSTRAINT {table}_{fk_column}_fk FOREIGN KEY ({fk_column}) REFERENCES {}({target_id})",
                        target.table_name()
                    ));
                }
            }
        }

        if meta.is_root() {
            columns.push(format!("{DISCRIMINATOR_COLUMN} TEXT"));
        }
        columns.push(format!("{MODIFIED_TIME_COLUMN} DOUBLE PRECISION"));
        columns.append(&mut constraints);
        columns.push(format!("PRIMARY KEY ({id_field})"));

        let mut statements = vec![format!("CREATE TABLE {table}({})", columns.join(", "))];

        statements.push(self.dialect.index_sql(table, id_field));
        for (name, field) in meta.own_fields() {
            if field.indexed && name != id_field {
                statements.push(self.dialect.index_sql(table, name));
            }
        }
        statements.push(self.dialect.index_sql(table, MODIFIED_TIME_COLUMN));

        Ok(statements)
    }

    /// Association table for one indirect relation: two identifier columns
    /// under a composite primary key.
    pub fn create_association(&self, class: &str, relation: &str) -> Result<Vec<String>> {
        let RelationMapping::Indirect { table } = self.resolver.resolve(class, relation)? else {
            return Err(OrmError::Validation(format!(
                "Relation '{class}.{relation}' is not indirect, no association table applies"
            )));
        };

        let meta = self.registry.get(class)?;
        let decl = meta.relation_level(self.registry, relation).unwrap_or(meta);
        let target = self.registry.get_target(class, relation)?;

        let mut sides = [
            (decl.table_name().to_string(), id_type(decl)),
            (target.table_name().to_string(), id_type(target)),
        ];
        // sorted column order so both sides emit identical DDL
        sides.sort_by(|a, b| a.0.cmp(&b.0));

        let mut columns: Vec<String> = sides
            .iter()
            .map(|(side, data_type)| format!("{side}_id {}", data_type.sql_type()))
            .collect();
        if self.dialect.enforce_foreign_keys() {
            for (side, _) in &sides {
                let side_meta = self
                    .registry
                    .classes()
                    .find(|m| m.table_name() == side)
                    .ok_or_else(|| OrmError::ClassNotFound(side.clone()))?;
                let side_id = side_meta.id_field().unwrap_or("object_id");
                columns.push(format!(
                    "FOREIGN KEY ({side}_id) REFERENCES {side}({side_id})"
                ));
            }
        }
        columns.push(format!(
            "PRIMARY KEY ({}_id, {}_id)",
            sides[0].0, sides[1].0
        ));

        Ok(vec![format!(
            "CREATE TABLE {table}({})",
            columns.join(", ")
        )])
    }

    /// Drop statements for one class, dependency-ordered: association
    /// tables first, then foreign-key constraints on direct relations, then
    /// the class's own table. Recursion into direct-relation targets is
    /// driven by the manager.
    pub fn drop_class(&self, class: &str) -> Result<Vec<String>> {
        let meta = self.registry.get(class)?;
        let mut statements = Vec::new();
        for name in meta.own_relations().keys() {
            if let RelationMapping::Indirect { table } = self.resolver.resolve(class, name)? {
                statements.push(format!("DROP TABLE {table}"));
            }
        }
        if self.dialect.enforce_foreign_keys() && self.dialect.allow_alter_drop() {
            for (name, relation) in meta.own_relations() {
                match self.resolver.resolve(class, name)? {
                    RelationMapping::Mapped => {
                        let fk_column = MappingResolver::foreign_key_column(name);
                        statements.push(format!(
                            "ALTER TABLE {table} DROP CONSTRAINT {table}_{fk_column}_fk",
                            table = meta.table_name()
                        ));
                    }
                    // the constraint lives on the target's table, named
                    // after the reverse relation's column
                    RelationMapping::ReverseMapped => {
                        if let Some(reverse) = &relation.reverse {
                            let target = self.registry.get(&relation.target)?;
                            let fk_column = MappingResolver::foreign_key_column(reverse);
                            statements.push(format!(
                                "ALTER TABLE {table} DROP CONSTRAINT {table}_{fk_column}_fk",
                                table = target.table_name()
                            ));
                        }
                    }
                    RelationMapping::Indirect { .. } => {}
                }
            }
        }
        let mut drop = format!("DROP TABLE {}", meta.table_name());
        if self.dialect.allow_cascade() {
            drop.push_str(" CASCADE");
        }
        statements.push(drop);
        Ok(statements)
    }
}

fn id_type(meta: &ClassMeta) -> DataType {
    meta.id_field()
        .and_then(|id| meta.all_fields().get(id))
        .map(|f| f.data_type)
        .unwrap_or(DataType::Integer)
}
