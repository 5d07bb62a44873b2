use tracing::debug;

use crate::connection::SqlDialect;
use crate::core::{DataType, OrmError, Result, Value};
use crate::mapping::{MappingResolver, RelationMapping};
use crate::query::options::{Filter, FilterField, FilterKind, Options, UNLIMITED};
use crate::schema::{
    ClassMeta, DISCRIMINATOR_COLUMN, MODIFIED_TIME_COLUMN, SchemaRegistry,
};

/// Output of one `compile_find` call: SQL text plus the logical path of
/// every projected column, in projection order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompiledQuery {
    pub sql: String,
    pub column_order: Vec<String>,
}

/// Compiles a root class plus a normalized option tree into SQL text.
///
/// Compilation is deterministic: the same (class, options) pair always
/// yields byte-identical SQL and an identical column order.
pub struct QueryCompiler<'a> {
    registry: &'a SchemaRegistry,
    resolver: &'a MappingResolver,
    dialect: &'a dyn SqlDialect,
}

#[derive(Default)]
struct Projection {
    columns: Vec<String>,
    column_order: Vec<String>,
    joins: Vec<String>,
}

impl<'a> QueryCompiler<'a> {
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

    pub fn compile_find(&self, class: &str, options: &Options) -> Result<CompiledQuery> {
        if !options.is_normalized() {
            return Err(OrmError::Validation(
                "Options must be normalized before compilation".to_string(),
            ));
        }
        let meta = self.registry.get(class)?;

        // Count with no filters and no eager relations degenerates to a
        // bare table count, skipping the inheritance-chain joins entirely.
        if options.count && options.filters.is_empty() && options.eager.is_empty() {
            let sql = format!("SELECT COUNT(*) FROM {}", meta.table_name());
            debug!(class, %sql, "compiled count query");
            return Ok(CompiledQuery {
                sql,
                column_order: Vec::new(),
            });
        }

        let mut projection = Projection::default();
        self.join_root_chain(meta, &mut projection);
        self.walk_level(meta, &[], options, &mut projection)?;

        let mut where_parts = Vec::new();
        self.compile_filters(meta, &[], options, &mut where_parts)?;

        let mut sql = String::from("SELECT ");
        if options.count {
            sql.push_str("COUNT(*)");
        } else {
            sql.push_str(&projection.columns.join(", "));
        }
        sql.push_str(" FROM ");
        sql.push_str(meta.table_name());
        for join in &projection.joins {
            sql.push(' ');
            sql.push_str(join);
        }
        if !where_parts.is_empty() {
            sql.push_str(" WHERE ");
            sql.push_str(&where_parts.join(" AND "));
        }

        if !options.count {
            if !options.order_by.is_empty() {
                let mut clauses = Vec::new();
                for (path, direction) in &options.order_by {
                    let (qualified, _) = self.resolve_order_path(meta, options, path)?;
                    clauses.push(format!("{qualified} {}", direction.sql()));
                }
                sql.push_str(" ORDER BY ");
                sql.push_str(&clauses.join(", "));
            }
            if options.number_records != UNLIMITED {
                sql.push_str(&format!(" LIMIT {}", options.number_records));
                if options.start_record > 0 {
                    sql.push_str(&format!(" OFFSET {}", options.start_record));
                }
            }
        }

        debug!(class, %sql, "compiled find query");
        Ok(CompiledQuery {
            sql,
            column_order: if options.count {
                Vec::new()
            } else {
                projection.column_order
            },
        })
    }

    // ------------------------------------------------------------------
    // Join construction
    // ------------------------------------------------------------------

    /// Inner-join every ancestor table of the root class; the joined-table
    /// strategy needs the full chain to reconstruct a polymorphic row.
    fn join_root_chain(&self, meta: &ClassMeta, out: &mut Projection) {
        let Some(id_field) = meta.id_field() else {
            return;
        };
        let own_alias = meta.table_name();
        for ancestor in meta.parent_chain() {
            let Ok(anc) = self.registry.get(ancestor) else {
                continue;
            };
            out.joins.push(format!(
                "INNER JOIN {anc_table} ON {anc_table}.{id_field} = {own_alias}.{id_field}",
                anc_table = anc.table_name()
            ));
        }
    }

    fn walk_level(
        &self,
        meta: &ClassMeta,
        path: &[String],
        options: &Options,
        out: &mut Projection,
    ) -> Result<()> {
        self.project_columns(meta, path, options, out)?;

        for (rel_name, nested) in &options.eager {
            if !nested.order_by.is_empty()
                || nested.number_records != UNLIMITED
                || nested.start_record != 0
            {
                return Err(OrmError::Validation(format!(
                    "Eager relation '{rel_name}' must not carry ordering or pagination"
                )));
            }
            let relation = meta.all_relations().get(rel_name).ok_or_else(|| {
                OrmError::MissingRelationDefinition(rel_name.clone(), meta.name().to_string())
            })?;
            let target = self.registry.get(&relation.target)?;
            let mut new_path = path.to_vec();
            new_path.push(rel_name.clone());

            self.join_relation(meta, path, rel_name, target, &new_path, out)?;
            self.walk_level(target, &new_path, nested, out)?;
        }
        Ok(())
    }

    /// Left-join one eager relation target (and its ancestor chain) using
    /// the resolved owning side.
    fn join_relation(
        &self,
        source: &ClassMeta,
        source_path: &[String],
        rel_name: &str,
        target: &ClassMeta,
        new_path: &[String],
        out: &mut Projection,
    ) -> Result<()> {
        let source_alias = alias_for(source_path, source.table_name());
        let source_id = required_id(source)?;
        let target_id = required_id(target)?;
        let target_alias = alias_for(new_path, target.table_name());
        let relation = source.all_relations().get(rel_name).ok_or_else(|| {
            OrmError::MissingRelationDefinition(rel_name.to_string(), source.name().to_string())
        })?;

        match self.resolver.resolve(source.name(), rel_name)? {
            RelationMapping::Mapped => {
                // FK column sits on the level that declared the relation
                let decl = source
                    .relation_level(self.registry, rel_name)
                    .unwrap_or(source);
                let decl_alias = alias_for(source_path, decl.table_name());
                let fk = MappingResolver::foreign_key_column(rel_name);
                out.joins.push(format!(
                    "LEFT JOIN {} ON {target_alias}.{target_id} = {decl_alias}.{fk}",
                    with_alias(target.table_name(), &target_alias)
                ));
                self.join_target_chain(target, new_path, target.name(), &target_alias, out);
            }
            RelationMapping::ReverseMapped => {
                let reverse = relation.reverse.as_deref().ok_or_else(|| {
                    OrmError::Validation(format!(
                        "Reverse-mapped relation '{}.{rel_name}' has no reverse name",
                        source.name()
                    ))
                })?;
                let carrier = target
                    .relation_level(self.registry, reverse)
                    .unwrap_or(target);
                let carrier_alias = alias_for(new_path, carrier.table_name());
                let fk = MappingResolver::foreign_key_column(reverse);
                out.joins.push(format!(
                    "LEFT JOIN {} ON {carrier_alias}.{fk} = {source_alias}.{source_id}",
                    with_alias(carrier.table_name(), &carrier_alias)
                ));
                self.join_target_chain(target, new_path, carrier.name(), &carrier_alias, out);
            }
            RelationMapping::Indirect { table } => {
                let assoc_alias = alias_for(new_path, table);
                let decl = source
                    .relation_level(self.registry, rel_name)
                    .unwrap_or(source);
                let source_col = format!("{}_id", decl.table_name());
                let target_col = format!("{}_id", target.table_name());
                out.joins.push(format!(
                    "LEFT JOIN {table} AS {assoc_alias} ON {assoc_alias}.{source_col} = {source_alias}.{source_id}"
                ));
                out.joins.push(format!(
                    "LEFT JOIN {} ON {target_alias}.{target_id} = {assoc_alias}.{target_col}",
                    with_alias(target.table_name(), &target_alias)
                ));
                self.join_target_chain(target, new_path, target.name(), &target_alias, out);
            }
        }
        Ok(())
    }

    /// Join the remaining tables of the target's inheritance chain against
    /// the already-joined entry level, sharing the identifier value.
    fn join_target_chain(
        &self,
        target: &ClassMeta,
        path: &[String],
        entry_class: &str,
        entry_alias: &str,
        out: &mut Projection,
    ) {
        let Some(target_id) = target.id_field() else {
            return;
        };
        let mut levels: Vec<&str> = target.parent_chain().iter().map(String::as_str).collect();
        levels.push(target.name());
        for level in levels {
            if level == entry_class {
                continue;
            }
            let Ok(level_meta) = self.registry.get(level) else {
                continue;
            };
            let level_alias = alias_for(path, level_meta.table_name());
            out.joins.push(format!(
                "LEFT JOIN {} ON {level_alias}.{target_id} = {entry_alias}.{target_id}",
                with_alias(level_meta.table_name(), &level_alias)
            ));
        }
    }

    // ------------------------------------------------------------------
    // Column projection
    // ------------------------------------------------------------------

    fn project_columns(
        &self,
        meta: &ClassMeta,
        path: &[String],
        options: &Options,
        out: &mut Projection,
    ) -> Result<()> {
        let own_alias = alias_for(path, meta.table_name());
        let id_field = required_id(meta)?;

        let selected: Vec<String> = if options.minimal {
            vec![id_field.to_string()]
        } else if let Some(fields) = &options.fields {
            fields.clone()
        } else {
            meta.all_fields().keys().cloned().collect()
        };

        for field in &selected {
            let level_class = meta.field_level(self.registry, field).ok_or_else(|| {
                OrmError::FieldNotFound(field.clone(), meta.name().to_string())
            })?;
            let level_meta = self.registry.get(level_class)?;
            let level_alias = alias_for(path, level_meta.table_name());
            out.columns.push(format!("{level_alias}.{field}"));
            out.column_order.push(logical(path, field));
        }

        // discriminator resolves the concrete subclass; it lives on the
        // hierarchy root's table
        let root_meta = self.registry.hierarchy_root(meta.name())?;
        let root_alias = alias_for(path, root_meta.table_name());
        out.columns
            .push(format!("{root_alias}.{DISCRIMINATOR_COLUMN}"));
        out.column_order.push(logical(path, DISCRIMINATOR_COLUMN));

        out.columns
            .push(format!("{own_alias}.{MODIFIED_TIME_COLUMN}"));
        out.column_order.push(logical(path, MODIFIED_TIME_COLUMN));

        Ok(())
    }

    // ------------------------------------------------------------------
    // Filters and ordering
    // ------------------------------------------------------------------

    fn compile_filters(
        &self,
        meta: &ClassMeta,
        path: &[String],
        options: &Options,
        parts: &mut Vec<String>,
    ) -> Result<()> {
        for filter in &options.filters {
            parts.push(self.compile_filter(meta, path, options, filter)?);
        }
        for (rel_name, nested) in &options.eager {
            let target = self.registry.get_target(meta.name(), rel_name)?;
            let mut new_path = path.to_vec();
            new_path.push(rel_name.clone());
            self.compile_filters(target, &new_path, nested, parts)?;
        }
        Ok(())
    }

    fn compile_filter(
        &self,
        meta: &ClassMeta,
        path: &[String],
        options: &Options,
        filter: &Filter,
    ) -> Result<String> {
        if let FilterKind::Or(children) = &filter.kind {
            let parts = children
                .iter()
                .map(|child| self.compile_filter(meta, path, options, child))
                .collect::<Result<Vec<_>>>()?;
            return Ok(format!("({})", parts.join(" OR ")));
        }

        let mut field_parts = Vec::new();
        for field in &filter.fields {
            field_parts.push(self.compile_predicate(meta, path, options, &filter.kind, field)?);
        }
        if field_parts.len() == 1 {
            Ok(field_parts.pop().unwrap_or_default())
        } else {
            // fields within one filter OR together
            Ok(format!("({})", field_parts.join(" OR ")))
        }
    }

    fn compile_predicate(
        &self,
        meta: &ClassMeta,
        path: &[String],
        options: &Options,
        kind: &FilterKind,
        field: &FilterField,
    ) -> Result<String> {
        let (qualified, data_type) = self.resolve_field_path(meta, path, options, &field.name)?;

        let literal = |value: &Value| -> Result<String> {
            if !data_type.is_compatible(value) {
                return Err(OrmError::Validation(format!(
                    "Field '{}' expects type {}, got {}",
                    field.name,
                    data_type,
                    value.type_name()
                )));
            }
            value.sql_literal(self.dialect.escape_slash())
        };

        match kind {
            FilterKind::Equals => Ok(format!("{qualified} = {}", literal(&field.values[0])?)),
            FilterKind::NotEquals => Ok(format!("{qualified} <> {}", literal(&field.values[0])?)),
            FilterKind::Greater => Ok(format!("{qualified} > {}", literal(&field.values[0])?)),
            FilterKind::GreaterEqual => {
                Ok(format!("{qualified} >= {}", literal(&field.values[0])?))
            }
            FilterKind::Lesser => Ok(format!("{qualified} < {}", literal(&field.values[0])?)),
            FilterKind::LesserEqual => Ok(format!("{qualified} <= {}", literal(&field.values[0])?)),
            FilterKind::In | FilterKind::NotIn => {
                let values = field
                    .values
                    .iter()
                    .map(literal)
                    .collect::<Result<Vec<_>>>()?;
                let keyword = if matches!(kind, FilterKind::In) {
                    "IN"
                } else {
                    "NOT IN"
                };
                Ok(format!("{qualified} {keyword} ({})", values.join(", ")))
            }
            FilterKind::Like => {
                let text = field.values[0].as_str().ok_or_else(|| {
                    OrmError::Validation(format!(
                        "Like filter on '{}' requires a text operand",
                        field.name
                    ))
                })?;
                let pattern = like_pattern(text);
                let quoted = Value::Text(pattern).sql_literal(self.dialect.escape_slash())?;
                Ok(format!("{qualified} LIKE {quoted}"))
            }
            FilterKind::IsNull => Ok(format!("{qualified} IS NULL")),
            FilterKind::IsNotNull => Ok(format!("{qualified} IS NOT NULL")),
            FilterKind::Or(_) => unreachable!("handled in compile_filter"),
        }
    }

    /// Resolve a dotted field path against the eager-joined scope.
    ///
    /// Relation segments must be named in the eager map; the aliases they
    /// qualify against do not exist otherwise. Unknown field names are
    /// rejected here, before any literal value is formatted.
    fn resolve_field_path(
        &self,
        meta: &ClassMeta,
        path: &[String],
        options: &Options,
        dotted: &str,
    ) -> Result<(String, DataType)> {
        let mut meta = meta;
        let mut options = options;
        let mut current_path = path.to_vec();

        let segments: Vec<&str> = dotted.split('.').collect();
        let (field, relations) = segments.split_last().unwrap_or((&"", &[]));

        for segment in relations {
            if !self.registry.is_relation(meta.name(), segment) {
                return Err(OrmError::MissingRelationDefinition(
                    (*segment).to_string(),
                    meta.name().to_string(),
                ));
            }
            let nested = options.eager.get(*segment).ok_or_else(|| {
                OrmError::Validation(format!(
                    "Path '{dotted}' crosses relation '{segment}', which is not eager-loaded"
                ))
            })?;
            meta = self.registry.get_target(meta.name(), segment)?;
            options = nested;
            current_path.push((*segment).to_string());
        }

        let field_def = meta.all_fields().get(*field).ok_or_else(|| {
            OrmError::FieldNotFound((*field).to_string(), meta.name().to_string())
        })?;
        let level_class = meta
            .field_level(self.registry, field)
            .ok_or_else(|| OrmError::FieldNotFound((*field).to_string(), meta.name().to_string()))?;
        let level_meta = self.registry.get(level_class)?;
        let alias = alias_for(&current_path, level_meta.table_name());
        Ok((format!("{alias}.{field}"), field_def.data_type))
    }

    /// Ordering paths fall back to the root table when the first segment is
    /// not an eager relation, so an ambiguous unqualified column is never
    /// emitted.
    fn resolve_order_path(
        &self,
        meta: &ClassMeta,
        options: &Options,
        dotted: &str,
    ) -> Result<(String, DataType)> {
        if let Some((first, _)) = dotted.split_once('.')
            && options.eager.contains_key(first)
        {
            return self.resolve_field_path(meta, &[], options, dotted);
        }
        self.resolve_field_path(meta, &[], options, dotted.rsplit('.').next().unwrap_or(dotted))
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

fn alias_for(path: &[String], table: &str) -> String {
    if path.is_empty() {
        table.to_string()
    } else {
        format!("{}_{table}", path.join("_"))
    }
}

fn with_alias(table: &str, alias: &str) -> String {
    if table == alias {
        table.to_string()
    } else {
        format!("{table} AS {alias}")
    }
}

fn logical(path: &[String], name: &str) -> String {
    if path.is_empty() {
        name.to_string()
    } else {
        format!("{}.{name}", path.join("."))
    }
}

/// LIKE operand with a wildcard inserted around every word.
fn like_pattern(text: &str) -> String {
    let mut pattern = String::from("%");
    for word in text.split_whitespace() {
        pattern.push_str(word);
        pattern.push('%');
    }
    if pattern.len() == 1 {
        pattern.push('%');
    }
    pattern
}
