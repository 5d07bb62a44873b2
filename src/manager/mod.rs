//! The persistence facade: sequences schema creation, reads and writes
//! over one connection, and owns the transaction boundary.

use std::collections::{BTreeMap, HashMap, HashSet};

use chrono::Utc;
use tracing::{debug, warn};

use crate::connection::{Connection, EngineRegistry};
use crate::core::{OrmError, Result, Value};
use crate::entity::{EntityInstance, EntityRef, IdentityScope, RelationValue, SharedScope};
use crate::mapping::{MappingResolver, RelationMapping};
use crate::query::{DdlGenerator, DmlCompiler, Filter, Options, QueryCompiler};
use crate::schema::{
    Cardinality, DISCRIMINATOR_COLUMN, GeneratorKind, MODIFIED_TIME_COLUMN, SchemaRegistry,
};
use crate::unpack::{Unpacked, Unpacker};

mod generator;

pub use generator::SEQUENCE_TABLE;

/// One unit-of-work facade over a schema registry and a connection.
///
/// State machine: closed, then open, then an explicit begin/commit or
/// rollback cycle, then closed again. All state (existence cache, identity
/// scope) is single-threaded per manager; callers wanting concurrency use
/// one manager per thread.
pub struct EntityManager {
    registry: SchemaRegistry,
    resolver: MappingResolver,
    connection: Box<dyn Connection>,
    exists_cache: HashMap<String, bool>,
    scope: SharedScope,
    open: bool,
}

impl EntityManager {
    pub fn new(
        registry: SchemaRegistry,
        engines: &EngineRegistry,
        engine: &str,
    ) -> Result<Self> {
        let connection = engines.create(engine)?;
        Self::from_connection(registry, connection)
    }

    /// Build a manager around an already-constructed connection.
    ///
    /// Mapping resolution runs here, so relation configuration errors
    /// surface before the first query.
    pub fn from_connection(
        registry: SchemaRegistry,
        connection: Box<dyn Connection>,
    ) -> Result<Self> {
        let resolver = MappingResolver::build(&registry)?;
        Ok(Self {
            registry,
            resolver,
            connection,
            exists_cache: HashMap::new(),
            scope: IdentityScope::shared(),
            open: false,
        })
    }

    pub fn registry(&self) -> &SchemaRegistry {
        &self.registry
    }

    // ------------------------------------------------------------------
    // Lifecycle and transactions
    // ------------------------------------------------------------------

    pub fn is_open(&self) -> bool {
        self.open
    }

    pub fn open(&mut self) -> Result<()> {
        if !self.open {
            self.connection.open()?;
            self.open = true;
        }
        Ok(())
    }

    pub fn close(&mut self) -> Result<()> {
        if self.open {
            self.connection.close()?;
            self.open = false;
            self.scope.borrow_mut().clear();
        }
        Ok(())
    }

    /// Open the connection and create missing schema definitions inside a
    /// dedicated transaction; a partial failure rolls everything back.
    pub fn start(&mut self) -> Result<()> {
        self.open()?;
        self.begin()?;
        if let Err(err) = self.create_definitions() {
            warn!(%err, "schema creation failed, rolling back");
            self.rollback()?;
            return Err(err);
        }
        self.commit()
    }

    pub fn begin(&mut self) -> Result<()> {
        self.ensure_open("begin")?;
        self.connection.begin()
    }

    pub fn commit(&mut self) -> Result<()> {
        self.ensure_open("commit")?;
        self.connection.commit()
    }

    pub fn rollback(&mut self) -> Result<()> {
        self.ensure_open("rollback")?;
        warn!("rolling back transaction");
        self.connection.rollback()
    }

    fn ensure_open(&self, operation: &str) -> Result<()> {
        if self.open {
            Ok(())
        } else {
            Err(OrmError::ClosedManager(operation.to_string()))
        }
    }

    // ------------------------------------------------------------------
    // Schema definitions
    // ------------------------------------------------------------------

    /// Create every missing table, index and association table.
    ///
    /// Idempotent against the existence cache; a table found by the probe
    /// is never re-created.
    pub fn create_definitions(&mut self) -> Result<()> {
        self.ensure_open("create_definitions")?;

        let needs_sequence = self.registry.classes().any(|meta| {
            meta.id_field()
                .and_then(|id| meta.all_fields().get(id))
                .and_then(|field| field.generated)
                == Some(GeneratorKind::SequenceTable)
        });
        if needs_sequence && !self.probe_table(SEQUENCE_TABLE)? {
            let ddl = generator::sequence_table_ddl();
            run_all(&mut self.connection, std::slice::from_ref(&ddl))?;
            self.exists_cache.insert(SEQUENCE_TABLE.to_string(), true);
        }

        let classes: Vec<String> = self.registry.classes().map(|m| m.name().to_string()).collect();
        for class in classes {
            let table = self.registry.get(&class)?.table_name().to_string();
            if !self.probe_table(&table)? {
                let statements = {
                    let dialect = self.connection.dialect();
                    DdlGenerator::new(&self.registry, &self.resolver, dialect)
                        .create_class(&class)?
                };
                run_all(&mut self.connection, &statements)?;
                self.exists_cache.insert(table, true);
            }

            let own_relations: Vec<String> = self
                .registry
                .get(&class)?
                .own_relations()
                .keys()
                .cloned()
                .collect();
            for relation in own_relations {
                let RelationMapping::Indirect { table } =
                    self.resolver.resolve(&class, &relation)?.clone()
                else {
                    continue;
                };
                if self.probe_table(&table)? {
                    continue;
                }
                let statements = {
                    let dialect = self.connection.dialect();
                    DdlGenerator::new(&self.registry, &self.resolver, dialect)
                        .create_association(&class, &relation)?
                };
                run_all(&mut self.connection, &statements)?;
                self.exists_cache.insert(table, true);
            }
        }
        Ok(())
    }

    /// Drop one class's tables and recurse into direct-relation targets,
    /// association tables first.
    pub fn drop_definitions(&mut self, class: &str) -> Result<()> {
        self.ensure_open("drop_definitions")?;
        let mut visited = HashSet::new();
        self.drop_class_tables(class, &mut visited)
    }

    fn drop_class_tables(&mut self, class: &str, visited: &mut HashSet<String>) -> Result<()> {
        if !visited.insert(class.to_string()) {
            return Ok(());
        }
        let statements = {
            let dialect = self.connection.dialect();
            DdlGenerator::new(&self.registry, &self.resolver, dialect).drop_class(class)?
        };
        run_all(&mut self.connection, &statements)?;

        let table = self.registry.get(class)?.table_name().to_string();
        self.exists_cache.remove(&table);

        let targets: Vec<String> = {
            let meta = self.registry.get(class)?;
            let mut targets = Vec::new();
            for (name, relation) in meta.own_relations() {
                match self.resolver.resolve(class, name)? {
                    RelationMapping::Indirect { table } => {
                        self.exists_cache.remove(table);
                    }
                    RelationMapping::Mapped | RelationMapping::ReverseMapped => {
                        targets.push(relation.target.clone());
                    }
                }
            }
            targets
        };
        for target in targets {
            self.drop_class_tables(&target, visited)?;
        }
        Ok(())
    }

    /// Whether the class's own table exists, per the cached probe.
    pub fn exists(&mut self, class: &str) -> Result<bool> {
        let table = self.registry.get(class)?.table_name().to_string();
        self.probe_table(&table)
    }

    pub fn exists_association(&mut self, table: &str) -> Result<bool> {
        self.probe_table(table)
    }

    /// Reset the existence cache and identity scope. Staleness here causes
    /// duplicate-table errors or missed schema upgrades, so the reset is
    /// always explicit.
    pub fn destroy(&mut self) {
        self.exists_cache.clear();
        self.scope.borrow_mut().clear();
    }

    /// Probe one table with a trivial count. Only a missing-table error
    /// counts as absence; any other failure propagates uncached, so a
    /// transient connection error never provokes a spurious CREATE TABLE.
    fn probe_table(&mut self, table: &str) -> Result<bool> {
        if let Some(known) = self.exists_cache.get(table) {
            return Ok(*known);
        }
        let found = match self
            .connection
            .execute(&format!("SELECT COUNT(*) FROM {table}"))
            .and_then(|mut cursor| cursor.fetch_all())
        {
            Ok(_) => true,
            Err(OrmError::MissingTable(_)) => false,
            Err(err) => return Err(err),
        };
        self.exists_cache.insert(table.to_string(), found);
        Ok(found)
    }

    // ------------------------------------------------------------------
    // Reads
    // ------------------------------------------------------------------

    pub fn find(&mut self, class: &str, options: Options) -> Result<Unpacked> {
        self.ensure_open("find")?;
        let options = if options.is_normalized() {
            options
        } else {
            options.normalize(&self.registry, class)?
        };
        let compiled = {
            let dialect = self.connection.dialect();
            QueryCompiler::new(&self.registry, &self.resolver, dialect)
                .compile_find(class, &options)?
        };
        let mut cursor = self.connection.execute(&compiled.sql)?;
        let rows = cursor.fetch_all()?;
        // scope = false unpacks into a scope private to this call
        let scope = if options.scope {
            self.scope.clone()
        } else {
            IdentityScope::shared()
        };
        Unpacker::new(&self.registry).unpack(
            class,
            &compiled.column_order,
            &options,
            &rows,
            &scope,
        )
    }

    /// `find` accepting the JSON shorthand forms.
    pub fn find_json(&mut self, class: &str, options: &serde_json::Value) -> Result<Unpacked> {
        let options = Options::from_json(&self.registry, class, options)?;
        self.find(class, options)
    }

    pub fn get(&mut self, class: &str, id: Value) -> Result<Option<EntityRef>> {
        let id_field = self.registry.get_id(class)?.to_string();
        let options = Options::new().filter(Filter::equals(id_field, id));
        Ok(self.find(class, options)?.entities().into_iter().next())
    }

    pub fn count(&mut self, class: &str, options: Options) -> Result<i64> {
        let mut options = options;
        options.count = true;
        Ok(self.find(class, options)?.count())
    }

    /// Resolve one lazy relation slot with a targeted re-select.
    ///
    /// The manager's identity scope makes the re-selected root converge on
    /// the given instance, so the slot lands on it directly.
    pub fn load_relation(&mut self, entity: &EntityRef, name: &str) -> Result<RelationValue> {
        self.ensure_open("load_relation")?;
        let (class, id) = self.attached_identity(entity, "lazy-load a relation")?;
        self.registry.get_relation(&class, name)?;

        if let Some(slot) = entity.borrow().relation(name)
            && !slot.is_lazy()
        {
            return Ok(slot.clone());
        }

        self.scope.borrow_mut().insert(&class, &id, entity.clone());
        let id_field = self.registry.get_id(&class)?.to_string();
        let options = Options::new()
            .minimal()
            .eager(name, Options::new())
            .filter(Filter::equals(id_field, id));
        self.find(&class, options)?;

        Ok(entity
            .borrow()
            .relation(name)
            .cloned()
            .unwrap_or(RelationValue::Lazy))
    }

    /// Re-select all fields of the instance's concrete class.
    ///
    /// A polymorphic `get` against an ancestor class only loads ancestor
    /// fields; this fills in the subclass levels on demand.
    pub fn load_full(&mut self, entity: &EntityRef) -> Result<()> {
        self.ensure_open("load_full")?;
        let (class, id) = self.attached_identity(entity, "reload fields")?;
        self.scope.borrow_mut().insert(&class, &id, entity.clone());
        self.get(&class, id)?;
        Ok(())
    }

    fn attached_identity(&self, entity: &EntityRef, action: &str) -> Result<(String, Value)> {
        let instance = entity.borrow();
        if !instance.is_attached() {
            return Err(OrmError::Validation(format!(
                "Detached instance of '{}' cannot {action}",
                instance.class_name()
            )));
        }
        let class = instance.class_name().to_string();
        let id_field = self.registry.get_id(&class)?;
        let id = instance
            .get(id_field)
            .filter(|v| !v.is_null())
            .cloned()
            .ok_or_else(|| {
                OrmError::Validation(format!("Instance of '{class}' has no identifier value"))
            })?;
        Ok((class, id))
    }

    // ------------------------------------------------------------------
    // Writes
    // ------------------------------------------------------------------

    /// Insert a new instance: generate a missing identifier, validate
    /// fields and relations, write one INSERT per inheritance level, then
    /// the unmapped relation rows.
    pub fn save(&mut self, entity: &EntityRef) -> Result<()> {
        self.ensure_open("save")?;
        let class = entity.borrow().class_name().to_string();
        let meta = self.registry.get(&class)?;
        let id_field = self
            .registry
            .get_id(&class)?
            .to_string();

        // identifier generation, serialized through the sequence lock
        let missing_id = entity
            .borrow()
            .get(&id_field)
            .is_none_or(Value::is_null);
        if missing_id
            && let Some(kind) = meta.all_fields().get(&id_field).and_then(|f| f.generated)
        {
            let sequence_name = self.registry.hierarchy_root(&class)?.table_name().to_string();
            let id = generator::generate(kind, self.connection.as_mut(), &sequence_name)?;
            entity.borrow_mut().set(id_field.clone(), id);
        }

        self.validate_fields(&class, entity)?;
        self.validate_relations(&class, entity)?;

        let id = entity
            .borrow()
            .get(&id_field)
            .filter(|v| !v.is_null())
            .cloned()
            .ok_or_else(|| {
                OrmError::Validation(format!("Instance of '{class}' has no identifier value"))
            })?;
        let values = entity.borrow().fields().clone();
        let fk_values = self.collect_fk_values(&class, entity)?;
        let mtime = now_epoch();

        let statements = {
            let dialect = self.connection.dialect();
            DmlCompiler::new(&self.registry, &self.resolver, dialect)
                .insert_statements(&class, &values, &fk_values, mtime)?
        };
        run_all(&mut self.connection, &statements)?;

        self.sync_relations(&class, entity, &id)?;

        entity.borrow_mut().attach();
        self.scope.borrow_mut().insert(&class, &id, entity.clone());
        Ok(())
    }

    /// Per-level UPDATEs for an existing instance; levels without a changed
    /// own field are skipped by the DML compiler.
    pub fn update(&mut self, entity: &EntityRef) -> Result<()> {
        self.ensure_open("update")?;
        let (class, id) = {
            let instance = entity.borrow();
            let class = instance.class_name().to_string();
            let id_field = self.registry.get_id(&class)?;
            let id = instance
                .get(id_field)
                .filter(|v| !v.is_null())
                .cloned()
                .ok_or_else(|| {
                    OrmError::Validation(format!(
                        "Instance of '{class}' has no identifier value"
                    ))
                })?;
            (class, id)
        };

        self.validate_fields(&class, entity)?;
        self.validate_relations(&class, entity)?;

        let changed = entity.borrow().fields().clone();
        let fk_changes = self.collect_fk_values(&class, entity)?;
        let mtime = now_epoch();

        let statements = {
            let dialect = self.connection.dialect();
            DmlCompiler::new(&self.registry, &self.resolver, dialect)
                .update_statements(&class, &id, &changed, &fk_changes, mtime)?
        };
        run_all(&mut self.connection, &statements)?;

        self.sync_relations(&class, entity, &id)?;
        entity.borrow_mut().attach();
        Ok(())
    }

    /// Remove an instance: clear its relation rows, delete every
    /// inheritance level leaf-first, then detach.
    ///
    /// Reverse foreign keys pointing at the row are set to NULL rather than
    /// cascading into target rows.
    pub fn remove(&mut self, entity: &EntityRef) -> Result<()> {
        self.ensure_open("remove")?;
        let (class, id) = self.attached_identity(entity, "be removed")?;

        let relations: Vec<String> = self
            .registry
            .get(&class)?
            .all_relations()
            .keys()
            .cloned()
            .collect();
        for relation in relations {
            let statements = {
                let dialect = self.connection.dialect();
                DmlCompiler::new(&self.registry, &self.resolver, dialect)
                    .relation_clear_statements(&class, &relation, &id)?
            };
            run_all(&mut self.connection, &statements)?;
        }

        let statements = {
            let dialect = self.connection.dialect();
            DmlCompiler::new(&self.registry, &self.resolver, dialect)
                .delete_statements(&class, &id)?
        };
        run_all(&mut self.connection, &statements)?;

        self.scope.borrow_mut().remove(&class, &id);
        entity.borrow_mut().detach();
        Ok(())
    }

    /// Existence probe for one row, used to pick save versus update.
    pub fn verify(&mut self, class: &str, id: &Value) -> Result<bool> {
        let id_field = self.registry.get_id(class)?.to_string();
        let mut options = Options::new().filter(Filter::equals(id_field, id.clone()));
        options.count = true;
        Ok(self.find(class, options)?.count() > 0)
    }

    pub fn save_or_update(&mut self, entity: &EntityRef) -> Result<()> {
        let class = entity.borrow().class_name().to_string();
        let id_field = self.registry.get_id(&class)?.to_string();
        let id = entity
            .borrow()
            .get(&id_field)
            .filter(|v| !v.is_null())
            .cloned();
        match id {
            Some(id) if self.verify(&class, &id)? => self.update(entity),
            _ => self.save(entity),
        }
    }

    // ------------------------------------------------------------------
    // Locks
    // ------------------------------------------------------------------

    pub fn lock(&mut self, class: &str, id: &Value) -> Result<()> {
        self.ensure_open("lock")?;
        let (table, params) = {
            let meta = self.registry.get(class)?;
            let id_field = self.registry.get_id(class)?;
            let literal = id.sql_literal(self.connection.dialect().escape_slash())?;
            (
                meta.table_name().to_string(),
                format!("{id_field} = {literal}"),
            )
        };
        self.connection.lock_table(&table, &params)
    }

    pub fn lock_table(&mut self, name: &str, params: &str) -> Result<()> {
        self.ensure_open("lock_table")?;
        self.connection.lock_table(name, params)
    }

    // ------------------------------------------------------------------
    // Bulk boundary
    // ------------------------------------------------------------------

    /// Map-mode rows for bulk export; the container format is the caller's.
    pub fn export_maps(&mut self, class: &str, options: Options) -> Result<Vec<serde_json::Value>> {
        let mut options = options;
        options.map_mode = true;
        Ok(self.find(class, options)?.maps())
    }

    /// Consume map-mode rows inside one transaction; any failure rolls the
    /// whole import back.
    pub fn import_maps(&mut self, class: &str, rows: &[serde_json::Value]) -> Result<()> {
        self.ensure_open("import_maps")?;
        self.begin()?;
        match self.import_rows(class, rows) {
            Ok(()) => self.commit(),
            Err(err) => {
                warn!(%err, "import failed, rolling back");
                self.rollback()?;
                Err(err)
            }
        }
    }

    fn import_rows(&mut self, class: &str, rows: &[serde_json::Value]) -> Result<()> {
        let mut entities = Vec::with_capacity(rows.len());
        for row in rows {
            let map = row.as_object().ok_or_else(|| {
                OrmError::Validation(format!("Import row for '{class}' must be an object"))
            })?;
            let concrete = map
                .get(DISCRIMINATOR_COLUMN)
                .and_then(|v| v.as_str())
                .filter(|name| self.registry.is_subclass(name, class))
                .unwrap_or(class)
                .to_string();
            let meta = self.registry.get(&concrete)?;
            let mut instance = EntityInstance::from_meta(meta);
            for (key, json) in map {
                if key == DISCRIMINATOR_COLUMN || key == MODIFIED_TIME_COLUMN {
                    continue;
                }
                let Some(field) = meta.all_fields().get(key) else {
                    continue;
                };
                let value = Value::from_json(json)?.coerce(field.data_type)?;
                instance.set(key.clone(), value);
            }
            entities.push(instance.into_ref());
        }
        for entity in &entities {
            self.save_or_update(entity)?;
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Validation
    // ------------------------------------------------------------------

    fn validate_fields(&self, class: &str, entity: &EntityRef) -> Result<()> {
        let meta = self.registry.get(class)?;
        let instance = entity.borrow();
        for (name, field) in meta.all_fields() {
            match instance.get(name) {
                Some(value) if !value.is_null() => {
                    if !field.data_type.is_compatible(value) {
                        return Err(OrmError::Validation(format!(
                            "Field '{name}' of '{class}' expects type {}, got {}",
                            field.data_type,
                            value.type_name()
                        )));
                    }
                }
                _ if field.mandatory && field.generated.is_none() => {
                    return Err(OrmError::Validation(format!(
                        "Mandatory field '{name}' of '{class}' is missing"
                    )));
                }
                _ => {}
            }
        }
        Ok(())
    }

    /// Relation type checks run before any SQL text is produced.
    fn validate_relations(&self, class: &str, entity: &EntityRef) -> Result<()> {
        let meta = self.registry.get(class)?;
        let instance = entity.borrow();
        for (name, relation) in meta.all_relations() {
            let check_target = |child: &EntityRef| -> Result<()> {
                let child_class = child.borrow().class_name().to_string();
                if !self.registry.is_subclass(&child_class, &relation.target) {
                    return Err(OrmError::RelationValidation(format!(
                        "Relation '{class}.{name}' expects '{}', got '{child_class}'",
                        relation.target
                    )));
                }
                Ok(())
            };
            match instance.relation(name) {
                None | Some(RelationValue::Lazy) => {}
                Some(RelationValue::One(child)) => {
                    if relation.cardinality == Cardinality::ToMany {
                        return Err(OrmError::RelationValidation(format!(
                            "To-many relation '{class}.{name}' was assigned a single instance"
                        )));
                    }
                    if let Some(child) = child {
                        check_target(child)?;
                    }
                }
                Some(RelationValue::Many(children)) => {
                    if relation.cardinality == Cardinality::ToOne {
                        return Err(OrmError::RelationValidation(format!(
                            "To-one relation '{class}.{name}' was assigned a collection"
                        )));
                    }
                    for child in children {
                        check_target(child)?;
                    }
                }
            }
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Write helpers
    // ------------------------------------------------------------------

    /// Identifier values for mapped to-one relations with a resolved slot.
    fn collect_fk_values(
        &self,
        class: &str,
        entity: &EntityRef,
    ) -> Result<BTreeMap<String, Value>> {
        let meta = self.registry.get(class)?;
        let instance = entity.borrow();
        let mut fk_values = BTreeMap::new();
        for (name, relation) in meta.all_relations() {
            if relation.cardinality != Cardinality::ToOne
                || self.resolver.resolve(class, name)? != &RelationMapping::Mapped
            {
                continue;
            }
            match instance.relation(name) {
                Some(RelationValue::One(Some(child))) => {
                    let target_id_field = self.registry.get_id(&relation.target)?;
                    let child_id = child
                        .borrow()
                        .get(target_id_field)
                        .cloned()
                        .unwrap_or(Value::Null);
                    fk_values.insert(name.clone(), child_id);
                }
                Some(RelationValue::One(None)) => {
                    fk_values.insert(name.clone(), Value::Null);
                }
                _ => {}
            }
        }
        Ok(fk_values)
    }

    /// Rewrite association rows and reverse foreign keys for every resolved
    /// unmapped relation slot.
    fn sync_relations(&mut self, class: &str, entity: &EntityRef, id: &Value) -> Result<()> {
        let relations: Vec<(String, Vec<Value>)> = {
            let meta = self.registry.get(class)?;
            let instance = entity.borrow();
            let mut relations = Vec::new();
            for (name, relation) in meta.all_relations() {
                if self.resolver.resolve(class, name)? == &RelationMapping::Mapped {
                    continue;
                }
                let target_id_field = self.registry.get_id(&relation.target)?;
                let target_ids: Vec<Value> = match instance.relation(name) {
                    Some(RelationValue::Many(children)) => children
                        .iter()
                        .filter_map(|child| child.borrow().get(target_id_field).cloned())
                        .collect(),
                    Some(RelationValue::One(Some(child))) => child
                        .borrow()
                        .get(target_id_field)
                        .cloned()
                        .into_iter()
                        .collect(),
                    Some(RelationValue::One(None)) => Vec::new(),
                    None | Some(RelationValue::Lazy) => continue,
                };
                relations.push((name.clone(), target_ids));
            }
            relations
        };

        for (name, target_ids) in relations {
            let statements = {
                let dialect = self.connection.dialect();
                DmlCompiler::new(&self.registry, &self.resolver, dialect)
                    .relation_statements(class, &name, id, &target_ids)?
            };
            run_all(&mut self.connection, &statements)?;
        }
        Ok(())
    }
}

fn run_all(connection: &mut Box<dyn Connection>, statements: &[String]) -> Result<()> {
    for sql in statements {
        debug!(%sql, "executing statement");
        connection.execute(sql)?;
    }
    Ok(())
}

fn now_epoch() -> f64 {
    Utc::now().timestamp_millis() as f64 / 1000.0
}
