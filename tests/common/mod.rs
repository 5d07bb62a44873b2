#![allow(dead_code)]

//! Shared fixtures: a scripted fake connection plus the vehicle schema the
//! integration tests drive.

use std::cell::RefCell;
use std::collections::{HashMap, HashSet};
use std::rc::Rc;

use rustormdb::connection::{Connection, Cursor, DefaultDialect, SqlDialect};
use rustormdb::core::{OrmError, Result, Row, Value};
use rustormdb::manager::EntityManager;
use rustormdb::schema::{
    EntityClass, FieldDef, GeneratorKind, RelationDef, SchemaRegistry,
};
use rustormdb::DataType;

/// Test handle into the fake connection's shared state.
#[derive(Clone)]
pub struct FakeHandle {
    log: Rc<RefCell<Vec<String>>>,
    tables: Rc<RefCell<HashSet<String>>>,
    responses: Rc<RefCell<Vec<(String, Vec<Row>)>>>,
    failure: Rc<RefCell<Option<String>>>,
}

impl FakeHandle {
    pub fn sql_log(&self) -> Vec<String> {
        self.log.borrow().clone()
    }

    pub fn clear_log(&self) {
        self.log.borrow_mut().clear();
    }

    /// Script rows for any SELECT whose text contains `pattern`.
    pub fn respond(&self, pattern: &str, rows: Vec<Row>) {
        self.responses
            .borrow_mut()
            .push((pattern.to_string(), rows));
    }

    pub fn add_table(&self, name: &str) {
        self.tables.borrow_mut().insert(name.to_string());
    }

    pub fn executed(&self, fragment: &str) -> bool {
        self.log.borrow().iter().any(|sql| sql.contains(fragment))
    }

    /// Fail the next execute call with a connection error.
    pub fn fail_once(&self, message: &str) {
        *self.failure.borrow_mut() = Some(message.to_string());
    }
}

struct FakeCursor {
    rows: Vec<Row>,
}

impl Cursor for FakeCursor {
    fn fetch_all(&mut self) -> Result<Vec<Row>> {
        Ok(std::mem::take(&mut self.rows))
    }
}

/// Scripted in-memory stand-in for a SQL back end.
///
/// CREATE/DROP TABLE maintain a table set so existence probes behave;
/// SELECTs answer from scripted (pattern, rows) entries; the id-sequence
/// table is emulated so generated identifiers increment realistically.
pub struct FakeConnection {
    log: Rc<RefCell<Vec<String>>>,
    tables: Rc<RefCell<HashSet<String>>>,
    responses: Rc<RefCell<Vec<(String, Vec<Row>)>>>,
    failure: Rc<RefCell<Option<String>>>,
    sequences: HashMap<String, i64>,
    closed: bool,
}

pub fn fake_connection() -> (Box<dyn Connection>, FakeHandle) {
    let handle = FakeHandle {
        log: Rc::new(RefCell::new(Vec::new())),
        tables: Rc::new(RefCell::new(HashSet::new())),
        responses: Rc::new(RefCell::new(Vec::new())),
        failure: Rc::new(RefCell::new(None)),
    };
    let connection = FakeConnection {
        log: handle.log.clone(),
        tables: handle.tables.clone(),
        responses: handle.responses.clone(),
        failure: handle.failure.clone(),
        sequences: HashMap::new(),
        closed: true,
    };
    (Box::new(connection), handle)
}

impl FakeConnection {
    fn quoted(sql: &str) -> Option<String> {
        sql.split('\'').nth(1).map(ToString::to_string)
    }

    fn table_after_from(sql: &str) -> Option<String> {
        let mut words = sql.split_whitespace();
        while let Some(word) = words.next() {
            if word == "FROM" {
                return words.next().map(ToString::to_string);
            }
        }
        None
    }

    fn sequence_rows(&mut self, sql: &str) -> Vec<Row> {
        let Some(name) = Self::quoted(sql) else {
            return Vec::new();
        };
        match self.sequences.get(&name) {
            Some(next) => vec![vec![Value::Integer(*next)]],
            None => Vec::new(),
        }
    }
}

impl Connection for FakeConnection {
    fn open(&mut self) -> Result<()> {
        self.closed = false;
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        self.closed = true;
        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.closed
    }

    fn begin(&mut self) -> Result<()> {
        self.log.borrow_mut().push("BEGIN".to_string());
        Ok(())
    }

    fn commit(&mut self) -> Result<()> {
        self.log.borrow_mut().push("COMMIT".to_string());
        Ok(())
    }

    fn rollback(&mut self) -> Result<()> {
        self.log.borrow_mut().push("ROLLBACK".to_string());
        Ok(())
    }

    fn execute(&mut self, sql: &str) -> Result<Box<dyn Cursor>> {
        if self.closed {
            return Err(OrmError::Connection("connection is closed".to_string()));
        }
        if let Some(message) = self.failure.borrow_mut().take() {
            return Err(OrmError::Connection(message));
        }
        self.log.borrow_mut().push(sql.to_string());

        if let Some(rest) = sql.strip_prefix("CREATE TABLE ") {
            if let Some(name) = rest.split('(').next() {
                self.tables.borrow_mut().insert(name.trim().to_string());
            }
            return Ok(Box::new(FakeCursor { rows: Vec::new() }));
        }
        if let Some(rest) = sql.strip_prefix("DROP TABLE ") {
            let name = rest.split_whitespace().next().unwrap_or(rest);
            self.tables.borrow_mut().remove(name);
            return Ok(Box::new(FakeCursor { rows: Vec::new() }));
        }

        // emulated sequence-counter table
        if sql.starts_with("SELECT next_id FROM id_sequence") {
            let rows = self.sequence_rows(sql);
            return Ok(Box::new(FakeCursor { rows }));
        }
        if sql.starts_with("INSERT INTO id_sequence") {
            if let Some(name) = Self::quoted(sql) {
                self.sequences.insert(name, 2);
            }
            return Ok(Box::new(FakeCursor { rows: Vec::new() }));
        }
        if sql.starts_with("UPDATE id_sequence") {
            if let (Some(name), Some(next)) = (
                Self::quoted(sql),
                sql.split("next_id = ")
                    .nth(1)
                    .and_then(|rest| rest.split(' ').next())
                    .and_then(|n| n.parse::<i64>().ok()),
            ) {
                self.sequences.insert(name, next);
            }
            return Ok(Box::new(FakeCursor { rows: Vec::new() }));
        }

        if sql.starts_with("SELECT") {
            if let Some(table) = Self::table_after_from(sql)
                && !self.tables.borrow().contains(&table)
            {
                return Err(OrmError::MissingTable(table));
            }
            for (pattern, rows) in self.responses.borrow().iter() {
                if sql.contains(pattern) {
                    return Ok(Box::new(FakeCursor { rows: rows.clone() }));
                }
            }
            if sql.starts_with("SELECT COUNT(*)") {
                return Ok(Box::new(FakeCursor {
                    rows: vec![vec![Value::Integer(0)]],
                }));
            }
            return Ok(Box::new(FakeCursor { rows: Vec::new() }));
        }

        Ok(Box::new(FakeCursor { rows: Vec::new() }))
    }

    fn lock_table(&mut self, table: &str, params: &str) -> Result<()> {
        self.log
            .borrow_mut()
            .push(format!("LOCK TABLE {table} {params}").trim().to_string());
        Ok(())
    }

    fn dialect(&self) -> &dyn SqlDialect {
        &DefaultDialect
    }
}

// ----------------------------------------------------------------------
// Schema fixtures
// ----------------------------------------------------------------------

/// RootEntity <- Person <- Employee hierarchy plus Car (many-to-many with
/// Person) and Dog (to-one owner).
pub fn vehicle_registry() -> SchemaRegistry {
    let mut registry = SchemaRegistry::new();
    registry
        .register(
            EntityClass::builder("RootEntity")
                .id(FieldDef::new("object_id", DataType::Integer))
                .field(FieldDef::new("status", DataType::Integer))
                .build()
                .unwrap(),
        )
        .unwrap();
    registry
        .register(
            EntityClass::builder("Person")
                .parent("RootEntity")
                .field(FieldDef::new("name", DataType::Text))
                .relation(RelationDef::to_many("cars", "Car").reverse("owners"))
                .relation(RelationDef::to_many("dogs", "Dog").reverse("owner"))
                .build()
                .unwrap(),
        )
        .unwrap();
    registry
        .register(
            EntityClass::builder("Employee")
                .parent("Person")
                .field(FieldDef::new("salary", DataType::Float))
                .build()
                .unwrap(),
        )
        .unwrap();
    registry
        .register(
            EntityClass::builder("Car")
                .id(FieldDef::new("object_id", DataType::Integer))
                .field(FieldDef::new("model", DataType::Text))
                .relation(RelationDef::to_many("owners", "Person").reverse("cars"))
                .build()
                .unwrap(),
        )
        .unwrap();
    registry
        .register(
            EntityClass::builder("Dog")
                .id(FieldDef::new("object_id", DataType::Integer))
                .field(FieldDef::new("name", DataType::Text))
                .relation(RelationDef::to_one("owner", "Person").reverse("dogs"))
                .build()
                .unwrap(),
        )
        .unwrap();
    registry
}

/// Single class with a sequence-generated identifier.
pub fn sequence_registry() -> SchemaRegistry {
    let mut registry = SchemaRegistry::new();
    registry
        .register(
            EntityClass::builder("Ticket")
                .id(
                    FieldDef::new("object_id", DataType::Integer)
                        .generated(GeneratorKind::SequenceTable),
                )
                .field(FieldDef::new("subject", DataType::Text).mandatory())
                .build()
                .unwrap(),
        )
        .unwrap();
    registry
}

pub fn manager_with(registry: SchemaRegistry) -> (EntityManager, FakeHandle) {
    let (connection, handle) = fake_connection();
    let manager = EntityManager::from_connection(registry, connection).unwrap();
    (manager, handle)
}

pub fn entity(class: &str, fields: &[(&str, Value)]) -> rustormdb::EntityRef {
    let mut instance = rustormdb::EntityInstance::new(class);
    for (name, value) in fields {
        instance.set(*name, value.clone());
    }
    instance.into_ref()
}

/// Manager with the vehicle schema, started against the fake back end.
pub fn started_manager() -> (EntityManager, FakeHandle) {
    let (mut manager, handle) = manager_with(vehicle_registry());
    manager.start().unwrap();
    handle.clear_log();
    (manager, handle)
}
