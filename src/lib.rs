// ============================================================================
// RustOrmDB Library
// ============================================================================

//! An object-relational mapping core: declarative entity classes with
//! joined-table inheritance, a deterministic SQL query compiler, schema DDL
//! generation and an identity-mapped result unpacker, fronted by an entity
//! manager that owns the transaction boundary.
//!
//! Queries arrive as normalized option trees (or their JSON shorthand), not
//! as SQL text; the back end is any engine implementing the [`connection`]
//! traits.
//!
//! # Examples
//!
//! ```no_run
//! use rustormdb::prelude::*;
//!
//! # fn main() -> rustormdb::core::Result<()> {
//! # fn open_connection() -> Box<dyn rustormdb::connection::Connection> { unimplemented!() }
//! let mut registry = SchemaRegistry::new();
//! registry.register(
//!     EntityClass::builder("Person")
//!         .id(FieldDef::new("object_id", DataType::Integer).generated(GeneratorKind::SequenceTable))
//!         .field(FieldDef::new("name", DataType::Text).mandatory())
//!         .build()?,
//! )?;
//!
//! let mut manager = EntityManager::from_connection(registry, open_connection())?;
//! manager.start()?;
//!
//! let found = manager.find_json("Person", &serde_json::json!({"name": "Ada"}))?;
//! for person in found.entities() {
//!     println!("{:?}", person.borrow().get("name"));
//! }
//! # Ok(())
//! # }
//! ```

pub mod connection;
pub mod core;
pub mod entity;
pub mod manager;
pub mod mapping;
pub mod prelude;
pub mod query;
pub mod schema;
pub mod unpack;

// Re-export main types for convenience
pub use connection::{Connection, Cursor, DefaultDialect, EngineRegistry, SqlDialect};
pub use core::{DataType, OrmError, Result, Row, Value};
pub use entity::{EntityInstance, EntityRef, IdentityScope, RelationValue};
pub use manager::EntityManager;
pub use mapping::{MappingResolver, RelationMapping};
pub use query::{CompiledQuery, Filter, Options, QueryCompiler};
pub use schema::{EntityClass, FieldDef, GeneratorKind, RelationDef, SchemaRegistry};
pub use unpack::{Unpacked, Unpacker};
