//! Everything a typical caller needs: schema declaration, the manager
//! facade, query options and the connection traits.

pub use crate::connection::{Connection, Cursor, DefaultDialect, EngineRegistry, SqlDialect};
pub use crate::core::{DataType, OrmError, Result, Row, Value};
pub use crate::entity::{EntityInstance, EntityRef, RelationValue};
pub use crate::manager::EntityManager;
pub use crate::query::{Direction, Filter, FilterField, FilterKind, Options, UNLIMITED};
pub use crate::schema::{
    Cardinality, EntityClass, FieldDef, GeneratorKind, RelationDef, SchemaRegistry,
};
pub use crate::unpack::Unpacked;
