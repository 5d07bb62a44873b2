//! The back-end boundary: connection and cursor traits, dialect hooks and
//! the engine registry.

use std::collections::BTreeMap;

use crate::core::{OrmError, Result, Row};

mod dialect;

pub use dialect::{DefaultDialect, SqlDialect};

/// Result-set handle returned by [`Connection::execute`].
pub trait Cursor {
    fn fetch_all(&mut self) -> Result<Vec<Row>>;
}

/// Synchronous SQL back end.
///
/// The core issues parameterless SQL text and expects blocking execution;
/// underlying driver errors surface as `OrmError::Connection` and are never
/// translated or swallowed. Statements against an unknown table must
/// surface as `OrmError::MissingTable` so existence probes can tell
/// absence apart from a failing connection.
pub trait Connection {
    fn open(&mut self) -> Result<()>;
    fn close(&mut self) -> Result<()>;
    fn is_closed(&self) -> bool;

    fn begin(&mut self) -> Result<()>;
    fn commit(&mut self) -> Result<()>;
    fn rollback(&mut self) -> Result<()>;

    fn execute(&mut self, sql: &str) -> Result<Box<dyn Cursor>>;

    /// Serializing table lock, used by the sequence-table id generator.
    fn lock_table(&mut self, table: &str, params: &str) -> Result<()>;

    fn dialect(&self) -> &dyn SqlDialect;
}

/// Builds a fresh connection for one engine kind.
pub type ConnectionFactory = Box<dyn Fn() -> Result<Box<dyn Connection>>>;

/// Instance-owned map of engine name to connection factory.
///
/// Constructed at startup and passed by reference; there is no ambient
/// global plugin map.
#[derive(Default)]
pub struct EngineRegistry {
    factories: BTreeMap<String, ConnectionFactory>,
}

impl EngineRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, name: impl Into<String>, factory: ConnectionFactory) {
        self.factories.insert(name.into(), factory);
    }

    pub fn create(&self, name: &str) -> Result<Box<dyn Connection>> {
        let factory = self
            .factories
            .get(name)
            .ok_or_else(|| OrmError::EngineNotFound(name.to_string()))?;
        factory()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.factories.contains_key(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct NullCursor;

    impl Cursor for NullCursor {
        fn fetch_all(&mut self) -> Result<Vec<Row>> {
            Ok(Vec::new())
        }
    }

    struct NullConnection {
        closed: bool,
    }

    impl Connection for NullConnection {
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
            Ok(())
        }

        fn commit(&mut self) -> Result<()> {
            Ok(())
        }

        fn rollback(&mut self) -> Result<()> {
            Ok(())
        }

        fn execute(&mut self, _sql: &str) -> Result<Box<dyn Cursor>> {
            Ok(Box::new(NullCursor))
        }

        fn lock_table(&mut self, _table: &str, _params: &str) -> Result<()> {
            Ok(())
        }

        fn dialect(&self) -> &dyn SqlDialect {
            &DefaultDialect
        }
    }

    #[test]
    fn test_registered_engine_creates_connections() {
        let mut registry = EngineRegistry::new();
        registry.register(
            "null",
            Box::new(|| Ok(Box::new(NullConnection { closed: true }) as Box<dyn Connection>)),
        );
        let mut connection = registry.create("null").unwrap();
        connection.open().unwrap();
        assert!(!connection.is_closed());
    }

    #[test]
    fn test_unknown_engine_rejected() {
        let registry = EngineRegistry::new();
        assert!(matches!(
            registry.create("ghost"),
            Err(OrmError::EngineNotFound(_))
        ));
    }
}
