use uuid::Uuid;

use crate::connection::Connection;
use crate::core::{Result, Value};
use crate::schema::GeneratorKind;

/// Table backing the sequence-counter strategy.
pub const SEQUENCE_TABLE: &str = "id_sequence";

pub fn sequence_table_ddl() -> String {
    format!("CREATE TABLE {SEQUENCE_TABLE}(name TEXT, next_id INTEGER, PRIMARY KEY (name))")
}

/// Produce a fresh identifier value for one generated field.
pub fn generate(
    kind: GeneratorKind,
    connection: &mut dyn Connection,
    sequence_name: &str,
) -> Result<Value> {
    match kind {
        GeneratorKind::Uuid => Ok(Value::Text(Uuid::new_v4().to_string())),
        GeneratorKind::UuidHex => Ok(Value::Text(Uuid::new_v4().simple().to_string())),
        GeneratorKind::SequenceTable => next_sequence_value(connection, sequence_name),
    }
}

/// Increment the per-name counter row under a table lock.
///
/// The lock serializes concurrent callers sharing one data source; without
/// it two savers could read the same counter value and collide.
fn next_sequence_value(connection: &mut dyn Connection, name: &str) -> Result<Value> {
    connection.lock_table(SEQUENCE_TABLE, "")?;

    let mut cursor = connection.execute(&format!(
        "SELECT next_id FROM {SEQUENCE_TABLE} WHERE name = '{name}'"
    ))?;
    let rows = cursor.fetch_all()?;

    match rows.first().and_then(|row| row.first()).and_then(Value::as_i64) {
        Some(next) => {
            connection.execute(&format!(
                "UPDATE {SEQUENCE_TABLE} SET next_id = {} WHERE name = '{name}'",
                next + 1
            ))?;
            Ok(Value::Integer(next))
        }
        None => {
            connection.execute(&format!(
                "INSERT INTO {SEQUENCE_TABLE}(name, next_id) VALUES ('{name}', 2)"
            ))?;
            Ok(Value::Integer(1))
        }
    }
}
