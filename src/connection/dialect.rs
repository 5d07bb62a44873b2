/// Per-engine SQL emission hooks.
///
/// The core stays dialect-agnostic apart from index-creation syntax,
/// cascade-drop support and literal-escaping needs; engines override the
/// defaults where they differ.
pub trait SqlDialect {
    /// Statement creating an index over one column.
    fn index_sql(&self, table: &str, column: &str) -> String {
        format!("CREATE INDEX {table}_{column}_idx ON {table}({column})")
    }

    /// Whether DROP TABLE may carry CASCADE.
    fn allow_cascade(&self) -> bool {
        false
    }

    /// Whether ALTER TABLE ... DROP CONSTRAINT is available.
    fn allow_alter_drop(&self) -> bool {
        true
    }

    /// Whether string literals need backslash doubling on top of quote
    /// doubling.
    fn escape_slash(&self) -> bool {
        false
    }

    /// Whether association tables carry FOREIGN KEY clauses.
    fn enforce_foreign_keys(&self) -> bool {
        false
    }
}

/// Plain ANSI dialect used when an engine declares nothing special.
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultDialect;

impl SqlDialect for DefaultDialect {}
