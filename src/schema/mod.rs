mod class;
mod registry;

pub use class::{
    Cardinality, EntityClass, EntityClassBuilder, FieldDef, GeneratorKind, InheritanceKind,
    RelationDef, to_table_name,
};
pub use registry::{ClassMeta, SchemaRegistry};

/// Discriminator column resolving the concrete subclass of a polymorphic
/// row; present only on hierarchy-root tables.
pub const DISCRIMINATOR_COLUMN: &str = "_class";

/// Modification-timestamp column, present on every table.
pub const MODIFIED_TIME_COLUMN: &str = "_mtime";
