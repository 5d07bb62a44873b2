//! Query-side and write-side SQL compilation.
//!
//! `options` normalizes request trees, `compiler` turns them into SELECT
//! statements, `ddl` emits schema statements and `dml` the per-level
//! INSERT/UPDATE/DELETE sequences joined-table inheritance requires.

mod compiler;
mod ddl;
mod dml;
mod options;

pub use compiler::{CompiledQuery, QueryCompiler};
pub use ddl::DdlGenerator;
pub use dml::DmlCompiler;
pub use options::{Direction, Filter, FilterField, FilterKind, Options, UNLIMITED};
