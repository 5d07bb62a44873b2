mod error;
mod types;
mod value;

pub use error::{OrmError, Result};
pub use types::{DataType, Row};
pub use value::{Value, ValueKey};
