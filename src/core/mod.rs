pub mod error;
pub mod value;

pub use error::{EngineError, ForbiddenAccess, Result};
pub use value::{DataType, Value};
