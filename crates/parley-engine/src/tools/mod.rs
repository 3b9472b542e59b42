pub mod executor;
pub mod schema;

pub use executor::{ToolExecutor, ToolOutcome, DEFAULT_TOOL_DEADLINE};
pub use schema::{ParamKind, ParamSpec, ParameterValidator, SchemaError, ValidationError};
