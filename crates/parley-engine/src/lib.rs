//! Character registry, tool execution, conversation history and turn
//! coordination for parley sessions.

pub mod characters;
pub mod error;
pub mod history;
pub mod prompt;
pub mod text;
pub mod tools;
pub mod turn;

pub use characters::{CharacterDefinition, CharacterRegistry, CharacterSummary, LoadResult};
pub use error::{HistoryError, RegistryError, ToolError};
pub use history::HistoryStore;
pub use tools::ToolExecutor;
pub use turn::{ConversationState, Turn, TurnCoordinator};
