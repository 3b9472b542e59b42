use std::path::PathBuf;

/// Fatal failures of a whole load/reload call. Per-file problems are
/// [`LoadError`](crate::characters::LoadError)s and never surface here.
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("character directory not found: {}", .0.display())]
    DirectoryNotFound(PathBuf),

    #[error("path is not a directory: {}", .0.display())]
    NotADirectory(PathBuf),

    #[error("failed to read directory {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("load superseded by a newer request")]
    Superseded,
}

impl RegistryError {
    pub fn error_kind(&self) -> &'static str {
        match self {
            Self::DirectoryNotFound(_) => "directory_not_found",
            Self::NotADirectory(_) => "not_a_directory",
            Self::Io { .. } => "io",
            Self::Superseded => "superseded",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum HistoryError {
    #[error("character name must not be empty")]
    EmptyCharacterName,

    #[error("system prompt must not be empty")]
    EmptySystemPrompt,

    #[error("no active character")]
    NoActiveCharacter,

    #[error("system messages can only seed a history")]
    SystemMessageAppend,
}

/// Failure raised by a character's tool handler. The executor turns these
/// into `"Error: <kind> - <message>"` strings.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum ToolError {
    #[error("unknown tool: {0}")]
    UnknownTool(String),

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("execution failed: {0}")]
    ExecutionFailed(String),
}

impl ToolError {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::UnknownTool(_) => "UnknownTool",
            Self::InvalidInput(_) => "InvalidInput",
            Self::ExecutionFailed(_) => "ExecutionFailed",
        }
    }

    pub fn message(&self) -> &str {
        match self {
            Self::UnknownTool(m) | Self::InvalidInput(m) | Self::ExecutionFailed(m) => m,
        }
    }
}
