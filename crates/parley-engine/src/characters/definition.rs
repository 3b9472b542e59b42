use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use parley_core::tools::ToolDefinition;

use crate::characters::catalog::{Catalog, ToolHandler};
use crate::characters::namespace::LoadedUnit;
use crate::tools::schema::{self, ParameterValidator};

/// Character files larger than this are rejected without parsing.
pub const MAX_CHARACTER_FILE_SIZE: u64 = 256 * 1024;

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VoiceRef {
    #[serde(default = "default_source_type")]
    pub source_type: String,
    #[serde(default)]
    pub path_on_server: Option<String>,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
}

fn default_source_type() -> String {
    "file".into()
}

impl VoiceRef {
    /// Identifier handed to the speech synthesizer.
    pub fn id(&self) -> Option<&str> {
        self.path_on_server.as_deref().or(self.url.as_deref())
    }
}

#[derive(Clone, Debug, Default, PartialEq, Deserialize)]
pub struct Instructions {
    #[serde(default)]
    pub instruction_prompt: String,
    #[serde(default)]
    pub language: Option<String>,
    /// Generator-specific keys, e.g. quiz questions.
    #[serde(flatten)]
    pub extra: toml::Table,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Metadata {
    #[serde(default)]
    pub good: Option<bool>,
    #[serde(default)]
    pub comment: Option<String>,
}

/// `{name, good, comment}` as returned to clients.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CharacterSummary {
    pub name: String,
    pub good: Option<bool>,
    pub comment: Option<String>,
}

#[derive(Clone, Debug)]
pub struct CompiledTool {
    pub definition: ToolDefinition,
    pub validator: ParameterValidator,
}

/// A validated, instantiated character.
#[derive(Debug)]
pub struct CharacterDefinition {
    pub name: String,
    pub voice: VoiceRef,
    pub instructions: Instructions,
    pub metadata: Metadata,
    pub source_path: PathBuf,
    tools: Vec<CompiledTool>,
    unit: Arc<LoadedUnit>,
}

impl CharacterDefinition {
    pub fn system_prompt(&self, llm_name: &str) -> String {
        self.unit.generator.make_system_prompt(llm_name)
    }

    pub fn voice_id(&self) -> &str {
        self.voice.id().unwrap_or(&self.name)
    }

    pub fn tool(&self, name: &str) -> Option<&CompiledTool> {
        self.tools.iter().find(|t| t.definition.name == name)
    }

    pub fn tools(&self) -> &[CompiledTool] {
        &self.tools
    }

    pub fn has_tools(&self) -> bool {
        !self.tools.is_empty()
    }

    pub fn tool_definitions(&self) -> Vec<ToolDefinition> {
        self.tools.iter().map(|t| t.definition.clone()).collect()
    }

    pub fn handler(&self) -> Option<Arc<dyn ToolHandler>> {
        self.unit.handler.clone()
    }

    pub fn unit(&self) -> &Arc<LoadedUnit> {
        &self.unit
    }

    pub fn summary(&self) -> CharacterSummary {
        CharacterSummary {
            name: self.name.clone(),
            good: self.metadata.good,
            comment: self.metadata.comment.clone(),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LoadErrorKind {
    Syntax,
    MissingAttribute,
    MissingHandler,
    InvalidTool,
    UnknownCapability,
    DuplicateName,
    Io,
}

impl LoadErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Syntax => "syntax",
            Self::MissingAttribute => "missing_attribute",
            Self::MissingHandler => "missing_handler",
            Self::InvalidTool => "invalid_tool",
            Self::UnknownCapability => "unknown_capability",
            Self::DuplicateName => "duplicate_name",
            Self::Io => "io",
        }
    }
}

impl fmt::Display for LoadErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One file that failed to load. Never fatal to the batch.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, thiserror::Error)]
#[error("{}: {kind}: {message}", .path.display())]
pub struct LoadError {
    pub path: PathBuf,
    pub kind: LoadErrorKind,
    pub message: String,
}

impl LoadError {
    pub fn new(path: &Path, kind: LoadErrorKind, message: impl Into<String>) -> Self {
        Self {
            path: path.to_path_buf(),
            kind,
            message: message.into(),
        }
    }

    pub fn error_kind(&self) -> &'static str {
        self.kind.as_str()
    }
}

#[derive(Deserialize)]
struct CharacterFile {
    name: Option<String>,
    voice: Option<VoiceRef>,
    instructions: Option<Instructions>,
    prompt: Option<PromptSection>,
    #[serde(default)]
    metadata: Metadata,
    #[serde(default)]
    tools: Vec<ToolEntry>,
    handler: Option<toml::Table>,
}

#[derive(Deserialize)]
struct PromptSection {
    generator: Option<String>,
}

#[derive(Deserialize)]
struct ToolEntry {
    name: Option<String>,
    #[serde(default)]
    description: String,
    #[serde(default = "empty_object_schema")]
    parameters: Value,
}

fn empty_object_schema() -> Value {
    serde_json::json!({"type": "object", "properties": {}})
}

/// Read, parse and instantiate one character file. Blocking.
pub fn load_file(path: &Path, unit_key: String, catalog: &Catalog) -> Result<CharacterDefinition, LoadError> {
    let size = std::fs::metadata(path)
        .map_err(|e| LoadError::new(path, LoadErrorKind::Io, e.to_string()))?
        .len();
    if size > MAX_CHARACTER_FILE_SIZE {
        return Err(LoadError::new(
            path,
            LoadErrorKind::Io,
            format!("file is {size} bytes, limit is {MAX_CHARACTER_FILE_SIZE}"),
        ));
    }
    let source =
        std::fs::read_to_string(path).map_err(|e| LoadError::new(path, LoadErrorKind::Io, e.to_string()))?;
    parse_character(path, &source, unit_key, catalog)
}

/// Parse character source text and bind it to catalog factories.
pub fn parse_character(
    path: &Path,
    source: &str,
    unit_key: String,
    catalog: &Catalog,
) -> Result<CharacterDefinition, LoadError> {
    let file: CharacterFile =
        toml::from_str(source).map_err(|e| LoadError::new(path, LoadErrorKind::Syntax, e.message()))?;
    let missing = |attr: &str| LoadError::new(path, LoadErrorKind::MissingAttribute, format!("missing required attribute '{attr}'"));

    let name = file
        .name
        .map(|n| n.trim().to_string())
        .filter(|n| !n.is_empty())
        .ok_or_else(|| missing("name"))?;
    let voice = file.voice.ok_or_else(|| missing("voice"))?;
    if voice.id().is_none() {
        return Err(missing("voice.path_on_server"));
    }
    let instructions = file.instructions.ok_or_else(|| missing("instructions"))?;
    let generator_key = file
        .prompt
        .and_then(|p| p.generator)
        .ok_or_else(|| missing("prompt.generator"))?;

    let mut tools = Vec::with_capacity(file.tools.len());
    for entry in file.tools {
        let Some(tool_name) = entry.name else {
            return Err(LoadError::new(path, LoadErrorKind::InvalidTool, "tool without a name"));
        };
        let definition = ToolDefinition {
            name: tool_name,
            description: entry.description,
            parameters: entry.parameters,
        };
        if tools.iter().any(|t: &CompiledTool| t.definition.name == definition.name) {
            let err = schema::SchemaError::Duplicate(definition.name);
            return Err(LoadError::new(path, LoadErrorKind::InvalidTool, err.to_string()));
        }
        let validator = schema::compile(&definition)
            .map_err(|e| LoadError::new(path, LoadErrorKind::InvalidTool, e.to_string()))?;
        tools.push(CompiledTool { definition, validator });
    }

    let generator_factory = catalog.generator(&generator_key).ok_or_else(|| {
        LoadError::new(
            path,
            LoadErrorKind::UnknownCapability,
            format!("unknown prompt generator '{generator_key}'"),
        )
    })?;
    let generator = generator_factory(&instructions)
        .map_err(|e| LoadError::new(path, LoadErrorKind::MissingAttribute, e))?;

    let handler = match file.handler {
        None if !tools.is_empty() => {
            return Err(LoadError::new(
                path,
                LoadErrorKind::MissingHandler,
                format!("'{name}' declares {} tool(s) but no [handler]", tools.len()),
            ));
        }
        None => None,
        Some(options) => {
            let kind = options
                .get("kind")
                .and_then(toml::Value::as_str)
                .ok_or_else(|| missing("handler.kind"))?;
            let factory = catalog.handler(kind).ok_or_else(|| {
                LoadError::new(path, LoadErrorKind::UnknownCapability, format!("unknown tool handler '{kind}'"))
            })?;
            Some(factory(&options).map_err(|e| LoadError::new(path, LoadErrorKind::MissingAttribute, e))?)
        }
    };

    let unit = Arc::new(LoadedUnit {
        key: unit_key,
        source: path.to_path_buf(),
        generator,
        handler,
    });
    Ok(CharacterDefinition {
        name,
        voice,
        instructions,
        metadata: file.metadata,
        source_path: path.to_path_buf(),
        tools,
        unit,
    })
}
