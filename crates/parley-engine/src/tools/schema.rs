//! Tool definition checks and the per-tool parameter validator compiled
//! from a definition's JSON schema.

use std::fmt;
use std::sync::LazyLock;

use regex::Regex;
use serde_json::{Map, Value};

use parley_core::tools::ToolDefinition;

pub const MAX_TOOL_NAME_LEN: usize = 50;
pub const MAX_DESCRIPTION_LEN: usize = 200;
pub const MAX_PROPERTIES: usize = 10;

static TOOL_NAME_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*$").unwrap());

/// Why a tool definition was rejected at load time.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum SchemaError {
    #[error("tool name '{0}' must match ^[A-Za-z_][A-Za-z0-9_]*$")]
    InvalidName(String),

    #[error("tool name '{0}' exceeds 50 characters")]
    NameTooLong(String),

    #[error("description of '{0}' exceeds 200 characters")]
    DescriptionTooLong(String),

    #[error("parameters of '{0}' must be a schema of type object")]
    NotAnObject(String),

    #[error("parameters of '{0}' declare more than 10 properties")]
    TooManyProperties(String),

    #[error("parameters of '{0}' contain a $ref")]
    Reference(String),

    #[error("property '{property}' of '{tool}' has unsupported type '{kind}'")]
    UnsupportedType {
        tool: String,
        property: String,
        kind: String,
    },

    #[error("'{tool}' requires undeclared property '{property}'")]
    UnknownRequired { tool: String, property: String },

    #[error("tool '{0}' is declared more than once")]
    Duplicate(String),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ParamKind {
    String,
    Number,
    Integer,
    Boolean,
    Array,
    Object,
    /// No `type` given; anything goes.
    Any,
}

impl ParamKind {
    fn parse(kind: &str) -> Option<Self> {
        Some(match kind {
            "string" => Self::String,
            "number" => Self::Number,
            "integer" => Self::Integer,
            "boolean" => Self::Boolean,
            "array" => Self::Array,
            "object" => Self::Object,
            _ => return None,
        })
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::String => "string",
            Self::Number => "number",
            Self::Integer => "integer",
            Self::Boolean => "boolean",
            Self::Array => "array",
            Self::Object => "object",
            Self::Any => "any",
        }
    }

    fn accepts(self, value: &Value) -> bool {
        match self {
            Self::String => value.is_string(),
            Self::Number => value.is_number(),
            Self::Integer => {
                value.is_i64()
                    || value.is_u64()
                    || value.as_f64().is_some_and(|f| f.fract() == 0.0)
            }
            Self::Boolean => value.is_boolean(),
            Self::Array => value.is_array(),
            Self::Object => value.is_object(),
            Self::Any => true,
        }
    }
}

#[derive(Clone, Debug)]
pub struct ParamSpec {
    pub name: String,
    pub kind: ParamKind,
    pub required: bool,
    pub default: Option<Value>,
    pub allowed: Option<Vec<Value>>,
}

/// A call-time constraint violation.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    #[error("missing required parameter '{0}'")]
    Missing(String),

    #[error("invalid parameter '{name}' - expected {expected}")]
    WrongKind { name: String, expected: &'static str },

    #[error("invalid parameter '{name}' - must be one of [{allowed}]")]
    NotAllowed { name: String, allowed: AllowedValues },
}

/// Display wrapper for an enum constraint: `low, medium, high`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AllowedValues(pub Vec<Value>);

impl fmt::Display for AllowedValues {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, value) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            match value {
                Value::String(s) => f.write_str(s)?,
                other => write!(f, "{other}")?,
            }
        }
        Ok(())
    }
}

#[derive(Clone, Debug, Default)]
pub struct ParameterValidator {
    params: Vec<ParamSpec>,
}

impl ParameterValidator {
    pub fn params(&self) -> &[ParamSpec] {
        &self.params
    }

    /// Check `args` against the compiled constraints. Returns the validated
    /// arguments with defaults filled in and undeclared keys removed.
    pub fn validate(&self, args: &Map<String, Value>) -> Result<Map<String, Value>, ValidationError> {
        let mut out = Map::new();
        for spec in &self.params {
            match args.get(&spec.name) {
                Some(value) => {
                    if !spec.kind.accepts(value) {
                        return Err(ValidationError::WrongKind {
                            name: spec.name.clone(),
                            expected: spec.kind.as_str(),
                        });
                    }
                    if let Some(allowed) = &spec.allowed {
                        if !allowed.contains(value) {
                            return Err(ValidationError::NotAllowed {
                                name: spec.name.clone(),
                                allowed: AllowedValues(allowed.clone()),
                            });
                        }
                    }
                    out.insert(spec.name.clone(), value.clone());
                }
                None => {
                    if let Some(default) = &spec.default {
                        out.insert(spec.name.clone(), default.clone());
                    } else if spec.required {
                        return Err(ValidationError::Missing(spec.name.clone()));
                    }
                }
            }
        }
        Ok(out)
    }
}

/// Validate a definition's shape and compile its parameter validator.
pub fn compile(definition: &ToolDefinition) -> Result<ParameterValidator, SchemaError> {
    let name = &definition.name;
    if name.chars().count() > MAX_TOOL_NAME_LEN {
        return Err(SchemaError::NameTooLong(name.clone()));
    }
    if !TOOL_NAME_PATTERN.is_match(name) {
        return Err(SchemaError::InvalidName(name.clone()));
    }
    if definition.description.chars().count() > MAX_DESCRIPTION_LEN {
        return Err(SchemaError::DescriptionTooLong(name.clone()));
    }

    let schema = definition
        .parameters
        .as_object()
        .filter(|s| s.get("type").and_then(Value::as_str) == Some("object"))
        .ok_or_else(|| SchemaError::NotAnObject(name.clone()))?;
    if contains_ref(&definition.parameters) {
        return Err(SchemaError::Reference(name.clone()));
    }

    let empty = Map::new();
    let properties = match schema.get("properties") {
        None => &empty,
        Some(Value::Object(props)) => props,
        Some(_) => return Err(SchemaError::NotAnObject(name.clone())),
    };
    if properties.len() > MAX_PROPERTIES {
        return Err(SchemaError::TooManyProperties(name.clone()));
    }

    let required: Vec<&str> = schema
        .get("required")
        .and_then(Value::as_array)
        .map(|r| r.iter().filter_map(Value::as_str).collect())
        .unwrap_or_default();
    if let Some(missing) = required.iter().find(|r| !properties.contains_key(**r)) {
        return Err(SchemaError::UnknownRequired {
            tool: name.clone(),
            property: (*missing).to_string(),
        });
    }

    let mut params = Vec::with_capacity(properties.len());
    for (property, prop_schema) in properties {
        let kind = match prop_schema.get("type") {
            None => ParamKind::Any,
            Some(kind) => kind
                .as_str()
                .and_then(ParamKind::parse)
                .ok_or_else(|| SchemaError::UnsupportedType {
                    tool: name.clone(),
                    property: property.clone(),
                    kind: kind.to_string(),
                })?,
        };
        params.push(ParamSpec {
            name: property.clone(),
            kind,
            required: required.contains(&property.as_str()),
            default: prop_schema.get("default").cloned(),
            allowed: prop_schema.get("enum").and_then(Value::as_array).cloned(),
        });
    }
    Ok(ParameterValidator { params })
}

fn contains_ref(value: &Value) -> bool {
    match value {
        Value::Object(map) => map.contains_key("$ref") || map.values().any(contains_ref),
        Value::Array(items) => items.iter().any(contains_ref),
        _ => false,
    }
}
