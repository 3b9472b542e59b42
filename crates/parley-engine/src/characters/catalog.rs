use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use serde_json::{Map, Value};

use crate::characters::builtin;
use crate::characters::definition::Instructions;
use crate::error::ToolError;

/// Produces a character's system prompt.
pub trait PromptGenerator: Send + Sync {
    fn make_system_prompt(&self, llm_name: &str) -> String;
}

/// Runs a character's tools. Called on the blocking pool with arguments that
/// already passed the tool's validator.
pub trait ToolHandler: Send + Sync {
    fn handle_tool_call(&self, tool: &str, args: &Map<String, Value>) -> Result<String, ToolError>;
}

pub type GeneratorFactory =
    Arc<dyn Fn(&Instructions) -> Result<Arc<dyn PromptGenerator>, String> + Send + Sync>;
pub type HandlerFactory =
    Arc<dyn Fn(&toml::Table) -> Result<Arc<dyn ToolHandler>, String> + Send + Sync>;

/// Process-wide table of generator and handler factories that character
/// files bind to by key. Factories build fresh instances for every load, so
/// handler state stays private to one session.
#[derive(Clone, Default)]
pub struct Catalog {
    generators: HashMap<String, GeneratorFactory>,
    handlers: HashMap<String, HandlerFactory>,
}

impl Catalog {
    pub fn empty() -> Self {
        Self::default()
    }

    /// Catalog with the built-in `standard`/`quiz_show` generators and
    /// `event_log`/`template` handlers.
    pub fn builtin() -> Self {
        let mut catalog = Self::empty();
        catalog.register_generator("standard", |instructions| {
            Ok(Arc::new(builtin::StandardPrompt::new(instructions)) as Arc<dyn PromptGenerator>)
        });
        catalog.register_generator("quiz_show", |instructions| {
            builtin::QuizShowPrompt::from_instructions(instructions)
                .map(|g| Arc::new(g) as Arc<dyn PromptGenerator>)
        });
        catalog.register_handler("event_log", |_| {
            Ok(Arc::new(builtin::EventLogHandler::default()) as Arc<dyn ToolHandler>)
        });
        catalog.register_handler("template", |options| {
            builtin::TemplateHandler::from_options(options).map(|h| Arc::new(h) as Arc<dyn ToolHandler>)
        });
        catalog
    }

    pub fn register_generator<F>(&mut self, key: &str, factory: F)
    where
        F: Fn(&Instructions) -> Result<Arc<dyn PromptGenerator>, String> + Send + Sync + 'static,
    {
        self.generators.insert(key.to_string(), Arc::new(factory));
    }

    pub fn register_handler<F>(&mut self, key: &str, factory: F)
    where
        F: Fn(&toml::Table) -> Result<Arc<dyn ToolHandler>, String> + Send + Sync + 'static,
    {
        self.handlers.insert(key.to_string(), Arc::new(factory));
    }

    pub fn generator(&self, key: &str) -> Option<GeneratorFactory> {
        self.generators.get(key).cloned()
    }

    pub fn handler(&self, key: &str) -> Option<HandlerFactory> {
        self.handlers.get(key).cloned()
    }

    /// Registered generator keys, sorted.
    pub fn generator_keys(&self) -> Vec<String> {
        sorted_keys(&self.generators)
    }

    /// Registered handler keys, sorted.
    pub fn handler_keys(&self) -> Vec<String> {
        sorted_keys(&self.handlers)
    }
}

fn sorted_keys<V>(map: &HashMap<String, V>) -> Vec<String> {
    let mut keys: Vec<String> = map.keys().cloned().collect();
    keys.sort();
    keys
}

impl fmt::Debug for Catalog {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Catalog")
            .field("generators", &self.generator_keys())
            .field("handlers", &self.handler_keys())
            .finish()
    }
}
