//! Built-in catalog entries.

use std::collections::HashMap;
use std::sync::LazyLock;

use parking_lot::Mutex;
use rand::seq::SliceRandom;
use regex::{Captures, Regex};
use serde_json::{Map, Value};

use crate::characters::catalog::{PromptGenerator, ToolHandler};
use crate::characters::definition::Instructions;
use crate::error::ToolError;
use crate::prompt;

const DEFAULT_QUESTIONS_PER_GAME: usize = 5;

static PLACEHOLDER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\{([A-Za-z_][A-Za-z0-9_]*)\}").unwrap());

/// The plain template filled with the character's instructions.
pub struct StandardPrompt {
    instruction_prompt: String,
    language: Option<String>,
}

impl StandardPrompt {
    pub fn new(instructions: &Instructions) -> Self {
        Self {
            instruction_prompt: instructions.instruction_prompt.clone(),
            language: instructions.language.clone(),
        }
    }
}

impl PromptGenerator for StandardPrompt {
    fn make_system_prompt(&self, llm_name: &str) -> String {
        prompt::render(&self.instruction_prompt, self.language.as_deref(), llm_name)
    }
}

/// The standard template followed by a fresh random draw of quiz questions
/// each time a prompt is generated.
pub struct QuizShowPrompt {
    base: StandardPrompt,
    questions: Vec<String>,
    per_game: usize,
}

impl QuizShowPrompt {
    pub fn from_instructions(instructions: &Instructions) -> Result<Self, String> {
        let questions = instructions
            .extra
            .get("questions")
            .and_then(toml::Value::as_array)
            .ok_or("quiz_show requires a `questions` array in [instructions]")?
            .iter()
            .map(|q| q.as_str().map(str::to_string))
            .collect::<Option<Vec<_>>>()
            .ok_or("quiz_show `questions` must all be strings")?;
        if questions.is_empty() {
            return Err("quiz_show `questions` must not be empty".into());
        }
        let per_game = match instructions.extra.get("questions_per_game") {
            None => DEFAULT_QUESTIONS_PER_GAME,
            Some(v) => v
                .as_integer()
                .and_then(|n| usize::try_from(n).ok())
                .filter(|n| *n > 0)
                .ok_or("quiz_show `questions_per_game` must be a positive integer")?,
        };
        Ok(Self {
            base: StandardPrompt::new(instructions),
            questions,
            per_game,
        })
    }
}

impl PromptGenerator for QuizShowPrompt {
    fn make_system_prompt(&self, llm_name: &str) -> String {
        let mut rng = rand::thread_rng();
        let picked: Vec<&String> = self.questions.choose_multiple(&mut rng, self.per_game).collect();

        let mut prompt = self.base.make_system_prompt(llm_name);
        prompt.push_str("\n# QUESTIONS\nAsk these questions one at a time, in this order:\n");
        for (i, question) in picked.iter().enumerate() {
            prompt.push_str(&format!("{}. {question}\n", i + 1));
        }
        prompt
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LoggedEvent {
    pub tool: String,
    pub event: String,
    pub importance: Option<String>,
}

/// Records every call in instance-local state.
#[derive(Default)]
pub struct EventLogHandler {
    events: Mutex<Vec<LoggedEvent>>,
}

impl EventLogHandler {
    pub fn events(&self) -> Vec<LoggedEvent> {
        self.events.lock().clone()
    }
}

impl ToolHandler for EventLogHandler {
    fn handle_tool_call(&self, tool: &str, args: &Map<String, Value>) -> Result<String, ToolError> {
        let event = match args.get("event") {
            Some(Value::String(s)) => s.clone(),
            Some(other) => other.to_string(),
            None => Value::Object(args.clone()).to_string(),
        };
        let importance = args.get("importance").and_then(Value::as_str).map(str::to_string);
        self.events.lock().push(LoggedEvent {
            tool: tool.to_string(),
            event: event.clone(),
            importance,
        });
        Ok(format!("Logged {tool}: {event}"))
    }
}

/// Answers each tool from a `replies` template, substituting `{param}`
/// placeholders with the call's arguments.
#[derive(Debug)]
pub struct TemplateHandler {
    replies: HashMap<String, String>,
}

impl TemplateHandler {
    pub fn from_options(options: &toml::Table) -> Result<Self, String> {
        let table = options
            .get("replies")
            .and_then(toml::Value::as_table)
            .ok_or("template handler requires a [handler.replies] table")?;
        let mut replies = HashMap::with_capacity(table.len());
        for (tool, template) in table {
            let template = template
                .as_str()
                .ok_or_else(|| format!("reply template for '{tool}' must be a string"))?;
            replies.insert(tool.clone(), template.to_string());
        }
        Ok(Self { replies })
    }
}

impl ToolHandler for TemplateHandler {
    fn handle_tool_call(&self, tool: &str, args: &Map<String, Value>) -> Result<String, ToolError> {
        let template = self
            .replies
            .get(tool)
            .ok_or_else(|| ToolError::UnknownTool(format!("no reply template for '{tool}'")))?;
        let rendered = PLACEHOLDER.replace_all(template, |caps: &Captures<'_>| match args.get(&caps[1]) {
            Some(Value::String(s)) => s.clone(),
            Some(other) => other.to_string(),
            None => caps[0].to_string(),
        });
        Ok(rendered.into_owned())
    }
}
