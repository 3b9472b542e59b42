use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::{Map, Value};
use tracing::{debug, error, instrument, warn};

use parley_telemetry::MetricsRecorder;

use crate::characters::CharacterDefinition;

pub const DEFAULT_TOOL_DEADLINE: Duration = Duration::from_millis(100);
pub const DEFAULT_SLOW_WARNING_RATIO: f64 = 0.8;

/// How a tool call ended, as counted in metrics.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ToolOutcome {
    Success,
    JsonParse,
    Validation,
    Timeout,
    Execution,
}

impl ToolOutcome {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::JsonParse => "json_parse",
            Self::Validation => "validation",
            Self::Timeout => "timeout",
            Self::Execution => "execution",
        }
    }
}

/// Runs character tools under a deadline. Every path yields a string fit to
/// be sent back to the model as a tool result; nothing escapes as an error.
pub struct ToolExecutor {
    metrics: Arc<MetricsRecorder>,
    slow_warning_ratio: f64,
}

impl ToolExecutor {
    pub fn new(metrics: Arc<MetricsRecorder>) -> Self {
        Self {
            metrics,
            slow_warning_ratio: DEFAULT_SLOW_WARNING_RATIO,
        }
    }

    pub fn with_slow_warning_ratio(mut self, ratio: f64) -> Self {
        self.slow_warning_ratio = ratio;
        self
    }

    pub async fn execute(
        &self,
        character: &CharacterDefinition,
        tool_name: &str,
        raw_arguments: &str,
        deadline: Duration,
    ) -> String {
        self.execute_with_outcome(character, tool_name, raw_arguments, deadline).await.0
    }

    #[instrument(skip(self, character, raw_arguments), fields(character = %character.name, tool = %tool_name))]
    pub async fn execute_with_outcome(
        &self,
        character: &CharacterDefinition,
        tool_name: &str,
        raw_arguments: &str,
        deadline: Duration,
    ) -> (String, ToolOutcome) {
        self.metrics.counter_inc(
            "character_tool_calls_total",
            &[("character", character.name.as_str()), ("tool", tool_name)],
            1,
        );
        let start = Instant::now();
        let (content, outcome) = self.run(character, tool_name, raw_arguments, deadline).await;
        let elapsed = start.elapsed();

        self.metrics.counter_inc("character_tool_outcomes_total", &[("outcome", outcome.as_str())], 1);
        if outcome != ToolOutcome::Success {
            self.metrics.counter_inc("character_tool_errors_total", &[("error_type", outcome.as_str())], 1);
        }
        self.metrics.histogram_observe(
            "character_tool_latency_seconds",
            &[("tool", tool_name)],
            elapsed.as_secs_f64(),
        );
        debug!(outcome = outcome.as_str(), elapsed_ms = elapsed.as_millis() as u64, "tool call finished");
        (content, outcome)
    }

    async fn run(
        &self,
        character: &CharacterDefinition,
        tool_name: &str,
        raw_arguments: &str,
        deadline: Duration,
    ) -> (String, ToolOutcome) {
        let args = match parse_arguments(raw_arguments) {
            Some(args) => args,
            None => {
                warn!(raw = %raw_arguments, "tool arguments are not a JSON object");
                return ("Error: invalid arguments".into(), ToolOutcome::JsonParse);
            }
        };

        let Some(tool) = character.tool(tool_name) else {
            warn!("model called an undeclared tool");
            return (format!("Error: unknown tool '{tool_name}'"), ToolOutcome::Validation);
        };
        let args = match tool.validator.validate(&args) {
            Ok(args) => args,
            Err(e) => {
                warn!(error = %e, "tool arguments failed validation");
                return (format!("Error: {e}"), ToolOutcome::Validation);
            }
        };

        let Some(handler) = character.handler() else {
            error!("character declares tools without a handler");
            return (
                "Error: MissingHandler - character has no tool handler".into(),
                ToolOutcome::Execution,
            );
        };

        let start = Instant::now();
        let name = tool_name.to_string();
        let task = tokio::task::spawn_blocking(move || handler.handle_tool_call(&name, &args));
        let result = tokio::time::timeout(deadline, task).await;
        let elapsed = start.elapsed();

        match result {
            Ok(Ok(Ok(content))) => {
                if elapsed.as_secs_f64() > deadline.as_secs_f64() * self.slow_warning_ratio {
                    warn!(
                        elapsed_ms = elapsed.as_millis() as u64,
                        deadline_ms = deadline.as_millis() as u64,
                        "tool call close to its deadline"
                    );
                }
                (content, ToolOutcome::Success)
            }
            Ok(Ok(Err(e))) => {
                warn!(kind = e.kind(), error = %e.message(), "tool handler returned an error");
                (format!("Error: {} - {}", e.kind(), e.message()), ToolOutcome::Execution)
            }
            Ok(Err(join_error)) => {
                let msg = if join_error.is_panic() {
                    panic_message(&join_error.into_panic())
                } else {
                    join_error.to_string()
                };
                error!(panic = %msg, "tool handler panicked");
                (format!("Error: Panic - {msg}"), ToolOutcome::Execution)
            }
            Err(_) => {
                warn!(deadline_ms = deadline.as_millis() as u64, "tool call timed out");
                ("Error: tool execution timed out".into(), ToolOutcome::Timeout)
            }
        }
    }
}

fn parse_arguments(raw: &str) -> Option<Map<String, Value>> {
    if raw.trim().is_empty() {
        return Some(Map::new());
    }
    match serde_json::from_str(raw) {
        Ok(Value::Object(map)) => Some(map),
        _ => None,
    }
}

fn panic_message(panic: &Box<dyn std::any::Any + Send>) -> String {
    panic
        .downcast_ref::<String>()
        .map(|s| s.as_str())
        .or_else(|| panic.downcast_ref::<&str>().copied())
        .unwrap_or("unknown panic")
        .to_string()
}
