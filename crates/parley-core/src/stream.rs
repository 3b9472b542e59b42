use std::collections::BTreeMap;

use crate::errors::ProviderError;
use crate::ids::ToolCallId;
use crate::messages::ToolCall;

/// Events emitted while streaming a chat completion. Ordering contract:
///
/// Start → (TextDelta | ToolCallDelta)* → Done
///
/// Error can appear at any point and ends the stream.
#[derive(Clone, Debug)]
pub enum StreamEvent {
    Start,
    TextDelta {
        delta: String,
    },
    /// One fragment of a tool call. `id` and `name` usually arrive only on the
    /// first fragment for an index; `arguments_delta` pieces are concatenated.
    ToolCallDelta {
        index: usize,
        id: Option<String>,
        name: Option<String>,
        arguments_delta: String,
    },
    Done {
        finish_reason: FinishReason,
    },
    Error {
        error: ProviderError,
    },
}

impl StreamEvent {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done { .. } | Self::Error { .. })
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum FinishReason {
    Stop,
    ToolCalls,
    Length,
    Other(String),
}

impl FinishReason {
    pub fn parse(raw: &str) -> Self {
        match raw {
            "stop" => Self::Stop,
            "tool_calls" | "function_call" => Self::ToolCalls,
            "length" => Self::Length,
            other => Self::Other(other.to_string()),
        }
    }
}

#[derive(Default)]
struct PartialCall {
    id: Option<String>,
    name: String,
    arguments: String,
}

/// Accumulates streamed tool-call fragments keyed by their stream index.
#[derive(Default)]
pub struct ToolCallBuffer {
    calls: BTreeMap<usize, PartialCall>,
}

impl ToolCallBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, index: usize, id: Option<&str>, name: Option<&str>, arguments_delta: &str) {
        let call = self.calls.entry(index).or_default();
        if let Some(id) = id.filter(|s| !s.is_empty()) {
            call.id = Some(id.to_string());
        }
        if let Some(name) = name {
            call.name.push_str(name);
        }
        call.arguments.push_str(arguments_delta);
    }

    pub fn is_empty(&self) -> bool {
        self.calls.is_empty()
    }

    /// Completed calls in index order. Calls that never received a name are
    /// dropped; calls without a provider id get a generated one.
    pub fn finish(self) -> Vec<ToolCall> {
        self.calls
            .into_values()
            .filter(|c| !c.name.is_empty())
            .map(|c| ToolCall {
                id: c.id.map(ToolCallId::from_raw).unwrap_or_default(),
                name: c.name,
                arguments: c.arguments,
            })
            .collect()
    }
}
