use serde::Deserialize;
use serde_json::Value;

use parley_core::errors::ProviderError;
use parley_core::stream::{FinishReason, StreamEvent};

/// State machine turning OpenAI-compatible `chat.completion.chunk` payloads
/// into [`StreamEvent`]s.
#[derive(Default)]
pub struct ChunkParser {
    started: bool,
    finish_reason: Option<FinishReason>,
    done: bool,
}

impl ChunkParser {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_done(&self) -> bool {
        self.done
    }

    /// Parse the payload of one `data:` line.
    pub fn parse_data(&mut self, data: &str) -> Vec<StreamEvent> {
        let mut events = Vec::new();
        if self.done {
            return events;
        }

        if data.trim() == "[DONE]" {
            self.done = true;
            events.push(StreamEvent::Done {
                finish_reason: self.finish_reason.take().unwrap_or(FinishReason::Stop),
            });
            return events;
        }

        let chunk: Chunk = match serde_json::from_str(data) {
            Ok(chunk) => chunk,
            Err(e) => {
                tracing::debug!(error = %e, "skipping unparseable SSE chunk");
                return events;
            }
        };

        if let Some(err) = chunk.error {
            self.done = true;
            let message = err
                .get("message")
                .and_then(|m| m.as_str())
                .unwrap_or("provider error")
                .to_string();
            events.push(StreamEvent::Error {
                error: ProviderError::ServerError {
                    status: 500,
                    body: message,
                },
            });
            return events;
        }

        if !self.started {
            self.started = true;
            events.push(StreamEvent::Start);
        }

        for choice in chunk.choices.into_iter().filter(|c| c.index == 0) {
            if let Some(delta) = choice.delta {
                if let Some(content) = delta.content.filter(|c| !c.is_empty()) {
                    events.push(StreamEvent::TextDelta { delta: content });
                }
                for call in delta.tool_calls.unwrap_or_default() {
                    let (name, arguments) = match call.function {
                        Some(f) => (f.name, f.arguments.unwrap_or_default()),
                        None => (None, String::new()),
                    };
                    events.push(StreamEvent::ToolCallDelta {
                        index: call.index,
                        id: call.id,
                        name,
                        arguments_delta: arguments,
                    });
                }
            }
            if let Some(reason) = choice.finish_reason {
                self.finish_reason = Some(FinishReason::parse(&reason));
            }
        }

        events
    }

    /// Called when the byte stream ends. Servers that omit `[DONE]` still
    /// complete cleanly if a finish reason was seen.
    pub fn finish(&mut self) -> Option<StreamEvent> {
        if self.done {
            return None;
        }
        self.done = true;
        Some(match self.finish_reason.take() {
            Some(finish_reason) => StreamEvent::Done { finish_reason },
            None => StreamEvent::Error {
                error: ProviderError::StreamInterrupted("stream ended before completion".into()),
            },
        })
    }
}

/// Extract `data:` payloads from a block of complete SSE events.
pub fn parse_sse_data(raw: &str) -> Vec<String> {
    raw.lines()
        .filter_map(|line| line.strip_prefix("data:"))
        .map(|data| data.trim_start().to_string())
        .filter(|data| !data.is_empty())
        .collect()
}

// --- Deserialization types for chat.completion.chunk ---

#[derive(Deserialize)]
struct Chunk {
    #[serde(default)]
    choices: Vec<Choice>,
    error: Option<Value>,
}

#[derive(Deserialize)]
struct Choice {
    #[serde(default)]
    index: usize,
    delta: Option<Delta>,
    finish_reason: Option<String>,
}

#[derive(Deserialize)]
struct Delta {
    content: Option<String>,
    tool_calls: Option<Vec<ToolCallChunk>>,
}

#[derive(Deserialize)]
struct ToolCallChunk {
    #[serde(default)]
    index: usize,
    id: Option<String>,
    function: Option<FunctionChunk>,
}

#[derive(Deserialize)]
struct FunctionChunk {
    name: Option<String>,
    arguments: Option<String>,
}
