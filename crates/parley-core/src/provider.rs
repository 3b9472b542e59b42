use std::pin::Pin;

use async_trait::async_trait;
use futures::Stream;

use crate::errors::ProviderError;
use crate::messages::Message;
use crate::stream::StreamEvent;
use crate::tools::ToolDefinition;

pub type EventStream = Pin<Box<dyn Stream<Item = StreamEvent> + Send>>;

/// One chat-completion request: the preprocessed conversation plus the tools
/// the active character exposes.
#[derive(Clone, Debug, Default)]
pub struct ChatRequest {
    pub messages: Vec<Message>,
    pub tools: Vec<ToolDefinition>,
    pub temperature: Option<f64>,
    pub max_tokens: Option<u32>,
}

impl ChatRequest {
    pub fn new(messages: Vec<Message>) -> Self {
        Self {
            messages,
            ..Default::default()
        }
    }

    pub fn with_tools(mut self, tools: Vec<ToolDefinition>) -> Self {
        self.tools = tools;
        self
    }
}

/// Streaming chat-completion collaborator.
#[async_trait]
pub trait ChatProvider: Send + Sync {
    fn name(&self) -> &str;
    fn model(&self) -> &str;

    async fn stream(&self, request: &ChatRequest) -> Result<EventStream, ProviderError>;
}

/// The model id as it should be read aloud: separators become spaces.
pub fn readable_model_name(model: &str) -> String {
    model.replace(['-', '_'], " ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_builder() {
        let req = ChatRequest::new(vec![Message::user("hi")]).with_tools(vec![ToolDefinition {
            name: "t".into(),
            description: "d".into(),
            parameters: serde_json::json!({"type": "object"}),
        }]);
        assert_eq!(req.messages.len(), 1);
        assert_eq!(req.tools.len(), 1);
        assert!(req.temperature.is_none());
    }

    #[test]
    fn readable_name() {
        assert_eq!(readable_model_name("mistral-small_3.2"), "mistral small 3.2");
    }
}
