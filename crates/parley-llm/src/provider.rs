use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use async_trait::async_trait;
use futures::{Future, Stream};
use reqwest::Client;
use secrecy::{ExposeSecret, SecretString};
use serde_json::{json, Value};
use tracing::instrument;

use parley_core::errors::ProviderError;
use parley_core::messages::Message;
use parley_core::provider::{ChatProvider, ChatRequest, EventStream};
use parley_core::stream::StreamEvent;

use crate::sse::{self, ChunkParser};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);
const SSE_IDLE_TIMEOUT: Duration = Duration::from_secs(90);

#[derive(Clone, Debug)]
pub struct OpenAiCompatConfig {
    /// Base URL up to and including the version segment, e.g. `http://localhost:8000/v1`.
    pub base_url: String,
    pub model: String,
    pub api_key: Option<SecretString>,
}

/// Streaming client for any server speaking the OpenAI chat-completions API
/// (vLLM, llama.cpp server, OpenAI itself).
pub struct OpenAiCompatProvider {
    client: Client,
    config: OpenAiCompatConfig,
}

impl OpenAiCompatProvider {
    pub fn new(config: OpenAiCompatConfig) -> Result<Self, ProviderError> {
        let client = Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .build()
            .map_err(|e| ProviderError::NetworkError(e.to_string()))?;
        Ok(Self { client, config })
    }

    fn endpoint(&self) -> String {
        format!("{}/chat/completions", self.config.base_url.trim_end_matches('/'))
    }
}

/// Request body in the chat-completions wire shape.
pub fn build_request_body(model: &str, request: &ChatRequest) -> Value {
    let messages: Vec<Value> = request.messages.iter().map(message_to_wire).collect();
    let mut body = json!({
        "model": model,
        "messages": messages,
        "stream": true,
    });
    if !request.tools.is_empty() {
        body["tools"] = Value::Array(request.tools.iter().map(|t| t.to_function_spec()).collect());
    }
    if let Some(temperature) = request.temperature {
        body["temperature"] = json!(temperature);
    }
    if let Some(max_tokens) = request.max_tokens {
        body["max_tokens"] = json!(max_tokens);
    }
    body
}

fn message_to_wire(message: &Message) -> Value {
    match message {
        Message::Assistant { content, tool_calls } if !tool_calls.is_empty() => json!({
            "role": "assistant",
            "content": content,
            "tool_calls": tool_calls.iter().map(|c| json!({
                "id": c.id,
                "type": "function",
                "function": { "name": c.name, "arguments": c.arguments },
            })).collect::<Vec<_>>(),
        }),
        Message::Tool { tool_call_id, content } => json!({
            "role": "tool",
            "tool_call_id": tool_call_id,
            "content": content,
        }),
        other => json!({
            "role": other.role().as_str(),
            "content": other.content(),
        }),
    }
}

#[async_trait]
impl ChatProvider for OpenAiCompatProvider {
    fn name(&self) -> &str {
        "openai_compat"
    }

    fn model(&self) -> &str {
        &self.config.model
    }

    #[instrument(skip(self, request), fields(model = %self.config.model, messages = request.messages.len(), tools = request.tools.len()))]
    async fn stream(&self, request: &ChatRequest) -> Result<EventStream, ProviderError> {
        let body = build_request_body(&self.config.model, request);

        let mut req = self
            .client
            .post(self.endpoint())
            .header("accept", "text/event-stream")
            .json(&body);
        if let Some(key) = &self.config.api_key {
            req = req.bearer_auth(key.expose_secret());
        }

        let resp = req
            .send()
            .await
            .map_err(|e| ProviderError::NetworkError(e.to_string()))?;

        if !resp.status().is_success() {
            let status = resp.status().as_u16();
            let body = resp.text().await.unwrap_or_default();
            return Err(ProviderError::from_status(status, body));
        }

        Ok(Box::pin(SseStream::new(resp.bytes_stream())))
    }
}

/// Wraps a byte stream from reqwest and yields StreamEvents.
/// Includes an idle timeout: if no data arrives within `idle_duration`, emits an error.
struct SseStream {
    inner: Pin<Box<dyn Stream<Item = Result<bytes::Bytes, reqwest::Error>> + Send>>,
    parser: ChunkParser,
    buffer: String,
    pending: Vec<StreamEvent>,
    idle_deadline: Pin<Box<tokio::time::Sleep>>,
    idle_duration: Duration,
    finished: bool,
}

impl SseStream {
    fn new(byte_stream: impl Stream<Item = Result<bytes::Bytes, reqwest::Error>> + Send + 'static) -> Self {
        Self::with_idle_timeout(byte_stream, SSE_IDLE_TIMEOUT)
    }

    fn with_idle_timeout(
        byte_stream: impl Stream<Item = Result<bytes::Bytes, reqwest::Error>> + Send + 'static,
        idle_timeout: Duration,
    ) -> Self {
        Self {
            inner: Box::pin(byte_stream),
            parser: ChunkParser::new(),
            buffer: String::new(),
            pending: Vec::new(),
            idle_deadline: Box::pin(tokio::time::sleep(idle_timeout)),
            idle_duration: idle_timeout,
            finished: false,
        }
    }

    fn drain_complete_events(&mut self) {
        while let Some(pos) = self.buffer.find("\n\n") {
            let chunk: String = self.buffer.drain(..pos + 2).collect();
            for data in sse::parse_sse_data(&chunk) {
                let events = self.parser.parse_data(&data);
                self.pending.extend(events);
            }
        }
    }

    fn next_pending(&mut self) -> Option<StreamEvent> {
        if self.pending.is_empty() {
            return None;
        }
        let event = self.pending.remove(0);
        if event.is_terminal() {
            self.finished = true;
            self.pending.clear();
        }
        Some(event)
    }
}

impl Stream for SseStream {
    type Item = StreamEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        if let Some(event) = self.next_pending() {
            return Poll::Ready(Some(event));
        }
        if self.finished {
            return Poll::Ready(None);
        }

        loop {
            match self.inner.as_mut().poll_next(cx) {
                Poll::Ready(Some(Ok(bytes))) => {
                    let new_deadline = tokio::time::Instant::now() + self.idle_duration;
                    self.idle_deadline.as_mut().reset(new_deadline);

                    let text = String::from_utf8_lossy(&bytes).replace("\r\n", "\n");
                    self.buffer.push_str(&text);
                    self.drain_complete_events();

                    if let Some(event) = self.next_pending() {
                        return Poll::Ready(Some(event));
                    }
                }
                Poll::Ready(Some(Err(e))) => {
                    self.finished = true;
                    return Poll::Ready(Some(StreamEvent::Error {
                        error: ProviderError::StreamInterrupted(e.to_string()),
                    }));
                }
                Poll::Ready(None) => {
                    if !self.buffer.is_empty() {
                        self.buffer.push_str("\n\n");
                        self.drain_complete_events();
                    }
                    if let Some(tail) = self.parser.finish() {
                        self.pending.push(tail);
                    }
                    let event = self.next_pending();
                    self.finished = true;
                    return Poll::Ready(event);
                }
                Poll::Pending => {
                    if self.idle_deadline.as_mut().poll(cx).is_ready() {
                        self.finished = true;
                        return Poll::Ready(Some(StreamEvent::Error {
                            error: ProviderError::StreamInterrupted(format!(
                                "idle timeout after {}s",
                                self.idle_duration.as_secs()
                            )),
                        }));
                    }
                    return Poll::Pending;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use futures::StreamExt;
    use parley_core::ids::ToolCallId;
    use parley_core::messages::ToolCall;
    use parley_core::stream::FinishReason;
    use parley_core::tools::ToolDefinition;

    fn provider() -> OpenAiCompatProvider {
        OpenAiCompatProvider::new(OpenAiCompatConfig {
            base_url: "http://localhost:8000/v1/".into(),
            model: "mistral-small".into(),
            api_key: None,
        })
        .unwrap()
    }

    #[test]
    fn provider_properties() {
        let p = provider();
        assert_eq!(p.name(), "openai_compat");
        assert_eq!(p.model(), "mistral-small");
        assert_eq!(p.endpoint(), "http://localhost:8000/v1/chat/completions");
    }

    #[test]
    fn body_includes_tools_only_when_present() {
        let req = ChatRequest::new(vec![Message::system("sys"), Message::user("hi")]);
        let body = build_request_body("m", &req);
        assert_eq!(body["stream"], true);
        assert!(body.get("tools").is_none());
        assert_eq!(body["messages"][1]["role"], "user");

        let req = req.with_tools(vec![ToolDefinition {
            name: "log_story_event".into(),
            description: "d".into(),
            parameters: json!({"type": "object", "properties": {}}),
        }]);
        let body = build_request_body("m", &req);
        assert_eq!(body["tools"][0]["function"]["name"], "log_story_event");
    }

    #[test]
    fn tool_messages_use_wire_shape() {
        let req = ChatRequest::new(vec![
            Message::assistant_tool_calls(
                "",
                vec![ToolCall {
                    id: ToolCallId::from_raw("call_1"),
                    name: "log_story_event".into(),
                    arguments: r#"{"event":"x"}"#.into(),
                }],
            ),
            Message::tool_result(ToolCallId::from_raw("call_1"), "Logged"),
        ]);
        let body = build_request_body("m", &req);
        let calls = &body["messages"][0]["tool_calls"];
        assert_eq!(calls[0]["type"], "function");
        assert_eq!(calls[0]["function"]["arguments"], r#"{"event":"x"}"#);
        assert_eq!(body["messages"][1]["tool_call_id"], "call_1");
    }

    #[tokio::test]
    async fn sse_stream_parses_split_chunks() {
        let parts = vec![
            Ok(bytes::Bytes::from("data: {\"choices\":[{\"index\":0,\"delta\":{\"content\":\"Hel")),
            Ok(bytes::Bytes::from("lo\"}}]}\n\ndata: {\"choices\":[{\"index\":0,\"delta\":{},\"finish_reason\":\"stop\"}]}\n\n")),
            Ok(bytes::Bytes::from("data: [DONE]\n\n")),
        ];
        let stream = SseStream::new(futures::stream::iter(parts));
        let events: Vec<StreamEvent> = stream.collect().await;

        assert_eq!(events.len(), 3);
        assert_matches!(events[0], StreamEvent::Start);
        assert_matches!(&events[1], StreamEvent::TextDelta { delta } if delta == "Hello");
        assert_matches!(&events[2], StreamEvent::Done { finish_reason: FinishReason::Stop });
    }

    #[tokio::test]
    async fn sse_stream_without_done_marker_reports_interruption() {
        let parts = vec![Ok(bytes::Bytes::from(
            "data: {\"choices\":[{\"index\":0,\"delta\":{\"content\":\"cut\"}}]}",
        ))];
        let stream = SseStream::new(futures::stream::iter(parts));
        let events: Vec<StreamEvent> = stream.collect().await;

        assert_matches!(
            events.last(),
            Some(StreamEvent::Error { error: ProviderError::StreamInterrupted(_) })
        );
    }

    #[tokio::test]
    async fn sse_stream_idle_timeout_fires_when_no_data() {
        tokio::time::pause();

        let byte_stream = futures::stream::pending::<Result<bytes::Bytes, reqwest::Error>>();
        let mut stream = Box::pin(SseStream::with_idle_timeout(byte_stream, Duration::from_secs(5)));

        tokio::time::advance(Duration::from_secs(6)).await;

        let event = stream.next().await;
        assert!(
            matches!(&event, Some(StreamEvent::Error { error: ProviderError::StreamInterrupted(msg) }) if msg.contains("idle timeout")),
            "expected idle timeout error, got: {event:?}"
        );
        assert!(stream.next().await.is_none());
    }
}
