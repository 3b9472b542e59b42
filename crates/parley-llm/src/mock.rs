use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use futures::{stream, StreamExt};
use parking_lot::Mutex;

use parley_core::errors::ProviderError;
use parley_core::provider::{ChatProvider, ChatRequest, EventStream};
use parley_core::stream::{FinishReason, StreamEvent};

/// Pre-programmed responses for deterministic testing without a model server.
#[derive(Clone)]
pub enum MockResponse {
    /// Yield a sequence of StreamEvents.
    Stream(Vec<StreamEvent>),
    /// Yield the events with a pause before each one.
    Paced(Duration, Vec<StreamEvent>),
    /// Return an error from the stream() call itself.
    Error(ProviderError),
    /// Wait a duration, then resolve the inner response.
    Delay(Duration, Box<MockResponse>),
}

impl MockResponse {
    /// A single-delta text response.
    pub fn stream_text(text: &str) -> Self {
        Self::Stream(vec![
            StreamEvent::Start,
            StreamEvent::TextDelta {
                delta: text.to_string(),
            },
            StreamEvent::Done {
                finish_reason: FinishReason::Stop,
            },
        ])
    }

    /// A text response split into one delta per fragment.
    pub fn stream_deltas(deltas: &[&str]) -> Self {
        Self::Stream(text_events(deltas))
    }

    /// Like [`stream_deltas`](Self::stream_deltas) with `pace` between events.
    pub fn paced_deltas(pace: Duration, deltas: &[&str]) -> Self {
        Self::Paced(pace, text_events(deltas))
    }

    /// A response that asks for one tool call, with the arguments streamed in two fragments.
    pub fn tool_call(id: &str, name: &str, arguments: &str) -> Self {
        let split = arguments.len() / 2;
        let split = (0..=split).rev().find(|i| arguments.is_char_boundary(*i)).unwrap_or(0);
        Self::Stream(vec![
            StreamEvent::Start,
            StreamEvent::ToolCallDelta {
                index: 0,
                id: Some(id.to_string()),
                name: Some(name.to_string()),
                arguments_delta: arguments[..split].to_string(),
            },
            StreamEvent::ToolCallDelta {
                index: 0,
                id: None,
                name: None,
                arguments_delta: arguments[split..].to_string(),
            },
            StreamEvent::Done {
                finish_reason: FinishReason::ToolCalls,
            },
        ])
    }

    /// A stream that starts and then fails mid-way.
    pub fn stream_error(error: ProviderError) -> Self {
        Self::Stream(vec![StreamEvent::Start, StreamEvent::Error { error }])
    }

    pub fn delayed(delay: Duration, inner: MockResponse) -> Self {
        Self::Delay(delay, Box::new(inner))
    }
}

fn text_events(deltas: &[&str]) -> Vec<StreamEvent> {
    let mut events = vec![StreamEvent::Start];
    events.extend(deltas.iter().map(|d| StreamEvent::TextDelta {
        delta: d.to_string(),
    }));
    events.push(StreamEvent::Done {
        finish_reason: FinishReason::Stop,
    });
    events
}

/// Mock provider that returns pre-programmed responses in sequence and
/// records every request it receives.
pub struct MockProvider {
    responses: Vec<MockResponse>,
    call_count: AtomicUsize,
    requests: Mutex<Vec<ChatRequest>>,
}

impl MockProvider {
    pub fn new(responses: Vec<MockResponse>) -> Self {
        Self {
            responses,
            call_count: AtomicUsize::new(0),
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn call_count(&self) -> usize {
        self.call_count.load(Ordering::Relaxed)
    }

    /// Requests received so far, in call order.
    pub fn requests(&self) -> Vec<ChatRequest> {
        self.requests.lock().clone()
    }
}

#[async_trait]
impl ChatProvider for MockProvider {
    fn name(&self) -> &str {
        "mock"
    }

    fn model(&self) -> &str {
        "mock-model"
    }

    async fn stream(&self, request: &ChatRequest) -> Result<EventStream, ProviderError> {
        self.requests.lock().push(request.clone());
        let idx = self.call_count.fetch_add(1, Ordering::Relaxed);

        let Some(response) = self.responses.get(idx) else {
            return Err(ProviderError::InvalidRequest(format!(
                "MockProvider: no response configured for call {idx}"
            )));
        };

        resolve_response(response).await
    }
}

/// Resolve a MockResponse, handling Delay by sleeping first.
/// Unrolls nested delays iteratively to avoid recursive async.
async fn resolve_response(response: &MockResponse) -> Result<EventStream, ProviderError> {
    let mut current = response;
    loop {
        match current {
            MockResponse::Stream(events) => {
                return Ok(Box::pin(stream::iter(events.clone())));
            }
            MockResponse::Paced(pace, events) => {
                let pace = *pace;
                let paced = stream::iter(events.clone()).then(move |event| async move {
                    tokio::time::sleep(pace).await;
                    event
                });
                return Ok(Box::pin(paced));
            }
            MockResponse::Error(e) => return Err(e.clone()),
            MockResponse::Delay(duration, inner) => {
                tokio::time::sleep(*duration).await;
                current = inner;
            }
        }
    }
}
