//! Text helpers for the spoken-conversation path.

use std::collections::{HashSet, VecDeque};

use futures::stream::{self, Stream, StreamExt};

use parley_core::ids::ToolCallId;
use parley_core::messages::{Message, Role};

/// Appended to an assistant message the user talked over.
pub const INTERRUPTION_MARKER: &str = "—";
/// Stands in for a user turn with nothing said.
pub const SILENCE_MARKER: &str = "...";
/// Inserted when the conversation would otherwise open with the assistant.
pub const OPENING_USER_MESSAGE: &str = "Hello.";

/// Regroups text deltas into whole words: `"foo bar baz"` comes out as
/// `"foo"`, `" bar"`, `" baz"`. Whitespace runs collapse to one space that
/// travels with the following word.
#[derive(Debug, Default)]
pub struct WordChunker {
    buffer: String,
    seen_space: bool,
}

impl WordChunker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a delta; returns every word it completed.
    pub fn push(&mut self, delta: &str) -> Vec<String> {
        self.buffer.push_str(delta);
        let mut words = Vec::new();
        while let Some(start) = self.buffer.find(char::is_whitespace) {
            let end = self.buffer[start..]
                .find(|c: char| !c.is_whitespace())
                .map_or(self.buffer.len(), |i| start + i);
            let word = self.buffer[..start].to_string();
            self.buffer.drain(..end);
            if !word.is_empty() {
                words.push(self.prefixed(&word));
            }
            self.seen_space = true;
        }
        words
    }

    /// Emit whatever partial word remains.
    pub fn flush(&mut self) -> Option<String> {
        if self.buffer.is_empty() {
            return None;
        }
        let rest = std::mem::take(&mut self.buffer);
        Some(self.prefixed(&rest))
    }

    fn prefixed(&self, word: &str) -> String {
        if self.seen_space {
            format!(" {word}")
        } else {
            word.to_string()
        }
    }
}

/// Stream adapter over [`WordChunker`].
pub fn rechunk_to_words<S>(deltas: S) -> impl Stream<Item = String> + Send
where
    S: Stream<Item = String> + Send + Unpin,
{
    stream::unfold(
        (deltas, WordChunker::new(), VecDeque::new(), false),
        |(mut deltas, mut chunker, mut ready, mut done)| async move {
            loop {
                if let Some(word) = ready.pop_front() {
                    return Some((word, (deltas, chunker, ready, done)));
                }
                if done {
                    return None;
                }
                match deltas.next().await {
                    Some(delta) => ready.extend(chunker.push(&delta)),
                    None => {
                        done = true;
                        ready.extend(chunker.flush());
                    }
                }
            }
        },
    )
}

fn is_plain_turn(message: &Message) -> bool {
    matches!(message.role(), Role::User | Role::Assistant) && !message.has_tool_calls()
}

fn is_blank(content: &str) -> bool {
    content.replace(INTERRUPTION_MARKER, "").trim().is_empty()
}

/// The history as sent to the model: interruption-only and empty turns
/// removed, consecutive same-role turns merged, a trailing empty user turn
/// replaced by the silence marker, and a synthetic opening user turn when
/// the assistant would speak first.
///
/// Tool results whose requesting assistant message was truncated away are
/// dropped; chat-completion servers reject a tool message without a
/// preceding `tool_calls` entry for its id.
pub fn preprocess_for_llm(messages: &[Message]) -> Vec<Message> {
    let mut out: Vec<Message> = Vec::with_capacity(messages.len() + 1);
    let mut requested: HashSet<&ToolCallId> = HashSet::new();
    let last = messages.len().saturating_sub(1);

    for (i, message) in messages.iter().enumerate() {
        match message {
            Message::Assistant { tool_calls, .. } => requested.extend(tool_calls.iter().map(|c| &c.id)),
            Message::Tool { tool_call_id, .. } if !requested.contains(tool_call_id) => continue,
            _ => {}
        }
        let mut message = message.clone();
        if is_plain_turn(&message) && is_blank(message.content()) {
            if i == last && message.role() == Role::User {
                message = Message::user(SILENCE_MARKER);
            } else {
                continue;
            }
        }
        if let Some(prev) = out.last_mut() {
            if is_plain_turn(prev) && is_plain_turn(&message) && prev.role() == message.role() {
                let content = prev.content_mut();
                content.push(' ');
                content.push_str(message.content());
                continue;
            }
        }
        out.push(message);
    }

    let opens_with_assistant = matches!(out.get(1).map(Message::role), None | Some(Role::Assistant));
    if out.first().map(Message::role) == Some(Role::System) && opens_with_assistant {
        out.insert(1, Message::user(OPENING_USER_MESSAGE));
    }
    out
}
