//! Per-character conversation logs for one session.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::debug;

use parley_core::messages::{Message, Role};

use crate::error::HistoryError;
use crate::text;

pub const DEFAULT_MAX_MESSAGES: usize = 100;

/// One character's log. `messages[0]` is always the system prompt.
#[derive(Clone, Debug)]
pub struct CharacterHistory {
    pub character: String,
    messages: Vec<Message>,
    pub created_at: DateTime<Utc>,
    pub last_accessed: DateTime<Utc>,
}

impl CharacterHistory {
    fn new(character: &str, system_prompt: &str) -> Self {
        let now = Utc::now();
        Self {
            character: character.to_string(),
            messages: vec![Message::system(system_prompt)],
            created_at: now,
            last_accessed: now,
        }
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    /// Keep the system prompt and the newest `max - 1` messages.
    fn truncate(&mut self, max: usize) {
        let max = max.max(1);
        if self.messages.len() > max {
            let excess = self.messages.len() - max;
            self.messages.drain(1..1 + excess);
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct HistoryStats {
    pub character_count: usize,
    pub total_messages: usize,
    pub current: Option<String>,
}

/// All of a session's character histories plus which one is active.
#[derive(Debug)]
pub struct HistoryStore {
    histories: HashMap<String, CharacterHistory>,
    current: Option<String>,
    max_messages: usize,
}

impl Default for HistoryStore {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_MESSAGES)
    }
}

impl HistoryStore {
    pub fn new(max_messages: usize) -> Self {
        Self {
            histories: HashMap::new(),
            current: None,
            max_messages: max_messages.max(1),
        }
    }

    pub fn max_messages(&self) -> usize {
        self.max_messages
    }

    /// Make `character` active, creating its history seeded with
    /// `system_prompt` on first use. An existing history comes back unchanged.
    pub fn switch_to(&mut self, character: &str, system_prompt: &str) -> Result<(), HistoryError> {
        if character.trim().is_empty() {
            return Err(HistoryError::EmptyCharacterName);
        }
        if system_prompt.trim().is_empty() {
            return Err(HistoryError::EmptySystemPrompt);
        }
        let history = self
            .histories
            .entry(character.to_string())
            .or_insert_with(|| CharacterHistory::new(character, system_prompt));
        history.last_accessed = Utc::now();
        if self.current.as_deref() != Some(character) {
            debug!(character, messages = history.messages.len(), "history activated");
            self.current = Some(character.to_string());
        }
        Ok(())
    }

    pub fn current_character(&self) -> Option<&str> {
        self.current.as_deref()
    }

    fn active(&self) -> Option<&CharacterHistory> {
        self.current.as_ref().and_then(|c| self.histories.get(c))
    }

    fn active_mut(&mut self) -> Result<&mut CharacterHistory, HistoryError> {
        let current = self.current.as_ref().ok_or(HistoryError::NoActiveCharacter)?;
        self.histories.get_mut(current).ok_or(HistoryError::NoActiveCharacter)
    }

    pub fn current(&self) -> Option<&[Message]> {
        self.active().map(CharacterHistory::messages)
    }

    pub fn history(&self, character: &str) -> Option<&CharacterHistory> {
        self.histories.get(character)
    }

    /// Append to the active log, then enforce the bound.
    pub fn append(&mut self, message: Message) -> Result<(), HistoryError> {
        if message.role() == Role::System {
            return Err(HistoryError::SystemMessageAppend);
        }
        let max = self.max_messages;
        let history = self.active_mut()?;
        history.messages.push(message);
        history.truncate(max);
        history.last_accessed = Utc::now();
        Ok(())
    }

    /// The active log as it should be sent to the model.
    pub fn preprocessed(&self) -> Vec<Message> {
        self.current().map(text::preprocess_for_llm).unwrap_or_default()
    }

    /// Remove one character's log. Clearing the active character leaves no
    /// current character until the next switch.
    pub fn clear(&mut self, character: &str) -> bool {
        let removed = self.histories.remove(character).is_some();
        if self.current.as_deref() == Some(character) {
            self.current = None;
        }
        removed
    }

    /// Drop every log. Returns how many messages were purged.
    pub fn clear_all(&mut self) -> usize {
        let purged = self.histories.values().map(|h| h.messages.len()).sum();
        self.histories.clear();
        self.current = None;
        purged
    }

    pub fn stats(&self) -> HistoryStats {
        HistoryStats {
            character_count: self.histories.len(),
            total_messages: self.histories.values().map(|h| h.messages.len()).sum(),
            current: self.current.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    fn exchange(store: &mut HistoryStore, n: usize, tag: &str) {
        for i in 0..n {
            store.append(Message::user(format!("{tag} question {i}"))).unwrap();
            store.append(Message::assistant(format!("{tag} answer {i}"))).unwrap();
        }
    }

    fn assert_system_first(store: &HistoryStore) {
        for name in ["A", "B"] {
            if let Some(h) = store.history(name) {
                assert_eq!(h.messages()[0].role(), Role::System);
            }
        }
    }

    #[test]
    fn switching_back_restores_exact_history() {
        let mut store = HistoryStore::default();
        store.switch_to("A", "You are A.").unwrap();
        exchange(&mut store, 3, "a");
        let a_before: Vec<Message> = store.current().unwrap().to_vec();
        assert_eq!(a_before.len(), 7);

        store.switch_to("B", "You are B.").unwrap();
        exchange(&mut store, 2, "b");
        assert_eq!(store.current().unwrap().len(), 5);

        store.switch_to("A", "ignored on reactivation").unwrap();
        assert_eq!(store.current().unwrap(), a_before.as_slice());
        assert_eq!(store.current().unwrap().len(), 7);
        assert_system_first(&store);
    }

    #[test]
    fn switch_is_idempotent() {
        let mut store = HistoryStore::default();
        store.switch_to("A", "sys").unwrap();
        store.append(Message::user("hi")).unwrap();
        store.switch_to("A", "sys").unwrap();
        assert_eq!(store.current().unwrap().len(), 2);
    }

    #[test]
    fn rejects_empty_inputs_and_orphan_appends() {
        let mut store = HistoryStore::default();
        assert_eq!(store.switch_to("", "sys"), Err(HistoryError::EmptyCharacterName));
        assert_eq!(store.switch_to("A", "  "), Err(HistoryError::EmptySystemPrompt));
        assert_eq!(store.append(Message::user("x")), Err(HistoryError::NoActiveCharacter));

        store.switch_to("A", "sys").unwrap();
        assert_eq!(store.append(Message::system("again")), Err(HistoryError::SystemMessageAppend));
    }

    #[test]
    fn truncation_keeps_system_and_newest() {
        let mut store = HistoryStore::new(5);
        store.switch_to("A", "sys").unwrap();
        for i in 0..12 {
            store.append(Message::user(format!("m{i}"))).unwrap();
        }
        let messages = store.current().unwrap();
        assert_eq!(messages.len(), 5);
        assert_eq!(messages[0].role(), Role::System);
        let tail: Vec<&str> = messages[1..].iter().map(Message::content).collect();
        assert_eq!(tail, vec!["m8", "m9", "m10", "m11"]);
    }

    #[test]
    fn truncated_tool_request_does_not_leave_orphan_result() {
        use parley_core::ids::ToolCallId;
        use parley_core::messages::ToolCall;

        let mut store = HistoryStore::new(4);
        store.switch_to("A", "sys").unwrap();
        store.append(Message::user("roll the dice")).unwrap();
        store
            .append(Message::assistant_tool_calls(
                "",
                vec![ToolCall {
                    id: ToolCallId::from_raw("call_1"),
                    name: "log_story_event".into(),
                    arguments: r#"{"event":"roll"}"#.into(),
                }],
            ))
            .unwrap();
        store.append(Message::tool_result(ToolCallId::from_raw("call_1"), "Logged")).unwrap();
        store.append(Message::assistant("A six!")).unwrap();
        store.append(Message::user("again")).unwrap();

        let stored: Vec<Role> = store.current().unwrap().iter().map(Message::role).collect();
        assert_eq!(stored, vec![Role::System, Role::Tool, Role::Assistant, Role::User]);

        let sent: Vec<Role> = store.preprocessed().iter().map(Message::role).collect();
        assert_eq!(sent, vec![Role::System, Role::User, Role::Assistant, Role::User]);
    }

    #[test]
    fn clear_only_touches_one_character() {
        let mut store = HistoryStore::default();
        store.switch_to("A", "a").unwrap();
        store.switch_to("B", "b").unwrap();
        assert!(store.clear("B"));
        assert!(store.current_character().is_none());
        assert!(store.history("A").is_some());
        assert_matches!(store.append(Message::user("x")), Err(HistoryError::NoActiveCharacter));

        assert_eq!(store.clear_all(), 1);
        assert_eq!(store.stats().character_count, 0);
    }

    #[test]
    fn stats_count_every_history() {
        let mut store = HistoryStore::default();
        store.switch_to("A", "a").unwrap();
        store.append(Message::user("x")).unwrap();
        store.switch_to("B", "b").unwrap();
        assert_eq!(
            store.stats(),
            HistoryStats {
                character_count: 2,
                total_messages: 3,
                current: Some("B".into()),
            }
        );
    }
}
