//! Turn coordination: one exclusive lock over a session's conversation
//! state, shared by generation and character switches, plus cancellation of
//! the generation in flight.

use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use tokio_util::sync::CancellationToken;
use tracing::debug;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConversationState {
    WaitingForUser,
    UserSpeaking,
    AssistantSpeaking,
}

impl ConversationState {
    /// The one derivation of the conversation state. Live user audio wins.
    /// Otherwise the assistant holds the floor while a turn is generating or
    /// while a final user transcript is still owed a reply.
    pub fn derive(user_audio: bool, generating: bool, replies_owed: usize) -> Self {
        if user_audio {
            Self::UserSpeaking
        } else if generating || replies_owed > 0 {
            Self::AssistantSpeaking
        } else {
            Self::WaitingForUser
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::WaitingForUser => "waiting_for_user",
            Self::UserSpeaking => "user_speaking",
            Self::AssistantSpeaking => "assistant_speaking",
        }
    }
}

#[derive(Debug, Default)]
struct Control {
    active: Mutex<Option<(u64, CancellationToken)>>,
    next_turn: AtomicU64,
    generating: AtomicBool,
    user_speaking: AtomicBool,
    replies_owed: AtomicUsize,
}

pub struct TurnCoordinator<S> {
    state: Arc<AsyncMutex<S>>,
    control: Arc<Control>,
}

impl<S> Clone for TurnCoordinator<S> {
    fn clone(&self) -> Self {
        Self {
            state: Arc::clone(&self.state),
            control: Arc::clone(&self.control),
        }
    }
}

impl<S: Send + 'static> TurnCoordinator<S> {
    pub fn new(state: S) -> Self {
        Self {
            state: Arc::new(AsyncMutex::new(state)),
            control: Arc::new(Control::default()),
        }
    }

    /// Exclusive access for a non-generation mutation such as a character
    /// switch. Waits for any turn in progress to finish.
    pub async fn lock(&self) -> OwnedMutexGuard<S> {
        Arc::clone(&self.state).lock_owned().await
    }

    /// Start a generation turn answering `replies` final user transcripts.
    /// Supersedes any earlier turn, then waits for the lock and holds it
    /// until the returned [`Turn`] is dropped.
    pub async fn begin_turn(&self, replies: usize) -> Turn<S> {
        let id = self.control.next_turn.fetch_add(1, Ordering::Relaxed) + 1;
        let cancel = CancellationToken::new();
        if let Some((prev, token)) = self.control.active.lock().replace((id, cancel.clone())) {
            debug!(turn = prev, "superseded by a newer turn");
            token.cancel();
        }
        let guard = self.lock().await;
        self.control.generating.store(true, Ordering::Release);
        Turn {
            guard,
            cancel,
            id,
            replies,
            control: Arc::clone(&self.control),
        }
    }

    /// Cancel the active turn. Returns true when one was pending or running.
    pub fn interrupt(&self) -> bool {
        let active = self.control.active.lock();
        match active.as_ref() {
            Some((id, token)) if !token.is_cancelled() => {
                debug!(turn = *id, "turn interrupted");
                token.cancel();
                true
            }
            _ => false,
        }
    }

    pub fn is_generating(&self) -> bool {
        self.control.generating.load(Ordering::Acquire)
    }

    pub fn user_speech_started(&self) {
        self.control.user_speaking.store(true, Ordering::Release);
    }

    pub fn user_speech_ended(&self) {
        self.control.user_speaking.store(false, Ordering::Release);
    }

    /// A final user transcript was queued; the assistant owes it a reply
    /// until a turn answering it completes.
    pub fn reply_requested(&self) {
        self.control.replies_owed.fetch_add(1, Ordering::AcqRel);
    }

    pub fn state(&self) -> ConversationState {
        ConversationState::derive(
            self.control.user_speaking.load(Ordering::Acquire),
            self.is_generating(),
            self.control.replies_owed.load(Ordering::Acquire),
        )
    }
}

/// A generation turn holding the session lock.
pub struct Turn<S> {
    guard: OwnedMutexGuard<S>,
    cancel: CancellationToken,
    id: u64,
    replies: usize,
    control: Arc<Control>,
}

impl<S> Turn<S> {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn cancellation(&self) -> CancellationToken {
        self.cancel.clone()
    }
}

impl<S> Deref for Turn<S> {
    type Target = S;

    fn deref(&self) -> &S {
        &self.guard
    }
}

impl<S> DerefMut for Turn<S> {
    fn deref_mut(&mut self) -> &mut S {
        &mut self.guard
    }
}

impl<S> Drop for Turn<S> {
    fn drop(&mut self) {
        let replies = self.replies;
        let _ = self
            .control
            .replies_owed
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |owed| Some(owed.saturating_sub(replies)));
        self.control.generating.store(false, Ordering::Release);
        let mut active = self.control.active.lock();
        if active.as_ref().is_some_and(|(id, _)| *id == self.id) {
            *active = None;
        }
    }
}
