//! Realtime wire events. Every event is a JSON object tagged by `type`
//! and carries an `event_id`.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use parley_core::ids::{EventId, ResponseId};
use parley_engine::CharacterSummary;

/// Literal accepted in place of a path to mean the server's default directory.
pub const DEFAULT_DIRECTORY_MARKER: &str = "default";

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct SessionConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instructions: Option<Value>,
    /// Name of the character to switch to.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub voice: Option<String>,
    #[serde(default)]
    pub allow_recording: bool,
}

#[derive(Clone, Debug, PartialEq, Deserialize)]
#[serde(tag = "type")]
pub enum ClientEvent {
    #[serde(rename = "session.update")]
    SessionUpdate {
        #[serde(default)]
        event_id: Option<String>,
        session: SessionConfig,
    },
    #[serde(rename = "session.characters.reload")]
    CharactersReload {
        #[serde(default)]
        event_id: Option<String>,
        directory: String,
    },
    #[serde(rename = "session.characters.list")]
    CharactersList {
        #[serde(default)]
        event_id: Option<String>,
    },
    #[serde(rename = "input_audio_buffer.append")]
    InputAudioAppend {
        #[serde(default)]
        event_id: Option<String>,
        /// Base64-encoded audio in the codec's format.
        audio: String,
    },
}

impl ClientEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::SessionUpdate { .. } => "session.update",
            Self::CharactersReload { .. } => "session.characters.reload",
            Self::CharactersList { .. } => "session.characters.list",
            Self::InputAudioAppend { .. } => "input_audio_buffer.append",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ErrorDetails {
    #[serde(rename = "type")]
    pub error_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
}

impl ErrorDetails {
    pub fn invalid_request(message: impl Into<String>) -> Self {
        Self {
            error_type: "invalid_request_error".into(),
            code: None,
            message: message.into(),
            details: None,
        }
    }

    pub fn server(code: &str, message: impl Into<String>) -> Self {
        Self {
            error_type: "server_error".into(),
            code: Some(code.to_string()),
            message: message.into(),
            details: None,
        }
    }

    pub fn with_details(mut self, details: Value) -> Self {
        self.details = Some(details);
        self
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ResponseInfo {
    pub object: String,
    pub id: ResponseId,
    pub status: String,
    pub voice: String,
}

impl ResponseInfo {
    pub fn in_progress(voice: impl Into<String>) -> Self {
        Self {
            object: "realtime.response".into(),
            id: ResponseId::new(),
            status: "in_progress".into(),
            voice: voice.into(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ServerEvent {
    #[serde(rename = "error")]
    Error { error: ErrorDetails },
    #[serde(rename = "session.updated")]
    SessionUpdated { session: SessionConfig },
    #[serde(rename = "session.characters.reloaded")]
    CharactersReloaded {
        directory: String,
        loaded_count: usize,
        error_count: usize,
        total_files: usize,
        characters: Vec<CharacterSummary>,
    },
    #[serde(rename = "session.characters.listed")]
    CharactersListed {
        directory: String,
        character_count: usize,
        characters: Vec<CharacterSummary>,
    },
    #[serde(rename = "input_audio_buffer.speech_started")]
    SpeechStarted,
    #[serde(rename = "input_audio_buffer.speech_stopped")]
    SpeechStopped,
    #[serde(rename = "conversation.item.input_audio_transcription.delta")]
    TranscriptionDelta { delta: String, start_time: f64 },
    #[serde(rename = "response.created")]
    ResponseCreated { response: ResponseInfo },
    #[serde(rename = "response.text.delta")]
    ResponseTextDelta { delta: String },
    #[serde(rename = "response.text.done")]
    ResponseTextDone { text: String },
    #[serde(rename = "response.audio.delta")]
    ResponseAudioDelta { delta: String },
    #[serde(rename = "response.audio.done")]
    ResponseAudioDone,
    #[serde(rename = "unmute.interrupted_by_vad")]
    InterruptedByVad,
}

impl ServerEvent {
    pub fn error(details: ErrorDetails) -> Self {
        Self::Error { error: details }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Error { .. } => "error",
            Self::SessionUpdated { .. } => "session.updated",
            Self::CharactersReloaded { .. } => "session.characters.reloaded",
            Self::CharactersListed { .. } => "session.characters.listed",
            Self::SpeechStarted => "input_audio_buffer.speech_started",
            Self::SpeechStopped => "input_audio_buffer.speech_stopped",
            Self::TranscriptionDelta { .. } => "conversation.item.input_audio_transcription.delta",
            Self::ResponseCreated { .. } => "response.created",
            Self::ResponseTextDelta { .. } => "response.text.delta",
            Self::ResponseTextDone { .. } => "response.text.done",
            Self::ResponseAudioDelta { .. } => "response.audio.delta",
            Self::ResponseAudioDone => "response.audio.done",
            Self::InterruptedByVad => "unmute.interrupted_by_vad",
        }
    }
}

/// A server event as written to the socket.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ServerEnvelope {
    pub event_id: EventId,
    #[serde(flatten)]
    pub event: ServerEvent,
}

impl ServerEnvelope {
    pub fn new(event: ServerEvent) -> Self {
        Self {
            event_id: EventId::new(),
            event,
        }
    }
}
