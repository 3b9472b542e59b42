//! Per-connection session orchestration.
//!
//! A [`Session`] owns its character registry and histories behind a
//! [`TurnCoordinator`]. Three background tasks share that state:
//! - a control task applying character switches and list requests in order;
//! - a turn worker running one generation at a time;
//! - at most one reload, replaced (and fenced off) by any newer reload.
//!
//! Audio is handled inline by [`Session::handle`] so that a final transcript
//! can interrupt the turn in flight.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use futures::{stream, StreamExt};
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio::task::{JoinError, JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use parley_core::errors::{CollaboratorError, ProviderError};
use parley_core::ids::SessionId;
use parley_core::messages::Message;
use parley_core::provider::{readable_model_name, ChatProvider, ChatRequest};
use parley_core::stream::{StreamEvent, ToolCallBuffer};
use parley_core::tools::ToolDefinition;
use parley_engine::characters::{Catalog, LoadError};
use parley_engine::text::{rechunk_to_words, WordChunker, INTERRUPTION_MARKER};
use parley_engine::tools::DEFAULT_TOOL_DEADLINE;
use parley_engine::{
    CharacterDefinition, CharacterRegistry, ConversationState, HistoryError, HistoryStore, RegistryError,
    ToolExecutor, TurnCoordinator,
};
use parley_telemetry::MetricsRecorder;

use crate::collaborators::{AudioCodec, SpeechToText, SpeechToTextProvider, SttEvent, TextToSpeech};
use crate::protocol::{
    ClientEvent, ErrorDetails, ResponseInfo, ServerEvent, SessionConfig, DEFAULT_DIRECTORY_MARKER,
};
use crate::settings::Settings;

#[derive(Clone, Debug)]
pub struct SessionOptions {
    pub default_directory: PathBuf,
    pub default_character: Option<String>,
    pub max_messages: usize,
    pub tool_timeout: Duration,
    pub slow_warning_ratio: f64,
    pub temperature: Option<f64>,
    pub max_tokens: Option<u32>,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            default_directory: PathBuf::from("characters"),
            default_character: None,
            max_messages: parley_engine::history::DEFAULT_MAX_MESSAGES,
            tool_timeout: DEFAULT_TOOL_DEADLINE,
            slow_warning_ratio: 0.8,
            temperature: None,
            max_tokens: None,
        }
    }
}

impl SessionOptions {
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            default_directory: settings.characters.default_directory.clone(),
            default_character: settings.characters.default_character.clone(),
            max_messages: settings.conversation.max_messages_per_character,
            tool_timeout: settings.tools.timeout(),
            slow_warning_ratio: settings.tools.slow_warning_ratio,
            temperature: settings.llm.temperature,
            max_tokens: settings.llm.max_tokens,
        }
    }
}

/// Everything a session needs from the process. Cheap to clone.
#[derive(Clone)]
pub struct SessionDeps {
    pub provider: Arc<dyn ChatProvider>,
    pub stt: Arc<dyn SpeechToTextProvider>,
    pub tts: Arc<dyn TextToSpeech>,
    pub codec: Arc<dyn AudioCodec>,
    pub catalog: Arc<Catalog>,
    pub metrics: Arc<MetricsRecorder>,
    pub options: SessionOptions,
}

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("character '{0}' not found")]
    CharacterNotFound(String),

    #[error("no active character")]
    NoActiveCharacter,

    #[error("{0}")]
    InvalidDirectory(RegistryError),

    #[error("no valid characters in {}", .directory.display())]
    NoValidCharacters { directory: PathBuf, errors: Vec<LoadError> },

    #[error("character switch failed: {0}")]
    SwitchFailed(HistoryError),

    #[error("character reload failed: {0}")]
    ReloadFailed(RegistryError),

    #[error("history update failed: {0}")]
    History(#[from] HistoryError),

    #[error("invalid audio payload: {0}")]
    InvalidAudio(String),

    #[error("language model error: {0}")]
    Llm(#[from] ProviderError),

    #[error("speech recognition error: {0}")]
    Stt(CollaboratorError),

    #[error("speech synthesis error: {0}")]
    Tts(CollaboratorError),

    #[error("audio codec error: {0}")]
    Codec(CollaboratorError),
}

impl SessionError {
    /// Wire error code.
    pub fn code(&self) -> &'static str {
        match self {
            Self::CharacterNotFound(_) | Self::NoActiveCharacter => "character_not_found",
            Self::InvalidDirectory(_) => "invalid_directory",
            Self::NoValidCharacters { .. } => "no_valid_characters",
            Self::SwitchFailed(_) => "character_switch_failed",
            Self::ReloadFailed(_) => "character_reload_failed",
            Self::History(_) => "history_error",
            Self::InvalidAudio(_) => "invalid_audio",
            Self::Llm(_) => "llm_error",
            Self::Stt(_) => "stt_error",
            Self::Tts(_) => "tts_error",
            Self::Codec(_) => "codec_error",
        }
    }

    pub fn is_recoverable(&self) -> bool {
        match self {
            Self::Stt(e) | Self::Tts(e) | Self::Codec(e) => e.is_recoverable(),
            _ => true,
        }
    }

    fn details(&self) -> Option<Value> {
        match self {
            Self::NoValidCharacters { errors, .. } => Some(json!({ "errors": errors })),
            Self::Llm(e) => Some(json!({ "kind": e.error_kind() })),
            Self::Stt(e) | Self::Tts(e) | Self::Codec(e) => Some(json!({ "kind": e.error_kind() })),
            _ => None,
        }
    }

    pub fn to_event(&self) -> ServerEvent {
        let details = match self {
            Self::InvalidAudio(_) => ErrorDetails {
                error_type: "invalid_request_error".into(),
                code: Some(self.code().to_string()),
                message: self.to_string(),
                details: None,
            },
            _ => ErrorDetails::server(self.code(), self.to_string()),
        };
        ServerEvent::error(match self.details() {
            Some(d) => details.with_details(d),
            None => details,
        })
    }
}

/// State guarded by the turn lock.
struct SessionState {
    registry: CharacterRegistry,
    history: HistoryStore,
    active: Option<Arc<CharacterDefinition>>,
}

impl SessionState {
    fn activate(&mut self, name: &str, llm_name: &str) -> Result<Arc<CharacterDefinition>, SessionError> {
        let character = self
            .registry
            .get(name)
            .ok_or_else(|| SessionError::CharacterNotFound(name.to_string()))?;
        let prompt = character.system_prompt(llm_name);
        self.history
            .switch_to(&character.name, &prompt)
            .map_err(SessionError::SwitchFailed)?;
        self.active = Some(Arc::clone(&character));
        Ok(character)
    }

    /// After a reload, point `active` at the freshly loaded definition of the
    /// same name. Its history is kept either way.
    fn repoint_active(&mut self) {
        let Some(active) = self.active.take() else {
            return;
        };
        match self.registry.get(&active.name) {
            Some(fresh) => self.active = Some(fresh),
            None => warn!(character = %active.name, "active character missing after reload"),
        }
    }

    fn directory_label(&self, fallback: &std::path::Path) -> String {
        self.registry.current_directory().unwrap_or(fallback).display().to_string()
    }
}

/// Counts reported by [`Session::close`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SessionPurge {
    pub histories: usize,
    pub units: usize,
}

enum Control {
    Switch(SessionConfig),
    List,
}

struct Shared {
    id: SessionId,
    deps: SessionDeps,
    llm_name: String,
    turns: TurnCoordinator<SessionState>,
    executor: ToolExecutor,
    events: mpsc::Sender<ServerEvent>,
}

pub struct Session {
    shared: Arc<Shared>,
    stt: Box<dyn SpeechToText>,
    control_tx: mpsc::UnboundedSender<Control>,
    utterance_tx: mpsc::UnboundedSender<String>,
    control_task: JoinHandle<()>,
    turn_task: JoinHandle<()>,
    reload_task: Option<JoinHandle<()>>,
    reload_fence: parley_engine::characters::LoadFence,
    utterance: String,
    opened_at: Instant,
}

impl Session {
    /// Load the default character directory and activate the configured (or
    /// first) character. A directory that fails to load leaves the session
    /// open with no characters.
    #[instrument(skip_all)]
    pub async fn open(deps: SessionDeps, events: mpsc::Sender<ServerEvent>) -> Result<Self, SessionError> {
        let id = SessionId::new();
        let llm_name = readable_model_name(deps.provider.model());
        let stt = deps.stt.open_stream().map_err(SessionError::Stt)?;

        let mut registry = CharacterRegistry::new(id.as_str(), Arc::clone(&deps.catalog))
            .with_metrics(Arc::clone(&deps.metrics));
        match registry.load(&deps.options.default_directory).await {
            Ok(result) if result.error_count() > 0 => {
                warn!(session_id = %id, loaded = result.loaded, errors = result.error_count(), "some characters failed to load");
            }
            Ok(_) => {}
            Err(e) => {
                warn!(session_id = %id, error = %e, "default character directory failed to load");
            }
        }
        let reload_fence = registry.fence();

        let mut state = SessionState {
            registry,
            history: HistoryStore::new(deps.options.max_messages),
            active: None,
        };
        let initial = deps
            .options
            .default_character
            .clone()
            .filter(|name| state.registry.get(name).is_some())
            .or_else(|| state.registry.names().into_iter().next());
        if let Some(name) = initial {
            match state.activate(&name, &llm_name) {
                Ok(_) => info!(session_id = %id, character = %name, "initial character active"),
                Err(e) => warn!(session_id = %id, character = %name, error = %e, "initial character failed"),
            }
        }

        let executor = ToolExecutor::new(Arc::clone(&deps.metrics))
            .with_slow_warning_ratio(deps.options.slow_warning_ratio);
        deps.metrics.gauge_inc("active_sessions", &[], 1.0);

        let shared = Arc::new(Shared {
            id,
            deps,
            llm_name,
            turns: TurnCoordinator::new(state),
            executor,
            events,
        });

        let (control_tx, control_rx) = mpsc::unbounded_channel();
        let (utterance_tx, utterance_rx) = mpsc::unbounded_channel();
        let control_task = tokio::spawn(Arc::clone(&shared).run_control(control_rx));
        let turn_task = tokio::spawn(Arc::clone(&shared).run_turns(utterance_rx));

        info!(session_id = %shared.id, "session opened");
        Ok(Self {
            shared,
            stt,
            control_tx,
            utterance_tx,
            control_task,
            turn_task,
            reload_task: None,
            reload_fence,
            utterance: String::new(),
            opened_at: Instant::now(),
        })
    }

    pub fn id(&self) -> &SessionId {
        &self.shared.id
    }

    pub async fn handle(&mut self, event: ClientEvent) {
        debug!(session_id = %self.shared.id, kind = event.kind(), "client event");
        match event {
            ClientEvent::SessionUpdate { session, .. } => self.send_control(Control::Switch(session)),
            ClientEvent::CharactersList { .. } => self.send_control(Control::List),
            ClientEvent::CharactersReload { directory, .. } => self.request_reload(&directory),
            ClientEvent::InputAudioAppend { audio, .. } => {
                if let Err(e) = self.append_audio(&audio).await {
                    self.shared.report(e).await;
                }
            }
        }
    }

    fn send_control(&self, control: Control) {
        if self.control_tx.send(control).is_err() {
            error!(session_id = %self.shared.id, "control task is gone");
        }
    }

    fn request_reload(&mut self, directory: &str) {
        let dir = if directory == DEFAULT_DIRECTORY_MARKER {
            self.shared.deps.options.default_directory.clone()
        } else {
            PathBuf::from(directory)
        };
        self.reload_fence.supersede();
        if let Some(previous) = self.reload_task.take() {
            if !previous.is_finished() {
                debug!(session_id = %self.shared.id, "superseding in-flight reload");
            }
            previous.abort();
        }
        let shared = Arc::clone(&self.shared);
        self.reload_task = Some(tokio::spawn(async move { shared.reload(dir).await }));
    }

    async fn append_audio(&mut self, audio: &str) -> Result<(), SessionError> {
        let bytes = BASE64
            .decode(audio)
            .map_err(|e| SessionError::InvalidAudio(e.to_string()))?;
        let codec = Arc::clone(&self.shared.deps.codec);
        let pcm = tokio::task::spawn_blocking(move || codec.decode(&bytes))
            .await
            .map_err(|e| SessionError::Codec(blocking_failure(e)))?
            .map_err(SessionError::Codec)?;

        let events = self.stt.push_audio(&pcm).await.map_err(SessionError::Stt)?;
        for event in events {
            match event {
                SttEvent::SpeechStarted => {
                    self.shared.turns.user_speech_started();
                    self.shared.emit(ServerEvent::SpeechStarted).await;
                }
                SttEvent::Transcript { delta, start_time } => {
                    if !self.utterance.is_empty() && !delta.starts_with(char::is_whitespace) {
                        self.utterance.push(' ');
                    }
                    self.utterance.push_str(&delta);
                    self.shared
                        .emit(ServerEvent::TranscriptionDelta { delta, start_time })
                        .await;
                }
                SttEvent::EndOfUtterance => {
                    self.shared.turns.user_speech_ended();
                    self.shared.emit(ServerEvent::SpeechStopped).await;
                    let text = std::mem::take(&mut self.utterance);
                    self.finish_utterance(text.trim()).await;
                }
            }
        }
        Ok(())
    }

    async fn finish_utterance(&self, text: &str) {
        if text.is_empty() {
            return;
        }
        let turns = &self.shared.turns;
        if turns.state() == ConversationState::AssistantSpeaking && turns.interrupt() {
            info!(session_id = %self.shared.id, "assistant interrupted by user speech");
            self.shared.emit(ServerEvent::InterruptedByVad).await;
        }
        turns.reply_requested();
        if self.utterance_tx.send(text.to_string()).is_err() {
            error!(session_id = %self.shared.id, "turn worker is gone");
        }
    }

    pub fn conversation_state(&self) -> ConversationState {
        self.shared.turns.state()
    }

    /// Name of the active character, once pending switches have been applied.
    pub async fn active_character(&self) -> Option<String> {
        let state = self.shared.turns.lock().await;
        state.active.as_ref().map(|c| c.name.clone())
    }

    /// The active history, once any turn in progress has finished.
    pub async fn history_snapshot(&self) -> Option<Vec<Message>> {
        let state = self.shared.turns.lock().await;
        state.history.current().map(<[Message]>::to_vec)
    }

    /// Stop every task, then purge histories and the character namespace.
    pub async fn close(self) -> SessionPurge {
        self.shared.turns.interrupt();
        self.control_task.abort();
        self.turn_task.abort();
        if let Some(reload) = &self.reload_task {
            reload.abort();
        }

        let purge = {
            let mut state = self.shared.turns.lock().await;
            state.active = None;
            let stats = state.history.stats();
            debug!(
                session_id = %self.shared.id,
                characters = stats.character_count,
                messages = stats.total_messages,
                "purging histories"
            );
            SessionPurge {
                histories: state.history.clear_all(),
                units: state.registry.dispose(),
            }
        };

        let metrics = &self.shared.deps.metrics;
        metrics.gauge_inc("active_sessions", &[], -1.0);
        metrics.histogram_observe("session_duration_seconds", &[], self.opened_at.elapsed().as_secs_f64());
        info!(
            session_id = %self.shared.id,
            histories = purge.histories,
            units = purge.units,
            "session closed, state purged"
        );
        purge
    }
}

/// Outcome of one streamed completion.
#[derive(Default)]
struct Pass {
    /// Everything the model said.
    text: String,
    /// What reached the client.
    relayed: String,
    /// Deltas held back while tool calls were still possible.
    held: Vec<String>,
    calls: ToolCallBuffer,
    interrupted: bool,
}

struct Reply {
    text: String,
    interrupted: bool,
}

impl Shared {
    async fn emit(&self, event: ServerEvent) {
        if self.events.send(event).await.is_err() {
            debug!(session_id = %self.id, "event receiver dropped");
        }
    }

    async fn report(&self, e: SessionError) {
        if e.is_recoverable() {
            warn!(session_id = %self.id, code = e.code(), error = %e, "session error");
        } else {
            error!(session_id = %self.id, code = e.code(), error = %e, "unrecoverable collaborator error");
        }
        self.emit(e.to_event()).await;
    }

    async fn run_control(self: Arc<Self>, mut rx: mpsc::UnboundedReceiver<Control>) {
        while let Some(control) = rx.recv().await {
            match control {
                Control::Switch(config) => self.switch_character(config).await,
                Control::List => self.list_characters().await,
            }
        }
    }

    #[instrument(skip_all, fields(session_id = %self.id, character = ?config.voice))]
    async fn switch_character(&self, config: SessionConfig) {
        let Some(name) = config.voice.clone() else {
            self.emit(ServerEvent::SessionUpdated { session: config }).await;
            return;
        };

        let result = {
            let mut state = self.turns.lock().await;
            state.activate(&name, &self.llm_name)
        };
        match result {
            Ok(character) => {
                self.deps.metrics.counter_inc("character_switches_total", &[], 1);
                info!(voice = %character.voice_id(), "character switched");
                self.emit(ServerEvent::SessionUpdated { session: config }).await;
            }
            Err(e) => {
                self.deps
                    .metrics
                    .counter_inc("character_switch_errors_total", &[("reason", e.code())], 1);
                self.report(e).await;
            }
        }
    }

    async fn list_characters(&self) {
        let (directory, characters) = {
            let state = self.turns.lock().await;
            (
                state.directory_label(&self.deps.options.default_directory),
                state.registry.list(),
            )
        };
        self.emit(ServerEvent::CharactersListed {
            directory,
            character_count: characters.len(),
            characters,
        })
        .await;
    }

    #[instrument(skip_all, fields(session_id = %self.id, dir = %dir.display()))]
    async fn reload(&self, dir: PathBuf) {
        let mut state = self.turns.lock().await;
        match state.registry.reload(&dir).await {
            Ok(result) => {
                state.repoint_active();
                let characters = state.registry.list();
                drop(state);
                if result.loaded == 0 {
                    self.report(SessionError::NoValidCharacters {
                        directory: dir,
                        errors: result.errors,
                    })
                    .await;
                    return;
                }
                self.emit(ServerEvent::CharactersReloaded {
                    directory: dir.display().to_string(),
                    loaded_count: result.loaded,
                    error_count: result.error_count(),
                    total_files: result.total,
                    characters,
                })
                .await;
            }
            Err(RegistryError::Superseded) => debug!("reload superseded"),
            Err(e @ (RegistryError::DirectoryNotFound(_) | RegistryError::NotADirectory(_))) => {
                drop(state);
                self.report(SessionError::InvalidDirectory(e)).await;
            }
            Err(e) => {
                drop(state);
                self.report(SessionError::ReloadFailed(e)).await;
            }
        }
    }

    /// Serve utterances one turn at a time. Utterances that queued up while a
    /// turn was running are answered together.
    async fn run_turns(self: Arc<Self>, mut rx: mpsc::UnboundedReceiver<String>) {
        while let Some(first) = rx.recv().await {
            let mut utterances = vec![first];
            while let Ok(more) = rx.try_recv() {
                utterances.push(more);
            }
            if let Err(e) = self.respond(utterances).await {
                self.report(e).await;
            }
        }
    }

    async fn respond(&self, utterances: Vec<String>) -> Result<(), SessionError> {
        let mut turn = self.turns.begin_turn(utterances.len()).await;
        let cancel = turn.cancellation();
        let state: &mut SessionState = &mut turn;

        let character = state.active.clone().ok_or(SessionError::NoActiveCharacter)?;
        for text in utterances {
            state.history.append(Message::user(text))?;
        }

        self
            .emit(ServerEvent::ResponseCreated {
                response: ResponseInfo::in_progress(character.voice_id()),
            })
            .await;

        let reply = self.generate(state, &character, &cancel).await?;
        if reply.interrupted {
            let partial = reply.text.trim_end();
            state
                .history
                .append(Message::assistant(format!("{partial}{INTERRUPTION_MARKER}")))?;
            return Ok(());
        }

        self.emit(ServerEvent::ResponseTextDone { text: reply.text.clone() }).await;
        let spoken = if reply.text.trim().is_empty() {
            Ok(true)
        } else {
            self.speak(character.voice_id(), &reply.text, &cancel).await
        };
        let content = match spoken {
            Ok(false) => format!("{}{INTERRUPTION_MARKER}", reply.text.trim_end()),
            _ => reply.text,
        };
        state.history.append(Message::assistant(content))?;
        spoken.map(|_| ())
    }

    /// Run the model once, resolving at most one round of tool calls before
    /// the final answer is relayed.
    #[instrument(skip_all, fields(session_id = %self.id, character = %character.name))]
    async fn generate(
        &self,
        state: &mut SessionState,
        character: &CharacterDefinition,
        cancel: &CancellationToken,
    ) -> Result<Reply, SessionError> {
        let tools = character.tool_definitions();
        let hold_text = !tools.is_empty();
        let first = self
            .stream_pass(state.history.preprocessed(), tools, hold_text, cancel)
            .await?;
        if first.interrupted {
            return Ok(Reply { text: first.relayed, interrupted: true });
        }

        let calls = first.calls.finish();
        if calls.is_empty() {
            if !hold_text {
                return Ok(Reply { text: first.text, interrupted: false });
            }
            let mut relayed = String::new();
            let mut words = std::pin::pin!(rechunk_to_words(stream::iter(first.held)));
            while let Some(word) = words.next().await {
                if cancel.is_cancelled() {
                    return Ok(Reply { text: relayed, interrupted: true });
                }
                relayed.push_str(&word);
                self.emit(ServerEvent::ResponseTextDelta { delta: word }).await;
            }
            return Ok(Reply { text: first.text, interrupted: false });
        }

        info!(calls = calls.len(), "resolving tool calls");
        state
            .history
            .append(Message::assistant_tool_calls(first.text, calls.clone()))?;
        for call in &calls {
            let result = self
                .executor
                .execute(character, &call.name, &call.arguments, self.deps.options.tool_timeout)
                .await;
            state.history.append(Message::tool_result(call.id.clone(), result))?;
        }
        if cancel.is_cancelled() {
            return Ok(Reply { text: String::new(), interrupted: true });
        }

        let second = self
            .stream_pass(state.history.preprocessed(), Vec::new(), false, cancel)
            .await?;
        let text = if second.interrupted { second.relayed } else { second.text };
        Ok(Reply { text, interrupted: second.interrupted })
    }

    async fn stream_pass(
        &self,
        messages: Vec<Message>,
        tools: Vec<ToolDefinition>,
        hold_text: bool,
        cancel: &CancellationToken,
    ) -> Result<Pass, SessionError> {
        let mut request = ChatRequest::new(messages).with_tools(tools);
        request.temperature = self.deps.options.temperature;
        request.max_tokens = self.deps.options.max_tokens;
        self.deps.metrics.counter_inc("llm_requests_total", &[], 1);

        let mut pass = Pass::default();
        let mut events = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                pass.interrupted = true;
                return Ok(pass);
            }
            result = self.deps.provider.stream(&request) => result.map_err(|e| self.llm_error(e))?,
        };

        let mut chunker = WordChunker::new();
        loop {
            let event = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    pass.interrupted = true;
                    break;
                }
                event = events.next() => event,
            };
            match event {
                None | Some(StreamEvent::Done { .. }) => break,
                Some(StreamEvent::Start) => {}
                Some(StreamEvent::TextDelta { delta }) => {
                    pass.text.push_str(&delta);
                    if hold_text {
                        pass.held.push(delta);
                    } else {
                        for word in chunker.push(&delta) {
                            pass.relayed.push_str(&word);
                            self.emit(ServerEvent::ResponseTextDelta { delta: word }).await;
                        }
                    }
                }
                Some(StreamEvent::ToolCallDelta {
                    index,
                    id,
                    name,
                    arguments_delta,
                }) => pass
                    .calls
                    .push(index, id.as_deref(), name.as_deref(), &arguments_delta),
                Some(StreamEvent::Error { error }) => return Err(self.llm_error(error)),
            }
        }

        if !pass.interrupted {
            if let Some(word) = chunker.flush() {
                pass.relayed.push_str(&word);
                self.emit(ServerEvent::ResponseTextDelta { delta: word }).await;
            }
        }
        Ok(pass)
    }

    fn llm_error(&self, e: ProviderError) -> SessionError {
        self.deps
            .metrics
            .counter_inc("llm_errors_total", &[("kind", e.error_kind())], 1);
        SessionError::Llm(e)
    }

    /// Relay synthesized audio. Returns false when an interruption cut the
    /// audio short.
    async fn speak(&self, voice: &str, text: &str, cancel: &CancellationToken) -> Result<bool, SessionError> {
        let chunks = self.deps.tts.synthesize(voice, text).await.map_err(SessionError::Tts)?;
        for chunk in chunks {
            if cancel.is_cancelled() {
                debug!(session_id = %self.id, "audio relay stopped by interruption");
                return Ok(false);
            }
            let codec = Arc::clone(&self.deps.codec);
            let bytes = tokio::task::spawn_blocking(move || codec.encode(&chunk))
                .await
                .map_err(|e| SessionError::Codec(blocking_failure(e)))?
                .map_err(SessionError::Codec)?;
            self.emit(ServerEvent::ResponseAudioDelta {
                delta: BASE64.encode(bytes),
            })
            .await;
        }
        self.emit(ServerEvent::ResponseAudioDone).await;
        Ok(true)
    }
}

fn blocking_failure(e: JoinError) -> CollaboratorError {
    if e.is_panic() {
        CollaboratorError::Failed("codec panicked".into())
    } else {
        CollaboratorError::Failed("codec task cancelled".into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collaborators::{pcm_text, MockStt, MockTts, PassthroughCodec};
    use assert_matches::assert_matches;
    use parley_core::messages::Role;
    use parley_llm::{MockProvider, MockResponse};
    use std::path::Path;

    fn character(name: &str, with_tools: bool) -> String {
        let mut source = format!(
            r#"
name = "{name}"

[voice]
path_on_server = "voices/{name}.wav"

[instructions]
instruction_prompt = "You are {name}."

[prompt]
generator = "standard"

[metadata]
good = true
"#
        );
        if with_tools {
            source.push_str(
                r#"
[[tools]]
name = "log_story_event"
description = "Log an event in the story"
parameters = { type = "object", required = ["event"], properties = { event = { type = "string" } } }

[handler]
kind = "event_log"
"#,
            );
        }
        source
    }

    fn write(dir: &Path, file: &str, source: &str) {
        std::fs::write(dir.join(file), source).unwrap();
    }

    fn deps(dir: &Path, provider: MockProvider, metrics: Arc<MetricsRecorder>) -> (SessionDeps, Arc<MockTts>) {
        let tts = Arc::new(MockTts::new());
        let deps = SessionDeps {
            provider: Arc::new(provider),
            stt: Arc::new(MockStt::new()),
            tts: Arc::clone(&tts) as Arc<dyn TextToSpeech>,
            codec: Arc::new(PassthroughCodec),
            catalog: Arc::new(Catalog::builtin()),
            metrics,
            options: SessionOptions {
                default_directory: dir.to_path_buf(),
                ..Default::default()
            },
        };
        (deps, tts)
    }

    fn speak(text: &str) -> ClientEvent {
        ClientEvent::InputAudioAppend {
            event_id: None,
            audio: BASE64.encode(text.as_bytes()),
        }
    }

    fn switch(name: &str) -> ClientEvent {
        ClientEvent::SessionUpdate {
            event_id: None,
            session: SessionConfig {
                voice: Some(name.to_string()),
                ..Default::default()
            },
        }
    }

    async fn next_event(rx: &mut mpsc::Receiver<ServerEvent>) -> ServerEvent {
        tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("timed out waiting for a server event")
            .expect("event channel closed")
    }

    /// Collect events up to and including the first one matching `done`.
    async fn events_until(
        rx: &mut mpsc::Receiver<ServerEvent>,
        done: impl Fn(&ServerEvent) -> bool,
    ) -> Vec<ServerEvent> {
        let mut events = Vec::new();
        loop {
            let event = next_event(rx).await;
            let finished = done(&event);
            events.push(event);
            if finished {
                return events;
            }
        }
    }

    fn is_audio_done(event: &ServerEvent) -> bool {
        matches!(event, ServerEvent::ResponseAudioDone)
    }

    #[tokio::test]
    async fn opens_with_first_character_and_lists() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "beta.toml", &character("Beta", false));
        write(dir.path(), "alpha.toml", &character("Alpha", false));
        let (deps, _) = deps(dir.path(), MockProvider::new(vec![]), Arc::new(MetricsRecorder::new()));
        let (tx, mut rx) = mpsc::channel(64);

        let mut session = Session::open(deps, tx).await.unwrap();
        assert_eq!(session.active_character().await.as_deref(), Some("Alpha"));
        let history = session.history_snapshot().await.unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].role(), Role::System);

        session.handle(ClientEvent::CharactersList { event_id: None }).await;
        assert_matches!(
            next_event(&mut rx).await,
            ServerEvent::CharactersListed { character_count: 2, characters, .. } if characters[0].name == "Alpha"
        );
    }

    #[tokio::test]
    async fn configured_default_character_wins() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "alpha.toml", &character("Alpha", false));
        write(dir.path(), "beta.toml", &character("Beta", false));
        let (mut deps, _) = deps(dir.path(), MockProvider::new(vec![]), Arc::new(MetricsRecorder::new()));
        deps.options.default_character = Some("Beta".into());
        let (tx, _rx) = mpsc::channel(64);

        let session = Session::open(deps, tx).await.unwrap();
        assert_eq!(session.active_character().await.as_deref(), Some("Beta"));
    }

    #[tokio::test]
    async fn unknown_character_switch_keeps_current() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "alpha.toml", &character("Alpha", false));
        let metrics = Arc::new(MetricsRecorder::new());
        let (deps, _) = deps(dir.path(), MockProvider::new(vec![]), Arc::clone(&metrics));
        let (tx, mut rx) = mpsc::channel(64);

        let mut session = Session::open(deps, tx).await.unwrap();
        session.handle(switch("Nobody")).await;
        assert_matches!(
            next_event(&mut rx).await,
            ServerEvent::Error { error } if error.code.as_deref() == Some("character_not_found")
        );
        assert_eq!(session.active_character().await.as_deref(), Some("Alpha"));
        assert_eq!(
            metrics.counter_get("character_switch_errors_total", &[("reason", "character_not_found")]),
            1
        );
    }

    #[tokio::test]
    async fn reply_is_relayed_as_text_then_audio() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "alpha.toml", &character("Alpha", false));
        let provider = MockProvider::new(vec![MockResponse::stream_deltas(&["Hel", "lo the", "re."])]);
        let (deps, tts) = deps(dir.path(), provider, Arc::new(MetricsRecorder::new()));
        let (tx, mut rx) = mpsc::channel(64);

        let mut session = Session::open(deps, tx).await.unwrap();
        session.handle(speak("hi")).await;
        let events = events_until(&mut rx, is_audio_done).await;

        assert_matches!(events[0], ServerEvent::SpeechStarted);
        assert_matches!(&events[1], ServerEvent::TranscriptionDelta { delta, .. } if delta == "hi");
        assert_matches!(events[2], ServerEvent::SpeechStopped);
        assert_matches!(&events[3], ServerEvent::ResponseCreated { response } if response.voice == "voices/Alpha.wav");

        let deltas: Vec<&str> = events
            .iter()
            .filter_map(|e| match e {
                ServerEvent::ResponseTextDelta { delta } => Some(delta.as_str()),
                _ => None,
            })
            .collect();
        assert_eq!(deltas.concat(), "Hello there.");
        assert!(deltas.iter().all(|d| !d.trim().contains(' ')));
        assert!(events
            .iter()
            .any(|e| matches!(e, ServerEvent::ResponseTextDone { text } if text == "Hello there.")));

        let audio: Vec<String> = events
            .iter()
            .filter_map(|e| match e {
                ServerEvent::ResponseAudioDelta { delta } => Some(delta.clone()),
                _ => None,
            })
            .collect();
        assert_eq!(audio.len(), 2);
        let first = BASE64.decode(&audio[0]).unwrap();
        let pcm = PassthroughCodec.decode(&first).unwrap();
        assert_eq!(pcm_text(&pcm), "Hello");
        assert_eq!(tts.requests()[0].0, "voices/Alpha.wav");

        let history = session.history_snapshot().await.unwrap();
        assert_eq!(history.len(), 3);
        assert_eq!(history[1].content(), "hi");
        assert_eq!(history[2].content(), "Hello there.");
    }

    #[tokio::test]
    async fn tool_call_with_missing_field_adds_one_tool_message() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "teller.toml", &character("Teller", true));
        let provider = Arc::new(MockProvider::new(vec![
            MockResponse::tool_call("call_1", "log_story_event", "{}"),
            MockResponse::stream_text("Sorry, I lost track of the story."),
        ]));
        let (mut deps, _) = deps(dir.path(), MockProvider::new(vec![]), Arc::new(MetricsRecorder::new()));
        deps.provider = Arc::clone(&provider) as Arc<dyn ChatProvider>;
        let (tx, mut rx) = mpsc::channel(64);

        let mut session = Session::open(deps, tx).await.unwrap();
        session.handle(speak("what happens next")).await;
        let events = events_until(&mut rx, is_audio_done).await;
        assert!(events
            .iter()
            .any(|e| matches!(e, ServerEvent::ResponseTextDone { text } if text.starts_with("Sorry"))));

        let history = session.history_snapshot().await.unwrap();
        let tool_messages: Vec<&Message> = history.iter().filter(|m| m.role() == Role::Tool).collect();
        assert_eq!(tool_messages.len(), 1);
        assert!(tool_messages[0].content().starts_with("Error: "));
        assert!(tool_messages[0].content().contains("event"));
        assert!(history.iter().any(|m| m.has_tool_calls()));

        let requests = provider.requests();
        assert_eq!(requests.len(), 2);
        assert_eq!(requests[0].tools.len(), 1);
        assert!(requests[1].tools.is_empty());
        assert!(requests[1].messages.iter().any(|m| m.role() == Role::Tool));
    }

    #[tokio::test]
    async fn user_speech_interrupts_generation() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "alpha.toml", &character("Alpha", false));
        let words: Vec<String> = (0..200).map(|i| format!(" word{i}")).collect();
        let words: Vec<&str> = words.iter().map(String::as_str).collect();
        let provider = MockProvider::new(vec![
            MockResponse::paced_deltas(Duration::from_millis(20), &words),
            MockResponse::stream_text("Okay."),
        ]);
        let (deps, _) = deps(dir.path(), provider, Arc::new(MetricsRecorder::new()));
        let (tx, mut rx) = mpsc::channel(256);

        let mut session = Session::open(deps, tx).await.unwrap();
        session.handle(speak("tell me a story")).await;
        events_until(&mut rx, |e| matches!(e, ServerEvent::ResponseTextDelta { .. })).await;

        session.handle(speak("stop")).await;
        let events = events_until(&mut rx, is_audio_done).await;
        assert!(events.iter().any(|e| matches!(e, ServerEvent::InterruptedByVad)));
        assert!(events
            .iter()
            .any(|e| matches!(e, ServerEvent::ResponseTextDone { text } if text == "Okay.")));

        let history = session.history_snapshot().await.unwrap();
        let tail: Vec<(Role, &str)> = history[1..].iter().map(|m| (m.role(), m.content())).collect();
        assert_eq!(tail.len(), 4);
        assert_eq!(tail[0], (Role::User, "tell me a story"));
        assert_eq!(tail[1].0, Role::Assistant);
        assert!(tail[1].1.ends_with(INTERRUPTION_MARKER));
        assert!(tail[1].1.starts_with(" word0") || tail[1].1.starts_with("word0") || tail[1].1 == INTERRUPTION_MARKER);
        assert_eq!(tail[2], (Role::User, "stop"));
        assert_eq!(tail[3], (Role::Assistant, "Okay."));
    }

    #[tokio::test]
    async fn switch_waits_for_the_turn_in_flight() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "alpha.toml", &character("Alpha", false));
        write(dir.path(), "beta.toml", &character("Beta", false));
        let provider = MockProvider::new(vec![MockResponse::paced_deltas(
            Duration::from_millis(10),
            &["Once", " upon", " a", " time."],
        )]);
        let metrics = Arc::new(MetricsRecorder::new());
        let (deps, _) = deps(dir.path(), provider, Arc::clone(&metrics));
        let (tx, mut rx) = mpsc::channel(64);

        let mut session = Session::open(deps, tx).await.unwrap();
        session.handle(speak("a story please")).await;
        events_until(&mut rx, |e| matches!(e, ServerEvent::ResponseCreated { .. })).await;
        session.handle(switch("Beta")).await;

        let events = events_until(&mut rx, |e| matches!(e, ServerEvent::SessionUpdated { .. })).await;
        let audio_done = events.iter().position(is_audio_done).unwrap();
        assert_eq!(audio_done, events.len() - 2);

        assert_eq!(session.active_character().await.as_deref(), Some("Beta"));
        let beta = session.history_snapshot().await.unwrap();
        assert_eq!(beta.len(), 1);
        assert_eq!(metrics.counter_get("character_switches_total", &[]), 1);

        session.handle(switch("Alpha")).await;
        events_until(&mut rx, |e| matches!(e, ServerEvent::SessionUpdated { .. })).await;
        let alpha = session.history_snapshot().await.unwrap();
        assert_eq!(alpha.len(), 3);
        assert_eq!(alpha[2].content(), "Once upon a time.");
    }

    #[tokio::test]
    async fn conversation_state_tracks_the_turn() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "alpha.toml", &character("Alpha", false));
        let provider = MockProvider::new(vec![MockResponse::paced_deltas(
            Duration::from_millis(10),
            &["Good", " morning."],
        )]);
        let (deps, _) = deps(dir.path(), provider, Arc::new(MetricsRecorder::new()));
        let (tx, mut rx) = mpsc::channel(64);

        let mut session = Session::open(deps, tx).await.unwrap();
        assert_eq!(session.conversation_state(), ConversationState::WaitingForUser);

        session.handle(speak("hello")).await;
        assert_eq!(session.conversation_state(), ConversationState::AssistantSpeaking);
        events_until(&mut rx, |e| matches!(e, ServerEvent::ResponseTextDelta { .. })).await;
        assert_eq!(session.conversation_state(), ConversationState::AssistantSpeaking);

        events_until(&mut rx, is_audio_done).await;
        session.history_snapshot().await.unwrap();
        assert_eq!(session.conversation_state(), ConversationState::WaitingForUser);
    }

    #[tokio::test]
    async fn speech_interrupting_audio_marks_the_reply() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "alpha.toml", &character("Alpha", false));
        let words: Vec<String> = (0..64).map(|i| format!("w{i} ")).collect();
        let words: Vec<&str> = words.iter().map(String::as_str).collect();
        let provider = MockProvider::new(vec![
            MockResponse::stream_deltas(&words),
            MockResponse::stream_text("Sure."),
        ]);
        let (deps, _) = deps(dir.path(), provider, Arc::new(MetricsRecorder::new()));
        // A one-slot channel paces the audio relay to the test's reads.
        let (tx, mut rx) = mpsc::channel(1);
        let mut session = Session::open(deps, tx).await.unwrap();

        // Client events go through a driver task so that `handle` can wait on
        // the event channel while the test keeps reading.
        let (client_tx, mut client_rx) = mpsc::unbounded_channel();
        let driver = tokio::spawn(async move {
            while let Some(event) = client_rx.recv().await {
                session.handle(event).await;
            }
            session
        });

        client_tx.send(speak("count for me")).unwrap();
        events_until(&mut rx, |e| matches!(e, ServerEvent::ResponseAudioDelta { .. })).await;
        client_tx.send(speak("enough")).unwrap();
        let events = events_until(&mut rx, |e| {
            matches!(e, ServerEvent::ResponseTextDone { text } if text == "Sure.")
        })
        .await;
        assert!(events.iter().any(|e| matches!(e, ServerEvent::InterruptedByVad)));
        let first_audio_done = events.iter().position(is_audio_done);
        assert!(first_audio_done.is_none(), "interrupted audio should not complete");
        events_until(&mut rx, is_audio_done).await;

        drop(client_tx);
        let session = driver.await.unwrap();
        let history = session.history_snapshot().await.unwrap();
        assert_eq!(history.len(), 5);
        assert_eq!(history[2].role(), Role::Assistant);
        assert!(history[2].content().starts_with("w0 w1"));
        assert!(history[2].content().ends_with(INTERRUPTION_MARKER));
        assert_eq!(history[3].content(), "enough");
        assert_eq!(history[4].content(), "Sure.");
    }

    #[tokio::test]
    async fn llm_failure_is_reported_and_session_continues() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "alpha.toml", &character("Alpha", false));
        let provider = MockProvider::new(vec![
            MockResponse::Error(ProviderError::ServerError {
                status: 503,
                body: "overloaded".into(),
            }),
            MockResponse::stream_text("Back again."),
        ]);
        let metrics = Arc::new(MetricsRecorder::new());
        let (deps, _) = deps(dir.path(), provider, Arc::clone(&metrics));
        let (tx, mut rx) = mpsc::channel(64);

        let mut session = Session::open(deps, tx).await.unwrap();
        session.handle(speak("hello")).await;
        let events = events_until(&mut rx, |e| matches!(e, ServerEvent::Error { .. })).await;
        assert_matches!(
            events.last(),
            Some(ServerEvent::Error { error }) if error.code.as_deref() == Some("llm_error") && error.error_type == "server_error"
        );
        assert_eq!(metrics.counter_get("llm_errors_total", &[("kind", "server_error")]), 1);

        session.handle(speak("are you there")).await;
        let events = events_until(&mut rx, is_audio_done).await;
        assert!(events
            .iter()
            .any(|e| matches!(e, ServerEvent::ResponseTextDone { text } if text == "Back again.")));
    }

    #[tokio::test]
    async fn bad_audio_payload_is_an_invalid_request() {
        let dir = tempfile::tempdir().unwrap();
        let (deps, _) = deps(dir.path(), MockProvider::new(vec![]), Arc::new(MetricsRecorder::new()));
        let (tx, mut rx) = mpsc::channel(64);

        let mut session = Session::open(deps, tx).await.unwrap();
        session
            .handle(ClientEvent::InputAudioAppend {
                event_id: None,
                audio: "not base64!!".into(),
            })
            .await;
        assert_matches!(
            next_event(&mut rx).await,
            ServerEvent::Error { error } if error.error_type == "invalid_request_error"
        );
    }

    #[tokio::test]
    async fn speech_without_character_reports_error() {
        let dir = tempfile::tempdir().unwrap();
        let (deps, _) = deps(dir.path(), MockProvider::new(vec![]), Arc::new(MetricsRecorder::new()));
        let (tx, mut rx) = mpsc::channel(64);

        let mut session = Session::open(deps, tx).await.unwrap();
        session.handle(speak("anyone home")).await;
        let events = events_until(&mut rx, |e| matches!(e, ServerEvent::Error { .. })).await;
        assert_matches!(
            events.last(),
            Some(ServerEvent::Error { error }) if error.code.as_deref() == Some("character_not_found")
        );
    }

    #[tokio::test]
    async fn reload_reports_each_failure_code() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "alpha.toml", &character("Alpha", false));
        let empty = tempfile::tempdir().unwrap();
        let (deps, _) = deps(dir.path(), MockProvider::new(vec![]), Arc::new(MetricsRecorder::new()));
        let (tx, mut rx) = mpsc::channel(64);
        let mut session = Session::open(deps, tx).await.unwrap();

        let reload = |directory: &str| ClientEvent::CharactersReload {
            event_id: None,
            directory: directory.to_string(),
        };

        session.handle(reload("/definitely/not/here")).await;
        assert_matches!(
            next_event(&mut rx).await,
            ServerEvent::Error { error } if error.code.as_deref() == Some("invalid_directory")
        );
        assert_eq!(session.active_character().await.as_deref(), Some("Alpha"));

        session.handle(reload(empty.path().to_str().unwrap())).await;
        assert_matches!(
            next_event(&mut rx).await,
            ServerEvent::Error { error } if error.code.as_deref() == Some("no_valid_characters")
        );
        assert_eq!(session.active_character().await, None);

        session.handle(reload(DEFAULT_DIRECTORY_MARKER)).await;
        assert_matches!(
            next_event(&mut rx).await,
            ServerEvent::CharactersReloaded { loaded_count: 1, error_count: 0, total_files: 1, .. }
        );
    }

    #[tokio::test]
    async fn reload_keeps_active_character_when_still_present() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "alpha.toml", &character("Alpha", false));
        let other = tempfile::tempdir().unwrap();
        write(other.path(), "alpha.toml", &character("Alpha", false));
        write(other.path(), "broken.toml", "name = ");
        let (deps, _) = deps(dir.path(), MockProvider::new(vec![]), Arc::new(MetricsRecorder::new()));
        let (tx, mut rx) = mpsc::channel(64);
        let mut session = Session::open(deps, tx).await.unwrap();

        session
            .handle(ClientEvent::CharactersReload {
                event_id: None,
                directory: other.path().display().to_string(),
            })
            .await;
        assert_matches!(
            next_event(&mut rx).await,
            ServerEvent::CharactersReloaded { loaded_count: 1, error_count: 1, total_files: 2, .. }
        );
        assert_eq!(session.active_character().await.as_deref(), Some("Alpha"));

        session.handle(ClientEvent::CharactersList { event_id: None }).await;
        assert_matches!(
            next_event(&mut rx).await,
            ServerEvent::CharactersListed { directory, .. } if directory == other.path().display().to_string()
        );
    }

    #[tokio::test]
    async fn newer_reload_discards_the_one_in_flight() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "alpha.toml", &character("Alpha", false));
        let older = tempfile::tempdir().unwrap();
        write(older.path(), "gamma.toml", &character("Gamma", false));
        let newer = tempfile::tempdir().unwrap();
        write(newer.path(), "delta.toml", &character("Delta", false));
        let provider = MockProvider::new(vec![MockResponse::paced_deltas(
            Duration::from_millis(20),
            &["One", " moment", " please."],
        )]);
        let (deps, _) = deps(dir.path(), provider, Arc::new(MetricsRecorder::new()));
        let (tx, mut rx) = mpsc::channel(64);
        let mut session = Session::open(deps, tx).await.unwrap();

        // The turn holds the lock, so the first reload is still waiting when
        // the second one arrives.
        session.handle(speak("hold on")).await;
        events_until(&mut rx, |e| matches!(e, ServerEvent::ResponseCreated { .. })).await;
        for directory in [older.path(), newer.path()] {
            session
                .handle(ClientEvent::CharactersReload {
                    event_id: None,
                    directory: directory.display().to_string(),
                })
                .await;
        }

        let events = events_until(&mut rx, |e| matches!(e, ServerEvent::CharactersReloaded { .. })).await;
        assert_matches!(
            events.last(),
            Some(ServerEvent::CharactersReloaded { directory, characters, .. })
                if *directory == newer.path().display().to_string() && characters[0].name == "Delta"
        );
        let stray = tokio::time::timeout(Duration::from_millis(200), rx.recv()).await;
        assert!(stray.is_err(), "unexpected event after reload: {stray:?}");

        session.handle(switch("Gamma")).await;
        assert_matches!(
            next_event(&mut rx).await,
            ServerEvent::Error { error } if error.code.as_deref() == Some("character_not_found")
        );
    }

    #[tokio::test]
    async fn close_purges_state() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "alpha.toml", &character("Alpha", false));
        write(dir.path(), "beta.toml", &character("Beta", false));
        let metrics = Arc::new(MetricsRecorder::new());
        let (deps, _) = deps(dir.path(), MockProvider::new(vec![]), Arc::clone(&metrics));
        let (tx, mut rx) = mpsc::channel(64);

        let mut session = Session::open(deps, tx).await.unwrap();
        assert_eq!(metrics.gauge_get("active_sessions", &[]), 1.0);
        session.handle(switch("Beta")).await;
        next_event(&mut rx).await;

        let purge = session.close().await;
        assert_eq!(purge, SessionPurge { histories: 2, units: 2 });
        assert_eq!(metrics.gauge_get("active_sessions", &[]), 0.0);
        assert_eq!(metrics.histogram_summary("session_duration_seconds", &[]).count, 1);
    }

    #[test]
    fn error_codes_and_events() {
        let err = SessionError::NoValidCharacters {
            directory: PathBuf::from("/chars"),
            errors: Vec::new(),
        };
        assert_eq!(err.code(), "no_valid_characters");
        assert_matches!(
            err.to_event(),
            ServerEvent::Error { error } if error.details.is_some() && error.error_type == "server_error"
        );
        assert_eq!(SessionError::Tts(CollaboratorError::Failed("x".into())).code(), "tts_error");
        assert!(!SessionError::Stt(CollaboratorError::Closed("gone".into())).is_recoverable());
    }
}
