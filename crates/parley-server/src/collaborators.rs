//! Speech and codec collaborator interfaces, plus the in-process stand-ins
//! used by tests and by the binary until real services are wired in.
//!
//! The stand-ins speak unsigned 8-bit PCM whose samples carry UTF-8 text, so
//! a client can drive a full session by base64-encoding what it "says".

use async_trait::async_trait;
use parking_lot::Mutex;

use parley_core::errors::CollaboratorError;

/// Sample rate the stand-ins assume when reporting transcript offsets.
pub const SAMPLE_RATE: u32 = 24_000;

#[derive(Clone, Debug, PartialEq)]
pub enum SttEvent {
    SpeechStarted,
    /// A transcript fragment and its offset in seconds from the stream start.
    Transcript { delta: String, start_time: f64 },
    /// The current utterance is final.
    EndOfUtterance,
}

/// One streaming recognition session.
#[async_trait]
pub trait SpeechToText: Send + Sync {
    async fn push_audio(&mut self, pcm: &[f32]) -> Result<Vec<SttEvent>, CollaboratorError>;
}

pub trait SpeechToTextProvider: Send + Sync {
    fn open_stream(&self) -> Result<Box<dyn SpeechToText>, CollaboratorError>;
}

#[async_trait]
pub trait TextToSpeech: Send + Sync {
    /// Synthesize `text` in `voice`, returning PCM chunks in playback order.
    async fn synthesize(&self, voice: &str, text: &str) -> Result<Vec<Vec<f32>>, CollaboratorError>;
}

/// Blocking audio framing. Called from `spawn_blocking`.
pub trait AudioCodec: Send + Sync {
    fn decode(&self, bytes: &[u8]) -> Result<Vec<f32>, CollaboratorError>;
    fn encode(&self, pcm: &[f32]) -> Result<Vec<u8>, CollaboratorError>;
}

fn byte_to_sample(b: u8) -> f32 {
    (f32::from(b) - 128.0) / 128.0
}

fn sample_to_byte(s: f32) -> u8 {
    (s.clamp(-1.0, 1.0) * 128.0 + 128.0).round().clamp(0.0, 255.0) as u8
}

fn text_to_pcm(text: &str) -> Vec<f32> {
    text.bytes().map(byte_to_sample).collect()
}

fn pcm_to_text(pcm: &[f32]) -> String {
    let bytes: Vec<u8> = pcm.iter().copied().map(sample_to_byte).collect();
    String::from_utf8_lossy(&bytes).into_owned()
}

/// Unsigned 8-bit PCM.
#[derive(Clone, Copy, Debug, Default)]
pub struct PassthroughCodec;

impl AudioCodec for PassthroughCodec {
    fn decode(&self, bytes: &[u8]) -> Result<Vec<f32>, CollaboratorError> {
        Ok(bytes.iter().copied().map(byte_to_sample).collect())
    }

    fn encode(&self, pcm: &[f32]) -> Result<Vec<u8>, CollaboratorError> {
        if pcm.iter().any(|s| !s.is_finite()) {
            return Err(CollaboratorError::InvalidInput("non-finite sample".into()));
        }
        Ok(pcm.iter().copied().map(sample_to_byte).collect())
    }
}

/// Recognizer that reads each pushed buffer back as text and treats it as one
/// complete utterance. Blank buffers produce no events.
#[derive(Debug, Default)]
pub struct MockStt {
    fail_with: Option<CollaboratorError>,
}

impl MockStt {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every stream fails every push with `error`.
    pub fn failing(error: CollaboratorError) -> Self {
        Self { fail_with: Some(error) }
    }
}

impl SpeechToTextProvider for MockStt {
    fn open_stream(&self) -> Result<Box<dyn SpeechToText>, CollaboratorError> {
        Ok(Box::new(MockSttStream {
            samples_seen: 0,
            fail_with: self.fail_with.clone(),
        }))
    }
}

struct MockSttStream {
    samples_seen: u64,
    fail_with: Option<CollaboratorError>,
}

#[async_trait]
impl SpeechToText for MockSttStream {
    async fn push_audio(&mut self, pcm: &[f32]) -> Result<Vec<SttEvent>, CollaboratorError> {
        if let Some(e) = &self.fail_with {
            return Err(e.clone());
        }
        let start_time = self.samples_seen as f64 / f64::from(SAMPLE_RATE);
        self.samples_seen += pcm.len() as u64;

        let text = pcm_to_text(pcm);
        if text.trim().is_empty() {
            return Ok(Vec::new());
        }
        Ok(vec![
            SttEvent::SpeechStarted,
            SttEvent::Transcript {
                delta: text.trim().to_string(),
                start_time,
            },
            SttEvent::EndOfUtterance,
        ])
    }
}

/// Synthesizer producing one chunk per word, each chunk the word's text as PCM.
/// Records every request.
#[derive(Debug, Default)]
pub struct MockTts {
    requests: Mutex<Vec<(String, String)>>,
    fail_with: Option<CollaboratorError>,
}

impl MockTts {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing(error: CollaboratorError) -> Self {
        Self {
            requests: Mutex::new(Vec::new()),
            fail_with: Some(error),
        }
    }

    /// `(voice, text)` pairs in call order.
    pub fn requests(&self) -> Vec<(String, String)> {
        self.requests.lock().clone()
    }
}

#[async_trait]
impl TextToSpeech for MockTts {
    async fn synthesize(&self, voice: &str, text: &str) -> Result<Vec<Vec<f32>>, CollaboratorError> {
        self.requests.lock().push((voice.to_string(), text.to_string()));
        if let Some(e) = &self.fail_with {
            return Err(e.clone());
        }
        Ok(text.split_whitespace().map(text_to_pcm).collect())
    }
}

/// Decode synthesized chunks back into text. Test helper for the stand-ins.
pub fn pcm_text(pcm: &[f32]) -> String {
    pcm_to_text(pcm)
}
