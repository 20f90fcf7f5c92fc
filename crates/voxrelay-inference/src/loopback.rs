//! Self-contained backends for running the engine without external services.
//!
//! The recognizer reveals a fixed script one word per ten audio frames, the
//! reasoner echoes its prompt back token by token, and the synthesizer renders
//! each word as a short tone.

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;

use voxrelay_core::protocol::StageKind;
use voxrelay_media::pcm;

use crate::link::{StageBackend, StreamIo};
use crate::speech::{SpeechState, Step};
use crate::{
    ReasoningEvent, ReasoningInput, RecognitionEvent, RecognitionInput, SynthesisEvent,
    SynthesisInput, VoiceParams,
};

pub const DEFAULT_SCRIPT: &str = "hello voice relay how are you today";

const FRAMES_PER_WORD: usize = 10;
const WORD_MS: u32 = 240;
const CHUNK_MS: u32 = 100;
const TONE_AMPLITUDE: i16 = 6000;

// --- Recognition ---

pub struct LoopbackRecognizer {
    words: Vec<String>,
}

impl LoopbackRecognizer {
    pub fn new(script: &str) -> Self {
        Self {
            words: script.split_whitespace().map(str::to_string).collect(),
        }
    }

    /// Partials stay below the default early-gating threshold.
    fn confidence(revealed: usize) -> f32 {
        (0.4 + 0.05 * revealed as f32).min(0.75)
    }
}

impl Default for LoopbackRecognizer {
    fn default() -> Self {
        Self::new(DEFAULT_SCRIPT)
    }
}

#[async_trait]
impl StageBackend<RecognitionInput, RecognitionEvent> for LoopbackRecognizer {
    fn kind(&self) -> StageKind {
        StageKind::Recognition
    }

    fn id(&self) -> &str {
        "loopback"
    }

    async fn run(
        &self,
        io: &mut StreamIo<'_, RecognitionInput, RecognitionEvent>,
    ) -> anyhow::Result<()> {
        let mut frames = 0usize;
        let mut revealed = 0usize;

        while let Some(item) = io.recv().await {
            let delivered = match item {
                RecognitionInput::Audio(_) => {
                    frames += 1;
                    if frames % FRAMES_PER_WORD == 0 && revealed < self.words.len() {
                        revealed += 1;
                        io.emit(RecognitionEvent::Partial {
                            text: self.words[..revealed].join(" "),
                            confidence: Self::confidence(revealed),
                        })
                        .await
                    } else {
                        true
                    }
                }
                RecognitionInput::EndOfUtterance => {
                    let text = if frames == 0 {
                        String::new()
                    } else {
                        self.words.join(" ")
                    };
                    frames = 0;
                    revealed = 0;
                    io.emit(RecognitionEvent::Final { text }).await
                }
                RecognitionInput::Cancel => {
                    frames = 0;
                    revealed = 0;
                    true
                }
            };
            if !delivered {
                break;
            }
            io.complete();
        }
        Ok(())
    }
}

// --- Reasoning ---

pub struct EchoReasoner {
    token_delay: Duration,
}

impl EchoReasoner {
    pub fn new(token_delay: Duration) -> Self {
        Self { token_delay }
    }

    fn tokens(prompt: &str) -> Vec<String> {
        let reply = format!("You said: {}.", prompt.trim().trim_end_matches('.'));
        reply
            .split_whitespace()
            .enumerate()
            .map(|(i, word)| if i == 0 { word.to_string() } else { format!(" {word}") })
            .collect()
    }

    /// Stream one reply. Returns `false` once the router is gone.
    async fn respond(
        &self,
        io: &mut StreamIo<'_, ReasoningInput, ReasoningEvent>,
        turn: u64,
        prompt: &str,
    ) -> bool {
        for token in Self::tokens(prompt) {
            while let Some(next) = io.try_recv_interrupt() {
                match next {
                    ReasoningInput::Cancel { turn: cancelled } => {
                        if !io.emit(ReasoningEvent::Cancelled { turn: cancelled }).await {
                            return false;
                        }
                        if cancelled == turn {
                            return true;
                        }
                    }
                    prompt @ ReasoningInput::Prompt { .. } => io.defer(prompt),
                }
            }
            if !io.emit(ReasoningEvent::Token { turn, text: token }).await {
                return false;
            }
            tokio::time::sleep(self.token_delay).await;
        }
        io.emit(ReasoningEvent::EndOfTurn { turn }).await
    }
}

impl Default for EchoReasoner {
    fn default() -> Self {
        Self::new(Duration::from_millis(15))
    }
}

#[async_trait]
impl StageBackend<ReasoningInput, ReasoningEvent> for EchoReasoner {
    fn kind(&self) -> StageKind {
        StageKind::Reasoning
    }

    fn id(&self) -> &str {
        "loopback"
    }

    async fn run(&self, io: &mut StreamIo<'_, ReasoningInput, ReasoningEvent>) -> anyhow::Result<()> {
        while let Some(item) = io.recv().await {
            let delivered = match item {
                ReasoningInput::Prompt { turn, text } => self.respond(io, turn, &text).await,
                ReasoningInput::Cancel { turn } => io.emit(ReasoningEvent::Cancelled { turn }).await,
            };
            if !delivered {
                break;
            }
            io.complete();
        }
        Ok(())
    }
}

// --- Synthesis ---

/// Renders text as a tone, `WORD_MS` per word, streamed in `CHUNK_MS` chunks.
pub struct ToneSynthesizer {
    /// Wall-clock time spent per chunk, as a fraction of its duration.
    pace: f32,
}

impl ToneSynthesizer {
    pub fn new(pace: f32) -> Self {
        Self {
            pace: pace.max(0.0),
        }
    }

    fn render(utterance: u64, text: &str, voice: &VoiceParams) -> Vec<i16> {
        let words = text.split_whitespace().count().max(1);
        let samples = voice.sample_rate as usize * WORD_MS as usize * words / 1000;
        let freq = 220.0 + 40.0 * (utterance % 8) as f32;
        pcm::tone(freq, voice.sample_rate, samples, TONE_AMPLITUDE)
    }

    async fn speak(
        &self,
        io: &mut StreamIo<'_, SynthesisInput, SynthesisEvent>,
        state: &mut SpeechState,
        utterance: u64,
        text: &str,
        voice: &VoiceParams,
    ) -> bool {
        let samples = Self::render(utterance, text, voice);
        let chunk = (voice.sample_rate as usize * CHUNK_MS as usize / 1000).max(1);
        let pace = Duration::from_millis(CHUNK_MS as u64).mul_f32(self.pace);

        for piece in samples.chunks(chunk) {
            match state.poll_interrupts(io, utterance).await {
                Step::Continue => {}
                Step::Stop => return true,
                Step::Gone => return false,
            }
            let payload = Bytes::from(pcm::samples_to_bytes(piece));
            if !io.emit(SynthesisEvent::Audio { utterance, payload }).await {
                return false;
            }
            if !pace.is_zero() {
                tokio::time::sleep(pace).await;
            }
        }
        true
    }
}

impl Default for ToneSynthesizer {
    fn default() -> Self {
        Self::new(0.25)
    }
}

#[async_trait]
impl StageBackend<SynthesisInput, SynthesisEvent> for ToneSynthesizer {
    fn kind(&self) -> StageKind {
        StageKind::Synthesis
    }

    fn id(&self) -> &str {
        "loopback"
    }

    async fn run(&self, io: &mut StreamIo<'_, SynthesisInput, SynthesisEvent>) -> anyhow::Result<()> {
        let mut state = SpeechState::default();

        while let Some(item) = io.recv().await {
            let delivered = match item {
                SynthesisInput::Speak {
                    utterance,
                    text,
                    voice,
                } if !state.is_cancelled(utterance) => {
                    self.speak(io, &mut state, utterance, &text, &voice).await
                }
                other => state.handle(io, other).await,
            };
            if !delivered {
                break;
            }
            io.complete();
        }
        Ok(())
    }
}
