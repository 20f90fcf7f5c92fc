//! ElevenLabs streaming synthesis backend.

use async_trait::async_trait;
use bytes::Bytes;
use tokio_stream::StreamExt;
use tracing::debug;

use voxrelay_core::config::StageConfig;
use voxrelay_core::protocol::StageKind;
use voxrelay_media::pcm;

use crate::link::{StageBackend, StreamIo};
use crate::speech::{SpeechState, Step};
use crate::{SynthesisEvent, SynthesisInput, VoiceParams};

const ELEVENLABS_BASE_URL: &str = "https://api.elevenlabs.io";
const DEFAULT_VOICE: &str = "Rachel";
const DEFAULT_MODEL: &str = "eleven_turbo_v2";

/// PCM output rates the API can stream.
const PCM_RATES: [u32; 4] = [16000, 22050, 24000, 44100];

/// The supported output rate closest to `wanted`.
pub fn nearest_rate(wanted: u32) -> u32 {
    PCM_RATES
        .iter()
        .copied()
        .min_by_key(|rate| rate.abs_diff(wanted))
        .unwrap_or(16000)
}

/// Build the streaming request URL for a voice.
pub fn build_tts_url(base_url: &str, voice: &str, rate: u32) -> String {
    format!("{base_url}/v1/text-to-speech/{voice}/stream?output_format=pcm_{rate}")
}

/// Split a body chunk into whole samples, carrying a trailing odd byte over
/// to the next chunk.
fn take_samples(carry: &mut Option<u8>, chunk: &[u8]) -> Vec<i16> {
    let mut bytes = Vec::with_capacity(chunk.len() + 1);
    bytes.extend(carry.take());
    bytes.extend_from_slice(chunk);
    if bytes.len() % 2 == 1 {
        *carry = bytes.pop();
    }
    pcm::bytes_to_samples(&bytes)
}

pub struct ElevenLabsSynthesizer {
    base_url: String,
    api_key: String,
    voice: String,
    model: String,
    client: reqwest::Client,
}

impl ElevenLabsSynthesizer {
    pub fn new(config: &StageConfig) -> anyhow::Result<Self> {
        let api_key = config
            .resolve_api_key()
            .ok_or_else(|| anyhow::anyhow!("No TTS API key configured"))?;
        Ok(Self {
            base_url: config
                .base_url
                .as_deref()
                .unwrap_or(ELEVENLABS_BASE_URL)
                .trim_end_matches('/')
                .to_string(),
            api_key,
            voice: config.voice.clone().unwrap_or_else(|| DEFAULT_VOICE.into()),
            model: config.model.clone().unwrap_or_else(|| DEFAULT_MODEL.into()),
            client: reqwest::Client::new(),
        })
    }

    async fn open_stream(&self, text: &str, voice: &str, rate: u32) -> anyhow::Result<reqwest::Response> {
        debug!(voice, model = %self.model, rate, text_len = text.len(), "Starting TTS stream");

        let resp = self
            .client
            .post(build_tts_url(&self.base_url, voice, rate))
            .header("xi-api-key", &self.api_key)
            .header("Content-Type", "application/json")
            .json(&serde_json::json!({
                "text": text,
                "model_id": self.model,
            }))
            .send()
            .await?;

        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            anyhow::bail!("TTS API error {status}: {body}");
        }
        Ok(resp)
    }

    /// Stream one utterance's text. `Ok(false)` once the router is gone.
    async fn speak(
        &self,
        io: &mut StreamIo<'_, SynthesisInput, SynthesisEvent>,
        state: &mut SpeechState,
        utterance: u64,
        text: &str,
        voice: &VoiceParams,
    ) -> anyhow::Result<bool> {
        let rate = nearest_rate(voice.sample_rate);
        let voice_id = voice.voice.as_deref().unwrap_or(&self.voice);

        let request = self.open_stream(text, voice_id, rate);
        tokio::pin!(request);
        let response = loop {
            tokio::select! {
                response = &mut request => break response?,
                interrupt = io.recv_interrupt() => {
                    let Some(item) = interrupt else {
                        return Ok(false);
                    };
                    match state.interrupt(io, item, utterance).await {
                        Step::Continue => {}
                        Step::Stop => return Ok(true),
                        Step::Gone => return Ok(false),
                    }
                }
            }
        };

        let mut body = response.bytes_stream();
        let mut carry = None;
        loop {
            match state.poll_interrupts(io, utterance).await {
                Step::Continue => {}
                Step::Stop => return Ok(true),
                Step::Gone => return Ok(false),
            }
            tokio::select! {
                chunk = body.next() => match chunk {
                    Some(Ok(chunk)) => {
                        let mut samples = take_samples(&mut carry, &chunk);
                        if rate != voice.sample_rate {
                            samples = pcm::resample_linear(&samples, rate, voice.sample_rate);
                        }
                        if samples.is_empty() {
                            continue;
                        }
                        let payload = Bytes::from(pcm::samples_to_bytes(&samples));
                        if !io.emit(SynthesisEvent::Audio { utterance, payload }).await {
                            return Ok(false);
                        }
                    }
                    Some(Err(e)) => anyhow::bail!("TTS stream error: {e}"),
                    None => return Ok(true),
                },
                interrupt = io.recv_interrupt() => {
                    let Some(item) = interrupt else {
                        return Ok(false);
                    };
                    match state.interrupt(io, item, utterance).await {
                        Step::Continue => {}
                        Step::Stop => return Ok(true),
                        Step::Gone => return Ok(false),
                    }
                }
            }
        }
    }
}

#[async_trait]
impl StageBackend<SynthesisInput, SynthesisEvent> for ElevenLabsSynthesizer {
    fn kind(&self) -> StageKind {
        StageKind::Synthesis
    }

    fn id(&self) -> &str {
        "elevenlabs"
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
                    self.speak(io, &mut state, utterance, &text, &voice).await?
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
