//! Whisper-compatible transcription backend (OpenAI, Groq).
//!
//! Whisper is a batch API: audio is buffered per utterance and uploaded as a
//! WAV file on `EndOfUtterance`, so this backend produces finals only.

use async_trait::async_trait;
use tracing::{debug, warn};

use voxrelay_core::config::StageConfig;
use voxrelay_core::frame::Codec;
use voxrelay_core::protocol::StageKind;
use voxrelay_media::pcm;

use crate::link::{StageBackend, StreamIo};
use crate::{RecognitionEvent, RecognitionInput};

const OPENAI_URL: &str = "https://api.openai.com/v1/audio/transcriptions";
const GROQ_URL: &str = "https://api.groq.com/openai/v1/audio/transcriptions";
const DEFAULT_MODEL: &str = "whisper-large-v3-turbo";
const MAX_UTTERANCE_SECS: usize = 30;

/// Transcription endpoint for a provider, honoring a `base_url` override.
pub fn provider_url(config: &StageConfig) -> String {
    if let Some(base) = &config.base_url {
        return format!("{}/v1/audio/transcriptions", base.trim_end_matches('/'));
    }
    match config.provider.as_str() {
        "openai" => OPENAI_URL.to_string(),
        _ => GROQ_URL.to_string(),
    }
}

pub struct WhisperRecognizer {
    url: String,
    provider_id: String,
    api_key: String,
    model: String,
    sample_rate: u32,
    client: reqwest::Client,
}

impl WhisperRecognizer {
    pub fn new(config: &StageConfig, sample_rate: u32) -> anyhow::Result<Self> {
        let api_key = config
            .resolve_api_key()
            .ok_or_else(|| anyhow::anyhow!("No transcription API key configured"))?;
        Ok(Self {
            url: provider_url(config),
            provider_id: config.provider.clone(),
            api_key,
            model: config.model.clone().unwrap_or_else(|| DEFAULT_MODEL.into()),
            sample_rate,
            client: reqwest::Client::new(),
        })
    }

    fn max_samples(&self) -> usize {
        self.sample_rate as usize * MAX_UTTERANCE_SECS
    }

    async fn transcribe(&self, samples: &[i16]) -> anyhow::Result<String> {
        let wav_data = pcm::pcm_to_wav(samples, self.sample_rate, 1, 16);
        debug!(url = %self.url, model = %self.model, wav_bytes = wav_data.len(), "Sending audio for transcription");

        let part = reqwest::multipart::Part::bytes(wav_data)
            .file_name("audio.wav")
            .mime_str("audio/wav")?;

        let form = reqwest::multipart::Form::new()
            .text("model", self.model.clone())
            .text("response_format", "text")
            .part("file", part);

        let resp = self
            .client
            .post(&self.url)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .multipart(form)
            .send()
            .await?;

        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            anyhow::bail!("Transcription API error {status}: {body}");
        }

        Ok(resp.text().await?.trim().to_string())
    }
}

#[async_trait]
impl StageBackend<RecognitionInput, RecognitionEvent> for WhisperRecognizer {
    fn kind(&self) -> StageKind {
        StageKind::Recognition
    }

    fn id(&self) -> &str {
        &self.provider_id
    }

    async fn run(
        &self,
        io: &mut StreamIo<'_, RecognitionInput, RecognitionEvent>,
    ) -> anyhow::Result<()> {
        let mut samples: Vec<i16> = Vec::new();
        let mut truncated = false;

        while let Some(item) = io.recv().await {
            let delivered = match item {
                RecognitionInput::Audio(frame) => {
                    if frame.codec() == Codec::Opus {
                        anyhow::bail!("{} transcription needs pcm16 audio, got opus", self.provider_id);
                    }
                    let room = self.max_samples().saturating_sub(samples.len());
                    let incoming = pcm::bytes_to_samples(frame.payload());
                    if incoming.len() > room && !truncated {
                        warn!(secs = MAX_UTTERANCE_SECS, "Utterance too long, truncating");
                        truncated = true;
                    }
                    samples.extend(incoming.into_iter().take(room));
                    true
                }
                RecognitionInput::EndOfUtterance => {
                    let text = if samples.is_empty() {
                        String::new()
                    } else {
                        self.transcribe(&samples).await?
                    };
                    samples.clear();
                    truncated = false;
                    io.emit(RecognitionEvent::Final { text }).await
                }
                RecognitionInput::Cancel => {
                    samples.clear();
                    truncated = false;
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

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    use bytes::Bytes;
    use tokio_util::sync::CancellationToken;
    use voxrelay_core::frame::{AudioFrame, FrameFlags};

    use crate::link::{LinkEvent, StageHandle};
    use crate::retry::RetryPolicy;
    use crate::testing::serve_once;

    fn stage(provider: &str) -> StageConfig {
        StageConfig {
            provider: provider.into(),
            api_key: Some("key".into()),
            ..Default::default()
        }
    }

    fn frame(seq: u16, codec: Codec) -> AudioFrame {
        AudioFrame::new(
            1,
            seq as u64 * 20_000_000,
            seq,
            codec,
            FrameFlags::new(false, true),
            Bytes::from(vec![1u8; 640]),
        )
        .unwrap()
    }

    #[test]
    fn test_provider_url_selection() {
        assert_eq!(provider_url(&stage("openai")), OPENAI_URL);
        assert_eq!(provider_url(&stage("groq")), GROQ_URL);

        let mut custom = stage("openai");
        custom.base_url = Some("http://localhost:9000/".into());
        assert_eq!(provider_url(&custom), "http://localhost:9000/v1/audio/transcriptions");
    }

    #[test]
    fn test_missing_key_rejected() {
        let config = StageConfig {
            provider: "groq".into(),
            ..Default::default()
        };
        assert!(WhisperRecognizer::new(&config, 16000).is_err());
    }

    #[tokio::test]
    async fn test_uploads_wav_and_returns_final() {
        let (base, request) = serve_once("text/plain", b"book a table\n".to_vec()).await;
        let mut config = stage("openai");
        config.base_url = Some(base);

        let root = CancellationToken::new();
        let mut link: StageHandle<RecognitionInput, RecognitionEvent> = StageHandle::spawn(
            Arc::new(WhisperRecognizer::new(&config, 16000).unwrap()),
            16,
            RetryPolicy::default(),
            &root,
        );
        for seq in 0..5 {
            link.try_send(RecognitionInput::Audio(frame(seq, Codec::Pcm16))).unwrap();
        }
        link.try_send(RecognitionInput::EndOfUtterance).unwrap();

        match link.recv().await {
            Some(LinkEvent::Event(RecognitionEvent::Final { text })) => {
                assert_eq!(text, "book a table")
            }
            other => panic!("unexpected {other:?}"),
        }

        let raw = request.await.unwrap();
        let raw = String::from_utf8_lossy(&raw);
        assert!(raw.contains("authorization: Bearer key") || raw.contains("Authorization: Bearer key"));
        assert!(raw.contains("whisper-large-v3-turbo"));
        assert!(raw.contains("RIFF"));
    }

    #[tokio::test]
    async fn test_empty_utterance_skips_upload() {
        let root = CancellationToken::new();
        let mut link: StageHandle<RecognitionInput, RecognitionEvent> = StageHandle::spawn(
            Arc::new(WhisperRecognizer::new(&stage("groq"), 16000).unwrap()),
            4,
            RetryPolicy::default(),
            &root,
        );
        link.try_send(RecognitionInput::EndOfUtterance).unwrap();
        assert_eq!(
            link.recv().await,
            Some(LinkEvent::Event(RecognitionEvent::Final { text: String::new() }))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_opus_audio_degrades_link() {
        let root = CancellationToken::new();
        let policy = RetryPolicy {
            max_attempts: 1,
            initial_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(100),
            jitter_factor: 0.0,
        };
        let mut link: StageHandle<RecognitionInput, RecognitionEvent> = StageHandle::spawn(
            Arc::new(WhisperRecognizer::new(&stage("groq"), 48000).unwrap()),
            4,
            policy,
            &root,
        );
        link.try_send(RecognitionInput::Audio(frame(0, Codec::Opus))).unwrap();
        assert!(matches!(link.recv().await, Some(LinkEvent::Degraded { .. })));
    }
}
