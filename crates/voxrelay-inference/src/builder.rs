//! Builds the backends a session uses from configuration.

use std::sync::Arc;

use tracing::info;

use voxrelay_core::config::InferenceConfig;
use voxrelay_core::session::MediaParams;

use crate::elevenlabs::ElevenLabsSynthesizer;
use crate::link::StageBackend;
use crate::loopback::{EchoReasoner, LoopbackRecognizer, ToneSynthesizer};
use crate::openai::{ApiStyle, OpenAiReasoner};
use crate::whisper::WhisperRecognizer;
use crate::{
    ReasoningEvent, ReasoningInput, RecognitionEvent, RecognitionInput, SynthesisEvent,
    SynthesisInput,
};

/// One backend per stage, fresh for each session.
pub struct StageBackends {
    pub recognition: Arc<dyn StageBackend<RecognitionInput, RecognitionEvent>>,
    pub reasoning: Arc<dyn StageBackend<ReasoningInput, ReasoningEvent>>,
    pub synthesis: Arc<dyn StageBackend<SynthesisInput, SynthesisEvent>>,
}

pub fn build_backends(config: &InferenceConfig, params: &MediaParams) -> anyhow::Result<StageBackends> {
    let recognition: Arc<dyn StageBackend<RecognitionInput, RecognitionEvent>> =
        match config.recognition.provider.as_str() {
            "loopback" => Arc::new(LoopbackRecognizer::default()),
            "openai" | "groq" => Arc::new(WhisperRecognizer::new(
                &config.recognition,
                params.sample_rate,
            )?),
            other => anyhow::bail!("unknown recognition provider: {other}"),
        };

    let reasoning: Arc<dyn StageBackend<ReasoningInput, ReasoningEvent>> =
        match config.reasoning.provider.as_str() {
            "loopback" => Arc::new(EchoReasoner::default()),
            other => {
                let style = ApiStyle::from_provider(other)
                    .ok_or_else(|| anyhow::anyhow!("unknown reasoning provider: {other}"))?;
                Arc::new(OpenAiReasoner::new(
                    style,
                    &config.reasoning,
                    config.system_prompt.as_deref(),
                )?)
            }
        };

    let synthesis: Arc<dyn StageBackend<SynthesisInput, SynthesisEvent>> =
        match config.synthesis.provider.as_str() {
            "loopback" => Arc::new(ToneSynthesizer::default()),
            "elevenlabs" => Arc::new(ElevenLabsSynthesizer::new(&config.synthesis)?),
            other => anyhow::bail!("unknown synthesis provider: {other}"),
        };

    info!(
        recognition = recognition.id(),
        reasoning = reasoning.id(),
        synthesis = synthesis.id(),
        "Stage backends ready"
    );

    Ok(StageBackends {
        recognition,
        reasoning,
        synthesis,
    })
}
