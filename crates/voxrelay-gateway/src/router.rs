//! Inference router and multiplexer.
//!
//! Owns the session's three stage links. Recognition events are surfaced to
//! the client and fed to the gating policy; gated text opens a reasoning
//! turn; reasoning tokens are cut into speakable units and sent to synthesis
//! as soon as each is ready; synthesis audio is reframed into fixed-duration
//! chunks tagged with a per-utterance sequence. An utterance is the audio of
//! one reasoning turn and shares its id.
//!
//! Control inputs (prompts, speak requests, cancellations) are never dropped
//! when a stage queue is full: they wait in a backlog that is flushed in
//! order as the stage catches up.

use std::collections::{HashMap, HashSet, VecDeque};

use bytes::{Bytes, BytesMut};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use voxrelay_core::config::{InferenceConfig, MediaConfig};
use voxrelay_core::protocol::{ControlMessage, StageKind, StageStatus};
use voxrelay_core::session::{MediaParams, SessionId};
use voxrelay_inference::gating::GatingPolicy;
use voxrelay_inference::{
    LinkEvent, ReasoningEvent, ReasoningInput, RecognitionEvent, RecognitionInput, RetryPolicy,
    StageBackends, StageHandle, SynthesisEvent, SynthesisInput, VoiceParams,
};
use voxrelay_media::segmenter::Segmenter;

/// Something the session pipeline must act on.
#[derive(Debug, Clone, PartialEq)]
pub enum RouterOutput {
    /// Forward to the client as-is.
    Client(ControlMessage),
    /// One frame's worth of PCM16 for the egress path.
    Synthesis {
        utterance: u64,
        chunk_seq: u64,
        payload: Bytes,
    },
    /// Synthesis finished the utterance; no more chunks follow.
    UtteranceComplete { utterance: u64 },
    /// Synthesis acknowledged cancellation of the utterance.
    CancelAcked { utterance: u64 },
    /// The utterance was superseded; drop anything buffered for it.
    Discard { utterance: u64 },
}

/// Cuts a synthesis byte stream into frames of equal length.
#[derive(Debug)]
struct Reframer {
    buf: BytesMut,
    next_seq: u64,
}

impl Reframer {
    fn new() -> Self {
        Self {
            buf: BytesMut::new(),
            next_seq: 0,
        }
    }

    fn push(&mut self, payload: &[u8], frame_bytes: usize) -> Vec<(u64, Bytes)> {
        self.buf.extend_from_slice(payload);
        let mut frames = Vec::new();
        while self.buf.len() >= frame_bytes {
            let chunk = self.buf.split_to(frame_bytes).freeze();
            frames.push((self.next_seq, chunk));
            self.next_seq += 1;
        }
        frames
    }

    /// The remaining tail, zero-padded to a whole frame.
    fn finish(&mut self, frame_bytes: usize) -> Option<(u64, Bytes)> {
        if self.buf.is_empty() {
            return None;
        }
        self.buf.resize(frame_bytes, 0);
        let chunk = self.buf.split().freeze();
        let seq = self.next_seq;
        self.next_seq += 1;
        Some((seq, chunk))
    }
}

#[derive(Debug, Default)]
struct Backlogs {
    reasoning: VecDeque<ReasoningInput>,
    synthesis: VecDeque<SynthesisInput>,
}

/// Send `item` without blocking, keeping it queued behind earlier items if
/// the stage is busy. Returns `false` if the link is gone.
fn offer<T>(tx: &mpsc::Sender<T>, backlog: &mut VecDeque<T>, item: T) -> bool {
    if !backlog.is_empty() {
        backlog.push_back(item);
        return true;
    }
    match tx.try_send(item) {
        Ok(()) => true,
        Err(TrySendError::Full(item)) => {
            backlog.push_back(item);
            true
        }
        Err(TrySendError::Closed(_)) => false,
    }
}

fn drain<T>(tx: &mpsc::Sender<T>, backlog: &mut VecDeque<T>) {
    while let Some(item) = backlog.pop_front() {
        match tx.try_send(item) {
            Ok(()) => {}
            Err(TrySendError::Full(item)) => {
                backlog.push_front(item);
                return;
            }
            Err(TrySendError::Closed(_)) => {
                backlog.clear();
                return;
            }
        }
    }
}

pub struct InferenceRouter {
    session_id: SessionId,
    recognition: StageHandle<RecognitionInput, RecognitionEvent>,
    reasoning: StageHandle<ReasoningInput, ReasoningEvent>,
    synthesis: StageHandle<SynthesisInput, SynthesisEvent>,
    reasoning_tx: mpsc::Sender<ReasoningInput>,
    synthesis_tx: mpsc::Sender<SynthesisInput>,
    live: [bool; 3],
    backlogs: Backlogs,
    gating: GatingPolicy,
    segmenter: Segmenter,
    voice: VoiceParams,
    frame_bytes: usize,
    next_turn: u64,
    active_turn: Option<u64>,
    /// Utterances synthesis may still produce audio for.
    open: HashMap<u64, Reframer>,
    /// Cancellations sent for the current and previous turn that have not
    /// been acknowledged.
    cancelled: HashSet<u64>,
    started: Instant,
    outputs: VecDeque<RouterOutput>,
}

impl InferenceRouter {
    /// Open the stage links. They are cancelled with `cancel` or when the
    /// router is dropped.
    pub fn new(
        session_id: SessionId,
        backends: StageBackends,
        config: &InferenceConfig,
        media: &MediaConfig,
        params: &MediaParams,
        cancel: &CancellationToken,
    ) -> Self {
        let policy = RetryPolicy::from_config(&config.retry);
        let recognition = StageHandle::spawn(
            backends.recognition,
            config.recognition.queue,
            policy.clone(),
            cancel,
        );
        let reasoning = StageHandle::spawn(
            backends.reasoning,
            config.reasoning.queue,
            policy.clone(),
            cancel,
        );
        let synthesis = StageHandle::spawn(
            backends.synthesis,
            config.synthesis.queue,
            policy,
            cancel,
        );

        Self {
            session_id,
            reasoning_tx: reasoning.sender(),
            synthesis_tx: synthesis.sender(),
            recognition,
            reasoning,
            synthesis,
            live: [true; 3],
            backlogs: Backlogs::default(),
            gating: GatingPolicy::new(&config.gating),
            segmenter: Segmenter::new(&config.segmenter),
            voice: VoiceParams {
                voice: config.synthesis.voice.clone(),
                sample_rate: params.sample_rate,
            },
            frame_bytes: params.samples_per_frame(media.frame_ms).max(1) * 2,
            next_turn: 1,
            active_turn: None,
            open: HashMap::new(),
            cancelled: HashSet::new(),
            started: Instant::now(),
            outputs: VecDeque::new(),
        }
    }

    /// Feeding end of the recognition link, for ordered audio hand-off.
    pub fn recognition_sender(&self) -> mpsc::Sender<RecognitionInput> {
        self.recognition.sender()
    }

    /// Wait for the next event from any stage and process it. Returns
    /// `false` once every link is closed.
    pub async fn next_event(&mut self) -> bool {
        tokio::select! {
            event = self.recognition.recv(), if self.live[0] => match event {
                Some(event) => self.on_recognition(event),
                None => self.link_closed(StageKind::Recognition),
            },
            event = self.reasoning.recv(), if self.live[1] => match event {
                Some(event) => self.on_reasoning(event),
                None => self.link_closed(StageKind::Reasoning),
            },
            event = self.synthesis.recv(), if self.live[2] => match event {
                Some(event) => self.on_synthesis(event),
                None => self.link_closed(StageKind::Synthesis),
            },
            else => return false,
        }
        true
    }

    /// Advance the gating timer.
    pub fn tick(&mut self, now: Instant) {
        if let Some(text) = self.gating.tick(now) {
            self.start_turn(text);
        }
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.gating.next_deadline()
    }

    pub fn take_outputs(&mut self) -> Vec<RouterOutput> {
        self.outputs.drain(..).collect()
    }

    /// Retry control inputs that found their stage queue full.
    pub fn flush_backlog(&mut self) {
        drain(&self.reasoning_tx, &mut self.backlogs.reasoning);
        drain(&self.synthesis_tx, &mut self.backlogs.synthesis);
    }

    /// Stop producing audio for `utterance`. A turn still being reasoned is
    /// cancelled as well.
    pub fn cancel_synthesis(&mut self, utterance: u64) {
        if !self.cancelled.insert(utterance) {
            return;
        }
        self.open.remove(&utterance);
        if self.active_turn == Some(utterance) {
            self.active_turn = None;
            self.segmenter.reset();
            self.send_reasoning(ReasoningInput::Cancel { turn: utterance });
        }
        debug!(session_id = %self.session_id, utterance, "Cancelling synthesis");
        self.send_synthesis(SynthesisInput::Cancel { utterance });
    }

    /// Drop audio already received for `utterance` but not yet framed.
    pub fn discard(&mut self, utterance: u64) {
        if let Some(reframer) = self.open.get_mut(&utterance) {
            reframer.buf.clear();
        }
    }

    /// Abandon the synthesis stage's current run.
    pub fn restart_synthesis(&mut self) {
        if !self.synthesis.restart() {
            warn!(session_id = %self.session_id, "Synthesis restart request dropped");
        }
    }

    pub fn pause_synthesis(&mut self) {
        self.send_synthesis(SynthesisInput::Pause);
    }

    pub fn resume_synthesis(&mut self) {
        self.send_synthesis(SynthesisInput::Resume);
    }

    /// Milliseconds since the router started, for transcript timestamps.
    fn ts(&self) -> u64 {
        self.started.elapsed().as_millis() as u64
    }

    fn link_closed(&mut self, stage: StageKind) {
        let index = match stage {
            StageKind::Recognition => 0,
            StageKind::Reasoning => 1,
            StageKind::Synthesis => 2,
        };
        self.live[index] = false;
        debug!(session_id = %self.session_id, stage = stage.as_str(), "Stage link closed");
    }

    fn status(&mut self, stage: StageKind, state: StageStatus) {
        let message = match state {
            StageStatus::Degraded => stage.unavailable_message().to_string(),
            StageStatus::Restored => format!("{} restored", stage.as_str()),
        };
        info!(session_id = %self.session_id, stage = stage.as_str(), ?state, "Stage status changed");
        self.outputs.push_back(RouterOutput::Client(ControlMessage::Status {
            stage,
            state,
            message,
        }));
    }

    // --- Recognition ---

    fn on_recognition(&mut self, event: LinkEvent<RecognitionEvent>) {
        match event {
            LinkEvent::Event(RecognitionEvent::Partial { text, confidence }) => {
                self.gating.on_partial(&text, confidence, Instant::now());
                let ts = self.ts();
                self.outputs
                    .push_back(RouterOutput::Client(ControlMessage::PartialTranscript { text, ts }));
            }
            LinkEvent::Event(RecognitionEvent::Final { text }) => {
                let gated = self.gating.on_final(&text);
                if !text.trim().is_empty() {
                    let ts = self.ts();
                    self.outputs
                        .push_back(RouterOutput::Client(ControlMessage::FinalTranscript { text, ts }));
                }
                if let Some(prompt) = gated {
                    self.start_turn(prompt);
                }
            }
            LinkEvent::Degraded { .. } => {
                self.gating.reset();
                self.status(StageKind::Recognition, StageStatus::Degraded);
            }
            LinkEvent::Restored => self.status(StageKind::Recognition, StageStatus::Restored),
        }
    }

    // --- Reasoning ---

    fn start_turn(&mut self, prompt: String) {
        if let Some(previous) = self.active_turn.take() {
            debug!(session_id = %self.session_id, turn = previous, "Turn superseded");
            self.segmenter.reset();
            self.send_reasoning(ReasoningInput::Cancel { turn: previous });
        }
        let superseded: Vec<u64> = self.open.keys().copied().collect();
        for utterance in superseded {
            self.outputs.push_back(RouterOutput::Discard { utterance });
            self.cancel_synthesis(utterance);
        }

        let turn = self.next_turn;
        self.next_turn += 1;
        self.cancelled.retain(|&id| id + 1 >= turn);
        self.active_turn = Some(turn);
        self.open.insert(turn, Reframer::new());
        debug!(session_id = %self.session_id, turn, chars = prompt.len(), "Turn started");
        self.send_reasoning(ReasoningInput::Prompt { turn, text: prompt });
    }

    fn finish_turn(&mut self, turn: u64) {
        if let Some(rest) = self.segmenter.finish() {
            self.speak(turn, rest);
        }
        self.active_turn = None;
        self.send_synthesis(SynthesisInput::Finish { utterance: turn });
    }

    fn on_reasoning(&mut self, event: LinkEvent<ReasoningEvent>) {
        match event {
            LinkEvent::Event(ReasoningEvent::Token { turn, text }) => {
                if self.active_turn != Some(turn) {
                    trace!(turn, "Token for inactive turn dropped");
                    return;
                }
                for unit in self.segmenter.push(&text) {
                    self.speak(turn, unit);
                }
            }
            LinkEvent::Event(ReasoningEvent::EndOfTurn { turn }) => {
                if self.active_turn == Some(turn) {
                    self.finish_turn(turn);
                }
            }
            LinkEvent::Event(ReasoningEvent::Cancelled { turn }) => {
                debug!(session_id = %self.session_id, turn, "Reasoning cancellation acknowledged");
            }
            LinkEvent::Degraded { .. } => {
                if let Some(turn) = self.active_turn {
                    self.finish_turn(turn);
                }
                self.status(StageKind::Reasoning, StageStatus::Degraded);
            }
            LinkEvent::Restored => self.status(StageKind::Reasoning, StageStatus::Restored),
        }
    }

    fn speak(&mut self, utterance: u64, text: String) {
        trace!(utterance, chars = text.len(), "Speakable unit ready");
        let voice = self.voice.clone();
        self.send_synthesis(SynthesisInput::Speak {
            utterance,
            text,
            voice,
        });
    }

    // --- Synthesis ---

    fn on_synthesis(&mut self, event: LinkEvent<SynthesisEvent>) {
        match event {
            LinkEvent::Event(SynthesisEvent::Audio { utterance, payload }) => {
                let Some(reframer) = self.open.get_mut(&utterance) else {
                    trace!(utterance, "Audio for closed utterance dropped");
                    return;
                };
                for (chunk_seq, payload) in reframer.push(&payload, self.frame_bytes) {
                    self.outputs.push_back(RouterOutput::Synthesis {
                        utterance,
                        chunk_seq,
                        payload,
                    });
                }
            }
            LinkEvent::Event(SynthesisEvent::Complete { utterance }) => {
                self.complete(utterance);
            }
            LinkEvent::Event(SynthesisEvent::Cancelled { utterance }) => {
                self.open.remove(&utterance);
                self.cancelled.remove(&utterance);
                self.outputs.push_back(RouterOutput::CancelAcked { utterance });
            }
            LinkEvent::Degraded { .. } => {
                let mut open: Vec<u64> = self.open.keys().copied().collect();
                open.sort_unstable();
                for utterance in open {
                    self.complete(utterance);
                }
                self.status(StageKind::Synthesis, StageStatus::Degraded);
            }
            LinkEvent::Restored => self.status(StageKind::Synthesis, StageStatus::Restored),
        }
    }

    fn complete(&mut self, utterance: u64) {
        let Some(mut reframer) = self.open.remove(&utterance) else {
            return;
        };
        if let Some((chunk_seq, payload)) = reframer.finish(self.frame_bytes) {
            self.outputs.push_back(RouterOutput::Synthesis {
                utterance,
                chunk_seq,
                payload,
            });
        }
        self.outputs
            .push_back(RouterOutput::UtteranceComplete { utterance });
    }

    fn send_reasoning(&mut self, item: ReasoningInput) {
        if !offer(&self.reasoning_tx, &mut self.backlogs.reasoning, item) {
            debug!(session_id = %self.session_id, "Reasoning link gone, input dropped");
        }
    }

    fn send_synthesis(&mut self, item: SynthesisInput) {
        if !offer(&self.synthesis_tx, &mut self.backlogs.synthesis, item) {
            debug!(session_id = %self.session_id, "Synthesis link gone, input dropped");
        }
    }
}
