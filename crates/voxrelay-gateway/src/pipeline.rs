//! Per-session pipeline task.
//!
//! One task per session exclusively owns the ingress and egress jitter
//! buffers, the flow queues, the barge-in coordinator and the inference
//! router. It suspends on inbound frames, stage events, queue hand-offs and
//! the earliest pending timer, and after every wake-up settles all state
//! machines at the current instant. Every exit path ends in
//! [`SessionPipeline::teardown`], which runs exactly once.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use voxrelay_core::error::{Result, VoxRelayError};
use voxrelay_core::frame::{AudioFrame, Codec, FrameFlags};
use voxrelay_core::protocol::{ControlMessage, FlowAction, FlowSignalState};
use voxrelay_core::seq::SeqCounter;
use voxrelay_core::session::{MediaParams, Session, SessionId, SessionState};
use voxrelay_inference::{RecognitionInput, StageBackends};
use voxrelay_media::barge_in::{BargeInAction, BargeInCoordinator, BargeInState, Gate};
use voxrelay_media::flow::{EgressItem, Enqueued, FlowController, FlowSignal, IngressItem};
use voxrelay_media::jitter::{JitterBuffer, PushOutcome, StreamDirection};

use crate::router::{InferenceRouter, RouterOutput};
use crate::state::GatewayState;

const INBOUND_QUEUE: usize = 64;
const MIN_WAIT: Duration = Duration::from_millis(1);
const TOUCH_INTERVAL: Duration = Duration::from_secs(1);
/// Unread items the writer may hold before more agent audio is handed over.
const EGRESS_IN_FLIGHT: usize = 1;
/// Recheck interval while the writer is behind.
const EGRESS_POLL: Duration = Duration::from_millis(5);

/// Client input for a session, already validated by the connection.
#[derive(Debug)]
pub enum Inbound {
    Frame(AudioFrame),
    Vad { speech: bool, seq: u16 },
    End,
}

/// Output for the connection's writer.
#[derive(Debug, Clone, PartialEq)]
pub enum Outbound {
    Text(String),
    Binary(Bytes),
    Close,
}

impl Outbound {
    pub fn control(msg: &ControlMessage) -> Option<Self> {
        match msg.to_json() {
            Ok(json) => Some(Self::Text(json)),
            Err(e) => {
                warn!(kind = msg.kind(), error = %e, "Failed to serialize control message");
                None
            }
        }
    }
}

fn encode(item: EgressItem) -> Option<Outbound> {
    match item {
        EgressItem::Audio(unit) => Some(Outbound::Binary(unit.frame().encode())),
        EgressItem::Control(msg) => Outbound::control(&msg),
    }
}

pub struct SessionPipeline {
    state: Arc<GatewayState>,
    id: SessionId,
    conn_id: String,
    params: MediaParams,
    inbound: mpsc::Receiver<Inbound>,
    outbound: mpsc::Sender<Outbound>,
    cancel: CancellationToken,
    router: InferenceRouter,
    recognition_tx: mpsc::Sender<RecognitionInput>,
    stages_live: bool,
    ingress: JitterBuffer,
    egress: JitterBuffer,
    flow: FlowController,
    coordinator: BargeInCoordinator,
    egress_seq: SeqCounter,
    egress_frames: u64,
    frame_ns: u64,
    /// Playout time of the next agent audio frame handed to the transport.
    egress_clock: Instant,
    /// Next expected chunk sequence per forwarded utterance.
    chunk_seqs: HashMap<u64, u64>,
    /// Synthesis finished; `tts_state done` follows once its audio has left.
    pending_complete: Option<u64>,
    user_turn_open: bool,
    reduced_bitrate: u32,
    idle_timeout: Duration,
    last_activity: Instant,
    touched_at: Instant,
}

impl SessionPipeline {
    /// Spawn the pipeline for an active session. Returns the inbound sender
    /// and the task; dropping the sender ends the session.
    pub fn spawn(
        state: Arc<GatewayState>,
        session: &Session,
        backends: StageBackends,
        outbound: mpsc::Sender<Outbound>,
        cancel: CancellationToken,
    ) -> (mpsc::Sender<Inbound>, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(INBOUND_QUEUE);
        let pipeline = Self::new(state, session, backends, rx, outbound, cancel);
        (tx, tokio::spawn(pipeline.run()))
    }

    fn new(
        state: Arc<GatewayState>,
        session: &Session,
        backends: StageBackends,
        inbound: mpsc::Receiver<Inbound>,
        outbound: mpsc::Sender<Outbound>,
        cancel: CancellationToken,
    ) -> Self {
        let config = state.config.clone();
        let media = config.media();
        let jitter = config.jitter();
        let flow = config.flow();
        let params = session.params;
        let egress_params = MediaParams {
            codec: Codec::Pcm16,
            sample_rate: params.sample_rate,
            bitrate: params.sample_rate * 16,
        };

        let router = InferenceRouter::new(
            session.id,
            backends,
            &config.inference(),
            &media,
            &params,
            &cancel,
        );
        let now = Instant::now();

        Self {
            id: session.id,
            conn_id: session.conn_id.clone(),
            params,
            inbound,
            outbound,
            recognition_tx: router.recognition_sender(),
            router,
            stages_live: true,
            ingress: JitterBuffer::new(StreamDirection::Ingress, &jitter, &params, media.frame_ms),
            egress: JitterBuffer::new(StreamDirection::Egress, &jitter, &egress_params, media.frame_ms),
            flow: FlowController::new(&flow),
            coordinator: BargeInCoordinator::new(&config.barge_in()),
            egress_seq: SeqCounter::starting_at(0),
            egress_frames: 0,
            frame_ns: media.frame_ms as u64 * 1_000_000,
            egress_clock: now,
            chunk_seqs: HashMap::new(),
            pending_complete: None,
            user_turn_open: false,
            reduced_bitrate: ((params.bitrate as f64 * flow.reduced_bitrate_factor) as u32)
                .max(media.min_bitrate),
            idle_timeout: Duration::from_millis(config.server().idle_timeout_ms),
            last_activity: now,
            touched_at: now,
            cancel,
            state,
        }
    }

    async fn run(mut self) {
        info!(
            session_id = %self.id,
            conn_id = %self.conn_id,
            codec = self.params.codec.as_str(),
            sample_rate = self.params.sample_rate,
            bitrate = self.params.bitrate,
            "Session started"
        );
        let reason = match self.drive().await {
            Ok(reason) => reason,
            Err(e) => {
                error!(session_id = %self.id, error = %e, "Session invariant violated, tearing down");
                "invariant violation"
            }
        };
        self.teardown(reason).await;
    }

    async fn drive(&mut self) -> Result<&'static str> {
        let recognition_tx = self.recognition_tx.clone();
        let outbound = self.outbound.clone();
        loop {
            let now = Instant::now();
            let wake = self.next_wake(now);
            let egress_ready = self.egress_releasable(now);

            tokio::select! {
                _ = self.cancel.cancelled() => return Ok("cancelled"),
                item = self.inbound.recv() => match item {
                    Some(Inbound::End) => {
                        self.drain().await;
                        return Ok("end");
                    }
                    Some(item) => {
                        let now = Instant::now();
                        self.on_inbound(item, now);
                        if now.duration_since(self.touched_at) >= TOUCH_INTERVAL {
                            self.touched_at = now;
                            self.state.registry.touch(self.id).await;
                        }
                    }
                    None => return Ok("transport closed"),
                },
                live = self.router.next_event(), if self.stages_live => {
                    if !live {
                        warn!(session_id = %self.id, "All stage links closed");
                        self.stages_live = false;
                    }
                }
                permit = recognition_tx.reserve(), if !self.flow.ingress.is_empty() => {
                    match permit {
                        Ok(permit) => {
                            let next = self.flow.ingress.pop();
                            if let Some((item, signal)) = next {
                                permit.send(match item {
                                    IngressItem::Audio(frame) => RecognitionInput::Audio(frame),
                                    IngressItem::EndOfUtterance => RecognitionInput::EndOfUtterance,
                                });
                                self.on_ingress_signal(signal);
                            }
                        }
                        Err(_) => {
                            debug!(session_id = %self.id, "Recognition link gone, dropping ingress");
                            self.flow.ingress.clear();
                        }
                    }
                }
                permit = outbound.reserve(), if egress_ready => {
                    let Ok(permit) = permit else {
                        return Ok("transport closed");
                    };
                    self.release_egress(permit, Instant::now());
                }
                _ = tokio::time::sleep_until(wake) => {}
            }

            let now = Instant::now();
            if now.duration_since(self.last_activity) >= self.idle_timeout {
                return Ok("idle timeout");
            }
            self.settle(now)?;
        }
    }

    fn next_wake(&self, now: Instant) -> Instant {
        let idle = self.last_activity + self.idle_timeout;
        [
            self.ingress.next_deadline(),
            self.egress.next_deadline(),
            self.egress_deadline(now),
            self.coordinator.next_deadline(),
            self.router.next_deadline(),
        ]
        .into_iter()
        .flatten()
        .fold(idle, Instant::min)
        .max(now + MIN_WAIT)
    }

    /// Items handed to the writer that it has not taken yet.
    fn transport_backlog(&self) -> usize {
        self.outbound.max_capacity() - self.outbound.capacity()
    }

    /// Whether the head of the egress queue may go to the transport now.
    /// Control messages go at once; agent audio is paced at playout rate,
    /// kept at most the egress target depth ahead of real time, and held
    /// back while the writer is behind.
    fn egress_releasable(&self, now: Instant) -> bool {
        match self.flow.egress.front() {
            None => false,
            Some(EgressItem::Control(_)) => true,
            Some(EgressItem::Audio(_)) => {
                self.transport_backlog() < EGRESS_IN_FLIGHT
                    && self.egress_clock <= now + self.egress.target_depth()
            }
        }
    }

    /// When held-back agent audio should be looked at again.
    fn egress_deadline(&self, now: Instant) -> Option<Instant> {
        match self.flow.egress.front()? {
            EgressItem::Control(_) => None,
            EgressItem::Audio(_) if self.transport_backlog() >= EGRESS_IN_FLIGHT => {
                Some(now + EGRESS_POLL)
            }
            EgressItem::Audio(_) => Some(
                self.egress_clock
                    .checked_sub(self.egress.target_depth())
                    .unwrap_or(now),
            ),
        }
    }

    fn release_egress(&mut self, permit: mpsc::Permit<'_, Outbound>, now: Instant) {
        let Some((item, signal)) = self.flow.egress.pop() else {
            return;
        };
        if matches!(item, EgressItem::Audio(_)) {
            self.egress_clock =
                self.egress_clock.max(now) + Duration::from_nanos(self.frame_ns);
            // Agent speech keeps the session alive while the user listens.
            self.last_activity = now;
        }
        if let Some(out) = encode(item) {
            permit.send(out);
        }
        self.on_egress_signal(signal);
    }

    fn on_inbound(&mut self, item: Inbound, now: Instant) {
        self.last_activity = now;
        match item {
            Inbound::Frame(frame) => {
                self.coordinator.on_inbound_vad(frame.is_speech(), now);
                let seq = frame.seq();
                match self.ingress.push(frame, None, now) {
                    PushOutcome::Buffered => {}
                    PushOutcome::Resynced => {
                        debug!(session_id = %self.id, seq, "Ingress stream resynchronised")
                    }
                    outcome => trace!(session_id = %self.id, seq, ?outcome, "Inbound frame not buffered"),
                }
            }
            Inbound::Vad { speech, seq } => {
                debug!(session_id = %self.id, speech, seq, "Client VAD transition");
                self.coordinator.on_inbound_vad(speech, now);
            }
            Inbound::End => {}
        }
    }

    /// Bring every state machine up to `now`.
    fn settle(&mut self, now: Instant) -> Result<()> {
        for unit in self.ingress.drain_ready(now) {
            self.push_ingress(IngressItem::Audio(unit.into_frame()));
        }

        self.coordinator.tick(now);
        self.track_user_turn(now);
        self.apply_barge_in();

        self.router.tick(now);
        loop {
            let outputs = self.router.take_outputs();
            if outputs.is_empty() {
                break;
            }
            for output in outputs {
                self.on_router_output(output, now)?;
                self.apply_barge_in();
            }
        }

        for unit in self.egress.drain_ready(now) {
            self.push_egress(EgressItem::Audio(unit));
        }
        self.settle_completion();
        self.apply_barge_in();
        self.router.flush_backlog();
        Ok(())
    }

    /// Close the recognition utterance once the user is no longer speaking.
    fn track_user_turn(&mut self, now: Instant) {
        let user_active = matches!(
            self.coordinator.state(),
            BargeInState::UserSpeaking | BargeInState::Interrupting { .. }
        );
        if user_active {
            self.user_turn_open = true;
        } else if self.user_turn_open {
            self.user_turn_open = false;
            for unit in self.ingress.flush(now) {
                self.push_ingress(IngressItem::Audio(unit.into_frame()));
            }
            debug!(session_id = %self.id, "End of user utterance");
            self.push_ingress(IngressItem::EndOfUtterance);
        }
    }

    fn on_router_output(&mut self, output: RouterOutput, now: Instant) -> Result<()> {
        match output {
            RouterOutput::Client(msg) => self.push_egress(EgressItem::Control(msg)),
            RouterOutput::Synthesis {
                utterance,
                chunk_seq,
                payload,
            } => {
                if self.coordinator.on_synthesis_chunk(utterance) == Gate::Suppressed {
                    trace!(utterance, chunk_seq, "Synthesis chunk suppressed");
                    return Ok(());
                }
                let expected = self.chunk_seqs.entry(utterance).or_insert(0);
                if chunk_seq != *expected {
                    return Err(VoxRelayError::Session(format!(
                        "utterance {utterance} produced chunk {chunk_seq}, expected {expected}"
                    )));
                }
                *expected += 1;

                let ts = self.egress_frames * self.frame_ns;
                self.egress_frames += 1;
                let frame = AudioFrame::new(
                    self.id.0,
                    ts,
                    self.egress_seq.next(),
                    Codec::Pcm16,
                    FrameFlags::new(false, true),
                    payload,
                )?;
                self.egress.push(frame, Some(utterance), now);
            }
            RouterOutput::UtteranceComplete { utterance } => {
                self.chunk_seqs.remove(&utterance);
                for unit in self.egress.flush(now) {
                    self.push_egress(EgressItem::Audio(unit));
                }
                if self.coordinator.speaking() == Some(utterance) {
                    self.pending_complete = Some(utterance);
                }
            }
            RouterOutput::CancelAcked { utterance } => {
                self.chunk_seqs.remove(&utterance);
                self.coordinator.on_cancel_ack(utterance);
            }
            RouterOutput::Discard { utterance } => self.discard_utterance(utterance),
        }
        Ok(())
    }

    fn apply_barge_in(&mut self) {
        for action in self.coordinator.take_actions() {
            match action {
                BargeInAction::DiscardBuffered { utterance } => self.discard_utterance(utterance),
                BargeInAction::CancelSynthesis { utterance } => {
                    self.router.cancel_synthesis(utterance)
                }
                BargeInAction::ForceTerminate { utterance } => {
                    debug!(session_id = %self.id, utterance, "Restarting synthesis link");
                    self.router.restart_synthesis();
                }
                BargeInAction::Notify(status) => {
                    debug!(session_id = %self.id, ?status, "Agent speech state");
                    self.push_egress(EgressItem::Control(ControlMessage::TtsState { status }));
                }
            }
        }
    }

    /// Report `done` once the completed utterance's audio has been handed
    /// to the transport.
    fn settle_completion(&mut self) {
        let Some(utterance) = self.pending_complete else {
            return;
        };
        if self.coordinator.speaking() != Some(utterance) {
            self.pending_complete = None;
            return;
        }
        if self.egress.is_empty() && self.flow.egress.is_empty() {
            self.pending_complete = None;
            self.coordinator.on_utterance_complete(utterance);
        }
    }

    fn discard_utterance(&mut self, utterance: u64) {
        let buffered = self.egress.purge_tag(utterance);
        let (queued, signal) = self
            .flow
            .egress
            .purge(|item| item.utterance() == Some(utterance));
        self.on_egress_signal(signal);
        self.router.discard(utterance);
        if self.pending_complete == Some(utterance) {
            self.pending_complete = None;
        }
        debug!(session_id = %self.id, utterance, buffered, queued, "Discarded utterance audio");
    }

    fn push_ingress(&mut self, item: IngressItem) {
        let Enqueued { signal, .. } = self.flow.ingress.push(item);
        self.on_ingress_signal(signal);
    }

    fn push_egress(&mut self, item: EgressItem) {
        let Enqueued { signal, .. } = self.flow.egress.push(item);
        self.on_egress_signal(signal);
    }

    /// Ingress congestion is signalled to the client.
    fn on_ingress_signal(&mut self, signal: Option<FlowSignal>) {
        let opus = self.params.codec == Codec::Opus;
        let msg = match signal {
            None => return,
            Some(FlowSignal::Asserted) if opus => ControlMessage::Flow {
                state: FlowSignalState::Asserted,
                action: FlowAction::ReduceBitrate,
                bitrate: Some(self.reduced_bitrate),
            },
            Some(FlowSignal::Asserted) => ControlMessage::Flow {
                state: FlowSignalState::Asserted,
                action: FlowAction::Pause,
                bitrate: None,
            },
            Some(FlowSignal::Cleared) => ControlMessage::Flow {
                state: FlowSignalState::Clear,
                action: FlowAction::Resume,
                bitrate: opus.then_some(self.params.bitrate),
            },
        };
        info!(session_id = %self.id, depth = self.flow.ingress.len(), ?signal, "Ingress flow signal");
        self.push_egress(EgressItem::Control(msg));
    }

    /// Egress congestion pauses synthesis.
    fn on_egress_signal(&mut self, signal: Option<FlowSignal>) {
        match signal {
            Some(FlowSignal::Asserted) => self.router.pause_synthesis(),
            Some(FlowSignal::Cleared) => self.router.resume_synthesis(),
            None => {}
        }
    }

    /// Hand whatever egress output already exists to the transport.
    async fn drain(&mut self) {
        if let Err(e) = self.state.registry.begin_drain(self.id).await {
            debug!(session_id = %self.id, error = %e, "Drain transition skipped");
        }
        for unit in self.egress.flush(Instant::now()) {
            self.push_egress(EgressItem::Audio(unit));
        }
        let mut flushed = 0usize;
        while let Some((item, _)) = self.flow.egress.pop() {
            let Some(out) = encode(item) else {
                continue;
            };
            if self.outbound.try_send(out).is_err() {
                break;
            }
            flushed += 1;
        }
        debug!(session_id = %self.id, flushed, "Session drained");
    }

    async fn teardown(mut self, reason: &'static str) {
        self.cancel.cancel();
        self.flow.clear();

        if self.state.registry.remove(self.id).await.is_none() {
            return;
        }
        let closed = ControlMessage::Session {
            session_id: self.id.0,
            state: SessionState::Closed,
        };
        if let Some(out) = Outbound::control(&closed) {
            let _ = self.outbound.try_send(out);
        }

        let ingress = self.ingress.stats();
        let egress = self.egress.stats();
        info!(
            session_id = %self.id,
            conn_id = %self.conn_id,
            reason,
            delivered = ingress.delivered,
            lost = ingress.lost,
            late = ingress.late,
            sent = egress.delivered,
            "Session torn down"
        );
    }
}
