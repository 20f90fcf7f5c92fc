//! Jitter buffer and reorder engine.
//!
//! One instance per session per direction. Frames are held in a bounded
//! window of slots indexed by their distance from the playout pointer. The
//! head slot is released once the buffer holds the target depth or the frame
//! has waited that long. A missing head blocks later frames for at most the
//! loss-tolerance window, after which it is concealed exactly once and the
//! pointer moves on.

use std::collections::VecDeque;
use std::time::Duration;

use bytes::Bytes;
use serde::Serialize;
use tokio::time::Instant;
use tracing::{debug, trace, warn};

use voxrelay_core::config::JitterConfig;
use voxrelay_core::frame::{AudioFrame, Codec, FrameFlags};
use voxrelay_core::seq::{SeqPosition, position};
use voxrelay_core::session::MediaParams;

use crate::pcm;

/// Jumps wider than `capacity * RESYNC_FACTOR` slots are treated as a stream restart.
const RESYNC_FACTOR: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamDirection {
    Ingress,
    Egress,
}

impl StreamDirection {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Ingress => "ingress",
            Self::Egress => "egress",
        }
    }
}

/// Counters kept by a jitter buffer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct JitterStats {
    pub delivered: u64,
    /// Sequence numbers concealed after the loss-tolerance window.
    pub lost: u64,
    /// Frames that arrived after the pointer passed them.
    pub late: u64,
    pub duplicates: u64,
    /// Frames dropped by [`JitterBuffer::purge_tag`].
    pub discarded: u64,
    pub resyncs: u64,
}

/// A unit released from the playout side of the buffer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Playout {
    Frame {
        frame: AudioFrame,
        utterance: Option<u64>,
    },
    /// Substituted for a sequence number that never arrived.
    Concealed {
        frame: AudioFrame,
        utterance: Option<u64>,
    },
}

impl Playout {
    pub fn frame(&self) -> &AudioFrame {
        match self {
            Self::Frame { frame, .. } | Self::Concealed { frame, .. } => frame,
        }
    }

    pub fn into_frame(self) -> AudioFrame {
        match self {
            Self::Frame { frame, .. } | Self::Concealed { frame, .. } => frame,
        }
    }

    pub fn utterance(&self) -> Option<u64> {
        match self {
            Self::Frame { utterance, .. } | Self::Concealed { utterance, .. } => *utterance,
        }
    }

    pub fn seq(&self) -> u16 {
        self.frame().seq()
    }

    pub fn is_concealed(&self) -> bool {
        matches!(self, Self::Concealed { .. })
    }
}

/// What happened to a pushed frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushOutcome {
    Buffered,
    Duplicate,
    Late,
    /// The frame restarted the stream; earlier frames were flushed.
    Resynced,
}

#[derive(Debug)]
struct Entry {
    frame: AudioFrame,
    utterance: Option<u64>,
    arrived: Instant,
}

#[derive(Debug)]
enum Slot {
    Empty,
    Filled(Entry),
    Discarded,
}

enum Head {
    Skip,
    /// Release the head frame; the instant is when it became due.
    Release(Instant),
    Conceal,
    Wait,
}

/// RFC 3550 interarrival jitter estimate.
#[derive(Debug, Default)]
struct JitterEstimator {
    base: Option<Instant>,
    last_transit: Option<i128>,
    jitter_ns: f64,
}

impl JitterEstimator {
    fn update(&mut self, timestamp_ns: u64, now: Instant) {
        let base = *self.base.get_or_insert(now);
        let arrival = now.saturating_duration_since(base).as_nanos() as i128;
        let transit = arrival - timestamp_ns as i128;
        if let Some(last) = self.last_transit {
            let d = (transit - last).abs() as f64;
            self.jitter_ns += (d - self.jitter_ns) / 16.0;
        }
        self.last_transit = Some(transit);
    }

    fn jitter(&self) -> Duration {
        Duration::from_nanos(self.jitter_ns as u64)
    }

    fn reset(&mut self) {
        *self = Self::default();
    }
}

pub struct JitterBuffer {
    direction: StreamDirection,
    config: JitterConfig,
    codec: Codec,
    frame_duration: Duration,
    samples_per_frame: usize,
    slots: VecDeque<Slot>,
    /// Playout pointer. `None` until the first frame arrives.
    next_seq: Option<u16>,
    /// When the current head became due.
    head_since: Option<Instant>,
    last_push: Option<Instant>,
    /// Units forced out by overflow or resync, released before anything else.
    pending: VecDeque<Playout>,
    estimator: JitterEstimator,
    target: Duration,
    stats: JitterStats,
    session_id: u32,
    last_ts_ns: u64,
    last_payload: Option<Bytes>,
    last_utterance: Option<u64>,
}

impl JitterBuffer {
    pub fn new(
        direction: StreamDirection,
        config: &JitterConfig,
        params: &MediaParams,
        frame_ms: u32,
    ) -> Self {
        Self {
            direction,
            config: config.clone(),
            codec: params.codec,
            frame_duration: Duration::from_millis(frame_ms as u64),
            samples_per_frame: params.samples_per_frame(frame_ms),
            slots: VecDeque::with_capacity(config.capacity),
            next_seq: None,
            head_since: None,
            last_push: None,
            pending: VecDeque::new(),
            estimator: JitterEstimator::default(),
            target: Duration::from_millis(config.min_depth_ms),
            stats: JitterStats::default(),
            session_id: 0,
            last_ts_ns: 0,
            last_payload: None,
            last_utterance: None,
        }
    }

    /// Accept a frame, tagged with the utterance it belongs to (egress only).
    pub fn push(&mut self, frame: AudioFrame, utterance: Option<u64>, now: Instant) -> PushOutcome {
        self.session_id = frame.session_id();
        let seq = frame.seq();
        let next = match self.next_seq {
            Some(next) => next,
            None => {
                self.next_seq = Some(seq);
                self.head_since = Some(now);
                seq
            }
        };

        let restart_span = self.config.capacity.max(1) * RESYNC_FACTOR;
        let mut resynced = false;
        // Only a forward jump restarts the stream; the pointer never moves back
        // over sequence numbers it has already released.
        let mut offset = match position(next, seq) {
            SeqPosition::Behind(d) => {
                self.stats.late += 1;
                trace!(direction = self.direction.as_str(), seq, behind = d, "Late frame dropped");
                return PushOutcome::Late;
            }
            SeqPosition::Ahead(d) if d as usize > restart_span => {
                self.resync(seq, now);
                resynced = true;
                0
            }
            SeqPosition::Ahead(d) => d as usize,
        };

        while offset >= self.config.capacity.max(1) {
            self.force_advance(now);
            offset -= 1;
        }

        while self.slots.len() <= offset {
            self.slots.push_back(Slot::Empty);
        }
        if !matches!(self.slots[offset], Slot::Empty) {
            self.stats.duplicates += 1;
            trace!(direction = self.direction.as_str(), seq, "Duplicate frame dropped");
            return PushOutcome::Duplicate;
        }

        self.last_push = Some(now);
        self.estimator.update(frame.timestamp_ns(), now);
        self.retarget();
        self.slots[offset] = Slot::Filled(Entry {
            frame,
            utterance,
            arrived: now,
        });

        if resynced {
            PushOutcome::Resynced
        } else {
            PushOutcome::Buffered
        }
    }

    /// Release the next unit due at `now`, if any. Call until `None`.
    pub fn pop(&mut self, now: Instant) -> Option<Playout> {
        if let Some(unit) = self.pending.pop_front() {
            return Some(unit);
        }

        loop {
            let head = match self.slots.front()? {
                Slot::Discarded => Head::Skip,
                Slot::Filled(entry) => {
                    let waited_out = now.saturating_duration_since(entry.arrived) >= self.target;
                    let deep_enough = self.buffered_depth() >= self.target;
                    if waited_out || deep_enough {
                        let mut due = now;
                        if waited_out {
                            due = due.min(entry.arrived + self.target);
                        }
                        if let (true, Some(pushed)) = (deep_enough, self.last_push) {
                            // Depth only grows on push, so it was reached by the latest one.
                            due = due.min(pushed.max(entry.arrived));
                        }
                        Head::Release(due)
                    } else {
                        Head::Wait
                    }
                }
                Slot::Empty => {
                    let overdue = self.head_since.is_some_and(|since| {
                        now.saturating_duration_since(since) >= self.loss_tolerance()
                    });
                    if overdue && self.has_later_frame() {
                        Head::Conceal
                    } else {
                        Head::Wait
                    }
                }
            };

            match head {
                Head::Skip => {
                    self.slots.pop_front();
                    let due = self.head_since.map_or(now, |since| since + self.frame_duration);
                    self.advance_pointer(due);
                }
                Head::Release(due) => return self.release_head(due),
                Head::Conceal => {
                    self.slots.pop_front();
                    if let Some(unit) = self.conceal_next() {
                        return Some(unit);
                    }
                }
                Head::Wait => return None,
            }
        }
    }

    /// Release every unit due at `now`.
    pub fn drain_ready(&mut self, now: Instant) -> Vec<Playout> {
        let mut out = Vec::new();
        while let Some(unit) = self.pop(now) {
            out.push(unit);
        }
        out
    }

    /// Release every buffered frame in order without waiting or concealing holes.
    pub fn flush(&mut self, now: Instant) -> Vec<Playout> {
        let mut out: Vec<Playout> = self.pending.drain(..).collect();
        let skipped = self.slots.len();
        for slot in std::mem::take(&mut self.slots) {
            if let Slot::Filled(entry) = slot {
                out.push(self.deliver(entry));
            }
        }
        if let Some(next) = self.next_seq {
            self.next_seq = Some(next.wrapping_add(skipped as u16));
        }
        self.head_since = Some(now);
        out
    }

    /// Discard every buffered frame belonging to `utterance`. Returns how many were dropped.
    pub fn purge_tag(&mut self, utterance: u64) -> usize {
        let mut dropped = 0;
        for slot in self.slots.iter_mut() {
            if matches!(slot, Slot::Filled(entry) if entry.utterance == Some(utterance)) {
                *slot = Slot::Discarded;
                dropped += 1;
            }
        }
        let before = self.pending.len();
        self.pending.retain(|unit| unit.utterance() != Some(utterance));
        dropped += before - self.pending.len();

        if self.last_utterance == Some(utterance) {
            self.last_payload = None;
        }
        self.stats.discarded += dropped as u64;
        if dropped > 0 {
            debug!(direction = self.direction.as_str(), utterance, dropped, "Purged buffered frames");
        }
        dropped
    }

    /// Earliest instant at which [`pop`](Self::pop) may release something new.
    pub fn next_deadline(&self) -> Option<Instant> {
        if !self.pending.is_empty() {
            return self.head_since;
        }
        match self.slots.front()? {
            Slot::Filled(entry) => {
                if self.buffered_depth() >= self.target {
                    Some(entry.arrived)
                } else {
                    Some(entry.arrived + self.target)
                }
            }
            Slot::Empty if self.has_later_frame() => {
                self.head_since.map(|since| since + self.loss_tolerance())
            }
            Slot::Empty => None,
            Slot::Discarded => self.head_since,
        }
    }

    pub fn stats(&self) -> JitterStats {
        self.stats
    }

    pub fn target_depth(&self) -> Duration {
        self.target
    }

    pub fn direction(&self) -> StreamDirection {
        self.direction
    }

    /// Next sequence number the playout pointer expects.
    pub fn next_seq(&self) -> Option<u16> {
        self.next_seq
    }

    /// Frames currently held.
    pub fn len(&self) -> usize {
        self.pending.len()
            + self
                .slots
                .iter()
                .filter(|slot| matches!(slot, Slot::Filled(_)))
                .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn loss_tolerance(&self) -> Duration {
        Duration::from_millis(self.config.loss_tolerance_ms)
    }

    fn buffered_depth(&self) -> Duration {
        let filled = self
            .slots
            .iter()
            .filter(|slot| matches!(slot, Slot::Filled(_)))
            .count();
        self.frame_duration * filled as u32
    }

    fn has_later_frame(&self) -> bool {
        self.slots
            .iter()
            .skip(1)
            .any(|slot| matches!(slot, Slot::Filled(_)))
    }

    fn retarget(&mut self) {
        let min = Duration::from_millis(self.config.min_depth_ms);
        let max = Duration::from_millis(self.config.max_depth_ms).max(min);
        let wanted = self.frame_duration
            + self
                .estimator
                .jitter()
                .mul_f64(self.config.jitter_multiplier.max(0.0));
        self.target = wanted.clamp(min, max);
    }

    /// Step the pointer; the new head is due from `due`.
    fn advance_pointer(&mut self, due: Instant) {
        if let Some(next) = self.next_seq {
            self.next_seq = Some(next.wrapping_add(1));
        }
        self.head_since = Some(due);
    }

    fn deliver(&mut self, entry: Entry) -> Playout {
        self.stats.delivered += 1;
        self.last_ts_ns = entry.frame.timestamp_ns();
        self.last_payload = Some(entry.frame.payload().clone());
        self.last_utterance = entry.utterance;
        Playout::Frame {
            frame: entry.frame,
            utterance: entry.utterance,
        }
    }

    fn release_head(&mut self, due: Instant) -> Option<Playout> {
        match self.slots.pop_front()? {
            Slot::Filled(entry) => {
                self.advance_pointer(due);
                Some(self.deliver(entry))
            }
            _ => None,
        }
    }

    /// Move the pointer past the head slot regardless of timing.
    fn force_advance(&mut self, now: Instant) {
        match self.slots.pop_front() {
            Some(Slot::Filled(entry)) => {
                self.advance_pointer(now);
                let unit = self.deliver(entry);
                self.pending.push_back(unit);
            }
            Some(Slot::Discarded) => self.advance_pointer(now),
            Some(Slot::Empty) | None => {
                if let Some(unit) = self.conceal_next() {
                    self.pending.push_back(unit);
                }
            }
        }
    }

    /// Conceal the sequence number under the pointer and advance past it.
    fn conceal_next(&mut self) -> Option<Playout> {
        let seq = self.next_seq?;
        self.next_seq = Some(seq.wrapping_add(1));
        // Consecutive holes become due one frame apart.
        self.head_since = self.head_since.map(|since| since + self.frame_duration);
        self.stats.lost += 1;

        let (payload, flags) = match self.codec {
            // An empty DTX frame tells the decoder to run packet loss concealment.
            Codec::Opus => (Bytes::new(), FrameFlags::new(true, false)),
            Codec::Pcm16 => match &self.last_payload {
                Some(last) if !last.is_empty() => {
                    (Bytes::from(pcm::attenuate_6db(last)), FrameFlags::default())
                }
                _ => (
                    Bytes::from(pcm::silence(self.samples_per_frame)),
                    FrameFlags::default(),
                ),
            },
        };

        self.last_ts_ns = self
            .last_ts_ns
            .saturating_add(self.frame_duration.as_nanos() as u64);
        if self.codec == Codec::Pcm16 {
            self.last_payload = Some(payload.clone());
        }

        debug!(direction = self.direction.as_str(), seq, "Concealed lost frame");
        match AudioFrame::new(self.session_id, self.last_ts_ns, seq, self.codec, flags, payload) {
            Ok(frame) => Some(Playout::Concealed {
                frame,
                utterance: self.last_utterance,
            }),
            Err(e) => {
                warn!(direction = self.direction.as_str(), seq, error = %e, "Concealment frame rejected");
                None
            }
        }
    }

    fn resync(&mut self, seq: u16, now: Instant) {
        warn!(
            direction = self.direction.as_str(),
            expected = ?self.next_seq,
            seq,
            "Sequence discontinuity, resynchronising"
        );
        for slot in std::mem::take(&mut self.slots) {
            if let Slot::Filled(entry) = slot {
                let unit = self.deliver(entry);
                self.pending.push_back(unit);
            }
        }
        self.next_seq = Some(seq);
        self.head_since = Some(now);
        self.estimator.reset();
        self.stats.resyncs += 1;
    }
}
