//! Per-session flow control.
//!
//! Every inter-stage boundary is a [`FlowQueue`] with hysteresis watermarks.
//! Backpressure is re-evaluated on each enqueue and dequeue: it is asserted
//! when depth reaches `high` and cleared only once depth falls to `low`.
//! Beyond the hard ceiling the queue sheds its lowest-priority frames.

use std::collections::VecDeque;

use serde::Serialize;
use tracing::{debug, warn};

use voxrelay_core::config::FlowConfig;
use voxrelay_core::frame::AudioFrame;
use voxrelay_core::protocol::ControlMessage;

use crate::jitter::Playout;

/// Which boundary a queue sits on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Boundary {
    /// Reordered client audio waiting for the recognition stage.
    Ingress,
    /// Gated synthesis audio waiting for the client transport.
    Egress,
}

impl Boundary {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Ingress => "ingress",
            Self::Egress => "egress",
        }
    }
}

/// Shedding priority, lowest first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ShedClass {
    Dtx,
    NonSpeech,
    Speech,
}

/// Items a [`FlowQueue`] may shed under overload. `None` is never shed.
pub trait Sheddable {
    fn shed_class(&self) -> Option<ShedClass>;
}

impl Sheddable for AudioFrame {
    fn shed_class(&self) -> Option<ShedClass> {
        Some(if self.is_dtx() {
            ShedClass::Dtx
        } else if self.is_speech() {
            ShedClass::Speech
        } else {
            ShedClass::NonSpeech
        })
    }
}

impl Sheddable for Playout {
    fn shed_class(&self) -> Option<ShedClass> {
        self.frame().shed_class()
    }
}

/// Something queued for the recognition stage.
#[derive(Debug, Clone, PartialEq)]
pub enum IngressItem {
    Audio(AudioFrame),
    /// The user stopped speaking after the audio queued ahead of it.
    EndOfUtterance,
}

impl Sheddable for IngressItem {
    fn shed_class(&self) -> Option<ShedClass> {
        match self {
            Self::Audio(frame) => frame.shed_class(),
            Self::EndOfUtterance => None,
        }
    }
}

/// Something queued for the client, kept in send order.
#[derive(Debug, Clone, PartialEq)]
pub enum EgressItem {
    Audio(Playout),
    /// Speech-state updates travel with the audio they describe.
    Control(ControlMessage),
}

impl EgressItem {
    pub fn utterance(&self) -> Option<u64> {
        match self {
            Self::Audio(unit) => unit.utterance(),
            Self::Control(_) => None,
        }
    }
}

impl Sheddable for EgressItem {
    fn shed_class(&self) -> Option<ShedClass> {
        match self {
            Self::Audio(unit) => unit.shed_class(),
            Self::Control(_) => None,
        }
    }
}

/// Backpressure transition reported by a queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlowSignal {
    Asserted,
    Cleared,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct FlowStats {
    pub enqueued: u64,
    pub dequeued: u64,
    pub shed: u64,
    pub peak_depth: usize,
    pub assertions: u64,
}

/// Result of an enqueue.
#[derive(Debug)]
pub struct Enqueued<T> {
    pub signal: Option<FlowSignal>,
    /// Frames dropped to get back under the hard ceiling.
    pub shed: Vec<T>,
}

/// A bounded-latency queue at one pipeline boundary.
#[derive(Debug)]
pub struct FlowQueue<T> {
    boundary: Boundary,
    low: usize,
    high: usize,
    ceiling: usize,
    items: VecDeque<T>,
    asserted: bool,
    stats: FlowStats,
}

impl<T: Sheddable> FlowQueue<T> {
    pub fn new(boundary: Boundary, config: &FlowConfig) -> Self {
        let high = config.high.max(1);
        let low = config.low.min(high - 1);
        Self {
            boundary,
            low,
            high,
            ceiling: config.hard_ceiling.max(high),
            items: VecDeque::new(),
            asserted: false,
            stats: FlowStats::default(),
        }
    }

    pub fn push(&mut self, item: T) -> Enqueued<T> {
        self.items.push_back(item);
        self.stats.enqueued += 1;

        let mut shed = Vec::new();
        while self.items.len() > self.ceiling {
            match self.shed_one() {
                Some(dropped) => shed.push(dropped),
                None => break,
            }
        }
        if !shed.is_empty() {
            self.stats.shed += shed.len() as u64;
            warn!(
                boundary = self.boundary.as_str(),
                dropped = shed.len(),
                depth = self.items.len(),
                "Hard ceiling exceeded, shedding frames"
            );
        }

        self.stats.peak_depth = self.stats.peak_depth.max(self.items.len());
        Enqueued {
            signal: self.evaluate(),
            shed,
        }
    }

    pub fn pop(&mut self) -> Option<(T, Option<FlowSignal>)> {
        let item = self.items.pop_front()?;
        self.stats.dequeued += 1;
        Some((item, self.evaluate()))
    }

    /// Put an item back at the head, e.g. after a failed hand-off downstream.
    pub fn push_front(&mut self, item: T) -> Option<FlowSignal> {
        self.items.push_front(item);
        self.stats.dequeued = self.stats.dequeued.saturating_sub(1);
        self.evaluate()
    }

    pub fn front(&self) -> Option<&T> {
        self.items.front()
    }

    /// Remove every item matching `pred`. Returns how many were removed and
    /// any resulting signal.
    pub fn purge(&mut self, mut pred: impl FnMut(&T) -> bool) -> (usize, Option<FlowSignal>) {
        let before = self.items.len();
        self.items.retain(|item| !pred(item));
        let removed = before - self.items.len();
        (removed, self.evaluate())
    }

    /// Drop everything, e.g. on teardown.
    pub fn clear(&mut self) -> Vec<T> {
        let drained = self.items.drain(..).collect();
        self.asserted = false;
        drained
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn is_asserted(&self) -> bool {
        self.asserted
    }

    pub fn boundary(&self) -> Boundary {
        self.boundary
    }

    pub fn stats(&self) -> FlowStats {
        self.stats
    }

    fn evaluate(&mut self) -> Option<FlowSignal> {
        let depth = self.items.len();
        if !self.asserted && depth >= self.high {
            self.asserted = true;
            self.stats.assertions += 1;
            debug!(boundary = self.boundary.as_str(), depth, "Backpressure asserted");
            Some(FlowSignal::Asserted)
        } else if self.asserted && depth <= self.low {
            self.asserted = false;
            debug!(boundary = self.boundary.as_str(), depth, "Backpressure cleared");
            Some(FlowSignal::Cleared)
        } else {
            None
        }
    }

    /// Oldest DTX frame first, then oldest non-speech frame, then the oldest frame.
    fn shed_one(&mut self) -> Option<T> {
        let index = self
            .position_of(|class| class == ShedClass::Dtx)
            .or_else(|| self.position_of(|class| class == ShedClass::NonSpeech))
            .or_else(|| self.position_of(|_| true))?;
        self.items.remove(index)
    }

    fn position_of(&self, wanted: impl Fn(ShedClass) -> bool) -> Option<usize> {
        self.items
            .iter()
            .position(|item| item.shed_class().is_some_and(&wanted))
    }
}

/// Flow state of one session: a queue per boundary.
#[derive(Debug)]
pub struct FlowController {
    pub ingress: FlowQueue<IngressItem>,
    pub egress: FlowQueue<EgressItem>,
}

impl FlowController {
    pub fn new(config: &FlowConfig) -> Self {
        Self {
            ingress: FlowQueue::new(Boundary::Ingress, config),
            egress: FlowQueue::new(Boundary::Egress, config),
        }
    }

    /// Current depth sample per boundary.
    pub fn depths(&self) -> [(Boundary, usize); 2] {
        [
            (Boundary::Ingress, self.ingress.len()),
            (Boundary::Egress, self.egress.len()),
        ]
    }

    pub fn clear(&mut self) {
        self.ingress.clear();
        self.egress.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use voxrelay_core::frame::{Codec, FrameFlags};

    fn config() -> FlowConfig {
        FlowConfig {
            low: 2,
            high: 5,
            hard_ceiling: 8,
            reduced_bitrate_factor: 0.5,
        }
    }

    fn frame(seq: u16, dtx: bool, speech: bool) -> AudioFrame {
        AudioFrame::new(1, 0, seq, Codec::Opus, FrameFlags::new(dtx, speech), Bytes::new()).unwrap()
    }

    fn speech(seq: u16) -> AudioFrame {
        frame(seq, false, true)
    }

    #[test]
    fn test_asserted_iff_high_with_hysteresis() {
        let mut q = FlowQueue::new(Boundary::Ingress, &config());
        let mut signals = Vec::new();

        // Fill to 7, drain to 0, observing the state after every event.
        for seq in 0..7 {
            let out = q.push(speech(seq));
            signals.extend(out.signal);
            let depth = q.len();
            if depth >= 5 {
                assert!(q.is_asserted(), "depth {depth} should be asserted");
            } else {
                assert!(!q.is_asserted(), "depth {depth} should be clear");
            }
        }
        while let Some((_, signal)) = q.pop() {
            signals.extend(signal);
            let depth = q.len();
            if depth > 2 {
                assert!(q.is_asserted(), "depth {depth} should still be asserted");
            } else {
                assert!(!q.is_asserted(), "depth {depth} should be clear");
            }
        }
        assert_eq!(signals, vec![FlowSignal::Asserted, FlowSignal::Cleared]);
    }

    #[test]
    fn test_no_oscillation_between_watermarks() {
        let mut q = FlowQueue::new(Boundary::Egress, &config());
        for seq in 0..5 {
            q.push(speech(seq));
        }
        assert!(q.is_asserted());

        // Bouncing between 3 and 4 never clears or re-asserts.
        q.pop();
        for seq in 0..10 {
            assert!(q.pop().unwrap().1.is_none());
            assert!(q.push(speech(seq)).signal.is_none());
        }
        assert!(q.is_asserted());
        assert_eq!(q.stats().assertions, 1);
    }

    #[test]
    fn test_sheds_dtx_before_non_speech_before_speech() {
        let mut q = FlowQueue::new(Boundary::Ingress, &config());
        q.push(speech(0));
        q.push(frame(1, false, false));
        q.push(speech(2));
        q.push(frame(3, true, false));
        for seq in 4..8 {
            q.push(speech(seq));
        }
        assert_eq!(q.len(), 8);

        let shed = q.push(speech(8)).shed;
        assert_eq!(shed.iter().map(AudioFrame::seq).collect::<Vec<_>>(), vec![3]);
        let shed = q.push(speech(9)).shed;
        assert_eq!(shed.iter().map(AudioFrame::seq).collect::<Vec<_>>(), vec![1]);
        let shed = q.push(speech(10)).shed;
        assert_eq!(shed.iter().map(AudioFrame::seq).collect::<Vec<_>>(), vec![0]);

        assert_eq!(q.len(), 8);
        assert_eq!(q.stats().shed, 3);
        // Remaining frames keep their relative order.
        let rest: Vec<u16> = std::iter::from_fn(|| q.pop().map(|(f, _)| f.seq())).collect();
        assert_eq!(rest, vec![2, 4, 5, 6, 7, 8, 9, 10]);
    }

    #[test]
    fn test_control_items_never_shed() {
        let mut q = FlowQueue::new(Boundary::Egress, &config());
        q.push(EgressItem::Control(ControlMessage::error("x", "first")));
        for seq in 0..8 {
            let unit = Playout::Frame {
                frame: speech(seq),
                utterance: Some(1),
            };
            q.push(EgressItem::Audio(unit));
        }
        assert_eq!(q.len(), 8);
        assert!(matches!(q.front(), Some(EgressItem::Control(_))));
        assert_eq!(q.stats().shed, 1);
    }

    #[test]
    fn test_purge_reevaluates() {
        let mut q = FlowQueue::new(Boundary::Ingress, &config());
        for seq in 0..6 {
            q.push(speech(seq));
        }
        assert!(q.is_asserted());
        let (removed, signal) = q.purge(|f| f.seq() < 4);
        assert_eq!(removed, 4);
        assert_eq!(signal, Some(FlowSignal::Cleared));
    }

    #[test]
    fn test_push_front_keeps_order() {
        let mut q = FlowQueue::new(Boundary::Ingress, &config());
        q.push(speech(0));
        q.push(speech(1));
        let (head, _) = q.pop().unwrap();
        q.push_front(head);
        assert_eq!(q.front().map(AudioFrame::seq), Some(0));
        assert_eq!(q.len(), 2);
    }

    #[test]
    fn test_controller_depths() {
        let mut flow = FlowController::new(&config());
        flow.ingress.push(IngressItem::Audio(speech(0)));
        assert_eq!(flow.depths(), [(Boundary::Ingress, 1), (Boundary::Egress, 0)]);
        flow.clear();
        assert!(flow.ingress.is_empty());
    }
}
