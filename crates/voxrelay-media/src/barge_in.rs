//! Barge-in coordinator.
//!
//! Decides which of the user or the agent owns the outbound channel. Every
//! synthesis chunk is gated through [`BargeInCoordinator::on_synthesis_chunk`];
//! side effects the pipeline must carry out are queued as [`BargeInAction`]s
//! and collected with [`BargeInCoordinator::take_actions`].

use std::collections::HashSet;
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, warn};

use voxrelay_core::config::BargeInConfig;
use voxrelay_core::protocol::TtsStatus;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BargeInState {
    Idle,
    UserSpeaking,
    AgentSpeaking { utterance: u64 },
    Interrupting { utterance: u64, deadline: Instant },
}

/// Whether a synthesis chunk may continue to the egress path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Gate {
    Forward,
    Suppressed,
}

/// Work the session pipeline must perform on behalf of the coordinator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BargeInAction {
    /// Ask the synthesis stage to stop producing audio for the utterance.
    CancelSynthesis { utterance: u64 },
    /// Drop anything already queued for egress that belongs to the utterance.
    DiscardBuffered { utterance: u64 },
    /// The cancellation was not acknowledged in time; tear the stream down.
    ForceTerminate { utterance: u64 },
    /// Tell the client about the agent's speech state.
    Notify(TtsStatus),
}

#[derive(Debug)]
pub struct BargeInCoordinator {
    state: BargeInState,
    hangover: Duration,
    cancel_timeout: Duration,
    /// Start of the current run of user silence.
    silence_since: Option<Instant>,
    /// Utterances at or above `latest` whose audio must never reach egress
    /// again. Anything older is refused through `latest` instead.
    suppressed: HashSet<u64>,
    /// Highest utterance that has been granted the channel.
    latest: Option<u64>,
    actions: Vec<BargeInAction>,
}

impl BargeInCoordinator {
    pub fn new(config: &BargeInConfig) -> Self {
        Self {
            state: BargeInState::Idle,
            hangover: Duration::from_millis(config.hangover_ms),
            cancel_timeout: Duration::from_millis(config.cancel_timeout_ms),
            silence_since: None,
            suppressed: HashSet::new(),
            latest: None,
            actions: Vec::new(),
        }
    }

    pub fn state(&self) -> BargeInState {
        self.state
    }

    /// The utterance currently driving outbound audio, if any.
    pub fn speaking(&self) -> Option<u64> {
        match self.state {
            BargeInState::AgentSpeaking { utterance } => Some(utterance),
            _ => None,
        }
    }

    pub fn is_suppressed(&self, utterance: u64) -> bool {
        self.suppressed.contains(&utterance) || self.superseded(utterance)
    }

    fn superseded(&self, utterance: u64) -> bool {
        self.latest.is_some_and(|latest| utterance < latest)
    }

    /// Voice activity reported for an inbound frame or `vad` message.
    pub fn on_inbound_vad(&mut self, speech: bool, now: Instant) {
        if !speech {
            if matches!(
                self.state,
                BargeInState::UserSpeaking | BargeInState::Interrupting { .. }
            ) && self.silence_since.is_none()
            {
                self.silence_since = Some(now);
            }
            return;
        }

        self.silence_since = None;
        match self.state {
            BargeInState::Idle => self.set_state(BargeInState::UserSpeaking),
            BargeInState::AgentSpeaking { utterance } => self.interrupt(utterance, now),
            BargeInState::UserSpeaking | BargeInState::Interrupting { .. } => {}
        }
    }

    /// Gate one synthesis chunk for `utterance`.
    pub fn on_synthesis_chunk(&mut self, utterance: u64) -> Gate {
        // Superseded utterances never interleave with a newer one.
        if self.suppressed.contains(&utterance) || self.superseded(utterance) {
            return Gate::Suppressed;
        }

        match self.state {
            BargeInState::Interrupting { .. } => {
                self.suppressed.insert(utterance);
                self.actions.push(BargeInAction::DiscardBuffered { utterance });
                self.actions.push(BargeInAction::CancelSynthesis { utterance });
                debug!(utterance, "Synthesis suppressed while interrupting");
                Gate::Suppressed
            }
            BargeInState::AgentSpeaking { utterance: current } if current == utterance => {
                Gate::Forward
            }
            BargeInState::AgentSpeaking { utterance: current } => {
                self.suppressed.insert(current);
                self.grant(utterance);
                Gate::Forward
            }
            BargeInState::Idle | BargeInState::UserSpeaking => {
                self.grant(utterance);
                self.actions.push(BargeInAction::Notify(TtsStatus::Speaking));
                Gate::Forward
            }
        }
    }

    /// The synthesis stage finished the utterance.
    pub fn on_utterance_complete(&mut self, utterance: u64) {
        if self.speaking() == Some(utterance) {
            self.set_state(BargeInState::Idle);
            self.actions.push(BargeInAction::Notify(TtsStatus::Done));
        }
    }

    /// The synthesis stage acknowledged cancellation of the utterance.
    pub fn on_cancel_ack(&mut self, utterance: u64) {
        if let BargeInState::Interrupting { utterance: pending, .. } = self.state {
            if pending == utterance {
                self.set_state(BargeInState::UserSpeaking);
            }
        }
    }

    /// Advance timers: user-silence hangover and the cancellation deadline.
    pub fn tick(&mut self, now: Instant) {
        match self.state {
            BargeInState::UserSpeaking => {
                if self
                    .silence_since
                    .is_some_and(|since| now.saturating_duration_since(since) >= self.hangover)
                {
                    self.silence_since = None;
                    self.set_state(BargeInState::Idle);
                }
            }
            BargeInState::Interrupting { utterance, deadline } if now >= deadline => {
                warn!(utterance, "Synthesis cancellation timed out, forcing termination");
                self.actions.push(BargeInAction::ForceTerminate { utterance });
                self.set_state(BargeInState::UserSpeaking);
            }
            _ => {}
        }
    }

    /// Next instant at which [`tick`](Self::tick) has work to do.
    pub fn next_deadline(&self) -> Option<Instant> {
        match self.state {
            BargeInState::UserSpeaking => self.silence_since.map(|since| since + self.hangover),
            BargeInState::Interrupting { deadline, .. } => Some(deadline),
            _ => None,
        }
    }

    /// Drain queued actions in the order they were raised.
    pub fn take_actions(&mut self) -> Vec<BargeInAction> {
        std::mem::take(&mut self.actions)
    }

    fn grant(&mut self, utterance: u64) {
        self.latest = Some(utterance);
        self.suppressed.retain(|&id| id >= utterance);
        self.set_state(BargeInState::AgentSpeaking { utterance });
    }

    fn interrupt(&mut self, utterance: u64, now: Instant) {
        self.suppressed.insert(utterance);
        self.set_state(BargeInState::Interrupting {
            utterance,
            deadline: now + self.cancel_timeout,
        });
        self.actions.push(BargeInAction::DiscardBuffered { utterance });
        self.actions.push(BargeInAction::CancelSynthesis { utterance });
        self.actions.push(BargeInAction::Notify(TtsStatus::Interrupted));
    }

    fn set_state(&mut self, next: BargeInState) {
        if std::mem::discriminant(&self.state) != std::mem::discriminant(&next) {
            debug!(from = ?self.state, to = ?next, "Barge-in transition");
        }
        self.state = next;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn coordinator() -> BargeInCoordinator {
        BargeInCoordinator::new(&BargeInConfig::default())
    }

    #[test]
    fn test_user_speech_and_hangover() {
        let mut c = coordinator();
        let t0 = Instant::now();
        c.on_inbound_vad(true, t0);
        assert_eq!(c.state(), BargeInState::UserSpeaking);

        c.on_inbound_vad(false, t0 + Duration::from_millis(100));
        c.tick(t0 + Duration::from_millis(300));
        assert_eq!(c.state(), BargeInState::UserSpeaking);
        assert_eq!(c.next_deadline(), Some(t0 + Duration::from_millis(400)));

        c.tick(t0 + Duration::from_millis(400));
        assert_eq!(c.state(), BargeInState::Idle);
    }

    #[test]
    fn test_speech_resets_hangover() {
        let mut c = coordinator();
        let t0 = Instant::now();
        c.on_inbound_vad(true, t0);
        c.on_inbound_vad(false, t0);
        c.on_inbound_vad(true, t0 + Duration::from_millis(200));
        c.tick(t0 + Duration::from_millis(400));
        assert_eq!(c.state(), BargeInState::UserSpeaking);
        assert_eq!(c.next_deadline(), None);
    }

    #[test]
    fn test_agent_speaks_then_completes() {
        let mut c = coordinator();
        assert_eq!(c.on_synthesis_chunk(1), Gate::Forward);
        assert_eq!(c.state(), BargeInState::AgentSpeaking { utterance: 1 });
        assert_eq!(c.on_synthesis_chunk(1), Gate::Forward);
        c.on_utterance_complete(1);
        assert_eq!(c.state(), BargeInState::Idle);
        assert_eq!(
            c.take_actions(),
            vec![
                BargeInAction::Notify(TtsStatus::Speaking),
                BargeInAction::Notify(TtsStatus::Done),
            ]
        );
    }

    #[test]
    fn test_barge_in_suppresses_interrupted_utterance() {
        let mut c = coordinator();
        let t0 = Instant::now();
        assert_eq!(c.on_synthesis_chunk(7), Gate::Forward);
        c.take_actions();

        c.on_inbound_vad(true, t0);
        assert!(matches!(c.state(), BargeInState::Interrupting { utterance: 7, .. }));
        assert_eq!(
            c.take_actions(),
            vec![
                BargeInAction::DiscardBuffered { utterance: 7 },
                BargeInAction::CancelSynthesis { utterance: 7 },
                BargeInAction::Notify(TtsStatus::Interrupted),
            ]
        );

        // Nothing of utterance 7 gets through, before or after the acknowledgement.
        assert_eq!(c.on_synthesis_chunk(7), Gate::Suppressed);
        c.on_cancel_ack(7);
        assert_eq!(c.state(), BargeInState::UserSpeaking);
        for _ in 0..10 {
            assert_eq!(c.on_synthesis_chunk(7), Gate::Suppressed);
        }
        c.on_utterance_complete(7);
        assert_eq!(c.state(), BargeInState::UserSpeaking);
        assert!(c.take_actions().is_empty());
    }

    #[test]
    fn test_cancel_timeout_forces_transition() {
        let mut c = coordinator();
        let t0 = Instant::now();
        c.on_synthesis_chunk(3);
        c.on_inbound_vad(true, t0);
        c.take_actions();

        assert_eq!(c.next_deadline(), Some(t0 + Duration::from_millis(50)));
        c.tick(t0 + Duration::from_millis(49));
        assert!(matches!(c.state(), BargeInState::Interrupting { .. }));

        c.tick(t0 + Duration::from_millis(50));
        assert_eq!(c.state(), BargeInState::UserSpeaking);
        assert_eq!(c.take_actions(), vec![BargeInAction::ForceTerminate { utterance: 3 }]);

        // A late acknowledgement changes nothing.
        c.on_cancel_ack(3);
        assert_eq!(c.state(), BargeInState::UserSpeaking);
        assert_eq!(c.on_synthesis_chunk(3), Gate::Suppressed);
    }

    #[test]
    fn test_newer_utterance_during_interrupt_is_suppressed() {
        let mut c = coordinator();
        let t0 = Instant::now();
        c.on_synthesis_chunk(1);
        c.on_inbound_vad(true, t0);
        c.take_actions();

        assert_eq!(c.on_synthesis_chunk(2), Gate::Suppressed);
        assert!(c.is_suppressed(2));
        assert_eq!(
            c.take_actions(),
            vec![
                BargeInAction::DiscardBuffered { utterance: 2 },
                BargeInAction::CancelSynthesis { utterance: 2 },
            ]
        );
    }

    #[test]
    fn test_next_utterance_after_barge_in_speaks() {
        let mut c = coordinator();
        let t0 = Instant::now();
        c.on_synthesis_chunk(1);
        c.on_inbound_vad(true, t0);
        c.on_cancel_ack(1);
        c.take_actions();

        assert_eq!(c.on_synthesis_chunk(2), Gate::Forward);
        assert_eq!(c.speaking(), Some(2));
        assert_eq!(c.take_actions(), vec![BargeInAction::Notify(TtsStatus::Speaking)]);
    }

    #[test]
    fn test_newer_utterance_supersedes_older() {
        let mut c = coordinator();
        c.on_synthesis_chunk(1);
        assert_eq!(c.on_synthesis_chunk(2), Gate::Forward);
        assert_eq!(c.speaking(), Some(2));
        // Stragglers of the older utterance never interleave.
        assert_eq!(c.on_synthesis_chunk(1), Gate::Suppressed);
    }

    #[test]
    fn test_suppressed_history_stays_bounded() {
        let mut c = coordinator();
        let t0 = Instant::now();
        for utterance in 1..=50u64 {
            assert_eq!(c.on_synthesis_chunk(utterance), Gate::Forward);
            c.on_inbound_vad(true, t0);
            c.on_cancel_ack(utterance);
            c.take_actions();
        }
        assert_eq!(c.suppressed.len(), 1);
        // Pruned ids stay refused.
        for utterance in [1, 25, 49, 50] {
            assert!(c.is_suppressed(utterance));
            assert_eq!(c.on_synthesis_chunk(utterance), Gate::Suppressed);
        }
        assert!(c.take_actions().is_empty());
        assert_eq!(c.suppressed.len(), 1);
    }

    #[test]
    fn test_at_most_one_speaker() {
        let mut c = coordinator();
        let t0 = Instant::now();
        c.on_inbound_vad(true, t0);
        c.on_synthesis_chunk(1);
        assert_eq!(c.state(), BargeInState::AgentSpeaking { utterance: 1 });
        // Fresh user speech while the agent talks interrupts rather than overlapping.
        c.on_inbound_vad(true, t0 + Duration::from_millis(10));
        assert!(matches!(c.state(), BargeInState::Interrupting { .. }));
    }
}
