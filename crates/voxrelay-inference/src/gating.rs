//! Decides when recognized text is handed to the reasoning stage.
//!
//! A final transcript always opens the gate. A partial can open it early
//! when its confidence reaches the threshold and it stays unchanged for
//! `pause_ms`. Text forwarded early is not forwarded again when the matching
//! final arrives.

use std::time::Duration;

use tokio::time::Instant;
use tracing::debug;

use voxrelay_core::config::GatingConfig;

#[derive(Debug)]
struct Pending {
    text: String,
    since: Instant,
}

#[derive(Debug)]
pub struct GatingPolicy {
    threshold: f32,
    pause: Duration,
    pending: Option<Pending>,
    fired: Option<String>,
}

impl GatingPolicy {
    pub fn new(config: &GatingConfig) -> Self {
        Self {
            threshold: config.partial_confidence,
            pause: Duration::from_millis(config.pause_ms),
            pending: None,
            fired: None,
        }
    }

    pub fn on_partial(&mut self, text: &str, confidence: f32, now: Instant) {
        let text = text.trim();
        if text.is_empty() || confidence < self.threshold {
            self.pending = None;
            return;
        }
        if self.fired.as_deref() == Some(text) {
            return;
        }
        match &self.pending {
            Some(pending) if pending.text == text => {}
            _ => {
                self.pending = Some(Pending {
                    text: text.to_string(),
                    since: now,
                })
            }
        }
    }

    /// Returns the text to forward if a confident partial has been stable long enough.
    pub fn tick(&mut self, now: Instant) -> Option<String> {
        let due = self.next_deadline()?;
        if now < due {
            return None;
        }
        let pending = self.pending.take()?;
        debug!(chars = pending.text.len(), "Gate opened on stable partial");
        self.fired = Some(pending.text.clone());
        Some(pending.text)
    }

    /// Returns the text to forward for a final transcript, unless it was
    /// already forwarded from a partial.
    pub fn on_final(&mut self, text: &str) -> Option<String> {
        self.pending = None;
        let fired = self.fired.take();
        let text = text.trim();
        if text.is_empty() {
            return None;
        }
        if fired.as_deref() == Some(text) {
            debug!("Final transcript already forwarded");
            return None;
        }
        Some(text.to_string())
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.pending.as_ref().map(|p| p.since + self.pause)
    }

    pub fn reset(&mut self) {
        self.pending = None;
        self.fired = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy() -> GatingPolicy {
        GatingPolicy::new(&GatingConfig {
            partial_confidence: 0.8,
            pause_ms: 600,
        })
    }

    fn ms(n: u64) -> Duration {
        Duration::from_millis(n)
    }

    #[test]
    fn test_final_always_forwards() {
        let mut gate = policy();
        assert_eq!(gate.on_final(" hello there "), Some("hello there".into()));
        assert_eq!(gate.on_final("   "), None);
    }

    #[test]
    fn test_low_confidence_partial_never_fires() {
        let mut gate = policy();
        let t0 = Instant::now();
        gate.on_partial("hello", 0.5, t0);
        assert_eq!(gate.next_deadline(), None);
        assert_eq!(gate.tick(t0 + ms(5000)), None);
    }

    #[test]
    fn test_stable_confident_partial_fires_once() {
        let mut gate = policy();
        let t0 = Instant::now();
        gate.on_partial("book a table", 0.9, t0);
        assert_eq!(gate.tick(t0 + ms(599)), None);
        assert_eq!(gate.tick(t0 + ms(600)), Some("book a table".into()));
        assert_eq!(gate.tick(t0 + ms(2000)), None);

        // The same text repeated as a partial or final is not forwarded again.
        gate.on_partial("book a table", 0.95, t0 + ms(700));
        assert_eq!(gate.next_deadline(), None);
        assert_eq!(gate.on_final("book a table"), None);
    }

    #[test]
    fn test_changing_partial_restarts_pause() {
        let mut gate = policy();
        let t0 = Instant::now();
        gate.on_partial("book a", 0.9, t0);
        gate.on_partial("book a table", 0.9, t0 + ms(400));
        assert_eq!(gate.tick(t0 + ms(700)), None);
        assert_eq!(gate.next_deadline(), Some(t0 + ms(1000)));
        assert_eq!(gate.tick(t0 + ms(1000)), Some("book a table".into()));
    }

    #[test]
    fn test_revised_final_forwards_after_early_fire() {
        let mut gate = policy();
        let t0 = Instant::now();
        gate.on_partial("book a table", 0.9, t0);
        gate.tick(t0 + ms(600));
        assert_eq!(
            gate.on_final("book a table for two"),
            Some("book a table for two".into())
        );
    }

    #[test]
    fn test_uncertain_revision_cancels_pending() {
        let mut gate = policy();
        let t0 = Instant::now();
        gate.on_partial("book a table", 0.9, t0);
        gate.on_partial("book a tab", 0.3, t0 + ms(100));
        assert_eq!(gate.tick(t0 + ms(1000)), None);
    }
}
