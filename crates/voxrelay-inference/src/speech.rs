//! Input handling shared by synthesis backends.

use std::collections::HashSet;

use crate::link::StreamIo;
use crate::{SynthesisEvent, SynthesisInput};

type SynthesisIo<'a, 'b> = &'a mut StreamIo<'b, SynthesisInput, SynthesisEvent>;

/// What to do with the utterance being rendered.
pub(crate) enum Step {
    Continue,
    Stop,
    /// The router hung up.
    Gone,
}

/// Cancelled utterances and pause state of one synthesis run.
#[derive(Default)]
pub(crate) struct SpeechState {
    cancelled: HashSet<u64>,
    pub paused: bool,
}

impl SpeechState {
    pub fn is_cancelled(&self, utterance: u64) -> bool {
        self.cancelled.contains(&utterance)
    }

    /// Mark `utterance` cancelled and acknowledge it.
    pub async fn cancel(&mut self, io: SynthesisIo<'_, '_>, utterance: u64) -> bool {
        self.cancelled.insert(utterance);
        io.emit(SynthesisEvent::Cancelled { utterance }).await
    }

    /// Apply an item that arrived while `speaking` was being rendered.
    pub async fn interrupt(
        &mut self,
        io: SynthesisIo<'_, '_>,
        item: SynthesisInput,
        speaking: u64,
    ) -> Step {
        match item {
            SynthesisInput::Cancel { utterance } => {
                if !self.cancel(io, utterance).await {
                    Step::Gone
                } else if utterance == speaking {
                    Step::Stop
                } else {
                    Step::Continue
                }
            }
            SynthesisInput::Pause => {
                self.paused = true;
                Step::Continue
            }
            SynthesisInput::Resume => {
                self.paused = false;
                Step::Continue
            }
            other => {
                io.defer(other);
                Step::Continue
            }
        }
    }

    /// Drain queued interrupts between chunks. Blocks while paused.
    pub async fn poll_interrupts(&mut self, io: SynthesisIo<'_, '_>, speaking: u64) -> Step {
        loop {
            let next = if self.paused {
                match io.recv_interrupt().await {
                    Some(item) => item,
                    None => return Step::Gone,
                }
            } else {
                match io.try_recv_interrupt() {
                    Some(item) => item,
                    None => return Step::Continue,
                }
            };
            match self.interrupt(io, next, speaking).await {
                Step::Continue => {}
                step => return step,
            }
        }
    }

    /// Handle any top-level item other than `Speak`. Returns `false` once the
    /// router is gone.
    pub async fn handle(&mut self, io: SynthesisIo<'_, '_>, item: SynthesisInput) -> bool {
        match item {
            SynthesisInput::Finish { utterance } => {
                self.is_cancelled(utterance)
                    || io.emit(SynthesisEvent::Complete { utterance }).await
            }
            SynthesisInput::Cancel { utterance } => self.cancel(io, utterance).await,
            SynthesisInput::Pause => {
                self.paused = true;
                true
            }
            SynthesisInput::Resume => {
                self.paused = false;
                true
            }
            SynthesisInput::Speak { .. } => true,
        }
    }
}
