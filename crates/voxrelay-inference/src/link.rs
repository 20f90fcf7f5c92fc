//! Supervised links to external inference stages.
//!
//! A [`StageHandle`] owns two bounded queues (router -> stage, stage ->
//! router), a control channel and a cancellation token. A supervisor task
//! drives the [`StageBackend`]: when a run fails it reconnects with bounded
//! exponential backoff, replaying the item that was in flight if nothing was
//! emitted for it. Once `max_attempts` consecutive runs fail, the link reports
//! [`LinkEvent::Degraded`] and keeps probing at `max_delay`; the first event
//! after that is preceded by [`LinkEvent::Restored`].

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use voxrelay_core::protocol::StageKind;

use crate::retry::RetryPolicy;

/// What the router sees from a stage.
#[derive(Debug, Clone, PartialEq)]
pub enum LinkEvent<E> {
    Event(E),
    /// Reconnection attempts are exhausted.
    Degraded { attempts: u32, error: String },
    /// A degraded stage produced output again.
    Restored,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkControl {
    /// Abandon the current run without waiting for it to finish.
    Restart,
}

/// One external stage implementation.
///
/// `run` processes inputs until the input side closes (return `Ok`) or the
/// underlying stream breaks (return `Err`, and the supervisor reconnects).
#[async_trait]
pub trait StageBackend<I, E>: Send + Sync
where
    I: Send + 'static,
    E: Send + 'static,
{
    fn kind(&self) -> StageKind;

    /// Provider identifier used in logs.
    fn id(&self) -> &str;

    async fn run(&self, io: &mut StreamIo<'_, I, E>) -> anyhow::Result<()>;
}

/// Sending half of a stage's event queue, shared by every run of the stage.
pub struct EventSink<E> {
    kind: StageKind,
    tx: mpsc::Sender<LinkEvent<E>>,
    degraded: AtomicBool,
    progressed: AtomicBool,
}

impl<E: Send> EventSink<E> {
    fn new(kind: StageKind, tx: mpsc::Sender<LinkEvent<E>>) -> Self {
        Self {
            kind,
            tx,
            degraded: AtomicBool::new(false),
            progressed: AtomicBool::new(false),
        }
    }

    /// Deliver an event to the router. Returns `false` once the router is gone.
    pub async fn emit(&self, event: E) -> bool {
        if self.degraded.swap(false, Ordering::AcqRel) {
            info!(stage = self.kind.as_str(), "Stage restored");
            if self.tx.send(LinkEvent::Restored).await.is_err() {
                return false;
            }
        }
        self.progressed.store(true, Ordering::Release);
        self.tx.send(LinkEvent::Event(event)).await.is_ok()
    }

    pub fn is_degraded(&self) -> bool {
        self.degraded.load(Ordering::Acquire)
    }

    /// Report degradation once per outage.
    async fn degrade(&self, attempts: u32, error: String) -> bool {
        if self.degraded.swap(true, Ordering::AcqRel) {
            return true;
        }
        warn!(stage = self.kind.as_str(), attempts, %error, "Stage degraded");
        self.tx
            .send(LinkEvent::Degraded { attempts, error })
            .await
            .is_ok()
    }

    fn take_progress(&self) -> bool {
        self.progressed.swap(false, Ordering::AcqRel)
    }
}

/// The view a backend run has of its link.
pub struct StreamIo<'a, I, E> {
    input: &'a mut mpsc::Receiver<I>,
    sink: &'a EventSink<E>,
    deferred: VecDeque<I>,
    in_flight: Option<I>,
    /// Output was emitted since the in-flight item was taken.
    touched: AtomicBool,
}

impl<'a, I: Clone + Send, E: Send> StreamIo<'a, I, E> {
    fn new(input: &'a mut mpsc::Receiver<I>, sink: &'a EventSink<E>, replay: VecDeque<I>) -> Self {
        Self {
            input,
            sink,
            deferred: replay,
            in_flight: None,
            touched: AtomicBool::new(false),
        }
    }

    /// Next item to work on, or `None` once the router has hung up.
    ///
    /// The item counts as in flight until [`complete`](Self::complete) or the
    /// next `recv`.
    pub async fn recv(&mut self) -> Option<I> {
        let item = match self.deferred.pop_front() {
            Some(item) => item,
            None => self.input.recv().await?,
        };
        self.in_flight = Some(item.clone());
        self.touched.store(false, Ordering::Release);
        Some(item)
    }

    /// Wait for newly queued input while busy with another item, e.g. to
    /// watch for `Cancel`. Deferred items are not returned and the in-flight
    /// item is unchanged.
    pub async fn recv_interrupt(&mut self) -> Option<I> {
        self.input.recv().await
    }

    /// Non-blocking [`recv_interrupt`](Self::recv_interrupt).
    pub fn try_recv_interrupt(&mut self) -> Option<I> {
        self.input.try_recv().ok()
    }

    /// Queue an item picked up early so `recv` returns it in order.
    pub fn defer(&mut self, item: I) {
        self.deferred.push_back(item);
    }

    /// The in-flight item's output is fully emitted.
    pub fn complete(&mut self) {
        self.in_flight = None;
    }

    pub async fn emit(&self, event: E) -> bool {
        self.touched.store(true, Ordering::Release);
        self.sink.emit(event).await
    }

    /// Items to hand to the next run after a failure. Output already emitted
    /// for the in-flight item cannot be taken back, so only an untouched item
    /// is replayed.
    fn into_replay(self) -> VecDeque<I> {
        let mut replay = self.deferred;
        if !self.touched.load(Ordering::Acquire) {
            if let Some(item) = self.in_flight {
                replay.push_front(item);
            }
        }
        replay
    }
}

enum Outcome {
    Cancelled,
    Finished,
    Restarted,
    Failed(anyhow::Error),
}

async fn supervise<I, E>(
    backend: Arc<dyn StageBackend<I, E>>,
    mut input: mpsc::Receiver<I>,
    sink: EventSink<E>,
    mut control: mpsc::Receiver<LinkControl>,
    policy: RetryPolicy,
    cancel: CancellationToken,
) where
    I: Clone + Send + 'static,
    E: Send + 'static,
{
    let stage = backend.kind().as_str();
    let mut failures = 0u32;
    let mut replay = VecDeque::new();

    loop {
        let mut io = StreamIo::new(&mut input, &sink, std::mem::take(&mut replay));
        let outcome = tokio::select! {
            _ = cancel.cancelled() => Outcome::Cancelled,
            Some(LinkControl::Restart) = control.recv() => Outcome::Restarted,
            result = backend.run(&mut io) => match result {
                Ok(()) => Outcome::Finished,
                Err(e) => Outcome::Failed(e),
            },
        };
        let progressed = sink.take_progress();

        let error = match outcome {
            Outcome::Cancelled => break,
            Outcome::Finished => {
                debug!(stage, "Stage input closed");
                break;
            }
            Outcome::Restarted => {
                warn!(stage, backend = backend.id(), "Stage run force-terminated");
                replay = io.deferred;
                continue;
            }
            Outcome::Failed(error) => {
                replay = io.into_replay();
                error
            }
        };

        if progressed {
            failures = 0;
        }
        failures += 1;

        if failures < policy.max_attempts {
            let delay = policy.delay_for_attempt(failures);
            warn!(
                stage,
                backend = backend.id(),
                attempt = failures,
                delay_ms = delay.as_millis() as u64,
                error = %error,
                "Stage stream failed, reconnecting"
            );
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(delay) => {}
            }
            continue;
        }

        if !sink.degrade(failures, error.to_string()).await {
            break;
        }
        replay.clear();

        // Input arriving while degraded is stale by the time the stage is back.
        let probe = tokio::time::sleep(policy.max_delay);
        tokio::pin!(probe);
        let mut dropped = 0usize;
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = &mut probe => break,
                item = input.recv() => match item {
                    Some(_) => dropped += 1,
                    None => return,
                },
            }
        }
        debug!(stage, dropped, "Probing degraded stage");
    }

    debug!(stage, "Stage link closed");
}

/// Router-side end of a supervised stage link.
pub struct StageHandle<I, E> {
    kind: StageKind,
    input: mpsc::Sender<I>,
    events: mpsc::Receiver<LinkEvent<E>>,
    control: mpsc::Sender<LinkControl>,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl<I, E> StageHandle<I, E>
where
    I: Clone + Send + 'static,
    E: Send + 'static,
{
    /// Open a link whose lifetime is bounded by `parent`.
    pub fn spawn(
        backend: Arc<dyn StageBackend<I, E>>,
        queue: usize,
        policy: RetryPolicy,
        parent: &CancellationToken,
    ) -> Self {
        let kind = backend.kind();
        let queue = queue.max(1);
        let (input_tx, input_rx) = mpsc::channel(queue);
        let (event_tx, event_rx) = mpsc::channel(queue);
        let (control_tx, control_rx) = mpsc::channel(4);
        let cancel = parent.child_token();

        debug!(stage = kind.as_str(), backend = backend.id(), queue, "Stage link opened");
        let task = tokio::spawn(supervise(
            backend,
            input_rx,
            EventSink::new(kind, event_tx),
            control_rx,
            policy,
            cancel.clone(),
        ));

        Self {
            kind,
            input: input_tx,
            events: event_rx,
            control: control_tx,
            cancel,
            task,
        }
    }

    pub fn kind(&self) -> StageKind {
        self.kind
    }

    pub fn try_send(&self, item: I) -> Result<(), mpsc::error::TrySendError<I>> {
        self.input.try_send(item)
    }

    /// A feeding end that can wait for queue space while events are being
    /// received through `&mut self`.
    pub fn sender(&self) -> mpsc::Sender<I> {
        self.input.clone()
    }

    pub async fn recv(&mut self) -> Option<LinkEvent<E>> {
        self.events.recv().await
    }

    /// Force-terminate the current run. Queued input is kept.
    pub fn restart(&self) -> bool {
        self.control.try_send(LinkControl::Restart).is_ok()
    }

    /// Cancel every outstanding call on this link.
    pub fn close(&self) {
        self.cancel.cancel();
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

impl<I, E> Drop for StageHandle<I, E> {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;
    use std::time::Duration;

    struct Scripted {
        fail_runs: AtomicU32,
        hang_on: Option<u32>,
    }

    impl Scripted {
        fn new(fail_runs: u32, hang_on: Option<u32>) -> Arc<Self> {
            Arc::new(Self {
                fail_runs: AtomicU32::new(fail_runs),
                hang_on,
            })
        }
    }

    #[async_trait]
    impl StageBackend<u32, u32> for Scripted {
        fn kind(&self) -> StageKind {
            StageKind::Reasoning
        }

        fn id(&self) -> &str {
            "scripted"
        }

        async fn run(&self, io: &mut StreamIo<'_, u32, u32>) -> anyhow::Result<()> {
            while let Some(n) = io.recv().await {
                if self.fail_runs.load(Ordering::SeqCst) > 0 {
                    self.fail_runs.fetch_sub(1, Ordering::SeqCst);
                    anyhow::bail!("stream dropped");
                }
                if self.hang_on == Some(n) {
                    std::future::pending::<()>().await;
                }
                if !io.emit(n * 10).await {
                    break;
                }
                io.complete();
            }
            Ok(())
        }
    }

    fn policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(1),
            jitter_factor: 0.0,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_events_pass_through() {
        let root = CancellationToken::new();
        let mut link = StageHandle::spawn(Scripted::new(0, None), 4, policy(3), &root);
        link.try_send(1).unwrap();
        link.try_send(2).unwrap();
        assert_eq!(link.recv().await, Some(LinkEvent::Event(10)));
        assert_eq!(link.recv().await, Some(LinkEvent::Event(20)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnect_replays_untouched_item() {
        let root = CancellationToken::new();
        let mut link = StageHandle::spawn(Scripted::new(2, None), 4, policy(5), &root);
        link.try_send(7).unwrap();
        assert_eq!(link.recv().await, Some(LinkEvent::Event(70)));
        link.try_send(8).unwrap();
        assert_eq!(link.recv().await, Some(LinkEvent::Event(80)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_degraded_then_restored() {
        let root = CancellationToken::new();
        let backend = Scripted::new(u32::MAX, None);
        let mut link = StageHandle::spawn(backend.clone(), 4, policy(2), &root);

        link.try_send(1).unwrap();
        match link.recv().await {
            Some(LinkEvent::Degraded { attempts, .. }) => assert_eq!(attempts, 2),
            other => panic!("expected degraded, got {other:?}"),
        }

        backend.fail_runs.store(0, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(1100)).await;
        link.try_send(2).unwrap();
        assert_eq!(link.recv().await, Some(LinkEvent::Restored));
        assert_eq!(link.recv().await, Some(LinkEvent::Event(20)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_restart_abandons_stuck_run() {
        let root = CancellationToken::new();
        let mut link = StageHandle::spawn(Scripted::new(0, Some(1)), 4, policy(3), &root);
        link.try_send(1).unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;

        assert!(link.restart());
        link.try_send(2).unwrap();
        assert_eq!(link.recv().await, Some(LinkEvent::Event(20)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_parent_cancel_closes_link() {
        let root = CancellationToken::new();
        let mut link = StageHandle::spawn(Scripted::new(0, Some(1)), 4, policy(3), &root);
        link.try_send(1).unwrap();
        root.cancel();
        assert_eq!(link.recv().await, None);
    }
}
