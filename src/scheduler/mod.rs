//! Reconciliation scheduler
//!
//! Turns a stream of object keys into reconcile passes. For any one key at
//! most one pass runs at a time; notifications that arrive while it runs
//! collapse into a single follow-up pass. Failed passes are retried with
//! exponential backoff, successful ones are requeued only when the
//! reconciler asks for it.

pub mod watch;

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::{Stream, StreamExt};
use parking_lot::Mutex;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn, Instrument};

use crate::metrics::{ReconcileTimer, RECONCILE_IN_FLIGHT};
use crate::registry::Kind;
use crate::retry::RetryConfig;
use crate::store::ObjectKey;
use crate::{Error, Result};

/// What the scheduler should do after a successful pass
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Action {
    requeue_after: Option<Duration>,
}

impl Action {
    /// Wait for the next change notification
    pub fn await_change() -> Self {
        Self {
            requeue_after: None,
        }
    }

    /// Run another pass after `delay`
    pub fn requeue(delay: Duration) -> Self {
        Self {
            requeue_after: Some(delay),
        }
    }

    /// Run another pass immediately
    pub fn requeue_now() -> Self {
        Self::requeue(Duration::ZERO)
    }

    /// Requested delay before the next pass, if any
    pub fn requeue_after(&self) -> Option<Duration> {
        self.requeue_after
    }
}

/// Entry point the scheduler calls for one object kind
#[async_trait]
pub trait Reconciler: Send + Sync {
    /// Run one pass for `key`; collaborator calls must finish by `deadline`
    async fn reconcile(&self, key: &ObjectKey, deadline: Instant) -> Result<Action>;
}

/// Scheduler tuning
#[derive(Clone, Debug)]
pub struct SchedulerConfig {
    /// Deadline handed to each pass
    pub reconcile_timeout: Duration,
    /// Extra time before the scheduler abandons a pass that ignores its deadline
    pub grace: Duration,
    /// Backoff applied to consecutive failures of one key
    pub backoff: RetryConfig,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            reconcile_timeout: Duration::from_secs(600),
            grace: Duration::from_secs(5),
            backoff: RetryConfig {
                max_attempts: 0,
                initial_delay: Duration::from_secs(1),
                max_delay: Duration::from_secs(300),
                backoff_multiplier: 2.0,
            },
        }
    }
}

#[derive(Debug, Default)]
struct KeyState {
    running: bool,
    dirty: bool,
    failures: u32,
    timer: u64,
    timer_pending: bool,
}

/// Per-key dispatcher over a table of reconcilers
pub struct Scheduler {
    reconcilers: HashMap<Kind, Arc<dyn Reconciler>>,
    config: SchedulerConfig,
    state: Mutex<HashMap<ObjectKey, KeyState>>,
    tracker: TaskTracker,
    cancel: CancellationToken,
    running: AtomicBool,
}

impl Scheduler {
    /// Create a scheduler with no reconcilers
    pub fn new(config: SchedulerConfig) -> Self {
        Self {
            reconcilers: HashMap::new(),
            config,
            state: Mutex::new(HashMap::new()),
            tracker: TaskTracker::new(),
            cancel: CancellationToken::new(),
            running: AtomicBool::new(false),
        }
    }

    /// Route keys of `kind` to `reconciler`
    pub fn register(mut self, kind: Kind, reconciler: Arc<dyn Reconciler>) -> Self {
        self.reconcilers.insert(kind, reconciler);
        self
    }

    /// Token that stops the scheduler when cancelled
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// True while [`Scheduler::run`] is consuming events
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// True if no pass is running and no retry is pending
    pub fn is_idle(&self) -> bool {
        self.state
            .lock()
            .values()
            .all(|s| !s.running && !s.timer_pending)
    }

    /// Consecutive failures recorded for a key
    pub fn failures(&self, key: &ObjectKey) -> u32 {
        self.state.lock().get(key).map(|s| s.failures).unwrap_or(0)
    }

    /// Consume `events` until the stream ends or the scheduler is cancelled,
    /// then wait for in-flight passes to finish
    pub async fn run<S>(self: Arc<Self>, events: S)
    where
        S: Stream<Item = ObjectKey> + Send,
    {
        self.running.store(true, Ordering::SeqCst);
        info!(kinds = self.reconcilers.len(), "scheduler started");

        tokio::pin!(events);
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    debug!("scheduler cancelled");
                    break;
                }
                event = events.next() => match event {
                    Some(key) => self.enqueue(key),
                    None => {
                        debug!("event stream ended");
                        break;
                    }
                }
            }
        }

        self.running.store(false, Ordering::SeqCst);
        self.shutdown().await;
        info!("scheduler stopped");
    }

    /// Stop intake and wait for in-flight passes
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        self.tracker.close();
        self.tracker.wait().await;
    }

    /// Request a pass for `key`
    pub fn enqueue(self: &Arc<Self>, key: ObjectKey) {
        if self.cancel.is_cancelled() {
            return;
        }
        {
            let mut state = self.state.lock();
            let entry = state.entry(key.clone()).or_default();
            if entry.running {
                entry.dirty = true;
                return;
            }
            // A fresh pass supersedes any pending retry timer.
            entry.running = true;
            entry.timer += 1;
            entry.timer_pending = false;
        }

        RECONCILE_IN_FLIGHT.add(1, &[]);
        let this = Arc::clone(self);
        let span = tracing::info_span!("worker", object = %key);
        self.tracker
            .spawn(async move { this.work(key).await }.instrument(span));
    }

    async fn work(self: Arc<Self>, key: ObjectKey) {
        loop {
            let outcome = self.pass(&key).await;

            let delay = {
                let mut state = self.state.lock();
                let entry = state.entry(key.clone()).or_default();
                let delay = match &outcome {
                    Ok(action) => {
                        entry.failures = 0;
                        action.requeue_after()
                    }
                    Err(e) if !e.is_retryable() => {
                        error!(error = %e, "reconcile failed permanently, waiting for a change");
                        entry.failures = 0;
                        None
                    }
                    Err(e) => {
                        entry.failures = entry.failures.saturating_add(1);
                        let delay = self.config.backoff.jittered_delay(entry.failures);
                        warn!(
                            error = %e,
                            failures = entry.failures,
                            retry_in_ms = delay.as_millis() as u64,
                            "reconcile failed"
                        );
                        Some(delay)
                    }
                };

                if self.cancel.is_cancelled() {
                    entry.running = false;
                    entry.dirty = false;
                    None
                } else if entry.dirty || delay == Some(Duration::ZERO) {
                    entry.dirty = false;
                    continue;
                } else {
                    entry.running = false;
                    match delay {
                        Some(d) => {
                            entry.timer += 1;
                            entry.timer_pending = true;
                            Some((d, entry.timer))
                        }
                        None => {
                            if entry.failures == 0 && !entry.timer_pending {
                                state.remove(&key);
                            }
                            None
                        }
                    }
                }
            };

            if let Some((d, generation)) = delay {
                self.schedule(key.clone(), d, generation);
            }
            break;
        }
        RECONCILE_IN_FLIGHT.add(-1, &[]);
    }

    fn schedule(self: &Arc<Self>, key: ObjectKey, delay: Duration, generation: u64) {
        let this = Arc::clone(self);
        self.tracker.spawn(async move {
            tokio::select! {
                _ = this.cancel.cancelled() => {}
                _ = tokio::time::sleep(delay) => {
                    let fire = {
                        let mut state = this.state.lock();
                        match state.get_mut(&key) {
                            Some(entry) if entry.timer == generation => {
                                entry.timer_pending = false;
                                true
                            }
                            _ => false,
                        }
                    };
                    if fire {
                        this.enqueue(key);
                    }
                }
            }
        });
    }

    async fn pass(&self, key: &ObjectKey) -> Result<Action> {
        let Some(reconciler) = self.reconcilers.get(&key.kind).cloned() else {
            debug!(kind = %key.kind, "no reconciler registered");
            return Ok(Action::await_change());
        };

        let timer = ReconcileTimer::start(key.kind);
        let deadline = Instant::now() + self.config.reconcile_timeout;
        let hard_deadline = deadline + self.config.grace;

        // Run on its own task so a panic stays confined to this pass.
        let task_key = key.clone();
        let handle = tokio::spawn(
            async move { reconciler.reconcile(&task_key, deadline).await }.in_current_span(),
        );
        let abort = handle.abort_handle();

        let result = match tokio::time::timeout_at(hard_deadline, handle).await {
            Ok(Ok(result)) => result,
            Ok(Err(join_err)) => Err(Error::internal_with_context(
                "scheduler",
                format!("reconcile of {key} aborted: {join_err}"),
            )),
            Err(_) => {
                abort.abort();
                Err(Error::timeout(format!("reconcile {key}")))
            }
        };

        match &result {
            Ok(_) => timer.success(),
            Err(e) => timer.error(e.is_retryable()),
        }
        result
    }
}
