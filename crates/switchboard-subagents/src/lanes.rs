//! Lane queue: per-lane FIFO task execution under a concurrency cap.
//!
//! Lanes are named (`main`, `cron`, `subagent`, `auth-probe:<id>`, …) and
//! created on first use. Tasks start in FIFO order per lane; completions
//! are unordered once a lane's cap exceeds one. A monotonic per-lane
//! generation counter invalidates completion callbacks from before a
//! [`LaneQueue::reset_all`], so an in-process restart cannot corrupt the
//! active-task accounting.
//!
//! Probe lanes (`auth-probe:*`, `session:probe-*`) are expected to fail
//! routinely; their task failures log at debug instead of error.

use std::collections::{HashMap, HashSet, VecDeque};
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::future::BoxFuture;
use futures::FutureExt;
use parking_lot::Mutex;
use tokio::sync::oneshot;
use tracing::{debug, error, warn};

use crate::errors::LaneError;

/// Default queue-wait threshold before a diagnostic warning is emitted.
pub const DEFAULT_WARN_AFTER_MS: u64 = 2_000;

const ACTIVE_POLL_INTERVAL: Duration = Duration::from_millis(50);

type StartFn = Box<dyn FnOnce() -> BoxFuture<'static, ()> + Send>;
type RejectFn = Box<dyn FnOnce(LaneError) + Send>;

/// Callback invoked when a task waited past its warn threshold.
pub type OnWaitFn = Box<dyn FnOnce(u64, usize) + Send>;

/// Per-enqueue options.
pub struct EnqueueOptions {
    /// Queue-wait threshold in milliseconds.
    pub warn_after_ms: u64,
    /// Invoked with `(wait_ms, queued_ahead)` when the threshold is hit.
    pub on_wait: Option<OnWaitFn>,
}

impl Default for EnqueueOptions {
    fn default() -> Self {
        Self {
            warn_after_ms: DEFAULT_WARN_AFTER_MS,
            on_wait: None,
        }
    }
}

struct QueuedEntry {
    start: StartFn,
    reject: RejectFn,
    enqueued_at: Instant,
    queued_ahead: usize,
    warn_after_ms: u64,
    on_wait: Option<OnWaitFn>,
}

struct LaneState {
    queue: VecDeque<QueuedEntry>,
    active: HashSet<u64>,
    max_concurrent: usize,
    draining: bool,
    generation: u64,
}

impl LaneState {
    fn new() -> Self {
        Self {
            queue: VecDeque::new(),
            active: HashSet::new(),
            max_concurrent: 1,
            draining: false,
            generation: 0,
        }
    }
}

#[derive(Default)]
struct Inner {
    lanes: HashMap<String, LaneState>,
    next_task_id: u64,
}

/// Result of [`LaneQueue::wait_for_active_tasks`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct WaitOutcome {
    /// Whether every task active at call time finished before the deadline.
    pub drained: bool,
}

/// Named-lane FIFO executor.
#[derive(Clone, Default)]
pub struct LaneQueue {
    inner: Arc<Mutex<Inner>>,
}

impl LaneQueue {
    /// Create an empty queue.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a task to a lane and start draining.
    ///
    /// The returned future resolves with the task's output, or with
    /// [`LaneError::Cleared`] if the lane is cleared first.
    pub fn enqueue<T, F, Fut>(
        &self,
        lane: &str,
        options: EnqueueOptions,
        task: F,
    ) -> impl Future<Output = Result<T, LaneError>> + Send
    where
        T: Send + 'static,
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = T> + Send + 'static,
    {
        let (tx, rx) = oneshot::channel::<Result<T, LaneError>>();
        let slot = Arc::new(Mutex::new(Some(tx)));
        let reject_slot = Arc::clone(&slot);

        let start: StartFn = Box::new(move || {
            async move {
                let value = task().await;
                if let Some(tx) = slot.lock().take() {
                    let _ = tx.send(Ok(value));
                }
            }
            .boxed()
        });
        let reject: RejectFn = Box::new(move |err| {
            if let Some(tx) = reject_slot.lock().take() {
                let _ = tx.send(Err(err));
            }
        });

        let lane_name = lane.to_owned();
        {
            let mut guard = self.inner.lock();
            let state = guard
                .lanes
                .entry(lane_name.clone())
                .or_insert_with(LaneState::new);
            let entry = QueuedEntry {
                start,
                reject,
                enqueued_at: Instant::now(),
                queued_ahead: state.queue.len(),
                warn_after_ms: options.warn_after_ms,
                on_wait: options.on_wait,
            };
            state.queue.push_back(entry);
        }
        drain(&self.inner, &lane_name);

        async move {
            match rx.await {
                Ok(result) => result,
                Err(_) => Err(LaneError::Aborted { lane: lane_name }),
            }
        }
    }

    /// Set a lane's concurrency cap, clamped to at least 1.
    pub fn set_concurrency(&self, lane: &str, max_concurrent: usize) {
        {
            let mut guard = self.inner.lock();
            let state = guard
                .lanes
                .entry(lane.to_owned())
                .or_insert_with(LaneState::new);
            state.max_concurrent = max_concurrent.max(1);
        }
        drain(&self.inner, lane);
    }

    /// Remove every queued entry from a lane, rejecting each with
    /// [`LaneError::Cleared`]. Running tasks are not cancelled.
    ///
    /// Returns the number of entries removed.
    pub fn clear(&self, lane: &str) -> usize {
        let entries: Vec<QueuedEntry> = {
            let mut guard = self.inner.lock();
            match guard.lanes.get_mut(lane) {
                Some(state) => state.queue.drain(..).collect(),
                None => Vec::new(),
            }
        };
        let removed = entries.len();
        if removed > 0 {
            debug!(lane, removed, "cleared queued lane entries");
        }
        for entry in entries {
            (entry.reject)(LaneError::Cleared {
                lane: lane.to_owned(),
            });
        }
        removed
    }

    /// Invalidate all in-flight work after an in-process restart.
    ///
    /// Bumps every lane's generation, clears the active sets and drain
    /// flags, then drains lanes that still hold queued entries.
    /// Completion callbacks from tasks started before the reset are
    /// ignored when they eventually fire.
    pub fn reset_all(&self) {
        let pending: Vec<String> = {
            let mut guard = self.inner.lock();
            let mut pending = Vec::new();
            for (name, state) in &mut guard.lanes {
                state.generation += 1;
                state.active.clear();
                state.draining = false;
                if !state.queue.is_empty() {
                    pending.push(name.clone());
                }
            }
            pending
        };
        for lane in pending {
            drain(&self.inner, &lane);
        }
    }

    /// Queued (not yet started) entry count for one lane.
    #[must_use]
    pub fn queue_size(&self, lane: &str) -> usize {
        self.inner
            .lock()
            .lanes
            .get(lane)
            .map_or(0, |s| s.queue.len())
    }

    /// Queued entry count across all lanes.
    #[must_use]
    pub fn total_queue_size(&self) -> usize {
        self.inner.lock().lanes.values().map(|s| s.queue.len()).sum()
    }

    /// Running task count across all lanes.
    #[must_use]
    pub fn active_task_count(&self) -> usize {
        self.inner
            .lock()
            .lanes
            .values()
            .map(|s| s.active.len())
            .sum()
    }

    /// Wait for the tasks active *at call time* to finish.
    ///
    /// Polls every 50 ms until none of the snapshotted task ids remain
    /// active or the timeout elapses. Tasks enqueued after the call are
    /// ignored.
    pub async fn wait_for_active_tasks(&self, timeout: Duration) -> WaitOutcome {
        let snapshot: HashSet<u64> = {
            let guard = self.inner.lock();
            guard
                .lanes
                .values()
                .flat_map(|s| s.active.iter().copied())
                .collect()
        };
        if snapshot.is_empty() {
            return WaitOutcome { drained: true };
        }

        let deadline = Instant::now() + timeout;
        loop {
            let any_left = {
                let guard = self.inner.lock();
                guard
                    .lanes
                    .values()
                    .any(|s| s.active.iter().any(|id| snapshot.contains(id)))
            };
            if !any_left {
                return WaitOutcome { drained: true };
            }
            if Instant::now() >= deadline {
                return WaitOutcome { drained: false };
            }
            tokio::time::sleep(ACTIVE_POLL_INTERVAL).await;
        }
    }
}

fn is_probe_lane(lane: &str) -> bool {
    lane.starts_with("auth-probe:") || lane.starts_with("session:probe-")
}

/// Start queued entries while the lane is under its cap.
///
/// Reentrancy-guarded by the `draining` flag; completion callbacks call
/// back in here once their generation check passes.
fn drain(inner: &Arc<Mutex<Inner>>, lane: &str) {
    let mut to_start = Vec::new();
    {
        let mut guard = inner.lock();
        let inner_mut = &mut *guard;
        let Some(state) = inner_mut.lanes.get_mut(lane) else {
            return;
        };
        if state.draining {
            return;
        }
        state.draining = true;
        while state.active.len() < state.max_concurrent {
            let Some(entry) = state.queue.pop_front() else {
                break;
            };
            let task_id = inner_mut.next_task_id;
            inner_mut.next_task_id += 1;
            let _ = state.active.insert(task_id);
            to_start.push((task_id, state.generation, entry));
        }
        state.draining = false;
    }
    for (task_id, generation, entry) in to_start {
        start_entry(inner, lane, task_id, generation, entry);
    }
}

fn start_entry(
    inner: &Arc<Mutex<Inner>>,
    lane: &str,
    task_id: u64,
    generation: u64,
    entry: QueuedEntry,
) {
    let wait_ms = entry.enqueued_at.elapsed().as_millis() as u64;
    if wait_ms >= entry.warn_after_ms {
        warn!(
            lane,
            wait_ms,
            queued_ahead = entry.queued_ahead,
            "lane task waited long before starting"
        );
        if let Some(on_wait) = entry.on_wait {
            on_wait(wait_ms, entry.queued_ahead);
        }
    }

    let fut = (entry.start)();
    let inner = Arc::clone(inner);
    let lane = lane.to_owned();
    let _ = tokio::spawn(async move {
        // Inner spawn isolates task panics from the bookkeeping below.
        if let Err(join_err) = tokio::spawn(fut).await {
            if is_probe_lane(&lane) {
                debug!(lane = %lane, error = %join_err, "probe lane task aborted");
            } else {
                error!(lane = %lane, error = %join_err, "lane task aborted");
            }
        }
        if complete(&inner, &lane, task_id, generation) {
            drain(&inner, &lane);
        }
    });
}

/// Record a task completion. Returns `false` for completions from an
/// older generation, which must not disturb current state.
fn complete(inner: &Arc<Mutex<Inner>>, lane: &str, task_id: u64, generation: u64) -> bool {
    let mut guard = inner.lock();
    let Some(state) = guard.lanes.get_mut(lane) else {
        return false;
    };
    if state.generation != generation {
        return false;
    }
    let _ = state.active.remove(&task_id);
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn enqueue_runs_task_and_returns_value() {
        let lanes = LaneQueue::new();
        let value = lanes
            .enqueue("main", EnqueueOptions::default(), || async { 41 + 1 })
            .await
            .unwrap();
        assert_eq!(value, 42);
        assert_eq!(lanes.active_task_count(), 0);
        assert_eq!(lanes.total_queue_size(), 0);
    }

    #[tokio::test]
    async fn tasks_start_in_fifo_order_per_lane() {
        let lanes = LaneQueue::new();
        let order = Arc::new(Mutex::new(Vec::new()));

        let mut handles = Vec::new();
        for i in 0..4u32 {
            let order = Arc::clone(&order);
            handles.push(lanes.enqueue("main", EnqueueOptions::default(), move || async move {
                order.lock().push(i);
                tokio::time::sleep(Duration::from_millis(5)).await;
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }
        assert_eq!(*order.lock(), vec![0, 1, 2, 3]);
    }

    #[tokio::test]
    async fn concurrency_cap_is_enforced() {
        let lanes = LaneQueue::new();
        lanes.set_concurrency("main", 2);

        let current = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..6 {
            let current = Arc::clone(&current);
            let peak = Arc::clone(&peak);
            handles.push(lanes.enqueue("main", EnqueueOptions::default(), move || async move {
                let now = current.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(20)).await;
                current.fetch_sub(1, Ordering::SeqCst);
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }
        assert!(peak.load(Ordering::SeqCst) <= 2);
        assert!(peak.load(Ordering::SeqCst) >= 2, "cap of 2 should be reached");
    }

    #[tokio::test]
    async fn set_concurrency_clamps_to_one() {
        let lanes = LaneQueue::new();
        lanes.set_concurrency("main", 0);
        // still executes exactly one at a time
        let value = lanes
            .enqueue("main", EnqueueOptions::default(), || async { 1 })
            .await
            .unwrap();
        assert_eq!(value, 1);
    }

    #[tokio::test]
    async fn clear_rejects_queued_tasks_with_typed_error() {
        let lanes = LaneQueue::new();

        // Occupy the lane so the next enqueue stays queued.
        let blocker = lanes.enqueue("jobs", EnqueueOptions::default(), || async {
            tokio::time::sleep(Duration::from_millis(100)).await;
            "ran"
        });
        tokio::time::sleep(Duration::from_millis(10)).await;

        let queued = lanes.enqueue("jobs", EnqueueOptions::default(), || async { "never" });
        tokio::time::sleep(Duration::from_millis(10)).await;

        let removed = lanes.clear("jobs");
        assert_eq!(removed, 1);

        let err = queued.await.unwrap_err();
        assert_eq!(
            err,
            LaneError::Cleared {
                lane: "jobs".into()
            }
        );
        assert!(err.to_string().contains("'jobs'"));

        // The running task is unaffected by the clear.
        assert_eq!(blocker.await.unwrap(), "ran");
    }

    #[tokio::test]
    async fn clear_on_unknown_lane_is_zero() {
        let lanes = LaneQueue::new();
        assert_eq!(lanes.clear("nope"), 0);
    }

    #[tokio::test]
    async fn reset_all_ignores_stale_completions_and_drains_queued() {
        let lanes = LaneQueue::new();

        // Old-generation task holds the lane.
        let old = lanes.enqueue("main", EnqueueOptions::default(), || async {
            tokio::time::sleep(Duration::from_millis(80)).await;
            "old"
        });
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(lanes.active_task_count(), 1);

        // Queued behind the old task.
        let queued = lanes.enqueue("main", EnqueueOptions::default(), || async { "queued" });
        tokio::time::sleep(Duration::from_millis(5)).await;
        assert_eq!(lanes.queue_size("main"), 1);

        lanes.reset_all();

        // Active accounting is wiped and queued work starts promptly,
        // without waiting for the old task.
        assert_eq!(queued.await.unwrap(), "queued");

        // Old task still completes for its caller; its stale completion
        // callback must not disturb the new generation's accounting.
        assert_eq!(old.await.unwrap(), "old");
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(lanes.active_task_count(), 0);
        assert_eq!(lanes.queue_size("main"), 0);
    }

    #[tokio::test]
    async fn wait_for_active_tasks_snapshots_at_call_time() {
        let lanes = LaneQueue::new();

        let slow = lanes.enqueue("main", EnqueueOptions::default(), || async {
            tokio::time::sleep(Duration::from_millis(60)).await;
        });
        tokio::time::sleep(Duration::from_millis(10)).await;

        let outcome = lanes.wait_for_active_tasks(Duration::from_millis(500)).await;
        assert!(outcome.drained);
        slow.await.unwrap();

        // No active tasks: immediate success.
        let outcome = lanes.wait_for_active_tasks(Duration::from_millis(10)).await;
        assert!(outcome.drained);
    }

    #[tokio::test]
    async fn wait_for_active_tasks_times_out() {
        let lanes = LaneQueue::new();
        let slow = lanes.enqueue("main", EnqueueOptions::default(), || async {
            tokio::time::sleep(Duration::from_millis(300)).await;
        });
        tokio::time::sleep(Duration::from_millis(10)).await;

        let outcome = lanes.wait_for_active_tasks(Duration::from_millis(30)).await;
        assert!(!outcome.drained);
        slow.await.unwrap();
    }

    #[tokio::test]
    async fn on_wait_fires_past_threshold() {
        let lanes = LaneQueue::new();
        let (tx, rx) = oneshot::channel();

        // Block the lane so the probe below has to wait.
        let blocker = lanes.enqueue("main", EnqueueOptions::default(), || async {
            tokio::time::sleep(Duration::from_millis(40)).await;
        });
        tokio::time::sleep(Duration::from_millis(5)).await;

        let watched = lanes.enqueue(
            "main",
            EnqueueOptions {
                warn_after_ms: 1,
                on_wait: Some(Box::new(move |wait_ms, queued_ahead| {
                    let _ = tx.send((wait_ms, queued_ahead));
                })),
            },
            || async {},
        );

        blocker.await.unwrap();
        watched.await.unwrap();
        let (wait_ms, queued_ahead) = rx.await.unwrap();
        assert!(wait_ms >= 1);
        assert_eq!(queued_ahead, 0);
    }

    #[tokio::test]
    async fn panicking_task_reports_aborted() {
        let lanes = LaneQueue::new();
        let err = lanes
            .enqueue::<(), _, _>("auth-probe:acct", EnqueueOptions::default(), || async {
                panic!("probe blew up");
            })
            .await
            .unwrap_err();
        assert_eq!(
            err,
            LaneError::Aborted {
                lane: "auth-probe:acct".into()
            }
        );
        // Accounting recovered despite the panic.
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(lanes.active_task_count(), 0);
    }
}
