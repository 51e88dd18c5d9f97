//! Delay-queue driven fixed-rate / fixed-delay / run-once task runner
//! (component G).
//!
//! A small fixed pool of worker threads shares one delay queue (a
//! `BinaryHeap` ordered by planned fire time, guarded by a `Mutex` +
//! `Condvar`) generalized to more than one concurrent task and more than
//! one rescheduling policy. Each worker blocks until the earliest task is due,
//! runs it, and, unless it was `RUN_ONCE`, cancelled, or failed with
//! `stop_on_failure` set, computes its next fire time and re-enqueues
//! itself.

use std::cmp::Ordering as CmpOrdering;
use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use atlas_core::{atlas_warn, AtlasError};

/// How a scheduled task's next fire time is computed after it completes.
#[derive(Clone, Copy, Debug)]
pub enum SchedulePolicy {
    /// Fires once at `initial_delay`, never again.
    RunOnce,
    /// Next fire = completion time + `period`.
    FixedDelay { period: Duration },
    /// Next fire = planned time + `period`; if the task ran long enough
    /// that one or more periods have already elapsed, skip straight to the
    /// next one that hasn't, incrementing the skipped-run counter for each
    /// period jumped over.
    FixedRateSkipIfLong { period: Duration },
}

type TaskFn = dyn Fn() -> Result<(), AtlasError> + Send + Sync;

struct TaskState {
    policy: SchedulePolicy,
    cancelled: AtomicBool,
    skipped: AtomicU64,
    stop_on_failure: bool,
    task: Box<TaskFn>,
}

/// A handle to a scheduled task. Cancellation is cooperative: it sets a
/// flag a worker checks before running the task and before re-enqueuing it;
/// an in-flight execution still runs to completion.
#[derive(Clone)]
pub struct TaskHandle {
    state: Arc<TaskState>,
}

impl TaskHandle {
    /// Requests cancellation. `may_interrupt` is accepted for parity with
    /// the design's `cancel(mayInterrupt)` but has no effect beyond
    /// stopping future re-enqueues, Rust has no portable way to interrupt
    /// a running OS thread, so an in-flight call always runs to completion.
    pub fn cancel(&self, _may_interrupt: bool) {
        self.state.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_done(&self) -> bool {
        self.state.cancelled.load(Ordering::SeqCst)
    }

    /// How many planned fire times this task has skipped over because a
    /// prior execution overran its `FixedRateSkipIfLong` period.
    pub fn skipped(&self) -> u64 {
        self.state.skipped.load(Ordering::SeqCst)
    }
}

struct HeapEntry {
    planned_at: Instant,
    seq: u64,
    state: Arc<TaskState>,
}

impl PartialEq for HeapEntry {
    fn eq(&self, other: &Self) -> bool {
        self.planned_at == other.planned_at && self.seq == other.seq
    }
}
impl Eq for HeapEntry {}

impl PartialOrd for HeapEntry {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl Ord for HeapEntry {
    /// Reversed so `BinaryHeap` (a max-heap) pops the earliest-due entry
    /// first; ties broken by insertion order for FIFO fairness.
    fn cmp(&self, other: &Self) -> CmpOrdering {
        other.planned_at.cmp(&self.planned_at).then(other.seq.cmp(&self.seq))
    }
}

struct Shared {
    heap: Mutex<BinaryHeap<HeapEntry>>,
    condvar: Condvar,
    next_seq: AtomicU64,
    shutdown: AtomicBool,
}

const EMPTY_QUEUE_POLL: Duration = Duration::from_millis(500);

/// Owns the worker pool and the shared delay queue every scheduled task is
/// enqueued on.
pub struct Scheduler {
    shared: Arc<Shared>,
    workers: Vec<JoinHandle<()>>,
}

impl Scheduler {
    /// Spawns `num_threads` worker threads (minimum 1) sharing one delay
    /// queue.
    pub fn new(num_threads: usize) -> Self {
        let shared = Arc::new(Shared {
            heap: Mutex::new(BinaryHeap::new()),
            condvar: Condvar::new(),
            next_seq: AtomicU64::new(0),
            shutdown: AtomicBool::new(false),
        });
        let workers = (0..num_threads.max(1))
            .map(|i| {
                let shared = shared.clone();
                thread::Builder::new()
                    .name(format!("atlas-scheduler-{i}"))
                    .spawn(move || worker_loop(shared))
                    .expect("failed to spawn atlas scheduler worker thread")
            })
            .collect();
        Scheduler { shared, workers }
    }

    /// Schedules `task`, first firing after `initial_delay`. `task` is run
    /// on whichever worker thread is free when it comes due; it must not
    /// block indefinitely, since doing so starves that worker's share of
    /// the pool.
    pub fn schedule<F>(
        &self,
        policy: SchedulePolicy,
        initial_delay: Duration,
        stop_on_failure: bool,
        task: F,
    ) -> TaskHandle
    where
        F: Fn() -> Result<(), AtlasError> + Send + Sync + 'static,
    {
        let state = Arc::new(TaskState {
            policy,
            cancelled: AtomicBool::new(false),
            skipped: AtomicU64::new(0),
            stop_on_failure,
            task: Box::new(task),
        });
        self.push(state.clone(), Instant::now() + initial_delay);
        TaskHandle { state }
    }

    fn push(&self, state: Arc<TaskState>, planned_at: Instant) {
        let seq = self.shared.next_seq.fetch_add(1, Ordering::Relaxed);
        let mut heap = self.shared.heap.lock().expect("scheduler heap lock poisoned");
        heap.push(HeapEntry { planned_at, seq, state });
        drop(heap);
        self.shared.condvar.notify_all();
    }

    /// Stops accepting new fire times and joins every worker thread. Tasks
    /// already executing when shutdown is requested are allowed to finish;
    /// nothing further is re-enqueued.
    pub fn shutdown(self) {
        self.shared.shutdown.store(true, Ordering::SeqCst);
        self.shared.condvar.notify_all();
        for worker in self.workers {
            let _ = worker.join();
        }
    }
}

fn worker_loop(shared: Arc<Shared>) {
    loop {
        if shared.shutdown.load(Ordering::SeqCst) {
            return;
        }

        let mut heap = shared.heap.lock().expect("scheduler heap lock poisoned");
        let entry = loop {
            if shared.shutdown.load(Ordering::SeqCst) {
                return;
            }
            match heap.peek() {
                None => {
                    let (guard, _) = shared
                        .condvar
                        .wait_timeout(heap, EMPTY_QUEUE_POLL)
                        .expect("scheduler condvar wait poisoned");
                    heap = guard;
                }
                Some(head) => {
                    let now = Instant::now();
                    if head.planned_at <= now {
                        break heap.pop().expect("heap non-empty: peek just succeeded");
                    }
                    let wait = head.planned_at - now;
                    let (guard, _) = shared
                        .condvar
                        .wait_timeout(heap, wait)
                        .expect("scheduler condvar wait poisoned");
                    heap = guard;
                }
            }
        };
        drop(heap);

        if entry.state.cancelled.load(Ordering::SeqCst) {
            continue;
        }
        run_and_reschedule(&shared, entry.state, entry.planned_at);
    }
}

fn run_and_reschedule(shared: &Arc<Shared>, state: Arc<TaskState>, planned_at: Instant) {
    let result = (state.task)();
    if let Err(e) = &result {
        atlas_warn!(name: "scheduled_task_failed", error = e.to_string());
    }

    if state.cancelled.load(Ordering::SeqCst) {
        return;
    }
    if result.is_err() && state.stop_on_failure {
        state.cancelled.store(true, Ordering::SeqCst);
        return;
    }

    let next = match state.policy {
        SchedulePolicy::RunOnce => {
            state.cancelled.store(true, Ordering::SeqCst);
            return;
        }
        SchedulePolicy::FixedDelay { period } => Instant::now() + period,
        SchedulePolicy::FixedRateSkipIfLong { period } => {
            let mut next = planned_at + period;
            let now = Instant::now();
            while next <= now {
                next += period;
                state.skipped.fetch_add(1, Ordering::SeqCst);
            }
            next
        }
    };

    let seq = shared.next_seq.fetch_add(1, Ordering::Relaxed);
    let mut heap = shared.heap.lock().expect("scheduler heap lock poisoned");
    heap.push(HeapEntry { planned_at: next, seq, state });
    drop(heap);
    shared.condvar.notify_all();
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;
    use std::time::Duration;

    #[test]
    fn run_once_fires_exactly_one_time() {
        let scheduler = Scheduler::new(1);
        let runs = Arc::new(AtomicU32::new(0));
        let r = runs.clone();
        let handle = scheduler.schedule(SchedulePolicy::RunOnce, Duration::from_millis(5), false, move || {
            r.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });
        thread::sleep(Duration::from_millis(60));
        assert_eq!(runs.load(Ordering::SeqCst), 1);
        assert!(handle.is_done());
        scheduler.shutdown();
    }

    #[test]
    fn fixed_delay_waits_the_full_period_after_completion() {
        let scheduler = Scheduler::new(1);
        let runs = Arc::new(AtomicU32::new(0));
        let r = runs.clone();
        let _handle = scheduler.schedule(
            SchedulePolicy::FixedDelay { period: Duration::from_millis(20) },
            Duration::from_millis(0),
            false,
            move || {
                r.fetch_add(1, Ordering::SeqCst);
                Ok(())
            },
        );
        thread::sleep(Duration::from_millis(110));
        let count = runs.load(Ordering::SeqCst);
        assert!((3..=6).contains(&count), "expected roughly 5 runs, got {count}");
        scheduler.shutdown();
    }

    #[test]
    fn fixed_rate_skip_if_long_increments_skipped_on_overrun() {
        let scheduler = Scheduler::new(2);
        let runs = Arc::new(AtomicU32::new(0));
        let r = runs.clone();
        let handle = scheduler.schedule(
            SchedulePolicy::FixedRateSkipIfLong { period: Duration::from_millis(20) },
            Duration::from_millis(0),
            false,
            move || {
                let n = r.fetch_add(1, Ordering::SeqCst);
                if n == 0 {
                    thread::sleep(Duration::from_millis(110));
                }
                Ok(())
            },
        );
        thread::sleep(Duration::from_millis(200));
        assert!(handle.skipped() >= 3, "expected at least 3 skipped periods, got {}", handle.skipped());
        scheduler.shutdown();
    }

    #[test]
    fn cancel_stops_future_executions() {
        let scheduler = Scheduler::new(1);
        let runs = Arc::new(AtomicU32::new(0));
        let r = runs.clone();
        let handle = scheduler.schedule(
            SchedulePolicy::FixedDelay { period: Duration::from_millis(10) },
            Duration::from_millis(0),
            false,
            move || {
                r.fetch_add(1, Ordering::SeqCst);
                Ok(())
            },
        );
        thread::sleep(Duration::from_millis(30));
        handle.cancel(false);
        let seen_at_cancel = runs.load(Ordering::SeqCst);
        thread::sleep(Duration::from_millis(60));
        assert_eq!(runs.load(Ordering::SeqCst), seen_at_cancel, "no further runs after cancel");
        scheduler.shutdown();
    }

    #[test]
    fn stop_on_failure_self_cancels() {
        let scheduler = Scheduler::new(1);
        let handle = scheduler.schedule(
            SchedulePolicy::FixedDelay { period: Duration::from_millis(5) },
            Duration::from_millis(0),
            true,
            || Err(AtlasError::Other("boom".into())),
        );
        thread::sleep(Duration::from_millis(40));
        assert!(handle.is_done());
        scheduler.shutdown();
    }
}
