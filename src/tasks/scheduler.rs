//! Bounded worker pool pulling cache-miss work from an ordered queue.
//!
//! Each worker loops: wait for a task, take a slot from the [`AdmissionGate`], run the
//! pipeline, give the slot back, then hand the result to every target waiting on that key.
//! Idle workers park on a [`Notify`]; nothing polls.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::runtime::Handle;
use tokio::select;
use tokio::sync::{Notify, Semaphore, SemaphorePermit, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::config::QueueOrder;
use crate::events::{DecodedImage, LoadOutcome, LoadTask, RequestKey};
use crate::target::TargetHandle;
use crate::tasks::dispatcher::{Delivery, Dispatcher};
use crate::tasks::pipeline::Pipeline;

/// Counting gate in front of the pipeline. Tracks how many pipelines run right now and the
/// most that ever ran at once.
#[derive(Debug)]
pub struct AdmissionGate {
    slots: Semaphore,
    capacity: usize,
    running: AtomicUsize,
    peak: AtomicUsize,
}

impl AdmissionGate {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            slots: Semaphore::new(capacity),
            capacity,
            running: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
        }
    }

    /// Wait for a free slot. `None` once the gate has been closed.
    pub async fn admit(&self) -> Option<GatePermit<'_>> {
        let permit = self.slots.acquire().await.ok()?;
        let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        Some(GatePermit {
            _permit: permit,
            running: &self.running,
        })
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn running(&self) -> usize {
        self.running.load(Ordering::SeqCst)
    }

    pub fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    fn close(&self) {
        self.slots.close();
    }
}

/// A held slot; dropping it frees the slot.
pub struct GatePermit<'a> {
    _permit: SemaphorePermit<'a>,
    running: &'a AtomicUsize,
}

impl Drop for GatePermit<'_> {
    fn drop(&mut self) {
        self.running.fetch_sub(1, Ordering::SeqCst);
    }
}

/// What `submit` did with a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Submission {
    /// A new task went onto the queue.
    Enqueued,
    /// The key was already queued or running; the target now waits on that task.
    Coalesced,
    /// The scheduler is shut down.
    Rejected,
}

/// A target waiting on an in-flight key, with the completions to fire for it.
pub(crate) struct Waiter {
    target: TargetHandle,
    completions: Vec<oneshot::Sender<LoadOutcome>>,
}

impl Waiter {
    pub(crate) fn new(
        target: TargetHandle,
        completion: Option<oneshot::Sender<LoadOutcome>>,
    ) -> Self {
        Self {
            target,
            completions: completion.into_iter().collect(),
        }
    }
}

#[derive(Default)]
struct QueueState {
    pending: VecDeque<LoadTask>,
    in_flight: HashMap<RequestKey, Vec<Waiter>>,
}

/// Counters for observing the scheduler from tests and logs.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SchedulerStats {
    pub enqueued: u64,
    pub coalesced: u64,
    pub completed: u64,
    pub failed: u64,
    pub pending: usize,
    pub running: usize,
    pub peak_running: usize,
}

struct Shared {
    order: QueueOrder,
    state: Mutex<QueueState>,
    wake: Notify,
    gate: AdmissionGate,
    cancel: CancellationToken,
    pipeline: Pipeline,
    dispatcher: Dispatcher,
    enqueued: AtomicU64,
    coalesced: AtomicU64,
    completed: AtomicU64,
    failed: AtomicU64,
}

pub struct Scheduler {
    shared: Arc<Shared>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl Scheduler {
    /// Spawn `worker_count` workers on `runtime`.
    pub fn start(
        runtime: &Handle,
        worker_count: usize,
        order: QueueOrder,
        pipeline: Pipeline,
        dispatcher: Dispatcher,
    ) -> Self {
        let worker_count = worker_count.max(1);
        let shared = Arc::new(Shared {
            order,
            state: Mutex::new(QueueState::default()),
            wake: Notify::new(),
            gate: AdmissionGate::new(worker_count),
            cancel: CancellationToken::new(),
            pipeline,
            dispatcher,
            enqueued: AtomicU64::new(0),
            coalesced: AtomicU64::new(0),
            completed: AtomicU64::new(0),
            failed: AtomicU64::new(0),
        });

        let workers = (0..worker_count)
            .map(|id| runtime.spawn(worker(id, Arc::clone(&shared))))
            .collect();
        info!(workers = worker_count, ?order, "scheduler started");

        Self {
            shared,
            workers: Mutex::new(workers),
        }
    }

    /// Queue `task` for `target`, or attach `target` to the task already running for the
    /// same key. Never waits beyond the queue lock.
    pub(crate) fn submit(
        &self,
        task: LoadTask,
        target: TargetHandle,
        completion: Option<oneshot::Sender<LoadOutcome>>,
    ) -> Submission {
        if self.shared.cancel.is_cancelled() {
            return Submission::Rejected;
        }

        let mut state = self.shared.lock_state();
        if let Some(waiters) = state.in_flight.get_mut(&task.key) {
            match waiters.iter_mut().find(|w| w.target == target) {
                Some(existing) => existing.completions.extend(completion),
                None => waiters.push(Waiter::new(target, completion)),
            }
            drop(state);
            self.shared.coalesced.fetch_add(1, Ordering::Relaxed);
            trace!(key = %task.key, "coalesced with in-flight task");
            return Submission::Coalesced;
        }

        state
            .in_flight
            .insert(task.key.clone(), vec![Waiter::new(target, completion)]);
        trace!(key = %task.key, size = ?task.size, "enqueued");
        state.pending.push_back(task);
        drop(state);

        self.shared.enqueued.fetch_add(1, Ordering::Relaxed);
        self.shared.wake.notify_one();
        Submission::Enqueued
    }

    pub fn gate(&self) -> &AdmissionGate {
        &self.shared.gate
    }

    pub fn order(&self) -> QueueOrder {
        self.shared.order
    }

    pub fn stats(&self) -> SchedulerStats {
        let pending = self.shared.lock_state().pending.len();
        SchedulerStats {
            enqueued: self.shared.enqueued.load(Ordering::Relaxed),
            coalesced: self.shared.coalesced.load(Ordering::Relaxed),
            completed: self.shared.completed.load(Ordering::Relaxed),
            failed: self.shared.failed.load(Ordering::Relaxed),
            pending,
            running: self.shared.gate.running(),
            peak_running: self.shared.gate.peak(),
        }
    }

    pub fn is_shut_down(&self) -> bool {
        self.shared.cancel.is_cancelled()
    }

    /// Stop accepting work, drop everything still queued and wait for the workers to finish
    /// the task they are on. Completions of dropped tasks resolve as abandoned.
    pub async fn shutdown(&self) {
        self.shared.cancel.cancel();

        let discarded = {
            let mut state = self.shared.lock_state();
            let pending: Vec<LoadTask> = state.pending.drain(..).collect();
            for task in &pending {
                state.in_flight.remove(&task.key);
            }
            pending.len()
        };
        if discarded > 0 {
            debug!(discarded, "dropped queued tasks on shutdown");
        }

        let workers: Vec<JoinHandle<()>> = {
            let mut guard = self.workers.lock().expect("worker list poisoned");
            guard.drain(..).collect()
        };
        for handle in workers {
            if let Err(err) = handle.await {
                warn!("worker ended abnormally: {err}");
            }
        }
        self.shared.gate.close();
        info!("scheduler stopped");
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        self.shared.cancel.cancel();
    }
}

impl Shared {
    fn lock_state(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().expect("task queue poisoned")
    }

    fn pop(&self) -> Option<LoadTask> {
        let mut state = self.lock_state();
        match self.order {
            QueueOrder::Lifo => state.pending.pop_back(),
            QueueOrder::Fifo => state.pending.pop_front(),
        }
    }

    async fn next_task(&self) -> Option<LoadTask> {
        loop {
            let notified = self.wake.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.cancel.is_cancelled() {
                return None;
            }
            if let Some(task) = self.pop() {
                return Some(task);
            }

            select! {
                _ = self.cancel.cancelled() => return None,
                _ = &mut notified => {}
            }
        }
    }

    fn finish(&self, task: &LoadTask, image: Option<DecodedImage>) {
        let waiters = self
            .lock_state()
            .in_flight
            .remove(&task.key)
            .unwrap_or_default();

        for waiter in waiters {
            self.dispatcher.deliver(Delivery {
                key: task.key.clone(),
                target: waiter.target,
                image: image.clone(),
                completions: waiter.completions,
            });
        }
    }
}

async fn worker(id: usize, shared: Arc<Shared>) {
    debug!(worker = id, "worker started");
    while let Some(task) = shared.next_task().await {
        let Some(permit) = shared.gate.admit().await else {
            break;
        };
        trace!(worker = id, key = %task.key, "running");
        let image = shared.pipeline.execute(&task).await;
        drop(permit);

        let counter = if image.is_some() {
            &shared.completed
        } else {
            &shared.failed
        };
        counter.fetch_add(1, Ordering::Relaxed);
        shared.finish(&task, image);
    }
    debug!(worker = id, "worker stopped");
}
