use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard};

use tokio::sync::Notify;

use crate::batcher::{Batch, Batcher};
use crate::report::{FailureReason, FailureRecord};

pub enum Pull {
    Batch(Batch),
    Wait,
    Drained,
}

/// State of one run, shared by the orchestrator and every worker.
#[derive(Debug)]
pub struct JobState {
    queue: Mutex<Batcher>,
    in_flight: AtomicUsize,
    work: Notify,
    cancelled: AtomicBool,
    cancel_notify: Notify,
    stop_requested: AtomicBool,
    blocked: AtomicBool,
    translated: AtomicUsize,
    provider_calls: AtomicUsize,
    completed_batches: AtomicUsize,
    failures: Mutex<Vec<FailureRecord>>,
}

impl JobState {
    pub fn new(batcher: Batcher) -> Self {
        Self {
            queue: Mutex::new(batcher),
            in_flight: AtomicUsize::new(0),
            work: Notify::new(),
            cancelled: AtomicBool::new(false),
            cancel_notify: Notify::new(),
            stop_requested: AtomicBool::new(false),
            blocked: AtomicBool::new(false),
            translated: AtomicUsize::new(0),
            provider_calls: AtomicUsize::new(0),
            completed_batches: AtomicUsize::new(0),
            failures: Mutex::new(Vec::new()),
        }
    }

    /// Takes the next batch and marks it in flight under the queue lock.
    pub fn pull(&self) -> Pull {
        let mut queue = self.queue();
        if let Some(batch) = queue.next_batch() {
            self.in_flight.fetch_add(1, Ordering::SeqCst);
            return Pull::Batch(batch);
        }
        if self.in_flight() == 0 {
            Pull::Drained
        } else {
            Pull::Wait
        }
    }

    /// Waits for the next batch. `None` once the queue drains or the run is cancelled.
    pub async fn next_batch(&self) -> Option<Batch> {
        loop {
            if self.is_cancelled() {
                return None;
            }
            let notified = self.work.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            match self.pull() {
                Pull::Batch(batch) => return Some(batch),
                Pull::Drained => return None,
                Pull::Wait => notified.await,
            }
        }
    }

    pub fn requeue(&self, batch: Batch) {
        self.queue().requeue_front(batch);
        self.work.notify_waiters();
    }

    pub fn finish_batch(&self) {
        {
            let _queue = self.queue();
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
        }
        self.work.notify_waiters();
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
        self.work.notify_waiters();
        self.cancel_notify.notify_waiters();
    }

    /// Cancels because a stop was requested, as opposed to a blocked pool.
    pub fn request_stop(&self) {
        self.stop_requested.store(true, Ordering::SeqCst);
        self.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    pub fn stop_requested(&self) -> bool {
        self.stop_requested.load(Ordering::SeqCst)
    }

    pub async fn cancelled(&self) {
        loop {
            let notified = self.cancel_notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.is_cancelled() {
                return;
            }
            notified.await;
        }
    }

    pub fn mark_blocked(&self) {
        self.blocked.store(true, Ordering::SeqCst);
        self.cancel();
    }

    pub fn is_blocked(&self) -> bool {
        self.blocked.load(Ordering::SeqCst)
    }

    pub fn add_translated(&self, count: usize) {
        self.translated.fetch_add(count, Ordering::SeqCst);
    }

    pub fn translated(&self) -> usize {
        self.translated.load(Ordering::SeqCst)
    }

    pub fn record_call(&self) {
        self.provider_calls.fetch_add(1, Ordering::SeqCst);
    }

    pub fn provider_calls(&self) -> usize {
        self.provider_calls.load(Ordering::SeqCst)
    }

    /// Counts a finished batch and returns the running total.
    pub fn complete_batch(&self) -> usize {
        self.completed_batches.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub fn record_failure<'a>(&self, ids: impl IntoIterator<Item = &'a str>, reason: FailureReason) {
        let mut failures = self
            .failures
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        for id in ids {
            failures.push(FailureRecord {
                id: id.to_string(),
                reason: reason.clone(),
            });
        }
    }

    pub fn failures(&self) -> Vec<FailureRecord> {
        self.failures
            .lock()
            .map(|failures| failures.clone())
            .unwrap_or_else(|poisoned| poisoned.into_inner().clone())
    }

    pub fn pending_ids(&self) -> Vec<String> {
        self.queue().pending_ids()
    }

    fn queue(&self) -> MutexGuard<'_, Batcher> {
        self.queue
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Releases the in-flight slot when a worker is done with its batch, even on panic.
pub struct InFlight<'a> {
    job: &'a JobState,
}

impl<'a> InFlight<'a> {
    pub fn new(job: &'a JobState) -> Self {
        Self { job }
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.job.finish_batch();
    }
}
