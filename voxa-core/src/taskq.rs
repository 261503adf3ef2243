//! Named cooperative task executor.
//!
//! Every periodically-clocked component of the runtime (capture, playback,
//! transmit, wake feeder/fetcher, the engine's retry timer) owns one
//! `TaskQueue`: a single worker thread draining a queue of closures.
//!
//! ## Ordering
//!
//! Jobs run FIFO by enqueue order, except that `enqueue_at` jobs are held
//! back until their scheduled time. Two jobs with the same scheduled time
//! run in enqueue order (a monotonic sequence number breaks ties), so a
//! plain `enqueue` stream behaves as a strict FIFO.
//!
//! ## Shutdown
//!
//! Dropping the queue drains every remaining job on the worker, then joins
//! it. Component teardown therefore looks like: enqueue whatever releases
//! the device, drop the queue, done. Jobs enqueued after shutdown has begun
//! are discarded.

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Instant;

use parking_lot::{Condvar, Mutex};
use tracing::trace;

type Job = Box<dyn FnOnce() + Send + 'static>;

struct Entry {
    seq: u64,
    at: Instant,
    job: Job,
}

// BinaryHeap is a max-heap; invert so the earliest (at, seq) pops first.
impl Ord for Entry {
    fn cmp(&self, other: &Self) -> Ordering {
        (other.at, other.seq).cmp(&(self.at, self.seq))
    }
}

impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for Entry {
    fn eq(&self, other: &Self) -> bool {
        self.seq == other.seq && self.at == other.at
    }
}

impl Eq for Entry {}

struct State {
    entries: BinaryHeap<Entry>,
    next_seq: u64,
    shutdown: bool,
}

struct Shared {
    state: Mutex<State>,
    condvar: Condvar,
}

/// A named single-worker executor with FIFO + scheduled-time ordering.
pub struct TaskQueue {
    shared: Arc<Shared>,
    worker: Option<JoinHandle<()>>,
    name: String,
}

/// Cloneable enqueue-only handle.
///
/// Lets a job re-arm itself on its own queue (the wake feeder/fetcher
/// pattern) without owning the queue. Enqueues after the owning
/// `TaskQueue` has been dropped are silently discarded.
#[derive(Clone)]
pub struct TaskQueueHandle {
    shared: Arc<Shared>,
}

impl TaskQueue {
    /// Spawn the worker thread. `name` becomes the OS thread name.
    pub fn new(name: &str) -> Self {
        let shared = Arc::new(Shared {
            state: Mutex::new(State {
                entries: BinaryHeap::new(),
                next_seq: 0,
                shutdown: false,
            }),
            condvar: Condvar::new(),
        });

        let worker_shared = Arc::clone(&shared);
        let worker = std::thread::Builder::new()
            .name(name.to_string())
            .spawn(move || run_worker(worker_shared))
            .expect("spawning a task-queue worker thread cannot fail");

        Self {
            shared,
            worker: Some(worker),
            name: name.to_string(),
        }
    }

    /// Enqueue a job to run as soon as the worker reaches it.
    pub fn enqueue(&self, job: impl FnOnce() + Send + 'static) {
        push(&self.shared, Instant::now(), Box::new(job));
    }

    /// Enqueue a job to run no earlier than `at`.
    pub fn enqueue_at(&self, at: Instant, job: impl FnOnce() + Send + 'static) {
        push(&self.shared, at, Box::new(job));
    }

    /// Number of jobs waiting in the queue (excludes a job mid-run).
    pub fn pending(&self) -> usize {
        self.shared.state.lock().entries.len()
    }

    /// The queue's name (also the worker thread name).
    pub fn name(&self) -> &str {
        &self.name
    }

    /// A cloneable enqueue-only handle onto this queue.
    pub fn handle(&self) -> TaskQueueHandle {
        TaskQueueHandle {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl TaskQueueHandle {
    /// Enqueue a job; no-op if the queue has shut down.
    pub fn enqueue(&self, job: impl FnOnce() + Send + 'static) {
        push(&self.shared, Instant::now(), Box::new(job));
    }

    /// Enqueue a job for `at`; no-op if the queue has shut down.
    pub fn enqueue_at(&self, at: Instant, job: impl FnOnce() + Send + 'static) {
        push(&self.shared, at, Box::new(job));
    }

    /// Number of jobs waiting in the queue.
    pub fn pending(&self) -> usize {
        self.shared.state.lock().entries.len()
    }
}

impl Drop for TaskQueue {
    fn drop(&mut self) {
        {
            let mut state = self.shared.state.lock();
            state.shutdown = true;
        }
        self.shared.condvar.notify_one();
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
        trace!(queue = %self.name, "task queue stopped");
    }
}

fn push(shared: &Shared, at: Instant, job: Job) {
    {
        let mut state = shared.state.lock();
        if state.shutdown {
            trace!("job discarded: queue shutting down");
            return;
        }
        let seq = state.next_seq;
        state.next_seq += 1;
        state.entries.push(Entry { seq, at, job });
    }
    shared.condvar.notify_one();
}

fn run_worker(shared: Arc<Shared>) {
    loop {
        let job = {
            let mut state = shared.state.lock();
            loop {
                if state.shutdown {
                    // Drain: run what is queued (scheduled or not), then exit.
                    match state.entries.pop() {
                        Some(entry) => break entry.job,
                        None => return,
                    }
                }

                let now = Instant::now();
                match state.entries.peek().map(|entry| entry.at) {
                    Some(at) if at <= now => {
                        break state.entries.pop().expect("peeked entry present").job;
                    }
                    Some(at) => {
                        shared.condvar.wait_until(&mut state, at);
                    }
                    None => {
                        shared.condvar.wait(&mut state);
                    }
                }
            }
        };

        job();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::atomic::{AtomicUsize, Ordering as AtomicOrdering};
    use std::sync::mpsc;
    use std::time::Duration;

    #[test]
    fn jobs_run_in_enqueue_order() {
        let queue = TaskQueue::new("test-fifo");
        let (tx, rx) = mpsc::channel();

        for i in 0..8 {
            let tx = tx.clone();
            queue.enqueue(move || tx.send(i).unwrap());
        }

        let order: Vec<i32> = (0..8)
            .map(|_| rx.recv_timeout(Duration::from_secs(1)).unwrap())
            .collect();
        assert_eq!(order, vec![0, 1, 2, 3, 4, 5, 6, 7]);
    }

    #[test]
    fn scheduled_job_waits_for_its_deadline() {
        let queue = TaskQueue::new("test-sched");
        let (tx, rx) = mpsc::channel();

        let start = Instant::now();
        let tx2 = tx.clone();
        queue.enqueue_at(start + Duration::from_millis(80), move || {
            tx2.send("late").unwrap()
        });
        queue.enqueue(move || tx.send("now").unwrap());

        assert_eq!(rx.recv_timeout(Duration::from_secs(1)).unwrap(), "now");
        assert_eq!(rx.recv_timeout(Duration::from_secs(1)).unwrap(), "late");
        assert!(start.elapsed() >= Duration::from_millis(80));
    }

    #[test]
    fn drop_drains_pending_jobs() {
        let counter = Arc::new(AtomicUsize::new(0));
        {
            let queue = TaskQueue::new("test-drain");
            // One slow job at the head so the rest are still queued at drop.
            queue.enqueue(|| std::thread::sleep(Duration::from_millis(30)));
            for _ in 0..5 {
                let counter = Arc::clone(&counter);
                queue.enqueue(move || {
                    counter.fetch_add(1, AtomicOrdering::SeqCst);
                });
            }
        }
        assert_eq!(counter.load(AtomicOrdering::SeqCst), 5);
    }

    #[test]
    fn handle_enqueue_after_drop_is_a_noop() {
        let handle = {
            let queue = TaskQueue::new("test-dead-handle");
            queue.handle()
        };
        // Must not panic or block; the job is discarded.
        handle.enqueue(|| panic!("must not run"));
        std::thread::sleep(Duration::from_millis(20));
    }

    #[test]
    fn self_rearming_job_stops_at_shutdown() {
        let ticks = Arc::new(AtomicUsize::new(0));

        fn pump(handle: TaskQueueHandle, ticks: Arc<AtomicUsize>) {
            let next = handle.clone();
            handle.enqueue(move || {
                ticks.fetch_add(1, AtomicOrdering::SeqCst);
                std::thread::sleep(Duration::from_millis(5));
                pump(next.clone(), ticks);
            });
        }

        let queue = TaskQueue::new("test-pump");
        pump(queue.handle(), Arc::clone(&ticks));
        std::thread::sleep(Duration::from_millis(50));
        drop(queue);

        let after_drop = ticks.load(AtomicOrdering::SeqCst);
        assert!(after_drop >= 2, "pump never ran: {after_drop}");
        std::thread::sleep(Duration::from_millis(30));
        assert_eq!(ticks.load(AtomicOrdering::SeqCst), after_drop);
    }

    #[test]
    fn pending_reflects_queued_jobs() {
        let queue = TaskQueue::new("test-pending");
        let far = Instant::now() + Duration::from_secs(60);
        queue.enqueue_at(far, || {});
        queue.enqueue_at(far, || {});
        assert_eq!(queue.pending(), 2);
    }
}
