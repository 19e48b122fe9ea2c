//! Priority worker pools.
//!
//! Two pools back the engine: a *mutations* pool applying index writes and a
//! *reader* pool executing queries. Tasks carry one of three priorities —
//! backfill traffic schedules `Low`, foreground keyspace events `High`, and
//! MULTI/EXEC drains `Max` so a transaction flush overtakes everything else.
//! Pools can be suspended while an RDB load rebuilds state and resumed
//! afterwards without losing queued work.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use crossbeam::channel::{unbounded, Receiver, Sender};
use parking_lot::{Condvar, Mutex};
use tracing::debug;

/// Scheduling class for a pool task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Priority {
    Low,
    High,
    Max,
}

type Task = Box<dyn FnOnce() + Send + 'static>;

const TICK: Duration = Duration::from_millis(50);

struct PoolShared {
    queues: [(Sender<Task>, Receiver<Task>); 3],
    pending: AtomicUsize,
    stopping: AtomicBool,
    suspended: Mutex<bool>,
    resume_signal: Condvar,
}

impl PoolShared {
    fn pop(&self) -> Option<Task> {
        // Max first, then high, then low.
        for (_, rx) in self.queues.iter().rev() {
            if let Ok(task) = rx.try_recv() {
                return Some(task);
            }
        }
        None
    }

    fn wait_if_suspended(&self) {
        let mut suspended = self.suspended.lock();
        while *suspended && !self.stopping.load(Ordering::Acquire) {
            self.resume_signal.wait(&mut suspended);
        }
    }
}

/// Fixed-size pool draining tasks in priority order.
pub struct WorkerPool {
    shared: Arc<PoolShared>,
    threads: Mutex<Vec<JoinHandle<()>>>,
    size: usize,
}

impl WorkerPool {
    pub fn new(name: &str, size: usize) -> Self {
        let shared = Arc::new(PoolShared {
            queues: [unbounded(), unbounded(), unbounded()],
            pending: AtomicUsize::new(0),
            stopping: AtomicBool::new(false),
            suspended: Mutex::new(false),
            resume_signal: Condvar::new(),
        });
        let mut threads = Vec::with_capacity(size);
        for worker_id in 0..size {
            let shared = shared.clone();
            let thread_name = format!("{name}-{worker_id}");
            threads.push(
                std::thread::Builder::new()
                    .name(thread_name)
                    .spawn(move || worker_loop(shared))
                    .expect("spawning pool worker"),
            );
        }
        Self {
            shared,
            threads: Mutex::new(threads),
            size,
        }
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Enqueue a task. With a zero-sized pool the caller is expected to run
    /// work synchronously instead; scheduling is then a no-op.
    pub fn schedule(&self, priority: Priority, task: Task) {
        if self.size == 0 {
            return;
        }
        self.shared.pending.fetch_add(1, Ordering::AcqRel);
        let slot = match priority {
            Priority::Low => 0,
            Priority::High => 1,
            Priority::Max => 2,
        };
        // Send fails only after shutdown; dropping the task then is fine.
        let _ = self.shared.queues[slot].0.send(task);
    }

    /// Tasks queued or currently executing.
    pub fn pending(&self) -> usize {
        self.shared.pending.load(Ordering::Acquire)
    }

    /// Pause task consumption (queued tasks are retained).
    pub fn suspend(&self) {
        *self.shared.suspended.lock() = true;
    }

    pub fn resume(&self) {
        *self.shared.suspended.lock() = false;
        self.shared.resume_signal.notify_all();
    }

    /// Busy-wait until every queued task has run. Intended for tests and
    /// shutdown paths, not hot paths.
    pub fn drain(&self) {
        while self.pending() > 0 {
            std::thread::sleep(Duration::from_millis(1));
        }
    }

    pub fn shutdown(&self) {
        self.shared.stopping.store(true, Ordering::Release);
        self.resume();
        let mut threads = self.threads.lock();
        for handle in threads.drain(..) {
            let _ = handle.join();
        }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn worker_loop(shared: Arc<PoolShared>) {
    loop {
        shared.wait_if_suspended();
        if let Some(task) = shared.pop() {
            task();
            shared.pending.fetch_sub(1, Ordering::AcqRel);
            continue;
        }
        if shared.stopping.load(Ordering::Acquire) {
            debug!("pool worker exiting");
            return;
        }
        // Nothing queued: wait for readiness on any queue without consuming,
        // then re-run the priority sweep. The tick bounds shutdown latency.
        let mut select = crossbeam::channel::Select::new();
        for (_, rx) in &shared.queues {
            select.recv(rx);
        }
        let _ = select.ready_timeout(TICK);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;

    #[test]
    fn executes_all_tasks() {
        let pool = WorkerPool::new("test", 3);
        let counter = Arc::new(AtomicU32::new(0));
        for _ in 0..100 {
            let counter = counter.clone();
            pool.schedule(
                Priority::High,
                Box::new(move || {
                    counter.fetch_add(1, Ordering::SeqCst);
                }),
            );
        }
        pool.drain();
        assert_eq!(counter.load(Ordering::SeqCst), 100);
    }

    #[test]
    fn max_priority_overtakes_low() {
        let pool = WorkerPool::new("test", 1);
        pool.suspend();
        let order = Arc::new(Mutex::new(Vec::new()));
        for label in ["low-1", "low-2"] {
            let order = order.clone();
            pool.schedule(
                Priority::Low,
                Box::new(move || order.lock().push(label)),
            );
        }
        let order_clone = order.clone();
        pool.schedule(
            Priority::Max,
            Box::new(move || order_clone.lock().push("max")),
        );
        pool.resume();
        pool.drain();
        assert_eq!(order.lock().first(), Some(&"max"));
    }

    #[test]
    fn suspend_holds_back_queued_work() {
        let pool = WorkerPool::new("test", 2);
        pool.suspend();
        let counter = Arc::new(AtomicU32::new(0));
        for _ in 0..10 {
            let counter = counter.clone();
            pool.schedule(
                Priority::High,
                Box::new(move || {
                    counter.fetch_add(1, Ordering::SeqCst);
                }),
            );
        }
        std::thread::sleep(Duration::from_millis(20));
        assert_eq!(counter.load(Ordering::SeqCst), 0);
        pool.resume();
        pool.drain();
        assert_eq!(counter.load(Ordering::SeqCst), 10);
    }

    #[test]
    fn zero_sized_pool_drops_schedules() {
        let pool = WorkerPool::new("test", 0);
        pool.schedule(Priority::High, Box::new(|| panic!("must not run")));
        assert_eq!(pool.pending(), 0);
    }
}
