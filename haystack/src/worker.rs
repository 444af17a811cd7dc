//! Bounded queue and worker pool for non-blocking delivery.
//!
//! Producers never block: a full queue fails the enqueue fast so the caller
//! can count the loss. Worker threads pull tasks FIFO; a panicking task is
//! caught and logged, never taking the thread down with it.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc::{self, Receiver, SyncSender, TrySendError};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use crate::error::{Error, Result};
use crate::util;
use crate::{hay_debug, hay_warn};

enum Task {
    Run(Box<dyn FnOnce() + Send>),
    Shutdown(SyncSender<()>),
}

enum State {
    /// No threads yet; they start on the first enqueue.
    Idle,
    Running {
        sender: SyncSender<Task>,
        handles: Vec<thread::JoinHandle<()>>,
    },
    Stopped,
}

/// Asynchronous task executor with a bounded FIFO queue.
///
/// With zero threads configured it degrades to synchronous mode and runs
/// every task inline on the calling thread.
pub struct BackgroundWorker {
    threads: usize,
    capacity: usize,
    state: Mutex<State>,
    queue_depth: Arc<AtomicUsize>,
}

impl std::fmt::Debug for BackgroundWorker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackgroundWorker")
            .field("threads", &self.threads)
            .field("capacity", &self.capacity)
            .field("queue_depth", &self.queue_depth.load(Ordering::Relaxed))
            .finish()
    }
}

impl BackgroundWorker {
    pub fn new(threads: usize, capacity: usize) -> Self {
        BackgroundWorker {
            threads,
            capacity,
            state: Mutex::new(State::Idle),
            queue_depth: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Enqueue a task. Returns `false` without blocking when the queue is
    /// full or the worker was shut down; the caller must account the loss.
    pub fn perform<F>(&self, task: F) -> bool
    where
        F: FnOnce() + Send + 'static,
    {
        if self.threads == 0 {
            run_task(Box::new(task));
            return true;
        }

        let mut state = util::lock(&self.state);
        if matches!(*state, State::Idle) {
            *state = self.start();
        }
        let State::Running { sender, .. } = &*state else {
            return false;
        };

        match sender.try_send(Task::Run(Box::new(task))) {
            Ok(()) => {
                self.queue_depth.fetch_add(1, Ordering::Relaxed);
                true
            }
            Err(TrySendError::Full(_)) | Err(TrySendError::Disconnected(_)) => false,
        }
    }

    /// Whether the queue is at capacity, as seen by the backpressure probe.
    pub fn is_full(&self) -> bool {
        self.queue_depth.load(Ordering::Relaxed) >= self.capacity
    }

    /// Stop accepting tasks, drain the queue within `timeout`, then join the
    /// threads. Idempotent; later calls return `Ok` immediately.
    pub fn shutdown(&self, timeout: Duration) -> Result<()> {
        let previous = {
            let mut state = util::lock(&self.state);
            std::mem::replace(&mut *state, State::Stopped)
        };
        let State::Running { sender, handles } = previous else {
            return Ok(());
        };

        let deadline = Instant::now() + timeout;
        let mut acks = Vec::with_capacity(handles.len());
        for _ in &handles {
            // queued behind pending tasks, so the queue drains first
            let (ack_tx, ack_rx) = mpsc::sync_channel(1);
            let mut message = Task::Shutdown(ack_tx);
            loop {
                match sender.try_send(message) {
                    Ok(()) => {
                        acks.push(ack_rx);
                        break;
                    }
                    Err(TrySendError::Full(returned)) => {
                        if Instant::now() >= deadline {
                            break;
                        }
                        message = returned;
                        thread::sleep(Duration::from_millis(10));
                    }
                    Err(TrySendError::Disconnected(_)) => break,
                }
            }
        }
        drop(sender);

        let mut timed_out = acks.len() < handles.len();
        for ack in acks {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if ack.recv_timeout(remaining).is_err() {
                timed_out = true;
            }
        }
        for handle in handles {
            if handle.join().is_err() {
                hay_warn!(name: "BackgroundWorker.ThreadPanicked");
            }
        }

        if timed_out {
            Err(Error::ShutdownTimedOut(timeout))
        } else {
            hay_debug!(name: "BackgroundWorker.Shutdown");
            Ok(())
        }
    }

    fn start(&self) -> State {
        let (sender, receiver) = mpsc::sync_channel::<Task>(self.capacity);
        let receiver = Arc::new(Mutex::new(receiver));
        let handles = (0..self.threads)
            .map(|index| {
                let receiver = receiver.clone();
                let queue_depth = self.queue_depth.clone();
                thread::Builder::new()
                    .name(format!("haystack-worker-{index}"))
                    .spawn(move || worker_loop(&receiver, &queue_depth))
                    .expect("failed to spawn worker thread")
            })
            .collect();
        hay_debug!(name: "BackgroundWorker.Started", threads = self.threads);
        State::Running { sender, handles }
    }
}

fn worker_loop(receiver: &Arc<Mutex<Receiver<Task>>>, queue_depth: &AtomicUsize) {
    loop {
        let task = {
            let receiver = util::lock(receiver);
            receiver.recv()
        };
        match task {
            Ok(Task::Run(task)) => {
                queue_depth.fetch_sub(1, Ordering::Relaxed);
                run_task(task);
            }
            Ok(Task::Shutdown(ack)) => {
                let _ = ack.send(());
                return;
            }
            // all senders dropped
            Err(_) => return,
        }
    }
}

fn run_task(task: Box<dyn FnOnce() + Send>) {
    if catch_unwind(AssertUnwindSafe(task)).is_err() {
        hay_warn!(name: "BackgroundWorker.TaskPanicked");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;
    use std::sync::mpsc::channel;

    #[test]
    fn zero_threads_runs_inline() {
        let worker = BackgroundWorker::new(0, 30);
        let ran = Arc::new(AtomicBool::new(false));
        let flag = ran.clone();
        assert!(worker.perform(move || flag.store(true, Ordering::SeqCst)));
        assert!(ran.load(Ordering::SeqCst));
    }

    #[test]
    fn executes_tasks_on_background_thread() {
        let worker = BackgroundWorker::new(2, 30);
        let (tx, rx) = channel();
        for i in 0..5 {
            let tx = tx.clone();
            assert!(worker.perform(move || {
                let _ = tx.send(i);
            }));
        }
        let mut seen: Vec<i32> = (0..5).map(|_| rx.recv().unwrap()).collect();
        seen.sort_unstable();
        assert_eq!(seen, vec![0, 1, 2, 3, 4]);
        worker.shutdown(Duration::from_secs(2)).unwrap();
    }

    #[test]
    fn full_queue_rejects_without_blocking() {
        let worker = BackgroundWorker::new(1, 1);
        let (block_tx, block_rx) = channel::<()>();
        // first task occupies the single worker thread
        assert!(worker.perform(move || {
            let _ = block_rx.recv();
        }));
        // fill the single queue slot, then overflow
        let mut accepted = 0;
        let start = Instant::now();
        for _ in 0..3 {
            if worker.perform(|| {}) {
                accepted += 1;
            }
        }
        assert!(start.elapsed() < Duration::from_secs(1));
        assert!(accepted <= 2);
        drop(block_tx);
        let _ = worker.shutdown(Duration::from_secs(2));
    }

    #[test]
    fn shutdown_is_idempotent_and_drains() {
        let worker = BackgroundWorker::new(1, 30);
        let done = Arc::new(AtomicBool::new(false));
        let flag = done.clone();
        assert!(worker.perform(move || flag.store(true, Ordering::SeqCst)));
        worker.shutdown(Duration::from_secs(2)).unwrap();
        assert!(done.load(Ordering::SeqCst));
        worker.shutdown(Duration::from_secs(2)).unwrap();
        // after shutdown nothing is accepted
        assert!(!worker.perform(|| {}));
    }

    #[test]
    fn panicking_task_does_not_kill_the_pool() {
        let worker = BackgroundWorker::new(1, 30);
        assert!(worker.perform(|| panic!("boom")));
        let (tx, rx) = channel();
        assert!(worker.perform(move || {
            let _ = tx.send(());
        }));
        rx.recv_timeout(Duration::from_secs(2)).unwrap();
        let _ = worker.shutdown(Duration::from_secs(2));
    }
}
