//! Fixed-size worker pool consuming a shared task queue.
//!
//! Workers block on a condition variable while the queue is empty. Dropping
//! the pool closes the queue, wakes everyone, and joins: workers drain the
//! remaining tasks before exiting. A panicking task is contained to that task
//! and never takes its worker down.

use std::collections::VecDeque;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};

type Task = Box<dyn FnOnce() + Send + 'static>;

pub struct WorkerPool {
    shared: Arc<Shared>,
    workers: Vec<JoinHandle<()>>,
}

struct Shared {
    state: Mutex<State>,
    available: Condvar,
}

struct State {
    tasks: VecDeque<Task>,
    closed: bool,
}

impl WorkerPool {
    pub fn new(threads: usize) -> Self {
        assert!(threads > 0, "worker pool needs at least one thread");
        let shared = Arc::new(Shared {
            state: Mutex::new(State {
                tasks: VecDeque::new(),
                closed: false,
            }),
            available: Condvar::new(),
        });

        let workers = (0..threads)
            .map(|i| {
                let shared = Arc::clone(&shared);
                thread::Builder::new()
                    .name(format!("worker-{i}"))
                    .spawn(move || Self::worker_loop(&shared))
                    .expect("failed to spawn worker thread")
            })
            .collect();

        Self { shared, workers }
    }

    pub fn submit(&self, task: impl FnOnce() + Send + 'static) {
        let mut state = self.shared.state.lock().unwrap();
        if state.closed {
            return;
        }
        state.tasks.push_back(Box::new(task));
        drop(state);
        self.shared.available.notify_one();
    }

    fn worker_loop(shared: &Shared) {
        loop {
            let task = {
                let mut state = shared.state.lock().unwrap();
                loop {
                    if let Some(task) = state.tasks.pop_front() {
                        break task;
                    }
                    if state.closed {
                        return;
                    }
                    state = shared.available.wait(state).unwrap();
                }
            };

            if panic::catch_unwind(AssertUnwindSafe(task)).is_err() {
                tracing::error!("worker task panicked");
            }
        }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.shared.state.lock().unwrap().closed = true;
        self.shared.available.notify_all();
        for worker in self.workers.drain(..) {
            let _ = worker.join();
        }
    }
}
