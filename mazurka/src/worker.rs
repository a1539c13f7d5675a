//! Fixed-size worker pool fed by an unbounded task FIFO.

use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};

type Job = Box<dyn FnOnce() + Send + 'static>;

struct State {
    jobs: VecDeque<Job>,
    stop: bool,
}

struct Shared {
    state: Mutex<State>,
    cond: Condvar,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

pub struct WorkerPool {
    shared: Arc<Shared>,
    handles: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    /// Spawn `thread_num` workers; zero selects the hardware concurrency.
    pub fn new(thread_num: usize) -> Self {
        let thread_num = if thread_num == 0 {
            num_cpus::get()
        } else {
            thread_num
        };

        let shared = Arc::new(Shared {
            state: Mutex::new(State {
                jobs: VecDeque::new(),
                stop: false,
            }),
            cond: Condvar::new(),
        });

        let mut handles = Vec::with_capacity(thread_num);
        for i in 0..thread_num {
            let shared = Arc::clone(&shared);
            let handle = thread::Builder::new()
                .name(format!("mazurka-worker-{}", i))
                .spawn(move || worker_loop(&shared))
                .expect("failed to spawn worker thread");
            handles.push(handle);
        }

        Self { shared, handles }
    }

    /// Queue a job and wake one worker. Jobs submitted after the pool has
    /// begun stopping are dropped.
    pub fn add_task<F>(&self, job: F)
    where
        F: FnOnce() + Send + 'static,
    {
        {
            let mut state = self.shared.lock();
            if state.stop {
                return;
            }
            state.jobs.push_back(Box::new(job));
        }
        self.shared.cond.notify_one();
    }
}

fn worker_loop(shared: &Shared) {
    let mut state = shared.lock();
    loop {
        if let Some(job) = state.jobs.pop_front() {
            drop(state);
            job();
            state = shared.lock();
        } else if state.stop {
            break;
        } else {
            state = shared
                .cond
                .wait(state)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }
}

impl Drop for WorkerPool {
    /// Signal stop and wait for the workers to drain whatever is queued.
    fn drop(&mut self) {
        self.shared.lock().stop = true;
        self.shared.cond.notify_all();
        for handle in self.handles.drain(..) {
            let _ = handle.join();
        }
    }
}
