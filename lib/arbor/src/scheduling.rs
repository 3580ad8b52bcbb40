use crate::errors::{ErrorCode, Result};

use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex};
use std::thread;

pub const MAX_SCHEDULER_THREADS: usize = 64;

pub type Task = Box<dyn FnOnce() + Send>;

/// Execution context for all asynchronous work in the fabric. The core only
/// needs "run this closure eventually"; everything else (ordering, strands,
/// timers) is layered on top.
pub trait Scheduler: Send + Sync {
    fn post(&self, task: Task);

    /// May run the task inline; the default implementation simply posts,
    /// which keeps lock ordering trivial for callers.
    fn dispatch(&self, task: Task) {
        self.post(task);
    }
}

struct PoolShared {
    queue: Mutex<(VecDeque<Task>, bool)>,
    cv: Condvar,
}

/// Scheduler backed by a fixed pool of worker threads draining a FIFO queue.
/// Dropping the scheduler lets the workers finish the queued work and exit.
pub struct MultiThreadedScheduler {
    shared: Arc<PoolShared>,
    threads: Mutex<Vec<thread::JoinHandle<()>>>,
}

impl MultiThreadedScheduler {
    pub fn new(num_threads: usize) -> Result<MultiThreadedScheduler> {
        if num_threads < 1 || num_threads > MAX_SCHEDULER_THREADS {
            return Err(ErrorCode::InvalidParam);
        }

        let shared = Arc::new(PoolShared {
            queue: Mutex::new((VecDeque::new(), false)),
            cv: Condvar::new(),
        });

        let threads = (0..num_threads)
            .map(|_| {
                let shared = shared.clone();
                thread::spawn(move || Self::worker(shared))
            })
            .collect();

        Ok(MultiThreadedScheduler {
            shared,
            threads: Mutex::new(threads),
        })
    }

    fn worker(shared: Arc<PoolShared>) {
        loop {
            let task = {
                let mut state = shared.queue.lock().unwrap();
                loop {
                    if let Some(task) = state.0.pop_front() {
                        break task;
                    }
                    if state.1 {
                        return;
                    }
                    state = shared.cv.wait(state).unwrap();
                }
            };

            task();
        }
    }
}

impl Scheduler for MultiThreadedScheduler {
    fn post(&self, task: Task) {
        let mut state = self.shared.queue.lock().unwrap();
        state.0.push_back(task);
        drop(state);
        self.shared.cv.notify_one();
    }
}

impl Drop for MultiThreadedScheduler {
    fn drop(&mut self) {
        {
            let mut state = self.shared.queue.lock().unwrap();
            state.1 = true;
        }
        self.shared.cv.notify_all();

        for thread in self.threads.lock().unwrap().drain(..) {
            let _ = thread.join();
        }
    }
}

struct StrandState {
    queue: VecDeque<Task>,
    running: bool,
}

struct StrandShared {
    state: Mutex<StrandState>,
    scheduler: Arc<dyn Scheduler>,
}

impl StrandShared {
    fn drain(self: &Arc<StrandShared>) {
        loop {
            let task = {
                let mut state = self.state.lock().unwrap();
                match state.queue.pop_front() {
                    Some(task) => task,
                    None => {
                        state.running = false;
                        return;
                    }
                }
            };

            task();
        }
    }
}

/// FIFO serializing executor over a scheduler. Tasks posted to one strand run
/// one after the other, in posting order, with no two ever overlapping - the
/// only synchronization discipline the upper layers rely on for in-process
/// message delivery.
#[derive(Clone)]
pub struct Strand {
    shared: Arc<StrandShared>,
}

impl Strand {
    pub fn new(scheduler: Arc<dyn Scheduler>) -> Strand {
        Strand {
            shared: Arc::new(StrandShared {
                state: Mutex::new(StrandState {
                    queue: VecDeque::new(),
                    running: false,
                }),
                scheduler,
            }),
        }
    }

    pub fn post(&self, task: Task) {
        let start = {
            let mut state = self.shared.state.lock().unwrap();
            state.queue.push_back(task);
            if state.running {
                false
            } else {
                state.running = true;
                true
            }
        };

        if start {
            let shared = self.shared.clone();
            self.shared.scheduler.post(Box::new(move || shared.drain()));
        }
    }
}
