use crate::errors::{ErrorCode, Result};

use std::sync::{Condvar, Mutex};

struct OpState<H> {
    armed: Option<H>,
    running: usize,
}

/// Holder for the handler of a single outstanding asynchronous operation.
///
/// A handler is armed once and fired exactly once; arming while a handler is
/// already armed fails with `AsyncOperationRunning`. Firing with no armed
/// handler is a no-op, which is what makes cancellation idempotent.
/// `await_idle` blocks until no handler invocation is in flight, so owners
/// can tear down safely.
pub struct AsyncOperation<H> {
    state: Mutex<OpState<H>>,
    cv: Condvar,
}

impl<H> AsyncOperation<H> {
    pub fn new() -> AsyncOperation<H> {
        AsyncOperation {
            state: Mutex::new(OpState {
                armed: None,
                running: 0,
            }),
            cv: Condvar::new(),
        }
    }

    pub fn armed(&self) -> bool {
        self.state.lock().unwrap().armed.is_some()
    }

    pub fn arm(&self, handler: H) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        if state.armed.is_some() {
            return Err(ErrorCode::AsyncOperationRunning);
        }

        state.armed = Some(handler);
        state.running += 1;
        Ok(())
    }

    /// Takes the armed handler and passes it to `invoke` outside the lock.
    /// Returns whether a handler was actually fired.
    pub fn fire<F>(&self, invoke: F) -> bool
    where
        F: FnOnce(H),
    {
        let handler = {
            let mut state = self.state.lock().unwrap();
            state.armed.take()
        };

        match handler {
            Some(handler) => {
                invoke(handler);

                let mut state = self.state.lock().unwrap();
                state.running -= 1;
                drop(state);
                self.cv.notify_all();

                true
            }
            None => false,
        }
    }

    /// Blocks until no handler invocation is in flight.
    pub fn await_idle(&self) {
        let mut state = self.state.lock().unwrap();
        while state.running > 0 {
            state = self.cv.wait(state).unwrap();
        }
    }
}
