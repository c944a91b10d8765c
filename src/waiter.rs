//! Blocking on a coroutine's result.

use std::panic::{self, AssertUnwindSafe};
use std::thread;
use std::time::Duration;

use thiserror::Error;

use crate::sync::Channel;
use crate::{coroutine, runtime};

/// How long [Waiter::default] waits for a result.
pub const DEFAULT_WAIT_TIMEOUT: Duration = Duration::from_secs(10);

/// Runs closures in their own coroutine and waits for what they return.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct Waiter {
    timeout: Duration,
}

impl Waiter {
    pub fn new(timeout: Duration) -> Self {
        Waiter { timeout }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Runs [closure] in a new coroutine and waits up to [timeout] for its output.
    ///
    /// `None` falls back to the waiter's own timeout. A panic in [closure] resumes in the caller
    /// with the original payload, a returned `Err` is just another output.
    ///
    /// Outside of a coroutine this runs a runtime of its own, which only returns once [closure]
    /// has finished, even after timing out.
    pub fn wait<T: 'static>(
        &self,
        closure: impl FnOnce() -> T + 'static,
        timeout: Option<Duration>,
    ) -> Result<T, WaitTimeoutError> {
        let timeout = timeout.unwrap_or(self.timeout);

        if coroutine::in_coroutine() {
            return wait_in_coroutine(closure, timeout);
        }

        match runtime::start(move || wait_in_coroutine(closure, timeout)) {
            Ok(output) => output,
            Err(payload) => panic::resume_unwind(payload),
        }
    }
}

impl Default for Waiter {
    fn default() -> Self {
        Self::new(DEFAULT_WAIT_TIMEOUT)
    }
}

fn wait_in_coroutine<T: 'static>(
    closure: impl FnOnce() -> T + 'static,
    timeout: Duration,
) -> Result<T, WaitTimeoutError> {
    let slot: Channel<thread::Result<T>> = Channel::new(1);

    coroutine::spawn({
        let slot = slot.clone();
        move || {
            let output = panic::catch_unwind(AssertUnwindSafe(closure));
            // only ever pushed once, there's always room
            let _ = slot.push(output, Some(Duration::ZERO));
        }
    });

    match slot.pop(Some(timeout)) {
        Ok(Ok(output)) => Ok(output),
        Ok(Err(payload)) => panic::resume_unwind(payload),
        Err(_) => {
            log::debug!("gave up waiting for coroutine result after {timeout:?}");
            Err(WaitTimeoutError { timeout })
        }
    }
}

/// Same as [Waiter::wait] with [DEFAULT_WAIT_TIMEOUT] as fallback.
pub fn wait<T: 'static>(
    closure: impl FnOnce() -> T + 'static,
    timeout: Option<Duration>,
) -> Result<T, WaitTimeoutError> {
    Waiter::default().wait(closure, timeout)
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Error)]
#[error("waiting for coroutine result timed out after {}s", .timeout.as_secs_f64())]
pub struct WaitTimeoutError {
    pub timeout: Duration,
}
