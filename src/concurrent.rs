//! Spawning with bounded concurrency.
//!
//! [Concurrent] uses a channel as a counting semaphore: [Concurrent::create] pushes a permit
//! before spawning and the coroutine pops it on exit. Once `limit` coroutines are running,
//! further calls park the caller. That's the back-pressure, nothing is queued.

use std::time::Duration;

use crate::coroutine::{self, Coroutine};
use crate::sync::wait_group::{WaitGroup, WaitGroupError};
use crate::sync::Channel;

/// Occupancy of something with a fixed number of slots.
pub trait Bounded {
    /// Slots in use.
    fn length(&self) -> usize;

    fn limit(&self) -> usize;

    fn is_full(&self) -> bool {
        self.length() >= self.limit()
    }

    fn is_empty(&self) -> bool {
        self.length() == 0
    }
}

/// Fire-and-forget spawner running at most `limit` tasks at a time.
///
/// Panicking tasks are handed to the [reporter](crate::report) and never reach the caller.
#[derive(Debug, Clone)]
pub struct Concurrent {
    limit: usize,
    permits: Channel<()>,
}

impl Concurrent {
    /// # Panics
    /// If [limit] is zero.
    pub fn new(limit: usize) -> Self {
        assert!(limit > 0, "concurrency limit must be positive");

        Concurrent {
            limit,
            permits: Channel::new(limit),
        }
    }

    /// Spawns [task] once a permit is available, parking until then.
    pub fn create(&self, task: impl FnOnce() + 'static) -> Coroutine {
        // never closed and waits indefinitely, so it can't fail
        let _ = self.permits.push((), None);

        let permits = self.permits.clone();
        coroutine::spawn(move || {
            coroutine::defer(move || {
                let _ = permits.pop(Some(Duration::ZERO));
            });
            task();
        })
    }
}

impl Bounded for Concurrent {
    fn length(&self) -> usize {
        self.permits.length()
    }

    fn limit(&self) -> usize {
        self.limit
    }
}

/// [Concurrent] which can also wait for everything it spawned.
#[derive(Debug, Clone)]
pub struct WaitConcurrent {
    concurrent: Concurrent,
    group: WaitGroup,
}

impl WaitConcurrent {
    /// # Panics
    /// If [limit] is zero.
    pub fn new(limit: usize) -> Self {
        WaitConcurrent {
            concurrent: Concurrent::new(limit),
            group: WaitGroup::new(),
        }
    }

    /// Spawns [task] once a permit is available, parking until then.
    ///
    /// Fails if called while [WaitConcurrent::wait] is in progress.
    pub fn create(&self, task: impl FnOnce() + 'static) -> Result<Coroutine, WaitGroupError> {
        self.group.add(1)?;

        let group = self.group.clone();
        Ok(self.concurrent.create(move || {
            // runs before the permit is released
            coroutine::defer(move || {
                if let Err(error) = group.done() {
                    log::error!("failed to mark concurrent task as done: {error}");
                }
            });
            task();
        }))
    }

    /// Parks until every task created so far has finished.
    ///
    /// Returns `Ok(false)` if [timeout] elapsed first.
    pub fn wait(&self, timeout: Option<Duration>) -> Result<bool, WaitGroupError> {
        self.group.wait(timeout)
    }
}

impl Bounded for WaitConcurrent {
    fn length(&self) -> usize {
        self.concurrent.length()
    }

    fn limit(&self) -> usize {
        self.concurrent.limit()
    }
}
