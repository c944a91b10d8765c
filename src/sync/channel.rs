//! Bounded FIFO channel between coroutines.
//!
//! Closing is final: afterwards every push and pop fails, even while items are still buffered.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::fmt;
use std::rc::Rc;
use std::time::{Duration, Instant};

use thiserror::Error;

use crate::runtime;

/// Multi-producer multi-consumer queue holding up to `capacity` values.
///
/// Clones share the same queue. Capacity 0 makes every push a rendezvous with a pop.
#[derive(Debug)]
pub struct Channel<T>(Rc<RefCell<ChannelState<T>>>);

impl<T> Clone for Channel<T> {
    fn clone(&self) -> Self {
        Channel(self.0.clone())
    }
}

impl<T> Channel<T> {
    pub fn new(capacity: usize) -> Self {
        Channel(Rc::new(RefCell::new(ChannelState {
            queue: VecDeque::with_capacity(capacity),
            capacity,
            producers: VecDeque::new(),
            consumers: VecDeque::new(),
            is_closed: false,
            last_failure: None,
        })))
    }

    /// Appends [value], parking while there's no room.
    ///
    /// The value is handed back inside the error if the push didn't happen.
    pub fn push(&self, value: T, timeout: Option<Duration>) -> Result<(), PushError<T>> {
        let deadline = Deadline::after(timeout);

        loop {
            let mut state = self.0.borrow_mut();

            if state.is_closed {
                state.last_failure = Some(Failure::Closed);
                return Err(PushError::Closed(value));
            }

            if state.has_room() {
                state.queue.push_back(value);
                state.last_failure = None;
                state.wake_consumer();
                return Ok(());
            }

            let Some(remaining) = deadline.remaining() else {
                state.last_failure = Some(Failure::Timeout);
                return Err(PushError::Timeout(value));
            };

            let mut parked = None;
            let woken = runtime::park_timeout(remaining, |waker| {
                parked = Some(waker.clone());
                state.producers.push_back(waker);
                drop(state);
            }); // woken up by consumer, close, or deadline

            if !woken {
                let mut state = self.0.borrow_mut();
                state.producers.retain(|waker| Some(waker) != parked.as_ref());
                state.last_failure = Some(Failure::Timeout);
                return Err(PushError::Timeout(value));
            }
        }
    }

    /// Removes the oldest value, parking while there's none.
    pub fn pop(&self, timeout: Option<Duration>) -> Result<T, PopError> {
        let deadline = Deadline::after(timeout);

        loop {
            let mut state = self.0.borrow_mut();

            if state.is_closed {
                state.last_failure = Some(Failure::Closed);
                return Err(PopError::Closed);
            }

            if let Some(value) = state.queue.pop_front() {
                state.last_failure = None;
                state.wake_producer();
                return Ok(value);
            }

            let Some(remaining) = deadline.remaining() else {
                state.last_failure = Some(Failure::Timeout);
                return Err(PopError::Timeout);
            };

            if state.capacity == 0 {
                // rendezvous: let a waiting producer see this consumer
                state.wake_producer();
            }

            let mut parked = None;
            let woken = runtime::park_timeout(remaining, |waker| {
                parked = Some(waker.clone());
                state.consumers.push_back(waker);
                drop(state);
            }); // woken up by producer, close, or deadline

            if !woken {
                let mut state = self.0.borrow_mut();
                state.consumers.retain(|waker| Some(waker) != parked.as_ref());
                state.last_failure = Some(Failure::Timeout);
                return Err(PopError::Timeout);
            }
        }
    }

    /// Fails every parked and future push and pop.
    ///
    /// Returns `false` if the channel was already closed.
    pub fn close(&self) -> bool {
        let mut guard = self.0.borrow_mut();
        let state = &mut *guard;
        if state.is_closed {
            return false;
        }

        state.is_closed = true;
        for waker in state.producers.drain(..).chain(state.consumers.drain(..)) {
            waker.schedule();
        }

        true
    }

    /// Number of buffered values.
    #[inline]
    pub fn length(&self) -> usize {
        self.0.borrow().queue.len()
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.0.borrow().capacity
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.length() == 0
    }

    #[inline]
    pub fn is_full(&self) -> bool {
        self.length() >= self.capacity()
    }

    #[inline]
    pub fn is_closing(&self) -> bool {
        self.0.borrow().is_closed
    }

    /// Whether the latest push or pop on this channel failed by timing out.
    #[inline]
    pub fn is_timeout(&self) -> bool {
        self.0.borrow().last_failure == Some(Failure::Timeout)
    }

    pub fn stats(&self) -> ChannelStats {
        let state = self.0.borrow();
        ChannelStats {
            consumer_num: state.consumers.iter().filter(|waker| waker.is_parked()).count(),
            producer_num: state.producers.iter().filter(|waker| waker.is_parked()).count(),
            queue_num: state.queue.len(),
        }
    }
}

#[derive(Debug)]
struct ChannelState<T> {
    queue: VecDeque<T>,
    capacity: usize,
    producers: VecDeque<runtime::Waker>,
    consumers: VecDeque<runtime::Waker>,
    is_closed: bool,
    last_failure: Option<Failure>,
}

impl<T> ChannelState<T> {
    /// Beyond capacity, every parked consumer can take one value directly.
    fn has_room(&mut self) -> bool {
        if self.queue.len() < self.capacity {
            return true;
        }

        self.consumers.retain(runtime::Waker::is_parked);
        !self.consumers.is_empty()
    }

    fn wake_consumer(&mut self) {
        while let Some(waker) = self.consumers.pop_front() {
            if waker.schedule() {
                break;
            }
        }
    }

    fn wake_producer(&mut self) {
        while let Some(waker) = self.producers.pop_front() {
            if waker.schedule() {
                break;
            }
        }
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
enum Failure {
    Timeout,
    Closed,
}

#[derive(Debug, Copy, Clone)]
struct Deadline(Option<Instant>);

impl Deadline {
    fn after(timeout: Option<Duration>) -> Self {
        Deadline(timeout.map(|timeout| Instant::now().checked_add(timeout).unwrap_or_else(far_future)))
    }

    /// `None` once the deadline passed, `Some(None)` without a deadline.
    fn remaining(&self) -> Option<Option<Duration>> {
        match self.0 {
            None => Some(None),
            Some(deadline) => {
                let remaining = deadline.saturating_duration_since(Instant::now());
                (!remaining.is_zero()).then_some(Some(remaining))
            }
        }
    }
}

fn far_future() -> Instant {
    // roughly 30 years, representable on every platform
    Instant::now() + Duration::from_secs(86400 * 365 * 30)
}

/// Parked coroutines and buffered values of a [Channel].
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct ChannelStats {
    pub consumer_num: usize,
    pub producer_num: usize,
    pub queue_num: usize,
}

/// Why a push failed, carrying the value that wasn't pushed.
#[derive(PartialEq, Eq)]
pub enum PushError<T> {
    Timeout(T),
    Closed(T),
}

impl<T> PushError<T> {
    pub fn into_inner(self) -> T {
        match self {
            PushError::Timeout(value) | PushError::Closed(value) => value,
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, PushError::Timeout(_))
    }

    pub fn is_closed(&self) -> bool {
        matches!(self, PushError::Closed(_))
    }
}

impl<T> fmt::Debug for PushError<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PushError::Timeout(_) => f.write_str("Timeout(..)"),
            PushError::Closed(_) => f.write_str("Closed(..)"),
        }
    }
}

impl<T> fmt::Display for PushError<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PushError::Timeout(_) => f.write_str("timed out pushing to channel"),
            PushError::Closed(_) => f.write_str("pushing to closed channel"),
        }
    }
}

impl<T> std::error::Error for PushError<T> {}

/// Why a pop failed.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Error)]
pub enum PopError {
    #[error("timed out popping from channel")]
    Timeout,
    #[error("popping from closed channel")]
    Closed,
}
