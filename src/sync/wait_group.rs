//! Go-style wait group.

use std::cell::Cell;
use std::rc::Rc;
use std::time::Duration;

use thiserror::Error;

use crate::sync::channel::Channel;

/// Counter a controller can wait on until workers drive it to zero.
///
/// Clones share the same counter. Only one [WaitGroup::wait] may be in progress at a time, and
/// [WaitGroup::add] is refused while it is.
#[derive(Debug, Clone)]
pub struct WaitGroup(Rc<WaitGroupState>);

#[derive(Debug)]
struct WaitGroupState {
    count: Cell<usize>,
    is_waiting: Cell<bool>,
    zero: Channel<()>,
}

impl WaitGroup {
    pub fn new() -> Self {
        Self::with_count(0)
    }

    pub fn with_count(count: usize) -> Self {
        WaitGroup(Rc::new(WaitGroupState {
            count: Cell::new(count),
            is_waiting: Cell::new(false),
            zero: Channel::new(1),
        }))
    }

    /// Adjusts the counter by [delta].
    pub fn add(&self, delta: isize) -> Result<(), WaitGroupError> {
        if self.0.is_waiting.get() {
            return Err(WaitGroupError::AddDuringWait);
        }

        let count = match self.count().checked_add_signed(delta) {
            Some(count) => count,
            None if delta < 0 => return Err(WaitGroupError::NegativeCounter),
            None => return Err(WaitGroupError::CounterOverflow),
        };
        self.0.count.set(count);

        Ok(())
    }

    /// Decrements the counter, waking the waiter once it reaches zero.
    pub fn done(&self) -> Result<(), WaitGroupError> {
        let count = self.count().checked_sub(1).ok_or(WaitGroupError::NegativeCounter)?;
        self.0.count.set(count);

        if count == 0 && self.0.is_waiting.get() {
            // the waiter is the only consumer and the slot is empty while it waits
            let _ = self.0.zero.push((), Some(Duration::ZERO));
        }

        Ok(())
    }

    /// Parks until the counter is zero.
    ///
    /// Returns `Ok(false)` if [timeout] elapsed first. Never parks if the counter is already zero.
    pub fn wait(&self, timeout: Option<Duration>) -> Result<bool, WaitGroupError> {
        if self.0.is_waiting.get() {
            return Err(WaitGroupError::ConcurrentWait);
        }

        if self.count() == 0 {
            return Ok(true);
        }

        self.0.is_waiting.set(true);
        let result = self.0.zero.pop(timeout);
        self.0.is_waiting.set(false);

        match result {
            Ok(()) => Ok(true),
            // the counter may have hit zero between the deadline and resuming
            Err(_) => Ok(self.0.zero.pop(Some(Duration::ZERO)).is_ok()),
        }
    }

    pub fn count(&self) -> usize {
        self.0.count.get()
    }
}

impl Default for WaitGroup {
    fn default() -> Self {
        Self::new()
    }
}

/// Caller-side mistakes, reported instead of being tolerated.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Error)]
pub enum WaitGroupError {
    #[error("wait group misuse: negative counter")]
    NegativeCounter,
    #[error("wait group misuse: counter overflow")]
    CounterOverflow,
    #[error("wait group misuse: add called concurrently with wait")]
    AddDuringWait,
    #[error("wait group misuse: reused before previous wait has returned")]
    ConcurrentWait,
}

#[cfg(test)]
mod tests {
    use std::time::Instant;

    use super::*;
    use crate::runtime::{spawn, start, yield_now};
    use crate::time::sleep;

    mod add {
        use super::*;

        #[test]
        fn adjusts_counter() {
            let group = WaitGroup::new();

            group.add(3).unwrap();
            group.add(-1).unwrap();

            assert_eq!(group.count(), 2);
        }

        #[test]
        fn refuses_negative_counter() {
            let group = WaitGroup::with_count(1);

            assert_eq!(group.add(-2), Err(WaitGroupError::NegativeCounter));
            assert_eq!(group.count(), 1);
        }

        #[test]
        fn refuses_overflowing_counter() {
            let group = WaitGroup::with_count(usize::MAX);

            assert_eq!(group.add(1), Err(WaitGroupError::CounterOverflow));
            assert_eq!(group.add(-1), Ok(()));
            assert_eq!(group.count(), usize::MAX - 1);
        }

        #[test]
        fn refused_during_wait() {
            start(|| {
                let group = WaitGroup::with_count(1);

                let adder = spawn({
                    let group = group.clone();
                    move || {
                        assert_eq!(group.add(1), Err(WaitGroupError::AddDuringWait));
                        group.done().unwrap();
                    }
                });

                assert_eq!(group.wait(None), Ok(true));
                assert!(!adder.is_alive());
                assert_eq!(group.count(), 0);
            })
            .unwrap();
        }
    }

    mod done {
        use super::*;

        #[test]
        fn refuses_negative_counter() {
            let group = WaitGroup::with_count(1);

            group.done().unwrap();

            assert_eq!(group.done(), Err(WaitGroupError::NegativeCounter));
            assert_eq!(group.count(), 0);
        }
    }

    mod wait {
        use super::*;

        #[test]
        fn zero_returns_immediately() {
            let group = WaitGroup::new();

            // no runtime needed since it never parks
            assert_eq!(group.wait(None), Ok(true));
            assert_eq!(group.wait(Some(Duration::ZERO)), Ok(true));
            assert_eq!(group.wait(Some(Duration::from_secs(1))), Ok(true));
        }

        #[test]
        fn waits_for_workers() {
            start(|| {
                let group = WaitGroup::new();
                let finished = Rc::new(Cell::new(0));

                for n in 1..=3 {
                    group.add(1).unwrap();
                    let (group, finished) = (group.clone(), finished.clone());
                    spawn(move || {
                        sleep(Duration::from_millis(n));
                        finished.set(finished.get() + 1);
                        group.done().unwrap();
                    });
                }

                assert_eq!(group.wait(None), Ok(true));
                assert_eq!(finished.get(), 3);
            })
            .unwrap();
        }

        #[test]
        fn times_out() {
            start(|| {
                let group = WaitGroup::with_count(1);
                let before = Instant::now();

                assert_eq!(group.wait(Some(Duration::from_millis(2))), Ok(false));
                assert!(before.elapsed() >= Duration::from_millis(2));
                assert_eq!(group.wait(Some(Duration::ZERO)), Ok(false));
            })
            .unwrap();
        }

        #[test]
        fn refuses_concurrent_wait() {
            start(|| {
                let group = WaitGroup::with_count(1);

                spawn({
                    let group = group.clone();
                    move || {
                        assert_eq!(group.wait(None), Err(WaitGroupError::ConcurrentWait));
                        group.done().unwrap();
                    }
                });

                assert_eq!(group.wait(None), Ok(true));
            })
            .unwrap();
        }

        #[test]
        fn reusable_after_wait() {
            start(|| {
                let group = WaitGroup::new();

                for _ in 0..2 {
                    group.add(1).unwrap();
                    spawn({
                        let group = group.clone();
                        move || group.done().unwrap()
                    });

                    assert_eq!(group.wait(None), Ok(true));
                }

                // a timed out cycle leaves nothing behind for the next one
                group.add(1).unwrap();
                assert_eq!(group.wait(Some(Duration::ZERO)), Ok(false));
                group.done().unwrap();
                group.add(1).unwrap();
                assert_eq!(group.wait(Some(Duration::ZERO)), Ok(false));
                yield_now();
            })
            .unwrap();
        }
    }

    #[test]
    fn displays_misuse() {
        assert_eq!(
            WaitGroupError::NegativeCounter.to_string(),
            "wait group misuse: negative counter"
        );
    }
}
