//! Keyed mutual exclusion backed by capacity-1 channels.

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;
use std::time::Duration;

use crate::sync::channel::Channel;

/// How long [Mutex::unlock] callers typically wait for the key's slot.
pub const DEFAULT_UNLOCK_TIMEOUT: Duration = Duration::from_secs(5);

/// Named critical sections, each key locked independently.
///
/// Holding a key means having pushed into its channel, so waiters are admitted in arrival order.
/// Ownership isn't tracked: any coroutine may unlock a key.
#[derive(Debug, Clone, Default)]
pub struct Mutex {
    channels: Rc<RefCell<HashMap<String, Channel<()>>>>,
}

impl Mutex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Acquires [key], parking while another coroutine holds it.
    ///
    /// Returns `false` if [timeout] elapsed or the key was cleared.
    pub fn lock(&self, key: &str, timeout: Option<Duration>) -> bool {
        let channel = self.channel(key);
        channel.push((), timeout).is_ok()
    }

    /// Releases [key].
    ///
    /// Unknown and already cleared keys count as released. Otherwise returns `false` if the slot
    /// stayed empty for the whole [timeout], that is when nobody held the key, or if the key was
    /// cleared while waiting.
    pub fn unlock(&self, key: &str, timeout: Option<Duration>) -> bool {
        let Some(channel) = self.channels.borrow().get(key).cloned() else {
            return true;
        };

        channel.pop(timeout).is_ok()
    }

    /// Forgets [key], failing every coroutine parked on it.
    pub fn clear(&self, key: &str) {
        if let Some(channel) = self.channels.borrow_mut().remove(key) {
            channel.close();
        }
    }

    /// Whether some coroutine holds [key].
    pub fn is_locked(&self, key: &str) -> bool {
        self.channels.borrow().get(key).is_some_and(|channel| channel.is_full())
    }

    fn channel(&self, key: &str) -> Channel<()> {
        self.channels
            .borrow_mut()
            .entry(key.to_owned())
            .or_insert_with(|| Channel::new(1))
            .clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::{spawn, start, yield_now};
    use crate::sync::WaitGroup;

    #[test]
    fn serializes_critical_sections() {
        start(|| {
            let mutex = Mutex::new();
            let group = WaitGroup::new();
            let output = Rc::new(RefCell::new(String::new()));

            for letter in ['h', 'e', 'l', 'l', 'o'] {
                group.add(1).unwrap();
                let (mutex, group, output) = (mutex.clone(), group.clone(), output.clone());
                spawn(move || {
                    assert!(mutex.lock("greeting", None));
                    yield_now(); // others pile up behind the lock
                    output.borrow_mut().push(letter);
                    assert!(mutex.unlock("greeting", Some(DEFAULT_UNLOCK_TIMEOUT)));
                    group.done().unwrap();
                });
            }

            assert_eq!(group.wait(None), Ok(true));
            assert_eq!(*output.borrow(), "hello");
        })
        .unwrap();
    }

    #[test]
    fn keys_are_independent() {
        let mutex = Mutex::new();

        assert!(mutex.lock("a", Some(Duration::ZERO)));
        assert!(mutex.lock("b", Some(Duration::ZERO)));
        assert!(!mutex.lock("a", Some(Duration::ZERO)));

        assert!(mutex.is_locked("a"));
        assert!(mutex.unlock("a", Some(Duration::ZERO)));
        assert!(!mutex.is_locked("a"));
        assert!(mutex.is_locked("b"));
    }

    #[test]
    fn lock_times_out() {
        start(|| {
            let mutex = Mutex::new();
            mutex.lock("key", None);

            assert!(!mutex.lock("key", Some(Duration::from_millis(2))));
        })
        .unwrap();
    }

    #[test]
    fn unlocking_unknown_key_succeeds() {
        let mutex = Mutex::new();

        assert!(mutex.unlock("never locked", Some(Duration::ZERO)));
    }

    #[test]
    fn unlocking_unheld_key_times_out() {
        let mutex = Mutex::new();
        mutex.lock("key", None);
        mutex.unlock("key", None);

        assert!(!mutex.unlock("key", Some(Duration::ZERO)));
    }

    #[test]
    fn clear_fails_parked_unlock() {
        start(|| {
            let mutex = Mutex::new();
            let released = Rc::new(RefCell::new(None));
            mutex.lock("key", None);
            mutex.unlock("key", None);

            spawn({
                let (mutex, released) = (mutex.clone(), released.clone());
                move || {
                    let unlocked = mutex.unlock("key", None);
                    *released.borrow_mut() = Some(unlocked);
                }
            });
            yield_now();

            mutex.clear("key");
            yield_now();

            assert_eq!(*released.borrow(), Some(false));
        })
        .unwrap();
    }

    #[test]
    fn clear_fails_waiters() {
        start(|| {
            let mutex = Mutex::new();
            let acquired = Rc::new(RefCell::new(None));
            mutex.lock("key", None);

            spawn({
                let (mutex, acquired) = (mutex.clone(), acquired.clone());
                move || {
                    let locked = mutex.lock("key", None);
                    *acquired.borrow_mut() = Some(locked);
                }
            });
            yield_now();

            mutex.clear("key");
            yield_now();

            assert_eq!(*acquired.borrow(), Some(false));
            assert!(mutex.unlock("key", Some(Duration::ZERO)));
            assert!(mutex.lock("key", Some(Duration::ZERO)));
        })
        .unwrap();
    }
}
