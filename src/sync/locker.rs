//! Keyed ownership with broadcast release.

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;

use crate::sync::channel::Channel;

/// First caller of [Locker::lock] on a key owns it, later callers park until the owner unlocks.
///
/// Unlike [Mutex](crate::sync::Mutex) the waiters don't take turns: unlocking releases all of them
/// at once and none of them becomes the owner. Suited for leader-election style coordination.
#[derive(Debug, Clone, Default)]
pub struct Locker {
    channels: Rc<RefCell<HashMap<String, Channel<()>>>>,
}

impl Locker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `true` if the caller became the owner of [key].
    ///
    /// Otherwise parks until the current owner unlocks and returns `false`.
    pub fn lock(&self, key: &str) -> bool {
        let channel = {
            let mut channels = self.channels.borrow_mut();
            match channels.get(key) {
                Some(channel) => channel.clone(),
                None => {
                    channels.insert(key.to_owned(), Channel::new(1));
                    return true;
                }
            }
        };

        // nothing is ever pushed, only closing wakes us
        let _ = channel.pop(None);
        false
    }

    /// Releases every waiter of [key] and starts a fresh ownership cycle.
    pub fn unlock(&self, key: &str) {
        if let Some(channel) = self.channels.borrow_mut().remove(key) {
            channel.close();
        }
    }

    /// Whether [key] currently has an owner.
    pub fn is_locked(&self, key: &str) -> bool {
        self.channels.borrow().contains_key(key)
    }
}
