//! Coroutine synchronization primitives.
//!
//! Everything here parks the running coroutine instead of blocking the thread, and every blocking
//! operation takes an explicit timeout: `None` waits indefinitely, `Some(Duration::ZERO)` never
//! parks. There is no cancellation besides letting a timeout elapse.
//!
//! Which primitive to reach for:
//! - hand values between coroutines: [Channel]
//! - wait until N coroutines are done: [WaitGroup]
//! - exclusive critical section per key: [Mutex]
//! - one owner per key, everyone else released together: [Locker]

pub mod channel;
pub mod locker;
pub mod mutex;
pub mod wait_group;

pub use channel::Channel;
pub use locker::Locker;
pub use mutex::Mutex;
pub use wait_group::WaitGroup;
