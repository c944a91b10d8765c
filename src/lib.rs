//! Cooperative coroutine concurrency toolkit.
//!
//! Coroutines run on a single-threaded fiber [runtime] and only switch at suspension points:
//! blocking channel operations, [time::sleep], [runtime::yield_now] and [runtime::park].
//! On top of that sit the coordination primitives:
//!
//! - [sync::Channel]: bounded FIFO queue every other primitive is built on
//! - [sync::WaitGroup]: wait for a known number of coroutines to signal completion
//! - [sync::Mutex] and [sync::Locker]: keyed mutual exclusion with different policies
//! - [Concurrent] and [WaitConcurrent]: spawn with bounded concurrency
//! - [Parallel]: fan out keyed tasks and collect their results and failures
//! - [Waiter]: block on a coroutine's result, from inside or outside a runtime
//!
//! # Examples
//!
//! ```
//! use fiberkit::{runtime, Parallel};
//!
//! runtime::start(|| {
//!     let mut parallel = Parallel::<_, std::io::Error>::new(2);
//!     parallel.add(|| Ok(1));
//!     parallel.add(|| Ok(2));
//!
//!     let results = parallel.wait().unwrap();
//!     assert_eq!(results.values().sum::<i32>(), 3);
//! })
//! .unwrap();
//! ```

#![cfg_attr(feature = "fast_thread_local", feature(thread_local))]

pub mod concurrent;
pub mod coroutine;
pub mod parallel;
pub mod report;
pub mod runtime;
pub mod sync;
pub mod time;
pub mod waiter;

pub use concurrent::{Bounded, Concurrent, WaitConcurrent};
pub use coroutine::{defer, spawn, Coroutine, CoroutineId};
pub use parallel::{parallel, Key, Parallel};
pub use waiter::{wait, Waiter};

#[cfg(feature = "macros")]
pub use fiberkit_macros::start;
