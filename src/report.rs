//! Process-wide sink for failures nobody is waiting on.
//!
//! Panics escaping a spawned coroutine or a deferred callback can't reach the spawner, so they are
//! handed to the installed [Reporter]. Without one they are logged at error level and dropped.

use std::any::Any;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};

use parking_lot::RwLock;

use crate::coroutine::{self, CoroutineId};

static REPORTER: RwLock<Option<Box<dyn Reporter>>> = parking_lot::const_rwlock(None);

/// Receives failures swallowed by the toolkit.
pub trait Reporter: Send + Sync {
    /// [coroutine] is the coroutine the failure happened in.
    fn report(&self, coroutine: Option<CoroutineId>, failure: &Panic);
}

impl<F> Reporter for F
where
    F: Fn(Option<CoroutineId>, &Panic) + Send + Sync,
{
    fn report(&self, coroutine: Option<CoroutineId>, failure: &Panic) {
        self(coroutine, failure)
    }
}

/// Installs [reporter] for the whole process, returning the previous one.
pub fn set_reporter(reporter: impl Reporter + 'static) -> Option<Box<dyn Reporter>> {
    REPORTER.write().replace(Box::new(reporter))
}

/// Uninstalls the current reporter, falling back to logging.
pub fn clear_reporter() -> Option<Box<dyn Reporter>> {
    REPORTER.write().take()
}

/// Hands [failure] to the installed reporter, logging it if there's none or the reporter panics.
pub(crate) fn report(failure: &Panic) {
    let coroutine = coroutine::id();

    if let Some(reporter) = REPORTER.read().as_deref() {
        // must not unwind into the scheduler
        match panic::catch_unwind(AssertUnwindSafe(|| reporter.report(coroutine, failure))) {
            Ok(()) => return,
            Err(payload) => log::error!("reporter {}", Panic::new(payload)),
        }
    }

    match coroutine {
        Some(id) => log::error!("coroutine {id} failed: {failure}"),
        None => log::error!("failed outside of a coroutine: {failure}"),
    }
}

/// Payload of a caught panic.
pub struct Panic(Box<dyn Any + Send + 'static>);

impl Panic {
    pub fn new(payload: Box<dyn Any + Send + 'static>) -> Self {
        Panic(payload)
    }

    /// The message passed to `panic!`, if it was a string.
    pub fn message(&self) -> Option<&str> {
        if let Some(message) = self.0.downcast_ref::<&'static str>() {
            return Some(message);
        }

        self.0.downcast_ref::<String>().map(String::as_str)
    }

    pub fn into_payload(self) -> Box<dyn Any + Send + 'static> {
        self.0
    }

    /// Continues unwinding with the original payload.
    pub fn resume(self) -> ! {
        std::panic::resume_unwind(self.0)
    }
}

impl fmt::Debug for Panic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Panic").field(&self.message()).finish()
    }
}

impl fmt::Display for Panic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.message() {
            Some(message) => write!(f, "panicked at '{message}'"),
            None => write!(f, "panicked with a non-string payload"),
        }
    }
}

/// Shared reporter for tests, keeping failures apart per test thread.
#[cfg(test)]
pub(crate) mod recorder {
    use std::sync::Once;
    use std::thread::{self, ThreadId};

    use parking_lot::Mutex;

    use super::*;

    static FAILURES: Mutex<Vec<(ThreadId, Option<CoroutineId>, String)>> = parking_lot::const_mutex(Vec::new());

    pub(crate) fn install() {
        static INSTALL: Once = Once::new();

        INSTALL.call_once(|| {
            set_reporter(|coroutine: Option<CoroutineId>, failure: &Panic| {
                let message = failure.message().unwrap_or_default().to_owned();
                FAILURES.lock().push((thread::current().id(), coroutine, message));
            });
        });
    }

    /// Failures reported on the current thread so far.
    pub(crate) fn reported() -> Vec<(Option<CoroutineId>, String)> {
        let current = thread::current().id();

        FAILURES
            .lock()
            .iter()
            .filter(|(thread, _, _)| *thread == current)
            .map(|(_, coroutine, message)| (*coroutine, message.clone()))
            .collect()
    }
}
