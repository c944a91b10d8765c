//! Coroutine identity, deferred cleanup and introspection.
//!
//! Coroutines are the runtime's fibers seen from application code. Every coroutine gets an id
//! that is never reused within a runtime; the root closure passed to
//! [runtime::start](crate::runtime::start) is the only coroutine without a parent.

use std::fmt;

use thiserror::Error;

use crate::runtime;

pub use crate::runtime::spawn;

/// Identifier of a coroutine, unique among the coroutines of one runtime.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct CoroutineId(u64);

impl CoroutineId {
    pub(crate) fn new(id: u64) -> Self {
        CoroutineId(id)
    }

    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for CoroutineId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Handle to a spawned coroutine.
///
/// Dropping it doesn't affect the coroutine.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct Coroutine {
    id: CoroutineId,
}

impl Coroutine {
    pub(crate) fn new(id: CoroutineId) -> Self {
        Coroutine { id }
    }

    pub fn id(&self) -> CoroutineId {
        self.id
    }

    /// Whether the coroutine is still running its closure or deferred callbacks.
    pub fn is_alive(&self) -> bool {
        exists(self.id)
    }
}

/// Snapshot of the runtime's bookkeeping.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
pub struct Stats {
    /// Live coroutines, including the root.
    pub coroutine_num: usize,
    /// Most coroutines that were ever live at once.
    pub coroutine_peak_num: usize,
    /// Coroutines created since the runtime started, including the root.
    pub spawned_total: u64,
    /// Coroutines waiting for their turn to run.
    pub ready_num: usize,
    /// Pending park deadlines.
    pub timer_num: usize,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Error)]
pub enum CoroutineError {
    /// The coroutine finished or never existed.
    #[error("coroutine {0} does not exist")]
    NotFound(CoroutineId),
}

/// Id of the running coroutine, `None` outside of a runtime.
pub fn id() -> Option<CoroutineId> {
    runtime::inspect(|runtime| runtime.current_id()).flatten()
}

pub fn in_coroutine() -> bool {
    id().is_some()
}

/// Parent of the running coroutine, `None` for the root or outside of a runtime.
pub fn parent_id() -> Option<CoroutineId> {
    id().and_then(|id| parent_of(id).ok().flatten())
}

/// Parent of a live coroutine, `Ok(None)` for the root.
pub fn parent_of(id: CoroutineId) -> Result<Option<CoroutineId>, CoroutineError> {
    runtime::inspect(|runtime| runtime.parent_of(id))
        .flatten()
        .ok_or(CoroutineError::NotFound(id))
}

pub fn exists(id: CoroutineId) -> bool {
    runtime::inspect(|runtime| runtime.exists(id)).unwrap_or(false)
}

/// Live coroutines in creation order.
pub fn list() -> Vec<CoroutineId> {
    runtime::inspect(|runtime| runtime.list()).unwrap_or_default()
}

pub fn stats() -> Stats {
    runtime::inspect(|runtime| runtime.stats()).unwrap_or_default()
}

/// Registers [f] to run when the running coroutine exits.
///
/// Deferred callbacks run last-in first-out once the coroutine's closure has returned or panicked.
/// Callbacks deferred while the stack drains run before the older ones that are still pending.
/// A panicking callback is reported and the remaining callbacks still run.
///
/// # Panics
/// If called outside of a coroutine.
pub fn defer(f: impl FnOnce() + 'static) {
    runtime::defer(Box::new(f));
}
