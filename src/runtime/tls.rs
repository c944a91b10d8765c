//! Thread local storage for the runtime state.
//! Every access goes through [runtime] so switching to a fast thread local stays a local change.

use std::cell::RefCell;

/// Cache padded to avoid potential performance hit due to false sharing.
#[repr(align(128))]
struct Runtime(RefCell<Option<super::RuntimeState>>);

#[cfg(not(feature = "fast_thread_local"))]
thread_local! {
    /// Each thread gets its own independent runtime.
    static RUNTIME: Runtime = Runtime(RefCell::new(None));
}

#[cfg(not(feature = "fast_thread_local"))]
pub(super) fn exclusive_runtime<T>(config: super::Config, f: impl FnOnce() -> T) -> T {
    RUNTIME.with(|thread_local| {
        let mut cell = thread_local.0.borrow_mut();
        assert!(cell.is_none(), "runtime is already running on this thread");
        *cell = Some(super::RuntimeState::new(config));
    });

    let output = f();

    RUNTIME.with(|thread_local| {
        let mut cell = thread_local.0.borrow_mut();
        *cell = None;
    });

    output
}

/// Borrow the running runtime.
///
/// # Panics
/// If no runtime is running on this thread.
#[cfg(not(feature = "fast_thread_local"))]
pub(super) fn runtime<T>(f: impl FnOnce(&mut super::RuntimeState) -> T) -> T {
    RUNTIME.with(|thread_local| {
        let mut cell = thread_local.0.borrow_mut();
        let runtime = cell.as_mut().expect("no runtime is running on this thread");
        f(runtime)
    })
}

/// Borrow the runtime if one is running.
#[cfg(not(feature = "fast_thread_local"))]
pub(super) fn try_runtime<T>(f: impl FnOnce(&mut super::RuntimeState) -> T) -> Option<T> {
    RUNTIME.with(|thread_local| {
        let mut cell = thread_local.0.borrow_mut();
        cell.as_mut().map(f)
    })
}

#[cfg(feature = "fast_thread_local")]
#[thread_local]
static RUNTIME: Runtime = Runtime(RefCell::new(None));

#[cfg(feature = "fast_thread_local")]
pub(super) fn exclusive_runtime<T>(config: super::Config, f: impl FnOnce() -> T) -> T {
    {
        let mut cell = RUNTIME.0.borrow_mut();
        assert!(cell.is_none(), "runtime is already running on this thread");
        *cell = Some(super::RuntimeState::new(config));
    }

    let output = f();

    let mut cell = RUNTIME.0.borrow_mut();
    *cell = None;

    output
}

#[cfg(feature = "fast_thread_local")]
pub(super) fn runtime<T>(f: impl FnOnce(&mut super::RuntimeState) -> T) -> T {
    let mut cell = RUNTIME.0.borrow_mut();
    let runtime = cell.as_mut().expect("no runtime is running on this thread");
    f(runtime)
}

#[cfg(feature = "fast_thread_local")]
pub(super) fn try_runtime<T>(f: impl FnOnce(&mut super::RuntimeState) -> T) -> Option<T> {
    let mut cell = RUNTIME.0.borrow_mut();
    cell.as_mut().map(f)
}
