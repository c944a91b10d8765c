use std::time::Duration;

use crate::runtime;

/// Puts the current fiber to sleep for at least [duration].
///
/// Sleeping for zero still lets every ready fiber run first.
pub fn sleep(duration: Duration) {
    runtime::park_timeout(Some(duration), |_| {}); // nothing else holds the waker
}
