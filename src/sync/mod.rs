//! Synchronization primitives built on the cooperative scheduler.
//!
//! Everything here synchronizes by parking threads and releasing them in
//! FIFO order; there are no hardware atomics because only one thread ever
//! executes at a time. "Atomicity" of an operation means it contains no
//! voluntary switch point, enforced with the critical-section guard from
//! [`Current::pin`](crate::thread::Current::pin).

pub mod bounded_buffer;
pub mod semaphore;

pub use bounded_buffer::BoundedBuffer;
pub use semaphore::Semaphore;

use std::fmt;
use thiserror::Error;

/// The operation would have parked the calling thread.
///
/// Returned by the non-blocking `try_*` variants of the blocking
/// operations.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Error)]
#[error("operation would block the calling thread")]
pub struct WouldBlock;

/// The buffer had no free slot; the rejected element is handed back.
pub struct Full<T>(pub T);

impl<T> fmt::Debug for Full<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Full(..)")
    }
}

impl<T> fmt::Display for Full<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("bounded buffer is full")
    }
}

impl<T> std::error::Error for Full<T> {}
