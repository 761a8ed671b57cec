pub mod async_queue;
pub mod backoff;

use std::sync::{Mutex, MutexGuard, PoisonError};

pub use async_queue::{AsyncQueue, DelayedOperation, QueueFuture, TimerId};
pub use backoff::ExponentialBackoff;

/// Locks a std mutex, recovering the guard if a previous holder panicked.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
