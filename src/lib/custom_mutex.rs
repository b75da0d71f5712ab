//! # Custom Mutex
//!
//! A thin wrapper around [`std::sync::Mutex`] that only exposes closure-based locking, so a
//! guard can never outlive the critical section or be held across an `.await`.

use std::sync::{Mutex as Mutex_, MutexGuard, PoisonError};

/// Closure-locked mutex used for every per-job record and for subscriber lists.
///
/// The lock is released as soon as the closure returns. Poisoning is surfaced to the
/// caller as a [`PoisonError`], which converts into
/// [`OrchestratorError::PoisonLock`](crate::error::OrchestratorError::PoisonLock).
#[derive(Debug)]
pub struct Mutex<T: ?Sized>(Mutex_<T>);

impl<T> Mutex<T> {
    /// Creates a new [`Mutex`] instance, storing the initial value inside.
    pub fn new(v: T) -> Self {
        Mutex(Mutex_::new(v))
    }

    /// Locks the `Mutex` and runs `thunk` with a mutable reference to the inner value.
    ///
    /// Unwraps should never be used within the closure; return the result and handle it
    /// outside the lock instead.
    pub fn safe_lock<F, Ret>(&self, thunk: F) -> Result<Ret, PoisonError<MutexGuard<'_, T>>>
    where
        F: FnOnce(&mut T) -> Ret,
    {
        let mut lock = self.0.lock()?;
        let return_value = thunk(&mut *lock);
        drop(lock);
        Ok(return_value)
    }
}
