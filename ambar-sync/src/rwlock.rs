use std::cell::UnsafeCell;
use std::ops::{Deref, DerefMut};
use std::time::Duration;

use parking_lot::{Condvar, Mutex};

use crate::cancel::CancelToken;

/// Error returned when a lock acquisition observed a fired [`CancelToken`]
/// before it could complete.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("lock acquisition cancelled")]
pub struct Cancelled;

/// Upper bound on how long a waiter sleeps before re-checking its token.
const CANCEL_RECHECK: Duration = Duration::from_millis(1);

#[derive(Default)]
struct LockState {
    readers: usize,
    writer: bool,
}

/// A reader/writer lock whose blocking acquisitions observe a
/// [`CancelToken`].
///
/// Admits either one exclusive holder or any number of shared holders.
/// There is no fairness: shared acquirers arriving while a writer waits are
/// admitted ahead of it, so writers can starve under sustained read traffic.
pub struct CancelRwLock<T> {
    state: Mutex<LockState>,
    changed: Condvar,
    data: UnsafeCell<T>,
}

// Shared readers alias `data` immutably and the single writer exclusively;
// admission through `state` upholds that split.
unsafe impl<T: Send> Send for CancelRwLock<T> {}
unsafe impl<T: Send + Sync> Sync for CancelRwLock<T> {}

impl<T> CancelRwLock<T> {
    /// Creates an unlocked lock owning `data`.
    pub fn new(data: T) -> Self {
        Self {
            state: Mutex::new(LockState::default()),
            changed: Condvar::new(),
            data: UnsafeCell::new(data),
        }
    }

    /// Acquires the lock shared, waiting until admitted or until `cancel`
    /// fires.
    ///
    /// A token that has already fired fails the acquisition even when the
    /// lock is free.
    pub fn read_until(
        &self,
        cancel: &CancelToken,
    ) -> Result<CancelRwLockReadGuard<'_, T>, Cancelled> {
        if cancel.is_cancelled() {
            return Err(Cancelled);
        }
        let mut state = self.state.lock();
        while state.writer {
            self.changed.wait_for(&mut state, CANCEL_RECHECK);
            if cancel.is_cancelled() {
                return Err(Cancelled);
            }
        }
        state.readers += 1;
        Ok(CancelRwLockReadGuard { lock: self })
    }

    /// Acquires the lock exclusively, waiting until admitted or until
    /// `cancel` fires.
    pub fn write_until(
        &self,
        cancel: &CancelToken,
    ) -> Result<CancelRwLockWriteGuard<'_, T>, Cancelled> {
        if cancel.is_cancelled() {
            return Err(Cancelled);
        }
        let mut state = self.state.lock();
        while state.writer || state.readers > 0 {
            self.changed.wait_for(&mut state, CANCEL_RECHECK);
            if cancel.is_cancelled() {
                return Err(Cancelled);
            }
        }
        state.writer = true;
        Ok(CancelRwLockWriteGuard { lock: self })
    }
}

/// Shared access to the data of a [`CancelRwLock`]. Releases on drop.
pub struct CancelRwLockReadGuard<'a, T> {
    lock: &'a CancelRwLock<T>,
}

impl<T> Deref for CancelRwLockReadGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        // Admission guarantees no writer while any reader is out.
        unsafe { &*self.lock.data.get() }
    }
}

impl<T> Drop for CancelRwLockReadGuard<'_, T> {
    fn drop(&mut self) {
        let mut state = self.lock.state.lock();
        state.readers -= 1;
        if state.readers == 0 {
            self.lock.changed.notify_all();
        }
    }
}

/// Exclusive access to the data of a [`CancelRwLock`]. Releases on drop.
pub struct CancelRwLockWriteGuard<'a, T> {
    lock: &'a CancelRwLock<T>,
}

impl<T> Deref for CancelRwLockWriteGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        // Admission guarantees this writer is alone.
        unsafe { &*self.lock.data.get() }
    }
}

impl<T> DerefMut for CancelRwLockWriteGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        unsafe { &mut *self.lock.data.get() }
    }
}

impl<T> Drop for CancelRwLockWriteGuard<'_, T> {
    fn drop(&mut self) {
        let mut state = self.lock.state.lock();
        state.writer = false;
        self.lock.changed.notify_all();
    }
}
