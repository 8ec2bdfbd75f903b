//! Cancellation-aware synchronization primitives.
//!
//! The store's shards are guarded by a reader/writer lock whose blocking
//! acquisitions must give up promptly when the caller's work is cancelled.
//! This crate provides that lock, [`CancelRwLock`], together with the
//! level-triggered [`CancelToken`] it observes.
//!
//! # Example
//!
//! ```rust
//! use ambar_sync::{CancelRwLock, CancelToken};
//!
//! let lock = CancelRwLock::new(0_u32);
//! let cancel = CancelToken::new();
//!
//! {
//!     let mut slot = lock.write_until(&cancel).unwrap();
//!     *slot += 1;
//! }
//!
//! let slot = lock.read_until(&cancel).unwrap();
//! assert_eq!(*slot, 1);
//! ```

#![warn(missing_docs)]

mod cancel;
mod rwlock;

pub use cancel::CancelToken;
pub use rwlock::{CancelRwLock, CancelRwLockReadGuard, CancelRwLockWriteGuard, Cancelled};
