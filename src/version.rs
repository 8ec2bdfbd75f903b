use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crossbeam_epoch::{self as epoch, Atomic, Guard, Owned, Shared};

use crate::txid::TxnId;

/// An opaque byte-sequence key. Equality is byte-wise. The engine permits
/// empty keys.
pub type Key = Box<[u8]>;

/// A record payload. The `Arc` keeps snapshot hand-out O(1) and lets readers
/// share the buffer without copying it.
pub type Value = Arc<Vec<u8>>;

/// A transaction-ID stamp that transitions away from [`TxnId::NONE`] at most
/// once.
struct TxnStamp(AtomicU64);

impl TxnStamp {
    fn none() -> Self {
        Self(AtomicU64::new(TxnId::NONE.as_u64()))
    }

    fn at(id: TxnId) -> Self {
        Self(AtomicU64::new(id.as_u64()))
    }

    fn load(&self) -> TxnId {
        TxnId::from_u64(self.0.load(Ordering::SeqCst))
    }

    fn transition(&self, from: TxnId, to: TxnId) -> bool {
        self.0
            .compare_exchange(
                from.as_u64(),
                to.as_u64(),
                Ordering::SeqCst,
                Ordering::SeqCst,
            )
            .is_ok()
    }

    fn store(&self, id: TxnId) {
        self.0.store(id.as_u64(), Ordering::SeqCst);
    }
}

/// One history entry in a key's version chain.
///
/// `next` points at the older neighbor and never changes after construction.
/// The payload is written only while the version is pending and only by the
/// transaction that created it; once `valid_as_of` is stamped it is
/// immutable. `valid_as_of = NONE` marks a pending version; a set
/// `valid_before` equal to its author's ID marks a deletion.
pub(crate) struct Version {
    value: UnsafeCell<Value>,
    next: Atomic<Version>,
    valid_as_of: TxnStamp,
    valid_before: TxnStamp,
}

// The UnsafeCell is governed by the pending-version write protocol above;
// the remaining fields are atomics.
unsafe impl Send for Version {}
unsafe impl Sync for Version {}

impl Version {
    /// A fresh pending version carrying `value`, to be prepended over
    /// `next`.
    pub(crate) fn pending(value: Value, next: Shared<'_, Version>) -> Owned<Version> {
        Owned::new(Version {
            value: UnsafeCell::new(value),
            next: Atomic::from(next),
            valid_as_of: TxnStamp::none(),
            valid_before: TxnStamp::none(),
        })
    }

    /// A pending deletion marker authored by `deleted_by`.
    ///
    /// It carries the superseded value in place: deletion is encoded by the
    /// bounded horizon, not by an empty payload.
    pub(crate) fn tombstone(
        value: Value,
        next: Shared<'_, Version>,
        deleted_by: TxnId,
    ) -> Owned<Version> {
        Owned::new(Version {
            value: UnsafeCell::new(value),
            next: Atomic::from(next),
            valid_as_of: TxnStamp::none(),
            valid_before: TxnStamp::at(deleted_by),
        })
    }

    /// First committed transaction for which this version is authoritative,
    /// or [`TxnId::NONE`] while the version is pending.
    pub(crate) fn valid_as_of(&self) -> TxnId {
        self.valid_as_of.load()
    }

    /// First committed transaction that supersedes or deletes this version,
    /// or [`TxnId::NONE`] while it is current.
    pub(crate) fn valid_before(&self) -> TxnId {
        self.valid_before.load()
    }

    /// Commit stamp: `NONE -> id`, once.
    pub(crate) fn stamp_valid_as_of(&self, id: TxnId) -> bool {
        self.valid_as_of.transition(TxnId::NONE, id)
    }

    /// Bounds the validity window: `NONE -> id`, once.
    pub(crate) fn bound_valid_before(&self, id: TxnId) -> bool {
        self.valid_before.transition(TxnId::NONE, id)
    }

    /// Reopens the horizon of a pending tombstone, for delete-then-insert
    /// resurrection within one transaction.
    pub(crate) fn clear_valid_before(&self) {
        self.valid_before.store(TxnId::NONE);
    }

    pub(crate) fn next<'g>(&self, guard: &'g Guard) -> Shared<'g, Version> {
        self.next.load(Ordering::SeqCst, guard)
    }

    /// Hands out the payload.
    ///
    /// # Safety
    ///
    /// The caller must rule out a concurrent [`Version::set_value`]: either
    /// the version is committed (payload immutable from then on), or the
    /// caller is the owning transaction of this pending version.
    pub(crate) unsafe fn value(&self) -> Value {
        unsafe { (*self.value.get()).clone() }
    }

    /// Replaces the payload in place.
    ///
    /// # Safety
    ///
    /// Only the owning transaction of a pending version may call this;
    /// nobody else reads the payload until the commit stamp publishes it.
    pub(crate) unsafe fn set_value(&self, value: Value) {
        unsafe { *self.value.get() = value };
    }
}

/// The head of one key's version chain, newest first.
///
/// Only the head is ever replaced, via CAS; older entries stay immutable
/// apart from the one-shot `valid_before` transition.
pub(crate) struct VersionedRecord {
    newest: Atomic<Version>,
}

impl VersionedRecord {
    /// A record whose chain is a single pending version carrying `value`.
    pub(crate) fn with_pending(value: Value) -> Self {
        Self {
            newest: Atomic::from(Version::pending(value, Shared::null())),
        }
    }

    pub(crate) fn newest<'g>(&self, guard: &'g Guard) -> Shared<'g, Version> {
        self.newest.load(Ordering::SeqCst, guard)
    }

    /// Publishes `proposed` as the new head if the head is still `expected`.
    ///
    /// On failure the speculative node is freed immediately; it was never
    /// shared.
    pub(crate) fn try_prepend(
        &self,
        expected: Shared<'_, Version>,
        proposed: Owned<Version>,
        guard: &Guard,
    ) -> bool {
        self.newest
            .compare_exchange(
                expected,
                proposed,
                Ordering::SeqCst,
                Ordering::SeqCst,
                guard,
            )
            .is_ok()
    }

    /// Replaces the head `expected` with an older version (or null) and
    /// retires the unlinked head through the collector.
    pub(crate) fn try_unlink(
        &self,
        expected: Shared<'_, Version>,
        replacement: Shared<'_, Version>,
        guard: &Guard,
    ) -> bool {
        match self.newest.compare_exchange(
            expected,
            replacement,
            Ordering::SeqCst,
            Ordering::SeqCst,
            guard,
        ) {
            Ok(_) => {
                // Walkers that loaded the old head under a pin may still
                // hold it; destruction waits for them.
                unsafe { guard.defer_destroy(expected) };
                true
            }
            Err(_) => false,
        }
    }
}

impl Drop for VersionedRecord {
    fn drop(&mut self) {
        // Sole owner once the shard entry drops; nothing else can reach the
        // chain, so an unprotected walk is fine.
        unsafe {
            let guard = epoch::unprotected();
            let mut node = self.newest.load(Ordering::Relaxed, guard);
            while !node.is_null() {
                let next = node.deref().next.load(Ordering::Relaxed, guard);
                drop(node.into_owned());
                node = next;
            }
        }
    }
}
