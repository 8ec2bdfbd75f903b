use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

/// Identifier of a transaction.
///
/// IDs come from a single strictly increasing counter. Zero is reserved as
/// [`TxnId::NONE`], meaning "no transaction assigned here"; the first valid
/// ID is 1.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug, Default)]
pub struct TxnId(u64);

impl TxnId {
    /// The reserved sentinel meaning "no transaction assigned here".
    pub const NONE: TxnId = TxnId(0);

    pub(crate) const fn from_u64(raw: u64) -> Self {
        TxnId(raw)
    }

    pub(crate) const fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for TxnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Hands out transaction IDs and tracks the latest finished one.
#[derive(Debug)]
pub(crate) struct TxnIdAllocator {
    latest: AtomicU64,
    latest_finished: AtomicU64,
}

impl TxnIdAllocator {
    pub(crate) fn new() -> Self {
        Self {
            latest: AtomicU64::new(0),
            latest_finished: AtomicU64::new(0),
        }
    }

    /// Claims the next transaction ID.
    ///
    /// Panics when the counter wraps around to the reserved sentinel: IDs
    /// issued after a wrap could not be ordered against stamps already
    /// present in version chains.
    pub(crate) fn claim_next(&self) -> TxnId {
        let next = self.latest.fetch_add(1, Ordering::SeqCst).wrapping_add(1);
        if next == TxnId::NONE.as_u64() {
            panic!("transaction ID sequence overflowed");
        }
        TxnId(next)
    }

    /// Advances the latest-finished watermark to `id` when it is ahead of
    /// the current value; finishes arriving out of order are ignored.
    /// Returns whether the watermark moved.
    ///
    /// The watermark is advisory. No read or write path consults it; it is
    /// kept as an upper bound for a future vacuum pass.
    pub(crate) fn record_finished(&self, id: TxnId) -> bool {
        if id == TxnId::NONE {
            return false;
        }
        loop {
            let finished = self.latest_finished.load(Ordering::SeqCst);
            if finished >= id.as_u64() {
                return false;
            }
            if self
                .latest_finished
                .compare_exchange(finished, id.as_u64(), Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
            {
                return true;
            }
        }
    }

    pub(crate) fn latest_finished(&self) -> TxnId {
        TxnId(self.latest_finished.load(Ordering::SeqCst))
    }
}
