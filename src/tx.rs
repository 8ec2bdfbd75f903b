use std::collections::HashSet;
use std::sync::Arc;

use ambar_sync::CancelToken;
use crossbeam_epoch::{self as epoch, Guard, Shared};
use crossbeam_utils::Backoff;
use foldhash::fast::RandomState;
use tracing::{error, trace};

use crate::error::{Error, ErrorKind};
use crate::store::ShardedStore;
use crate::txid::TxnId;
use crate::version::{Key, Value, Version, VersionedRecord};

/// Pending-write sets start tiny; most transactions touch a handful of keys.
const PENDING_WRITES_CAPACITY: usize = 3;

type KeySet = HashSet<Key, RandomState>;

/// Observes and mutates the store tentatively, isolated from other
/// transactions, until the surrounding [`ShardedStore::with_transaction`]
/// call commits or rolls the effects back.
///
/// A transaction with ID `t` sees a version iff its `valid_as_of` stamp is
/// at most `t` and its `valid_before` horizon is unset or beyond `t`;
/// pending versions are visible only to the transaction that proposed them.
///
/// Handles must not be shared across threads without external
/// synchronization; the pending-write set is owned by the one transaction.
pub trait Transaction {
    /// Retrieves the record for `key` visible under this transaction's
    /// snapshot.
    ///
    /// Fails with kind `RecordDoesNotExist` when no such record is visible.
    fn get(&self, cancel: &CancelToken, key: &[u8]) -> Result<Value, Error>;

    /// Adds a record for `key` storing `value`.
    ///
    /// Fails with kind `RecordExists` when a record visible under the
    /// snapshot, or still live in this same transaction, is already present.
    fn insert(&mut self, cancel: &CancelToken, key: &[u8], value: &[u8]) -> Result<(), Error>;

    /// Replaces the value of an existing record for `key`.
    ///
    /// Fails with kind `RecordDoesNotExist` when no record is visible under
    /// the snapshot.
    fn update(&mut self, cancel: &CancelToken, key: &[u8], value: &[u8]) -> Result<(), Error>;

    /// Ensures a record exists for `key` storing `value`: behaves like
    /// [`Transaction::update`] when a record exists and like
    /// [`Transaction::insert`] otherwise.
    fn upsert(&mut self, cancel: &CancelToken, key: &[u8], value: &[u8]) -> Result<(), Error>;

    /// Ensures no record exists for `key`, removing an existing one if need
    /// be. Returns whether a record was removed.
    fn delete(&mut self, cancel: &CancelToken, key: &[u8]) -> Result<bool, Error>;
}

/// The store's one concrete transaction.
pub(crate) struct StoreTxn<'s> {
    store: &'s ShardedStore,
    id: TxnId,
    // Initialized lazily on the first mutation.
    pending_writes: Option<KeySet>,
}

impl<'s> StoreTxn<'s> {
    pub(crate) fn new(store: &'s ShardedStore, id: TxnId) -> Self {
        Self {
            store,
            id,
            pending_writes: None,
        }
    }

    fn note_pending_write(&mut self, key: &[u8]) {
        let writes = self.pending_writes.get_or_insert_with(|| {
            HashSet::with_capacity_and_hasher(PENDING_WRITES_CAPACITY, RandomState::default())
        });
        if !writes.contains(key) {
            writes.insert(key.into());
        }
    }

    fn has_pending_write(&self, key: &[u8]) -> bool {
        self.pending_writes
            .as_ref()
            .is_some_and(|writes| writes.contains(key))
    }

    fn corrupted(&self, key: &[u8], horizon: TxnId) -> Error {
        error!(
            txn = %self.id,
            key = %key.escape_ascii(),
            horizon = %horizon,
            "pending version carries an impossible validity horizon"
        );
        Error::corrupted_pending_version(key, self.id, horizon)
    }

    /// Insert against a chain that already has a record entry, walking
    /// newest to oldest.
    ///
    /// `saw_newer_version` tracks whether a version committed by a later
    /// transaction was skipped: even where an older tombstone says the
    /// record is gone, inserting over it would leap-frog that later writer.
    fn insert_into(
        &mut self,
        record: &VersionedRecord,
        key: &[u8],
        value: &[u8],
    ) -> Result<(), Error> {
        let guard = epoch::pin();
        let mut saw_newer_version = false;
        let mut node = record.newest(&guard);
        while let Some(version) = unsafe { node.as_ref() } {
            let as_of = version.valid_as_of();
            if as_of == TxnId::NONE {
                if !self.has_pending_write(key) {
                    // Another transaction is proposing a write here.
                    return Err(Error::transaction_in_conflict(key));
                }
                let before = version.valid_before();
                if before == TxnId::NONE {
                    // We already inserted this record in this transaction.
                    return Err(Error::record_exists(key));
                }
                if before == self.id {
                    // We deleted this record earlier in this transaction;
                    // revive our pending version in place.
                    // SAFETY: we own this pending version.
                    unsafe { version.set_value(Arc::new(value.to_vec())) };
                    version.clear_valid_before();
                    return Ok(());
                }
                return Err(self.corrupted(key, before));
            } else if as_of > self.id {
                saw_newer_version = true;
            } else {
                let before = version.valid_before();
                if before == TxnId::NONE {
                    // This version is still current.
                    return Err(Error::record_exists(key));
                }
                if before <= self.id {
                    // Tombstoned at or before our snapshot.
                    if saw_newer_version {
                        return Err(Error::transaction_in_conflict(key));
                    }
                    return self.try_propose(record, key, value, node, &guard);
                }
                // Deleted only from a later transaction onward, so from our
                // perspective the record still exists.
                return Err(Error::record_exists(key));
            }
            node = version.next(&guard);
        }
        if saw_newer_version {
            return Err(Error::transaction_in_conflict(key));
        }
        // No versions left at all; propose against the chain head we
        // started from.
        self.try_propose(record, key, value, Shared::null(), &guard)
    }

    /// CAS a fresh pending version carrying `value` over `expected`.
    fn try_propose(
        &mut self,
        record: &VersionedRecord,
        key: &[u8],
        value: &[u8],
        expected: Shared<'_, Version>,
        guard: &Guard,
    ) -> Result<(), Error> {
        let proposed = Version::pending(Arc::new(value.to_vec()), expected);
        if record.try_prepend(expected, proposed, guard) {
            self.note_pending_write(key);
            Ok(())
        } else {
            // Someone else stored a new version before us.
            Err(Error::transaction_in_conflict(key))
        }
    }

    /// Stamps or collapses every pending version this transaction proposed,
    /// making the writes visible to transactions with IDs at or beyond ours.
    pub(crate) fn finalize_commit(&mut self) {
        let Some(keys) = self.pending_writes.take() else {
            return;
        };
        trace!(txn = %self.id, keys = keys.len(), "committing");
        // Finalization must not observe the caller's token: stopping half
        // way would leave some keys stamped and others pending.
        let cancel = CancelToken::never();
        for key in &keys {
            let record = match self.store.record_for(&cancel, key) {
                Ok(Some(record)) => record,
                _ => continue,
            };
            let guard = epoch::pin();
            let backoff = Backoff::new();
            loop {
                let head = record.newest(&guard);
                let Some(version) = (unsafe { head.as_ref() }) else {
                    break;
                };
                if version.valid_as_of() != TxnId::NONE {
                    break;
                }
                let prev = version.next(&guard);
                // A pending head with a bounded horizon is our deletion of
                // a committed predecessor: bound that predecessor's window
                // and collapse the marker into it.
                if let Some(predecessor) = unsafe { prev.as_ref() } {
                    if predecessor.bound_valid_before(self.id)
                        && version.valid_before() != TxnId::NONE
                        && record.try_unlink(head, prev, &guard)
                    {
                        break;
                    }
                }
                // Otherwise stamp the proposal itself. For an update over a
                // live predecessor the bound above already closed the old
                // window at our ID.
                if version.stamp_valid_as_of(self.id) {
                    break;
                }
                backoff.spin();
            }
        }
    }

    /// Unlinks every pending version this transaction proposed.
    pub(crate) fn finalize_abort(&mut self) {
        let Some(keys) = self.pending_writes.take() else {
            return;
        };
        trace!(txn = %self.id, keys = keys.len(), "rolling back");
        let cancel = CancelToken::never();
        for key in &keys {
            let record = match self.store.record_for(&cancel, key) {
                Ok(Some(record)) => record,
                _ => continue,
            };
            let guard = epoch::pin();
            let backoff = Backoff::new();
            loop {
                let head = record.newest(&guard);
                let Some(version) = (unsafe { head.as_ref() }) else {
                    break;
                };
                if version.valid_as_of() != TxnId::NONE {
                    break;
                }
                // No other writer should contend for our pending head, but
                // the head may still move under concurrent traffic; re-read
                // and try again rather than assume.
                if record.try_unlink(head, version.next(&guard), &guard) {
                    break;
                }
                backoff.spin();
            }
        }
    }
}

impl Transaction for StoreTxn<'_> {
    fn get(&self, cancel: &CancelToken, key: &[u8]) -> Result<Value, Error> {
        let Some(record) = self.store.record_for(cancel, key)? else {
            return Err(Error::record_does_not_exist(key));
        };
        // The record exists, even if only as a tombstone. Walk newest to
        // oldest under the snapshot rule.
        let guard = epoch::pin();
        let mut node = record.newest(&guard);
        while let Some(version) = unsafe { node.as_ref() } {
            let as_of = version.valid_as_of();
            if as_of == TxnId::NONE {
                if self.has_pending_write(key) {
                    let before = version.valid_before();
                    if before == TxnId::NONE {
                        // Our own proposed value.
                        // SAFETY: we own this pending version.
                        return Ok(unsafe { version.value() });
                    }
                    if before <= self.id {
                        // Our own deletion marker.
                        break;
                    }
                }
                // Another transaction's proposal; not visible to us.
            } else if as_of <= self.id {
                let before = version.valid_before();
                if before == TxnId::NONE || before > self.id {
                    // SAFETY: committed versions are immutable.
                    return Ok(unsafe { version.value() });
                }
                break;
            }
            node = version.next(&guard);
        }
        Err(Error::record_does_not_exist(key))
    }

    fn insert(&mut self, cancel: &CancelToken, key: &[u8], value: &[u8]) -> Result<(), Error> {
        let store = self.store;
        let shard = store.shard_for(key);
        let existing = {
            let records = shard
                .records
                .read_until(cancel)
                .map_err(|_| Error::cancelled(key))?;
            records.get(key).cloned()
        };
        if let Some(record) = existing {
            // Fast path: the record exists, even if only as a tombstone.
            return self.insert_into(&record, key, value);
        }
        // Slow path: publish a new record under the exclusive shard lock.
        let mut records = shard
            .records
            .write_until(cancel)
            .map_err(|_| Error::cancelled(key))?;
        if let Some(record) = records.get(key).cloned() {
            // Someone else got in and added this record already.
            drop(records);
            return self.insert_into(&record, key, value);
        }
        records.insert(
            key.into(),
            Arc::new(VersionedRecord::with_pending(Arc::new(value.to_vec()))),
        );
        drop(records);
        self.note_pending_write(key);
        Ok(())
    }

    fn update(&mut self, cancel: &CancelToken, key: &[u8], value: &[u8]) -> Result<(), Error> {
        let Some(record) = self.store.record_for(cancel, key)? else {
            return Err(Error::record_does_not_exist(key));
        };
        let guard = epoch::pin();
        let head = record.newest(&guard);
        let Some(version) = (unsafe { head.as_ref() }) else {
            return Err(Error::record_does_not_exist(key));
        };
        let as_of = version.valid_as_of();
        if as_of == TxnId::NONE {
            if !self.has_pending_write(key) {
                // Another transaction is proposing a write here.
                return Err(Error::transaction_in_conflict(key));
            }
            let before = version.valid_before();
            if before == TxnId::NONE {
                // Overwrite our previously proposed value in place.
                // SAFETY: we own this pending version.
                unsafe { version.set_value(Arc::new(value.to_vec())) };
                return Ok(());
            }
            if before <= self.id {
                // We already deleted this record in this transaction.
                return Err(Error::record_does_not_exist(key));
            }
            return Err(self.corrupted(key, before));
        }
        if as_of <= self.id {
            let before = version.valid_before();
            if before == TxnId::NONE {
                let proposed = Version::pending(Arc::new(value.to_vec()), head);
                if record.try_prepend(head, proposed, &guard) {
                    self.note_pending_write(key);
                    return Ok(());
                }
                // Someone else added a newer version.
                return Err(Error::transaction_in_conflict(key));
            }
            if before <= self.id {
                // Tombstoned at or before our snapshot.
                return Err(Error::record_does_not_exist(key));
            }
            // A later transaction superseded this version. Intervening
            // snapshots may have relied on its horizon; it cannot be pulled
            // back under them.
            return Err(Error::transaction_in_conflict(key));
        }
        // A later transaction changed this record. No walk-back: writing
        // over an older covering version would leap-frog the later
        // committed writer.
        Err(Error::transaction_in_conflict(key))
    }

    fn upsert(&mut self, cancel: &CancelToken, key: &[u8], value: &[u8]) -> Result<(), Error> {
        loop {
            let update_err = match self.update(cancel, key, value) {
                Ok(()) => return Ok(()),
                Err(err) => err,
            };
            if update_err.kind() != ErrorKind::RecordDoesNotExist {
                return Err(update_err);
            }
            match self.insert(cancel, key, value) {
                Ok(()) => return Ok(()),
                Err(err) if err.kind() == ErrorKind::RecordExists => {
                    // The record reappeared between the two attempts; take
                    // another turn.
                }
                Err(err) => return Err(err),
            }
        }
    }

    fn delete(&mut self, cancel: &CancelToken, key: &[u8]) -> Result<bool, Error> {
        let Some(record) = self.store.record_for(cancel, key)? else {
            return Ok(false);
        };
        let guard = epoch::pin();
        let head = record.newest(&guard);
        let Some(version) = (unsafe { head.as_ref() }) else {
            return Ok(false);
        };
        let as_of = version.valid_as_of();
        if as_of == TxnId::NONE {
            if !self.has_pending_write(key) {
                // Another transaction is proposing a write here.
                return Err(Error::transaction_in_conflict(key));
            }
            let backoff = Backoff::new();
            loop {
                let before = version.valid_before();
                if before == TxnId::NONE {
                    if version.bound_valid_before(self.id) {
                        return Ok(true);
                    }
                    // The horizon moved underneath us; look again.
                    backoff.spin();
                    continue;
                }
                if before <= self.id {
                    // Already a tombstone.
                    return Ok(false);
                }
                return Err(self.corrupted(key, before));
            }
        }
        if as_of <= self.id {
            let before = version.valid_before();
            if before == TxnId::NONE {
                // The live committed head cannot be bounded in place: a
                // rollback would have to undo it, and other snapshots must
                // not observe the deletion yet. Propose a marker carrying
                // the same value that resolves at commit.
                // SAFETY: committed versions are immutable.
                let marker = Version::tombstone(unsafe { version.value() }, head, self.id);
                if record.try_prepend(head, marker, &guard) {
                    self.note_pending_write(key);
                    return Ok(true);
                }
                // Someone else added a newer version.
                return Err(Error::transaction_in_conflict(key));
            }
            if before <= self.id {
                // Already a tombstone.
                return Ok(false);
            }
            // A later transaction superseded this version; its horizon
            // cannot be pulled back under intervening snapshots.
            return Err(Error::transaction_in_conflict(key));
        }
        // A later transaction changed this record.
        Err(Error::transaction_in_conflict(key))
    }
}
