use std::collections::HashMap;
use std::fmt;
use std::hash::BuildHasher;
use std::sync::Arc;

use ambar_sync::{CancelRwLock, CancelToken};
use foldhash::fast::RandomState;
use tracing::trace;

use crate::error::Error;
use crate::tx::{StoreTxn, Transaction};
use crate::txid::{TxnId, TxnIdAllocator};
use crate::version::{Key, VersionedRecord};

/// Number of shards in a store. Keys spread across shards by the projection
/// reduced modulo this count.
const SHARD_COUNT: usize = 512;

/// Entries reserved per shard when no capacity option is given.
const DEFAULT_RECORDS_PER_SHARD: usize = 50;

/// Projection from a key to the opaque value that assigns it to a shard.
///
/// The function must be deterministic, should distribute keys evenly, and
/// should complete quickly.
pub type KeyShardProjection = Arc<dyn Fn(&[u8]) -> u64 + Send + Sync>;

pub(crate) type RecordMap = HashMap<Key, Arc<VersionedRecord>, RandomState>;

pub(crate) struct Shard {
    pub(crate) records: CancelRwLock<RecordMap>,
}

/// A database storing records in sharded maps relating each key to a history
/// of versions.
///
/// All reading and mutation happens within transactions, which observe a
/// consistent snapshot while writers propose and commit concurrently; see
/// [`ShardedStore::with_transaction`].
pub struct ShardedStore {
    projection: KeyShardProjection,
    txns: TxnIdAllocator,
    shards: Box<[Shard]>,
}

impl fmt::Debug for ShardedStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ShardedStore")
            .field("txns", &self.txns)
            .field("shard_count", &self.shards.len())
            .finish()
    }
}

/// Validated construction options for a [`ShardedStore`].
pub struct StoreBuilder {
    records_per_shard: usize,
    projection: Option<KeyShardProjection>,
}

impl Default for StoreBuilder {
    fn default() -> Self {
        Self {
            records_per_shard: DEFAULT_RECORDS_PER_SHARD,
            projection: None,
        }
    }
}

impl StoreBuilder {
    /// Reserves capacity for this many records per shard at construction.
    /// Must be positive.
    pub fn initial_records_per_shard(mut self, capacity: usize) -> Self {
        self.records_per_shard = capacity;
        self
    }

    /// Replaces the default seeded byte-hash key projection.
    pub fn key_shard_projection<P>(mut self, projection: P) -> Self
    where
        P: Fn(&[u8]) -> u64 + Send + Sync + 'static,
    {
        self.projection = Some(Arc::new(projection));
        self
    }

    /// Validates the options and builds the store.
    pub fn build(self) -> Result<ShardedStore, Error> {
        if self.records_per_shard == 0 {
            return Err(Error::invalid_option(
                "initial records-per-shard capacity must be positive",
            ));
        }
        let projection = self.projection.unwrap_or_else(default_projection);
        Ok(ShardedStore::assemble(self.records_per_shard, projection))
    }
}

/// A byte hash seeded freshly per store, so shard assignment is not
/// predictable across stores.
fn default_projection() -> KeyShardProjection {
    let state = RandomState::default();
    Arc::new(move |key: &[u8]| state.hash_one(key))
}

impl ShardedStore {
    /// An empty store with default options, ready to accept records.
    pub fn new() -> Self {
        Self::assemble(DEFAULT_RECORDS_PER_SHARD, default_projection())
    }

    /// A builder for a store with customized options.
    pub fn builder() -> StoreBuilder {
        StoreBuilder::default()
    }

    fn assemble(records_per_shard: usize, projection: KeyShardProjection) -> Self {
        let shards = (0..SHARD_COUNT)
            .map(|_| Shard {
                records: CancelRwLock::new(HashMap::with_capacity_and_hasher(
                    records_per_shard,
                    RandomState::default(),
                )),
            })
            .collect::<Vec<_>>()
            .into_boxed_slice();
        Self {
            projection,
            txns: TxnIdAllocator::new(),
            shards,
        }
    }

    pub(crate) fn shard_for(&self, key: &[u8]) -> &Shard {
        &self.shards[(self.projection)(key) as usize % SHARD_COUNT]
    }

    /// Looks up the versioned record for `key` under a shared shard lock.
    pub(crate) fn record_for(
        &self,
        cancel: &CancelToken,
        key: &[u8],
    ) -> Result<Option<Arc<VersionedRecord>>, Error> {
        let shard = self.shard_for(key);
        let records = shard
            .records
            .read_until(cancel)
            .map_err(|_| Error::cancelled(key))?;
        Ok(records.get(key).cloned())
    }

    /// The advisory watermark of the latest finished transaction.
    ///
    /// No operation consults it; it is exposed for diagnostics and as an
    /// upper bound for a future vacuum pass.
    pub fn latest_finished_txn(&self) -> TxnId {
        self.txns.latest_finished()
    }

    /// Opens a transaction, runs `f` exactly once with the cancellation
    /// token and a transaction handle, and finalizes every key the
    /// transaction wrote according to the commit flag `f` returns.
    ///
    /// The second element of `f`'s return is handed back to the caller
    /// verbatim; the commit flag alone decides whether pending writes are
    /// stamped or unlinked. Finalization ignores `cancel` so that a fired
    /// token cannot leave chains half-resolved.
    pub fn with_transaction<F>(&self, cancel: &CancelToken, f: F) -> Result<(), Error>
    where
        F: FnOnce(&CancelToken, &mut dyn Transaction) -> (bool, Result<(), Error>),
    {
        let id = self.txns.claim_next();
        trace!(txn = %id, "transaction begins");
        let mut tx = StoreTxn::new(self, id);
        let (commit, result) = f(cancel, &mut tx);
        if commit {
            tx.finalize_commit();
        } else {
            tx.finalize_abort();
        }
        self.txns.record_finished(id);
        result
    }
}

impl Default for ShardedStore {
    fn default() -> Self {
        Self::new()
    }
}
