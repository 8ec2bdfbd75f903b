//! ambar: a sharded, in-memory multi-version key-value store with
//! snapshot-isolated transactions.
//!
//! Readers and writers run concurrently without blocking each other on the
//! common path and never observe each other's uncommitted effects. Every key
//! holds a newest-first chain of versions stamped with a half-open
//! transaction-ID validity interval; writers propose pending versions with
//! lock-free compare-and-set, and the store stamps or unlinks them when the
//! transaction ends.
//!
//! Keys spread over a fixed set of shards, each a map guarded by a
//! reader/writer lock that honors a [`CancelToken`]. The store keeps every
//! version it has committed: there is no garbage collection of obsolete
//! versions yet, so memory grows with write traffic.
//!
//! # Example
//!
//! ```rust
//! use ambar::{CancelToken, ShardedStore, Transaction};
//!
//! let store = ShardedStore::new();
//! let cancel = CancelToken::new();
//!
//! store
//!     .with_transaction(&cancel, |cancel, tx| {
//!         if let Err(err) = tx.insert(cancel, b"k1", b"v1") {
//!             return (false, Err(err));
//!         }
//!         (true, Ok(()))
//!     })
//!     .unwrap();
//!
//! store
//!     .with_transaction(&cancel, |cancel, tx| {
//!         let value = tx.get(cancel, b"k1").unwrap();
//!         assert_eq!(value.as_slice(), b"v1");
//!         (false, Ok(()))
//!     })
//!     .unwrap();
//! ```

mod error;
mod store;
mod tx;
mod txid;
mod version;

pub use ambar_sync::{CancelToken, Cancelled};
pub use error::{Error, ErrorKind};
pub use store::{KeyShardProjection, ShardedStore, StoreBuilder};
pub use tx::Transaction;
pub use txid::TxnId;
pub use version::{Key, Value};
