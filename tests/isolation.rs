use std::sync::mpsc;
use std::sync::Arc;
use std::thread;

use ambar::{CancelToken, ErrorKind, ShardedStore, Transaction};

fn seed(store: &ShardedStore, key: &[u8], value: &[u8]) {
    let cancel = CancelToken::new();
    store
        .with_transaction(&cancel, |cancel, tx| {
            tx.insert(cancel, key, value).unwrap();
            (true, Ok(()))
        })
        .unwrap();
}

fn read(store: &ShardedStore, key: &[u8]) -> Option<Vec<u8>> {
    let cancel = CancelToken::new();
    let mut out = None;
    store
        .with_transaction(&cancel, |cancel, tx| {
            out = tx.get(cancel, key).ok().map(|v| v.to_vec());
            (false, Ok(()))
        })
        .unwrap();
    out
}

#[test]
fn snapshot_readers_ignore_later_commits() {
    let store = Arc::new(ShardedStore::new());
    seed(&store, b"x", b"initial");

    let (reader_started_tx, reader_started_rx) = mpsc::channel();
    let (writer_done_tx, writer_done_rx) = mpsc::channel::<()>();

    let reader = {
        let store = Arc::clone(&store);
        thread::spawn(move || {
            let cancel = CancelToken::new();
            store
                .with_transaction(&cancel, move |cancel, tx| {
                    assert_eq!(tx.get(cancel, b"x").unwrap().as_slice(), b"initial");
                    reader_started_tx.send(()).unwrap();
                    writer_done_rx.recv().unwrap();
                    // A later transaction has committed by now; our snapshot
                    // must not move.
                    assert_eq!(tx.get(cancel, b"x").unwrap().as_slice(), b"initial");
                    (false, Ok(()))
                })
                .unwrap();
        })
    };

    reader_started_rx.recv().unwrap();
    let cancel = CancelToken::new();
    store
        .with_transaction(&cancel, |cancel, tx| {
            tx.update(cancel, b"x", b"updated").unwrap();
            (true, Ok(()))
        })
        .unwrap();
    writer_done_tx.send(()).unwrap();
    reader.join().unwrap();

    assert_eq!(read(&store, b"x").unwrap(), b"updated");
}

#[test]
fn pending_writes_are_invisible_and_conflict() {
    let store = Arc::new(ShardedStore::new());

    let (inserted_tx, inserted_rx) = mpsc::channel();
    let (release_tx, release_rx) = mpsc::channel::<()>();

    let writer = {
        let store = Arc::clone(&store);
        thread::spawn(move || {
            let cancel = CancelToken::new();
            store
                .with_transaction(&cancel, move |cancel, tx| {
                    tx.insert(cancel, b"k", b"v").unwrap();
                    inserted_tx.send(()).unwrap();
                    release_rx.recv().unwrap();
                    (true, Ok(()))
                })
                .unwrap();
        })
    };

    inserted_rx.recv().unwrap();
    let cancel = CancelToken::new();
    store
        .with_transaction(&cancel, |cancel, tx| {
            // The other transaction's proposal is invisible to us.
            let err = tx.get(cancel, b"k").unwrap_err();
            assert_eq!(err.kind(), ErrorKind::RecordDoesNotExist);
            // And it blocks our own proposal for the same key.
            let err = tx.insert(cancel, b"k", b"mine").unwrap_err();
            assert_eq!(err.kind(), ErrorKind::TransactionInConflict);
            let err = tx.update(cancel, b"k", b"mine").unwrap_err();
            assert_eq!(err.kind(), ErrorKind::TransactionInConflict);
            let err = tx.delete(cancel, b"k").unwrap_err();
            assert_eq!(err.kind(), ErrorKind::TransactionInConflict);
            (false, Ok(()))
        })
        .unwrap();

    release_tx.send(()).unwrap();
    writer.join().unwrap();

    assert_eq!(read(&store, b"k").unwrap(), b"v");
}

#[test]
fn update_conflicts_with_a_later_committed_writer() {
    let store = Arc::new(ShardedStore::new());
    seed(&store, b"k", b"v0");

    let (started_tx, started_rx) = mpsc::channel();
    let (committed_tx, committed_rx) = mpsc::channel::<()>();

    let early = {
        let store = Arc::clone(&store);
        thread::spawn(move || {
            let cancel = CancelToken::new();
            store
                .with_transaction(&cancel, move |cancel, tx| {
                    assert_eq!(tx.get(cancel, b"k").unwrap().as_slice(), b"v0");
                    started_tx.send(()).unwrap();
                    committed_rx.recv().unwrap();
                    // A later transaction superseded our snapshot's version;
                    // writing now would leap-frog it.
                    let err = tx.update(cancel, b"k", b"early").unwrap_err();
                    assert_eq!(err.kind(), ErrorKind::TransactionInConflict);
                    let err = tx.delete(cancel, b"k").unwrap_err();
                    assert_eq!(err.kind(), ErrorKind::TransactionInConflict);
                    (false, Ok(()))
                })
                .unwrap();
        })
    };

    started_rx.recv().unwrap();
    let cancel = CancelToken::new();
    store
        .with_transaction(&cancel, |cancel, tx| {
            tx.update(cancel, b"k", b"later").unwrap();
            (true, Ok(()))
        })
        .unwrap();
    committed_tx.send(()).unwrap();
    early.join().unwrap();

    assert_eq!(read(&store, b"k").unwrap(), b"later");
}

#[test]
fn insert_conflicts_after_a_later_writer_passed_a_tombstone() {
    let store = Arc::new(ShardedStore::new());
    seed(&store, b"k", b"v0");

    // Delete the record so a tombstone bounds the only version.
    let cancel = CancelToken::new();
    store
        .with_transaction(&cancel, |cancel, tx| {
            assert!(tx.delete(cancel, b"k").unwrap());
            (true, Ok(()))
        })
        .unwrap();

    let (started_tx, started_rx) = mpsc::channel();
    let (committed_tx, committed_rx) = mpsc::channel::<()>();

    let early = {
        let store = Arc::clone(&store);
        thread::spawn(move || {
            let cancel = CancelToken::new();
            store
                .with_transaction(&cancel, move |cancel, tx| {
                    let err = tx.get(cancel, b"k").unwrap_err();
                    assert_eq!(err.kind(), ErrorKind::RecordDoesNotExist);
                    started_tx.send(()).unwrap();
                    committed_rx.recv().unwrap();
                    // A later transaction re-inserted the record; inserting
                    // under it would leap-frog that commit.
                    let err = tx.insert(cancel, b"k", b"early").unwrap_err();
                    assert_eq!(err.kind(), ErrorKind::TransactionInConflict);
                    (false, Ok(()))
                })
                .unwrap();
        })
    };

    started_rx.recv().unwrap();
    store
        .with_transaction(&cancel, |cancel, tx| {
            tx.insert(cancel, b"k", b"later").unwrap();
            (true, Ok(()))
        })
        .unwrap();
    committed_tx.send(()).unwrap();
    early.join().unwrap();

    assert_eq!(read(&store, b"k").unwrap(), b"later");
}

#[test]
fn insert_over_a_committed_tombstone_succeeds() {
    let store = ShardedStore::new();
    let cancel = CancelToken::new();
    seed(&store, b"k", b"first");

    store
        .with_transaction(&cancel, |cancel, tx| {
            assert!(tx.delete(cancel, b"k").unwrap());
            (true, Ok(()))
        })
        .unwrap();
    assert_eq!(read(&store, b"k"), None);

    store
        .with_transaction(&cancel, |cancel, tx| {
            tx.insert(cancel, b"k", b"second").unwrap();
            (true, Ok(()))
        })
        .unwrap();
    assert_eq!(read(&store, b"k").unwrap(), b"second");
}

#[test]
fn aborted_writes_leave_no_trace_for_later_transactions() {
    let store = ShardedStore::new();
    let cancel = CancelToken::new();
    seed(&store, b"k", b"v0");

    store
        .with_transaction(&cancel, |cancel, tx| {
            tx.update(cancel, b"k", b"scratch").unwrap();
            assert!(tx.delete(cancel, b"k").unwrap());
            (false, Ok(()))
        })
        .unwrap();

    // The aborted proposals are unlinked; the committed version remains
    // authoritative and writable.
    assert_eq!(read(&store, b"k").unwrap(), b"v0");
    store
        .with_transaction(&cancel, |cancel, tx| {
            tx.update(cancel, b"k", b"v1").unwrap();
            (true, Ok(()))
        })
        .unwrap();
    assert_eq!(read(&store, b"k").unwrap(), b"v1");
}

#[test]
fn delete_collapse_keeps_earlier_snapshots_intact() {
    let store = Arc::new(ShardedStore::new());
    seed(&store, b"k", b"kept");

    let (started_tx, started_rx) = mpsc::channel();
    let (deleted_tx, deleted_rx) = mpsc::channel::<()>();

    let early = {
        let store = Arc::clone(&store);
        thread::spawn(move || {
            let cancel = CancelToken::new();
            store
                .with_transaction(&cancel, move |cancel, tx| {
                    assert_eq!(tx.get(cancel, b"k").unwrap().as_slice(), b"kept");
                    started_tx.send(()).unwrap();
                    deleted_rx.recv().unwrap();
                    // The later delete bounded our version's window beyond
                    // our ID; we still see it.
                    assert_eq!(tx.get(cancel, b"k").unwrap().as_slice(), b"kept");
                    (false, Ok(()))
                })
                .unwrap();
        })
    };

    started_rx.recv().unwrap();
    let cancel = CancelToken::new();
    store
        .with_transaction(&cancel, |cancel, tx| {
            assert!(tx.delete(cancel, b"k").unwrap());
            (true, Ok(()))
        })
        .unwrap();
    deleted_tx.send(()).unwrap();
    early.join().unwrap();

    assert_eq!(read(&store, b"k"), None);
}
