//! Concurrent catch-up runs against one SQLite database.

mod common;

use std::sync::mpsc;
use std::thread;
use std::time::{Duration, Instant};

use common::{id, subscription, TestFixture};

use substore::storage::BackendErrorKind;
use substore::{Position, StoreError, SubscriptionCriteria, SubscriptionStatus, SubscriptionStore};

#[test]
fn test_overlapping_runs_serialize() {
    let fixture = TestFixture::new();
    fixture
        .store()
        .add(&subscription("sub-a", SubscriptionStatus::Active, 0))
        .unwrap();
    let criteria = SubscriptionCriteria::by_ids([id("sub-a")]).unwrap();

    let (locked_tx, locked_rx) = mpsc::channel();
    let hold = Duration::from_millis(300);
    let (fixture_ref, criteria) = (&fixture, &criteria);

    thread::scope(|scope| {
        let first = scope.spawn(move || {
            let mut store = fixture_ref.store();
            store.begin_transaction().unwrap();
            let found = store.find_by_criteria_for_update(criteria).unwrap();
            locked_tx.send(()).unwrap();

            thread::sleep(hold);
            let advanced = found[0].clone().with_position(Position::new(10).unwrap());
            store.update(&advanced).unwrap();
            store.commit().unwrap();
        });

        let second = scope.spawn(move || {
            let mut store = fixture_ref.store();
            locked_rx.recv().unwrap();

            let started = Instant::now();
            store.begin_transaction().unwrap();
            let waited = started.elapsed();
            let found = store.find_by_criteria_for_update(criteria).unwrap();

            // Blocked until the first run committed, then saw its write.
            assert_eq!(found[0].position.value(), 10);
            let advanced = found[0].clone().with_position(Position::new(20).unwrap());
            store.update(&advanced).unwrap();
            store.commit().unwrap();
            waited
        });

        first.join().unwrap();
        let waited = second.join().unwrap();
        assert!(waited >= hold / 2, "second run only waited {waited:?}");
    });

    let found = fixture
        .store()
        .find_by_criteria(&SubscriptionCriteria::all())
        .unwrap();
    assert_eq!(found[0].position.value(), 20);
}

#[test]
fn test_lock_wait_times_out_as_busy() {
    let fixture = TestFixture::with_lock_timeout(Duration::from_millis(100));
    let mut holder = fixture.store();
    let mut waiter = fixture.store();

    holder.begin_transaction().unwrap();
    let err = waiter.begin_transaction().unwrap_err();
    match err {
        StoreError::Backend { operation, source, .. } => {
            assert_eq!(operation, "begin_transaction");
            assert_eq!(source.kind, BackendErrorKind::Busy);
        }
        other => panic!("unexpected error: {other}"),
    }
    assert!(!waiter.in_transaction());

    holder.commit().unwrap();
    waiter.begin_transaction().unwrap();
    waiter.rollback().unwrap();
}

#[test]
fn test_unlocked_reads_do_not_block() {
    let fixture = TestFixture::with_lock_timeout(Duration::from_millis(100));
    let mut writer = fixture.store();
    let mut reader = fixture.store();

    writer.begin_transaction().unwrap();
    writer
        .add(&subscription("sub-a", SubscriptionStatus::New, 0))
        .unwrap();

    // WAL readers see the last committed state.
    assert!(reader
        .find_by_criteria(&SubscriptionCriteria::all())
        .unwrap()
        .is_empty());

    writer.commit().unwrap();
    assert_eq!(
        reader
            .find_by_criteria(&SubscriptionCriteria::all())
            .unwrap()
            .len(),
        1
    );
}
