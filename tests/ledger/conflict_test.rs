use consensus_notary::ledger::{ConflictLedger, LedgerSnapshot};
use consensus_notary::log::LogPosition;
use consensus_notary::spend::{SpendRecord, StateRef, TxId};
use std::sync::Arc;
use std::thread;

fn tx(label: &str) -> TxId {
    TxId::digest(label.as_bytes())
}

fn state(label: &str, index: u32) -> StateRef {
    StateRef::new(tx(label), index)
}

fn pos(n: u64) -> LogPosition {
    LogPosition::new(n)
}

fn spend(label: &str, consumed: &[StateRef]) -> SpendRecord {
    SpendRecord::new(tx(label), consumed.to_vec(), vec![])
}

/// Test: The first record to consume a state owns it
#[test]
fn test_first_writer_wins() {
    let ledger = ConflictLedger::new();
    let a0 = state("A", 0);

    let first = ledger.ingest(pos(1), &spend("T1", &[a0]));
    let second = ledger.ingest(pos(2), &spend("T2", &[a0, state("B", 0)]));

    assert_eq!(first.newly_destroyed, 1);
    assert_eq!(second.newly_destroyed, 1);
    assert_eq!(second.already_destroyed, 1);

    let entry = ledger.destruction(&a0).unwrap();
    assert_eq!(entry.destroyed_by(), &tx("T1"));
    assert_eq!(entry.position(), pos(1));
    assert_eq!(
        ledger.destruction(&state("B", 0)).unwrap().destroyed_by(),
        &tx("T2")
    );
    assert_eq!(ledger.len(), 2);
}

/// Test: Referenced states are never recorded as destroyed
#[test]
fn test_references_not_destroyed() {
    let ledger = ConflictLedger::new();
    let record = SpendRecord::new(tx("T1"), vec![state("A", 0)], vec![state("R", 0)]);

    ledger.ingest(pos(1), &record);

    assert!(ledger.destruction(&state("R", 0)).is_none());
    assert_eq!(ledger.len(), 1);
}

/// Test: Re-ingesting the same record leaves the owner unchanged
#[test]
fn test_idempotent_reingest() {
    let ledger = ConflictLedger::new();
    let record = spend("T1", &[state("A", 0)]);

    ledger.ingest(pos(1), &record);
    let again = ledger.ingest(pos(2), &record);

    assert_eq!(again.newly_destroyed, 0);
    assert_eq!(ledger.destruction(&state("A", 0)).unwrap().position(), pos(1));
}

/// Test: A record arriving late still beats a later-positioned one
#[test]
fn test_out_of_order_lowest_position_wins() {
    let ledger = ConflictLedger::resume_after(pos(0));
    let a0 = state("A", 0);

    ledger.ingest(pos(2), &spend("T2", &[a0]));
    assert_eq!(ledger.watermark(), Some(pos(0)));

    ledger.ingest(pos(1), &spend("T1", &[a0]));

    assert_eq!(ledger.destruction(&a0).unwrap().destroyed_by(), &tx("T1"));
    assert_eq!(ledger.watermark(), Some(pos(2)));
}

/// Test: Every arrival interleaving of the same records gives the same ledger
#[test]
fn test_interleavings_agree() {
    let shared = [state("A", 0), state("B", 0), state("C", 0)];
    let records = vec![
        (pos(1), spend("T1", &shared[0..2])),
        (pos(2), spend("T2", &shared[1..3])),
        (pos(3), spend("T3", &shared[..])),
    ];

    let orders: [[usize; 3]; 6] = [
        [0, 1, 2],
        [0, 2, 1],
        [1, 0, 2],
        [1, 2, 0],
        [2, 0, 1],
        [2, 1, 0],
    ];

    let snapshots: Vec<LedgerSnapshot> = orders
        .iter()
        .map(|order| {
            let ledger = ConflictLedger::resume_after(pos(0));
            for &i in order {
                let (position, record) = &records[i];
                ledger.ingest(*position, record);
            }
            ledger.snapshot()
        })
        .collect();

    for snapshot in &snapshots[1..] {
        assert_eq!(snapshot, &snapshots[0]);
    }

    let ledger = ConflictLedger::restore(snapshots[0].clone());
    assert_eq!(ledger.destruction(&shared[0]).unwrap().destroyed_by(), &tx("T1"));
    assert_eq!(ledger.destruction(&shared[1]).unwrap().destroyed_by(), &tx("T1"));
    assert_eq!(ledger.destruction(&shared[2]).unwrap().destroyed_by(), &tx("T2"));
    assert_eq!(ledger.watermark(), Some(pos(3)));
}

/// Test: The watermark never moves backwards
#[test]
fn test_watermark_monotonic() {
    let ledger = ConflictLedger::new();

    ledger.ingest(pos(5), &spend("T5", &[]));
    ledger.ingest(pos(6), &spend("T6", &[]));
    let stale = ledger.ingest(pos(3), &spend("T3", &[]));

    assert!(!stale.watermark_advanced);
    assert_eq!(ledger.watermark(), Some(pos(6)));
    assert!(ledger.caught_up_to(pos(6)));
    assert!(!ledger.caught_up_to(pos(7)));
}

/// Test: Watchers are notified when the watermark moves
#[tokio::test]
async fn test_watermark_watch_notified() {
    let ledger = ConflictLedger::new();
    let mut rx = ledger.watch_watermark();
    assert_eq!(*rx.borrow(), None);

    ledger.ingest(pos(1), &spend("T1", &[]));

    rx.changed().await.unwrap();
    assert_eq!(*rx.borrow_and_update(), Some(pos(1)));
}

/// Test: A skipped position fills the gap just like an ingested one
#[test]
fn test_skipped_position_fills_gap() {
    let ledger = ConflictLedger::resume_after(pos(1));

    ledger.ingest(pos(3), &spend("T3", &[]));
    assert_eq!(ledger.watermark(), Some(pos(1)));

    assert!(ledger.mark_skipped(pos(2)));
    assert_eq!(ledger.watermark(), Some(pos(3)));
    assert_eq!(ledger.pending_count(), 0);
}

/// Test: Concurrent writers racing on one state agree on the lowest position
#[test]
fn test_concurrent_ingest() {
    let ledger = Arc::new(ConflictLedger::resume_after(pos(0)));
    let contested = state("A", 0);

    let handles: Vec<_> = (1..=8u64)
        .map(|n| {
            let ledger = ledger.clone();
            thread::spawn(move || {
                let label = format!("T{}", n);
                let own = state(&label, 0);
                ledger.ingest(pos(n), &spend(&label, &[contested, own]));
            })
        })
        .collect();

    for handle in handles {
        handle.join().unwrap();
    }

    assert_eq!(ledger.destruction(&contested).unwrap().destroyed_by(), &tx("T1"));
    assert_eq!(ledger.watermark(), Some(pos(8)));
    assert_eq!(ledger.len(), 9);
}

/// Test: A restored snapshot answers exactly like the ledger it was taken from
#[test]
fn test_snapshot_restore() {
    let ledger = ConflictLedger::new();
    ledger.ingest(pos(10), &spend("T1", &[state("A", 0), state("A", 1)]));
    ledger.ingest(pos(11), &spend("T2", &[state("B", 0)]));

    let bytes = ledger.snapshot().to_bytes().unwrap();
    let snapshot = LedgerSnapshot::from_bytes(&bytes).unwrap();
    assert_eq!(snapshot.watermark(), Some(pos(11)));
    assert_eq!(snapshot.len(), 3);

    let restored = ConflictLedger::restore(snapshot);
    assert_eq!(restored.watermark(), Some(pos(11)));
    for r in [state("A", 0), state("A", 1), state("B", 0)] {
        assert_eq!(restored.destruction(&r), ledger.destruction(&r));
    }

    // Restored ledgers continue right after the snapshot watermark
    restored.ingest(pos(12), &spend("T3", &[]));
    assert_eq!(restored.watermark(), Some(pos(12)));

    assert!(LedgerSnapshot::from_bytes(&[0xff, 0xff, 0xff]).is_err());
}

/// Test: Anchoring sets the base of a fresh ledger once and never moves it
#[test]
fn test_anchor_fresh_ledger() {
    let ledger = ConflictLedger::new();
    let mut rx = ledger.watch_watermark();

    assert!(ledger.anchor(pos(4)));
    assert_eq!(*rx.borrow_and_update(), Some(pos(4)));

    assert!(!ledger.anchor(pos(9)), "a second anchor is ignored");
    assert_eq!(ledger.watermark(), Some(pos(4)));

    // A message at or below the base is stale; the next one extends it
    assert!(!ledger.ingest(pos(3), &spend("T3", &[])).watermark_advanced);
    ledger.ingest(pos(5), &spend("T5", &[state("A", 0)]));
    assert_eq!(ledger.watermark(), Some(pos(5)));

    let resumed = ConflictLedger::resume_after(pos(2));
    assert!(!resumed.anchor(pos(7)));
    assert_eq!(resumed.watermark(), Some(pos(2)));
}
