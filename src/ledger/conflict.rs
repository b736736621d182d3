// Conflict Ledger - first-writer-wins index of destroyed states, built from the consensus log

use crate::log::LogPosition;
use crate::spend::{SpendRecord, StateRef, TxId};
use serde::{Deserialize, Serialize};
use std::collections::hash_map::Entry;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use thiserror::Error;
use tokio::sync::watch;

/// Errors from the conflict ledger
#[derive(Error, Debug)]
pub enum LedgerError {
    #[error("Snapshot serialization failed: {0}")]
    SerializationFailed(String),

    #[error("Snapshot deserialization failed: {0}")]
    DeserializationFailed(String),
}

/// Which transaction destroyed a state, and where on the log that was recorded
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DestructionEntry {
    destroyed_by: TxId,
    position: LogPosition,
}

impl DestructionEntry {
    pub fn new(destroyed_by: TxId, position: LogPosition) -> Self {
        Self {
            destroyed_by,
            position,
        }
    }

    pub fn destroyed_by(&self) -> &TxId {
        &self.destroyed_by
    }

    pub fn position(&self) -> LogPosition {
        self.position
    }
}

/// What a single `ingest` call changed
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct IngestOutcome {
    /// References recorded as destroyed for the first time
    pub newly_destroyed: usize,
    /// References some earlier record already destroyed
    pub already_destroyed: usize,
    /// Whether the watermark moved
    pub watermark_advanced: bool,
}

/// Serializable image of the ledger, for resuming after a restart
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerSnapshot {
    watermark: Option<LogPosition>,
    destructions: Vec<(StateRef, DestructionEntry)>,
}

impl LedgerSnapshot {
    pub fn watermark(&self) -> Option<LogPosition> {
        self.watermark
    }

    pub fn len(&self) -> usize {
        self.destructions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.destructions.is_empty()
    }

    /// Serialize to bytes
    pub fn to_bytes(&self) -> Result<Vec<u8>, LedgerError> {
        postcard::to_allocvec(self).map_err(|e| LedgerError::SerializationFailed(e.to_string()))
    }

    /// Deserialize from bytes
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, LedgerError> {
        postcard::from_bytes(bytes).map_err(|e| LedgerError::DeserializationFailed(e.to_string()))
    }
}

#[derive(Default)]
struct LedgerState {
    destructions: HashMap<StateRef, DestructionEntry>,
    watermark: Option<LogPosition>,
    /// Observed positions above `watermark + 1`, waiting for the gap to fill
    pending: BTreeSet<LogPosition>,
}

impl LedgerState {
    /// Record that `position` has been applied and advance the watermark
    /// over every contiguous position. Returns true if the watermark moved.
    fn observe(&mut self, position: LogPosition) -> bool {
        let mut advanced = false;

        match self.watermark {
            None => {
                self.watermark = Some(position);
                advanced = true;
            }
            Some(w) if position <= w => return false,
            Some(_) => {
                self.pending.insert(position);
            }
        }

        self.advance_contiguous() || advanced
    }

    /// Set the base of a ledger that has no watermark yet
    fn anchor(&mut self, position: LogPosition) -> bool {
        if self.watermark.is_some() {
            return false;
        }
        self.watermark = Some(position);
        self.pending.retain(|p| *p > position);
        self.advance_contiguous();
        true
    }

    fn advance_contiguous(&mut self) -> bool {
        let mut advanced = false;
        while let Some(w) = self.watermark {
            if !self.pending.remove(&w.next()) {
                break;
            }
            self.watermark = Some(w.next());
            advanced = true;
        }
        advanced
    }
}

/// Mapping from state reference to the transaction that first destroyed it,
/// plus the watermark of log positions fully applied.
///
/// Written by the ingestion path, read by the verdict path. Per-reference
/// inserts happen under the write lock, and when two records claim the same
/// reference the lower log position is kept regardless of arrival order.
/// The watermark only advances across contiguous positions, and only grows.
pub struct ConflictLedger {
    state: RwLock<LedgerState>,
    watermark_tx: watch::Sender<Option<LogPosition>>,
}

impl Default for ConflictLedger {
    fn default() -> Self {
        Self::new()
    }
}

impl ConflictLedger {
    /// Empty ledger; the first position ingested becomes the base unless
    /// `anchor` fixes it first
    pub fn new() -> Self {
        Self::with_state(LedgerState::default())
    }

    /// Empty ledger that expects the log to continue right after `position`
    pub fn resume_after(position: LogPosition) -> Self {
        Self::with_state(LedgerState {
            watermark: Some(position),
            ..LedgerState::default()
        })
    }

    /// Rebuild a ledger from a snapshot
    pub fn restore(snapshot: LedgerSnapshot) -> Self {
        Self::with_state(LedgerState {
            destructions: snapshot.destructions.into_iter().collect(),
            watermark: snapshot.watermark,
            pending: BTreeSet::new(),
        })
    }

    fn with_state(state: LedgerState) -> Self {
        let (watermark_tx, _) = watch::channel(state.watermark);
        Self {
            state: RwLock::new(state),
            watermark_tx,
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, LedgerState> {
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, LedgerState> {
        self.state.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Apply a spend record observed at `position`
    pub fn ingest(&self, position: LogPosition, record: &SpendRecord) -> IngestOutcome {
        let mut state = self.write();
        let mut outcome = IngestOutcome::default();
        let entry = DestructionEntry::new(*record.tx_id(), position);

        for state_ref in record.consumed() {
            match state.destructions.entry(*state_ref) {
                Entry::Vacant(slot) => {
                    slot.insert(entry);
                    outcome.newly_destroyed += 1;
                }
                Entry::Occupied(mut slot) => {
                    if slot.get().position > position {
                        // An earlier record arrived late; it owns the state
                        slot.insert(entry);
                    }
                    outcome.already_destroyed += 1;
                }
            }
        }

        outcome.watermark_advanced = state.observe(position);
        if outcome.watermark_advanced {
            self.publish_watermark(state.watermark);
        }

        tracing::trace!(
            %position,
            tx_id = %record.tx_id(),
            newly_destroyed = outcome.newly_destroyed,
            already_destroyed = outcome.already_destroyed,
            "ingested spend record"
        );

        outcome
    }

    /// Count a position as applied without a record (undecodable payload)
    pub fn mark_skipped(&self, position: LogPosition) -> bool {
        let mut state = self.write();
        let advanced = state.observe(position);
        if advanced {
            self.publish_watermark(state.watermark);
        }
        advanced
    }

    /// Fix the base of a ledger that has not observed anything yet: every
    /// position up to and including `position` counts as applied. Returns
    /// false, changing nothing, if the ledger already has a watermark.
    pub fn anchor(&self, position: LogPosition) -> bool {
        let mut state = self.write();
        let anchored = state.anchor(position);
        if anchored {
            self.publish_watermark(state.watermark);
        }
        anchored
    }

    fn publish_watermark(&self, watermark: Option<LogPosition>) {
        self.watermark_tx.send_if_modified(|current| {
            if watermark > *current {
                *current = watermark;
                true
            } else {
                false
            }
        });
    }

    /// Highest position whose effects are fully applied
    pub fn watermark(&self) -> Option<LogPosition> {
        *self.watermark_tx.borrow()
    }

    /// Whether every record up to and including `target` has been applied
    pub fn caught_up_to(&self, target: LogPosition) -> bool {
        self.watermark().map(|w| w >= target).unwrap_or(false)
    }

    /// Receiver notified each time the watermark advances
    pub fn watch_watermark(&self) -> watch::Receiver<Option<LogPosition>> {
        self.watermark_tx.subscribe()
    }

    /// The destruction recorded for a reference, if any
    pub fn destruction(&self, state_ref: &StateRef) -> Option<DestructionEntry> {
        self.read().destructions.get(state_ref).copied()
    }

    /// Destructions for a set of references, read under a single lock
    pub fn destructions<'a, I>(&self, refs: I) -> BTreeMap<StateRef, DestructionEntry>
    where
        I: IntoIterator<Item = &'a StateRef>,
    {
        let state = self.read();
        refs.into_iter()
            .filter_map(|r| state.destructions.get(r).map(|e| (*r, *e)))
            .collect()
    }

    /// Number of destroyed states recorded
    pub fn len(&self) -> usize {
        self.read().destructions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().destructions.is_empty()
    }

    /// Positions received ahead of a gap
    pub fn pending_count(&self) -> usize {
        self.read().pending.len()
    }

    /// Capture the current contents
    pub fn snapshot(&self) -> LedgerSnapshot {
        let state = self.read();
        let mut destructions: Vec<_> = state.destructions.iter().map(|(r, e)| (*r, *e)).collect();
        destructions.sort_by(|a, b| a.0.cmp(&b.0));
        LedgerSnapshot {
            watermark: state.watermark,
            destructions,
        }
    }
}
