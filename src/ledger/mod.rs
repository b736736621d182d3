// Ledger module - THE SHARED HISTORY
// Which states have been destroyed, by whom, as observed on the consensus log

mod conflict;

pub use conflict::{ConflictLedger, DestructionEntry, IngestOutcome, LedgerError, LedgerSnapshot};
