// Notary module - THE VERDICT
// Publishes spend records, keeps the conflict ledger fed, and approves or rejects transactions

mod engine;
mod service;
mod subscriber;
mod verdict;

pub use engine::{
    AcceptAll, Notary, NotaryError, NotarySettings, NotaryStats, TransactionValidator,
};
pub use service::{NotaryService, NotaryServiceBuilder, TOPIC_MEMO};
pub use subscriber::{BackoffPolicy, IngestionStats, IngestionSupervisor, Subscription};
pub use verdict::{ConflictReport, ConsumedStateType, NotarySignature, StateConsumption, Verdict};
