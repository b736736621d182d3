//! Consensus Notary
//!
//! Detects double-spends by announcing every transaction's consumed and
//! referenced states on an append-only consensus log, then judging the
//! transaction against the first-writer-wins ledger rebuilt from that log.

pub mod config;
pub mod identity;
pub mod ledger;
pub mod log;
pub mod notary;
pub mod spend;
