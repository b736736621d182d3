// Spend module - WHAT GETS ANNOUNCED
// State references, spend records and their canonical wire encoding

mod codec;
mod model;

pub use codec::{CodecError, SpendRecordCodec, DEFAULT_MAX_MESSAGE_SIZE, ENTRY_LEN, HEADER_LEN};
pub use model::{CandidateTransaction, SpendRecord, StateRef, TxId};
