use crate::spend::{SpendRecord, StateRef, TxId};
use thiserror::Error;

/// Largest payload the consensus log accepts in a single message
pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 1024;

/// Bytes before the first state entry: tx id + two u32 counts
pub const HEADER_LEN: usize = 32 + 4 + 4;

/// Bytes per state entry: tx hash + u32 output index
pub const ENTRY_LEN: usize = 32 + 4;

/// Errors that can occur during encoding/decoding
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CodecError {
    #[error("Spend record needs {needed} bytes, log limit is {limit}")]
    TooLarge { needed: usize, limit: usize },

    #[error("Buffer too short: declared {declared} bytes, got {actual}")]
    Truncated { declared: usize, actual: usize },

    #[error("Trailing bytes after spend record: declared {declared} bytes, got {actual}")]
    TrailingBytes { declared: usize, actual: usize },

    #[error("Declared entry counts overflow: {consumed} consumed, {referenced} referenced")]
    CountOverflow { consumed: u32, referenced: u32 },

    #[error("Invalid hex string: {0}")]
    InvalidHex(String),
}

/// Codec for the fixed binary layout of a spend record
///
/// ```text
/// [32] tx id
/// [4]  consumed count N   (u32, big-endian)
/// [4]  referenced count M (u32, big-endian)
/// N * ([32] tx hash, [4] output index)
/// M * ([32] tx hash, [4] output index)
/// ```
pub struct SpendRecordCodec;

impl SpendRecordCodec {
    /// Exact size of the encoded form
    pub fn encoded_len(record: &SpendRecord) -> usize {
        let entries = record.consumed().len() + record.referenced().len();
        HEADER_LEN + entries * ENTRY_LEN
    }

    /// Encode a record, refusing anything that would not fit in `max_len` bytes
    pub fn encode(record: &SpendRecord, max_len: usize) -> Result<Vec<u8>, CodecError> {
        let consumed = record.consumed().len();
        let referenced = record.referenced().len();

        let needed = consumed
            .checked_add(referenced)
            .and_then(|n| n.checked_mul(ENTRY_LEN))
            .and_then(|n| n.checked_add(HEADER_LEN))
            .unwrap_or(usize::MAX);

        if needed > max_len {
            return Err(CodecError::TooLarge {
                needed,
                limit: max_len,
            });
        }

        let consumed_count = u32::try_from(consumed).map_err(|_| CodecError::TooLarge {
            needed,
            limit: max_len,
        })?;
        let referenced_count = u32::try_from(referenced).map_err(|_| CodecError::TooLarge {
            needed,
            limit: max_len,
        })?;

        let mut out = Vec::with_capacity(needed);
        out.extend_from_slice(record.tx_id().as_bytes());
        out.extend_from_slice(&consumed_count.to_be_bytes());
        out.extend_from_slice(&referenced_count.to_be_bytes());

        for state in record.consumed().iter().chain(record.referenced()) {
            out.extend_from_slice(state.tx_hash().as_bytes());
            out.extend_from_slice(&state.index().to_be_bytes());
        }

        debug_assert_eq!(out.len(), needed);
        Ok(out)
    }

    /// Decode a record, validating the declared counts against the buffer before reading
    pub fn decode(bytes: &[u8]) -> Result<SpendRecord, CodecError> {
        if bytes.len() < HEADER_LEN {
            return Err(CodecError::Truncated {
                declared: HEADER_LEN,
                actual: bytes.len(),
            });
        }

        let tx_id = read_tx_id(&bytes[0..32]);
        let consumed_count = read_u32(&bytes[32..36]);
        let referenced_count = read_u32(&bytes[36..40]);

        let declared = (consumed_count as usize)
            .checked_add(referenced_count as usize)
            .and_then(|n| n.checked_mul(ENTRY_LEN))
            .and_then(|n| n.checked_add(HEADER_LEN))
            .ok_or(CodecError::CountOverflow {
                consumed: consumed_count,
                referenced: referenced_count,
            })?;

        if declared > bytes.len() {
            return Err(CodecError::Truncated {
                declared,
                actual: bytes.len(),
            });
        }
        if declared < bytes.len() {
            return Err(CodecError::TrailingBytes {
                declared,
                actual: bytes.len(),
            });
        }

        let mut entries = bytes[HEADER_LEN..].chunks_exact(ENTRY_LEN).map(read_state_ref);

        let consumed: Vec<StateRef> = entries.by_ref().take(consumed_count as usize).collect();
        let referenced: Vec<StateRef> = entries.collect();

        Ok(SpendRecord::new(tx_id, consumed, referenced))
    }

    /// Encode to hex string
    pub fn encode_hex(record: &SpendRecord, max_len: usize) -> Result<String, CodecError> {
        Self::encode(record, max_len).map(hex::encode)
    }

    /// Decode from hex string
    pub fn decode_hex(hex_str: &str) -> Result<SpendRecord, CodecError> {
        let bytes = hex::decode(hex_str).map_err(|e| CodecError::InvalidHex(e.to_string()))?;
        Self::decode(&bytes)
    }
}

fn read_u32(bytes: &[u8]) -> u32 {
    let mut buf = [0u8; 4];
    buf.copy_from_slice(bytes);
    u32::from_be_bytes(buf)
}

fn read_tx_id(bytes: &[u8]) -> TxId {
    let mut buf = [0u8; 32];
    buf.copy_from_slice(bytes);
    TxId::from_bytes(buf)
}

fn read_state_ref(entry: &[u8]) -> StateRef {
    StateRef::new(read_tx_id(&entry[..32]), read_u32(&entry[32..]))
}
