use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;

/// Identifier of a ledger transaction (32-byte hash)
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TxId([u8; 32]);

impl TxId {
    /// Create a TxId from raw bytes
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Get the raw bytes
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// SHA-256 of arbitrary transaction content
    pub fn digest(content: &[u8]) -> Self {
        let hash = Sha256::digest(content);
        let mut id = [0u8; 32];
        id.copy_from_slice(&hash);
        Self(id)
    }

    /// Parse from a 64-character hex string
    pub fn from_hex(s: &str) -> Option<Self> {
        let bytes = hex::decode(s).ok()?;
        let bytes: [u8; 32] = bytes.try_into().ok()?;
        Some(Self(bytes))
    }
}

impl fmt::Display for TxId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode_upper(self.0))
    }
}

impl fmt::Debug for TxId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TxId({})", hex::encode(&self.0[..8]))
    }
}

/// Pointer to one output of one transaction - the unit protected against double use
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct StateRef {
    tx_hash: TxId,
    index: u32,
}

impl StateRef {
    pub fn new(tx_hash: TxId, index: u32) -> Self {
        Self { tx_hash, index }
    }

    /// Transaction that created the state
    pub fn tx_hash(&self) -> &TxId {
        &self.tx_hash
    }

    /// Output index within the originating transaction
    pub fn index(&self) -> u32 {
        self.index
    }
}

impl fmt::Display for StateRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({})", self.tx_hash, self.index)
    }
}

impl fmt::Debug for StateRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "StateRef({:?}, {})", self.tx_hash, self.index)
    }
}

/// A transaction as handed to the notary by the host ledger platform
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CandidateTransaction {
    id: TxId,
    inputs: Vec<StateRef>,
    references: Vec<StateRef>,
}

impl CandidateTransaction {
    pub fn new(id: TxId, inputs: Vec<StateRef>, references: Vec<StateRef>) -> Self {
        Self {
            id,
            inputs,
            references,
        }
    }

    pub fn id(&self) -> &TxId {
        &self.id
    }

    /// States this transaction consumes
    pub fn inputs(&self) -> &[StateRef] {
        &self.inputs
    }

    /// States this transaction reads without consuming
    pub fn references(&self) -> &[StateRef] {
        &self.references
    }
}

/// Announcement published to the ordered log: which states a transaction consumes
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpendRecord {
    tx_id: TxId,
    consumed: Vec<StateRef>,
    referenced: Vec<StateRef>,
}

impl SpendRecord {
    pub fn new(tx_id: TxId, consumed: Vec<StateRef>, referenced: Vec<StateRef>) -> Self {
        Self {
            tx_id,
            consumed,
            referenced,
        }
    }

    pub fn tx_id(&self) -> &TxId {
        &self.tx_id
    }

    pub fn consumed(&self) -> &[StateRef] {
        &self.consumed
    }

    pub fn referenced(&self) -> &[StateRef] {
        &self.referenced
    }
}

impl From<&CandidateTransaction> for SpendRecord {
    fn from(txn: &CandidateTransaction) -> Self {
        Self {
            tx_id: txn.id,
            consumed: txn.inputs.clone(),
            referenced: txn.references.clone(),
        }
    }
}
