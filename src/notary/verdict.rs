// Verdicts - what the notary hands back to the host platform

use crate::identity::{PublicKey, Signature, Signer};
use crate::spend::{StateRef, TxId};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// How the conflicting transaction used the state
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConsumedStateType {
    /// The candidate wanted to consume a state someone else already consumed
    InputState,
    /// The candidate referenced a state that has been consumed
    ReferenceInputState,
}

/// Who consumed a conflicting state
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateConsumption {
    consumed_by: TxId,
    kind: ConsumedStateType,
}

impl StateConsumption {
    pub fn new(consumed_by: TxId, kind: ConsumedStateType) -> Self {
        Self { consumed_by, kind }
    }

    pub fn consumed_by(&self) -> &TxId {
        &self.consumed_by
    }

    pub fn kind(&self) -> ConsumedStateType {
        self.kind
    }
}

/// Every conflicting reference of a rejected transaction
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConflictReport {
    tx_id: TxId,
    conflicts: BTreeMap<StateRef, StateConsumption>,
}

impl ConflictReport {
    pub fn new(tx_id: TxId, conflicts: BTreeMap<StateRef, StateConsumption>) -> Self {
        Self { tx_id, conflicts }
    }

    /// The rejected transaction
    pub fn tx_id(&self) -> &TxId {
        &self.tx_id
    }

    pub fn conflicts(&self) -> &BTreeMap<StateRef, StateConsumption> {
        &self.conflicts
    }

    pub fn get(&self, state_ref: &StateRef) -> Option<&StateConsumption> {
        self.conflicts.get(state_ref)
    }

    pub fn len(&self) -> usize {
        self.conflicts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.conflicts.is_empty()
    }
}

impl fmt::Display for ConflictReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "transaction {} conflicts on", self.tx_id)?;
        for (state_ref, consumption) in &self.conflicts {
            write!(
                f,
                " [{} {:?} by {}]",
                state_ref, consumption.kind, consumption.consumed_by
            )?;
        }
        Ok(())
    }
}

/// The notary's detached signature over an approved transaction id
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotarySignature {
    tx_id: TxId,
    by: PublicKey,
    signature: Signature,
}

impl NotarySignature {
    pub fn new(tx_id: TxId, by: PublicKey, signature: Signature) -> Self {
        Self {
            tx_id,
            by,
            signature,
        }
    }

    pub fn tx_id(&self) -> &TxId {
        &self.tx_id
    }

    /// Notary key that produced the signature
    pub fn by(&self) -> &PublicKey {
        &self.by
    }

    pub fn signature(&self) -> &Signature {
        &self.signature
    }

    /// Check the signature against the signing key and transaction id
    pub fn verify(&self) -> bool {
        Signer::verify(&self.by, self.tx_id.as_bytes(), &self.signature)
    }
}

/// Outcome of notarizing one transaction
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Verdict {
    Approved(NotarySignature),
    Rejected(ConflictReport),
}

impl Verdict {
    pub fn is_approved(&self) -> bool {
        matches!(self, Self::Approved(_))
    }

    pub fn signature(&self) -> Option<&NotarySignature> {
        match self {
            Self::Approved(sig) => Some(sig),
            Self::Rejected(_) => None,
        }
    }

    pub fn conflicts(&self) -> Option<&ConflictReport> {
        match self {
            Self::Approved(_) => None,
            Self::Rejected(report) => Some(report),
        }
    }

    /// Split into signature or conflict report
    pub fn into_result(self) -> Result<NotarySignature, ConflictReport> {
        match self {
            Self::Approved(sig) => Ok(sig),
            Self::Rejected(report) => Err(report),
        }
    }
}
