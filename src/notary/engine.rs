// Notary Engine - announce a transaction's spends, wait for them to come back
// through the consensus log, then judge the transaction against the ledger

use crate::identity::{Keypair, Signer, TransactionSigner};
use crate::ledger::ConflictLedger;
use crate::log::{LogError, LogPosition, OrderedLog, TopicId};
use crate::notary::{
    BackoffPolicy, ConflictReport, ConsumedStateType, NotarySignature, StateConsumption, Verdict,
};
use crate::spend::{
    CandidateTransaction, CodecError, SpendRecord, SpendRecordCodec, DEFAULT_MAX_MESSAGE_SIZE,
    HEADER_LEN,
};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

// ============================================================================
// NOTARY ERROR
// ============================================================================

/// Failures of a notarization attempt. A conflict is not an error; see `Verdict::Rejected`.
#[derive(Error, Debug)]
pub enum NotaryError {
    #[error("Transaction {tx_id} failed validation: {reason}")]
    InvalidTransaction { tx_id: String, reason: String },

    #[error("Spend record encoding failed: {0}")]
    Encoding(#[from] CodecError),

    #[error("Publishing spend record failed: {0}")]
    Publish(LogError),

    #[error("Creating topic failed: {0}")]
    TopicCreation(LogError),

    #[error("Subscribing to topic failed: {0}")]
    Subscribe(LogError),

    #[error("Timed out waiting for log position {target}; ledger watermark is {watermark:?}")]
    WaitTimedOut {
        target: LogPosition,
        watermark: Option<LogPosition>,
    },

    #[error("Cancelled while waiting for log position {0}")]
    Cancelled(LogPosition),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

// ============================================================================
// TRANSACTION VALIDATOR
// ============================================================================

/// Application-specific checks run before a transaction's spends are announced
pub trait TransactionValidator: Send + Sync {
    fn validate(&self, txn: &CandidateTransaction) -> Result<(), String>;
}

/// Accepts every transaction
pub struct AcceptAll;

impl TransactionValidator for AcceptAll {
    fn validate(&self, txn: &CandidateTransaction) -> Result<(), String> {
        tracing::debug!(tx_id = %txn.id(), "received transaction");
        Ok(())
    }
}

// ============================================================================
// NOTARY SETTINGS
// ============================================================================

/// Runtime settings of a notary
#[derive(Clone, Debug)]
pub struct NotarySettings {
    /// Topic to use; created at startup when absent
    pub topic: Option<TopicId>,
    /// Key authorizing submissions to the topic
    pub submit_key: Option<Keypair>,
    /// Fallback re-check interval while waiting for the ledger to catch up
    pub poll_interval: Duration,
    /// Upper bound on the wait; `None` waits until cancelled
    pub wait_timeout: Option<Duration>,
    /// Largest spend record the log accepts
    pub max_message_size: usize,
    /// Reconnect policy for the ingestion subscription
    pub backoff: BackoffPolicy,
    /// Capacity of the subscription delivery channel
    pub subscription_buffer: usize,
}

impl Default for NotarySettings {
    fn default() -> Self {
        Self {
            topic: None,
            submit_key: None,
            poll_interval: Duration::from_secs(5),
            wait_timeout: Some(Duration::from_secs(120)),
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
            backoff: BackoffPolicy::default(),
            subscription_buffer: 1024,
        }
    }
}

impl NotarySettings {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_topic(mut self, topic: TopicId) -> Self {
        self.topic = Some(topic);
        self
    }

    pub fn with_submit_key(mut self, key: Keypair) -> Self {
        self.submit_key = Some(key);
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_wait_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.wait_timeout = timeout;
        self
    }

    pub fn with_max_message_size(mut self, size: usize) -> Self {
        self.max_message_size = size;
        self
    }

    pub fn with_backoff(mut self, backoff: BackoffPolicy) -> Self {
        self.backoff = backoff;
        self
    }

    /// Validate the settings
    pub fn validate(&self) -> Result<(), NotaryError> {
        if self.poll_interval.is_zero() {
            return Err(NotaryError::InvalidConfig(
                "poll_interval must be > 0".to_string(),
            ));
        }
        if self.wait_timeout.map(|t| t.is_zero()).unwrap_or(false) {
            return Err(NotaryError::InvalidConfig(
                "wait_timeout must be > 0".to_string(),
            ));
        }
        if self.max_message_size < HEADER_LEN {
            return Err(NotaryError::InvalidConfig(format!(
                "max_message_size must be at least {} bytes",
                HEADER_LEN
            )));
        }
        if self.backoff.initial.is_zero() || self.backoff.max < self.backoff.initial {
            return Err(NotaryError::InvalidConfig(
                "reconnect backoff must be > 0 and max >= initial".to_string(),
            ));
        }
        if self.subscription_buffer == 0 {
            return Err(NotaryError::InvalidConfig(
                "subscription_buffer cannot be 0".to_string(),
            ));
        }
        Ok(())
    }
}

// ============================================================================
// NOTARY STATS
// ============================================================================

/// Counts of notarization outcomes
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct NotaryStats {
    pub approved: u64,
    pub rejected: u64,
    pub failed: u64,
}

#[derive(Default)]
struct StatCounters {
    approved: AtomicU64,
    rejected: AtomicU64,
    failed: AtomicU64,
}

// ============================================================================
// NOTARY
// ============================================================================

/// Notarizes transactions against the consensus log.
///
/// Each call is announce-then-confirm: the spend record is published, and
/// the verdict is computed only once the ledger has applied everything up
/// to the position the log assigned to that record. Two racing transactions
/// on the same state are therefore ordered by the log, never by arrival time
/// at this process.
pub struct Notary {
    log: Arc<dyn OrderedLog>,
    signer: Arc<dyn TransactionSigner>,
    validator: Box<dyn TransactionValidator>,
    ledger: Arc<ConflictLedger>,
    topic: TopicId,
    settings: NotarySettings,
    shutdown: CancellationToken,
    counters: StatCounters,
}

impl Notary {
    pub fn new(
        log: Arc<dyn OrderedLog>,
        signer: Arc<dyn TransactionSigner>,
        ledger: Arc<ConflictLedger>,
        topic: TopicId,
        settings: NotarySettings,
    ) -> Self {
        Self {
            log,
            signer,
            validator: Box::new(AcceptAll),
            ledger,
            topic,
            settings,
            shutdown: CancellationToken::new(),
            counters: StatCounters::default(),
        }
    }

    /// Replace the transaction validator
    pub fn with_validator(mut self, validator: Box<dyn TransactionValidator>) -> Self {
        self.validator = validator;
        self
    }

    pub fn topic(&self) -> TopicId {
        self.topic
    }

    pub fn ledger(&self) -> &Arc<ConflictLedger> {
        &self.ledger
    }

    pub fn settings(&self) -> &NotarySettings {
        &self.settings
    }

    /// Token cancelled by `shutdown`
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Cancel every in-flight wait and stop ingestion
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    pub fn stats(&self) -> NotaryStats {
        NotaryStats {
            approved: self.counters.approved.load(Ordering::Relaxed),
            rejected: self.counters.rejected.load(Ordering::Relaxed),
            failed: self.counters.failed.load(Ordering::Relaxed),
        }
    }

    /// Notarize a transaction
    pub async fn notarize(&self, txn: &CandidateTransaction) -> Result<Verdict, NotaryError> {
        self.notarize_with_cancel(txn, self.shutdown.child_token())
            .await
    }

    /// Notarize a transaction, giving up with `NotaryError::Cancelled` when `cancel` fires
    pub async fn notarize_with_cancel(
        &self,
        txn: &CandidateTransaction,
        cancel: CancellationToken,
    ) -> Result<Verdict, NotaryError> {
        let result = self.run(txn, &cancel).await;

        let counter = match &result {
            Ok(Verdict::Approved(_)) => &self.counters.approved,
            Ok(Verdict::Rejected(_)) => &self.counters.rejected,
            Err(_) => &self.counters.failed,
        };
        counter.fetch_add(1, Ordering::Relaxed);

        result
    }

    async fn run(
        &self,
        txn: &CandidateTransaction,
        cancel: &CancellationToken,
    ) -> Result<Verdict, NotaryError> {
        self.validator
            .validate(txn)
            .map_err(|reason| NotaryError::InvalidTransaction {
                tx_id: txn.id().to_string(),
                reason,
            })?;

        let position = self.submit_spends(txn).await?;
        tracing::debug!(tx_id = %txn.id(), %position, "spend record accepted by log");

        self.wait_until_applied(position, cancel).await?;

        let verdict = self.check(txn);
        match &verdict {
            Verdict::Approved(_) => {
                tracing::info!(tx_id = %txn.id(), %position, "notarized transaction")
            }
            Verdict::Rejected(report) => {
                tracing::info!(tx_id = %txn.id(), %position, conflicts = report.len(), "rejected transaction: {}", report)
            }
        }

        Ok(verdict)
    }

    /// Publish the spend record and return the position the log assigned to it.
    /// Never retried: a second publish would be a second announcement.
    async fn submit_spends(&self, txn: &CandidateTransaction) -> Result<LogPosition, NotaryError> {
        tracing::trace!(tx_id = %txn.id(), "submitting transaction spends");

        let record = SpendRecord::from(txn);
        let payload = SpendRecordCodec::encode(&record, self.settings.max_message_size)
            .map_err(|e| {
                tracing::error!(tx_id = %txn.id(), error = %e, "cannot encode spend record");
                e
            })?;

        let submit_signature = self
            .settings
            .submit_key
            .as_ref()
            .map(|key| Signer::sign(key, &payload));

        self.log
            .publish(self.topic, payload, submit_signature)
            .await
            .map_err(|e| {
                tracing::warn!(tx_id = %txn.id(), error = %e, "publish failed");
                NotaryError::Publish(e)
            })
    }

    /// Wait until the ledger watermark reaches `target`.
    ///
    /// Wakes on every watermark advance and re-checks at least every
    /// `poll_interval`; bounded by `wait_timeout` and `cancel`.
    pub async fn wait_until_applied(
        &self,
        target: LogPosition,
        cancel: &CancellationToken,
    ) -> Result<(), NotaryError> {
        let mut watermark_rx = self.ledger.watch_watermark();
        let poll_interval = self.settings.poll_interval;

        let wait = async {
            while !self.ledger.caught_up_to(target) {
                tokio::select! {
                    changed = watermark_rx.changed() => {
                        if changed.is_err() {
                            tokio::time::sleep(poll_interval).await;
                        }
                    }
                    _ = tokio::time::sleep(poll_interval) => {
                        tracing::trace!(%target, watermark = ?self.ledger.watermark(), "still waiting for ledger");
                    }
                }
            }
        };

        let bounded = async {
            match self.settings.wait_timeout {
                Some(limit) => tokio::time::timeout(limit, wait).await.map_err(|_| {
                    NotaryError::WaitTimedOut {
                        target,
                        watermark: self.ledger.watermark(),
                    }
                }),
                None => {
                    wait.await;
                    Ok(())
                }
            }
        };

        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(NotaryError::Cancelled(target)),
            result = bounded => result,
        }
    }

    /// Judge a transaction against everything the ledger has applied
    pub fn check(&self, txn: &CandidateTransaction) -> Verdict {
        let destructions = self
            .ledger
            .destructions(txn.inputs().iter().chain(txn.references()));

        let mut conflicts = BTreeMap::new();

        for input in txn.inputs() {
            if let Some(entry) = destructions.get(input) {
                if entry.destroyed_by() != txn.id() {
                    conflicts.insert(
                        *input,
                        StateConsumption::new(*entry.destroyed_by(), ConsumedStateType::InputState),
                    );
                }
            }
        }

        // A referenced state must be unconsumed, even by this same transaction
        for reference in txn.references() {
            if let Some(entry) = destructions.get(reference) {
                conflicts.insert(
                    *reference,
                    StateConsumption::new(
                        *entry.destroyed_by(),
                        ConsumedStateType::ReferenceInputState,
                    ),
                );
            }
        }

        if !conflicts.is_empty() {
            return Verdict::Rejected(ConflictReport::new(*txn.id(), conflicts));
        }

        let signature = self.signer.sign(txn.id());
        Verdict::Approved(NotarySignature::new(
            *txn.id(),
            self.signer.public_key(),
            signature,
        ))
    }
}
