// Ingestion Supervisor - feeds the conflict ledger from the consensus log
//
// - Decodes every delivered message and ingests it in arrival order
// - Logs transport errors and keeps the subscription running
// - Resubscribes with exponential backoff when the subscription is lost,
//   resuming right after the ledger watermark

use crate::ledger::ConflictLedger;
use crate::log::{LogError, LogEvent, LogPosition, OrderedLog, StartFrom, SubscriptionHandle, TopicId};
use crate::spend::SpendRecordCodec;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

// ============================================================================
// BACKOFF POLICY
// ============================================================================

/// Delay between reconnect attempts: doubles per consecutive failure, capped
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BackoffPolicy {
    pub initial: Duration,
    pub max: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            initial: Duration::from_millis(500),
            max: Duration::from_secs(30),
        }
    }
}

impl BackoffPolicy {
    pub fn new(initial: Duration, max: Duration) -> Self {
        Self { initial, max }
    }

    /// Delay before reconnect attempt number `attempt` (0-based)
    pub fn delay(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt.min(31)).unwrap_or(u32::MAX);
        self.initial.saturating_mul(factor).min(self.max)
    }
}

// ============================================================================
// INGESTION STATS
// ============================================================================

/// Counters kept by the supervisor
#[derive(Debug, Default)]
pub struct IngestionStats {
    messages: AtomicU64,
    malformed: AtomicU64,
    transport_errors: AtomicU64,
    reconnects: AtomicU64,
}

impl IngestionStats {
    /// Messages delivered by the log, including malformed ones
    pub fn messages(&self) -> u64 {
        self.messages.load(Ordering::Relaxed)
    }

    /// Messages that could not be decoded as spend records
    pub fn malformed(&self) -> u64 {
        self.malformed.load(Ordering::Relaxed)
    }

    pub fn transport_errors(&self) -> u64 {
        self.transport_errors.load(Ordering::Relaxed)
    }

    /// Successful resubscriptions after a lost subscription
    pub fn reconnects(&self) -> u64 {
        self.reconnects.load(Ordering::Relaxed)
    }
}

// ============================================================================
// SUPERVISOR
// ============================================================================

/// A live subscription and the channel it delivers into
pub struct Subscription {
    handle: SubscriptionHandle,
    events: mpsc::Receiver<LogEvent>,
}

/// Owns the log subscription that keeps a `ConflictLedger` current
pub struct IngestionSupervisor {
    log: Arc<dyn OrderedLog>,
    ledger: Arc<ConflictLedger>,
    topic: TopicId,
    backoff: BackoffPolicy,
    buffer: usize,
    shutdown: CancellationToken,
    stats: Arc<IngestionStats>,
}

impl IngestionSupervisor {
    pub fn new(
        log: Arc<dyn OrderedLog>,
        ledger: Arc<ConflictLedger>,
        topic: TopicId,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            log,
            ledger,
            topic,
            backoff: BackoffPolicy::default(),
            buffer: 1024,
            shutdown,
            stats: Arc::new(IngestionStats::default()),
        }
    }

    pub fn with_backoff(mut self, backoff: BackoffPolicy) -> Self {
        self.backoff = backoff;
        self
    }

    /// Capacity of the delivery channel
    pub fn with_buffer(mut self, buffer: usize) -> Self {
        self.buffer = buffer.max(1);
        self
    }

    pub fn stats(&self) -> Arc<IngestionStats> {
        self.stats.clone()
    }

    /// Open a subscription on the topic. A ledger with no watermark yet is
    /// anchored where the subscription starts delivering, so a later
    /// resubscription resumes from there instead of from the current head.
    pub async fn connect(&self, start: StartFrom) -> Result<Subscription, LogError> {
        let (sink, events) = mpsc::channel(self.buffer);
        let handle = self.log.subscribe(self.topic, start, sink).await?;
        let delivers_after = handle.delivers_after();
        if self.ledger.anchor(delivers_after) {
            tracing::info!(topic = %self.topic, base = %delivers_after, "ledger anchored");
        }
        tracing::info!(topic = %self.topic, ?start, "subscribed to consensus log");
        Ok(Subscription { handle, events })
    }

    /// Run the supervisor on a background task
    pub fn spawn(self, first: Subscription, start: StartFrom) -> JoinHandle<()> {
        tokio::spawn(self.run(first, start))
    }

    /// Consume `first`, then keep resubscribing until shutdown
    pub async fn run(self, first: Subscription, start: StartFrom) {
        let mut subscription = Some(first);
        let mut attempt = 0u32;

        loop {
            let current = match subscription.take() {
                Some(s) => s,
                None => {
                    if !self.sleep_backoff(attempt).await {
                        break;
                    }
                    let resume = self.resume_point(start);
                    match self.connect(resume).await {
                        Ok(s) => {
                            self.stats.reconnects.fetch_add(1, Ordering::Relaxed);
                            s
                        }
                        Err(e) => {
                            tracing::warn!(topic = %self.topic, error = %e, attempt, "resubscribe failed");
                            attempt = attempt.saturating_add(1);
                            continue;
                        }
                    }
                }
            };

            let received = self.drain(current).await;
            if self.shutdown.is_cancelled() {
                break;
            }

            if received {
                attempt = 0;
            } else {
                attempt = attempt.saturating_add(1);
            }
            tracing::warn!(
                topic = %self.topic,
                watermark = ?self.ledger.watermark(),
                "log subscription ended, reconnecting"
            );
        }

        tracing::info!(topic = %self.topic, "ingestion stopped");
    }

    /// Where a resubscription starts: just after the last applied position.
    /// `initial` only applies if no subscription was ever established.
    fn resume_point(&self, initial: StartFrom) -> StartFrom {
        self.ledger
            .watermark()
            .map(StartFrom::After)
            .unwrap_or(initial)
    }

    /// Sleep before a reconnect attempt. Returns false on shutdown.
    async fn sleep_backoff(&self, attempt: u32) -> bool {
        let delay = self.backoff.delay(attempt);
        tokio::select! {
            biased;
            _ = self.shutdown.cancelled() => false,
            _ = tokio::time::sleep(delay) => true,
        }
    }

    /// Apply events until the stream ends or shutdown. Returns whether any message arrived.
    async fn drain(&self, mut subscription: Subscription) -> bool {
        let mut received = false;

        loop {
            tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => {
                    subscription.handle.unsubscribe();
                    return received;
                }
                event = subscription.events.recv() => match event {
                    Some(LogEvent::Message { position, payload }) => {
                        received = true;
                        self.apply(position, &payload);
                    }
                    Some(LogEvent::TransportError(e)) => {
                        self.stats.transport_errors.fetch_add(1, Ordering::Relaxed);
                        tracing::warn!(topic = %self.topic, error = %e, "error on log subscription");
                    }
                    None => return received,
                },
            }
        }
    }

    fn apply(&self, position: LogPosition, payload: &[u8]) {
        self.stats.messages.fetch_add(1, Ordering::Relaxed);

        match SpendRecordCodec::decode(payload) {
            Ok(record) => {
                self.ledger.ingest(position, &record);
            }
            Err(e) => {
                self.stats.malformed.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(%position, error = %e, "skipping malformed spend record");
                self.ledger.mark_skipped(position);
            }
        }
    }
}
