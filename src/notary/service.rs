// Notary Service - wires the notary, its ledger and the ingestion supervisor together

use crate::identity::TransactionSigner;
use crate::ledger::{ConflictLedger, LedgerSnapshot};
use crate::log::{OrderedLog, StartFrom};
use crate::notary::{
    IngestionStats, IngestionSupervisor, Notary, NotaryError, NotarySettings, TransactionValidator,
};
use std::sync::Arc;
use tokio::task::JoinHandle;

/// Memo attached to topics the notary creates
pub const TOPIC_MEMO: &str = "consensus notary";

/// Builder for a running `NotaryService`
pub struct NotaryServiceBuilder {
    log: Arc<dyn OrderedLog>,
    signer: Arc<dyn TransactionSigner>,
    settings: NotarySettings,
    validator: Option<Box<dyn TransactionValidator>>,
    snapshot: Option<LedgerSnapshot>,
}

impl NotaryServiceBuilder {
    /// Run application checks before announcing spends
    pub fn validator(mut self, validator: Box<dyn TransactionValidator>) -> Self {
        self.validator = Some(validator);
        self
    }

    /// Start from a saved ledger and resume the log right after its watermark
    pub fn resume_from(mut self, snapshot: LedgerSnapshot) -> Self {
        self.snapshot = Some(snapshot);
        self
    }

    /// Create the topic if needed, subscribe, and start ingesting.
    ///
    /// A fresh ledger subscribes from "now": history before startup is not
    /// replayed, and the ledger is anchored at the log head seen by that
    /// first subscription. Returns only once the subscription is established,
    /// so a spend published afterwards is always observed, even across a
    /// reconnect that happens before anything is ingested.
    pub async fn start(self) -> Result<NotaryService, NotaryError> {
        self.settings.validate()?;

        let topic = match self.settings.topic {
            Some(topic) => topic,
            None => {
                let submit_key = self.settings.submit_key.as_ref().map(|k| k.public_key());
                let topic = self
                    .log
                    .create_topic(TOPIC_MEMO, submit_key)
                    .await
                    .map_err(NotaryError::TopicCreation)?;
                tracing::info!(%topic, "created consensus topic");
                topic
            }
        };

        let (ledger, start) = match self.snapshot {
            Some(snapshot) => {
                let start = snapshot
                    .watermark()
                    .map(StartFrom::After)
                    .unwrap_or(StartFrom::Now);
                tracing::info!(
                    watermark = ?snapshot.watermark(),
                    destroyed = snapshot.len(),
                    "restoring conflict ledger"
                );
                (ConflictLedger::restore(snapshot), start)
            }
            None => (ConflictLedger::new(), StartFrom::Now),
        };
        let ledger = Arc::new(ledger);

        let mut notary = Notary::new(
            self.log.clone(),
            self.signer,
            ledger.clone(),
            topic,
            self.settings.clone(),
        );
        if let Some(validator) = self.validator {
            notary = notary.with_validator(validator);
        }

        let supervisor =
            IngestionSupervisor::new(self.log, ledger, topic, notary.shutdown_token())
                .with_backoff(self.settings.backoff)
                .with_buffer(self.settings.subscription_buffer);
        let ingestion_stats = supervisor.stats();

        let first = supervisor
            .connect(start)
            .await
            .map_err(NotaryError::Subscribe)?;
        let ingestion = supervisor.spawn(first, start);

        Ok(NotaryService {
            notary: Arc::new(notary),
            ingestion,
            ingestion_stats,
        })
    }
}

/// A notary with a running ingestion task
pub struct NotaryService {
    notary: Arc<Notary>,
    ingestion: JoinHandle<()>,
    ingestion_stats: Arc<IngestionStats>,
}

impl NotaryService {
    pub fn builder(
        log: Arc<dyn OrderedLog>,
        signer: Arc<dyn TransactionSigner>,
        settings: NotarySettings,
    ) -> NotaryServiceBuilder {
        NotaryServiceBuilder {
            log,
            signer,
            settings,
            validator: None,
            snapshot: None,
        }
    }

    /// Shared handle for request paths
    pub fn notary(&self) -> Arc<Notary> {
        self.notary.clone()
    }

    pub fn ingestion_stats(&self) -> &IngestionStats {
        &self.ingestion_stats
    }

    /// Cancel in-flight waits, stop ingestion and wait for it to finish
    pub async fn stop(self) {
        self.notary.shutdown();
        if let Err(e) = self.ingestion.await {
            tracing::error!(error = %e, "ingestion task failed");
        }
    }
}
