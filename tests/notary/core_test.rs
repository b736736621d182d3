use consensus_notary::identity::{Keypair, KeypairSigner, Signer, TransactionSigner};
use consensus_notary::ledger::ConflictLedger;
use consensus_notary::log::{InMemoryLog, LogError, LogPosition, OrderedLog, TopicId};
use consensus_notary::notary::{
    ConsumedStateType, Notary, NotaryError, NotaryService, NotarySettings, TransactionValidator,
    Verdict, TOPIC_MEMO,
};
use consensus_notary::spend::{
    CandidateTransaction, CodecError, SpendRecord, SpendRecordCodec, StateRef, TxId,
    DEFAULT_MAX_MESSAGE_SIZE,
};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

fn tx(label: &str) -> TxId {
    TxId::digest(label.as_bytes())
}

fn state(label: &str, index: u32) -> StateRef {
    StateRef::new(tx(label), index)
}

fn fast_settings() -> NotarySettings {
    NotarySettings::new()
        .with_poll_interval(Duration::from_millis(20))
        .with_wait_timeout(Some(Duration::from_secs(5)))
}

async fn start_service(
    log: &Arc<InMemoryLog>,
    settings: NotarySettings,
) -> (NotaryService, Keypair) {
    let keypair = Keypair::generate();
    let service = NotaryService::builder(
        log.clone(),
        Arc::new(KeypairSigner::new(keypair.clone())),
        settings,
    )
    .start()
    .await
    .unwrap();
    (service, keypair)
}

/// Test: First spender is approved, the double-spender is rejected naming the first
#[tokio::test]
async fn test_double_spend_rejected() {
    let log = Arc::new(InMemoryLog::new());
    let (service, keypair) = start_service(&log, fast_settings()).await;
    let notary = service.notary();

    let a0 = state("A", 0);
    let b0 = state("B", 0);
    let t1 = CandidateTransaction::new(tx("T1"), vec![a0], vec![]);
    let t2 = CandidateTransaction::new(tx("T2"), vec![a0, b0], vec![]);

    let v1 = notary.notarize(&t1).await.unwrap();
    let sig = v1.signature().expect("T1 should be approved");
    assert_eq!(sig.tx_id(), &tx("T1"));
    assert_eq!(sig.by(), &keypair.public_key());
    assert!(sig.verify());
    assert!(Signer::verify(&keypair.public_key(), tx("T1").as_bytes(), sig.signature()));

    let v2 = notary.notarize(&t2).await.unwrap();
    let report = v2.conflicts().expect("T2 should be rejected");
    assert_eq!(report.tx_id(), &tx("T2"));
    assert_eq!(report.len(), 1);
    let consumption = report.get(&a0).unwrap();
    assert_eq!(consumption.consumed_by(), &tx("T1"));
    assert_eq!(consumption.kind(), ConsumedStateType::InputState);
    assert!(report.get(&b0).is_none());

    // T2's announcement still destroyed B(0)
    assert_eq!(
        notary.ledger().destruction(&b0).unwrap().destroyed_by(),
        &tx("T2")
    );

    let stats = notary.stats();
    assert_eq!((stats.approved, stats.rejected, stats.failed), (1, 1, 0));
    service.stop().await;
}

/// Test: Resubmitting an approved transaction is approved again
#[tokio::test]
async fn test_resubmission_idempotent() {
    let log = Arc::new(InMemoryLog::new());
    let (service, _) = start_service(&log, fast_settings()).await;
    let notary = service.notary();

    let t1 = CandidateTransaction::new(tx("T1"), vec![state("A", 0), state("A", 1)], vec![]);

    assert!(notary.notarize(&t1).await.unwrap().is_approved());
    assert!(notary.notarize(&t1).await.unwrap().is_approved());
    assert_eq!(log.message_count(notary.topic()), 2);
    service.stop().await;
}

/// Test: Referencing a consumed state is a reference conflict; referencing a live one is fine
#[tokio::test]
async fn test_reference_conflicts() {
    let log = Arc::new(InMemoryLog::new());
    let (service, _) = start_service(&log, fast_settings()).await;
    let notary = service.notary();

    let a0 = state("A", 0);
    let r0 = state("R", 0);

    let t1 = CandidateTransaction::new(tx("T1"), vec![a0], vec![r0]);
    assert!(notary.notarize(&t1).await.unwrap().is_approved());
    assert!(
        notary.ledger().destruction(&r0).is_none(),
        "references are not consumed"
    );

    let t3 = CandidateTransaction::new(tx("T3"), vec![state("C", 0)], vec![a0]);
    let verdict = notary.notarize(&t3).await.unwrap();
    let report = verdict.conflicts().unwrap();
    assert_eq!(report.get(&a0).unwrap().consumed_by(), &tx("T1"));
    assert_eq!(
        report.get(&a0).unwrap().kind(),
        ConsumedStateType::ReferenceInputState
    );
    service.stop().await;
}

/// Test: A transaction that consumes and references the same state conflicts with itself
#[tokio::test]
async fn test_self_reference_conflict() {
    let log = Arc::new(InMemoryLog::new());
    let (service, _) = start_service(&log, fast_settings()).await;
    let notary = service.notary();

    let a0 = state("A", 0);
    let t1 = CandidateTransaction::new(tx("T1"), vec![a0], vec![a0]);

    let verdict = notary.notarize(&t1).await.unwrap();
    let consumption = *verdict.conflicts().unwrap().get(&a0).unwrap();
    assert_eq!(consumption.consumed_by(), &tx("T1"));
    assert_eq!(consumption.kind(), ConsumedStateType::ReferenceInputState);
    service.stop().await;
}

/// Test: Racing transactions are ordered by the log; exactly one wins
#[tokio::test]
async fn test_concurrent_race_has_one_winner() {
    let log = Arc::new(InMemoryLog::new());
    let (service, _) = start_service(&log, fast_settings()).await;
    let notary = service.notary();

    let a0 = state("A", 0);
    let t1 = CandidateTransaction::new(tx("T1"), vec![a0], vec![]);
    let t2 = CandidateTransaction::new(tx("T2"), vec![a0], vec![]);

    let (v1, v2) = tokio::join!(notary.notarize(&t1), notary.notarize(&t2));
    let (v1, v2) = (v1.unwrap(), v2.unwrap());

    assert_ne!(v1.is_approved(), v2.is_approved(), "exactly one must win");

    let winner = *notary.ledger().destruction(&a0).unwrap().destroyed_by();
    let loser = if v1.is_approved() { &v2 } else { &v1 };
    assert_eq!(
        loser.conflicts().unwrap().get(&a0).unwrap().consumed_by(),
        &winner
    );
    service.stop().await;
}

/// Test: Spends announced by another notary on the same topic are honored
#[tokio::test]
async fn test_foreign_announcement_conflicts() {
    let log = Arc::new(InMemoryLog::new());
    let (service, _) = start_service(&log, fast_settings()).await;
    let notary = service.notary();
    let a0 = state("A", 0);

    let foreign = SpendRecord::new(tx("X"), vec![a0], vec![]);
    let payload = SpendRecordCodec::encode(&foreign, DEFAULT_MAX_MESSAGE_SIZE).unwrap();
    log.publish(notary.topic(), payload, None).await.unwrap();

    let t1 = CandidateTransaction::new(tx("T1"), vec![a0], vec![]);
    let verdict = notary.notarize(&t1).await.unwrap();

    assert_eq!(
        verdict.conflicts().unwrap().get(&a0).unwrap().consumed_by(),
        &tx("X")
    );
    service.stop().await;
}

/// Test: A failed publish surfaces as an error and is not retried
#[tokio::test]
async fn test_publish_failure() {
    let log = Arc::new(InMemoryLog::new());
    let (service, _) = start_service(&log, fast_settings()).await;
    let notary = service.notary();
    let t1 = CandidateTransaction::new(tx("T1"), vec![state("A", 0)], vec![]);

    log.fail_next_publish();
    let result = notary.notarize(&t1).await;

    assert!(matches!(
        result,
        Err(NotaryError::Publish(LogError::PublishRejected(_)))
    ));
    assert_eq!(log.message_count(notary.topic()), 0);
    assert_eq!(notary.stats().failed, 1);

    // The caller may try again
    assert!(notary.notarize(&t1).await.unwrap().is_approved());
    service.stop().await;
}

/// Test: A record too big for one log message is refused before publishing
#[tokio::test]
async fn test_record_too_large() {
    let log = Arc::new(InMemoryLog::new());
    let (service, _) = start_service(&log, fast_settings()).await;
    let notary = service.notary();

    let inputs: Vec<StateRef> = (0..28).map(|i| state("A", i)).collect();
    let big = CandidateTransaction::new(tx("BIG"), inputs, vec![]);

    assert!(matches!(
        notary.notarize(&big).await,
        Err(NotaryError::Encoding(CodecError::TooLarge { needed: 1048, limit: 1024 }))
    ));
    assert_eq!(log.message_count(notary.topic()), 0);
    service.stop().await;
}

struct RejectEverything;

impl TransactionValidator for RejectEverything {
    fn validate(&self, _txn: &CandidateTransaction) -> Result<(), String> {
        Err("missing witness".to_string())
    }
}

/// Test: Validation failures stop the transaction before anything is announced
#[tokio::test]
async fn test_validator_rejection() {
    let log = Arc::new(InMemoryLog::new());
    let service = NotaryService::builder(
        log.clone(),
        Arc::new(KeypairSigner::new(Keypair::generate())),
        fast_settings(),
    )
    .validator(Box::new(RejectEverything))
    .start()
    .await
    .unwrap();
    let notary = service.notary();

    let t1 = CandidateTransaction::new(tx("T1"), vec![state("A", 0)], vec![]);
    match notary.notarize(&t1).await {
        Err(NotaryError::InvalidTransaction { reason, .. }) => {
            assert_eq!(reason, "missing witness")
        }
        other => panic!("expected validation failure, got {:?}", other),
    }
    assert_eq!(log.message_count(notary.topic()), 0);
    service.stop().await;
}

/// Test: With a submit key the topic is created guarded and publishes are signed
#[tokio::test]
async fn test_submit_key_topic() {
    let log = Arc::new(InMemoryLog::new());
    let submit_key = Keypair::generate();
    let (service, _) =
        start_service(&log, fast_settings().with_submit_key(submit_key.clone())).await;
    let notary = service.notary();

    assert_eq!(log.topic_memo(notary.topic()).as_deref(), Some(TOPIC_MEMO));

    // Unsigned foreign publishes are refused by the guarded topic
    assert_eq!(
        log.publish(notary.topic(), vec![0; 40], None).await,
        Err(LogError::Unauthorized(notary.topic()))
    );

    let t1 = CandidateTransaction::new(tx("T1"), vec![state("A", 0)], vec![]);
    assert!(notary.notarize(&t1).await.unwrap().is_approved());
    service.stop().await;
}

/// Test: A configured topic is used as-is
#[tokio::test]
async fn test_configured_topic_used() {
    let log = Arc::new(InMemoryLog::new());
    let topic = log.create_topic("existing", None).await.unwrap();
    let (service, _) = start_service(&log, fast_settings().with_topic(topic)).await;

    assert_eq!(service.notary().topic(), topic);
    service.stop().await;
}

fn detached_notary(log: &Arc<InMemoryLog>, topic: TopicId, settings: NotarySettings) -> Notary {
    Notary::new(
        log.clone(),
        Arc::new(KeypairSigner::new(Keypair::generate())),
        Arc::new(ConflictLedger::new()),
        topic,
        settings,
    )
}

/// Test: Without ingestion the wait ends in a timeout, not a verdict
#[tokio::test]
async fn test_wait_times_out() {
    let log = Arc::new(InMemoryLog::new());
    let topic = log.create_topic("t", None).await.unwrap();
    let notary = detached_notary(
        &log,
        topic,
        NotarySettings::new()
            .with_poll_interval(Duration::from_millis(20))
            .with_wait_timeout(Some(Duration::from_millis(200))),
    );

    let t1 = CandidateTransaction::new(tx("T1"), vec![state("A", 0)], vec![]);
    match notary.notarize(&t1).await {
        Err(NotaryError::WaitTimedOut { target, watermark }) => {
            assert_eq!(target, LogPosition::new(1));
            assert_eq!(watermark, None);
        }
        other => panic!("expected timeout, got {:?}", other),
    }
}

/// Test: Cancelling a wait is reported distinctly from a timeout
#[tokio::test]
async fn test_wait_cancelled() {
    let log = Arc::new(InMemoryLog::new());
    let topic = log.create_topic("t", None).await.unwrap();
    let notary = detached_notary(
        &log,
        topic,
        NotarySettings::new()
            .with_poll_interval(Duration::from_millis(20))
            .with_wait_timeout(None),
    );

    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(100)).await;
        trigger.cancel();
    });

    let t1 = CandidateTransaction::new(tx("T1"), vec![state("A", 0)], vec![]);
    assert!(matches!(
        notary.notarize_with_cancel(&t1, cancel).await,
        Err(NotaryError::Cancelled(p)) if p == LogPosition::new(1)
    ));
}

/// Test: Shutting the notary down cancels in-flight waits
#[tokio::test]
async fn test_shutdown_cancels_waits() {
    let log = Arc::new(InMemoryLog::new());
    let topic = log.create_topic("t", None).await.unwrap();
    let notary = Arc::new(detached_notary(
        &log,
        topic,
        NotarySettings::new()
            .with_poll_interval(Duration::from_millis(20))
            .with_wait_timeout(None),
    ));

    let waiting = notary.clone();
    let task = tokio::spawn(async move {
        let t1 = CandidateTransaction::new(tx("T1"), vec![state("A", 0)], vec![]);
        waiting.notarize(&t1).await
    });

    tokio::time::sleep(Duration::from_millis(100)).await;
    notary.shutdown();

    assert!(matches!(task.await.unwrap(), Err(NotaryError::Cancelled(_))));
}

/// Test: The wait wakes as soon as the ledger catches up
#[tokio::test]
async fn test_wait_wakes_on_watermark() {
    let log = Arc::new(InMemoryLog::new());
    let topic = log.create_topic("t", None).await.unwrap();
    let notary = detached_notary(
        &log,
        topic,
        NotarySettings::new()
            .with_poll_interval(Duration::from_secs(60))
            .with_wait_timeout(Some(Duration::from_secs(5))),
    );

    let ledger = notary.ledger().clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        ledger.mark_skipped(LogPosition::new(3));
    });

    let cancel = CancellationToken::new();
    tokio::time::timeout(
        Duration::from_secs(2),
        notary.wait_until_applied(LogPosition::new(3), &cancel),
    )
    .await
    .expect("wait should end on the watermark signal, not the poll")
    .unwrap();
}

/// Test: Invalid settings are refused at startup
#[tokio::test]
async fn test_invalid_settings_refused() {
    let log = Arc::new(InMemoryLog::new());
    let result = NotaryService::builder(
        log.clone(),
        Arc::new(KeypairSigner::new(Keypair::generate())),
        NotarySettings::new().with_poll_interval(Duration::ZERO),
    )
    .start()
    .await;

    assert!(matches!(result, Err(NotaryError::InvalidConfig(_))));
}

/// Test: Approval signatures come from the injected signer
#[tokio::test]
async fn test_signer_public_key_in_verdict() {
    let log = Arc::new(InMemoryLog::new());
    let signer = Arc::new(KeypairSigner::new(Keypair::generate()));
    let expected = signer.public_key();
    let service = NotaryService::builder(log.clone(), signer, fast_settings())
        .start()
        .await
        .unwrap();

    let t1 = CandidateTransaction::new(tx("T1"), vec![state("A", 0)], vec![]);
    match service.notary().notarize(&t1).await.unwrap() {
        Verdict::Approved(sig) => assert_eq!(sig.by(), &expected),
        Verdict::Rejected(report) => panic!("unexpected conflicts: {}", report),
    }
    service.stop().await;
}
