use std::{sync::Arc, time::Duration};

use inj_liquidity_bot::{
    config::WalletConfig,
    errors::BotError,
    pause::RecordingPause,
    submitter::{BatchSubmitter, RetryPolicy, SubmitOutcome},
    testing::{
        rejected_response, sequence_mismatch_response, success_response, unit_meta, EchoSigner,
        ScriptedBroadcaster, StaticAccounts, TEST_PRIVATE_KEY,
    },
    types::{MarketKind, OrderBatch, OrderIntent, Side},
    wallet::{SessionDeps, SessionOptions, WalletSession},
    Sequence,
};
use serde_json::json;
use tokio::sync::Mutex;

struct Harness {
    session: Mutex<WalletSession>,
    accounts: Arc<StaticAccounts>,
    transport: Arc<ScriptedBroadcaster>,
    signer: Arc<EchoSigner>,
    pause: Arc<RecordingPause>,
}

impl Harness {
    async fn new(script: Vec<inj_liquidity_bot::Result<serde_json::Value>>) -> Self {
        let accounts = Arc::new(StaticAccounts::new(42, 7));
        let transport = Arc::new(ScriptedBroadcaster::with_script(script));
        let signer = Arc::new(EchoSigner::new());
        let pause = Arc::new(RecordingPause::new());
        let wallet = WalletConfig {
            id: "1".into(),
            name: "wallet_1".into(),
            private_key: TEST_PRIVATE_KEY.into(),
            enabled: true,
        };
        let session = WalletSession::initialize(
            &wallet,
            SessionDeps {
                accounts: accounts.clone(),
                transport: transport.clone(),
                signer: signer.clone(),
                pause: pause.clone(),
            },
            SessionOptions {
                chain_id: "injective-888".into(),
                gas_limit: 2_000_000,
                fee_denom: "inj".into(),
                refresh_throttle: Duration::from_secs(2),
                settle_delay: Duration::ZERO,
            },
        )
        .await
        .unwrap();
        Self {
            session: Mutex::new(session),
            accounts,
            transport,
            signer,
            pause,
        }
    }

    fn submitter(&self, policy: RetryPolicy) -> BatchSubmitter {
        BatchSubmitter::new(policy, self.pause.clone())
    }

    /// Backoff and cool-down delays; zero settle delays are dropped.
    fn delays(&self) -> Vec<Duration> {
        self.pause
            .delays()
            .into_iter()
            .filter(|delay| !delay.is_zero())
            .collect()
    }
}

fn policy() -> RetryPolicy {
    RetryPolicy {
        max_attempts: 3,
        base_backoff: Duration::from_millis(500),
        timeout_multiplier: 2.0,
        max_jitter: Duration::ZERO,
        sequence_threshold: 5,
        cooldown: Duration::from_secs(5),
    }
}

fn batch() -> OrderBatch {
    let meta = unit_meta("0xmarket");
    let mut batch = OrderBatch::new(MarketKind::Derivative);
    for (side, price) in [(Side::Buy, 99.5), (Side::Sell, 100.5)] {
        batch.creates.push(OrderIntent {
            market_id: meta.market_id.clone(),
            side,
            price,
            quantity: 1.0,
            margin: Some(price * 0.1),
        });
    }
    batch
}

#[tokio::test]
async fn test_success_sends_exactly_one_transaction() {
    let harness = Harness::new(vec![Ok(success_response("HASH1"))]).await;
    let submitter = harness.submitter(policy());

    let outcome = submitter
        .submit(&harness.session, &unit_meta("0xmarket"), &batch())
        .await;

    assert_eq!(
        outcome,
        SubmitOutcome::Success {
            tx_hash: "HASH1".into(),
            attempts: 1
        }
    );
    assert_eq!(harness.transport.calls(), 1);
    assert_eq!(harness.signer.signed_sequences(), vec![Sequence::new(42)]);
    assert_eq!(harness.session.lock().await.sequence(), Sequence::new(43));
    assert!(harness.delays().is_empty());

    let stats = submitter.stats();
    assert_eq!(stats.batches_succeeded, 1);
    assert_eq!(stats.orders_placed, 2);
}

#[tokio::test]
async fn test_camel_case_response_counts_as_success() {
    let harness = Harness::new(vec![Ok(json!({
        "txResponse": {"txhash": "CAMEL", "code": 0, "rawLog": ""}
    }))])
    .await;
    let outcome = harness
        .submitter(policy())
        .submit(&harness.session, &unit_meta("0xmarket"), &batch())
        .await;
    assert!(outcome.is_success());
    assert_eq!(harness.transport.calls(), 1);
}

#[tokio::test]
async fn test_sequence_errors_recreate_before_each_retry() {
    let harness = Harness::new(vec![
        Ok(sequence_mismatch_response(43, 42)),
        Ok(sequence_mismatch_response(43, 42)),
        Ok(sequence_mismatch_response(43, 42)),
    ])
    .await;
    let submitter = harness.submitter(policy());

    let outcome = submitter
        .submit(&harness.session, &unit_meta("0xmarket"), &batch())
        .await;

    assert!(matches!(outcome, SubmitOutcome::GaveUp { attempts: 3, .. }));
    assert_eq!(harness.transport.calls(), 3);

    let session = harness.session.lock().await;
    assert_eq!(session.recreate_count(), 2);
    assert_eq!(session.broadcaster().generation(), 2);
    // Initial fetch plus one per recreation.
    assert_eq!(harness.accounts.fetches(), 3);
    assert_eq!(
        harness.delays(),
        vec![Duration::from_millis(500), Duration::from_millis(1000)]
    );
    assert_eq!(submitter.stats().sequence_errors, 3);
}

#[tokio::test]
async fn test_recreation_picks_up_chain_sequence() {
    let harness = Harness::new(vec![Ok(sequence_mismatch_response(50, 42))]).await;
    harness.accounts.set_sequence(50);

    let outcome = harness
        .submitter(policy())
        .submit(&harness.session, &unit_meta("0xmarket"), &batch())
        .await;

    assert_eq!(outcome.attempts(), 2);
    assert_eq!(
        harness.signer.signed_sequences(),
        vec![Sequence::new(42), Sequence::new(50)]
    );
    assert_eq!(harness.session.lock().await.sequence(), Sequence::new(51));
}

#[tokio::test]
async fn test_timeout_backs_off_longer_than_sequence_error() {
    let timeout = Harness::new(vec![Err(BotError::TransactionTimeout(
        "broadcast timed out".into(),
    ))])
    .await;
    let sequence = Harness::new(vec![Ok(sequence_mismatch_response(43, 42))]).await;

    for harness in [&timeout, &sequence] {
        let outcome = harness
            .submitter(policy())
            .submit(&harness.session, &unit_meta("0xmarket"), &batch())
            .await;
        assert_eq!(outcome.attempts(), 2);
        assert_eq!(harness.session.lock().await.recreate_count(), 1);
    }

    assert_eq!(timeout.delays(), vec![Duration::from_millis(1000)]);
    assert_eq!(sequence.delays(), vec![Duration::from_millis(500)]);
}

#[tokio::test]
async fn test_sequence_threshold_triggers_cooldown_and_forced_refresh() {
    let harness = Harness::new(vec![
        Ok(sequence_mismatch_response(43, 42)),
        Ok(sequence_mismatch_response(43, 42)),
        Ok(sequence_mismatch_response(43, 42)),
    ])
    .await;
    let submitter = harness.submitter(RetryPolicy {
        sequence_threshold: 2,
        ..policy()
    });

    let outcome = submitter
        .submit(&harness.session, &unit_meta("0xmarket"), &batch())
        .await;

    assert!(matches!(outcome, SubmitOutcome::GaveUp { attempts: 3, .. }));
    assert_eq!(
        harness.delays(),
        vec![
            Duration::from_millis(500),
            Duration::from_secs(5),
            Duration::from_millis(1000),
        ]
    );
    assert_eq!(submitter.stats().cooldowns, 1);
    assert_eq!(submitter.consecutive_sequence_errors(), 0);
    // Initial fetch, two recreations and the forced refresh.
    assert_eq!(harness.accounts.fetches(), 4);
}

#[tokio::test]
async fn test_other_failure_gets_a_single_retry() {
    let harness = Harness::new(vec![
        Ok(rejected_response(5, "insufficient funds")),
        Ok(rejected_response(5, "insufficient funds")),
    ])
    .await;
    let submitter = harness.submitter(policy());

    let outcome = submitter
        .submit(&harness.session, &unit_meta("0xmarket"), &batch())
        .await;

    match outcome {
        SubmitOutcome::GaveUp {
            failure,
            reason,
            attempts,
        } => {
            assert_eq!(failure, "other");
            assert!(reason.contains("insufficient funds"));
            assert_eq!(attempts, 2);
        }
        other => panic!("unexpected outcome {other:?}"),
    }
    assert_eq!(harness.session.lock().await.recreate_count(), 0);
    assert_eq!(submitter.stats().orders_failed, 2);
}

#[tokio::test]
async fn test_empty_batch_is_skipped() {
    let harness = Harness::new(vec![]).await;
    let outcome = harness
        .submitter(policy())
        .submit(
            &harness.session,
            &unit_meta("0xmarket"),
            &OrderBatch::new(MarketKind::Derivative),
        )
        .await;
    assert_eq!(outcome, SubmitOutcome::Skipped);
    assert_eq!(harness.transport.calls(), 0);
}

#[tokio::test]
async fn test_concurrent_submits_on_one_wallet_are_serialized() {
    let harness = Harness::new(vec![Ok(sequence_mismatch_response(42, 41))]).await;
    let submitter = harness.submitter(policy());
    let meta = unit_meta("0xmarket");
    let (first, second) = (batch(), batch());

    let (a, b) = tokio::join!(
        submitter.submit(&harness.session, &meta, &first),
        submitter.submit(&harness.session, &meta, &second),
    );
    assert!(a.is_success());
    assert!(b.is_success());

    // The first batch retries at 42 after its mismatch; the second only
    // starts once the first has advanced the session.
    let signed = harness.signer.signed_sequences();
    assert_eq!(
        signed,
        vec![Sequence::new(42), Sequence::new(42), Sequence::new(43)]
    );
    assert!(signed.windows(2).all(|pair| pair[0] <= pair[1]));

    let sent = harness.transport.sent();
    assert_eq!(sent.len(), 3);
    assert!(sent[0].starts_with("tx:42:"));
    assert!(sent[1].starts_with("tx:42:"));
    assert!(sent[2].starts_with("tx:43:"));
    assert_eq!(harness.session.lock().await.sequence(), Sequence::new(44));
}
