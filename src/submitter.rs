//! Sequence-safe batch submission.
//!
//! One cycle's creates and cancels go out as a single transaction under the
//! wallet's mutex. Failures are classified as sequence, timeout or other and
//! retried with the shared [`RetryPolicy`].

use std::{
    fmt,
    sync::{
        atomic::{AtomicU32, Ordering},
        Arc, Mutex as StdMutex,
    },
    time::Duration,
};

use rand::Rng;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::Mutex;
use tracing::{error, info, warn};

use crate::{
    chain::{compose_batch_update, json_u64},
    config::RetryConfig,
    errors::{error_from_raw_log, BotError, BroadcastFailure, Result},
    market::MarketMeta,
    pause::Pause,
    types::OrderBatch,
    wallet::WalletSession,
};

/// Backoff schedule and limits shared by every submitter.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_backoff: Duration,
    pub timeout_multiplier: f64,
    pub max_jitter: Duration,
    pub sequence_threshold: u32,
    pub cooldown: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&RetryConfig::default())
    }
}

impl RetryPolicy {
    pub fn from_config(config: &RetryConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            base_backoff: Duration::from_millis(config.base_backoff_ms),
            timeout_multiplier: config.timeout_backoff_multiplier,
            max_jitter: Duration::from_millis(config.max_jitter_ms),
            sequence_threshold: config.consecutive_sequence_threshold.max(1),
            cooldown: Duration::from_secs(config.cooldown_secs),
        }
    }

    /// Deterministic delay before retry `retry` (1-based): the base doubles per
    /// retry and timeouts are stretched by the timeout multiplier.
    pub fn backoff(&self, failure: BroadcastFailure, retry: u32) -> Duration {
        self.scaled(failure, retry, Duration::ZERO)
    }

    /// [`Self::backoff`] with up to `max_jitter` of random extra delay, applied
    /// before the timeout stretch.
    pub fn delay(&self, failure: BroadcastFailure, retry: u32) -> Duration {
        let jitter_ms = self.max_jitter.as_millis() as u64;
        let jitter = if jitter_ms == 0 {
            Duration::ZERO
        } else {
            Duration::from_millis(rand::thread_rng().gen_range(0..=jitter_ms))
        };
        self.scaled(failure, retry, jitter)
    }

    fn scaled(&self, failure: BroadcastFailure, retry: u32, jitter: Duration) -> Duration {
        let exponent = retry.saturating_sub(1).min(16);
        let base = self.base_backoff * 2u32.pow(exponent) + jitter;
        match failure {
            BroadcastFailure::Timeout => base.mul_f64(self.timeout_multiplier),
            BroadcastFailure::Sequence | BroadcastFailure::Other => base,
        }
    }
}

/// Normalized broadcast result. Nodes and gateways nest the payload under
/// `tx_response`, `txResponse`, `result`, or return it at the top level.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct TxOutcome {
    pub tx_hash: Option<String>,
    pub code: u32,
    pub raw_log: String,
}

impl TxOutcome {
    pub fn from_response(response: &Value) -> Result<Self> {
        let node = ["tx_response", "txResponse"]
            .iter()
            .find_map(|key| response.get(*key))
            .or_else(|| {
                response.get("result").map(|result| {
                    result
                        .get("tx_response")
                        .or_else(|| result.get("txResponse"))
                        .unwrap_or(result)
                })
            })
            .unwrap_or(response);

        if !node.is_object() {
            return Err(BotError::InvalidResponse(format!(
                "unexpected broadcast response: {response}"
            )));
        }

        let tx_hash = ["txhash", "txHash", "hash"]
            .iter()
            .find_map(|key| node.get(*key).and_then(Value::as_str))
            .filter(|hash| !hash.is_empty())
            .map(str::to_string);
        let code = match node.get("code") {
            None | Some(Value::Null) => 0,
            Some(raw) => json_u64(Some(raw))
                .and_then(|code| u32::try_from(code).ok())
                .ok_or_else(|| {
                    BotError::InvalidResponse(format!("invalid response code {raw}"))
                })?,
        };
        let raw_log = ["raw_log", "rawLog", "log"]
            .iter()
            .find_map(|key| node.get(*key).and_then(Value::as_str))
            .unwrap_or_default()
            .to_string();

        Ok(Self {
            tx_hash,
            code,
            raw_log,
        })
    }

    /// Zero code and a transaction hash.
    pub fn is_success(&self) -> bool {
        self.code == 0 && self.tx_hash.is_some()
    }

    pub fn into_result(self) -> Result<String> {
        match self.tx_hash {
            Some(hash) if self.code == 0 => Ok(hash),
            Some(hash) => Err(error_from_raw_log(self.code, &self.raw_log, &hash)),
            None if self.code != 0 => Err(error_from_raw_log(self.code, &self.raw_log, "")),
            None => Err(BotError::InvalidResponse(
                "broadcast response carries no transaction hash".into(),
            )),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum SubmitOutcome {
    Success { tx_hash: String, attempts: u32 },
    GaveUp { failure: String, reason: String, attempts: u32 },
    Skipped,
}

impl SubmitOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, SubmitOutcome::Success { .. })
    }

    pub fn attempts(&self) -> u32 {
        match self {
            SubmitOutcome::Success { attempts, .. } | SubmitOutcome::GaveUp { attempts, .. } => {
                *attempts
            }
            SubmitOutcome::Skipped => 0,
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct SubmitStats {
    pub batches_submitted: u64,
    pub batches_succeeded: u64,
    pub batches_failed: u64,
    pub orders_placed: u64,
    pub orders_failed: u64,
    pub cancels_sent: u64,
    pub sequence_errors: u64,
    pub timeout_errors: u64,
    pub other_errors: u64,
    pub recreations: u64,
    pub cooldowns: u64,
}

impl SubmitStats {
    fn record_failure(&mut self, failure: BroadcastFailure) {
        match failure {
            BroadcastFailure::Sequence => self.sequence_errors += 1,
            BroadcastFailure::Timeout => self.timeout_errors += 1,
            BroadcastFailure::Other => self.other_errors += 1,
        }
    }
}

impl fmt::Display for SubmitStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "batches {}/{} ok ({} failed), orders placed {} failed {}, cancels {}, \
             errors seq {} timeout {} other {}, recreations {}, cooldowns {}",
            self.batches_succeeded,
            self.batches_submitted,
            self.batches_failed,
            self.orders_placed,
            self.orders_failed,
            self.cancels_sent,
            self.sequence_errors,
            self.timeout_errors,
            self.other_errors,
            self.recreations,
            self.cooldowns
        )
    }
}

/// Submits batches for one wallet. The consecutive sequence error counter
/// spans submissions.
pub struct BatchSubmitter {
    policy: RetryPolicy,
    pause: Arc<dyn Pause>,
    consecutive_sequence_errors: AtomicU32,
    stats: StdMutex<SubmitStats>,
}

impl BatchSubmitter {
    pub fn new(policy: RetryPolicy, pause: Arc<dyn Pause>) -> Self {
        Self {
            policy,
            pause,
            consecutive_sequence_errors: AtomicU32::new(0),
            stats: StdMutex::new(SubmitStats::default()),
        }
    }

    pub fn stats(&self) -> SubmitStats {
        self.stats
            .lock()
            .map(|stats| stats.clone())
            .unwrap_or_default()
    }

    pub fn consecutive_sequence_errors(&self) -> u32 {
        self.consecutive_sequence_errors.load(Ordering::SeqCst)
    }

    fn update_stats(&self, update: impl FnOnce(&mut SubmitStats)) {
        if let Ok(mut stats) = self.stats.lock() {
            update(&mut stats);
        }
    }

    /// Sends `batch` as one transaction, holding the wallet mutex for the whole
    /// attempt sequence. All-or-nothing: a give-up fails every intent.
    pub async fn submit(
        &self,
        session: &Mutex<WalletSession>,
        meta: &MarketMeta,
        batch: &OrderBatch,
    ) -> SubmitOutcome {
        if batch.is_empty() {
            return SubmitOutcome::Skipped;
        }

        let mut session = session.lock().await;
        let wallet = session.name().to_string();
        let market = meta.ticker.clone();
        let creates = batch.creates.len() as u64;

        let messages =
            match compose_batch_update(session.address(), session.subaccount_id(), meta, batch) {
                Ok(messages) => messages,
                Err(err) => {
                    error!(%wallet, %market, "failed to compose batch: {err}");
                    return self.give_up(BroadcastFailure::Other, err.to_string(), 0, creates);
                }
            };

        self.update_stats(|stats| stats.batches_submitted += 1);
        let mut other_retry_used = false;
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            let sequence = session.sequence();
            let result = session
                .broadcaster()
                .send(&messages)
                .await
                .and_then(|response| TxOutcome::from_response(&response)?.into_result());

            let err = match result {
                Ok(tx_hash) => {
                    session.advance();
                    self.consecutive_sequence_errors.store(0, Ordering::SeqCst);
                    self.update_stats(|stats| {
                        stats.batches_succeeded += 1;
                        stats.orders_placed += creates;
                        stats.cancels_sent += batch.cancels.len() as u64;
                    });
                    info!(
                        %wallet,
                        %market,
                        %tx_hash,
                        %sequence,
                        creates,
                        cancels = batch.cancels.len(),
                        attempt,
                        "batch accepted"
                    );
                    return SubmitOutcome::Success { tx_hash, attempts: attempt };
                }
                Err(err) => err,
            };

            let failure = err.failure_kind();
            self.update_stats(|stats| stats.record_failure(failure));
            warn!(%wallet, %market, %sequence, attempt, %failure, "batch failed: {err}");

            let exhausted = attempt >= self.policy.max_attempts
                || (failure == BroadcastFailure::Other && other_retry_used);
            if exhausted {
                return self.give_up(failure, err.to_string(), attempt, creates);
            }

            match failure {
                BroadcastFailure::Sequence => {
                    let consecutive =
                        self.consecutive_sequence_errors.fetch_add(1, Ordering::SeqCst) + 1;
                    if consecutive >= self.policy.sequence_threshold {
                        warn!(
                            %wallet,
                            consecutive,
                            "sequence errors over threshold, cooling down for {:?}",
                            self.policy.cooldown
                        );
                        self.update_stats(|stats| stats.cooldowns += 1);
                        self.pause.pause(self.policy.cooldown).await;
                        if let Err(err) = session.refresh(true).await {
                            warn!(%wallet, "forced refresh failed: {err}");
                        }
                        self.consecutive_sequence_errors.store(0, Ordering::SeqCst);
                    }
                    self.recreate(&mut session, &wallet).await;
                }
                BroadcastFailure::Timeout => {
                    self.recreate(&mut session, &wallet).await;
                }
                BroadcastFailure::Other => {
                    other_retry_used = true;
                }
            }

            self.pause.pause(self.policy.delay(failure, attempt)).await;
        }
    }

    async fn recreate(&self, session: &mut WalletSession, wallet: &str) {
        self.update_stats(|stats| stats.recreations += 1);
        if let Err(err) = session.recreate_broadcaster().await {
            warn!(%wallet, "broadcaster recreation failed: {err}");
        }
    }

    fn give_up(
        &self,
        failure: BroadcastFailure,
        reason: String,
        attempts: u32,
        creates: u64,
    ) -> SubmitOutcome {
        self.update_stats(|stats| {
            stats.batches_failed += 1;
            stats.orders_failed += creates;
        });
        error!(attempts, %failure, "giving up on batch: {reason}");
        SubmitOutcome::GaveUp {
            failure: failure.to_string(),
            reason,
            attempts,
        }
    }
}
