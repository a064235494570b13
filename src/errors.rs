use std::fmt;

use thiserror::Error;

use crate::types::{Environment, MarketId};

pub type Result<T> = std::result::Result<T, BotError>;

#[derive(Debug, Error)]
pub enum BotError {
    #[error("account fetch failed: {0}")]
    AccountFetch(String),
    #[error("no price available for market {market} on {environment}")]
    PriceUnavailable {
        market: MarketId,
        environment: Environment,
    },
    #[error("account sequence mismatch (expected {expected:?}, got {got:?})")]
    SequenceMismatch {
        expected: Option<u64>,
        got: Option<u64>,
    },
    #[error("transaction timeout: {0}")]
    TransactionTimeout(String),
    #[error("transaction rejected by chain: {reason} (code: {code}, tx_hash: {tx_hash})")]
    Rejected {
        code: u32,
        reason: String,
        tx_hash: String,
    },
    #[error("network error: {0}")]
    Network(String),
    #[error("signer library error: {0}")]
    Signer(String),
    #[error("unsupported platform {0}")]
    UnsupportedPlatform(String),
    #[error("invalid response: {0}")]
    InvalidResponse(String),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
    #[error(transparent)]
    Reqwest(#[from] reqwest::Error),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Url(#[from] url::ParseError),
    #[error(transparent)]
    Utf8(#[from] std::str::Utf8Error),
    #[error(transparent)]
    Library(#[from] libloading::Error),
    #[error(transparent)]
    CString(#[from] std::ffi::NulError),
}

impl BotError {
    pub fn with_http_status(status: reqwest::StatusCode, path: &str, body: &str) -> Self {
        let mut msg = format!("status code {} from {}", status, path);
        if !body.is_empty() {
            msg.push_str(": ");
            msg.push_str(body);
        }
        BotError::Network(msg)
    }

    /// Classifies this error for the retry policy.
    pub fn failure_kind(&self) -> BroadcastFailure {
        match self {
            BotError::SequenceMismatch { .. } => BroadcastFailure::Sequence,
            BotError::TransactionTimeout(_) => BroadcastFailure::Timeout,
            BotError::Rejected { reason, .. } => classify_message(reason),
            other => classify_message(&other.to_string()),
        }
    }
}

/// Retry class of a failed submission.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum BroadcastFailure {
    Sequence,
    Timeout,
    Other,
}

impl fmt::Display for BroadcastFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            BroadcastFailure::Sequence => "sequence",
            BroadcastFailure::Timeout => "timeout",
            BroadcastFailure::Other => "other",
        };
        f.write_str(label)
    }
}

const SEQUENCE_MARKERS: &[&str] = &[
    "sequence mismatch",
    "incorrect account sequence",
    "account sequence",
    "invalid sequence",
];

const TIMEOUT_MARKERS: &[&str] = &[
    "timeout height",
    "tx timeout",
    "timed out",
    "deadline has elapsed",
    "context deadline exceeded",
];

/// Substring classifier over chain/node error text. The node does not expose
/// a typed error, so this is pinned to the wording the node emits today.
pub fn classify_message(message: &str) -> BroadcastFailure {
    let lower = message.to_ascii_lowercase();
    if SEQUENCE_MARKERS.iter().any(|marker| lower.contains(marker)) {
        BroadcastFailure::Sequence
    } else if TIMEOUT_MARKERS.iter().any(|marker| lower.contains(marker)) {
        BroadcastFailure::Timeout
    } else {
        BroadcastFailure::Other
    }
}

/// Extracts `(expected, got)` from raw logs such as
/// `account sequence mismatch, expected 12, got 11: incorrect account sequence`.
pub fn parse_sequence_mismatch(message: &str) -> Option<(u64, u64)> {
    let lower = message.to_ascii_lowercase();
    let expected = number_after(&lower, "expected")?;
    let got = number_after(&lower, "got")?;
    Some((expected, got))
}

fn number_after(haystack: &str, marker: &str) -> Option<u64> {
    let start = haystack.find(marker)? + marker.len();
    let digits: String = haystack[start..]
        .chars()
        .skip_while(|c| !c.is_ascii_digit())
        .take_while(|c| c.is_ascii_digit())
        .collect();
    digits.parse().ok()
}

/// Builds the typed error for a failed broadcast from the chain's code and raw log.
pub fn error_from_raw_log(code: u32, raw_log: &str, tx_hash: &str) -> BotError {
    match classify_message(raw_log) {
        BroadcastFailure::Sequence => {
            let parsed = parse_sequence_mismatch(raw_log);
            BotError::SequenceMismatch {
                expected: parsed.map(|(expected, _)| expected),
                got: parsed.map(|(_, got)| got),
            }
        }
        BroadcastFailure::Timeout => BotError::TransactionTimeout(raw_log.to_string()),
        BroadcastFailure::Other => BotError::Rejected {
            code,
            reason: raw_log.to_string(),
            tx_hash: tx_hash.to_string(),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_sequence_messages() {
        assert_eq!(
            classify_message("account sequence mismatch, expected 5, got 4"),
            BroadcastFailure::Sequence
        );
        assert_eq!(
            classify_message("rpc error: Incorrect Account Sequence"),
            BroadcastFailure::Sequence
        );
    }

    #[test]
    fn test_classify_timeout_and_other() {
        assert_eq!(
            classify_message("tx timeout height reached"),
            BroadcastFailure::Timeout
        );
        assert_eq!(
            classify_message("insufficient funds"),
            BroadcastFailure::Other
        );
    }

    #[test]
    fn test_parse_sequence_mismatch() {
        let raw = "account sequence mismatch, expected 12, got 11: incorrect account sequence";
        assert_eq!(parse_sequence_mismatch(raw), Some((12, 11)));
        assert_eq!(parse_sequence_mismatch("incorrect account sequence"), None);
    }

    #[test]
    fn test_error_from_raw_log_maps_kinds() {
        let err = error_from_raw_log(32, "account sequence mismatch, expected 3, got 2", "AB");
        assert!(matches!(
            err,
            BotError::SequenceMismatch {
                expected: Some(3),
                got: Some(2)
            }
        ));
        assert_eq!(err.failure_kind(), BroadcastFailure::Sequence);

        let err = error_from_raw_log(30, "tx timeout height 1200", "AB");
        assert_eq!(err.failure_kind(), BroadcastFailure::Timeout);

        let err = error_from_raw_log(5, "insufficient funds", "AB");
        assert!(matches!(err, BotError::Rejected { code: 5, .. }));
        assert_eq!(err.failure_kind(), BroadcastFailure::Other);
    }

    #[test]
    fn test_network_error_text_is_classified() {
        let err = BotError::Network("request timed out after 15s".into());
        assert_eq!(err.failure_kind(), BroadcastFailure::Timeout);
    }
}
