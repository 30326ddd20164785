//! Oracle gateway: the boundary to the external narrative-analysis service
//!
//! The oracle is an untrusted, possibly slow or malformed remote capability.
//! This module defines the capability trait, the wire contract, wholesale
//! schema validation, an HTTP client, and the bounded retry policy for
//! transient transport failures. Schema failures are deliberately never
//! retried: they indicate a response worth inspecting, not a transient
//! fault.

mod http;
mod scripted;
mod types;
mod validate;

pub use http::HttpOracle;
pub use scripted::ScriptedOracle;
pub use types::{
    ActionVerdict, ChapterAnalysis, CharacterVerdict, MentionState, OracleError, OracleRequest,
    OracleResult,
};
pub use validate::validate_analysis;

use async_trait::async_trait;
use std::time::Duration;
use tokio_retry2::strategy::{jitter, ExponentialBackoff};
use tokio_retry2::{Retry, RetryError};
use tracing::warn;

/// Trait for chapter analysis capabilities
#[async_trait]
pub trait ChapterOracle: Send + Sync {
    /// Analyze one chapter against the supplied market context
    async fn analyze(&self, request: &OracleRequest) -> OracleResult<ChapterAnalysis>;
}

/// Bounded backoff policy for transient oracle failures
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Additional attempts after the first (0 disables retrying)
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
        }
    }
}

/// Call the oracle, retrying transient transport failures with exponential
/// backoff and jitter. Schema violations fail immediately.
pub async fn analyze_with_retry(
    oracle: &dyn ChapterOracle,
    request: &OracleRequest,
    policy: &RetryPolicy,
) -> OracleResult<ChapterAnalysis> {
    let strategy = ExponentialBackoff::from_millis(policy.base_delay.as_millis() as u64)
        .max_delay(policy.max_delay)
        .map(jitter)
        .take(policy.max_retries);

    Retry::spawn(strategy, || async {
        match oracle.analyze(request).await {
            Ok(analysis) => Ok(analysis),
            Err(e @ OracleError::Transport(_)) => {
                warn!(chapter = request.chapter, error = %e, "Oracle call failed, will retry");
                Err(RetryError::Transient {
                    err: e,
                    retry_after: None,
                })
            }
            Err(e) => Err(RetryError::Permanent(e)),
        }
    })
    .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::market::{MarketContextSnapshot, MarketStats};
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct FlakyOracle {
        calls: AtomicUsize,
        failures_before_success: usize,
    }

    #[async_trait]
    impl ChapterOracle for FlakyOracle {
        async fn analyze(&self, _request: &OracleRequest) -> OracleResult<ChapterAnalysis> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if call < self.failures_before_success {
                Err(OracleError::Transport("connection reset".to_string()))
            } else {
                Ok(ChapterAnalysis::default())
            }
        }
    }

    struct MalformedOracle {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl ChapterOracle for MalformedOracle {
        async fn analyze(&self, _request: &OracleRequest) -> OracleResult<ChapterAnalysis> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Err(OracleError::Schema {
                reason: "missing delta".to_string(),
                payload: "{}".to_string(),
            })
        }
    }

    fn request() -> OracleRequest {
        OracleRequest {
            chapter: 1,
            title: "Chapter 1".to_string(),
            text: "text".to_string(),
            characters: vec![],
            context: MarketContextSnapshot {
                chapter: 1,
                top: vec![],
                stats: MarketStats::default(),
                histories: vec![],
            },
        }
    }

    fn fast_policy() -> RetryPolicy {
        RetryPolicy {
            max_retries: 3,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(5),
        }
    }

    #[tokio::test]
    async fn transient_failures_are_retried() {
        let oracle = FlakyOracle {
            calls: AtomicUsize::new(0),
            failures_before_success: 2,
        };
        let analysis = analyze_with_retry(&oracle, &request(), &fast_policy())
            .await
            .unwrap();
        assert_eq!(analysis, ChapterAnalysis::default());
        assert_eq!(oracle.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn retries_are_bounded() {
        let oracle = FlakyOracle {
            calls: AtomicUsize::new(0),
            failures_before_success: usize::MAX,
        };
        let err = analyze_with_retry(&oracle, &request(), &fast_policy())
            .await
            .unwrap_err();
        assert!(matches!(err, OracleError::Transport(_)));
        // First attempt plus max_retries.
        assert_eq!(oracle.calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn schema_failures_are_not_retried() {
        let oracle = MalformedOracle {
            calls: AtomicUsize::new(0),
        };
        let err = analyze_with_retry(&oracle, &request(), &fast_policy())
            .await
            .unwrap_err();
        assert!(matches!(err, OracleError::Schema { .. }));
        assert_eq!(oracle.calls.load(Ordering::SeqCst), 1);
    }
}
