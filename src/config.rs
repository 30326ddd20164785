//! Engine configuration

use crate::oracle::RetryPolicy;
use std::time::Duration;

/// Tunables for a processing run
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// How many characters the oracle sees in the top-of-market list
    pub top_n: usize,
    /// How many committed chapters of per-character activity the oracle sees
    pub history_k: usize,
    /// Delay between chapters, to respect the source feed
    pub request_delay: Duration,
    /// Backoff policy for transient oracle failures
    pub retry: RetryPolicy,
    /// Reuse previously fetched chapter text instead of hitting the feed
    pub skip_fetch: bool,
    /// Accept out-of-order processing with a degraded (incomplete) context
    pub allow_gaps: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            top_n: 10,
            history_k: 3,
            request_delay: Duration::from_secs(1),
            retry: RetryPolicy::default(),
            skip_fetch: false,
            allow_gaps: false,
        }
    }
}

impl EngineConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_top_n(mut self, top_n: usize) -> Self {
        self.top_n = top_n;
        self
    }

    pub fn with_history_k(mut self, history_k: usize) -> Self {
        self.history_k = history_k;
        self
    }

    pub fn with_request_delay(mut self, delay: Duration) -> Self {
        self.request_delay = delay;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_skip_fetch(mut self, skip_fetch: bool) -> Self {
        self.skip_fetch = skip_fetch;
        self
    }

    pub fn with_allow_gaps(mut self, allow_gaps: bool) -> Self {
        self.allow_gaps = allow_gaps;
        self
    }

    /// Config for tests: no pacing, minimal backoff
    #[cfg(test)]
    pub fn immediate() -> Self {
        Self {
            request_delay: Duration::ZERO,
            retry: RetryPolicy {
                max_retries: 1,
                base_delay: Duration::from_millis(1),
                max_delay: Duration::from_millis(2),
            },
            ..Self::default()
        }
    }
}
