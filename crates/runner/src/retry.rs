//! Retry classification and backoff

use rand::Rng;
use std::time::Duration;

use crate::error::{AttemptError, AttemptKind};

/// Decides whether a failed attempt is worth retrying by matching its
/// message against known transient failure texts
#[derive(Debug, Clone)]
pub struct RetryClassifier {
    patterns: Vec<String>,
}

impl RetryClassifier {
    pub fn new<I, S>(patterns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self {
            patterns: patterns
                .into_iter()
                .map(|p| p.as_ref().to_lowercase())
                .filter(|p| !p.is_empty())
                .collect(),
        }
    }

    pub fn is_retryable(&self, err: &AttemptError) -> bool {
        if err.kind == AttemptKind::Cancelled {
            return false;
        }
        let message = err.message.to_lowercase();
        self.patterns.iter().any(|p| message.contains(p.as_str()))
    }
}

/// Exponential backoff before retry `attempt` (0-based): `base * 2^attempt`,
/// saturating at `Duration::MAX`
pub fn backoff(base: Duration, attempt: u32) -> Duration {
    2u32.checked_pow(attempt)
        .and_then(|factor| base.checked_mul(factor))
        .unwrap_or(Duration::MAX)
}

/// Uniform random jitter in `[0, max)`
pub fn jitter(max: Duration) -> Duration {
    let max_ms = max.as_millis() as u64;
    if max_ms == 0 {
        return Duration::ZERO;
    }
    Duration::from_millis(rand::thread_rng().gen_range(0..max_ms))
}
