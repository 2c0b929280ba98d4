//! Retry policy for object-storage operations
//!
//! Only errors that report [`Error::is_retryable`] are tried again. Credential,
//! validation and local I/O failures surface on the first attempt.

use crate::config::UploadSettings;
use crate::error::{Error, Result};
use crate::types::BackoffType;
use std::future::Future;
use std::time::Duration;
use tracing::warn;

/// How often and how patiently an operation is retried
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total tries, the first one included
    pub max_attempts: u32,
    /// Type of backoff strategy
    pub backoff_type: BackoffType,
    /// Initial delay for backoff
    pub initial_backoff: Duration,
    /// Maximum delay for backoff
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_settings(&UploadSettings::default())
    }
}

impl RetryPolicy {
    /// Build the policy from the pipeline's upload settings
    pub fn from_settings(settings: &UploadSettings) -> Self {
        Self {
            max_attempts: settings.max_attempts.max(1),
            backoff_type: settings.backoff,
            initial_backoff: Duration::from_millis(settings.initial_backoff_ms),
            max_backoff: Duration::from_millis(settings.max_backoff_ms),
        }
    }

    /// A policy that tries once
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    /// Calculate backoff delay after the given failed try (0-based)
    pub fn backoff(&self, attempt: u32) -> Duration {
        let delay = match self.backoff_type {
            BackoffType::Constant => self.initial_backoff,
            BackoffType::Linear => self.initial_backoff.saturating_mul(attempt + 1),
            BackoffType::Exponential => {
                let factor = 2u32.saturating_pow(attempt);
                self.initial_backoff.saturating_mul(factor)
            }
        };

        std::cmp::min(delay, self.max_backoff)
    }

    /// Run `operation` until it succeeds, fails fatally, or runs out of tries
    ///
    /// Returns the value with the number of tries it took. A transient error
    /// on the last try becomes [`Error::MaxRetriesExceeded`].
    pub async fn run<T, F, Fut>(&self, what: &str, mut operation: F) -> Result<(T, u32)>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let max_attempts = self.max_attempts.max(1);
        let mut attempt = 0;

        loop {
            attempt += 1;
            match operation().await {
                Ok(value) => return Ok((value, attempt)),
                Err(e) if !e.is_retryable() => return Err(e),
                Err(e) if attempt >= max_attempts => {
                    return Err(Error::MaxRetriesExceeded {
                        attempts: attempt,
                        last: Box::new(e),
                    });
                }
                Err(e) => {
                    let delay = self.backoff(attempt - 1);
                    warn!(
                        "{} failed, attempt {}/{}, retrying in {:?}: {}",
                        what, attempt, max_attempts, delay, e
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }
}
