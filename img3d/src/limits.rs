//! Admission control for external processes.
//!
//! Every conversion and validation runs a heavyweight external process, so the number running at
//! once can be capped. Requests over the cap wait for a slot up to a deadline and are then rejected
//! with HTTP 429.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::debug;

use crate::config::LimitsConfig;
use crate::errors::{Error, Result};

/// Container for all resource limiters.
#[derive(Debug, Default, Clone)]
pub struct Limiters {
    /// Limiter for concurrently running external processes. None means unlimited.
    pub conversions: Option<Arc<ConversionLimiter>>,
}

impl Limiters {
    pub fn new(config: &LimitsConfig) -> Self {
        Self {
            conversions: ConversionLimiter::new(config).map(Arc::new),
        }
    }

    /// Wait for a process slot when a limit is configured.
    ///
    /// Returns `None` when running unlimited; the caller just holds whatever comes back until its
    /// process has exited.
    pub async fn acquire_conversion(&self) -> Result<Option<ConversionPermit>> {
        match &self.conversions {
            Some(limiter) => limiter.acquire().await.map(Some),
            None => Ok(None),
        }
    }
}

/// Bounds the number of external processes running at once.
#[derive(Debug)]
pub struct ConversionLimiter {
    semaphore: Arc<Semaphore>,
    max_wait: Duration,
}

impl ConversionLimiter {
    /// Returns `None` when `max_concurrent_conversions` is 0 (unlimited).
    pub fn new(config: &LimitsConfig) -> Option<Self> {
        if config.max_concurrent_conversions == 0 {
            return None;
        }

        Some(Self {
            semaphore: Arc::new(Semaphore::new(config.max_concurrent_conversions)),
            max_wait: config.max_conversion_wait,
        })
    }

    #[cfg(test)]
    pub fn available(&self) -> usize {
        self.semaphore.available_permits()
    }

    /// Take a slot, waiting up to `max_wait` for one to free up.
    ///
    /// A zero `max_wait` rejects immediately when every slot is taken.
    pub async fn acquire(&self) -> Result<ConversionPermit> {
        if let Ok(permit) = self.semaphore.clone().try_acquire_owned() {
            return Ok(ConversionPermit { _permit: permit });
        }

        let busy = || Error::TooManyRequests {
            message: "Too many conversions in progress. Please retry later.".to_string(),
        };
        if self.max_wait.is_zero() {
            return Err(busy());
        }

        debug!(max_wait = %humantime::format_duration(self.max_wait), "Waiting for a conversion slot");
        match tokio::time::timeout(self.max_wait, self.semaphore.clone().acquire_owned()).await {
            Ok(Ok(permit)) => Ok(ConversionPermit { _permit: permit }),
            // Semaphore is never closed while the limiter is alive
            Ok(Err(_)) => Err(busy()),
            Err(_) => Err(Error::TooManyRequests {
                message: "Timed out waiting for a conversion slot. Please retry later.".to_string(),
            }),
        }
    }
}

/// RAII guard that frees the conversion slot when dropped.
#[must_use]
#[derive(Debug)]
pub struct ConversionPermit {
    _permit: OwnedSemaphorePermit,
}
