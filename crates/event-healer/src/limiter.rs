//! # Remediation Rate Limiting
//!
//! A process-wide sliding-window budget on remediation actions. Every
//! namespace pipeline shares one limiter, so a burst of simultaneous
//! failures across the cluster cannot turn into a deletion storm.

use chrono::{DateTime, Duration, Utc};
use std::collections::VecDeque;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::debug;

/// Rate limiting errors
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RateLimitError {
    #[error("Remediation rate limit exceeded: {used}/{max} actions in the last {period_secs}s, next slot in {retry_in_secs}s")]
    LimitExceeded {
        used: usize,
        max: u32,
        period_secs: i64,
        retry_in_secs: i64,
    },
}

/// Rate limit configuration
#[derive(Debug, Clone, Copy)]
pub struct RateLimitConfig {
    pub max_actions: u32,
    pub period: Duration,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            max_actions: 10,
            period: Duration::minutes(1),
        }
    }
}

#[derive(Debug)]
pub struct RemediationRateLimiter {
    config: RateLimitConfig,
    granted: Mutex<VecDeque<DateTime<Utc>>>,
}

impl RemediationRateLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            config,
            granted: Mutex::new(VecDeque::new()),
        }
    }

    pub fn config(&self) -> &RateLimitConfig {
        &self.config
    }

    /// Claim a slot for one remediation action
    pub async fn try_acquire(&self, now: DateTime<Utc>) -> Result<(), RateLimitError> {
        let mut granted = self.granted.lock().await;
        Self::prune(&mut granted, now, self.config.period);

        if granted.len() >= self.config.max_actions as usize {
            let retry_in = granted
                .front()
                .map_or(Duration::zero(), |oldest| *oldest + self.config.period - now);
            return Err(RateLimitError::LimitExceeded {
                used: granted.len(),
                max: self.config.max_actions,
                period_secs: self.config.period.num_seconds(),
                retry_in_secs: retry_in.num_seconds().max(0),
            });
        }

        granted.push_back(now);
        debug!(
            used = granted.len(),
            max = self.config.max_actions,
            "Remediation slot granted"
        );
        Ok(())
    }

    /// Actions granted within the current window
    pub async fn used(&self, now: DateTime<Utc>) -> usize {
        let mut granted = self.granted.lock().await;
        Self::prune(&mut granted, now, self.config.period);
        granted.len()
    }

    fn prune(granted: &mut VecDeque<DateTime<Utc>>, now: DateTime<Utc>, period: Duration) {
        while granted.front().is_some_and(|at| now - *at >= period) {
            granted.pop_front();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limiter(max_actions: u32) -> RemediationRateLimiter {
        RemediationRateLimiter::new(RateLimitConfig {
            max_actions,
            period: Duration::seconds(60),
        })
    }

    #[tokio::test]
    async fn test_budget_is_enforced() {
        let now = Utc::now();
        let limiter = limiter(2);
        assert!(limiter.try_acquire(now).await.is_ok());
        assert!(limiter.try_acquire(now + Duration::seconds(1)).await.is_ok());

        let err = limiter
            .try_acquire(now + Duration::seconds(2))
            .await
            .unwrap_err();
        assert_eq!(
            err,
            RateLimitError::LimitExceeded {
                used: 2,
                max: 2,
                period_secs: 60,
                retry_in_secs: 58,
            }
        );
    }

    #[tokio::test]
    async fn test_window_slides() {
        let now = Utc::now();
        let limiter = limiter(1);
        limiter.try_acquire(now).await.unwrap();
        assert!(limiter.try_acquire(now + Duration::seconds(30)).await.is_err());
        assert!(limiter.try_acquire(now + Duration::seconds(60)).await.is_ok());
        assert_eq!(limiter.used(now + Duration::seconds(61)).await, 1);
    }
}
