// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Byte-budget token bucket shared by all delivery workers.
//!
//! Acquisition works by reservation: the caller takes its tokens up front,
//! possibly driving the bucket negative, and then sleeps until the debt would
//! have been paid off. Requests larger than the burst are therefore admitted
//! at the configured rate rather than rejected. Cancelling a wait hands the
//! reservation back.

use std::time::Duration;

use parking_lot::Mutex;
use thiserror::Error;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Returned by [`RateLimiter::wait_n`] when the wait was cut short.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("cancelled while waiting for rate limiter")]
pub struct Cancelled;

#[derive(Debug)]
struct Bucket {
    tokens: f64,
    last: Instant,
}

/// Token bucket over upload bytes, shared by every worker.
#[derive(Debug)]
pub struct RateLimiter {
    /// Tokens per second, `None` when unlimited.
    rate: Option<f64>,
    burst: f64,
    bucket: Mutex<Bucket>,
}

impl RateLimiter {
    /// A limiter refilling at `bytes_per_second` and holding at most `burst`
    /// tokens. It starts full. A rate of zero disables limiting; a burst of
    /// zero defaults to one second's worth of tokens.
    pub fn new(bytes_per_second: u64, burst: u64) -> Self {
        if bytes_per_second == 0 {
            return Self::unlimited();
        }
        let burst = if burst == 0 { bytes_per_second } else { burst } as f64;
        Self {
            rate: Some(bytes_per_second as f64),
            burst,
            bucket: Mutex::new(Bucket {
                tokens: burst,
                last: Instant::now(),
            }),
        }
    }

    /// A limiter that never waits.
    pub fn unlimited() -> Self {
        Self {
            rate: None,
            burst: f64::INFINITY,
            bucket: Mutex::new(Bucket {
                tokens: 0.0,
                last: Instant::now(),
            }),
        }
    }

    /// Take `n` tokens and return how long the caller must wait before using
    /// them.
    fn reserve(&self, rate: f64, n: usize) -> Duration {
        let now = Instant::now();
        let mut bucket = self.bucket.lock();
        let elapsed = now.saturating_duration_since(bucket.last).as_secs_f64();
        bucket.tokens = (bucket.tokens + elapsed * rate).min(self.burst);
        bucket.last = now;
        bucket.tokens -= n as f64;
        if bucket.tokens >= 0.0 {
            Duration::ZERO
        } else {
            Duration::from_secs_f64(-bucket.tokens / rate)
        }
    }

    fn release(&self, n: usize) {
        let mut bucket = self.bucket.lock();
        bucket.tokens = (bucket.tokens + n as f64).min(self.burst);
    }

    /// Wait until `n` bytes may be sent, or until `cancel` fires.
    pub async fn wait_n(&self, n: usize, cancel: &CancellationToken) -> Result<(), Cancelled> {
        let Some(rate) = self.rate else {
            return Ok(());
        };
        if cancel.is_cancelled() {
            return Err(Cancelled);
        }
        let wait = self.reserve(rate, n);
        if wait.is_zero() {
            return Ok(());
        }
        tracing::trace!(bytes = n, ?wait, "waiting for rate limiter");
        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                self.release(n);
                Err(Cancelled)
            }
            _ = tokio::time::sleep(wait) => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_burst_then_rate() {
        let limiter = RateLimiter::new(1000, 1000);
        let cancel = CancellationToken::new();
        let start = Instant::now();
        limiter.wait_n(1000, &cancel).await.unwrap();
        assert_eq!(start.elapsed(), Duration::ZERO);

        limiter.wait_n(500, &cancel).await.unwrap();
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_millis(500), "{elapsed:?}");
        assert!(elapsed < Duration::from_millis(510), "{elapsed:?}");
    }

    #[tokio::test(start_paused = true)]
    async fn test_cumulative_payloads_are_throttled() {
        let limiter = RateLimiter::new(1000, 1000);
        let cancel = CancellationToken::new();
        let start = Instant::now();
        for _ in 0..5 {
            limiter.wait_n(1000, &cancel).await.unwrap();
        }
        // one burst is free, the remaining 4000 bytes take 4s
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_secs(4), "{elapsed:?}");
        assert!(elapsed < Duration::from_millis(4010), "{elapsed:?}");
    }

    #[tokio::test(start_paused = true)]
    async fn test_larger_than_burst() {
        let limiter = RateLimiter::new(1000, 1000);
        let cancel = CancellationToken::new();
        let start = Instant::now();
        limiter.wait_n(3000, &cancel).await.unwrap();
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_secs(2), "{elapsed:?}");
        assert!(elapsed < Duration::from_millis(2010), "{elapsed:?}");
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_waiters_share_budget() {
        let limiter = Arc::new(RateLimiter::new(1000, 1000));
        let cancel = CancellationToken::new();
        let start = Instant::now();
        let tasks: Vec<_> = (0..4)
            .map(|_| {
                let limiter = limiter.clone();
                let cancel = cancel.clone();
                tokio::spawn(async move { limiter.wait_n(1000, &cancel).await })
            })
            .collect();
        for task in tasks {
            task.await.unwrap().unwrap();
        }
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_secs(3), "{elapsed:?}");
        assert!(elapsed < Duration::from_millis(3010), "{elapsed:?}");
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_returns_reservation() {
        let limiter = Arc::new(RateLimiter::new(1000, 1000));
        let cancel = CancellationToken::new();
        limiter.wait_n(1000, &cancel).await.unwrap();

        let waiter = {
            let limiter = limiter.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { limiter.wait_n(100_000, &cancel).await })
        };
        tokio::time::sleep(Duration::from_secs(1)).await;
        cancel.cancel();
        assert_eq!(waiter.await.unwrap(), Err(Cancelled));

        // the abandoned reservation no longer counts against new callers
        let start = Instant::now();
        limiter
            .wait_n(1000, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(start.elapsed(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unlimited() {
        let limiter = RateLimiter::new(0, 0);
        let start = Instant::now();
        limiter
            .wait_n(usize::MAX, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(start.elapsed(), Duration::ZERO);
    }
}
