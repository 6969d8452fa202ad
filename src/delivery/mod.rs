// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Workers that drain the [`TraceCollector`] into a [`Reporter`].
//!
//! Every worker loops: take the oldest tag group that has been accumulating
//! long enough, wait for the shared [`RateLimiter`] to allow its size, make a
//! single upload attempt, and report the outcome as a [`DeliveryStat`]. Failed
//! uploads are dropped.

use std::{sync::Arc, time::Duration};

use chrono::Utc;
use tokio::{sync::mpsc, time::Instant};
use tokio_util::sync::CancellationToken;

use crate::{
    collector::{TagCollection, TraceCollector},
    reporter::{ingest::IngestError, Reporter},
    stats::{DeliveryStat, Outcome},
};

pub mod limiter;

pub use limiter::RateLimiter;

/// How often an idle worker looks at the collector again.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// How the worker pool ships collections.
#[derive(Debug, Clone)]
pub struct DeliveryConfig {
    /// Number of concurrent workers.
    pub workers: usize,
    /// Minimum age of a group's first sample before it is shipped.
    pub accumulation_interval: Duration,
    /// Sleep between checks when there is nothing to ship.
    pub poll_interval: Duration,
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            accumulation_interval: Duration::from_secs(10),
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }
}

/// Shared state for a set of delivery workers.
#[derive(Debug)]
pub struct DeliveryPool {
    config: DeliveryConfig,
    collector: Arc<TraceCollector>,
    reporter: Arc<dyn Reporter + Send + Sync>,
    limiter: Arc<RateLimiter>,
    stats: mpsc::Sender<DeliveryStat>,
}

impl DeliveryPool {
    /// Pool over `collector` that uploads through `reporter`.
    pub fn new(
        config: DeliveryConfig,
        collector: Arc<TraceCollector>,
        reporter: Arc<dyn Reporter + Send + Sync>,
        limiter: Arc<RateLimiter>,
        stats: mpsc::Sender<DeliveryStat>,
    ) -> Self {
        Self {
            config,
            collector,
            reporter,
            limiter,
            stats,
        }
    }

    /// The configured workers, each ready to be spawned. Dropping the pool
    /// afterwards leaves the workers as the only stats senders.
    pub fn into_workers(self) -> Vec<Worker> {
        let accumulation = chrono::Duration::from_std(self.config.accumulation_interval)
            .unwrap_or_else(|_| chrono::Duration::weeks(52 * 100));
        (0..self.config.workers.max(1))
            .map(|id| Worker {
                id,
                accumulation,
                poll_interval: self.config.poll_interval,
                collector: self.collector.clone(),
                reporter: self.reporter.clone(),
                limiter: self.limiter.clone(),
                stats: self.stats.clone(),
            })
            .collect()
    }
}

/// One delivery loop. See [`Worker::run`].
#[derive(Debug)]
pub struct Worker {
    id: usize,
    accumulation: chrono::Duration,
    poll_interval: Duration,
    collector: Arc<TraceCollector>,
    reporter: Arc<dyn Reporter + Send + Sync>,
    limiter: Arc<RateLimiter>,
    stats: mpsc::Sender<DeliveryStat>,
}

impl Worker {
    fn next_collection(&self, draining: bool) -> Option<TagCollection> {
        if draining || self.accumulation <= chrono::Duration::zero() {
            self.collector.consume_tag()
        } else {
            self.collector
                .consume_tag_older_than(Utc::now() - self.accumulation)
        }
    }

    /// Deliver until `cancel` fires. Once `drain` fires the accumulation
    /// window is ignored and the worker exits as soon as the collector is
    /// empty.
    pub async fn run(self, cancel: CancellationToken, drain: CancellationToken) {
        tracing::debug!(worker = self.id, "delivery worker started");
        while !cancel.is_cancelled() {
            let draining = drain.is_cancelled();
            let Some(collection) = self.next_collection(draining) else {
                if draining {
                    break;
                }
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => break,
                    _ = drain.cancelled() => {}
                    _ = tokio::time::sleep(self.poll_interval) => {}
                }
                continue;
            };
            if !self.deliver(collection, &cancel).await {
                break;
            }
        }
        tracing::debug!(worker = self.id, "delivery worker finished");
    }

    /// Returns false if cancelled.
    async fn deliver(&self, collection: TagCollection, cancel: &CancellationToken) -> bool {
        let bytes = collection.byte_length();
        if self.limiter.wait_n(bytes, cancel).await.is_err() {
            tracing::debug!(tags = %collection.tags, bytes, "cancelled, dropping profile data");
            return false;
        }

        let started = Instant::now();
        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => return false,
            result = self.reporter.report(&collection) => result,
        };
        let duration = started.elapsed();

        let outcome = match result {
            Ok(()) => {
                tracing::debug!(tags = %collection.tags, bytes, ?duration, "uploaded profile data");
                Outcome::Success
            }
            Err(err) => {
                let status = err.downcast_ref::<IngestError>().and_then(IngestError::status);
                tracing::warn!(
                    tags = %collection.tags,
                    bytes,
                    ?status,
                    %err,
                    "failed to upload profile data, dropping it"
                );
                Outcome::Failure {
                    status,
                    error: err.to_string(),
                }
            }
        };

        let stat = DeliveryStat {
            samples: collection.total_samples(),
            tags: collection.tags,
            bytes,
            duration,
            outcome,
        };
        tokio::select! {
            biased;
            _ = cancel.cancelled() => return false,
            sent = self.stats.send(stat) => {
                if sent.is_err() {
                    tracing::debug!("stats receiver closed");
                }
            }
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{self, AtomicUsize};

    use async_trait::async_trait;
    use chrono::DateTime;

    use super::*;
    use crate::parser::Sample;

    #[derive(Debug, thiserror::Error)]
    enum Error {
        #[error("failed")]
        Failed,
    }

    /// Records uploads and fails every collection whose tags start with
    /// `fail`.
    #[derive(Debug, Default)]
    struct MockReporter {
        uploads: parking_lot::Mutex<Vec<TagCollection>>,
        attempts: AtomicUsize,
    }

    #[async_trait]
    impl Reporter for MockReporter {
        async fn report(
            &self,
            collection: &TagCollection,
        ) -> Result<(), Box<dyn std::error::Error + Send>> {
            self.attempts.fetch_add(1, atomic::Ordering::Relaxed);
            if collection.tags.starts_with("fail") {
                return Err(Box::new(Error::Failed));
            }
            self.uploads.lock().push(collection.clone());
            Ok(())
        }
    }

    fn sample(tags: &str, time: DateTime<Utc>) -> Sample {
        Sample {
            trace: "main;work".into(),
            tags: tags.into(),
            time,
        }
    }

    struct Harness {
        collector: Arc<TraceCollector>,
        reporter: Arc<MockReporter>,
        stats: mpsc::Receiver<DeliveryStat>,
        workers: Vec<Worker>,
    }

    fn harness(workers: usize, accumulation: Duration, limiter: RateLimiter) -> Harness {
        let collector = Arc::new(TraceCollector::new());
        let reporter = Arc::new(MockReporter::default());
        let (tx, rx) = mpsc::channel(64);
        let pool = DeliveryPool::new(
            DeliveryConfig {
                workers,
                accumulation_interval: accumulation,
                poll_interval: Duration::from_millis(10),
            },
            collector.clone(),
            reporter.clone(),
            Arc::new(limiter),
            tx,
        );
        Harness {
            collector,
            reporter,
            stats: rx,
            workers: pool.into_workers(),
        }
    }

    #[tokio::test]
    async fn test_drain_delivers_everything() {
        let mut h = harness(3, Duration::from_secs(3600), RateLimiter::unlimited());
        for i in 0..20 {
            h.collector.add_sample(sample(&format!("t={}", i % 7), Utc::now()));
        }
        h.collector.add_sample(sample("fail=1", Utc::now()));

        let drain = CancellationToken::new();
        drain.cancel();
        let tasks: Vec<_> = h
            .workers
            .into_iter()
            .map(|w| tokio::spawn(w.run(CancellationToken::new(), drain.clone())))
            .collect();
        for task in tasks {
            task.await.unwrap();
        }

        assert!(h.collector.is_empty());
        assert_eq!(h.reporter.attempts.load(atomic::Ordering::Relaxed), 8);
        let uploads = h.reporter.uploads.lock();
        assert_eq!(uploads.len(), 7);
        assert_eq!(uploads.iter().map(|c| c.total_samples()).sum::<u64>(), 20);

        let mut stats = vec![];
        while let Ok(stat) = h.stats.try_recv() {
            stats.push(stat);
        }
        assert_eq!(stats.len(), 8);
        let failed: Vec<_> = stats.iter().filter(|s| !s.is_success()).collect();
        assert_eq!(failed.len(), 1);
        assert_eq!(
            failed[0].outcome,
            Outcome::Failure {
                status: None,
                error: "failed".into()
            }
        );
    }

    #[tokio::test]
    async fn test_accumulation_window_holds_young_groups() {
        let mut h = harness(1, Duration::from_secs(3600), RateLimiter::unlimited());
        h.collector
            .add_sample(sample("old=1", Utc::now() - chrono::Duration::hours(2)));
        h.collector.add_sample(sample("young=1", Utc::now()));

        let cancel = CancellationToken::new();
        let worker = h.workers.pop().unwrap();
        let task = tokio::spawn(worker.run(cancel.clone(), CancellationToken::new()));

        let stat = h.stats.recv().await.unwrap();
        assert_eq!(stat.tags, "old=1");
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(h.collector.len(), 1);

        cancel.cancel();
        task.await.unwrap();
        assert_eq!(h.reporter.uploads.lock().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rate_limit_delays_uploads() {
        // each collection body is "main;work 1\n", 12 bytes
        let mut h = harness(2, Duration::ZERO, RateLimiter::new(12, 12));
        for i in 0..4 {
            h.collector.add_sample(sample(&format!("t={i}"), Utc::now()));
        }

        let start = Instant::now();
        let drain = CancellationToken::new();
        drain.cancel();
        let tasks: Vec<_> = h
            .workers
            .into_iter()
            .map(|w| tokio::spawn(w.run(CancellationToken::new(), drain.clone())))
            .collect();
        for task in tasks {
            task.await.unwrap();
        }

        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_secs(3), "{elapsed:?}");
        assert_eq!(h.reporter.uploads.lock().len(), 4);
        assert_eq!(h.stats.recv().await.unwrap().bytes, 12);
    }

    #[tokio::test]
    async fn test_cancel_stops_idle_workers() {
        let h = harness(4, Duration::ZERO, RateLimiter::unlimited());
        let cancel = CancellationToken::new();
        let tasks: Vec<_> = h
            .workers
            .into_iter()
            .map(|w| tokio::spawn(w.run(cancel.clone(), CancellationToken::new())))
            .collect();
        tokio::time::sleep(Duration::from_millis(50)).await;
        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(5), futures::future::join_all(tasks))
            .await
            .unwrap();
    }
}
