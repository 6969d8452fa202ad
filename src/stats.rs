// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Delivery statistics.

use std::{collections::BTreeMap, time::Duration};

use tokio::{sync::mpsc, time::MissedTickBehavior};
use tokio_util::sync::CancellationToken;

/// How a delivery attempt ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// Accepted by the endpoint.
    Success,
    /// Rejected, or never answered.
    Failure {
        /// HTTP status, if the endpoint answered at all.
        status: Option<u16>,
        /// Rendered error.
        error: String,
    },
}

/// Result of one delivery attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveryStat {
    /// Tag string of the shipped collection.
    pub tags: String,
    /// Body size in bytes.
    pub bytes: usize,
    /// Samples in the body.
    pub samples: u64,
    /// Wall time of the request.
    pub duration: Duration,
    /// How it ended.
    pub outcome: Outcome,
}

impl DeliveryStat {
    /// True when the endpoint accepted the upload.
    pub fn is_success(&self) -> bool {
        matches!(self.outcome, Outcome::Success)
    }
}

/// Running totals over a set of [`DeliveryStat`]s.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct StatsSummary {
    /// Delivery attempts.
    pub requests: u64,
    /// Attempts the endpoint accepted.
    pub succeeded: u64,
    /// Attempts that failed.
    pub failed: u64,
    /// Bytes accepted by the endpoint.
    pub bytes_sent: u64,
    /// Bytes of failed uploads. These are not retried.
    pub bytes_dropped: u64,
    /// Samples accepted by the endpoint.
    pub samples_sent: u64,
    /// Failures keyed by HTTP status; `None` counts transport errors.
    pub failures_by_status: BTreeMap<Option<u16>, u64>,
    /// Sum of all request durations.
    pub request_time: Duration,
}

impl StatsSummary {
    /// Add one attempt.
    pub fn record(&mut self, stat: &DeliveryStat) {
        self.requests += 1;
        self.request_time += stat.duration;
        match &stat.outcome {
            Outcome::Success => {
                self.succeeded += 1;
                self.bytes_sent += stat.bytes as u64;
                self.samples_sent += stat.samples;
            }
            Outcome::Failure { status, .. } => {
                self.failed += 1;
                self.bytes_dropped += stat.bytes as u64;
                *self.failures_by_status.entry(*status).or_default() += 1;
            }
        }
    }

    /// Fold `other` into `self`.
    pub fn merge(&mut self, other: &StatsSummary) {
        self.requests += other.requests;
        self.succeeded += other.succeeded;
        self.failed += other.failed;
        self.bytes_sent += other.bytes_sent;
        self.bytes_dropped += other.bytes_dropped;
        self.samples_sent += other.samples_sent;
        self.request_time += other.request_time;
        for (status, count) in &other.failures_by_status {
            *self.failures_by_status.entry(*status).or_default() += count;
        }
    }

    /// True when nothing was attempted.
    pub fn is_empty(&self) -> bool {
        self.requests == 0
    }

    /// Average time per request, zero when there were none.
    pub fn mean_request_time(&self) -> Duration {
        if self.requests == 0 {
            return Duration::ZERO;
        }
        Duration::from_secs_f64(self.request_time.as_secs_f64() / self.requests as f64)
    }

    fn log(&self, message: &'static str) {
        let mean_request_time = self.mean_request_time();
        tracing::info!(
            requests = self.requests,
            succeeded = self.succeeded,
            failed = self.failed,
            bytes_sent = self.bytes_sent,
            bytes_dropped = self.bytes_dropped,
            samples_sent = self.samples_sent,
            failures_by_status = ?self.failures_by_status,
            ?mean_request_time,
            "{message}"
        );
    }
}

/// Periodically logs what the delivery workers report.
#[derive(Debug, Clone)]
pub struct StatsAggregator {
    interval: Duration,
}

impl StatsAggregator {
    /// Logs a summary every `interval`.
    pub fn new(interval: Duration) -> Self {
        Self { interval }
    }

    /// Consume stats until every sender is gone or `cancel` fires, logging a
    /// summary each interval. Returns the lifetime totals.
    pub async fn run(
        self,
        mut stats: mpsc::Receiver<DeliveryStat>,
        cancel: CancellationToken,
    ) -> StatsSummary {
        let mut total = StatsSummary::default();
        let mut window = StatsSummary::default();
        let mut ticker =
            tokio::time::interval_at(tokio::time::Instant::now() + self.interval, self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                stat = stats.recv() => match stat {
                    Some(stat) => window.record(&stat),
                    None => break,
                },
                _ = ticker.tick() => {
                    if !window.is_empty() {
                        window.log("delivery stats");
                    }
                    total.merge(&window);
                    window = StatsSummary::default();
                }
            }
        }

        // pick up anything sent before the senders went away
        while let Ok(stat) = stats.try_recv() {
            window.record(&stat);
        }
        total.merge(&window);
        total.log("delivery totals");
        total
    }
}
