// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Wires the profiler, collector, delivery workers and stats together.

use std::{future::Future, sync::Arc, time::Duration};

use parking_lot::Mutex;
use thiserror::Error;
use tokio::{sync::mpsc, task::JoinHandle};
use tokio_util::sync::CancellationToken;

use crate::{
    collector::{self, TraceCollector},
    delivery::{DeliveryConfig, DeliveryPool, RateLimiter},
    profiler::{Profiler, StopReason},
    reporter::Reporter,
    stats::{StatsAggregator, StatsSummary},
};

const DEFAULT_RATE_LIMIT: u64 = 4 * 1024 * 1024;
const DEFAULT_QUEUE_CAPACITY: usize = 1024;

/// Problems found by [`AgentBuilder::build`].
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ConfigError {
    /// [`AgentBuilder::with_profiler`] was never called.
    #[error("no profiler configured")]
    MissingProfiler,
    /// [`AgentBuilder::with_reporter`] was never called.
    #[error("no reporter configured")]
    MissingReporter,
    /// The worker count was zero.
    #[error("at least one delivery worker is required")]
    NoWorkers,
}

/// Errors from a running [`Agent`].
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum AgentError {
    /// A task panicked; holds the task's name.
    #[error("{0} task panicked")]
    TaskPanicked(&'static str),
}

/// What a finished [`Agent`] did.
#[derive(Debug, Clone)]
pub struct AgentSummary {
    /// Why the profiler stopped.
    pub stop_reason: StopReason,
    /// Samples that reached the collector.
    pub samples: u64,
    /// Lifetime delivery totals.
    pub stats: StatsSummary,
}

/// Builds an [`Agent`].
pub struct AgentBuilder {
    profiler: Option<Profiler>,
    reporter: Option<Arc<dyn Reporter + Send + Sync>>,
    delivery: DeliveryConfig,
    rate_limit: u64,
    rate_burst: u64,
    stats_interval: Duration,
    queue_capacity: usize,
}

impl Default for AgentBuilder {
    fn default() -> Self {
        Self {
            profiler: None,
            reporter: None,
            delivery: DeliveryConfig::default(),
            rate_limit: DEFAULT_RATE_LIMIT,
            rate_burst: 0,
            stats_interval: Duration::from_secs(60),
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
        }
    }
}

impl AgentBuilder {
    /// Sets the supervised profiler.
    pub fn with_profiler(mut self, p: Profiler) -> AgentBuilder {
        self.profiler = Some(p);
        self
    }

    /// Sets the reporter every collection is uploaded through.
    pub fn with_reporter(mut self, r: impl Reporter + Send + Sync + 'static) -> AgentBuilder {
        self.reporter = Some(Arc::new(r));
        self
    }

    /// Sets the number of delivery workers.
    pub fn with_workers(mut self, n: usize) -> AgentBuilder {
        self.delivery.workers = n;
        self
    }

    /// Sets how long a tag group accumulates samples before it is shipped.
    pub fn with_accumulation_interval(mut self, i: Duration) -> AgentBuilder {
        self.delivery.accumulation_interval = i;
        self
    }

    /// Sets how often idle workers look for work.
    pub fn with_poll_interval(mut self, i: Duration) -> AgentBuilder {
        self.delivery.poll_interval = i;
        self
    }

    /// Caps upload throughput in bytes per second. Zero disables the cap. A
    /// burst of zero means one second's worth.
    pub fn with_rate_limit(mut self, bytes_per_second: u64, burst: u64) -> AgentBuilder {
        self.rate_limit = bytes_per_second;
        self.rate_burst = burst;
        self
    }

    /// Sets how often delivery stats are logged.
    pub fn with_stats_interval(mut self, i: Duration) -> AgentBuilder {
        self.stats_interval = i;
        self
    }

    /// Sets the capacity of the sample and stats queues.
    pub fn with_queue_capacity(mut self, n: usize) -> AgentBuilder {
        self.queue_capacity = n;
        self
    }

    /// Turn this builder into an agent.
    pub fn build(self) -> Result<Agent, ConfigError> {
        if self.delivery.workers == 0 {
            return Err(ConfigError::NoWorkers);
        }
        Ok(Agent {
            profiler: self.profiler.ok_or(ConfigError::MissingProfiler)?,
            reporter: self.reporter.ok_or(ConfigError::MissingReporter)?,
            delivery: self.delivery,
            limiter: RateLimiter::new(self.rate_limit, self.rate_burst),
            stats_interval: self.stats_interval,
            queue_capacity: self.queue_capacity.max(1),
        })
    }
}

/// Spawns tasks whose panics cancel every other task.
#[derive(Clone)]
struct TaskGuard {
    cancel: CancellationToken,
    panicked: Arc<Mutex<Option<&'static str>>>,
}

impl TaskGuard {
    fn new(cancel: CancellationToken) -> Self {
        Self {
            cancel,
            panicked: Arc::default(),
        }
    }

    /// The returned handle yields `None` if the task did not finish.
    fn spawn<F>(&self, name: &'static str, task: F) -> JoinHandle<Option<F::Output>>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        let inner = tokio::spawn(task);
        let guard = self.clone();
        tokio::spawn(async move {
            match inner.await {
                Ok(output) => Some(output),
                Err(err) => {
                    if err.is_panic() {
                        tracing::error!(task = name, ?err, "task panicked, shutting down");
                        guard.panicked.lock().get_or_insert(name);
                    } else {
                        tracing::warn!(task = name, ?err, "task aborted, shutting down");
                    }
                    guard.cancel.cancel();
                    None
                }
            }
        })
    }

    fn panicked(&self) -> Option<&'static str> {
        *self.panicked.lock()
    }
}

/// The whole sidecar: one profiler feeding a collector that a pool of workers
/// uploads from.
pub struct Agent {
    profiler: Profiler,
    reporter: Arc<dyn Reporter + Send + Sync>,
    delivery: DeliveryConfig,
    limiter: RateLimiter,
    stats_interval: Duration,
    queue_capacity: usize,
}

impl Agent {
    /// Start building an agent.
    pub fn builder() -> AgentBuilder {
        AgentBuilder::default()
    }

    /// Run until the profiler stops for good and the collector is drained, or
    /// until `cancel` fires.
    pub async fn run(self, cancel: CancellationToken) -> Result<AgentSummary, AgentError> {
        let cancel = cancel.child_token();
        let drain = CancellationToken::new();
        let guard = TaskGuard::new(cancel.clone());

        let collector = Arc::new(TraceCollector::new());
        let (sample_tx, sample_rx) = mpsc::channel(self.queue_capacity);
        let (stats_tx, stats_rx) = mpsc::channel(self.queue_capacity);

        tracing::info!(
            workers = self.delivery.workers,
            restart = %self.profiler.restart_policy(),
            "starting agent"
        );

        let stats = guard.spawn(
            "stats",
            StatsAggregator::new(self.stats_interval).run(stats_rx, cancel.clone()),
        );
        let workers: Vec<_> = DeliveryPool::new(
            self.delivery,
            collector.clone(),
            self.reporter,
            Arc::new(self.limiter),
            stats_tx,
        )
        .into_workers()
        .into_iter()
        .map(|worker| guard.spawn("delivery worker", worker.run(cancel.clone(), drain.clone())))
        .collect();
        let subscriber = guard.spawn(
            "collector",
            collector::subscribe(collector.clone(), sample_rx, cancel.clone()),
        );
        let profiler = self.profiler;
        let supervisor = guard.spawn("profiler", {
            let cancel = cancel.clone();
            async move { profiler.run(sample_tx, cancel).await }
        });

        let stop_reason = supervisor.await.ok().flatten();
        let samples = subscriber.await.ok().flatten().unwrap_or_default();
        if !cancel.is_cancelled() {
            tracing::info!(pending = collector.len(), "profiler stopped, draining collector");
        }
        drain.cancel();
        futures::future::join_all(workers).await;
        let stats = stats.await.ok().flatten().unwrap_or_default();

        if let Some(name) = guard.panicked() {
            return Err(AgentError::TaskPanicked(name));
        }
        let stop_reason = stop_reason.unwrap_or(StopReason::Cancelled);
        tracing::info!(?stop_reason, samples, "agent finished");
        Ok(AgentSummary {
            stop_reason,
            samples,
            stats,
        })
    }
}
