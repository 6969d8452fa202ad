// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Aggregation of samples into per-tag stack counts.
//!
//! Samples are grouped by their exact tag string. Each group is queued once,
//! when its first sample arrives, and consumers take whole groups off the
//! front of that queue, so the oldest data is always shipped first. A consumed
//! group is gone; the next sample with the same tags starts a fresh group at
//! the back of the queue.

use std::{
    collections::{HashMap, VecDeque},
    fmt::Write,
    sync::Arc,
};

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::parser::Sample;

#[derive(Debug)]
struct TraceGroup {
    stacks: HashMap<String, u64>,
    from: DateTime<Utc>,
    until: DateTime<Utc>,
}

impl TraceGroup {
    fn new(time: DateTime<Utc>) -> Self {
        Self {
            stacks: HashMap::new(),
            from: time,
            until: time,
        }
    }

    fn add(&mut self, trace: String, time: DateTime<Utc>) {
        *self.stacks.entry(trace).or_default() += 1;
        self.from = self.from.min(time);
        self.until = self.until.max(time);
    }
}

/// A consumed group, owned by whoever consumed it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TagCollection {
    /// Canonical tag string shared by every stack in the group.
    pub tags: String,
    /// Time of the earliest sample.
    pub from: DateTime<Utc>,
    /// Time of the latest sample.
    pub until: DateTime<Utc>,
    /// Folded stack to sample count.
    pub data: HashMap<String, u64>,
}

impl TagCollection {
    /// Size of [`TagCollection::body`] in bytes, computed without building it.
    pub fn byte_length(&self) -> usize {
        self.data
            .iter()
            .map(|(stack, count)| stack.len() + 1 + decimal_len(*count) + 1)
            .sum()
    }

    /// Serialize as one `<stack> <count>\n` line per stack, in stack order.
    pub fn body(&self) -> String {
        let mut stacks: Vec<_> = self.data.iter().collect();
        stacks.sort_unstable();
        let mut out = String::with_capacity(self.byte_length());
        for (stack, count) in stacks {
            // writing to a String cannot fail
            let _ = writeln!(out, "{stack} {count}");
        }
        out
    }

    /// Sum of all counts.
    pub fn total_samples(&self) -> u64 {
        self.data.values().sum()
    }
}

fn decimal_len(mut n: u64) -> usize {
    let mut len = 1;
    while n >= 10 {
        n /= 10;
        len += 1;
    }
    len
}

#[derive(Debug, Default)]
struct Groups {
    by_tags: HashMap<String, TraceGroup>,
    queue: VecDeque<String>,
}

impl Groups {
    fn pop_front(&mut self) -> Option<TagCollection> {
        let tags = self.queue.pop_front()?;
        let Some(group) = self.by_tags.remove(&tags) else {
            // every queued tag string has a group; reaching this is a bug
            tracing::error!(tags = %tags, "queued tag string without a trace group");
            return None;
        };
        Some(TagCollection {
            tags,
            from: group.from,
            until: group.until,
            data: group.stacks,
        })
    }
}

/// Concurrent sample store. All operations take one lock and never do I/O
/// while holding it.
#[derive(Debug, Default)]
pub struct TraceCollector {
    groups: RwLock<Groups>,
}

impl TraceCollector {
    /// An empty collector.
    pub fn new() -> Self {
        Self::default()
    }

    /// Count `sample` into the group for its tags.
    pub fn add_sample(&self, sample: Sample) {
        let Sample { trace, tags, time } = sample;
        let mut groups = self.groups.write();
        let groups = &mut *groups;
        match groups.by_tags.get_mut(&tags) {
            Some(group) => group.add(trace, time),
            None => {
                let mut group = TraceGroup::new(time);
                group.add(trace, time);
                groups.queue.push_back(tags.clone());
                groups.by_tags.insert(tags, group);
            }
        }
    }

    /// Take the oldest group, if any. Never blocks on data arriving.
    pub fn consume_tag(&self) -> Option<TagCollection> {
        self.groups.write().pop_front()
    }

    /// Take the oldest group only if its first sample is at or before
    /// `cutoff`. The front of the queue is always the oldest group, so when it
    /// is too young every other group is as well.
    pub fn consume_tag_older_than(&self, cutoff: DateTime<Utc>) -> Option<TagCollection> {
        let mut groups = self.groups.write();
        let front = groups.queue.front()?;
        if groups.by_tags.get(front).is_some_and(|g| g.from > cutoff) {
            return None;
        }
        groups.pop_front()
    }

    /// Number of groups waiting to be consumed.
    pub fn len(&self) -> usize {
        self.groups.read().queue.len()
    }

    /// True when no group is waiting.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Feed every sample from `samples` into `collector` until the channel closes
/// or `cancel` fires. Returns the number of samples added.
pub async fn subscribe(
    collector: Arc<TraceCollector>,
    mut samples: mpsc::Receiver<Sample>,
    cancel: CancellationToken,
) -> u64 {
    let mut added = 0;
    loop {
        let sample = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            sample = samples.recv() => sample,
        };
        let Some(sample) = sample else {
            break;
        };
        collector.add_sample(sample);
        added += 1;
    }
    tracing::debug!(added, "collector subscription finished");
    added
}
