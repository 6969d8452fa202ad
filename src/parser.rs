// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Streaming parser for the profiler's stdout.
//!
//! The profiler prints one trace per block:
//!
//! ```text
//! 0 strlen <internal>:-1
//! 1 Foo::render /app/src/Foo.php:42
//! 2 <main> /app/public/index.php:7
//! # server.REQUEST_URI = /users?page=2
//!
//! ```
//!
//! Frame lines are `<index> <function> <path>:<line>`, innermost call first.
//! Lines starting with [`COMMENT_MARKER`] carry metadata, and a blank line
//! closes the block. Every well-formed block whose entry point passes the
//! [`EntryPointValidator`] becomes one [`Sample`].

use std::{io, sync::Arc};

use chrono::{DateTime, Utc};
use thiserror::Error;
use tokio::{
    io::{AsyncBufRead, AsyncBufReadExt},
    sync::mpsc,
};
use tokio_util::sync::CancellationToken;

use crate::{
    entrypoint::EntryPointValidator,
    tags::{self, TagSpec, COMMA_SUBSTITUTE},
};

/// Lines starting with this carry sample metadata rather than a frame.
pub const COMMENT_MARKER: char = '#';

/// Tag key used when the entry point is attached as a tag.
pub const ENTRY_POINT_TAG: &str = "entrypoint";

const FOLDED_SEPARATOR: &str = ";";

/// One profiled stack occurrence.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sample {
    /// Folded stack, outermost frame first.
    pub trace: String,
    /// Canonical tag string.
    pub tags: String,
    /// When the trace was read.
    pub time: DateTime<Utc>,
}

/// Why a trace block was dropped.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum TraceError {
    /// Fewer than two frames; holds the frame count.
    #[error("trace has {0} frame(s), need at least 2")]
    TooShort(usize),
    /// A frame line without index, function and location.
    #[error("malformed frame line {0:?}")]
    MalformedFrame(String),
    /// The entry point did not match any pattern.
    #[error("entry point {0:?} is not allowed")]
    EntryPointRejected(String),
}

/// Split a frame line into `(function, location)`. The first token is the
/// frame index and the last the location; everything in between is the
/// function name.
fn parse_frame(line: &str) -> Result<(String, &str), TraceError> {
    let tokens: Vec<&str> = line.split_whitespace().collect();
    match tokens.as_slice() {
        [_index, function @ .., location] if !function.is_empty() => {
            Ok((function.join(" "), *location))
        }
        _ => Err(TraceError::MalformedFrame(line.to_owned())),
    }
}

/// Fold frame lines (in emission order) into a stack string and return it
/// together with the entry point, the path of the last frame.
///
/// With `keep_entry_point_name` the entry frame is suffixed with its path, so
/// identically named functions in different files stay apart.
pub fn traces_to_folded_stack<S: AsRef<str>>(
    frames: &[S],
    keep_entry_point_name: bool,
) -> Result<(String, String), TraceError> {
    if frames.len() < 2 {
        return Err(TraceError::TooShort(frames.len()));
    }

    let mut folded = String::new();
    let mut entry_point = None;
    for line in frames.iter().rev() {
        let line = line.as_ref();
        let (function, location) = parse_frame(line)?;
        if !folded.is_empty() {
            folded.push_str(FOLDED_SEPARATOR);
        }
        folded.push_str(&function);

        if entry_point.is_none() {
            let path = location
                .rsplit_once(':')
                .map(|(path, _line)| path)
                .filter(|path| !path.is_empty())
                .ok_or_else(|| TraceError::MalformedFrame(line.to_owned()))?;
            if keep_entry_point_name {
                folded.push(' ');
                folded.push_str(path);
            }
            entry_point = Some(path.to_owned());
        }
    }

    // frames.len() >= 2, so the loop ran and set the entry point
    let entry_point = entry_point.ok_or(TraceError::TooShort(0))?;
    Ok((folded, entry_point))
}

/// Counters for one parser run.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ParseSummary {
    /// Samples sent downstream.
    pub samples: u64,
    /// Trace blocks that were rejected.
    pub dropped: u64,
}

#[derive(Debug, Default)]
struct TraceBlock {
    frames: Vec<String>,
    metadata: Vec<String>,
}

impl TraceBlock {
    fn is_empty(&self) -> bool {
        self.frames.is_empty() && self.metadata.is_empty()
    }
}

/// Builds a [`TraceParser`].
#[derive(Debug, Default)]
pub struct TraceParserBuilder {
    validator: Option<EntryPointValidator>,
    tag_spec: Option<TagSpec>,
    keep_entry_point_name: bool,
    entry_point_tag: bool,
}

impl TraceParserBuilder {
    /// Only emit traces entered through one of these entry points.
    pub fn with_entry_point_validator(mut self, v: EntryPointValidator) -> Self {
        self.validator = Some(v);
        self
    }

    /// Resolve dynamic tags with these rules.
    pub fn with_tag_spec(mut self, t: TagSpec) -> Self {
        self.tag_spec = Some(t);
        self
    }

    /// Suffix the entry frame of each folded stack with its file path.
    pub fn with_keep_entry_point_name(mut self, b: bool) -> Self {
        self.keep_entry_point_name = b;
        self
    }

    /// Add an `entrypoint=<path>` tag to every sample.
    pub fn with_entry_point_tag(mut self, b: bool) -> Self {
        self.entry_point_tag = b;
        self
    }

    /// Turn this builder into a parser.
    pub fn build(self) -> TraceParser {
        TraceParser {
            validator: self.validator.unwrap_or_default(),
            tag_spec: Arc::new(self.tag_spec.unwrap_or_default()),
            keep_entry_point_name: self.keep_entry_point_name,
            entry_point_tag: self.entry_point_tag,
        }
    }
}

/// Turns profiler output into [`Sample`]s. Cheap to clone; clones share the
/// entry-point cache.
#[derive(Debug, Clone)]
pub struct TraceParser {
    validator: EntryPointValidator,
    tag_spec: Arc<TagSpec>,
    keep_entry_point_name: bool,
    entry_point_tag: bool,
}

impl Default for TraceParser {
    fn default() -> Self {
        TraceParserBuilder::default().build()
    }
}

impl TraceParser {
    /// Start building a parser.
    pub fn builder() -> TraceParserBuilder {
        TraceParserBuilder::default()
    }

    /// Convert one complete block into a sample.
    pub fn parse_block<F, M>(&self, frames: &[F], metadata: &[M]) -> Result<Sample, TraceError>
    where
        F: AsRef<str>,
        M: AsRef<str>,
    {
        let (trace, entry_point) = traces_to_folded_stack(frames, self.keep_entry_point_name)?;
        if !self.validator.is_valid(&entry_point) {
            return Err(TraceError::EntryPointRejected(entry_point));
        }

        let mut tags = self.tag_spec.resolve(metadata.iter().map(|m| m.as_ref()));
        if self.entry_point_tag {
            tags.insert(
                ENTRY_POINT_TAG.to_owned(),
                entry_point.replace(',', COMMA_SUBSTITUTE),
            );
        }

        Ok(Sample {
            trace,
            tags: tags::join_tags(&tags),
            time: Utc::now(),
        })
    }

    /// Feed one line. Returns the block's outcome when the line closes a
    /// non-empty block.
    fn feed_line(
        &self,
        block: &mut TraceBlock,
        line: &str,
    ) -> Option<Result<Sample, TraceError>> {
        if line.trim().is_empty() {
            if block.is_empty() {
                return None;
            }
            let block = std::mem::take(block);
            return Some(self.parse_block(&block.frames, &block.metadata));
        }
        match line.strip_prefix(COMMENT_MARKER) {
            Some(body) => block.metadata.push(body.trim_start().to_owned()),
            None => block.frames.push(line.to_owned()),
        }
        None
    }

    /// Read `reader` until EOF or cancellation, sending every sample to
    /// `samples`. Per-block failures are logged and skipped; only an I/O
    /// error ends the loop early.
    pub async fn run<R>(
        &self,
        mut reader: R,
        samples: mpsc::Sender<Sample>,
        cancel: CancellationToken,
    ) -> Result<ParseSummary, io::Error>
    where
        R: AsyncBufRead + Unpin,
    {
        let mut summary = ParseSummary::default();
        let mut block = TraceBlock::default();
        let mut buf = Vec::with_capacity(256);

        loop {
            buf.clear();
            let read = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                read = reader.read_until(b'\n', &mut buf) => read?,
            };
            if read == 0 {
                if !block.is_empty() {
                    tracing::debug!(
                        frames = block.frames.len(),
                        "discarding incomplete trace at end of stream"
                    );
                    summary.dropped += 1;
                }
                break;
            }

            let line = String::from_utf8_lossy(&buf);
            let line = line.trim_end_matches(['\n', '\r']);
            match self.feed_line(&mut block, line) {
                None => {}
                Some(Ok(sample)) => {
                    summary.samples += 1;
                    tokio::select! {
                        biased;
                        _ = cancel.cancelled() => break,
                        sent = samples.send(sample) => {
                            if sent.is_err() {
                                tracing::debug!("sample receiver closed, stopping parser");
                                break;
                            }
                        }
                    }
                }
                Some(Err(err)) => {
                    summary.dropped += 1;
                    tracing::debug!(%err, "dropping trace");
                }
            }
        }

        Ok(summary)
    }
}
