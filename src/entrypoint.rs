// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Entry-point filtering.
//!
//! A trace is only shipped if the file it was entered through matches one of
//! the configured entry-point patterns. Patterns are either literals, which
//! match the whole path or a trailing run of path components, or globs
//! (anything containing `*`, `?` or `[`), where `**` spans directories.

use glob::{MatchOptions, Pattern, PatternError};
use moka::{policy::EvictionPolicy, sync::Cache};
use thiserror::Error;

const DEFAULT_CACHE_CAPACITY: u64 = 1024;

const GLOB_OPTIONS: MatchOptions = MatchOptions {
    case_sensitive: true,
    require_literal_separator: true,
    require_literal_leading_dot: false,
};

/// Errors from compiling entry-point patterns.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum EntryPointError {
    /// A glob pattern failed to compile.
    #[error("invalid entry-point pattern {pattern:?}: {source}")]
    InvalidPattern {
        /// The pattern as given.
        pattern: String,
        /// Why it failed.
        #[source]
        source: PatternError,
    },
}

/// A single compiled entry-point pattern.
#[derive(Debug, Clone)]
pub enum EntryPointPattern {
    /// Whole path, or a trailing run of components.
    Literal(String),
    /// Glob where `**` spans directories.
    Glob(Pattern),
}

impl EntryPointPattern {
    /// Compile a user-supplied pattern, picking glob semantics when it
    /// contains a wildcard.
    pub fn new(pattern: &str) -> Result<Self, EntryPointError> {
        if pattern.contains(['*', '?', '[']) {
            let glob = Pattern::new(pattern).map_err(|source| EntryPointError::InvalidPattern {
                pattern: pattern.to_owned(),
                source,
            })?;
            Ok(Self::Glob(glob))
        } else {
            Ok(Self::Literal(pattern.to_owned()))
        }
    }

    /// Whether `path` is accepted by this pattern.
    pub fn matches(&self, path: &str) -> bool {
        match self {
            Self::Literal(literal) => {
                path == literal
                    || path
                        .strip_suffix(literal.as_str())
                        .is_some_and(|prefix| prefix.ends_with('/'))
            }
            Self::Glob(glob) => glob.matches_with(path, GLOB_OPTIONS),
        }
    }
}

/// Uncached check of `path` against `patterns`. An empty pattern list
/// accepts everything.
pub fn matches(path: &str, patterns: &[EntryPointPattern]) -> bool {
    patterns.is_empty() || patterns.iter().any(|p| p.matches(path))
}

fn lru_cache(capacity: u64) -> Cache<String, bool> {
    Cache::builder()
        .max_capacity(capacity)
        .eviction_policy(EvictionPolicy::lru())
        .build()
}

/// Memoizing wrapper around [`matches`].
#[derive(Debug, Clone)]
pub struct EntryPointValidator {
    patterns: Vec<EntryPointPattern>,
    cache: Cache<String, bool>,
}

impl Default for EntryPointValidator {
    fn default() -> Self {
        Self {
            patterns: vec![],
            cache: lru_cache(DEFAULT_CACHE_CAPACITY),
        }
    }
}

impl EntryPointValidator {
    /// Compile `patterns` with the default cache size.
    pub fn new<I, S>(patterns: I) -> Result<Self, EntryPointError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self::with_cache_capacity(patterns, DEFAULT_CACHE_CAPACITY)
    }

    /// Compile `patterns`, remembering up to `capacity` verdicts.
    pub fn with_cache_capacity<I, S>(patterns: I, capacity: u64) -> Result<Self, EntryPointError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let patterns = patterns
            .into_iter()
            .map(|p| EntryPointPattern::new(p.as_ref()))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self {
            patterns,
            cache: lru_cache(capacity),
        })
    }

    /// False when no patterns were given.
    pub fn is_filtering(&self) -> bool {
        !self.patterns.is_empty()
    }

    /// Whether a trace entered through `path` should be kept.
    pub fn is_valid(&self, path: &str) -> bool {
        if !self.is_filtering() {
            return true;
        }
        if let Some(valid) = self.cache.get(path) {
            return valid;
        }
        let valid = matches(path, &self.patterns);
        self.cache.insert(path.to_owned(), valid);
        valid
    }
}
