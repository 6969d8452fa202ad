// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Where collected stacks go.

use std::fmt;

use async_trait::async_trait;

use crate::collector::TagCollection;

pub mod ingest;

/// Abstraction around shipping aggregated stacks somewhere.
///
/// A reporter gets exactly one attempt per collection; the caller drops the
/// collection whatever the result.
#[async_trait]
pub trait Reporter: fmt::Debug {
    /// Upload one collection.
    async fn report(
        &self,
        collection: &TagCollection,
    ) -> Result<(), Box<dyn std::error::Error + Send>>;
}
