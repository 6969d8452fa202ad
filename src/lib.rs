// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

#![deny(missing_docs)]

//! ## profiler sidecar
//! A sidecar agent that runs an external sampling profiler (such as [phpspy]),
//! turns its text output into folded stacks, and uploads them to a
//! continuous-profiling ingestion endpoint.
//!
//! [phpspy]: https://github.com/adsr/phpspy
//!
//! ### Usage
//!
//! The agent launches the profiler as a subprocess and reads its stdout. Every
//! trace is folded into a single `a;b;c` line, tagged, and counted per tag set.
//! A pool of workers ships each tag set's counts through a [`Reporter`], rate
//! limited by payload size.
//!
//! ```no_run
//! # use profiler_sidecar::{
//! #     agent::Agent,
//! #     parser::TraceParser,
//! #     profiler::{Profiler, RestartPolicy},
//! #     reporter::ingest::{IngestReporter, IngestReporterConfig},
//! #     tags::TagSpec,
//! # };
//! # use tokio_util::sync::CancellationToken;
//! # #[tokio::main]
//! # async fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let tags = TagSpec::parse_input(["env=prod", r#"uri={{"server.REQUEST_URI"}}"#])?;
//! let reporter = IngestReporter::new(IngestReporterConfig {
//!     server_address: "http://pyroscope:4040".into(),
//!     application_name: "shop.php".into(),
//!     static_tags: tags.static_tags().into(),
//!     ..Default::default()
//! })?;
//! let profiler = Profiler::builder()
//!     .with_command("phpspy", ["--pid", "1234", "--peek-global", "server.REQUEST_URI"])
//!     .with_restart_policy(RestartPolicy::OnError)
//!     .with_parser(TraceParser::builder().with_tag_spec(tags).build())
//!     .build()?;
//!
//! let summary = Agent::builder()
//!     .with_profiler(profiler)
//!     .with_reporter(reporter)
//!     .build()?
//!     .run(CancellationToken::new())
//!     .await?;
//! println!("uploaded {} bytes", summary.stats.bytes_sent);
//! # Ok(())
//! # }
//! ```
//!
//! ### Input format
//!
//! The profiler writes one trace per block. Frame lines are
//! `<index> <function> <file>:<line>`, starting at the sampled function.
//! Lines starting with `#` carry `key = value` metadata, and an empty line
//! ends the block:
//!
//! ```text
//! 0 strlen <internal>:-1
//! 1 Foo::render /app/src/Foo.php:31
//! 2 <main> /app/public/index.php:7
//! # glopeek server.REQUEST_URI = /users?page=2
//!
//! ```
//!
//! ### Tags
//!
//! `--tag` arguments are either static, `env=prod`, or dynamic, copying a
//! metadata value into a tag, optionally rewritten by a regex:
//! `uri={{"server.REQUEST_URI" "^([^?]*).*" "$1"}}`. See [`tags::TagSpec`].
//!
//! ### Entry points
//!
//! Traces can be filtered by the file that entered them, either by exact path
//! suffix or by glob. See [`entrypoint::EntryPointValidator`].
//!
//! [`Reporter`]: reporter::Reporter

pub mod agent;
pub mod collector;
pub mod delivery;
pub mod entrypoint;
pub mod parser;
pub mod profiler;
pub mod reporter;
pub mod stats;
pub mod tags;
