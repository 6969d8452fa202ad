// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

use std::{ffi::OsString, time::Duration};

use anyhow::Context;
use clap::Parser;
use profiler_sidecar::{
    agent::Agent,
    entrypoint::EntryPointValidator,
    parser::TraceParser,
    profiler::{Profiler, RestartPolicy, StopReason},
    reporter::ingest::{IngestReporter, IngestReporterConfig},
    tags::TagSpec,
};
use tokio_util::sync::CancellationToken;

pub fn set_up_tracing() {
    use tracing_subscriber::{prelude::*, EnvFilter};

    let format = tracing_subscriber::fmt::layer();
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new("info"))
        .unwrap();
    tracing_subscriber::registry()
        .with(format)
        .with(filter)
        .init();
}

/// Run a sampling profiler and ship its stacks to an ingestion server.
///
/// The profiler command goes after `--`, e.g.
/// `profiler-sidecar --application-name app -- phpspy --pid 1234`.
#[derive(Parser, Debug)]
#[command(version)]
struct Args {
    /// Base URL of the ingestion server.
    #[arg(long, default_value = "http://localhost:4040")]
    server_address: String,
    #[arg(long)]
    application_name: String,
    #[arg(long, env = "PROFILER_SIDECAR_AUTH_TOKEN", hide_env_values = true)]
    auth_token: Option<String>,
    /// `key=value`, or `key={{"source"}}`, or `key={{"source" "regex" "replacement"}}`.
    #[arg(long = "tag", value_name = "TAG")]
    tags: Vec<String>,
    /// Only keep traces entered through these files. Globs are allowed.
    #[arg(long = "entry-point", value_name = "PATTERN")]
    entry_points: Vec<String>,
    #[arg(long)]
    keep_entry_point_name: bool,
    /// Tag every sample with `entrypoint=<path>`.
    #[arg(long)]
    entry_point_tag: bool,
    /// always, onerror, onsuccess or no.
    #[arg(long, default_value = "no")]
    restart: RestartPolicy,
    #[arg(long, default_value = "1s")]
    #[clap(value_parser = humantime::parse_duration)]
    restart_delay: Duration,
    #[arg(long, default_value = "5s")]
    #[clap(value_parser = humantime::parse_duration)]
    kill_timeout: Duration,
    #[arg(long, default_value_t = 4)]
    workers: usize,
    /// Upload budget in bytes per second, 0 for unlimited.
    #[arg(long, default_value_t = 4 * 1024 * 1024)]
    rate_limit: u64,
    /// Defaults to the rate limit.
    #[arg(long, default_value_t = 0)]
    rate_burst: u64,
    #[arg(long, default_value = "10s")]
    #[clap(value_parser = humantime::parse_duration)]
    accumulation_interval: Duration,
    #[arg(long, default_value = "60s")]
    #[clap(value_parser = humantime::parse_duration)]
    stats_interval: Duration,
    /// Sampling frequency of the profiler, in Hz.
    #[arg(long, default_value_t = 100)]
    sample_rate: u32,
    #[arg(long, default_value = "10s")]
    #[clap(value_parser = humantime::parse_duration)]
    request_timeout: Duration,
    #[arg(last = true, required = true, value_name = "COMMAND")]
    command: Vec<OsString>,
}

fn build_agent(args: Args) -> anyhow::Result<Agent> {
    let tags = TagSpec::parse_input(&args.tags).context("invalid --tag")?;
    let validator =
        EntryPointValidator::new(&args.entry_points).context("invalid --entry-point")?;

    let reporter = IngestReporter::new(IngestReporterConfig {
        server_address: args.server_address,
        application_name: args.application_name,
        static_tags: tags.static_tags().to_owned(),
        auth_token: args.auth_token,
        sample_rate: args.sample_rate,
        timeout: args.request_timeout,
    })?;

    let parser = TraceParser::builder()
        .with_entry_point_validator(validator)
        .with_tag_spec(tags)
        .with_keep_entry_point_name(args.keep_entry_point_name)
        .with_entry_point_tag(args.entry_point_tag)
        .build();

    let mut command = args.command.into_iter();
    let program = command.next().context("no profiler command given")?;
    let profiler = Profiler::builder()
        .with_command(program, command)
        .with_restart_policy(args.restart)
        .with_restart_delay(args.restart_delay)
        .with_kill_timeout(args.kill_timeout)
        .with_parser(parser)
        .build()?;

    Ok(Agent::builder()
        .with_profiler(profiler)
        .with_reporter(reporter)
        .with_workers(args.workers)
        .with_rate_limit(args.rate_limit, args.rate_burst)
        .with_accumulation_interval(args.accumulation_interval)
        .with_stats_interval(args.stats_interval)
        .build()?)
}

#[cfg(unix)]
async fn shutdown_signal() -> std::io::Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut terminate = signal(SignalKind::terminate())?;
    tokio::select! {
        res = tokio::signal::ctrl_c() => res,
        _ = terminate.recv() => Ok(()),
    }
}

#[cfg(not(unix))]
async fn shutdown_signal() -> std::io::Result<()> {
    tokio::signal::ctrl_c().await
}

pub fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    set_up_tracing();

    // configuration errors abort before the profiler is started
    let agent = build_agent(args)?;

    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;
    rt.block_on(main_internal(agent))
}

async fn main_internal(agent: Agent) -> anyhow::Result<()> {
    let cancel = CancellationToken::new();
    tokio::spawn({
        let cancel = cancel.clone();
        async move {
            if let Err(err) = shutdown_signal().await {
                tracing::error!(?err, "unable to listen for shutdown signals");
                return;
            }
            tracing::info!("received shutdown signal");
            cancel.cancel();
        }
    });

    let summary = agent.run(cancel).await?;
    match summary.stop_reason {
        StopReason::Error(err) => anyhow::bail!("profiler stopped: {err}"),
        StopReason::Success | StopReason::Cancelled => Ok(()),
    }
}
