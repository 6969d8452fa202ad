// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Supervision of the external profiler process.

use crate::parser::{ParseSummary, Sample, TraceParser};
use std::{
    ffi::OsString,
    fmt, io,
    process::{ExitStatus, Stdio},
    str::FromStr,
    time::{Duration, SystemTime},
};
use parking_lot::Mutex;
use thiserror::Error;
use tokio::{
    io::BufReader,
    process::{Child, Command},
    sync::mpsc,
    task::JoinHandle,
};
use tokio_util::sync::CancellationToken;

/// Arguments that would send the profiler's traces somewhere other than
/// stdout.
const FORBIDDEN_ARGS: &[&str] = &["-o", "--output"];

/// What to do when the profiler process exits.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum RestartPolicy {
    /// Restart after every exit.
    Always,
    /// Restart only after a failed exit.
    OnError,
    /// Restart only after a clean exit.
    OnSuccess,
    /// Stop after the first exit.
    #[default]
    Never,
}

impl RestartPolicy {
    /// Whether an exit of this kind leads to another run.
    pub fn should_restart(self, exit_was_error: bool) -> bool {
        match self {
            Self::Always => true,
            Self::OnError => exit_was_error,
            Self::OnSuccess => !exit_was_error,
            Self::Never => false,
        }
    }
}

/// An unrecognised `--restart` value.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("unknown restart policy {0:?}, expected one of always, onerror, onsuccess, no")]
pub struct ParseRestartPolicyError(String);

impl FromStr for RestartPolicy {
    type Err = ParseRestartPolicyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "always" => Ok(Self::Always),
            "onerror" => Ok(Self::OnError),
            "onsuccess" => Ok(Self::OnSuccess),
            "no" => Ok(Self::Never),
            other => Err(ParseRestartPolicyError(other.to_owned())),
        }
    }
}

impl fmt::Display for RestartPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Always => "always",
            Self::OnError => "onerror",
            Self::OnSuccess => "onsuccess",
            Self::Never => "no",
        })
    }
}

/// Errors from configuring or running the profiler process.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ProfilerError {
    /// No command was configured.
    #[error("no profiler command was given")]
    MissingCommand,
    /// An argument would send traces away from stdout.
    #[error("profiler argument {0:?} redirects trace output away from stdout")]
    ForbiddenArgument(String),
    /// The process could not be started.
    #[error("failed to start profiler: {0}")]
    Spawn(#[source] io::Error),
    /// The child's stdout was not piped.
    #[error("profiler stdout was not captured")]
    NoStdout,
    /// Waiting on the child failed.
    #[error("failed waiting for profiler: {0}")]
    Wait(#[source] io::Error),
    /// The process exited unsuccessfully.
    #[error("profiler exited with {0}")]
    Exited(ExitStatus),
    /// Reading the child's stdout failed.
    #[error("reading profiler output: {0}")]
    Parser(#[source] io::Error),
}

/// How the supervisor stopped for good.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StopReason {
    /// The last run exited cleanly.
    Success,
    /// The last run failed; holds the rendered error.
    Error(String),
    /// Shutdown was requested.
    Cancelled,
}

fn check_args(args: &[OsString]) -> Result<(), ProfilerError> {
    for arg in args {
        let Some(arg) = arg.to_str() else {
            continue;
        };
        let name = arg.split_once('=').map_or(arg, |(name, _)| name);
        if FORBIDDEN_ARGS.contains(&name) {
            return Err(ProfilerError::ForbiddenArgument(arg.to_owned()));
        }
    }
    Ok(())
}

/// Builds a [`Profiler`]. Fails at [`ProfilerBuilder::build`] if no command
/// was set or the arguments redirect the profiler's output.
#[derive(Debug, Default)]
pub struct ProfilerBuilder {
    program: Option<OsString>,
    args: Vec<OsString>,
    restart_policy: RestartPolicy,
    restart_delay: Option<Duration>,
    kill_timeout: Option<Duration>,
    parser: Option<TraceParser>,
}

impl ProfilerBuilder {
    /// Sets the profiler command line.
    pub fn with_command<P, I, A>(mut self, program: P, args: I) -> ProfilerBuilder
    where
        P: Into<OsString>,
        I: IntoIterator<Item = A>,
        A: Into<OsString>,
    {
        self.program = Some(program.into());
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    /// Sets the restart policy.
    pub fn with_restart_policy(mut self, p: RestartPolicy) -> ProfilerBuilder {
        self.restart_policy = p;
        self
    }

    /// Sets the pause between a profiler exit and its restart.
    pub fn with_restart_delay(mut self, d: Duration) -> ProfilerBuilder {
        self.restart_delay = Some(d);
        self
    }

    /// Sets how long a profiler gets to exit after SIGTERM before it is
    /// killed.
    pub fn with_kill_timeout(mut self, d: Duration) -> ProfilerBuilder {
        self.kill_timeout = Some(d);
        self
    }

    /// Sets the parser for the profiler's output.
    pub fn with_parser(mut self, p: TraceParser) -> ProfilerBuilder {
        self.parser = Some(p);
        self
    }

    /// Turn this builder into a profiler!
    pub fn build(self) -> Result<Profiler, ProfilerError> {
        let program = self.program.ok_or(ProfilerError::MissingCommand)?;
        check_args(&self.args)?;
        Ok(Profiler {
            program,
            args: self.args,
            restart_policy: self.restart_policy,
            restart_delay: self.restart_delay.unwrap_or(Duration::from_secs(1)),
            kill_timeout: self.kill_timeout.unwrap_or(Duration::from_secs(5)),
            parser: self.parser.unwrap_or_default(),
            status: Mutex::new(Status::Idle),
        })
    }
}

/// Where the supervisor is in the profiler's lifecycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Status {
    /// Not started yet.
    Idle,
    /// Spawning the process.
    Starting,
    /// The process is up.
    Running {
        /// Process id, if the OS reported one.
        pid: Option<u32>,
        /// When this run started.
        since: SystemTime,
    },
    /// Waiting out the restart delay.
    Restarting,
    /// Done for good.
    Stopped(StopReason),
}

enum RunOutcome {
    Exited(Result<ParseSummary, ProfilerError>),
    Cancelled,
}

fn join_parser(
    joined: Result<Result<ParseSummary, io::Error>, tokio::task::JoinError>,
) -> Result<ParseSummary, io::Error> {
    match joined {
        Ok(result) => result,
        // a parser panic is a bug; let it reach the task boundary
        Err(err) if err.is_panic() => std::panic::resume_unwind(err.into_panic()),
        Err(err) => Err(io::Error::other(err)),
    }
}

/// Runs the external profiler, feeds its stdout to a [`TraceParser`], and
/// restarts it according to its [`RestartPolicy`].
#[derive(Debug)]
pub struct Profiler {
    program: OsString,
    args: Vec<OsString>,
    restart_policy: RestartPolicy,
    restart_delay: Duration,
    kill_timeout: Duration,
    parser: TraceParser,
    status: Mutex<Status>,
}

impl Profiler {
    /// Start building a profiler.
    pub fn builder() -> ProfilerBuilder {
        ProfilerBuilder::default()
    }

    /// The configured restart policy.
    pub fn restart_policy(&self) -> RestartPolicy {
        self.restart_policy
    }

    /// Snapshot of the current lifecycle state.
    pub fn status(&self) -> Status {
        self.status.lock().clone()
    }

    fn set_status(&self, status: Status) {
        tracing::debug!(?status, "profiler status changed");
        *self.status.lock() = status;
    }

    /// Supervise the profiler until the restart policy says stop or `cancel`
    /// fires. Samples go to `samples`; the sender is dropped on return.
    pub async fn run(
        &self,
        samples: mpsc::Sender<Sample>,
        cancel: CancellationToken,
    ) -> StopReason {
        loop {
            self.set_status(Status::Starting);
            let result = match self.run_once(&samples, &cancel).await {
                RunOutcome::Cancelled => {
                    tracing::info!("profiler supervisor cancelled");
                    self.set_status(Status::Stopped(StopReason::Cancelled));
                    return StopReason::Cancelled;
                }
                RunOutcome::Exited(result) => result,
            };

            match &result {
                Ok(summary) => tracing::info!(
                    samples = summary.samples,
                    dropped = summary.dropped,
                    "profiler exited cleanly"
                ),
                Err(err @ ProfilerError::Spawn(_)) => tracing::error!(%err, "profiler failed"),
                Err(err) => tracing::warn!(%err, "profiler failed"),
            }

            let exit_was_error = result.is_err();
            if !self.restart_policy.should_restart(exit_was_error) {
                let reason = match result {
                    Ok(_) => StopReason::Success,
                    Err(err) => StopReason::Error(err.to_string()),
                };
                tracing::info!(
                    ?reason,
                    policy = %self.restart_policy,
                    "not restarting profiler"
                );
                self.set_status(Status::Stopped(reason.clone()));
                return reason;
            }

            tracing::info!(
                delay = ?self.restart_delay,
                policy = %self.restart_policy,
                "restarting profiler"
            );
            self.set_status(Status::Restarting);
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    self.set_status(Status::Stopped(StopReason::Cancelled));
                    return StopReason::Cancelled;
                }
                _ = tokio::time::sleep(self.restart_delay) => {}
            }
        }
    }

    async fn run_once(
        &self,
        samples: &mpsc::Sender<Sample>,
        cancel: &CancellationToken,
    ) -> RunOutcome {
        if cancel.is_cancelled() {
            return RunOutcome::Cancelled;
        }

        let mut child = match Command::new(&self.program)
            .args(&self.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
        {
            Ok(child) => child,
            Err(err) => return RunOutcome::Exited(Err(ProfilerError::Spawn(err))),
        };
        let Some(stdout) = child.stdout.take() else {
            self.terminate(&mut child).await;
            return RunOutcome::Exited(Err(ProfilerError::NoStdout));
        };

        let pid = child.id();
        tracing::info!(?pid, program = ?self.program, "profiler started");
        self.set_status(Status::Running {
            pid,
            since: SystemTime::now(),
        });

        let parser = self.parser.clone();
        let tx = samples.clone();
        let parser_cancel = cancel.clone();
        let mut parse_task: JoinHandle<Result<ParseSummary, io::Error>> = tokio::spawn(async move {
            parser
                .run(BufReader::new(stdout), tx, parser_cancel)
                .await
        });

        let mut parsed = None;
        let exit = loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    self.terminate(&mut child).await;
                    // the parser watches the same token
                    let _ = join_parser(parse_task.await);
                    return RunOutcome::Cancelled;
                }
                joined = &mut parse_task, if parsed.is_none() => {
                    let result = join_parser(joined);
                    if let Err(err) = &result {
                        tracing::warn!(%err, "profiler output unreadable, stopping profiler");
                        self.terminate(&mut child).await;
                    }
                    parsed = Some(result);
                }
                exit = child.wait() => break exit,
            }
        };

        let parsed = match parsed {
            Some(parsed) => parsed,
            // stdout may still hold buffered traces
            None => join_parser(parse_task.await),
        };

        let result = match exit {
            Err(err) => Err(ProfilerError::Wait(err)),
            Ok(exit) if !exit.success() => Err(ProfilerError::Exited(exit)),
            Ok(_) => parsed.map_err(ProfilerError::Parser),
        };
        RunOutcome::Exited(result)
    }

    /// SIGTERM, then SIGKILL after the kill timeout.
    async fn terminate(&self, child: &mut Child) {
        #[cfg(unix)]
        if let Some(pid) = child.id() {
            // SAFETY: kill(2) has no memory-safety requirements; the pid is our
            // own unreaped child.
            let rc = unsafe { libc::kill(pid as libc::pid_t, libc::SIGTERM) };
            if rc == 0 {
                match tokio::time::timeout(self.kill_timeout, child.wait()).await {
                    Ok(_) => return,
                    Err(_) => tracing::warn!(
                        pid,
                        timeout = ?self.kill_timeout,
                        "profiler ignored SIGTERM, killing it"
                    ),
                }
            }
        }
        if let Err(err) = child.kill().await {
            tracing::warn!(?err, "unable to kill profiler");
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use std::time::Instant;

    use test_case::test_case;

    use super::*;

    const ONE_TRACE: &str = "printf '0 a <internal>:-1\\n1 b /x.php:1\\n\\n'";

    fn sh(script: &str, policy: RestartPolicy) -> Profiler {
        Profiler::builder()
            .with_command("sh", ["-c", script])
            .with_restart_policy(policy)
            .with_restart_delay(Duration::from_millis(10))
            .with_kill_timeout(Duration::from_millis(200))
            .build()
            .unwrap()
    }

    #[test_case(RestartPolicy::Always, false, true)]
    #[test_case(RestartPolicy::Always, true, true)]
    #[test_case(RestartPolicy::OnError, false, false)]
    #[test_case(RestartPolicy::OnError, true, true)]
    #[test_case(RestartPolicy::OnSuccess, false, true)]
    #[test_case(RestartPolicy::OnSuccess, true, false)]
    #[test_case(RestartPolicy::Never, false, false)]
    #[test_case(RestartPolicy::Never, true, false)]
    fn test_should_restart(policy: RestartPolicy, exit_was_error: bool, expected: bool) {
        assert_eq!(policy.should_restart(exit_was_error), expected);
    }

    #[test]
    fn test_parse_policy() {
        for policy in [
            RestartPolicy::Always,
            RestartPolicy::OnError,
            RestartPolicy::OnSuccess,
            RestartPolicy::Never,
        ] {
            assert_eq!(policy.to_string().parse::<RestartPolicy>(), Ok(policy));
        }
        assert!("sometimes".parse::<RestartPolicy>().is_err());
        assert_eq!(RestartPolicy::default(), RestartPolicy::Never);
    }

    #[test_case(&["-o", "out.txt"]; "short")]
    #[test_case(&["--output", "out.txt"]; "long")]
    #[test_case(&["--pid", "1", "--output=out.txt"]; "long with value")]
    fn test_forbidden_args(args: &[&str]) {
        let err = Profiler::builder()
            .with_command("phpspy", args.iter().copied())
            .build()
            .unwrap_err();
        assert!(matches!(err, ProfilerError::ForbiddenArgument(_)));
    }

    #[test]
    fn test_missing_command() {
        assert!(matches!(
            Profiler::builder().build(),
            Err(ProfilerError::MissingCommand)
        ));
    }

    #[tokio::test]
    async fn test_run_once_and_stop() {
        let (tx, mut rx) = mpsc::channel(16);
        let profiler = sh(ONE_TRACE, RestartPolicy::Never);
        assert_eq!(profiler.status(), Status::Idle);
        let reason = profiler.run(tx, CancellationToken::new()).await;
        assert_eq!(reason, StopReason::Success);
        assert_eq!(profiler.status(), Status::Stopped(StopReason::Success));
        assert_eq!(rx.recv().await.unwrap().trace, "b;a");
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_error_exit_without_restart() {
        let (tx, _rx) = mpsc::channel(16);
        let reason = sh("exit 3", RestartPolicy::OnSuccess)
            .run(tx, CancellationToken::new())
            .await;
        let StopReason::Error(message) = reason else {
            panic!("unexpected {reason:?}");
        };
        assert!(message.contains("exit status: 3"), "{message}");
    }

    #[tokio::test]
    async fn test_clean_exit_with_onerror_stops() {
        let (tx, _rx) = mpsc::channel(16);
        let reason = sh("exit 0", RestartPolicy::OnError)
            .run(tx, CancellationToken::new())
            .await;
        assert_eq!(reason, StopReason::Success);
    }

    #[tokio::test]
    async fn test_spawn_failure() {
        let (tx, _rx) = mpsc::channel(16);
        let reason = Profiler::builder()
            .with_command("/nonexistent/profiler", Vec::<String>::new())
            .build()
            .unwrap()
            .run(tx, CancellationToken::new())
            .await;
        let StopReason::Error(message) = reason else {
            panic!("unexpected {reason:?}");
        };
        assert!(message.starts_with("failed to start profiler"), "{message}");
    }

    #[test_case(RestartPolicy::Always, "exit 0"; "always")]
    #[test_case(RestartPolicy::OnError, "exit 1"; "onerror")]
    #[test_case(RestartPolicy::OnSuccess, "exit 0"; "onsuccess")]
    #[tokio::test]
    async fn test_restarts_until_cancelled(policy: RestartPolicy, exit: &str) {
        let (tx, mut rx) = mpsc::channel(16);
        let cancel = CancellationToken::new();
        let profiler = sh(&format!("{ONE_TRACE}; {exit}"), policy);
        let task = tokio::spawn({
            let cancel = cancel.clone();
            async move { profiler.run(tx, cancel).await }
        });

        for _ in 0..3 {
            let sample = tokio::time::timeout(Duration::from_secs(10), rx.recv())
                .await
                .unwrap()
                .unwrap();
            assert_eq!(sample.trace, "b;a");
        }
        cancel.cancel();
        assert_eq!(task.await.unwrap(), StopReason::Cancelled);
    }

    #[test_case("exec sleep 30"; "polite")]
    #[test_case("trap '' TERM; while :; do sleep 0.05; done"; "stubborn")]
    #[tokio::test]
    async fn test_cancel_terminates_profiler(script: &str) {
        let (tx, _rx) = mpsc::channel(16);
        let cancel = CancellationToken::new();
        let profiler = sh(script, RestartPolicy::Always);
        let task = tokio::spawn({
            let cancel = cancel.clone();
            async move { profiler.run(tx, cancel).await }
        });

        tokio::time::sleep(Duration::from_millis(200)).await;
        let start = Instant::now();
        cancel.cancel();
        let reason = tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(reason, StopReason::Cancelled);
        assert!(start.elapsed() < Duration::from_secs(5));
    }
}
