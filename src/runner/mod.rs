// Copyright 2025 dentsusoken
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Running a command while holding the lock.
//!
//! A run acquires the marker, launches the child, waits for it while relaying
//! signals, and then releases the lock and removes the marker. Cleanup happens
//! on every path that obtained the lock, including launch failures and
//! interruptions.

mod cleanup;

pub use cleanup::{CleanupCoordinator, RunState};

use crate::config::MutexRunConfig;
use crate::diagnostics::{DiagnosticSink, LogSink};
use crate::error::{EXIT_FAILURE, MutexRunError, Result};
use crate::locking::{
    AcquisitionPolicy, CancellationToken, DEFAULT_BACKOFF_FACTOR, DEFAULT_LOCK_FILE,
    DEFAULT_MAX_RETRY_INTERVAL, DEFAULT_RETRY_INTERVAL, DEFAULT_STALE_TIMEOUT, DEFAULT_WAIT_CAP,
    DiagnosticWaitObserver, ForwardedSignal, LockController, LockTimeoutValue, marker,
};
use crate::process::{self, ChildOutcome, ChildSpec, CommandLine, StdioMode};
use log::debug;
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

/// Backoff parameters for the lock wait.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetrySettings {
    pub interval: Duration,
    pub max_interval: Duration,
    pub factor: f64,
    /// Upper bound on a wait without a timeout.
    pub wait_cap: Duration,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            interval: DEFAULT_RETRY_INTERVAL,
            max_interval: DEFAULT_MAX_RETRY_INTERVAL,
            factor: DEFAULT_BACKOFF_FACTOR,
            wait_cap: DEFAULT_WAIT_CAP,
        }
    }
}

/// Options for one run.
#[derive(Clone)]
pub struct RunOptions {
    lock_file: PathBuf,
    wait: bool,
    timeout: LockTimeoutValue,
    stale_timeout: Duration,
    retry: RetrySettings,
    cwd: Option<PathBuf>,
    env: BTreeMap<String, String>,
    shell: Option<bool>,
    stdio: StdioMode,
    sink: Arc<dyn DiagnosticSink>,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            lock_file: PathBuf::from(DEFAULT_LOCK_FILE),
            wait: true,
            timeout: LockTimeoutValue::Infinite,
            stale_timeout: DEFAULT_STALE_TIMEOUT,
            retry: RetrySettings::default(),
            cwd: None,
            env: BTreeMap::new(),
            shell: None,
            stdio: StdioMode::Inherit,
            sink: Arc::new(LogSink),
        }
    }
}

impl fmt::Debug for RunOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RunOptions")
            .field("lock_file", &self.lock_file)
            .field("wait", &self.wait)
            .field("timeout", &self.timeout)
            .field("stale_timeout", &self.stale_timeout)
            .field("retry", &self.retry)
            .field("cwd", &self.cwd)
            .field("env", &self.env)
            .field("shell", &self.shell)
            .field("stdio", &self.stdio)
            .finish_non_exhaustive()
    }
}

impl RunOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Options seeded from loaded configuration.
    pub fn from_config(config: &MutexRunConfig) -> Self {
        let lock = &config.lock;
        Self::default()
            .with_lock_file(&lock.file)
            .with_wait(lock.wait)
            .with_timeout(lock.timeout())
            .with_stale_timeout(lock.stale_timeout())
            .with_retry(lock.retry_settings())
            .with_shell(config.process.shell)
    }

    pub fn with_lock_file(mut self, path: impl AsRef<Path>) -> Self {
        self.lock_file = path.as_ref().to_path_buf();
        self
    }

    pub fn with_wait(mut self, wait: bool) -> Self {
        self.wait = wait;
        self
    }

    pub fn with_timeout(mut self, timeout: LockTimeoutValue) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_stale_timeout(mut self, stale_timeout: Duration) -> Self {
        self.stale_timeout = stale_timeout;
        self
    }

    pub fn with_retry(mut self, retry: RetrySettings) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_cwd(mut self, cwd: impl AsRef<Path>) -> Self {
        self.cwd = Some(cwd.as_ref().to_path_buf());
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    /// `None` keeps the default: shell for string commands (and on Windows).
    pub fn with_shell(mut self, shell: Option<bool>) -> Self {
        self.shell = shell;
        self
    }

    pub fn with_stdio(mut self, stdio: StdioMode) -> Self {
        self.stdio = stdio;
        self
    }

    pub fn with_sink(mut self, sink: Arc<dyn DiagnosticSink>) -> Self {
        self.sink = sink;
        self
    }

    pub fn lock_file(&self) -> &Path {
        &self.lock_file
    }

    pub fn wait(&self) -> bool {
        self.wait
    }

    pub fn timeout(&self) -> LockTimeoutValue {
        self.timeout
    }

    pub fn stale_timeout(&self) -> Duration {
        self.stale_timeout
    }

    pub fn retry(&self) -> RetrySettings {
        self.retry
    }

    pub fn stdio(&self) -> StdioMode {
        self.stdio
    }

    pub fn shell(&self) -> Option<bool> {
        self.shell
    }

    pub fn policy(&self) -> AcquisitionPolicy {
        AcquisitionPolicy::new()
            .with_wait(self.wait)
            .with_timeout(self.timeout)
            .with_stale_timeout(self.stale_timeout)
            .with_retry_interval(self.retry.interval)
            .with_max_retry_interval(self.retry.max_interval)
            .with_backoff_factor(self.retry.factor)
            .with_wait_cap(self.retry.wait_cap)
    }

    fn child_spec(&self, command: CommandLine) -> Result<ChildSpec> {
        Ok(ChildSpec::new(command)?
            .with_cwd(self.cwd.clone())
            .with_envs(&self.env)
            .with_stdio(self.stdio)
            .with_shell(self.shell))
    }
}

/// Outcome of a run that obtained the lock.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunResult {
    pub exit_code: i32,
    /// Present only with [`StdioMode::Pipe`].
    pub stdout: Option<String>,
    /// Present only with [`StdioMode::Pipe`].
    pub stderr: Option<String>,
}

impl RunResult {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    fn failure(stdio: StdioMode, message: Option<String>) -> Self {
        let captured = stdio == StdioMode::Pipe;
        Self {
            exit_code: EXIT_FAILURE,
            stdout: captured.then(String::new),
            stderr: captured.then(|| message.unwrap_or_default()),
        }
    }
}

impl From<ChildOutcome> for RunResult {
    fn from(outcome: ChildOutcome) -> Self {
        Self {
            exit_code: outcome.exit_code,
            stdout: outcome.stdout,
            stderr: outcome.stderr,
        }
    }
}

/// Runs `command` under the lock described by `options`.
///
/// Signals are not observed; use [`Runner::with_cancellation`] together with
/// [`CancellationToken::register_process_signals`] for that.
pub fn run(command: impl Into<CommandLine>, options: RunOptions) -> Result<RunResult> {
    Runner::new(options).run(command)
}

/// A configured run with its cancellation context.
#[derive(Debug, Clone)]
pub struct Runner {
    options: RunOptions,
    cancellation: CancellationToken,
}

impl Runner {
    pub fn new(options: RunOptions) -> Self {
        Self {
            options,
            cancellation: CancellationToken::new(),
        }
    }

    pub fn with_cancellation(mut self, cancellation: CancellationToken) -> Self {
        self.cancellation = cancellation;
        self
    }

    pub fn options(&self) -> &RunOptions {
        &self.options
    }

    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancellation
    }

    /// Acquires the lock, runs the command and cleans up.
    ///
    /// Fails only when the command is empty, the options are invalid, or the
    /// lock cannot be obtained. Once the lock is held every outcome, including
    /// a launch failure, is reported as a [`RunResult`].
    pub fn run(&self, command: impl Into<CommandLine>) -> Result<RunResult> {
        let spec = self.options.child_spec(command.into())?;
        let policy = self.options.policy();
        policy.validate()?;
        let lock_path = marker::resolve_lock_path(&self.options.lock_file).map_err(|err| {
            MutexRunError::LockIo {
                path: self.options.lock_file.clone(),
                details: format!("cannot resolve lock path: {err}"),
            }
        })?;

        let sink = self.options.sink.as_ref();
        let mut coordinator = CleanupCoordinator::new(sink);
        coordinator.begin_acquire();
        sink.verbose(&format!("Acquiring lock {}", lock_path.display()));

        let observer = DiagnosticWaitObserver::new(sink);
        let controller = LockController::new(policy);
        let handle = match controller.acquire(&lock_path, &self.cancellation, Some(&observer)) {
            Ok(handle) => handle,
            Err(err) => {
                coordinator.acquire_failed();
                return Err(err);
            }
        };
        coordinator.acquired(handle);

        let result = self.run_child(&spec, &mut coordinator);
        coordinator.cleanup(result.interrupted_by);
        debug!(
            "Run of {} finished with {} ({})",
            spec.program_label(),
            result.result.exit_code,
            coordinator.state()
        );
        Ok(result.result)
    }

    fn run_child(&self, spec: &ChildSpec, coordinator: &mut CleanupCoordinator<'_>) -> ChildRun {
        let sink = self.options.sink.as_ref();
        let stdio = spec.stdio();

        let pending = self.cancellation.take_pending();
        if let Some(signal) = pending.last().copied() {
            sink.info(&format!(
                "Received {signal} before {} started; not running it",
                spec.program_label()
            ));
            coordinator.failed();
            return ChildRun {
                result: RunResult::failure(stdio, None),
                interrupted_by: Some(signal),
            };
        }
        if self.cancellation.is_cancelled() {
            sink.info(&format!(
                "Cancelled before {} started; not running it",
                spec.program_label()
            ));
            coordinator.failed();
            return ChildRun {
                result: RunResult::failure(stdio, None),
                interrupted_by: None,
            };
        }

        coordinator.running();
        let child = match process::spawn(spec, sink) {
            Ok(child) => child,
            Err(err) => {
                sink.error(&err.to_string());
                coordinator.failed();
                return ChildRun {
                    result: RunResult::failure(stdio, Some(err.to_string())),
                    interrupted_by: None,
                };
            }
        };

        match child.wait(&self.cancellation, sink) {
            Ok(outcome) => {
                coordinator.completed();
                let interrupted_by = outcome.interrupted_by;
                ChildRun {
                    result: outcome.into(),
                    interrupted_by,
                }
            }
            Err(err) => {
                sink.error(&err.to_string());
                coordinator.failed();
                ChildRun {
                    result: RunResult::failure(stdio, Some(err.to_string())),
                    interrupted_by: None,
                }
            }
        }
    }
}

struct ChildRun {
    result: RunResult,
    interrupted_by: Option<ForwardedSignal>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::diagnostics::{DiagnosticLevel, MemorySink};
    use crate::error::AcquireFailure;
    use std::time::Instant;
    use tempfile::TempDir;

    fn options(temp: &TempDir) -> RunOptions {
        RunOptions::new()
            .with_lock_file(temp.path().join("run.lock"))
            .with_stdio(StdioMode::Pipe)
    }

    #[test]
    fn defaults_match_documented_values() {
        let options = RunOptions::default();
        assert_eq!(options.lock_file(), Path::new(".mutex-run.lock"));
        assert!(options.wait());
        assert!(options.timeout().is_infinite());
        assert_eq!(options.stale_timeout(), Duration::from_millis(600_000));
        assert_eq!(options.stdio(), StdioMode::Inherit);
        assert_eq!(options.shell(), None);

        let retry = options.retry();
        assert_eq!(retry.interval, Duration::from_millis(1_000));
        assert_eq!(retry.max_interval, Duration::from_millis(3_000));
        assert_eq!(retry.wait_cap, Duration::from_secs(3_600));
    }

    #[test]
    fn zero_stale_timeout_is_rejected_before_locking() {
        let temp = TempDir::new().unwrap();
        for stale in [Duration::ZERO, Duration::from_millis(99)] {
            let options = options(&temp).with_stale_timeout(stale);
            let err = run(["echo", "never"], options).unwrap_err();
            assert!(matches!(err, MutexRunError::InvalidConfig(_)));
            assert_eq!(crate::error::get_exit_code(&err), 2);
        }
        assert!(!temp.path().join("run.lock").exists());
    }

    #[test]
    #[cfg(unix)]
    fn successful_run_removes_marker() {
        let temp = TempDir::new().unwrap();
        let result = run(["echo", "hello"], options(&temp)).unwrap();

        assert_eq!(result.exit_code, 0);
        assert!(result.success());
        assert_eq!(result.stdout.as_deref(), Some("hello\n"));
        assert!(!temp.path().join("run.lock").exists());
    }

    #[test]
    #[cfg(unix)]
    fn child_exit_code_is_returned() {
        let temp = TempDir::new().unwrap();
        let result = run(["sh", "-c", "exit 42"], options(&temp)).unwrap();

        assert_eq!(result.exit_code, 42);
        assert!(!temp.path().join("run.lock").exists());
    }

    #[test]
    #[cfg(unix)]
    fn string_commands_go_through_the_shell() {
        let temp = TempDir::new().unwrap();
        let result = run("echo $((6 * 7))", options(&temp)).unwrap();

        assert_eq!(result.stdout.as_deref(), Some("42\n"));
    }

    #[test]
    #[cfg(unix)]
    fn cwd_and_env_reach_the_child() {
        let temp = TempDir::new().unwrap();
        let work = temp.path().join("work");
        std::fs::create_dir(&work).unwrap();

        let result = run(
            "printf '%s:%s' \"$MUTEX_RUN_TEST_VALUE\" \"$(basename \"$PWD\")\"",
            options(&temp)
                .with_cwd(&work)
                .with_env("MUTEX_RUN_TEST_VALUE", "set"),
        )
        .unwrap();

        assert_eq!(result.stdout.as_deref(), Some("set:work"));
    }

    #[test]
    fn empty_command_is_rejected_before_locking() {
        let temp = TempDir::new().unwrap();
        let err = run(Vec::<String>::new(), options(&temp)).unwrap_err();

        assert!(matches!(err, MutexRunError::NoCommandSpecified));
        assert!(!temp.path().join("run.lock").exists());
    }

    #[test]
    fn launch_failure_reports_exit_code_one() {
        let temp = TempDir::new().unwrap();
        let sink = Arc::new(MemorySink::new());
        let result = run(
            ["definitely-not-a-real-program-mutex-run"],
            options(&temp)
                .with_shell(Some(false))
                .with_sink(sink.clone()),
        )
        .unwrap();

        assert_eq!(result.exit_code, 1);
        assert!(result.stderr.is_some_and(|stderr| !stderr.is_empty()));
        assert_eq!(sink.messages(DiagnosticLevel::Error).len(), 1);
        assert!(!temp.path().join("run.lock").exists());
    }

    #[test]
    fn held_lock_fails_fast_without_wait() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("run.lock");
        let controller = LockController::new(AcquisitionPolicy::new().with_wait(false));
        let mut holder = controller
            .acquire(&path, &CancellationToken::new(), None)
            .unwrap();

        let started = Instant::now();
        let err = run(["echo", "hi"], options(&temp).with_wait(false)).unwrap_err();

        assert!(started.elapsed() < Duration::from_secs(1));
        assert_eq!(err.acquire_failure(), Some(AcquireFailure::HeldByOther));
        assert!(err.to_string().contains(&path.display().to_string()));
        assert!(path.exists());
        holder.remove_marker().unwrap();
    }

    #[test]
    fn timeout_is_reported_distinctly() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("run.lock");
        let controller = LockController::new(AcquisitionPolicy::new().with_wait(false));
        let mut holder = controller
            .acquire(&path, &CancellationToken::new(), None)
            .unwrap();

        let started = Instant::now();
        let err = run(
            ["echo", "hi"],
            options(&temp).with_timeout(LockTimeoutValue::from_millis(300)),
        )
        .unwrap_err();
        let elapsed = started.elapsed();

        assert_eq!(err.acquire_failure(), Some(AcquireFailure::TimedOut));
        assert!(elapsed >= Duration::from_millis(300));
        assert!(elapsed < Duration::from_secs(3));
        holder.remove_marker().unwrap();
    }

    #[test]
    fn cancelled_token_stops_acquisition() {
        let temp = TempDir::new().unwrap();
        let token = CancellationToken::new();
        token.cancel();

        let runner = Runner::new(options(&temp)).with_cancellation(token);
        let err = runner.run(["echo", "hi"]).unwrap_err();

        assert_eq!(err.acquire_failure(), Some(AcquireFailure::Cancelled));
        assert!(!temp.path().join("run.lock").exists());
    }

    #[test]
    #[cfg(unix)]
    fn signal_after_acquire_skips_the_child() {
        let temp = TempDir::new().unwrap();
        let lock_path = temp.path().join("run.lock");
        let probe = temp.path().join("ran");
        let token = CancellationToken::new();
        let runner = Runner::new(options(&temp)).with_cancellation(token.clone());
        let spec = runner
            .options()
            .child_spec(CommandLine::from(["touch", probe.to_str().unwrap()]))
            .unwrap();

        let sink = MemorySink::new();
        let mut coordinator = CleanupCoordinator::new(&sink);
        let handle = LockController::new(AcquisitionPolicy::new().with_wait(false))
            .acquire(&lock_path, &CancellationToken::new(), None)
            .unwrap();
        coordinator.acquired(handle);

        token.cancel_with(ForwardedSignal::Interrupt);
        let child_run = runner.run_child(&spec, &mut coordinator);
        coordinator.cleanup(child_run.interrupted_by);

        assert_eq!(child_run.result.exit_code, 1);
        assert_eq!(child_run.interrupted_by, Some(ForwardedSignal::Interrupt));
        assert_eq!(coordinator.state(), RunState::CleanedUp);
        assert!(!probe.exists());
        assert!(!lock_path.exists());
    }
}
