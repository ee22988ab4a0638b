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

//! Observer interfaces for lock wait instrumentation.
//!
//! Lock wait observers decouple the `LockController` from user-facing feedback
//! so callers can surface contention information without duplicating polling
//! logic.

use crate::diagnostics::DiagnosticSink;
use crate::locking::timeout::{LockTimeoutValue, format_duration};
use std::path::Path;
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Observer hooks for lock wait events.
pub trait LockWaitObserver: Send + Sync {
    fn on_wait_start(&self, _path: &Path, _timeout: LockTimeoutValue) {}

    fn on_retry(
        &self,
        _path: &Path,
        _attempt: usize,
        _elapsed: Duration,
        _remaining: Option<Duration>,
    ) {
    }

    fn on_stale_takeover(&self, _path: &Path, _age: Duration) {}

    fn on_acquired(&self, _path: &Path, _waited: Duration) {}

    fn on_timeout(&self, _path: &Path, _waited: Duration) {}

    fn on_cancelled(&self, _path: &Path, _waited: Duration) {}
}

/// Observer implementation that performs no work.
#[derive(Debug, Default)]
pub struct NoopLockWaitObserver;

impl LockWaitObserver for NoopLockWaitObserver {}

/// Bridges lock wait events to a [`DiagnosticSink`].
///
/// The first contention notice is informational; further retries are verbose
/// and throttled so a long wait does not flood the console.
pub struct DiagnosticWaitObserver<'a> {
    sink: &'a dyn DiagnosticSink,
    progress_interval: Duration,
    last_emit: Mutex<Option<Instant>>,
}

impl<'a> DiagnosticWaitObserver<'a> {
    pub fn new(sink: &'a dyn DiagnosticSink) -> Self {
        Self {
            sink,
            progress_interval: Duration::from_secs(5),
            last_emit: Mutex::new(None),
        }
    }

    pub fn with_progress_interval(mut self, interval: Duration) -> Self {
        self.progress_interval = interval;
        self
    }

    fn should_emit_progress(&self) -> bool {
        let now = Instant::now();
        let Ok(mut last_emit) = self.last_emit.lock() else {
            return false;
        };
        let emit = last_emit
            .map(|last| now.duration_since(last) >= self.progress_interval)
            .unwrap_or(true);
        if emit {
            *last_emit = Some(now);
        }
        emit
    }
}

impl LockWaitObserver for DiagnosticWaitObserver<'_> {
    fn on_wait_start(&self, path: &Path, timeout: LockTimeoutValue) {
        if let Ok(mut last_emit) = self.last_emit.lock() {
            *last_emit = Some(Instant::now());
        }
        self.sink.info(&format!(
            "Lock {} is held by another process; waiting (timeout: {timeout}). Ctrl-C to cancel.",
            path.display()
        ));
    }

    fn on_retry(
        &self,
        path: &Path,
        attempt: usize,
        elapsed: Duration,
        remaining: Option<Duration>,
    ) {
        if !self.should_emit_progress() {
            return;
        }

        let waited = format_duration(elapsed);
        let remaining_text = remaining
            .map(format_duration)
            .map(|value| format!(" (~{value} remaining)"))
            .unwrap_or_default();
        self.sink.verbose(&format!(
            "Still waiting for lock {} after {waited}{remaining_text} (attempt {attempt})",
            path.display()
        ));
    }

    fn on_stale_takeover(&self, path: &Path, age: Duration) {
        self.sink.info(&format!(
            "Taking over stale lock {} (last touched {} ago)",
            path.display(),
            format_duration(age)
        ));
    }

    fn on_acquired(&self, path: &Path, waited: Duration) {
        self.sink.verbose(&format!(
            "Acquired lock {} after {}",
            path.display(),
            format_duration(waited)
        ));
    }

    fn on_timeout(&self, path: &Path, waited: Duration) {
        self.sink.error(&format!(
            "Timed out waiting for lock {} after {}",
            path.display(),
            format_duration(waited)
        ));
    }

    fn on_cancelled(&self, path: &Path, waited: Duration) {
        self.sink.error(&format!(
            "Cancelled while waiting for lock {} after {}",
            path.display(),
            format_duration(waited)
        ));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::diagnostics::{DiagnosticLevel, MemorySink};
    use std::path::PathBuf;

    #[test]
    fn bridge_reports_wait_lifecycle() {
        let sink = MemorySink::new();
        let observer = DiagnosticWaitObserver::new(&sink).with_progress_interval(Duration::ZERO);
        let path = PathBuf::from("/tmp/build.lock");

        observer.on_wait_start(&path, LockTimeoutValue::from_millis(30_000));
        observer.on_retry(
            &path,
            1,
            Duration::from_millis(1_200),
            Some(Duration::from_secs(10)),
        );
        observer.on_acquired(&path, Duration::from_secs(2));

        let info = sink.messages(DiagnosticLevel::Info);
        assert!(info[0].contains("/tmp/build.lock"));
        assert!(info[0].contains("timeout: 30.0s"));

        let verbose = sink.messages(DiagnosticLevel::Verbose);
        assert!(verbose.iter().any(|line| line.contains("after 1.2s")));
        assert!(verbose.iter().any(|line| line.contains("~10.0s remaining")));
        assert!(verbose.iter().any(|line| line.contains("Acquired lock")));
    }

    #[test]
    fn retries_are_throttled() {
        let sink = MemorySink::new();
        let observer =
            DiagnosticWaitObserver::new(&sink).with_progress_interval(Duration::from_secs(60));
        let path = PathBuf::from("/tmp/build.lock");

        observer.on_wait_start(&path, LockTimeoutValue::Infinite);
        for attempt in 1..=5 {
            observer.on_retry(&path, attempt, Duration::from_secs(attempt as u64), None);
        }

        assert!(sink.messages(DiagnosticLevel::Verbose).is_empty());
    }

    #[test]
    fn failures_are_reported_as_errors() {
        let sink = MemorySink::new();
        let observer = DiagnosticWaitObserver::new(&sink);
        let path = PathBuf::from("/tmp/build.lock");

        observer.on_timeout(&path, Duration::from_millis(500));
        observer.on_cancelled(&path, Duration::from_millis(20));

        let errors = sink.messages(DiagnosticLevel::Error);
        assert_eq!(errors.len(), 2);
        assert!(errors[0].starts_with("Timed out"));
        assert!(errors[1].starts_with("Cancelled"));
    }
}
