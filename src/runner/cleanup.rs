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

use crate::diagnostics::DiagnosticSink;
use crate::locking::{ForwardedSignal, LockHandle};
use log::debug;
use std::fmt;

/// Lifecycle of a single run.
///
/// ```text
/// Init -> Acquiring -> Acquired -> Running -> {Completed, Failed} -> CleanedUp
///                 \-> AcquireFailed
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    Init,
    Acquiring,
    Acquired,
    Running,
    Completed,
    Failed,
    AcquireFailed,
    CleanedUp,
}

impl RunState {
    pub fn is_terminal(self) -> bool {
        matches!(self, RunState::AcquireFailed | RunState::CleanedUp)
    }
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            RunState::Init => "init",
            RunState::Acquiring => "acquiring",
            RunState::Acquired => "acquired",
            RunState::Running => "running",
            RunState::Completed => "completed",
            RunState::Failed => "failed",
            RunState::AcquireFailed => "acquire-failed",
            RunState::CleanedUp => "cleaned-up",
        };
        f.write_str(label)
    }
}

/// Owns the lock for the duration of a run and tears it down exactly once.
///
/// Teardown releases the advisory lock and then removes the marker. Failures
/// are reported at verbose level only; they never change the run's outcome.
pub struct CleanupCoordinator<'a> {
    handle: Option<LockHandle>,
    state: RunState,
    sink: &'a dyn DiagnosticSink,
}

impl<'a> CleanupCoordinator<'a> {
    pub fn new(sink: &'a dyn DiagnosticSink) -> Self {
        Self {
            handle: None,
            state: RunState::Init,
            sink,
        }
    }

    pub fn state(&self) -> RunState {
        self.state
    }

    pub fn holds_lock(&self) -> bool {
        self.handle.is_some()
    }

    pub fn begin_acquire(&mut self) {
        self.transition(RunState::Acquiring);
    }

    /// Acquisition failed: there is nothing to clean up and the marker stays.
    pub fn acquire_failed(&mut self) {
        self.transition(RunState::AcquireFailed);
    }

    pub fn acquired(&mut self, handle: LockHandle) {
        self.handle = Some(handle);
        self.transition(RunState::Acquired);
    }

    pub fn running(&mut self) {
        self.transition(RunState::Running);
    }

    pub fn completed(&mut self) {
        self.transition(RunState::Completed);
    }

    pub fn failed(&mut self) {
        self.transition(RunState::Failed);
    }

    /// Releases the lock and removes the marker. Safe to call repeatedly.
    pub fn cleanup(&mut self, signal: Option<ForwardedSignal>) {
        let Some(mut handle) = self.handle.take() else {
            return;
        };

        match signal {
            Some(signal) => self.sink.verbose(&format!(
                "Received {signal}; releasing lock {}",
                handle.path().display()
            )),
            None => self
                .sink
                .verbose(&format!("Releasing lock {}", handle.path().display())),
        }

        if let Err(err) = handle.release() {
            debug!("Cleanup release failed: {err}");
            self.sink.verbose(&format!("Cleanup: {err}"));
        }

        match handle.remove_marker() {
            Ok(outcome) => debug!("Marker {} cleanup: {outcome:?}", handle.path().display()),
            Err(err) => {
                debug!("Cleanup removal failed: {err}");
                self.sink.verbose(&format!("Cleanup: {err}"));
            }
        }

        self.transition(RunState::CleanedUp);
    }

    fn transition(&mut self, next: RunState) {
        debug!("Run state {} -> {next}", self.state);
        self.state = next;
    }
}

impl Drop for CleanupCoordinator<'_> {
    fn drop(&mut self) {
        if self.handle.is_some() {
            debug!("Cleaning up lock from drop in state {}", self.state);
            self.cleanup(None);
        }
    }
}
