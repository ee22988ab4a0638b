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

//! Launching and awaiting the child process.

use crate::diagnostics::DiagnosticSink;
use crate::error::{EXIT_FAILURE, MutexRunError, Result};
use crate::locking::{CancellationToken, ForwardedSignal};
use crate::process::command::{ChildSpec, StdioMode};
use log::debug;
use std::io::{self, Read};
use std::process::{Child, ExitStatus};
use std::thread::{self, JoinHandle};
use std::time::Duration;

const POLL_INTERVAL: Duration = Duration::from_millis(20);

/// What the child left behind once it exited.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChildOutcome {
    pub exit_code: i32,
    pub stdout: Option<String>,
    pub stderr: Option<String>,
    /// The last signal relayed to the child while it ran.
    pub interrupted_by: Option<ForwardedSignal>,
}

/// A launched child together with the threads draining its pipes.
pub struct RunningChild {
    child: Child,
    program: String,
    stdout: Option<JoinHandle<String>>,
    stderr: Option<JoinHandle<String>>,
    interrupted_by: Option<ForwardedSignal>,
}

/// Starts the child described by `spec`.
pub fn spawn(spec: &ChildSpec, sink: &dyn DiagnosticSink) -> Result<RunningChild> {
    let program = spec.program_label();
    report_resolution(spec, &program, sink);

    let mut command = spec.to_command()?;
    debug!("Spawning {command:?}");
    let mut child = command
        .spawn()
        .map_err(|err| MutexRunError::ChildLaunchFailed {
            program: program.clone(),
            details: err.to_string(),
        })?;

    let (stdout, stderr) = match spec.stdio() {
        StdioMode::Inherit => (None, None),
        StdioMode::Pipe => (
            child.stdout.take().map(|pipe| drain("stdout", pipe)),
            child.stderr.take().map(|pipe| drain("stderr", pipe)),
        ),
    };

    sink.verbose(&format!("Started {program} (pid {})", child.id()));
    Ok(RunningChild {
        child,
        program,
        stdout,
        stderr,
        interrupted_by: None,
    })
}

impl RunningChild {
    pub fn id(&self) -> u32 {
        self.child.id()
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    /// Relays `signal` to the child as-is.
    #[cfg(unix)]
    pub fn forward_signal(&mut self, signal: ForwardedSignal) -> io::Result<()> {
        use nix::sys::signal::{Signal, kill};
        use nix::unistd::Pid;

        let raw = match signal {
            ForwardedSignal::Interrupt => Signal::SIGINT,
            ForwardedSignal::Terminate => Signal::SIGTERM,
        };
        let pid = i32::try_from(self.child.id())
            .map_err(|err| io::Error::new(io::ErrorKind::InvalidInput, err))?;
        kill(Pid::from_raw(pid), raw).map_err(io::Error::from)
    }

    /// Windows has no signal delivery to a single process: terminate kills the
    /// child and interrupt is left to the console it shares with us.
    #[cfg(windows)]
    pub fn forward_signal(&mut self, signal: ForwardedSignal) -> io::Result<()> {
        match signal {
            ForwardedSignal::Interrupt => Ok(()),
            ForwardedSignal::Terminate => self.child.kill(),
        }
    }

    /// Blocks until the child exits, relaying signals that reach `cancellation`.
    pub fn wait(
        mut self,
        cancellation: &CancellationToken,
        sink: &dyn DiagnosticSink,
    ) -> Result<ChildOutcome> {
        let status = loop {
            self.relay_pending(cancellation, sink);

            match self.child.try_wait() {
                Ok(Some(status)) => break status,
                Ok(None) => thread::sleep(POLL_INTERVAL),
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => {
                    return Err(MutexRunError::ChildWait(format!(
                        "failed to wait for {}: {err}",
                        self.program
                    )));
                }
            }
        };

        let exit_code = normalize_exit(&status);
        debug!("{} exited with {status}; reporting {exit_code}", self.program);

        Ok(ChildOutcome {
            exit_code,
            stdout: self.stdout.take().map(collect),
            stderr: self.stderr.take().map(collect),
            interrupted_by: self.interrupted_by,
        })
    }

    fn relay_pending(&mut self, cancellation: &CancellationToken, sink: &dyn DiagnosticSink) {
        for signal in cancellation.take_pending() {
            self.interrupted_by = Some(signal);
            let pid = self.child.id();
            match self.forward_signal(signal) {
                Ok(()) => sink.verbose(&format!("Forwarded {signal} to pid {pid}")),
                Err(err) => {
                    debug!("Failed to forward {signal} to pid {pid}: {err}");
                    sink.verbose(&format!("Could not forward {signal} to pid {pid}: {err}"));
                }
            }
        }
    }
}

/// A clean exit keeps its code; anything else becomes a generic failure.
pub fn normalize_exit(status: &ExitStatus) -> i32 {
    if let Some(code) = status.code() {
        return code;
    }

    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            debug!("Child terminated by signal {signal}");
        }
    }

    EXIT_FAILURE
}

fn report_resolution(spec: &ChildSpec, program: &str, sink: &dyn DiagnosticSink) {
    if spec.uses_shell() {
        sink.verbose(&format!("Running through the shell: {}", spec.shell_line()));
        return;
    }

    match which::which(program) {
        Ok(path) => sink.verbose(&format!("Resolved {program} to {}", path.display())),
        Err(err) => sink.verbose(&format!("Could not resolve {program} on PATH: {err}")),
    }
}

fn drain<R>(name: &'static str, mut pipe: R) -> JoinHandle<String>
where
    R: Read + Send + 'static,
{
    thread::spawn(move || {
        let mut buffer = Vec::new();
        if let Err(err) = pipe.read_to_end(&mut buffer) {
            debug!("Failed to read child {name}: {err}");
        }
        String::from_utf8_lossy(&buffer).into_owned()
    })
}

fn collect(reader: JoinHandle<String>) -> String {
    reader.join().unwrap_or_default()
}
