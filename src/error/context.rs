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

use crate::error::{AcquireFailure, MutexRunError};
use std::fmt;
use std::path::Path;

pub struct ErrorContext<'a> {
    pub error: &'a MutexRunError,
    pub suggestion: Option<String>,
    pub details: Option<String>,
}

impl<'a> ErrorContext<'a> {
    pub fn new(error: &'a MutexRunError) -> Self {
        let (suggestion, details) = match error {
            MutexRunError::NoCommandSpecified => {
                let suggestion = Some(
                    "Pass the command after '--', e.g. mutex-run --lock build.lock -- make build"
                        .to_string(),
                );
                (suggestion, None)
            }
            MutexRunError::LockAcquisitionFailed {
                path,
                reason,
                waited_secs,
                details,
            } => {
                let suggestion = Some(lock_suggestion(path, *reason));
                let mut lines = vec![format!("Lock file: {}", path.display())];
                if *waited_secs > 0.0 {
                    lines.push(format!("Waited: {waited_secs:.1}s"));
                }
                if !details.is_empty() {
                    lines.push(format!("Reason: {details}"));
                }
                lines.push(
                    "Possible causes:\n  - another process is running the same command\n  - a \
                     stale lock was left behind by a crashed process\n  - insufficient \
                     permissions on the lock file or its directory"
                        .to_string(),
                );
                (suggestion, Some(lines.join("\n")))
            }
            MutexRunError::LockIo { path, details } => {
                let suggestion = Some(format!(
                    "Ensure {} is on a filesystem that supports file locking.",
                    path.display()
                ));
                (suggestion, Some(format!("Locking failed: {details}")))
            }
            MutexRunError::ChildLaunchFailed { program, .. } => {
                let suggestion = Some(format!(
                    "Ensure '{program}' is installed, executable and available in your PATH."
                ));
                (suggestion, None)
            }
            MutexRunError::InvalidDuration(_) => {
                let suggestion = Some(
                    "Durations are milliseconds, optionally with a unit suffix (e.g. 500, 30s, \
                     5m)."
                        .to_string(),
                );
                (suggestion, None)
            }
            MutexRunError::InvalidConfig(msg) | MutexRunError::ConfigError(msg) => {
                let suggestion = Some(
                    "Check mutex-run.toml and MUTEX_RUN_* environment variables.".to_string(),
                );
                (suggestion, Some(msg.clone()))
            }
            MutexRunError::Io(io_err) => {
                let suggestion = match io_err.kind() {
                    std::io::ErrorKind::PermissionDenied => {
                        if cfg!(unix) {
                            Some("Check file permissions.".to_string())
                        } else {
                            Some("Run as Administrator or check file permissions.".to_string())
                        }
                    }
                    std::io::ErrorKind::NotFound => Some(
                        "Ensure the file or directory exists and the path is correct.".to_string(),
                    ),
                    _ => None,
                };
                let details = Some(format!("I/O error: {io_err}"));
                (suggestion, details)
            }
            _ => (None, None),
        };

        ErrorContext {
            error,
            suggestion,
            details,
        }
    }
}

fn lock_suggestion(path: &Path, reason: AcquireFailure) -> String {
    let remove_cmd = if cfg!(windows) {
        format!("del \"{}\"", path.display())
    } else {
        format!("rm -f '{}'", path.display())
    };

    match reason {
        AcquireFailure::HeldByOther => format!(
            "Wait for the other process to finish, or rerun with --wait.\nIf no other process \
             is running, remove the stale lock: {remove_cmd}"
        ),
        AcquireFailure::TimedOut => format!(
            "Increase --timeout (0 waits without a deadline).\nIf no other process is running, \
             remove the stale lock: {remove_cmd}"
        ),
        AcquireFailure::PermissionDenied => format!(
            "Ensure you can write to {} and its directory, or choose another path with --lock.",
            path.display()
        ),
        AcquireFailure::Cancelled => "Rerun the command once you are ready to wait.".to_string(),
    }
}

impl<'a> fmt::Display for ErrorContext<'a> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Error: {}", self.error)?;

        if let Some(details) = &self.details {
            write!(f, "\n\nDetails: {details}")?;
        }

        if let Some(suggestion) = &self.suggestion {
            write!(f, "\n\nSuggestion: {suggestion}")?;
        }

        Ok(())
    }
}
