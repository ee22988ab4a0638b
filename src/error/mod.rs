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

mod context;
mod exit_codes;
mod format;

pub use context::ErrorContext;
pub use exit_codes::{EXIT_FAILURE, EXIT_USAGE, get_exit_code};
pub use format::{format_error_chain, format_error_with_color};

use std::fmt;
use std::path::PathBuf;
use thiserror::Error;

/// Why a lock could not be obtained.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcquireFailure {
    /// The marker is locked by another live holder and the wait budget ran out
    /// (or waiting was disabled).
    HeldByOther,
    /// The caller's overall deadline fired before the lock was obtained.
    TimedOut,
    /// The marker or its directory could not be opened or locked.
    PermissionDenied,
    /// An interrupt or terminate signal arrived while waiting.
    Cancelled,
}

impl fmt::Display for AcquireFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            AcquireFailure::HeldByOther => "lock is held by another process",
            AcquireFailure::TimedOut => "timed out waiting for lock",
            AcquireFailure::PermissionDenied => "permission denied",
            AcquireFailure::Cancelled => "cancelled while waiting for lock",
        };
        f.write_str(label)
    }
}

#[derive(Error, Debug)]
pub enum MutexRunError {
    #[error("No command specified")]
    NoCommandSpecified,

    #[error("Failed to acquire lock {}: {reason}", path.display())]
    LockAcquisitionFailed {
        path: PathBuf,
        reason: AcquireFailure,
        waited_secs: f64,
        details: String,
    },

    #[error("Failed to lock {}: {details}", path.display())]
    LockIo { path: PathBuf, details: String },

    #[error("Failed to release lock {}: {details}", path.display())]
    LockRelease { path: PathBuf, details: String },

    #[error("Failed to remove lock file {}: {details}", path.display())]
    MarkerRemoval { path: PathBuf, details: String },

    #[error("Failed to launch '{program}': {details}")]
    ChildLaunchFailed { program: String, details: String },

    #[error("Failed to wait for child process: {0}")]
    ChildWait(String),

    #[error("Invalid duration '{0}'")]
    InvalidDuration(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl MutexRunError {
    /// Returns the acquisition failure reason when this error describes one.
    pub fn acquire_failure(&self) -> Option<AcquireFailure> {
        match self {
            MutexRunError::LockAcquisitionFailed { reason, .. } => Some(*reason),
            _ => None,
        }
    }
}

impl From<config::ConfigError> for MutexRunError {
    fn from(err: config::ConfigError) -> Self {
        MutexRunError::ConfigError(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, MutexRunError>;
