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

//! Run a command while holding a cross-process file lock.
//!
//! ```no_run
//! use mutex_run::{RunOptions, run};
//!
//! let result = run(["npm", "install"], RunOptions::new().with_lock_file("/tmp/npm.lock"))?;
//! std::process::exit(result.exit_code);
//! # Ok::<(), mutex_run::error::MutexRunError>(())
//! ```

pub mod config;
pub mod diagnostics;
pub mod error;
pub mod locking;
pub mod logging;
pub mod process;
pub mod runner;

pub use diagnostics::DiagnosticSink;
pub use error::{MutexRunError, Result};
pub use locking::{CancellationToken, LockTimeoutValue};
pub use process::{CommandLine, StdioMode};
pub use runner::{RetrySettings, RunOptions, RunResult, Runner, run};
