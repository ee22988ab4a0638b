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

//! Helpers shared by the integration tests.

#![allow(dead_code)]

use assert_cmd::Command;
use mutex_run::locking::{AcquisitionPolicy, CancellationToken, LockController, LockHandle};
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant, SystemTime};
use tempfile::TempDir;

pub const BIN: &str = env!("CARGO_BIN_EXE_mutex-run");

/// A scratch directory that doubles as the working directory and the
/// configuration home of the binary under test.
pub struct Sandbox {
    dir: TempDir,
}

impl Sandbox {
    pub fn new() -> Self {
        Self {
            dir: TempDir::new().expect("create sandbox"),
        }
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    pub fn lock_path(&self) -> PathBuf {
        self.dir.path().join("run.lock")
    }

    /// `mutex-run` isolated from the user's configuration and environment.
    pub fn command(&self) -> Command {
        let mut command = Command::cargo_bin("mutex-run").expect("binary built");
        self.isolate(command.current_dir(self.path()));
        command
    }

    /// Same as [`command`](Self::command) but as a plain process for tests that
    /// need the pid.
    pub fn std_command(&self) -> std::process::Command {
        let mut command = std::process::Command::new(BIN);
        command.current_dir(self.path());
        for (key, value) in self.isolated_env() {
            command.env(key, value);
        }
        command
    }

    fn isolate<'a>(&self, command: &'a mut Command) -> &'a mut Command {
        for (key, value) in self.isolated_env() {
            command.env(key, value);
        }
        command
    }

    fn isolated_env(&self) -> Vec<(&'static str, PathBuf)> {
        let config_home = self.path().join("config-home");
        vec![
            ("XDG_CONFIG_HOME", config_home.clone()),
            ("HOME", config_home.clone()),
            ("APPDATA", config_home),
        ]
    }
}

/// Holds `path` through the library API until the handle is dropped or
/// released.
pub fn hold(path: &Path) -> LockHandle {
    LockController::new(AcquisitionPolicy::new().with_wait(false))
        .acquire(path, &CancellationToken::new(), None)
        .expect("acquire test lock")
}

/// Locks `path` with a bare descriptor and no heartbeat, then backdates its
/// mtime so it looks abandoned.
pub fn hold_stale(path: &Path, age: Duration) -> File {
    let file = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(false)
        .open(path)
        .expect("open marker");
    file.lock().expect("lock marker");
    file.set_modified(SystemTime::now() - age)
        .expect("backdate marker");
    file
}

/// Polls `condition` until it holds or `timeout` passes.
pub fn wait_for(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(20));
    }
    condition()
}
