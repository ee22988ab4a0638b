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

use crate::error::{MutexRunError, Result};
use crate::locking::marker;
use log::{debug, warn};
use std::fs::File;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::mpsc::{self, RecvTimeoutError, Sender};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

/// What happened to the marker file during cleanup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MarkerRemoval {
    Removed,
    AlreadyGone,
    /// Another process locked the marker after release; it now owns the file.
    HeldByOther,
    /// The path names a different file than the one this handle locked.
    Replaced,
}

/// Periodically refreshes the marker mtime while the lock is held.
#[derive(Debug)]
struct Heartbeat {
    stop: Option<Sender<()>>,
    thread: Option<JoinHandle<()>>,
}

impl Heartbeat {
    fn start(file: &File, path: &Path, interval: Duration) -> Option<Self> {
        let file = match file.try_clone() {
            Ok(file) => file,
            Err(err) => {
                warn!(
                    "Failed to start heartbeat for lock {}: {err}",
                    path.display()
                );
                return None;
            }
        };

        let (stop, stopped) = mpsc::channel::<()>();
        let label = path.display().to_string();
        let spawned = thread::Builder::new()
            .name("mutex-run-heartbeat".to_string())
            .spawn(move || {
                while let Err(RecvTimeoutError::Timeout) = stopped.recv_timeout(interval) {
                    if let Err(err) = marker::touch(&file) {
                        debug!("Failed to refresh lock {label}: {err}");
                    }
                }
            });

        match spawned {
            Ok(thread) => Some(Self {
                stop: Some(stop),
                thread: Some(thread),
            }),
            Err(err) => {
                warn!(
                    "Failed to start heartbeat for lock {}: {err}",
                    path.display()
                );
                None
            }
        }
    }

    fn stop(&mut self) {
        drop(self.stop.take());
        if let Some(thread) = self.thread.take()
            && thread.join().is_err()
        {
            warn!("Lock heartbeat thread panicked");
        }
    }
}

impl Drop for Heartbeat {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Capability proving this process holds the advisory lock on a marker.
#[derive(Debug)]
pub struct LockHandle {
    path: PathBuf,
    file: Option<File>,
    heartbeat: Option<Heartbeat>,
    acquired_at: Instant,
    released: bool,
}

impl LockHandle {
    pub(crate) fn new(path: PathBuf, file: File, heartbeat_interval: Option<Duration>) -> Self {
        let heartbeat =
            heartbeat_interval.and_then(|interval| Heartbeat::start(&file, &path, interval));
        Self {
            path,
            file: Some(file),
            heartbeat,
            acquired_at: Instant::now(),
            released: false,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn held_for(&self) -> Duration {
        self.acquired_at.elapsed()
    }

    pub fn is_released(&self) -> bool {
        self.released
    }

    /// Drops the advisory lock. The marker file stays open until
    /// [`remove_marker`](Self::remove_marker) or drop.
    pub fn release(&mut self) -> Result<()> {
        if self.released {
            return Ok(());
        }

        if let Some(mut heartbeat) = self.heartbeat.take() {
            heartbeat.stop();
        }
        self.released = true;

        let Some(file) = self.file.as_ref() else {
            return Ok(());
        };

        file.unlock().map_err(|err| {
            debug!(
                "Failed to release advisory lock {}: {err}",
                self.path.display()
            );
            MutexRunError::LockRelease {
                path: self.path.clone(),
                details: err.to_string(),
            }
        })?;

        debug!(
            "Released lock {} after {:.3}s",
            self.path.display(),
            self.held_for().as_secs_f64()
        );
        Ok(())
    }

    /// Removes the marker after release, unless another process has claimed it.
    ///
    /// Releases first if that has not happened yet. Calling it again is a no-op.
    pub fn remove_marker(&mut self) -> Result<MarkerRemoval> {
        if !self.released {
            self.release()?;
        }

        let Some(file) = self.file.take() else {
            return Ok(MarkerRemoval::AlreadyGone);
        };

        let outcome = remove_released_marker(&self.path, file)?;
        debug!("Lock file {} cleanup: {outcome:?}", self.path.display());
        Ok(outcome)
    }
}

impl Drop for LockHandle {
    fn drop(&mut self) {
        if self.released {
            return;
        }

        if let Some(mut heartbeat) = self.heartbeat.take() {
            heartbeat.stop();
        }

        if let Some(file) = self.file.take() {
            if let Err(err) = file.unlock() {
                warn!(
                    "Failed to unlock {} during drop: {err}",
                    self.path.display()
                );
            } else {
                debug!(
                    "Released lock {} on drop after {:.3}s",
                    self.path.display(),
                    self.held_for().as_secs_f64()
                );
            }
        }

        self.released = true;
    }
}

/// Unlinks the marker while briefly re-holding it, so a waiter that already
/// locked the released file keeps a valid marker.
#[cfg(unix)]
fn remove_released_marker(path: &Path, file: File) -> Result<MarkerRemoval> {
    use crate::locking::marker::MarkerState;
    use std::fs::TryLockError;

    match file.try_lock() {
        Ok(()) => {}
        Err(TryLockError::WouldBlock) => return Ok(MarkerRemoval::HeldByOther),
        Err(TryLockError::Error(err)) => return Err(removal_error(path, err)),
    }

    let state = marker::marker_state(&file, path).map_err(|err| removal_error(path, err))?;
    let outcome = match state {
        MarkerState::Same => {
            if marker::remove(path).map_err(|err| removal_error(path, err))? {
                MarkerRemoval::Removed
            } else {
                MarkerRemoval::AlreadyGone
            }
        }
        MarkerState::Replaced => MarkerRemoval::Replaced,
        MarkerState::Missing => MarkerRemoval::AlreadyGone,
    };

    // Closing the descriptor drops the short re-lock.
    drop(file);
    Ok(outcome)
}

#[cfg(not(unix))]
fn remove_released_marker(path: &Path, file: File) -> Result<MarkerRemoval> {
    drop(file);
    match marker::remove(path) {
        Ok(true) => Ok(MarkerRemoval::Removed),
        Ok(false) => Ok(MarkerRemoval::AlreadyGone),
        Err(err) => Err(removal_error(path, err)),
    }
}

fn removal_error(path: &Path, err: io::Error) -> MutexRunError {
    MutexRunError::MarkerRemoval {
        path: path.to_path_buf(),
        details: err.to_string(),
    }
}
