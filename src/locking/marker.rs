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

//! Filesystem operations on the lock marker file.
//!
//! The marker is a zero-byte file whose path is the identity of the lock and
//! whose modification time is the only persisted staleness signal. Paths are
//! used as given: they are made absolute but never canonicalized, so symlinks
//! are not followed when deciding which lock a path names.

use std::fs::{self, File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

/// Lock file used when none is configured.
pub const DEFAULT_LOCK_FILE: &str = ".mutex-run.lock";

/// Whether a marker path still names the file a handle has open.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MarkerState {
    Same,
    Replaced,
    Missing,
}

/// Makes `path` absolute against the current directory without resolving symlinks.
pub fn resolve_lock_path(path: &Path) -> io::Result<PathBuf> {
    std::path::absolute(path)
}

/// Opens the marker, creating it and its parent directories when absent.
///
/// Creation is idempotent: a concurrent creator winning the race is fine.
pub fn open_marker(path: &Path) -> io::Result<File> {
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        fs::create_dir_all(parent)?;
    }

    OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(false)
        .open(path)
}

/// Age of the marker based on its modification time.
///
/// Returns `None` for a missing marker or one whose mtime lies in the future.
pub fn marker_age(path: &Path, now: SystemTime) -> io::Result<Option<Duration>> {
    let metadata = match fs::metadata(path) {
        Ok(metadata) => metadata,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(err) => return Err(err),
    };
    let modified = metadata.modified()?;
    Ok(now.duration_since(modified).ok())
}

pub fn is_stale(path: &Path, threshold: Duration, now: SystemTime) -> bool {
    matches!(marker_age(path, now), Ok(Some(age)) if age >= threshold)
}

/// Refreshes the marker mtime through an open handle.
pub fn touch(file: &File) -> io::Result<()> {
    file.set_modified(SystemTime::now())
}

/// Removes the marker; returns `false` when it was already gone.
pub fn remove(path: &Path) -> io::Result<bool> {
    match fs::remove_file(path) {
        Ok(()) => Ok(true),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(err) => Err(err),
    }
}

/// Compares the open file against whatever `path` currently names.
#[cfg(unix)]
pub fn marker_state(file: &File, path: &Path) -> io::Result<MarkerState> {
    use std::os::unix::fs::MetadataExt;

    let held = file.metadata()?;
    match fs::metadata(path) {
        Ok(current) if current.dev() == held.dev() && current.ino() == held.ino() => {
            Ok(MarkerState::Same)
        }
        Ok(_) => Ok(MarkerState::Replaced),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(MarkerState::Missing),
        Err(err) => Err(err),
    }
}

/// Compares the open file against whatever `path` currently names.
///
/// Without stable file identities this only detects a missing marker.
#[cfg(not(unix))]
pub fn marker_state(_file: &File, path: &Path) -> io::Result<MarkerState> {
    match fs::metadata(path) {
        Ok(_) => Ok(MarkerState::Same),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(MarkerState::Missing),
        Err(err) => Err(err),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn open_marker_creates_parent_directories() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("nested/dir/build.lock");

        let file = open_marker(&path).unwrap();
        assert!(path.exists());
        assert_eq!(file.metadata().unwrap().len(), 0);

        // Second open reuses the existing marker.
        let _again = open_marker(&path).unwrap();
    }

    #[test]
    fn resolve_keeps_symlinks_unresolved() {
        let path = resolve_lock_path(Path::new("locks/../build.lock")).unwrap();
        assert!(path.is_absolute());
        assert!(path.ends_with("locks/../build.lock"));
    }

    #[test]
    fn staleness_follows_mtime() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("build.lock");
        let file = open_marker(&path).unwrap();
        file.set_modified(SystemTime::now() - Duration::from_secs(120))
            .unwrap();

        let now = SystemTime::now();
        assert!(is_stale(&path, Duration::from_secs(60), now));
        assert!(!is_stale(&path, Duration::from_secs(600), now));

        touch(&file).unwrap();
        assert!(!is_stale(&path, Duration::from_secs(60), SystemTime::now()));
    }

    #[test]
    fn missing_or_future_marker_is_not_stale() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("build.lock");
        assert!(!is_stale(&path, Duration::ZERO, SystemTime::now()));

        let file = open_marker(&path).unwrap();
        file.set_modified(SystemTime::now() + Duration::from_secs(3_600))
            .unwrap();
        assert_eq!(marker_age(&path, SystemTime::now()).unwrap(), None);
    }

    #[test]
    fn remove_is_idempotent() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("build.lock");
        open_marker(&path).unwrap();

        assert!(remove(&path).unwrap());
        assert!(!remove(&path).unwrap());
    }

    #[cfg(unix)]
    #[test]
    fn marker_state_tracks_identity() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("build.lock");
        let file = open_marker(&path).unwrap();
        assert_eq!(marker_state(&file, &path).unwrap(), MarkerState::Same);

        remove(&path).unwrap();
        assert_eq!(marker_state(&file, &path).unwrap(), MarkerState::Missing);

        let _replacement = open_marker(&path).unwrap();
        assert_eq!(marker_state(&file, &path).unwrap(), MarkerState::Replaced);
    }
}
