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

use crate::error::{AcquireFailure, MutexRunError, Result};
use crate::locking::acquisition::{AcquisitionPolicy, LockAcquisitionRequest};
use crate::locking::cancellation::CancellationToken;
use crate::locking::handle::LockHandle;
use crate::locking::marker::{self, MarkerState};
use crate::locking::wait_observer::LockWaitObserver;
use log::{debug, info};
use std::fs::{File, TryLockError};
use std::io;
use std::path::Path;
use std::time::SystemTime;

/// Reopen attempts when the marker is unlinked between open and lock.
const MAX_REOPEN_ATTEMPTS: usize = 3;

/// Outcome of a single, non-waiting lock attempt.
#[derive(Debug)]
pub enum LockAttempt {
    Acquired(LockHandle),
    Busy { detail: String },
}

/// Drives advisory lock acquisition on a marker file according to a policy.
#[derive(Debug, Clone, Default)]
pub struct LockController {
    policy: AcquisitionPolicy,
}

impl LockController {
    pub fn new(policy: AcquisitionPolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> &AcquisitionPolicy {
        &self.policy
    }

    /// Acquires the lock, waiting according to the policy.
    pub fn acquire(
        &self,
        path: &Path,
        cancellation: &CancellationToken,
        observer: Option<&dyn LockWaitObserver>,
    ) -> Result<LockHandle> {
        self.policy.validate()?;
        let mut request = LockAcquisitionRequest::new(path.to_path_buf(), &self.policy)
            .with_cancellation(cancellation.clone())
            .with_observer(observer);

        loop {
            if request.cancellation().is_cancelled() {
                request.notify_cancelled();
                return Err(acquisition_failed(
                    &request,
                    AcquireFailure::Cancelled,
                    "interrupted by signal",
                ));
            }

            let detail = match self.attempt(&request)? {
                LockAttempt::Acquired(handle) => {
                    debug!(
                        "Acquired lock {} after {:.3}s ({} retries)",
                        path.display(),
                        request.elapsed().as_secs_f64(),
                        request.retries()
                    );
                    request.notify_acquired();
                    return Ok(handle);
                }
                LockAttempt::Busy { detail } => detail,
            };

            if request.mode().is_non_blocking() {
                return Err(acquisition_failed(
                    &request,
                    AcquireFailure::HeldByOther,
                    &detail,
                ));
            }

            request.record_wait_start();
            if let Some(reason) = request.budget().expiry() {
                return Err(self.expired(&request, reason, &detail));
            }

            request.record_retry();
            let Some(sleep_for) = request.next_sleep_interval() else {
                let reason = request
                    .budget()
                    .expiry()
                    .unwrap_or(AcquireFailure::HeldByOther);
                return Err(self.expired(&request, reason, &detail));
            };

            // A sleep cut short by cancellation is reported at the top of the loop.
            request.cancellation().sleep(sleep_for);
        }
    }

    /// Makes exactly one attempt without waiting.
    pub fn try_acquire(&self, path: &Path) -> Result<Option<LockHandle>> {
        self.policy.validate()?;
        let request = LockAcquisitionRequest::new(path.to_path_buf(), &self.policy);
        match self.attempt(&request)? {
            LockAttempt::Acquired(handle) => Ok(Some(handle)),
            LockAttempt::Busy { .. } => Ok(None),
        }
    }

    /// Releases the lock and removes the marker.
    pub fn release(&self, mut handle: LockHandle) -> Result<()> {
        handle.release()?;
        handle.remove_marker().map(|_| ())
    }

    /// Single attempt: lock if free, take over if stale, otherwise report busy.
    fn attempt(&self, request: &LockAcquisitionRequest<'_>) -> Result<LockAttempt> {
        let path = request.path();
        let mut took_over = false;

        for _ in 0..MAX_REOPEN_ATTEMPTS {
            let file = marker::open_marker(path).map_err(|err| open_error(request, err))?;

            match file.try_lock() {
                Ok(()) => match marker::marker_state(&file, path) {
                    Ok(MarkerState::Same) => {
                        if let Err(err) = marker::touch(&file) {
                            debug!("Failed to refresh lock {}: {err}", path.display());
                        }
                        let handle = LockHandle::new(
                            path.to_path_buf(),
                            file,
                            Some(self.policy.heartbeat_interval()),
                        );
                        return Ok(LockAttempt::Acquired(handle));
                    }
                    Ok(state) => {
                        debug!(
                            "Lock {} changed underneath us ({state:?}); reopening",
                            path.display()
                        );
                        continue;
                    }
                    Err(err) => return Err(lock_io(path, err)),
                },
                Err(TryLockError::WouldBlock) => {
                    if !took_over && self.take_over_if_stale(request, &file)? {
                        took_over = true;
                        continue;
                    }
                    return Ok(LockAttempt::Busy {
                        detail: "lock is held by another process".to_string(),
                    });
                }
                Err(TryLockError::Error(err)) if err.kind() == io::ErrorKind::Interrupted => {
                    continue;
                }
                Err(TryLockError::Error(err)) => return Err(open_error(request, err)),
            }
        }

        Ok(LockAttempt::Busy {
            detail: "lock file kept changing during acquisition".to_string(),
        })
    }

    /// Removes a held marker whose mtime is older than the stale threshold.
    fn take_over_if_stale(
        &self,
        request: &LockAcquisitionRequest<'_>,
        busy: &File,
    ) -> Result<bool> {
        let path = request.path();
        let threshold = self.policy.stale_timeout();
        let age = match marker::marker_age(path, SystemTime::now()) {
            Ok(Some(age)) if age >= threshold => age,
            Ok(_) => return Ok(false),
            Err(err) => return Err(lock_io(path, err)),
        };

        // Only unlink the file we saw busy, not one a concurrent taker just created.
        if marker::marker_state(busy, path).map_err(|err| lock_io(path, err))?
            != MarkerState::Same
        {
            return Ok(false);
        }

        info!(
            "Lock {} has not been refreshed for {:.0}s (stale after {:.0}s); taking over",
            path.display(),
            age.as_secs_f64(),
            threshold.as_secs_f64()
        );
        request.notify_stale_takeover(age);
        marker::remove(path).map_err(|err| open_error(request, err))?;
        Ok(true)
    }

    fn expired(
        &self,
        request: &LockAcquisitionRequest<'_>,
        reason: AcquireFailure,
        detail: &str,
    ) -> MutexRunError {
        request.notify_timeout();
        let detail = match reason {
            AcquireFailure::TimedOut => format!(
                "{detail}; deadline of {} reached",
                request.budget().deadline()
            ),
            _ => format!(
                "{detail}; gave up after the maximum wait of {:.0}s",
                self.policy.wait_cap().as_secs_f64()
            ),
        };
        acquisition_failed(request, reason, &detail)
    }
}

fn acquisition_failed(
    request: &LockAcquisitionRequest<'_>,
    reason: AcquireFailure,
    detail: &str,
) -> MutexRunError {
    MutexRunError::LockAcquisitionFailed {
        path: request.path().to_path_buf(),
        reason,
        waited_secs: request.elapsed().as_secs_f64(),
        details: detail.to_string(),
    }
}

fn open_error(request: &LockAcquisitionRequest<'_>, err: io::Error) -> MutexRunError {
    if err.kind() == io::ErrorKind::PermissionDenied {
        acquisition_failed(request, AcquireFailure::PermissionDenied, &err.to_string())
    } else {
        lock_io(request.path(), err)
    }
}

fn lock_io(path: &Path, err: io::Error) -> MutexRunError {
    MutexRunError::LockIo {
        path: path.to_path_buf(),
        details: err.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::locking::acquisition::MIN_STALE_TIMEOUT;
    use crate::locking::timeout::LockTimeoutValue;
    use std::thread;
    use std::time::{Duration, Instant};
    use tempfile::TempDir;

    fn fast_policy() -> AcquisitionPolicy {
        AcquisitionPolicy::new()
            .with_retry_interval(Duration::from_millis(20))
            .with_max_retry_interval(Duration::from_millis(50))
    }

    #[test]
    fn acquire_creates_marker_and_release_removes_it() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("locks/build.lock");
        let controller = LockController::new(fast_policy());

        let handle = controller
            .acquire(&path, &CancellationToken::new(), None)
            .unwrap();
        assert!(path.exists());
        assert_eq!(handle.path(), path.as_path());

        controller.release(handle).unwrap();
        assert!(!path.exists());
    }

    #[test]
    fn try_acquire_returns_none_when_contended() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("build.lock");
        let controller = LockController::new(fast_policy());

        let first = controller.try_acquire(&path).unwrap().unwrap();
        assert!(controller.try_acquire(&path).unwrap().is_none());
        controller.release(first).unwrap();
        assert!(controller.try_acquire(&path).unwrap().is_some());
    }

    #[test]
    fn non_blocking_acquire_fails_fast_with_held_by_other() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("build.lock");
        let holder = LockController::new(fast_policy());
        let first = holder.try_acquire(&path).unwrap().unwrap();

        let contender = LockController::new(fast_policy().with_wait(false));
        let started = Instant::now();
        let err = contender
            .acquire(&path, &CancellationToken::new(), None)
            .unwrap_err();

        assert!(started.elapsed() < Duration::from_secs(1));
        assert_eq!(err.acquire_failure(), Some(AcquireFailure::HeldByOther));
        assert!(err.to_string().contains("build.lock"));
        holder.release(first).unwrap();
    }

    #[test]
    fn blocking_acquire_times_out() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("build.lock");
        let holder = LockController::new(fast_policy());
        let first = holder.try_acquire(&path).unwrap().unwrap();

        let contender = LockController::new(
            fast_policy().with_timeout(LockTimeoutValue::from_millis(300)),
        );
        let started = Instant::now();
        let err = contender
            .acquire(&path, &CancellationToken::new(), None)
            .unwrap_err();
        let waited = started.elapsed();

        assert_eq!(err.acquire_failure(), Some(AcquireFailure::TimedOut));
        assert!(waited >= Duration::from_millis(300));
        assert!(waited < Duration::from_secs(3));
        holder.release(first).unwrap();
    }

    #[test]
    fn wait_cap_reports_held_by_other() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("build.lock");
        let holder = LockController::new(fast_policy());
        let first = holder.try_acquire(&path).unwrap().unwrap();

        let contender =
            LockController::new(fast_policy().with_wait_cap(Duration::from_millis(150)));
        let err = contender
            .acquire(&path, &CancellationToken::new(), None)
            .unwrap_err();

        assert_eq!(err.acquire_failure(), Some(AcquireFailure::HeldByOther));
        holder.release(first).unwrap();
    }

    #[test]
    fn blocking_acquire_succeeds_after_release() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("build.lock");
        let holder = LockController::new(fast_policy());
        let first = holder.try_acquire(&path).unwrap().unwrap();

        let release_after = Duration::from_millis(200);
        let releaser = thread::spawn(move || {
            thread::sleep(release_after);
            holder.release(first).unwrap();
        });

        let contender = LockController::new(fast_policy());
        let started = Instant::now();
        let handle = contender
            .acquire(&path, &CancellationToken::new(), None)
            .unwrap();
        assert!(started.elapsed() >= Duration::from_millis(150));

        releaser.join().unwrap();
        contender.release(handle).unwrap();
        assert!(!path.exists());
    }

    #[test]
    fn cancellation_interrupts_wait() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("build.lock");
        let holder = LockController::new(fast_policy());
        let first = holder.try_acquire(&path).unwrap().unwrap();

        let token = CancellationToken::new();
        let canceller = token.clone();
        let cancel_thread = thread::spawn(move || {
            thread::sleep(Duration::from_millis(100));
            canceller.cancel();
        });

        let err = LockController::new(fast_policy())
            .acquire(&path, &token, None)
            .unwrap_err();
        assert_eq!(err.acquire_failure(), Some(AcquireFailure::Cancelled));

        cancel_thread.join().unwrap();
        holder.release(first).unwrap();
    }

    #[cfg(unix)]
    #[test]
    fn stale_marker_is_taken_over() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("build.lock");

        // A holder that never refreshes or releases its lock.
        let hung = marker::open_marker(&path).unwrap();
        hung.try_lock().unwrap();
        hung.set_modified(SystemTime::now() - Duration::from_secs(1_200))
            .unwrap();

        let controller = LockController::new(
            fast_policy()
                .with_wait(false)
                .with_stale_timeout(Duration::from_secs(600)),
        );
        let handle = controller
            .acquire(&path, &CancellationToken::new(), None)
            .unwrap();
        assert!(!marker::is_stale(
            &path,
            Duration::from_secs(600),
            SystemTime::now()
        ));

        controller.release(handle).unwrap();
        drop(hung);
    }

    #[test]
    fn fresh_held_marker_is_not_taken_over() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("build.lock");
        let hung = marker::open_marker(&path).unwrap();
        hung.try_lock().unwrap();

        let controller = LockController::new(
            fast_policy()
                .with_wait(false)
                .with_stale_timeout(Duration::from_secs(600)),
        );
        assert!(controller.try_acquire(&path).unwrap().is_none());
        drop(hung);
    }

    #[test]
    fn sub_minimum_stale_threshold_is_rejected_before_locking() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("build.lock");

        for stale in [Duration::ZERO, Duration::from_millis(50)] {
            let controller = LockController::new(fast_policy().with_stale_timeout(stale));
            let err = controller
                .acquire(&path, &CancellationToken::new(), None)
                .unwrap_err();
            assert!(matches!(err, MutexRunError::InvalidConfig(_)));
            assert!(controller.try_acquire(&path).is_err());
        }
        assert!(!path.exists());
    }

    #[test]
    fn live_holder_survives_minimum_stale_threshold() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("build.lock");
        let policy = fast_policy()
            .with_wait(false)
            .with_stale_timeout(MIN_STALE_TIMEOUT);
        let controller = LockController::new(policy.clone());

        let holder = controller
            .acquire(&path, &CancellationToken::new(), None)
            .unwrap();

        // Contend for several thresholds; the heartbeat keeps the marker fresh.
        let until = Instant::now() + MIN_STALE_TIMEOUT * 4;
        while Instant::now() < until {
            let err = LockController::new(policy.clone())
                .acquire(&path, &CancellationToken::new(), None)
                .unwrap_err();
            assert_eq!(err.acquire_failure(), Some(AcquireFailure::HeldByOther));
            thread::sleep(Duration::from_millis(30));
        }

        controller.release(holder).unwrap();
    }
}
