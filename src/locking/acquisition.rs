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
use crate::locking::cancellation::CancellationToken;
use crate::locking::timeout::{LockTimeoutValue, format_duration};
use crate::locking::wait_observer::LockWaitObserver;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

pub const DEFAULT_RETRY_INTERVAL: Duration = Duration::from_millis(1_000);
pub const DEFAULT_MAX_RETRY_INTERVAL: Duration = Duration::from_millis(3_000);
pub const DEFAULT_BACKOFF_FACTOR: f64 = 1.1;
pub const DEFAULT_STALE_TIMEOUT: Duration = Duration::from_millis(600_000);
/// Shortest interval at which a holder refreshes its marker.
pub const MIN_HEARTBEAT_INTERVAL: Duration = Duration::from_millis(100);
/// Shortest accepted stale threshold. A live holder refreshes at least twice
/// per threshold, so its marker never ages past it.
pub const MIN_STALE_TIMEOUT: Duration = Duration::from_millis(200);
/// Upper bound on any wait, including one without a deadline.
pub const DEFAULT_WAIT_CAP: Duration = Duration::from_secs(3_600);

/// Indicates whether a lock request may block waiting for contention to clear.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcquireMode {
    Blocking,
    NonBlocking,
}

impl AcquireMode {
    pub fn is_non_blocking(self) -> bool {
        matches!(self, AcquireMode::NonBlocking)
    }
}

/// Exponential backoff used while polling for locks.
///
/// Delays are computed in whole milliseconds with rounding so the sequence is
/// identical for identical parameters.
#[derive(Debug, Clone)]
pub struct PollingBackoff {
    initial: Duration,
    factor: f64,
    cap: Duration,
    current: Duration,
}

impl PollingBackoff {
    pub fn new(initial: Duration, factor: f64, cap: Duration) -> Self {
        let factor = if factor.is_finite() && factor >= 1.0 {
            factor
        } else {
            1.0
        };
        let initial = initial.min(cap);
        Self {
            initial,
            factor,
            cap,
            current: initial,
        }
    }

    /// Returns the current delay and advances the backoff sequence.
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        let next_millis = (self.current.as_millis() as f64 * self.factor).round();
        let next = if next_millis >= self.cap.as_millis() as f64 {
            self.cap
        } else {
            Duration::from_millis(next_millis as u64)
        };
        self.current = next;
        delay
    }

    pub fn reset(&mut self) {
        self.current = self.initial;
    }

    pub fn peek(&self) -> Duration {
        self.current
    }
}

impl Default for PollingBackoff {
    fn default() -> Self {
        Self::new(
            DEFAULT_RETRY_INTERVAL,
            DEFAULT_BACKOFF_FACTOR,
            DEFAULT_MAX_RETRY_INTERVAL,
        )
    }
}

/// Immutable configuration for one acquisition.
#[derive(Debug, Clone, PartialEq)]
pub struct AcquisitionPolicy {
    wait: bool,
    timeout: LockTimeoutValue,
    stale_timeout: Duration,
    retry_interval: Duration,
    max_retry_interval: Duration,
    backoff_factor: f64,
    wait_cap: Duration,
}

impl Default for AcquisitionPolicy {
    fn default() -> Self {
        Self {
            wait: true,
            timeout: LockTimeoutValue::Infinite,
            stale_timeout: DEFAULT_STALE_TIMEOUT,
            retry_interval: DEFAULT_RETRY_INTERVAL,
            max_retry_interval: DEFAULT_MAX_RETRY_INTERVAL,
            backoff_factor: DEFAULT_BACKOFF_FACTOR,
            wait_cap: DEFAULT_WAIT_CAP,
        }
    }
}

impl AcquisitionPolicy {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_wait(mut self, wait: bool) -> Self {
        self.wait = wait;
        self
    }

    pub fn with_timeout(mut self, timeout: LockTimeoutValue) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_stale_timeout(mut self, stale_timeout: Duration) -> Self {
        self.stale_timeout = stale_timeout;
        self
    }

    pub fn with_retry_interval(mut self, interval: Duration) -> Self {
        self.retry_interval = interval;
        self
    }

    pub fn with_max_retry_interval(mut self, interval: Duration) -> Self {
        self.max_retry_interval = interval;
        self
    }

    pub fn with_backoff_factor(mut self, factor: f64) -> Self {
        self.backoff_factor = factor;
        self
    }

    pub fn with_wait_cap(mut self, cap: Duration) -> Self {
        self.wait_cap = cap;
        self
    }

    pub fn wait(&self) -> bool {
        self.wait
    }

    pub fn mode(&self) -> AcquireMode {
        if self.wait {
            AcquireMode::Blocking
        } else {
            AcquireMode::NonBlocking
        }
    }

    pub fn timeout(&self) -> LockTimeoutValue {
        self.timeout
    }

    pub fn stale_timeout(&self) -> Duration {
        self.stale_timeout
    }

    pub fn retry_interval(&self) -> Duration {
        self.retry_interval
    }

    pub fn max_retry_interval(&self) -> Duration {
        self.max_retry_interval
    }

    pub fn backoff_factor(&self) -> f64 {
        self.backoff_factor
    }

    pub fn wait_cap(&self) -> Duration {
        self.wait_cap
    }

    pub fn backoff(&self) -> PollingBackoff {
        PollingBackoff::new(
            self.retry_interval,
            self.backoff_factor,
            self.max_retry_interval,
        )
    }

    /// Interval at which a holder refreshes the marker mtime.
    ///
    /// Half the stale threshold. For a validated policy this is never below
    /// [`MIN_HEARTBEAT_INTERVAL`] and always shorter than the threshold.
    pub fn heartbeat_interval(&self) -> Duration {
        (self.stale_timeout / 2).max(MIN_HEARTBEAT_INTERVAL)
    }

    /// Rejects settings under which a live holder could look abandoned or the
    /// retry loop could spin.
    pub fn validate(&self) -> Result<()> {
        check_stale_timeout(self.stale_timeout)?;
        if self.retry_interval.is_zero() {
            return Err(MutexRunError::InvalidConfig(
                "retry interval must be greater than 0".to_string(),
            ));
        }
        if !self.backoff_factor.is_finite() || self.backoff_factor < 1.0 {
            return Err(MutexRunError::InvalidConfig(format!(
                "backoff factor must be at least 1.0 (got {})",
                self.backoff_factor
            )));
        }
        Ok(())
    }
}

/// Checks a stale threshold against [`MIN_STALE_TIMEOUT`].
pub fn check_stale_timeout(stale_timeout: Duration) -> Result<()> {
    if stale_timeout < MIN_STALE_TIMEOUT {
        return Err(MutexRunError::InvalidConfig(format!(
            "stale timeout must be at least {} (got {})",
            format_duration(MIN_STALE_TIMEOUT),
            format_duration(stale_timeout)
        )));
    }
    Ok(())
}

/// Tracks elapsed and remaining time against the deadline and the wait cap.
#[derive(Debug, Clone)]
pub struct LockTimeoutBudget {
    deadline: LockTimeoutValue,
    cap: Duration,
    started_at: Instant,
}

impl LockTimeoutBudget {
    pub fn new(deadline: LockTimeoutValue, cap: Duration) -> Self {
        Self::with_start(deadline, cap, Instant::now())
    }

    pub fn with_start(deadline: LockTimeoutValue, cap: Duration, started_at: Instant) -> Self {
        Self {
            deadline,
            cap,
            started_at,
        }
    }

    pub fn deadline(&self) -> LockTimeoutValue {
        self.deadline
    }

    pub fn started_at(&self) -> Instant {
        self.started_at
    }

    pub fn elapsed(&self) -> Duration {
        self.started_at.elapsed()
    }

    /// Time left before either the deadline or the cap is reached.
    pub fn remaining(&self) -> Duration {
        let limit = match self.deadline {
            LockTimeoutValue::Finite(deadline) => deadline.min(self.cap),
            LockTimeoutValue::Infinite => self.cap,
        };
        limit.saturating_sub(self.elapsed())
    }

    /// Time left before the caller's deadline, if one was configured.
    pub fn deadline_remaining(&self) -> Option<Duration> {
        match self.deadline {
            LockTimeoutValue::Infinite => None,
            LockTimeoutValue::Finite(deadline) => Some(deadline.saturating_sub(self.elapsed())),
        }
    }

    /// Reports why the budget is exhausted, if it is.
    ///
    /// The caller's deadline takes precedence over the internal cap.
    pub fn expiry(&self) -> Option<AcquireFailure> {
        let elapsed = self.elapsed();
        match self.deadline {
            LockTimeoutValue::Finite(deadline) if elapsed >= deadline => {
                Some(AcquireFailure::TimedOut)
            }
            _ if elapsed >= self.cap => Some(AcquireFailure::HeldByOther),
            _ => None,
        }
    }

    pub fn is_expired(&self) -> bool {
        self.expiry().is_some()
    }
}

/// Carries the state of a single lock acquisition.
pub struct LockAcquisitionRequest<'a> {
    path: PathBuf,
    budget: LockTimeoutBudget,
    cancellation: CancellationToken,
    backoff: PollingBackoff,
    observer: Option<&'a dyn LockWaitObserver>,
    mode: AcquireMode,
    retries: usize,
    wait_started: bool,
}

impl<'a> LockAcquisitionRequest<'a> {
    pub fn new(path: PathBuf, policy: &AcquisitionPolicy) -> Self {
        Self {
            path,
            budget: LockTimeoutBudget::new(policy.timeout(), policy.wait_cap()),
            cancellation: CancellationToken::new(),
            backoff: policy.backoff(),
            observer: None,
            mode: policy.mode(),
            retries: 0,
            wait_started: false,
        }
    }

    pub fn with_cancellation(mut self, cancellation: CancellationToken) -> Self {
        self.cancellation = cancellation;
        self
    }

    pub fn with_observer(mut self, observer: Option<&'a dyn LockWaitObserver>) -> Self {
        self.observer = observer;
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn mode(&self) -> AcquireMode {
        self.mode
    }

    pub fn budget(&self) -> &LockTimeoutBudget {
        &self.budget
    }

    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancellation
    }

    pub fn backoff(&self) -> &PollingBackoff {
        &self.backoff
    }

    pub fn observer(&self) -> Option<&'a dyn LockWaitObserver> {
        self.observer
    }

    pub fn elapsed(&self) -> Duration {
        self.budget.elapsed()
    }

    pub fn retries(&self) -> usize {
        self.retries
    }

    /// Next backoff delay clamped to the remaining budget; `None` once nothing is left.
    pub fn next_sleep_interval(&mut self) -> Option<Duration> {
        let remaining = self.budget.remaining();
        let delay = self.backoff.next_delay().min(remaining);
        if delay.is_zero() { None } else { Some(delay) }
    }

    pub fn record_wait_start(&mut self) {
        if !self.wait_started {
            if let Some(observer) = self.observer {
                observer.on_wait_start(&self.path, self.budget.deadline());
            }
            self.wait_started = true;
        }
    }

    pub fn record_retry(&mut self) {
        self.retries = self.retries.saturating_add(1);
        if let Some(observer) = self.observer {
            observer.on_retry(
                &self.path,
                self.retries,
                self.elapsed(),
                self.budget.deadline_remaining(),
            );
        }
    }

    pub fn notify_stale_takeover(&self, age: Duration) {
        if let Some(observer) = self.observer {
            observer.on_stale_takeover(&self.path, age);
        }
    }

    pub fn notify_acquired(&self) {
        if let Some(observer) = self.observer {
            observer.on_acquired(&self.path, self.elapsed());
        }
    }

    pub fn notify_timeout(&self) {
        if let Some(observer) = self.observer {
            observer.on_timeout(&self.path, self.elapsed());
        }
    }

    pub fn notify_cancelled(&self) {
        if let Some(observer) = self.observer {
            observer.on_cancelled(&self.path, self.elapsed());
        }
    }
}
