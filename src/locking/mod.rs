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

pub mod acquisition;
pub mod cancellation;
pub mod controller;
pub mod handle;
pub mod marker;
pub mod timeout;
pub mod wait_observer;

pub use acquisition::{
    AcquireMode, AcquisitionPolicy, DEFAULT_BACKOFF_FACTOR, DEFAULT_MAX_RETRY_INTERVAL,
    DEFAULT_RETRY_INTERVAL, DEFAULT_STALE_TIMEOUT, DEFAULT_WAIT_CAP, LockAcquisitionRequest,
    LockTimeoutBudget, MIN_HEARTBEAT_INTERVAL, MIN_STALE_TIMEOUT, PollingBackoff,
    check_stale_timeout,
};
pub use cancellation::{CancellationToken, ForwardedSignal, SignalRegistration};
pub use controller::{LockAttempt, LockController};
pub use handle::{LockHandle, MarkerRemoval};
pub use marker::{DEFAULT_LOCK_FILE, MarkerState};
pub use timeout::{
    DurationParseError, LockTimeoutValue, format_duration, parse_duration, parse_stale_timeout,
    parse_timeout_override,
};
pub use wait_observer::{DiagnosticWaitObserver, LockWaitObserver, NoopLockWaitObserver};
