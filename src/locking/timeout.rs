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

use crate::locking::acquisition::MIN_STALE_TIMEOUT;
use std::fmt;
use std::time::Duration;

/// Overall deadline for one lock acquisition.
///
/// A zero timeout means "no deadline": the wait is then bounded only by the
/// internal wait cap of the [`AcquisitionPolicy`](crate::locking::AcquisitionPolicy).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LockTimeoutValue {
    Finite(Duration),
    #[default]
    Infinite,
}

impl LockTimeoutValue {
    pub const fn from_millis(millis: u64) -> Self {
        if millis == 0 {
            Self::Infinite
        } else {
            Self::Finite(Duration::from_millis(millis))
        }
    }

    pub fn from_duration(duration: Duration) -> Self {
        if duration.is_zero() {
            Self::Infinite
        } else {
            Self::Finite(duration)
        }
    }

    pub fn is_infinite(&self) -> bool {
        matches!(self, LockTimeoutValue::Infinite)
    }
}

impl fmt::Display for LockTimeoutValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LockTimeoutValue::Infinite => f.write_str("infinite"),
            LockTimeoutValue::Finite(duration) => f.write_str(&format_duration(*duration)),
        }
    }
}

/// Error produced when parsing a duration or timeout override fails.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DurationParseError {
    value: String,
    minimum: Option<Duration>,
}

impl DurationParseError {
    fn invalid_value(value: &str) -> Self {
        Self {
            value: value.to_string(),
            minimum: None,
        }
    }

    fn below_minimum(value: &str, minimum: Duration) -> Self {
        Self {
            value: value.to_string(),
            minimum: Some(minimum),
        }
    }

    pub fn value(&self) -> &str {
        &self.value
    }
}

impl fmt::Display for DurationParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.minimum {
            Some(minimum) => write!(
                f,
                "Duration '{}' is too short; the minimum is {}.",
                self.value,
                format_duration(minimum)
            ),
            None => write!(
                f,
                "Duration '{}' is invalid. Use milliseconds or a number with a unit suffix \
                 (ms, s, m, h).",
                self.value
            ),
        }
    }
}

impl std::error::Error for DurationParseError {}

/// Parses a duration given in milliseconds, or with an explicit `ms`/`s`/`m`/`h` suffix.
pub fn parse_duration(value: &str) -> Result<Duration, DurationParseError> {
    let trimmed = value.trim();
    let split_at = trimmed
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(trimmed.len());
    let (digits, unit) = trimmed.split_at(split_at);

    let amount = digits
        .parse::<u64>()
        .map_err(|_| DurationParseError::invalid_value(trimmed))?;

    let millis_per_unit = match unit.trim().to_ascii_lowercase().as_str() {
        "" | "ms" => 1,
        "s" => 1_000,
        "m" => 60_000,
        "h" => 3_600_000,
        _ => return Err(DurationParseError::invalid_value(trimmed)),
    };

    amount
        .checked_mul(millis_per_unit)
        .map(Duration::from_millis)
        .ok_or_else(|| DurationParseError::invalid_value(trimmed))
}

/// Parses a lock-timeout override; `0` and `infinite` both disable the deadline.
pub fn parse_timeout_override(value: &str) -> Result<LockTimeoutValue, DurationParseError> {
    let trimmed = value.trim();
    if trimmed.eq_ignore_ascii_case("infinite") {
        return Ok(LockTimeoutValue::Infinite);
    }

    parse_duration(trimmed).map(LockTimeoutValue::from_duration)
}

/// Parses a stale threshold; values below [`MIN_STALE_TIMEOUT`] are rejected.
pub fn parse_stale_timeout(value: &str) -> Result<Duration, DurationParseError> {
    let duration = parse_duration(value)?;
    if duration < MIN_STALE_TIMEOUT {
        return Err(DurationParseError::below_minimum(value.trim(), MIN_STALE_TIMEOUT));
    }
    Ok(duration)
}

pub fn format_duration(duration: Duration) -> String {
    if duration.as_secs() >= 1 {
        format!("{:.1}s", duration.as_secs_f32())
    } else {
        format!("{:.0}ms", duration.as_millis())
    }
}
