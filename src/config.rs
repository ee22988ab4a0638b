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

//! Layered configuration.
//!
//! Sources, lowest precedence first: built-in defaults, the user file
//! `<config dir>/mutex-run/config.toml`, the project file `./mutex-run.toml`,
//! and `MUTEX_RUN_<SECTION>__<KEY>` environment variables. Command-line flags
//! are applied on top by the binary.

use crate::error::{MutexRunError, Result};
use crate::locking::{
    DEFAULT_BACKOFF_FACTOR, DEFAULT_LOCK_FILE, DEFAULT_MAX_RETRY_INTERVAL, DEFAULT_RETRY_INTERVAL,
    DEFAULT_STALE_TIMEOUT, DEFAULT_WAIT_CAP, LockTimeoutValue, MIN_STALE_TIMEOUT,
};
use crate::runner::RetrySettings;
use config::{Config, Environment, File, FileFormat};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const CONFIG_FILE_NAME: &str = "mutex-run.toml";
pub const USER_CONFIG_FILE_NAME: &str = "config.toml";
pub const ENV_PREFIX: &str = "MUTEX_RUN";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MutexRunConfig {
    #[serde(default)]
    pub lock: LockConfig,

    #[serde(default)]
    pub process: ProcessConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LockConfig {
    pub file: PathBuf,
    pub wait: bool,
    /// 0 waits without a deadline (still bounded by `max_wait_secs`).
    pub timeout_ms: u64,
    pub stale_timeout_ms: u64,
    pub retry_interval_ms: u64,
    pub max_retry_interval_ms: u64,
    pub backoff_factor: f64,
    pub max_wait_secs: u64,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            file: PathBuf::from(DEFAULT_LOCK_FILE),
            wait: true,
            timeout_ms: 0,
            stale_timeout_ms: millis(DEFAULT_STALE_TIMEOUT),
            retry_interval_ms: millis(DEFAULT_RETRY_INTERVAL),
            max_retry_interval_ms: millis(DEFAULT_MAX_RETRY_INTERVAL),
            backoff_factor: DEFAULT_BACKOFF_FACTOR,
            max_wait_secs: DEFAULT_WAIT_CAP.as_secs(),
        }
    }
}

impl LockConfig {
    pub fn timeout(&self) -> LockTimeoutValue {
        LockTimeoutValue::from_millis(self.timeout_ms)
    }

    pub fn stale_timeout(&self) -> Duration {
        Duration::from_millis(self.stale_timeout_ms)
    }

    pub fn retry_settings(&self) -> RetrySettings {
        RetrySettings {
            interval: Duration::from_millis(self.retry_interval_ms),
            max_interval: Duration::from_millis(self.max_retry_interval_ms),
            factor: self.backoff_factor,
            wait_cap: Duration::from_secs(self.max_wait_secs),
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.file.as_os_str().is_empty() {
            return Err(invalid("lock.file must not be empty"));
        }
        if !self.backoff_factor.is_finite() || self.backoff_factor < 1.0 {
            return Err(invalid(format!(
                "lock.backoff_factor must be at least 1.0 (got {})",
                self.backoff_factor
            )));
        }
        if self.retry_interval_ms == 0 {
            return Err(invalid("lock.retry_interval_ms must be greater than 0"));
        }
        if self.max_retry_interval_ms < self.retry_interval_ms {
            return Err(invalid(format!(
                "lock.max_retry_interval_ms ({}) must not be less than lock.retry_interval_ms ({})",
                self.max_retry_interval_ms, self.retry_interval_ms
            )));
        }
        if self.stale_timeout() < MIN_STALE_TIMEOUT {
            return Err(invalid(format!(
                "lock.stale_timeout_ms must be at least {} (got {})",
                millis(MIN_STALE_TIMEOUT),
                self.stale_timeout_ms
            )));
        }
        if self.max_wait_secs == 0 {
            return Err(invalid("lock.max_wait_secs must be greater than 0"));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProcessConfig {
    /// Unset keeps the per-command default.
    pub shell: Option<bool>,
}

impl MutexRunConfig {
    /// Loads configuration for a run started in `project_dir`.
    pub fn load(project_dir: &Path) -> Result<Self> {
        Self::load_from(user_config_path().as_deref(), project_dir)
    }

    pub fn load_from(user_file: Option<&Path>, project_dir: &Path) -> Result<Self> {
        let mut builder = Config::builder();

        if let Some(user_file) = user_file {
            log::debug!("Reading user config from {}", user_file.display());
            builder = builder.add_source(toml_source(user_file));
        }

        let project_file = project_dir.join(CONFIG_FILE_NAME);
        log::debug!("Reading project config from {}", project_file.display());
        builder = builder.add_source(toml_source(&project_file)).add_source(
            Environment::with_prefix(ENV_PREFIX)
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );

        let config: MutexRunConfig = builder.build()?.try_deserialize()?;
        config.validate()?;
        log::debug!("Effective configuration: {config:?}");
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        self.lock.validate()
    }
}

/// `<config dir>/mutex-run/config.toml`, when the platform has a config dir.
pub fn user_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("mutex-run").join(USER_CONFIG_FILE_NAME))
}

fn toml_source(path: &Path) -> File<config::FileSourceFile, FileFormat> {
    File::from(path).format(FileFormat::Toml).required(false)
}

fn invalid(message: impl Into<String>) -> MutexRunError {
    MutexRunError::InvalidConfig(message.into())
}

fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::env;
    use std::fs;
    use tempfile::TempDir;

    const ENV_KEYS: &[&str] = &[
        "MUTEX_RUN_LOCK__TIMEOUT_MS",
        "MUTEX_RUN_LOCK__WAIT",
        "MUTEX_RUN_PROCESS__SHELL",
    ];

    fn clear_env() {
        for key in ENV_KEYS {
            unsafe {
                env::remove_var(key);
            }
        }
    }

    #[test]
    fn test_default_config() {
        let config = MutexRunConfig::default();
        assert_eq!(config.lock.file, PathBuf::from(".mutex-run.lock"));
        assert!(config.lock.wait);
        assert!(config.lock.timeout().is_infinite());
        assert_eq!(config.lock.stale_timeout_ms, 600_000);
        assert_eq!(config.lock.retry_interval_ms, 1_000);
        assert_eq!(config.lock.max_retry_interval_ms, 3_000);
        assert_eq!(config.lock.max_wait_secs, 3_600);
        assert_eq!(config.process.shell, None);
        assert!(config.validate().is_ok());
    }

    #[test]
    #[serial]
    fn test_load_without_files() {
        clear_env();
        let temp_dir = TempDir::new().unwrap();
        let config = MutexRunConfig::load_from(None, temp_dir.path()).unwrap();
        assert_eq!(config, MutexRunConfig::default());
    }

    #[test]
    #[serial]
    fn test_project_file_overrides_user_file() {
        clear_env();
        let temp_dir = TempDir::new().unwrap();
        let user_file = temp_dir.path().join("user.toml");
        fs::write(
            &user_file,
            r#"
[lock]
timeout_ms = 5000
stale_timeout_ms = 1000

[process]
shell = true
"#,
        )
        .unwrap();
        fs::write(
            temp_dir.path().join(CONFIG_FILE_NAME),
            r#"
[lock]
timeout_ms = 250
"#,
        )
        .unwrap();

        let config = MutexRunConfig::load_from(Some(&user_file), temp_dir.path()).unwrap();
        assert_eq!(config.lock.timeout_ms, 250);
        assert_eq!(config.lock.stale_timeout_ms, 1000);
        assert_eq!(config.process.shell, Some(true));
        assert!(config.lock.wait);
    }

    #[test]
    #[serial]
    fn test_environment_overrides_files() {
        clear_env();
        let temp_dir = TempDir::new().unwrap();
        fs::write(
            temp_dir.path().join(CONFIG_FILE_NAME),
            "[lock]\ntimeout_ms = 250\n",
        )
        .unwrap();

        unsafe {
            env::set_var("MUTEX_RUN_LOCK__TIMEOUT_MS", "900");
            env::set_var("MUTEX_RUN_LOCK__WAIT", "false");
            env::set_var("MUTEX_RUN_PROCESS__SHELL", "false");
        }
        let loaded = MutexRunConfig::load_from(None, temp_dir.path());
        clear_env();

        let config = loaded.unwrap();
        assert_eq!(config.lock.timeout_ms, 900);
        assert!(!config.lock.wait);
        assert_eq!(config.process.shell, Some(false));
    }

    #[test]
    #[serial]
    fn test_invalid_values_are_rejected() {
        clear_env();
        let temp_dir = TempDir::new().unwrap();
        fs::write(
            temp_dir.path().join(CONFIG_FILE_NAME),
            "[lock]\nbackoff_factor = 0.5\n",
        )
        .unwrap();

        let err = MutexRunConfig::load_from(None, temp_dir.path()).unwrap_err();
        assert!(matches!(err, MutexRunError::InvalidConfig(_)));
        assert!(err.to_string().contains("backoff_factor"));
    }

    #[test]
    #[serial]
    fn test_malformed_file_is_a_config_error() {
        clear_env();
        let temp_dir = TempDir::new().unwrap();
        fs::write(temp_dir.path().join(CONFIG_FILE_NAME), "[lock\ntimeout_ms =").unwrap();

        let err = MutexRunConfig::load_from(None, temp_dir.path()).unwrap_err();
        assert!(matches!(err, MutexRunError::ConfigError(_)));
    }

    #[test]
    fn test_retry_bounds_validation() {
        let mut lock = LockConfig {
            retry_interval_ms: 500,
            max_retry_interval_ms: 100,
            ..LockConfig::default()
        };
        assert!(lock.validate().is_err());

        lock.max_retry_interval_ms = 500;
        assert!(lock.validate().is_ok());

        lock.retry_interval_ms = 0;
        assert!(lock.validate().is_err());
    }

    #[test]
    fn test_stale_timeout_minimum() {
        let mut lock = LockConfig {
            stale_timeout_ms: 0,
            ..LockConfig::default()
        };
        let err = lock.validate().unwrap_err();
        assert!(err.to_string().contains("lock.stale_timeout_ms must be at least 200"));

        lock.stale_timeout_ms = 50;
        assert!(lock.validate().is_err());

        lock.stale_timeout_ms = 200;
        assert!(lock.validate().is_ok());
    }

    #[test]
    fn test_retry_settings_conversion() {
        let lock = LockConfig {
            retry_interval_ms: 200,
            max_retry_interval_ms: 800,
            backoff_factor: 2.0,
            max_wait_secs: 10,
            ..LockConfig::default()
        };
        let retry = lock.retry_settings();
        assert_eq!(retry.interval, Duration::from_millis(200));
        assert_eq!(retry.max_interval, Duration::from_millis(800));
        assert_eq!(retry.factor, 2.0);
        assert_eq!(retry.wait_cap, Duration::from_secs(10));
    }
}
