// ctr-fuzzing/src/config.rs
//! Harness configuration

use std::path::PathBuf;
use std::time::Duration;

use crate::constants::*;
use crate::daemon::DaemonConfig;
use crate::error::HarnessError;

/// Where the daemon lives and how iterations are bounded
#[derive(Debug, Clone, PartialEq)]
pub struct HarnessConfig {
    pub socket_path: PathBuf,
    pub root_dir: PathBuf,
    pub state_dir: PathBuf,
    pub daemon_binary: String,
    /// Appended to `PATH` so the daemon and its shims resolve
    pub binary_dir: PathBuf,
    pub snapshotter: String,
    pub ready_timeout: Duration,
    pub iteration_timeout: Duration,
    /// Tear the daemon down after every iteration
    pub teardown: bool,
    pub client_timeout_secs: u64,
}

impl Default for HarnessConfig {
    fn default() -> Self {
        Self {
            socket_path: PathBuf::from(DEFAULT_SOCKET_PATH),
            root_dir: PathBuf::from(DEFAULT_ROOT_DIR),
            state_dir: PathBuf::from(DEFAULT_STATE_DIR),
            daemon_binary: DEFAULT_DAEMON_BINARY.to_string(),
            binary_dir: PathBuf::from(DEFAULT_BINARY_DIR),
            snapshotter: DEFAULT_SNAPSHOTTER.to_string(),
            ready_timeout: DEFAULT_READY_TIMEOUT,
            iteration_timeout: DEFAULT_ITERATION_TIMEOUT,
            teardown: false,
            client_timeout_secs: DEFAULT_CLIENT_TIMEOUT_SECS,
        }
    }
}

impl HarnessConfig {
    /// Defaults overridden by `CTR_FUZZING_*` environment variables
    pub fn from_env() -> Result<Self, HarnessError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Defaults overridden by whatever `lookup` returns for each variable
    pub fn from_lookup<F>(lookup: F) -> Result<Self, HarnessError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(value) = lookup("CTR_FUZZING_SOCKET") {
            config.socket_path = PathBuf::from(value);
        }
        if let Some(value) = lookup("CTR_FUZZING_ROOT") {
            config.root_dir = PathBuf::from(value);
        }
        if let Some(value) = lookup("CTR_FUZZING_STATE") {
            config.state_dir = PathBuf::from(value);
        }
        if let Some(value) = lookup("CTR_FUZZING_DAEMON") {
            config.daemon_binary = value;
        }
        if let Some(value) = lookup("CTR_FUZZING_BINARY_DIR") {
            config.binary_dir = PathBuf::from(value);
        }
        if let Some(value) = lookup("CTR_FUZZING_SNAPSHOTTER") {
            config.snapshotter = value;
        }
        if let Some(value) = lookup("CTR_FUZZING_READY_TIMEOUT") {
            config.ready_timeout = parse_duration("CTR_FUZZING_READY_TIMEOUT", &value)?;
        }
        if let Some(value) = lookup("CTR_FUZZING_ITERATION_TIMEOUT") {
            config.iteration_timeout = parse_duration("CTR_FUZZING_ITERATION_TIMEOUT", &value)?;
        }
        if let Some(value) = lookup("CTR_FUZZING_TEARDOWN") {
            config.teardown = parse_flag("CTR_FUZZING_TEARDOWN", &value)?;
        }
        if let Some(value) = lookup("CTR_FUZZING_CLIENT_TIMEOUT") {
            config.client_timeout_secs = value.trim().parse().map_err(|_| {
                HarnessError::Config(format!(
                    "CTR_FUZZING_CLIENT_TIMEOUT must be a number of seconds, got {value:?}"
                ))
            })?;
        }

        Ok(config)
    }

    /// Launch settings for the daemon supervisor
    pub fn daemon_config(&self) -> DaemonConfig {
        DaemonConfig {
            binary: self.daemon_binary.clone(),
            address: self.socket_path.clone(),
            root: self.root_dir.clone(),
            state: self.state_dir.clone(),
            config_dir: std::env::temp_dir(),
            ready_timeout: self.ready_timeout,
        }
    }
}

fn parse_duration(key: &str, value: &str) -> Result<Duration, HarnessError> {
    humantime::parse_duration(value.trim())
        .map_err(|err| HarnessError::Config(format!("{key}={value:?}: {err}")))
}

fn parse_flag(key: &str, value: &str) -> Result<bool, HarnessError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" | "" => Ok(false),
        _ => Err(HarnessError::Config(format!("{key}={value:?} is not a boolean"))),
    }
}
