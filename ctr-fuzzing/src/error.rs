// ctr-fuzzing/src/error.rs
//! Error types for the fuzzing driver

use std::path::PathBuf;
use std::process::ExitStatus;
use std::time::Duration;

use thiserror::Error;

/// Failures while decoding fuzz input
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum InputError {
    #[error("not enough input left to decode {0}")]
    Exhausted(&'static str),

    #[error("malformed input: {0}")]
    Malformed(String),
}

/// Failures reported by the daemon client
#[derive(Error, Debug)]
pub enum ClientError {
    #[error("daemon is not running: {0}")]
    DaemonNotRunning(String),

    #[error("connection error: {0}")]
    Connect(String),

    #[error("no images available")]
    NoImages,

    #[error("request rejected: {0}")]
    Rejected(String),

    #[error("input error: {0}")]
    Input(#[from] InputError),

    #[error("rpc error: {0}")]
    Rpc(#[from] tonic::Status),

    #[error("encoding error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Failures from the daemon supervisor
#[derive(Error, Debug)]
pub enum DaemonError {
    #[error("daemon is not running")]
    NotRunning,

    #[error("daemon is already running")]
    AlreadyRunning,

    #[error("failed to spawn {binary}: {source}")]
    Spawn {
        binary: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to signal daemon: {0}")]
    Signal(#[from] nix::Error),

    #[error("daemon exited with {0}")]
    Exited(ExitStatus),

    #[error("daemon not ready after {0:?}")]
    ReadinessTimeout(Duration),

    #[error("failed to write daemon config: {0}")]
    Config(#[from] toml::ser::Error),

    #[error("failed to remove {}: {source}", path.display())]
    Purge {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Fatal environment setup failures
#[derive(Error, Debug)]
pub enum HarnessError {
    #[error("failed to create {}: {source}", path.display())]
    CreateDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid PATH entry {}: {reason}", path.display())]
    InvalidPath { path: PathBuf, reason: String },

    #[error("configuration error: {0}")]
    Config(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn not_running_errors_carry_the_marker_text() {
        let client = ClientError::DaemonNotRunning("connection refused".to_string());
        assert_eq!(client.to_string(), "daemon is not running: connection refused");
        assert_eq!(DaemonError::NotRunning.to_string(), "daemon is not running");
        assert!(client.to_string().starts_with(crate::constants::DAEMON_NOT_RUNNING));
        assert_eq!(
            DaemonError::AlreadyRunning.to_string(),
            crate::constants::DAEMON_ALREADY_RUNNING
        );
    }

    #[test]
    fn messages_start_lowercase() {
        let messages = vec![
            ClientError::Connect("refused".to_string()).to_string(),
            ClientError::Rejected("bad spec".to_string()).to_string(),
            ClientError::Input(InputError::Exhausted("int")).to_string(),
            ClientError::Rpc(tonic::Status::not_found("missing")).to_string(),
            DaemonError::Io(std::io::Error::other("disk")).to_string(),
            DaemonError::ReadinessTimeout(Duration::from_secs(4)).to_string(),
            HarnessError::Config("bad timeout".to_string()).to_string(),
        ];
        for message in messages {
            let first = message.chars().next().unwrap();
            assert!(!first.is_uppercase(), "{message}");
        }
    }
}
