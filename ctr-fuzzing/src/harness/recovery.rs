// ctr-fuzzing/src/harness/recovery.rs
//! Recovery from a dead daemon between iterations

use std::error::Error as StdError;
use std::io;
use std::path::{Path, PathBuf};

use crate::constants::DAEMON_NOT_RUNNING;
use crate::error::{ClientError, DaemonError};

/// Decides what to clean up after an error so the next start can succeed
pub trait RecoveryPolicy: Send + Sync {
    /// Act on `err` if it calls for recovery. Returns whether anything was done.
    fn maybe_recover(&self, err: &(dyn StdError + 'static)) -> io::Result<bool>;
}

/// Removes a stale daemon socket when the daemon is found to be down
#[derive(Debug, Clone)]
pub struct SocketRecovery {
    socket_path: PathBuf,
}

impl SocketRecovery {
    pub fn new(socket_path: impl Into<PathBuf>) -> Self {
        Self {
            socket_path: socket_path.into(),
        }
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }
}

impl RecoveryPolicy for SocketRecovery {
    fn maybe_recover(&self, err: &(dyn StdError + 'static)) -> io::Result<bool> {
        if !indicates_daemon_down(err) {
            return Ok(false);
        }

        log::warn!(
            "daemon is down ({err}), removing socket {}",
            self.socket_path.display()
        );
        std::fs::remove_file(&self.socket_path)?;
        Ok(true)
    }
}

/// Whether `err` (or anything in its source chain) says the daemon is not running
pub fn indicates_daemon_down(err: &(dyn StdError + 'static)) -> bool {
    let mut current = Some(err);
    while let Some(cause) = current {
        if matches!(
            cause.downcast_ref::<ClientError>(),
            Some(ClientError::DaemonNotRunning(_))
        ) || matches!(
            cause.downcast_ref::<DaemonError>(),
            Some(DaemonError::NotRunning)
        ) {
            return true;
        }
        current = cause.source();
    }

    err.to_string().contains(DAEMON_NOT_RUNNING)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, thiserror::Error)]
    #[error("request failed")]
    struct Wrapped(#[source] ClientError);

    #[test]
    fn test_structured_errors_are_recognised() {
        let client = ClientError::DaemonNotRunning("refused".to_string());
        assert!(indicates_daemon_down(&client));
        assert!(indicates_daemon_down(&DaemonError::NotRunning));
        assert!(indicates_daemon_down(&Wrapped(client)));
    }

    #[test]
    fn test_message_fallback() {
        let err = io::Error::new(io::ErrorKind::Other, "dial: daemon is not running: eof");
        assert!(indicates_daemon_down(&err));

        let err = io::Error::new(io::ErrorKind::Other, "permission denied");
        assert!(!indicates_daemon_down(&err));
        assert!(!indicates_daemon_down(&ClientError::NoImages));
        assert!(!indicates_daemon_down(&DaemonError::AlreadyRunning));
    }

    #[test]
    fn test_socket_removed_only_when_daemon_down() {
        let dir = tempfile::tempdir().unwrap();
        let socket = dir.path().join("containerd.sock");
        std::fs::write(&socket, b"").unwrap();
        let policy = SocketRecovery::new(&socket);

        assert!(!policy.maybe_recover(&ClientError::NoImages).unwrap());
        assert!(socket.exists());

        let down = ClientError::DaemonNotRunning("refused".to_string());
        assert!(policy.maybe_recover(&down).unwrap());
        assert!(!socket.exists());
    }

    #[test]
    fn test_missing_socket_is_propagated() {
        let dir = tempfile::tempdir().unwrap();
        let policy = SocketRecovery::new(dir.path().join("containerd.sock"));

        let err = policy.maybe_recover(&DaemonError::NotRunning).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::NotFound);
    }
}
