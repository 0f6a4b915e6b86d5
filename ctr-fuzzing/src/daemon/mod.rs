// ctr-fuzzing/src/daemon/mod.rs
//! Supervision of the daemon under test
//!
//! One [`DaemonSupervisor`] owns one [`DaemonHandle`] for the whole campaign.
//! Start-up and readiness failures never propagate: they are logged with the
//! daemon's captured output and the process is forced back into a stopped
//! state, so the next connection attempt fails cleanly instead.

pub mod config;
pub mod state;

use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, Command};

use crate::client::Connector;
use crate::constants::{MAX_DIAGNOSTIC_BYTES, READY_POLL_INTERVAL, STOP_GRACE_PERIOD};
use crate::error::DaemonError;

/// Where the daemon lives and how it is launched
#[derive(Debug, Clone)]
pub struct DaemonConfig {
    pub binary: String,
    pub address: PathBuf,
    pub root: PathBuf,
    pub state: PathBuf,
    /// Directory the generated `--config` file is written to
    pub config_dir: PathBuf,
    pub ready_timeout: Duration,
}

/// Lifecycle of the supervised process
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DaemonState {
    Absent,
    Starting,
    Ready,
    Stopping,
    Killed,
    Reaped,
}

/// The supervised daemon process and the paths it owns
pub struct DaemonHandle {
    child: Option<Child>,
    address: PathBuf,
    root: PathBuf,
    state: PathBuf,
    log_path: Option<PathBuf>,
    config_path: Option<PathBuf>,
    output: Arc<Mutex<Vec<u8>>>,
}

impl DaemonHandle {
    fn new(config: &DaemonConfig) -> Self {
        Self {
            child: None,
            address: config.address.clone(),
            root: config.root.clone(),
            state: config.state.clone(),
            log_path: None,
            config_path: None,
            output: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Whether a process is held; it may have exited since the last poll
    pub fn is_running(&self) -> bool {
        self.child.is_some()
    }

    pub fn pid(&self) -> Option<u32> {
        self.child.as_ref().and_then(Child::id)
    }

    pub fn address(&self) -> &Path {
        &self.address
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Temporary file receiving daemon output while start-up is in progress
    pub fn log_path(&self) -> Option<&Path> {
        self.log_path.as_deref()
    }

    /// Output captured from the daemon since its last start
    pub fn diagnostics(&self) -> String {
        let output = self.output.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        String::from_utf8_lossy(&output).into_owned()
    }
}

/// Starts, watches and stops the daemon
pub struct DaemonSupervisor {
    binary: String,
    config_dir: PathBuf,
    ready_timeout: Duration,
    handle: DaemonHandle,
    lifecycle: DaemonState,
    starts: u64,
}

impl DaemonSupervisor {
    pub fn new(config: DaemonConfig) -> Self {
        Self {
            handle: DaemonHandle::new(&config),
            binary: config.binary,
            config_dir: config.config_dir,
            ready_timeout: config.ready_timeout,
            lifecycle: DaemonState::Absent,
            starts: 0,
        }
    }

    pub fn handle(&self) -> &DaemonHandle {
        &self.handle
    }

    pub fn lifecycle(&self) -> DaemonState {
        self.lifecycle
    }

    pub fn is_running(&self) -> bool {
        self.handle.is_running()
    }

    /// Whether the daemon process is still alive
    ///
    /// A daemon that exited on its own is reaped here and its handle released,
    /// so the next [`ensure_started`](Self::ensure_started) launches a new one.
    pub fn check_alive(&mut self) -> bool {
        let Some(child) = self.handle.child.as_mut() else {
            return false;
        };
        let status = match child.try_wait() {
            Ok(None) => return true,
            Ok(Some(status)) => status,
            Err(err) => {
                log::debug!("could not poll daemon status: {err}");
                return true;
            }
        };

        log::warn!(
            "daemon exited unexpectedly with {status}: {}",
            self.handle.diagnostics()
        );
        self.handle.child = None;
        self.release_config();
        self.lifecycle = DaemonState::Reaped;
        false
    }

    /// Number of successful process launches
    pub fn starts(&self) -> u64 {
        self.starts
    }

    /// Fixed command line for the daemon
    pub fn launch_args(&self, config_path: &Path) -> Vec<OsString> {
        vec![
            "--address".into(),
            self.handle.address.clone().into_os_string(),
            "--root".into(),
            self.handle.root.clone().into_os_string(),
            "--state".into(),
            self.handle.state.clone().into_os_string(),
            "--log-level".into(),
            "debug".into(),
            "--config".into(),
            config_path.as_os_str().to_owned(),
        ]
    }

    /// Launch the daemon, teeing its stdout and stderr into `log_file` and
    /// the in-memory diagnostics buffer
    pub async fn start(&mut self, log_file: Option<std::fs::File>) -> Result<(), DaemonError> {
        if self.handle.child.is_some() {
            return Err(DaemonError::AlreadyRunning);
        }

        let config_path = config::write_debug_config(&self.config_dir)?;
        let mut command = Command::new(&self.binary);
        command
            .args(self.launch_args(&config_path))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = match command.spawn() {
            Ok(child) => child,
            Err(source) => {
                let _ = std::fs::remove_file(&config_path);
                return Err(DaemonError::Spawn {
                    binary: self.binary.clone(),
                    source,
                });
            }
        };

        let output = Arc::new(Mutex::new(Vec::new()));
        let stderr_file = log_file.as_ref().and_then(|file| file.try_clone().ok());
        if let Some(stdout) = child.stdout.take() {
            capture(stdout, log_file, output.clone());
        }
        if let Some(stderr) = child.stderr.take() {
            capture(stderr, stderr_file, output.clone());
        }

        log::info!(
            "started {} (pid {:?}) on {}",
            self.binary,
            child.id(),
            self.handle.address.display()
        );
        self.handle.output = output;
        self.handle.config_path = Some(config_path);
        self.handle.child = Some(child);
        self.lifecycle = DaemonState::Starting;
        self.starts += 1;
        Ok(())
    }

    /// Start the daemon and wait for it to serve
    ///
    /// Returns whether the daemon is ready. Failures are logged, never raised.
    pub async fn ensure_started(&mut self, connector: &dyn Connector) -> bool {
        let capture_file = tempfile::Builder::new()
            .prefix("ctr-fuzzing-daemon-")
            .suffix(".log")
            .tempfile();
        let log_file = match &capture_file {
            Ok(file) => {
                self.handle.log_path = Some(file.path().to_path_buf());
                file.reopen().ok()
            }
            Err(err) => {
                log::warn!("no log file for daemon output: {err}");
                None
            }
        };

        match self.start(log_file).await {
            Ok(()) => {}
            Err(DaemonError::AlreadyRunning) => log::debug!("daemon is already running"),
            Err(err) => log::error!("{err}: {}", self.handle.diagnostics()),
        }

        let ready = self.await_ready(connector, self.ready_timeout).await;

        // Dropping the temp file unlinks it; capture keeps its own descriptor.
        drop(capture_file);
        self.handle.log_path = None;
        ready
    }

    /// Wait up to `timeout` for the daemon to accept a client and report serving
    ///
    /// On failure the daemon is stopped, killed and reaped.
    pub async fn await_ready(&mut self, connector: &dyn Connector, timeout: Duration) -> bool {
        let outcome = match tokio::time::timeout(timeout, self.wait_for_start(connector)).await {
            Ok(result) => result,
            Err(_) => Err(DaemonError::ReadinessTimeout(timeout)),
        };

        match outcome {
            Ok(()) => {
                log::info!("daemon ready on {}", self.handle.address.display());
                self.lifecycle = DaemonState::Ready;
                true
            }
            Err(err) => {
                log::error!("{err}: {}", self.handle.diagnostics());
                let _ = self.stop();
                let _ = self.force_kill();
                let _ = self.reap().await;
                false
            }
        }
    }

    async fn wait_for_start(&mut self, connector: &dyn Connector) -> Result<(), DaemonError> {
        let mut ticker = tokio::time::interval(READY_POLL_INTERVAL);
        loop {
            ticker.tick().await;

            let child = self.handle.child.as_mut().ok_or(DaemonError::NotRunning)?;
            if let Some(status) = child.try_wait()? {
                return Err(DaemonError::Exited(status));
            }

            match connector.connect(&self.handle.address).await {
                Ok(mut client) => {
                    let serving = client.is_serving().await;
                    let _ = client.close().await;
                    match serving {
                        Ok(true) => return Ok(()),
                        Ok(false) => log::debug!("connected but service is not available"),
                        Err(err) => log::debug!("daemon not serving yet: {err}"),
                    }
                }
                Err(err) => log::debug!("daemon not accepting connections yet: {err}"),
            }
        }
    }

    /// Ask the daemon to exit (SIGTERM)
    pub fn stop(&mut self) -> Result<(), DaemonError> {
        let pid = self.handle.pid().ok_or(DaemonError::NotRunning)?;
        signal::kill(Pid::from_raw(pid as i32), Signal::SIGTERM)?;
        self.lifecycle = DaemonState::Stopping;
        Ok(())
    }

    /// Kill the daemon outright (SIGKILL)
    pub fn force_kill(&mut self) -> Result<(), DaemonError> {
        let child = self.handle.child.as_mut().ok_or(DaemonError::NotRunning)?;
        child.start_kill()?;
        self.lifecycle = DaemonState::Killed;
        Ok(())
    }

    /// Wait for the daemon to exit and release the process handle
    ///
    /// A daemon that outlives the grace period is killed first. An unclean
    /// exit is reported as [`DaemonError::Exited`].
    pub async fn reap(&mut self) -> Result<ExitStatus, DaemonError> {
        let mut child = self.handle.child.take().ok_or(DaemonError::NotRunning)?;
        let status = match tokio::time::timeout(STOP_GRACE_PERIOD, child.wait()).await {
            Ok(status) => status?,
            Err(_) => {
                log::warn!("daemon still up after {STOP_GRACE_PERIOD:?}, killing");
                child.start_kill()?;
                child.wait().await?
            }
        };
        self.lifecycle = DaemonState::Reaped;
        self.release_config();

        if status.success() {
            Ok(status)
        } else {
            Err(DaemonError::Exited(status))
        }
    }

    /// Remove the daemon's root directory and generated config
    pub fn purge_state(&mut self) -> Result<(), DaemonError> {
        if self.handle.child.is_some() {
            return Err(DaemonError::AlreadyRunning);
        }

        state::force_remove_all(&self.handle.root)?;
        self.release_config();
        self.lifecycle = DaemonState::Absent;
        Ok(())
    }

    /// Delete the config file written for the last launch
    fn release_config(&mut self) {
        if let Some(path) = self.handle.config_path.take() {
            if let Err(err) = std::fs::remove_file(&path) {
                log::debug!("could not remove {}: {err}", path.display());
            }
        }
    }

    /// Stop (or kill), reap and purge the daemon
    pub async fn teardown(&mut self) -> Result<(), DaemonError> {
        if let Err(err) = self.stop() {
            log::debug!("graceful stop failed: {err}");
            self.force_kill()?;
        }

        match self.reap().await {
            Ok(_) | Err(DaemonError::Exited(_)) => {}
            Err(err) => return Err(err),
        }

        self.purge_state()?;
        log::info!("daemon torn down, removed {}", self.handle.root.display());
        Ok(())
    }
}

/// Copy a child stream into an optional file and the shared diagnostics buffer
fn capture<R>(mut reader: R, file: Option<std::fs::File>, output: Arc<Mutex<Vec<u8>>>)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    let mut file = file.map(tokio::fs::File::from_std);
    tokio::spawn(async move {
        let mut chunk = [0u8; 4096];
        loop {
            let read = match reader.read(&mut chunk).await {
                Ok(0) | Err(_) => break,
                Ok(read) => read,
            };

            if let Some(sink) = file.as_mut() {
                if sink.write_all(&chunk[..read]).await.is_err() {
                    file = None;
                }
            }

            let mut buffer = output.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
            buffer.extend_from_slice(&chunk[..read]);
            if buffer.len() > MAX_DIAGNOSTIC_BYTES {
                let excess = buffer.len() - MAX_DIAGNOSTIC_BYTES;
                buffer.drain(..excess);
            }
        }
    });
}
