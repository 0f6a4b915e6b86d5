// ctr-fuzzing/src/constants.rs
//! Shared constants for the fuzzing infrastructure

use std::time::Duration;

/// Upper bound (exclusive) on archive imports per iteration
pub const MAX_IMPORTS: i32 = 30;

/// Upper bound (exclusive) on container constructions per iteration
pub const MAX_CONTAINERS: i32 = 50;

/// Number of container construction strategies
pub const CONSTRUCTION_STRATEGIES: i32 = 3;

/// Maximum number of entries in a generated archive
pub const MAX_ARCHIVE_ENTRIES: u8 = 8;

/// How long the daemon gets to come up before it is killed
pub const DEFAULT_READY_TIMEOUT: Duration = Duration::from_secs(4);

/// Interval between readiness probes
pub const READY_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// How long a signalled daemon may take to exit before it is killed
pub const STOP_GRACE_PERIOD: Duration = Duration::from_secs(10);

/// Cap on daemon output kept in memory for diagnostics
pub const MAX_DIAGNOSTIC_BYTES: usize = 1024 * 1024;

/// Wall-clock bound on a single iteration's operations
pub const DEFAULT_ITERATION_TIMEOUT: Duration = Duration::from_secs(60);

/// Bound on establishing a client connection (in seconds)
pub const DEFAULT_CLIENT_TIMEOUT_SECS: u64 = 30;

/// Namespace every client request is scoped to
pub const DEFAULT_NAMESPACE: &str = "testing";

/// Runtime recorded on created containers
pub const DEFAULT_RUNTIME: &str = "io.containerd.runc.v2";

/// Maximum number of iterations for a replay run
pub const MAX_ITERATIONS: usize = 10000;

/// Default daemon binary
pub const DEFAULT_DAEMON_BINARY: &str = "containerd";

/// Directory holding the daemon binaries, appended to `PATH`
pub const DEFAULT_BINARY_DIR: &str = "/out/containerd-binaries";

/// Directory the daemon socket lives in
pub const DEFAULT_SOCKET_DIR: &str = "/run/containerd-test";

/// Daemon socket address
pub const DEFAULT_SOCKET_PATH: &str = "/run/containerd-test/containerd.sock";

/// Daemon persistent root
pub const DEFAULT_ROOT_DIR: &str = "/var/lib/containerd-test";

/// Daemon runtime state directory
pub const DEFAULT_STATE_DIR: &str = "/run/containerd-test/state";

/// Snapshotter queried when inspecting images
pub const DEFAULT_SNAPSHOTTER: &str = "overlayfs";

/// Default corpus directory
pub const DEFAULT_CORPUS_DIR: &str = "./fuzzing-corpus";

/// Default artifact directory
pub const DEFAULT_ARTIFACT_DIR: &str = "./fuzzing-artifacts";

/// Error text the daemon wrapper and clients use when nothing is listening
pub const DAEMON_NOT_RUNNING: &str = "daemon is not running";

/// Error text for a start request against a live daemon
pub const DAEMON_ALREADY_RUNNING: &str = "daemon is already running";

/// Fuzzing targets
pub mod targets {
    /// Container creation without daemon teardown
    pub const CREATE_CONTAINER_NO_TEARDOWN: &str = "create_container_no_teardown";
    /// Container creation with daemon teardown after each iteration
    pub const CREATE_CONTAINER_WITH_TEARDOWN: &str = "create_container_with_teardown";
}

/// Fuzzing modes
pub mod modes {
    /// Standard fuzzing mode
    pub const STANDARD: &str = "standard";
    /// Quick fuzzing mode (fewer iterations)
    pub const QUICK: &str = "quick";
    /// Thorough fuzzing mode (more iterations)
    pub const THOROUGH: &str = "thorough";
    /// CI mode (optimized for continuous integration)
    pub const CI: &str = "ci";
    /// Debug mode (extra logging)
    pub const DEBUG: &str = "debug";
}
