// Container Runtime Fuzzing Infrastructure
// Core library definition

pub mod config;
pub mod constants;
pub mod error;
pub mod utils;

// Core modules
pub mod client;
pub mod daemon;
pub mod generators;
pub mod harness;
pub mod reporters;

// Re-exports for convenience
pub use config::HarnessConfig;
pub use error::{ClientError, DaemonError, HarnessError, InputError};
pub use harness::{Campaign, IterationStatus};

/// Initialize the fuzzing infrastructure
///
/// Sets up logging for the current fuzzing mode. `RUST_LOG` overrides the
/// mode's default filter. Safe to call more than once.
pub fn init() {
    let mode = utils::get_fuzzing_mode();
    let _ = env_logger::Builder::new()
        .filter_level(utils::log_level_for_mode(&mode))
        .parse_default_env()
        .try_init();

    log::info!("container fuzzing initialized in {mode} mode");
}

/// Finalize the fuzzing process
pub fn finalize() {
    log::info!("fuzzing process finalized");
}
