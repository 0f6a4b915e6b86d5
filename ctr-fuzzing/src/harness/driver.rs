// ctr-fuzzing/src/harness/driver.rs
//! Synchronous entry point for fuzz engines

use std::sync::{Mutex, OnceLock};

use tokio::runtime::{Builder, Runtime};

use crate::error::HarnessError;
use crate::harness::{Campaign, IterationStatus};

/// A campaign paired with the runtime that drives it
pub struct FuzzDriver {
    runtime: Runtime,
    campaign: Campaign,
}

impl FuzzDriver {
    pub fn new(campaign: Campaign) -> Result<Self, HarnessError> {
        let runtime = Builder::new_multi_thread()
            .worker_threads(1)
            .thread_name("ctr-fuzzing")
            .enable_all()
            .build()
            .map_err(|err| HarnessError::Config(format!("failed to build runtime: {err}")))?;
        Ok(Self { runtime, campaign })
    }

    /// Driver for a campaign configured from the environment
    pub fn from_env() -> Result<Self, HarnessError> {
        Self::new(Campaign::from_env()?)
    }

    pub fn run(&mut self, data: &[u8], teardown_after: bool) -> IterationStatus {
        self.runtime
            .block_on(self.campaign.run_iteration(data, teardown_after))
    }

    pub fn campaign(&self) -> &Campaign {
        &self.campaign
    }
}

static DRIVER: OnceLock<Mutex<Option<FuzzDriver>>> = OnceLock::new();

/// Run `data` on the process-wide driver, creating it on first use
///
/// Environment setup errors are returned on every call until setup succeeds.
pub fn run_shared(data: &[u8], teardown_after: bool) -> Result<IterationStatus, HarnessError> {
    let slot = DRIVER.get_or_init(|| Mutex::new(None));
    let mut guard = slot.lock().unwrap_or_else(|poisoned| poisoned.into_inner());

    if guard.is_none() {
        crate::init();
        *guard = Some(FuzzDriver::from_env()?);
    }

    match guard.as_mut() {
        Some(driver) => Ok(driver.run(data, teardown_after)),
        None => Err(HarnessError::Config("fuzz driver unavailable".to_string())),
    }
}
