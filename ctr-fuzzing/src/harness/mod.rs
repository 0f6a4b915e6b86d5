// ctr-fuzzing/src/harness/mod.rs
//! Iteration driver for container-creation fuzzing
//!
//! A [`Campaign`] owns the daemon supervisor and runs one fuzz input at a
//! time against it: import archives, list images, create containers, then
//! release everything the iteration created.

pub mod container;
pub mod driver;
pub mod recovery;

pub use container::ConstructionStrategy;
pub use driver::{run_shared, FuzzDriver};
pub use recovery::{indicates_daemon_down, RecoveryPolicy, SocketRecovery};

use std::error::Error as StdError;

use tokio::time::{timeout_at, Instant};

use crate::client::{Connector, ContainerRef, ContainerdConnector, DeleteOptions, RuntimeClient};
use crate::config::HarnessConfig;
use crate::constants::{MAX_CONTAINERS, MAX_IMPORTS};
use crate::daemon::DaemonSupervisor;
use crate::error::{ClientError, DaemonError, HarnessError, InputError};
use crate::generators::FuzzConsumer;
use crate::reporters::CampaignStats;
use crate::utils::prepare_environment;

/// Outcome of one iteration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IterationStatus {
    /// No client connection could be made
    ConnectionFailed,
    /// The input ran out, or the image listing failed, before the end
    InputExhausted,
    /// All phases ran (possibly cut short by the deadline)
    Completed,
}

impl IterationStatus {
    /// Integer form returned to fuzz engines
    pub fn code(self) -> i32 {
        match self {
            IterationStatus::ConnectionFailed => -1,
            IterationStatus::InputExhausted => 0,
            IterationStatus::Completed => 1,
        }
    }
}

/// Number of imports for a decoded count
pub fn import_budget(raw: i32) -> usize {
    raw.rem_euclid(MAX_IMPORTS) as usize
}

/// Number of container constructions for a decoded count
pub fn container_budget(raw: i32) -> usize {
    raw.rem_euclid(MAX_CONTAINERS) as usize
}

/// Per-iteration resources, released at the end of every iteration
struct IterationContext {
    client: Box<dyn RuntimeClient>,
    created: Vec<ContainerRef>,
}

impl IterationContext {
    fn new(client: Box<dyn RuntimeClient>) -> Self {
        Self {
            client,
            created: Vec::new(),
        }
    }

    /// Delete created containers newest first, then close the client
    async fn release(mut self, stats: &mut CampaignStats) {
        while let Some(container) = self.created.pop() {
            let deleted = self
                .client
                .delete_container(&container, DeleteOptions::with_snapshot_cleanup())
                .await;
            if let Err(err) = &deleted {
                log::debug!("delete {}: {err}", container.id);
            }
            stats.record_deletion(deleted.is_ok());
        }

        if let Err(err) = self.client.close().await {
            log::debug!("closing client: {err}");
        }
    }
}

/// A fuzzing campaign against one daemon
pub struct Campaign {
    config: HarnessConfig,
    supervisor: DaemonSupervisor,
    connector: Box<dyn Connector>,
    recovery: Box<dyn RecoveryPolicy>,
    stats: CampaignStats,
}

impl Campaign {
    /// Campaign using the containerd client and socket recovery
    pub fn new(config: HarnessConfig) -> Self {
        let connector = ContainerdConnector::new(config.client_timeout_secs);
        let recovery = SocketRecovery::new(&config.socket_path);
        Self::with_parts(config, Box::new(connector), Box::new(recovery))
    }

    pub fn with_parts(
        config: HarnessConfig,
        connector: Box<dyn Connector>,
        recovery: Box<dyn RecoveryPolicy>,
    ) -> Self {
        Self {
            supervisor: DaemonSupervisor::new(config.daemon_config()),
            config,
            connector,
            recovery,
            stats: CampaignStats::new(),
        }
    }

    /// Read configuration from the environment and prepare the host for it
    pub fn from_env() -> Result<Self, HarnessError> {
        let config = HarnessConfig::from_env()?;
        prepare_environment(&config)?;
        Ok(Self::new(config))
    }

    pub fn config(&self) -> &HarnessConfig {
        &self.config
    }

    pub fn stats(&self) -> &CampaignStats {
        &self.stats
    }

    pub fn supervisor(&self) -> &DaemonSupervisor {
        &self.supervisor
    }

    /// Run one fuzz input against the daemon
    pub async fn run_iteration(&mut self, data: &[u8], teardown_after: bool) -> IterationStatus {
        let deadline = Instant::now() + self.config.iteration_timeout;

        if !self.supervisor.check_alive() {
            let before = self.supervisor.starts();
            self.supervisor.ensure_started(self.connector.as_ref()).await;
            self.stats.daemon_starts += self.supervisor.starts() - before;
        }

        let client = match self.connector.connect(&self.config.socket_path).await {
            Ok(client) => client,
            Err(err) => {
                log::warn!("failed to connect to daemon: {err}");
                self.recover(&err);
                self.stats.record_status(IterationStatus::ConnectionFailed);
                return IterationStatus::ConnectionFailed;
            }
        };

        let mut context = IterationContext::new(client);
        let status = self.exercise(&mut context, data, deadline).await;

        context.release(&mut self.stats).await;

        if teardown_after {
            self.teardown().await;
        }

        self.stats.record_status(status);
        status
    }

    /// Import, list and construct, drawing every decision from `data`
    ///
    /// The deadline is checked between units. Imports and the listing are
    /// abandoned at the deadline; a container creation already under way is
    /// allowed to finish so its result can be recorded and released.
    async fn exercise(
        &mut self,
        context: &mut IterationContext,
        data: &[u8],
        deadline: Instant,
    ) -> IterationStatus {
        let mut input = FuzzConsumer::new(data);

        let imports = match input.next_int() {
            Ok(raw) => import_budget(raw),
            Err(err) => {
                log::debug!("{err}");
                return IterationStatus::InputExhausted;
            }
        };
        for _ in 0..imports {
            let archive = match input.next_archive() {
                Ok(archive) => archive,
                Err(err) => {
                    log::debug!("{err}");
                    return IterationStatus::InputExhausted;
                }
            };
            let imported = match timeout_at(deadline, context.client.import(archive)).await {
                Ok(imported) => imported,
                Err(_) => return self.deadline_reached("import"),
            };
            if let Err(err) = &imported {
                log::debug!("import: {err}");
            }
            self.stats.record_import(imported.is_ok());
        }

        let images = match timeout_at(deadline, context.client.list_images()).await {
            Ok(Ok(images)) => images,
            Ok(Err(err)) => {
                log::warn!("listing images: {err}");
                return IterationStatus::InputExhausted;
            }
            Err(_) => return self.deadline_reached("image listing"),
        };
        if images.is_empty() {
            return IterationStatus::Completed;
        }

        let containers = match input.next_int() {
            Ok(raw) => container_budget(raw),
            Err(err) => {
                log::debug!("{err}");
                return IterationStatus::InputExhausted;
            }
        };
        for _ in 0..containers {
            if Instant::now() >= deadline {
                return self.deadline_reached("container construction");
            }
            let (selector, id) = match (input.next_int(), input.next_string()) {
                (Ok(selector), Ok(id)) => (selector, id),
                _ => break,
            };
            let strategy = ConstructionStrategy::select(selector);
            let built = container::build(
                context.client.as_ref(),
                &mut input,
                &images,
                &id,
                selector,
                &self.config.snapshotter,
            )
            .await;

            self.stats.record_construction(strategy, built.is_ok());
            match built {
                Ok(container) => context.created.push(container),
                Err(ClientError::Input(InputError::Exhausted(what))) => {
                    log::debug!("input exhausted while decoding {what}");
                    break;
                }
                Err(err) => log::debug!("create {id} ({strategy}): {err}"),
            }
        }

        IterationStatus::Completed
    }

    fn deadline_reached(&self, phase: &str) -> IterationStatus {
        log::warn!(
            "iteration deadline of {:?} reached during {phase}, cleaning up",
            self.config.iteration_timeout
        );
        IterationStatus::Completed
    }

    /// Tear the daemon down, routing failures through the recovery policy
    async fn teardown(&mut self) {
        if !self.supervisor.is_running() {
            log::debug!("no supervised daemon to tear down");
            return;
        }

        match self.supervisor.teardown().await {
            Ok(()) => self.stats.teardowns += 1,
            Err(err) => {
                log::warn!("teardown failed: {err}");
                self.stats.teardown_failures += 1;
                self.recover(&err);
            }
        }
    }

    fn recover(&mut self, err: &(dyn StdError + 'static)) {
        match self.recovery.maybe_recover(err) {
            Ok(true) => self.stats.recoveries += 1,
            Ok(false) => {}
            Err(io_err) => log::warn!("recovery failed: {io_err}"),
        }
    }

    /// Stop the daemon at the end of a campaign
    pub async fn shutdown(&mut self) -> Result<(), DaemonError> {
        if !self.supervisor.is_running() {
            return Ok(());
        }
        let result = self.supervisor.teardown().await;
        match &result {
            Ok(()) => self.stats.teardowns += 1,
            Err(_) => self.stats.teardown_failures += 1,
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_codes() {
        assert_eq!(IterationStatus::ConnectionFailed.code(), -1);
        assert_eq!(IterationStatus::InputExhausted.code(), 0);
        assert_eq!(IterationStatus::Completed.code(), 1);
    }

    #[test]
    fn test_budgets_wrap() {
        assert_eq!(import_budget(31), 1);
        assert_eq!(import_budget(30), 0);
        assert_eq!(import_budget(-1), 29);
        assert_eq!(container_budget(50), 0);
        assert_eq!(container_budget(-51), 49);
    }
}
