//! ---
//! shem_section: "01-core-functionality"
//! shem_subsection: "module"
//! shem_type: "source"
//! shem_scope: "code"
//! shem_description: "Task wiring and lifecycle of the orchestrator process."
//! shem_version: "v0.1.0"
//! shem_owner: "tbd"
//! ---
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use parking_lot::Mutex;
use shem_common::{ShemHome, Version, ORCHESTRATOR};
use shem_config::ConfigStore;
use shem_sandbox::Sandbox;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{error, info};

use crate::heartbeat::Heartbeat;
use crate::selfupdate::promote_symlink;
use crate::supervisor::{ModuleSupervisor, OutputPolicy};
use crate::update::UpdateManager;

/// Steady-operation window before a verification run checks health and
/// promotes itself.
pub const VERIFICATION_DELAY: Duration = Duration::from_secs(10 * 60);

/// Pluggable health predicate consulted before a verification run promotes
/// its version. The default is vacuously healthy.
pub type HealthCheck = Box<dyn Fn() -> Result<()> + Send + Sync>;

/// The orchestrator process: supervises modules, routes messages, checks for
/// updates, heartbeats the host supervisor, and handles its own two-phase
/// self-update.
pub struct Orchestrator {
    store: ConfigStore,
    sandbox: Arc<dyn Sandbox>,
    version: Version,
    verification_run: bool,
    health_check: HealthCheck,
    policy: OutputPolicy,
    verification_delay: Duration,
    supervisor_timing: Option<(Duration, Duration)>,
}

impl Orchestrator {
    pub fn new(
        home: ShemHome,
        sandbox: Arc<dyn Sandbox>,
        version: Version,
        verification_run: bool,
    ) -> Self {
        Self {
            store: ConfigStore::new(home),
            sandbox,
            version,
            verification_run,
            health_check: Box::new(|| Ok(())),
            policy: OutputPolicy::default(),
            verification_delay: VERIFICATION_DELAY,
            supervisor_timing: None,
        }
    }

    /// Replace the verification health predicate.
    pub fn with_health_check(mut self, health_check: HealthCheck) -> Self {
        self.health_check = health_check;
        self
    }

    /// Override the child-output policy ceilings.
    pub fn with_output_policy(mut self, policy: OutputPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Override the verification window, for tests.
    pub fn with_verification_delay(mut self, delay: Duration) -> Self {
        self.verification_delay = delay;
        self
    }

    /// Override the supervisor's reconcile interval and stop grace, for
    /// tests.
    pub fn with_supervisor_timing(mut self, reconcile: Duration, stop_grace: Duration) -> Self {
        self.supervisor_timing = Some((reconcile, stop_grace));
        self
    }

    /// Run until a termination signal arrives or a component requests
    /// shutdown. Returns an error when a verification run failed its health
    /// check, so the process exits non-zero and the parent keeps the
    /// version blacklisted.
    pub async fn run(self) -> Result<()> {
        info!(
            version = %self.version,
            verification_run = self.verification_run,
            "starting SHEM orchestrator"
        );

        let (shutdown_tx, _) = broadcast::channel::<()>(16);
        let mut tasks: Vec<JoinHandle<()>> = Vec::new();

        let mut supervisor =
            ModuleSupervisor::new(self.store.clone(), self.sandbox.clone(), self.policy);
        if let Some((reconcile, stop_grace)) = self.supervisor_timing {
            supervisor = supervisor.with_timing(reconcile, stop_grace);
        }
        tasks.push(tokio::spawn(supervisor.run(shutdown_tx.subscribe())));

        let update_manager = Arc::new(UpdateManager::new(
            self.store.clone(),
            self.sandbox.clone(),
            self.version,
            self.verification_run,
            shutdown_tx.clone(),
        ));
        tasks.push(tokio::spawn(update_manager.run(shutdown_tx.subscribe())));

        match Heartbeat::from_env() {
            Ok(heartbeat) => tasks.push(tokio::spawn(heartbeat.run(shutdown_tx.subscribe()))),
            Err(err) => info!(reason = %err, "watchdog heartbeat not started"),
        }

        let verification_outcome: Arc<Mutex<Option<Result<()>>>> = Arc::new(Mutex::new(None));
        if self.verification_run {
            let outcome = verification_outcome.clone();
            let store = self.store.clone();
            let version = self.version;
            let health_check = self.health_check;
            let delay = self.verification_delay;
            let trigger = shutdown_tx.clone();
            let mut shutdown = shutdown_tx.subscribe();
            tasks.push(tokio::spawn(async move {
                tokio::select! {
                    _ = shutdown.recv() => return,
                    _ = tokio::time::sleep(delay) => {}
                }
                *outcome.lock() = Some(verification_check(&store, version, &health_check));
                let _ = trigger.send(());
            }));
        }

        let mut interrupt =
            signal(SignalKind::interrupt()).context("failed to install SIGINT handler")?;
        let mut terminate =
            signal(SignalKind::terminate()).context("failed to install SIGTERM handler")?;
        let mut shutdown = shutdown_tx.subscribe();

        tokio::select! {
            _ = interrupt.recv() => {
                info!("received interrupt, stopping orchestrator");
                let _ = shutdown_tx.send(());
            }
            _ = terminate.recv() => {
                info!("received termination signal, stopping orchestrator");
                let _ = shutdown_tx.send(());
            }
            _ = shutdown.recv() => {
                info!("orchestrator shutdown requested");
            }
        }

        for task in tasks {
            if let Err(err) = task.await {
                error!(error = %err, "task join error");
            }
        }

        info!("orchestrator stopped");

        let outcome = verification_outcome.lock().take();
        match outcome {
            Some(Err(err)) => Err(err),
            _ => Ok(()),
        }
    }
}

/// Phase-2 promotion: on a passing health check, unblacklist this version
/// and swing the stable symlink to it. A failure leaves the blacklist entry
/// in place, which is the rollback path.
fn verification_check(store: &ConfigStore, version: Version, health_check: &HealthCheck) -> Result<()> {
    (health_check)().context("health check failed")?;

    info!("verification run successful, removing blacklist entry");
    match store.module(ORCHESTRATOR) {
        Ok(config) => {
            if let Err(err) = config.blacklist_remove(version) {
                error!(version = %version, error = %err, "failed to remove version from blacklist");
            }
        }
        Err(err) => {
            error!(error = %err, "failed to load orchestrator config");
        }
    }

    if let Err(err) = promote_symlink(store.home(), version) {
        error!(error = %err, "failed to update orchestrator symlink");
    }

    info!("verification run completed, shutting down");
    Ok(())
}
