//! ---
//! shem_section: "01-core-functionality"
//! shem_subsection: "module"
//! shem_type: "source"
//! shem_scope: "code"
//! shem_description: "Module lifecycle supervision and desired-state reconciliation."
//! shem_version: "v0.1.0"
//! shem_owner: "tbd"
//! ---
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use shem_common::{host_arch, logging, Version, ORCHESTRATOR};
use shem_config::ConfigStore;
use shem_msg::{validate_name_part, CodecError, MessageReader};
use shem_sandbox::{ExitFuture, RunConfig, Sandbox, CONTAINER_PREFIX};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWriteExt, BufReader};
use tokio::sync::broadcast;
use tokio::time::{interval, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::router::{InputSinks, ModuleInput, Router};

/// Period of the desired-state reconciliation loop.
pub const RECONCILE_INTERVAL: Duration = Duration::from_secs(10);

/// Grace given to children between stdin close and the force-removing orphan
/// sweep during global teardown.
pub const STOP_GRACE: Duration = Duration::from_secs(5);

/// Ceilings on a child's output stream. Exceeding either is treated as
/// module malfunction and triggers a graceful stop.
#[derive(Debug, Clone, Copy)]
pub struct OutputPolicy {
    /// Counting window for both ceilings.
    pub window: Duration,
    /// Maximum well-formed messages per window.
    pub max_messages: u32,
    /// Maximum malformed messages per window.
    pub max_malformed: u32,
}

impl Default for OutputPolicy {
    fn default() -> Self {
        Self {
            window: Duration::from_secs(60),
            max_messages: 600,
            max_malformed: 60,
        }
    }
}

/// Sliding-window counters enforcing an [`OutputPolicy`] for one child.
struct OutputWindow {
    policy: OutputPolicy,
    started: Instant,
    messages: u32,
    malformed: u32,
}

impl OutputWindow {
    fn new(policy: OutputPolicy) -> Self {
        Self {
            policy,
            started: Instant::now(),
            messages: 0,
            malformed: 0,
        }
    }

    fn roll(&mut self) {
        if self.started.elapsed() >= self.policy.window {
            self.started = Instant::now();
            self.messages = 0;
            self.malformed = 0;
        }
    }

    /// Record a well-formed message; true when the ceiling is exceeded.
    fn record_message(&mut self) -> bool {
        self.roll();
        self.messages += 1;
        self.messages > self.policy.max_messages
    }

    /// Record a malformed message; true when the ceiling is exceeded.
    fn record_malformed(&mut self) -> bool {
        self.roll();
        self.malformed += 1;
        self.malformed > self.policy.max_malformed
    }
}

/// Record of one running module.
struct Instance {
    image: String,
    version: Version,
    container_name: String,
    stdin: ModuleInput,
}

/// The table of running instances, shared between the supervisor and (as an
/// [`InputSinks`] capability) the router. The lock is only held to mutate or
/// snapshot, never across I/O.
#[derive(Clone, Default)]
pub struct InstanceTable {
    inner: Arc<Mutex<HashMap<String, Instance>>>,
}

impl InstanceTable {
    fn insert(&self, name: String, instance: Instance) {
        self.inner.lock().insert(name, instance);
    }

    fn remove(&self, name: &str) -> Option<Instance> {
        self.inner.lock().remove(name)
    }

    fn running_meta(&self, name: &str) -> Option<(String, Version)> {
        self.inner
            .lock()
            .get(name)
            .map(|instance| (instance.image.clone(), instance.version))
    }

    fn names(&self) -> Vec<String> {
        self.inner.lock().keys().cloned().collect()
    }

    fn container_names(&self) -> HashSet<String> {
        self.inner
            .lock()
            .values()
            .map(|instance| instance.container_name.clone())
            .collect()
    }

    fn drain_stdins(&self) -> Vec<(String, ModuleInput)> {
        let mut table = self.inner.lock();
        let stdins = table
            .iter()
            .map(|(name, instance)| (name.clone(), instance.stdin.clone()))
            .collect();
        table.clear();
        stdins
    }
}

impl InputSinks for InstanceTable {
    fn lookup(&self, module: &str) -> Option<ModuleInput> {
        self.inner
            .lock()
            .get(module)
            .map(|instance| instance.stdin.clone())
    }
}

/// Reconciles desired on-disk module state against running sandboxed
/// children: spawning, watching, gracefully stopping, and sweeping orphaned
/// containers.
#[derive(Clone)]
pub struct ModuleSupervisor {
    store: ConfigStore,
    sandbox: Arc<dyn Sandbox>,
    instances: InstanceTable,
    router: Arc<Router>,
    policy: OutputPolicy,
    reconcile_interval: Duration,
    stop_grace: Duration,
}

impl ModuleSupervisor {
    pub fn new(store: ConfigStore, sandbox: Arc<dyn Sandbox>, policy: OutputPolicy) -> Self {
        let instances = InstanceTable::default();
        let router = Arc::new(Router::new(Arc::new(instances.clone())));
        Self {
            store,
            sandbox,
            instances,
            router,
            policy,
            reconcile_interval: RECONCILE_INTERVAL,
            stop_grace: STOP_GRACE,
        }
    }

    /// Override the loop timings, for tests exercising multiple ticks.
    pub fn with_timing(mut self, reconcile_interval: Duration, stop_grace: Duration) -> Self {
        self.reconcile_interval = reconcile_interval;
        self.stop_grace = stop_grace;
        self
    }

    /// Run the reconciliation loop until shutdown, then tear all modules
    /// down.
    pub async fn run(self, mut shutdown: broadcast::Receiver<()>) {
        info!("starting module supervisor");

        // The first tick fires immediately; reconciliation happens on
        // startup and then every period.
        let mut ticker = interval(self.reconcile_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.recv() => {
                    self.stop_all().await;
                    info!("module supervisor stopped");
                    return;
                }
                _ = ticker.tick() => {
                    self.reconcile().await;
                }
            }
        }
    }

    /// One reconciliation pass: orphan sweep, desired-state transitions,
    /// prune of unconfigured instances.
    async fn reconcile(&self) {
        // Containers asked to stop on a previous tick that have not exited
        // are removed here.
        self.sweep_orphans().await;

        let modules = match self.store.list_modules() {
            Ok(modules) => modules,
            Err(err) => {
                error!(error = %err, "failed to list modules");
                return;
            }
        };

        self.router.reload(&self.store, &modules);

        for name in &modules {
            if name == ORCHESTRATOR {
                continue;
            }
            self.reconcile_module(name).await;
        }

        // Stop modules no longer in the configuration.
        let desired: HashSet<&String> = modules.iter().collect();
        for name in self.instances.names() {
            if !desired.contains(&name) {
                info!(module = %name, "module removed from config, stopping");
                self.stop_module(&name).await;
            }
        }
    }

    async fn reconcile_module(&self, name: &str) {
        let config = match self.store.module(name) {
            Ok(config) => config,
            Err(err) => {
                error!(module = %name, error = %err, "failed to get module config");
                return;
            }
        };

        let running = self.instances.running_meta(name);

        if config.is_disabled() {
            if running.is_some() {
                info!(module = %name, "module is disabled, stopping");
                self.stop_module(name).await;
            }
            return;
        }

        match config.take_restart() {
            Ok(true) => {
                if running.is_some() {
                    info!(module = %name, "restart requested");
                    self.stop_module(name).await;
                    return;
                }
                info!(module = %name, "restart requested, but module is not running");
            }
            Ok(false) => {}
            Err(err) => {
                error!(module = %name, error = %err, "failed to consume restart file");
            }
        }

        let version = match config.get_or("current_version", "") {
            Ok(version) => version,
            Err(err) => {
                error!(module = %name, error = %err, "failed to get current_version");
                return;
            }
        };
        let image = match config.get_or("image", "") {
            Ok(image) => image,
            Err(err) => {
                error!(module = %name, error = %err, "failed to get image");
                return;
            }
        };

        if let Some((running_image, running_version)) = running {
            if running_image == image && running_version == Version::lenient(&version) {
                return; // up to date, nothing to do
            }
            info!(module = %name, "config changed, restarting");
            self.stop_module(name).await;
            return;
        }

        if version.is_empty() {
            return;
        }
        if image.is_empty() {
            warn!(module = %name, "module has no image set");
            return;
        }

        if let Err(err) = self.spawn_module(name, &image, Version::lenient(&version)).await {
            error!(module = %name, error = %err, "failed to start module");
        }
    }

    async fn spawn_module(&self, name: &str, image: &str, version: Version) -> anyhow::Result<()> {
        let image_ref = format!("{image}:{version}-{}", host_arch());
        info!(module = %name, image = %image_ref, "starting module");

        let module_dir = self.store.home().module_dir(name);
        let config_dir = module_dir.join("module-config");
        let storage_dir = module_dir.join("storage");

        let run_config = RunConfig {
            module: name.to_owned(),
            image_ref,
            config_mount: config_dir.is_dir().then_some(config_dir),
            storage_mount: storage_dir.is_dir().then_some(storage_dir),
        };
        let container_name = run_config.container_name();

        let spawned = self.sandbox.run(&run_config).await?;
        info!(module = %name, container = %container_name, "started container");

        let stdin: ModuleInput = Arc::new(tokio::sync::Mutex::new(spawned.stdin));
        self.instances.insert(
            name.to_owned(),
            Instance {
                image: image.to_owned(),
                version,
                container_name,
                stdin,
            },
        );

        let watcher = self.clone();
        let name = name.to_owned();
        tokio::spawn(async move {
            watcher
                .watch_module(name, spawned.stdout, spawned.stderr, spawned.exit)
                .await;
        });

        Ok(())
    }

    /// Reads the child's streams and waits for it to exit, then drops the
    /// instance record.
    async fn watch_module(
        self,
        name: String,
        stdout: Box<dyn AsyncRead + Send + Unpin>,
        stderr: Box<dyn AsyncRead + Send + Unpin>,
        exit: ExitFuture,
    ) {
        let messages = {
            let supervisor = self.clone();
            let module = name.clone();
            tokio::spawn(async move { supervisor.pump_messages(module, stdout).await })
        };
        let diagnostics = {
            let module = name.clone();
            tokio::spawn(async move { pump_diagnostics(module, stderr).await })
        };

        let code = exit.await;

        // Drain both streams fully before declaring the module gone.
        let _ = messages.await;
        let _ = diagnostics.await;

        match code {
            Ok(0) => info!(module = %name, "module exited"),
            Ok(code) => error!(module = %name, code, "module exited with error"),
            Err(err) => error!(module = %name, error = %err, "failed to await module exit"),
        }

        self.instances.remove(&name);
    }

    /// Parse the child's stdout as protocol messages, qualify names, and
    /// hand them to the router.
    async fn pump_messages(
        self,
        name: String,
        stdout: Box<dyn AsyncRead + Send + Unpin>,
    ) {
        let mut reader = MessageReader::new(stdout);
        let mut window = OutputWindow::new(self.policy);

        loop {
            match reader.read().await {
                Ok(None) => return,
                Ok(Some(message)) => {
                    if window.record_message() {
                        error!(module = %name, "message rate ceiling exceeded, stopping module");
                        self.stop_module(&name).await;
                        return;
                    }
                    if let Err(err) = validate_name_part(&message.name) {
                        warn!(module = %name, name = %message.name, error = %err, "invalid variable name");
                        if window.record_malformed() {
                            error!(module = %name, "malformed message ceiling exceeded, stopping module");
                            self.stop_module(&name).await;
                            return;
                        }
                        continue;
                    }

                    let qualified = message.with_name(format!("{name}.{}", message.name));
                    debug!(module = %name, kind = qualified.type_str(), name = %qualified.name, "received message");
                    self.router.route(&name, &qualified).await;
                }
                Err(CodecError::Io(err)) => {
                    warn!(module = %name, error = %err, "stdout read failed");
                    return;
                }
                Err(err) => {
                    warn!(module = %name, error = %err, "invalid message");
                    if window.record_malformed() {
                        error!(module = %name, "malformed message ceiling exceeded, stopping module");
                        self.stop_module(&name).await;
                        return;
                    }
                }
            }
        }
    }

    /// Close the child's stdin (modules treat EOF as shutdown) and drop the
    /// instance record. The container is not killed here; the next tick's
    /// orphan sweep force-removes it if it lingers.
    async fn stop_module(&self, name: &str) {
        let Some(instance) = self.instances.remove(name) else {
            return;
        };
        info!(module = %name, "closing stdin to request shutdown");
        let mut stdin = instance.stdin.lock().await;
        if let Err(err) = stdin.shutdown().await {
            debug!(module = %name, error = %err, "failed to close module stdin");
        }
    }

    /// Remove any `shem-module-*` container that is not in the instance
    /// table.
    async fn sweep_orphans(&self) {
        let containers = match self.sandbox.containers_with_prefix(CONTAINER_PREFIX).await {
            Ok(containers) => containers,
            Err(err) => {
                error!(error = %err, "failed to list containers");
                return;
            }
        };

        let expected = self.instances.container_names();
        for name in containers {
            if !expected.contains(&name) {
                warn!(container = %name, "removing orphaned container");
                if let Err(err) = self.sandbox.remove(&name, true).await {
                    error!(container = %name, error = %err, "failed to remove container");
                }
            }
        }
    }

    /// Global teardown: close every stdin, wait out the grace period, clear
    /// the table, and force-remove stragglers via the orphan sweep.
    async fn stop_all(&self) {
        info!("stopping all modules");

        for (name, stdin) in self.instances.drain_stdins() {
            info!(module = %name, "closing stdin to request shutdown");
            let mut stdin = stdin.lock().await;
            if let Err(err) = stdin.shutdown().await {
                debug!(module = %name, error = %err, "failed to close module stdin");
            }
        }

        tokio::time::sleep(self.stop_grace).await;
        self.sweep_orphans().await;
    }
}

/// Forward a child's stderr line-by-line into the orchestrator log,
/// preserving a leading `<N>` severity tag when present.
async fn pump_diagnostics(name: String, stderr: Box<dyn AsyncRead + Send + Unpin>) {
    let mut lines = BufReader::new(stderr).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => log_diagnostic_line(&name, &line),
            Ok(None) => return,
            Err(err) => {
                warn!(module = %name, error = %err, "stderr read failed");
                return;
            }
        }
    }
}

fn log_diagnostic_line(module: &str, line: &str) {
    match logging::split_severity(line) {
        Some((0..=3, rest)) => error!(target: "module", module = %module, "{rest}"),
        Some((4, rest)) => warn!(target: "module", module = %module, "{rest}"),
        Some((5..=6, rest)) => info!(target: "module", module = %module, "{rest}"),
        Some((_, rest)) => debug!(target: "module", module = %module, "{rest}"),
        None => info!(target: "module", module = %module, "{line}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn output_window_trips_on_message_flood() {
        let mut window = OutputWindow::new(OutputPolicy {
            window: Duration::from_secs(60),
            max_messages: 3,
            max_malformed: 2,
        });
        assert!(!window.record_message());
        assert!(!window.record_message());
        assert!(!window.record_message());
        assert!(window.record_message());
    }

    #[test]
    fn output_window_counts_malformed_separately() {
        let mut window = OutputWindow::new(OutputPolicy {
            window: Duration::from_secs(60),
            max_messages: 100,
            max_malformed: 1,
        });
        assert!(!window.record_message());
        assert!(!window.record_malformed());
        assert!(window.record_malformed());
    }
}
