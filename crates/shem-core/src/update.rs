//! ---
//! shem_section: "05-update-security"
//! shem_subsection: "module"
//! shem_type: "source"
//! shem_scope: "code"
//! shem_description: "Signed-artifact discovery, verification, and scheduled updates."
//! shem_version: "v0.1.0"
//! shem_owner: "tbd"
//! ---
//! The update engine. Artifact naming convention:
//!
//! ```text
//! image and tag:       quay.io/shem/shem-orchestrator:0.0.1-amd64
//! image or base image: quay.io/shem/shem-orchestrator
//! signature image:     quay.io/shem/shem-orchestrator-sig
//! tag:                 0.0.1-amd64
//! version:             0.0.1
//! architecture:        amd64
//! ```

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use parking_lot::Mutex;
use rand::Rng;
use shem_common::{host_arch, Tag, Version, ORCHESTRATOR};
use shem_config::ConfigStore;
use shem_sandbox::Sandbox;
use shem_security::{verify_artifact, SignatureData};
use tokio::sync::{broadcast, mpsc};
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

/// Hours between update checks when the orchestrator config does not say
/// otherwise.
pub const DEFAULT_CHECK_INTERVAL_HOURS: f64 = 22.15;
/// Upper bound in hours of the random execution deferral.
pub const DEFAULT_DELAY_MAX_HOURS: f64 = 96.0;

/// Capacity of the deferred-execution queue. A full queue drops the task
/// with a warning.
const UPDATE_QUEUE_CAPACITY: usize = 100;

/// Suffix of the co-located signature image namespace.
const SIG_SUFFIX: &str = "-sig";
/// Path of the orchestrator binary inside its artifact image.
const ORCHESTRATOR_BINARY_PATH: &str = "/shem-orchestrator";

const VERSION_LABEL: &str = "org.opencontainers.image.version";
const DIGEST_LABEL: &str = "energy.shem.digest";
const PUBKEY_LABEL: &str = "energy.shem.pubkey";
const SIGNATURE_LABEL: &str = "energy.shem.signature";

/// Read a scalar option from the orchestrator's own module config, falling
/// back to the default on any error.
fn orchestrator_option(store: &ConfigStore, key: &str, default: f64) -> f64 {
    match store
        .module(ORCHESTRATOR)
        .and_then(|config| config.get_f64_or(key, default))
    {
        Ok(value) => value,
        Err(err) => {
            warn!(key, error = %err, "falling back to default orchestrator option");
            default
        }
    }
}

/// Discovers, verifies, schedules, and applies signed module updates.
pub struct UpdateManager {
    store: ConfigStore,
    sandbox: Arc<dyn Sandbox>,
    own_version: Version,
    verification_run: bool,
    /// Process-wide cancellation trigger, used to restart the orchestrator
    /// after a self-update.
    restart: broadcast::Sender<()>,
    /// Module name to version pending deferred execution.
    scheduled: Mutex<HashMap<String, Version>>,
    check_interval: Duration,
    max_delay: Duration,
}

impl UpdateManager {
    /// Build the update manager. The check interval and maximum deferral
    /// are read from the orchestrator config once, here.
    pub fn new(
        store: ConfigStore,
        sandbox: Arc<dyn Sandbox>,
        own_version: Version,
        verification_run: bool,
        restart: broadcast::Sender<()>,
    ) -> Self {
        let check_hours = orchestrator_option(
            &store,
            "UpdateCheckIntervalHours",
            DEFAULT_CHECK_INTERVAL_HOURS,
        );
        let delay_hours = orchestrator_option(&store, "UpdateDelayMaxHours", DEFAULT_DELAY_MAX_HOURS);

        Self {
            store,
            sandbox,
            own_version,
            verification_run,
            restart,
            scheduled: Mutex::new(HashMap::new()),
            check_interval: Duration::from_secs_f64(check_hours * 3600.0),
            max_delay: Duration::from_secs_f64(delay_hours * 3600.0),
        }
    }

    /// Run the check/schedule/apply loop until shutdown.
    pub async fn run(self: Arc<Self>, mut shutdown: broadcast::Receiver<()>) {
        info!("starting update manager");

        let check_interval = self.check_interval;
        let (queue_tx, mut queue_rx) = mpsc::channel::<String>(UPDATE_QUEUE_CAPACITY);

        // The first check happens one full interval after start.
        let mut ticker = interval_at(Instant::now() + check_interval, check_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.recv() => {
                    info!("stopping update manager");
                    return;
                }
                _ = ticker.tick() => {
                    if let Err(err) = self.check_and_schedule(&queue_tx).await {
                        error!(error = %err, "error checking for updates");
                    }
                }
                Some(module) = queue_rx.recv() => {
                    info!(module = %module, "executing scheduled update");
                    if let Err(err) = self.apply_update(&module).await {
                        error!(module = %module, error = %err, "error updating module");
                    }
                }
            }
        }
    }

    /// The running version for a module: the compiled-in version for the
    /// orchestrator itself, the persisted `current_version` otherwise.
    fn current_module_version(&self, module: &str) -> Option<Version> {
        if module == ORCHESTRATOR {
            return Some(self.own_version);
        }
        let config = match self.store.module(module) {
            Ok(config) => config,
            Err(err) => {
                error!(module = %module, error = %err, "failed to load module config");
                return None;
            }
        };
        match config.get_opt("current_version") {
            Ok(Some(version)) => Some(Version::lenient(&version)),
            Ok(None) => {
                debug!(module = %module, "no current version recorded");
                None
            }
            Err(err) => {
                error!(module = %module, error = %err, "failed to read current_version");
                None
            }
        }
    }

    /// One pass over all modules with a `public_key`: find, verify, and
    /// schedule the newest eligible update for each.
    pub async fn check_and_schedule(&self, queue: &mpsc::Sender<String>) -> Result<()> {
        let modules = self.store.list_modules()?;
        info!(count = modules.len(), "checking for updates");

        for module in modules {
            let config = match self.store.module(&module) {
                Ok(config) => config,
                Err(err) => {
                    error!(module = %module, error = %err, "failed to load module config");
                    continue;
                }
            };

            let image = match config.get("image") {
                Ok(image) => image,
                Err(err) => {
                    error!(module = %module, error = %err, "failed to get image");
                    continue;
                }
            };

            let public_key = match config.get_opt("public_key") {
                Ok(Some(key)) => key,
                Ok(None) => {
                    debug!(module = %module, "no public key, auto-update disabled");
                    continue;
                }
                Err(err) => {
                    error!(module = %module, error = %err, "failed to read public key");
                    continue;
                }
            };

            debug!(module = %module, image = %image, "checking for updates");

            let current = self.current_module_version(&module);
            let scheduled = self.scheduled.lock().get(&module).copied();
            let minimum = match (current, scheduled) {
                (Some(current), Some(scheduled)) => Some(current.max(scheduled)),
                (current, scheduled) => current.or(scheduled),
            };

            // Verification failures are added both here, for this cycle,
            // and to the persisted blacklist.
            let mut blacklist = match config.blacklist() {
                Ok(blacklist) => blacklist,
                Err(err) => {
                    error!(module = %module, error = %err, "failed to read blacklist");
                    continue;
                }
            };

            loop {
                let Some(candidate) = self.latest_eligible(&image, minimum, &blacklist).await
                else {
                    debug!(module = %module, "no eligible update found");
                    break;
                };

                info!(
                    module = %module,
                    current = %current.map(|v| v.to_string()).unwrap_or_else(|| "none".to_owned()),
                    candidate = %candidate,
                    "found potential update"
                );

                let tag = Tag::for_host(candidate).to_string();
                match self.verify_and_pull(&image, &tag, &public_key).await {
                    Err(err) => {
                        warn!(module = %module, version = %candidate, error = %err, "verification failed");
                        blacklist.insert(candidate);
                        if let Err(err) = config.blacklist_add(candidate) {
                            error!(module = %module, version = %candidate, error = %err, "failed to persist blacklist entry");
                        }
                    }
                    Ok(()) => {
                        info!(module = %module, version = %candidate, "signature verification successful");
                        if self.verification_run && module == ORCHESTRATOR {
                            info!("skipping orchestrator update scheduling during verification run");
                        } else {
                            self.schedule(&module, candidate, queue);
                        }
                        break;
                    }
                }
            }
        }

        Ok(())
    }

    /// Versions available from the remote registry for `image`, from the
    /// signature namespace's tag listing unioned with the version label of
    /// its `latest-<arch>` tag. The label path covers registries that
    /// refuse tag listings.
    async fn remote_versions(&self, image: &str) -> BTreeSet<Version> {
        let sig_image = format!("{image}{SIG_SUFFIX}");

        let mut versions: BTreeSet<Version> = match self.sandbox.remote_tags(&sig_image).await {
            Ok(tags) => tags
                .iter()
                .filter_map(|tag| tag.parse::<Tag>().ok())
                .filter(|tag| tag.arch == host_arch())
                .map(|tag| tag.version)
                .collect(),
            Err(err) => {
                warn!(image = %image, error = %err, "failed to list remote signature tags");
                BTreeSet::new()
            }
        };

        let latest_ref = format!("{sig_image}:latest-{}", host_arch());
        match self.version_label(&latest_ref).await {
            Ok(Some(version)) => {
                versions.insert(version);
            }
            Ok(None) => {}
            Err(err) => {
                warn!(image = %image, error = %err, "failed to pull latest signature tag");
            }
        }

        info!(image = %image, count = versions.len(), "found remote versions");
        versions
    }

    /// Pull an image and read its OCI version label. An unparseable label
    /// is ignored rather than fatal.
    async fn version_label(&self, image_ref: &str) -> Result<Option<Version>> {
        self.sandbox.pull(image_ref).await?;
        let label = self.sandbox.inspect_label(image_ref, VERSION_LABEL).await?;
        Ok(label.trim().parse().ok())
    }

    /// Versions of `image` present in local storage for the host
    /// architecture.
    async fn local_versions(&self, image: &str) -> Result<BTreeSet<Version>> {
        let tags = self.sandbox.local_tags(image).await?;
        let versions = tags
            .iter()
            .filter_map(|tag| tag.parse::<Tag>().ok())
            .filter(|tag| tag.arch == host_arch())
            .map(|tag| tag.version)
            .collect::<BTreeSet<_>>();
        debug!(image = %image, count = versions.len(), "found local versions");
        Ok(versions)
    }

    /// The highest remote version that is neither blacklisted nor at or
    /// below the minimum.
    async fn latest_eligible(
        &self,
        image: &str,
        minimum: Option<Version>,
        blacklist: &BTreeSet<Version>,
    ) -> Option<Version> {
        let latest = self
            .remote_versions(image)
            .await
            .into_iter()
            .filter(|version| !blacklist.contains(version))
            .filter(|version| minimum.map_or(true, |minimum| *version > minimum))
            .max()?;
        info!(image = %image, version = %latest, "found latest eligible version");
        Some(latest)
    }

    /// Pull the signature container for `(base_image, tag)`, verify its
    /// signature against the module's key, then pull the binary *by digest*
    /// and tag it. Pulling by digest binds the artifact identity to the
    /// signed digest, so a registry cannot serve different bytes for the
    /// same tag.
    pub async fn verify_and_pull(
        &self,
        base_image: &str,
        tag: &str,
        module_key: &str,
    ) -> Result<()> {
        let sig_ref = format!("{base_image}{SIG_SUFFIX}:{tag}");

        debug!(image = %sig_ref, "pulling signature container");
        self.sandbox
            .pull(&sig_ref)
            .await
            .with_context(|| format!("failed to pull signature container {sig_ref}"))?;

        let sig = self.signature_data(&sig_ref).await?;

        verify_artifact(base_image, tag, &sig, module_key)
            .with_context(|| format!("signature verification failed for {base_image}:{tag}"))?;
        info!(image = %base_image, tag = %tag, "signature verified");

        let digest_ref = format!("{base_image}@{}", sig.digest);
        debug!(image = %digest_ref, "pulling binary container");
        self.sandbox
            .pull(&digest_ref)
            .await
            .with_context(|| format!("failed to pull binary container {digest_ref}"))?;

        // Local enumeration searches for tags, so alias the digest pull.
        let version_ref = format!("{base_image}:{tag}");
        if let Err(err) = self.sandbox.tag(&digest_ref, &version_ref).await {
            warn!(src = %digest_ref, dst = %version_ref, error = %err, "failed to tag pulled image");
        }

        info!(image = %base_image, tag = %tag, "verified and pulled");
        Ok(())
    }

    /// Extract the three signature labels. Any missing label fails the
    /// attempt.
    async fn signature_data(&self, sig_ref: &str) -> Result<SignatureData> {
        let label = |name: &'static str| async move {
            let value = self
                .sandbox
                .inspect_label(sig_ref, name)
                .await
                .with_context(|| format!("failed to extract {name} from {sig_ref}"))?;
            if value.is_empty() {
                bail!("{name} not found in signature container {sig_ref}");
            }
            Ok::<String, anyhow::Error>(value)
        };

        Ok(SignatureData {
            digest: label(DIGEST_LABEL).await?,
            public_key_b64: label(PUBKEY_LABEL).await?,
            signature_b64: label(SIGNATURE_LABEL).await?,
        })
    }

    /// Record a scheduled update and spawn its deferred-execution task with
    /// a uniformly random delay in `[0, UpdateDelayMaxHours]`.
    fn schedule(&self, module: &str, version: Version, queue: &mpsc::Sender<String>) {
        let delay = self.max_delay.mul_f64(rand::thread_rng().gen_range(0.0..=1.0));

        self.scheduled.lock().insert(module.to_owned(), version);

        info!(
            module = %module,
            version = %version,
            delay_hours = %format_args!("{:.1}", delay.as_secs_f64() / 3600.0),
            "update scheduled"
        );

        let queue = queue.clone();
        let module = module.to_owned();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            match queue.try_send(module.clone()) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Full(_)) => {
                    warn!(module = %module, "update queue full, dropping scheduled update");
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    debug!(module = %module, "update queue closed, dropping scheduled update");
                }
            }
        });
    }

    /// Apply the newest locally available, non-blacklisted version of a
    /// module. For ordinary modules this persists `current_version`; the
    /// supervisor's next reconcile restarts the child. For the orchestrator
    /// it extracts the new binary and requests process restart.
    pub async fn apply_update(&self, module: &str) -> Result<()> {
        self.scheduled.lock().remove(module);

        let config = self
            .store
            .module(module)
            .with_context(|| format!("failed to load config for module {module}"))?;
        let image = config.get("image")?;

        let local = self.local_versions(&image).await?;
        let blacklist = config.blacklist()?;
        let newest = local
            .into_iter()
            .rev()
            .find(|version| !blacklist.contains(version))
            .ok_or_else(|| anyhow!("no eligible local versions found for image {image}"))?;

        if let Some(current) = self.current_module_version(module) {
            if newest <= current {
                info!(
                    module = %module,
                    newest = %newest,
                    current = %current,
                    "newest local version is not newer than current version"
                );
                return Ok(());
            }
        }

        if module != ORCHESTRATOR {
            config.set("current_version", &newest.to_string())?;
            info!(
                module = %module,
                version = %newest,
                "current_version updated, supervisor will restart the module"
            );
            return Ok(());
        }

        let image_ref = format!("{image}:{}", Tag::for_host(newest));
        let target = self.store.home().orchestrator_binary(newest);
        self.sandbox
            .copy_out(&image_ref, ORCHESTRATOR_BINARY_PATH, &target)
            .await
            .with_context(|| format!("failed to extract binary from image {image_ref}"))?;
        info!(version = %newest, target = %target.display(), "extracted orchestrator binary");

        info!("initiating orchestrator shutdown for restart");
        if self.restart.send(()).is_err() {
            bail!("cannot restart orchestrator: no shutdown listeners");
        }
        Ok(())
    }
}
