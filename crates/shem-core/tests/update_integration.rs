//! ---
//! shem_section: "05-update-security"
//! shem_subsection: "module"
//! shem_type: "source"
//! shem_scope: "code"
//! shem_description: "Integration tests for the signed-artifact update engine."
//! shem_version: "v0.1.0"
//! shem_owner: "tbd"
//! ---
use std::sync::Arc;
use std::time::Duration;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use ed25519_dalek::{Signer, SigningKey};
use shem_common::{host_arch, Version};
use shem_core::update::UpdateManager;
use shem_security::signed_message;
use shem_testharness::{MemorySandbox, TempHome};
use tokio::sync::{broadcast, mpsc};
use tokio::time::timeout;

const METER_IMAGE: &str = "quay.io/shem/meter";
const ORCH_IMAGE: &str = "quay.io/shem/shem-orchestrator";

fn version(s: &str) -> Version {
    s.parse().unwrap()
}

fn key_pair(seed: u8) -> (SigningKey, String) {
    let key = SigningKey::from_bytes(&[seed; 32]);
    let public_b64 = BASE64.encode(key.verifying_key().as_bytes());
    (key, public_b64)
}

/// Label a signature image with a correctly signed digest for `(image, tag)`.
fn sign_artifact(sandbox: &MemorySandbox, image: &str, tag: &str, digest: &str, key: &SigningKey) {
    let sig_ref = format!("{image}-sig:{tag}");
    let signature = key.sign(signed_message(image, tag, digest).as_bytes());
    sandbox.set_label(&sig_ref, "energy.shem.digest", digest);
    sandbox.set_label(
        &sig_ref,
        "energy.shem.pubkey",
        &BASE64.encode(key.verifying_key().as_bytes()),
    );
    sandbox.set_label(
        &sig_ref,
        "energy.shem.signature",
        &BASE64.encode(signature.to_bytes()),
    );
}

struct Fixture {
    home: TempHome,
    sandbox: Arc<MemorySandbox>,
    manager: UpdateManager,
    restart: broadcast::Sender<()>,
    queue_tx: mpsc::Sender<String>,
    queue_rx: mpsc::Receiver<String>,
}

impl Fixture {
    fn new(own_version: &str, verification_run: bool) -> Self {
        let home = TempHome::new();
        // Zero deferral so scheduled updates hit the queue immediately.
        home.add_module("orchestrator")
            .image(ORCH_IMAGE)
            .file("UpdateDelayMaxHours", "0.0");

        let sandbox = Arc::new(MemorySandbox::new());
        let (restart, _) = broadcast::channel(4);
        let manager = UpdateManager::new(
            home.store(),
            sandbox.clone(),
            version(own_version),
            verification_run,
            restart.clone(),
        );
        let (queue_tx, queue_rx) = mpsc::channel(100);

        Self {
            home,
            sandbox,
            manager,
            restart,
            queue_tx,
            queue_rx,
        }
    }

    async fn check(&self) {
        self.manager.check_and_schedule(&self.queue_tx).await.unwrap();
    }

    async fn next_scheduled(&mut self) -> String {
        timeout(Duration::from_secs(2), self.queue_rx.recv())
            .await
            .expect("a deferred update reaches the queue")
            .expect("queue open")
    }
}

#[tokio::test]
async fn failed_signature_blacklists_version_and_next_is_chosen() {
    let mut fixture = Fixture::new("0.1.0", false);
    let (key, public_b64) = key_pair(9);
    fixture
        .home
        .add_module("meter")
        .image(METER_IMAGE)
        .current_version("0.4.5")
        .public_key(&public_b64);

    let arch = host_arch();
    fixture.sandbox.set_remote_tags(
        &format!("{METER_IMAGE}-sig"),
        &[&format!("0.5.0-{arch}"), &format!("0.4.9-{arch}")],
    );

    // 0.5.0 is signed by somebody else's key; 0.4.9 is genuine.
    let (mallory, _) = key_pair(66);
    sign_artifact(
        &fixture.sandbox,
        METER_IMAGE,
        &format!("0.5.0-{arch}"),
        "sha256:aaaa",
        &mallory,
    );
    sign_artifact(
        &fixture.sandbox,
        METER_IMAGE,
        &format!("0.4.9-{arch}"),
        "sha256:bbbb",
        &key,
    );

    fixture.check().await;

    // The poisoned version is persisted to the blacklist.
    let meter = fixture.home.store().module("meter").unwrap();
    assert!(meter.blacklist_contains(version("0.5.0")).unwrap());
    assert!(!meter.blacklist_contains(version("0.4.9")).unwrap());

    // The binary was pulled by its signed digest, not by tag.
    assert!(fixture
        .sandbox
        .pulled()
        .contains(&format!("{METER_IMAGE}@sha256:bbbb")));

    // The fallback version executes and promotes current_version.
    let module = fixture.next_scheduled().await;
    assert_eq!(module, "meter");
    fixture.manager.apply_update(&module).await.unwrap();
    assert_eq!(meter.get("current_version").unwrap(), "0.4.9");
}

#[tokio::test]
async fn module_without_public_key_is_skipped() {
    let mut fixture = Fixture::new("0.1.0", false);
    fixture
        .home
        .add_module("meter")
        .image(METER_IMAGE)
        .current_version("0.4.5");

    let arch = host_arch();
    fixture
        .sandbox
        .set_remote_tags(&format!("{METER_IMAGE}-sig"), &[&format!("0.5.0-{arch}")]);

    fixture.check().await;

    assert!(
        timeout(Duration::from_millis(200), fixture.queue_rx.recv())
            .await
            .is_err(),
        "no update should be scheduled"
    );
    assert!(fixture.sandbox.pulled().iter().all(|r| !r.contains("@")));
}

#[tokio::test]
async fn refused_tag_listing_falls_back_to_latest_label() {
    let mut fixture = Fixture::new("0.1.0", false);
    let (key, public_b64) = key_pair(9);
    fixture
        .home
        .add_module("meter")
        .image(METER_IMAGE)
        .current_version("0.4.5")
        .public_key(&public_b64);

    let arch = host_arch();
    let sig_image = format!("{METER_IMAGE}-sig");
    fixture.sandbox.fail_remote_tags(&sig_image);
    fixture.sandbox.set_label(
        &format!("{sig_image}:latest-{arch}"),
        "org.opencontainers.image.version",
        "0.5.0",
    );
    sign_artifact(
        &fixture.sandbox,
        METER_IMAGE,
        &format!("0.5.0-{arch}"),
        "sha256:cccc",
        &key,
    );

    fixture.check().await;

    let module = fixture.next_scheduled().await;
    assert_eq!(module, "meter");
    fixture.manager.apply_update(&module).await.unwrap();
    assert_eq!(
        fixture
            .home
            .store()
            .module("meter")
            .unwrap()
            .get("current_version")
            .unwrap(),
        "0.5.0"
    );
}

#[tokio::test]
async fn unparseable_latest_label_is_ignored() {
    let mut fixture = Fixture::new("0.1.0", false);
    let (_, public_b64) = key_pair(9);
    fixture
        .home
        .add_module("meter")
        .image(METER_IMAGE)
        .current_version("0.4.5")
        .public_key(&public_b64);

    let arch = host_arch();
    let sig_image = format!("{METER_IMAGE}-sig");
    fixture.sandbox.fail_remote_tags(&sig_image);
    fixture.sandbox.set_label(
        &format!("{sig_image}:latest-{arch}"),
        "org.opencontainers.image.version",
        "definitely-not-a-version",
    );

    fixture.check().await;

    assert!(
        timeout(Duration::from_millis(200), fixture.queue_rx.recv())
            .await
            .is_err(),
        "nothing eligible, nothing scheduled"
    );
}

#[tokio::test]
async fn versions_at_or_below_current_are_not_scheduled() {
    let mut fixture = Fixture::new("0.1.0", false);
    let (key, public_b64) = key_pair(9);
    fixture
        .home
        .add_module("meter")
        .image(METER_IMAGE)
        .current_version("0.5.0")
        .public_key(&public_b64);

    let arch = host_arch();
    fixture.sandbox.set_remote_tags(
        &format!("{METER_IMAGE}-sig"),
        &[&format!("0.5.0-{arch}"), &format!("0.4.9-{arch}")],
    );
    sign_artifact(
        &fixture.sandbox,
        METER_IMAGE,
        &format!("0.5.0-{arch}"),
        "sha256:aaaa",
        &key,
    );

    fixture.check().await;

    assert!(
        timeout(Duration::from_millis(200), fixture.queue_rx.recv())
            .await
            .is_err(),
        "no strictly newer version, nothing scheduled"
    );
}

#[tokio::test]
async fn orchestrator_update_extracts_binary_and_requests_restart() {
    let mut fixture = Fixture::new("0.0.4", false);
    let (key, public_b64) = key_pair(5);
    let orchestrator = fixture.home.store().module("orchestrator").unwrap();
    orchestrator.set("public_key", &public_b64).unwrap();

    let arch = host_arch();
    fixture
        .sandbox
        .set_remote_tags(&format!("{ORCH_IMAGE}-sig"), &[&format!("0.0.5-{arch}")]);
    sign_artifact(
        &fixture.sandbox,
        ORCH_IMAGE,
        &format!("0.0.5-{arch}"),
        "sha256:dddd",
        &key,
    );

    let mut restart_rx = fixture.restart.subscribe();

    fixture.check().await;
    let module = fixture.next_scheduled().await;
    assert_eq!(module, "orchestrator");
    fixture.manager.apply_update(&module).await.unwrap();

    // The binary lands under bin/ as a versioned candidate and the engine
    // requests process-wide shutdown for the host supervisor to restart us.
    let target = fixture
        .home
        .home()
        .orchestrator_binary(version("0.0.5"));
    assert!(target.is_file());
    let copies = fixture.sandbox.copied();
    assert_eq!(copies.len(), 1);
    assert_eq!(copies[0].0, format!("{ORCH_IMAGE}:0.0.5-{arch}"));
    assert_eq!(copies[0].1, "/shem-orchestrator");

    timeout(Duration::from_secs(1), restart_rx.recv())
        .await
        .expect("restart requested")
        .unwrap();
}

#[tokio::test]
async fn verification_run_does_not_schedule_orchestrator_updates() {
    let mut fixture = Fixture::new("0.0.4", true);
    let (key, public_b64) = key_pair(5);
    let orchestrator = fixture.home.store().module("orchestrator").unwrap();
    orchestrator.set("public_key", &public_b64).unwrap();

    let arch = host_arch();
    fixture
        .sandbox
        .set_remote_tags(&format!("{ORCH_IMAGE}-sig"), &[&format!("0.0.5-{arch}")]);
    sign_artifact(
        &fixture.sandbox,
        ORCH_IMAGE,
        &format!("0.0.5-{arch}"),
        "sha256:dddd",
        &key,
    );

    fixture.check().await;

    assert!(
        timeout(Duration::from_millis(200), fixture.queue_rx.recv())
            .await
            .is_err(),
        "orchestrator updates must not be scheduled during a verification run"
    );
    // The artifact itself was still verified and pulled.
    assert!(fixture
        .sandbox
        .pulled()
        .contains(&format!("{ORCH_IMAGE}@sha256:dddd")));
}

#[tokio::test]
async fn blacklisted_local_version_is_not_adopted() {
    let fixture = Fixture::new("0.1.0", false);
    let (_, public_b64) = key_pair(9);
    fixture
        .home
        .add_module("meter")
        .image(METER_IMAGE)
        .current_version("0.4.5")
        .public_key(&public_b64);

    let arch = host_arch();
    fixture.sandbox.add_local_tag(METER_IMAGE, &format!("0.5.0-{arch}"));
    fixture.sandbox.add_local_tag(METER_IMAGE, &format!("0.4.9-{arch}"));

    let meter = fixture.home.store().module("meter").unwrap();
    meter.blacklist_add(version("0.5.0")).unwrap();

    fixture.manager.apply_update("meter").await.unwrap();

    // current_version is never set to a blacklisted version.
    assert_eq!(meter.get("current_version").unwrap(), "0.4.9");
}

#[tokio::test]
async fn stale_local_versions_leave_current_version_untouched() {
    let fixture = Fixture::new("0.1.0", false);
    let (_, public_b64) = key_pair(9);
    fixture
        .home
        .add_module("meter")
        .image(METER_IMAGE)
        .current_version("0.5.0")
        .public_key(&public_b64);

    let arch = host_arch();
    fixture.sandbox.add_local_tag(METER_IMAGE, &format!("0.4.9-{arch}"));

    fixture.manager.apply_update("meter").await.unwrap();

    let meter = fixture.home.store().module("meter").unwrap();
    assert_eq!(meter.get("current_version").unwrap(), "0.5.0");
}
