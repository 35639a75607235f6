//! ---
//! shem_section: "06-test-harness"
//! shem_subsection: "module"
//! shem_type: "source"
//! shem_scope: "code"
//! shem_description: "In-memory container runtime for orchestrator tests."
//! shem_version: "v0.1.0"
//! shem_owner: "tbd"
//! ---
use std::collections::{BTreeSet, HashMap, HashSet};
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use parking_lot::Mutex;
use shem_sandbox::{Result, RunConfig, Sandbox, SandboxError, SpawnedModule};
use tokio::io::DuplexStream;
use tokio::sync::oneshot;

const PIPE_CAPACITY: usize = 64 * 1024;

/// The test side of a module started through [`MemorySandbox`].
///
/// `stdin` reads what the orchestrator writes into the module; `stdout` and
/// `stderr` inject module output. Dropping the peer without signalling an
/// exit code resolves the module's exit future with 0.
pub struct ModulePeer {
    pub stdin: DuplexStream,
    pub stdout: DuplexStream,
    pub stderr: DuplexStream,
    exit: Option<oneshot::Sender<i32>>,
}

impl ModulePeer {
    /// Resolve the module's exit future with `code`.
    pub fn exit(&mut self, code: i32) {
        if let Some(tx) = self.exit.take() {
            let _ = tx.send(code);
        }
    }
}

#[derive(Default)]
struct State {
    remote_tags: HashMap<String, Vec<String>>,
    remote_tag_failures: HashSet<String>,
    labels: HashMap<String, HashMap<String, String>>,
    local_tags: HashMap<String, BTreeSet<String>>,
    pull_failures: HashSet<String>,
    pulled: Vec<String>,
    copied: Vec<(String, String, PathBuf)>,
    copy_payloads: HashMap<String, Vec<u8>>,
    containers: BTreeSet<String>,
    removed: Vec<(String, bool)>,
    peers: HashMap<String, ModulePeer>,
}

/// An in-memory [`Sandbox`] implementing all adapter primitives against
/// scripted registry and image state.
#[derive(Default)]
pub struct MemorySandbox {
    state: Mutex<State>,
}

impl MemorySandbox {
    pub fn new() -> Self {
        Self::default()
    }

    /// Script the remote tag listing for an image.
    pub fn set_remote_tags(&self, image: &str, tags: &[&str]) {
        self.state.lock().remote_tags.insert(
            image.to_owned(),
            tags.iter().map(|t| (*t).to_owned()).collect(),
        );
    }

    /// Make remote tag listing fail for an image, as registries that refuse
    /// listings do.
    pub fn fail_remote_tags(&self, image: &str) {
        self.state.lock().remote_tag_failures.insert(image.to_owned());
    }

    /// Script a label on an image reference.
    pub fn set_label(&self, image_ref: &str, label: &str, value: &str) {
        self.state
            .lock()
            .labels
            .entry(image_ref.to_owned())
            .or_default()
            .insert(label.to_owned(), value.to_owned());
    }

    /// Pre-seed a tag in local storage.
    pub fn add_local_tag(&self, image: &str, tag: &str) {
        self.state
            .lock()
            .local_tags
            .entry(image.to_owned())
            .or_default()
            .insert(tag.to_owned());
    }

    /// Make pulling a specific reference fail.
    pub fn fail_pull(&self, image_ref: &str) {
        self.state.lock().pull_failures.insert(image_ref.to_owned());
    }

    /// Script the bytes `copy_out` writes for an image reference.
    pub fn set_copy_payload(&self, image_ref: &str, payload: &[u8]) {
        self.state
            .lock()
            .copy_payloads
            .insert(image_ref.to_owned(), payload.to_vec());
    }

    /// Pre-seed a container name, e.g. an orphan left by a previous run.
    pub fn add_container(&self, name: &str) {
        self.state.lock().containers.insert(name.to_owned());
    }

    /// Take the test side of a module spawned via `run`.
    pub fn take_peer(&self, module: &str) -> Option<ModulePeer> {
        self.state.lock().peers.remove(module)
    }

    /// References pulled so far, in order.
    pub fn pulled(&self) -> Vec<String> {
        self.state.lock().pulled.clone()
    }

    /// `(name, force)` pairs of containers removed so far.
    pub fn removed(&self) -> Vec<(String, bool)> {
        self.state.lock().removed.clone()
    }

    /// Names of currently present containers.
    pub fn containers(&self) -> Vec<String> {
        self.state.lock().containers.iter().cloned().collect()
    }

    /// `(image_ref, path_in_image, dest)` records of `copy_out` calls.
    pub fn copied(&self) -> Vec<(String, String, PathBuf)> {
        self.state.lock().copied.clone()
    }

    fn command_failed(command: impl Into<String>, stderr: impl Into<String>) -> SandboxError {
        SandboxError::CommandFailed {
            command: command.into(),
            stderr: stderr.into(),
        }
    }

    /// Register a tagged reference (`image:tag`) in local storage. Digest
    /// references are recorded as pulls only, like a real store where the
    /// digest pull is tagless.
    fn record_local(state: &mut State, image_ref: &str) {
        if image_ref.contains('@') {
            return;
        }
        if let Some((image, tag)) = image_ref.rsplit_once(':') {
            state
                .local_tags
                .entry(image.to_owned())
                .or_default()
                .insert(tag.to_owned());
        }
    }
}

#[async_trait]
impl Sandbox for MemorySandbox {
    async fn pull(&self, image_ref: &str) -> Result<()> {
        let mut state = self.state.lock();
        if state.pull_failures.contains(image_ref) {
            return Err(Self::command_failed(
                format!("pull {image_ref}"),
                "manifest unknown",
            ));
        }
        state.pulled.push(image_ref.to_owned());
        Self::record_local(&mut state, image_ref);
        Ok(())
    }

    async fn local_tags(&self, image: &str) -> Result<Vec<String>> {
        Ok(self
            .state
            .lock()
            .local_tags
            .get(image)
            .map(|tags| tags.iter().cloned().collect())
            .unwrap_or_default())
    }

    async fn remote_tags(&self, image: &str) -> Result<Vec<String>> {
        let state = self.state.lock();
        if state.remote_tag_failures.contains(image) {
            return Err(Self::command_failed(
                format!("search {image}"),
                "registry does not allow tag listing",
            ));
        }
        Ok(state.remote_tags.get(image).cloned().unwrap_or_default())
    }

    async fn inspect_label(&self, image_ref: &str, label: &str) -> Result<String> {
        Ok(self
            .state
            .lock()
            .labels
            .get(image_ref)
            .and_then(|labels| labels.get(label))
            .cloned()
            .unwrap_or_default())
    }

    async fn tag(&self, _src_ref: &str, dst_ref: &str) -> Result<()> {
        Self::record_local(&mut self.state.lock(), dst_ref);
        Ok(())
    }

    async fn copy_out(&self, image_ref: &str, path_in_image: &str, dest: &Path) -> Result<()> {
        let payload = {
            let mut state = self.state.lock();
            state
                .copied
                .push((image_ref.to_owned(), path_in_image.to_owned(), dest.to_owned()));
            state
                .copy_payloads
                .get(image_ref)
                .cloned()
                .unwrap_or_else(|| b"binary".to_vec())
        };
        std::fs::write(dest, payload)?;
        Ok(())
    }

    async fn run(&self, config: &RunConfig) -> Result<SpawnedModule> {
        let (stdin_near, stdin_far) = tokio::io::duplex(PIPE_CAPACITY);
        let (stdout_far, stdout_near) = tokio::io::duplex(PIPE_CAPACITY);
        let (stderr_far, stderr_near) = tokio::io::duplex(PIPE_CAPACITY);
        let (exit_tx, exit_rx) = oneshot::channel();

        let peer = ModulePeer {
            stdin: stdin_far,
            stdout: stdout_far,
            stderr: stderr_far,
            exit: Some(exit_tx),
        };

        let mut state = self.state.lock();
        state.containers.insert(config.container_name());
        state.peers.insert(config.module.clone(), peer);

        Ok(SpawnedModule {
            stdin: Box::new(stdin_near),
            stdout: Box::new(stdout_near),
            stderr: Box::new(stderr_near),
            exit: Box::pin(async move { Ok(exit_rx.await.unwrap_or(0)) }),
        })
    }

    async fn containers_with_prefix(&self, prefix: &str) -> Result<Vec<String>> {
        Ok(self
            .state
            .lock()
            .containers
            .iter()
            .filter(|name| name.starts_with(prefix))
            .cloned()
            .collect())
    }

    async fn remove(&self, name: &str, force: bool) -> Result<()> {
        let mut state = self.state.lock();
        state.containers.remove(name);
        state.removed.push((name.to_owned(), force));
        Ok(())
    }
}
