//! ---
//! shem_section: "04-sandboxing"
//! shem_subsection: "module"
//! shem_type: "source"
//! shem_scope: "code"
//! shem_description: "Narrow adapter over the container runtime."
//! shem_version: "v0.1.0"
//! shem_owner: "tbd"
//! ---
//! The only place the orchestrator shells out. The [`Sandbox`] trait exposes
//! the primitives the supervisor and update engine need; [`PodmanSandbox`]
//! implements them against podman, and the test suite substitutes an
//! in-memory adapter.

mod podman;

use std::future::Future;
use std::path::{Path, PathBuf};
use std::pin::Pin;

use async_trait::async_trait;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};

pub use podman::PodmanSandbox;

/// Name prefix of all module containers.
pub const CONTAINER_PREFIX: &str = "shem-module-";

/// Failures from the container runtime. Command failures carry the runtime's
/// diagnostic output.
#[derive(Debug, Error)]
pub enum SandboxError {
    #[error("failed to execute {command}: {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },
    #[error("{command} failed: {stderr}")]
    CommandFailed { command: String, stderr: String },
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, SandboxError>;

/// Launch parameters for a sandboxed module.
#[derive(Debug, Clone)]
pub struct RunConfig {
    /// Module name; determines the container name.
    pub module: String,
    /// Fully tagged image reference; must already be in local storage.
    pub image_ref: String,
    /// Host directory mounted read-only at `/module-config`, when present.
    pub config_mount: Option<PathBuf>,
    /// Host directory mounted read-write at `/storage`, when present.
    pub storage_mount: Option<PathBuf>,
}

impl RunConfig {
    pub fn container_name(&self) -> String {
        format!("{CONTAINER_PREFIX}{}", self.module)
    }
}

/// Resolution of a spawned module's exit, as a process exit code.
pub type ExitFuture = Pin<Box<dyn Future<Output = std::io::Result<i32>> + Send>>;

/// A running sandboxed module with its three byte streams attached.
pub struct SpawnedModule {
    pub stdin: Box<dyn AsyncWrite + Send + Unpin>,
    pub stdout: Box<dyn AsyncRead + Send + Unpin>,
    pub stderr: Box<dyn AsyncRead + Send + Unpin>,
    pub exit: ExitFuture,
}

/// The container runtime primitives required by the orchestrator.
#[async_trait]
pub trait Sandbox: Send + Sync {
    /// Download an image, by tag or digest, into local storage.
    async fn pull(&self, image_ref: &str) -> Result<()>;

    /// Tags present in local storage for a base image.
    async fn local_tags(&self, image: &str) -> Result<Vec<String>>;

    /// Tags advertised by the remote registry for a base image. Registries
    /// may refuse listings; callers must tolerate failure.
    async fn remote_tags(&self, image: &str) -> Result<Vec<String>>;

    /// A named label of a local image. The empty string means absent.
    async fn inspect_label(&self, image_ref: &str, label: &str) -> Result<String>;

    /// Create a tag alias.
    async fn tag(&self, src_ref: &str, dst_ref: &str) -> Result<()>;

    /// Extract a file from an image without running it.
    async fn copy_out(&self, image_ref: &str, path_in_image: &str, dest: &Path) -> Result<()>;

    /// Start an image under the sandbox constraints with stdio pipes
    /// attached, replacing any existing container with the same name.
    async fn run(&self, config: &RunConfig) -> Result<SpawnedModule>;

    /// Names of containers (running or not) whose name starts with `prefix`.
    async fn containers_with_prefix(&self, prefix: &str) -> Result<Vec<String>>;

    /// Remove a container by name.
    async fn remove(&self, name: &str, force: bool) -> Result<()>;
}
