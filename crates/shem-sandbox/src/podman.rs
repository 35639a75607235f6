//! ---
//! shem_section: "04-sandboxing"
//! shem_subsection: "module"
//! shem_type: "source"
//! shem_scope: "code"
//! shem_description: "Podman implementation of the sandbox adapter."
//! shem_version: "v0.1.0"
//! shem_owner: "tbd"
//! ---
use std::path::Path;
use std::process::Stdio;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::debug;

use crate::{Result, RunConfig, Sandbox, SandboxError, SpawnedModule};

/// Environment variables never passed into module containers, so the runtime
/// cannot notify the host supervisor on the orchestrator's behalf.
const STRIPPED_ENV: [&str; 3] = ["NOTIFY_SOCKET", "WATCHDOG_USEC", "WATCHDOG_PID"];

/// Sandbox adapter backed by the podman CLI.
#[derive(Debug, Clone)]
pub struct PodmanSandbox {
    binary: String,
}

impl PodmanSandbox {
    pub fn new() -> Self {
        Self {
            binary: "podman".to_owned(),
        }
    }

    /// Use a different runtime binary (e.g. a wrapper script).
    pub fn with_binary(binary: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
        }
    }

    fn command_line(&self, args: &[&str]) -> String {
        format!("{} {}", self.binary, args.join(" "))
    }

    /// Run the runtime binary, returning stdout. A non-zero exit carries the
    /// runtime's stderr in the error.
    async fn output(&self, args: &[&str]) -> Result<String> {
        debug!(command = %self.command_line(args), "invoking container runtime");
        let output = Command::new(&self.binary)
            .args(args)
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|source| SandboxError::Spawn {
                command: self.command_line(args),
                source,
            })?;

        if !output.status.success() {
            return Err(SandboxError::CommandFailed {
                command: self.command_line(args),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_owned(),
            });
        }

        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    async fn run_ok(&self, args: &[&str]) -> Result<()> {
        self.output(args).await.map(|_| ())
    }

    fn lines(output: String) -> Vec<String> {
        output
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .map(str::to_owned)
            .collect()
    }
}

impl Default for PodmanSandbox {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Sandbox for PodmanSandbox {
    async fn pull(&self, image_ref: &str) -> Result<()> {
        self.run_ok(&["pull", image_ref]).await?;
        debug!(image = %image_ref, "pulled image");
        Ok(())
    }

    async fn local_tags(&self, image: &str) -> Result<Vec<String>> {
        let filter = format!("reference={image}");
        let output = self
            .output(&["images", "--filter", &filter, "--format", "{{.Tag}}"])
            .await?;
        Ok(Self::lines(output))
    }

    async fn remote_tags(&self, image: &str) -> Result<Vec<String>> {
        let output = self
            .output(&[
                "search",
                image,
                "--list-tags",
                "--limit",
                "10000",
                "--format",
                "{{.Tag}}",
            ])
            .await?;
        Ok(Self::lines(output))
    }

    async fn inspect_label(&self, image_ref: &str, label: &str) -> Result<String> {
        let format = format!("{{{{index .Config.Labels \"{label}\"}}}}");
        let output = self
            .output(&["inspect", "--format", &format, image_ref])
            .await?;
        let value = output.trim();
        // podman renders an absent label as "<no value>".
        if value == "<no value>" {
            return Ok(String::new());
        }
        Ok(value.to_owned())
    }

    async fn tag(&self, src_ref: &str, dst_ref: &str) -> Result<()> {
        self.run_ok(&["tag", src_ref, dst_ref]).await
    }

    async fn copy_out(&self, image_ref: &str, path_in_image: &str, dest: &Path) -> Result<()> {
        let container = format!("shem-extract-{}", sanitize(image_ref));

        // Create without starting; /bin/true is never executed.
        self.run_ok(&["create", "--replace", "--name", &container, image_ref, "/bin/true"])
            .await?;

        let source = format!("{container}:{path_in_image}");
        let dest_str = dest.to_string_lossy();
        let copied = self.run_ok(&["cp", &source, dest_str.as_ref()]).await;

        let _ = self.run_ok(&["rm", &container]).await;

        copied?;
        debug!(image = %image_ref, dest = %dest.display(), "extracted file from image");
        Ok(())
    }

    async fn run(&self, config: &RunConfig) -> Result<SpawnedModule> {
        let container_name = config.container_name();
        let mut args: Vec<String> = [
            "run",
            "-i",        // keep stdin open for the message stream
            "--rm",      // remove the container when it exits
            "--replace", // replace any existing container with the same name
            "--name",
            container_name.as_str(),
            "--pull",
            "never", // image must already be local
            "--network",
            "none",
            "--memory",
            "100m",
            "--cpus",
            "0.1",
            "--read-only",
            "--security-opt",
            "no-new-privileges",
            "--log-driver",
            "none", // the orchestrator reads the pipes directly
        ]
        .into_iter()
        .map(str::to_owned)
        .collect();

        if let Some(dir) = &config.config_mount {
            args.push("-v".to_owned());
            args.push(format!("{}:/module-config:ro", dir.display()));
        }
        if let Some(dir) = &config.storage_mount {
            args.push("-v".to_owned());
            args.push(format!("{}:/storage", dir.display()));
        }

        args.push(config.image_ref.clone());

        debug!(container = %container_name, image = %config.image_ref, "starting container");

        let mut command = Command::new(&self.binary);
        command
            .args(&args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        for var in STRIPPED_ENV {
            command.env_remove(var);
        }

        let mut child = command.spawn().map_err(|source| SandboxError::Spawn {
            command: format!("{} run {}", self.binary, config.image_ref),
            source,
        })?;

        let stdin = child.stdin.take().ok_or_else(|| {
            SandboxError::Io(std::io::Error::other("child stdin pipe not attached"))
        })?;
        let stdout = child.stdout.take().ok_or_else(|| {
            SandboxError::Io(std::io::Error::other("child stdout pipe not attached"))
        })?;
        let stderr = child.stderr.take().ok_or_else(|| {
            SandboxError::Io(std::io::Error::other("child stderr pipe not attached"))
        })?;

        Ok(SpawnedModule {
            stdin: Box::new(stdin),
            stdout: Box::new(stdout),
            stderr: Box::new(stderr),
            exit: Box::pin(async move {
                let status = child.wait().await?;
                Ok(status.code().unwrap_or(-1))
            }),
        })
    }

    async fn containers_with_prefix(&self, prefix: &str) -> Result<Vec<String>> {
        let filter = format!("name={prefix}");
        let output = self
            .output(&["ps", "-a", "--filter", &filter, "--format", "{{.Names}}"])
            .await?;
        // The name filter matches substrings; keep true prefix matches only.
        Ok(Self::lines(output)
            .into_iter()
            .filter(|name| name.starts_with(prefix))
            .collect())
    }

    async fn remove(&self, name: &str, force: bool) -> Result<()> {
        if force {
            self.run_ok(&["rm", "--force", "--ignore", name]).await
        } else {
            self.run_ok(&["rm", name]).await
        }
    }
}

/// Reduce an image reference to characters safe in a container name.
fn sanitize(image_ref: &str) -> String {
    image_ref
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '.' || c == '_' || c == '-' {
                c
            } else {
                '-'
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn container_name_uses_module_prefix() {
        let config = RunConfig {
            module: "meter".to_owned(),
            image_ref: "quay.io/shem/meter:1.0.0-amd64".to_owned(),
            config_mount: None,
            storage_mount: None,
        };
        assert_eq!(config.container_name(), "shem-module-meter");
    }

    #[test]
    fn sanitize_flattens_reference_separators() {
        assert_eq!(
            sanitize("quay.io/shem/meter:1.0.0-amd64"),
            "quay.io-shem-meter-1.0.0-amd64"
        );
    }
}
