//! Compose stack control.
//!
//! Lifecycle actions shell out to `docker compose`. The stack definition
//! (which services exist) is read straight from the compose file, so a
//! manifest naming an unknown service is rejected before anything runs.

use async_trait::async_trait;
use serde::Deserialize;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::path::PathBuf;
use tokio::process::Command;
use tracing::{debug, info};

use crate::utils::errors::{Result, UpdateError};

/// What a `docker_compose` step may do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ComposeAction {
    Restart,
    Recreate,
}

impl ComposeAction {
    pub fn parse(raw: &str) -> Result<Self> {
        match raw {
            "restart" => Ok(ComposeAction::Restart),
            "recreate" => Ok(ComposeAction::Recreate),
            other => Err(UpdateError::Parse(format!(
                "unknown compose action {other:?} (expected \"restart\" or \"recreate\")"
            ))),
        }
    }
}

impl fmt::Display for ComposeAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ComposeAction::Restart => write!(f, "restart"),
            ComposeAction::Recreate => write!(f, "recreate"),
        }
    }
}

/// Lifecycle operations the engine needs from the container runtime.
#[async_trait]
pub trait ComposeControl: Send + Sync {
    /// Service names defined in the stack.
    async fn services(&self) -> Result<BTreeSet<String>>;

    /// Service names currently running.
    async fn running_services(&self) -> Result<BTreeSet<String>>;

    /// Restart the given services in place.
    async fn restart(&self, services: &[String]) -> Result<()>;

    /// Stop, remove and start the given services from their images.
    async fn recreate(&self, services: &[String]) -> Result<()>;
}

/// Production implementation backed by the `docker compose` CLI.
pub struct DockerCompose {
    compose_file: PathBuf,
}

#[derive(Debug, Deserialize)]
struct ComposeDoc {
    #[serde(default)]
    services: BTreeMap<String, serde_yaml::Value>,
}

impl DockerCompose {
    pub fn new(compose_file: PathBuf) -> Self {
        DockerCompose { compose_file }
    }

    async fn run(&self, args: &[&str], services: &[String]) -> Result<()> {
        let mut cmd = Command::new("docker");
        cmd.arg("compose").arg("-f").arg(&self.compose_file);
        cmd.args(args);
        for service in services {
            cmd.arg(service);
        }
        debug!(?args, ?services, "Running docker compose");

        let output = cmd
            .output()
            .await
            .map_err(|e| UpdateError::Runtime(format!("docker compose: {e}")))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(UpdateError::Runtime(format!(
                "docker compose {} exited with {}: {}",
                args.join(" "),
                output.status,
                stderr.trim()
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl ComposeControl for DockerCompose {
    async fn services(&self) -> Result<BTreeSet<String>> {
        let raw = tokio::fs::read_to_string(&self.compose_file)
            .await
            .map_err(|e| {
                UpdateError::Runtime(format!("{}: {e}", self.compose_file.display()))
            })?;
        let doc: ComposeDoc = serde_yaml::from_str(&raw)
            .map_err(|e| UpdateError::Parse(format!("{}: {e}", self.compose_file.display())))?;
        Ok(doc.services.into_keys().collect())
    }

    async fn running_services(&self) -> Result<BTreeSet<String>> {
        // one running service name per line
        let output = Command::new("docker")
            .arg("compose")
            .arg("-f")
            .arg(&self.compose_file)
            .args(["ps", "--services", "--status", "running"])
            .output()
            .await
            .map_err(|e| UpdateError::Runtime(format!("docker compose ps: {e}")))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(UpdateError::Runtime(format!(
                "docker compose ps exited with {}: {}",
                output.status,
                stderr.trim()
            )));
        }

        Ok(String::from_utf8_lossy(&output.stdout)
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .map(String::from)
            .collect())
    }

    async fn restart(&self, services: &[String]) -> Result<()> {
        info!(?services, "Restarting services");
        self.run(&["restart"], services).await
    }

    async fn recreate(&self, services: &[String]) -> Result<()> {
        info!(?services, "Recreating services");
        self.run(&["up", "-d", "--force-recreate"], services).await
    }
}
