//! Manifest step execution.
//!
//! Steps arrive in document form and are checked by a pre-validation
//! pass over the whole manifest before the first side effect, so one bad
//! step can never leave a manifest half-applied. Dispatch is a registry
//! keyed by step kind: adding a kind means registering another handler,
//! not editing existing dispatch logic.

pub mod compose;

use async_trait::async_trait;
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::manifest::{Manifest, Step};
use crate::repository::ManifestRepository;
use crate::utils::errors::{Result, UpdateError};
use compose::{ComposeAction, ComposeControl};

pub const SERVICE_CONFIG: &str = "service_config";
pub const DOCKER_COMPOSE: &str = "docker_compose";

/// Shared state handed to every handler.
pub struct StepContext {
    pub repo: Arc<dyn ManifestRepository>,
    pub compose: Arc<dyn ComposeControl>,
    /// Host root that manifest target paths are resolved under; "/" in
    /// production, a scratch directory in tests.
    pub install_root: PathBuf,
    /// Services a whole-stack action must leave alone.
    pub protected_services: Vec<String>,
}

impl StepContext {
    /// Resolve a manifest target path under the install root.
    pub fn resolve(&self, target: &Path) -> PathBuf {
        let rel = target.strip_prefix("/").unwrap_or(target);
        self.install_root.join(rel)
    }
}

/// One step kind.
#[async_trait]
pub trait StepHandler: Send + Sync {
    fn kind(&self) -> &'static str;

    /// Reject malformed or unsatisfiable steps before anything runs.
    async fn validate(&self, step: &Step, ctx: &StepContext) -> Result<()>;

    /// Host paths the step overwrites; these get snapshotted.
    fn touched_paths(&self, step: &Step, ctx: &StepContext) -> Vec<PathBuf>;

    async fn apply(&self, step: &Step, ctx: &StepContext) -> Result<()>;
}

/// Parse an octal file-mode string like "755".
pub(crate) fn parse_mode(raw: &str) -> Result<u32> {
    let well_formed = (raw.len() == 3 || raw.len() == 4)
        && raw.bytes().all(|b| (b'0'..=b'7').contains(&b));
    if !well_formed {
        return Err(UpdateError::Parse(format!(
            "invalid file mode {raw:?} (expected octal digits like \"755\")"
        )));
    }
    u32::from_str_radix(raw, 8)
        .map_err(|_| UpdateError::Parse(format!("invalid file mode {raw:?}")))
}

/// Installs a configuration file fetched from the update source.
pub struct ServiceConfigHandler;

impl ServiceConfigHandler {
    fn fields<'a>(step: &'a Step) -> Result<(&'a str, &'a Path)> {
        let path = step
            .path
            .as_deref()
            .ok_or_else(|| UpdateError::Parse("service_config step missing `path`".into()))?;
        let target = step
            .target
            .as_deref()
            .ok_or_else(|| UpdateError::Parse("service_config step missing `target`".into()))?;
        Ok((path, target))
    }
}

#[async_trait]
impl StepHandler for ServiceConfigHandler {
    fn kind(&self) -> &'static str {
        SERVICE_CONFIG
    }

    async fn validate(&self, step: &Step, _ctx: &StepContext) -> Result<()> {
        Self::fields(step)?;
        if let Some(raw) = step.permissions.as_deref() {
            parse_mode(raw)?;
        }
        Ok(())
    }

    fn touched_paths(&self, step: &Step, ctx: &StepContext) -> Vec<PathBuf> {
        match step.target.as_deref() {
            Some(target) => vec![ctx.resolve(target)],
            None => Vec::new(),
        }
    }

    async fn apply(&self, step: &Step, ctx: &StepContext) -> Result<()> {
        let (path, target) = Self::fields(step)?;
        let mode = step.permissions.as_deref().map(parse_mode).transpose()?;

        let content = ctx
            .repo
            .raw(path)
            .await
            .map_err(|e| UpdateError::SourceMissing(format!("{path}: {e}")))?;

        let resolved = ctx.resolve(target);
        install_file(&resolved, &content, mode)?;
        info!(source = path, target = %resolved.display(), "Installed config file");
        Ok(())
    }
}

fn install_file(target: &Path, content: &[u8], mode: Option<u32>) -> Result<()> {
    let wrap = |e: std::io::Error| UpdateError::TargetWrite {
        path: target.to_path_buf(),
        source: e,
    };

    if let Some(parent) = target.parent() {
        fs::create_dir_all(parent).map_err(wrap)?;
    }
    fs::write(target, content).map_err(wrap)?;

    #[cfg(unix)]
    if let Some(mode) = mode {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(target, fs::Permissions::from_mode(mode)).map_err(wrap)?;
    }
    #[cfg(not(unix))]
    let _ = mode;

    Ok(())
}

/// Runs a compose lifecycle action against one service or the stack.
pub struct ComposeHandler;

impl ComposeHandler {
    fn action(step: &Step) -> Result<ComposeAction> {
        let raw = step
            .action
            .as_deref()
            .ok_or_else(|| UpdateError::Parse("docker_compose step missing `action`".into()))?;
        ComposeAction::parse(raw)
    }

    /// A named service must exist in the stack; no name means every
    /// service except the protected ones.
    async fn resolve_targets(step: &Step, ctx: &StepContext) -> Result<Vec<String>> {
        let defined = ctx.compose.services().await?;
        match &step.service {
            Some(name) => {
                if !defined.contains(name) {
                    return Err(UpdateError::ServiceUnknown(name.clone()));
                }
                Ok(vec![name.clone()])
            }
            None => Ok(defined
                .into_iter()
                .filter(|s| !ctx.protected_services.contains(s))
                .collect()),
        }
    }
}

#[async_trait]
impl StepHandler for ComposeHandler {
    fn kind(&self) -> &'static str {
        DOCKER_COMPOSE
    }

    async fn validate(&self, step: &Step, ctx: &StepContext) -> Result<()> {
        Self::action(step)?;
        if let Some(name) = &step.service {
            let defined = ctx.compose.services().await?;
            if !defined.contains(name) {
                return Err(UpdateError::ServiceUnknown(name.clone()));
            }
        }
        Ok(())
    }

    fn touched_paths(&self, _step: &Step, _ctx: &StepContext) -> Vec<PathBuf> {
        Vec::new()
    }

    async fn apply(&self, step: &Step, ctx: &StepContext) -> Result<()> {
        let action = Self::action(step)?;
        let targets = Self::resolve_targets(step, ctx).await?;
        if targets.is_empty() {
            warn!(%action, "Compose action matched no services");
            return Ok(());
        }
        match action {
            ComposeAction::Restart => ctx.compose.restart(&targets).await?,
            ComposeAction::Recreate => ctx.compose.recreate(&targets).await?,
        }
        info!(%action, ?targets, "Compose action complete");
        Ok(())
    }
}

/// Registry of step handlers keyed by kind.
pub struct StepExecutor {
    handlers: HashMap<&'static str, Box<dyn StepHandler>>,
}

impl StepExecutor {
    /// Registry with the built-in step kinds.
    pub fn new() -> Self {
        let mut executor = StepExecutor {
            handlers: HashMap::new(),
        };
        executor.register(Box::new(ServiceConfigHandler));
        executor.register(Box::new(ComposeHandler));
        executor
    }

    pub fn register(&mut self, handler: Box<dyn StepHandler>) {
        self.handlers.insert(handler.kind(), handler);
    }

    fn handler(&self, step: &Step) -> Result<&dyn StepHandler> {
        self.handlers
            .get(step.kind.as_str())
            .map(|h| h.as_ref())
            .ok_or_else(|| UpdateError::UnsupportedStep {
                kind: step.kind.clone(),
            })
    }

    /// Validate every step of a manifest before any of them runs.
    pub async fn validate_manifest(&self, manifest: &Manifest, ctx: &StepContext) -> Result<()> {
        for (index, step) in manifest.steps.iter().enumerate() {
            self.handler(step)?.validate(step, ctx).await?;
            debug!(step = index + 1, kind = %step.kind, "step validated");
        }
        Ok(())
    }

    /// Every host path the manifest's steps touch, deduplicated in step
    /// order.
    pub fn touched_paths(&self, manifest: &Manifest, ctx: &StepContext) -> Result<Vec<PathBuf>> {
        let mut paths = Vec::new();
        for step in &manifest.steps {
            for path in self.handler(step)?.touched_paths(step, ctx) {
                if !paths.contains(&path) {
                    paths.push(path);
                }
            }
        }
        Ok(paths)
    }

    /// Apply a single step.
    pub async fn apply(&self, step: &Step, ctx: &StepContext) -> Result<()> {
        self.handler(step)?.apply(step, ctx).await
    }
}

impl Default for StepExecutor {
    fn default() -> Self {
        Self::new()
    }
}
