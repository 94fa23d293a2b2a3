//! The update engine.
//!
//! One logical worker wakes on a timer (or a manual trigger), compares
//! the installed version against the remote source and walks the
//! resulting manifest chain one manifest at a time:
//!
//! ```text
//! requires check -> validate -> snapshot -> apply -> verify -> commit
//! ```
//!
//! Failures before the snapshot abort with nothing to clean up. Failures
//! after it restore the snapshot. Either way the rest of the chain is
//! abandoned, because later manifests' `requires` now cannot hold. The
//! installed version only ever advances to a fully verified manifest.

use semver::Version;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{watch, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::backup::{Backup, BackupManager};
use crate::config::Config;
use crate::executor::compose::ComposeControl;
use crate::executor::{StepContext, StepExecutor};
use crate::manifest::Manifest;
use crate::report::{StatusReporter, UpdateOutcome, UpdateRecord};
use crate::repository::ManifestRepository;
use crate::utils::errors::{Result, UpdateError};
use crate::verify::{parse_checks, Check, VerificationRunner};
use crate::version_store::VersionStore;

/// Observable engine state, published on a watch channel for the API.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EngineState {
    Idle,
    CheckingVersion,
    Fetching,
    BackingUp,
    Applying,
    Verifying,
    Committing,
    RollingBack,
}

/// What one cycle did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CycleOutcome {
    /// Another cycle already held the run lock; this trigger was dropped.
    Skipped,
    /// Remote is not ahead of the installed version.
    UpToDate,
    /// The whole chain applied and committed.
    Updated { from: Version, to: Version },
    /// The chain stopped at `failed_at`; later manifests were not tried.
    Aborted { failed_at: Version, error: String },
}

pub struct UpdateEngine {
    store: VersionStore,
    repo: Arc<dyn ManifestRepository>,
    backups: BackupManager,
    executor: StepExecutor,
    verifier: VerificationRunner,
    reporter: StatusReporter,
    ctx: StepContext,
    run_lock: Mutex<()>,
    state_tx: watch::Sender<EngineState>,
    check_interval: Duration,
    check_on_startup: bool,
    cancel: CancellationToken,
}

impl UpdateEngine {
    pub fn new(
        config: &Config,
        store: VersionStore,
        repo: Arc<dyn ManifestRepository>,
        compose: Arc<dyn ComposeControl>,
        reporter: StatusReporter,
        cancel: CancellationToken,
    ) -> Self {
        let (state_tx, _) = watch::channel(EngineState::Idle);
        UpdateEngine {
            store,
            backups: BackupManager::new(&config.backups),
            executor: StepExecutor::new(),
            verifier: VerificationRunner::new(),
            reporter,
            ctx: StepContext {
                repo: repo.clone(),
                compose,
                install_root: config.agent.install_root.clone(),
                protected_services: config.engine.protected_services.clone(),
            },
            repo,
            run_lock: Mutex::new(()),
            state_tx,
            // tokio::time::interval panics on a zero period
            check_interval: Duration::from_secs(config.engine.check_interval_secs.max(1)),
            check_on_startup: config.engine.check_on_startup,
            cancel,
        }
    }

    /// Recurring timer loop. Runs until the token is cancelled; the only
    /// error it returns is an unreadable version store, which stops the
    /// engine for good.
    pub async fn run_loop(self: Arc<Self>) -> Result<()> {
        let mut interval = tokio::time::interval(self.check_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        if !self.check_on_startup {
            // swallow the immediate first tick
            interval.tick().await;
        }

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    info!("Update engine stopped");
                    return Ok(());
                }
                _ = interval.tick() => self.guarded_cycle().await?,
            }
        }
    }

    /// One cycle on behalf of a manual trigger. Store corruption is as
    /// fatal here as on the timer path: the token is cancelled and the
    /// process shuts down.
    pub async fn run_cycle_detached(&self) {
        let _ = self.guarded_cycle().await;
    }

    /// Runs a cycle and absorbs every failure except an unreadable
    /// version store, which cancels the token before surfacing.
    async fn guarded_cycle(&self) -> Result<()> {
        match self.run_cycle().await {
            Ok(CycleOutcome::Updated { from, to }) => {
                info!(%from, %to, "Update cycle finished");
                Ok(())
            }
            Ok(_) => Ok(()),
            Err(err @ UpdateError::StoreUnavailable(_)) => {
                error!("Version store unreadable, refusing to continue: {err}");
                self.cancel.cancel();
                Err(err)
            }
            Err(err) => {
                error!("Update cycle failed: {err}");
                Ok(())
            }
        }
    }

    /// One full check-and-update cycle. Non-reentrant: a trigger while a
    /// cycle is active is dropped, not queued.
    pub async fn run_cycle(&self) -> Result<CycleOutcome> {
        let Ok(_guard) = self.run_lock.try_lock() else {
            warn!("Update cycle already running, trigger dropped");
            return Ok(CycleOutcome::Skipped);
        };
        let outcome = self.cycle(&self.ctx).await;
        self.set_state(EngineState::Idle);
        outcome
    }

    async fn cycle(&self, ctx: &StepContext) -> Result<CycleOutcome> {
        let started = Instant::now();
        self.set_state(EngineState::CheckingVersion);
        let installed = self.store.current()?;

        let remote = match self.repo.current_remote_version().await {
            Ok(remote) => remote,
            Err(err) => {
                warn!("Remote version check failed: {err}");
                self.reporter.record_version_check(&installed, None).await;
                return Err(err);
            }
        };
        self.reporter
            .record_version_check(&installed, Some(&remote))
            .await;

        if remote <= installed {
            info!(%installed, %remote, "System is up to date");
            return Ok(CycleOutcome::UpToDate);
        }
        info!(%installed, %remote, "Update available");

        self.set_state(EngineState::Fetching);
        let chain = match self.repo.chain(&installed, &remote).await {
            Ok(chain) => chain,
            Err(err) => {
                // a broken index or manifest is diagnosable, so it gets a
                // record; a transient fetch failure just waits for the
                // next poll
                if !err.is_transient() {
                    error!(%installed, %remote, "Chain resolution failed: {err}");
                    let record = UpdateRecord::new(
                        installed.clone(),
                        remote.clone(),
                        UpdateOutcome::Failed,
                        Some(err.to_string()),
                        started.elapsed().as_millis() as u64,
                    );
                    self.reporter.record(&record).await;
                }
                return Err(err);
            }
        };
        info!(manifests = chain.len(), "Resolved update chain");

        for manifest in &chain {
            if self.cancel.is_cancelled() {
                info!(next = %manifest.version, "Shutdown requested, abandoning chain");
                return Ok(CycleOutcome::Aborted {
                    failed_at: manifest.version.clone(),
                    error: "shutdown requested".to_string(),
                });
            }
            match self.apply_manifest(manifest, ctx).await {
                Ok(()) => {}
                // store corruption is engine-fatal, not a chain abort
                Err(err @ UpdateError::StoreUnavailable(_)) => return Err(err),
                Err(err) => {
                    return Ok(CycleOutcome::Aborted {
                        failed_at: manifest.version.clone(),
                        error: err.to_string(),
                    });
                }
            }
        }

        Ok(CycleOutcome::Updated {
            from: installed,
            to: remote,
        })
    }

    /// Apply one manifest end to end. Exactly one UpdateRecord is emitted
    /// per attempt; on any failure after the snapshot the backup is
    /// restored before this returns.
    async fn apply_manifest(&self, manifest: &Manifest, ctx: &StepContext) -> Result<()> {
        let started = Instant::now();
        let installed = self.store.current()?;
        info!(
            version = %manifest.version,
            description = %manifest.description,
            steps = manifest.steps.len(),
            "Applying manifest"
        );

        let (checks, touched) = match self.preflight(manifest, &installed, ctx).await {
            Ok(plan) => plan,
            Err(err) => {
                error!(version = %manifest.version, "Manifest rejected: {err}");
                self.finish(manifest, &installed, UpdateOutcome::Failed, Some(&err), started)
                    .await;
                return Err(err);
            }
        };

        self.set_state(EngineState::BackingUp);
        let backup = match self.backups.snapshot(&touched, &manifest.version) {
            Ok(backup) => backup,
            Err(err) => {
                // nothing on the host was mutated; abort without restore
                error!(version = %manifest.version, "Snapshot failed: {err}");
                self.finish(manifest, &installed, UpdateOutcome::Failed, Some(&err), started)
                    .await;
                return Err(err);
            }
        };

        self.set_state(EngineState::Applying);
        for (index, step) in manifest.steps.iter().enumerate() {
            if self.cancel.is_cancelled() {
                let err = UpdateError::Runtime("shutdown requested between steps".to_string());
                return self
                    .roll_back(manifest, &installed, &backup, err, started)
                    .await;
            }
            info!(
                version = %manifest.version,
                step = index + 1,
                total = manifest.steps.len(),
                kind = %step.kind,
                "Applying step"
            );
            if let Err(err) = self.executor.apply(step, ctx).await {
                return self
                    .roll_back(manifest, &installed, &backup, err, started)
                    .await;
            }
        }

        self.set_state(EngineState::Verifying);
        if let Err(err) = self.verifier.verify(&checks, ctx).await {
            return self
                .roll_back(manifest, &installed, &backup, err, started)
                .await;
        }

        self.set_state(EngineState::Committing);
        if let Err(err) = self.store.commit(&manifest.version) {
            return self
                .roll_back(manifest, &installed, &backup, err, started)
                .await;
        }

        self.finish(manifest, &installed, UpdateOutcome::Success, None, started)
            .await;
        if let Err(e) = self.backups.prune() {
            warn!("Snapshot prune failed: {e}");
        }
        info!(version = %manifest.version, "Manifest applied and committed");
        Ok(())
    }

    /// Everything that must fail before a snapshot is taken: the
    /// `requires` gate, whole-manifest step validation and check-descriptor
    /// parsing.
    async fn preflight(
        &self,
        manifest: &Manifest,
        installed: &Version,
        ctx: &StepContext,
    ) -> Result<(Vec<Check>, Vec<PathBuf>)> {
        if *installed < manifest.requires {
            return Err(UpdateError::RequirementNotMet {
                manifest: manifest.version.clone(),
                requires: manifest.requires.clone(),
                installed: installed.clone(),
            });
        }
        self.executor.validate_manifest(manifest, ctx).await?;
        if manifest.validation.is_empty() {
            warn!(version = %manifest.version, "Manifest declares no validation checks");
        }
        let checks = parse_checks(&manifest.validation)?;
        let touched = self.executor.touched_paths(manifest, ctx)?;
        Ok((checks, touched))
    }

    async fn roll_back(
        &self,
        manifest: &Manifest,
        installed: &Version,
        backup: &Backup,
        err: UpdateError,
        started: Instant,
    ) -> Result<()> {
        self.set_state(EngineState::RollingBack);
        error!(version = %manifest.version, "Manifest failed, restoring snapshot: {err}");

        match self.backups.restore(backup) {
            Ok(()) => {
                self.finish(manifest, installed, UpdateOutcome::RolledBack, Some(&err), started)
                    .await;
            }
            Err(restore_err) => {
                error!(tag = %backup.tag, "Snapshot restore failed: {restore_err}");
                let detail = format!("{err}; snapshot restore also failed: {restore_err}");
                let record = UpdateRecord::new(
                    installed.clone(),
                    manifest.version.clone(),
                    UpdateOutcome::Failed,
                    Some(detail),
                    started.elapsed().as_millis() as u64,
                );
                self.reporter.record(&record).await;
            }
        }
        Err(err)
    }

    async fn finish(
        &self,
        manifest: &Manifest,
        installed: &Version,
        outcome: UpdateOutcome,
        err: Option<&UpdateError>,
        started: Instant,
    ) {
        let record = UpdateRecord::new(
            installed.clone(),
            manifest.version.clone(),
            outcome,
            err.map(|e| e.to_string()),
            started.elapsed().as_millis() as u64,
        );
        self.reporter.record(&record).await;
    }

    fn set_state(&self, state: EngineState) {
        self.state_tx.send_replace(state);
    }

    // --- read side, used by the HTTP API ---

    pub fn current_state(&self) -> EngineState {
        *self.state_tx.borrow()
    }

    /// Whether a cycle is in flight right now.
    pub fn is_busy(&self) -> bool {
        self.run_lock.try_lock().is_err()
    }

    pub fn installed_version(&self) -> Result<Version> {
        self.store.current()
    }

    pub fn history(&self, limit: usize) -> Result<Vec<UpdateRecord>> {
        self.reporter.recent(limit)
    }
}
