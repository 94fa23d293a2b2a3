//! Post-apply verification.
//!
//! Check descriptors come from a manifest's `validation.steps` list and
//! use a small colon-separated form:
//!
//! ```text
//! file_exists:/data/config/signalk/settings.json
//! mode:/data/config/signalk/settings.json:644
//! service_running:signalk
//! ```
//!
//! Descriptors are parsed during pre-validation, next to step checks, so
//! a malformed one aborts before any side effect. Checks run in order;
//! the first failure is reported with its descriptor.

use std::fmt;
use std::fs;
use std::path::PathBuf;
use tracing::debug;

use crate::executor::{parse_mode, StepContext};
use crate::manifest::ValidationSpec;
use crate::utils::errors::{Result, UpdateError};

/// A machine-checkable postcondition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Check {
    FileExists(PathBuf),
    Mode(PathBuf, u32),
    ServiceRunning(String),
}

impl Check {
    /// Parse one descriptor.
    pub fn parse(raw: &str) -> Result<Self> {
        let (kind, rest) = raw
            .split_once(':')
            .ok_or_else(|| UpdateError::Parse(format!("invalid check descriptor {raw:?}")))?;
        if rest.is_empty() {
            return Err(UpdateError::Parse(format!(
                "invalid check descriptor {raw:?}"
            )));
        }
        match kind {
            "file_exists" => Ok(Check::FileExists(PathBuf::from(rest))),
            "mode" => {
                let (path, mode) = rest.rsplit_once(':').ok_or_else(|| {
                    UpdateError::Parse(format!(
                        "mode check needs a path and an octal mode: {raw:?}"
                    ))
                })?;
                if path.is_empty() {
                    return Err(UpdateError::Parse(format!(
                        "mode check needs a path and an octal mode: {raw:?}"
                    )));
                }
                Ok(Check::Mode(PathBuf::from(path), parse_mode(mode)?))
            }
            "service_running" => Ok(Check::ServiceRunning(rest.to_string())),
            other => Err(UpdateError::Parse(format!(
                "unknown check kind {other:?} in {raw:?}"
            ))),
        }
    }
}

impl fmt::Display for Check {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Check::FileExists(path) => write!(f, "file_exists:{}", path.display()),
            Check::Mode(path, mode) => write!(f, "mode:{}:{:o}", path.display(), mode),
            Check::ServiceRunning(name) => write!(f, "service_running:{name}"),
        }
    }
}

/// Parse a whole ValidationSpec up front. An empty spec yields no checks;
/// the engine logs that separately so the weakness is visible.
pub fn parse_checks(spec: &ValidationSpec) -> Result<Vec<Check>> {
    spec.steps.iter().map(|raw| Check::parse(raw)).collect()
}

#[derive(Default)]
pub struct VerificationRunner;

impl VerificationRunner {
    pub fn new() -> Self {
        VerificationRunner
    }

    /// Run every check in order; the first failure wins.
    pub async fn verify(&self, checks: &[Check], ctx: &StepContext) -> Result<()> {
        for check in checks {
            self.run(check, ctx).await?;
            debug!(check = %check, "check passed");
        }
        Ok(())
    }

    async fn run(&self, check: &Check, ctx: &StepContext) -> Result<()> {
        let fail = |reason: String| UpdateError::VerificationFailed {
            check: check.to_string(),
            reason,
        };

        match check {
            Check::FileExists(path) => {
                let resolved = ctx.resolve(path);
                if !resolved.is_file() {
                    return Err(fail(format!("{} does not exist", resolved.display())));
                }
            }
            Check::Mode(path, want) => {
                let resolved = ctx.resolve(path);
                let meta = fs::metadata(&resolved)
                    .map_err(|e| fail(format!("{}: {e}", resolved.display())))?;
                #[cfg(unix)]
                {
                    use std::os::unix::fs::PermissionsExt;
                    let got = meta.permissions().mode() & 0o7777;
                    if got != *want {
                        return Err(fail(format!(
                            "{} has mode {got:o}, expected {want:o}",
                            resolved.display()
                        )));
                    }
                }
                #[cfg(not(unix))]
                let _ = (meta, want);
            }
            Check::ServiceRunning(name) => {
                let running = ctx
                    .compose
                    .running_services()
                    .await
                    .map_err(|e| fail(e.to_string()))?;
                if !running.contains(name) {
                    return Err(fail(format!("service {name} is not running")));
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::compose::testing::FakeCompose;
    use crate::repository::testing::FakeRepository;
    use std::sync::Arc;
    use tempfile::TempDir;

    fn context(root: &std::path::Path, compose: Arc<FakeCompose>) -> StepContext {
        StepContext {
            repo: Arc::new(FakeRepository::new("1.0.0")),
            compose,
            install_root: root.to_path_buf(),
            protected_services: Vec::new(),
        }
    }

    #[test]
    fn parses_all_three_descriptor_kinds() {
        assert_eq!(
            Check::parse("file_exists:/data/a.json").unwrap(),
            Check::FileExists(PathBuf::from("/data/a.json"))
        );
        assert_eq!(
            Check::parse("mode:/data/a.json:644").unwrap(),
            Check::Mode(PathBuf::from("/data/a.json"), 0o644)
        );
        assert_eq!(
            Check::parse("service_running:signalk").unwrap(),
            Check::ServiceRunning("signalk".to_string())
        );
    }

    #[test]
    fn rejects_malformed_descriptors() {
        assert!(Check::parse("file_exists").is_err());
        assert!(Check::parse("file_exists:").is_err());
        assert!(Check::parse("mode:/data/a.json").is_err());
        assert!(Check::parse("mode:/data/a.json:not-octal").is_err());
        assert!(Check::parse("port_open:8080").is_err());
    }

    #[test]
    fn spec_parsing_fails_on_the_first_bad_descriptor() {
        let spec = ValidationSpec {
            steps: vec![
                "file_exists:/data/a.json".to_string(),
                "bogus".to_string(),
            ],
        };
        assert!(matches!(
            parse_checks(&spec).unwrap_err(),
            UpdateError::Parse(_)
        ));
    }

    #[tokio::test]
    async fn file_exists_checks_under_the_install_root() {
        let tmp = TempDir::new().unwrap();
        std::fs::create_dir_all(tmp.path().join("data")).unwrap();
        std::fs::write(tmp.path().join("data/a.json"), b"{}").unwrap();
        let ctx = context(tmp.path(), Arc::new(FakeCompose::with_services(&[])));

        let runner = VerificationRunner::new();
        runner
            .verify(&[Check::parse("file_exists:/data/a.json").unwrap()], &ctx)
            .await
            .unwrap();

        let err = runner
            .verify(&[Check::parse("file_exists:/data/missing.json").unwrap()], &ctx)
            .await
            .unwrap_err();
        assert!(matches!(err, UpdateError::VerificationFailed { .. }));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn mode_check_compares_permission_bits() {
        use std::os::unix::fs::PermissionsExt;

        let tmp = TempDir::new().unwrap();
        std::fs::create_dir_all(tmp.path().join("data")).unwrap();
        let file = tmp.path().join("data/a.sh");
        std::fs::write(&file, b"#!/bin/sh\n").unwrap();
        std::fs::set_permissions(&file, std::fs::Permissions::from_mode(0o755)).unwrap();
        let ctx = context(tmp.path(), Arc::new(FakeCompose::with_services(&[])));

        let runner = VerificationRunner::new();
        runner
            .verify(&[Check::parse("mode:/data/a.sh:755").unwrap()], &ctx)
            .await
            .unwrap();

        let err = runner
            .verify(&[Check::parse("mode:/data/a.sh:600").unwrap()], &ctx)
            .await
            .unwrap_err();
        match err {
            UpdateError::VerificationFailed { reason, .. } => {
                assert!(reason.contains("755"), "reason: {reason}");
            }
            other => panic!("expected VerificationFailed, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn service_running_consults_the_stack() {
        let tmp = TempDir::new().unwrap();
        let compose = Arc::new(FakeCompose::with_services(&["signalk", "grafana"]));
        compose.stop("grafana");
        let ctx = context(tmp.path(), compose);

        let runner = VerificationRunner::new();
        runner
            .verify(&[Check::parse("service_running:signalk").unwrap()], &ctx)
            .await
            .unwrap();

        let err = runner
            .verify(&[Check::parse("service_running:grafana").unwrap()], &ctx)
            .await
            .unwrap_err();
        assert!(matches!(err, UpdateError::VerificationFailed { .. }));
    }

    #[tokio::test]
    async fn first_failing_check_is_reported() {
        let tmp = TempDir::new().unwrap();
        let ctx = context(tmp.path(), Arc::new(FakeCompose::with_services(&[])));

        let checks = vec![
            Check::parse("file_exists:/data/first.json").unwrap(),
            Check::parse("file_exists:/data/second.json").unwrap(),
        ];
        let err = VerificationRunner::new()
            .verify(&checks, &ctx)
            .await
            .unwrap_err();
        match err {
            UpdateError::VerificationFailed { check, .. } => {
                assert!(check.contains("first.json"), "check: {check}");
            }
            other => panic!("expected VerificationFailed, got {other:?}"),
        }
    }
}
