//! Remote manifest repository.
//!
//! The update source is a tree of YAML documents served over HTTP (in
//! production, the raw view of a Git repository):
//!
//! ```text
//! version.yml                     current released version
//! updates/index.yml               every released version
//! updates/<version>/manifest.yml  one manifest per release
//! services/...                    step source files
//! ```
//!
//! Transient network failures are retried with bounded exponential
//! backoff; 404s and parse failures never are.

use async_trait::async_trait;
use semver::Version;
use std::time::Duration;
use tracing::warn;

use crate::config::SourceConfig;
use crate::manifest::{Manifest, ReleaseIndex, VersionDoc};
use crate::utils::errors::{Result, UpdateError};

#[async_trait]
pub trait ManifestRepository: Send + Sync {
    /// Latest version published by the source.
    async fn current_remote_version(&self) -> Result<Version>;

    /// Versions the source has published, in no particular order.
    async fn release_index(&self) -> Result<Vec<Version>>;

    /// The manifest for one version.
    async fn manifest(&self, version: &Version) -> Result<Manifest>;

    /// Raw file content referenced by a step, repository-relative.
    async fn raw(&self, path: &str) -> Result<Vec<u8>>;

    /// Ordered chain of manifests covering `(from, to]` with no gaps.
    ///
    /// Every indexed version inside the range must yield a manifest and
    /// the target itself must be indexed; a hole fails the whole chain so
    /// steps can never run out of order.
    async fn chain(&self, from: &Version, to: &Version) -> Result<Vec<Manifest>> {
        let mut wanted: Vec<Version> = self
            .release_index()
            .await?
            .into_iter()
            .filter(|v| v > from && v <= to)
            .collect();
        wanted.sort();
        wanted.dedup();

        if wanted.last() != Some(to) {
            return Err(UpdateError::NotFound(format!(
                "target version {to} missing from release index"
            )));
        }

        let mut manifests = Vec::with_capacity(wanted.len());
        for version in &wanted {
            let manifest = self.manifest(version).await?;
            if manifest.version != *version {
                return Err(UpdateError::Parse(format!(
                    "manifest for {version} declares version {}",
                    manifest.version
                )));
            }
            manifests.push(manifest);
        }
        Ok(manifests)
    }
}

/// HTTP-backed repository used in production.
pub struct HttpManifestRepository {
    client: reqwest::Client,
    base_url: String,
    max_retries: u32,
    backoff: Duration,
    backoff_max: Duration,
}

impl HttpManifestRepository {
    pub fn new(config: &SourceConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()
            .map_err(|e| UpdateError::Network(e.to_string()))?;

        Ok(HttpManifestRepository {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            max_retries: config.max_retries,
            backoff: Duration::from_millis(config.retry_backoff_ms),
            backoff_max: Duration::from_millis(config.retry_backoff_max_ms),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path.trim_start_matches('/'))
    }

    /// GET with bounded exponential backoff on transient failures.
    async fn get(&self, path: &str) -> Result<Vec<u8>> {
        let url = self.url(path);
        let mut backoff = self.backoff;
        let mut attempt = 0;

        loop {
            match self.get_once(&url).await {
                Err(err) if err.is_transient() && attempt < self.max_retries => {
                    attempt += 1;
                    warn!(
                        url = %url,
                        attempt,
                        "Fetch failed ({err}), retrying in {}ms",
                        backoff.as_millis()
                    );
                    tokio::time::sleep(backoff).await;
                    backoff = (backoff * 2).min(self.backoff_max);
                }
                other => return other,
            }
        }
    }

    async fn get_once(&self, url: &str) -> Result<Vec<u8>> {
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| UpdateError::Network(format!("{url}: {e}")))?;

        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Err(UpdateError::NotFound(url.to_string()));
        }
        if !response.status().is_success() {
            return Err(UpdateError::Network(format!(
                "{url}: HTTP {}",
                response.status()
            )));
        }

        let bytes = response
            .bytes()
            .await
            .map_err(|e| UpdateError::Network(format!("{url}: {e}")))?;
        Ok(bytes.to_vec())
    }

    async fn get_text(&self, path: &str) -> Result<String> {
        String::from_utf8(self.get(path).await?)
            .map_err(|e| UpdateError::Parse(format!("{path}: {e}")))
    }
}

#[async_trait]
impl ManifestRepository for HttpManifestRepository {
    async fn current_remote_version(&self) -> Result<Version> {
        let raw = self.get_text("version.yml").await?;
        let doc: VersionDoc = serde_yaml::from_str(&raw)
            .map_err(|e| UpdateError::Parse(format!("version.yml: {e}")))?;
        Version::parse(&doc.version)
            .map_err(|e| UpdateError::Parse(format!("version.yml: {e}")))
    }

    async fn release_index(&self) -> Result<Vec<Version>> {
        let raw = self.get_text("updates/index.yml").await?;
        let index: ReleaseIndex = serde_yaml::from_str(&raw)
            .map_err(|e| UpdateError::Parse(format!("updates/index.yml: {e}")))?;
        Ok(index.versions)
    }

    async fn manifest(&self, version: &Version) -> Result<Manifest> {
        let raw = self
            .get_text(&format!("updates/{version}/manifest.yml"))
            .await?;
        Manifest::parse(&raw)
    }

    async fn raw(&self, path: &str) -> Result<Vec<u8>> {
        self.get(path).await
    }
}

#[cfg(test)]
pub(crate) mod testing {
    //! In-memory repository used by engine and executor tests.

    use super::*;
    use std::collections::HashMap;

    pub struct FakeRepository {
        pub remote: Version,
        pub index: Vec<Version>,
        pub manifests: HashMap<String, Manifest>,
        pub files: HashMap<String, Vec<u8>>,
        /// Checked before answering the version check; lets tests hold
        /// a cycle open long enough to observe the run lock.
        pub check_delay: Duration,
    }

    impl FakeRepository {
        pub fn new(remote: &str) -> Self {
            FakeRepository {
                remote: Version::parse(remote).unwrap(),
                index: Vec::new(),
                manifests: HashMap::new(),
                files: HashMap::new(),
                check_delay: Duration::ZERO,
            }
        }

        pub fn with_manifest(mut self, manifest: Manifest) -> Self {
            self.index.push(manifest.version.clone());
            self.manifests
                .insert(manifest.version.to_string(), manifest);
            self
        }

        /// Index a version without publishing its manifest (a gap).
        pub fn with_indexed_only(mut self, version: &str) -> Self {
            self.index.push(Version::parse(version).unwrap());
            self
        }

        pub fn with_file(mut self, path: &str, content: &[u8]) -> Self {
            self.files.insert(path.to_string(), content.to_vec());
            self
        }

        pub fn with_check_delay(mut self, delay: Duration) -> Self {
            self.check_delay = delay;
            self
        }
    }

    #[async_trait]
    impl ManifestRepository for FakeRepository {
        async fn current_remote_version(&self) -> Result<Version> {
            if !self.check_delay.is_zero() {
                tokio::time::sleep(self.check_delay).await;
            }
            Ok(self.remote.clone())
        }

        async fn release_index(&self) -> Result<Vec<Version>> {
            Ok(self.index.clone())
        }

        async fn manifest(&self, version: &Version) -> Result<Manifest> {
            self.manifests
                .get(&version.to_string())
                .cloned()
                .ok_or_else(|| {
                    UpdateError::NotFound(format!("updates/{version}/manifest.yml"))
                })
        }

        async fn raw(&self, path: &str) -> Result<Vec<u8>> {
            self.files
                .get(path)
                .cloned()
                .ok_or_else(|| UpdateError::NotFound(path.to_string()))
        }
    }
}
