//! Update outcome records.
//!
//! Every manifest application attempt ends in exactly one record. Records
//! are appended to a local JSONL history file (served by the API) and
//! forwarded to InfluxDB as one `system_update` point. Telemetry is one
//! way: a sink failure is logged and never fails the cycle. A lighter
//! `version_check` point goes out on every poll so dashboards can tell
//! "up to date" from "agent dead".

use chrono::{DateTime, Utc};
use semver::Version;
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::config::TelemetryConfig;
use crate::utils::errors::{Result, UpdateError};

const HISTORY_FILE: &str = "update-history.jsonl";

/// Outcome of one manifest application attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum UpdateOutcome {
    Success,
    /// No snapshot was restored: the attempt died before mutating the
    /// host, or the restore itself failed (the error says which).
    Failed,
    /// Failed mid-apply or mid-verify; the snapshot was restored.
    RolledBack,
}

impl UpdateOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            UpdateOutcome::Success => "success",
            UpdateOutcome::Failed => "failed",
            UpdateOutcome::RolledBack => "rolled-back",
        }
    }
}

/// One immutable history entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpdateRecord {
    pub id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub from_version: Version,
    pub to_version: Version,
    pub outcome: UpdateOutcome,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub duration_ms: u64,
}

impl UpdateRecord {
    pub fn new(
        from_version: Version,
        to_version: Version,
        outcome: UpdateOutcome,
        error: Option<String>,
        duration_ms: u64,
    ) -> Self {
        UpdateRecord {
            id: Uuid::new_v4(),
            timestamp: Utc::now(),
            from_version,
            to_version,
            outcome,
            error,
            duration_ms,
        }
    }
}

pub struct StatusReporter {
    history_path: PathBuf,
    device_id: String,
    sink: Option<TelemetrySink>,
}

impl StatusReporter {
    pub fn new(state_dir: &Path, device_id: &str, telemetry: &TelemetryConfig) -> Self {
        let sink = if telemetry.enabled {
            match TelemetrySink::new(telemetry) {
                Ok(sink) => Some(sink),
                Err(e) => {
                    warn!("Telemetry disabled, sink unavailable: {e}");
                    None
                }
            }
        } else {
            None
        };

        StatusReporter {
            history_path: state_dir.join(HISTORY_FILE),
            device_id: device_id.to_string(),
            sink,
        }
    }

    /// Record one attempt: history first (authoritative), telemetry best
    /// effort.
    pub async fn record(&self, record: &UpdateRecord) {
        if let Err(e) = self.append(record) {
            warn!("Failed to append update history: {e}");
        }
        if let Some(sink) = &self.sink {
            if let Err(e) = sink.write_line(update_line(record, &self.device_id)).await {
                warn!("Failed to write telemetry point: {e}");
            }
        }
    }

    /// Heartbeat emitted on every poll, whether or not an update follows.
    pub async fn record_version_check(&self, current: &Version, latest: Option<&Version>) {
        if let Some(sink) = &self.sink {
            let line = version_check_line(current, latest, &self.device_id);
            if let Err(e) = sink.write_line(line).await {
                warn!("Failed to write version-check point: {e}");
            }
        }
    }

    /// Last `limit` records, newest first.
    pub fn recent(&self, limit: usize) -> Result<Vec<UpdateRecord>> {
        if !self.history_path.exists() {
            return Ok(Vec::new());
        }
        let reader = BufReader::new(File::open(&self.history_path)?);
        let mut records = Vec::new();
        for line in reader.lines() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<UpdateRecord>(&line) {
                Ok(record) => records.push(record),
                Err(e) => debug!("Skipping unreadable history line: {e}"),
            }
        }
        records.reverse();
        records.truncate(limit);
        Ok(records)
    }

    fn append(&self, record: &UpdateRecord) -> Result<()> {
        if let Some(parent) = self.history_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let line = serde_json::to_string(record)
            .map_err(|e| UpdateError::Parse(format!("history record: {e}")))?;
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.history_path)?;
        writeln!(file, "{line}")?;
        Ok(())
    }
}

struct TelemetrySink {
    client: reqwest::Client,
    write_url: String,
}

impl TelemetrySink {
    fn new(config: &TelemetryConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(10))
            .build()
            .map_err(|e| UpdateError::Network(e.to_string()))?;
        Ok(TelemetrySink {
            client,
            write_url: format!(
                "{}/write?db={}",
                config.influx_url.trim_end_matches('/'),
                config.database
            ),
        })
    }

    async fn write_line(&self, line: String) -> Result<()> {
        let response = self
            .client
            .post(&self.write_url)
            .body(line)
            .send()
            .await
            .map_err(|e| UpdateError::Network(e.to_string()))?;
        if !response.status().is_success() {
            return Err(UpdateError::Network(format!(
                "influx write: HTTP {}",
                response.status()
            )));
        }
        Ok(())
    }
}

/// InfluxDB 1.x line protocol: `measurement,tags fields timestamp_ns`.
fn update_line(record: &UpdateRecord, device_id: &str) -> String {
    let mut fields = vec![
        format!("from_version=\"{}\"", escape_field(&record.from_version.to_string())),
        format!("to_version=\"{}\"", escape_field(&record.to_version.to_string())),
        format!("duration_ms={}i", record.duration_ms),
    ];
    if let Some(error) = &record.error {
        fields.push(format!("error_detail=\"{}\"", escape_field(error)));
    }
    format!(
        "system_update,host={},outcome={} {} {}",
        escape_tag(device_id),
        record.outcome.as_str(),
        fields.join(","),
        record.timestamp.timestamp_nanos_opt().unwrap_or_default()
    )
}

fn version_check_line(current: &Version, latest: Option<&Version>, device_id: &str) -> String {
    let update_available = matches!(latest, Some(l) if l > current);
    let latest_field = latest
        .map(Version::to_string)
        .unwrap_or_else(|| "unknown".to_string());
    format!(
        "version_check,host={} current_version=\"{}\",latest_version=\"{}\",update_available={} {}",
        escape_tag(device_id),
        escape_field(&current.to_string()),
        escape_field(&latest_field),
        update_available,
        Utc::now().timestamp_nanos_opt().unwrap_or_default()
    )
}

fn escape_tag(value: &str) -> String {
    value
        .replace(' ', "\\ ")
        .replace(',', "\\,")
        .replace('=', "\\=")
}

fn escape_field(value: &str) -> String {
    // the protocol is newline-delimited, so multi-line values are flattened
    value
        .replace('\n', " ")
        .replace('\r', " ")
        .replace('\\', "\\\\")
        .replace('"', "\\\"")
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn reporter(state_dir: &Path) -> StatusReporter {
        StatusReporter::new(
            state_dir,
            "hub-01",
            &TelemetryConfig {
                enabled: false,
                influx_url: String::new(),
                database: String::new(),
            },
        )
    }

    fn record(to: &str, outcome: UpdateOutcome) -> UpdateRecord {
        UpdateRecord::new(
            Version::new(1, 1, 0),
            Version::parse(to).unwrap(),
            outcome,
            None,
            1500,
        )
    }

    #[tokio::test]
    async fn history_returns_newest_first_and_honors_the_limit() {
        let tmp = TempDir::new().unwrap();
        let reporter = reporter(tmp.path());

        reporter.record(&record("1.2.0", UpdateOutcome::Success)).await;
        reporter.record(&record("1.3.0", UpdateOutcome::RolledBack)).await;
        reporter.record(&record("1.3.0", UpdateOutcome::Success)).await;

        let recent = reporter.recent(2).unwrap();
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0].outcome, UpdateOutcome::Success);
        assert_eq!(recent[0].to_version, Version::new(1, 3, 0));
        assert_eq!(recent[1].outcome, UpdateOutcome::RolledBack);
    }

    #[test]
    fn empty_history_reads_as_no_records() {
        let tmp = TempDir::new().unwrap();
        assert!(reporter(tmp.path()).recent(10).unwrap().is_empty());
    }

    #[tokio::test]
    async fn corrupt_history_lines_are_skipped() {
        let tmp = TempDir::new().unwrap();
        let reporter = reporter(tmp.path());
        reporter.record(&record("1.2.0", UpdateOutcome::Success)).await;

        let path = tmp.path().join(HISTORY_FILE);
        let mut raw = std::fs::read_to_string(&path).unwrap();
        raw.push_str("this is not json\n");
        std::fs::write(&path, raw).unwrap();
        reporter.record(&record("1.3.0", UpdateOutcome::Failed)).await;

        let recent = reporter.recent(10).unwrap();
        assert_eq!(recent.len(), 2);
    }

    #[test]
    fn update_line_carries_outcome_tag_and_fields() {
        let mut rec = record("1.2.0", UpdateOutcome::RolledBack);
        rec.error = Some("service \"signalk\" failed".to_string());

        let line = update_line(&rec, "hub 01");
        assert!(line.starts_with("system_update,host=hub\\ 01,outcome=rolled-back "));
        assert!(line.contains("from_version=\"1.1.0\""));
        assert!(line.contains("to_version=\"1.2.0\""));
        assert!(line.contains("duration_ms=1500i"));
        assert!(line.contains("error_detail=\"service \\\"signalk\\\" failed\""));
    }

    #[test]
    fn multi_line_error_detail_stays_on_one_line() {
        let mut rec = record("1.2.0", UpdateOutcome::Failed);
        rec.error = Some("compose exited with 1:\nservice crashed".to_string());

        let line = update_line(&rec, "hub-01");
        assert!(!line.contains('\n'), "line: {line}");
        assert!(line.contains("error_detail=\"compose exited with 1: service crashed\""));
    }

    #[test]
    fn version_check_line_flags_available_updates() {
        let current = Version::new(1, 1, 0);
        let latest = Version::new(1, 2, 0);

        let line = version_check_line(&current, Some(&latest), "hub-01");
        assert!(line.starts_with("version_check,host=hub-01 "));
        assert!(line.contains("update_available=true"));

        let line = version_check_line(&latest, Some(&latest), "hub-01");
        assert!(line.contains("update_available=false"));

        let line = version_check_line(&current, None, "hub-01");
        assert!(line.contains("latest_version=\"unknown\""));
    }
}
