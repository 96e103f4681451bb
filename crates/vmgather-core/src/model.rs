//! Shared data types: time ranges, connection descriptors, job configuration
//! and records, and the archive manifest.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{GatherError, Result};

/// A half-open `[start, end)` UTC time range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeRange {
    /// Inclusive start instant.
    pub start: DateTime<Utc>,
    /// Exclusive end instant.
    pub end: DateTime<Utc>,
}

impl TimeRange {
    /// Builds a range, rejecting `start >= end`.
    pub fn new(start: DateTime<Utc>, end: DateTime<Utc>) -> Result<Self> {
        if start >= end {
            return Err(GatherError::ProtocolError(format!(
                "invalid time range: start {start} must be before end {end}"
            )));
        }
        Ok(Self { start, end })
    }

    /// Duration of the range.
    pub fn duration(&self) -> chrono::Duration {
        self.end - self.start
    }

    /// Whether the range contains no instants (always false for a
    /// `TimeRange` constructed via [`TimeRange::new`], but useful once a
    /// window has been truncated to zero width by a caller).
    pub fn is_empty(&self) -> bool {
        self.start >= self.end
    }
}

/// How a [`VMConnection`] authenticates to the VictoriaMetrics endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AuthVariant {
    /// No credentials.
    None,
    /// HTTP Basic auth.
    Basic {
        /// Basic auth username.
        user: String,
        /// Basic auth password.
        pass: String,
    },
    /// Bearer token auth.
    Bearer {
        /// The bearer token.
        token: String,
    },
    /// A single custom header.
    CustomHeader {
        /// Header name.
        name: String,
        /// Header value.
        value: String,
    },
}

/// Endpoint descriptor for a VictoriaMetrics deployment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VmConnection {
    /// Base URL, e.g. `https://vm.example.com`.
    pub base_url: String,
    /// Optional API base path override (defaults to `/prometheus`).
    pub api_base_path: Option<String>,
    /// Optional tenant id for multitenant deployments.
    pub tenant_id: Option<String>,
    /// Whether the deployment is multitenant (`/select/<tenant>/prometheus`).
    pub multitenant: bool,
    /// Authentication to use.
    pub auth: AuthVariant,
    /// Whether to skip TLS certificate verification.
    pub tls_skip_verify: bool,
}

/// Obfuscation flags for a single export job.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObfuscationConfig {
    /// Master switch. When `false`, every other field is ignored.
    pub enabled: bool,
    /// Whether to anonymize the `instance` label.
    pub obfuscate_instance: bool,
    /// Whether to anonymize the `job` label.
    pub obfuscate_job: bool,
    /// Reserved for future structure-preserving transforms; carried through
    /// to the manifest but not interpreted by the obfuscator itself.
    pub preserve_structure: bool,
    /// Additional label names to anonymize.
    pub custom_labels: Vec<String>,
}

/// Batch interval selection strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchStrategy {
    /// Pick the interval automatically from total duration.
    Auto,
    /// Use `custom_interval_seconds`.
    Custom,
}

/// Batching configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchSettings {
    /// Whether batching is enabled at all.
    pub enabled: bool,
    /// Strategy to pick the interval.
    pub strategy: BatchStrategy,
    /// Custom interval in seconds, used only when `strategy == Custom`.
    pub custom_interval_seconds: u64,
}

impl Default for BatchSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            strategy: BatchStrategy::Auto,
            custom_interval_seconds: 0,
        }
    }
}

/// Minimum allowed batch interval, in seconds.
pub const MIN_BATCH_INTERVAL_SECS: u64 = 30;
/// Maximum allowed batch interval, in seconds.
pub const MAX_BATCH_INTERVAL_SECS: u64 = 86_400;

/// Full configuration for a single export job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExportConfig {
    /// The VM deployment to export from.
    pub connection: VmConnection,
    /// The time range to export.
    pub time_range: TimeRange,
    /// Batching configuration.
    pub batch: BatchSettings,
    /// Obfuscation configuration.
    pub obfuscation: ObfuscationConfig,
    /// Components to restrict the export to (empty = all).
    pub components: Vec<String>,
    /// Jobs to restrict the export to (empty = all non-empty series).
    pub jobs: Vec<String>,
    /// Deduplication/range-query step, in seconds. Must be >= 30.
    pub metric_step_seconds: u64,
    /// Staging directory override; `None` uses the platform default.
    pub staging_dir: Option<String>,
    /// Staging file name override; `None` uses `<export_id>.partial.jsonl`.
    pub staging_file: Option<String>,
    /// First batch index to process; nonzero on resume.
    pub resume_from_batch: usize,
}

/// A half-open sub-interval of the requested time range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchWindow {
    /// 0-based index within the plan.
    pub index: usize,
    /// Window start.
    pub start: DateTime<Utc>,
    /// Window end (exclusive).
    pub end: DateTime<Utc>,
}

/// A single decoded metric record from a VM export/range-query stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExportedMetric {
    /// Labels, including `__name__`.
    pub labels: BTreeMap<String, String>,
    /// Sample values.
    pub values: Vec<f64>,
    /// Sample timestamps, epoch milliseconds.
    pub timestamps: Vec<i64>,
}

/// Lifecycle state of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    /// Admitted but not yet started by a worker.
    Pending,
    /// A worker is actively running the pipeline.
    Running,
    /// Finished successfully.
    Completed,
    /// Finished with an error.
    Failed,
    /// Canceled by the operator.
    Canceled,
}

impl JobState {
    /// Whether this state can never transition again.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            JobState::Completed | JobState::Failed | JobState::Canceled
        )
    }
}

/// Result of a successfully completed export.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExportResult {
    /// The job/export id.
    pub export_id: Uuid,
    /// Path to the produced archive.
    pub archive_path: String,
    /// Archive size in bytes.
    pub size_bytes: u64,
    /// Total number of metric records written.
    pub metrics_count: u64,
    /// The time range that was exported.
    pub time_range: TimeRange,
    /// Whether obfuscation was applied.
    pub obfuscated: bool,
    /// Hex-encoded SHA-256 of the archive bytes.
    pub sha256: String,
}

/// Mutable record owned exclusively by the Job Manager.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobRecord {
    /// Job identity.
    pub id: Uuid,
    /// Creation timestamp.
    pub created_at: DateTime<Utc>,
    /// Lifecycle state.
    pub state: JobState,

    /// Total number of batches planned for this run.
    pub total_batches: usize,
    /// Highest absolute batch index observed as completed.
    pub completed_batches: usize,
    /// The batch window width in seconds, for display purposes.
    pub batch_window_seconds: u64,
    /// The window currently (or last) being processed.
    pub current_range: Option<TimeRange>,

    /// Total metric records processed so far (including a resumed base).
    pub metrics_processed: u64,
    /// Wall-clock duration of the most recently completed batch, seconds.
    pub last_batch_seconds: f64,
    /// Running average batch duration for the *current* run, seconds.
    pub average_batch_seconds: f64,
    /// Estimated completion time, if any work remains.
    pub eta: Option<DateTime<Utc>>,
    /// Fractional completion in `[0, 1]`.
    pub progress: f64,

    /// Path to the staging file.
    pub staging_path: String,
    /// Whether obfuscation was requested for this job.
    pub obfuscation_enabled: bool,
    /// Populated on success.
    pub result: Option<ExportResult>,
    /// Populated on failure or cancellation.
    pub error: Option<String>,

    /// Immutable snapshot of the config this job was admitted with.
    pub config: ExportConfig,
    /// First unfinished batch index, nonzero once resumed.
    pub resume_from: usize,
    /// `completed_batches` at the start of the current run (0 unless a
    /// resume), used as the denominator base for this run's average.
    pub base_batches: usize,
    /// `metrics_processed` at the start of the current run.
    pub base_metrics: u64,
}

/// Per-category deterministic obfuscation mappings, collected during a
/// pipeline run and embedded in the archive manifest.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ObfuscationMappings {
    /// `instance` -> pseudo-instance.
    pub instance_map: BTreeMap<String, String>,
    /// `job` -> pseudo-job.
    pub job_map: BTreeMap<String, String>,
    /// label name -> (original value -> pseudo value).
    pub custom_label_maps: BTreeMap<String, BTreeMap<String, String>>,
}

impl ObfuscationMappings {
    /// Whether any mapping was recorded at all.
    pub fn is_empty(&self) -> bool {
        self.instance_map.is_empty() && self.job_map.is_empty() && self.custom_label_maps.is_empty()
    }
}

/// Metadata manifest embedded alongside the staged metrics in the archive.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArchiveManifest {
    /// The export/job id.
    pub export_id: Uuid,
    /// UTC export timestamp.
    pub export_date: DateTime<Utc>,
    /// The exported time range.
    pub time_range: TimeRange,
    /// Deduplicated component names observed in the export.
    pub components: Vec<String>,
    /// Deduplicated job names observed in the export.
    pub jobs: Vec<String>,
    /// Total metric record count.
    pub metrics_count: u64,
    /// Whether obfuscation was applied.
    pub obfuscated: bool,
    /// Version of the running binary that produced the archive.
    pub version: String,
    /// Instance mapping, present only when obfuscation was applied.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub instance_map: Option<BTreeMap<String, String>>,
    /// Job mapping, present only when obfuscation was applied.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub job_map: Option<BTreeMap<String, String>>,
    /// Custom label mappings, present only when obfuscation was applied.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub custom_label_maps: Option<BTreeMap<String, BTreeMap<String, String>>>,
}
