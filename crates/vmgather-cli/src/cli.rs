use chrono::{DateTime, Utc};
use clap::Parser;

fn parse_rfc3339(input: &str) -> Result<DateTime<Utc>, String> {
    DateTime::parse_from_rfc3339(input)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| format!("invalid RFC3339 timestamp {input:?}: {e}"))
}

/// Operator-facing flags for a single export run.
#[derive(Debug, Clone, Parser)]
#[command(name = "vmgather", version, about = "VictoriaMetrics metrics export and anonymization tool")]
pub struct Cli {
    /// Base URL of the VictoriaMetrics deployment to export from.
    #[arg(long, env = "VMGATHER_VM_URL")]
    pub vm_url: String,

    /// Optional API base path override (defaults to `/prometheus`).
    #[arg(long, env = "VMGATHER_API_BASE_PATH")]
    pub api_base_path: Option<String>,

    /// Tenant id for multitenant deployments.
    #[arg(long, env = "VMGATHER_TENANT_ID")]
    pub tenant_id: Option<String>,

    /// Treat the deployment as multitenant.
    #[arg(long, default_value_t = false)]
    pub multitenant: bool,

    /// Skip TLS certificate verification.
    #[arg(long, default_value_t = false)]
    pub tls_skip_verify: bool,

    /// Bearer token for authentication.
    #[arg(long, env = "VMGATHER_BEARER_TOKEN")]
    pub bearer_token: Option<String>,

    /// HTTP Basic auth username.
    #[arg(long, env = "VMGATHER_BASIC_USER")]
    pub basic_user: Option<String>,

    /// HTTP Basic auth password.
    #[arg(long, env = "VMGATHER_BASIC_PASS")]
    pub basic_pass: Option<String>,

    /// Range start, RFC3339 (e.g. `2025-01-01T00:00:00Z`).
    #[arg(long, value_parser = parse_rfc3339)]
    pub start: DateTime<Utc>,

    /// Range end, RFC3339.
    #[arg(long, value_parser = parse_rfc3339)]
    pub end: DateTime<Utc>,

    /// Restrict the export to these job label values.
    #[arg(long, value_delimiter = ',')]
    pub jobs: Vec<String>,

    /// Restrict the export to these component names (display/filter hint).
    #[arg(long, value_delimiter = ',')]
    pub components: Vec<String>,

    /// Disable batching: fetch the whole range as a single window.
    #[arg(long, default_value_t = false)]
    pub no_batch: bool,

    /// Explicit batch interval in seconds, overriding auto-selection.
    #[arg(long)]
    pub batch_interval_seconds: Option<u64>,

    /// Anonymize the `instance` label.
    #[arg(long, default_value_t = false)]
    pub obfuscate_instance: bool,

    /// Anonymize the `job` label.
    #[arg(long, default_value_t = false)]
    pub obfuscate_job: bool,

    /// Additional label names to anonymize.
    #[arg(long, value_delimiter = ',')]
    pub custom_labels: Vec<String>,

    /// Deduplication/range-query step, in seconds.
    #[arg(long, default_value_t = 60)]
    pub metric_step_seconds: u64,

    /// Staging directory override (defaults to a platform-recommended path).
    #[arg(long, env = "VMGATHER_STAGING_DIR")]
    pub staging_dir: Option<String>,

    /// Directory the finished archive is written into.
    #[arg(long, env = "VMGATHER_OUTPUT_DIR", default_value = ".")]
    pub output_dir: String,

    /// Maximum number of jobs this process will run concurrently.
    ///
    /// A single CLI invocation only ever submits one job; this bounds
    /// `JobManager` the same way a long-lived embedder would configure it.
    #[arg(long, default_value_t = vmgather_core::job_manager::DEFAULT_MAX_CONCURRENT_JOBS)]
    pub max_concurrent_jobs: usize,
}
