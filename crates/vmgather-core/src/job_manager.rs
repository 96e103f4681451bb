//! Owns every job's lifecycle: admission, progress aggregation, ETA,
//! cancellation, resume, and retention cleanup.
//!
//! The registry is a single `RwLock`-guarded map rather than one
//! `tokio::select!` event loop: jobs are admitted over time with
//! independent lifecycles, which maps onto a registry of lock-guarded
//! records better than onto a single select loop over interchangeable
//! workers. Each job gets its own progress callback and spawned task.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, RwLock};

use chrono::{Duration as ChronoDuration, Utc};
use tokio::sync::watch;
use uuid::Uuid;

use crate::clock::Clock;
use crate::error::{GatherError, Result};
use crate::model::{ExportConfig, JobRecord, JobState};
use crate::pipeline;
use crate::planner;
use crate::progress::{BatchProgress, ProgressSink};
use crate::staging;
use crate::vm_client::VmApi;

/// Default concurrency cap.
pub const DEFAULT_MAX_CONCURRENT_JOBS: usize = 3;
/// Default retention window for terminal jobs before they're reaped.
pub const DEFAULT_RETENTION: ChronoDuration = ChronoDuration::minutes(30);

/// Tunables for a [`JobManager`].
#[derive(Debug, Clone)]
pub struct JobManagerOptions {
    /// Maximum number of simultaneously running jobs.
    pub max_concurrent_jobs: usize,
    /// How long a terminal job's record is retained before reaping.
    pub retention: ChronoDuration,
    /// Root directory archives are written under.
    pub output_dir: PathBuf,
}

impl JobManagerOptions {
    /// Builds options with the default concurrency/retention and the given
    /// output directory.
    pub fn new(output_dir: PathBuf) -> Self {
        Self {
            max_concurrent_jobs: DEFAULT_MAX_CONCURRENT_JOBS,
            retention: DEFAULT_RETENTION,
            output_dir,
        }
    }
}

struct JobEntry {
    record: JobRecord,
    cancel_tx: watch::Sender<bool>,
    accumulated_duration_secs: f64,
    completed_at: Option<chrono::DateTime<Utc>>,
}

struct Inner<C> {
    registry: RwLock<HashMap<Uuid, JobEntry>>,
    client: Arc<C>,
    clock: Arc<dyn Clock>,
    options: JobManagerOptions,
}

/// Owns the registry of export jobs and drives their workers. Cheap to
/// clone: all state lives behind the shared `Arc<Inner<_>>`.
pub struct JobManager<C: VmApi + Send + Sync + 'static> {
    inner: Arc<Inner<C>>,
}

impl<C: VmApi + Send + Sync + 'static> Clone for JobManager<C> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<C: VmApi + Send + Sync + 'static> JobManager<C> {
    /// Builds a manager around a shared VM Client and clock.
    pub fn new(client: C, clock: Arc<dyn Clock>, options: JobManagerOptions) -> Self {
        Self {
            inner: Arc::new(Inner {
                registry: RwLock::new(HashMap::new()),
                client: Arc::new(client),
                clock,
                options,
            }),
        }
    }

    /// Counts jobs that occupy a concurrency slot: per §5, only
    /// completed/failed/canceled jobs are excluded from the cap, so a
    /// `pending` job (admitted but not yet transitioned to `running` by its
    /// worker) still counts.
    fn admitted_count(registry: &HashMap<Uuid, JobEntry>) -> usize {
        registry
            .values()
            .filter(|e| !e.record.state.is_terminal())
            .count()
    }

    /// Admits a new export job. Rejects with `AtCapacity` when the number of
    /// currently non-terminal (pending or running) jobs is at
    /// `max_concurrent_jobs`.
    pub fn start(&self, config: ExportConfig) -> Result<JobRecord> {
        self.reap_expired();

        let stage_dir = staging::resolve(config.staging_dir.as_deref())?;
        let windows = planner::plan(config.time_range, config.batch);
        let batch_window_seconds = windows
            .first()
            .map(|w| (w.end - w.start).num_seconds().max(0) as u64)
            .unwrap_or(0);

        let mut registry = self.inner.registry.write().unwrap();
        let running = Self::admitted_count(&registry);
        if running >= self.inner.options.max_concurrent_jobs {
            return Err(GatherError::AtCapacity {
                running,
                max: self.inner.options.max_concurrent_jobs,
            });
        }

        let id = Uuid::new_v4();
        let staging_path = match &config.staging_file {
            Some(name) => stage_dir.join(name),
            None => stage_dir.join(format!("{id}.partial.jsonl")),
        };
        let now = self.inner.clock.now();
        let (cancel_tx, cancel_rx) = watch::channel(false);

        let record = JobRecord {
            id,
            created_at: now,
            state: JobState::Pending,
            total_batches: windows.len(),
            completed_batches: 0,
            batch_window_seconds,
            current_range: None,
            metrics_processed: 0,
            last_batch_seconds: 0.0,
            average_batch_seconds: 0.0,
            eta: None,
            progress: 0.0,
            staging_path: staging_path.to_string_lossy().into_owned(),
            obfuscation_enabled: config.obfuscation.enabled,
            result: None,
            error: None,
            config: config.clone(),
            resume_from: 0,
            base_batches: 0,
            base_metrics: 0,
        };

        registry.insert(
            id,
            JobEntry {
                record: record.clone(),
                cancel_tx,
                accumulated_duration_secs: 0.0,
                completed_at: None,
            },
        );
        drop(registry);

        tracing::info!(job_id = %id, total_batches = record.total_batches, "export job admitted");
        self.spawn_worker(id, config, cancel_rx);
        Ok(record)
    }

    /// Returns a defensive copy of a job's current record.
    pub fn status(&self, id: Uuid) -> Result<JobRecord> {
        let registry = self.inner.registry.read().unwrap();
        registry
            .get(&id)
            .map(|e| e.record.clone())
            .ok_or_else(|| GatherError::NotFound(id.to_string()))
    }

    /// Signals the job's worker to stop at its next batch or I/O boundary.
    /// Returns `AlreadyTerminal` if the job has already reached a terminal
    /// state: a cancel racing a just-completed job loses rather than
    /// rewriting a terminal record.
    pub fn cancel(&self, id: Uuid) -> Result<()> {
        let registry = self.inner.registry.read().unwrap();
        let entry = registry
            .get(&id)
            .ok_or_else(|| GatherError::NotFound(id.to_string()))?;
        if entry.record.state.is_terminal() {
            return Err(GatherError::AlreadyTerminal(state_label(entry.record.state)));
        }
        let _ = entry.cancel_tx.send(true);
        tracing::info!(job_id = %id, "cancellation requested");
        Ok(())
    }

    /// Restarts a `failed` or `canceled` job from its first unfinished
    /// batch, reusing its staging file and config.
    pub fn resume(&self, id: Uuid) -> Result<JobRecord> {
        self.reap_expired();

        let (mut config, base_batches, base_metrics) = {
            let registry = self.inner.registry.read().unwrap();
            let entry = registry
                .get(&id)
                .ok_or_else(|| GatherError::NotFound(id.to_string()))?;
            if !matches!(entry.record.state, JobState::Failed | JobState::Canceled) {
                return Err(GatherError::NotResumable(format!(
                    "job is {}",
                    state_label(entry.record.state)
                )));
            }
            (
                entry.record.config.clone(),
                entry.record.completed_batches,
                entry.record.metrics_processed,
            )
        };
        config.resume_from_batch = base_batches;

        let mut registry = self.inner.registry.write().unwrap();
        let running = Self::admitted_count(&registry);
        if running >= self.inner.options.max_concurrent_jobs {
            return Err(GatherError::AtCapacity {
                running,
                max: self.inner.options.max_concurrent_jobs,
            });
        }

        let (cancel_tx, cancel_rx) = watch::channel(false);
        let entry = registry.get_mut(&id).expect("checked above");
        entry.record.state = JobState::Pending;
        entry.record.resume_from = base_batches;
        entry.record.base_batches = base_batches;
        entry.record.base_metrics = base_metrics;
        entry.record.error = None;
        entry.record.config = config.clone();
        entry.cancel_tx = cancel_tx;
        entry.accumulated_duration_secs = 0.0;
        let record = entry.record.clone();
        drop(registry);

        tracing::info!(job_id = %id, resume_from = base_batches, "resuming job");
        self.spawn_worker(id, config, cancel_rx);
        Ok(record)
    }

    fn reap_expired(&self) {
        let now = self.inner.clock.now();
        let retention = self.inner.options.retention;
        let mut registry = self.inner.registry.write().unwrap();
        let before = registry.len();
        registry.retain(|_, entry| match entry.completed_at {
            Some(completed_at) if entry.record.state.is_terminal() => now - completed_at < retention,
            _ => true,
        });
        let reaped = before - registry.len();
        if reaped > 0 {
            tracing::debug!(reaped, "reaped expired job records");
        }
    }

    fn spawn_worker(&self, id: Uuid, config: ExportConfig, mut cancel_rx: watch::Receiver<bool>) {
        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            {
                let mut registry = inner.registry.write().unwrap();
                if let Some(entry) = registry.get_mut(&id) {
                    entry.record.state = JobState::Running;
                }
            }

            let sink = JobProgressSink {
                inner: &inner,
                job_id: id,
            };
            let result = pipeline::execute(
                id,
                inner.client.as_ref(),
                inner.clock.as_ref(),
                &config,
                &inner.options.output_dir,
                &mut cancel_rx,
                &sink,
            )
            .await;

            let mut registry = inner.registry.write().unwrap();
            if let Some(entry) = registry.get_mut(&id) {
                match result {
                    Ok(export_result) => {
                        tracing::info!(job_id = %id, metrics = export_result.metrics_count, archive = %export_result.archive_path, "export job completed");
                        entry.record.state = JobState::Completed;
                        entry.record.progress = 1.0;
                        entry.record.eta = None;
                        entry.record.result = Some(export_result);
                    }
                    Err(GatherError::Canceled) => {
                        tracing::info!(job_id = %id, completed_batches = entry.record.completed_batches, "export job canceled");
                        entry.record.state = JobState::Canceled;
                        entry.record.error = Some("canceled".to_string());
                    }
                    Err(e) => {
                        tracing::warn!(job_id = %id, error = %e, "export job failed");
                        entry.record.state = JobState::Failed;
                        entry.record.error = Some(e.to_string());
                    }
                }
                entry.completed_at = Some(inner.clock.now());
            }
        });
    }
}

fn state_label(state: JobState) -> String {
    match state {
        JobState::Pending => "pending",
        JobState::Running => "running",
        JobState::Completed => "completed",
        JobState::Failed => "failed",
        JobState::Canceled => "canceled",
    }
    .to_string()
}

struct JobProgressSink<'a, C> {
    inner: &'a Inner<C>,
    job_id: Uuid,
}

impl<'a, C: VmApi + Send + Sync + 'static> ProgressSink for JobProgressSink<'a, C> {
    fn on_batch(&self, event: BatchProgress) {
        let mut registry = self.inner.registry.write().unwrap();
        let Some(entry) = registry.get_mut(&self.job_id) else {
            return;
        };

        entry.record.completed_batches = entry.record.completed_batches.max(event.batch_index);
        entry.record.progress = if entry.record.total_batches == 0 {
            1.0
        } else {
            (entry.record.completed_batches as f64 / entry.record.total_batches as f64).min(1.0)
        };
        entry.record.metrics_processed =
            entry.record.metrics_processed.max(entry.record.base_metrics) + event.metrics_in_batch;
        entry.record.current_range = Some(event.window);

        let duration_secs = event.duration.num_milliseconds() as f64 / 1000.0;
        entry.record.last_batch_seconds = duration_secs;
        entry.accumulated_duration_secs += duration_secs;

        let batches_observed_this_run = entry
            .record
            .completed_batches
            .saturating_sub(entry.record.base_batches)
            .max(1);
        entry.record.average_batch_seconds =
            entry.accumulated_duration_secs / batches_observed_this_run as f64;

        let remaining = entry
            .record
            .total_batches
            .saturating_sub(entry.record.completed_batches);
        entry.record.eta = if remaining == 0 {
            None
        } else {
            let millis = entry.record.average_batch_seconds * remaining as f64 * 1000.0;
            Some(self.inner.clock.now() + ChronoDuration::milliseconds(millis as i64))
        };
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::SystemClock;
    use crate::model::{
        AuthVariant, BatchSettings, BatchStrategy, ExportedMetric, ObfuscationConfig, TimeRange,
        VmConnection,
    };
    use crate::vm_client::{ExportStream, QueryResult, RangeResult};
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct StubClient {
        calls: AtomicUsize,
        batch_delay_ms: u64,
    }

    impl VmApi for StubClient {
        async fn query(
            &self,
            _conn: &VmConnection,
            _promql: &str,
            _at: chrono::DateTime<Utc>,
        ) -> Result<QueryResult> {
            Ok(QueryResult::default())
        }

        async fn query_range(
            &self,
            _conn: &VmConnection,
            _promql: &str,
            _start: chrono::DateTime<Utc>,
            _end: chrono::DateTime<Utc>,
            _step_seconds: u64,
        ) -> Result<RangeResult> {
            Ok(RangeResult::default())
        }

        async fn export(
            &self,
            _conn: &VmConnection,
            _selector: &str,
            _start: chrono::DateTime<Utc>,
            _end: chrono::DateTime<Utc>,
        ) -> Result<ExportStream> {
            if self.batch_delay_ms > 0 {
                tokio::time::sleep(std::time::Duration::from_millis(self.batch_delay_ms)).await;
            }
            self.calls.fetch_add(1, Ordering::SeqCst);
            let record = ExportedMetric {
                labels: [("__name__".to_string(), "vm_app_version".to_string())]
                    .into_iter()
                    .collect(),
                values: vec![1.0],
                timestamps: vec![0],
            };
            let mut bytes = serde_json::to_vec(&record).unwrap();
            bytes.push(b'\n');
            Ok(ExportStream::from_bytes(bytes))
        }
    }

    fn config(dir: &std::path::Path, window_count_hint_secs: i64) -> ExportConfig {
        ExportConfig {
            connection: VmConnection {
                base_url: "http://vm.example.com".to_string(),
                api_base_path: None,
                tenant_id: None,
                multitenant: false,
                auth: AuthVariant::None,
                tls_skip_verify: false,
            },
            time_range: TimeRange::new(
                Utc::now() - chrono::Duration::seconds(window_count_hint_secs),
                Utc::now(),
            )
            .unwrap(),
            batch: BatchSettings {
                enabled: true,
                strategy: BatchStrategy::Custom,
                custom_interval_seconds: 30,
            },
            obfuscation: ObfuscationConfig::default(),
            components: vec![],
            jobs: vec![],
            metric_step_seconds: 30,
            staging_dir: Some(dir.to_string_lossy().into_owned()),
            staging_file: None,
            resume_from_batch: 0,
        }
    }

    async fn wait_terminal<C: VmApi + Send + Sync + 'static>(mgr: &JobManager<C>, id: Uuid) -> JobRecord {
        for _ in 0..200 {
            let record = mgr.status(id).unwrap();
            if record.state.is_terminal() {
                return record;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        panic!("job did not reach a terminal state in time");
    }

    #[tokio::test]
    async fn happy_path_completes_and_reports_progress() {
        let dir = tempfile::tempdir().unwrap();
        let out_dir = tempfile::tempdir().unwrap();
        let mgr = JobManager::new(
            StubClient {
                calls: AtomicUsize::new(0),
                batch_delay_ms: 0,
            },
            Arc::new(SystemClock),
            JobManagerOptions::new(out_dir.path().to_path_buf()),
        );
        let record = mgr.start(config(dir.path(), 60)).unwrap();
        let final_record = wait_terminal(&mgr, record.id).await;

        assert_eq!(final_record.state, JobState::Completed);
        assert_eq!(final_record.completed_batches, final_record.total_batches);
        assert!(final_record.progress - 1.0 < f64::EPSILON);
    }

    #[tokio::test]
    async fn fourth_rapid_submission_hits_capacity() {
        let dir = tempfile::tempdir().unwrap();
        let out_dir = tempfile::tempdir().unwrap();
        let mgr = JobManager::new(
            StubClient {
                calls: AtomicUsize::new(0),
                batch_delay_ms: 200,
            },
            Arc::new(SystemClock),
            JobManagerOptions::new(out_dir.path().to_path_buf()),
        );

        for _ in 0..3 {
            mgr.start(config(dir.path(), 30)).unwrap();
        }
        let fourth = mgr.start(config(dir.path(), 30));
        assert!(matches!(fourth, Err(GatherError::AtCapacity { .. })));
    }

    #[tokio::test]
    async fn cancel_then_resume_reaches_completed() {
        let dir = tempfile::tempdir().unwrap();
        let out_dir = tempfile::tempdir().unwrap();
        let mgr = JobManager::new(
            StubClient {
                calls: AtomicUsize::new(0),
                batch_delay_ms: 50,
            },
            Arc::new(SystemClock),
            JobManagerOptions::new(out_dir.path().to_path_buf()),
        );
        let record = mgr.start(config(dir.path(), 300)).unwrap();

        tokio::time::sleep(std::time::Duration::from_millis(80)).await;
        mgr.cancel(record.id).unwrap();
        let canceled = wait_terminal(&mgr, record.id).await;
        assert_eq!(canceled.state, JobState::Canceled);
        assert!(canceled.completed_batches < canceled.total_batches);

        let resumed = mgr.resume(record.id).unwrap();
        assert_eq!(resumed.resume_from, canceled.completed_batches);
        let final_record = wait_terminal(&mgr, record.id).await;
        assert_eq!(final_record.state, JobState::Completed);
        assert_eq!(final_record.completed_batches, final_record.total_batches);
    }

    #[tokio::test]
    async fn cancel_on_terminal_job_is_already_terminal() {
        let dir = tempfile::tempdir().unwrap();
        let out_dir = tempfile::tempdir().unwrap();
        let mgr = JobManager::new(
            StubClient {
                calls: AtomicUsize::new(0),
                batch_delay_ms: 0,
            },
            Arc::new(SystemClock),
            JobManagerOptions::new(out_dir.path().to_path_buf()),
        );
        let record = mgr.start(config(dir.path(), 30)).unwrap();
        wait_terminal(&mgr, record.id).await;

        let err = mgr.cancel(record.id).unwrap_err();
        assert!(matches!(err, GatherError::AlreadyTerminal(_)));
    }

    #[tokio::test]
    async fn status_of_unknown_job_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let mgr = JobManager::new(
            StubClient {
                calls: AtomicUsize::new(0),
                batch_delay_ms: 0,
            },
            Arc::new(SystemClock),
            JobManagerOptions::new(dir.path().to_path_buf()),
        );
        let err = mgr.status(Uuid::new_v4()).unwrap_err();
        assert!(matches!(err, GatherError::NotFound(_)));
    }
}
