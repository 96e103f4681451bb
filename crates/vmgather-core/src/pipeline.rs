//! Drives the Planner, iterates batches against the VM Client, transforms
//! records through the Obfuscator, and hands the staged stream to the
//! Archive Writer.

use std::collections::BTreeSet;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use chrono::Utc;
use tokio::sync::watch;

use crate::archive;
use crate::clock::Clock;
use crate::error::{GatherError, Result};
use crate::model::{ExportConfig, ExportResult, ExportedMetric};
use crate::obfuscator::{infer_component, Obfuscator};
use crate::planner;
use crate::progress::{BatchProgress, ProgressSink};
use crate::staging;
use crate::vm_client::{build_selector, RangeSeries, VmApi};

/// Per-batch fetch deadline. Bounds a single stuck window without killing
/// the whole job.
const BATCH_DEADLINE: std::time::Duration = std::time::Duration::from_secs(120);

/// The version string embedded in produced manifests.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

fn staging_path(config: &ExportConfig, stage_dir: &Path, export_id: uuid::Uuid) -> PathBuf {
    match &config.staging_file {
        Some(name) => stage_dir.join(name),
        None => stage_dir.join(format!("{export_id}.partial.jsonl")),
    }
}

/// Truncates a possibly-incomplete trailing JSON line from a staging file
/// opened for resume. Returns the number of complete lines retained.
fn truncate_trailing_partial_line(path: &Path) -> Result<u64> {
    let content = std::fs::read(path)
        .map_err(|e| GatherError::StagingUnavailable(format!("reading staging file: {e}")))?;
    if content.is_empty() {
        return Ok(0);
    }
    let mut valid_len = content.len();
    let mut complete_lines = 0u64;
    if content.last() != Some(&b'\n') {
        // Trailing content has no terminating newline: find the last
        // complete line and drop everything after it.
        if let Some(last_nl) = content[..content.len()].iter().rposition(|b| *b == b'\n') {
            valid_len = last_nl + 1;
        } else {
            valid_len = 0;
        }
    }
    for line in content[..valid_len].split(|b| *b == b'\n') {
        if !line.is_empty() {
            complete_lines += 1;
        }
    }
    if valid_len != content.len() {
        let file = std::fs::OpenOptions::new()
            .write(true)
            .open(path)
            .map_err(|e| GatherError::StagingUnavailable(format!("truncating staging file: {e}")))?;
        file.set_len(valid_len as u64)
            .map_err(|e| GatherError::StagingUnavailable(format!("truncating staging file: {e}")))?;
    }
    Ok(complete_lines)
}

fn reshape_range_series(series: RangeSeries) -> ExportedMetric {
    let mut timestamps = Vec::with_capacity(series.values.len());
    let mut values = Vec::with_capacity(series.values.len());
    for (ts, v) in series.values {
        timestamps.push((ts * 1000.0) as i64);
        values.push(v.parse::<f64>().unwrap_or(f64::NAN));
    }
    ExportedMetric {
        labels: series.metric,
        values,
        timestamps,
    }
}

fn apply_obfuscation(metric: &mut ExportedMetric, obf: &mut Obfuscator, config: &ExportConfig) {
    if !config.obfuscation.enabled {
        return;
    }
    let job = metric.labels.get("job").cloned().unwrap_or_default();
    if config.obfuscation.obfuscate_instance {
        if let Some(instance) = metric.labels.get("instance").cloned() {
            let pseudo = obf.obfuscate_instance(&instance);
            metric.labels.insert("instance".to_string(), pseudo);
        }
    }
    if config.obfuscation.obfuscate_job && !job.is_empty() {
        let component = infer_component(&metric.labels, &job);
        let pseudo = obf.obfuscate_job(&job, &component);
        metric.labels.insert("job".to_string(), pseudo);
    }
    for label_name in &config.obfuscation.custom_labels {
        if let Some(value) = metric.labels.get(label_name).cloned() {
            let pseudo = obf.obfuscate_custom_label(label_name, &value);
            metric.labels.insert(label_name.clone(), pseudo);
        }
    }
}

/// Runs the full export pipeline for `config`, returning the produced
/// archive's result.
///
/// `cancel` is polled at every batch boundary and before every per-batch I/O
/// call; when it reads `true` the pipeline returns `GatherError::Canceled`
/// without attempting further batches, leaving all staged content in place
/// so the job can be resumed.
#[allow(clippy::too_many_arguments)]
pub async fn execute<C: VmApi>(
    export_id: uuid::Uuid,
    client: &C,
    clock: &dyn Clock,
    config: &ExportConfig,
    output_dir: &Path,
    cancel: &mut watch::Receiver<bool>,
    progress: &dyn ProgressSink,
) -> Result<ExportResult> {
    let stage_dir = staging::resolve(config.staging_dir.as_deref())?;
    let stage_path = staging_path(config, &stage_dir, export_id);

    let resuming = config.resume_from_batch > 0;
    if resuming && stage_path.exists() {
        truncate_trailing_partial_line(&stage_path)?;
    }

    let file = std::fs::OpenOptions::new()
        .create(true)
        .append(resuming)
        .truncate(!resuming)
        .write(true)
        .open(&stage_path)
        .map_err(|e| GatherError::StagingUnavailable(format!("opening staging file: {e}")))?;
    let mut writer = BufWriter::new(file);

    let selector = build_selector(&config.jobs);
    let windows = planner::plan(config.time_range, config.batch);
    let total_batches = windows.len();

    let mut obfuscator = Obfuscator::new();
    let mut components_seen: BTreeSet<String> = BTreeSet::new();
    let mut jobs_seen: BTreeSet<String> = BTreeSet::new();
    let mut metrics_count: u64 = 0;

    for window in windows.iter().filter(|w| w.index >= config.resume_from_batch) {
        if *cancel.borrow() {
            return Err(GatherError::Canceled);
        }

        let batch_started = clock.now();
        let range = crate::model::TimeRange {
            start: window.start,
            end: window.end,
        };

        let records = fetch_batch(client, config, &selector, range).await?;

        let mut metrics_in_batch: u64 = 0;
        for mut record in records {
            if *cancel.borrow() {
                return Err(GatherError::Canceled);
            }
            if let Some(name) = record.labels.get("component") {
                components_seen.insert(name.clone());
            }
            if let Some(job) = record.labels.get("job") {
                jobs_seen.insert(job.clone());
                let component = infer_component(&record.labels, job);
                components_seen.insert(component);
            }
            apply_obfuscation(&mut record, &mut obfuscator, config);

            let line = serde_json::to_vec(&record)
                .map_err(|e| GatherError::MarshalError(e.to_string()))?;
            writer
                .write_all(&line)
                .and_then(|()| writer.write_all(b"\n"))
                .map_err(|e| GatherError::StagingUnavailable(format!("writing staging file: {e}")))?;
            metrics_in_batch += 1;
        }
        writer
            .flush()
            .map_err(|e| GatherError::StagingUnavailable(format!("flushing staging file: {e}")))?;
        metrics_count += metrics_in_batch;

        let duration = clock.now() - batch_started;
        tracing::debug!(
            export_id = %export_id,
            batch = window.index + 1,
            total_batches,
            metrics_in_batch,
            duration_ms = duration.num_milliseconds(),
            "batch complete"
        );
        progress.on_batch(BatchProgress {
            batch_index: window.index + 1,
            total_batches,
            window: range,
            metrics_in_batch,
            duration,
        });
    }

    let manifest = crate::model::ArchiveManifest {
        export_id,
        export_date: Utc::now(),
        time_range: config.time_range,
        components: components_seen.into_iter().collect(),
        jobs: jobs_seen.into_iter().collect(),
        metrics_count,
        obfuscated: config.obfuscation.enabled,
        version: VERSION.to_string(),
        instance_map: None,
        job_map: None,
        custom_label_maps: None,
    };
    let manifest = if config.obfuscation.enabled {
        let mappings = obfuscator.mappings();
        crate::model::ArchiveManifest {
            instance_map: (!mappings.instance_map.is_empty()).then_some(mappings.instance_map),
            job_map: (!mappings.job_map.is_empty()).then_some(mappings.job_map),
            custom_label_maps: (!mappings.custom_label_maps.is_empty())
                .then_some(mappings.custom_label_maps),
            ..manifest
        }
    } else {
        manifest
    };

    drop(writer);
    let archive_path = archive::archive_path(output_dir, export_id);
    let (size_bytes, sha256) = archive::write_archive(&stage_path, &manifest, &archive_path)?;

    let _ = std::fs::remove_file(&stage_path);

    Ok(ExportResult {
        export_id,
        archive_path: archive_path.to_string_lossy().into_owned(),
        size_bytes,
        metrics_count,
        time_range: config.time_range,
        obfuscated: config.obfuscation.enabled,
        sha256,
    })
}

async fn fetch_batch<C: VmApi>(
    client: &C,
    config: &ExportConfig,
    selector: &str,
    range: crate::model::TimeRange,
) -> Result<Vec<ExportedMetric>> {
    let export_attempt = tokio::time::timeout(
        BATCH_DEADLINE,
        client.export(&config.connection, selector, range.start, range.end),
    )
    .await
    .map_err(|_| GatherError::Transient("batch export deadline exceeded".to_string()))?;

    match export_attempt {
        Ok(stream) => decode_export_stream(stream).await,
        Err(GatherError::RouteMissing(_)) => {
            tracing::warn!("export route missing, falling back to range query");
            let range_result = tokio::time::timeout(
                BATCH_DEADLINE,
                client.query_range(
                    &config.connection,
                    selector,
                    range.start,
                    range.end,
                    config.metric_step_seconds,
                ),
            )
            .await
            .map_err(|_| GatherError::Transient("batch range-query deadline exceeded".to_string()))??;
            Ok(range_result.series.into_iter().map(reshape_range_series).collect())
        }
        Err(other) => Err(other),
    }
}

async fn decode_export_stream(stream: crate::vm_client::ExportStream) -> Result<Vec<ExportedMetric>> {
    use futures::StreamExt;

    let mut out = Vec::new();
    let mut lines = Box::pin(stream.into_lines());
    while let Some(line) = lines.next().await {
        let line = line?;
        let record: ExportedMetric = serde_json::from_slice(&line)
            .map_err(|e| GatherError::DecodeError(e.to_string()))?;
        out.push(record);
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::FixedClock;
    use crate::model::{
        AuthVariant, BatchSettings, BatchStrategy, ObfuscationConfig, TimeRange, VmConnection,
    };
    use crate::progress::NullProgressSink;
    use crate::vm_client::QueryResult;
    use std::sync::Mutex;

    struct StubClient {
        batches: Mutex<Vec<Vec<ExportedMetric>>>,
        route_missing_first: bool,
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
        ) -> Result<crate::vm_client::RangeResult> {
            Ok(crate::vm_client::RangeResult {
                series: vec![RangeSeries {
                    metric: [("__name__".to_string(), "vm_app_version".to_string())]
                        .into_iter()
                        .collect(),
                    values: vec![(1000.0, "1".to_string())],
                }],
            })
        }

        async fn export(
            &self,
            _conn: &VmConnection,
            _selector: &str,
            _start: chrono::DateTime<Utc>,
            _end: chrono::DateTime<Utc>,
        ) -> Result<crate::vm_client::ExportStream> {
            if self.route_missing_first {
                return Err(GatherError::RouteMissing("no export endpoint".to_string()));
            }
            let mut batches = self.batches.lock().unwrap();
            let records = if batches.is_empty() {
                Vec::new()
            } else {
                batches.remove(0)
            };
            let bytes = records
                .iter()
                .map(|r| serde_json::to_vec(r).unwrap())
                .fold(Vec::new(), |mut acc, mut line| {
                    acc.append(&mut line);
                    acc.push(b'\n');
                    acc
                });
            Ok(crate::vm_client::ExportStream::from_bytes(bytes))
        }
    }

    fn sample_metric(job: &str, instance: &str) -> ExportedMetric {
        ExportedMetric {
            labels: [
                ("__name__".to_string(), "vm_app_version".to_string()),
                ("job".to_string(), job.to_string()),
                ("instance".to_string(), instance.to_string()),
            ]
            .into_iter()
            .collect(),
            values: vec![1.0],
            timestamps: vec![1_700_000_000_000],
        }
    }

    fn base_config(dir: &Path, obfuscation: ObfuscationConfig) -> ExportConfig {
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
                Utc::now() - chrono::Duration::seconds(120),
                Utc::now(),
            )
            .unwrap(),
            batch: BatchSettings {
                enabled: true,
                strategy: BatchStrategy::Custom,
                custom_interval_seconds: 60,
            },
            obfuscation,
            components: vec![],
            jobs: vec!["vmstorage-prod".to_string()],
            metric_step_seconds: 60,
            staging_dir: Some(dir.to_string_lossy().into_owned()),
            staging_file: None,
            resume_from_batch: 0,
        }
    }

    #[tokio::test]
    async fn happy_path_writes_all_records_and_archives() {
        let dir = tempfile::tempdir().unwrap();
        let config = base_config(dir.path(), ObfuscationConfig::default());
        let client = StubClient {
            batches: Mutex::new(vec![
                vec![sample_metric("vmstorage-prod", "10.0.0.1:8482")],
                vec![sample_metric("vmstorage-prod", "10.0.0.2:8482")],
            ]),
            route_missing_first: false,
        };
        let clock = FixedClock::new(Utc::now());
        let (_tx, mut rx) = watch::channel(false);

        let result = execute(
            uuid::Uuid::new_v4(),
            &client,
            &clock,
            &config,
            dir.path(),
            &mut rx,
            &NullProgressSink,
        )
        .await
        .unwrap();

        assert_eq!(result.metrics_count, 2);
        assert!(Path::new(&result.archive_path).exists());
    }

    #[tokio::test]
    async fn obfuscation_replaces_instance_and_job_labels() {
        let dir = tempfile::tempdir().unwrap();
        let config = base_config(
            dir.path(),
            ObfuscationConfig {
                enabled: true,
                obfuscate_instance: true,
                obfuscate_job: true,
                preserve_structure: false,
                custom_labels: vec![],
            },
        );
        let client = StubClient {
            batches: Mutex::new(vec![vec![sample_metric("vmstorage-prod", "10.0.1.5:8482")]]),
            route_missing_first: false,
        };
        let clock = FixedClock::new(Utc::now());
        let (_tx, mut rx) = watch::channel(false);

        let result = execute(
            uuid::Uuid::new_v4(),
            &client,
            &clock,
            &config,
            dir.path(),
            &mut rx,
            &NullProgressSink,
        )
        .await
        .unwrap();

        assert!(result.obfuscated);
    }

    #[tokio::test]
    async fn cancellation_stops_before_further_batches() {
        let dir = tempfile::tempdir().unwrap();
        let config = base_config(dir.path(), ObfuscationConfig::default());
        let client = StubClient {
            batches: Mutex::new(vec![vec![sample_metric("vmstorage-prod", "10.0.0.1:8482")]]),
            route_missing_first: false,
        };
        let clock = FixedClock::new(Utc::now());
        let (tx, mut rx) = watch::channel(false);
        tx.send(true).unwrap();

        let err = execute(
            uuid::Uuid::new_v4(),
            &client,
            &clock,
            &config,
            dir.path(),
            &mut rx,
            &NullProgressSink,
        )
        .await
        .unwrap_err();

        assert!(matches!(err, GatherError::Canceled));
    }

    #[test]
    fn truncate_drops_trailing_partial_line() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("staging.jsonl");
        std::fs::write(&path, b"{\"a\":1}\n{\"a\":2}\n{\"a\":3").unwrap();
        let complete = truncate_trailing_partial_line(&path).unwrap();
        assert_eq!(complete, 2);
        let content = std::fs::read_to_string(&path).unwrap();
        assert_eq!(content, "{\"a\":1}\n{\"a\":2}\n");
    }
}
