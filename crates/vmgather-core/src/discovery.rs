//! Enumerates VM components, jobs, instance counts, and per-job series
//! estimates for the preflight/advanced-mode wizard.

use std::collections::BTreeMap;

use chrono::Utc;

use crate::error::{GatherError, Result};
use crate::model::{TimeRange, VmConnection};
use crate::vm_client::{quote_selector_value, VmApi};

/// A discovered VM component with its aggregate counts.
#[derive(Debug, Clone, PartialEq)]
pub struct Component {
    /// Component name (e.g. `vmstorage`).
    pub name: String,
    /// Jobs observed under this component.
    pub jobs: Vec<String>,
    /// Total series count across the component's jobs.
    pub series_count: u64,
    /// Distinct instance count across the component's jobs.
    pub instance_count: u64,
    /// Per-job series count, keyed by job name.
    pub per_job_series: BTreeMap<String, u64>,
}

/// A `(job, instance)` grouping used by advanced-mode selectors.
#[derive(Debug, Clone, PartialEq)]
pub struct SelectorJob {
    /// Job label value.
    pub job: String,
    /// Instance label value.
    pub instance: String,
    /// Series count for this `(job, instance)` pair.
    pub series_count: u64,
}

/// A sampled metric, for preview purposes.
#[derive(Debug, Clone, PartialEq)]
pub struct MetricSample {
    /// Labels of the sampled series.
    pub labels: BTreeMap<String, String>,
    /// The sampled value.
    pub value: f64,
}

fn scalar_value(result: &crate::vm_client::QueryResult) -> Option<f64> {
    result
        .samples
        .first()
        .and_then(|s| s.value.1.parse::<f64>().ok())
}

/// Parses a `count by (job) (...)` vector result into a per-job map.
fn per_job_counts(result: &crate::vm_client::QueryResult) -> BTreeMap<String, u64> {
    result
        .samples
        .iter()
        .filter_map(|s| {
            let job = s.metric.get("job")?.clone();
            let count = s.value.1.parse::<f64>().ok()? as u64;
            Some((job, count))
        })
        .collect()
}

/// Validates connectivity and auth against `conn`. Tries an app-version
/// query first, falling back to a broad component match, then the constant
/// `1`.
pub async fn validate<C: VmApi>(client: &C, conn: &VmConnection) -> Result<()> {
    let now = Utc::now();
    let attempts = ["vm_app_version", "{__name__=~\"vm_.*\"}", "1"];
    let mut last_err = None;
    for promql in attempts {
        match client.query(conn, promql, now).await {
            Ok(result) => {
                if !result.samples.is_empty() || promql == "1" {
                    return Ok(());
                }
                tracing::debug!(query = promql, "validation query returned no samples, trying next fallback");
            }
            Err(e) => {
                tracing::debug!(query = promql, error = %e, "validation query failed, trying next fallback");
                last_err = Some(e);
            }
        }
    }
    Err(last_err.unwrap_or_else(|| GatherError::ProtocolError("empty validation result".to_string())))
}

/// Enumerates components visible over `range`, grouped by `(job,
/// vm_component)` and keyed off the version label, with total series,
/// instance, and per-job series counts.
pub async fn discover_components<C: VmApi>(
    client: &C,
    conn: &VmConnection,
    range: TimeRange,
) -> Result<Vec<Component>> {
    let grouping = client
        .query(conn, "group by (job, vm_component) (vm_app_version)", range.end)
        .await?;

    let mut by_component: BTreeMap<String, Vec<String>> = BTreeMap::new();
    for sample in &grouping.samples {
        let component = sample
            .metric
            .get("vm_component")
            .cloned()
            .unwrap_or_else(|| "unknown".to_string());
        if let Some(job) = sample.metric.get("job") {
            by_component.entry(component).or_default().push(job.clone());
        }
    }

    let mut components = Vec::new();
    for (name, jobs) in by_component {
        let job_selector = jobs_selector(&jobs);
        let total = client
            .query(conn, &format!("count({job_selector})"), range.end)
            .await?;
        let instances = client
            .query(
                conn,
                &format!("count(count by (instance) ({job_selector}))"),
                range.end,
            )
            .await?;
        let per_job = client
            .query(conn, &format!("count by (job) ({job_selector})"), range.end)
            .await?;
        components.push(Component {
            name,
            jobs,
            series_count: scalar_value(&total).unwrap_or(0.0) as u64,
            instance_count: scalar_value(&instances).unwrap_or(0.0) as u64,
            per_job_series: per_job_counts(&per_job),
        });
    }
    Ok(components)
}

/// Groups an arbitrary selector by `(job, instance)`, for advanced-mode
/// discovery.
pub async fn discover_selector_jobs<C: VmApi>(
    client: &C,
    conn: &VmConnection,
    selector: &str,
    range: TimeRange,
) -> Result<Vec<SelectorJob>> {
    let grouping = client
        .query(
            conn,
            &format!("count by (job, instance) ({selector})"),
            range.end,
        )
        .await?;

    Ok(grouping
        .samples
        .into_iter()
        .filter_map(|s| {
            let job = s.metric.get("job")?.clone();
            let instance = s.metric.get("instance")?.clone();
            let series_count = s.value.1.parse::<f64>().ok()? as u64;
            Some(SelectorJob {
                job,
                instance,
                series_count,
            })
        })
        .collect())
}

/// Samples up to `limit` series from the jobs selected by `jobs`, using
/// `topk` rather than a broad scan.
pub async fn sample<C: VmApi>(
    client: &C,
    conn: &VmConnection,
    jobs: &[String],
    limit: u32,
) -> Result<Vec<MetricSample>> {
    let selector = if jobs.is_empty() {
        "{__name__!=\"\"}".to_string()
    } else {
        jobs_selector(jobs)
    };
    let query = format!("topk({limit}, {selector})");
    let result = client.query(conn, &query, Utc::now()).await?;

    Ok(result
        .samples
        .into_iter()
        .filter_map(|s| {
            let value = s.value.1.parse::<f64>().ok()?;
            Some(MetricSample {
                labels: s.metric,
                value,
            })
        })
        .collect())
}

fn jobs_selector(jobs: &[String]) -> String {
    let alternation = jobs
        .iter()
        .map(|j| quote_selector_value(j))
        .collect::<Vec<_>>()
        .join("|");
    format!("{{job=~\"{alternation}\"}}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::AuthVariant;
    use crate::vm_client::{InstantSample, QueryResult};
    use std::sync::Mutex;

    struct StubClient {
        responses: Mutex<Vec<(String, QueryResult)>>,
    }

    impl crate::vm_client::VmApi for StubClient {
        async fn query(
            &self,
            _conn: &VmConnection,
            promql: &str,
            _at: chrono::DateTime<Utc>,
        ) -> Result<QueryResult> {
            let mut responses = self.responses.lock().unwrap();
            if let Some(pos) = responses.iter().position(|(q, _)| q == promql) {
                Ok(responses.remove(pos).1)
            } else {
                Ok(QueryResult::default())
            }
        }

        async fn query_range(
            &self,
            _conn: &VmConnection,
            _promql: &str,
            _start: chrono::DateTime<Utc>,
            _end: chrono::DateTime<Utc>,
            _step_seconds: u64,
        ) -> Result<crate::vm_client::RangeResult> {
            Ok(crate::vm_client::RangeResult::default())
        }

        async fn export(
            &self,
            _conn: &VmConnection,
            _selector: &str,
            _start: chrono::DateTime<Utc>,
            _end: chrono::DateTime<Utc>,
        ) -> Result<crate::vm_client::ExportStream> {
            Ok(crate::vm_client::ExportStream::from_bytes(Vec::new()))
        }
    }

    fn conn() -> VmConnection {
        VmConnection {
            base_url: "http://vm.example.com".to_string(),
            api_base_path: None,
            tenant_id: None,
            multitenant: false,
            auth: AuthVariant::None,
            tls_skip_verify: false,
        }
    }

    #[tokio::test]
    async fn validate_succeeds_on_nonempty_app_version() {
        let mut sample = InstantSample {
            metric: BTreeMap::new(),
            value: (1.0, "1".to_string()),
        };
        sample.metric.insert("job".to_string(), "vmstorage-prod".to_string());
        let client = StubClient {
            responses: Mutex::new(vec![(
                "vm_app_version".to_string(),
                QueryResult { samples: vec![sample] },
            )]),
        };
        assert!(validate(&client, &conn()).await.is_ok());
    }

    #[tokio::test]
    async fn validate_falls_back_to_constant_one() {
        let client = StubClient {
            responses: Mutex::new(vec![]),
        };
        assert!(validate(&client, &conn()).await.is_ok());
    }

    #[test]
    fn jobs_selector_quotes_regex_metacharacters() {
        let sel = jobs_selector(&["a.b".to_string()]);
        assert_eq!(sel, r#"{job=~"a\.b"}"#);
    }

    #[tokio::test]
    async fn discover_components_includes_per_job_series_counts() {
        let mut grouping_sample = InstantSample {
            metric: BTreeMap::new(),
            value: (1.0, "1".to_string()),
        };
        grouping_sample
            .metric
            .insert("job".to_string(), "vmstorage-prod".to_string());
        grouping_sample
            .metric
            .insert("vm_component".to_string(), "vmstorage".to_string());

        let selector = jobs_selector(&["vmstorage-prod".to_string()]);
        let mut per_job_sample = InstantSample {
            metric: BTreeMap::new(),
            value: (1.0, "42".to_string()),
        };
        per_job_sample
            .metric
            .insert("job".to_string(), "vmstorage-prod".to_string());

        let client = StubClient {
            responses: Mutex::new(vec![
                (
                    "group by (job, vm_component) (vm_app_version)".to_string(),
                    QueryResult { samples: vec![grouping_sample] },
                ),
                (
                    format!("count({selector})"),
                    QueryResult {
                        samples: vec![InstantSample {
                            metric: BTreeMap::new(),
                            value: (1.0, "42".to_string()),
                        }],
                    },
                ),
                (
                    format!("count(count by (instance) ({selector}))"),
                    QueryResult {
                        samples: vec![InstantSample {
                            metric: BTreeMap::new(),
                            value: (1.0, "3".to_string()),
                        }],
                    },
                ),
                (
                    format!("count by (job) ({selector})"),
                    QueryResult { samples: vec![per_job_sample] },
                ),
            ]),
        };

        let range = TimeRange::new(Utc::now() - chrono::Duration::hours(1), Utc::now()).unwrap();
        let components = discover_components(&client, &conn(), range).await.unwrap();

        assert_eq!(components.len(), 1);
        let component = &components[0];
        assert_eq!(component.series_count, 42);
        assert_eq!(component.instance_count, 3);
        assert_eq!(
            component.per_job_series.get("vmstorage-prod").copied(),
            Some(42)
        );
    }
}
