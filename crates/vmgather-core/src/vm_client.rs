//! Stateless adapter over the VictoriaMetrics HTTP query/export API.

use chrono::{DateTime, Utc};
use futures::Stream;
use reqwest::{StatusCode, Url};
use serde::Deserialize;

use crate::error::{GatherError, Result};
use crate::model::{AuthVariant, VmConnection};

/// A single `(metric, value)` pair as returned by an instant query.
#[derive(Debug, Clone, Deserialize)]
pub struct InstantSample {
    /// Label set.
    pub metric: std::collections::BTreeMap<String, String>,
    /// `[timestamp, value-as-string]` per the Prometheus wire format.
    pub value: (f64, String),
}

/// Result of [`VmClient::query`].
#[derive(Debug, Clone, Default)]
pub struct QueryResult {
    /// The decoded vector of samples. Empty for scalar-only results.
    pub samples: Vec<InstantSample>,
}

/// A single series in a range query result.
#[derive(Debug, Clone, Deserialize)]
pub struct RangeSeries {
    /// Label set.
    pub metric: std::collections::BTreeMap<String, String>,
    /// `[timestamp, value-as-string]` pairs.
    pub values: Vec<(f64, String)>,
}

/// Result of [`VmClient::query_range`].
#[derive(Debug, Clone, Default)]
pub struct RangeResult {
    /// The decoded series.
    pub series: Vec<RangeSeries>,
}

#[derive(Debug, Deserialize)]
struct PrometheusEnvelope<D> {
    status: String,
    data: Option<D>,
    #[serde(rename = "error")]
    error_message: Option<String>,
}

#[derive(Debug, Deserialize)]
struct VectorData {
    #[serde(default)]
    result: Vec<RawVectorSample>,
}

#[derive(Debug, Deserialize)]
struct RawVectorSample {
    metric: std::collections::BTreeMap<String, String>,
    value: (f64, String),
}

#[derive(Debug, Deserialize)]
struct MatrixData {
    #[serde(default)]
    result: Vec<RawMatrixSeries>,
}

#[derive(Debug, Deserialize)]
struct RawMatrixSeries {
    metric: std::collections::BTreeMap<String, String>,
    values: Vec<(f64, String)>,
}

/// A streaming reader of newline-delimited export records.
///
/// Owned by the caller: dropping it closes the underlying HTTP body.
pub struct ExportStream {
    inner: std::pin::Pin<Box<dyn Stream<Item = reqwest::Result<bytes::Bytes>> + Send>>,
}

impl ExportStream {
    /// Wraps a fixed byte buffer as a single-chunk stream, for test doubles
    /// that don't hold a live HTTP response.
    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        Self {
            inner: Box::pin(futures::stream::once(async move {
                Ok::<bytes::Bytes, reqwest::Error>(bytes::Bytes::from(bytes))
            })),
        }
    }

    /// Adapts this stream into one yielding decoded newline-delimited JSON
    /// lines as owned byte buffers, splitting on `\n` across chunk
    /// boundaries.
    pub fn into_lines(self) -> impl Stream<Item = Result<Vec<u8>>> {
        use futures::StreamExt;

        futures::stream::unfold(
            (self.inner, Vec::<u8>::new(), false),
            |(mut inner, mut buf, mut done)| async move {
                loop {
                    if let Some(pos) = buf.iter().position(|b| *b == b'\n') {
                        let line = buf.drain(..=pos).collect::<Vec<u8>>();
                        let line = line[..line.len() - 1].to_vec();
                        if line.is_empty() {
                            continue;
                        }
                        return Some((Ok(line), (inner, buf, done)));
                    }
                    if done {
                        if buf.is_empty() {
                            return None;
                        }
                        let line = std::mem::take(&mut buf);
                        return Some((Ok(line), (inner, buf, done)));
                    }
                    match inner.next().await {
                        Some(Ok(chunk)) => buf.extend_from_slice(&chunk),
                        Some(Err(e)) => {
                            return Some((
                                Err(GatherError::Transient(e.to_string())),
                                (inner, buf, true),
                            ));
                        }
                        None => done = true,
                    }
                }
            },
        )
    }
}

/// Abstraction over the three VM Client operations, implemented by
/// [`VmClient`] and by test doubles so the Export Pipeline can be exercised
/// against a stub instead of a live VictoriaMetrics deployment.
pub trait VmApi: Send + Sync {
    /// See [`VmClient::query`].
    fn query(
        &self,
        conn: &VmConnection,
        promql: &str,
        at: DateTime<Utc>,
    ) -> impl std::future::Future<Output = Result<QueryResult>> + Send;

    /// See [`VmClient::query_range`].
    fn query_range(
        &self,
        conn: &VmConnection,
        promql: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        step_seconds: u64,
    ) -> impl std::future::Future<Output = Result<RangeResult>> + Send;

    /// See [`VmClient::export`].
    fn export(
        &self,
        conn: &VmConnection,
        selector: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> impl std::future::Future<Output = Result<ExportStream>> + Send;
}

impl VmApi for VmClient {
    async fn query(&self, conn: &VmConnection, promql: &str, at: DateTime<Utc>) -> Result<QueryResult> {
        VmClient::query(self, conn, promql, at).await
    }

    async fn query_range(
        &self,
        conn: &VmConnection,
        promql: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        step_seconds: u64,
    ) -> Result<RangeResult> {
        VmClient::query_range(self, conn, promql, start, end, step_seconds).await
    }

    async fn export(
        &self,
        conn: &VmConnection,
        selector: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<ExportStream> {
        VmClient::export(self, conn, selector, start, end).await
    }
}

/// Stateless VictoriaMetrics HTTP client. Holds a shared [`reqwest::Client`]
/// and applies auth/path rules per connection on each call.
#[derive(Debug, Clone)]
pub struct VmClient {
    http: reqwest::Client,
}

impl VmClient {
    /// Builds a client around a shared `reqwest::Client`.
    ///
    /// The caller configures connection-level timeouts on `http` if desired;
    /// this type never imposes a timeout shorter than the caller's own
    /// request deadline (callers drive timing via `tokio::time::timeout`
    /// around the returned futures instead).
    pub fn new(http: reqwest::Client) -> Self {
        Self { http }
    }

    fn base(&self, conn: &VmConnection) -> Result<Url> {
        Url::parse(conn.base_url.trim_end_matches('/'))
            .map_err(|e| GatherError::ProtocolError(format!("invalid base url: {e}")))
    }

    /// Rewrites `/rw/prometheus` to `/prometheus`; `/ui/prometheus`,
    /// `/prometheus`, and `/select/<tenant>/prometheus` pass through
    /// unchanged.
    fn normalize_path_prefix(path: &str) -> String {
        path.replace("/rw/prometheus", "/prometheus")
    }

    fn api_path(&self, conn: &VmConnection, suffix: &str) -> String {
        let base = conn
            .api_base_path
            .clone()
            .unwrap_or_else(|| "/prometheus".to_string());
        let base = Self::normalize_path_prefix(&base);
        let base = if conn.multitenant {
            let tenant = conn.tenant_id.as_deref().unwrap_or("0");
            format!("/select/{tenant}{base}")
        } else {
            base
        };
        format!("{}/api/v1/{}", base.trim_end_matches('/'), suffix)
    }

    fn apply_auth(&self, req: reqwest::RequestBuilder, conn: &VmConnection) -> reqwest::RequestBuilder {
        match &conn.auth {
            AuthVariant::None => req,
            AuthVariant::Basic { user, pass } => req.basic_auth(user, Some(pass)),
            AuthVariant::Bearer { token } => req.bearer_auth(token),
            AuthVariant::CustomHeader { name, value } => req.header(name, value),
        }
    }

    fn client_for(&self, conn: &VmConnection) -> Result<reqwest::Client> {
        if conn.tls_skip_verify {
            reqwest::Client::builder()
                .danger_accept_invalid_certs(true)
                .build()
                .map_err(|e| GatherError::Transient(e.to_string()))
        } else {
            Ok(self.http.clone())
        }
    }

    async fn classify_error(res: reqwest::Response) -> GatherError {
        let status = res.status();
        let url = res.url().clone();
        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            tracing::warn!(%url, %status, "vm request rejected: auth failure");
            return GatherError::AuthFailure(format!("http {status}"));
        }
        if status == StatusCode::NOT_FOUND {
            tracing::debug!(%url, %status, "vm route missing");
            return GatherError::RouteMissing(format!("http {status}"));
        }
        if status.is_server_error() || status == StatusCode::REQUEST_TIMEOUT {
            let body = res.text().await.unwrap_or_default();
            tracing::warn!(%url, %status, "vm request failed transiently");
            return GatherError::Transient(format!("http {status}: {body}"));
        }
        let body = res.text().await.unwrap_or_default();
        GatherError::ProtocolError(format!("http {status}: {body}"))
    }

    /// Instant query, e.g. for discovery or preflight validation.
    pub async fn query(&self, conn: &VmConnection, promql: &str, at: DateTime<Utc>) -> Result<QueryResult> {
        let client = self.client_for(conn)?;
        let url = self
            .base(conn)?
            .join(&self.api_path(conn, "query"))
            .map_err(|e| GatherError::ProtocolError(e.to_string()))?;
        let req = client
            .get(url)
            .query(&[("query", promql), ("time", &at.timestamp().to_string())]);
        let req = self.apply_auth(req, conn);
        let res = req
            .send()
            .await
            .map_err(|e| GatherError::Transient(e.to_string()))?;

        if !res.status().is_success() {
            return Err(Self::classify_error(res).await);
        }
        let envelope: PrometheusEnvelope<VectorData> = res
            .json()
            .await
            .map_err(|e| GatherError::ProtocolError(format!("malformed query response: {e}")))?;
        if envelope.status != "success" {
            return Err(GatherError::ProtocolError(
                envelope.error_message.unwrap_or_else(|| "query failed".into()),
            ));
        }
        let samples = envelope
            .data
            .map(|d| {
                d.result
                    .into_iter()
                    .map(|r| InstantSample {
                        metric: r.metric,
                        value: r.value,
                    })
                    .collect()
            })
            .unwrap_or_default();
        Ok(QueryResult { samples })
    }

    /// Range query, used as a fallback when streaming export is unavailable.
    pub async fn query_range(
        &self,
        conn: &VmConnection,
        promql: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        step_seconds: u64,
    ) -> Result<RangeResult> {
        let client = self.client_for(conn)?;
        let url = self
            .base(conn)?
            .join(&self.api_path(conn, "query_range"))
            .map_err(|e| GatherError::ProtocolError(e.to_string()))?;
        let req = client.get(url).query(&[
            ("query", promql.to_string()),
            ("start", start.timestamp().to_string()),
            ("end", end.timestamp().to_string()),
            ("step", format!("{step_seconds}s")),
        ]);
        let req = self.apply_auth(req, conn);
        let res = req
            .send()
            .await
            .map_err(|e| GatherError::Transient(e.to_string()))?;

        if !res.status().is_success() {
            return Err(Self::classify_error(res).await);
        }
        let envelope: PrometheusEnvelope<MatrixData> = res
            .json()
            .await
            .map_err(|e| GatherError::ProtocolError(format!("malformed range response: {e}")))?;
        if envelope.status != "success" {
            return Err(GatherError::ProtocolError(
                envelope.error_message.unwrap_or_else(|| "query_range failed".into()),
            ));
        }
        let series = envelope
            .data
            .map(|d| {
                d.result
                    .into_iter()
                    .map(|r| RangeSeries {
                        metric: r.metric,
                        values: r.values,
                    })
                    .collect()
            })
            .unwrap_or_default();
        Ok(RangeResult { series })
    }

    /// Streaming export over `[start, end)` matching `selector`.
    ///
    /// Returns `RouteMissing` when the endpoint does not expose
    /// `/api/v1/export` so callers can fall back to [`Self::query_range`].
    pub async fn export(
        &self,
        conn: &VmConnection,
        selector: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<ExportStream> {
        let client = self.client_for(conn)?;
        let url = self
            .base(conn)?
            .join(&self.api_path(conn, "export"))
            .map_err(|e| GatherError::ProtocolError(e.to_string()))?;
        let req = client.get(url).query(&[
            ("match[]", selector.to_string()),
            ("start", start.timestamp().to_string()),
            ("end", end.timestamp().to_string()),
        ]);
        let req = self.apply_auth(req, conn);
        let res = req
            .send()
            .await
            .map_err(|e| GatherError::Transient(e.to_string()))?;

        if !res.status().is_success() {
            return Err(Self::classify_error(res).await);
        }
        Ok(ExportStream {
            inner: Box::pin(res.bytes_stream()),
        })
    }
}

/// Regex-quotes a job name for use inside a `job=~"a|b|c"` selector
/// alternation. Every job name is regex-quoted before being joined in.
pub fn quote_selector_value(raw: &str) -> String {
    regex::escape(raw)
}

/// Builds the series selector for an export/range-query call. Empty `jobs`
/// selects all non-empty series; otherwise builds a `job=~"a|b|c"`
/// alternation of regex-quoted job names.
pub fn build_selector(jobs: &[String]) -> String {
    if jobs.is_empty() {
        return "{__name__!=\"\"}".to_string();
    }
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

    #[test]
    fn selector_is_wildcard_when_no_jobs() {
        assert_eq!(build_selector(&[]), "{__name__!=\"\"}");
    }

    #[test]
    fn selector_quotes_regex_metacharacters() {
        let sel = build_selector(&["a.b".to_string(), "c|d".to_string()]);
        assert_eq!(sel, r#"{job=~"a\.b|c\|d"}"#);
    }

    #[test]
    fn rw_prometheus_is_rewritten() {
        assert_eq!(
            VmClient::normalize_path_prefix("/rw/prometheus"),
            "/prometheus"
        );
        assert_eq!(
            VmClient::normalize_path_prefix("/ui/prometheus"),
            "/ui/prometheus"
        );
        assert_eq!(VmClient::normalize_path_prefix("/prometheus"), "/prometheus");
    }
}
