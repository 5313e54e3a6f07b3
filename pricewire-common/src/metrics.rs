//! Metrics and DLQ inspection
//!
//! Counters, gauges, and duration sums live in the KV store under
//! `metrics.`-prefixed keys (`metrics.{name}[.tag=value]...`), so every
//! replica converges on the same numbers. The render path turns those keys
//! into `name{tag="v",...} value` text lines for the HTTP endpoint.
//!
//! Metric writes never fail the caller; storage errors are logged and
//! dropped.

use crate::bus::{dlq_stream, EntryId, StreamBus, StreamEntry};
use crate::kv::KvStore;
use crate::Result;
use tracing::debug;

const METRICS_PREFIX: &str = "metrics.";

/// KV-backed counters/gauges shared across replicas
#[derive(Clone)]
pub struct Metrics {
    kv: KvStore,
}

impl Metrics {
    pub fn new(kv: KvStore) -> Self {
        Self { kv }
    }

    /// Increment a counter by one
    pub async fn incr(&self, name: &str, tags: &[(&str, &str)]) {
        self.add(name, tags, 1).await;
    }

    /// Add a delta to a counter (used for duration sums)
    pub async fn add(&self, name: &str, tags: &[(&str, &str)], delta: i64) {
        let key = metric_key(name, tags);
        if let Err(e) = self.kv.incr_by(&key, delta, None).await {
            debug!(metric = name, error = %e, "metric increment dropped");
        }
    }

    /// Set a gauge to an absolute value
    pub async fn set_gauge(&self, name: &str, tags: &[(&str, &str)], value: i64) {
        let key = metric_key(name, tags);
        if let Err(e) = self.kv.set(&key, &value.to_string(), None).await {
            debug!(metric = name, error = %e, "gauge write dropped");
        }
    }

    /// Record one observation of a duration: bumps `{name}_ms_total` and
    /// `{name}_count` so consumers can derive an average.
    pub async fn observe_duration_ms(&self, name: &str, tags: &[(&str, &str)], ms: u64) {
        self.add(&format!("{name}_ms_total"), tags, ms as i64).await;
        self.incr(&format!("{name}_count"), tags).await;
    }

    /// Render all metrics as `name{tag="v",...} value` text lines
    pub async fn render(&self) -> Result<String> {
        let keys = self.kv.keys(&format!("{METRICS_PREFIX}*")).await?;
        let mut out = String::new();
        for key in keys {
            let Some(value) = self.kv.get(&key).await? else {
                continue;
            };
            let Some((name, tags)) = parse_metric_key(&key) else {
                continue;
            };
            if tags.is_empty() {
                out.push_str(&format!("{name} {value}\n"));
            } else {
                let rendered: Vec<String> = tags
                    .iter()
                    .map(|(k, v)| format!("{k}=\"{v}\""))
                    .collect();
                out.push_str(&format!("{name}{{{}}} {value}\n", rendered.join(",")));
            }
        }
        Ok(out)
    }
}

/// Encode a metric into its KV key: `metrics.{name}[.tag=value]...`
///
/// Metric names use underscores only; tag values may contain dots (stream
/// names do), which the parser reassembles.
pub fn metric_key(name: &str, tags: &[(&str, &str)]) -> String {
    let mut key = format!("{METRICS_PREFIX}{name}");
    let mut sorted: Vec<(&str, &str)> = tags.to_vec();
    sorted.sort();
    for (tag, value) in sorted {
        key.push_str(&format!(".{tag}={value}"));
    }
    key
}

/// Decode a metric KV key back into name + tags.
///
/// Segments after the first `k=v` segment that carry no `=` of their own are
/// dot-joined back onto the previous tag value.
pub fn parse_metric_key(key: &str) -> Option<(String, Vec<(String, String)>)> {
    let rest = key.strip_prefix(METRICS_PREFIX)?;
    let mut name = String::new();
    let mut tags: Vec<(String, String)> = Vec::new();

    for segment in rest.split('.') {
        match segment.split_once('=') {
            Some((tag, value)) => tags.push((tag.to_string(), value.to_string())),
            None => {
                if let Some(last) = tags.last_mut() {
                    last.1.push('.');
                    last.1.push_str(segment);
                } else if name.is_empty() {
                    name = segment.to_string();
                } else {
                    // Dotted metric names are not produced by metric_key.
                    return None;
                }
            }
        }
    }

    if name.is_empty() {
        None
    } else {
        Some((name, tags))
    }
}

/// Read-only view over dead-letter streams for the inspection API
#[derive(Clone)]
pub struct DlqInspector {
    bus: StreamBus,
}

impl DlqInspector {
    pub fn new(bus: StreamBus) -> Self {
        Self { bus }
    }

    /// Number of dead-lettered entries for `stream`
    pub async fn size(&self, stream: &str) -> Result<i64> {
        self.bus.xlen(&dlq_stream(stream)).await
    }

    /// Oldest `count` dead-lettered entries for `stream`
    pub async fn peek(&self, stream: &str, count: usize) -> Result<Vec<StreamEntry>> {
        self.bus.xread(&dlq_stream(stream), EntryId::ZERO, count).await
    }
}
