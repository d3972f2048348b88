//! Pure read-only aggregations over the message store (C7).

use crate::record::{MessageRecord, MessageType, TransportType};
use crate::store::{MessageStore, QueryFilters};
use chrono::{DateTime, Duration, Timelike, Utc};
use serde::Serialize;
use std::collections::HashMap;

/// Common filters accepted by every analytics query.
#[derive(Debug, Clone, Default)]
pub struct Window {
    pub start: Option<DateTime<Utc>>,
    pub end: Option<DateTime<Utc>>,
    pub transport_type: Option<TransportType>,
    pub server_name: Option<String>,
}

#[derive(Debug, Clone, Serialize, Default)]
pub struct TimeseriesBucket {
    pub timestamp: DateTime<Utc>,
    pub requests: u64,
    pub responses: u64,
    pub notifications: u64,
    pub errors: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct TimeseriesResult {
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub interval_minutes: i64,
    pub data: Vec<TimeseriesBucket>,
}

#[derive(Debug, Clone, Serialize)]
pub struct MethodCount {
    pub method: String,
    pub count: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct MethodFrequencyResult {
    pub methods: Vec<MethodCount>,
    pub total_unique_methods: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct TransportCount {
    pub transport_type: String,
    pub count: u64,
    pub percentage: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct TransportDistributionResult {
    pub total: u64,
    pub transports: Vec<TransportCount>,
}

#[derive(Debug, Clone, Serialize)]
pub struct MessageTypeCount {
    pub message_type: String,
    pub count: u64,
    pub percentage: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct MessageTypeDistributionResult {
    pub total: u64,
    pub error_count: u64,
    pub types: Vec<MessageTypeCount>,
}

#[derive(Debug, Clone, Serialize, Default)]
pub struct Percentiles {
    pub min: f64,
    pub avg: f64,
    pub p50: f64,
    pub p90: f64,
    pub p95: f64,
    pub p99: f64,
    pub max: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct MethodPerformance {
    pub method: String,
    pub count: u64,
    pub avg: f64,
    pub p50: f64,
    pub p95: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct HistogramBucket {
    pub range: String,
    pub count: u64,
    pub percentage: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct PerformanceResult {
    pub overall: Percentiles,
    pub top_methods: Vec<MethodPerformance>,
    pub histogram: Vec<HistogramBucket>,
    pub pending_requests: u64,
    pub sample_count: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct ErrorBucket {
    pub timestamp: DateTime<Utc>,
    pub errors: u64,
    pub total: u64,
    pub error_rate: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct ErrorTimelineResult {
    pub data: Vec<ErrorBucket>,
}

/// Fixed latency histogram boundaries in milliseconds, used by
/// [`AnalyticsEngine::performance`]. The final bucket is open-ended (`5000+`).
const HISTOGRAM_BOUNDS: &[(f64, f64, &str)] = &[
    (0.0, 10.0, "0-10"),
    (10.0, 25.0, "10-25"),
    (25.0, 50.0, "25-50"),
    (50.0, 100.0, "50-100"),
    (100.0, 250.0, "100-250"),
    (250.0, 500.0, "250-500"),
    (500.0, 1000.0, "500-1000"),
    (1000.0, 2500.0, "1000-2500"),
    (2500.0, 5000.0, "2500-5000"),
    (5000.0, f64::INFINITY, "5000+"),
];

/// Read-only query engine over a [`MessageStore`] (C7).
pub struct AnalyticsEngine<'a> {
    store: &'a MessageStore,
}

impl<'a> AnalyticsEngine<'a> {
    pub fn new(store: &'a MessageStore) -> Self {
        Self { store }
    }

    fn resolve_window(&self, window: &Window) -> crate::error::Result<(DateTime<Utc>, DateTime<Utc>)> {
        if let (Some(s), Some(e)) = (window.start, window.end) {
            return Ok((s, e));
        }
        match self.store.time_range()? {
            Some((min, max)) => Ok((window.start.unwrap_or(min), window.end.unwrap_or(max))),
            None => {
                let now = Utc::now();
                Ok((window.start.unwrap_or(now - Duration::hours(1)), window.end.unwrap_or(now)))
            }
        }
    }

    fn load(&self, window: &Window) -> crate::error::Result<Vec<MessageRecord>> {
        let (start, end) = self.resolve_window(window)?;
        self.store.aggregate(&QueryFilters {
            message_type: None,
            transport_type: window.transport_type,
            server_name: window.server_name.clone(),
            start_time: Some(start),
            end_time: Some(end),
        })
    }

    /// Counts of `{requests, responses, notifications, errors}` bucketed to
    /// `bucket_minutes`-wide, minute-aligned windows.
    pub fn timeseries(&self, bucket_minutes: i64, window: &Window) -> crate::error::Result<TimeseriesResult> {
        let (start, end) = self.resolve_window(window)?;
        let records = self.load(window)?;

        let mut buckets: HashMap<DateTime<Utc>, TimeseriesBucket> = HashMap::new();
        for record in &records {
            let bucket_ts = align_bucket(record.timestamp, bucket_minutes);
            let entry = buckets.entry(bucket_ts).or_insert_with(|| TimeseriesBucket {
                timestamp: bucket_ts,
                ..Default::default()
            });
            match record.message_type() {
                MessageType::Request => entry.requests += 1,
                MessageType::Response => entry.responses += 1,
                MessageType::Notification => entry.notifications += 1,
                MessageType::Error => entry.errors += 1,
                MessageType::Unknown => {}
            }
            if record.has_error_field() && record.message_type() != MessageType::Error {
                entry.errors += 1;
            }
        }

        let mut data: Vec<TimeseriesBucket> = buckets.into_values().collect();
        data.sort_by_key(|b| b.timestamp);

        Ok(TimeseriesResult { start_time: start, end_time: end, interval_minutes: bucket_minutes, data })
    }

    /// Ranked `(method, count)` pairs, ties broken by first-seen order.
    pub fn method_frequency(&self, limit: usize, window: &Window) -> crate::error::Result<MethodFrequencyResult> {
        let records = self.load(window)?;

        let mut order: Vec<String> = Vec::new();
        let mut counts: HashMap<String, u64> = HashMap::new();
        for record in &records {
            if let Some(method) = record.method() {
                if !counts.contains_key(&method) {
                    order.push(method.clone());
                }
                *counts.entry(method).or_insert(0) += 1;
            }
        }

        let mut methods: Vec<MethodCount> = order
            .into_iter()
            .map(|method| {
                let count = counts[&method];
                MethodCount { method, count }
            })
            .collect();
        // stable_sort preserves first-seen order among ties.
        methods.sort_by(|a, b| b.count.cmp(&a.count));
        let total_unique_methods = methods.len();
        methods.truncate(limit);

        Ok(MethodFrequencyResult { methods, total_unique_methods })
    }

    /// Per-transport counts and percentages.
    pub fn transport_distribution(&self, window: &Window) -> crate::error::Result<TransportDistributionResult> {
        let records = self.load(window)?;
        let total = records.len() as u64;

        let mut counts: HashMap<TransportType, u64> = HashMap::new();
        for record in &records {
            *counts.entry(record.transport_type).or_insert(0) += 1;
        }

        let mut transports: Vec<TransportCount> = counts
            .into_iter()
            .map(|(t, count)| TransportCount {
                transport_type: t.as_str().to_string(),
                count,
                percentage: percentage(count, total),
            })
            .collect();
        transports.sort_by(|a, b| a.transport_type.cmp(&b.transport_type));

        Ok(TransportDistributionResult { total, transports })
    }

    /// Per-classified-type counts and percentages, plus total error count.
    pub fn message_type_distribution(&self, window: &Window) -> crate::error::Result<MessageTypeDistributionResult> {
        let records = self.load(window)?;
        let total = records.len() as u64;

        let mut counts: HashMap<&'static str, u64> = HashMap::new();
        let mut error_count = 0u64;
        for record in &records {
            let mt = record.message_type();
            *counts.entry(mt.as_str()).or_insert(0) += 1;
            if mt == MessageType::Error || record.has_error_field() {
                error_count += 1;
            }
        }

        let mut types: Vec<MessageTypeCount> = counts
            .into_iter()
            .map(|(mt, count)| MessageTypeCount {
                message_type: mt.to_string(),
                count,
                percentage: percentage(count, total),
            })
            .collect();
        types.sort_by(|a, b| a.message_type.cmp(&b.message_type));

        Ok(MessageTypeDistributionResult { total, error_count, types })
    }

    /// Request/response latency percentiles, per-method breakdown, and a
    /// fixed histogram.
    pub fn performance(&self, window: &Window) -> crate::error::Result<PerformanceResult> {
        let records = self.load(window)?;

        let mut pending: HashMap<String, (DateTime<Utc>, String)> = HashMap::new();
        let mut latencies: Vec<f64> = Vec::new();
        let mut per_method: HashMap<String, Vec<f64>> = HashMap::new();

        for record in &records {
            match record.message_type() {
                MessageType::Request => {
                    if let (Some(id), Some(method)) = (record.id(), record.method()) {
                        pending.insert(id, (record.timestamp, method));
                    }
                }
                MessageType::Response | MessageType::Error => {
                    if let Some(id) = record.id() {
                        if let Some((req_ts, method)) = pending.remove(&id) {
                            let latency_ms =
                                (record.timestamp - req_ts).num_milliseconds() as f64;
                            latencies.push(latency_ms);
                            per_method.entry(method).or_default().push(latency_ms);
                        }
                    }
                }
                _ => {}
            }
        }

        let overall = percentiles(&latencies);

        let mut top_methods: Vec<MethodPerformance> = per_method
            .into_iter()
            .map(|(method, mut samples)| {
                samples.sort_by(|a, b| a.partial_cmp(b).unwrap());
                let p = percentiles(&samples);
                MethodPerformance {
                    method,
                    count: samples.len() as u64,
                    avg: p.avg,
                    p50: p.p50,
                    p95: p.p95,
                }
            })
            .collect();
        top_methods.sort_by(|a, b| b.avg.partial_cmp(&a.avg).unwrap());
        top_methods.truncate(10);

        let histogram = histogram(&latencies);

        Ok(PerformanceResult {
            overall,
            top_methods,
            histogram,
            pending_requests: pending.len() as u64,
            sample_count: latencies.len() as u64,
        })
    }

    /// Per-bucket error counts and rates.
    pub fn error_timeline(&self, bucket_minutes: i64, window: &Window) -> crate::error::Result<ErrorTimelineResult> {
        let records = self.load(window)?;

        let mut totals: HashMap<DateTime<Utc>, (u64, u64)> = HashMap::new();
        for record in &records {
            let bucket_ts = align_bucket(record.timestamp, bucket_minutes);
            let entry = totals.entry(bucket_ts).or_insert((0, 0));
            entry.1 += 1;
            if record.message_type() == MessageType::Error || record.has_error_field() {
                entry.0 += 1;
            }
        }

        let mut data: Vec<ErrorBucket> = totals
            .into_iter()
            .map(|(ts, (errors, total))| ErrorBucket {
                timestamp: ts,
                errors,
                total,
                error_rate: if total == 0 { 0.0 } else { (errors as f64 / total as f64) * 100.0 },
            })
            .collect();
        data.sort_by_key(|b| b.timestamp);

        Ok(ErrorTimelineResult { data })
    }
}

/// Round `ts` down to the start of its `bucket_minutes`-wide window, with
/// seconds/microseconds zeroed.
fn align_bucket(ts: DateTime<Utc>, bucket_minutes: i64) -> DateTime<Utc> {
    let truncated = ts
        .with_second(0)
        .unwrap()
        .with_nanosecond(0)
        .unwrap();
    if bucket_minutes <= 0 {
        return truncated;
    }
    let minute = truncated.minute() as i64;
    let offset = minute % bucket_minutes;
    truncated - Duration::minutes(offset)
}

fn percentage(count: u64, total: u64) -> f64 {
    if total == 0 {
        0.0
    } else {
        (count as f64 / total as f64) * 100.0
    }
}

/// Percentile convention: the p-th percentile of a sorted sample of size N
/// is the element at index `⌊p·N⌋`, clamped to `[0, N-1]`.
fn percentile_at(sorted: &[f64], p: f64) -> f64 {
    if sorted.is_empty() {
        return 0.0;
    }
    let n = sorted.len();
    let idx = ((p * n as f64).floor() as usize).min(n - 1);
    sorted[idx]
}

fn percentiles(samples: &[f64]) -> Percentiles {
    if samples.is_empty() {
        return Percentiles::default();
    }
    let mut sorted = samples.to_vec();
    sorted.sort_by(|a, b| a.partial_cmp(b).unwrap());
    let avg = sorted.iter().sum::<f64>() / sorted.len() as f64;

    Percentiles {
        min: sorted[0],
        avg,
        p50: percentile_at(&sorted, 0.5),
        p90: percentile_at(&sorted, 0.9),
        p95: percentile_at(&sorted, 0.95),
        p99: percentile_at(&sorted, 0.99),
        max: *sorted.last().unwrap(),
    }
}

fn histogram(samples: &[f64]) -> Vec<HistogramBucket> {
    let total = samples.len() as u64;
    HISTOGRAM_BOUNDS
        .iter()
        .map(|(lo, hi, label)| {
            let count = samples.iter().filter(|&&v| v >= *lo && v < *hi).count() as u64;
            HistogramBucket { range: label.to_string(), count, percentage: percentage(count, total) }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::{Direction, Peer};
    use tempfile::tempdir;

    fn store_with(records: Vec<MessageRecord>) -> (MessageStore, tempfile::TempDir) {
        let dir = tempdir().unwrap();
        let store = MessageStore::open(dir.path().join("t.db")).unwrap();
        for r in records {
            store.insert(&r).unwrap();
        }
        (store, dir)
    }

    fn record(id: &str, ts: DateTime<Utc>, message: &str) -> MessageRecord {
        MessageRecord {
            log_id: id.to_string(),
            timestamp: ts,
            src: Peer { ip: "a".into(), port: Some(1) },
            dst: Peer { ip: "b".into(), port: Some(2) },
            pid: None,
            direction: Direction::Outgoing,
            transport_type: TransportType::StreamableHttp,
            message: message.to_string(),
            metadata: None,
        }
    }

    #[test]
    fn test_empty_store_returns_zero_result_shapes() {
        let (store, _dir) = store_with(vec![]);
        let engine = AnalyticsEngine::new(&store);
        let window = Window::default();

        let perf = engine.performance(&window).unwrap();
        assert_eq!(perf.sample_count, 0);
        assert_eq!(perf.pending_requests, 0);

        let ts = engine.timeseries(5, &window).unwrap();
        assert!(ts.data.is_empty());

        let dist = engine.transport_distribution(&window).unwrap();
        assert_eq!(dist.total, 0);
    }

    #[test]
    fn test_scenario_5_performance_percentiles() {
        let base = Utc::now();
        let mut records = Vec::new();
        for (i, latency) in [10, 20, 30, 40, 50, 60, 70, 80, 90, 100].into_iter().enumerate() {
            let req_ts = base + Duration::seconds(i as i64 * 10);
            let resp_ts = req_ts + Duration::milliseconds(latency);
            records.push(record(
                &format!("req-{i}"),
                req_ts,
                &format!(r#"{{"jsonrpc":"2.0","method":"m","id":{i}}}"#),
            ));
            records.push(record(
                &format!("resp-{i}"),
                resp_ts,
                &format!(r#"{{"jsonrpc":"2.0","result":{{}},"id":{i}}}"#),
            ));
        }
        let (store, _dir) = store_with(records);
        let engine = AnalyticsEngine::new(&store);
        let perf = engine.performance(&Window::default()).unwrap();

        assert_eq!(perf.overall.min, 10.0);
        assert_eq!(perf.overall.p50, 60.0);
        assert_eq!(perf.overall.p90, 100.0);
        assert_eq!(perf.overall.p95, 100.0);
        assert_eq!(perf.overall.p99, 100.0);
        assert_eq!(perf.overall.max, 100.0);
        assert_eq!(perf.overall.avg, 55.0);

        let bucket = |label: &str| {
            perf.histogram.iter().find(|b| b.range == label).unwrap().count
        };
        assert_eq!(bucket("10-25"), 2);
        assert_eq!(bucket("25-50"), 2);
        assert_eq!(bucket("50-100"), 5);
        assert_eq!(bucket("100-250"), 1);
    }

    #[test]
    fn test_scenario_6_error_timeline() {
        let base = Utc::now().with_second(0).unwrap().with_nanosecond(0).unwrap();
        let mut records = Vec::new();
        for i in 0..20 {
            let is_error = i < 4;
            let msg = if is_error {
                format!(r#"{{"jsonrpc":"2.0","error":{{"code":-1,"message":"x"}},"id":{i}}}"#)
            } else {
                format!(r#"{{"jsonrpc":"2.0","result":{{}},"id":{i}}}"#)
            };
            records.push(record(&format!("id-{i}"), base + Duration::seconds(i), &msg));
        }
        let (store, _dir) = store_with(records);
        let engine = AnalyticsEngine::new(&store);
        let timeline = engine.error_timeline(5, &Window::default()).unwrap();

        assert_eq!(timeline.data.len(), 1);
        assert_eq!(timeline.data[0].errors, 4);
        assert_eq!(timeline.data[0].total, 20);
        assert_eq!(timeline.data[0].error_rate, 20.0);
    }

    #[test]
    fn test_pending_requests_counts_unmatched() {
        let base = Utc::now();
        let records = vec![record(
            "req-1",
            base,
            r#"{"jsonrpc":"2.0","method":"ping","id":1}"#,
        )];
        let (store, _dir) = store_with(records);
        let engine = AnalyticsEngine::new(&store);
        let perf = engine.performance(&Window::default()).unwrap();
        assert_eq!(perf.pending_requests, 1);
        assert_eq!(perf.sample_count, 0);
    }

    #[test]
    fn test_transport_distribution_percentages_sum_to_100() {
        let base = Utc::now();
        let records = vec![
            record("a", base, r#"{"jsonrpc":"2.0","method":"x","id":1}"#),
            record("b", base, r#"{"jsonrpc":"2.0","method":"y","id":2}"#),
        ];
        let (store, _dir) = store_with(records);
        let engine = AnalyticsEngine::new(&store);
        let dist = engine.transport_distribution(&Window::default()).unwrap();
        let sum: f64 = dist.transports.iter().map(|t| t.percentage).sum();
        assert!((sum - 100.0).abs() < 0.001);
    }

    #[test]
    fn test_method_frequency_sorted_descending() {
        let base = Utc::now();
        let records = vec![
            record("a", base, r#"{"jsonrpc":"2.0","method":"rare","id":1}"#),
            record("b", base, r#"{"jsonrpc":"2.0","method":"common","id":2}"#),
            record("c", base, r#"{"jsonrpc":"2.0","method":"common","id":3}"#),
        ];
        let (store, _dir) = store_with(records);
        let engine = AnalyticsEngine::new(&store);
        let freq = engine.method_frequency(10, &Window::default()).unwrap();
        assert_eq!(freq.methods[0].method, "common");
        assert_eq!(freq.methods[0].count, 2);
        assert_eq!(freq.total_unique_methods, 2);
    }
}
