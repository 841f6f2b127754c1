//! Load tool output parsing
//!
//! Parsing is line oriented and lenient: unrecognized output leaves the
//! corresponding metric at zero instead of failing the test.

use std::time::Duration;
use webbench_common::ToolKind;

/// Metrics extracted from one tool run
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ParsedMetrics {
    pub requests: u64,
    pub requests_per_sec: f64,
    pub latency_mean: Duration,
    pub latency_p50: Duration,
    pub latency_p90: Duration,
    pub latency_p99: Duration,
    pub max_latency: Duration,
    /// KB/s
    pub transfer_rate: f64,
    pub errors: u64,
    pub non_2xx: u64,
}

/// Parse output in the dialect of `kind`
pub fn parse_output(kind: ToolKind, output: &str) -> ParsedMetrics {
    match kind {
        ToolKind::Wrk => parse_wrk(output),
        ToolKind::Ab => parse_ab(output),
    }
}

/// Parse a latency such as `12.34ms`, `500us`, `1.5s` or a bare number of
/// milliseconds
pub fn parse_latency(input: &str) -> Option<Duration> {
    let (value, unit) = split_number(input)?;
    let unit_nanos = match unit {
        "" | "ms" => 1e6,
        "us" | "µs" => 1e3,
        "s" => 1e9,
        "m" => 60e9,
        _ => return None,
    };
    let nanos = (value * unit_nanos).round();
    if !nanos.is_finite() || nanos < 0.0 {
        return None;
    }
    Some(Duration::from_nanos(nanos as u64))
}

/// Parse a transfer size such as `6.01MB` into kilobytes
fn parse_size_kb(input: &str) -> Option<f64> {
    let (value, unit) = split_number(input)?;
    let factor = match unit.to_ascii_uppercase().as_str() {
        "B" | "" => 1.0 / 1024.0,
        "KB" => 1.0,
        "MB" => 1024.0,
        "GB" => 1024.0 * 1024.0,
        _ => return None,
    };
    Some(value * factor)
}

fn split_number(input: &str) -> Option<(f64, &str)> {
    let s = input.trim();
    let split = s
        .find(|c: char| !(c.is_ascii_digit() || c == '.'))
        .unwrap_or(s.len());
    let (number, unit) = s.split_at(split);
    let value: f64 = number.parse().ok()?;
    Some((value, unit.trim()))
}

fn field<T: std::str::FromStr>(fields: &[&str], idx: usize) -> Option<T> {
    fields.get(idx).and_then(|f| f.trim_end_matches(',').parse().ok())
}

fn set_percentile(metrics: &mut ParsedMetrics, percent: &str, value: Duration) {
    match percent {
        "50%" => metrics.latency_p50 = value,
        "90%" => metrics.latency_p90 = value,
        "99%" => metrics.latency_p99 = value,
        "100%" => metrics.max_latency = value,
        _ => {}
    }
}

fn is_percentile_row(fields: &[&str]) -> bool {
    fields
        .first()
        .map_or(false, |f| f.ends_with('%') && f[..f.len() - 1].parse::<f64>().is_ok())
}

/// Parse `wrk` output
pub fn parse_wrk(output: &str) -> ParsedMetrics {
    let mut metrics = ParsedMetrics::default();
    let mut in_distribution = false;

    for line in output.lines() {
        let trimmed = line.trim();
        let fields: Vec<&str> = trimmed.split_whitespace().collect();

        if in_distribution {
            if is_percentile_row(&fields) {
                if let Some(value) = fields.get(1).and_then(|v| parse_latency(v)) {
                    // wrk's 100% row is not printed; max comes from the stats table
                    if fields[0] != "100%" {
                        set_percentile(&mut metrics, fields[0], value);
                    }
                }
                continue;
            }
            in_distribution = false;
        }

        if trimmed.starts_with("Latency Distribution") {
            in_distribution = true;
        } else if trimmed.starts_with("Latency") {
            if let Some(mean) = fields.get(1).and_then(|v| parse_latency(v)) {
                metrics.latency_mean = mean;
            }
            if let Some(max) = fields.get(3).and_then(|v| parse_latency(v)) {
                metrics.max_latency = max;
            }
        } else if trimmed.starts_with("Requests/sec:") {
            metrics.requests_per_sec = field(&fields, 1).unwrap_or(0.0);
        } else if trimmed.starts_with("Transfer/sec:") {
            metrics.transfer_rate = fields.get(1).and_then(|v| parse_size_kb(v)).unwrap_or(0.0);
        } else if trimmed.starts_with("Socket errors:") {
            metrics.errors = fields
                .iter()
                .skip(2)
                .filter_map(|f| f.trim_end_matches(',').parse::<u64>().ok())
                .sum();
        } else if trimmed.starts_with("Non-2xx or 3xx responses:") {
            metrics.non_2xx = fields.last().and_then(|v| v.parse().ok()).unwrap_or(0);
        } else if trimmed.contains(" requests in ") {
            metrics.requests = field(&fields, 0).unwrap_or(0);
        }
    }

    metrics
}

/// Parse ApacheBench output
pub fn parse_ab(output: &str) -> ParsedMetrics {
    let mut metrics = ParsedMetrics::default();
    let mut mean_seen = false;
    let mut in_percentiles = false;

    for line in output.lines() {
        let trimmed = line.trim();
        let fields: Vec<&str> = trimmed.split_whitespace().collect();

        if in_percentiles {
            if is_percentile_row(&fields) {
                if let Some(value) = fields.get(1).and_then(|v| parse_latency(v)) {
                    set_percentile(&mut metrics, fields[0], value);
                }
                continue;
            }
            in_percentiles = false;
        }

        if trimmed.starts_with("Percentage of the requests served") {
            in_percentiles = true;
        } else if trimmed.starts_with("Requests per second:") {
            metrics.requests_per_sec = field(&fields, 3).unwrap_or(0.0);
        } else if trimmed.starts_with("Time per request:")
            && trimmed.contains("mean")
            && !trimmed.contains("across")
            && !mean_seen
        {
            if let Some(mean) = fields.get(3).and_then(|v| parse_latency(v)) {
                metrics.latency_mean = mean;
                mean_seen = true;
            }
        } else if trimmed.starts_with("Complete requests:") {
            metrics.requests = field(&fields, 2).unwrap_or(0);
        } else if trimmed.starts_with("Failed requests:") {
            metrics.errors = field(&fields, 2).unwrap_or(0);
        } else if trimmed.starts_with("Non-2xx responses:") {
            metrics.non_2xx = field(&fields, 2).unwrap_or(0);
        } else if trimmed.starts_with("Transfer rate:") {
            metrics.transfer_rate = field(&fields, 2).unwrap_or(0.0);
        }
    }

    metrics
}
