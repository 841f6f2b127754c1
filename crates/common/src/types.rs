//! Core types for WebBench

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use crate::error::{Error, Result};

/// External load generation tool
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ToolKind {
    /// Connection/duration driven tool
    Wrk,
    /// Request-count driven tool
    Ab,
}

impl Default for ToolKind {
    fn default() -> Self {
        Self::Wrk
    }
}

impl ToolKind {
    /// Executable name looked up on PATH
    pub fn program(&self) -> &'static str {
        match self {
            ToolKind::Wrk => "wrk",
            ToolKind::Ab => "ab",
        }
    }
}

impl fmt::Display for ToolKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.program())
    }
}

impl FromStr for ToolKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "wrk" => Ok(ToolKind::Wrk),
            "ab" => Ok(ToolKind::Ab),
            other => Err(Error::InvalidConfig(format!(
                "tool must be 'wrk' or 'ab', got '{}'",
                other
            ))),
        }
    }
}

/// Status tag of a persisted run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    Completed,
}

impl Default for RunStatus {
    fn default() -> Self {
        Self::Running
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunStatus::Running => f.write_str("running"),
            RunStatus::Completed => f.write_str("completed"),
        }
    }
}

/// Outcome of a single load test
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestResult {
    /// Framework display name
    pub framework: String,
    /// Scenario display name
    pub scenario: String,
    pub requests: u64,
    pub connections: u32,
    #[serde(with = "duration_nanos")]
    pub duration: Duration,
    pub requests_per_sec: f64,
    #[serde(with = "duration_nanos")]
    pub latency_mean: Duration,
    #[serde(with = "duration_nanos", default)]
    pub latency_p50: Duration,
    #[serde(with = "duration_nanos", default)]
    pub latency_p90: Duration,
    #[serde(with = "duration_nanos", default)]
    pub latency_p99: Duration,
    #[serde(with = "duration_nanos", default)]
    pub max_latency: Duration,
    /// Transfer rate in KB/s
    #[serde(default)]
    pub transfer_rate: f64,
    #[serde(default)]
    pub errors: u64,
    #[serde(default)]
    pub non_2xx: u64,
    pub timestamp: DateTime<Utc>,
    pub batch: u32,
    pub retry: u32,
}

impl TestResult {
    /// Completion key of the cell that produced this result
    pub fn cell_key(&self) -> String {
        cell_key(&self.framework, &self.scenario, self.batch)
    }
}

/// Composite key identifying a (framework, scenario, batch) cell.
///
/// Built from display names so that renaming a config key does not
/// invalidate earlier progress.
pub fn cell_key(framework: &str, scenario: &str, batch: u32) -> String {
    format!("{}_{}_{}", framework, scenario, batch)
}

/// Parse a human duration such as `30s`, `500ms`, `2m` or `1h`.
///
/// A bare number is taken as seconds.
pub fn parse_duration_str(input: &str) -> Result<Duration> {
    let s = input.trim();
    if s.is_empty() {
        return Err(Error::InvalidDuration(input.to_string()));
    }

    let split = s
        .find(|c: char| !(c.is_ascii_digit() || c == '.'))
        .unwrap_or(s.len());
    let (number, unit) = s.split_at(split);
    let value: f64 = number
        .parse()
        .map_err(|_| Error::InvalidDuration(input.to_string()))?;
    if !value.is_finite() || value < 0.0 {
        return Err(Error::InvalidDuration(input.to_string()));
    }

    let seconds = match unit.trim() {
        "ms" => value / 1000.0,
        "" | "s" => value,
        "m" => value * 60.0,
        "h" => value * 3600.0,
        _ => return Err(Error::InvalidDuration(input.to_string())),
    };
    Duration::try_from_secs_f64(seconds).map_err(|_| Error::InvalidDuration(input.to_string()))
}

/// Serialize `Duration` as integer nanoseconds
pub(crate) mod duration_nanos {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(d: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(u64::try_from(d.as_nanos()).unwrap_or(u64::MAX))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let nanos = u64::deserialize(deserializer)?;
        Ok(Duration::from_nanos(nanos))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cell_key_uses_display_names() {
        assert_eq!(cell_key("Gin", "Simple GET", 2), "Gin_Simple GET_2");
    }

    #[test]
    fn test_tool_kind_from_str() {
        assert_eq!("wrk".parse::<ToolKind>().unwrap(), ToolKind::Wrk);
        assert_eq!("AB".parse::<ToolKind>().unwrap(), ToolKind::Ab);
        assert!("hey".parse::<ToolKind>().is_err());
    }

    #[test]
    fn test_parse_duration_str() {
        assert_eq!(parse_duration_str("30s").unwrap(), Duration::from_secs(30));
        assert_eq!(parse_duration_str("250ms").unwrap(), Duration::from_millis(250));
        assert_eq!(parse_duration_str("2m").unwrap(), Duration::from_secs(120));
        assert_eq!(parse_duration_str("1h").unwrap(), Duration::from_secs(3600));
        assert_eq!(parse_duration_str("5").unwrap(), Duration::from_secs(5));
        assert!(parse_duration_str("").is_err());
        assert!(parse_duration_str("fast").is_err());
        assert!(parse_duration_str("10d").is_err());
    }

    #[test]
    fn test_parse_duration_str_out_of_range() {
        assert!(matches!(
            parse_duration_str("99999999999999999999999h"),
            Err(Error::InvalidDuration(_))
        ));
        assert!(parse_duration_str("1e400").is_err());
    }

    #[test]
    fn test_result_json_uses_nanoseconds() {
        let result = TestResult {
            framework: "Gin".to_string(),
            scenario: "Ping".to_string(),
            requests: 0,
            connections: 8,
            duration: Duration::from_secs(1),
            requests_per_sec: 100.0,
            latency_mean: Duration::from_micros(1500),
            latency_p50: Duration::ZERO,
            latency_p90: Duration::ZERO,
            latency_p99: Duration::ZERO,
            max_latency: Duration::ZERO,
            transfer_rate: 0.0,
            errors: 0,
            non_2xx: 0,
            timestamp: Utc::now(),
            batch: 1,
            retry: 0,
        };

        let json = serde_json::to_value(&result).unwrap();
        assert_eq!(json["latency_mean"], 1_500_000);
        assert_eq!(json["duration"], 1_000_000_000u64);

        let back: TestResult = serde_json::from_value(json).unwrap();
        assert_eq!(back, result);
    }
}
