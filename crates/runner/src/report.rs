//! Result artifacts: CSV summaries and the Markdown report

use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::path::{Path, PathBuf};
use tracing::{debug, info};
use webbench_common::{BenchConfig, TestResult};

use crate::error::Result;

/// Aggregate summary file name inside a results directory
pub const SUMMARY_FILE: &str = "summary.csv";

/// Directory holding per-framework summaries
pub const PARTS_DIR: &str = "parts";

const COLUMNS: [&str; 17] = [
    "Framework",
    "Scenario",
    "Batch",
    "Retry",
    "Requests",
    "Connections",
    "Duration",
    "RequestsPerSec",
    "LatencyMean",
    "LatencyP50",
    "LatencyP90",
    "LatencyP99",
    "MaxLatency",
    "TransferRate",
    "Errors",
    "Non2XX",
    "Timestamp",
];

fn row(result: &TestResult) -> Vec<String> {
    vec![
        result.framework.clone(),
        result.scenario.clone(),
        result.batch.to_string(),
        result.retry.to_string(),
        result.requests.to_string(),
        result.connections.to_string(),
        format!("{:?}", result.duration),
        format!("{:.2}", result.requests_per_sec),
        format!("{:?}", result.latency_mean),
        format!("{:?}", result.latency_p50),
        format!("{:?}", result.latency_p90),
        format!("{:?}", result.latency_p99),
        format!("{:?}", result.max_latency),
        format!("{:.2}", result.transfer_rate),
        result.errors.to_string(),
        result.non_2xx.to_string(),
        result.timestamp.to_rfc3339(),
    ]
}

/// Write every result to one CSV file, replacing any previous content
pub fn write_summary_csv(path: &Path, results: &[TestResult]) -> Result<()> {
    let mut writer = csv::Writer::from_path(path)?;
    writer.write_record(COLUMNS)?;
    for result in results {
        writer.write_record(row(result))?;
    }
    writer.flush()?;
    debug!("Wrote {} rows to {}", results.len(), path.display());
    Ok(())
}

/// Write the results of one framework (by display name), without the
/// framework column. Returns the number of rows written.
pub fn write_framework_csv(path: &Path, framework: &str, results: &[TestResult]) -> Result<usize> {
    let mut writer = csv::Writer::from_path(path)?;
    writer.write_record(&COLUMNS[1..])?;
    let mut rows = 0;
    for result in results.iter().filter(|r| r.framework == framework) {
        writer.write_record(&row(result)[1..])?;
        rows += 1;
    }
    writer.flush()?;
    Ok(rows)
}

/// Write the aggregate summary and one `parts/summary_<key>.csv` per framework
pub fn save_results(results_dir: &Path, config: &BenchConfig, results: &[TestResult]) -> Result<()> {
    write_summary_csv(&results_dir.join(SUMMARY_FILE), results)?;

    let parts = results_dir.join(PARTS_DIR);
    std::fs::create_dir_all(&parts)?;
    for (key, framework) in &config.frameworks {
        let path = parts.join(format!("summary_{}.csv", key));
        let rows = write_framework_csv(&path, &framework.name, results)?;
        debug!("Wrote {} rows for {} to {}", rows, framework.name, path.display());
    }

    info!(
        "Saved {} results to {}",
        results.len(),
        results_dir.join(SUMMARY_FILE).display()
    );
    Ok(())
}

/// Remove summaries left by an earlier, finished run in the same directory
pub fn clear_stale_artifacts(results_dir: &Path) -> Result<()> {
    match std::fs::remove_file(results_dir.join(SUMMARY_FILE)) {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => return Err(e.into()),
    }

    let parts = results_dir.join(PARTS_DIR);
    match std::fs::remove_dir_all(&parts) {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => return Err(e.into()),
    }
    std::fs::create_dir_all(&parts)?;
    debug!("Cleared stale results in {}", results_dir.display());
    Ok(())
}

/// Produces a derived artifact from the final results.
///
/// Generation is best effort: callers log failures and carry on.
pub trait ReportGenerator: Send + Sync {
    fn name(&self) -> &str;

    /// Generate the artifact, returning where it was written
    fn try_generate(&self, results_dir: &Path, results: &[TestResult]) -> Result<PathBuf>;
}

const DEFAULT_TEMPLATE: &str = "\
# Benchmark Results {{DATE}}

Total tests: {{TOTAL_TESTS}}

## Overall Ranking

{{OVERALL_RANKING_TABLE}}

## Per-Scenario Performance
{{PER_SCENARIO_TABLES}}
";

/// Renders `README.md` with ranking tables
#[derive(Debug, Clone, Default)]
pub struct MarkdownReport {
    template: Option<PathBuf>,
}

impl MarkdownReport {
    /// Use `template` when given, the built-in layout otherwise
    pub fn new(template: Option<PathBuf>) -> Self {
        Self { template }
    }

    pub fn render(&self, date: &str, results: &[TestResult]) -> Result<String> {
        let template = match &self.template {
            Some(path) => std::fs::read_to_string(path)?,
            None => DEFAULT_TEMPLATE.to_string(),
        };

        Ok(template
            .replace("{{DATE}}", date)
            .replace("{{TOTAL_TESTS}}", &results.len().to_string())
            .replace("{{OVERALL_RANKING_TABLE}}", &overall_ranking_table(results))
            .replace("{{PER_SCENARIO_TABLES}}", &per_scenario_tables(results)))
    }
}

impl ReportGenerator for MarkdownReport {
    fn name(&self) -> &str {
        "README"
    }

    fn try_generate(&self, results_dir: &Path, results: &[TestResult]) -> Result<PathBuf> {
        let date = results_dir
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let content = self.render(&date, results)?;

        let path = results_dir.join("README.md");
        std::fs::write(&path, content)?;
        Ok(path)
    }
}

struct Ranking<'a> {
    framework: &'a str,
    avg: f64,
    min: f64,
    max: f64,
    tests: usize,
}

/// Average RPS per framework, best first
fn rank<'a, I>(results: I) -> Vec<Ranking<'a>>
where
    I: IntoIterator<Item = &'a TestResult>,
{
    let mut grouped: BTreeMap<&str, Vec<f64>> = BTreeMap::new();
    for result in results {
        grouped
            .entry(result.framework.as_str())
            .or_default()
            .push(result.requests_per_sec);
    }

    let mut rankings: Vec<Ranking<'a>> = grouped
        .into_iter()
        .map(|(framework, rps)| Ranking {
            framework,
            avg: rps.iter().sum::<f64>() / rps.len() as f64,
            min: rps.iter().copied().fold(f64::INFINITY, f64::min),
            max: rps.iter().copied().fold(f64::NEG_INFINITY, f64::max),
            tests: rps.len(),
        })
        .collect();
    rankings.sort_by(|a, b| b.avg.total_cmp(&a.avg));
    rankings
}

fn medal(rank: usize) -> String {
    match rank {
        1 => "🥇".to_string(),
        2 => "🥈".to_string(),
        3 => "🥉".to_string(),
        n => format!("#{}", n),
    }
}

fn performance_label(rank: usize) -> &'static str {
    match rank {
        1 => "🔥 **Excellent**",
        2 => "⚡ **Very Good**",
        3 => "✅ **Good**",
        _ => "📊 **Baseline**",
    }
}

/// Format with thousands separators, no decimals
pub fn format_number(n: f64) -> String {
    let digits = format!("{:.0}", n.abs());
    let mut out = String::with_capacity(digits.len() + digits.len() / 3 + 1);
    if n < 0.0 && digits != "0" {
        out.push('-');
    }
    for (i, c) in digits.chars().enumerate() {
        if i > 0 && (digits.len() - i) % 3 == 0 {
            out.push(',');
        }
        out.push(c);
    }
    out
}

fn overall_ranking_table(results: &[TestResult]) -> String {
    if results.is_empty() {
        return "*No results available*".to_string();
    }

    let mut table = String::new();
    table.push_str("| 🏆 Rank | Framework | Avg RPS | Min RPS | Max RPS | Tests | Performance |\n");
    table.push_str("|---------|-----------|---------|---------|---------|-------|-------------|\n");
    for (i, r) in rank(results).iter().enumerate() {
        let _ = writeln!(
            table,
            "| {} | **{}** | {} | {} | {} | {} | {} |",
            medal(i + 1),
            r.framework,
            format_number(r.avg),
            format_number(r.min),
            format_number(r.max),
            r.tests,
            performance_label(i + 1)
        );
    }
    table
}

fn per_scenario_tables(results: &[TestResult]) -> String {
    if results.is_empty() {
        return "*No results available*".to_string();
    }

    let mut by_scenario: BTreeMap<&str, Vec<&TestResult>> = BTreeMap::new();
    for result in results {
        by_scenario
            .entry(result.scenario.as_str())
            .or_default()
            .push(result);
    }

    let mut out = String::new();
    for (scenario, scenario_results) in by_scenario {
        let rankings = rank(scenario_results);
        let leader = rankings.first().map_or(0.0, |r| r.avg);

        let _ = write!(out, "\n#### 📊 {} Performance\n\n", scenario);
        out.push_str("| 🏆 Rank | Framework | Avg RPS | Performance vs Leader |\n");
        out.push_str("|---------|-----------|---------|----------------------|\n");
        for (i, r) in rankings.iter().enumerate() {
            let vs_leader = if i == 0 {
                "**100%** (Leader)".to_string()
            } else if leader > 0.0 {
                format!("{:.1}% of leader", r.avg / leader * 100.0)
            } else {
                "N/A".to_string()
            };
            let _ = writeln!(
                out,
                "| {} | **{}** | {} | {} |",
                medal(i + 1),
                r.framework,
                format_number(r.avg),
                vs_leader
            );
        }
        out.push('\n');
    }
    out
}
