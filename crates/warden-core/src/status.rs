//! Replication status report assembled from the textfile directory.

use crate::metrics::{self, ParsedSample};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt::Write as _;

/// Classification of one replication job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum JobStatus {
    Ok,
    Running,
    Stale,
    Failed,
    Unknown,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Ok => "OK",
            JobStatus::Running => "RUNNING",
            JobStatus::Stale => "STALE",
            JobStatus::Failed => "FAILED",
            JobStatus::Unknown => "UNKNOWN",
        }
    }
}

/// One job as `warden status` shows it.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StatusRow {
    pub dataset: String,
    pub unit: String,
    pub target_host: String,
    pub target_name: String,
    pub target_location: String,
    /// Raw status gauge, absent when no status file exists yet.
    pub status: Option<i64>,
    pub status_text: JobStatus,
    /// Unix seconds.
    pub last_success: Option<f64>,
    pub details: String,
}

/// Per-status job counts.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StatusSummary {
    pub total: usize,
    pub ok: usize,
    pub running: usize,
    pub stale: usize,
    pub failed: usize,
    pub healthy: usize,
}

/// The `--json` document.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StatusReport {
    pub stale_threshold_hours: u64,
    pub jobs: Vec<StatusRow>,
    pub summary: StatusSummary,
}

/// Case-insensitive substring filters.
#[derive(Debug, Clone, Default)]
pub struct StatusFilter {
    pub dataset: Option<String>,
    pub target: Option<String>,
}

impl StatusFilter {
    fn matches(&self, row: &StatusRow) -> bool {
        let contains = |haystack: &str, needle: &Option<String>| match needle {
            Some(needle) => haystack.to_lowercase().contains(&needle.to_lowercase()),
            None => true,
        };
        contains(&row.dataset, &self.dataset) && contains(&row.target_host, &self.target)
    }
}

/// Classify one job from its status gauge and last success time.
pub fn classify(
    status: Option<i64>,
    last_success: Option<f64>,
    now: DateTime<Utc>,
    threshold_hours: u64,
) -> (JobStatus, String) {
    let stale = |ts: f64| (now.timestamp() as f64 - ts) / 3600.0 > threshold_hours as f64;
    match status {
        Some(2) => (JobStatus::Running, "Replication in progress".into()),
        Some(0) => (JobStatus::Failed, "Last run failed".into()),
        Some(1) => match last_success {
            Some(ts) if stale(ts) => (
                JobStatus::Stale,
                format!("Last success > {threshold_hours}h ago"),
            ),
            Some(_) => (JobStatus::Ok, "Healthy".into()),
            None => (JobStatus::Ok, "Healthy (no timestamp)".into()),
        },
        _ => match last_success {
            Some(ts) if stale(ts) => (
                JobStatus::Stale,
                format!("Last success > {threshold_hours}h ago"),
            ),
            _ => (JobStatus::Unknown, "No status metric".into()),
        },
    }
}

/// Join info, status and last-success samples by dataset and classify them.
pub fn build_report(
    samples: &[ParsedSample],
    filter: &StatusFilter,
    now: DateTime<Utc>,
    threshold_hours: u64,
) -> StatusReport {
    let label = |sample: &ParsedSample, key: &str| sample.labels.get(key).cloned().unwrap_or_default();

    let mut jobs: BTreeMap<String, StatusRow> = BTreeMap::new();
    for sample in samples.iter().filter(|s| s.name == metrics::REPLICATION_INFO) {
        let dataset = label(sample, "dataset");
        if dataset.is_empty() {
            continue;
        }
        jobs.insert(
            dataset.clone(),
            StatusRow {
                dataset,
                unit: label(sample, "unit"),
                target_host: label(sample, "target_host"),
                target_name: label(sample, "target_name"),
                target_location: label(sample, "target_location"),
                status: None,
                status_text: JobStatus::Unknown,
                last_success: None,
                details: String::new(),
            },
        );
    }

    for sample in samples {
        let Some(row) = sample
            .labels
            .get("dataset")
            .and_then(|dataset| jobs.get_mut(dataset))
        else {
            continue;
        };
        match sample.name.as_str() {
            metrics::REPLICATION_STATUS => row.status = Some(sample.value as i64),
            metrics::REPLICATION_LAST_SUCCESS => row.last_success = Some(sample.value),
            _ => {}
        }
    }

    let mut summary = StatusSummary::default();
    let mut rows = Vec::new();
    for mut row in jobs.into_values() {
        if !filter.matches(&row) {
            continue;
        }
        let (status, details) = classify(row.status, row.last_success, now, threshold_hours);
        row.status_text = status;
        row.details = details;
        match status {
            JobStatus::Ok => summary.ok += 1,
            JobStatus::Running => summary.running += 1,
            JobStatus::Stale => summary.stale += 1,
            JobStatus::Failed => summary.failed += 1,
            JobStatus::Unknown => {}
        }
        rows.push(row);
    }
    summary.total = rows.len();
    summary.healthy = summary.ok + summary.running;

    StatusReport {
        stale_threshold_hours: threshold_hours,
        jobs: rows,
        summary,
    }
}

/// Human age of a unix timestamp, `Never` when absent.
pub fn time_ago(ts: Option<f64>, now: DateTime<Utc>) -> String {
    let Some(ts) = ts else {
        return "Never".to_string();
    };
    let diff = now.timestamp() as f64 - ts;
    if diff < 0.0 {
        "In future".to_string()
    } else if diff < 60.0 {
        "Just now".to_string()
    } else if diff < 3600.0 {
        format!("{}m ago", (diff / 60.0) as i64)
    } else if diff < 86400.0 {
        format!("{}h ago", (diff / 3600.0) as i64)
    } else {
        format!("{}d ago", (diff / 86400.0) as i64)
    }
}

fn target_display(row: &StatusRow) -> String {
    if !row.target_name.is_empty() && !row.target_location.is_empty() {
        format!("{} ({})", row.target_name, row.target_location)
    } else if !row.target_host.is_empty() {
        row.target_host.clone()
    } else {
        "unknown".to_string()
    }
}

/// Plain-text table with a summary footer.
pub fn render_table(report: &StatusReport, now: DateTime<Utc>) -> String {
    let headers = ["DATASET", "TARGET", "STATUS", "LAST SUCCESS", "DETAILS"];
    let rows: Vec<[String; 5]> = report
        .jobs
        .iter()
        .map(|row| {
            [
                row.dataset.clone(),
                target_display(row),
                row.status_text.as_str().to_string(),
                time_ago(row.last_success, now),
                row.details.clone(),
            ]
        })
        .collect();

    let mut widths = headers.map(str::len);
    for row in &rows {
        for (width, cell) in widths.iter_mut().zip(row.iter()) {
            *width = (*width).max(cell.len());
        }
    }

    let mut out = String::new();
    let mut line = |cells: &[&str]| {
        let mut text = String::new();
        for (idx, cell) in cells.iter().enumerate() {
            if idx > 0 {
                text.push_str("  ");
            }
            let _ = write!(text, "{:<width$}", cell, width = widths[idx]);
        }
        out.push_str(text.trim_end());
        out.push('\n');
    };
    line(&headers);
    for row in &rows {
        let cells: Vec<&str> = row.iter().map(String::as_str).collect();
        line(&cells);
    }

    let s = &report.summary;
    let _ = writeln!(
        out,
        "\nTotal: {} | OK: {} | Running: {} | Stale: {} | Failed: {}",
        s.total, s.ok, s.running, s.stale, s.failed
    );
    let _ = writeln!(out, "Stale threshold: {} hours", report.stale_threshold_hours);
    out
}
