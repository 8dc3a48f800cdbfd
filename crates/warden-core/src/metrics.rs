//! Textfile metrics: render the exposition format, replace files atomically,
//! and read them back for status reporting.

use crate::error::{WardenError, WardenResult};
use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::fs;
use std::path::{Path, PathBuf};

pub const REPLICATION_STATUS: &str = "syncoid_replication_status";
pub const REPLICATION_LAST_SUCCESS: &str = "syncoid_replication_last_success_timestamp";
pub const REPLICATION_INFO: &str = "syncoid_replication_info";
pub const TARGET_REACHABLE: &str = "syncoid_target_reachable";
pub const REPLICATION_LAG: &str = "zfs_replication_lag_seconds";
pub const POOL_HEALTHY: &str = "zfs_pool_healthy";
pub const HOLDS_RELEASED: &str = "zfs_stale_holds_released";
pub const HOLDS_ACTIVE: &str = "zfs_holds_active";

/// Replication status gauge values.
pub const STATUS_FAILED: f64 = 0.0;
pub const STATUS_SUCCEEDED: f64 = 1.0;
pub const STATUS_RUNNING: f64 = 2.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetricKind {
    Gauge,
}

impl MetricKind {
    fn as_str(&self) -> &'static str {
        match self {
            MetricKind::Gauge => "gauge",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Sample {
    pub labels: Vec<(String, String)>,
    pub value: f64,
}

/// One metric family with its samples, in insertion order.
#[derive(Debug, Clone, PartialEq)]
pub struct MetricFamily {
    pub name: String,
    pub help: String,
    pub kind: MetricKind,
    pub samples: Vec<Sample>,
}

impl MetricFamily {
    pub fn gauge(name: &str, help: &str) -> Self {
        Self {
            name: name.to_string(),
            help: help.to_string(),
            kind: MetricKind::Gauge,
            samples: Vec::new(),
        }
    }

    pub fn sample(mut self, labels: &[(&str, &str)], value: f64) -> Self {
        self.push(labels, value);
        self
    }

    pub fn push(&mut self, labels: &[(&str, &str)], value: f64) {
        self.samples.push(Sample {
            labels: labels
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
            value,
        });
    }

    pub fn render(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "# HELP {} {}", self.name, self.help);
        let _ = writeln!(out, "# TYPE {} {}", self.name, self.kind.as_str());
        for sample in &self.samples {
            out.push_str(&self.name);
            if !sample.labels.is_empty() {
                out.push('{');
                for (idx, (key, value)) in sample.labels.iter().enumerate() {
                    if idx > 0 {
                        out.push(',');
                    }
                    let _ = write!(out, "{}=\"{}\"", key, escape_label_value(value));
                }
                out.push('}');
            }
            let _ = writeln!(out, " {}", format_value(sample.value));
        }
        out
    }
}

fn format_value(value: f64) -> String {
    if value.fract() == 0.0 && value.abs() < 1e15 {
        format!("{}", value as i64)
    } else {
        format!("{value}")
    }
}

fn escape_label_value(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for ch in value.chars() {
        match ch {
            '\\' => out.push_str("\\\\"),
            '"' => out.push_str("\\\""),
            '\n' => out.push_str("\\n"),
            other => out.push(other),
        }
    }
    out
}

/// Turn a dataset path into a filename-safe slug, escaped the way
/// `systemd-escape --path` does it.
///
/// `/` becomes `-` and any other byte outside `[A-Za-z0-9:_.]`, a literal
/// `-` included, becomes `\xNN`, so distinct paths never share a slug.
pub fn file_slug(subject: &str) -> String {
    let mut out = String::with_capacity(subject.len());
    for (idx, byte) in subject.bytes().enumerate() {
        match byte {
            b'/' => out.push('-'),
            b'.' if idx == 0 => {
                let _ = write!(out, "\\x{byte:02x}");
            }
            b'a'..=b'z' | b'A'..=b'Z' | b'0'..=b'9' | b':' | b'_' | b'.' => {
                out.push(char::from(byte))
            }
            _ => {
                let _ = write!(out, "\\x{byte:02x}");
            }
        }
    }
    out
}

/// Writes metric families into the node exporter textfile directory.
#[derive(Debug, Clone)]
pub struct TextfileWriter {
    dir: PathBuf,
}

impl TextfileWriter {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Replace `<stem>.prom` with `family`, via a temp file and rename.
    pub fn write(&self, stem: &str, family: &MetricFamily) -> WardenResult<PathBuf> {
        fs::create_dir_all(&self.dir)?;
        let path = self.dir.join(format!("{stem}.prom"));
        let tmp = self
            .dir
            .join(format!(".{stem}.prom.tmp.{}", std::process::id()));
        fs::write(&tmp, family.render())?;
        if let Err(err) = fs::rename(&tmp, &path) {
            let _ = fs::remove_file(&tmp);
            return Err(WardenError::Io(err));
        }
        Ok(path)
    }
}

/// A sample read back from an exposition file.
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedSample {
    pub name: String,
    pub labels: BTreeMap<String, String>,
    pub value: f64,
}

/// Parse exposition text, skipping comments and lines that do not parse.
pub fn parse_exposition(text: &str) -> Vec<ParsedSample> {
    text.lines().filter_map(parse_sample_line).collect()
}

fn parse_sample_line(line: &str) -> Option<ParsedSample> {
    let line = line.trim();
    if line.is_empty() || line.starts_with('#') {
        return None;
    }

    let (name, labels, rest) = match line.find('{') {
        Some(open) => {
            let close = line.rfind('}')?;
            if close < open {
                return None;
            }
            let labels = parse_labels(&line[open + 1..close])?;
            (&line[..open], labels, &line[close + 1..])
        }
        None => {
            let (name, rest) = line.split_once(char::is_whitespace)?;
            (name, BTreeMap::new(), rest)
        }
    };

    let value = rest.split_whitespace().next()?.parse::<f64>().ok()?;
    Some(ParsedSample {
        name: name.trim().to_string(),
        labels,
        value,
    })
}

fn parse_labels(body: &str) -> Option<BTreeMap<String, String>> {
    let mut labels = BTreeMap::new();
    let mut chars = body.chars().peekable();
    loop {
        while matches!(chars.peek(), Some(' ') | Some(',')) {
            chars.next();
        }
        if chars.peek().is_none() {
            break;
        }
        let mut key = String::new();
        for ch in chars.by_ref() {
            if ch == '=' {
                break;
            }
            key.push(ch);
        }
        if chars.next()? != '"' {
            return None;
        }
        let mut value = String::new();
        loop {
            match chars.next()? {
                '\\' => match chars.next()? {
                    'n' => value.push('\n'),
                    other => value.push(other),
                },
                '"' => break,
                other => value.push(other),
            }
        }
        labels.insert(key.trim().to_string(), value);
    }
    Some(labels)
}

/// Read every `*.prom` file in `dir`. A missing directory yields no samples.
pub fn read_textfile_dir(dir: &Path) -> WardenResult<Vec<ParsedSample>> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(err) => return Err(err.into()),
    };
    let mut paths: Vec<PathBuf> = entries
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|path| path.extension().and_then(|e| e.to_str()) == Some("prom"))
        .collect();
    paths.sort();

    let mut samples = Vec::new();
    for path in paths {
        samples.extend(parse_exposition(&fs::read_to_string(&path)?));
    }
    Ok(samples)
}
