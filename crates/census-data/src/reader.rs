//! Capture file discovery and loading.
//!
//! Reads the records written by the frame extractor, either tshark `-T ek`
//! JSON lines or a CSV export with the same three fields, and turns them into
//! [`RawRecordSet`]s. Problems with single lines are collected as
//! [`RunIssue`]s; the remaining lines are still returned.

use std::io::BufRead;
use std::path::{Path, PathBuf};

use census_core::error::CensusError;
use census_core::models::{RawRecord, RunIssue};
use census_core::settings::AnalysisInput;
use serde_json::Value;
use tracing::{debug, warn};

use crate::export::is_export_artifact;

/// File extensions recognised as capture output.
pub const CAPTURE_EXTENSIONS: &[&str] = &["csv", "json", "jsonl", "ek"];

const ALGORITHM_FIELDS: &[&str] = &[
    "gsm_a.rr.algorithm_identifier",
    "gsm_a_rr_algorithm_identifier",
    "algorithm",
];
const FRAME_NUMBER_FIELDS: &[&str] = &["frame.number", "frame_number"];
const FRAME_TIME_FIELDS: &[&str] = &["frame.time", "frame_time", "timestamp"];

// ── Public types ──────────────────────────────────────────────────────────────

/// All records read from one capture source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawRecordSet {
    /// File name of the source; the entity key is resolved from it.
    pub source_name: String,
    pub records: Vec<RawRecord>,
}

impl RawRecordSet {
    pub fn new(source_name: impl Into<String>, records: Vec<RawRecord>) -> Self {
        Self {
            source_name: source_name.into(),
            records,
        }
    }
}

/// On-disk layout of a capture file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordFormat {
    /// tshark `-T ek` output, one JSON document per line.
    EkJson,
    /// Delimited text with a header row.
    Csv,
}

impl RecordFormat {
    /// Choose the format from the file extension.
    pub fn detect(path: &Path) -> Self {
        match path.extension().and_then(|e| e.to_str()) {
            Some(ext) if ext.eq_ignore_ascii_case("csv") => RecordFormat::Csv,
            _ => RecordFormat::EkJson,
        }
    }
}

// ── Public API ────────────────────────────────────────────────────────────────

/// Find capture files directly inside `dir`, sorted by path.
pub fn find_capture_files(dir: &Path) -> Vec<PathBuf> {
    if !dir.exists() {
        warn!("Capture directory does not exist: {}", dir.display());
        return Vec::new();
    }

    let mut files: Vec<PathBuf> = walkdir::WalkDir::new(dir)
        .max_depth(1)
        .follow_links(true)
        .into_iter()
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_type().is_file() && is_capture_file(entry.path()))
        .map(|entry| entry.into_path())
        .collect();

    files.sort();
    files
}

/// Load every record set named by `input`.
///
/// Unreadable files are reported as issues and skipped.
pub fn load_capture_input(input: &AnalysisInput) -> (Vec<RawRecordSet>, Vec<RunIssue>) {
    let files = match input {
        AnalysisInput::Directory(dir) => find_capture_files(dir),
        AnalysisInput::File(file) => vec![file.clone()],
    };

    let mut sets = Vec::with_capacity(files.len());
    let mut issues = Vec::new();

    for path in &files {
        match load_record_set(path) {
            Ok((set, file_issues)) => {
                sets.push(set);
                issues.extend(file_issues);
            }
            Err(e) => {
                warn!("{}", e);
                issues.push(RunIssue::from_error(source_name_of(path), None, &e));
            }
        }
    }

    debug!(
        "Loaded {} record sets ({} issues) from {} files",
        sets.len(),
        issues.len(),
        files.len()
    );

    (sets, issues)
}

/// Read one capture file.
///
/// Fails only when the file cannot be opened; malformed lines are returned
/// as issues alongside the records that did parse.
pub fn load_record_set(path: &Path) -> Result<(RawRecordSet, Vec<RunIssue>), CensusError> {
    let file = std::fs::File::open(path).map_err(|source| CensusError::FileRead {
        path: path.to_path_buf(),
        source,
    })?;
    let reader = std::io::BufReader::new(file);
    let source = source_name_of(path);

    let (records, issues) = match RecordFormat::detect(path) {
        RecordFormat::Csv => parse_csv(&source, reader),
        RecordFormat::EkJson => parse_ek_lines(&source, reader),
    };

    debug!(
        "File {}: {} records, {} skipped",
        path.display(),
        records.len(),
        issues.len()
    );

    Ok((RawRecordSet::new(source, records), issues))
}

/// Parse tshark `-T ek` output.
///
/// Bulk `{"index": ...}` lines are skipped. Field values may be scalars or
/// the single-element arrays tshark emits for `-e` fields.
pub fn parse_ek_lines(source: &str, reader: impl BufRead) -> (Vec<RawRecord>, Vec<RunIssue>) {
    let mut records = Vec::new();
    let mut issues = Vec::new();

    for (idx, line_result) in reader.lines().enumerate() {
        let line_no = idx + 1;
        let line = match line_result {
            Ok(l) => l,
            Err(e) => {
                issues.push(RunIssue::from_error(source, Some(line_no), &e.into()));
                continue;
            }
        };
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }

        let data: Value = match serde_json::from_str(trimmed) {
            Ok(v) => v,
            Err(e) => {
                issues.push(RunIssue::from_error(source, Some(line_no), &e.into()));
                continue;
            }
        };

        if data.get("index").is_some() && data.get("layers").is_none() {
            continue;
        }

        let fields = data.get("layers").unwrap_or(&data);
        match record_from_json(fields, line_no) {
            Ok(record) => records.push(record),
            Err(e) => issues.push(RunIssue::from_error(source, Some(line_no), &e)),
        }
    }

    (records, issues)
}

/// Parse CSV with a header naming the three capture fields (in any order).
pub fn parse_csv(source: &str, reader: impl BufRead) -> (Vec<RawRecord>, Vec<RunIssue>) {
    let mut records = Vec::new();
    let mut issues = Vec::new();
    let mut columns: Option<CsvColumns> = None;

    for (idx, line_result) in reader.lines().enumerate() {
        let line_no = idx + 1;
        let line = match line_result {
            Ok(l) => l,
            Err(e) => {
                issues.push(RunIssue::from_error(source, Some(line_no), &e.into()));
                continue;
            }
        };
        if line.trim().is_empty() {
            continue;
        }
        let cells = split_csv_line(&line);

        let cols = match columns {
            Some(c) => c,
            None => {
                match CsvColumns::from_header(&cells) {
                    Ok(c) => columns = Some(c),
                    Err(reason) => {
                        let err = CensusError::MalformedRecord {
                            line: line_no,
                            reason,
                        };
                        issues.push(RunIssue::from_error(source, Some(line_no), &err));
                        return (records, issues);
                    }
                }
                continue;
            }
        };

        match cols.record(&cells, line_no) {
            Ok(record) => records.push(record),
            Err(e) => issues.push(RunIssue::from_error(source, Some(line_no), &e)),
        }
    }

    (records, issues)
}

// ── Internal helpers ──────────────────────────────────────────────────────────

/// Capture extension, and not a file this crate exported itself.
fn is_capture_file(path: &Path) -> bool {
    let known_extension = path
        .extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| {
            CAPTURE_EXTENSIONS
                .iter()
                .any(|known| ext.eq_ignore_ascii_case(known))
        })
        .unwrap_or(false);
    let exported = path
        .file_name()
        .and_then(|name| name.to_str())
        .map(is_export_artifact)
        .unwrap_or(false);
    known_extension && !exported
}

fn source_name_of(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| path.display().to_string())
}

fn malformed(line: usize, reason: impl Into<String>) -> CensusError {
    CensusError::MalformedRecord {
        line,
        reason: reason.into(),
    }
}

/// First present field among `names`, unwrapping tshark's one-element arrays.
fn json_field<'a>(fields: &'a Value, names: &[&str]) -> Option<&'a Value> {
    names.iter().find_map(|name| {
        let value = fields.get(*name)?;
        match value {
            Value::Array(items) => items.first(),
            Value::Null => None,
            other => Some(other),
        }
    })
}

fn json_text(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn record_from_json(fields: &Value, line: usize) -> Result<RawRecord, CensusError> {
    let algorithm = json_field(fields, ALGORITHM_FIELDS)
        .and_then(json_text)
        .ok_or_else(|| malformed(line, "missing gsm_a.rr.algorithm_identifier"))?;
    let frame = json_field(fields, FRAME_NUMBER_FIELDS)
        .and_then(json_text)
        .ok_or_else(|| malformed(line, "missing frame.number"))?;
    let timestamp = json_field(fields, FRAME_TIME_FIELDS)
        .and_then(json_text)
        .ok_or_else(|| malformed(line, "missing frame.time"))?;

    Ok(RawRecord {
        line,
        algorithm_id: parse_integer(&algorithm)
            .ok_or_else(|| malformed(line, format!("bad algorithm identifier {algorithm:?}")))?,
        frame_number: parse_integer(&frame)
            .and_then(|n| u64::try_from(n).ok())
            .ok_or_else(|| malformed(line, format!("bad frame number {frame:?}")))?,
        timestamp,
    })
}

/// Parse an integer, also accepting integral floats such as `"2.0"`.
fn parse_integer(text: &str) -> Option<i64> {
    let text = text.trim();
    if let Ok(n) = text.parse::<i64>() {
        return Some(n);
    }
    let f = text.parse::<f64>().ok()?;
    (f.is_finite() && f.fract() == 0.0).then_some(f as i64)
}

/// Column positions of the capture fields in a CSV header.
#[derive(Debug, Clone, Copy)]
struct CsvColumns {
    algorithm: usize,
    frame_number: usize,
    frame_time: usize,
}

impl CsvColumns {
    fn from_header(cells: &[String]) -> Result<Self, String> {
        let find = |names: &[&str]| {
            cells
                .iter()
                .position(|cell| names.iter().any(|n| cell.trim() == *n))
        };

        Ok(Self {
            algorithm: find(ALGORITHM_FIELDS)
                .ok_or("header lacks gsm_a.rr.algorithm_identifier column")?,
            frame_number: find(FRAME_NUMBER_FIELDS).ok_or("header lacks frame.number column")?,
            frame_time: find(FRAME_TIME_FIELDS).ok_or("header lacks frame.time column")?,
        })
    }

    fn record(&self, cells: &[String], line: usize) -> Result<RawRecord, CensusError> {
        let cell = |idx: usize, what: &str| {
            cells
                .get(idx)
                .map(|c| c.trim())
                .filter(|c| !c.is_empty())
                .ok_or_else(|| malformed(line, format!("missing {what}")))
        };

        let algorithm = cell(self.algorithm, "gsm_a.rr.algorithm_identifier")?;
        let frame = cell(self.frame_number, "frame.number")?;
        let timestamp = cell(self.frame_time, "frame.time")?;

        Ok(RawRecord {
            line,
            algorithm_id: parse_integer(algorithm)
                .ok_or_else(|| malformed(line, format!("bad algorithm identifier {algorithm:?}")))?,
            frame_number: parse_integer(frame)
                .and_then(|n| u64::try_from(n).ok())
                .ok_or_else(|| malformed(line, format!("bad frame number {frame:?}")))?,
            timestamp: timestamp.to_string(),
        })
    }
}

/// Split one CSV line on commas, honouring double quotes (`""` escapes a
/// quote inside a quoted field). `frame.time` contains a comma, so exports
/// always quote it.
fn split_csv_line(line: &str) -> Vec<String> {
    let mut cells = Vec::new();
    let mut current = String::new();
    let mut in_quotes = false;
    let mut chars = line.chars().peekable();

    while let Some(c) = chars.next() {
        match c {
            '"' if in_quotes && chars.peek() == Some(&'"') => {
                current.push('"');
                chars.next();
            }
            '"' => in_quotes = !in_quotes,
            ',' if !in_quotes => cells.push(std::mem::take(&mut current)),
            other => current.push(other),
        }
    }
    cells.push(current);
    cells
}

// ── Tests ─────────────────────────────────────────────────────────────────────
