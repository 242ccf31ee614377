//! Writes analysis results to disk.
//!
//! Per base station a cleaned event table (`cleaned_<key>.csv`) and a window
//! table (`windows_<key>.csv`) are written, plus one `summary.json` for the
//! whole run.

use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use chrono_tz::Tz;
use census_core::error::Result;
use census_core::models::{CaptureEvent, CategoryCounts, CipherCategory, RunIssue};
use census_core::time_utils::format_in_timezone;
use serde::Serialize;
use tracing::{debug, info};

use crate::aggregator::Window;
use crate::analysis::{AnalysisMetadata, AnalysisResult};

pub const SUMMARY_FILE: &str = "summary.json";
pub const CLEANED_PREFIX: &str = "cleaned_";
pub const WINDOWS_PREFIX: &str = "windows_";
const UNRESOLVED_LABEL: &str = "unresolved";

const CLEANED_HEADER: &str = "timestamp,frame_number,algorithm_id,category,a5_1,a5_3,a5_4,unknown";
const WINDOWS_HEADER: &str = "window_start,window_end,total,a5_1,a5_3,a5_4,unknown,\
share_a5_1,share_a5_3,share_a5_4,share_unknown";

// ── Summary types ─────────────────────────────────────────────────────────────

#[derive(Debug, Serialize)]
struct EntitySummary<'a> {
    key: String,
    frequency: &'a str,
    provider: &'a str,
    provider_name: &'a str,
    lac: &'a str,
    sources: &'a [String],
    total_samples: u64,
    windows: usize,
    totals: CategoryCounts,
}

#[derive(Debug, Serialize)]
struct RunSummary<'a> {
    metadata: &'a AnalysisMetadata,
    display_timezone: String,
    entities: Vec<EntitySummary<'a>>,
    unresolved_sources: &'a [String],
    unresolved_events: usize,
    skipped: &'a [RunIssue],
}

// ── Public function ───────────────────────────────────────────────────────────

/// Write every artifact of `result` into `output_dir`, creating it if needed.
///
/// Returns the paths written, summary last.
pub fn export_analysis(result: &AnalysisResult, output_dir: &Path, tz: Tz) -> Result<Vec<PathBuf>> {
    fs::create_dir_all(output_dir)?;
    let mut written = Vec::new();

    for entity in &result.entities {
        let label = entity.key.to_string();

        let cleaned = output_dir.join(format!("{CLEANED_PREFIX}{label}.csv"));
        write_cleaned(&cleaned, &entity.events.events, tz)?;
        written.push(cleaned);

        let windows = output_dir.join(format!("{WINDOWS_PREFIX}{label}.csv"));
        write_windows(&windows, &entity.windows, tz)?;
        written.push(windows);

        debug!(
            "Exported {} events and {} windows for {}",
            entity.events.len(),
            entity.windows.len(),
            label
        );
    }

    if !result.unresolved.is_empty() {
        let cleaned = output_dir.join(format!("{CLEANED_PREFIX}{UNRESOLVED_LABEL}.csv"));
        write_cleaned(&cleaned, &result.unresolved.events, tz)?;
        written.push(cleaned);
    }

    let summary = output_dir.join(SUMMARY_FILE);
    write_summary(&summary, result, tz)?;
    written.push(summary);

    info!("Wrote {} files to {}", written.len(), output_dir.display());
    Ok(written)
}

/// Whether `file_name` is one of the files [`export_analysis`] writes.
pub fn is_export_artifact(file_name: &str) -> bool {
    file_name == SUMMARY_FILE
        || (file_name.ends_with(".csv")
            && (file_name.starts_with(CLEANED_PREFIX) || file_name.starts_with(WINDOWS_PREFIX)))
}

// ── Writers ───────────────────────────────────────────────────────────────────

fn write_cleaned(path: &Path, events: &[CaptureEvent], tz: Tz) -> Result<()> {
    let mut out = BufWriter::new(File::create(path)?);
    writeln!(out, "{CLEANED_HEADER}")?;
    for event in events {
        write!(
            out,
            "{},{},{},{}",
            format_in_timezone(event.timestamp, tz),
            event.frame_number,
            event.algorithm_id,
            event.category
        )?;
        for category in CipherCategory::ALL {
            write!(out, ",{}", u8::from(event.category == category))?;
        }
        writeln!(out)?;
    }
    out.flush()?;
    Ok(())
}

fn write_windows(path: &Path, windows: &[Window], tz: Tz) -> Result<()> {
    let mut out = BufWriter::new(File::create(path)?);
    writeln!(out, "{WINDOWS_HEADER}")?;
    for window in windows {
        write!(
            out,
            "{},{},{}",
            format_in_timezone(window.start, tz),
            format_in_timezone(window.end, tz),
            window.total()
        )?;
        for category in CipherCategory::ALL {
            write!(out, ",{}", window.counts.get(category))?;
        }
        for category in CipherCategory::ALL {
            write!(out, ",{}", format_share(window.share(category)))?;
        }
        writeln!(out)?;
    }
    out.flush()?;
    Ok(())
}

fn write_summary(path: &Path, result: &AnalysisResult, tz: Tz) -> Result<()> {
    let entities = result
        .entities
        .iter()
        .map(|e| EntitySummary {
            key: e.key.to_string(),
            frequency: &e.key.frequency,
            provider: &e.key.provider,
            provider_name: e.key.provider_name(),
            lac: &e.key.lac,
            sources: &e.sources,
            total_samples: e.totals.total(),
            windows: e.windows.len(),
            totals: e.totals,
        })
        .collect();

    let summary = RunSummary {
        metadata: &result.metadata,
        display_timezone: tz.name().to_string(),
        entities,
        unresolved_sources: &result.unresolved.sources,
        unresolved_events: result.unresolved.len(),
        skipped: &result.issues,
    };

    let mut out = BufWriter::new(File::create(path)?);
    serde_json::to_writer_pretty(&mut out, &summary)?;
    out.flush()?;
    Ok(())
}

/// `NaN` for empty windows, otherwise up to six decimals.
fn format_share(share: f64) -> String {
    if share.is_nan() {
        "NaN".to_string()
    } else {
        let text = format!("{share:.6}");
        text.trim_end_matches('0').trim_end_matches('.').to_string()
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregator::WindowAggregator;
    use crate::analysis::analyze_record_sets;
    use crate::reader::RawRecordSet;
    use census_core::models::RawRecord;
    use census_core::time_utils::TimestampNormalizer;
    use tempfile::TempDir;

    fn record(line: usize, algorithm_id: i64, time: &str) -> RawRecord {
        RawRecord {
            line,
            algorithm_id,
            frame_number: line as u64,
            timestamp: format!("Jun 4, 2024 {time} CEST"),
        }
    }

    fn sample_result() -> AnalysisResult {
        let sets = vec![
            RawRecordSet::new(
                "tshark_944.2M_262_2_0x10c3_0x23a1_1717511213.csv",
                vec![
                    record(2, 0, "10:00:00"),
                    record(3, 2, "10:03:00"),
                    record(4, 0, "10:09:00"),
                ],
            ),
            RawRecordSet::new("capture.csv", vec![record(2, 7, "10:00:00")]),
        ];
        analyze_record_sets(
            sets,
            &TimestampNormalizer::default(),
            &WindowAggregator::new(3).unwrap(),
        )
    }

    fn lines(path: &Path) -> Vec<String> {
        std::fs::read_to_string(path)
            .unwrap()
            .lines()
            .map(str::to_string)
            .collect()
    }

    // ── export_analysis ───────────────────────────────────────────────────────

    #[test]
    fn test_export_writes_expected_files() {
        let tmp = TempDir::new().unwrap();
        let out = tmp.path().join("out");
        let written = export_analysis(&sample_result(), &out, Tz::UTC).unwrap();

        let names: Vec<String> = written
            .iter()
            .map(|p| p.file_name().unwrap().to_string_lossy().into_owned())
            .collect();
        assert_eq!(
            names,
            vec![
                "cleaned_944.2M_2_0x10c3.csv",
                "windows_944.2M_2_0x10c3.csv",
                "cleaned_unresolved.csv",
                "summary.json",
            ]
        );
        assert!(written.iter().all(|p| p.exists()));
    }

    #[test]
    fn test_cleaned_table_indicator_columns() {
        let tmp = TempDir::new().unwrap();
        export_analysis(&sample_result(), tmp.path(), Tz::UTC).unwrap();

        let rows = lines(&tmp.path().join("cleaned_944.2M_2_0x10c3.csv"));
        assert_eq!(rows[0], CLEANED_HEADER);
        assert_eq!(rows.len(), 4);
        assert_eq!(rows[1], "2024-06-04T08:00:00+00:00,2,0,A5/1,1,0,0,0");
        assert_eq!(rows[2], "2024-06-04T08:03:00+00:00,3,2,A5/3,0,1,0,0");

        let unresolved = lines(&tmp.path().join("cleaned_unresolved.csv"));
        assert!(unresolved[1].ends_with(",7,unknown,0,0,0,1"));
    }

    #[test]
    fn test_window_table_keeps_empty_windows() {
        let tmp = TempDir::new().unwrap();
        export_analysis(&sample_result(), tmp.path(), Tz::UTC).unwrap();

        let rows = lines(&tmp.path().join("windows_944.2M_2_0x10c3.csv"));
        assert_eq!(rows[0], WINDOWS_HEADER);
        assert_eq!(rows.len(), 5);
        assert_eq!(
            rows[1],
            "2024-06-04T08:00:00+00:00,2024-06-04T08:03:00+00:00,1,1,0,0,0,1,0,0,0"
        );
        assert!(rows[3].contains(",0,0,0,0,0,NaN,NaN,NaN,NaN"));
    }

    #[test]
    fn test_display_timezone_applied() {
        let tmp = TempDir::new().unwrap();
        export_analysis(&sample_result(), tmp.path(), chrono_tz::Europe::Berlin).unwrap();
        let rows = lines(&tmp.path().join("cleaned_944.2M_2_0x10c3.csv"));
        assert!(rows[1].starts_with("2024-06-04T10:00:00+02:00"));
    }

    #[test]
    fn test_summary_contents() {
        let tmp = TempDir::new().unwrap();
        export_analysis(&sample_result(), tmp.path(), Tz::UTC).unwrap();

        let text = std::fs::read_to_string(tmp.path().join(SUMMARY_FILE)).unwrap();
        let json: serde_json::Value = serde_json::from_str(&text).unwrap();

        let entity = &json["entities"][0];
        assert_eq!(entity["key"], "944.2M_2_0x10c3");
        assert_eq!(entity["provider_name"], "O2");
        assert_eq!(entity["total_samples"], 3);
        assert_eq!(entity["totals"]["a5_1"], 2);
        assert_eq!(json["unresolved_sources"][0], "capture.csv");
        assert_eq!(json["skipped"][0]["kind"], "malformed_source_name");
        assert_eq!(json["display_timezone"], "UTC");
    }

    #[test]
    fn test_empty_result_writes_only_summary() {
        let tmp = TempDir::new().unwrap();
        let result = analyze_record_sets(
            Vec::new(),
            &TimestampNormalizer::default(),
            &WindowAggregator::new(3).unwrap(),
        );
        let written = export_analysis(&result, tmp.path(), Tz::UTC).unwrap();
        assert_eq!(written, vec![tmp.path().join(SUMMARY_FILE)]);
    }

    // ── is_export_artifact ────────────────────────────────────────────────────

    #[test]
    fn test_written_files_are_export_artifacts() {
        let tmp = TempDir::new().unwrap();
        let written = export_analysis(&sample_result(), tmp.path(), Tz::UTC).unwrap();
        for path in &written {
            let name = path.file_name().unwrap().to_string_lossy();
            assert!(is_export_artifact(&name), "{name} not recognised");
        }
    }

    #[test]
    fn test_capture_names_are_not_export_artifacts() {
        assert!(!is_export_artifact("tshark_944.2M_262_2_0x10c3_0x23a1_1717511213.csv"));
        assert!(!is_export_artifact("tshark_944.2M_262_2_0x10c3_0x23a1_1717511213.json"));
        assert!(!is_export_artifact("cleaned_notes.json"));
    }

    // ── format_share ──────────────────────────────────────────────────────────

    #[test]
    fn test_format_share() {
        assert_eq!(format_share(f64::NAN), "NaN");
        assert_eq!(format_share(1.0), "1");
        assert_eq!(format_share(0.0), "0");
        assert_eq!(format_share(0.25), "0.25");
        assert_eq!(format_share(1.0 / 3.0), "0.333333");
    }
}
