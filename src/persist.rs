//! Durable storage for aggregated sample rows.
//!
//! Both output formats share one schema: a four column header, data
//! rows, and on the final flush a trailing Command/Source block.
//! Appends are idempotent about the header so a file survives being
//! resumed across windows and restarts.

use std::io;
use std::path::{Path, PathBuf};

use chrono::Local;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::monitor::session::AggregateRow;

mod csv;
pub mod timefmt;
mod xlsx;

pub const HEADER: [&str; 4] = ["Time (H:MM:SS.ms)", "CPU (%)", "RAM (MB)", "Source"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    #[default]
    Csv,
    Xlsx,
}

impl OutputFormat {
    /// Anything that is not an .xlsx path is treated as CSV.
    pub fn from_path(path: &Path) -> Self {
        match path.extension().and_then(|e| e.to_str()) {
            Some(ext) if ext.eq_ignore_ascii_case("xlsx") => OutputFormat::Xlsx,
            _ => OutputFormat::Csv,
        }
    }

    pub fn extension(self) -> &'static str {
        match self {
            OutputFormat::Csv => "csv",
            OutputFormat::Xlsx => "xlsx",
        }
    }
}

#[derive(Debug, Error)]
pub enum PersistError {
    #[error("cannot access {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("bad rows in {}: {source}", .path.display())]
    Csv {
        path: PathBuf,
        #[source]
        source: ::csv::Error,
    },
    #[error("bad workbook {}: {message}", .path.display())]
    Workbook { path: PathBuf, message: String },
}

impl PersistError {
    fn io(path: &Path, source: io::Error) -> Self {
        PersistError::Io {
            path: path.to_path_buf(),
            source,
        }
    }

    fn csv(path: &Path, source: ::csv::Error) -> Self {
        PersistError::Csv {
            path: path.to_path_buf(),
            source,
        }
    }

    fn workbook(path: &Path, message: impl Into<String>) -> Self {
        PersistError::Workbook {
            path: path.to_path_buf(),
            message: message.into(),
        }
    }
}

/// Makes sure the file starts with [`HEADER`], creating the file or
/// inserting the row above existing data as needed.
pub fn ensure_header(path: &Path, format: OutputFormat) -> Result<(), PersistError> {
    match format {
        OutputFormat::Csv => csv::ensure_header(path),
        OutputFormat::Xlsx => xlsx::ensure_header(path),
    }
}

/// Appends rows after whatever the file already holds.
pub fn append_rows(
    path: &Path,
    format: OutputFormat,
    rows: &[AggregateRow],
) -> Result<usize, PersistError> {
    let records = to_records(rows);
    match format {
        OutputFormat::Csv => csv::append(path, &records)?,
        OutputFormat::Xlsx => xlsx::append(path, &records)?,
    }
    Ok(records.len())
}

/// Appends the remaining rows plus the closing Command/Source block.
pub fn append_terminal(
    path: &Path,
    format: OutputFormat,
    rows: &[AggregateRow],
    source: &str,
) -> Result<usize, PersistError> {
    let records = to_records(rows);
    match format {
        OutputFormat::Csv => csv::append_terminal(path, &records, source)?,
        OutputFormat::Xlsx => xlsx::append_terminal(path, &records, source)?,
    }
    Ok(records.len())
}

/// Writes a complete file from scratch: header, rows, closing block.
/// Existing content at the path is replaced.
pub fn write_snapshot(
    path: &Path,
    format: OutputFormat,
    rows: &[AggregateRow],
    source: &str,
) -> Result<usize, PersistError> {
    let records = to_records(rows);
    match format {
        OutputFormat::Csv => csv::write_snapshot(path, &records, source)?,
        OutputFormat::Xlsx => xlsx::write_snapshot(path, &records, source)?,
    }
    Ok(records.len())
}

fn to_records(rows: &[AggregateRow]) -> Vec<[String; 4]> {
    rows.iter().map(format_record).collect()
}

fn format_record(row: &AggregateRow) -> [String; 4] {
    [
        timefmt::format_elapsed(row.elapsed_seconds),
        format!("{:.2}", row.cpu_percent),
        format!("{:.2}", row.memory_mb),
        row.source.clone(),
    ]
}

fn is_header<S: AsRef<str>>(cells: &[S]) -> bool {
    cells.len() == HEADER.len()
        && cells
            .iter()
            .zip(HEADER)
            .all(|(cell, expected)| normalize_cell(cell.as_ref()) == expected)
}

// Header comparison tolerates hand-edited spacing around commas.
fn normalize_cell(cell: &str) -> String {
    cell.replace(", ", ",").trim().to_string()
}

/// Timestamped `Data_...` path in the Downloads directory, falling
/// back to the home directory and then the working directory.
pub fn default_output_path(format: OutputFormat) -> PathBuf {
    let stamp = Local::now().format("%Y%m%d_%H%M%S");
    output_dir().join(format!("Data_{stamp}.{}", format.extension()))
}

/// User-supplied file stem, extension added unless already present.
pub fn named_output_path(name: &str, format: OutputFormat) -> PathBuf {
    let ext = format.extension();
    let has_ext = Path::new(name)
        .extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| e.eq_ignore_ascii_case(ext));
    if has_ext {
        PathBuf::from(name)
    } else {
        PathBuf::from(format!("{name}.{ext}"))
    }
}

fn output_dir() -> PathBuf {
    dirs::download_dir()
        .or_else(dirs::home_dir)
        .unwrap_or_else(|| PathBuf::from("."))
}

fn parent_dir(path: &Path) -> &Path {
    match path.parent() {
        Some(dir) if !dir.as_os_str().is_empty() => dir,
        _ => Path::new("."),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(elapsed: f64, cpu: f64, mem: f64) -> AggregateRow {
        AggregateRow {
            elapsed_seconds: elapsed,
            cpu_percent: cpu,
            memory_mb: mem,
            source: "Python: python train.py".to_string(),
        }
    }

    #[test]
    fn records_render_fixed_precision() {
        let record = format_record(&row(3661.5, 12.3456, 255.999));
        assert_eq!(record[0], "1:01:01.500");
        assert_eq!(record[1], "12.35");
        assert_eq!(record[2], "256.00");
        assert_eq!(record[3], "Python: python train.py");
    }

    #[test]
    fn header_match_tolerates_spacing() {
        assert!(is_header(&HEADER));
        assert!(is_header(&[
            " Time (H:MM:SS.ms)",
            "CPU (%) ",
            " RAM (MB) ",
            "Source"
        ]));
        assert!(!is_header(&["Time", "CPU (%)", "RAM (MB)", "Source"]));
        assert!(!is_header(&["Time (H:MM:SS.ms)", "CPU (%)", "RAM (MB)"]));
    }

    #[test]
    fn format_follows_path_extension() {
        assert_eq!(
            OutputFormat::from_path(Path::new("a/b/run.xlsx")),
            OutputFormat::Xlsx
        );
        assert_eq!(
            OutputFormat::from_path(Path::new("a/b/RUN.XLSX")),
            OutputFormat::Xlsx
        );
        assert_eq!(
            OutputFormat::from_path(Path::new("a/b/run.csv")),
            OutputFormat::Csv
        );
        assert_eq!(
            OutputFormat::from_path(Path::new("no_extension")),
            OutputFormat::Csv
        );
    }

    #[test]
    fn default_path_is_timestamped() {
        let path = default_output_path(OutputFormat::Csv);
        let name = path
            .file_name()
            .and_then(|n| n.to_str())
            .expect("file name");
        assert!(name.starts_with("Data_"), "unexpected name {name}");
        assert!(name.ends_with(".csv"), "unexpected name {name}");
        // Data_YYYYMMDD_HHMMSS.csv
        assert_eq!(name.len(), "Data_00000000_000000.csv".len());
    }

    #[test]
    fn named_path_keeps_or_adds_extension() {
        assert_eq!(
            named_output_path("report", OutputFormat::Csv),
            PathBuf::from("report.csv")
        );
        assert_eq!(
            named_output_path("report.csv", OutputFormat::Csv),
            PathBuf::from("report.csv")
        );
        assert_eq!(
            named_output_path("report", OutputFormat::Xlsx),
            PathBuf::from("report.xlsx")
        );
        assert_eq!(
            named_output_path("runs/report.XLSX", OutputFormat::Xlsx),
            PathBuf::from("runs/report.XLSX")
        );
    }
}
