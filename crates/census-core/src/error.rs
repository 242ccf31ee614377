use std::path::PathBuf;
use thiserror::Error;

/// All errors produced by the cipher census.
#[derive(Error, Debug)]
pub enum CensusError {
    /// A file could not be opened or read from disk.
    #[error("Failed to read file {path}: {source}")]
    FileRead {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// A JSON document could not be parsed.
    #[error("Failed to parse JSON: {0}")]
    JsonParse(#[from] serde_json::Error),

    /// A timestamp string did not match any of the candidate formats.
    #[error("Unparseable timestamp: {0}")]
    UnparseableTimestamp(String),

    /// A capture source name does not follow the naming contract.
    #[error("Malformed source name {name:?}: expected at least {expected} '_'-separated segments, found {found}")]
    MalformedSourceName {
        name: String,
        expected: usize,
        found: usize,
    },

    /// A raw capture record is missing a field or carries a bad value.
    #[error("Malformed record at line {line}: {reason}")]
    MalformedRecord { line: usize, reason: String },

    /// The radio monitor could not be started or died during warm-up.
    #[error("Monitor process {program} failed to start: {reason}")]
    MonitorStartFailure { program: String, reason: String },

    /// The frame extractor could not be started. The monitor has already
    /// been torn down when this is returned.
    #[error("Extraction process {program} failed to start: {reason}")]
    ExtractionStartFailure { program: String, reason: String },

    /// The frame extractor exited unsuccessfully. `detail` holds the tail of
    /// its stderr.
    #[error("Extraction process {program} failed (exit code {code:?}): {detail}")]
    ExtractionFailed {
        program: String,
        code: Option<i32>,
        detail: String,
    },

    /// A configuration value is missing or invalid.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Pass-through for any raw I/O error that does not carry a path.
    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// Catch-all for errors from third-party crates via `anyhow`.
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl CensusError {
    /// Short machine-friendly label used in run summaries.
    pub fn kind(&self) -> &'static str {
        match self {
            CensusError::FileRead { .. } => "file_read",
            CensusError::JsonParse(_) => "json_parse",
            CensusError::UnparseableTimestamp(_) => "unparseable_timestamp",
            CensusError::MalformedSourceName { .. } => "malformed_source_name",
            CensusError::MalformedRecord { .. } => "malformed_record",
            CensusError::MonitorStartFailure { .. } => "monitor_start_failure",
            CensusError::ExtractionStartFailure { .. } => "extraction_start_failure",
            CensusError::ExtractionFailed { .. } => "extraction_failed",
            CensusError::Config(_) => "config",
            CensusError::Io(_) => "io",
            CensusError::Other(_) => "other",
        }
    }
}

/// Convenience alias used throughout the census crates.
pub type Result<T> = std::result::Result<T, CensusError>;
