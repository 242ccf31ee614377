use clap::{ArgGroup, Args, Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::entity::NamingScheme;
use crate::error::{CensusError, Result};
use crate::time_utils::DEFAULT_ZONES;

/// Default grace period granted to the extractor past its own autostop.
pub const DEFAULT_EXTRACTOR_GRACE_SECS: u64 = 10;

// ── Settings (CLI) ─────────────────────────────────────────────────────────────

/// Capture GSM Cipher Mode Commands and census the announced A5 algorithms
#[derive(Parser, Debug, Clone)]
#[command(
    name = "a5-census",
    about = "Capture GSM Cipher Mode Commands and census the announced A5 algorithms",
    version
)]
pub struct Settings {
    /// Logging level
    #[arg(
        long,
        global = true,
        default_value = "INFO",
        env = "A5_CENSUS_LOG_LEVEL",
        value_parser = ["DEBUG", "INFO", "WARNING", "ERROR"]
    )]
    pub log_level: String,

    /// Log file path (logs go to stderr as well)
    #[arg(long, global = true, env = "A5_CENSUS_LOG_FILE")]
    pub log_file: Option<PathBuf>,

    /// Enable debug logging
    #[arg(long, global = true)]
    pub debug: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Run a live capture session (radio monitor + frame extractor)
    Capture(CaptureArgs),
    /// Aggregate captured records per base station and time window
    Analyze(AnalyzeArgs),
}

/// Arguments for `a5-census capture`.
#[derive(Args, Debug, Clone)]
pub struct CaptureArgs {
    /// Downlink frequency handed to the radio monitor, e.g. 944.2M
    #[arg(short = 'f', long, env = "A5_CENSUS_FREQUENCY")]
    pub frequency: String,

    /// Receiver gain handed to the radio monitor
    #[arg(short = 'g', long, env = "A5_CENSUS_GAIN")]
    pub gain: Option<String>,

    /// Capture duration in seconds
    #[arg(
        short = 't',
        long,
        env = "A5_CENSUS_DURATION",
        value_parser = clap::value_parser!(u64).range(1..)
    )]
    pub duration: u64,

    /// Output file for matched records (tshark EK JSON lines)
    #[arg(short = 'o', long, env = "A5_CENSUS_OUTPUT")]
    pub output: Option<PathBuf>,

    /// Mobile country code, used in the default output file name
    #[arg(long)]
    pub mcc: Option<String>,

    /// Provider code (MNC), used in the default output file name
    #[arg(long)]
    pub provider: Option<String>,

    /// Location area code, used in the default output file name
    #[arg(long)]
    pub lac: Option<String>,

    /// Cell identifier, used in the default output file name
    #[arg(long)]
    pub cell: Option<String>,

    /// Interface the monitor publishes GSMTAP packets on
    #[arg(long, default_value = "lo")]
    pub interface: String,

    /// Radio monitor executable
    #[arg(long, default_value = "grgsm_livemon", env = "A5_CENSUS_MONITOR_BIN")]
    pub monitor_bin: String,

    /// Frame extractor executable
    #[arg(long, default_value = "tshark", env = "A5_CENSUS_EXTRACTOR_BIN")]
    pub extractor_bin: String,

    /// Milliseconds the monitor must stay up before extraction starts
    #[arg(long, default_value = "2000")]
    pub warmup_ms: u64,
}

/// Arguments for `a5-census analyze`.
#[derive(Args, Debug, Clone)]
#[command(group(ArgGroup::new("input").required(true).args(["directory", "file"])))]
pub struct AnalyzeArgs {
    /// Directory of capture files; files from the same BTS are merged
    #[arg(short = 'd', long)]
    pub directory: Option<PathBuf>,

    /// Single capture file
    #[arg(short = 'f', long)]
    pub file: Option<PathBuf>,

    /// Window length in minutes
    #[arg(
        short = 'i',
        long,
        default_value = "3",
        env = "A5_CENSUS_INTERVAL",
        value_parser = clap::value_parser!(u32).range(1..)
    )]
    pub interval: u32,

    /// Accepted timestamp zone suffixes, tried in order
    #[arg(long, value_delimiter = ',', default_values_t = DEFAULT_ZONES.iter().map(|z| z.to_string()))]
    pub zones: Vec<String>,

    /// Timezone for exported timestamps (auto-detected if not specified)
    #[arg(long, default_value = "auto", env = "A5_CENSUS_TIMEZONE")]
    pub timezone: String,

    /// Where exported tables go (defaults to the input's directory)
    #[arg(short = 'o', long)]
    pub output_dir: Option<PathBuf>,
}

// ── Typed configs ──────────────────────────────────────────────────────────────

/// Validated parameters of one capture session.
#[derive(Debug, Clone, PartialEq)]
pub struct CaptureConfig {
    pub frequency: String,
    pub gain: Option<String>,
    pub duration: Duration,
    pub output: PathBuf,
    pub interface: String,
    pub monitor_program: String,
    pub extractor_program: String,
    pub monitor_warmup: Duration,
    /// Extra time past `duration` before the extractor is killed.
    pub extractor_grace: Duration,
}

impl CaptureConfig {
    /// Reject values the orchestrator cannot work with.
    pub fn validate(&self) -> Result<()> {
        if self.duration.is_zero() {
            return Err(CensusError::Config(
                "capture duration must be > 0 seconds".to_string(),
            ));
        }
        if self.frequency.trim().is_empty() {
            return Err(CensusError::Config("frequency must not be empty".to_string()));
        }
        if self.monitor_program.is_empty() || self.extractor_program.is_empty() {
            return Err(CensusError::Config(
                "monitor and extractor executables must be set".to_string(),
            ));
        }
        Ok(())
    }
}

/// Where the analysis reads its capture records from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AnalysisInput {
    Directory(PathBuf),
    File(PathBuf),
}

/// Validated parameters of one analysis run.
#[derive(Debug, Clone, PartialEq)]
pub struct AnalysisConfig {
    pub input: AnalysisInput,
    pub interval_minutes: u32,
    pub zones: Vec<String>,
    pub display_timezone: String,
    pub output_dir: PathBuf,
}

impl AnalysisConfig {
    /// Reject values the pipeline cannot work with.
    pub fn validate(&self) -> Result<()> {
        if self.interval_minutes == 0 {
            return Err(CensusError::Config(
                "aggregation interval must be > 0 minutes".to_string(),
            ));
        }
        if self.zones.is_empty() {
            return Err(CensusError::Config(
                "at least one timestamp zone suffix is required".to_string(),
            ));
        }
        Ok(())
    }
}

// ── Settings impl ──────────────────────────────────────────────────────────────

impl Settings {
    /// Parse CLI arguments (and `A5_CENSUS_*` environment fallbacks).
    pub fn load() -> Self {
        Self::resolve(Settings::parse())
    }

    /// Same as [`Settings::load`] but with an explicit argument list.
    pub fn try_load_from<I, T>(args: I) -> std::result::Result<Self, clap::Error>
    where
        I: IntoIterator<Item = T>,
        T: Into<std::ffi::OsString> + Clone,
    {
        Settings::try_parse_from(args).map(Self::resolve)
    }

    /// `--debug` overrides the log level.
    fn resolve(mut settings: Settings) -> Settings {
        if settings.debug {
            settings.log_level = "DEBUG".to_string();
        }
        settings
    }
}

impl CaptureArgs {
    /// Build a [`CaptureConfig`], choosing a default output path under
    /// `capture_dir` when none was given.
    pub fn to_config(&self, capture_dir: &Path, epoch: i64) -> Result<CaptureConfig> {
        let output = match &self.output {
            Some(path) => path.clone(),
            None => capture_dir.join(format!("{}.json", self.default_source_name(epoch))),
        };

        let config = CaptureConfig {
            frequency: self.frequency.clone(),
            gain: self.gain.clone(),
            duration: Duration::from_secs(self.duration),
            output,
            interface: self.interface.clone(),
            monitor_program: self.monitor_bin.clone(),
            extractor_program: self.extractor_bin.clone(),
            monitor_warmup: Duration::from_millis(self.warmup_ms),
            extractor_grace: Duration::from_secs(DEFAULT_EXTRACTOR_GRACE_SECS),
        };
        config.validate()?;
        Ok(config)
    }

    /// Source name following [`NamingScheme::V1`], so the capture can later
    /// be attributed to its base station.
    fn default_source_name(&self, epoch: i64) -> String {
        let part = |v: &Option<String>| v.clone().unwrap_or_else(|| "unknown".to_string());
        NamingScheme::V1.compose(
            &self.extractor_bin,
            &self.frequency,
            &part(&self.mcc),
            &part(&self.provider),
            &part(&self.lac),
            &part(&self.cell),
            epoch,
        )
    }
}

impl AnalyzeArgs {
    /// Build an [`AnalysisConfig`]. Exports default to the input directory,
    /// or the directory holding the single input file.
    pub fn to_config(&self) -> Result<AnalysisConfig> {
        let input = match (&self.directory, &self.file) {
            (Some(dir), _) => AnalysisInput::Directory(dir.clone()),
            (None, Some(file)) => AnalysisInput::File(file.clone()),
            (None, None) => {
                return Err(CensusError::Config(
                    "either a directory or a file must be given".to_string(),
                ))
            }
        };

        let output_dir = match (&self.output_dir, &input) {
            (Some(dir), _) => dir.clone(),
            (None, AnalysisInput::Directory(dir)) => dir.clone(),
            (None, AnalysisInput::File(file)) => file
                .parent()
                .filter(|p| !p.as_os_str().is_empty())
                .map(Path::to_path_buf)
                .unwrap_or_else(|| PathBuf::from(".")),
        };

        let config = AnalysisConfig {
            input,
            interval_minutes: self.interval,
            zones: self
                .zones
                .iter()
                .map(|z| z.trim().to_string())
                .filter(|z| !z.is_empty())
                .collect(),
            display_timezone: self.timezone.clone(),
            output_dir,
        };
        config.validate()?;
        Ok(config)
    }
}

/// Default directory for capture output: `~/.a5-census/captures`.
pub fn default_capture_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".a5-census")
        .join("captures")
}

// ── Tests ──────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Settings {
        Settings::try_load_from(args.iter().copied()).expect("valid args")
    }

    fn capture_args(settings: Settings) -> CaptureArgs {
        match settings.command {
            Command::Capture(args) => args,
            other => panic!("expected capture, got {other:?}"),
        }
    }

    fn analyze_args(settings: Settings) -> AnalyzeArgs {
        match settings.command {
            Command::Analyze(args) => args,
            other => panic!("expected analyze, got {other:?}"),
        }
    }

    // ── capture ───────────────────────────────────────────────────────────────

    #[test]
    fn test_capture_defaults() {
        let args = capture_args(parse(&[
            "a5-census", "capture", "-f", "944.2M", "-t", "600",
        ]));
        assert_eq!(args.frequency, "944.2M");
        assert_eq!(args.duration, 600);
        assert_eq!(args.interface, "lo");
        assert_eq!(args.monitor_bin, "grgsm_livemon");
        assert_eq!(args.extractor_bin, "tshark");
        assert_eq!(args.warmup_ms, 2000);
        assert!(args.gain.is_none());
    }

    #[test]
    fn test_capture_zero_duration_rejected_by_parser() {
        let result = Settings::try_load_from(["a5-census", "capture", "-f", "944.2M", "-t", "0"]);
        assert!(result.is_err());
    }

    #[test]
    fn test_capture_to_config_explicit_output() {
        let args = capture_args(parse(&[
            "a5-census", "capture", "-f", "944.2M", "-g", "40", "-t", "60", "-o", "/tmp/out.json",
        ]));
        let config = args.to_config(Path::new("/unused"), 0).unwrap();
        assert_eq!(config.output, PathBuf::from("/tmp/out.json"));
        assert_eq!(config.gain.as_deref(), Some("40"));
        assert_eq!(config.duration, Duration::from_secs(60));
        assert_eq!(config.monitor_warmup, Duration::from_millis(2000));
    }

    #[test]
    fn test_capture_default_output_follows_naming_scheme() {
        let args = capture_args(parse(&[
            "a5-census", "capture", "-f", "944.2M", "-t", "60", "--mcc", "262", "--provider", "2",
            "--lac", "0x10c3", "--cell", "0x23a1",
        ]));
        let config = args.to_config(Path::new("/captures"), 1717511213).unwrap();
        assert_eq!(
            config.output,
            PathBuf::from("/captures/tshark_944.2M_262_2_0x10c3_0x23a1_1717511213.json")
        );
        let key = crate::entity::resolve_entity_key(config.output.to_str().unwrap()).unwrap();
        assert_eq!(key.to_string(), "944.2M_2_0x10c3");
    }

    #[test]
    fn test_capture_config_validate() {
        let mut config = CaptureConfig {
            frequency: "944.2M".to_string(),
            gain: None,
            duration: Duration::from_secs(1),
            output: PathBuf::from("out.json"),
            interface: "lo".to_string(),
            monitor_program: "grgsm_livemon".to_string(),
            extractor_program: "tshark".to_string(),
            monitor_warmup: Duration::ZERO,
            extractor_grace: Duration::ZERO,
        };
        assert!(config.validate().is_ok());
        config.duration = Duration::ZERO;
        assert!(config.validate().is_err());
    }

    // ── analyze ───────────────────────────────────────────────────────────────

    #[test]
    fn test_analyze_defaults() {
        let args = analyze_args(parse(&["a5-census", "analyze", "-d", "data/"]));
        assert_eq!(args.interval, 3);
        assert_eq!(args.zones, vec!["CEST", "BST", "CET"]);
        assert_eq!(args.timezone, "auto");
    }

    #[test]
    fn test_analyze_requires_input() {
        assert!(Settings::try_load_from(["a5-census", "analyze"]).is_err());
    }

    #[test]
    fn test_analyze_directory_and_file_conflict() {
        let result =
            Settings::try_load_from(["a5-census", "analyze", "-d", "data/", "-f", "data.csv"]);
        assert!(result.is_err());
    }

    #[test]
    fn test_analyze_zero_interval_rejected() {
        let result = Settings::try_load_from(["a5-census", "analyze", "-d", "data/", "-i", "0"]);
        assert!(result.is_err());
    }

    #[test]
    fn test_analyze_zone_list() {
        let args = analyze_args(parse(&[
            "a5-census", "analyze", "-d", "data/", "--zones", "CET,UTC",
        ]));
        assert_eq!(args.zones, vec!["CET", "UTC"]);
    }

    #[test]
    fn test_analyze_to_config_output_defaults() {
        let args = analyze_args(parse(&["a5-census", "analyze", "-d", "data"]));
        let config = args.to_config().unwrap();
        assert_eq!(config.input, AnalysisInput::Directory(PathBuf::from("data")));
        assert_eq!(config.output_dir, PathBuf::from("data"));

        let args = analyze_args(parse(&["a5-census", "analyze", "-f", "runs/a.csv"]));
        let config = args.to_config().unwrap();
        assert_eq!(config.output_dir, PathBuf::from("runs"));

        let args = analyze_args(parse(&["a5-census", "analyze", "-f", "a.csv"]));
        let config = args.to_config().unwrap();
        assert_eq!(config.output_dir, PathBuf::from("."));
    }

    // ── global flags ──────────────────────────────────────────────────────────

    #[test]
    fn test_debug_overrides_log_level() {
        let settings = parse(&["a5-census", "--debug", "analyze", "-d", "data"]);
        assert_eq!(settings.log_level, "DEBUG");
    }

    #[test]
    fn test_global_flags_after_subcommand() {
        let settings = parse(&["a5-census", "analyze", "-d", "data", "--log-level", "WARNING"]);
        assert_eq!(settings.log_level, "WARNING");
    }

    #[test]
    fn test_default_capture_dir_suffix() {
        assert!(default_capture_dir().ends_with(".a5-census/captures"));
    }
}
