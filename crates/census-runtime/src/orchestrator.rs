//! Async capture orchestrator.
//!
//! Drives one capture session: a radio monitor feeding decoded frames to the
//! loopback interface, and a frame extractor writing Cipher Mode Commands to
//! an output sink. Start order is monitor then extractor; teardown order is
//! extractor then monitor on every path.

use std::fmt;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use census_core::error::{CensusError, Result};
use census_core::settings::CaptureConfig;
use serde::Serialize;
use tokio::io::AsyncReadExt;
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use tokio::time;
use tracing::{debug, info, warn};

/// Display filter and fields requested from the extractor.
const CIPHER_FILTER: &str = "gsm_a.rr.algorithm_identifier";
const EXTRACTED_FIELDS: [&str; 3] = ["gsm_a.rr.algorithm_identifier", "frame.number", "frame.time"];

/// How much of the extractor's stderr is kept for error reports.
const STDERR_TAIL_BYTES: usize = 4096;

// ── Public types ──────────────────────────────────────────────────────────────

/// Lifecycle of a capture session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum CaptureState {
    Idle,
    MonitorStarting,
    CaptureRunning,
    Draining,
    Stopped,
}

impl fmt::Display for CaptureState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            CaptureState::Idle => "idle",
            CaptureState::MonitorStarting => "monitor_starting",
            CaptureState::CaptureRunning => "capture_running",
            CaptureState::Draining => "draining",
            CaptureState::Stopped => "stopped",
        };
        f.write_str(label)
    }
}

/// Why the extraction phase ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum CaptureOutcome {
    /// The extractor exited on its own with a success status.
    Completed,
    /// The duration backstop expired and the extractor was killed.
    TimedOut,
    /// The operator cancelled and the extractor was killed.
    Cancelled,
    /// The operator cancelled before the monitor finished warming up. The
    /// extractor was never started and no sink exists.
    CancelledDuringWarmup,
}

/// Summary of a finished capture session.
#[derive(Debug, Clone, Serialize)]
pub struct CaptureReport {
    pub output: PathBuf,
    pub outcome: CaptureOutcome,
    /// Exit code of the monitor after teardown, if it reported one.
    pub monitor_exit: Option<i32>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

// ── MonitorGuard ──────────────────────────────────────────────────────────────

/// Owns the running monitor process.
///
/// [`MonitorGuard::release`] kills and reaps it; dropping an unreleased guard
/// still sends the kill.
struct MonitorGuard {
    child: Option<Child>,
    program: String,
}

impl MonitorGuard {
    fn new(child: Child, program: &str) -> Self {
        Self {
            child: Some(child),
            program: program.to_string(),
        }
    }

    /// `Some(status)` if the monitor has already exited.
    fn exited(&mut self) -> std::io::Result<Option<ExitStatus>> {
        match self.child.as_mut() {
            Some(child) => child.try_wait(),
            None => Ok(None),
        }
    }

    async fn release(mut self) -> Option<ExitStatus> {
        let mut child = self.child.take()?;
        let status = terminate(&mut child, &self.program).await;
        debug!("Monitor {} released", self.program);
        status
    }
}

impl Drop for MonitorGuard {
    fn drop(&mut self) {
        if let Some(child) = self.child.as_mut() {
            warn!("Monitor {} dropped without release; killing", self.program);
            let _ = child.start_kill();
        }
    }
}

// ── CaptureOrchestrator ───────────────────────────────────────────────────────

/// Runs a single capture session and records its state history.
pub struct CaptureOrchestrator {
    config: CaptureConfig,
    history: Vec<CaptureState>,
}

impl CaptureOrchestrator {
    pub fn new(config: CaptureConfig) -> Self {
        Self {
            config,
            history: vec![CaptureState::Idle],
        }
    }

    pub fn config(&self) -> &CaptureConfig {
        &self.config
    }

    /// Current state.
    pub fn state(&self) -> CaptureState {
        self.history
            .last()
            .copied()
            .unwrap_or(CaptureState::Idle)
    }

    /// Every state the session has passed through, oldest first.
    pub fn history(&self) -> &[CaptureState] {
        &self.history
    }

    /// Run the session to completion.
    ///
    /// `cancel` resolves when the operator wants to stop early; it is honoured
    /// from the moment the monitor is spawned. The monitor is terminated on
    /// every return path. On error nothing in the sink is claimed valid; a
    /// sink created for an extractor that failed to start or exited
    /// unsuccessfully before the capture duration is removed.
    pub async fn run<F>(&mut self, cancel: F) -> Result<CaptureReport>
    where
        F: Future<Output = ()>,
    {
        if self.state() != CaptureState::Idle {
            return Err(CensusError::Config(format!(
                "capture session already ran (state: {})",
                self.state()
            )));
        }
        self.config.validate()?;
        let started_at = Utc::now();
        tokio::pin!(cancel);

        // ── Monitor ───────────────────────────────────────────────────────────
        self.transition(CaptureState::MonitorStarting);
        let mut monitor = match self.spawn_monitor() {
            Ok(guard) => guard,
            Err(e) => {
                self.transition(CaptureState::Stopped);
                return Err(e);
            }
        };

        let cancelled = tokio::select! {
            _ = time::sleep(self.config.monitor_warmup) => false,
            _ = &mut cancel => true,
        };
        if cancelled {
            info!("Cancelled during monitor warm-up");
            self.transition(CaptureState::Draining);
            let monitor_exit = monitor.release().await.and_then(|s| s.code());
            self.transition(CaptureState::Stopped);
            return Ok(self.report(
                CaptureOutcome::CancelledDuringWarmup,
                monitor_exit,
                started_at,
            ));
        }
        if let Err(e) = self.check_monitor(&mut monitor) {
            monitor.release().await;
            self.transition(CaptureState::Stopped);
            return Err(e);
        }

        // ── Extractor ─────────────────────────────────────────────────────────
        let (mut extractor, stderr_tail) = match self.start_extractor() {
            Ok(started) => started,
            Err(e) => {
                self.transition(CaptureState::Draining);
                monitor.release().await;
                remove_sink(&self.config.output);
                self.transition(CaptureState::Stopped);
                return Err(e);
            }
        };
        self.transition(CaptureState::CaptureRunning);
        let extraction_started = Instant::now();

        let backstop = self.config.duration + self.config.extractor_grace;
        let waited = tokio::select! {
            waited = time::timeout(backstop, extractor.wait()) => match waited {
                Ok(status) => Ok(status),
                Err(_) => Err(CaptureOutcome::TimedOut),
            },
            _ = &mut cancel => Err(CaptureOutcome::Cancelled),
        };

        // ── Teardown ──────────────────────────────────────────────────────────
        self.transition(CaptureState::Draining);
        let program = self.config.extractor_program.clone();
        let failure = match &waited {
            Ok(Ok(status)) if status.success() => None,
            Ok(Ok(status)) => Some(status.code()),
            Ok(Err(e)) => {
                warn!("Waiting for {} failed: {}", program, e);
                terminate(&mut extractor, &program).await;
                Some(None)
            }
            Err(outcome) => {
                info!("Stopping {} ({:?})", program, outcome);
                terminate(&mut extractor, &program).await;
                None
            }
        };
        let monitor_exit = monitor.release().await.and_then(|s| s.code());
        let stderr = collect_stderr(stderr_tail).await;

        if let Some(code) = failure {
            if extraction_started.elapsed() < self.config.duration {
                remove_sink(&self.config.output);
            }
            self.transition(CaptureState::Stopped);
            let detail = if stderr.is_empty() {
                "no diagnostic output".to_string()
            } else {
                stderr
            };
            return Err(CensusError::ExtractionFailed {
                program,
                code,
                detail,
            });
        }
        if !stderr.is_empty() {
            debug!("{} stderr: {}", program, stderr);
        }
        self.transition(CaptureState::Stopped);

        let outcome = match waited {
            Err(outcome) => outcome,
            Ok(_) => CaptureOutcome::Completed,
        };
        let report = self.report(outcome, monitor_exit, started_at);
        info!(
            "Capture finished: {:?}, output {}",
            report.outcome,
            report.output.display()
        );
        Ok(report)
    }

    // ── Private implementation ────────────────────────────────────────────────

    fn transition(&mut self, next: CaptureState) {
        info!("Capture state: {} -> {}", self.state(), next);
        self.history.push(next);
    }

    fn report(
        &self,
        outcome: CaptureOutcome,
        monitor_exit: Option<i32>,
        started_at: DateTime<Utc>,
    ) -> CaptureReport {
        CaptureReport {
            output: self.config.output.clone(),
            outcome,
            monitor_exit,
            started_at,
            finished_at: Utc::now(),
        }
    }

    fn spawn_monitor(&self) -> Result<MonitorGuard> {
        let program = &self.config.monitor_program;
        let child = Command::new(program)
            .args(monitor_args(&self.config))
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| CensusError::MonitorStartFailure {
                program: program.clone(),
                reason: e.to_string(),
            })?;
        info!("Started monitor {} (pid {:?})", program, child.id());
        Ok(MonitorGuard::new(child, program))
    }

    /// The monitor must still be running once the warm-up has elapsed.
    fn check_monitor(&self, guard: &mut MonitorGuard) -> Result<()> {
        let program = self.config.monitor_program.clone();
        match guard.exited() {
            Ok(None) => Ok(()),
            Ok(Some(status)) => Err(CensusError::MonitorStartFailure {
                program,
                reason: format!("exited during warm-up ({status})"),
            }),
            Err(e) => Err(CensusError::MonitorStartFailure {
                program,
                reason: e.to_string(),
            }),
        }
    }

    /// Create the sink and spawn the extractor with stdout redirected to it.
    /// Its stderr is drained by a background task keeping the last
    /// [`STDERR_TAIL_BYTES`].
    fn start_extractor(&self) -> Result<(Child, JoinHandle<Vec<u8>>)> {
        let output = &self.config.output;
        let program = &self.config.extractor_program;
        let sink_error = |e: std::io::Error| CensusError::ExtractionStartFailure {
            program: program.clone(),
            reason: format!("cannot create sink {}: {e}", output.display()),
        };
        if let Some(parent) = output.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(sink_error)?;
        }
        let sink = std::fs::File::create(output).map_err(sink_error)?;

        let mut child = Command::new(program)
            .args(extractor_args(&self.config))
            .stdin(Stdio::null())
            .stdout(Stdio::from(sink))
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| CensusError::ExtractionStartFailure {
                program: program.clone(),
                reason: e.to_string(),
            })?;
        info!(
            "Started extractor {} (pid {:?}) writing to {}",
            program,
            child.id(),
            output.display()
        );

        let stderr = child.stderr.take();
        let tail = tokio::spawn(async move {
            let mut tail = Vec::new();
            if let Some(mut stderr) = stderr {
                let mut buf = [0u8; 1024];
                while let Ok(n) = stderr.read(&mut buf).await {
                    if n == 0 {
                        break;
                    }
                    tail.extend_from_slice(&buf[..n]);
                    let excess = tail.len().saturating_sub(STDERR_TAIL_BYTES);
                    tail.drain(..excess);
                }
            }
            tail
        });
        Ok((child, tail))
    }
}

// ── Command lines ─────────────────────────────────────────────────────────────

/// `-f <frequency> [-g <gain>]`.
pub fn monitor_args(config: &CaptureConfig) -> Vec<String> {
    let mut args = vec!["-f".to_string(), config.frequency.clone()];
    if let Some(gain) = &config.gain {
        args.push("-g".to_string());
        args.push(gain.clone());
    }
    args
}

/// Live capture on the configured interface, stopping itself after the
/// capture duration, emitting line-buffered Elasticsearch JSON.
pub fn extractor_args(config: &CaptureConfig) -> Vec<String> {
    let mut args = vec![
        "-i".to_string(),
        config.interface.clone(),
        "-f".to_string(),
        "udp".to_string(),
        "-a".to_string(),
        format!("duration:{}", config.duration.as_secs().max(1)),
        "-Y".to_string(),
        CIPHER_FILTER.to_string(),
        "-T".to_string(),
        "ek".to_string(),
    ];
    for field in EXTRACTED_FIELDS {
        args.push("-e".to_string());
        args.push(field.to_string());
    }
    args.push("-l".to_string());
    args
}

// ── Private helpers ───────────────────────────────────────────────────────────

/// Kill `child` if it is still running and reap it.
async fn terminate(child: &mut Child, program: &str) -> Option<ExitStatus> {
    if let Ok(Some(status)) = child.try_wait() {
        return Some(status);
    }
    if let Err(e) = child.start_kill() {
        warn!("Failed to kill {}: {}", program, e);
    }
    match time::timeout(Duration::from_secs(5), child.wait()).await {
        Ok(Ok(status)) => Some(status),
        Ok(Err(e)) => {
            warn!("Failed to reap {}: {}", program, e);
            None
        }
        Err(_) => {
            warn!("{} did not exit after kill", program);
            None
        }
    }
}

/// Join the stderr reader. The pipe may be held open by a stray grandchild,
/// so the wait is bounded.
async fn collect_stderr(task: JoinHandle<Vec<u8>>) -> String {
    match time::timeout(Duration::from_secs(2), task).await {
        Ok(Ok(bytes)) => String::from_utf8_lossy(&bytes).trim().to_string(),
        Ok(Err(e)) => {
            warn!("Extractor stderr reader failed: {}", e);
            String::new()
        }
        Err(_) => String::new(),
    }
}

fn remove_sink(path: &Path) {
    match std::fs::remove_file(path) {
        Ok(()) => debug!("Removed partial sink {}", path.display()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => warn!("Failed to remove {}: {}", path.display(), e),
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
