mod bootstrap;

use anyhow::{Context, Result};
use census_core::settings::{AnalyzeArgs, CaptureArgs, Command, Settings};
use census_core::time_utils::resolve_display_timezone;
use census_data::analysis::analyze_captures;
use census_data::export::export_analysis;
use census_runtime::orchestrator::{CaptureOrchestrator, CaptureOutcome};

#[tokio::main]
async fn main() -> Result<()> {
    let settings = Settings::load();

    bootstrap::setup_logging(&settings.log_level, settings.log_file.as_ref())?;

    tracing::info!("a5-census v{} starting", env!("CARGO_PKG_VERSION"));

    match &settings.command {
        Command::Capture(args) => run_capture(args).await,
        Command::Analyze(args) => run_analyze(args),
    }
}

async fn run_capture(args: &CaptureArgs) -> Result<()> {
    let capture_dir = bootstrap::ensure_directories()?;
    let config = args.to_config(&capture_dir, chrono::Utc::now().timestamp())?;

    tracing::info!(
        "Capturing on {} for {}s into {}",
        config.frequency,
        config.duration.as_secs(),
        config.output.display()
    );

    let mut orchestrator = CaptureOrchestrator::new(config);
    let report = orchestrator.run(interrupted()?).await?;

    match report.outcome {
        CaptureOutcome::Completed => {
            tracing::info!("Capture complete: {}", report.output.display());
        }
        CaptureOutcome::TimedOut | CaptureOutcome::Cancelled => {
            tracing::warn!(
                "Capture stopped early ({:?}); {} holds records up to that point",
                report.outcome,
                report.output.display()
            );
        }
        CaptureOutcome::CancelledDuringWarmup => {
            tracing::warn!("Capture cancelled before the extractor started; nothing written");
        }
    }

    Ok(())
}

/// Resolves on the first Ctrl+C. The handler is installed before this
/// returns, so an interrupt during monitor warm-up is not lost.
#[cfg(unix)]
fn interrupted() -> Result<impl std::future::Future<Output = ()>> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigint = signal(SignalKind::interrupt()).context("installing SIGINT handler")?;
    Ok(async move {
        sigint.recv().await;
        tracing::info!("Ctrl+C received; stopping capture");
    })
}

#[cfg(not(unix))]
fn interrupted() -> Result<impl std::future::Future<Output = ()>> {
    Ok(async {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("Ctrl+C received; stopping capture");
        } else {
            std::future::pending::<()>().await;
        }
    })
}

fn run_analyze(args: &AnalyzeArgs) -> Result<()> {
    let config = args.to_config()?;
    let tz = resolve_display_timezone(&config.display_timezone)?;
    bootstrap::ensure_output_dir(&config.output_dir)?;

    let result = analyze_captures(&config)?;
    let written = export_analysis(&result, &config.output_dir, tz)
        .with_context(|| format!("exporting to {}", config.output_dir.display()))?;

    for entity in &result.entities {
        tracing::info!(
            "{} ({}): {} samples, A5/1 {}, A5/3 {}, A5/4 {}, unknown {}",
            entity.key,
            entity.key.provider_name(),
            entity.totals.total(),
            entity.totals.a5_1,
            entity.totals.a5_3,
            entity.totals.a5_4,
            entity.totals.unknown
        );
    }
    for issue in &result.issues {
        tracing::warn!("Skipped {}: {}", issue.source, issue.detail);
    }
    tracing::info!(
        "{} entities, {} issues, {} files written to {}",
        result.entities.len(),
        result.issues.len(),
        written.len(),
        config.output_dir.display()
    );

    Ok(())
}
