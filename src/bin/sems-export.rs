use anyhow::Context;
use chrono::NaiveDate;
use clap::Parser;
use log::{error, info, warn};
use sems_export::{load_env_file, EndDate, Exporter, RunConfig, RunReport, SemsError};
use std::path::PathBuf;
use std::process::ExitCode;

#[derive(Parser, Debug)]
#[command(version, about = "Save one raw SEMS power chart per day", long_about = None)]
struct Args {
    /// File with SEMS_* settings, defaults to SEMS_ENV_FILE or ./.env
    #[arg(long)]
    env_file: Option<PathBuf>,

    /// First day to export (YYYY-MM-DD), overrides SEMS_START
    #[arg(long)]
    start: Option<NaiveDate>,

    /// Last day to export (YYYY-MM-DD or latest), overrides SEMS_END
    #[arg(long)]
    end: Option<EndDate>,
}

async fn export(args: Args) -> Result<RunReport, SemsError> {
    if let Some(path) = load_env_file(args.env_file.as_deref())? {
        info!("Loaded settings from {}", path.display());
    }
    let mut config = RunConfig::from_env()?;
    if let Some(start) = args.start {
        config.start = Some(start);
    }
    if let Some(end) = args.end {
        config.end = end;
    }

    let mut exporter = Exporter::connect(config)?;
    Ok(exporter.run().await?)
}

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    let args = Args::parse();

    env_logger::builder()
        .filter_level(log::LevelFilter::Info)
        .parse_default_env()
        .init();

    let report = export(args).await.context("Export failed")?;

    for failure in &report.failed {
        warn!("{}: {}", failure.day, failure.message);
    }
    info!(
        "{} day(s) saved, {} failed",
        report.days_succeeded(),
        report.days_failed()
    );
    if let Some(reason) = &report.aborted {
        error!("Run aborted: {}", reason);
        return Ok(ExitCode::FAILURE);
    }
    Ok(ExitCode::SUCCESS)
}
