use anyhow::Context;
use clap::Parser;
use log::{info, warn};
use sems_export::{Flattener, Merger, TzOffset, ARTIFACT_PREFIX};
use std::path::{Path, PathBuf};

#[derive(Parser, Debug)]
#[command(version, about = "Merge saved SEMS day files into one Parquet table", long_about = None)]
struct Args {
    /// Directory holding the raw day files
    #[arg(long, default_value = "json_export")]
    src: PathBuf,

    /// Parquet file to write; a bare file name is placed inside --src
    #[arg(long, default_value = "plant_power_v2.parquet")]
    output: PathBuf,

    /// Offset the portal's local times are in
    #[arg(long, env = "SEMS_TZ_OFFSET", default_value = "+08:00")]
    tz_offset: TzOffset,

    /// File name prefix of the day files
    #[arg(long, default_value = ARTIFACT_PREFIX)]
    prefix: String,

    /// Also write the per-day totals to this Parquet file
    #[arg(long)]
    aggregates: Option<PathBuf>,
}

fn resolve_output(src: &Path, output: &Path) -> PathBuf {
    let bare = output
        .parent()
        .map_or(true, |parent| parent.as_os_str().is_empty());
    if bare && !output.is_absolute() {
        src.join(output)
    } else {
        output.to_path_buf()
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    env_logger::builder()
        .filter_level(log::LevelFilter::Info)
        .parse_default_env()
        .init();

    let output = resolve_output(&args.src, &args.output);
    let merger = Merger::builder()
        .flattener(Flattener::new(args.tz_offset))
        .prefix(args.prefix)
        .maybe_aggregates_output(args.aggregates.map(|path| resolve_output(&args.src, &path)))
        .build();

    let report = merger
        .merge(&args.src, &output)
        .await
        .with_context(|| format!("Merging {} failed", args.src.display()))?;

    for warning in &report.warnings {
        warn!("Skipped {}: {}", warning.path.display(), warning.reason);
    }
    info!(
        "Merged {}/{} file(s), {} empty day(s), {} duplicate row(s) dropped",
        report.files_merged,
        report.files_scanned,
        report.empty_days.len(),
        report.duplicates_dropped
    );
    info!(
        "{} row(s) -> {} [{}]",
        report.rows_written,
        output.display(),
        report.columns.join(", ")
    );
    Ok(())
}
