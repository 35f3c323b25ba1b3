use anyhow::Result;
use clap::Parser;
use rbcal_optimizer::Study;
use rbcal_store::{
    list_analysis_runs, list_studies, study_name_from_path, summarize_runs, write_summary_csv,
    RunSummaryRow,
};
use std::path::PathBuf;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

/// Summarize archived calibration runs and Bayesian studies into one CSV.
#[derive(Parser, Debug)]
#[command(name = "rbcal-summary", version)]
struct Cli {
    /// Output root the runs were written under.
    #[arg(long, default_value = ".")]
    root: PathBuf,

    #[arg(long, default_value = "summary.csv")]
    output: PathBuf,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    let mut rows = summarize_runs(&list_analysis_runs(&cli.root)?);

    for path in list_studies(&cli.root)? {
        let Some(name) = study_name_from_path(&path) else {
            warn!(path = %path.display(), "Skipping study file with no name");
            continue;
        };
        match Study::load(&path, &name).and_then(|study| study.completed_history()) {
            Ok(history) => {
                let row_name = path
                    .file_stem()
                    .and_then(|s| s.to_str())
                    .unwrap_or(name.as_str())
                    .to_string();
                rows.extend(RunSummaryRow::from_history(row_name, &history));
            }
            Err(e) => warn!(path = %path.display(), error = %e, "Skipping unreadable study"),
        }
    }

    write_summary_csv(&cli.output, &rows)?;
    info!(rows = rows.len(), path = %cli.output.display(), "Wrote summary");
    println!("{} rows written to {}", rows.len(), cli.output.display());
    Ok(())
}
