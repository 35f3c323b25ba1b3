use rbcal_types::{CalResult, OptimizationHistory, StorageError};
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::{info, warn};

use crate::archive::HistoryArchive;

/// One row of a calibration summary: initial, best and final points of a
/// run with their cost and fidelity improvements.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunSummaryRow {
    #[serde(rename = "Analysis Name")]
    pub name: String,
    pub cost_initial: f64,
    pub cost_best: f64,
    pub index_best: usize,
    #[serde(rename = "A best [a.u.]")]
    pub amplitude_best: f64,
    #[serde(rename = "f best [Hz]")]
    pub frequency_best: f64,
    #[serde(rename = "B best")]
    pub beta_best: Option<f64>,
    pub cost_final: f64,
    #[serde(rename = "A final [a.u.]")]
    pub amplitude_final: f64,
    #[serde(rename = "f final [Hz]")]
    pub frequency_final: f64,
    #[serde(rename = "B final")]
    pub beta_final: Option<f64>,
    #[serde(rename = "improvement_best [%]")]
    pub improvement_best_pct: f64,
    #[serde(rename = "improvement_final [%]")]
    pub improvement_final_pct: f64,
    pub fidelity_initial: f64,
    pub fidelity_best: f64,
    pub fidelity_final: f64,
    #[serde(rename = "fidelity_improvement_best [%]")]
    pub fidelity_improvement_best_pct: f64,
    #[serde(rename = "fidelity_improvement_final [%]")]
    pub fidelity_improvement_final_pct: f64,
}

impl RunSummaryRow {
    /// `None` for an empty history.
    pub fn from_history(name: impl Into<String>, history: &OptimizationHistory) -> Option<Self> {
        let summary = history.summary()?;
        let best = summary.best_parameters.as_slice();
        let last = summary.final_parameters.as_slice();
        if best.len() < 2 {
            return None;
        }

        Some(Self {
            name: name.into(),
            cost_initial: summary.cost_initial,
            cost_best: summary.cost_best,
            index_best: summary.index_best,
            amplitude_best: best[0],
            frequency_best: best[1],
            beta_best: best.get(2).copied(),
            cost_final: summary.cost_final,
            amplitude_final: last[0],
            frequency_final: last[1],
            beta_final: last.get(2).copied(),
            improvement_best_pct: summary.improvement_best_pct,
            improvement_final_pct: summary.improvement_final_pct,
            fidelity_initial: summary.fidelity_initial,
            fidelity_best: summary.fidelity_best,
            fidelity_final: summary.fidelity_final,
            fidelity_improvement_best_pct: summary.fidelity_improvement_best_pct,
            fidelity_improvement_final_pct: summary.fidelity_improvement_final_pct,
        })
    }
}

/// Summarize archived run directories. Runs whose archive cannot be read
/// or is empty are skipped with a warning.
pub fn summarize_runs<P: AsRef<Path>>(run_dirs: &[P]) -> Vec<RunSummaryRow> {
    let mut rows = Vec::new();
    for dir in run_dirs {
        let dir = dir.as_ref();
        let name = dir
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("unknown")
            .to_string();
        let history = match HistoryArchive::read(dir.join(crate::layout::HISTORY_FILE_NAME)) {
            Ok(history) => history,
            Err(e) => {
                warn!("Skipping run {}: {}", name, e);
                continue;
            }
        };
        match RunSummaryRow::from_history(name.clone(), &history) {
            Some(row) => rows.push(row),
            None => warn!("Skipping run {}: no completed iterations", name),
        }
    }
    rows
}

pub fn write_summary_csv<P: AsRef<Path>>(path: P, rows: &[RunSummaryRow]) -> CalResult<()> {
    let path = path.as_ref();
    let mut writer = csv::Writer::from_path(path).map_err(csv_error)?;
    for row in rows {
        writer.serialize(row).map_err(csv_error)?;
    }
    writer.flush()?;
    info!("Wrote {} summary rows to {}", rows.len(), path.display());
    Ok(())
}

pub fn read_summary_csv<P: AsRef<Path>>(path: P) -> CalResult<Vec<RunSummaryRow>> {
    let mut reader = csv::Reader::from_path(path).map_err(csv_error)?;
    reader
        .deserialize()
        .map(|row| row.map_err(csv_error))
        .collect()
}

fn csv_error(e: csv::Error) -> rbcal_types::CalError {
    StorageError::Csv {
        message: e.to_string(),
    }
    .into()
}
