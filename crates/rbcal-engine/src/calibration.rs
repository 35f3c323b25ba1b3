//! One end-to-end calibration run: session, pre-calibration, optimization,
//! persistence and commit.

use chrono::{DateTime, Utc};
use rbcal_oracle::{MeasurementOracle, OracleSession, SessionConfig, SessionManifest};
use rbcal_optimizer::{
    run_tracked, HistoryRecorder, Method, ObjectiveWrapper, OptimizerConfig, ResultSelector,
    RunStatus,
};
use rbcal_store::{HistoryArchive, ResultStore, RunLayout};
use rbcal_types::{
    CalResult, DriveParameters, OptimizationHistory, OptimizationResult, OptimizationStep,
    RunRecord,
};
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

use crate::config::CalibrationConfig;
use crate::precalibration::{precalibrate, PreCalibrationOutcome};

/// Everything a finished run produced.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CalibrationReport {
    pub run_name: String,
    pub record: RunRecord,
    pub history: OptimizationHistory,
    pub precalibration: PreCalibrationOutcome,
    /// Step chosen by the fidelity-with-uncertainty rule.
    pub selected: Option<OptimizationStep>,
    /// Parameters written to the platform.
    pub committed: Option<DriveParameters>,
    pub status: RunStatus,
    pub manifest: SessionManifest,
}

impl CalibrationReport {
    pub fn result(&self) -> &OptimizationResult {
        &self.record.opt_results
    }
}

/// Work done while the session is open.
struct Calibrated {
    history: OptimizationHistory,
    result: OptimizationResult,
    precalibration: PreCalibrationOutcome,
    selected: Option<OptimizationStep>,
    committed: Option<DriveParameters>,
    status: RunStatus,
}

pub struct CalibrationRun {
    config: CalibrationConfig,
    layout: RunLayout,
    started_at: DateTime<Utc>,
}

impl CalibrationRun {
    pub fn new(config: CalibrationConfig) -> Self {
        let started_at = Utc::now();
        let mut layout = RunLayout::new(
            &config.output_root,
            config.target.clone(),
            config.method().as_str(),
            started_at,
        );
        if let Some(label) = &config.label {
            layout = layout.with_label(label.clone());
        }
        Self {
            config,
            layout,
            started_at,
        }
    }

    pub fn config(&self) -> &CalibrationConfig {
        &self.config
    }

    pub fn layout(&self) -> &RunLayout {
        &self.layout
    }

    /// Run the calibration against `oracle`.
    ///
    /// The session is closed on every path. A failed optimization still
    /// leaves its partial history archived.
    pub fn execute(&self, oracle: &mut dyn MeasurementOracle) -> CalResult<CalibrationReport> {
        self.config.validate()?;
        self.layout.create_dirs()?;

        let session_config = SessionConfig::new(
            self.layout.run_name(),
            self.config.platform.clone(),
            self.layout.session_dir(),
        )
        .with_targets(vec![self.config.target.clone()])
        .with_update_on_close(self.config.platform_update)
        .with_force(self.config.force);

        let mut session = OracleSession::open(oracle, session_config)?;
        let outcome = self.calibrate(session.oracle_mut());
        let closed = session.close();

        let (calibrated, manifest) = match (outcome, closed) {
            (Ok(calibrated), Ok(manifest)) => (calibrated, manifest),
            (Ok(_), Err(e)) => return Err(e),
            (Err(e), Ok(_)) => return Err(e),
            (Err(e), Err(close_error)) => {
                warn!(error = %close_error, "Session close failed after a failed run");
                return Err(e);
            }
        };

        let record = RunRecord {
            opt_results: calibrated.result,
            elapsed_time: manifest.elapsed_seconds,
            method: self.config.method().to_string(),
            platform: self.config.platform.clone(),
            target: self.config.target.clone(),
            started_at: self.started_at,
            committed_parameters: calibrated.selected.as_ref().map(|s| s.parameters.clone()),
        };
        ResultStore::write_record(self.layout.result_path(), &record)?;
        ResultStore::append_time_log(
            self.layout.time_log_path(),
            &self.layout.run_name(),
            record.elapsed_time,
        )?;

        info!(
            run = %self.layout.run_name(),
            elapsed = record.elapsed_time,
            committed = calibrated.committed.is_some(),
            "Calibration run finished"
        );

        Ok(CalibrationReport {
            run_name: self.layout.run_name(),
            record,
            history: calibrated.history,
            precalibration: calibrated.precalibration,
            selected: calibrated.selected,
            committed: calibrated.committed,
            status: calibrated.status,
            manifest,
        })
    }

    fn calibrate(&self, oracle: &mut dyn MeasurementOracle) -> CalResult<Calibrated> {
        let config = &self.config;
        let target = config.target.as_str();
        oracle.settings_mut().nshots = config.nshots;

        let precalibration = precalibrate(oracle, config)?;
        let start = precalibration.drive;
        let init_guess = start.to_vector(config.drag);
        let bounds = config.bounds.bounds_for(&start, config.drag)?;
        let factors = config.scaling.factors(&bounds)?;
        let optimizer = self.optimizer_config(&precalibration);

        let mut recorder = HistoryRecorder::new(bounds.dim());
        let mut status = RunStatus::new(optimizer.method);
        let outcome = ObjectiveWrapper::new(&mut *oracle, target, config.rb.clone()).and_then(
            |mut objective| {
                run_tracked(
                    &mut objective,
                    &init_guess,
                    &bounds,
                    factors.as_ref(),
                    &optimizer,
                    &mut recorder,
                    &mut status,
                )
            },
        );

        let archived = self.archive(recorder.history());
        let result = match (outcome, archived) {
            (Ok(result), Ok(())) => result,
            (Ok(_), Err(e)) => return Err(e),
            (Err(e), Ok(())) => return Err(e),
            (Err(e), Err(archive_error)) => {
                error!(error = %archive_error, "Failed to archive partial history");
                return Err(e);
            }
        };
        let history = recorder.into_history();

        let selected = ResultSelector::new().select(&history).step().cloned();
        let committed = match &selected {
            Some(step) => {
                let drive = DriveParameters::from_vector(&step.parameters, &start)?;
                oracle.update_platform(target, &drive)?;
                Some(drive)
            }
            None => None,
        };

        Ok(Calibrated {
            history,
            result,
            precalibration,
            selected,
            committed,
            status,
        })
    }

    fn optimizer_config(&self, precalibration: &PreCalibrationOutcome) -> OptimizerConfig {
        let mut optimizer = self.config.optimizer.clone();
        if optimizer.method == Method::NelderMead && optimizer.local.initial_simplex.is_none() {
            optimizer.local.initial_simplex = precalibration.initial_simplex.clone();
        }
        optimizer.bayesian = optimizer
            .bayesian
            .with_study(self.layout.study_name(), Some(self.layout.study_path()))
            .with_load_if_exists(self.config.resume);
        optimizer
    }

    fn archive(&self, history: &OptimizationHistory) -> CalResult<()> {
        if history.is_empty() {
            warn!(run = %self.layout.run_name(), "No completed iteration to archive");
            return Ok(());
        }
        HistoryArchive::write(self.layout.history_path(), history)
    }
}
