use anyhow::{bail, Context, Result};
use clap::Parser;
use rbcal_engine::{CalibrationConfig, CalibrationRun, PreCalibration};
use rbcal_optimizer::Method;
use rbcal_oracle::{SimulatedOracle, SimulatedOracleConfig, SIMULATED_PLATFORM};
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::EnvFilter;

/// Calibrate the drive of one qubit by minimizing its RB gate error.
#[derive(Parser, Debug)]
#[command(name = "rbcal", version)]
struct Cli {
    /// Platform to calibrate; required unless `--config` names it.
    #[arg(long, required_unless_present = "config")]
    platform: Option<String>,

    /// Qubit to calibrate; required unless `--config` names it.
    #[arg(long, required_unless_present = "config")]
    target: Option<String>,

    /// Persist the calibrated platform when the run ends.
    #[arg(long = "platform_update")]
    platform_update: bool,

    /// nelder-mead (scipy), cma or optuna.
    #[arg(long)]
    method: Option<Method>,

    /// Optimize DRAG beta as a third parameter.
    #[arg(long)]
    drag: bool,

    /// JSON calibration config; flags override its fields.
    #[arg(long)]
    config: Option<PathBuf>,

    #[arg(long)]
    output_root: Option<PathBuf>,

    #[arg(long)]
    seed: Option<u64>,

    /// Nelder-Mead iterations or CMA-ES generations.
    #[arg(long)]
    max_iterations: Option<usize>,

    /// Bayesian trial budget.
    #[arg(long)]
    trials: Option<usize>,

    /// skip, drag or ramsey-flipping.
    #[arg(long, value_parser = parse_precalibration)]
    precalibration: Option<PreCalibration>,

    /// Resume the Bayesian study of the same label.
    #[arg(long)]
    resume: bool,

    /// Run label; defaults to the start timestamp.
    #[arg(long)]
    label: Option<String>,
}

fn parse_precalibration(s: &str) -> Result<PreCalibration, String> {
    match s.to_ascii_lowercase().as_str() {
        "skip" | "none" => Ok(PreCalibration::Skip),
        "drag" | "drag-tuning" | "drag_tuning" => Ok(PreCalibration::DragTuning),
        "ramsey-flipping" | "ramsey_flipping" | "init-simplex" => Ok(PreCalibration::RamseyFlipping),
        other => Err(format!("unknown pre-calibration `{other}`")),
    }
}

impl Cli {
    fn into_config(self) -> Result<CalibrationConfig> {
        let mut config = match &self.config {
            Some(path) => CalibrationConfig::from_json_file(path)
                .with_context(|| format!("loading {}", path.display()))?,
            None => CalibrationConfig::default(),
        };

        if let Some(platform) = self.platform {
            config.platform = platform;
        }
        if let Some(target) = self.target {
            config.target = target;
        }
        if let Some(method) = self.method {
            config.optimizer.method = method;
        }
        if let Some(root) = self.output_root {
            config.output_root = root;
        }
        if let Some(seed) = self.seed {
            config.optimizer.seed = seed;
        }
        if let Some(n) = self.max_iterations {
            config.optimizer.local.max_iterations = n;
            config.optimizer.evolutionary.max_generations = n;
        }
        if let Some(n) = self.trials {
            config.optimizer.bayesian.n_trials = n;
        }
        if let Some(precalibration) = self.precalibration {
            config.precalibration = precalibration;
        }
        if self.label.is_some() {
            config.label = self.label;
        }
        config.platform_update |= self.platform_update;
        config.drag |= self.drag;
        config.resume |= self.resume;
        Ok(config)
    }
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = Cli::parse().into_config()?;
    if config.platform != SIMULATED_PLATFORM {
        bail!(
            "no oracle backend for platform `{}`, only `{}` is available",
            config.platform,
            SIMULATED_PLATFORM
        );
    }

    let mut oracle = SimulatedOracle::new(
        SimulatedOracleConfig::default()
            .with_targets(vec![config.target.clone()])
            .with_seed(config.optimizer.seed),
    );

    info!(
        platform = %config.platform,
        target = %config.target,
        method = %config.method(),
        drag = config.drag,
        "Starting calibration"
    );
    let run = CalibrationRun::new(config);
    let report = run.execute(&mut oracle)?;

    let result = report.result();
    println!("run:         {}", report.run_name);
    println!("iterations:  {}", result.n_iterations);
    println!("evaluations: {}", result.n_evaluations);
    println!(
        "best:        {} (gate error {:.3e})",
        result.best_parameters, result.best_objective_value
    );
    println!("stopped:     {}", result.termination_reason);
    match report.committed {
        Some(drive) => println!(
            "committed:   amplitude {} frequency {} beta {:?}",
            drive.amplitude, drive.frequency, drive.beta
        ),
        None => println!("committed:   nothing"),
    }
    println!("results in   {}", run.layout().analysis_dir().display());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn platform_and_target_are_required_without_config() {
        assert!(Cli::try_parse_from(["rbcal", "--platform", "dummy"]).is_err());
        assert!(Cli::try_parse_from(["rbcal", "--target", "0"]).is_err());

        let cli = Cli::try_parse_from(["rbcal", "--platform", "dummy", "--target", "D1"]).unwrap();
        let config = cli.into_config().unwrap();
        assert_eq!(config.platform, "dummy");
        assert_eq!(config.target, "D1");
    }

    #[test]
    fn config_file_supplies_platform_and_target() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, r#"{"platform": "dummy", "target": "D2"}"#).unwrap();

        let cli = Cli::try_parse_from(["rbcal", "--config", path.to_str().unwrap(), "--drag"])
            .unwrap();
        let config = cli.into_config().unwrap();
        assert_eq!(config.target, "D2");
        assert!(config.drag);
    }
}
