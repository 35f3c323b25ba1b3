//! Calibration run configuration.

use rbcal_oracle::{DragTuningConfig, FlippingConfig, RamseyConfig, RbConfig, SIMULATED_PLATFORM};
use rbcal_optimizer::{Method, OptimizerConfig};
use rbcal_types::constants::{
    AMPLITUDE_LIMIT, BETA_HALF_WIDTH, DEFAULT_NSHOTS, FIT_CHI2_THRESHOLD,
    FLIPPING_DELTA_AMPLITUDE, FREQUENCY_HALF_WIDTH_HZ, PRECALIBRATION_NSHOTS, SIGMA_WIDENING,
};
use rbcal_types::{config_error, Bounds, CalResult, DriveParameters, ScaleFactors};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Flipping rounds run back to back during pre-calibration.
pub const FLIPPING_ROUNDS: usize = 10;

/// Characterization run before the optimizer starts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PreCalibration {
    /// Start from the parameters currently on the platform.
    #[default]
    Skip,
    /// DRAG beta sweep; the best beta seeds the third dimension.
    DragTuning,
    /// Ramsey frequency and flipping amplitude fine tuning; also yields an
    /// explicit initial simplex for local search.
    RamseyFlipping,
}

/// Search box around the starting point.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BoundsPolicy {
    /// Amplitude is bounded absolutely to `[-limit, limit]`.
    pub amplitude_limit: f64,
    pub frequency_half_width_hz: f64,
    pub beta_half_width: f64,
}

impl Default for BoundsPolicy {
    fn default() -> Self {
        Self {
            amplitude_limit: AMPLITUDE_LIMIT,
            frequency_half_width_hz: FREQUENCY_HALF_WIDTH_HZ,
            beta_half_width: BETA_HALF_WIDTH,
        }
    }
}

impl BoundsPolicy {
    pub fn bounds_for(&self, start: &DriveParameters, include_beta: bool) -> CalResult<Bounds> {
        let mut lower = vec![
            -self.amplitude_limit,
            start.frequency - self.frequency_half_width_hz,
        ];
        let mut upper = vec![
            self.amplitude_limit,
            start.frequency + self.frequency_half_width_hz,
        ];
        if include_beta {
            let beta = start.beta.unwrap_or(0.0);
            lower.push(beta - self.beta_half_width);
            upper.push(beta + self.beta_half_width);
        }
        let bounds = Bounds::new(lower, upper);
        bounds.validate()?;
        Ok(bounds)
    }
}

/// How the optimizer's coordinates are normalized.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScalingMode {
    /// Optimize physical values directly.
    None,
    /// Divide each dimension by the half-width of its bound.
    #[default]
    HalfWidth,
    Explicit(Vec<f64>),
}

impl ScalingMode {
    pub fn factors(&self, bounds: &Bounds) -> CalResult<Option<ScaleFactors>> {
        match self {
            Self::None => Ok(None),
            Self::HalfWidth => {
                let half_widths = (0..bounds.dim()).map(|d| 0.5 * bounds.width(d)).collect();
                ScaleFactors::new(half_widths).map(Some)
            }
            Self::Explicit(factors) => {
                if factors.len() != bounds.dim() {
                    return Err(config_error!(
                        "{} scale factors given for {} dimensions",
                        factors.len(),
                        bounds.dim()
                    ));
                }
                ScaleFactors::new(factors.clone()).map(Some)
            }
        }
    }
}

/// Everything one calibration run needs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CalibrationConfig {
    pub platform: String,
    pub target: String,
    /// Persist the calibrated platform when the session closes.
    pub platform_update: bool,
    /// Optimize DRAG beta as a third dimension.
    pub drag: bool,
    pub output_root: PathBuf,
    /// Run label; defaults to the start timestamp.
    pub label: Option<String>,
    /// Resume the Bayesian study of the same label.
    pub resume: bool,
    /// Clear a stale session lock.
    pub force: bool,
    pub nshots: u32,
    pub precalibration: PreCalibration,
    pub precalibration_nshots: u32,
    pub flipping_rounds: usize,
    pub chi2_threshold: f64,
    pub sigma_widening: f64,
    pub bounds: BoundsPolicy,
    pub scaling: ScalingMode,
    pub optimizer: OptimizerConfig,
    pub rb: RbConfig,
    pub ramsey: RamseyConfig,
    pub flipping: FlippingConfig,
    pub drag_tuning: DragTuningConfig,
}

impl Default for CalibrationConfig {
    fn default() -> Self {
        Self {
            platform: SIMULATED_PLATFORM.to_string(),
            target: "0".to_string(),
            platform_update: false,
            drag: false,
            output_root: PathBuf::from("."),
            label: None,
            resume: false,
            force: true,
            nshots: DEFAULT_NSHOTS,
            precalibration: PreCalibration::Skip,
            precalibration_nshots: PRECALIBRATION_NSHOTS,
            flipping_rounds: FLIPPING_ROUNDS,
            chi2_threshold: FIT_CHI2_THRESHOLD,
            sigma_widening: SIGMA_WIDENING,
            bounds: BoundsPolicy::default(),
            scaling: ScalingMode::default(),
            optimizer: OptimizerConfig::default(),
            rb: RbConfig::default(),
            ramsey: RamseyConfig::default(),
            flipping: FlippingConfig {
                delta_amplitude: Some(FLIPPING_DELTA_AMPLITUDE),
                ..FlippingConfig::default()
            },
            drag_tuning: DragTuningConfig::default(),
        }
    }
}

impl CalibrationConfig {
    pub fn new(platform: impl Into<String>, target: impl Into<String>, method: Method) -> Self {
        Self {
            platform: platform.into(),
            target: target.into(),
            optimizer: OptimizerConfig::new(method),
            ..Self::default()
        }
    }

    pub fn from_json_file<P: AsRef<Path>>(path: P) -> CalResult<Self> {
        let text = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&text)?;
        Ok(config)
    }

    pub fn method(&self) -> Method {
        self.optimizer.method
    }

    pub fn dimension(&self) -> usize {
        if self.drag {
            3
        } else {
            2
        }
    }

    pub fn with_method(mut self, method: Method) -> Self {
        self.optimizer.method = method;
        self
    }

    pub fn with_output_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.output_root = root.into();
        self
    }

    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }

    pub fn with_drag(mut self, drag: bool) -> Self {
        self.drag = drag;
        self
    }

    pub fn with_platform_update(mut self, update: bool) -> Self {
        self.platform_update = update;
        self
    }

    pub fn with_precalibration(mut self, precalibration: PreCalibration) -> Self {
        self.precalibration = precalibration;
        self
    }

    pub fn with_scaling(mut self, scaling: ScalingMode) -> Self {
        self.scaling = scaling;
        self
    }

    pub fn with_optimizer(mut self, optimizer: OptimizerConfig) -> Self {
        self.optimizer = optimizer;
        self
    }

    pub fn with_resume(mut self, resume: bool) -> Self {
        self.resume = resume;
        self
    }

    pub fn validate(&self) -> CalResult<()> {
        if self.target.is_empty() {
            return Err(config_error!("target must not be empty"));
        }
        if self.platform.is_empty() {
            return Err(config_error!("platform must not be empty"));
        }
        if self.nshots == 0 || self.precalibration_nshots == 0 {
            return Err(config_error!("shot counts must be positive"));
        }
        if !(self.chi2_threshold > 0.0) {
            return Err(config_error!(
                "chi2 threshold must be positive, got {}",
                self.chi2_threshold
            ));
        }
        if self.precalibration == PreCalibration::RamseyFlipping && self.flipping_rounds == 0 {
            return Err(config_error!("Ramsey/flipping pre-calibration needs a flipping round"));
        }
        if let Some(simplex) = &self.optimizer.local.initial_simplex {
            if simplex.iter().any(|v| v.dim() != self.dimension()) {
                return Err(config_error!(
                    "initial simplex vertices must have dimension {}",
                    self.dimension()
                ));
            }
        }
        self.optimizer.validate()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn default_bounds_follow_calibration_ranges() {
        let start = DriveParameters::new(0.05, 5e9, Some(0.1));
        let bounds = BoundsPolicy::default().bounds_for(&start, true).unwrap();
        assert_eq!(bounds.lower, vec![-0.5, 5e9 - 4e6, 0.1 - 0.25]);
        assert_eq!(bounds.upper, vec![0.5, 5e9 + 4e6, 0.1 + 0.25]);

        let flat = BoundsPolicy::default().bounds_for(&start, false).unwrap();
        assert_eq!(flat.dim(), 2);
    }

    #[test]
    fn half_width_scaling_normalizes_box() {
        let bounds = Bounds::new(vec![-0.5, 4.996e9], vec![0.5, 5.004e9]);
        let factors = ScalingMode::HalfWidth.factors(&bounds).unwrap().unwrap();
        assert_eq!(factors.as_slice(), &[0.5, 4e6]);
        assert!(ScalingMode::None.factors(&bounds).unwrap().is_none());
        assert!(ScalingMode::Explicit(vec![1.0]).factors(&bounds).is_err());
    }

    #[test]
    fn partial_json_fills_defaults() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(
            &path,
            r#"{"platform": "qw11q", "target": "D1", "drag": true,
                "optimizer": {"method": "cma", "local": {"max_iterations": 40, "max_evaluations": null,
                "xatol": 1e-4, "fatol": 1e-4, "perturbation": 0.01, "initial_simplex": null},
                "evolutionary": {"sigma0": 0.25, "max_generations": 40, "population_size": null,
                "tolfun": 1e-11, "tolx": 1e-11},
                "bayesian": {"n_trials": 1000, "n_startup_trials": 10, "n_ei_candidates": 24,
                "study_name": "rb_calibration", "study_path": null, "load_if_exists": false},
                "failure_policy": "abort", "seed": 3},
                "scaling": "none"}"#,
        )
        .unwrap();

        let config = CalibrationConfig::from_json_file(&path).unwrap();
        assert_eq!(config.target, "D1");
        assert_eq!(config.method(), Method::Cma);
        assert_eq!(config.dimension(), 3);
        assert_eq!(config.scaling, ScalingMode::None);
        assert_eq!(config.nshots, DEFAULT_NSHOTS);
        config.validate().unwrap();
    }

    #[test]
    fn validation_rejects_bad_settings() {
        let mut config = CalibrationConfig::default();
        config.target.clear();
        assert!(config.validate().is_err());

        let config = CalibrationConfig {
            chi2_threshold: 0.0,
            ..CalibrationConfig::default()
        };
        assert!(config.validate().is_err());

        let mut config = CalibrationConfig::default().with_method(Method::NelderMead);
        config.optimizer.local.max_iterations = 0;
        assert!(config.validate().unwrap_err().is_config_error());

        let mut config = CalibrationConfig::default().with_method(Method::Cma);
        config.optimizer.evolutionary.max_generations = 0;
        assert!(config.validate().unwrap_err().is_config_error());
    }
}
