//! Simulated measurement oracle.
//!
//! Stands in for the control electronics when running on the simulated
//! platform. The gate error is a quadratic bowl around a configurable
//! optimum; RB decay parameters carry seeded Gaussian noise so runs are
//! reproducible for a given seed.

use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use rand_distr::{Distribution, Normal};
use rbcal_types::constants::{AVG_CLIFFORD_GATE_COUNT, SINGLE_QUBIT_DEPOLARIZING_FACTOR};
use rbcal_types::{CalError, CalResult, DriveParameters, SessionError};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::{debug, info};

use crate::oracle::{
    ConnectionStatus, DragOutput, DragTuningConfig, Estimate, EstimateOutput, FlippingConfig,
    MeasurementOracle, OracleSettings, RamseyConfig, RbConfig, RbOutput,
};

pub const SIMULATED_PLATFORM: &str = "dummy";

/// Configuration for the simulated oracle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SimulatedOracleConfig {
    pub platform: String,
    pub targets: Vec<String>,
    /// Drive parameters with the lowest gate error.
    pub optimum: DriveParameters,
    /// Drive parameters loaded on connect.
    pub initial: DriveParameters,
    /// Gate error at the optimum.
    pub base_error: f64,
    /// Gate error added at one width away from the optimum, per dimension.
    pub excess_error: f64,
    pub amplitude_width: f64,
    pub frequency_width_hz: f64,
    pub beta_width: f64,
    /// Standard deviation of the noise added to the decay parameter.
    pub decay_noise_std: f64,
    /// Reported fit uncertainty of the decay parameter.
    pub decay_std: f64,
    pub frequency_error_hz: f64,
    pub amplitude_error: f64,
    pub beta_error: f64,
    /// Chi2 reported by the Ramsey, flipping and DRAG fits.
    pub chi2: f64,
    pub seed: u64,
}

impl Default for SimulatedOracleConfig {
    fn default() -> Self {
        Self {
            platform: SIMULATED_PLATFORM.to_string(),
            targets: vec!["0".to_string()],
            optimum: DriveParameters::new(0.045, 5.045e9, Some(0.1)),
            initial: DriveParameters::new(0.05, 5.046e9, Some(0.0)),
            base_error: 1e-3,
            excess_error: 5e-3,
            amplitude_width: 0.01,
            frequency_width_hz: 2e6,
            beta_width: 0.2,
            decay_noise_std: 1e-4,
            decay_std: 5e-4,
            frequency_error_hz: 1e5,
            amplitude_error: 1e-3,
            beta_error: 0.02,
            chi2: 1.2,
            seed: 42,
        }
    }
}

impl SimulatedOracleConfig {
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    pub fn with_targets(mut self, targets: Vec<String>) -> Self {
        self.targets = targets;
        self
    }

    pub fn with_platform(mut self, platform: impl Into<String>) -> Self {
        self.platform = platform.into();
        self
    }

    pub fn with_noise(mut self, decay_noise_std: f64) -> Self {
        self.decay_noise_std = decay_noise_std;
        self
    }

    pub fn with_chi2(mut self, chi2: f64) -> Self {
        self.chi2 = chi2;
        self
    }

    /// Noise-free decay parameter of a given parameter set.
    pub fn decay_parameter(&self, params: &DriveParameters) -> f64 {
        let da = (params.amplitude - self.optimum.amplitude) / self.amplitude_width;
        let df = (params.frequency - self.optimum.frequency) / self.frequency_width_hz;
        let db = match (params.beta, self.optimum.beta) {
            (Some(b), Some(opt)) => (b - opt) / self.beta_width,
            _ => 0.0,
        };
        let gate_error = self.base_error + self.excess_error * (da * da + df * df + db * db);
        let p = 1.0 - gate_error * AVG_CLIFFORD_GATE_COUNT / SINGLE_QUBIT_DEPOLARIZING_FACTOR;
        p.clamp(0.0, 1.0)
    }
}

/// Number of protocol calls served, per kind.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallCounters {
    pub randomized_benchmarking: usize,
    pub ramsey: usize,
    pub flipping: usize,
    pub drag_tuning: usize,
    pub platform_updates: usize,
    pub persists: usize,
}

/// In-process oracle with a synthetic gate-error landscape.
#[derive(Debug)]
pub struct SimulatedOracle {
    config: SimulatedOracleConfig,
    settings: OracleSettings,
    status: ConnectionStatus,
    rng: ChaCha8Rng,
    live: HashMap<String, DriveParameters>,
    platform: HashMap<String, DriveParameters>,
    persisted: Option<HashMap<String, DriveParameters>>,
    pending_failures: usize,
    offline: bool,
    counters: CallCounters,
}

impl SimulatedOracle {
    pub fn new(config: SimulatedOracleConfig) -> Self {
        let rng = ChaCha8Rng::seed_from_u64(config.seed);
        let platform: HashMap<String, DriveParameters> = config
            .targets
            .iter()
            .map(|t| (t.clone(), config.initial))
            .collect();
        Self {
            config,
            settings: OracleSettings::default(),
            status: ConnectionStatus::Disconnected,
            rng,
            live: platform.clone(),
            platform,
            persisted: None,
            pending_failures: 0,
            offline: false,
            counters: CallCounters::default(),
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(SimulatedOracleConfig::default())
    }

    pub fn config(&self) -> &SimulatedOracleConfig {
        &self.config
    }

    /// Make the next `count` RB fits fail to converge.
    pub fn fail_next(&mut self, count: usize) {
        self.pending_failures = count;
    }

    /// Refuse connections while set.
    pub fn set_offline(&mut self, offline: bool) {
        self.offline = offline;
    }

    pub fn counters(&self) -> &CallCounters {
        &self.counters
    }

    /// Committed platform configuration of `target`.
    pub fn platform_parameters(&self, target: &str) -> Option<&DriveParameters> {
        self.platform.get(target)
    }

    /// Live state saved by the last [`MeasurementOracle::persist`] call.
    pub fn persisted_parameters(&self, target: &str) -> Option<&DriveParameters> {
        self.persisted.as_ref().and_then(|p| p.get(target))
    }

    fn ensure_connected(&self) -> CalResult<()> {
        if self.status == ConnectionStatus::Connected {
            Ok(())
        } else {
            Err(SessionError::NotConnected.into())
        }
    }

    fn ensure_target(&self, target: &str) -> CalResult<()> {
        if self.live.contains_key(target) {
            Ok(())
        } else {
            Err(SessionError::UnknownTarget {
                target: target.to_string(),
            }
            .into())
        }
    }

    fn gaussian(&mut self, std: f64) -> CalResult<f64> {
        if std == 0.0 {
            return Ok(0.0);
        }
        let normal = Normal::new(0.0, std).map_err(|e| CalError::Internal(e.to_string()))?;
        Ok(normal.sample(&mut self.rng))
    }

    fn chi2_map(&self) -> HashMap<String, (f64, f64)> {
        self.config
            .targets
            .iter()
            .map(|t| (t.clone(), (self.config.chi2, 0.0)))
            .collect()
    }

    fn estimate_output(
        &mut self,
        protocol: &str,
        truth: impl Fn(&SimulatedOracleConfig) -> f64,
        error: f64,
    ) -> CalResult<EstimateOutput> {
        let mut values = HashMap::new();
        for target in self.config.targets.clone() {
            let value = truth(&self.config) + self.gaussian(error)?;
            values.insert(target, Estimate { value, error });
        }
        Ok(EstimateOutput {
            protocol: protocol.to_string(),
            values,
            chi2: self.chi2_map(),
        })
    }
}

impl MeasurementOracle for SimulatedOracle {
    fn connect(&mut self) -> CalResult<()> {
        if self.offline {
            return Err(SessionError::Backend {
                message: format!("platform {} is offline", self.config.platform),
            }
            .into());
        }
        info!(platform = %self.config.platform, "Simulated oracle connected");
        self.status = ConnectionStatus::Connected;
        Ok(())
    }

    fn disconnect(&mut self) -> CalResult<()> {
        info!(platform = %self.config.platform, "Simulated oracle disconnected");
        self.status = ConnectionStatus::Disconnected;
        Ok(())
    }

    fn connection_status(&self) -> ConnectionStatus {
        self.status
    }

    fn settings(&self) -> &OracleSettings {
        &self.settings
    }

    fn settings_mut(&mut self) -> &mut OracleSettings {
        &mut self.settings
    }

    fn targets(&self) -> Vec<String> {
        self.config.targets.clone()
    }

    fn drive_parameters(&self, target: &str) -> CalResult<DriveParameters> {
        self.ensure_target(target)?;
        Ok(self.live[target])
    }

    fn apply_drive_parameters(&mut self, target: &str, params: &DriveParameters) -> CalResult<()> {
        self.ensure_target(target)?;
        self.live.insert(target.to_string(), *params);
        Ok(())
    }

    fn randomized_benchmarking(&mut self, config: &RbConfig) -> CalResult<RbOutput> {
        self.ensure_connected()?;
        self.counters.randomized_benchmarking += 1;

        let mut output = RbOutput::default();
        if self.pending_failures > 0 {
            self.pending_failures -= 1;
            debug!("Simulated RB fit failure");
            return Ok(output);
        }

        let decay_std = self.config.decay_std;
        for target in self.config.targets.clone() {
            let truth = self.config.decay_parameter(&self.live[&target]);
            let p = (truth + self.gaussian(self.config.decay_noise_std)?).clamp(0.0, 1.0);
            let mut cov = vec![0.0; 9];
            cov[0] = 1e-6;
            cov[4] = 1e-6;
            cov[8] = decay_std * decay_std;
            output.pars.insert(target.clone(), vec![0.5, 0.5, p]);
            output.cov.insert(target, cov);
        }
        debug!(
            depth = config.max_circuit_depth,
            sequences = config.num_of_sequences,
            nshots = self.settings.nshots,
            "Simulated RB completed"
        );
        Ok(output)
    }

    fn ramsey(&mut self, _config: &RamseyConfig) -> CalResult<EstimateOutput> {
        self.ensure_connected()?;
        self.counters.ramsey += 1;
        let error = self.config.frequency_error_hz;
        self.estimate_output("ramsey", |c| c.optimum.frequency, error)
    }

    fn flipping(&mut self, _config: &FlippingConfig) -> CalResult<EstimateOutput> {
        self.ensure_connected()?;
        self.counters.flipping += 1;
        let error = self.config.amplitude_error;
        self.estimate_output("flipping", |c| c.optimum.amplitude, error)
    }

    fn drag_tuning(&mut self, config: &DragTuningConfig) -> CalResult<DragOutput> {
        self.ensure_connected()?;
        self.counters.drag_tuning += 1;
        let truth = self.config.optimum.beta.unwrap_or(0.0);
        let mut betas = HashMap::new();
        for target in self.config.targets.clone() {
            let beta = truth + self.gaussian(self.config.beta_error)?;
            betas.insert(target, beta.clamp(config.beta_start, config.beta_end));
        }
        Ok(DragOutput {
            betas,
            chi2: self.chi2_map(),
        })
    }

    fn update_platform(&mut self, target: &str, params: &DriveParameters) -> CalResult<()> {
        self.ensure_target(target)?;
        self.counters.platform_updates += 1;
        info!(qubit = %target, amplitude = params.amplitude, frequency = params.frequency, "Updated platform");
        self.platform.insert(target.to_string(), *params);
        self.live.insert(target.to_string(), *params);
        Ok(())
    }

    fn persist(&mut self) -> CalResult<()> {
        self.counters.persists += 1;
        self.persisted = Some(self.live.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn decay_is_highest_at_optimum() {
        let config = SimulatedOracleConfig::default();
        let at_opt = config.decay_parameter(&config.optimum);
        let off = config.decay_parameter(&config.initial);

        assert_relative_eq!(at_opt, 1.0 - 1e-3 * 3.75, max_relative = 1e-12);
        assert!(off < at_opt);
    }

    #[test]
    fn protocols_require_connection() {
        let mut oracle = SimulatedOracle::with_defaults();
        let err = oracle.randomized_benchmarking(&RbConfig::default()).unwrap_err();
        assert!(matches!(err, CalError::Session(SessionError::NotConnected)));
    }

    #[test]
    fn same_seed_same_measurements() {
        let run = || {
            let mut oracle = SimulatedOracle::with_defaults();
            oracle.connect().unwrap();
            oracle
                .randomized_benchmarking(&RbConfig::default())
                .unwrap()
                .decay("0")
                .unwrap()
                .p
        };
        assert_eq!(run(), run());
    }

    #[test]
    fn injected_failure_drops_fit() {
        let mut oracle = SimulatedOracle::with_defaults();
        oracle.connect().unwrap();
        oracle.fail_next(1);

        let first = oracle.randomized_benchmarking(&RbConfig::default()).unwrap();
        assert!(first.decay("0").is_err());
        let second = oracle.randomized_benchmarking(&RbConfig::default()).unwrap();
        assert!(second.decay("0").is_ok());
        assert_eq!(oracle.counters().randomized_benchmarking, 2);
    }

    #[test]
    fn update_platform_commits_and_applies() {
        let mut oracle = SimulatedOracle::with_defaults();
        let params = DriveParameters::new(0.046, 5.0451e9, Some(0.1));
        oracle.update_platform("0", &params).unwrap();

        assert_eq!(oracle.platform_parameters("0"), Some(&params));
        assert_eq!(oracle.drive_parameters("0").unwrap(), params);
        assert!(oracle.update_platform("9", &params).is_err());
    }

    #[test]
    fn apply_does_not_commit() {
        let mut oracle = SimulatedOracle::with_defaults();
        let initial = oracle.config().initial;
        oracle
            .apply_drive_parameters("0", &DriveParameters::new(0.1, 5e9, None))
            .unwrap();
        assert_eq!(oracle.platform_parameters("0"), Some(&initial));
    }

    #[test]
    fn ramsey_estimates_optimum_frequency() {
        let mut oracle = SimulatedOracle::new(SimulatedOracleConfig::default().with_seed(7));
        oracle.connect().unwrap();
        let output = oracle.ramsey(&RamseyConfig::default()).unwrap();
        let estimate = output.estimate("0").unwrap();

        assert!((estimate.value - 5.045e9).abs() < 10.0 * estimate.error);
        assert_eq!(output.chi2("0"), Some(1.2));
    }
}
