//! Domain constants shared by the oracle, the optimizers and the engine.

/// Average number of native gates in a single-qubit Clifford operation.
pub const AVG_CLIFFORD_GATE_COUNT: f64 = 1.875;

/// `1 - 1/2^n` for a single qubit: converts `1 - p` into a Clifford error rate.
pub const SINGLE_QUBIT_DEPOLARIZING_FACTOR: f64 = 1.0 - 1.0 / 2.0;

/// Index of the decay parameter `p` in the RB fit `A * p^m + B` -> `[A, B, p]`.
pub const RB_DECAY_PARAMETER_INDEX: usize = 2;

/// Number of fit parameters of the RB decay model.
pub const RB_FIT_PARAMETERS: usize = 3;

pub const DEFAULT_NSHOTS: u32 = 2000;
pub const PRECALIBRATION_NSHOTS: u32 = 1024;

// Randomized benchmarking protocol
pub const RB_NUM_SEQUENCES: usize = 1000;
pub const RB_MAX_CIRCUIT_DEPTH: usize = 1000;
pub const RB_DELTA_CLIFFORD: usize = 10;
pub const RB_N_AVG: usize = 1;

// Search region around the pre-calibrated point
pub const AMPLITUDE_LIMIT: f64 = 0.5;
pub const FREQUENCY_HALF_WIDTH_HZ: f64 = 4e6;
pub const BETA_HALF_WIDTH: f64 = 0.25;

// Local search
pub const DEFAULT_MAX_ITERATIONS: usize = 40;
pub const DEFAULT_TOLERANCE: f64 = 1e-4;
pub const SIMPLEX_PERTURBATION: f64 = 0.01;
/// Evaluation cap per dimension for local search.
pub const MAX_EVALUATIONS_PER_DIMENSION: usize = 200;

// Evolutionary search
pub const CMA_INITIAL_SIGMA: f64 = 0.25;
pub const CMA_MAX_GENERATIONS: usize = 40;
pub const CMA_TOLFUN: f64 = 1e-11;
pub const CMA_TOLX: f64 = 1e-11;

// Sequential Bayesian search
pub const BAYESIAN_TRIAL_BUDGET: usize = 1000;
pub const BAYESIAN_STARTUP_TRIALS: usize = 10;
pub const BAYESIAN_EI_CANDIDATES: usize = 24;

// Pre-calibration
pub const FIT_CHI2_THRESHOLD: f64 = 2.0;
/// Widening applied to fitted uncertainties when building an initial simplex.
pub const SIGMA_WIDENING: f64 = 1.5;
pub const DRAG_BETA_START: f64 = -4.0;
pub const DRAG_BETA_END: f64 = 4.0;
pub const DRAG_BETA_STEP: f64 = 0.5;
pub const RAMSEY_DELAY_START_NS: u64 = 10;
pub const RAMSEY_DELAY_END_NS: u64 = 1000;
pub const RAMSEY_DELAY_STEP_NS: u64 = 20;
pub const RAMSEY_DETUNING_HZ: f64 = 3_000_000.0;
pub const RELAXATION_TIME_NS: u64 = 200_000;
pub const FLIPPING_NFLIPS_MAX: usize = 20;
pub const FLIPPING_NFLIPS_STEP: usize = 1;
pub const FLIPPING_DELTA_AMPLITUDE: f64 = 3e-4;

/// Fidelity an uncertainty interval must cross for a step to be committed.
pub const IDEAL_FIDELITY: f64 = 1.0;
