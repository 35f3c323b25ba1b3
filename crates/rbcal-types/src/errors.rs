use thiserror::Error;

/// Main error type for the calibration system
#[derive(Error, Debug)]
pub enum CalError {
    #[error("Measurement error: {0}")]
    Measurement(#[from] MeasurementError),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Optimizer error: {0}")]
    Optimizer(#[from] OptimizerError),

    #[error("Session error: {0}")]
    Session(#[from] SessionError),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Arrow error: {0}")]
    Arrow(String),

    #[error("Parquet error: {0}")]
    Parquet(String),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Validation error: {0}")]
    Validation(String),
}

impl CalError {
    /// True for failures of a single measurement, which a driver may choose
    /// to penalize instead of aborting the run.
    pub fn is_measurement_failure(&self) -> bool {
        matches!(self, CalError::Measurement(_))
    }

    pub fn is_config_error(&self) -> bool {
        matches!(self, CalError::Config(_))
    }
}

/// Failures of an oracle measurement or of its curve fit
#[derive(Error, Debug, Clone, PartialEq)]
pub enum MeasurementError {
    #[error("{protocol} fit did not converge for target {target}")]
    FitDidNotConverge { protocol: String, target: String },

    #[error("{protocol} result has no field {field} for target {target}")]
    MissingField {
        protocol: String,
        field: String,
        target: String,
    },

    #[error("{protocol} produced a non-finite {field} for target {target}")]
    NonFinite {
        protocol: String,
        field: String,
        target: String,
    },

    #[error("Malformed covariance for target {target}: expected {expected} entries, got {actual}")]
    MalformedCovariance {
        target: String,
        expected: usize,
        actual: usize,
    },

    #[error("{protocol} fit for target {target} has chi2 {chi2} greater than {threshold}")]
    PoorFit {
        protocol: String,
        target: String,
        chi2: f64,
        threshold: f64,
    },
}

/// Invalid run configuration, always raised before any oracle call
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ConfigError {
    #[error("Invalid bounds on dimension {dimension}: lower {lower} > upper {upper}")]
    InvalidBounds {
        dimension: usize,
        lower: f64,
        upper: f64,
    },

    #[error("Non-finite bound on dimension {dimension}")]
    NonFiniteBound { dimension: usize },

    #[error("Dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },

    #[error("Invalid scale factor on dimension {dimension}: {value}")]
    InvalidScaleFactor { dimension: usize, value: f64 },

    #[error("Invalid initial simplex: {message}")]
    InvalidSimplex { message: String },

    #[error("Unsupported optimization method: {method}")]
    UnsupportedMethod { method: String },

    #[error("Invalid configuration: {message}")]
    Invalid { message: String },
}

/// Errors raised while driving an optimizer backend
#[derive(Error, Debug, Clone, PartialEq)]
pub enum OptimizerError {
    #[error("Candidate value {value} on dimension {dimension} is outside [{lower}, {upper}]")]
    OutOfBounds {
        dimension: usize,
        value: f64,
        lower: f64,
        upper: f64,
    },

    #[error("Driver {driver} received {actual} evaluations for {expected} candidates")]
    EvaluationCountMismatch {
        driver: String,
        expected: usize,
        actual: usize,
    },

    #[error("Driver {driver} was observed without a pending proposal")]
    UnexpectedObservation { driver: String },

    #[error("Optimization produced no completed iterations")]
    EmptyHistory,

    #[error("History iterations are not contiguous: expected {expected}, found {found}")]
    NonContiguousHistory { expected: usize, found: usize },

    #[error("Numerical breakdown in {driver}: {message}")]
    NumericalBreakdown { driver: String, message: String },
}

/// Errors of the measurement session lifecycle
#[derive(Error, Debug, Clone, PartialEq)]
pub enum SessionError {
    #[error("Oracle is not connected")]
    NotConnected,

    #[error("Session path {path} is locked by another run")]
    Locked { path: String },

    #[error("Unknown target: {target}")]
    UnknownTarget { target: String },

    #[error("Operation {operation} is not supported by this oracle")]
    Unsupported { operation: String },

    #[error("Oracle backend error: {message}")]
    Backend { message: String },
}

/// Persistence errors
#[derive(Error, Debug, Clone, PartialEq)]
pub enum StorageError {
    #[error("Database error: {message}")]
    Database { message: String },

    #[error("Study already exists: {name}")]
    StudyExists { name: String },

    #[error("Study not found: {name}")]
    StudyNotFound { name: String },

    #[error("Invalid archive {path}: {message}")]
    InvalidArchive { path: String, message: String },

    #[error("CSV error: {message}")]
    Csv { message: String },
}

/// Result type alias for calibration operations
pub type CalResult<T> = Result<T, CalError>;

/// Macro for creating validation errors
#[macro_export]
macro_rules! validation_error {
    ($($arg:tt)*) => {
        $crate::CalError::Validation(format!($($arg)*))
    };
}

/// Macro for creating internal errors
#[macro_export]
macro_rules! internal_error {
    ($($arg:tt)*) => {
        $crate::CalError::Internal(format!($($arg)*))
    };
}

/// Macro for creating configuration errors
#[macro_export]
macro_rules! config_error {
    ($($arg:tt)*) => {
        $crate::CalError::Config($crate::ConfigError::Invalid { message: format!($($arg)*) })
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let error = MeasurementError::PoorFit {
            protocol: "ramsey".to_string(),
            target: "D1".to_string(),
            chi2: 3.5,
            threshold: 2.0,
        };

        assert!(error.to_string().contains("ramsey"));
        assert!(error.to_string().contains("3.5"));
        assert!(error.to_string().contains("D1"));
    }

    #[test]
    fn test_error_conversion() {
        let measurement = MeasurementError::FitDidNotConverge {
            protocol: "rb".to_string(),
            target: "q0".to_string(),
        };
        let cal_error: CalError = measurement.into();

        assert!(cal_error.is_measurement_failure());
        assert!(!cal_error.is_config_error());
    }

    #[test]
    fn test_macros() {
        let validation = validation_error!("Invalid value: {}", 42);
        assert!(matches!(validation, CalError::Validation(_)));

        let internal = internal_error!("Something went wrong");
        assert!(matches!(internal, CalError::Internal(_)));

        let config = config_error!("Missing required field: {}", "target");
        assert!(config.is_config_error());
    }
}
