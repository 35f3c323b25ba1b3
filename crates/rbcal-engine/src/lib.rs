//! Calibration run orchestration for RB-driven qubit calibration.
//!
//! A [`CalibrationRun`] opens a measurement session, optionally
//! pre-calibrates the qubit, runs the configured optimizer, archives the
//! history and commits the selected parameters to the platform.

pub mod calibration;
pub mod config;
pub mod precalibration;

pub use calibration::{CalibrationReport, CalibrationRun};
pub use config::{BoundsPolicy, CalibrationConfig, PreCalibration, ScalingMode};
pub use precalibration::{precalibrate, simplex_around, PreCalibrationOutcome};
