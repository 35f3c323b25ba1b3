//! Measurement oracle layer for RB calibration.
//!
//! The oracle is the external collaborator that configures the device (or
//! simulator), runs calibration protocols synchronously and returns fitted
//! results keyed by target.

pub mod oracle;
pub mod session;
pub mod simulated;

pub use oracle::*;
pub use session::*;
pub use simulated::*;
