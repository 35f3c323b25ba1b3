use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::Deref;

use crate::errors::{CalResult, ConfigError};

/// Names of the optimized dimensions, in vector order.
pub const PARAMETER_NAMES: [&str; 3] = ["amplitude", "frequency", "beta"];

/// Ordered, fixed-length numeric parameter tuple `(amplitude, frequency, [beta])`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ParameterVector(Vec<f64>);

impl ParameterVector {
    pub fn new(values: Vec<f64>) -> Self {
        Self(values)
    }

    pub fn zeros(dimension: usize) -> Self {
        Self(vec![0.0; dimension])
    }

    pub fn dim(&self) -> usize {
        self.0.len()
    }

    pub fn as_slice(&self) -> &[f64] {
        &self.0
    }

    pub fn into_inner(self) -> Vec<f64> {
        self.0
    }

    pub fn is_finite(&self) -> bool {
        self.0.iter().all(|v| v.is_finite())
    }

    /// Fails with a configuration error unless the vector has `expected` entries.
    pub fn check_dim(&self, expected: usize) -> CalResult<()> {
        if self.dim() != expected {
            return Err(ConfigError::DimensionMismatch {
                expected,
                actual: self.dim(),
            }
            .into());
        }
        Ok(())
    }
}

impl Deref for ParameterVector {
    type Target = [f64];

    fn deref(&self) -> &[f64] {
        &self.0
    }
}

impl From<Vec<f64>> for ParameterVector {
    fn from(values: Vec<f64>) -> Self {
        Self(values)
    }
}

impl From<&[f64]> for ParameterVector {
    fn from(values: &[f64]) -> Self {
        Self(values.to_vec())
    }
}

impl fmt::Display for ParameterVector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[")?;
        for (i, v) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{v:.6e}")?;
        }
        write!(f, "]")
    }
}

/// Physical drive parameters of the RX native gate of one qubit.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DriveParameters {
    pub amplitude: f64,
    pub frequency: f64,
    /// DRAG coefficient; `None` for a plain Gaussian pulse.
    pub beta: Option<f64>,
}

impl DriveParameters {
    pub fn new(amplitude: f64, frequency: f64, beta: Option<f64>) -> Self {
        Self {
            amplitude,
            frequency,
            beta,
        }
    }

    /// `(amplitude, frequency)` or `(amplitude, frequency, beta)`.
    pub fn to_vector(&self, include_beta: bool) -> ParameterVector {
        let mut values = vec![self.amplitude, self.frequency];
        if include_beta {
            values.push(self.beta.unwrap_or(0.0));
        }
        ParameterVector::new(values)
    }

    /// Builds drive parameters from an optimizer vector. A 2-D vector keeps
    /// the beta of `current`.
    pub fn from_vector(vector: &ParameterVector, current: &DriveParameters) -> CalResult<Self> {
        match vector.as_slice() {
            [amplitude, frequency] => Ok(Self::new(*amplitude, *frequency, current.beta)),
            [amplitude, frequency, beta] => Ok(Self::new(*amplitude, *frequency, Some(*beta))),
            other => Err(ConfigError::DimensionMismatch {
                expected: if current.beta.is_some() { 3 } else { 2 },
                actual: other.len(),
            }
            .into()),
        }
    }
}

/// Per-dimension normalization applied before handing a vector to an
/// optimizer: `scaled = physical / s`, `physical = scaled * s`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ScaleFactors(Vec<f64>);

impl ScaleFactors {
    pub fn new(factors: Vec<f64>) -> CalResult<Self> {
        for (dimension, value) in factors.iter().enumerate() {
            if !value.is_finite() || *value == 0.0 {
                return Err(ConfigError::InvalidScaleFactor {
                    dimension,
                    value: *value,
                }
                .into());
            }
        }
        Ok(Self(factors))
    }

    pub fn identity(dimension: usize) -> Self {
        Self(vec![1.0; dimension])
    }

    pub fn dim(&self) -> usize {
        self.0.len()
    }

    pub fn as_slice(&self) -> &[f64] {
        &self.0
    }

    pub fn is_identity(&self) -> bool {
        self.0.iter().all(|s| *s == 1.0)
    }

    pub fn scale(&self, physical: &ParameterVector) -> CalResult<ParameterVector> {
        physical.check_dim(self.dim())?;
        Ok(physical
            .iter()
            .zip(self.0.iter())
            .map(|(x, s)| x / s)
            .collect::<Vec<_>>()
            .into())
    }

    pub fn unscale(&self, scaled: &ParameterVector) -> CalResult<ParameterVector> {
        scaled.check_dim(self.dim())?;
        Ok(scaled
            .iter()
            .zip(self.0.iter())
            .map(|(x, s)| x * s)
            .collect::<Vec<_>>()
            .into())
    }

    /// Maps physical bounds into the scaled space. A negative factor flips
    /// the interval, so lower and upper are re-ordered per dimension.
    pub fn scale_bounds(&self, bounds: &Bounds) -> CalResult<Bounds> {
        let lower = self.scale(&ParameterVector::from(bounds.lower.as_slice()))?;
        let upper = self.scale(&ParameterVector::from(bounds.upper.as_slice()))?;
        let (lower, upper): (Vec<f64>, Vec<f64>) = lower
            .iter()
            .zip(upper.iter())
            .map(|(l, u)| (l.min(*u), l.max(*u)))
            .unzip();
        Ok(Bounds::new(lower, upper))
    }
}

/// Per-dimension box constraint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Bounds {
    pub lower: Vec<f64>,
    pub upper: Vec<f64>,
}

impl Bounds {
    /// Builds bounds without validating them; call [`Bounds::validate`]
    /// before use.
    pub fn new(lower: Vec<f64>, upper: Vec<f64>) -> Self {
        Self { lower, upper }
    }

    /// Symmetric interval `center ± half_width` on every dimension.
    pub fn around(center: &ParameterVector, half_widths: &[f64]) -> CalResult<Self> {
        center.check_dim(half_widths.len())?;
        let lower = center
            .iter()
            .zip(half_widths)
            .map(|(c, w)| c - w.abs())
            .collect();
        let upper = center
            .iter()
            .zip(half_widths)
            .map(|(c, w)| c + w.abs())
            .collect();
        Ok(Self { lower, upper })
    }

    pub fn dim(&self) -> usize {
        self.lower.len()
    }

    pub fn validate(&self) -> CalResult<()> {
        if self.lower.len() != self.upper.len() {
            return Err(ConfigError::DimensionMismatch {
                expected: self.lower.len(),
                actual: self.upper.len(),
            }
            .into());
        }
        for (dimension, (lower, upper)) in self.lower.iter().zip(&self.upper).enumerate() {
            if !lower.is_finite() || !upper.is_finite() {
                return Err(ConfigError::NonFiniteBound { dimension }.into());
            }
            if lower > upper {
                return Err(ConfigError::InvalidBounds {
                    dimension,
                    lower: *lower,
                    upper: *upper,
                }
                .into());
            }
        }
        Ok(())
    }

    pub fn width(&self, dimension: usize) -> f64 {
        self.upper[dimension] - self.lower[dimension]
    }

    pub fn center(&self) -> ParameterVector {
        self.lower
            .iter()
            .zip(&self.upper)
            .map(|(l, u)| 0.5 * (l + u))
            .collect::<Vec<_>>()
            .into()
    }

    pub fn contains(&self, x: &[f64]) -> bool {
        self.contains_within(x, 0.0)
    }

    /// Membership test that tolerates `tolerance * max(width, 1)` of
    /// round-off outside each edge.
    pub fn contains_within(&self, x: &[f64], tolerance: f64) -> bool {
        x.len() == self.dim()
            && x.iter().enumerate().all(|(i, v)| {
                let slack = tolerance * self.width(i).max(1.0);
                *v >= self.lower[i] - slack && *v <= self.upper[i] + slack
            })
    }

    /// Index of the first violated dimension, if any.
    pub fn first_violation(&self, x: &[f64]) -> Option<usize> {
        x.iter()
            .enumerate()
            .find(|(i, v)| **v < self.lower[*i] || **v > self.upper[*i] || v.is_nan())
            .map(|(i, _)| i)
    }

    pub fn clip(&self, x: &[f64]) -> ParameterVector {
        x.iter()
            .enumerate()
            .map(|(i, v)| v.clamp(self.lower[i], self.upper[i]))
            .collect::<Vec<_>>()
            .into()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn scale_unscale_round_trip() {
        let scale = ScaleFactors::new(vec![1e-2, 5e9, -0.3]).unwrap();
        let x = ParameterVector::new(vec![0.043, 5.123_456_789e9, 1.7]);

        let back = scale.unscale(&scale.scale(&x).unwrap()).unwrap();
        for (a, b) in x.iter().zip(back.iter()) {
            assert_relative_eq!(a, b, max_relative = 1e-12);
        }
    }

    #[test]
    fn zero_scale_factor_is_rejected() {
        let err = ScaleFactors::new(vec![1.0, 0.0]).unwrap_err();
        assert!(err.is_config_error());
    }

    #[test]
    fn scale_dimension_mismatch() {
        let scale = ScaleFactors::identity(3);
        assert!(scale.scale(&ParameterVector::new(vec![1.0, 2.0])).is_err());
    }

    #[test]
    fn scaled_bounds_stay_ordered_for_negative_factors() {
        let bounds = Bounds::new(vec![-1.0, 10.0], vec![1.0, 20.0]);
        let scale = ScaleFactors::new(vec![-2.0, 10.0]).unwrap();
        let scaled = scale.scale_bounds(&bounds).unwrap();

        assert_eq!(scaled.lower, vec![-0.5, 1.0]);
        assert_eq!(scaled.upper, vec![0.5, 2.0]);
        assert!(scaled.validate().is_ok());
    }

    #[test]
    fn inverted_bounds_fail_validation() {
        let bounds = Bounds::new(vec![0.0, 5.0], vec![1.0, 4.0]);
        let err = bounds.validate().unwrap_err();
        assert!(matches!(
            err,
            crate::CalError::Config(ConfigError::InvalidBounds { dimension: 1, .. })
        ));
    }

    #[test]
    fn bounds_around_center() {
        let center = ParameterVector::new(vec![0.1, 5e9, 0.4]);
        let bounds = Bounds::around(&center, &[0.5, 4e6, 0.25]).unwrap();

        assert_relative_eq!(bounds.lower[1], 5e9 - 4e6);
        assert_relative_eq!(bounds.upper[2], 0.65);
        assert!(bounds.contains(&center));
    }

    #[test]
    fn clip_and_violation() {
        let bounds = Bounds::new(vec![0.0, 0.0], vec![1.0, 1.0]);
        let x = [1.5, -0.2];

        assert_eq!(bounds.first_violation(&x), Some(0));
        assert_eq!(bounds.clip(&x).as_slice(), &[1.0, 0.0]);
        assert!(bounds.contains_within(&[1.0 + 1e-12, 0.5], 1e-9));
        assert!(!bounds.contains_within(&[1.1, 0.5], 1e-9));
    }

    #[test]
    fn drive_parameters_keep_beta_for_two_dimensional_vectors() {
        let current = DriveParameters::new(0.05, 5e9, Some(0.3));
        let updated =
            DriveParameters::from_vector(&ParameterVector::new(vec![0.06, 5.001e9]), &current)
                .unwrap();

        assert_eq!(updated.beta, Some(0.3));
        assert_eq!(updated.to_vector(false).dim(), 2);
        assert_eq!(updated.to_vector(true).as_slice(), &[0.06, 5.001e9, 0.3]);
    }

    #[test]
    fn drive_parameters_reject_wrong_dimension() {
        let current = DriveParameters::new(0.05, 5e9, None);
        assert!(DriveParameters::from_vector(&ParameterVector::new(vec![1.0]), &current).is_err());
    }
}
