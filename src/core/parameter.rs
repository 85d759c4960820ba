//! Connection parameters: constants, per-connection arrays, random distributions and
//! distance-dependent kernels.
use rand::Rng;
use rand_distr::{Distribution, Exp, LogNormal, Normal, Uniform};
use serde::{Deserialize, Serialize};

use crate::error::KernelError;

/// A function of the distance between two nodes of spatial collections.
#[derive(Debug, PartialEq, Clone, Serialize, Deserialize)]
pub enum DistanceKernel {
    /// `p_center * exp(-d^2 / (2 sigma^2))`
    Gaussian { p_center: f64, sigma: f64 },
    /// `a * exp(-d / tau)`
    Exponential { a: f64, tau: f64 },
    /// `c + a * d`, clamped to be non-negative
    Linear { a: f64, c: f64 },
}

impl DistanceKernel {
    /// Evaluates the kernel at the given distance.
    pub fn eval(&self, distance: f64) -> f64 {
        match self {
            DistanceKernel::Gaussian { p_center, sigma } => {
                p_center * (-distance.powi(2) / (2.0 * sigma.powi(2))).exp()
            }
            DistanceKernel::Exponential { a, tau } => a * (-distance / tau).exp(),
            DistanceKernel::Linear { a, c } => (c + a * distance).max(0.0),
        }
    }
}

/// The expected layout of a per-connection array, following the iteration order of a rule.
#[derive(Debug, PartialEq, Clone, Copy)]
pub enum ArrayShape {
    /// A flat array with one value per connection.
    Flat(usize),
    /// A `rows x cols` matrix, e.g., one row per target and one column per incoming connection.
    Matrix { rows: usize, cols: usize },
}

/// A connection parameter such as a weight, a delay or a connection probability.
#[derive(Debug, PartialEq, Clone, Serialize, Deserialize)]
pub enum Parameter {
    /// The same value for every connection.
    Constant(f64),
    /// One value per connection, in the iteration order of the connection rule.
    Array(Vec<f64>),
    /// One row of values per driver node (target or source, depending on the rule).
    Matrix(Vec<Vec<f64>>),
    /// Uniform distribution on `[min, max)`.
    Uniform { min: f64, max: f64 },
    /// Normal distribution.
    Normal { mean: f64, std: f64 },
    /// Log-normal distribution.
    LogNormal { mu: f64, sigma: f64 },
    /// Exponential distribution with the given scale (mean).
    Exponential { beta: f64 },
    /// A function of the inter-node distance, for spatial collections only.
    Distance(DistanceKernel),
}

impl From<f64> for Parameter {
    fn from(value: f64) -> Self {
        Parameter::Constant(value)
    }
}

impl Parameter {
    /// Checks the distribution parameters.
    pub fn validate(&self) -> Result<(), KernelError> {
        let valid = match self {
            Parameter::Constant(value) => value.is_finite(),
            Parameter::Array(values) => values.iter().all(|v| v.is_finite()),
            Parameter::Matrix(rows) => rows.iter().flatten().all(|v| v.is_finite()),
            Parameter::Uniform { min, max } => min < max,
            Parameter::Normal { std, .. } => *std >= 0.0,
            Parameter::LogNormal { sigma, .. } => *sigma >= 0.0,
            Parameter::Exponential { beta } => *beta > 0.0,
            Parameter::Distance(DistanceKernel::Gaussian { sigma, .. }) => *sigma > 0.0,
            Parameter::Distance(DistanceKernel::Exponential { tau, .. }) => *tau > 0.0,
            Parameter::Distance(DistanceKernel::Linear { .. }) => true,
        };
        if valid {
            Ok(())
        } else {
            Err(KernelError::BadParameter(format!("Invalid parameter {:?}", self)))
        }
    }

    /// Returns true if the parameter requires random draws.
    pub fn is_random(&self) -> bool {
        matches!(
            self,
            Parameter::Uniform { .. }
                | Parameter::Normal { .. }
                | Parameter::LogNormal { .. }
                | Parameter::Exponential { .. }
        )
    }

    /// Returns true if the parameter depends on the distance between nodes.
    pub fn is_spatial(&self) -> bool {
        matches!(self, Parameter::Distance(_))
    }

    /// Returns true if the parameter holds explicit per-connection values.
    pub fn is_array(&self) -> bool {
        matches!(self, Parameter::Array(_) | Parameter::Matrix(_))
    }

    /// Checks that an array parameter matches the expected layout.
    /// Non-array parameters match any layout.
    pub fn check_shape(&self, shape: ArrayShape) -> Result<(), KernelError> {
        let mismatch = |found: String| {
            Err(KernelError::BadParameter(format!(
                "Parameter array of shape {} does not match the expected {:?}",
                found, shape
            )))
        };
        match (self, shape) {
            (Parameter::Array(values), ArrayShape::Flat(len)) if values.len() != len => {
                mismatch(values.len().to_string())
            }
            (Parameter::Array(values), ArrayShape::Matrix { rows, cols })
                if values.len() != rows * cols =>
            {
                mismatch(values.len().to_string())
            }
            (Parameter::Matrix(values), ArrayShape::Matrix { rows, cols })
                if values.len() != rows || values.iter().any(|row| row.len() != cols) =>
            {
                mismatch(format!("{}x?", values.len()))
            }
            (Parameter::Matrix(values), ArrayShape::Flat(len))
                if values.len() != len || values.iter().any(|row| row.len() != 1) =>
            {
                mismatch(format!("{}x?", values.len()))
            }
            _ => Ok(()),
        }
    }

    /// Returns the value for the connection at the given position of the rule's iteration order.
    ///
    /// `index` is the flat position of the connection, `(row, col)` its position as a matrix
    /// entry, and `distance` the distance between the nodes of spatial collections.
    pub fn value<R: Rng>(
        &self,
        rng: &mut R,
        index: usize,
        row: usize,
        col: usize,
        distance: Option<f64>,
    ) -> Result<f64, KernelError> {
        match self {
            Parameter::Constant(value) => Ok(*value),
            Parameter::Array(values) => values.get(index).copied().ok_or_else(|| {
                KernelError::BadParameter(format!("No parameter value for connection {}", index))
            }),
            Parameter::Matrix(values) => values
                .get(row)
                .and_then(|r| r.get(col))
                .copied()
                .ok_or_else(|| {
                    KernelError::BadParameter(format!(
                        "No parameter value for connection ({}, {})",
                        row, col
                    ))
                }),
            Parameter::Uniform { min, max } => Ok(Uniform::new(*min, *max).sample(rng)),
            Parameter::Normal { mean, std } => Normal::new(*mean, *std)
                .map(|dist| dist.sample(rng))
                .map_err(|e| KernelError::BadParameter(e.to_string())),
            Parameter::LogNormal { mu, sigma } => LogNormal::new(*mu, *sigma)
                .map(|dist| dist.sample(rng))
                .map_err(|e| KernelError::BadParameter(e.to_string())),
            Parameter::Exponential { beta } => Exp::new(1.0 / beta)
                .map(|dist| dist.sample(rng))
                .map_err(|e| KernelError::BadParameter(e.to_string())),
            Parameter::Distance(kernel) => match distance {
                Some(distance) => Ok(kernel.eval(distance)),
                None => Err(KernelError::BadParameter(
                    "Distance-dependent parameters require spatial collections".to_string(),
                )),
            },
        }
    }

    /// Returns the value of a parameter that does not require any random draw.
    pub fn deterministic_value(&self, index: usize, row: usize, col: usize, distance: Option<f64>) -> Option<f64> {
        match self {
            Parameter::Constant(value) => Some(*value),
            Parameter::Array(values) => values.get(index).copied(),
            Parameter::Matrix(values) => values.get(row).and_then(|r| r.get(col)).copied(),
            Parameter::Distance(kernel) => distance.map(|d| kernel.eval(d)),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use rand::{rngs::StdRng, SeedableRng};

    #[test]
    fn test_constant_and_arrays() {
        let mut rng = StdRng::seed_from_u64(42);
        assert_eq!(Parameter::Constant(2.5).value(&mut rng, 7, 0, 0, None).unwrap(), 2.5);

        let array = Parameter::Array(vec![1.0, 2.0, 3.0]);
        assert_eq!(array.value(&mut rng, 1, 0, 0, None).unwrap(), 2.0);
        assert!(array.value(&mut rng, 3, 0, 0, None).is_err());

        let matrix = Parameter::Matrix(vec![vec![1.0, 2.0], vec![3.0, 4.0]]);
        assert_eq!(matrix.value(&mut rng, 0, 1, 0, None).unwrap(), 3.0);
    }

    #[test]
    fn test_check_shape() {
        let array = Parameter::Array(vec![1.0; 6]);
        assert!(array.check_shape(ArrayShape::Flat(6)).is_ok());
        assert!(array.check_shape(ArrayShape::Matrix { rows: 2, cols: 3 }).is_ok());
        assert!(array.check_shape(ArrayShape::Flat(5)).is_err());

        let matrix = Parameter::Matrix(vec![vec![1.0; 3]; 2]);
        assert!(matrix.check_shape(ArrayShape::Matrix { rows: 2, cols: 3 }).is_ok());
        assert!(matrix.check_shape(ArrayShape::Matrix { rows: 3, cols: 2 }).is_err());

        assert!(Parameter::Constant(1.0).check_shape(ArrayShape::Flat(10)).is_ok());
    }

    #[test]
    fn test_random_parameters() {
        let mut rng = StdRng::seed_from_u64(42);
        let uniform = Parameter::Uniform { min: 1.0, max: 2.0 };
        for _ in 0..100 {
            let value = uniform.value(&mut rng, 0, 0, 0, None).unwrap();
            assert!((1.0..2.0).contains(&value));
        }
        assert!(uniform.is_random());
        assert!(Parameter::Uniform { min: 2.0, max: 1.0 }.validate().is_err());
        assert!(Parameter::Exponential { beta: 0.0 }.validate().is_err());
    }

    #[test]
    fn test_distance_kernels() {
        let mut rng = StdRng::seed_from_u64(42);
        let gaussian = Parameter::Distance(DistanceKernel::Gaussian {
            p_center: 1.0,
            sigma: 1.0,
        });
        assert_relative_eq!(gaussian.value(&mut rng, 0, 0, 0, Some(0.0)).unwrap(), 1.0);
        assert_relative_eq!(
            gaussian.value(&mut rng, 0, 0, 0, Some(1.0)).unwrap(),
            (-0.5_f64).exp()
        );
        assert!(gaussian.value(&mut rng, 0, 0, 0, None).is_err());

        let linear = DistanceKernel::Linear { a: -1.0, c: 0.5 };
        assert_eq!(linear.eval(2.0), 0.0);
    }
}
