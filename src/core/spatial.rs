//! Spatial layers: two-dimensional node positions, periodic boundaries and masks.
use rand::Rng;
use rand_distr::{Distribution, Uniform};
use serde::{Deserialize, Serialize};

use crate::error::KernelError;

/// How the positions of a spatial layer are specified at creation.
#[derive(Debug, PartialEq, Clone, Serialize, Deserialize)]
pub enum Positions {
    /// A regular grid of `shape = [columns, rows]` nodes. The extent defaults to one unit per node.
    Grid {
        shape: [usize; 2],
        extent: Option<[f64; 2]>,
        center: [f64; 2],
        edge_wrap: bool,
    },
    /// Explicit positions. The extent defaults to the bounding box of the positions plus one unit.
    Free {
        positions: Vec<[f64; 2]>,
        extent: Option<[f64; 2]>,
        center: [f64; 2],
        edge_wrap: bool,
    },
    /// Uniformly random positions within the extent.
    Random {
        num_nodes: usize,
        extent: [f64; 2],
        center: [f64; 2],
        edge_wrap: bool,
    },
}

impl Positions {
    /// Returns the number of nodes described by the positions.
    pub fn num_nodes(&self) -> usize {
        match self {
            Positions::Grid { shape, .. } => shape[0] * shape[1],
            Positions::Free { positions, .. } => positions.len(),
            Positions::Random { num_nodes, .. } => *num_nodes,
        }
    }

    /// Build the layer metadata. Random positions are drawn from the provided generator.
    pub fn build_layer<R: Rng>(&self, rng: &mut R) -> Result<Layer, KernelError> {
        match self {
            Positions::Grid {
                shape,
                extent,
                center,
                edge_wrap,
            } => {
                let [columns, rows] = *shape;
                if columns == 0 || rows == 0 {
                    return Err(KernelError::BadParameter(
                        "Grid shape must be positive".to_string(),
                    ));
                }
                let extent = extent.unwrap_or([columns as f64, rows as f64]);
                check_extent(&extent)?;
                let dx = extent[0] / columns as f64;
                let dy = extent[1] / rows as f64;
                let left = center[0] - 0.5 * extent[0];
                let top = center[1] + 0.5 * extent[1];
                let positions = (0..columns)
                    .flat_map(|column| {
                        (0..rows).map(move |row| {
                            [
                                left + dx * (column as f64 + 0.5),
                                top - dy * (row as f64 + 0.5),
                            ]
                        })
                    })
                    .collect();
                Ok(Layer {
                    positions,
                    extent,
                    center: *center,
                    edge_wrap: *edge_wrap,
                    shape: Some(*shape),
                })
            }
            Positions::Free {
                positions,
                extent,
                center,
                edge_wrap,
            } => {
                if positions.is_empty() {
                    return Err(KernelError::BadParameter(
                        "Free positions must not be empty".to_string(),
                    ));
                }
                let extent = match extent {
                    Some(extent) => *extent,
                    None => {
                        let span = |axis: usize| {
                            let min = positions.iter().map(|p| p[axis]).fold(f64::INFINITY, f64::min);
                            let max = positions
                                .iter()
                                .map(|p| p[axis])
                                .fold(f64::NEG_INFINITY, f64::max);
                            max - min + 1.0
                        };
                        [span(0), span(1)]
                    }
                };
                check_extent(&extent)?;
                let layer = Layer {
                    positions: positions.clone(),
                    extent,
                    center: *center,
                    edge_wrap: *edge_wrap,
                    shape: None,
                };
                if positions.iter().any(|p| !layer.is_inside(p)) {
                    return Err(KernelError::BadParameter(
                        "All positions must lie within the layer extent".to_string(),
                    ));
                }
                Ok(layer)
            }
            Positions::Random {
                num_nodes,
                extent,
                center,
                edge_wrap,
            } => {
                check_extent(extent)?;
                let x = Uniform::new(center[0] - 0.5 * extent[0], center[0] + 0.5 * extent[0]);
                let y = Uniform::new(center[1] - 0.5 * extent[1], center[1] + 0.5 * extent[1]);
                let positions = (0..*num_nodes)
                    .map(|_| [x.sample(rng), y.sample(rng)])
                    .collect();
                Ok(Layer {
                    positions,
                    extent: *extent,
                    center: *center,
                    edge_wrap: *edge_wrap,
                    shape: None,
                })
            }
        }
    }
}

fn check_extent(extent: &[f64; 2]) -> Result<(), KernelError> {
    if extent.iter().any(|e| !(e.is_finite() && *e > 0.0)) {
        return Err(KernelError::BadParameter(
            "Layer extent must be positive".to_string(),
        ));
    }
    Ok(())
}

/// Spatial metadata of a collection.
#[derive(Debug, PartialEq, Clone, Serialize, Deserialize)]
pub struct Layer {
    positions: Vec<[f64; 2]>,
    extent: [f64; 2],
    center: [f64; 2],
    edge_wrap: bool,
    shape: Option<[usize; 2]>,
}

impl Layer {
    /// Returns the positions of the nodes, in collection order.
    pub fn positions(&self) -> &[[f64; 2]] {
        &self.positions
    }

    /// Returns the position of the node at the given collection index.
    pub fn position(&self, index: usize) -> Option<[f64; 2]> {
        self.positions.get(index).copied()
    }

    /// Returns the extent of the layer.
    pub fn extent(&self) -> [f64; 2] {
        self.extent
    }

    /// Returns the center of the layer.
    pub fn center(&self) -> [f64; 2] {
        self.center
    }

    /// Returns true if the layer has periodic boundary conditions.
    pub fn edge_wrap(&self) -> bool {
        self.edge_wrap
    }

    /// Returns the grid shape, for grid layers.
    pub fn shape(&self) -> Option<[usize; 2]> {
        self.shape
    }

    fn is_inside(&self, p: &[f64; 2]) -> bool {
        (0..2).all(|axis| (p[axis] - self.center[axis]).abs() <= 0.5 * self.extent[axis])
    }

    /// Returns the displacement from `from` to `to`, taking periodic boundaries into account.
    pub fn displacement(&self, from: [f64; 2], to: [f64; 2]) -> [f64; 2] {
        let mut d = [to[0] - from[0], to[1] - from[1]];
        if self.edge_wrap {
            for axis in 0..2 {
                d[axis] -= self.extent[axis] * (d[axis] / self.extent[axis]).round();
            }
        }
        d
    }

    /// Returns the euclidean distance between two positions.
    pub fn distance(&self, from: [f64; 2], to: [f64; 2]) -> f64 {
        let d = self.displacement(from, to);
        d[0].hypot(d[1])
    }
}

/// A region relative to the driver node selecting the candidate partners of a spatial connection.
#[derive(Debug, PartialEq, Clone, Serialize, Deserialize)]
pub enum Mask {
    /// Every displacement shorter than the radius.
    Circular { radius: f64 },
    /// Every displacement inside the axis-aligned rectangle.
    Rectangular {
        lower_left: [f64; 2],
        upper_right: [f64; 2],
    },
    /// Every displacement of length in `[inner_radius, outer_radius]`.
    Annulus { inner_radius: f64, outer_radius: f64 },
}

impl Mask {
    /// Checks the mask parameters.
    pub fn validate(&self) -> Result<(), KernelError> {
        let valid = match self {
            Mask::Circular { radius } => *radius > 0.0,
            Mask::Rectangular {
                lower_left,
                upper_right,
            } => lower_left[0] < upper_right[0] && lower_left[1] < upper_right[1],
            Mask::Annulus {
                inner_radius,
                outer_radius,
            } => *inner_radius >= 0.0 && inner_radius < outer_radius,
        };
        if valid {
            Ok(())
        } else {
            Err(KernelError::BadParameter(format!("Invalid mask {:?}", self)))
        }
    }

    /// Returns true if the displacement lies inside the mask.
    pub fn contains(&self, displacement: [f64; 2]) -> bool {
        match self {
            Mask::Circular { radius } => displacement[0].hypot(displacement[1]) <= *radius,
            Mask::Rectangular {
                lower_left,
                upper_right,
            } => (0..2).all(|axis| {
                displacement[axis] >= lower_left[axis] && displacement[axis] <= upper_right[axis]
            }),
            Mask::Annulus {
                inner_radius,
                outer_radius,
            } => {
                let r = displacement[0].hypot(displacement[1]);
                r >= *inner_radius && r <= *outer_radius
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use rand::{rngs::StdRng, SeedableRng};

    #[test]
    fn test_grid_positions() {
        let mut rng = StdRng::seed_from_u64(0);
        let layer = Positions::Grid {
            shape: [2, 3],
            extent: Some([2.0, 3.0]),
            center: [0.0, 0.0],
            edge_wrap: false,
        }
        .build_layer(&mut rng)
        .unwrap();
        assert_eq!(layer.positions().len(), 6);
        assert_relative_eq!(layer.position(0).unwrap()[0], -0.5);
        assert_relative_eq!(layer.position(0).unwrap()[1], 1.0);
        assert_relative_eq!(layer.position(5).unwrap()[0], 0.5);
        assert_relative_eq!(layer.position(5).unwrap()[1], -1.0);
    }

    #[test]
    fn test_periodic_distance() {
        let mut rng = StdRng::seed_from_u64(0);
        let layer = Positions::Free {
            positions: vec![[-0.45, 0.0], [0.45, 0.0]],
            extent: Some([1.0, 1.0]),
            center: [0.0, 0.0],
            edge_wrap: true,
        }
        .build_layer(&mut rng)
        .unwrap();
        assert_relative_eq!(
            layer.distance([-0.45, 0.0], [0.45, 0.0]),
            0.1,
            epsilon = 1e-12
        );
    }

    #[test]
    fn test_free_positions_outside_extent() {
        let mut rng = StdRng::seed_from_u64(0);
        let result = Positions::Free {
            positions: vec![[2.0, 0.0]],
            extent: Some([1.0, 1.0]),
            center: [0.0, 0.0],
            edge_wrap: false,
        }
        .build_layer(&mut rng);
        assert!(matches!(result, Err(KernelError::BadParameter(_))));
    }

    #[test]
    fn test_masks() {
        let circle = Mask::Circular { radius: 1.0 };
        assert!(circle.contains([0.5, 0.5]));
        assert!(!circle.contains([1.0, 0.5]));

        let rectangle = Mask::Rectangular {
            lower_left: [-0.5, -0.5],
            upper_right: [0.5, 1.0],
        };
        assert!(rectangle.contains([0.0, 0.9]));
        assert!(!rectangle.contains([0.0, -0.9]));

        assert!(Mask::Circular { radius: -1.0 }.validate().is_err());
        assert!(Mask::Annulus {
            inner_radius: 1.0,
            outer_radius: 0.5
        }
        .validate()
        .is_err());
    }
}
