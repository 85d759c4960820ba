//! Quantization grid of the simulation and the precise (off-grid) spike time representation.
//!
//! Simulated time is counted in integer tics. A simulation step spans `tics_per_step` tics, and
//! the resolution (in ms) is `tics_per_step / tics_per_ms`. Spike times of grid-constrained
//! units are integer steps; spike times of precise units are an integer step plus an offset in
//! `(0, resolution]`, such that the time in ms is `step * resolution + offset`.
use serde::{Deserialize, Serialize};

use crate::error::KernelError;

/// Relative tolerance used when checking that a value in ms is a whole number of tics.
pub const TIC_TOLERANCE: f64 = 1e-6;

/// The quantization grid shared by the whole kernel.
#[derive(Debug, PartialEq, Clone, Copy, Serialize, Deserialize)]
pub struct TimeGrid {
    tics_per_ms: f64,
    tics_per_step: i64,
}

impl TimeGrid {
    /// Create a new grid with the specified resolution (in ms) and tics per ms.
    /// Returns an error if the resolution is not a positive whole number of tics.
    pub fn build(resolution: f64, tics_per_ms: f64) -> Result<Self, KernelError> {
        if !(tics_per_ms.is_finite() && tics_per_ms > 0.0) {
            return Err(KernelError::BadParameter(
                "tics_per_ms must be positive and finite".to_string(),
            ));
        }
        if !(resolution.is_finite() && resolution > 0.0) {
            return Err(KernelError::BadParameter(
                "resolution must be positive and finite".to_string(),
            ));
        }
        let tics = resolution * tics_per_ms;
        let rounded = tics.round();
        if rounded < 1.0 || (tics - rounded).abs() > TIC_TOLERANCE * rounded.max(1.0) {
            return Err(KernelError::BadParameter(format!(
                "resolution {} ms must be a positive multiple of the tic length {} ms",
                resolution,
                1.0 / tics_per_ms
            )));
        }
        Ok(TimeGrid {
            tics_per_ms,
            tics_per_step: rounded as i64,
        })
    }

    /// Returns the number of tics per ms.
    pub fn tics_per_ms(&self) -> f64 {
        self.tics_per_ms
    }

    /// Returns the number of tics per simulation step.
    pub fn tics_per_step(&self) -> i64 {
        self.tics_per_step
    }

    /// Returns the simulation resolution in ms.
    pub fn resolution(&self) -> f64 {
        self.tics_per_step as f64 / self.tics_per_ms
    }

    /// Converts a duration in ms to the nearest number of tics.
    pub fn ms_to_tics(&self, ms: f64) -> i64 {
        (ms * self.tics_per_ms).round() as i64
    }

    /// Converts a number of steps to ms.
    pub fn steps_to_ms(&self, steps: i64) -> f64 {
        (steps * self.tics_per_step) as f64 / self.tics_per_ms
    }

    /// Returns true if the value in ms is a whole number of steps.
    pub fn is_on_grid(&self, ms: f64) -> bool {
        let tics = ms * self.tics_per_ms;
        let rounded = tics.round();
        (tics - rounded).abs() <= TIC_TOLERANCE * rounded.abs().max(1.0)
            && (rounded as i64) % self.tics_per_step == 0
    }

    /// Converts a value in ms to a whole number of steps.
    /// Returns an error if the value is not on the grid.
    pub fn ms_to_steps(&self, ms: f64) -> Result<i64, KernelError> {
        if !ms.is_finite() {
            return Err(KernelError::BadParameter(format!("{} ms is not finite", ms)));
        }
        if !self.is_on_grid(ms) {
            return Err(KernelError::BadParameter(format!(
                "{} ms is not a multiple of the resolution {} ms",
                ms,
                self.resolution()
            )));
        }
        Ok(self.ms_to_tics(ms) / self.tics_per_step)
    }

    /// Converts a value in ms to the nearest number of steps.
    pub fn ms_to_steps_nearest(&self, ms: f64) -> i64 {
        let tics = self.ms_to_tics(ms);
        (tics as f64 / self.tics_per_step as f64).round() as i64
    }

    /// Converts a value in ms to the smallest number of steps whose time is not earlier than the value.
    pub fn ms_to_steps_ceil(&self, ms: f64) -> i64 {
        let tics = self.ms_to_tics(ms);
        tics.div_euclid(self.tics_per_step) + i64::from(tics.rem_euclid(self.tics_per_step) != 0)
    }

    /// Quantizes a synaptic delay in ms to a number of steps.
    ///
    /// Delays must span at least one step. Off-grid delays are rejected unless `allow_offgrid`
    /// is set, in which case they are rounded to the nearest step.
    pub fn delay_to_steps(&self, delay: f64, allow_offgrid: bool) -> Result<i64, KernelError> {
        if !delay.is_finite() {
            return Err(KernelError::BadDelay(format!("delay {} ms is not finite", delay)));
        }
        let steps = if self.is_on_grid(delay) {
            self.ms_to_tics(delay) / self.tics_per_step
        } else if allow_offgrid {
            self.ms_to_steps_nearest(delay)
        } else {
            return Err(KernelError::BadDelay(format!(
                "delay {} ms is not representable at resolution {} ms",
                delay,
                self.resolution()
            )));
        };
        if steps < 1 {
            return Err(KernelError::BadDelay(format!(
                "delay {} ms must be at least the resolution {} ms",
                delay,
                self.resolution()
            )));
        }
        Ok(steps)
    }
}

impl Default for TimeGrid {
    fn default() -> Self {
        TimeGrid {
            tics_per_ms: 1000.0,
            tics_per_step: 100,
        }
    }
}

/// A spike time made of an integer step and a sub-step offset.
///
/// The time in ms is `step * resolution + offset`. Grid-constrained times have a zero offset,
/// precise times have an offset in `(0, resolution]`.
#[derive(Debug, PartialEq, Clone, Copy, Serialize, Deserialize)]
pub struct PreciseTime {
    /// The integer step.
    pub step: i64,
    /// The offset in ms after the start of the step.
    pub offset: f64,
}

impl PreciseTime {
    /// A time lying exactly on the grid.
    pub fn on_grid(step: i64) -> Self {
        PreciseTime { step, offset: 0.0 }
    }

    /// Splits a time in ms into a step and an offset in `(0, resolution]`.
    pub fn from_ms(time: f64, grid: &TimeGrid) -> Self {
        let resolution = grid.resolution();
        let mut step = (time / resolution).ceil() as i64 - 1;
        let mut offset = time - grid.steps_to_ms(step);
        if offset <= 0.0 {
            step -= 1;
            offset += resolution;
        } else if offset > resolution {
            step += 1;
            offset -= resolution;
        }
        PreciseTime { step, offset }
    }

    /// Recombines the step and the offset into a time in ms.
    pub fn to_ms(&self, grid: &TimeGrid) -> f64 {
        grid.steps_to_ms(self.step) + self.offset
    }

    /// Returns true if the time carries no sub-step offset.
    pub fn is_grid(&self) -> bool {
        self.offset == 0.0
    }

    /// Returns the first grid step not earlier than the time.
    /// A spike emitted during the update from step `j` to `j + 1` is stamped `j + 1`.
    pub fn stamp(&self) -> i64 {
        if self.is_grid() {
            self.step
        } else {
            self.step + 1
        }
    }

    /// Returns the same time shifted by a whole number of steps.
    pub fn shifted(&self, steps: i64) -> Self {
        PreciseTime {
            step: self.step + steps,
            offset: self.offset,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_grid() {
        let grid = TimeGrid::build(0.1, 1000.0).unwrap();
        assert_eq!(grid.tics_per_step(), 100);
        assert_eq!(grid.resolution(), 0.1);

        assert!(matches!(
            TimeGrid::build(0.0005, 1000.0),
            Err(KernelError::BadParameter(_))
        ));
        assert!(matches!(
            TimeGrid::build(0.1234, 1000.0),
            Err(KernelError::BadParameter(_))
        ));
        assert!(matches!(
            TimeGrid::build(-0.1, 1000.0),
            Err(KernelError::BadParameter(_))
        ));
    }

    #[test]
    fn test_ms_to_steps() {
        let grid = TimeGrid::build(0.1, 1000.0).unwrap();
        assert_eq!(grid.ms_to_steps(1.5).unwrap(), 15);
        assert_eq!(grid.ms_to_steps(0.3).unwrap(), 3);
        assert!(grid.ms_to_steps(0.15).is_err());
        assert_eq!(grid.ms_to_steps_ceil(0.15), 2);
        assert_eq!(grid.ms_to_steps_ceil(0.2), 2);
        assert_eq!(grid.ms_to_steps_nearest(0.14), 1);
    }

    #[test]
    fn test_delay_to_steps() {
        let grid = TimeGrid::build(0.1, 1000.0).unwrap();
        assert_eq!(grid.delay_to_steps(1.0, false).unwrap(), 10);
        assert!(matches!(
            grid.delay_to_steps(0.25, false),
            Err(KernelError::BadDelay(_))
        ));
        assert_eq!(grid.delay_to_steps(0.26, true).unwrap(), 3);
        assert!(matches!(
            grid.delay_to_steps(0.0, false),
            Err(KernelError::BadDelay(_))
        ));
        assert!(matches!(
            grid.delay_to_steps(0.01, true),
            Err(KernelError::BadDelay(_))
        ));
    }

    #[test]
    fn test_precise_time_offset_range() {
        let grid = TimeGrid::build(0.1, 1000.0).unwrap();

        let time = PreciseTime::from_ms(0.3, &grid);
        assert_eq!(time.step, 2);
        assert!(time.offset > 0.0 && time.offset <= 0.1);

        let time = PreciseTime::from_ms(0.3456, &grid);
        assert_eq!(time.step, 3);
        assert!((time.offset - 0.0456).abs() < 1e-12);
        assert_eq!(time.stamp(), 4);
        assert_eq!(time.shifted(-2).step, 1);
        assert_eq!(PreciseTime::on_grid(4).stamp(), 4);
    }

    #[test]
    fn test_precise_time_round_trip() {
        for resolution in [1.0, 0.1, 0.03, 0.01, 0.001] {
            let grid = TimeGrid::build(resolution, 1000.0).unwrap();
            for time in [0.1234567, 1.0, 3.3, 17.891011, 99.99999, 250.0] {
                let precise = PreciseTime::from_ms(time, &grid);
                assert!(precise.offset > 0.0 && precise.offset <= resolution * (1.0 + 1e-12));
                let recovered = precise.to_ms(&grid);
                assert!(((recovered - time) / time).abs() <= 1e-14);
            }
        }
    }
}
