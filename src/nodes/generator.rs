//! Stimulation devices: Poisson spike sources and spike generators replaying given spike times.
use rand_distr::{Distribution, Poisson};
use serde::{Deserialize, Serialize};

use super::{Dynamics, Emission, StepContext};
use crate::core::time::{PreciseTime, TimeGrid};
use crate::core::{KernelRng, ParamDict};
use crate::error::KernelError;
use crate::nodes::buffer::InEvent;

fn flag(value: f64, key: &str) -> Result<bool, KernelError> {
    if value == 0.0 {
        Ok(false)
    } else if value == 1.0 {
        Ok(true)
    } else {
        Err(KernelError::BadProperty(format!(
            "Property {} expects 0 or 1, got {}",
            key, value
        )))
    }
}

/// A source of Poisson spike trains.
///
/// At each step within its activity window, the generator draws the number of spikes it emits
/// from a Poisson distribution of mean `rate * h`. The draw is a single event of that multiplicity.
#[derive(Debug, PartialEq, Clone, Serialize, Deserialize)]
pub struct PoissonGenerator {
    /// Mean firing rate in Hz.
    rate: f64,
    /// Activity starts after this time, in ms.
    start: f64,
    /// Activity stops after this time, in ms.
    stop: f64,
}

impl Default for PoissonGenerator {
    fn default() -> Self {
        PoissonGenerator {
            rate: 0.0,
            start: 0.0,
            stop: f64::INFINITY,
        }
    }
}

impl PoissonGenerator {
    fn is_active(&self, stamp: i64, grid: &TimeGrid) -> bool {
        let time = grid.steps_to_ms(stamp);
        time > self.start && time <= self.stop
    }
}

impl Dynamics for PoissonGenerator {
    fn handle(&mut self, _event: &InEvent) {}

    fn update(&mut self, ctx: &StepContext, rng: &mut KernelRng, emitted: &mut Vec<Emission>) {
        if self.rate <= 0.0 || !self.is_active(ctx.step + 1, ctx.grid) {
            return;
        }
        let mean = self.rate * ctx.grid.resolution() * 1e-3;
        if let Ok(poisson) = Poisson::new(mean) {
            let num_spikes: f64 = poisson.sample(rng);
            if num_spikes >= 1.0 {
                emitted.push(Emission {
                    time: PreciseTime::on_grid(ctx.step + 1),
                    multiplicity: num_spikes as u32,
                });
            }
        }
    }

    fn get_status(&self) -> ParamDict {
        crate::core::params(&[("rate", self.rate), ("start", self.start), ("stop", self.stop)])
    }

    fn set_status(&mut self, params: &ParamDict, grid: &TimeGrid) -> Result<(), KernelError> {
        let mut new = self.clone();
        for (key, value) in params.iter() {
            match key.as_str() {
                "rate" => new.rate = *value,
                "start" => new.start = *value,
                "stop" => new.stop = *value,
                _ => {
                    return Err(KernelError::BadProperty(format!(
                        "Unknown property {} of poisson_generator",
                        key
                    )))
                }
            }
        }
        if !(new.rate >= 0.0 && new.rate.is_finite()) {
            return Err(KernelError::BadProperty(
                "The rate must be non-negative and finite".to_string(),
            ));
        }
        if new.stop < new.start {
            return Err(KernelError::BadProperty(
                "stop must not be earlier than start".to_string(),
            ));
        }
        for time in [new.start, new.stop].into_iter().filter(|t| t.is_finite()) {
            if !grid.is_on_grid(time) {
                return Err(KernelError::BadProperty(format!(
                    "{} ms is not a multiple of the resolution",
                    time
                )));
            }
        }
        *self = new;
        Ok(())
    }
}

/// A device emitting spikes at given times.
///
/// Times must be positive and sorted. Unless `precise_times` is set, they must lie on the grid;
/// with `allow_offgrid_times`, off-grid times are rounded up to the next grid point instead of
/// being rejected. With `precise_times`, the spikes are emitted with their exact offset.
#[derive(Debug, PartialEq, Clone, Default, Serialize, Deserialize)]
pub struct SpikeGenerator {
    spike_times: Vec<f64>,
    spike_multiplicities: Vec<u32>,
    precise_times: bool,
    allow_offgrid_times: bool,
    /// The emissions, sorted by the step of the update emitting them.
    schedule: Vec<(i64, Emission)>,
    next: usize,
}

impl SpikeGenerator {
    /// Returns the spike times in ms.
    pub fn spike_times(&self) -> &[f64] {
        &self.spike_times
    }

    /// Returns the spike multiplicities. Empty if every spike has multiplicity one.
    pub fn spike_multiplicities(&self) -> &[u32] {
        &self.spike_multiplicities
    }

    /// Set the spike times (ms) and, optionally, their multiplicities.
    /// Nothing changes if the times are invalid.
    pub fn set_spike_times(
        &mut self,
        spike_times: Vec<f64>,
        spike_multiplicities: Vec<u32>,
        grid: &TimeGrid,
    ) -> Result<(), KernelError> {
        let schedule = Self::build_schedule(
            &spike_times,
            &spike_multiplicities,
            self.precise_times,
            self.allow_offgrid_times,
            grid,
        )?;
        self.spike_times = spike_times;
        self.spike_multiplicities = spike_multiplicities;
        self.schedule = schedule;
        self.next = 0;
        Ok(())
    }

    fn build_schedule(
        spike_times: &[f64],
        spike_multiplicities: &[u32],
        precise_times: bool,
        allow_offgrid_times: bool,
        grid: &TimeGrid,
    ) -> Result<Vec<(i64, Emission)>, KernelError> {
        if !spike_multiplicities.is_empty() && spike_multiplicities.len() != spike_times.len() {
            return Err(KernelError::BadProperty(format!(
                "{} multiplicities given for {} spike times",
                spike_multiplicities.len(),
                spike_times.len()
            )));
        }
        if spike_times.windows(2).any(|w| w[1] < w[0]) {
            return Err(KernelError::BadProperty(
                "Spike times must be sorted in non-descending order".to_string(),
            ));
        }

        let mut schedule = Vec::with_capacity(spike_times.len());
        for (i, &t) in spike_times.iter().enumerate() {
            if !(t > 0.0 && t.is_finite()) {
                return Err(KernelError::BadProperty(format!(
                    "Spike time {} ms must be positive and finite",
                    t
                )));
            }
            let multiplicity = spike_multiplicities.get(i).copied().unwrap_or(1);
            let time = if precise_times {
                PreciseTime::from_ms(t, grid)
            } else if grid.is_on_grid(t) {
                PreciseTime::on_grid(grid.ms_to_steps(t)?)
            } else if allow_offgrid_times {
                PreciseTime::on_grid(grid.ms_to_steps_ceil(t))
            } else {
                return Err(KernelError::BadProperty(format!(
                    "Spike time {} ms is not a multiple of the resolution {} ms",
                    t,
                    grid.resolution()
                )));
            };
            if multiplicity > 0 {
                schedule.push((time.stamp() - 1, Emission { time, multiplicity }));
            }
        }
        Ok(schedule)
    }
}

impl Dynamics for SpikeGenerator {
    fn handle(&mut self, _event: &InEvent) {}

    fn update(&mut self, ctx: &StepContext, _rng: &mut KernelRng, emitted: &mut Vec<Emission>) {
        while let Some((step, emission)) = self.schedule.get(self.next) {
            if *step > ctx.step {
                break;
            }
            if *step == ctx.step {
                emitted.push(emission.clone());
            }
            self.next += 1;
        }
    }

    fn get_status(&self) -> ParamDict {
        crate::core::params(&[
            ("precise_times", f64::from(u8::from(self.precise_times))),
            ("allow_offgrid_times", f64::from(u8::from(self.allow_offgrid_times))),
            ("num_spikes", self.spike_times.len() as f64),
        ])
    }

    fn set_status(&mut self, params: &ParamDict, grid: &TimeGrid) -> Result<(), KernelError> {
        let mut precise_times = self.precise_times;
        let mut allow_offgrid_times = self.allow_offgrid_times;
        for (key, value) in params.iter() {
            match key.as_str() {
                "precise_times" => precise_times = flag(*value, key)?,
                "allow_offgrid_times" => allow_offgrid_times = flag(*value, key)?,
                _ => {
                    return Err(KernelError::BadProperty(format!(
                        "Unknown property {} of spike_generator",
                        key
                    )))
                }
            }
        }
        if precise_times && allow_offgrid_times {
            return Err(KernelError::BadProperty(
                "precise_times and allow_offgrid_times are mutually exclusive".to_string(),
            ));
        }
        let schedule = Self::build_schedule(
            &self.spike_times,
            &self.spike_multiplicities,
            precise_times,
            allow_offgrid_times,
            grid,
        )?;
        self.precise_times = precise_times;
        self.allow_offgrid_times = allow_offgrid_times;
        self.schedule = schedule;
        self.next = 0;
        Ok(())
    }

    fn is_precise(&self) -> bool {
        self.precise_times
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{params, stream_rng};

    fn run(generator: &mut impl Dynamics, steps: i64, grid: &TimeGrid) -> Vec<Emission> {
        let mut rng = stream_rng(42, 1);
        let mut emitted = vec![];
        for step in 0..steps {
            let ctx = StepContext {
                step,
                grid,
                gap: None,
            };
            generator.update(&ctx, &mut rng, &mut emitted);
        }
        emitted
    }

    #[test]
    fn test_spike_generator_on_grid() {
        let grid = TimeGrid::default();
        let mut generator = SpikeGenerator::default();
        generator
            .set_spike_times(vec![0.1, 0.5, 0.5, 2.0], vec![1, 2, 1, 3], &grid)
            .unwrap();
        let emitted = run(&mut generator, 30, &grid);
        let stamps: Vec<(i64, u32)> = emitted
            .iter()
            .map(|e| (e.time.stamp(), e.multiplicity))
            .collect();
        assert_eq!(stamps, vec![(1, 1), (5, 2), (5, 1), (20, 3)]);
    }

    #[test]
    fn test_spike_generator_rejections() {
        let grid = TimeGrid::default();
        let mut generator = SpikeGenerator::default();
        assert!(generator.set_spike_times(vec![0.15], vec![], &grid).is_err());
        assert!(generator.set_spike_times(vec![0.0], vec![], &grid).is_err());
        assert!(generator.set_spike_times(vec![0.5, 0.2], vec![], &grid).is_err());
        assert!(generator.set_spike_times(vec![0.5], vec![1, 1], &grid).is_err());

        generator
            .set_status(&params(&[("allow_offgrid_times", 1.0)]), &grid)
            .unwrap();
        generator.set_spike_times(vec![0.15], vec![], &grid).unwrap();
        let emitted = run(&mut generator, 5, &grid);
        assert_eq!(emitted[0].time, PreciseTime::on_grid(2));
    }

    #[test]
    fn test_spike_generator_precise() {
        let grid = TimeGrid::default();
        let mut generator = SpikeGenerator::default();
        generator
            .set_status(&params(&[("precise_times", 1.0)]), &grid)
            .unwrap();
        generator.set_spike_times(vec![0.123, 0.3], vec![], &grid).unwrap();
        let emitted = run(&mut generator, 5, &grid);
        assert_eq!(emitted.len(), 2);
        assert!((emitted[0].time.to_ms(&grid) - 0.123).abs() < 1e-14);
        assert_eq!(emitted[0].time.step, 1);
        assert_eq!(emitted[1].time.stamp(), 3);
    }

    #[test]
    fn test_poisson_generator() {
        let grid = TimeGrid::default();
        let mut generator = PoissonGenerator::default();
        generator
            .set_status(&params(&[("rate", 10000.0), ("stop", 50.0)]), &grid)
            .unwrap();
        let emitted = run(&mut generator, 1000, &grid);
        let total: u32 = emitted.iter().map(|e| e.multiplicity).sum();
        // 500 active steps with mean 1 spike each
        assert!(total > 400 && total < 600);
        assert!(emitted.iter().all(|e| e.time.stamp() <= 500));

        assert!(generator
            .set_status(&params(&[("rate", -1.0)]), &grid)
            .is_err());
        assert!(generator
            .set_status(&params(&[("start", 0.05)]), &grid)
            .is_err());
    }
}
