//! Parrot neurons, repeating every incoming spike.
//!
//! Spikes arriving on receptor 0 are repeated, spikes arriving on receptor 1 are not. The latter
//! port allows plastic synapses to see the parrot's spikes without feeding them back.
use serde::{Deserialize, Serialize};

use super::{Dynamics, Emission, StepContext};
use crate::core::time::{PreciseTime, TimeGrid};
use crate::core::{KernelRng, ParamDict};
use crate::error::KernelError;
use crate::nodes::buffer::InEvent;

fn reject_all(params: &ParamDict, model: &str) -> Result<(), KernelError> {
    match params.keys().next() {
        Some(key) => Err(KernelError::BadProperty(format!(
            "Unknown property {} of {}",
            key, model
        ))),
        None => Ok(()),
    }
}

/// A grid-constrained parrot neuron. Spikes read during a step are repeated at the end of the step,
/// with their multiplicities summed.
#[derive(Debug, PartialEq, Clone, Default, Serialize, Deserialize)]
pub struct ParrotNeuron {
    pending: u32,
}

impl Dynamics for ParrotNeuron {
    fn handle(&mut self, event: &InEvent) {
        if event.receptor == 0 {
            self.pending += event.multiplicity;
        }
    }

    fn update(&mut self, ctx: &StepContext, _rng: &mut KernelRng, emitted: &mut Vec<Emission>) {
        if self.pending > 0 {
            emitted.push(Emission {
                time: PreciseTime::on_grid(ctx.step + 1),
                multiplicity: self.pending,
            });
            self.pending = 0;
        }
    }

    fn get_status(&self) -> ParamDict {
        ParamDict::new()
    }

    fn set_status(&mut self, params: &ParamDict, _grid: &TimeGrid) -> Result<(), KernelError> {
        reject_all(params, "parrot_neuron")
    }
}

/// A parrot neuron preserving the precise arrival time of every spike.
#[derive(Debug, PartialEq, Clone, Default, Serialize, Deserialize)]
pub struct ParrotNeuronPs {
    pending: Vec<(f64, u32)>,
}

impl Dynamics for ParrotNeuronPs {
    fn handle(&mut self, event: &InEvent) {
        if event.receptor == 0 {
            self.pending.push((event.offset, event.multiplicity));
        }
    }

    fn update(&mut self, ctx: &StepContext, _rng: &mut KernelRng, emitted: &mut Vec<Emission>) {
        // grid spikes arrive at the end of the step, after every precise spike
        self.pending.sort_by(|a, b| {
            let key = |offset: f64| if offset > 0.0 { offset } else { f64::INFINITY };
            key(a.0).total_cmp(&key(b.0))
        });
        for (offset, multiplicity) in self.pending.drain(..) {
            let time = if offset > 0.0 {
                PreciseTime {
                    step: ctx.step,
                    offset,
                }
            } else {
                PreciseTime::on_grid(ctx.step + 1)
            };
            emitted.push(Emission { time, multiplicity });
        }
    }

    fn get_status(&self) -> ParamDict {
        ParamDict::new()
    }

    fn set_status(&mut self, params: &ParamDict, _grid: &TimeGrid) -> Result<(), KernelError> {
        reject_all(params, "parrot_neuron_ps")
    }

    fn is_precise(&self) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::stream_rng;

    fn event(receptor: usize, offset: f64, multiplicity: u32) -> InEvent {
        InEvent {
            sender: 1,
            weight: 1.0,
            multiplicity,
            offset,
            delay_steps: 1,
            receptor,
        }
    }

    #[test]
    fn test_parrot_sums_multiplicities() {
        let grid = TimeGrid::default();
        let ctx = StepContext {
            step: 5,
            grid: &grid,
            gap: None,
        };
        let mut rng = stream_rng(0, 1);
        let mut parrot = ParrotNeuron::default();
        parrot.handle(&event(0, 0.0, 2));
        parrot.handle(&event(0, 0.0, 1));
        parrot.handle(&event(1, 0.0, 4));

        let mut emitted = vec![];
        parrot.update(&ctx, &mut rng, &mut emitted);
        assert_eq!(
            emitted,
            vec![Emission {
                time: PreciseTime::on_grid(6),
                multiplicity: 3
            }]
        );

        parrot.update(&ctx, &mut rng, &mut emitted);
        assert_eq!(emitted.len(), 1);
    }

    #[test]
    fn test_precise_parrot_keeps_offsets() {
        let grid = TimeGrid::default();
        let ctx = StepContext {
            step: 5,
            grid: &grid,
            gap: None,
        };
        let mut rng = stream_rng(0, 1);
        let mut parrot = ParrotNeuronPs::default();
        parrot.handle(&event(0, 0.0, 1));
        parrot.handle(&event(0, 0.07, 1));
        parrot.handle(&event(0, 0.02, 2));

        let mut emitted = vec![];
        parrot.update(&ctx, &mut rng, &mut emitted);
        let times: Vec<PreciseTime> = emitted.iter().map(|e| e.time).collect();
        assert_eq!(
            times,
            vec![
                PreciseTime { step: 5, offset: 0.02 },
                PreciseTime { step: 5, offset: 0.07 },
                PreciseTime::on_grid(6)
            ]
        );
        assert_eq!(emitted[0].multiplicity, 2);
    }
}
