//! Leaky integrate-and-fire neurons with delta-shaped synaptic input.
//!
//! The sub-threshold dynamics `tau_m dV/dt = -(V - E_L) + tau_m / C_m * I` are integrated exactly
//! over each step, with the input current held constant over the step. Incoming spikes cause a
//! jump of the membrane potential by the connection weight (in mV). After crossing `V_th`, the
//! potential is clamped to `V_reset` during the refractory period `t_ref`, and incoming spikes
//! are discarded.
use serde::{Deserialize, Serialize};

use super::{Dynamics, Emission, StepContext};
use crate::core::time::{PreciseTime, TimeGrid};
use crate::core::{KernelRng, ParamDict};
use crate::error::KernelError;
use crate::nodes::buffer::InEvent;

/// A leaky integrate-and-fire neuron with delta synapses.
#[derive(Debug, PartialEq, Clone, Serialize, Deserialize)]
pub struct IafPscDelta {
    /// Membrane time constant in ms.
    tau_m: f64,
    /// Membrane capacitance in pF.
    c_m: f64,
    /// Refractory period in ms.
    t_ref: f64,
    /// Resting potential in mV.
    e_l: f64,
    /// Constant input current in pA.
    i_e: f64,
    /// Spike threshold in mV.
    v_th: f64,
    /// Reset potential in mV.
    v_reset: f64,
    /// Lower bound of the membrane potential in mV.
    v_min: f64,
    /// Membrane potential in mV.
    v_m: f64,
    refractory_steps: i64,
    spike_input: f64,
}

impl Default for IafPscDelta {
    fn default() -> Self {
        IafPscDelta {
            tau_m: 10.0,
            c_m: 250.0,
            t_ref: 2.0,
            e_l: -70.0,
            i_e: 0.0,
            v_th: -55.0,
            v_reset: -70.0,
            v_min: f64::NEG_INFINITY,
            v_m: -70.0,
            refractory_steps: 0,
            spike_input: 0.0,
        }
    }
}

impl IafPscDelta {
    /// Returns the membrane potential in mV.
    pub fn v_m(&self) -> f64 {
        self.v_m
    }

    /// Returns true if the neuron is refractory.
    pub fn is_refractory(&self) -> bool {
        self.refractory_steps > 0
    }

    /// Advance the neuron by one step with an additional constant current `i_ext` (pA).
    pub(crate) fn integrate(&mut self, ctx: &StepContext, i_ext: f64, emitted: &mut Vec<Emission>) {
        let h = ctx.grid.resolution();
        if self.refractory_steps == 0 {
            let p33 = (-h / self.tau_m).exp();
            let p30 = self.tau_m / self.c_m * (1.0 - p33);
            let y3 = p30 * (self.i_e + i_ext) + p33 * (self.v_m - self.e_l) + self.spike_input;
            self.v_m = (self.e_l + y3).max(self.v_min);
        } else {
            self.refractory_steps -= 1;
        }
        self.spike_input = 0.0;

        if self.v_m >= self.v_th {
            self.refractory_steps = ctx.grid.ms_to_steps_nearest(self.t_ref);
            self.v_m = self.v_reset;
            emitted.push(Emission {
                time: PreciseTime::on_grid(ctx.step + 1),
                multiplicity: 1,
            });
        }
    }

    fn check(&self) -> Result<(), KernelError> {
        if !(self.tau_m > 0.0) {
            return Err(KernelError::BadProperty(
                "Membrane time constant must be positive".to_string(),
            ));
        }
        if !(self.c_m > 0.0) {
            return Err(KernelError::BadProperty(
                "Capacitance must be positive".to_string(),
            ));
        }
        if !(self.t_ref >= 0.0) {
            return Err(KernelError::BadProperty(
                "Refractory period must not be negative".to_string(),
            ));
        }
        if !(self.v_reset < self.v_th) {
            return Err(KernelError::BadProperty(
                "Reset potential must be lower than the threshold".to_string(),
            ));
        }
        Ok(())
    }
}

impl Dynamics for IafPscDelta {
    fn handle(&mut self, event: &InEvent) {
        if self.refractory_steps == 0 {
            self.spike_input += event.weight * event.multiplicity as f64;
        }
    }

    fn update(&mut self, ctx: &StepContext, _rng: &mut KernelRng, emitted: &mut Vec<Emission>) {
        self.integrate(ctx, 0.0, emitted);
    }

    fn get_status(&self) -> ParamDict {
        crate::core::params(&[
            ("tau_m", self.tau_m),
            ("C_m", self.c_m),
            ("t_ref", self.t_ref),
            ("E_L", self.e_l),
            ("I_e", self.i_e),
            ("V_th", self.v_th),
            ("V_reset", self.v_reset),
            ("V_min", self.v_min),
            ("V_m", self.v_m),
        ])
    }

    fn set_status(&mut self, params: &ParamDict, _grid: &TimeGrid) -> Result<(), KernelError> {
        let mut new = self.clone();
        for (key, value) in params.iter() {
            let field = match key.as_str() {
                "tau_m" => &mut new.tau_m,
                "C_m" => &mut new.c_m,
                "t_ref" => &mut new.t_ref,
                "E_L" => &mut new.e_l,
                "I_e" => &mut new.i_e,
                "V_th" => &mut new.v_th,
                "V_reset" => &mut new.v_reset,
                "V_min" => &mut new.v_min,
                "V_m" => &mut new.v_m,
                _ => {
                    return Err(KernelError::BadProperty(format!(
                        "Unknown property {} of iaf_psc_delta",
                        key
                    )))
                }
            };
            *field = *value;
        }
        new.check()?;
        *self = new;
        Ok(())
    }
}

/// A leaky integrate-and-fire neuron additionally coupled to other neurons by gap junctions.
///
/// The gap current `sum_j g_j (V_j - V)` is evaluated at the start of each step from the
/// membrane potential trajectories of the coupled neurons, as computed by the waveform relaxation.
#[derive(Debug, PartialEq, Clone, Default, Serialize, Deserialize)]
pub struct IafPscDeltaGap {
    lif: IafPscDelta,
}

impl IafPscDeltaGap {
    /// Returns the membrane potential in mV.
    pub fn v_m(&self) -> f64 {
        self.lif.v_m()
    }

    fn gap_current(&self, ctx: &StepContext) -> f64 {
        match &ctx.gap {
            Some(gap) => gap
                .couplings
                .iter()
                .filter_map(|(partner, g)| {
                    gap.voltage(*partner, ctx.step)
                        .map(|v| g * (v - self.lif.v_m))
                })
                .sum(),
            None => 0.0,
        }
    }
}

impl Dynamics for IafPscDeltaGap {
    fn handle(&mut self, event: &InEvent) {
        self.lif.handle(event);
    }

    fn update(&mut self, ctx: &StepContext, _rng: &mut KernelRng, emitted: &mut Vec<Emission>) {
        let i_gap = self.gap_current(ctx);
        self.lif.integrate(ctx, i_gap, emitted);
    }

    fn get_status(&self) -> ParamDict {
        self.lif.get_status()
    }

    fn set_status(&mut self, params: &ParamDict, grid: &TimeGrid) -> Result<(), KernelError> {
        self.lif.set_status(params, grid)
    }
}
