//! Pair-based spike-timing dependent plasticity.
//!
//! The weight is potentiated for each post-synaptic spike following a pre-synaptic spike and
//! depressed for each pre-synaptic spike following a post-synaptic spike. The pre-synaptic trace
//! `Kplus` is stored on the connection, the post-synaptic trace is read from the spike archive of
//! the target. Updates happen when a pre-synaptic spike is delivered.
use serde::{Deserialize, Serialize};

use crate::nodes::buffer::SpikeArchive;

/// Plasticity parameters shared by all connections of an STDP synapse model.
#[derive(Debug, PartialEq, Clone, Copy, Serialize, Deserialize)]
pub struct StdpCommon {
    /// Time constant of the pre-synaptic trace in ms.
    pub tau_plus: f64,
    /// Learning rate.
    pub lambda: f64,
    /// Asymmetry between depression and potentiation.
    pub alpha: f64,
    /// Weight dependence exponent of potentiation.
    pub mu_plus: f64,
    /// Weight dependence exponent of depression.
    pub mu_minus: f64,
    /// Maximum weight.
    pub w_max: f64,
}

impl Default for StdpCommon {
    fn default() -> Self {
        StdpCommon {
            tau_plus: 20.0,
            lambda: 0.01,
            alpha: 1.0,
            mu_plus: 1.0,
            mu_minus: 1.0,
            w_max: 100.0,
        }
    }
}

/// Per-connection plasticity state.
#[derive(Debug, PartialEq, Clone, Copy, Default, Serialize, Deserialize)]
pub struct StdpState {
    /// The pre-synaptic trace.
    pub kplus: f64,
    /// The time of the last pre-synaptic spike in ms.
    pub t_last_spike: f64,
}

impl StdpCommon {
    /// The names of the common properties.
    pub const KEYS: [&'static str; 6] = ["tau_plus", "lambda", "alpha", "mu_plus", "mu_minus", "Wmax"];

    /// Returns a mutable reference to the property with the given name.
    pub fn field_mut(&mut self, key: &str) -> Option<&mut f64> {
        match key {
            "tau_plus" => Some(&mut self.tau_plus),
            "lambda" => Some(&mut self.lambda),
            "alpha" => Some(&mut self.alpha),
            "mu_plus" => Some(&mut self.mu_plus),
            "mu_minus" => Some(&mut self.mu_minus),
            "Wmax" => Some(&mut self.w_max),
            _ => None,
        }
    }

    /// Returns the properties as `(name, value)` pairs.
    pub fn entries(&self) -> [(&'static str, f64); 6] {
        [
            ("tau_plus", self.tau_plus),
            ("lambda", self.lambda),
            ("alpha", self.alpha),
            ("mu_plus", self.mu_plus),
            ("mu_minus", self.mu_minus),
            ("Wmax", self.w_max),
        ]
    }

    /// Returns true if the parameters are usable.
    pub fn is_valid(&self) -> bool {
        self.tau_plus > 0.0 && self.w_max > 0.0 && self.lambda >= 0.0 && self.alpha >= 0.0
    }

    fn facilitate(&self, weight: f64, kplus: f64) -> f64 {
        let norm_w = weight / self.w_max
            + self.lambda * (1.0 - weight / self.w_max).powf(self.mu_plus) * kplus;
        norm_w.min(1.0) * self.w_max
    }

    fn depress(&self, weight: f64, kminus: f64) -> f64 {
        let norm_w = weight / self.w_max
            - self.alpha * self.lambda * (weight / self.w_max).powf(self.mu_minus) * kminus;
        norm_w.max(0.0) * self.w_max
    }

    /// Update the connection for a pre-synaptic spike emitted at `t_spike` and return the new weight.
    ///
    /// `dendritic_delay` is the connection delay in ms, by which post-synaptic spikes are
    /// back-propagated.
    pub fn on_pre_spike(
        &self,
        state: &mut StdpState,
        weight: f64,
        t_spike: f64,
        dendritic_delay: f64,
        archive: &SpikeArchive,
    ) -> f64 {
        let mut weight = weight;
        for post in archive.spikes_between(
            state.t_last_spike - dendritic_delay,
            t_spike - dendritic_delay,
        ) {
            let minus_dt = state.t_last_spike - (post.time + dendritic_delay);
            if minus_dt == 0.0 {
                continue;
            }
            weight = self.facilitate(weight, state.kplus * (minus_dt / self.tau_plus).exp());
        }
        weight = self.depress(weight, archive.k_minus(t_spike - dendritic_delay));

        state.kplus = state.kplus * ((state.t_last_spike - t_spike) / self.tau_plus).exp() + 1.0;
        state.t_last_spike = t_spike;
        weight
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_potentiation() {
        let stdp = StdpCommon::default();
        let mut state = StdpState::default();
        let mut archive = SpikeArchive::default();

        let weight = stdp.on_pre_spike(&mut state, 50.0, 10.0, 1.0, &archive);
        assert_relative_eq!(weight, 50.0);
        assert_relative_eq!(state.kplus, 1.0);

        // post spike 5 ms after the pre spike arrived
        archive.record(16.0);
        let weight = stdp.on_pre_spike(&mut state, weight, 100.0, 1.0, &archive);
        let facilitated = (0.5 + 0.01 * 0.5 * (-7.0_f64 / 20.0).exp()) * 100.0;
        let kminus = (-(99.0_f64 - 16.0) / 20.0).exp();
        let expected = (facilitated / 100.0 - 0.01 * (facilitated / 100.0) * kminus) * 100.0;
        assert_relative_eq!(weight, expected, epsilon = 1e-12);
    }

    #[test]
    fn test_depression_bounded() {
        let stdp = StdpCommon {
            lambda: 10.0,
            ..StdpCommon::default()
        };
        let mut state = StdpState::default();
        let mut archive = SpikeArchive::default();
        archive.record(4.5);
        let weight = stdp.on_pre_spike(&mut state, 1.0, 5.0, 0.1, &archive);
        assert_eq!(weight, 0.0);
    }
}
