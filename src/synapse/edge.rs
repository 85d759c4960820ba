//! Connections and their per-connection state.
use serde::{Deserialize, Serialize};

use super::stdp::StdpState;
use super::{receptor_from, SynapseKind, SynapseModel};
use crate::core::time::TimeGrid;
use crate::core::ParamDict;
use crate::error::KernelError;

/// A connection, stored on the virtual process owning its target.
#[derive(Debug, PartialEq, Clone, Serialize, Deserialize)]
pub struct Edge {
    pub source: u64,
    pub target: u64,
    /// The ID of the synapse model.
    pub syn_id: usize,
    /// The weight, unused by models with a common weight.
    pub weight: f64,
    /// The delay in steps, zero for gap junctions.
    pub delay_steps: i64,
    pub receptor: usize,
    /// An optional user label.
    pub label: Option<i64>,
    /// The plasticity state of STDP connections.
    pub stdp: Option<StdpState>,
}

impl Edge {
    /// Returns the weight used at delivery.
    pub fn effective_weight(&self, model: &SynapseModel) -> f64 {
        if model.has_common_weight() {
            model.weight()
        } else {
            self.weight
        }
    }

    /// Returns the properties of the connection.
    pub fn get_status(&self, model: &SynapseModel, grid: &TimeGrid) -> ParamDict {
        let mut status = ParamDict::new();
        status.insert("source".to_string(), self.source as f64);
        status.insert("target".to_string(), self.target as f64);
        status.insert("synapse_model_id".to_string(), self.syn_id as f64);
        status.insert("weight".to_string(), self.effective_weight(model));
        status.insert("delay".to_string(), grid.steps_to_ms(self.delay_steps));
        status.insert("receptor_type".to_string(), self.receptor as f64);
        if let Some(label) = self.label {
            status.insert("synapse_label".to_string(), label as f64);
        }
        if let Some(stdp) = &self.stdp {
            status.insert("Kplus".to_string(), stdp.kplus);
        }
        if model.kind() == SynapseKind::Stdp {
            for (key, value) in model.stdp().entries() {
                status.insert(key.to_string(), value);
            }
        }
        status
    }

    /// Set edge properties of the connection.
    ///
    /// Common properties of the model are rejected, and nothing changes if any property is
    /// rejected. `quantize_delay` converts a delay in ms to steps, checking it against the
    /// kernel's delay constraints.
    pub fn set_status<F>(
        &mut self,
        params: &ParamDict,
        model: &SynapseModel,
        quantize_delay: F,
    ) -> Result<(), KernelError>
    where
        F: Fn(f64) -> Result<i64, KernelError>,
    {
        let mut new = self.clone();
        for (key, value) in params.iter() {
            if model.kind().is_common(key) {
                return Err(KernelError::BadProperty(format!(
                    "{} is a common property of {} and can only be set on the model",
                    key,
                    model.name()
                )));
            }
            match key.as_str() {
                "synapse_label" if value.fract() == 0.0 => new.label = Some(*value as i64),
                "weight" if model.kind().is_edge(key) => new.weight = *value,
                "delay" if model.kind().is_edge(key) => new.delay_steps = quantize_delay(*value)?,
                "receptor_type" if model.kind().is_edge(key) => new.receptor = receptor_from(*value)?,
                "Kplus" if *value >= 0.0 => match new.stdp.as_mut() {
                    Some(stdp) => stdp.kplus = *value,
                    None => {
                        return Err(KernelError::BadProperty(format!(
                            "Kplus is not a property of {}",
                            model.name()
                        )))
                    }
                },
                _ => {
                    return Err(KernelError::BadProperty(format!(
                        "Invalid or unknown property {} of {} connections",
                        key,
                        model.name()
                    )))
                }
            }
        }
        *self = new;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::params;
    use crate::synapse::SynapseRegistry;

    fn edge(syn_id: usize) -> Edge {
        Edge {
            source: 1,
            target: 2,
            syn_id,
            weight: 2.0,
            delay_steps: 10,
            receptor: 0,
            label: None,
            stdp: Some(StdpState::default()).filter(|_| syn_id == 2),
        }
    }

    #[test]
    fn test_common_property_rejected() {
        let grid = TimeGrid::default();
        let registry = SynapseRegistry::default();
        let model = registry.by_name("stdp_synapse").unwrap();
        let mut e = edge(2);
        let quantize = |delay: f64| grid.delay_to_steps(delay, false);

        let result = e.set_status(&params(&[("weight", 5.0), ("tau_plus", 3.0)]), model, quantize);
        assert!(matches!(result, Err(KernelError::BadProperty(_))));
        assert_eq!(e, edge(2));
        assert_eq!(registry.get_defaults("stdp_synapse").unwrap()["tau_plus"], 20.0);

        e.set_status(&params(&[("weight", 5.0), ("delay", 2.0), ("Kplus", 0.5)]), model, quantize)
            .unwrap();
        let status = e.get_status(model, &grid);
        assert_eq!(status["weight"], 5.0);
        assert_eq!(status["delay"], 2.0);
        assert_eq!(status["Kplus"], 0.5);
        assert_eq!(status["tau_plus"], 20.0);
    }

    #[test]
    fn test_homogeneous_weight() {
        let grid = TimeGrid::default();
        let registry = SynapseRegistry::default();
        let model = registry.by_name("static_synapse_hom_w").unwrap();
        let mut e = edge(1);
        assert_eq!(e.effective_weight(model), 1.0);
        assert!(e
            .set_status(&params(&[("weight", 3.0)]), model, |d| grid.delay_to_steps(d, false))
            .is_err());
        assert!(e
            .set_status(&params(&[("delay", 0.25)]), model, |d| grid.delay_to_steps(d, false))
            .is_err());
        e.set_status(&params(&[("synapse_label", 4.0)]), model, |d| {
            grid.delay_to_steps(d, false)
        })
        .unwrap();
        assert_eq!(e.label, Some(4));
    }
}
