//! Calcium concentration and synaptic elements driving structural plasticity.
//!
//! Every node carries an intracellular calcium trace which decays with `tau_Ca` and jumps by
//! `beta_Ca` at each emitted spike. Nodes with synaptic elements grow or retract them following
//! a linear growth curve `dz/dt = nu * (1 - Ca / eps)`: the number of elements increases while the
//! calcium concentration is below the target `eps` and decreases above it.
use serde::{Deserialize, Serialize};

use crate::core::ParamDict;
use crate::error::KernelError;

/// A linear growth curve.
#[derive(Debug, PartialEq, Clone, Copy, Serialize, Deserialize)]
pub struct GrowthCurve {
    /// The growth rate `nu`, in elements per ms.
    pub growth_rate: f64,
    /// The calcium concentration target `eps`.
    pub eps: f64,
}

impl Default for GrowthCurve {
    fn default() -> Self {
        GrowthCurve {
            growth_rate: 1e-4,
            eps: 0.7,
        }
    }
}

/// A pool of synaptic elements of one kind, e.g., axonal boutons.
#[derive(Debug, PartialEq, Clone, Copy, Default, Serialize, Deserialize)]
pub struct SynapticElement {
    /// The current (fractional) number of elements.
    pub z: f64,
    /// The number of elements currently bound in a connection.
    pub connected: usize,
    pub curve: GrowthCurve,
}

impl SynapticElement {
    /// Returns the number of elements available for new connections, negative if too many are bound.
    pub fn vacant(&self) -> i64 {
        self.z.floor() as i64 - self.connected as i64
    }

    fn grow(&mut self, dt: f64, calcium: f64) {
        self.z = (self.z + dt * self.curve.growth_rate * (1.0 - calcium / self.curve.eps)).max(0.0);
    }
}

/// The kind of a synaptic element.
#[derive(Debug, PartialEq, Eq, Clone, Copy, Hash, Serialize, Deserialize)]
pub enum ElementKind {
    Axonal,
    Dendritic,
}

impl ElementKind {
    fn prefix(&self) -> &'static str {
        match self {
            ElementKind::Axonal => "axonal",
            ElementKind::Dendritic => "dendritic",
        }
    }
}

/// Calcium trace and synaptic elements of a node.
#[derive(Debug, PartialEq, Clone, Serialize, Deserialize)]
pub struct SynapticElements {
    calcium: f64,
    beta_ca: f64,
    tau_ca: f64,
    axonal: Option<SynapticElement>,
    dendritic: Option<SynapticElement>,
}

impl Default for SynapticElements {
    fn default() -> Self {
        SynapticElements {
            calcium: 0.0,
            beta_ca: 0.001,
            tau_ca: 10000.0,
            axonal: None,
            dendritic: None,
        }
    }
}

impl SynapticElements {
    /// Returns the calcium concentration.
    pub fn calcium(&self) -> f64 {
        self.calcium
    }

    /// Returns the element of the given kind, if the node has any.
    pub fn element(&self, kind: ElementKind) -> Option<&SynapticElement> {
        match kind {
            ElementKind::Axonal => self.axonal.as_ref(),
            ElementKind::Dendritic => self.dendritic.as_ref(),
        }
    }

    /// Returns a mutable reference to the element of the given kind.
    pub fn element_mut(&mut self, kind: ElementKind) -> Option<&mut SynapticElement> {
        match kind {
            ElementKind::Axonal => self.axonal.as_mut(),
            ElementKind::Dendritic => self.dendritic.as_mut(),
        }
    }

    /// Returns true if the node takes part in structural plasticity.
    pub fn is_plastic(&self) -> bool {
        self.axonal.is_some() || self.dendritic.is_some()
    }

    /// Advance the calcium trace and the elements by one step of `dt` ms with `num_spikes` emitted spikes.
    pub fn update(&mut self, dt: f64, num_spikes: u32) {
        self.calcium = self.calcium * (-dt / self.tau_ca).exp() + self.beta_ca * num_spikes as f64;
        let calcium = self.calcium;
        self.axonal.iter_mut().for_each(|element| element.grow(dt, calcium));
        self.dendritic.iter_mut().for_each(|element| element.grow(dt, calcium));
    }

    /// Returns the properties as a dictionary.
    pub fn get_status(&self) -> ParamDict {
        let mut status = ParamDict::new();
        status.insert("Ca".to_string(), self.calcium);
        status.insert("beta_Ca".to_string(), self.beta_ca);
        status.insert("tau_Ca".to_string(), self.tau_ca);
        for kind in [ElementKind::Axonal, ElementKind::Dendritic] {
            if let Some(element) = self.element(kind) {
                let prefix = kind.prefix();
                status.insert(format!("{}_z", prefix), element.z);
                status.insert(format!("{}_connected", prefix), element.connected as f64);
                status.insert(format!("{}_growth_rate", prefix), element.curve.growth_rate);
                status.insert(format!("{}_eps", prefix), element.curve.eps);
            }
        }
        status
    }

    /// Returns true if the key is a property handled by [`SynapticElements::set`].
    pub fn owns_key(key: &str) -> bool {
        matches!(key, "Ca" | "beta_Ca" | "tau_Ca")
            || [ElementKind::Axonal, ElementKind::Dendritic].iter().any(|kind| {
                key.strip_prefix(kind.prefix())
                    .map(|rest| matches!(rest, "_z" | "_growth_rate" | "_eps"))
                    .unwrap_or(false)
            })
    }

    /// Set a single property. Setting any element property creates the element if needed.
    pub fn set(&mut self, key: &str, value: f64) -> Result<(), KernelError> {
        match key {
            "Ca" if value >= 0.0 => self.calcium = value,
            "beta_Ca" if value >= 0.0 => self.beta_ca = value,
            "tau_Ca" if value > 0.0 => self.tau_ca = value,
            _ => {
                let (kind, field) = [ElementKind::Axonal, ElementKind::Dendritic]
                    .iter()
                    .find_map(|kind| key.strip_prefix(kind.prefix()).map(|rest| (*kind, rest)))
                    .ok_or_else(|| KernelError::BadProperty(format!("Unknown property {}", key)))?;
                let element = match kind {
                    ElementKind::Axonal => self.axonal.get_or_insert_with(SynapticElement::default),
                    ElementKind::Dendritic => {
                        self.dendritic.get_or_insert_with(SynapticElement::default)
                    }
                };
                match field {
                    "_z" if value >= 0.0 => element.z = value,
                    "_growth_rate" => element.curve.growth_rate = value,
                    "_eps" if value > 0.0 => element.curve.eps = value,
                    _ => {
                        return Err(KernelError::BadProperty(format!(
                            "Invalid value {} for property {}",
                            value, key
                        )))
                    }
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_calcium_trace() {
        let mut elements = SynapticElements::default();
        elements.set("tau_Ca", 10.0).unwrap();
        elements.set("beta_Ca", 0.5).unwrap();
        elements.update(1.0, 2);
        assert_relative_eq!(elements.calcium(), 1.0);
        elements.update(10.0, 0);
        assert_relative_eq!(elements.calcium(), (-1.0_f64).exp());
    }

    #[test]
    fn test_growth() {
        let mut elements = SynapticElements::default();
        assert!(!elements.is_plastic());
        elements.set("axonal_growth_rate", 0.1).unwrap();
        elements.set("axonal_eps", 1.0).unwrap();
        assert!(elements.is_plastic());
        assert!(elements.element(ElementKind::Dendritic).is_none());

        for _ in 0..100 {
            elements.update(1.0, 0);
        }
        let axonal = elements.element(ElementKind::Axonal).unwrap();
        assert_relative_eq!(axonal.z, 10.0, epsilon = 1e-9);
        assert_eq!(axonal.vacant(), 10);
    }

    #[test]
    fn test_unknown_key() {
        let mut elements = SynapticElements::default();
        assert!(SynapticElements::owns_key("dendritic_eps"));
        assert!(!SynapticElements::owns_key("dendritic_foo"));
        assert!(matches!(
            elements.set("dendritic_foo", 1.0),
            Err(KernelError::BadProperty(_))
        ));
        assert!(elements.set("tau_Ca", -1.0).is_err());
    }
}
