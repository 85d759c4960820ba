//! Synapse models.
//!
//! A synapse model is a named template for connections. Its properties are split in two sets:
//! - *edge* properties, such as the delay, stored on every connection and settable per connection;
//! - *common* properties, such as the learning rate of plastic synapses, shared by every connection
//!   of the model and changed only through the model ([`SynapseRegistry::set_defaults`]).
//!
//! Setting a common property on a single connection is rejected.
use serde::{Deserialize, Serialize};

use crate::core::time::TimeGrid;
use crate::core::ParamDict;
use crate::error::KernelError;

pub mod edge;
pub mod stdp;

use edge::Edge;
use stdp::{StdpCommon, StdpState};

/// The built-in kinds of synapses.
#[derive(Debug, PartialEq, Eq, Clone, Copy, Serialize, Deserialize)]
pub enum SynapseKind {
    /// A fixed weight per connection.
    Static,
    /// A fixed weight shared by all connections of the model.
    StaticHomW,
    /// A weight evolving with pair-based spike-timing dependent plasticity.
    Stdp,
    /// A delay-less electrical coupling between gap-junction neurons.
    GapJunction,
}

impl SynapseKind {
    /// Returns the names of the common properties.
    pub fn common_keys(&self) -> &'static [&'static str] {
        match self {
            SynapseKind::StaticHomW => &["weight"],
            SynapseKind::Stdp => &StdpCommon::KEYS,
            _ => &[],
        }
    }

    /// Returns the names of the edge properties.
    pub fn edge_keys(&self) -> &'static [&'static str] {
        match self {
            SynapseKind::Static => &["weight", "delay", "receptor_type"],
            SynapseKind::StaticHomW => &["delay", "receptor_type"],
            SynapseKind::Stdp => &["weight", "delay", "receptor_type", "Kplus"],
            SynapseKind::GapJunction => &["weight"],
        }
    }

    /// Returns true if the key names a common property.
    pub fn is_common(&self, key: &str) -> bool {
        self.common_keys().contains(&key)
    }

    /// Returns true if the key names an edge property.
    pub fn is_edge(&self, key: &str) -> bool {
        self.edge_keys().contains(&key)
    }
}

/// The names and kinds of the built-in synapse models.
pub const BUILTIN_SYNAPSE_MODELS: [(&str, SynapseKind); 4] = [
    ("static_synapse", SynapseKind::Static),
    ("static_synapse_hom_w", SynapseKind::StaticHomW),
    ("stdp_synapse", SynapseKind::Stdp),
    ("gap_junction", SynapseKind::GapJunction),
];

/// A synapse model with its common properties and the defaults of its edge properties.
#[derive(Debug, PartialEq, Clone, Serialize, Deserialize)]
pub struct SynapseModel {
    id: usize,
    name: String,
    kind: SynapseKind,
    weight: f64,
    delay: f64,
    receptor_type: usize,
    kplus: f64,
    stdp: StdpCommon,
}

impl SynapseModel {
    fn new(id: usize, name: &str, kind: SynapseKind) -> Self {
        SynapseModel {
            id,
            name: name.to_string(),
            kind,
            weight: 1.0,
            delay: 1.0,
            receptor_type: 0,
            kplus: 0.0,
            stdp: StdpCommon::default(),
        }
    }

    pub fn id(&self) -> usize {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> SynapseKind {
        self.kind
    }

    /// Returns the default (or, for homogeneous models, common) weight.
    pub fn weight(&self) -> f64 {
        self.weight
    }

    /// Returns the default delay in ms.
    pub fn delay(&self) -> f64 {
        self.delay
    }

    /// Returns the default receptor port.
    pub fn receptor_type(&self) -> usize {
        self.receptor_type
    }

    /// Returns the default pre-synaptic trace of plastic connections.
    pub fn kplus(&self) -> f64 {
        self.kplus
    }

    /// Returns the plasticity parameters.
    pub fn stdp(&self) -> &StdpCommon {
        &self.stdp
    }

    /// Returns true if every connection of the model carries the same weight.
    pub fn has_common_weight(&self) -> bool {
        self.kind == SynapseKind::StaticHomW
    }

    /// Returns a connection between the pair carrying the defaults of the model.
    pub fn default_edge(&self, source: u64, target: u64, delay_steps: i64) -> Edge {
        Edge {
            source,
            target,
            syn_id: self.id,
            weight: self.weight,
            delay_steps: if self.kind == SynapseKind::GapJunction { 0 } else { delay_steps },
            receptor: self.receptor_type,
            label: None,
            stdp: (self.kind == SynapseKind::Stdp).then(|| StdpState {
                kplus: self.kplus,
                t_last_spike: 0.0,
            }),
        }
    }

    /// Returns the common properties and the defaults of the edge properties.
    pub fn get_defaults(&self) -> ParamDict {
        let mut defaults = ParamDict::new();
        defaults.insert("synapse_model_id".to_string(), self.id as f64);
        for key in self.kind.edge_keys().iter().chain(self.kind.common_keys()) {
            let value = match *key {
                "weight" => self.weight,
                "delay" => self.delay,
                "receptor_type" => self.receptor_type as f64,
                "Kplus" => self.kplus,
                _ => self
                    .stdp
                    .entries()
                    .iter()
                    .find(|(name, _)| name == key)
                    .map(|(_, value)| *value)
                    .unwrap_or(f64::NAN),
            };
            defaults.insert(key.to_string(), value);
        }
        defaults
    }

    /// Set common properties and edge defaults. Nothing changes if any property is invalid.
    pub fn set_defaults(&mut self, params: &ParamDict) -> Result<(), KernelError> {
        let mut new = self.clone();
        for (key, value) in params.iter() {
            if !self.kind.is_common(key) && !self.kind.is_edge(key) {
                return Err(KernelError::BadProperty(format!(
                    "Unknown property {} of synapse model {}",
                    key, self.name
                )));
            }
            match key.as_str() {
                "weight" => new.weight = *value,
                "delay" if *value > 0.0 => new.delay = *value,
                "receptor_type" => new.receptor_type = receptor_from(*value)?,
                "Kplus" if *value >= 0.0 => new.kplus = *value,
                _ => match new.stdp.field_mut(key) {
                    Some(field) => *field = *value,
                    None => {
                        return Err(KernelError::BadProperty(format!(
                            "Invalid value {} for property {}",
                            value, key
                        )))
                    }
                },
            }
        }
        if !new.stdp.is_valid() {
            return Err(KernelError::BadProperty(format!(
                "Invalid plasticity parameters for synapse model {}",
                self.name
            )));
        }
        *self = new;
        Ok(())
    }
}

/// Converts a property value to a receptor port.
pub fn receptor_from(value: f64) -> Result<usize, KernelError> {
    if value >= 0.0 && value.fract() == 0.0 && value.is_finite() {
        Ok(value as usize)
    } else {
        Err(KernelError::BadProperty(format!(
            "Invalid receptor type {}",
            value
        )))
    }
}

/// All synapse models known to the kernel. Model IDs are indices into the registry and increase
/// with each copy.
#[derive(Debug, PartialEq, Clone)]
pub struct SynapseRegistry {
    models: Vec<SynapseModel>,
}

impl Default for SynapseRegistry {
    fn default() -> Self {
        let models = BUILTIN_SYNAPSE_MODELS
            .iter()
            .enumerate()
            .map(|(id, (name, kind))| SynapseModel::new(id, name, *kind))
            .collect();
        SynapseRegistry { models }
    }
}

impl SynapseRegistry {
    /// Returns the ID of the model with the given name.
    pub fn id_of(&self, name: &str) -> Result<usize, KernelError> {
        self.models
            .iter()
            .find(|model| model.name == name)
            .map(|model| model.id)
            .ok_or_else(|| KernelError::UnknownModel(name.to_string()))
    }

    /// Returns the model with the given ID.
    pub fn get(&self, id: usize) -> Option<&SynapseModel> {
        self.models.get(id)
    }

    /// Returns the model with the given name.
    pub fn by_name(&self, name: &str) -> Result<&SynapseModel, KernelError> {
        let id = self.id_of(name)?;
        Ok(&self.models[id])
    }

    /// Returns the number of models.
    pub fn len(&self) -> usize {
        self.models.len()
    }

    /// Returns true if no model is registered, which never happens.
    pub fn is_empty(&self) -> bool {
        self.models.is_empty()
    }

    /// Returns the defaults of the model.
    pub fn get_defaults(&self, name: &str) -> Result<ParamDict, KernelError> {
        Ok(self.by_name(name)?.get_defaults())
    }

    /// Set common properties and edge defaults of the model.
    pub fn set_defaults(&mut self, name: &str, params: &ParamDict) -> Result<(), KernelError> {
        let id = self.id_of(name)?;
        self.models[id].set_defaults(params)
    }

    /// Create `n` unattached connections of the model with default properties, to be filled in by
    /// the caller. The default delay is rounded to the grid.
    pub fn create_edges(&self, name: &str, n: usize, grid: &TimeGrid) -> Result<Vec<Edge>, KernelError> {
        let model = self.by_name(name)?;
        let delay_steps = grid.delay_to_steps(model.delay, true)?;
        Ok(vec![model.default_edge(0, 0, delay_steps); n])
    }

    /// Register a copy of an existing model under a new name, with overridden defaults.
    /// The new model gets an ID greater than every existing one.
    pub fn copy_model(
        &mut self,
        base: &str,
        new_name: &str,
        params: &ParamDict,
    ) -> Result<usize, KernelError> {
        if self.id_of(new_name).is_ok() {
            return Err(KernelError::BadParameter(format!(
                "A synapse model named {} already exists",
                new_name
            )));
        }
        let mut model = self.by_name(base)?.clone();
        model.set_defaults(params)?;
        model.id = self.models.len();
        model.name = new_name.to_string();
        self.models.push(model);
        Ok(self.models.len() - 1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::params;

    #[test]
    fn test_builtin_models() {
        let registry = SynapseRegistry::default();
        assert_eq!(registry.len(), 4);
        assert_eq!(registry.id_of("stdp_synapse").unwrap(), 2);
        assert!(matches!(
            registry.id_of("tsodyks_synapse"),
            Err(KernelError::UnknownModel(_))
        ));
    }

    #[test]
    fn test_keys() {
        assert!(SynapseKind::Stdp.is_common("Wmax"));
        assert!(SynapseKind::Stdp.is_edge("weight"));
        assert!(SynapseKind::StaticHomW.is_common("weight"));
        assert!(!SynapseKind::StaticHomW.is_edge("weight"));
    }

    #[test]
    fn test_copy_model_ids_increase() {
        let mut registry = SynapseRegistry::default();
        let first = registry
            .copy_model("stdp_synapse", "stdp_fast", &params(&[("tau_plus", 10.0)]))
            .unwrap();
        let second = registry
            .copy_model("stdp_fast", "stdp_faster", &params(&[("tau_plus", 5.0)]))
            .unwrap();
        assert!(first > registry.id_of("stdp_synapse").unwrap());
        assert!(second > first);
        assert_eq!(registry.get_defaults("stdp_fast").unwrap()["tau_plus"], 10.0);
        assert_eq!(registry.get_defaults("stdp_faster").unwrap()["tau_plus"], 5.0);
        assert_eq!(registry.get_defaults("stdp_synapse").unwrap()["tau_plus"], 20.0);
    }

    #[test]
    fn test_create_edges_carry_defaults() {
        let mut registry = SynapseRegistry::default();
        registry
            .copy_model("stdp_synapse", "stdp_slow", &params(&[("weight", 2.5), ("delay", 1.5), ("Kplus", 0.3)]))
            .unwrap();
        let grid = TimeGrid::default();
        let edges = registry.create_edges("stdp_slow", 3, &grid).unwrap();
        assert_eq!(edges.len(), 3);
        for edge in edges.iter() {
            assert_eq!(edge.syn_id, registry.id_of("stdp_slow").unwrap());
            assert_eq!(edge.weight, 2.5);
            assert_eq!(edge.delay_steps, 15);
            assert_eq!(edge.stdp.as_ref().map(|state| state.kplus), Some(0.3));
        }
        let gaps = registry.create_edges("gap_junction", 1, &grid).unwrap();
        assert_eq!(gaps[0].delay_steps, 0);
        assert!(gaps[0].stdp.is_none());
        assert!(registry.create_edges("tsodyks_synapse", 1, &grid).is_err());
    }

    #[test]
    fn test_set_defaults_is_atomic() {
        let mut registry = SynapseRegistry::default();
        let result = registry.set_defaults(
            "stdp_synapse",
            &params(&[("lambda", 0.5), ("tau_plus", -1.0)]),
        );
        assert!(matches!(result, Err(KernelError::BadProperty(_))));
        assert_eq!(registry.get_defaults("stdp_synapse").unwrap()["lambda"], 0.01);

        assert!(registry
            .set_defaults("static_synapse", &params(&[("Wmax", 1.0)]))
            .is_err());
        registry
            .set_defaults("static_synapse_hom_w", &params(&[("weight", 3.0)]))
            .unwrap();
        assert_eq!(registry.by_name("static_synapse_hom_w").unwrap().weight(), 3.0);
    }
}
