//! Declarative descriptions of connections: the rule ([`ConnSpec`]) and the synapse ([`SynSpec`]).
use serde::{Deserialize, Serialize};

use crate::core::parameter::Parameter;
use crate::core::spatial::Mask;
use crate::error::KernelError;

/// A connection rule.
#[derive(Debug, PartialEq, Clone, Serialize, Deserialize)]
pub enum ConnRule {
    /// The i-th source is connected to the i-th target.
    OneToOne,
    /// Every source is connected to every target.
    AllToAll,
    /// Every target receives `indegree` connections from randomly drawn sources.
    FixedIndegree { indegree: usize },
    /// Every source sends `outdegree` connections to randomly drawn targets.
    FixedOutdegree { outdegree: usize },
    /// Exactly `n` connections between randomly drawn pairs.
    FixedTotalNumber { n: usize },
    /// Every pair is connected with probability `p`.
    ///
    /// With `use_on_source`, the mask and distance-dependent probabilities are centered on the
    /// source instead of the target.
    PairwiseBernoulli { p: Parameter, use_on_source: bool },
    /// Exactly `n` connections between randomly drawn pairs, sources and targets being split into
    /// `clusters` contiguous groups. Connections within a group use the primary synapse
    /// specification, connections between groups use `inter_syn_spec`.
    ClusteredFixedTotalNumber {
        n: usize,
        clusters: usize,
        inter_syn_spec: Box<SynSpec>,
    },
}

impl ConnRule {
    /// Returns the name of the rule.
    pub fn name(&self) -> &'static str {
        match self {
            ConnRule::OneToOne => "one_to_one",
            ConnRule::AllToAll => "all_to_all",
            ConnRule::FixedIndegree { .. } => "fixed_indegree",
            ConnRule::FixedOutdegree { .. } => "fixed_outdegree",
            ConnRule::FixedTotalNumber { .. } => "fixed_total_number",
            ConnRule::PairwiseBernoulli { .. } => "pairwise_bernoulli",
            ConnRule::ClusteredFixedTotalNumber { .. } => "clustered_fixed_total_number",
        }
    }

    /// Returns true if the rule can mirror its connections.
    pub fn supports_symmetric(&self) -> bool {
        matches!(
            self,
            ConnRule::OneToOne | ConnRule::AllToAll | ConnRule::PairwiseBernoulli { .. }
        )
    }

    /// Returns true if the rule can restrict partners with a spatial mask.
    pub fn supports_mask(&self) -> bool {
        matches!(
            self,
            ConnRule::FixedIndegree { .. }
                | ConnRule::FixedOutdegree { .. }
                | ConnRule::PairwiseBernoulli { .. }
        )
    }
}

/// A connection rule with its constraints.
#[derive(Debug, PartialEq, Clone, Serialize, Deserialize)]
pub struct ConnSpec {
    pub rule: ConnRule,
    /// Whether a node may be connected to itself.
    pub allow_autapses: bool,
    /// Whether a pair may be connected more than once.
    pub allow_multapses: bool,
    /// Whether every connection `a -> b` is mirrored by `b -> a` with the same properties.
    pub make_symmetric: bool,
    /// A region around the driver node restricting its partners, for spatial collections.
    pub mask: Option<Mask>,
}

impl ConnSpec {
    /// Create a specification with the given rule, allowing autapses and multapses.
    pub fn new(rule: ConnRule) -> Self {
        ConnSpec {
            rule,
            allow_autapses: true,
            allow_multapses: true,
            make_symmetric: false,
            mask: None,
        }
    }

    pub fn one_to_one() -> Self {
        ConnSpec::new(ConnRule::OneToOne)
    }

    pub fn all_to_all() -> Self {
        ConnSpec::new(ConnRule::AllToAll)
    }

    pub fn fixed_indegree(indegree: usize) -> Self {
        ConnSpec::new(ConnRule::FixedIndegree { indegree })
    }

    pub fn fixed_outdegree(outdegree: usize) -> Self {
        ConnSpec::new(ConnRule::FixedOutdegree { outdegree })
    }

    pub fn fixed_total_number(n: usize) -> Self {
        ConnSpec::new(ConnRule::FixedTotalNumber { n })
    }

    pub fn pairwise_bernoulli<P: Into<Parameter>>(p: P) -> Self {
        ConnSpec::new(ConnRule::PairwiseBernoulli {
            p: p.into(),
            use_on_source: false,
        })
    }

    pub fn clustered_fixed_total_number(n: usize, clusters: usize, inter_syn_spec: SynSpec) -> Self {
        ConnSpec::new(ConnRule::ClusteredFixedTotalNumber {
            n,
            clusters,
            inter_syn_spec: Box::new(inter_syn_spec),
        })
    }

    pub fn with_autapses(mut self, allow: bool) -> Self {
        self.allow_autapses = allow;
        self
    }

    pub fn with_multapses(mut self, allow: bool) -> Self {
        self.allow_multapses = allow;
        self
    }

    pub fn symmetric(mut self) -> Self {
        self.make_symmetric = true;
        self
    }

    pub fn with_mask(mut self, mask: Mask) -> Self {
        self.mask = Some(mask);
        self
    }

    /// Checks the rule and constraints, independently of the connected collections.
    pub fn validate(&self) -> Result<(), KernelError> {
        if self.make_symmetric && !self.rule.supports_symmetric() {
            return Err(KernelError::IllegalConnection(format!(
                "make_symmetric is not supported by {}",
                self.rule.name()
            )));
        }
        if let Some(mask) = &self.mask {
            if !self.rule.supports_mask() {
                return Err(KernelError::IllegalConnection(format!(
                    "Masks are not supported by {}",
                    self.rule.name()
                )));
            }
            mask.validate()?;
        }
        match &self.rule {
            ConnRule::PairwiseBernoulli { p, .. } => {
                p.validate()?;
                match p {
                    Parameter::Constant(p) if !(0.0..=1.0).contains(p) => {
                        Err(KernelError::BadParameter(format!(
                            "Connection probability {} is not in [0, 1]",
                            p
                        )))
                    }
                    Parameter::Constant(_) | Parameter::Distance(_) => Ok(()),
                    _ => Err(KernelError::BadParameter(
                        "Connection probabilities must be constant or distance-dependent"
                            .to_string(),
                    )),
                }
            }
            ConnRule::ClusteredFixedTotalNumber {
                clusters,
                inter_syn_spec,
                ..
            } => {
                if *clusters == 0 {
                    return Err(KernelError::BadParameter(
                        "The number of clusters must be positive".to_string(),
                    ));
                }
                inter_syn_spec.validate()
            }
            _ => Ok(()),
        }
    }
}

/// The synapse of the connections: model, weight, delay, receptor and label.
/// Unset properties take the default of the model.
#[derive(Debug, PartialEq, Clone, Serialize, Deserialize)]
pub struct SynSpec {
    pub model: String,
    pub weight: Option<Parameter>,
    /// The delay in ms.
    pub delay: Option<Parameter>,
    pub receptor_type: Option<usize>,
    pub synapse_label: Option<i64>,
}

impl Default for SynSpec {
    fn default() -> Self {
        SynSpec::new("static_synapse")
    }
}

impl SynSpec {
    /// Create a specification of the given model with default properties.
    pub fn new(model: &str) -> Self {
        SynSpec {
            model: model.to_string(),
            weight: None,
            delay: None,
            receptor_type: None,
            synapse_label: None,
        }
    }

    pub fn weight<P: Into<Parameter>>(mut self, weight: P) -> Self {
        self.weight = Some(weight.into());
        self
    }

    pub fn delay<P: Into<Parameter>>(mut self, delay: P) -> Self {
        self.delay = Some(delay.into());
        self
    }

    pub fn receptor_type(mut self, receptor_type: usize) -> Self {
        self.receptor_type = Some(receptor_type);
        self
    }

    pub fn synapse_label(mut self, label: i64) -> Self {
        self.synapse_label = Some(label);
        self
    }

    /// Checks the parameters.
    pub fn validate(&self) -> Result<(), KernelError> {
        self.weight.iter().chain(self.delay.iter()).try_for_each(|p| p.validate())
    }

    /// Returns true if any parameter holds explicit per-connection values.
    pub fn has_arrays(&self) -> bool {
        self.weight.iter().chain(self.delay.iter()).any(|p| p.is_array())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::parameter::DistanceKernel;

    #[test]
    fn test_symmetric_support() {
        assert!(ConnSpec::one_to_one().symmetric().validate().is_ok());
        assert!(matches!(
            ConnSpec::fixed_indegree(2).symmetric().validate(),
            Err(KernelError::IllegalConnection(_))
        ));
    }

    #[test]
    fn test_probability_checks() {
        assert!(ConnSpec::pairwise_bernoulli(0.5).validate().is_ok());
        assert!(ConnSpec::pairwise_bernoulli(1.5).validate().is_err());
        assert!(ConnSpec::pairwise_bernoulli(Parameter::Uniform { min: 0.0, max: 1.0 })
            .validate()
            .is_err());
        assert!(ConnSpec::pairwise_bernoulli(Parameter::Distance(DistanceKernel::Gaussian {
            p_center: 1.0,
            sigma: 0.5
        }))
        .validate()
        .is_ok());
    }

    #[test]
    fn test_mask_support() {
        let mask = Mask::Circular { radius: 1.0 };
        assert!(ConnSpec::fixed_indegree(1).with_mask(mask.clone()).validate().is_ok());
        assert!(ConnSpec::one_to_one().with_mask(mask).validate().is_err());
    }

    #[test]
    fn test_syn_spec_builder() {
        let spec = SynSpec::new("stdp_synapse")
            .weight(2.0)
            .delay(Parameter::Array(vec![1.0, 2.0]))
            .synapse_label(3);
        assert!(spec.has_arrays());
        assert!(spec.validate().is_ok());
        assert_eq!(spec.synapse_label, Some(3));
    }
}
