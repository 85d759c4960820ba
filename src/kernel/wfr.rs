//! Gap-junction coupling over a time slice.
//!
//! Gap junctions couple the membrane potentials of neurons continuously, so that the state of a
//! neuron during a slice depends on the trajectories of its partners during the same slice. At
//! the start of each slice, the trajectories of all coupled neurons are computed once:
//! - without waveform relaxation, the partners are assumed to keep their slice-start potential;
//! - with waveform relaxation, the trajectories are predicted repeatedly, each prediction using
//!   the trajectories of the previous one, until they change by less than the tolerance.
use std::collections::HashMap;

use rayon::prelude::*;

use super::process::VirtualProcess;
use crate::config::KernelConfig;
use crate::core::time::TimeGrid;
use crate::nodes::GapInput;
use crate::synapse::{SynapseKind, SynapseRegistry};

/// The gap-junction couplings and membrane potential trajectories of a slice.
#[derive(Debug, PartialEq, Clone, Default)]
pub struct GapState {
    origin: i64,
    num_steps: i64,
    couplings: HashMap<u64, Vec<(u64, f64)>>,
    trajectories: HashMap<u64, Vec<f64>>,
    iterations: usize,
}

impl GapState {
    /// Compute the trajectories of the coupled neurons over `origin..origin + num_steps`.
    /// Returns `None` if there is no gap junction.
    pub(crate) fn compute(
        processes: &[VirtualProcess],
        synapses: &SynapseRegistry,
        config: &KernelConfig,
        grid: &TimeGrid,
        origin: i64,
        num_steps: i64,
    ) -> Option<Self> {
        let couplings = couplings(processes, synapses);
        if couplings.is_empty() {
            return None;
        }

        let mut coupled: Vec<u64> = couplings
            .iter()
            .flat_map(|(target, partners)| {
                std::iter::once(*target).chain(partners.iter().map(|(source, _)| *source))
            })
            .collect();
        coupled.sort_unstable();
        coupled.dedup();
        let slots: Vec<(u64, &VirtualProcess)> = coupled
            .iter()
            .filter_map(|id| {
                processes
                    .iter()
                    .find(|process| process.node(*id).is_some())
                    .map(|process| (*id, process))
            })
            .collect();

        let trajectories: HashMap<u64, Vec<f64>> = slots
            .iter()
            .filter_map(|(id, process)| {
                let v_m = process.node(*id)?.node().membrane_potential()?;
                Some((*id, vec![v_m; num_steps as usize + 1]))
            })
            .collect();

        let mut state = GapState {
            origin,
            num_steps,
            couplings,
            trajectories,
            iterations: 0,
        };
        if config.use_wfr {
            state.relax(&slots, config, grid);
        }
        Some(state)
    }

    /// Iterate the trajectory predictions until convergence or the iteration limit.
    fn relax(&mut self, slots: &[(u64, &VirtualProcess)], config: &KernelConfig, grid: &TimeGrid) {
        let mut max_change = f64::INFINITY;
        while self.iterations < config.wfr_max_iterations {
            let predictions: Vec<(u64, Vec<f64>)> = slots
                .par_iter()
                .filter_map(|(id, process)| {
                    let slot = process.node(*id)?;
                    let gap = GapInput {
                        couplings: self.couplings.get(id).map(|c| c.as_slice()).unwrap_or(&[]),
                        trajectories: &self.trajectories,
                        origin: self.origin,
                    };
                    let trajectory =
                        slot.predict_trajectory(self.num_steps, grid, gap, &mut process.rng.clone())?;
                    Some((*id, trajectory))
                })
                .collect();

            max_change = predictions
                .iter()
                .filter_map(|(id, new)| {
                    let old = self.trajectories.get(id)?;
                    old.iter()
                        .zip(new.iter())
                        .map(|(a, b)| (a - b).abs())
                        .reduce(f64::max)
                })
                .fold(0.0, f64::max);
            self.trajectories.extend(predictions);
            self.iterations += 1;
            if max_change < config.wfr_tol {
                break;
            }
        }
        if max_change >= config.wfr_tol {
            log::debug!(
                "Waveform relaxation did not converge in {} iterations (change {:e})",
                self.iterations,
                max_change
            );
        }
    }

    /// Returns the first step covered by the trajectories.
    pub fn origin(&self) -> i64 {
        self.origin
    }

    /// Returns true if the trajectories cover the steps from `step` to `end`.
    pub fn covers(&self, step: i64, end: i64) -> bool {
        self.origin <= step && self.origin + self.num_steps == end
    }

    /// Returns the number of relaxation iterations performed.
    pub fn iterations(&self) -> usize {
        self.iterations
    }

    /// Returns the gap input of a node, if it is coupled to any other node.
    pub fn input(&self, node_id: u64) -> Option<GapInput<'_>> {
        self.couplings.get(&node_id).map(|couplings| GapInput {
            couplings,
            trajectories: &self.trajectories,
            origin: self.origin,
        })
    }
}

/// The couplings of every target of a gap junction, ordered by partner.
fn couplings(
    processes: &[VirtualProcess],
    synapses: &SynapseRegistry,
) -> HashMap<u64, Vec<(u64, f64)>> {
    let mut couplings: HashMap<u64, Vec<(u64, f64)>> = HashMap::new();
    for process in processes.iter() {
        for (syn_id, _, edge) in process.table.iter() {
            let Some(model) = synapses.get(syn_id) else {
                continue;
            };
            if model.kind() == SynapseKind::GapJunction {
                couplings
                    .entry(edge.target)
                    .or_default()
                    .push((edge.source, edge.effective_weight(model)));
            }
        }
    }
    couplings
        .values_mut()
        .for_each(|partners| partners.sort_by_key(|(source, _)| *source));
    couplings
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::params;
    use crate::nodes::{Node, NodeSlot};
    use crate::synapse::edge::Edge;

    fn gap_edge(source: u64, target: u64, syn_id: usize) -> Edge {
        Edge {
            source,
            target,
            syn_id,
            weight: 20.0,
            delay_steps: 1,
            receptor: 0,
            label: None,
            stdp: None,
        }
    }

    fn coupled_pair(v_1: f64, v_2: f64) -> (Vec<VirtualProcess>, SynapseRegistry) {
        let synapses = SynapseRegistry::default();
        let gap_id = synapses.id_of("gap_junction").unwrap();
        let grid = TimeGrid::default();
        let mut process = VirtualProcess::new(0, 42);
        for (id, v_m) in [(1, v_1), (2, v_2)] {
            let mut slot = NodeSlot::new(0, Node::from_name("iaf_psc_delta_gap").unwrap());
            slot.set_status(&params(&[("V_m", v_m)]), &grid).unwrap();
            process.nodes.push(slot.instantiate(id, 0));
        }
        process
            .table
            .extend(vec![gap_edge(1, 2, gap_id), gap_edge(2, 1, gap_id)]);
        process.table.sort();
        (vec![process], synapses)
    }

    #[test]
    fn test_no_gap_junction() {
        let processes = vec![VirtualProcess::new(0, 42)];
        let state = GapState::compute(
            &processes,
            &SynapseRegistry::default(),
            &KernelConfig::default(),
            &TimeGrid::default(),
            0,
            10,
        );
        assert!(state.is_none());
    }

    #[test]
    fn test_constant_trajectories_without_wfr() {
        let (processes, synapses) = coupled_pair(-60.0, -65.0);
        let config = KernelConfig {
            use_wfr: false,
            ..KernelConfig::default()
        };
        let state =
            GapState::compute(&processes, &synapses, &config, &TimeGrid::default(), 5, 10).unwrap();
        assert_eq!(state.iterations(), 0);
        let input = state.input(2).unwrap();
        assert_eq!(input.couplings, &[(1, 20.0)]);
        assert_eq!(input.voltage(1, 5), Some(-60.0));
        assert_eq!(input.voltage(1, 15), Some(-60.0));
        assert_eq!(input.voltage(1, 4), None);
        assert!(state.input(3).is_none());
    }

    #[test]
    fn test_relaxation_pulls_potentials_together() {
        let (processes, synapses) = coupled_pair(-58.0, -70.0);
        let config = KernelConfig::default();
        let state =
            GapState::compute(&processes, &synapses, &config, &TimeGrid::default(), 0, 10).unwrap();
        assert!(state.iterations() >= 1);
        let input = state.input(1).unwrap();
        let (v_1, v_2) = (input.voltage(1, 10).unwrap(), input.voltage(2, 10).unwrap());
        assert!(v_1 < -58.0);
        assert!(v_2 > -70.0);
    }
}
