//! Structural plasticity: connections created and deleted following the synaptic elements.
//!
//! Every update interval, between two slices:
//! 1. nodes with more bound elements than grown ones lose connections of the structural
//!    plasticity synapse, drawn at random among their incoming (dendritic elements) then outgoing
//!    (axonal elements) connections;
//! 2. the vacant axonal and dendritic elements of all nodes are shuffled and paired, each pair
//!    becoming a new connection.
//!
//! All draws come from the rank-synchronized generator, except for the properties of new
//! connections which come from the generator of the VP of their target.
use std::collections::{BTreeMap, HashMap};

use rand::seq::index::sample;
use rand::seq::SliceRandom;

use super::Kernel;
use crate::connection::builder::single_edge;
use crate::core::parameter::Parameter;
use crate::error::KernelError;
use crate::nodes::elements::{ElementKind, SynapticElements};
use crate::synapse::edge::Edge;

/// The outcome of a structural plasticity update.
#[derive(Debug, PartialEq, Eq, Clone, Copy, Default)]
pub(crate) struct Rewiring {
    pub deleted: usize,
    pub created: usize,
}

impl Kernel {
    /// Returns true if connections of the given synapse model bind synaptic elements.
    pub(super) fn tracks_elements(&self, model: &str) -> bool {
        self.config.use_structural_plasticity && self.structural_synapse.model == model
    }

    /// Bind (`delta > 0`) or release (`delta < 0`) the elements of the connected pairs.
    pub(super) fn adjust_elements(&mut self, pairs: &[(u64, u64)], delta: i64) {
        for &(source, target) in pairs {
            for (node_id, kind) in [(source, ElementKind::Axonal), (target, ElementKind::Dendritic)] {
                let Ok(slot) = self.slot_mut(node_id) else {
                    continue;
                };
                if let Some(element) = slot.elements_mut().element_mut(kind) {
                    element.connected = (element.connected as i64 + delta).max(0) as usize;
                }
            }
        }
    }

    /// Returns the shortest delay in steps of the connections structural plasticity may create,
    /// or `None` if the delay distribution has no lower bound.
    fn structural_delay_floor(&self) -> Result<Option<i64>, KernelError> {
        let syn = &self.structural_synapse;
        let delay = match &syn.delay {
            None => self.synapses.by_name(&syn.model)?.delay(),
            Some(Parameter::Constant(delay)) => *delay,
            Some(Parameter::Uniform { min, .. }) => *min,
            Some(_) => return Ok(None),
        };
        self.grid.delay_to_steps(delay, true).map(Some)
    }

    /// Checks that structural plasticity cannot create connections shorter than a time slice.
    pub(super) fn check_structural_delay(&self, slice_steps: i64) -> Result<(), KernelError> {
        if !self.config.use_structural_plasticity {
            return Ok(());
        }
        match self.structural_delay_floor()? {
            Some(delay_steps) if delay_steps < slice_steps => Err(KernelError::BadDelay(format!(
                "The delay of structural plasticity connections ({} steps) is shorter than a time slice ({} steps)",
                delay_steps, slice_steps
            ))),
            _ => Ok(()),
        }
    }

    /// Delete and create connections following the synaptic elements of all nodes.
    pub(super) fn update_structure(&mut self) -> Result<Rewiring, KernelError> {
        let syn_id = self.synapses.id_of(&self.structural_synapse.model)?;

        let mut elements: BTreeMap<u64, SynapticElements> = self
            .processes
            .iter()
            .flat_map(|process| process.nodes.iter())
            .filter(|slot| slot.elements().is_plastic())
            .map(|slot| (slot.id(), slot.elements().clone()))
            .collect();
        let mut alive: BTreeMap<(u64, u64), usize> = BTreeMap::new();
        for process in self.processes.iter() {
            for edge in process.table.connector(syn_id) {
                *alive.entry((edge.source, edge.target)).or_default() += 1;
            }
        }
        let before = alive.clone();
        let mut rank_rng = self.rank_rng.clone();

        // deletions, dendritic deficits first
        for kind in [ElementKind::Dendritic, ElementKind::Axonal] {
            let ids: Vec<u64> = elements.keys().copied().collect();
            for node_id in ids {
                let deficit = match elements.get(&node_id).and_then(|e| e.element(kind)) {
                    Some(element) if element.vacant() < 0 => (-element.vacant()) as usize,
                    _ => continue,
                };
                // incoming connections ordered by source, outgoing ones by target
                let mut candidates: Vec<(u64, u64)> = alive
                    .iter()
                    .filter(|((source, target), _)| match kind {
                        ElementKind::Dendritic => *target == node_id,
                        ElementKind::Axonal => *source == node_id,
                    })
                    .flat_map(|(pair, count)| std::iter::repeat(*pair).take(*count))
                    .collect();
                if kind == ElementKind::Axonal {
                    candidates.sort_by_key(|(_, target)| *target);
                }
                let k = deficit.min(candidates.len());
                let mut chosen: Vec<usize> = sample(&mut rank_rng, candidates.len(), k).into_vec();
                chosen.sort_unstable();
                for index in chosen {
                    let (source, target) = candidates[index];
                    if let Some(count) = alive.get_mut(&(source, target)) {
                        *count -= 1;
                    }
                    release(&mut elements, source, ElementKind::Axonal);
                    release(&mut elements, target, ElementKind::Dendritic);
                }
            }
        }
        let mut to_remove: HashMap<(u64, u64), usize> = before
            .iter()
            .map(|(pair, count)| (*pair, count - alive.get(pair).copied().unwrap_or(0)))
            .filter(|(_, removed)| *removed > 0)
            .collect();
        let deleted: usize = to_remove.values().sum();

        // creations
        let vacancies = |kind: ElementKind| -> Vec<u64> {
            elements
                .iter()
                .filter_map(|(id, e)| e.element(kind).map(|element| (*id, element.vacant())))
                .filter(|(_, vacant)| *vacant > 0)
                .flat_map(|(id, vacant)| std::iter::repeat(id).take(vacant as usize))
                .collect()
        };
        let mut axonal = vacancies(ElementKind::Axonal);
        let mut dendritic = vacancies(ElementKind::Dendritic);
        axonal.shuffle(&mut rank_rng);
        dendritic.shuffle(&mut rank_rng);

        let env = self.build_env();
        let mut vp_rngs: Vec<_> = self.processes.iter().map(|p| p.rng.clone()).collect();
        let mut created: Vec<Vec<Edge>> = vec![Vec::new(); self.processes.len()];
        let mut bound = Vec::new();
        for (&source, &target) in axonal.iter().zip(dendritic.iter()) {
            if source == target {
                continue;
            }
            let vp = self.vp_map.vp_of(target);
            let edge = single_edge(&self.structural_synapse, &env, source, target, &mut vp_rngs[vp])?;
            if edge.delay_steps < self.slice_steps {
                return Err(KernelError::BadDelay(format!(
                    "The delay of structural plasticity connections ({} steps) is shorter than a time slice ({} steps)",
                    edge.delay_steps, self.slice_steps
                )));
            }
            created[vp].push(edge);
            bound.push((source, target));
        }
        drop(env);
        for &(source, target) in bound.iter() {
            bind(&mut elements, source, ElementKind::Axonal);
            bind(&mut elements, target, ElementKind::Dendritic);
        }

        // commit
        for ((process, edges), rng) in self.processes.iter_mut().zip(created).zip(vp_rngs) {
            process.table.remove_where(|edge| {
                if edge.syn_id != syn_id {
                    return false;
                }
                match to_remove.get_mut(&(edge.source, edge.target)) {
                    Some(count) if *count > 0 => {
                        *count -= 1;
                        true
                    }
                    _ => false,
                }
            });
            process.table.extend(edges);
            process.table.sort();
            process.rng = rng;
            for slot in process.nodes.iter_mut() {
                if let Some(updated) = elements.remove(&slot.id()) {
                    *slot.elements_mut() = updated;
                }
            }
        }
        self.rank_rng = rank_rng;
        self.routing = None;
        self.gap = None;

        let rewiring = Rewiring {
            deleted,
            created: bound.len(),
        };
        log::info!(
            "Structural plasticity at {} ms: {} connections deleted, {} created",
            self.time(),
            rewiring.deleted,
            rewiring.created
        );
        Ok(rewiring)
    }
}

fn release(elements: &mut BTreeMap<u64, SynapticElements>, node_id: u64, kind: ElementKind) {
    if let Some(element) = elements.get_mut(&node_id).and_then(|e| e.element_mut(kind)) {
        element.connected = element.connected.saturating_sub(1);
    }
}

fn bind(elements: &mut BTreeMap<u64, SynapticElements>, node_id: u64, kind: ElementKind) {
    if let Some(element) = elements.get_mut(&node_id).and_then(|e| e.element_mut(kind)) {
        element.connected += 1;
    }
}
