//! Creating, removing, querying and modifying connections.
use serde::{Deserialize, Serialize};

use super::{Kernel, KernelState};
use crate::connection::builder::{self, BuildEnv, NodeCaps};
use crate::connection::spec::{ConnSpec, SynSpec};
use crate::connection::view::{collect_views, ConnectionFilter, ConnectionId, ConnectionView};
use crate::core::collection::NodeCollection;
use crate::core::{KernelRng, ParamDict};
use crate::error::KernelError;
use crate::synapse::edge::Edge;

/// The rules supported by [`Kernel::disconnect`].
#[derive(Debug, PartialEq, Eq, Clone, Copy, Serialize, Deserialize)]
pub enum DisconnectRule {
    /// Remove one connection from the i-th source to the i-th target, for every i.
    OneToOne,
    /// Remove every connection from any source to any target.
    AllToAll,
}

impl Kernel {
    pub(crate) fn build_env(&self) -> BuildEnv<'_> {
        BuildEnv {
            vp_map: self.vp_map,
            grid: self.grid.clone(),
            seed: self.config.rng_seed,
            allow_offgrid_delays: self.config.allow_offgrid_delays,
            min_delay: self.config.min_delay,
            max_delay: self.config.max_delay,
            synapses: &self.synapses,
        }
    }

    fn caps(&self, node_id: u64) -> Option<NodeCaps> {
        self.slot(node_id).ok().map(|slot| {
            let node = slot.node();
            NodeCaps {
                can_send: node.can_send(),
                can_receive: node.can_receive(),
                num_receptors: node.num_receptors(),
                supports_gap_junctions: node.supports_gap_junctions(),
            }
        })
    }

    /// Connect `sources` to `targets` following the rule of `conn`, with synapses described by `syn`.
    ///
    /// Either every connection is created, or none is and the generators are left untouched.
    pub fn connect(
        &mut self,
        sources: &NodeCollection,
        targets: &NodeCollection,
        conn: &ConnSpec,
        syn: &SynSpec,
    ) -> Result<(), KernelError> {
        self.ensure_configured("connect")?;
        if sources.is_empty() || targets.is_empty() {
            return Err(KernelError::IllegalConnection(
                "Cannot connect empty collections".to_string(),
            ));
        }

        let mut vp_rngs: Vec<KernelRng> = self.processes.iter().map(|p| p.rng.clone()).collect();
        let mut rank_rng = self.rank_rng.clone();
        let staged = builder::build(
            sources,
            targets,
            conn,
            syn,
            &self.build_env(),
            |node_id| self.caps(node_id),
            &mut vp_rngs,
            &mut rank_rng,
        )?;

        self.flush_pending();
        let mut num_created = 0;
        let mut created_pairs = Vec::new();
        let tracks_elements = self.tracks_elements(&syn.model);
        for ((process, edges), rng) in self.processes.iter_mut().zip(staged).zip(vp_rngs) {
            num_created += edges.len();
            if tracks_elements {
                created_pairs.extend(edges.iter().map(|edge| (edge.source, edge.target)));
            }
            process.table.extend(edges);
            process.table.sort();
            process.rng = rng;
        }
        self.rank_rng = rank_rng;
        if tracks_elements {
            self.adjust_elements(&created_pairs, 1);
        }
        self.routing = None;
        self.gap = None;
        log::info!(
            "Connected {} sources to {} targets with rule {} and synapse {}: {} connections",
            sources.len(),
            targets.len(),
            conn.rule.name(),
            syn.model,
            num_created
        );
        Ok(())
    }

    /// Remove connections from `sources` to `targets`, of the given synapse model or of any model.
    ///
    /// With [`DisconnectRule::OneToOne`], the collections must have the same size and every pair
    /// must be connected; otherwise nothing is removed.
    pub fn disconnect(
        &mut self,
        sources: &NodeCollection,
        targets: &NodeCollection,
        rule: DisconnectRule,
        syn_model: Option<&str>,
    ) -> Result<(), KernelError> {
        self.ensure_configured("disconnect")?;
        if sources.is_empty() || targets.is_empty() {
            return Err(KernelError::IllegalConnection(
                "Cannot disconnect empty collections".to_string(),
            ));
        }
        let syn_id = syn_model.map(|name| self.synapses.id_of(name)).transpose()?;
        for node_id in sources.iter().chain(targets.iter()) {
            self.slot(node_id)?;
        }
        let matches = |edge: &Edge, source: u64, target: u64| {
            edge.source == source && edge.target == target && syn_id.map_or(true, |id| edge.syn_id == id)
        };

        let removed: Vec<Edge> = match rule {
            DisconnectRule::OneToOne => {
                if sources.len() != targets.len() {
                    return Err(KernelError::IllegalConnection(format!(
                        "one_to_one requires collections of equal size, got {} sources and {} targets",
                        sources.len(),
                        targets.len()
                    )));
                }
                let pairs: Vec<(u64, u64)> = sources.iter().zip(targets.iter()).collect();
                // every pair must be connected, counting repeated pairs
                let mut needed: std::collections::HashMap<(u64, u64), usize> = Default::default();
                pairs.iter().for_each(|pair| *needed.entry(*pair).or_default() += 1);
                for (&(source, target), &count) in needed.iter() {
                    let table = &self.processes[self.vp_map.vp_of(target)].table;
                    let available = table
                        .iter()
                        .filter(|(_, _, edge)| matches(edge, source, target))
                        .count();
                    if available < count {
                        return Err(KernelError::IllegalConnection(format!(
                            "No connection from node {} to node {} to remove",
                            source, target
                        )));
                    }
                }
                self.flush_pending();
                let mut removed = Vec::new();
                for process in self.processes.iter_mut() {
                    removed.extend(process.table.remove_where(|edge| {
                        match needed.get_mut(&(edge.source, edge.target)) {
                            Some(count) if *count > 0 && matches(edge, edge.source, edge.target) => {
                                *count -= 1;
                                true
                            }
                            _ => false,
                        }
                    }));
                }
                removed
            }
            DisconnectRule::AllToAll => {
                self.flush_pending();
                let mut removed = Vec::new();
                for process in self.processes.iter_mut() {
                    removed.extend(process.table.remove_where(|edge| {
                        sources.contains(edge.source)
                            && targets.contains(edge.target)
                            && matches(edge, edge.source, edge.target)
                    }));
                }
                removed
            }
        };

        let structural_model = self.structural_synapse.model.clone();
        let sp_pairs: Vec<(u64, u64)> = removed
            .iter()
            .filter(|edge| {
                self.synapses
                    .get(edge.syn_id)
                    .map_or(false, |model| model.name() == structural_model)
            })
            .map(|edge| (edge.source, edge.target))
            .collect();
        if self.tracks_elements(&structural_model) {
            self.adjust_elements(&sp_pairs, -1);
        }
        self.routing = None;
        self.gap = None;
        log::info!("Removed {} connections", removed.len());
        Ok(())
    }

    /// Returns the connections matching the filter, ordered by source, target and synapse model.
    pub fn get_connections(&self, filter: &ConnectionFilter) -> Vec<ConnectionView> {
        let mut views: Vec<ConnectionView> = self
            .processes
            .iter()
            .flat_map(|process| {
                collect_views(process.vp, &process.table, filter, &self.synapses, &self.grid)
            })
            .collect();
        views.sort_by_key(|view| (view.source, view.target, view.id.syn_id, view.id.vp, view.id.lcid));
        views
    }

    fn edge(&self, id: ConnectionId) -> Result<&Edge, KernelError> {
        self.processes
            .get(id.vp)
            .and_then(|process| process.table.get(id.syn_id, id.lcid))
            .ok_or_else(|| KernelError::IllegalConnection(format!("No connection {:?}", id)))
    }

    /// Returns the properties of a connection.
    pub fn get_connection_status(&self, id: ConnectionId) -> Result<ParamDict, KernelError> {
        let edge = self.edge(id)?;
        let model = self
            .synapses
            .get(edge.syn_id)
            .ok_or_else(|| KernelError::UnknownModel(edge.syn_id.to_string()))?;
        Ok(edge.get_status(model, &self.grid))
    }

    /// Set properties of connections. Nothing changes if any connection rejects them.
    ///
    /// Between prepare and cleanup, only weights (and plasticity traces) can change.
    pub fn set_connection_status(
        &mut self,
        ids: &[ConnectionId],
        params: &ParamDict,
    ) -> Result<(), KernelError> {
        let changes_delays = params.contains_key("delay") || params.contains_key("receptor_type");
        if changes_delays && self.state == KernelState::Prepared {
            return Err(KernelError::KernelState(
                "Cannot change delays or receptors between prepare and cleanup".to_string(),
            ));
        }
        let env = self.build_env();
        let mut updated = Vec::with_capacity(ids.len());
        for &id in ids {
            let mut edge = self.edge(id)?.clone();
            let model = self
                .synapses
                .get(edge.syn_id)
                .ok_or_else(|| KernelError::UnknownModel(edge.syn_id.to_string()))?;
            edge.set_status(params, model, |delay| env.quantize_delay(delay))?;
            let num_receptors = self.slot(edge.target)?.node().num_receptors();
            if edge.receptor >= num_receptors {
                return Err(KernelError::BadProperty(format!(
                    "Node {} has no receptor {}",
                    edge.target, edge.receptor
                )));
            }
            updated.push((id, edge));
        }
        if changes_delays {
            self.flush_pending();
        }
        for (id, edge) in updated {
            if let Some(stored) = self.processes[id.vp].table.get_mut(id.syn_id, id.lcid) {
                *stored = edge;
            }
        }
        Ok(())
    }
}
