//! Turning connection rules into concrete connections.
//!
//! Connections are built on the virtual process (VP) of their target. Each VP iterates over its
//! own targets, in collection order, and draws from its own generator, so the connections only
//! depend on the seed and on the total number of VPs. Draws that must be shared by all VPs, such
//! as the targets of a source for `fixed_outdegree` or the pairs of `fixed_total_number`, come
//! from the rank-synchronized generator, which every rank advances identically. Symmetric
//! connections draw their properties from a generator keyed by the pair of nodes, so that both
//! directions agree even when built on different VPs.
//!
//! Nothing is committed here: the connections are returned per VP, and the caller adds them
//! only if every VP succeeded.
use std::collections::HashSet;

use rand::seq::index::sample;
use rand::Rng;
use rayon::prelude::*;

use super::spec::{ConnRule, ConnSpec, SynSpec};
use crate::core::collection::NodeCollection;
use crate::core::parameter::{ArrayShape, Parameter};
use crate::core::spatial::{Layer, Mask};
use crate::core::time::TimeGrid;
use crate::core::vp::VpMap;
use crate::core::{pair_rng, KernelRng};
use crate::error::KernelError;
use crate::synapse::edge::Edge;
use crate::synapse::{SynapseKind, SynapseModel, SynapseRegistry};
use crate::MIN_VPS_PAR;

/// What the builder needs to know about a node.
#[derive(Debug, PartialEq, Clone, Copy)]
pub struct NodeCaps {
    pub can_send: bool,
    pub can_receive: bool,
    pub num_receptors: usize,
    pub supports_gap_junctions: bool,
}

/// The kernel settings relevant to connection building.
#[derive(Debug, Clone)]
pub struct BuildEnv<'a> {
    pub vp_map: VpMap,
    pub grid: TimeGrid,
    pub seed: u64,
    pub allow_offgrid_delays: bool,
    pub min_delay: Option<f64>,
    pub max_delay: Option<f64>,
    pub synapses: &'a SynapseRegistry,
}

impl<'a> BuildEnv<'a> {
    /// Converts a delay in ms to steps, checking it against the user-imposed delay bounds.
    pub fn quantize_delay(&self, delay: f64) -> Result<i64, KernelError> {
        let steps = self.grid.delay_to_steps(delay, self.allow_offgrid_delays)?;
        let delay = self.grid.steps_to_ms(steps);
        if let Some(min_delay) = self.min_delay {
            if delay < min_delay - 0.5 * self.grid.resolution() {
                return Err(KernelError::BadDelay(format!(
                    "delay {} ms is smaller than min_delay {} ms",
                    delay, min_delay
                )));
            }
        }
        if let Some(max_delay) = self.max_delay {
            if delay > max_delay + 0.5 * self.grid.resolution() {
                return Err(KernelError::BadDelay(format!(
                    "delay {} ms is larger than max_delay {} ms",
                    delay, max_delay
                )));
            }
        }
        Ok(steps)
    }
}

/// The position of a connection in the iteration order of a rule.
#[derive(Debug, Clone, Copy)]
struct Position {
    index: usize,
    row: usize,
    col: usize,
}

impl Position {
    fn matrix(row: usize, col: usize, cols: usize) -> Self {
        Position {
            index: row * cols + col,
            row,
            col,
        }
    }

    fn flat(index: usize) -> Self {
        Position {
            index,
            row: index,
            col: 0,
        }
    }
}

/// A synapse specification resolved against its model.
struct ResolvedSyn<'a> {
    spec: &'a SynSpec,
    model: &'a SynapseModel,
}

impl<'a> ResolvedSyn<'a> {
    fn resolve(spec: &'a SynSpec, synapses: &'a SynapseRegistry) -> Result<Self, KernelError> {
        spec.validate()?;
        let model = synapses.by_name(&spec.model)?;
        if model.has_common_weight() && spec.weight.is_some() {
            return Err(KernelError::BadProperty(format!(
                "The weight of {} is a common property and cannot be set per connection",
                model.name()
            )));
        }
        if model.kind() == SynapseKind::GapJunction
            && spec.delay.is_some()
        {
            return Err(KernelError::BadProperty(
                "Gap junctions have no delay".to_string(),
            ));
        }
        Ok(ResolvedSyn { spec, model })
    }

    fn receptor(&self) -> usize {
        self.spec
            .receptor_type
            .unwrap_or_else(|| self.model.receptor_type())
    }

    fn is_gap(&self) -> bool {
        self.model.kind() == SynapseKind::GapJunction
    }

    fn check_shapes(&self, shape: ArrayShape) -> Result<(), KernelError> {
        self.spec
            .weight
            .iter()
            .chain(self.spec.delay.iter())
            .try_for_each(|p| p.check_shape(shape))
    }

    fn edge<R: Rng>(
        &self,
        source: u64,
        target: u64,
        rng: &mut R,
        pos: Position,
        distance: Option<f64>,
        env: &BuildEnv,
    ) -> Result<Edge, KernelError> {
        let weight = match &self.spec.weight {
            Some(weight) => weight.value(rng, pos.index, pos.row, pos.col, distance)?,
            None => self.model.weight(),
        };
        let delay_steps = if self.is_gap() {
            0
        } else {
            let delay = match &self.spec.delay {
                Some(delay) => delay.value(rng, pos.index, pos.row, pos.col, distance)?,
                None => self.model.delay(),
            };
            env.quantize_delay(delay)?
        };
        let mut edge = self.model.default_edge(source, target, delay_steps);
        edge.weight = weight;
        edge.receptor = self.receptor();
        edge.label = self.spec.synapse_label;
        Ok(edge)
    }
}

/// Positions of the connected collections.
struct Geometry<'a> {
    sources: Option<&'a Layer>,
    targets: Option<&'a Layer>,
}

impl<'a> Geometry<'a> {
    /// Returns the displacement between a pair, from the source if `from_source` and from the
    /// target otherwise. Periodic boundaries are those of the layer of the other node.
    fn displacement(&self, s_idx: usize, t_idx: usize, from_source: bool) -> Option<[f64; 2]> {
        let (sources, targets) = (self.sources?, self.targets?);
        let (s_pos, t_pos) = (sources.position(s_idx)?, targets.position(t_idx)?);
        if from_source {
            Some(targets.displacement(s_pos, t_pos))
        } else {
            Some(sources.displacement(t_pos, s_pos))
        }
    }

    fn distance(&self, s_idx: usize, t_idx: usize, from_source: bool) -> Option<f64> {
        self.displacement(s_idx, t_idx, from_source)
            .map(|d| d[0].hypot(d[1]))
    }

    fn in_mask(&self, mask: Option<&Mask>, s_idx: usize, t_idx: usize, from_source: bool) -> bool {
        match mask {
            Some(mask) => self
                .displacement(s_idx, t_idx, from_source)
                .map(|d| mask.contains(d))
                .unwrap_or(false),
            None => true,
        }
    }
}

/// Run `build_vp` for every VP with its generator, in parallel when worthwhile.
fn per_vp<F>(rngs: &mut [KernelRng], build_vp: F) -> Result<Vec<Vec<Edge>>, KernelError>
where
    F: Fn(usize, &mut KernelRng) -> Result<Vec<Edge>, KernelError> + Sync + Send,
{
    if rngs.len() >= MIN_VPS_PAR {
        rngs.par_iter_mut()
            .enumerate()
            .map(|(vp, rng)| build_vp(vp, rng))
            .collect()
    } else {
        rngs.iter_mut()
            .enumerate()
            .map(|(vp, rng)| build_vp(vp, rng))
            .collect()
    }
}

/// Drop repeated `(source, target)` pairs, keeping the first occurrence.
fn dedup_pairs(edges: &mut Vec<Edge>) {
    let mut seen = HashSet::new();
    edges.retain(|edge| seen.insert((edge.source, edge.target, edge.syn_id)));
}

/// Draw `k` partners among the candidates, distinct unless multapses are allowed.
fn draw_partners<R: Rng>(
    rng: &mut R,
    candidates: &[usize],
    k: usize,
    allow_multapses: bool,
    driver: u64,
) -> Result<Vec<usize>, KernelError> {
    if k == 0 {
        return Ok(Vec::new());
    }
    if candidates.is_empty() || (!allow_multapses && k > candidates.len()) {
        return Err(KernelError::IllegalConnection(format!(
            "Node {} cannot get {} distinct partners out of {} eligible nodes",
            driver,
            k,
            candidates.len()
        )));
    }
    if allow_multapses {
        Ok((0..k)
            .map(|_| candidates[rng.gen_range(0..candidates.len())])
            .collect())
    } else {
        Ok(sample(rng, candidates.len(), k)
            .into_iter()
            .map(|i| candidates[i])
            .collect())
    }
}

/// Draw `n` pairs of positions among the sources and targets with the rank-synchronized generator.
fn draw_pairs(
    rng: &mut KernelRng,
    s_ids: &[u64],
    t_ids: &[u64],
    n: usize,
    conn: &ConnSpec,
) -> Result<Vec<(usize, usize)>, KernelError> {
    let num_autapses = if conn.allow_autapses {
        0
    } else {
        let targets: HashSet<u64> = t_ids.iter().copied().collect();
        s_ids.iter().filter(|s| targets.contains(s)).count()
    };
    let eligible = s_ids.len() * t_ids.len() - num_autapses;
    if n > 0 && (eligible == 0 || (!conn.allow_multapses && n > eligible)) {
        return Err(KernelError::IllegalConnection(format!(
            "Cannot draw {} connections out of {} eligible pairs",
            n, eligible
        )));
    }
    let mut seen = HashSet::new();
    let mut pairs = Vec::with_capacity(n);
    while pairs.len() < n {
        let s_idx = rng.gen_range(0..s_ids.len());
        let t_idx = rng.gen_range(0..t_ids.len());
        if !conn.allow_autapses && s_ids[s_idx] == t_ids[t_idx] {
            continue;
        }
        if !conn.allow_multapses && !seen.insert((s_idx, t_idx)) {
            continue;
        }
        pairs.push((s_idx, t_idx));
    }
    Ok(pairs)
}

fn check_endpoints<F>(
    sources: &NodeCollection,
    targets: &NodeCollection,
    conn: &ConnSpec,
    syns: &[&ResolvedSyn],
    caps: &F,
) -> Result<(), KernelError>
where
    F: Fn(u64) -> Option<NodeCaps>,
{
    if sources.is_empty() || targets.is_empty() {
        return Err(KernelError::IllegalConnection(
            "Cannot connect empty collections".to_string(),
        ));
    }
    let lookup = |id: u64| caps(id).ok_or_else(|| KernelError::UnknownNode(id.to_string()));
    let check_target = |id: u64, caps: NodeCaps| -> Result<(), KernelError> {
        if !caps.can_receive {
            return Err(KernelError::IllegalConnection(format!(
                "Node {} cannot receive spikes",
                id
            )));
        }
        for syn in syns {
            if syn.receptor() >= caps.num_receptors {
                return Err(KernelError::IllegalConnection(format!(
                    "Node {} has no receptor {}",
                    id,
                    syn.receptor()
                )));
            }
            if syn.is_gap() && !caps.supports_gap_junctions {
                return Err(KernelError::IllegalConnection(format!(
                    "Node {} does not support gap junctions",
                    id
                )));
            }
        }
        Ok(())
    };
    let check_source = |id: u64, caps: NodeCaps| -> Result<(), KernelError> {
        if caps.can_send {
            Ok(())
        } else {
            Err(KernelError::IllegalConnection(format!(
                "Node {} cannot send spikes",
                id
            )))
        }
    };
    for id in sources.iter() {
        let caps = lookup(id)?;
        check_source(id, caps)?;
        if conn.make_symmetric {
            check_target(id, caps)?;
        }
    }
    for id in targets.iter() {
        let caps = lookup(id)?;
        check_target(id, caps)?;
        if conn.make_symmetric {
            check_source(id, caps)?;
        }
    }
    Ok(())
}

/// Build a single connection, e.g., for a pair of synaptic elements matched by structural
/// plasticity. Parameters drawn at random use `rng`, the generator of the target VP.
pub(crate) fn single_edge<R: Rng>(
    syn: &SynSpec,
    env: &BuildEnv,
    source: u64,
    target: u64,
    rng: &mut R,
) -> Result<Edge, KernelError> {
    let syn = ResolvedSyn::resolve(syn, env.synapses)?;
    syn.edge(source, target, rng, Position::flat(0), None, env)
}

/// Build the connections from `sources` to `targets`, grouped by the VP of their target.
///
/// `caps` describes existing nodes and returns `None` for unknown IDs. `vp_rngs` holds the
/// generator of each VP and `rank_rng` the rank-synchronized generator.
pub fn build<F>(
    sources: &NodeCollection,
    targets: &NodeCollection,
    conn: &ConnSpec,
    syn: &SynSpec,
    env: &BuildEnv,
    caps: F,
    vp_rngs: &mut [KernelRng],
    rank_rng: &mut KernelRng,
) -> Result<Vec<Vec<Edge>>, KernelError>
where
    F: Fn(u64) -> Option<NodeCaps> + Sync,
{
    conn.validate()?;
    let primary = ResolvedSyn::resolve(syn, env.synapses)?;
    let inter = match &conn.rule {
        ConnRule::ClusteredFixedTotalNumber { inter_syn_spec, .. } => {
            Some(ResolvedSyn::resolve(inter_syn_spec, env.synapses)?)
        }
        _ => None,
    };
    let syns: Vec<&ResolvedSyn> = std::iter::once(&primary).chain(inter.iter()).collect();
    if syns.iter().any(|syn| syn.is_gap()) && !conn.make_symmetric {
        return Err(KernelError::IllegalConnection(
            "Gap junctions require make_symmetric".to_string(),
        ));
    }
    if conn.make_symmetric && syns.iter().any(|syn| syn.spec.has_arrays()) {
        return Err(KernelError::BadParameter(
            "make_symmetric cannot be combined with weight or delay arrays".to_string(),
        ));
    }
    check_endpoints(sources, targets, conn, &syns, &caps)?;

    let geometry = Geometry {
        sources: sources.layer(),
        targets: targets.layer(),
    };
    let spatial = syns.iter().any(|syn| {
        syn.spec
            .weight
            .iter()
            .chain(syn.spec.delay.iter())
            .any(|p| p.is_spatial())
    }) || conn.mask.is_some()
        || matches!(
            &conn.rule,
            ConnRule::PairwiseBernoulli {
                p: Parameter::Distance(_),
                ..
            }
        );
    if spatial && (geometry.sources.is_none() || geometry.targets.is_none()) {
        return Err(KernelError::BadParameter(
            "Masks and distance-dependent parameters require spatial collections".to_string(),
        ));
    }

    let s_ids = sources.to_vec();
    let t_ids = targets.to_vec();
    let (n_s, n_t) = (s_ids.len(), t_ids.len());
    let vp_map = env.vp_map;
    let mask = conn.mask.as_ref();
    let is_autapse = |s: u64, t: u64| !conn.allow_autapses && s == t;

    let mut staged = match &conn.rule {
        ConnRule::OneToOne => {
            if n_s != n_t {
                return Err(KernelError::IllegalConnection(format!(
                    "one_to_one requires collections of equal size, got {} sources and {} targets",
                    n_s, n_t
                )));
            }
            primary.check_shapes(ArrayShape::Flat(n_s))?;
            per_vp(vp_rngs, |vp, rng| {
                let mut edges = Vec::new();
                for (i, (&s, &t)) in s_ids.iter().zip(t_ids.iter()).enumerate() {
                    if is_autapse(s, t) {
                        continue;
                    }
                    let distance = geometry.distance(i, i, false);
                    let forward = vp_map.vp_of(t) == vp;
                    if conn.make_symmetric {
                        let mirror = vp_map.vp_of(s) == vp && s != t;
                        if !forward && !mirror {
                            continue;
                        }
                        let mut pair = pair_rng(env.seed, s, t);
                        let edge = primary.edge(s, t, &mut pair, Position::flat(i), distance, env)?;
                        if forward {
                            edges.push(edge.clone());
                        }
                        if mirror {
                            edges.push(Edge {
                                source: t,
                                target: s,
                                ..edge
                            });
                        }
                    } else if forward {
                        edges.push(primary.edge(s, t, rng, Position::flat(i), distance, env)?);
                    }
                }
                Ok(edges)
            })?
        }
        ConnRule::AllToAll => {
            primary.check_shapes(ArrayShape::Matrix { rows: n_t, cols: n_s })?;
            per_vp(vp_rngs, |vp, rng| {
                let mut edges = Vec::new();
                for (t_idx, &t) in t_ids.iter().enumerate() {
                    if vp_map.vp_of(t) != vp {
                        continue;
                    }
                    for (s_idx, &s) in s_ids.iter().enumerate() {
                        if is_autapse(s, t) {
                            continue;
                        }
                        let pos = Position::matrix(t_idx, s_idx, n_s);
                        let distance = geometry.distance(s_idx, t_idx, false);
                        let edge = if conn.make_symmetric {
                            primary.edge(s, t, &mut pair_rng(env.seed, s, t), pos, distance, env)?
                        } else {
                            primary.edge(s, t, rng, pos, distance, env)?
                        };
                        edges.push(edge);
                    }
                }
                if conn.make_symmetric {
                    for (s_idx, &s) in s_ids.iter().enumerate() {
                        if vp_map.vp_of(s) != vp {
                            continue;
                        }
                        for (t_idx, &t) in t_ids.iter().enumerate() {
                            if s == t {
                                continue;
                            }
                            let pos = Position::matrix(t_idx, s_idx, n_s);
                            let distance = geometry.distance(s_idx, t_idx, false);
                            let edge =
                                primary.edge(s, t, &mut pair_rng(env.seed, s, t), pos, distance, env)?;
                            edges.push(Edge {
                                source: t,
                                target: s,
                                ..edge
                            });
                        }
                    }
                }
                Ok(edges)
            })?
        }
        ConnRule::PairwiseBernoulli { p, use_on_source } => {
            if primary.spec.has_arrays() {
                return Err(KernelError::BadParameter(
                    "pairwise_bernoulli does not support parameter arrays".to_string(),
                ));
            }
            let from_source = *use_on_source;
            // one trial per pair, then the properties of the connection if the trial succeeds
            let trial = |s_idx: usize, t_idx: usize, rng: &mut KernelRng| -> Result<bool, KernelError> {
                if !geometry.in_mask(mask, s_idx, t_idx, from_source) {
                    return Ok(false);
                }
                let distance = geometry.distance(s_idx, t_idx, from_source);
                let p = p
                    .deterministic_value(0, 0, 0, distance)
                    .ok_or_else(|| {
                        KernelError::BadParameter("Invalid connection probability".to_string())
                    })?
                    .clamp(0.0, 1.0);
                Ok(rng.gen::<f64>() < p)
            };
            per_vp(vp_rngs, |vp, rng| {
                let mut edges = Vec::new();
                for (t_idx, &t) in t_ids.iter().enumerate() {
                    if vp_map.vp_of(t) != vp {
                        continue;
                    }
                    for (s_idx, &s) in s_ids.iter().enumerate() {
                        if is_autapse(s, t) {
                            continue;
                        }
                        let distance = geometry.distance(s_idx, t_idx, from_source);
                        let pos = Position::matrix(t_idx, s_idx, n_s);
                        if conn.make_symmetric {
                            let mut pair = pair_rng(env.seed, s, t);
                            if trial(s_idx, t_idx, &mut pair)? {
                                edges.push(primary.edge(s, t, &mut pair, pos, distance, env)?);
                            }
                        } else if trial(s_idx, t_idx, rng)? {
                            edges.push(primary.edge(s, t, rng, pos, distance, env)?);
                        }
                    }
                }
                if conn.make_symmetric {
                    for (s_idx, &s) in s_ids.iter().enumerate() {
                        if vp_map.vp_of(s) != vp {
                            continue;
                        }
                        for (t_idx, &t) in t_ids.iter().enumerate() {
                            if s == t {
                                continue;
                            }
                            let mut pair = pair_rng(env.seed, s, t);
                            if trial(s_idx, t_idx, &mut pair)? {
                                let distance = geometry.distance(s_idx, t_idx, from_source);
                                let pos = Position::matrix(t_idx, s_idx, n_s);
                                let edge = primary.edge(s, t, &mut pair, pos, distance, env)?;
                                edges.push(Edge {
                                    source: t,
                                    target: s,
                                    ..edge
                                });
                            }
                        }
                    }
                }
                Ok(edges)
            })?
        }
        ConnRule::FixedIndegree { indegree } => {
            let k = *indegree;
            primary.check_shapes(ArrayShape::Matrix { rows: n_t, cols: k })?;
            per_vp(vp_rngs, |vp, rng| {
                let mut edges = Vec::new();
                for (t_idx, &t) in t_ids.iter().enumerate() {
                    if vp_map.vp_of(t) != vp {
                        continue;
                    }
                    let candidates: Vec<usize> = (0..n_s)
                        .filter(|&s_idx| {
                            !is_autapse(s_ids[s_idx], t)
                                && geometry.in_mask(mask, s_idx, t_idx, false)
                        })
                        .collect();
                    let chosen = draw_partners(rng, &candidates, k, conn.allow_multapses, t)?;
                    for (j, s_idx) in chosen.into_iter().enumerate() {
                        let distance = geometry.distance(s_idx, t_idx, false);
                        let pos = Position::matrix(t_idx, j, k);
                        edges.push(primary.edge(s_ids[s_idx], t, rng, pos, distance, env)?);
                    }
                }
                Ok(edges)
            })?
        }
        ConnRule::FixedOutdegree { outdegree } => {
            let k = *outdegree;
            primary.check_shapes(ArrayShape::Matrix { rows: n_s, cols: k })?;
            let mut drawn = Vec::with_capacity(n_s * k);
            for (s_idx, &s) in s_ids.iter().enumerate() {
                let candidates: Vec<usize> = (0..n_t)
                    .filter(|&t_idx| {
                        !is_autapse(s, t_ids[t_idx]) && geometry.in_mask(mask, s_idx, t_idx, true)
                    })
                    .collect();
                let chosen = draw_partners(rank_rng, &candidates, k, conn.allow_multapses, s)?;
                drawn.extend(chosen.into_iter().enumerate().map(|(j, t_idx)| (s_idx, t_idx, j)));
            }
            per_vp(vp_rngs, |vp, rng| {
                drawn
                    .iter()
                    .filter(|(_, t_idx, _)| vp_map.vp_of(t_ids[*t_idx]) == vp)
                    .map(|&(s_idx, t_idx, j)| {
                        let distance = geometry.distance(s_idx, t_idx, true);
                        let pos = Position::matrix(s_idx, j, k);
                        primary.edge(s_ids[s_idx], t_ids[t_idx], rng, pos, distance, env)
                    })
                    .collect()
            })?
        }
        ConnRule::FixedTotalNumber { n } => {
            primary.check_shapes(ArrayShape::Flat(*n))?;
            let pairs = draw_pairs(rank_rng, &s_ids, &t_ids, *n, conn)?;
            per_vp(vp_rngs, |vp, rng| {
                pairs
                    .iter()
                    .enumerate()
                    .filter(|(_, (_, t_idx))| vp_map.vp_of(t_ids[*t_idx]) == vp)
                    .map(|(i, &(s_idx, t_idx))| {
                        let distance = geometry.distance(s_idx, t_idx, false);
                        primary.edge(s_ids[s_idx], t_ids[t_idx], rng, Position::flat(i), distance, env)
                    })
                    .collect()
            })?
        }
        ConnRule::ClusteredFixedTotalNumber { n, clusters, .. } => {
            let inter = inter.as_ref().ok_or_else(|| {
                KernelError::BadParameter("Missing inter-cluster synapse specification".to_string())
            })?;
            if syns.iter().any(|syn| syn.spec.has_arrays()) {
                return Err(KernelError::BadParameter(
                    "clustered_fixed_total_number does not support parameter arrays".to_string(),
                ));
            }
            if *clusters > n_s || *clusters > n_t {
                return Err(KernelError::BadParameter(format!(
                    "Cannot split {} sources and {} targets into {} clusters",
                    n_s, n_t, clusters
                )));
            }
            let cluster_of = |idx: usize, len: usize| idx * clusters / len;
            let pairs = draw_pairs(rank_rng, &s_ids, &t_ids, *n, conn)?;
            per_vp(vp_rngs, |vp, rng| {
                pairs
                    .iter()
                    .enumerate()
                    .filter(|(_, (_, t_idx))| vp_map.vp_of(t_ids[*t_idx]) == vp)
                    .map(|(i, &(s_idx, t_idx))| {
                        let syn = if cluster_of(s_idx, n_s) == cluster_of(t_idx, n_t) {
                            &primary
                        } else {
                            inter
                        };
                        let distance = geometry.distance(s_idx, t_idx, false);
                        syn.edge(s_ids[s_idx], t_ids[t_idx], rng, Position::flat(i), distance, env)
                    })
                    .collect()
            })?
        }
    };

    if conn.make_symmetric {
        staged.iter_mut().for_each(dedup_pairs);
    }
    Ok(staged)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::parameter::DistanceKernel;
    use crate::core::spatial::Positions;
    use crate::core::stream_rng;
    use itertools::Itertools;

    fn env(synapses: &SynapseRegistry, num_vps: usize) -> BuildEnv<'_> {
        BuildEnv {
            vp_map: VpMap::from_total(num_vps, 1).unwrap(),
            grid: TimeGrid::default(),
            seed: 42,
            allow_offgrid_delays: false,
            min_delay: None,
            max_delay: None,
            synapses,
        }
    }

    fn neuron_caps(_id: u64) -> Option<NodeCaps> {
        Some(NodeCaps {
            can_send: true,
            can_receive: true,
            num_receptors: 1,
            supports_gap_junctions: false,
        })
    }

    fn run(
        sources: &NodeCollection,
        targets: &NodeCollection,
        conn: &ConnSpec,
        syn: &SynSpec,
        num_vps: usize,
    ) -> Result<Vec<Edge>, KernelError> {
        let synapses = SynapseRegistry::default();
        let env = env(&synapses, num_vps);
        let mut rngs: Vec<KernelRng> = (0..num_vps).map(|vp| stream_rng(42, vp as u64 + 1)).collect();
        let mut rank_rng = stream_rng(42, 0);
        let staged = build(sources, targets, conn, syn, &env, neuron_caps, &mut rngs, &mut rank_rng)?;
        Ok(staged.into_iter().flatten().collect())
    }

    fn pairs(edges: &[Edge]) -> Vec<(u64, u64)> {
        edges.iter().map(|e| (e.source, e.target)).sorted().collect()
    }

    #[test]
    fn test_one_to_one() {
        let nodes = NodeCollection::from_range(1, 4, 0);
        let targets = NodeCollection::from_range(5, 8, 0);
        let edges = run(&nodes, &targets, &ConnSpec::one_to_one(), &SynSpec::default(), 2).unwrap();
        assert_eq!(pairs(&edges), vec![(1, 5), (2, 6), (3, 7), (4, 8)]);

        let result = run(
            &nodes,
            &NodeCollection::from_range(5, 7, 0),
            &ConnSpec::one_to_one(),
            &SynSpec::default(),
            1,
        );
        assert!(matches!(result, Err(KernelError::IllegalConnection(_))));
    }

    #[test]
    fn test_all_to_all_autapses() {
        let nodes = NodeCollection::from_range(1, 3, 0);
        let conn = ConnSpec::all_to_all().with_autapses(false);
        let edges = run(&nodes, &nodes, &conn, &SynSpec::default(), 2).unwrap();
        assert_eq!(edges.len(), 6);
        assert!(edges.iter().all(|e| e.source != e.target));
    }

    #[test]
    fn test_all_to_all_weight_matrix() {
        let sources = NodeCollection::from_range(1, 2, 0);
        let targets = NodeCollection::from_range(3, 5, 0);
        let syn = SynSpec::default().weight(Parameter::Matrix(vec![
            vec![1.0, 2.0],
            vec![3.0, 4.0],
            vec![5.0, 6.0],
        ]));
        let edges = run(&sources, &targets, &ConnSpec::all_to_all(), &syn, 2).unwrap();
        let weight = |s: u64, t: u64| {
            edges
                .iter()
                .find(|e| e.source == s && e.target == t)
                .unwrap()
                .weight
        };
        assert_eq!(weight(1, 3), 1.0);
        assert_eq!(weight(2, 3), 2.0);
        assert_eq!(weight(2, 5), 6.0);

        let bad = SynSpec::default().weight(Parameter::Array(vec![1.0; 5]));
        assert!(run(&sources, &targets, &ConnSpec::all_to_all(), &bad, 1).is_err());
    }

    #[test]
    fn test_fixed_indegree() {
        let nodes = NodeCollection::from_range(1, 20, 0);
        let conn = ConnSpec::fixed_indegree(5)
            .with_autapses(false)
            .with_multapses(false);
        let edges = run(&nodes, &nodes, &conn, &SynSpec::default(), 3).unwrap();
        assert_eq!(edges.len(), 100);
        for (target, group) in &edges.iter().sorted_by_key(|e| e.target).chunk_by(|e| e.target) {
            let sources: Vec<u64> = group.map(|e| e.source).collect();
            assert_eq!(sources.len(), 5);
            assert!(sources.iter().all_unique());
            assert!(!sources.contains(&target));
        }

        let conn = ConnSpec::fixed_indegree(20)
            .with_autapses(false)
            .with_multapses(false);
        assert!(matches!(
            run(&nodes, &nodes, &conn, &SynSpec::default(), 1),
            Err(KernelError::IllegalConnection(_))
        ));
    }

    #[test]
    fn test_fixed_outdegree_independent_of_vps() {
        let nodes = NodeCollection::from_range(1, 30, 0);
        let conn = ConnSpec::fixed_outdegree(4).with_multapses(false);
        let edges_1 = run(&nodes, &nodes, &conn, &SynSpec::default(), 1).unwrap();
        let edges_4 = run(&nodes, &nodes, &conn, &SynSpec::default(), 4).unwrap();
        assert_eq!(pairs(&edges_1), pairs(&edges_4));
        for (_, group) in &edges_1.iter().sorted_by_key(|e| e.source).chunk_by(|e| e.source) {
            assert_eq!(group.count(), 4);
        }
    }

    #[test]
    fn test_fixed_total_number() {
        let sources = NodeCollection::from_range(1, 3, 0);
        let targets = NodeCollection::from_range(4, 6, 0);
        let conn = ConnSpec::fixed_total_number(9).with_multapses(false);
        let edges = run(&sources, &targets, &conn, &SynSpec::default(), 2).unwrap();
        assert_eq!(edges.len(), 9);
        assert!(pairs(&edges).iter().all_unique());

        let conn = ConnSpec::fixed_total_number(10).with_multapses(false);
        assert!(run(&sources, &targets, &conn, &SynSpec::default(), 2).is_err());
    }

    #[test]
    fn test_clustered() {
        let nodes = NodeCollection::from_range(1, 10, 0);
        let inter = SynSpec::default().weight(-1.0);
        let conn = ConnSpec::clustered_fixed_total_number(200, 2, inter);
        let edges = run(&nodes, &nodes, &conn, &SynSpec::default().weight(1.0), 2).unwrap();
        assert_eq!(edges.len(), 200);
        for edge in edges.iter() {
            let same = (edge.source <= 5) == (edge.target <= 5);
            assert_eq!(edge.weight, if same { 1.0 } else { -1.0 });
        }
    }

    #[test]
    fn test_symmetric_bernoulli() {
        let nodes = NodeCollection::from_range(1, 30, 0);
        let conn = ConnSpec::pairwise_bernoulli(0.3)
            .with_autapses(false)
            .symmetric();
        let syn = SynSpec::default().weight(Parameter::Uniform { min: 0.0, max: 1.0 });
        let edges = run(&nodes, &nodes, &conn, &syn, 3).unwrap();
        assert!(!edges.is_empty());
        for edge in edges.iter() {
            let mirror = edges
                .iter()
                .filter(|e| e.source == edge.target && e.target == edge.source)
                .collect_vec();
            assert_eq!(mirror.len(), 1);
            assert_eq!(mirror[0].weight, edge.weight);
            assert_eq!(mirror[0].delay_steps, edge.delay_steps);
        }
        assert_eq!(pairs(&edges), pairs(&run(&nodes, &nodes, &conn, &syn, 1).unwrap()));
    }

    #[test]
    fn test_symmetric_one_to_one() {
        let sources = NodeCollection::from_range(1, 3, 0);
        let targets = NodeCollection::from_range(4, 6, 0);
        let syn = SynSpec::default().weight(Parameter::Normal { mean: 0.0, std: 1.0 });
        let edges = run(&sources, &targets, &ConnSpec::one_to_one().symmetric(), &syn, 2).unwrap();
        assert_eq!(
            pairs(&edges),
            vec![(1, 4), (2, 5), (3, 6), (4, 1), (5, 2), (6, 3)]
        );
    }

    #[test]
    fn test_gap_junctions_require_symmetry() {
        let nodes = NodeCollection::from_range(1, 2, 0);
        let result = run(&nodes, &nodes, &ConnSpec::one_to_one(), &SynSpec::new("gap_junction"), 1);
        assert!(matches!(result, Err(KernelError::IllegalConnection(_))));
    }

    #[test]
    fn test_empty_and_unknown_endpoints() {
        let nodes = NodeCollection::from_range(1, 2, 0);
        let result = run(
            &NodeCollection::empty(),
            &nodes,
            &ConnSpec::all_to_all(),
            &SynSpec::default(),
            1,
        );
        assert!(matches!(result, Err(KernelError::IllegalConnection(_))));

        let synapses = SynapseRegistry::default();
        let env = env(&synapses, 1);
        let mut rngs = vec![stream_rng(42, 1)];
        let mut rank_rng = stream_rng(42, 0);
        let result = build(
            &nodes,
            &nodes,
            &ConnSpec::all_to_all(),
            &SynSpec::default(),
            &env,
            |id| if id == 1 { neuron_caps(id) } else { None },
            &mut rngs,
            &mut rank_rng,
        );
        assert!(matches!(result, Err(KernelError::UnknownNode(_))));
    }

    #[test]
    fn test_bad_delay() {
        let nodes = NodeCollection::from_range(1, 2, 0);
        let syn = SynSpec::default().delay(0.25);
        let result = run(&nodes, &nodes, &ConnSpec::all_to_all(), &syn, 1);
        assert!(matches!(result, Err(KernelError::BadDelay(_))));
    }

    #[test]
    fn test_spatial_mask() {
        let mut rng = stream_rng(0, 0);
        let layer = Positions::Grid {
            shape: [5, 5],
            extent: None,
            center: [0.0, 0.0],
            edge_wrap: false,
        }
        .build_layer(&mut rng)
        .unwrap();
        let nodes = NodeCollection::from_range(1, 25, 0).with_layer(layer);
        let conn = ConnSpec::pairwise_bernoulli(1.0)
            .with_autapses(false)
            .with_mask(Mask::Circular { radius: 1.0 });
        let edges = run(&nodes, &nodes, &conn, &SynSpec::default(), 2).unwrap();
        // 4 corners with 2 neighbours, 12 border nodes with 3, 9 inner nodes with 4
        assert_eq!(edges.len(), 4 * 2 + 12 * 3 + 9 * 4);

        let gaussian = ConnSpec::pairwise_bernoulli(Parameter::Distance(DistanceKernel::Gaussian {
            p_center: 1.0,
            sigma: 1e-3,
        }));
        let edges = run(&nodes, &nodes, &gaussian, &SynSpec::default(), 2).unwrap();
        assert!(edges.iter().all(|e| e.source == e.target));

        let plain = NodeCollection::from_range(1, 25, 0);
        assert!(matches!(
            run(&plain, &plain, &conn, &SynSpec::default(), 1),
            Err(KernelError::BadParameter(_))
        ));
    }
}
