//! Spike exchange between virtual processes at the end of a time slice.
//!
//! During a slice, every VP appends the spikes of its nodes to its outbox. At the end of the
//! slice, the outboxes are turned into wire units following the routing table, gathered per
//! destination rank and exchanged all-to-all. Each VP then expands the units it receives into
//! deliveries, one per connection, sorts them canonically and passes them to the targets.
//!
//! With compression, a wire unit stands for the whole block of connections of a source on a
//! destination VP for one synapse model; without, a unit stands for a single connection. Both
//! lead to the same deliveries.
use std::collections::HashMap;
use std::ops::Range;

use serde::{Deserialize, Serialize};

use super::process::VirtualProcess;
use crate::core::time::{PreciseTime, TimeGrid};
use crate::core::vp::VpMap;
use crate::nodes::buffer::InEvent;
use crate::synapse::{SynapseKind, SynapseRegistry};

/// A spike waiting in the outbox of the VP of its sender.
#[derive(Debug, PartialEq, Clone, Copy)]
pub struct OutSpike {
    pub sender: u64,
    /// The first grid step not earlier than the spike time.
    pub stamp: i64,
    /// The sub-step offset, zero for grid spikes.
    pub offset: f64,
    pub multiplicity: u32,
}

impl OutSpike {
    /// Returns the emission time.
    pub fn time(&self) -> PreciseTime {
        emission_time(self.stamp, self.offset)
    }
}

fn emission_time(stamp: i64, offset: f64) -> PreciseTime {
    if offset > 0.0 {
        PreciseTime {
            step: stamp - 1,
            offset,
        }
    } else {
        PreciseTime::on_grid(stamp)
    }
}

/// The unit of data sent from one VP to another.
#[derive(Debug, PartialEq, Clone, Serialize, Deserialize)]
pub struct WireUnit {
    pub sender: u64,
    /// The stamp of the spike relative to the first step of the slice.
    pub lag: i64,
    pub offset: f64,
    pub multiplicity: u32,
    pub syn_id: usize,
    /// The lcids of the connections the unit is delivered along.
    pub lcids: Range<usize>,
}

/// A wire unit with the VP it is addressed to.
type Addressed = (usize, WireUnit);

/// Counters of the spike exchange.
#[derive(Debug, PartialEq, Eq, Clone, Copy, Default, Serialize, Deserialize)]
pub struct DeliveryStats {
    /// The number of spikes emitted.
    pub spikes_sent: u64,
    /// The number of wire units exchanged.
    pub wire_units: u64,
    /// The number of events passed to target nodes.
    pub events_delivered: u64,
    /// The number of events dropped, e.g., for connections removed after the spike was routed.
    pub events_dropped: u64,
}

impl DeliveryStats {
    fn add(&mut self, other: &DeliveryStats) {
        self.spikes_sent += other.spikes_sent;
        self.wire_units += other.wire_units;
        self.events_delivered += other.events_delivered;
        self.events_dropped += other.events_dropped;
    }
}

/// The connections of a source on one VP, for one synapse model.
#[derive(Debug, PartialEq, Clone)]
struct Route {
    vp: usize,
    syn_id: usize,
    lcids: Range<usize>,
}

/// For every source, where its spikes must be sent.
#[derive(Debug, PartialEq, Clone, Default)]
pub struct RoutingTable {
    routes: HashMap<u64, Vec<Route>>,
}

impl RoutingTable {
    /// Build the routes from the sorted connection tables. Gap junctions carry no spikes.
    pub(crate) fn build(processes: &[VirtualProcess], synapses: &SynapseRegistry) -> Self {
        let mut routes: HashMap<u64, Vec<Route>> = HashMap::new();
        for process in processes.iter() {
            for syn_id in process.table.syn_ids() {
                let is_gap = synapses
                    .get(syn_id)
                    .map(|model| model.kind() == SynapseKind::GapJunction)
                    .unwrap_or(false);
                if is_gap {
                    continue;
                }
                let edges = process.table.connector(syn_id);
                let mut start = 0;
                while start < edges.len() {
                    let source = edges[start].source;
                    let end = start + edges[start..].partition_point(|edge| edge.source == source);
                    routes.entry(source).or_default().push(Route {
                        vp: process.vp,
                        syn_id,
                        lcids: start..end,
                    });
                    start = end;
                }
            }
        }
        RoutingTable { routes }
    }

    /// Returns the number of sources with at least one route.
    pub fn num_sources(&self) -> usize {
        self.routes.len()
    }

    fn routes(&self, source: u64) -> &[Route] {
        self.routes
            .get(&source)
            .map(|routes| routes.as_slice())
            .unwrap_or(&[])
    }
}

/// Turn an outbox into wire units, grouped by destination rank.
pub(crate) fn pack(
    outbox: Vec<OutSpike>,
    routing: &RoutingTable,
    vp_map: &VpMap,
    origin: i64,
    compressed: bool,
) -> (Vec<Vec<Addressed>>, DeliveryStats) {
    let mut buffers: Vec<Vec<Addressed>> = vec![Vec::new(); vp_map.num_ranks()];
    let mut stats = DeliveryStats::default();
    for spike in outbox.iter() {
        stats.spikes_sent += 1;
        for route in routing.routes(spike.sender) {
            let buffer = &mut buffers[vp_map.rank_of_vp(route.vp)];
            let unit = |lcids: Range<usize>| WireUnit {
                sender: spike.sender,
                lag: spike.stamp - origin,
                offset: spike.offset,
                multiplicity: spike.multiplicity,
                syn_id: route.syn_id,
                lcids,
            };
            if compressed {
                buffer.push((route.vp, unit(route.lcids.clone())));
            } else {
                buffer.extend(route.lcids.clone().map(|lcid| (route.vp, unit(lcid..lcid + 1))));
            }
        }
    }
    stats.wire_units = buffers.iter().map(|buffer| buffer.len() as u64).sum();
    (buffers, stats)
}

/// Exchange the buffers of all VPs: the buffers of the threads of each rank are flattened into a
/// send buffer per destination rank, then each rank receives the buffers addressed to it.
pub(crate) fn all_to_all(per_vp: Vec<Vec<Vec<Addressed>>>, vp_map: &VpMap) -> Vec<Vec<Addressed>> {
    let num_ranks = vp_map.num_ranks();
    let mut send: Vec<Vec<Vec<Addressed>>> = (0..num_ranks)
        .map(|_| (0..num_ranks).map(|_| Vec::new()).collect())
        .collect();
    for (vp, buffers) in per_vp.into_iter().enumerate() {
        let rank = vp_map.rank_of_vp(vp);
        for (destination, buffer) in buffers.into_iter().enumerate() {
            send[rank][destination].extend(buffer);
        }
    }
    (0..num_ranks)
        .map(|destination| {
            send.iter_mut()
                .flat_map(|buffers| std::mem::take(&mut buffers[destination]))
                .collect()
        })
        .collect()
}

/// A spike to be passed along one connection.
#[derive(Debug, PartialEq, Clone, Copy)]
struct Delivery {
    stamp: i64,
    sender: u64,
    offset: f64,
    syn_id: usize,
    lcid: usize,
    multiplicity: u32,
}

/// Deliver the units of the rank inbox addressed to the VP, in canonical order.
///
/// Events through connections which no longer exist, or whose step was already read by the
/// target, are dropped.
pub(crate) fn deliver(
    process: &mut VirtualProcess,
    inbox: &[Addressed],
    origin: i64,
    synapses: &SynapseRegistry,
    grid: &TimeGrid,
) -> DeliveryStats {
    let mut deliveries: Vec<Delivery> = inbox
        .iter()
        .filter(|(vp, _)| *vp == process.vp)
        .flat_map(|(_, unit)| {
            unit.lcids.clone().map(move |lcid| Delivery {
                stamp: origin + unit.lag,
                sender: unit.sender,
                offset: unit.offset,
                syn_id: unit.syn_id,
                lcid,
                multiplicity: unit.multiplicity,
            })
        })
        .collect();
    deliveries.sort_by(|a, b| {
        a.stamp
            .cmp(&b.stamp)
            .then(a.sender.cmp(&b.sender))
            .then(a.offset.total_cmp(&b.offset))
            .then(a.syn_id.cmp(&b.syn_id))
            .then(a.lcid.cmp(&b.lcid))
    });

    let mut stats = DeliveryStats::default();
    for delivery in deliveries {
        let edge = match process.table.get_mut(delivery.syn_id, delivery.lcid) {
            Some(edge) if edge.source == delivery.sender => edge,
            _ => {
                log::debug!(
                    "Dropping spike of node {}: connection {}:{} no longer exists",
                    delivery.sender,
                    delivery.syn_id,
                    delivery.lcid
                );
                stats.events_dropped += 1;
                continue;
            }
        };
        let target = match process
            .nodes
            .binary_search_by_key(&edge.target, |slot| slot.id())
        {
            Ok(index) => &mut process.nodes[index],
            Err(_) => {
                stats.events_dropped += 1;
                continue;
            }
        };
        let Some(model) = synapses.get(delivery.syn_id) else {
            stats.events_dropped += 1;
            continue;
        };

        let mut weight = edge.effective_weight(model);
        if let Some(state) = edge.stdp.as_mut() {
            let t_spike = emission_time(delivery.stamp, delivery.offset).to_ms(grid);
            weight = model.stdp().on_pre_spike(
                state,
                edge.weight,
                t_spike,
                grid.steps_to_ms(edge.delay_steps),
                target.archive(),
            );
            edge.weight = weight;
        }
        let event = InEvent {
            sender: delivery.sender,
            weight,
            multiplicity: delivery.multiplicity,
            offset: delivery.offset,
            delay_steps: edge.delay_steps,
            receptor: edge.receptor,
        };
        let read_step = delivery.stamp + edge.delay_steps - 1;
        if target.enqueue(read_step, event) {
            stats.events_delivered += 1;
        } else {
            log::debug!(
                "Dropping spike of node {} to node {}: step {} was already read",
                delivery.sender,
                edge.target,
                read_step
            );
            stats.events_dropped += 1;
        }
    }
    stats
}

/// Add the counters of every VP.
pub(crate) fn total(stats: &[DeliveryStats]) -> DeliveryStats {
    let mut sum = DeliveryStats::default();
    stats.iter().for_each(|s| sum.add(s));
    sum
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::synapse::edge::Edge;

    fn edge(source: u64, target: u64) -> Edge {
        Edge {
            source,
            target,
            syn_id: 0,
            weight: 1.0,
            delay_steps: 2,
            receptor: 0,
            label: None,
            stdp: None,
        }
    }

    fn processes() -> Vec<VirtualProcess> {
        let mut processes: Vec<VirtualProcess> = (0..2).map(|vp| VirtualProcess::new(vp, 1)).collect();
        processes[0].table.extend(vec![edge(1, 2), edge(1, 4), edge(3, 2)]);
        processes[1].table.extend(vec![edge(1, 3)]);
        processes.iter_mut().for_each(|p| p.table.sort());
        processes
    }

    #[test]
    fn test_compression_only_changes_grouping() {
        let synapses = SynapseRegistry::default();
        let processes = processes();
        let routing = RoutingTable::build(&processes, &synapses);
        assert_eq!(routing.num_sources(), 2);

        let vp_map = VpMap::build(2, 1).unwrap();
        let outbox = vec![OutSpike {
            sender: 1,
            stamp: 12,
            offset: 0.0,
            multiplicity: 1,
        }];
        let (compressed, stats_c) = pack(outbox.clone(), &routing, &vp_map, 10, true);
        let (plain, stats_p) = pack(outbox, &routing, &vp_map, 10, false);
        assert_eq!(stats_c.wire_units, 2);
        assert_eq!(stats_p.wire_units, 3);

        let expand = |buffers: &Vec<Vec<Addressed>>| {
            let mut lcids: Vec<(usize, usize)> = buffers
                .iter()
                .flatten()
                .flat_map(|(vp, unit)| unit.lcids.clone().map(move |lcid| (*vp, lcid)))
                .collect();
            lcids.sort();
            lcids
        };
        assert_eq!(expand(&compressed), expand(&plain));
        assert!(compressed[0].iter().all(|(vp, unit)| *vp == 0 && unit.lag == 2));
    }

    #[test]
    fn test_all_to_all_gathers_per_rank() {
        let vp_map = VpMap::build(2, 2).unwrap();
        let unit = |sender: u64| WireUnit {
            sender,
            lag: 0,
            offset: 0.0,
            multiplicity: 1,
            syn_id: 0,
            lcids: 0..1,
        };
        // VP v sends one unit to rank v % 2
        let per_vp: Vec<Vec<Vec<Addressed>>> = (0..4)
            .map(|vp| {
                let mut buffers = vec![Vec::new(), Vec::new()];
                buffers[vp % 2].push((vp, unit(vp as u64)));
                buffers
            })
            .collect();
        let inboxes = all_to_all(per_vp, &vp_map);
        let senders = |rank: usize| inboxes[rank].iter().map(|(_, u)| u.sender).collect::<Vec<_>>();
        assert_eq!(senders(0), vec![0, 2]);
        assert_eq!(senders(1), vec![1, 3]);
    }

    #[test]
    fn test_deliver_drops_stale_units() {
        let synapses = SynapseRegistry::default();
        let grid = TimeGrid::default();
        let mut processes = processes();
        let unit = WireUnit {
            sender: 1,
            lag: 0,
            offset: 0.0,
            multiplicity: 1,
            syn_id: 0,
            lcids: 0..3,
        };
        // no nodes on the VP: every delivery is dropped
        let stats = deliver(&mut processes[0], &[(0, unit)], 0, &synapses, &grid);
        assert_eq!(stats.events_delivered, 0);
        assert_eq!(stats.events_dropped, 3);
    }
}
