//! Virtual processes: the nodes, connections and generator owned by one (rank, thread) pair.
use std::ops::Range;

use derivative::Derivative;

use super::delivery::OutSpike;
use super::wfr::GapState;
use crate::connection::table::ConnectionTable;
use crate::core::time::TimeGrid;
use crate::core::{stream_rng, KernelRng};
use crate::nodes::{NodeSlot, StepContext};

/// The state owned by a virtual process.
///
/// Nodes are stored in increasing ID order, connections are those targeting the nodes of the VP.
#[derive(Derivative, Clone)]
#[derivative(Debug)]
pub struct VirtualProcess {
    pub(crate) vp: usize,
    pub(crate) nodes: Vec<NodeSlot>,
    pub(crate) table: ConnectionTable,
    #[derivative(Debug = "ignore")]
    pub(crate) rng: KernelRng,
    /// The spikes emitted since the last exchange, in emission order.
    pub(crate) outbox: Vec<OutSpike>,
}

impl VirtualProcess {
    pub(crate) fn new(vp: usize, seed: u64) -> Self {
        VirtualProcess {
            vp,
            nodes: Vec::new(),
            table: ConnectionTable::default(),
            rng: stream_rng(seed, vp as u64 + 1),
            outbox: Vec::new(),
        }
    }

    /// Returns the ID of the virtual process.
    pub fn vp(&self) -> usize {
        self.vp
    }

    /// Returns the nodes of the virtual process.
    pub fn nodes(&self) -> &[NodeSlot] {
        &self.nodes
    }

    /// Returns the connections stored on the virtual process.
    pub fn table(&self) -> &ConnectionTable {
        &self.table
    }

    pub(crate) fn reseed(&mut self, seed: u64) {
        self.rng = stream_rng(seed, self.vp as u64 + 1);
    }

    fn position(&self, node_id: u64) -> Option<usize> {
        self.nodes
            .binary_search_by_key(&node_id, |slot| slot.id())
            .ok()
    }

    pub(crate) fn node(&self, node_id: u64) -> Option<&NodeSlot> {
        self.position(node_id).map(|i| &self.nodes[i])
    }

    pub(crate) fn node_mut(&mut self, node_id: u64) -> Option<&mut NodeSlot> {
        self.position(node_id).map(move |i| &mut self.nodes[i])
    }

    /// Advance every node over the given steps, step by step, collecting the emitted spikes.
    pub(crate) fn update(&mut self, steps: Range<i64>, grid: &TimeGrid, gap: Option<&GapState>) {
        let mut emitted = Vec::new();
        for step in steps {
            for slot in self.nodes.iter_mut() {
                let ctx = StepContext {
                    step,
                    grid,
                    gap: gap.and_then(|gap| gap.input(slot.id())),
                };
                emitted.clear();
                slot.update(&ctx, &mut self.rng, &mut emitted);
                let sender = slot.id();
                self.outbox.extend(emitted.iter().map(|emission| OutSpike {
                    sender,
                    stamp: emission.time.stamp(),
                    offset: emission.time.offset,
                    multiplicity: emission.multiplicity,
                }));
            }
        }
    }

    /// Forget the spikes of the archives older than `time` (ms).
    pub(crate) fn prune_archives(&mut self, time: f64) {
        self.nodes
            .iter_mut()
            .for_each(|slot| slot.archive_mut().prune_before(time));
    }
}
