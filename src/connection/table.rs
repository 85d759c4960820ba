//! The connections stored on a virtual process.
//!
//! Connections live on the virtual process of their target, in one connector per synapse model.
//! Once sorted, the connections of a connector are ordered by source, so that all connections of
//! a source form a contiguous block. The position of a connection within its connector is its
//! local connection ID (lcid).
use std::collections::BTreeMap;
use std::ops::Range;

use crate::synapse::edge::Edge;

/// The connections of a virtual process, grouped by synapse model.
#[derive(Debug, PartialEq, Clone, Default)]
pub struct ConnectionTable {
    connectors: BTreeMap<usize, Vec<Edge>>,
    sorted: bool,
}

impl ConnectionTable {
    /// Add connections. The table must be sorted again before lcids are used.
    pub fn extend(&mut self, edges: Vec<Edge>) {
        if edges.is_empty() {
            return;
        }
        for edge in edges {
            self.connectors.entry(edge.syn_id).or_default().push(edge);
        }
        self.sorted = false;
    }

    /// Returns true if the connections are sorted by source within each connector.
    pub fn is_sorted(&self) -> bool {
        self.sorted || self.connectors.is_empty()
    }

    /// Sort the connections of each connector by source, keeping the creation order of each source.
    pub fn sort(&mut self) {
        if !self.sorted {
            self.connectors
                .values_mut()
                .for_each(|edges| edges.sort_by_key(|edge| edge.source));
            self.sorted = true;
        }
    }

    /// Returns the total number of connections.
    pub fn len(&self) -> usize {
        self.connectors.values().map(|edges| edges.len()).sum()
    }

    /// Returns true if the table holds no connection.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns the IDs of the synapse models with at least one connection.
    pub fn syn_ids(&self) -> impl Iterator<Item = usize> + '_ {
        self.connectors
            .iter()
            .filter(|(_, edges)| !edges.is_empty())
            .map(|(syn_id, _)| *syn_id)
    }

    /// Returns the connections of the given synapse model.
    pub fn connector(&self, syn_id: usize) -> &[Edge] {
        self.connectors
            .get(&syn_id)
            .map(|edges| edges.as_slice())
            .unwrap_or(&[])
    }

    /// Returns the connection with the given lcid.
    pub fn get(&self, syn_id: usize, lcid: usize) -> Option<&Edge> {
        self.connectors.get(&syn_id).and_then(|edges| edges.get(lcid))
    }

    /// Returns a mutable reference to the connection with the given lcid.
    pub fn get_mut(&mut self, syn_id: usize, lcid: usize) -> Option<&mut Edge> {
        self.connectors
            .get_mut(&syn_id)
            .and_then(|edges| edges.get_mut(lcid))
    }

    /// Returns the lcids of the connections of the given source and synapse model.
    /// The table must be sorted.
    pub fn block(&self, syn_id: usize, source: u64) -> Range<usize> {
        let edges = self.connector(syn_id);
        let start = edges.partition_point(|edge| edge.source < source);
        let end = edges.partition_point(|edge| edge.source <= source);
        start..end
    }

    /// An iterator over all `(syn_id, lcid, edge)` triplets.
    pub fn iter(&self) -> impl Iterator<Item = (usize, usize, &Edge)> + '_ {
        self.connectors.iter().flat_map(|(syn_id, edges)| {
            edges
                .iter()
                .enumerate()
                .map(move |(lcid, edge)| (*syn_id, lcid, edge))
        })
    }

    /// A mutable iterator over all connections.
    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Edge> + '_ {
        self.connectors.values_mut().flat_map(|edges| edges.iter_mut())
    }

    /// Removes the connections matching the predicate and returns them.
    /// The remaining connections keep their relative order.
    pub fn remove_where<F>(&mut self, mut predicate: F) -> Vec<Edge>
    where
        F: FnMut(&Edge) -> bool,
    {
        let mut removed = Vec::new();
        for edges in self.connectors.values_mut() {
            let (gone, kept): (Vec<Edge>, Vec<Edge>) =
                edges.drain(..).partition(|edge| predicate(edge));
            *edges = kept;
            removed.extend(gone);
        }
        removed
    }

    /// Remove every connection.
    pub fn clear(&mut self) {
        self.connectors.clear();
        self.sorted = false;
    }
}
