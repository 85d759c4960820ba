//! Read-only views of connections, as returned by connection queries.
use serde::{Deserialize, Serialize};

use super::table::ConnectionTable;
use crate::core::collection::NodeCollection;
use crate::core::time::TimeGrid;
use crate::synapse::edge::Edge;
use crate::synapse::SynapseRegistry;

/// Identifies a stored connection: the VP holding it, its synapse model and its lcid.
///
/// Handles stay valid until connections are added or removed.
#[derive(Debug, PartialEq, Eq, Clone, Copy, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ConnectionId {
    pub vp: usize,
    pub syn_id: usize,
    pub lcid: usize,
}

/// A snapshot of a connection.
#[derive(Debug, PartialEq, Clone, Serialize, Deserialize)]
pub struct ConnectionView {
    pub id: ConnectionId,
    pub source: u64,
    pub target: u64,
    pub synapse_model: String,
    pub weight: f64,
    /// The delay in ms.
    pub delay: f64,
    pub receptor_type: usize,
    pub synapse_label: Option<i64>,
}

/// Which connections a query returns. Unset fields match every connection.
#[derive(Debug, PartialEq, Clone, Default)]
pub struct ConnectionFilter {
    pub sources: Option<NodeCollection>,
    pub targets: Option<NodeCollection>,
    pub synapse_model: Option<String>,
    pub synapse_label: Option<i64>,
}

impl ConnectionFilter {
    pub fn new() -> Self {
        ConnectionFilter::default()
    }

    pub fn sources(mut self, sources: NodeCollection) -> Self {
        self.sources = Some(sources);
        self
    }

    pub fn targets(mut self, targets: NodeCollection) -> Self {
        self.targets = Some(targets);
        self
    }

    pub fn synapse_model(mut self, model: &str) -> Self {
        self.synapse_model = Some(model.to_string());
        self
    }

    pub fn synapse_label(mut self, label: i64) -> Self {
        self.synapse_label = Some(label);
        self
    }

    fn matches(&self, edge: &Edge, syn_id: Option<usize>) -> bool {
        self.sources.as_ref().map_or(true, |s| s.contains(edge.source))
            && self.targets.as_ref().map_or(true, |t| t.contains(edge.target))
            && syn_id.map_or(true, |id| id == edge.syn_id)
            && self.synapse_label.map_or(true, |label| edge.label == Some(label))
    }
}

/// Collect the views of the connections of a VP matching the filter.
///
/// An unknown synapse model in the filter matches nothing.
pub(crate) fn collect_views(
    vp: usize,
    table: &ConnectionTable,
    filter: &ConnectionFilter,
    synapses: &SynapseRegistry,
    grid: &TimeGrid,
) -> Vec<ConnectionView> {
    let syn_id = match &filter.synapse_model {
        Some(name) => match synapses.id_of(name) {
            Ok(id) => Some(id),
            Err(_) => return Vec::new(),
        },
        None => None,
    };
    table
        .iter()
        .filter(|(_, _, edge)| filter.matches(edge, syn_id))
        .filter_map(|(syn_id, lcid, edge)| {
            let model = synapses.get(syn_id)?;
            Some(ConnectionView {
                id: ConnectionId { vp, syn_id, lcid },
                source: edge.source,
                target: edge.target,
                synapse_model: model.name().to_string(),
                weight: edge.effective_weight(model),
                delay: grid.steps_to_ms(edge.delay_steps),
                receptor_type: edge.receptor,
                synapse_label: edge.label,
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn edge(source: u64, target: u64, syn_id: usize, label: Option<i64>) -> Edge {
        Edge {
            source,
            target,
            syn_id,
            weight: 2.0,
            delay_steps: 15,
            receptor: 0,
            label,
            stdp: None,
        }
    }

    #[test]
    fn test_filters() {
        let mut table = ConnectionTable::default();
        table.extend(vec![
            edge(1, 3, 0, None),
            edge(2, 3, 0, Some(7)),
            edge(1, 4, 1, None),
        ]);
        table.sort();
        let synapses = SynapseRegistry::default();
        let grid = TimeGrid::default();

        let all = collect_views(0, &table, &ConnectionFilter::new(), &synapses, &grid);
        assert_eq!(all.len(), 3);
        assert_eq!(all[0].delay, 1.5);

        let from_1 = ConnectionFilter::new().sources(NodeCollection::from_range(1, 1, 0));
        assert_eq!(collect_views(0, &table, &from_1, &synapses, &grid).len(), 2);

        let hom = ConnectionFilter::new().synapse_model("static_synapse_hom_w");
        let views = collect_views(0, &table, &hom, &synapses, &grid);
        assert_eq!(views.len(), 1);
        assert_eq!(views[0].weight, 1.0);

        let labelled = ConnectionFilter::new().synapse_label(7);
        let views = collect_views(0, &table, &labelled, &synapses, &grid);
        assert_eq!(views.len(), 1);
        assert_eq!(views[0].source, 2);

        let unknown = ConnectionFilter::new().synapse_model("bernoulli_synapse");
        assert!(collect_views(0, &table, &unknown, &synapses, &grid).is_empty());
    }
}
