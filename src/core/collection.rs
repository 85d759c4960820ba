//! Immutable, ordered sets of node IDs.
//!
//! A collection is a sorted list of contiguous ID ranges. A collection made of a single range is
//! *primitive* and supports slicing in constant time; other collections are *composite*.
//! Collections created with spatial positions additionally carry their layer metadata and cannot
//! be concatenated with other collections.
use std::sync::Arc;

use itertools::Itertools;

use super::spatial::Layer;
use crate::error::KernelError;

/// A contiguous range of node IDs sharing the same model, bounds included.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub struct NodeRange {
    pub first: u64,
    pub last: u64,
    pub model_id: usize,
}

impl NodeRange {
    /// Returns the number of nodes in the range.
    pub fn len(&self) -> usize {
        (self.last - self.first + 1) as usize
    }

    /// Returns true if the range is empty, which never happens for a well-formed range.
    pub fn is_empty(&self) -> bool {
        self.last < self.first
    }
}

/// An immutable set of node IDs.
#[derive(Debug, PartialEq, Clone, Default)]
pub struct NodeCollection {
    ranges: Vec<NodeRange>,
    layer: Option<Arc<Layer>>,
}

impl NodeCollection {
    /// Create an empty collection.
    pub fn empty() -> Self {
        NodeCollection::default()
    }

    /// Create a primitive collection spanning the IDs `first..=last`.
    pub fn from_range(first: u64, last: u64, model_id: usize) -> Self {
        NodeCollection {
            ranges: vec![NodeRange {
                first,
                last,
                model_id,
            }],
            layer: None,
        }
    }

    /// Create a collection from `(id, model_id)` pairs.
    /// Pairs are sorted and consecutive IDs of the same model are merged into ranges.
    /// Returns an error if an ID appears more than once.
    pub fn from_ids(mut ids: Vec<(u64, usize)>) -> Result<Self, KernelError> {
        ids.sort_by_key(|(id, _)| *id);
        if ids.windows(2).any(|w| w[0].0 == w[1].0) {
            return Err(KernelError::BadParameter(
                "Node IDs in a collection must be unique".to_string(),
            ));
        }
        let mut ranges: Vec<NodeRange> = Vec::new();
        for (id, model_id) in ids {
            match ranges.last_mut() {
                Some(range) if range.last + 1 == id && range.model_id == model_id => range.last = id,
                _ => ranges.push(NodeRange {
                    first: id,
                    last: id,
                    model_id,
                }),
            }
        }
        Ok(NodeCollection {
            ranges,
            layer: None,
        })
    }

    /// Attach spatial metadata to the collection.
    pub(crate) fn with_layer(mut self, layer: Layer) -> Self {
        self.layer = Some(Arc::new(layer));
        self
    }

    /// Returns the number of nodes in the collection.
    pub fn len(&self) -> usize {
        self.ranges.iter().map(|range| range.len()).sum()
    }

    /// Returns true if the collection has no node.
    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }

    /// Returns true if the collection is a single contiguous range of nodes of the same model.
    pub fn is_primitive(&self) -> bool {
        self.ranges.len() == 1
    }

    /// Returns the ranges composing the collection.
    pub fn ranges(&self) -> &[NodeRange] {
        &self.ranges
    }

    /// Returns the spatial metadata of the collection, if any.
    pub fn layer(&self) -> Option<&Layer> {
        self.layer.as_deref()
    }

    /// Returns the ID at the given position.
    pub fn get(&self, index: usize) -> Option<u64> {
        let mut offset = index;
        for range in self.ranges.iter() {
            if offset < range.len() {
                return Some(range.first + offset as u64);
            }
            offset -= range.len();
        }
        None
    }

    /// Returns the position of the given ID in the collection, if present.
    pub fn position(&self, node_id: u64) -> Option<usize> {
        let mut offset = 0;
        for range in self.ranges.iter() {
            if node_id >= range.first && node_id <= range.last {
                return Some(offset + (node_id - range.first) as usize);
            }
            offset += range.len();
        }
        None
    }

    /// Returns true if the collection contains the given ID.
    pub fn contains(&self, node_id: u64) -> bool {
        self.ranges
            .binary_search_by(|range| {
                if range.last < node_id {
                    std::cmp::Ordering::Less
                } else if range.first > node_id {
                    std::cmp::Ordering::Greater
                } else {
                    std::cmp::Ordering::Equal
                }
            })
            .is_ok()
    }

    /// Returns the model of the node at the given position.
    pub fn model_id_at(&self, index: usize) -> Option<usize> {
        let mut offset = index;
        for range in self.ranges.iter() {
            if offset < range.len() {
                return Some(range.model_id);
            }
            offset -= range.len();
        }
        None
    }

    /// An iterator over the IDs of the collection, in increasing order.
    pub fn iter(&self) -> impl Iterator<Item = u64> + '_ {
        self.ranges.iter().flat_map(|range| range.first..=range.last)
    }

    /// Returns the IDs of the collection as a vector.
    pub fn to_vec(&self) -> Vec<u64> {
        self.iter().collect()
    }

    /// Returns the sub-collection of positions `start..end` taken every `step` positions.
    ///
    /// Slicing a primitive collection with unit step is a constant time operation. Spatial
    /// metadata is dropped unless the whole collection is selected.
    pub fn slice(&self, start: usize, end: usize, step: usize) -> Result<Self, KernelError> {
        if step == 0 || start > end || end > self.len() {
            return Err(KernelError::BadParameter(format!(
                "Invalid slice {}..{} with step {} of a collection of size {}",
                start,
                end,
                step,
                self.len()
            )));
        }
        if start == 0 && end == self.len() && step == 1 {
            return Ok(self.clone());
        }
        if start == end {
            return Ok(NodeCollection::empty());
        }
        if self.is_primitive() && step == 1 {
            let range = self.ranges[0];
            return Ok(NodeCollection::from_range(
                range.first + start as u64,
                range.first + end as u64 - 1,
                range.model_id,
            ));
        }
        let ids = (start..end)
            .step_by(step)
            .filter_map(|index| Some((self.get(index)?, self.model_id_at(index)?)))
            .collect();
        NodeCollection::from_ids(ids)
    }

    /// Concatenate two collections.
    ///
    /// Returns an error if either collection carries spatial metadata or if the collections share
    /// any ID.
    pub fn concat(&self, other: &NodeCollection) -> Result<Self, KernelError> {
        if self.layer.is_some() || other.layer.is_some() {
            return Err(KernelError::BadParameter(
                "Collections with spatial metadata cannot be concatenated".to_string(),
            ));
        }
        let ids = self
            .ranges
            .iter()
            .chain(other.ranges.iter())
            .flat_map(|range| (range.first..=range.last).map(move |id| (id, range.model_id)))
            .collect_vec();
        NodeCollection::from_ids(ids)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_primitive_slicing() {
        let nodes = NodeCollection::from_range(11, 20, 0);
        assert!(nodes.is_primitive());
        assert_eq!(nodes.len(), 10);

        let sliced = nodes.slice(2, 5, 1).unwrap();
        assert!(sliced.is_primitive());
        assert_eq!(sliced.to_vec(), vec![13, 14, 15]);

        let stepped = nodes.slice(0, 10, 3).unwrap();
        assert!(!stepped.is_primitive());
        assert_eq!(stepped.to_vec(), vec![11, 14, 17, 20]);

        assert!(nodes.slice(5, 11, 1).is_err());
        assert!(nodes.slice(0, 5, 0).is_err());
        assert!(nodes.slice(3, 3, 1).unwrap().is_empty());
    }

    #[test]
    fn test_concat() {
        let a = NodeCollection::from_range(1, 5, 0);
        let b = NodeCollection::from_range(6, 8, 0);
        let c = NodeCollection::from_range(9, 10, 1);

        let ab = a.concat(&b).unwrap();
        assert!(ab.is_primitive());
        assert_eq!(ab.len(), 8);

        let ac = a.concat(&c).unwrap();
        assert!(!ac.is_primitive());
        assert_eq!(ac.to_vec(), vec![1, 2, 3, 4, 5, 9, 10]);
        assert_eq!(ac.model_id_at(5), Some(1));

        assert!(a.concat(&a).is_err());
        assert_eq!(a.concat(&NodeCollection::empty()).unwrap(), a);
    }

    #[test]
    fn test_lookup() {
        let nodes = NodeCollection::from_ids(vec![(3, 0), (7, 0), (8, 0), (20, 1)]).unwrap();
        assert_eq!(nodes.ranges().len(), 3);
        assert_eq!(nodes.get(2), Some(8));
        assert_eq!(nodes.get(4), None);
        assert_eq!(nodes.position(20), Some(3));
        assert!(nodes.contains(7));
        assert!(!nodes.contains(5));
    }

    #[test]
    fn test_empty_is_distinct() {
        let empty = NodeCollection::empty();
        assert!(empty.is_empty());
        assert_eq!(empty.len(), 0);
        assert!(!empty.is_primitive());
        assert_eq!(empty.iter().count(), 0);
    }
}
