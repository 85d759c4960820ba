//! Assignment of nodes to virtual processes.
//!
//! A virtual process (VP) is a logical (rank, thread) pair. Nodes are distributed round-robin
//! over VPs, so that the VP of a node only depends on its ID and on the total number of VPs,
//! never on how the VPs are split into ranks and threads.
use serde::{Deserialize, Serialize};

use crate::error::KernelError;

/// The layout of virtual processes over ranks and threads.
#[derive(Debug, PartialEq, Eq, Clone, Copy, Serialize, Deserialize)]
pub struct VpMap {
    num_ranks: usize,
    threads_per_rank: usize,
}

impl Default for VpMap {
    fn default() -> Self {
        VpMap {
            num_ranks: 1,
            threads_per_rank: 1,
        }
    }
}

impl VpMap {
    /// Create a new layout with the specified number of ranks and threads per rank.
    pub fn build(num_ranks: usize, threads_per_rank: usize) -> Result<Self, KernelError> {
        if num_ranks == 0 || threads_per_rank == 0 {
            return Err(KernelError::BadParameter(
                "The number of ranks and threads must be positive".to_string(),
            ));
        }
        Ok(VpMap {
            num_ranks,
            threads_per_rank,
        })
    }

    /// Create a layout with a total number of VPs spread over the specified number of ranks.
    pub fn from_total(total_num_vps: usize, num_ranks: usize) -> Result<Self, KernelError> {
        if num_ranks == 0 || total_num_vps == 0 || total_num_vps % num_ranks != 0 {
            return Err(KernelError::BadParameter(format!(
                "total_num_virtual_procs ({}) must be a positive multiple of num_ranks ({})",
                total_num_vps, num_ranks
            )));
        }
        VpMap::build(num_ranks, total_num_vps / num_ranks)
    }

    /// Returns the number of ranks.
    pub fn num_ranks(&self) -> usize {
        self.num_ranks
    }

    /// Returns the number of threads per rank.
    pub fn threads_per_rank(&self) -> usize {
        self.threads_per_rank
    }

    /// Returns the total number of virtual processes.
    pub fn num_vps(&self) -> usize {
        self.num_ranks * self.threads_per_rank
    }

    /// Returns the VP of the node with the given (1-based) ID.
    pub fn vp_of(&self, node_id: u64) -> usize {
        (node_id % self.num_vps() as u64) as usize
    }

    /// Returns the rank hosting the given VP.
    pub fn rank_of_vp(&self, vp: usize) -> usize {
        vp % self.num_ranks
    }

    /// Returns the thread (within its rank) hosting the given VP.
    pub fn thread_of_vp(&self, vp: usize) -> usize {
        vp / self.num_ranks
    }

    /// Returns the VP of the given thread on the given rank.
    pub fn vp_of_thread(&self, rank: usize, thread: usize) -> usize {
        thread * self.num_ranks + rank
    }

    /// Returns the (rank, thread) pair hosting the node with the given ID.
    pub fn locate(&self, node_id: u64) -> (usize, usize) {
        let vp = self.vp_of(node_id);
        (self.rank_of_vp(vp), self.thread_of_vp(vp))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_vp_layout() {
        let vp_map = VpMap::build(2, 3).unwrap();
        assert_eq!(vp_map.num_vps(), 6);
        for vp in 0..6 {
            let rank = vp_map.rank_of_vp(vp);
            let thread = vp_map.thread_of_vp(vp);
            assert!(rank < 2 && thread < 3);
            assert_eq!(vp_map.vp_of_thread(rank, thread), vp);
        }
    }

    #[test]
    fn test_vp_assignment_independent_of_split() {
        let splits = [
            VpMap::from_total(4, 1).unwrap(),
            VpMap::from_total(4, 2).unwrap(),
            VpMap::from_total(4, 4).unwrap(),
        ];
        for node_id in 1..200 {
            let vps: Vec<usize> = splits.iter().map(|map| map.vp_of(node_id)).collect();
            assert!(vps.iter().all(|&vp| vp == vps[0]));
        }
    }

    #[test]
    fn test_invalid_layout() {
        assert!(VpMap::build(0, 1).is_err());
        assert!(VpMap::from_total(6, 4).is_err());
        assert!(VpMap::from_total(0, 1).is_err());
    }
}
