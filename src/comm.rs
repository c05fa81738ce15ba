//! Process-group abstraction used by the preconditioner
//!
//! Collectives operate on the caller's trainer group (its own grid in a
//! dual-grid run). Point-to-point transfers address ranks of the combined
//! group spanning both grids.

use crate::KfacResult;
use serde::{Deserialize, Serialize};

/// Which of the two cooperating grids a process belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum GridId {
    Primary = 1,
    Secondary = 2,
}

impl GridId {
    /// Grid number (1 or 2)
    pub fn number(&self) -> usize {
        *self as usize
    }

    pub fn other(&self) -> GridId {
        match self {
            GridId::Primary => GridId::Secondary,
            GridId::Secondary => GridId::Primary,
        }
    }
}

/// Combined-group ranks of both grids, indexed by grid-local rank
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GridLayout {
    pub primary: Vec<usize>,
    pub secondary: Vec<usize>,
}

impl GridLayout {
    /// Primary grid on combined ranks `0..primary`, secondary after it
    pub fn contiguous(primary: usize, secondary: usize) -> Self {
        Self {
            primary: (0..primary).collect(),
            secondary: (primary..primary + secondary).collect(),
        }
    }

    pub fn ranks(&self, grid: GridId) -> &[usize] {
        match grid {
            GridId::Primary => &self.primary,
            GridId::Secondary => &self.secondary,
        }
    }

    pub fn size(&self, grid: GridId) -> usize {
        self.ranks(grid).len()
    }
}

/// Collective and point-to-point primitives of one process
///
/// Every process of a group must issue the same collectives in the same
/// order; all calls block until the peers arrive.
pub trait Communicator: Send + Sync {
    /// Rank within the trainer group
    fn rank(&self) -> usize;
    /// Number of processes in the trainer group
    fn size(&self) -> usize;

    /// The one process per group that emits logs
    fn is_master(&self) -> bool {
        self.rank() == 0
    }

    /// `None` for a single-grid run
    fn grid(&self) -> Option<GridId>;

    /// Grid number, 1 or 2; single-grid runs report 1
    fn grid_number(&self) -> usize {
        self.grid().map(|g| g.number()).unwrap_or(1)
    }

    fn grid_layout(&self) -> Option<&GridLayout>;

    /// Rank within the combined group spanning both grids
    fn combined_rank(&self) -> usize;

    /// In-place element-wise sum across the trainer group
    fn allreduce_sum(&self, buf: &mut [f64]) -> KfacResult<()>;

    /// Sum `send` across the group and return this rank's `counts[rank]` slice
    fn reduce_scatter_sum(&self, send: &[f64], counts: &[usize]) -> KfacResult<Vec<f64>>;

    /// Concatenate every rank's `local` (of length `counts[r]`) in rank order
    fn allgather_v(&self, local: &[f64], counts: &[usize]) -> KfacResult<Vec<f64>>;

    /// Element-wise sum delivered to `root` only
    fn reduce_sum(&self, buf: &mut [f64], root: usize) -> KfacResult<()>;

    /// Overwrite `buf` on every rank with `root`'s contents
    fn broadcast(&self, buf: &mut [f64], root: usize) -> KfacResult<()>;

    fn barrier(&self) -> KfacResult<()>;

    /// Tagged send to a combined-group rank
    fn send(&self, buf: &[f64], dest: usize, tag: usize) -> KfacResult<()>;

    /// Tagged receive from a combined-group rank; `buf.len()` must match
    fn recv(&self, buf: &mut [f64], source: usize, tag: usize) -> KfacResult<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_contiguous_layout() {
        let layout = GridLayout::contiguous(4, 2);
        assert_eq!(layout.ranks(GridId::Primary), &[0, 1, 2, 3]);
        assert_eq!(layout.ranks(GridId::Secondary), &[4, 5]);
        assert_eq!(layout.size(GridId::Secondary), 2);
    }

    #[test]
    fn test_grid_numbers() {
        assert_eq!(GridId::Primary.number(), 1);
        assert_eq!(GridId::Secondary.number(), 2);
        assert_eq!(GridId::Primary.other(), GridId::Secondary);
    }
}
