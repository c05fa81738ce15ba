//! # Curvature Blocks
//!
//! One block per preconditioned layer. A block owns the layer's Kronecker
//! factors, their running averages, the damped inverses, and the
//! preconditioned gradient, and exposes flat buffers for the collective
//! exchange. Blocks refer to their layer by index into the model.

pub mod batch_norm;
pub mod fc_conv;

pub use batch_norm::BatchNormBlock;
pub use fc_conv::FcConvBlock;

use crate::comm::Communicator;
use crate::model::Layer;
use crate::schedule::DampingState;
use crate::KfacResult;
use ndarray::Array2;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Block family; each family has its own round-robin counter
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BlockKind {
    FcConv,
    BatchNorm,
}

impl BlockKind {
    pub fn name(&self) -> &'static str {
        match self {
            BlockKind::FcConv => "fc/conv",
            BlockKind::BatchNorm => "batch-norm",
        }
    }
}

/// One-line description of a block for setup logs
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BlockInfo {
    pub name: String,
    pub layer_index: usize,
    pub kind: BlockKind,
    pub owner: usize,
    /// Factor dimensions (`[A, G]` or `[2C]`)
    pub factor_dims: Vec<usize>,
}

impl fmt::Display for BlockInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "K-FAC block: name={}, layer={}, type={}, inverse_proc_rank={}, factors={:?}",
            self.name,
            self.layer_index,
            self.kind.name(),
            self.owner,
            self.factor_dims
        )
    }
}

/// A curvature block of either family
#[derive(Debug, Clone)]
pub struct CurvatureBlock {
    owner: usize,
    has_inverse: bool,
    inner: BlockVariant,
}

#[derive(Debug, Clone)]
pub enum BlockVariant {
    FcConv(FcConvBlock),
    BatchNorm(BatchNormBlock),
}

impl CurvatureBlock {
    pub fn new(inner: BlockVariant, owner: usize) -> Self {
        Self {
            owner,
            has_inverse: false,
            inner,
        }
    }

    pub fn variant(&self) -> &BlockVariant {
        &self.inner
    }

    pub fn kind(&self) -> BlockKind {
        match &self.inner {
            BlockVariant::FcConv(_) => BlockKind::FcConv,
            BlockVariant::BatchNorm(_) => BlockKind::BatchNorm,
        }
    }

    pub fn name(&self) -> &str {
        match &self.inner {
            BlockVariant::FcConv(b) => b.name(),
            BlockVariant::BatchNorm(b) => b.name(),
        }
    }

    pub fn layer_index(&self) -> usize {
        match &self.inner {
            BlockVariant::FcConv(b) => b.layer_index(),
            BlockVariant::BatchNorm(b) => b.layer_index(),
        }
    }

    /// Rank that inverts this block
    pub fn owner(&self) -> usize {
        self.owner
    }

    pub fn has_inverse(&self) -> bool {
        self.has_inverse
    }

    pub fn mark_inverse(&mut self) {
        self.has_inverse = true;
    }

    pub fn compute_local_kronecker_factors(&mut self, layer: &dyn Layer, comm: &dyn Communicator) -> KfacResult<()> {
        match &mut self.inner {
            BlockVariant::FcConv(b) => b.compute_local_kronecker_factors(layer, comm),
            BlockVariant::BatchNorm(b) => b.compute_local_kronecker_factors(layer, comm),
        }
    }

    pub fn update_kronecker_average(&mut self, decay: f64) -> KfacResult<()> {
        match &mut self.inner {
            BlockVariant::FcConv(b) => b.update_kronecker_average(decay),
            BlockVariant::BatchNorm(b) => b.update_kronecker_average(decay),
        }
    }

    /// Damped inversion; batch-norm blocks take the `bn_*` damping values
    pub fn update_kronecker_inverse(
        &mut self,
        layer: &dyn Layer,
        use_pi: bool,
        damping: &DampingState,
        learning_rate_factor: f64,
    ) -> KfacResult<()> {
        match &mut self.inner {
            BlockVariant::FcConv(b) => {
                b.update_kronecker_inverse(layer, use_pi, damping.act, damping.err, learning_rate_factor)
            }
            BlockVariant::BatchNorm(b) => {
                b.update_kronecker_inverse(layer, damping.bn_act, damping.bn_err, learning_rate_factor)
            }
        }
    }

    /// Re-precondition the layer's current gradient without refreshing inverses
    pub fn update_preconditioned_gradient(&mut self, layer: &dyn Layer, learning_rate_factor: f64) -> KfacResult<()> {
        match &mut self.inner {
            BlockVariant::FcConv(b) => b.update_preconditioned_gradient(layer, learning_rate_factor),
            BlockVariant::BatchNorm(b) => b.update_preconditioned_gradient(layer, learning_rate_factor),
        }
    }

    /// Packed local factors, in a fixed order
    pub fn local_kronecker_buffers(&mut self) -> Vec<&mut [f64]> {
        match &mut self.inner {
            BlockVariant::FcConv(b) => b.local_kronecker_buffers(),
            BlockVariant::BatchNorm(b) => b.local_kronecker_buffers(),
        }
    }

    pub fn preconditioned_grad_buffers(&mut self) -> Vec<&mut [f64]> {
        match &mut self.inner {
            BlockVariant::FcConv(b) => b.preconditioned_grad_buffers(),
            BlockVariant::BatchNorm(b) => b.preconditioned_grad_buffers(),
        }
    }

    pub fn preconditioned_gradient(&self) -> &[f64] {
        match &self.inner {
            BlockVariant::FcConv(b) => b.preconditioned_gradient(),
            BlockVariant::BatchNorm(b) => b.preconditioned_gradient(),
        }
    }

    pub fn apply_preconditioned_gradient(&self, layer: &mut dyn Layer) -> KfacResult<()> {
        match &self.inner {
            BlockVariant::FcConv(b) => b.apply_preconditioned_gradient(layer),
            BlockVariant::BatchNorm(b) => b.apply_preconditioned_gradient(layer),
        }
    }

    /// `(name, rows, cols)` of every internal matrix
    pub fn internal_matrix_info(&self) -> Vec<(String, usize, usize)> {
        match &self.inner {
            BlockVariant::FcConv(b) => b.internal_matrix_info(),
            BlockVariant::BatchNorm(b) => b.internal_matrix_info(),
        }
    }

    pub fn matrix_summaries(&self) -> Vec<String> {
        match &self.inner {
            BlockVariant::FcConv(b) => b.matrix_summaries(),
            BlockVariant::BatchNorm(b) => b.matrix_summaries(),
        }
    }

    pub fn matrices(&self) -> Vec<(String, &Array2<f64>)> {
        match &self.inner {
            BlockVariant::FcConv(b) => b.matrices(),
            BlockVariant::BatchNorm(b) => b.matrices(),
        }
    }

    pub fn info(&self) -> BlockInfo {
        let factor_dims = match &self.inner {
            BlockVariant::FcConv(b) => vec![b.a_dim(), b.g_dim()],
            BlockVariant::BatchNorm(b) => vec![2 * b.channels()],
        };
        BlockInfo {
            name: self.name().to_string(),
            layer_index: self.layer_index(),
            kind: self.kind(),
            owner: self.owner,
            factor_dims,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::RecordedLayer;
    use candle_core::Device;

    #[test]
    fn test_info_line() {
        let layer = RecordedLayer::fully_connected("fc1", 3, 2, true, &Device::Cpu).unwrap();
        let block = CurvatureBlock::new(BlockVariant::FcConv(FcConvBlock::new(4, &layer).unwrap()), 1);
        let info = block.info();
        assert_eq!(info.factor_dims, vec![4, 2]);
        assert_eq!(info.kind, BlockKind::FcConv);
        assert_eq!(
            info.to_string(),
            "K-FAC block: name=fc1, layer=4, type=fc/conv, inverse_proc_rank=1, factors=[4, 2]"
        );
        assert!(!block.has_inverse());
    }

    #[test]
    fn test_buffer_counts_per_family() {
        let device = Device::Cpu;
        let fc = RecordedLayer::fully_connected("fc", 2, 2, false, &device).unwrap();
        let bn = RecordedLayer::batch_norm("bn", 3, &device).unwrap();
        let mut fc = CurvatureBlock::new(BlockVariant::FcConv(FcConvBlock::new(0, &fc).unwrap()), 0);
        let mut bn = CurvatureBlock::new(BlockVariant::BatchNorm(BatchNormBlock::new(1, &bn).unwrap()), 0);

        let fc_lens: Vec<usize> = fc.local_kronecker_buffers().iter().map(|b| b.len()).collect();
        let bn_lens: Vec<usize> = bn.local_kronecker_buffers().iter().map(|b| b.len()).collect();
        assert_eq!(fc_lens, vec![3, 3]);
        assert_eq!(bn_lens, vec![21]);
        assert_eq!(bn.preconditioned_grad_buffers()[0].len(), 6);
        assert_eq!(bn.internal_matrix_info().len(), 4);
    }
}
