//! Block registry and inverse-owner assignment
//!
//! Blocks are built once, on the first step that needs them, and live in an
//! arena indexed by position. The assignment table maps each block index to
//! the rank that computes its inverse.

use crate::block::{BatchNormBlock, BlockInfo, BlockKind, BlockVariant, CurvatureBlock, FcConvBlock};
use crate::config::{InverseStrategy, KfacConfig};
use crate::error::KfacError;
use crate::model::{Layer, LayerKind, Model};
use crate::KfacResult;
use serde::{Deserialize, Serialize};

/// Why a layer did not get a block
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SkipReason {
    /// Listed in `disable_layers`
    Disabled,
    /// The first weight has no optimizer attached
    NoOptimizer,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SkippedLayer {
    pub name: String,
    pub layer_index: usize,
    pub reason: SkipReason,
}

/// Round-robin owner assignment
#[derive(Debug, Clone)]
pub struct OwnerAssigner {
    strategy: InverseStrategy,
    num_ranks: usize,
    shared: usize,
    fc_conv: usize,
    batch_norm: usize,
}

impl OwnerAssigner {
    pub fn new(strategy: InverseStrategy, num_ranks: usize) -> Self {
        Self {
            strategy,
            num_ranks: num_ranks.max(1),
            shared: 0,
            fc_conv: 0,
            batch_norm: 0,
        }
    }

    /// Owner of the next block of `kind`
    pub fn next(&mut self, kind: BlockKind) -> usize {
        let counter = match self.strategy {
            InverseStrategy::Root => return 0,
            InverseStrategy::All => &mut self.shared,
            InverseStrategy::Each => match kind {
                BlockKind::FcConv => &mut self.fc_conv,
                BlockKind::BatchNorm => &mut self.batch_norm,
            },
        };
        let rank = *counter % self.num_ranks;
        *counter += 1;
        rank
    }
}

fn candidate_kind(kind: LayerKind) -> Option<BlockKind> {
    match kind {
        LayerKind::FullyConnected { .. } | LayerKind::Convolution { .. } => Some(BlockKind::FcConv),
        LayerKind::BatchNormalization { .. } => Some(BlockKind::BatchNorm),
        LayerKind::Other => None,
    }
}

/// Arena of curvature blocks plus their assignment table
#[derive(Debug, Clone, Default)]
pub struct BlockRegistry {
    blocks: Vec<CurvatureBlock>,
    assignment: Vec<usize>,
    skipped: Vec<SkippedLayer>,
    built: bool,
}

impl BlockRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_built(&self) -> bool {
        self.built
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    pub fn blocks(&self) -> &[CurvatureBlock] {
        &self.blocks
    }

    pub fn blocks_mut(&mut self) -> &mut [CurvatureBlock] {
        &mut self.blocks
    }

    pub fn block(&self, index: usize) -> Option<&CurvatureBlock> {
        self.blocks.get(index)
    }

    /// Owning rank per block index
    pub fn assignment(&self) -> &[usize] {
        &self.assignment
    }

    pub fn skipped(&self) -> &[SkippedLayer] {
        &self.skipped
    }

    pub fn infos(&self) -> Vec<BlockInfo> {
        self.blocks.iter().map(|b| b.info()).collect()
    }

    /// Create one block per eligible layer, once
    ///
    /// Returns `Ok(false)` without touching anything when the registry was
    /// already built. A layer with other than one parent and one child aborts
    /// the build and leaves the registry empty.
    pub fn build_blocks(&mut self, model: &dyn Model, config: &KfacConfig, num_ranks: usize) -> KfacResult<bool> {
        if self.built {
            return Ok(false);
        }

        match Self::collect(model.layers(), config, num_ranks) {
            Ok((blocks, skipped)) => {
                self.assignment = blocks.iter().map(|b| b.owner()).collect();
                self.blocks = blocks;
                self.skipped = skipped;
                self.built = true;
                Ok(true)
            }
            Err(e) => {
                self.blocks.clear();
                self.assignment.clear();
                self.skipped.clear();
                Err(e)
            }
        }
    }

    fn collect(
        layers: &[Box<dyn Layer>],
        config: &KfacConfig,
        num_ranks: usize,
    ) -> KfacResult<(Vec<CurvatureBlock>, Vec<SkippedLayer>)> {
        let mut assigner = OwnerAssigner::new(config.inverse_strategy, num_ranks);
        let mut blocks = Vec::new();
        let mut skipped = Vec::new();

        for (layer_index, layer) in layers.iter().enumerate() {
            let layer = layer.as_ref();
            let Some(kind) = candidate_kind(layer.kind()) else {
                continue;
            };

            if config.is_disabled(layer.name()) {
                skipped.push(SkippedLayer {
                    name: layer.name().to_string(),
                    layer_index,
                    reason: SkipReason::Disabled,
                });
                continue;
            }

            if !layer.has_optimizer(0) {
                skipped.push(SkippedLayer {
                    name: layer.name().to_string(),
                    layer_index,
                    reason: SkipReason::NoOptimizer,
                });
                continue;
            }

            if layer.num_parents() != 1 || layer.num_children() != 1 {
                return Err(KfacError::Topology {
                    layer: layer.name().to_string(),
                    parents: layer.num_parents(),
                    children: layer.num_children(),
                });
            }

            let owner = assigner.next(kind);
            let variant = match kind {
                BlockKind::FcConv => BlockVariant::FcConv(FcConvBlock::new(layer_index, layer)?),
                BlockKind::BatchNorm => BlockVariant::BatchNorm(BatchNormBlock::new(layer_index, layer)?),
            };
            blocks.push(CurvatureBlock::new(variant, owner));
        }
        Ok((blocks, skipped))
    }
}
