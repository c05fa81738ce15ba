//! Transfers between the two grids of a hybrid-parallel run
//!
//! Both directions go through [`CrossGridTransfer`]: destination rank `d`
//! receives from source rank `d mod |source|`, so a source rank sends to
//! `s, s + |source|, s + 2|source|, ...` below `|destination|`. Every
//! message is tagged with the destination's combined-group rank.

use crate::comm::{Communicator, GridId, GridLayout};
use crate::config::AllgatherMode;
use crate::error::KfacError;
use crate::exchange::{owner_order, pack_blocks, unpack_blocks, OwnedBuffer};
use crate::linalg::{tensor_to_vec, vec_to_tensor_like};
use crate::model::Model;
use crate::KfacResult;

/// Rank mapping and transport from one grid to the other
#[derive(Debug, Clone)]
pub struct CrossGridTransfer {
    source: GridId,
    destination: GridId,
    layout: GridLayout,
}

impl CrossGridTransfer {
    pub fn new(source: GridId, destination: GridId, layout: &GridLayout) -> KfacResult<Self> {
        if source == destination {
            return Err(KfacError::Communication(format!(
                "cross-grid transfer from grid {} to itself",
                source.number()
            )));
        }
        if layout.size(source) == 0 || layout.size(destination) == 0 {
            return Err(KfacError::Communication(format!(
                "empty grid in layout (primary={}, secondary={})",
                layout.primary.len(),
                layout.secondary.len()
            )));
        }
        Ok(Self {
            source,
            destination,
            layout: layout.clone(),
        })
    }

    /// Weight mirroring direction
    pub fn weights(layout: &GridLayout) -> KfacResult<Self> {
        Self::new(GridId::Primary, GridId::Secondary, layout)
    }

    /// Preconditioned-gradient direction
    pub fn gradients(layout: &GridLayout) -> KfacResult<Self> {
        Self::new(GridId::Secondary, GridId::Primary, layout)
    }

    pub fn source(&self) -> GridId {
        self.source
    }

    pub fn destination(&self) -> GridId {
        self.destination
    }

    /// Source grid-local rank feeding destination rank `dest`
    pub fn source_of(&self, dest: usize) -> usize {
        dest % self.layout.size(self.source)
    }

    /// Destination grid-local ranks fed by source rank `src`
    pub fn destinations_of(&self, src: usize) -> Vec<usize> {
        let step = self.layout.size(self.source);
        (src..self.layout.size(self.destination)).step_by(step).collect()
    }

    /// Send `payload` to every mapped destination; returns the message count
    pub fn send(&self, payload: &[f64], comm: &dyn Communicator) -> KfacResult<usize> {
        let dests = self.destinations_of(comm.rank());
        for &dest in &dests {
            let combined = self.layout.ranks(self.destination)[dest];
            comm.send(payload, combined, combined)?;
        }
        Ok(dests.len())
    }

    /// Receive into `payload` from the mapped source
    pub fn recv(&self, payload: &mut [f64], comm: &dyn Communicator) -> KfacResult<()> {
        let src = self.source_of(comm.rank());
        let combined_src = self.layout.ranks(self.source)[src];
        comm.recv(payload, combined_src, comm.combined_rank())
    }

    /// Send from the source grid or receive on the destination grid
    ///
    /// Returns `true` when `payload` was overwritten by a receive.
    pub fn transfer(&self, payload: &mut [f64], comm: &dyn Communicator) -> KfacResult<bool> {
        match comm.grid() {
            Some(grid) if grid == self.source => {
                self.send(payload, comm)?;
                Ok(false)
            }
            Some(grid) if grid == self.destination => {
                self.recv(payload, comm)?;
                Ok(true)
            }
            _ => Err(KfacError::Communication(
                "cross-grid transfer outside a dual-grid run".to_string(),
            )),
        }
    }
}

/// Mirror every weight tensor from the primary grid to the secondary grid
///
/// Weights are flattened layer by layer, in weight order, into one buffer.
/// A no-op for single-grid runs.
pub fn sync_weights_between_grids(model: &mut dyn Model, comm: &dyn Communicator) -> KfacResult<()> {
    let Some(layout) = comm.grid_layout() else {
        return Ok(());
    };
    let transfer = CrossGridTransfer::weights(layout)?;

    let mut sizes = Vec::new();
    for layer in model.layers() {
        for idx in 0..layer.num_weights() {
            sizes.push(layer.weights(idx).map(|w| w.elem_count()).unwrap_or(0));
        }
    }
    let total: usize = sizes.iter().sum();
    let mut buffer = Vec::with_capacity(total);

    if comm.grid() == Some(transfer.source()) {
        for layer in model.layers() {
            for idx in 0..layer.num_weights() {
                if let Some(w) = layer.weights(idx) {
                    buffer.extend(tensor_to_vec(w)?);
                }
            }
        }
        transfer.send(&buffer, comm)?;
        return Ok(());
    }

    buffer.resize(total, 0.0);
    transfer.recv(&mut buffer, comm)?;
    let mut offset = 0;
    for layer in model.layers_mut() {
        for idx in 0..layer.num_weights() {
            let Some(current) = layer.weights(idx) else {
                continue;
            };
            let len = current.elem_count();
            let values = buffer[offset..offset + len].to_vec();
            let tensor = vec_to_tensor_like(values, current)?;
            layer.set_weights(idx, tensor)?;
            offset += len;
        }
    }
    Ok(())
}

/// Route preconditioned gradients from the secondary grid to the primary grid
///
/// The payload layout matches the allgather buffer of `mode`: owner-sorted
/// for [`AllgatherMode::Allgather`], registry order otherwise. Receivers that
/// computed blocks themselves pass `local_rank` so those blocks are kept.
pub fn send_recv_precomputed_gradients(
    blocks: &mut [OwnedBuffer<'_>],
    buffer: &mut [f64],
    size: usize,
    comm: &dyn Communicator,
    mode: AllgatherMode,
    local_rank: Option<usize>,
) -> KfacResult<()> {
    let Some(layout) = comm.grid_layout() else {
        return Ok(());
    };
    let transfer = CrossGridTransfer::gradients(layout)?;
    if buffer.len() < size {
        return Err(KfacError::DimensionMismatch {
            expected: size,
            got: buffer.len(),
        });
    }
    let payload = &mut buffer[..size];

    let order = if mode == AllgatherMode::Allgather {
        let owners: Vec<usize> = blocks.iter().map(|(o, _)| *o).collect();
        owner_order(&owners)
    } else {
        (0..blocks.len()).collect()
    };

    if comm.grid() == Some(transfer.source()) {
        // Broadcast leaves no gathered buffer behind, so always repack
        pack_blocks(blocks, &order, payload)?;
        transfer.send(payload, comm)?;
    } else {
        transfer.recv(payload, comm)?;
        unpack_blocks(payload, &order, blocks, |owner| Some(owner) == local_rank)?;
    }
    Ok(())
}
