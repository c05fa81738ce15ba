//! Collective exchange of per-block buffers
//!
//! Each block contributes one or more flat buffers tagged with the rank that
//! owns the block. Buffers are packed into one contiguous region in registry
//! order (or stably sorted by owner, for the modes that need per-rank
//! segments) and moved with the configured collective. Nothing here
//! interprets the values.

use crate::comm::Communicator;
use crate::config::{AllgatherMode, ReduceScatterMode};
use crate::error::KfacError;
use crate::KfacResult;

/// A block buffer and the rank that owns it
pub type OwnedBuffer<'a> = (usize, &'a mut [f64]);

/// Sum of every buffer's length
pub fn total_len(blocks: &[OwnedBuffer<'_>]) -> usize {
    blocks.iter().map(|(_, b)| b.len()).sum()
}

/// Block indices stably sorted by owner
pub fn owner_order(owners: &[usize]) -> Vec<usize> {
    let mut order: Vec<usize> = (0..owners.len()).collect();
    order.sort_by_key(|&i| owners[i]);
    order
}

/// Number of values each rank owns
pub fn counts_per_rank(blocks: &[OwnedBuffer<'_>], num_ranks: usize) -> KfacResult<Vec<usize>> {
    let mut counts = vec![0; num_ranks];
    for (owner, buf) in blocks {
        let slot = counts.get_mut(*owner).ok_or_else(|| {
            KfacError::Communication(format!("block owner {} outside a group of {}", owner, num_ranks))
        })?;
        *slot += buf.len();
    }
    Ok(counts)
}

/// Concatenate the buffers listed in `order` into `out`; returns the length written
pub fn pack_blocks(blocks: &[OwnedBuffer<'_>], order: &[usize], out: &mut [f64]) -> KfacResult<usize> {
    let needed: usize = order.iter().map(|&i| blocks[i].1.len()).sum();
    if out.len() < needed {
        return Err(KfacError::DimensionMismatch {
            expected: needed,
            got: out.len(),
        });
    }
    let mut offset = 0;
    for &i in order {
        let buf = &blocks[i].1;
        out[offset..offset + buf.len()].copy_from_slice(buf);
        offset += buf.len();
    }
    Ok(offset)
}

/// Inverse of [`pack_blocks`]; blocks for which `skip` holds keep their
/// contents but still consume their segment
pub fn unpack_blocks(
    packed: &[f64],
    order: &[usize],
    blocks: &mut [OwnedBuffer<'_>],
    skip: impl Fn(usize) -> bool,
) -> KfacResult<usize> {
    let needed: usize = order.iter().map(|&i| blocks[i].1.len()).sum();
    if packed.len() < needed {
        return Err(KfacError::DimensionMismatch {
            expected: needed,
            got: packed.len(),
        });
    }
    let mut offset = 0;
    for &i in order {
        let (owner, buf) = &mut blocks[i];
        let len = buf.len();
        if !skip(*owner) {
            buf.copy_from_slice(&packed[offset..offset + len]);
        }
        offset += len;
    }
    Ok(offset)
}

/// Whether `mode` needs a packed scratch buffer of the total length
pub fn is_reduce_scatter_buffer_required(mode: ReduceScatterMode) -> bool {
    match mode {
        ReduceScatterMode::AllReduce | ReduceScatterMode::ReduceScatter => true,
        ReduceScatterMode::Reduce => false,
    }
}

/// Whether `mode` needs (send, receive) scratch buffers
pub fn is_allgather_buffer_required(mode: AllgatherMode) -> (bool, bool) {
    match mode {
        AllgatherMode::AllReduce => (false, true),
        AllgatherMode::Allgather => (true, true),
        AllgatherMode::Broadcast => (false, false),
    }
}

fn registry_order(n: usize) -> Vec<usize> {
    (0..n).collect()
}

// ═══════════════════════════════════════════════════════════════════════════
// REDUCE-SCATTER
// ═══════════════════════════════════════════════════════════════════════════

/// Sum every block across the trainer group onto the block's owner
///
/// Only owned blocks are guaranteed to hold the sum afterwards; the contents
/// of other blocks are unspecified.
pub fn reduce_scatter_blocks(
    blocks: &mut [OwnedBuffer<'_>],
    scratch: &mut [f64],
    comm: &dyn Communicator,
    mode: ReduceScatterMode,
) -> KfacResult<()> {
    let rank = comm.rank();
    match mode {
        ReduceScatterMode::AllReduce => {
            let order = registry_order(blocks.len());
            let total = pack_blocks(blocks, &order, scratch)?;
            comm.allreduce_sum(&mut scratch[..total])?;
            unpack_blocks(&scratch[..total], &order, blocks, |owner| owner != rank)?;
        }
        ReduceScatterMode::ReduceScatter => {
            let owners: Vec<usize> = blocks.iter().map(|(o, _)| *o).collect();
            let order = owner_order(&owners);
            let counts = counts_per_rank(blocks, comm.size())?;
            let total = pack_blocks(blocks, &order, scratch)?;
            let mine = comm.reduce_scatter_sum(&scratch[..total], &counts)?;
            let own_order: Vec<usize> = order.into_iter().filter(|&i| owners[i] == rank).collect();
            unpack_blocks(&mine, &own_order, blocks, |_| false)?;
        }
        ReduceScatterMode::Reduce => {
            for (owner, buf) in blocks.iter_mut() {
                comm.reduce_sum(buf, *owner)?;
            }
        }
    }
    Ok(())
}

// ═══════════════════════════════════════════════════════════════════════════
// ALLGATHER
// ═══════════════════════════════════════════════════════════════════════════

/// Distribute every owned block to all ranks of the trainer group
///
/// Returns the number of values left in `recv` in the mode's layout
/// (registry order for `AllReduce`, owner order for `Allgather`, none for
/// `Broadcast`).
pub fn allgather_blocks(
    blocks: &mut [OwnedBuffer<'_>],
    send: &mut [f64],
    recv: &mut [f64],
    comm: &dyn Communicator,
    mode: AllgatherMode,
) -> KfacResult<usize> {
    let rank = comm.rank();
    match mode {
        AllgatherMode::AllReduce => {
            let total = total_len(blocks);
            if recv.len() < total {
                return Err(KfacError::DimensionMismatch {
                    expected: total,
                    got: recv.len(),
                });
            }
            let recv = &mut recv[..total];
            recv.fill(0.0);
            let mut offset = 0;
            for (owner, buf) in blocks.iter() {
                if *owner == rank {
                    recv[offset..offset + buf.len()].copy_from_slice(buf);
                }
                offset += buf.len();
            }
            comm.allreduce_sum(recv)?;
            unpack_blocks(recv, &registry_order(blocks.len()), blocks, |owner| owner == rank)?;
            Ok(total)
        }
        AllgatherMode::Allgather => {
            let owners: Vec<usize> = blocks.iter().map(|(o, _)| *o).collect();
            let order = owner_order(&owners);
            let counts = counts_per_rank(blocks, comm.size())?;
            let own_order: Vec<usize> = order.iter().copied().filter(|&i| owners[i] == rank).collect();
            let local = pack_blocks(blocks, &own_order, send)?;
            let gathered = comm.allgather_v(&send[..local], &counts)?;
            if recv.len() < gathered.len() {
                return Err(KfacError::DimensionMismatch {
                    expected: gathered.len(),
                    got: recv.len(),
                });
            }
            recv[..gathered.len()].copy_from_slice(&gathered);
            unpack_blocks(&gathered, &order, blocks, |owner| owner == rank)?;
            Ok(gathered.len())
        }
        AllgatherMode::Broadcast => {
            for (owner, buf) in blocks.iter_mut() {
                comm.broadcast(buf, *owner)?;
            }
            Ok(0)
        }
    }
}
