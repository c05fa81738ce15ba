//! # K-FAC Step Driver
//!
//! [`Kfac`] is the hook a training loop calls around each step. After every
//! backward pass it:
//!
//! 1. advances the damping and update-interval schedules,
//! 2. builds the block registry on first use,
//! 3. on refresh steps, computes local Kronecker factors, sums them onto
//!    their owners and inverts the running averages there,
//! 4. preconditions the current gradient on each block's owner,
//! 5. distributes the preconditioned gradients to every rank,
//! 6. in a dual-grid run, mirrors weights to the secondary grid and routes
//!    the preconditioned gradients back to the primary grid.
//!
//! Phases run in this order on every rank of a group; every collective is
//! blocking.
//!
//! ## Dual-grid runs
//!
//! The secondary grid does the curvature work. Primary-grid ranks skip the
//! factor, inverse and allgather phases (still marking every block as
//! inverted), send their weights across, and receive the finished gradients.

use crate::block::CurvatureBlock;
use crate::comm::{Communicator, GridId};
use crate::config::KfacConfig;
use crate::error::KfacError;
use crate::exchange::{
    allgather_blocks, is_allgather_buffer_required, is_reduce_scatter_buffer_required,
    reduce_scatter_blocks, total_len, OwnedBuffer,
};
use crate::dual_grid::{send_recv_precomputed_gradients, sync_weights_between_grids};
use crate::linalg::format_matrix;
use crate::model::{Layer, Model};
use crate::registry::BlockRegistry;
use crate::schedule::{DampingState, KfacScheduler};
use crate::workspace::{DeviceSync, Workspace};
use crate::KfacResult;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};

const REDUCE_SCATTER_BUFFER: &str = "kfac_reduce_scatter";
const ALLGATHER_SEND_BUFFER: &str = "kfac_allgather_send";
const ALLGATHER_RECV_BUFFER: &str = "kfac_allgather_recv";

/// Position in the training run
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrainingContext {
    pub step: usize,
    pub epoch: usize,
}

impl TrainingContext {
    pub fn new(step: usize, epoch: usize) -> Self {
        Self { step, epoch }
    }
}

/// Wall-clock time spent in each phase of one step
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct PhaseTimings {
    pub local_factors: Duration,
    pub reduce_scatter: Duration,
    pub inverse: Duration,
    pub allgather: Duration,
    pub dual_grid: Duration,
}

impl PhaseTimings {
    pub fn total(&self) -> Duration {
        self.local_factors + self.reduce_scatter + self.inverse + self.allgather + self.dual_grid
    }
}

/// What one call to [`Kfac::on_backward_prop_end`] did
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct StepReport {
    /// Factors were recomputed and inverted this step
    pub refreshed: bool,
    /// The registry was built during this step
    pub built_blocks: bool,
    pub damping: Option<DampingState>,
    pub update_interval: usize,
    pub timings: PhaseTimings,
}

/// Distributed K-FAC preconditioner for one process
pub struct Kfac<C: Communicator> {
    config: KfacConfig,
    comm: C,
    scheduler: KfacScheduler,
    registry: BlockRegistry,
    workspace: Workspace,
    matrix_info_logged: bool,
}

impl<C: Communicator> Kfac<C> {
    pub fn new(config: KfacConfig, comm: C) -> KfacResult<Self> {
        let rank = comm.combined_rank();
        Self::with_workspace(config, comm, Workspace::new(rank))
    }

    /// Use `device` to synchronize before buffers reach the network
    pub fn with_device(config: KfacConfig, comm: C, device: Box<dyn DeviceSync>) -> KfacResult<Self> {
        let rank = comm.combined_rank();
        Self::with_workspace(config, comm, Workspace::with_device(rank, device))
    }

    fn with_workspace(config: KfacConfig, comm: C, workspace: Workspace) -> KfacResult<Self> {
        config.validate()?;
        Ok(Self {
            scheduler: KfacScheduler::new(&config),
            config,
            comm,
            registry: BlockRegistry::new(),
            workspace,
            matrix_info_logged: false,
        })
    }

    pub fn config(&self) -> &KfacConfig {
        &self.config
    }

    pub fn comm(&self) -> &C {
        &self.comm
    }

    pub fn registry(&self) -> &BlockRegistry {
        &self.registry
    }

    pub fn workspace(&self) -> &Workspace {
        &self.workspace
    }

    pub fn damping(&self) -> DampingState {
        self.scheduler.damping()
    }

    pub fn update_interval(&self) -> usize {
        self.scheduler.update_interval()
    }

    /// Every block has been inverted at least once
    pub fn has_inverse(&self) -> bool {
        self.registry.is_built() && self.registry.blocks().iter().all(|b| b.has_inverse())
    }

    fn is_master(&self) -> bool {
        self.comm.is_master()
    }

    /// Primary-grid ranks of a dual-grid run receive results instead of computing them
    fn skips_curvature(&self) -> bool {
        self.comm.grid_layout().is_some() && self.comm.grid() == Some(GridId::Primary)
    }

    /// Group whose ranks own blocks: the trainer group, or the secondary grid
    fn inverse_group_size(&self) -> usize {
        match self.comm.grid_layout() {
            Some(layout) => layout.size(GridId::Secondary),
            None => self.comm.size(),
        }
    }

    // ═══════════════════════════════════════════════════════════════════════
    // LIFECYCLE HOOKS
    // ═══════════════════════════════════════════════════════════════════════

    /// Log the configuration once at the start of training
    pub fn setup(&mut self, _model: &dyn Model) -> KfacResult<()> {
        if self.is_master() {
            let c = &self.config;
            log::info!(
                "K-FAC callback setup: damping_act={:?} damping_err={:?} damping_bn_act={:?} \
                 damping_bn_err={:?} damping_warmup_steps={} kronecker_decay={} \
                 learning_rate_factor={} use_pi={}",
                c.damping_act,
                c.damping_err,
                c.damping_bn_act,
                c.damping_bn_err,
                c.damping_warmup_steps,
                c.kronecker_decay,
                c.learning_rate_factor,
                c.use_pi
            );
            log::info!(
                "K-FAC callback setup: update_intervals={:?} update_interval_steps={} \
                 inverse_strategy={} reduce_scatter_mode={:?} allgather_mode={:?} \
                 disable_layers={:?} grid={}",
                c.update_intervals,
                c.update_interval_steps,
                c.inverse_strategy,
                c.reduce_scatter_mode,
                c.allgather_mode,
                c.disable_layers,
                self.comm.grid_number()
            );
        }
        Ok(())
    }

    /// Log the current damping and interval
    pub fn on_epoch_end(&self, _model: &dyn Model, ctx: &TrainingContext) {
        if self.is_master() {
            let d = self.scheduler.damping();
            log::info!(
                "K-FAC (epoch {}, step {}): damping_act={:.6e} damping_err={:.6e} \
                 damping_bn_act={:.6e} damping_bn_err={:.6e} update_interval={}",
                ctx.epoch,
                ctx.step,
                d.act,
                d.err,
                d.bn_act,
                d.bn_err,
                self.scheduler.update_interval()
            );
        }
    }

    /// Precondition the gradients of the step that just finished its backward pass
    pub fn on_backward_prop_end(&mut self, model: &mut dyn Model, ctx: &TrainingContext) -> KfacResult<StepReport> {
        self.scheduler.step(ctx.step);
        let mut report = StepReport {
            damping: Some(self.scheduler.damping()),
            update_interval: self.scheduler.update_interval(),
            ..StepReport::default()
        };

        let group_size = self.inverse_group_size();
        if self.registry.build_blocks(model, &self.config, group_size)? {
            report.built_blocks = true;
            self.log_registry();
        }

        // inverse errors are held until the step's collectives have run
        let mut deferred = Ok(());
        if self.skips_curvature() {
            self.registry.blocks_mut().iter_mut().for_each(|b| b.mark_inverse());
        } else {
            let refresh = self.scheduler.is_update_step(ctx.step) || !self.has_inverse();
            if refresh {
                let start = Instant::now();
                self.compute_local_factors(model)?;
                report.timings.local_factors = start.elapsed();

                let start = Instant::now();
                self.reduce_scatter()?;
                report.timings.reduce_scatter = start.elapsed();
            }

            let start = Instant::now();
            deferred = self.update_owned_blocks(model, refresh);
            report.timings.inverse = start.elapsed();
            report.refreshed = refresh;

            if refresh && deferred.is_ok() {
                self.log_matrices();
            }

            let start = Instant::now();
            self.allgather()?;
            report.timings.allgather = start.elapsed();
        }

        if self.comm.grid_layout().is_some() {
            let start = Instant::now();
            sync_weights_between_grids(model, &self.comm)?;
            self.transfer_gradients()?;
            report.timings.dual_grid = start.elapsed();
        }

        if !self.matrix_info_logged {
            self.matrix_info_logged = true;
            for line in self.matrix_allocation_lines() {
                log::debug!("{}", line);
            }
        }

        deferred?;
        self.apply_gradients(model)?;

        if self.config.print_time && self.is_master() {
            let t = &report.timings;
            log::info!(
                "K-FAC timings (step {}): local_factors={:?} reduce_scatter={:?} inverse={:?} \
                 allgather={:?} dual_grid={:?} total={:?}",
                ctx.step,
                t.local_factors,
                t.reduce_scatter,
                t.inverse,
                t.allgather,
                t.dual_grid,
                t.total()
            );
        }
        Ok(report)
    }

    // ═══════════════════════════════════════════════════════════════════════
    // PHASES
    // ═══════════════════════════════════════════════════════════════════════

    fn compute_local_factors(&mut self, model: &dyn Model) -> KfacResult<()> {
        let layers = model.layers();
        let comm: &dyn Communicator = &self.comm;
        let work = |block: &mut CurvatureBlock| -> KfacResult<()> {
            let layer = layer_of(layers, block)?;
            block.compute_local_kronecker_factors(layer, comm)
        };
        let blocks = self.registry.blocks_mut();
        if self.config.parallel_blocks {
            blocks.par_iter_mut().try_for_each(work)
        } else {
            blocks.iter_mut().try_for_each(work)
        }
    }

    fn reduce_scatter(&mut self) -> KfacResult<()> {
        let mode = self.config.reduce_scatter_mode;
        let mut buffers: Vec<OwnedBuffer> = Vec::new();
        for block in self.registry.blocks_mut() {
            let owner = block.owner();
            for buf in block.local_kronecker_buffers() {
                buffers.push((owner, buf));
            }
        }
        let rows = if is_reduce_scatter_buffer_required(mode) {
            total_len(&buffers)
        } else {
            0
        };
        let mut scratch = self.workspace.acquire(REDUCE_SCATTER_BUFFER, rows, 1);
        self.workspace.synchronize();
        let result = reduce_scatter_blocks(&mut buffers, scratch.as_mut_slice(), &self.comm, mode);
        self.workspace.release(REDUCE_SCATTER_BUFFER, scratch);
        result
    }

    /// Average and invert (on refresh) and precondition, for owned blocks only
    fn update_owned_blocks(&mut self, model: &dyn Model, refresh: bool) -> KfacResult<()> {
        let layers = model.layers();
        let rank = self.comm.rank();
        let decay = self.config.kronecker_decay;
        let use_pi = self.config.use_pi;
        let lr = self.config.learning_rate_factor;
        let damping = self.scheduler.damping();

        let work = |block: &mut CurvatureBlock| -> KfacResult<()> {
            if block.owner() == rank {
                let layer = layer_of(layers, block)?;
                if refresh {
                    block.update_kronecker_average(decay)?;
                    block.update_kronecker_inverse(layer, use_pi, &damping, lr)?;
                } else {
                    block.update_preconditioned_gradient(layer, lr)?;
                }
            }
            if refresh {
                block.mark_inverse();
            }
            Ok(())
        };
        let blocks = self.registry.blocks_mut();
        if self.config.parallel_blocks {
            blocks.par_iter_mut().try_for_each(work)
        } else {
            blocks.iter_mut().try_for_each(work)
        }
    }

    fn allgather(&mut self) -> KfacResult<()> {
        let mode = self.config.allgather_mode;
        let dual = self.comm.grid_layout().is_some();
        let mut buffers = grad_buffers(self.registry.blocks_mut());
        let total = total_len(&buffers);
        let (need_send, need_recv) = is_allgather_buffer_required(mode);
        let mut send = self
            .workspace
            .acquire(ALLGATHER_SEND_BUFFER, if need_send { total } else { 0 }, 1);
        // the dual-grid transfer reuses the receive buffer
        let mut recv = self
            .workspace
            .acquire(ALLGATHER_RECV_BUFFER, if need_recv || dual { total } else { 0 }, 1);
        self.workspace.synchronize();
        let result = allgather_blocks(
            &mut buffers,
            send.as_mut_slice(),
            recv.as_mut_slice(),
            &self.comm,
            mode,
        );
        self.workspace.release(ALLGATHER_SEND_BUFFER, send);
        self.workspace.release(ALLGATHER_RECV_BUFFER, recv);
        result.map(|_| ())
    }

    fn transfer_gradients(&mut self) -> KfacResult<()> {
        let mode = self.config.allgather_mode;
        let local_rank = (!self.skips_curvature()).then(|| self.comm.rank());
        let mut buffers = grad_buffers(self.registry.blocks_mut());
        let total = total_len(&buffers);
        let mut buffer = self.workspace.acquire(ALLGATHER_RECV_BUFFER, total, 1);
        self.workspace.synchronize();
        let result = send_recv_precomputed_gradients(
            &mut buffers,
            buffer.as_mut_slice(),
            total,
            &self.comm,
            mode,
            local_rank,
        );
        self.workspace.release(ALLGATHER_RECV_BUFFER, buffer);
        result
    }

    fn apply_gradients(&mut self, model: &mut dyn Model) -> KfacResult<()> {
        let layers = model.layers_mut();
        for block in self.registry.blocks() {
            let layer = layers.get_mut(block.layer_index()).ok_or_else(|| {
                KfacError::invalid_layer(block.name(), "layer index outside the model")
            })?;
            block.apply_preconditioned_gradient(layer.as_mut())?;
        }
        Ok(())
    }

    // ═══════════════════════════════════════════════════════════════════════
    // DIAGNOSTICS
    // ═══════════════════════════════════════════════════════════════════════

    fn log_registry(&self) {
        if !self.is_master() {
            return;
        }
        for skipped in self.registry.skipped() {
            log::info!(
                "K-FAC: skipping layer {} (index {}): {:?}",
                skipped.name,
                skipped.layer_index,
                skipped.reason
            );
        }
        for info in self.registry.infos() {
            log::info!("{}", info);
        }
    }

    /// One line per internal matrix of every block, tagged with this rank
    pub fn matrix_allocation_lines(&self) -> Vec<String> {
        let rank = self.comm.combined_rank();
        let mut lines = Vec::new();
        for block in self.registry.blocks() {
            for (name, rows, cols) in block.internal_matrix_info() {
                lines.push(format!(
                    "K-FAC matrix allocation (rank={}): {} {} ({}x{})",
                    rank,
                    block.name(),
                    name,
                    rows,
                    cols
                ));
            }
        }
        lines
    }

    fn log_matrices(&self) {
        let rank = self.comm.rank();
        let owned = self.registry.blocks().iter().filter(|b| b.owner() == rank);
        if self.config.print_matrix_summary {
            for block in owned.clone() {
                for line in block.matrix_summaries() {
                    log::info!("K-FAC (rank={}): {}", rank, line);
                }
            }
        }
        if self.config.print_matrix {
            for block in owned {
                for (name, m) in block.matrices() {
                    log::info!("K-FAC (rank={}): {}", rank, format_matrix(&name, m));
                }
            }
        }
    }
}

fn layer_of<'a>(layers: &'a [Box<dyn Layer>], block: &CurvatureBlock) -> KfacResult<&'a dyn Layer> {
    layers
        .get(block.layer_index())
        .map(|l| l.as_ref())
        .ok_or_else(|| KfacError::invalid_layer(block.name(), "layer index outside the model"))
}

fn grad_buffers(blocks: &mut [CurvatureBlock]) -> Vec<OwnedBuffer<'_>> {
    let mut buffers = Vec::new();
    for block in blocks {
        let owner = block.owner();
        for buf in block.preconditioned_grad_buffers() {
            buffers.push((owner, buf));
        }
    }
    buffers
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fabric::LocalFabric;
    use crate::model::{RecordedLayer, SequentialModel};
    use candle_core::{Device, Tensor};

    fn recorded_fc() -> SequentialModel {
        let device = Device::Cpu;
        let mut fc = RecordedLayer::fully_connected("fc", 2, 2, true, &device).unwrap();
        fc.record(
            Tensor::new(&[[1.0f32, 0.5], [-0.5, 2.0], [0.0, 1.0]], &device).unwrap(),
            Tensor::new(&[[0.1f32, -0.2], [0.3, 0.1], [-0.1, 0.0]], &device).unwrap(),
            vec![
                Tensor::new(&[[0.2f32, -0.1], [0.4, 0.3]], &device).unwrap(),
                Tensor::new(&[0.05f32, -0.05], &device).unwrap(),
            ],
        )
        .unwrap();
        let mut model = SequentialModel::new();
        model.push(fc);
        model
    }

    #[test]
    fn test_invalid_config_is_rejected() {
        let config = KfacConfig {
            damping_act: vec![1.0, 2.0, 3.0],
            ..KfacConfig::default()
        };
        let comm = LocalFabric::single(1).remove(0);
        assert!(Kfac::new(config, comm).is_err());
    }

    #[test]
    fn test_first_step_builds_and_refreshes() {
        let comm = LocalFabric::single(1).remove(0);
        let config = KfacConfig {
            update_intervals: vec![4],
            parallel_blocks: false,
            ..KfacConfig::default()
        };
        let mut kfac = Kfac::new(config, comm).unwrap();
        let mut model = recorded_fc();
        kfac.setup(&model).unwrap();

        // step 1 is not a multiple of 4, but nothing has been inverted yet
        let report = kfac.on_backward_prop_end(&mut model, &TrainingContext::new(1, 0)).unwrap();
        assert!(report.built_blocks);
        assert!(report.refreshed);
        assert!(kfac.has_inverse());

        let report = kfac.on_backward_prop_end(&mut model, &TrainingContext::new(2, 0)).unwrap();
        assert!(!report.built_blocks);
        assert!(!report.refreshed);
        let report = kfac.on_backward_prop_end(&mut model, &TrainingContext::new(4, 0)).unwrap();
        assert!(report.refreshed);
        kfac.on_epoch_end(&model, &TrainingContext::new(4, 1));
    }

    #[test]
    fn test_gradient_is_replaced() {
        let comm = LocalFabric::single(1).remove(0);
        let mut kfac = Kfac::new(KfacConfig::default(), comm).unwrap();
        let mut model = recorded_fc();
        let before = crate::linalg::tensor_to_vec(model.layers()[0].weight_gradient(0).unwrap()).unwrap();
        kfac.on_backward_prop_end(&mut model, &TrainingContext::default()).unwrap();
        let after = crate::linalg::tensor_to_vec(model.layers()[0].weight_gradient(0).unwrap()).unwrap();
        assert_eq!(after.len(), before.len());
        assert_ne!(after, before);
        assert!(kfac.workspace().contains("kfac_allgather_recv"));
    }
}
