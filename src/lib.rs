//! # Distributed K-FAC Preconditioning
//!
//! Kronecker-factored approximate curvature (K-FAC) for data-parallel and
//! hybrid-parallel training. Each fully-connected, convolution, or
//! batch-normalization layer gets a curvature block whose factors are
//! averaged across ranks, inverted on a single owning rank, and used to
//! precondition the layer's gradient before the base optimizer runs.
//!
//! ## Features
//! - Kronecker factors for fully-connected and convolution layers, a joint
//!   scale/bias Fisher block for batch normalization
//! - Log-linear damping warmup and ramped factor update intervals
//! - Round-robin inverse ownership (`all`, `each`, `root`)
//! - Reduce-scatter and allgather over irregular block buffers, with
//!   selectable wire modes
//! - Dual-grid runs: weights mirrored to a secondary grid that does the
//!   curvature work, preconditioned gradients routed back
//!
//! ## Architecture
//!
//! ```text
//! backward pass ─→ local factors ─→ reduce-scatter ─→ average + inverse (owner)
//!                                                            │
//!   optimizer ←─ gradients written back ←─ allgather ←───────┘
//!                         ↑
//!                 cross-grid transfer (dual-grid only)
//! ```

pub mod block;
pub mod comm;
pub mod config;
pub mod dual_grid;
pub mod error;
pub mod exchange;
pub mod fabric;
pub mod kfac;
pub mod linalg;
pub mod model;
pub mod registry;
pub mod schedule;
pub mod workspace;

// Integration tests
#[cfg(test)]
mod tests;

pub use block::{BlockInfo, BlockKind, BlockVariant, CurvatureBlock};
pub use comm::{Communicator, GridId, GridLayout};
pub use config::{AllgatherMode, InverseStrategy, KfacConfig, ReduceScatterMode};
pub use dual_grid::{send_recv_precomputed_gradients, sync_weights_between_grids, CrossGridTransfer};
pub use error::KfacError;
pub use exchange::{allgather_blocks, reduce_scatter_blocks, OwnedBuffer};
pub use fabric::{LocalCommunicator, LocalFabric};
pub use kfac::{Kfac, PhaseTimings, StepReport, TrainingContext};
pub use model::{ConvGeometry, Layer, LayerKind, Model, RecordedLayer, SequentialModel};
pub use registry::BlockRegistry;
pub use schedule::{advance_damping, advance_interval, DampingState, KfacScheduler};
pub use workspace::{DeviceSync, HostSync, Workspace, WorkspaceBuffer};

/// Result type for K-FAC operations
pub type KfacResult<T> = Result<T, KfacError>;

/// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::{
        // Driver
        Kfac,
        KfacConfig,
        TrainingContext,
        StepReport,
        // Model handles
        Layer,
        LayerKind,
        Model,
        RecordedLayer,
        SequentialModel,
        ConvGeometry,
        // Communication
        Communicator,
        GridId,
        LocalFabric,
        // Result type
        KfacResult,
        KfacError,
    };
}
