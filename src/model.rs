//! Layer and model handles consumed by the preconditioner
//!
//! K-FAC never runs a forward or backward pass itself. It reads the tensors a
//! training framework captured for each layer (input activations, output error
//! signals, weight gradients), and writes preconditioned gradients and mirrored
//! weights back. Layers are classified once into a closed [`LayerKind`].

use crate::error::KfacError;
use crate::KfacResult;
use candle_core::{DType, Device, Tensor};
use serde::{Deserialize, Serialize};

/// Spatial configuration of a 2D convolution
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ConvGeometry {
    pub in_channels: usize,
    pub out_channels: usize,
    /// Input height
    pub height: usize,
    /// Input width
    pub width: usize,
    pub kernel_h: usize,
    pub kernel_w: usize,
    pub stride_h: usize,
    pub stride_w: usize,
    pub pad_h: usize,
    pub pad_w: usize,
}

impl ConvGeometry {
    /// Square kernel, unit stride, "same" padding for odd kernels
    pub fn same(in_channels: usize, out_channels: usize, height: usize, width: usize, kernel: usize) -> Self {
        Self {
            in_channels,
            out_channels,
            height,
            width,
            kernel_h: kernel,
            kernel_w: kernel,
            stride_h: 1,
            stride_w: 1,
            pad_h: kernel / 2,
            pad_w: kernel / 2,
        }
    }

    /// Output spatial size `(H_out, W_out)`
    pub fn output_hw(&self) -> (usize, usize) {
        let out = |size: usize, kernel: usize, stride: usize, pad: usize| {
            let padded = size + 2 * pad;
            if padded < kernel || stride == 0 {
                0
            } else {
                (padded - kernel) / stride + 1
            }
        };
        (
            out(self.height, self.kernel_h, self.stride_h, self.pad_h),
            out(self.width, self.kernel_w, self.stride_w, self.pad_w),
        )
    }

    /// Length of one unfolded input patch
    pub fn patch_size(&self) -> usize {
        self.in_channels * self.kernel_h * self.kernel_w
    }
}

/// Closed set of layer kinds the preconditioner distinguishes
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum LayerKind {
    /// Weight `(outputs, inputs)`, optional bias `(outputs)`
    FullyConnected {
        inputs: usize,
        outputs: usize,
        bias: bool,
    },
    /// Weight `(C_out, C_in, kh, kw)`, optional bias `(C_out)`
    Convolution { geometry: ConvGeometry, bias: bool },
    /// Scale `(C)` and bias `(C)`
    BatchNormalization { channels: usize },
    /// Anything else (activations, pooling, losses, ...)
    Other,
}

impl LayerKind {
    pub fn name(&self) -> &'static str {
        match self {
            LayerKind::FullyConnected { .. } => "fully_connected",
            LayerKind::Convolution { .. } => "convolution",
            LayerKind::BatchNormalization { .. } => "batch_normalization",
            LayerKind::Other => "other",
        }
    }
}

/// A layer as seen by K-FAC
///
/// `activations` are the layer's inputs from the most recent forward pass
/// (`(batch, ...)`; for batch normalization, the normalized inputs).
/// `error_signals` are the loss gradients w.r.t. the layer's outputs.
pub trait Layer: Send + Sync {
    fn name(&self) -> &str;
    fn kind(&self) -> LayerKind;
    fn num_parents(&self) -> usize;
    fn num_children(&self) -> usize;
    fn num_weights(&self) -> usize;
    fn weights(&self, idx: usize) -> Option<&Tensor>;
    fn set_weights(&mut self, idx: usize, values: Tensor) -> KfacResult<()>;
    /// Whether an optimizer updates weight `idx`
    fn has_optimizer(&self, idx: usize) -> bool;
    fn activations(&self) -> Option<&Tensor>;
    fn error_signals(&self) -> Option<&Tensor>;
    fn weight_gradient(&self, idx: usize) -> Option<&Tensor>;
    fn set_weight_gradient(&mut self, idx: usize, gradient: Tensor) -> KfacResult<()>;
}

/// An ordered list of layers
pub trait Model: Send + Sync {
    fn layers(&self) -> &[Box<dyn Layer>];
    fn layers_mut(&mut self) -> &mut [Box<dyn Layer>];
}

// ═══════════════════════════════════════════════════════════════════════════
// RECORDED LAYERS
// ═══════════════════════════════════════════════════════════════════════════

/// Layer whose tensors were captured from an external training step
#[derive(Debug, Clone)]
pub struct RecordedLayer {
    name: String,
    kind: LayerKind,
    parents: usize,
    children: usize,
    weights: Vec<Tensor>,
    gradients: Vec<Option<Tensor>>,
    optimized: Vec<bool>,
    activations: Option<Tensor>,
    errors: Option<Tensor>,
}

impl RecordedLayer {
    fn with_weights(name: &str, kind: LayerKind, weights: Vec<Tensor>) -> Self {
        let n = weights.len();
        Self {
            name: name.to_string(),
            kind,
            parents: 1,
            children: 1,
            weights,
            gradients: vec![None; n],
            optimized: vec![true; n],
            activations: None,
            errors: None,
        }
    }

    /// Dense layer with zero-initialized weights
    pub fn fully_connected(name: &str, inputs: usize, outputs: usize, bias: bool, device: &Device) -> KfacResult<Self> {
        let mut weights = vec![Tensor::zeros((outputs, inputs), DType::F32, device)?];
        if bias {
            weights.push(Tensor::zeros(outputs, DType::F32, device)?);
        }
        Ok(Self::with_weights(
            name,
            LayerKind::FullyConnected { inputs, outputs, bias },
            weights,
        ))
    }

    /// 2D convolution with zero-initialized weights
    pub fn convolution(name: &str, geometry: ConvGeometry, bias: bool, device: &Device) -> KfacResult<Self> {
        let shape = (
            geometry.out_channels,
            geometry.in_channels,
            geometry.kernel_h,
            geometry.kernel_w,
        );
        let mut weights = vec![Tensor::zeros(shape, DType::F32, device)?];
        if bias {
            weights.push(Tensor::zeros(geometry.out_channels, DType::F32, device)?);
        }
        Ok(Self::with_weights(
            name,
            LayerKind::Convolution { geometry, bias },
            weights,
        ))
    }

    /// Batch normalization with unit scale and zero bias
    pub fn batch_norm(name: &str, channels: usize, device: &Device) -> KfacResult<Self> {
        let weights = vec![
            Tensor::ones(channels, DType::F32, device)?,
            Tensor::zeros(channels, DType::F32, device)?,
        ];
        Ok(Self::with_weights(
            name,
            LayerKind::BatchNormalization { channels },
            weights,
        ))
    }

    /// Parameter-free layer (activation, pooling, ...)
    pub fn passthrough(name: &str) -> Self {
        Self::with_weights(name, LayerKind::Other, Vec::new())
    }

    pub fn with_topology(mut self, parents: usize, children: usize) -> Self {
        self.parents = parents;
        self.children = children;
        self
    }

    /// Detach the optimizer from every weight
    pub fn without_optimizer(mut self) -> Self {
        self.optimized.iter_mut().for_each(|o| *o = false);
        self
    }

    /// Replace every weight tensor, checking shapes
    pub fn with_weight_values(mut self, values: Vec<Tensor>) -> KfacResult<Self> {
        for (idx, value) in values.into_iter().enumerate() {
            self.set_weights(idx, value)?;
        }
        Ok(self)
    }

    /// Store the tensors captured by one forward/backward pass
    pub fn record(&mut self, activations: Tensor, errors: Tensor, gradients: Vec<Tensor>) -> KfacResult<()> {
        if gradients.len() != self.weights.len() {
            return Err(KfacError::DimensionMismatch {
                expected: self.weights.len(),
                got: gradients.len(),
            });
        }
        for (idx, gradient) in gradients.into_iter().enumerate() {
            self.set_weight_gradient(idx, gradient)?;
        }
        self.activations = Some(activations);
        self.errors = Some(errors);
        Ok(())
    }

    fn check_shape(&self, idx: usize, values: &Tensor) -> KfacResult<()> {
        let current = self
            .weights
            .get(idx)
            .ok_or_else(|| KfacError::invalid_layer(&self.name, format!("no weight #{}", idx)))?;
        if current.dims() != values.dims() {
            return Err(KfacError::invalid_layer(
                &self.name,
                format!(
                    "weight #{} has shape {:?}, got {:?}",
                    idx,
                    current.dims(),
                    values.dims()
                ),
            ));
        }
        Ok(())
    }
}

impl Layer for RecordedLayer {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> LayerKind {
        self.kind
    }

    fn num_parents(&self) -> usize {
        self.parents
    }

    fn num_children(&self) -> usize {
        self.children
    }

    fn num_weights(&self) -> usize {
        self.weights.len()
    }

    fn weights(&self, idx: usize) -> Option<&Tensor> {
        self.weights.get(idx)
    }

    fn set_weights(&mut self, idx: usize, values: Tensor) -> KfacResult<()> {
        self.check_shape(idx, &values)?;
        self.weights[idx] = values;
        Ok(())
    }

    fn has_optimizer(&self, idx: usize) -> bool {
        self.optimized.get(idx).copied().unwrap_or(false)
    }

    fn activations(&self) -> Option<&Tensor> {
        self.activations.as_ref()
    }

    fn error_signals(&self) -> Option<&Tensor> {
        self.errors.as_ref()
    }

    fn weight_gradient(&self, idx: usize) -> Option<&Tensor> {
        self.gradients.get(idx).and_then(|g| g.as_ref())
    }

    fn set_weight_gradient(&mut self, idx: usize, gradient: Tensor) -> KfacResult<()> {
        self.check_shape(idx, &gradient)?;
        self.gradients[idx] = Some(gradient);
        Ok(())
    }
}

/// Layers in execution order
#[derive(Default)]
pub struct SequentialModel {
    layers: Vec<Box<dyn Layer>>,
}

impl SequentialModel {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, layer: impl Layer + 'static) -> &mut Self {
        self.layers.push(Box::new(layer));
        self
    }

    pub fn len(&self) -> usize {
        self.layers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.layers.is_empty()
    }

    pub fn layer_by_name(&self, name: &str) -> Option<&dyn Layer> {
        self.layers.iter().find(|l| l.name() == name).map(|l| l.as_ref())
    }
}

impl Model for SequentialModel {
    fn layers(&self) -> &[Box<dyn Layer>] {
        &self.layers
    }

    fn layers_mut(&mut self) -> &mut [Box<dyn Layer>] {
        &mut self.layers
    }
}
