//! Kronecker-factored block for fully-connected and convolution layers
//!
//! The layer's Fisher block is approximated by `A ⊗ G`, where `A` is the
//! covariance of the layer inputs (im2col patches for convolutions) and `G`
//! the covariance of the output error signals.

use crate::comm::Communicator;
use crate::error::KfacError;
use crate::linalg::{
    channels_last, compute_pi, damped_inverse, damped_inverse_sqrt, im2col, kronecker_factor, lower_tri_len,
    matrix_summary, pack_lower_tri, tensor_to_vec, unpack_lower_tri, update_moving_average,
    vec_to_tensor_like,
};
use crate::model::{ConvGeometry, Layer, LayerKind};
use crate::KfacResult;
use ndarray::{Array2, ArrayView2};

/// Spatial layout of the source layer
#[derive(Debug, Clone, Copy, PartialEq)]
enum Shape {
    Dense { inputs: usize, outputs: usize },
    Conv(ConvGeometry),
}

/// Curvature block of a fully-connected or convolution layer
#[derive(Debug, Clone)]
pub struct FcConvBlock {
    layer_index: usize,
    name: String,
    shape: Shape,
    has_bias: bool,
    /// Packed lower triangle of the fresh `A`, exchanged between ranks
    factor_a: Vec<f64>,
    factor_g: Vec<f64>,
    average_a: Array2<f64>,
    average_g: Array2<f64>,
    averaged: bool,
    inverse_a: Array2<f64>,
    inverse_g: Array2<f64>,
    /// `(A + λπI)^(-1/2)` and `(G + λ/π I)^(-1/2)`, kept only under the pi correction
    root_a: Array2<f64>,
    root_g: Array2<f64>,
    pi: f64,
    /// Row-major `(outputs, a_dim)` preconditioned gradient
    grad: Vec<f64>,
}

impl FcConvBlock {
    /// Create a block for `layer`, checking its weight tensors
    pub fn new(layer_index: usize, layer: &dyn Layer) -> KfacResult<Self> {
        let (shape, has_bias) = match layer.kind() {
            LayerKind::FullyConnected { inputs, outputs, bias } => {
                (Shape::Dense { inputs, outputs }, bias)
            }
            LayerKind::Convolution { geometry, bias } => (Shape::Conv(geometry), bias),
            other => {
                return Err(KfacError::invalid_layer(
                    layer.name(),
                    format!("{} layers have no Kronecker-factored block", other.name()),
                ))
            }
        };

        let (weight_len, outputs) = match shape {
            Shape::Dense { inputs, outputs } => (inputs * outputs, outputs),
            Shape::Conv(g) => (g.out_channels * g.patch_size(), g.out_channels),
        };
        let weight = layer
            .weights(0)
            .ok_or_else(|| KfacError::invalid_layer(layer.name(), "missing weight tensor"))?;
        if weight.elem_count() != weight_len {
            return Err(KfacError::invalid_layer(
                layer.name(),
                format!("weight has {} elements, expected {}", weight.elem_count(), weight_len),
            ));
        }
        if has_bias {
            let bias = layer
                .weights(1)
                .ok_or_else(|| KfacError::invalid_layer(layer.name(), "missing bias tensor"))?;
            if bias.elem_count() != outputs {
                return Err(KfacError::invalid_layer(
                    layer.name(),
                    format!("bias has {} elements, expected {}", bias.elem_count(), outputs),
                ));
            }
        }

        let mut block = Self {
            layer_index,
            name: layer.name().to_string(),
            shape,
            has_bias,
            factor_a: Vec::new(),
            factor_g: Vec::new(),
            average_a: Array2::zeros((0, 0)),
            average_g: Array2::zeros((0, 0)),
            averaged: false,
            inverse_a: Array2::zeros((0, 0)),
            inverse_g: Array2::zeros((0, 0)),
            root_a: Array2::zeros((0, 0)),
            root_g: Array2::zeros((0, 0)),
            pi: 1.0,
            grad: Vec::new(),
        };
        let (a, g) = (block.a_dim(), block.g_dim());
        block.factor_a = vec![0.0; lower_tri_len(a)];
        block.factor_g = vec![0.0; lower_tri_len(g)];
        block.average_a = Array2::zeros((a, a));
        block.average_g = Array2::zeros((g, g));
        block.grad = vec![0.0; g * a];
        Ok(block)
    }

    pub fn layer_index(&self) -> usize {
        self.layer_index
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_conv(&self) -> bool {
        matches!(self.shape, Shape::Conv(_))
    }

    /// Dimension of the activation factor, including the bias column
    pub fn a_dim(&self) -> usize {
        let inputs = match self.shape {
            Shape::Dense { inputs, .. } => inputs,
            Shape::Conv(g) => g.patch_size(),
        };
        inputs + usize::from(self.has_bias)
    }

    /// Dimension of the error factor
    pub fn g_dim(&self) -> usize {
        match self.shape {
            Shape::Dense { outputs, .. } => outputs,
            Shape::Conv(g) => g.out_channels,
        }
    }

    /// Last computed trace-ratio correction
    pub fn pi(&self) -> f64 {
        self.pi
    }

    /// Unfolded activations and error signals, one row per sample (per spatial
    /// position for convolutions), plus the number of positions per sample
    fn samples(&self, layer: &dyn Layer) -> KfacResult<(Array2<f64>, Array2<f64>, usize, usize)> {
        let acts = layer
            .activations()
            .ok_or_else(|| KfacError::invalid_layer(&self.name, "no activations recorded"))?;
        let errs = layer
            .error_signals()
            .ok_or_else(|| KfacError::invalid_layer(&self.name, "no error signals recorded"))?;
        let batch = acts.dims().first().copied().unwrap_or(0);
        if batch == 0 {
            return Err(KfacError::invalid_layer(&self.name, "empty mini-batch"));
        }
        let acts = tensor_to_vec(acts)?;
        let errs = tensor_to_vec(errs)?;

        match self.shape {
            Shape::Dense { inputs, outputs } => {
                check_len(&self.name, "activations", acts.len(), batch * inputs)?;
                check_len(&self.name, "error signals", errs.len(), batch * outputs)?;
                let mut a = Array2::<f64>::ones((batch, self.a_dim()));
                let x = ArrayView2::from_shape((batch, inputs), &acts)
                    .map_err(|e| KfacError::Numerical(e.to_string()))?;
                a.slice_mut(ndarray::s![.., ..inputs]).assign(&x);
                let e = Array2::from_shape_vec((batch, outputs), errs)
                    .map_err(|e| KfacError::Numerical(e.to_string()))?;
                Ok((a, e, batch, 1))
            }
            Shape::Conv(geometry) => {
                let (out_h, out_w) = geometry.output_hw();
                let spatial = out_h * out_w;
                let a = im2col(&acts, batch, &geometry, self.has_bias)?;
                check_len(&self.name, "error signals", errs.len(), batch * geometry.out_channels * spatial)?;
                let e = channels_last(&errs, batch, geometry.out_channels, spatial)?;
                Ok((a, e, batch, spatial))
            }
        }
    }

    /// Local, un-averaged factors from this rank's mini-batch
    ///
    /// Scaled so that summing over the trainer group yields the average over
    /// the global mini-batch.
    pub fn compute_local_kronecker_factors(&mut self, layer: &dyn Layer, comm: &dyn Communicator) -> KfacResult<()> {
        let (a, e, batch, spatial) = self.samples(layer)?;
        let scale = (batch * comm.size()) as f64;
        let spatial = spatial as f64;
        let factor_a = kronecker_factor(a.view(), 1.0 / (scale * spatial));
        let factor_g = kronecker_factor(e.view(), scale / spatial);
        pack_lower_tri(&factor_a, &mut self.factor_a)?;
        pack_lower_tri(&factor_g, &mut self.factor_g)?;
        Ok(())
    }

    /// Blend the globally reduced factors into the running averages
    pub fn update_kronecker_average(&mut self, decay: f64) -> KfacResult<()> {
        let fresh_a = unpack_lower_tri(&self.factor_a, self.a_dim())?;
        let fresh_g = unpack_lower_tri(&self.factor_g, self.g_dim())?;
        if self.averaged {
            update_moving_average(&mut self.average_a, &fresh_a, decay);
            update_moving_average(&mut self.average_g, &fresh_g, decay);
        } else {
            self.average_a = fresh_a;
            self.average_g = fresh_g;
            self.averaged = true;
        }
        Ok(())
    }

    /// Invert the damped averages and precondition the layer's gradient
    ///
    /// Computes `lr_factor · G⁻¹ ∇W A⁻¹` with the bias gradient as the last
    /// column of `∇W`. Under the pi correction the inverses are built from
    /// cached inverse square roots, otherwise by Cholesky.
    pub fn update_kronecker_inverse(
        &mut self,
        layer: &dyn Layer,
        use_pi: bool,
        damping_act: f64,
        damping_err: f64,
        learning_rate_factor: f64,
    ) -> KfacResult<()> {
        self.pi = if use_pi {
            compute_pi(&self.average_a, &self.average_g)
        } else {
            1.0
        };
        let (damping_a, damping_g) = (damping_act * self.pi, damping_err / self.pi);
        if use_pi {
            self.root_a = damped_inverse_sqrt(&self.average_a, damping_a)?;
            self.root_g = damped_inverse_sqrt(&self.average_g, damping_g)?;
            self.inverse_a = self.root_a.dot(&self.root_a);
            self.inverse_g = self.root_g.dot(&self.root_g);
        } else {
            self.inverse_a = damped_inverse(&self.average_a, damping_a)?;
            self.inverse_g = damped_inverse(&self.average_g, damping_g)?;
        }
        self.update_preconditioned_gradient(layer, learning_rate_factor)
    }

    /// Precondition the current gradient with the cached inverses
    pub fn update_preconditioned_gradient(&mut self, layer: &dyn Layer, learning_rate_factor: f64) -> KfacResult<()> {
        let gradient = self.gradient_matrix(layer)?;
        let mut preconditioned = self.inverse_g.dot(&gradient).dot(&self.inverse_a);
        preconditioned.mapv_inplace(|v| v * learning_rate_factor);
        self.grad.clear();
        self.grad.extend(preconditioned.iter().copied());
        Ok(())
    }

    /// `(outputs, a_dim)` gradient with the bias appended as the last column
    fn gradient_matrix(&self, layer: &dyn Layer) -> KfacResult<Array2<f64>> {
        let (g, a) = (self.g_dim(), self.a_dim());
        let weights = a - usize::from(self.has_bias);
        let weight_grad = layer
            .weight_gradient(0)
            .ok_or_else(|| KfacError::invalid_layer(&self.name, "no weight gradient"))?;
        let weight_grad = tensor_to_vec(weight_grad)?;
        check_len(&self.name, "weight gradient", weight_grad.len(), g * weights)?;

        let mut matrix = Array2::<f64>::zeros((g, a));
        for (row, chunk) in weight_grad.chunks(weights.max(1)).take(g).enumerate() {
            for (col, v) in chunk.iter().enumerate() {
                matrix[[row, col]] = *v;
            }
        }
        if self.has_bias {
            let bias_grad = layer
                .weight_gradient(1)
                .ok_or_else(|| KfacError::invalid_layer(&self.name, "no bias gradient"))?;
            let bias_grad = tensor_to_vec(bias_grad)?;
            check_len(&self.name, "bias gradient", bias_grad.len(), g)?;
            for (row, v) in bias_grad.iter().enumerate() {
                matrix[[row, weights]] = *v;
            }
        }
        Ok(matrix)
    }

    pub fn local_kronecker_buffers(&mut self) -> Vec<&mut [f64]> {
        vec![self.factor_a.as_mut_slice(), self.factor_g.as_mut_slice()]
    }

    pub fn preconditioned_grad_buffers(&mut self) -> Vec<&mut [f64]> {
        vec![self.grad.as_mut_slice()]
    }

    /// Replace the layer's gradients with the preconditioned ones
    pub fn apply_preconditioned_gradient(&self, layer: &mut dyn Layer) -> KfacResult<()> {
        let (g, a) = (self.g_dim(), self.a_dim());
        let weights = a - usize::from(self.has_bias);
        let mut weight_grad = Vec::with_capacity(g * weights);
        let mut bias_grad = Vec::with_capacity(g);
        for row in self.grad.chunks(a.max(1)).take(g) {
            weight_grad.extend_from_slice(&row[..weights]);
            if self.has_bias {
                bias_grad.push(row[weights]);
            }
        }

        let like = layer
            .weight_gradient(0)
            .or_else(|| layer.weights(0))
            .ok_or_else(|| KfacError::invalid_layer(&self.name, "missing weight tensor"))?;
        let tensor = vec_to_tensor_like(weight_grad, like)?;
        layer.set_weight_gradient(0, tensor)?;

        if self.has_bias {
            let like = layer
                .weight_gradient(1)
                .or_else(|| layer.weights(1))
                .ok_or_else(|| KfacError::invalid_layer(&self.name, "missing bias tensor"))?;
            let tensor = vec_to_tensor_like(bias_grad, like)?;
            layer.set_weight_gradient(1, tensor)?;
        }
        Ok(())
    }

    pub fn preconditioned_gradient(&self) -> &[f64] {
        &self.grad
    }

    pub fn average_factors(&self) -> (&Array2<f64>, &Array2<f64>) {
        (&self.average_a, &self.average_g)
    }

    pub fn inverse_factors(&self) -> (&Array2<f64>, &Array2<f64>) {
        (&self.inverse_a, &self.inverse_g)
    }

    /// Cached inverse square roots, present once a pi-corrected inverse ran
    pub fn inverse_roots(&self) -> Option<(&Array2<f64>, &Array2<f64>)> {
        (!self.root_a.is_empty()).then_some((&self.root_a, &self.root_g))
    }

    pub fn internal_matrix_info(&self) -> Vec<(String, usize, usize)> {
        let (a, g) = (self.a_dim(), self.g_dim());
        vec![
            ("kronecker_factor_A".to_string(), a, a),
            ("kronecker_factor_G".to_string(), g, g),
            ("kronecker_average_A".to_string(), a, a),
            ("kronecker_average_G".to_string(), g, g),
            ("kronecker_inverse_A".to_string(), a, a),
            ("kronecker_inverse_G".to_string(), g, g),
            ("preconditioned_grad".to_string(), g, a),
        ]
    }

    pub fn matrix_summaries(&self) -> Vec<String> {
        vec![
            matrix_summary(&format!("{}/A", self.name), &self.average_a),
            matrix_summary(&format!("{}/G", self.name), &self.average_g),
        ]
    }

    pub fn matrices(&self) -> Vec<(String, &Array2<f64>)> {
        let mut out = vec![
            (format!("{}/A", self.name), &self.average_a),
            (format!("{}/G", self.name), &self.average_g),
            (format!("{}/A_inv", self.name), &self.inverse_a),
            (format!("{}/G_inv", self.name), &self.inverse_g),
        ];
        if let Some((root_a, root_g)) = self.inverse_roots() {
            out.push((format!("{}/A_inv_sqrt", self.name), root_a));
            out.push((format!("{}/G_inv_sqrt", self.name), root_g));
        }
        out
    }
}

fn check_len(layer: &str, what: &str, got: usize, expected: usize) -> KfacResult<()> {
    if got != expected {
        return Err(KfacError::invalid_layer(
            layer,
            format!("{} have {} elements, expected {}", what, got, expected),
        ));
    }
    Ok(())
}
