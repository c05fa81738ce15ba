//! Fisher block for batch normalization
//!
//! Scale and bias gradients of the `C` channels are treated jointly as a
//! `2C` vector; the block keeps the full `2C x 2C` Fisher matrix with the
//! scale half first.

use crate::comm::Communicator;
use crate::error::KfacError;
use crate::linalg::{
    add_to_diagonal_split, kronecker_factor, lower_tri_len, matrix_summary, pack_lower_tri,
    spd_inverse, tensor_to_vec, unpack_lower_tri, update_moving_average, vec_to_tensor_like,
};
use crate::model::{Layer, LayerKind};
use crate::KfacResult;
use ndarray::{Array1, Array2};

#[derive(Debug, Clone)]
pub struct BatchNormBlock {
    layer_index: usize,
    name: String,
    channels: usize,
    factor: Vec<f64>,
    average: Array2<f64>,
    averaged: bool,
    inverse: Array2<f64>,
    /// `[∇scale ; ∇bias]` after preconditioning
    grad: Vec<f64>,
}

impl BatchNormBlock {
    pub fn new(layer_index: usize, layer: &dyn Layer) -> KfacResult<Self> {
        let channels = match layer.kind() {
            LayerKind::BatchNormalization { channels } => channels,
            other => {
                return Err(KfacError::invalid_layer(
                    layer.name(),
                    format!("{} layers have no batch-normalization block", other.name()),
                ))
            }
        };
        for (idx, what) in [(0, "scale"), (1, "bias")] {
            let tensor = layer
                .weights(idx)
                .ok_or_else(|| KfacError::invalid_layer(layer.name(), format!("missing {} tensor", what)))?;
            if tensor.elem_count() != channels {
                return Err(KfacError::invalid_layer(
                    layer.name(),
                    format!("{} has {} elements, expected {}", what, tensor.elem_count(), channels),
                ));
            }
        }

        let dim = 2 * channels;
        Ok(Self {
            layer_index,
            name: layer.name().to_string(),
            channels,
            factor: vec![0.0; lower_tri_len(dim)],
            average: Array2::zeros((dim, dim)),
            averaged: false,
            inverse: Array2::zeros((dim, dim)),
            grad: vec![0.0; dim],
        })
    }

    pub fn layer_index(&self) -> usize {
        self.layer_index
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn channels(&self) -> usize {
        self.channels
    }

    /// Per-sample `[Σ e·x̂ ; Σ e]` vectors, one row per sample
    fn per_sample_gradients(&self, layer: &dyn Layer) -> KfacResult<(Array2<f64>, usize)> {
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
        let c = self.channels;
        if acts.len() != errs.len() || acts.len() % (batch * c.max(1)) != 0 {
            return Err(KfacError::invalid_layer(
                &self.name,
                format!(
                    "activations ({}) and error signals ({}) do not match {} samples of {} channels",
                    acts.len(),
                    errs.len(),
                    batch,
                    c
                ),
            ));
        }
        let spatial = acts.len() / (batch * c.max(1));

        let mut v = Array2::<f64>::zeros((batch, 2 * c));
        for n in 0..batch {
            for ch in 0..c {
                let base = (n * c + ch) * spatial;
                let (mut scale, mut bias) = (0.0, 0.0);
                for s in 0..spatial {
                    let e = errs[base + s];
                    scale += e * acts[base + s];
                    bias += e;
                }
                v[[n, ch]] = scale;
                v[[n, c + ch]] = bias;
            }
        }
        Ok((v, batch))
    }

    pub fn compute_local_kronecker_factors(&mut self, layer: &dyn Layer, comm: &dyn Communicator) -> KfacResult<()> {
        let (mut v, batch) = self.per_sample_gradients(layer)?;
        let scale = (batch * comm.size()) as f64;
        v.mapv_inplace(|x| x * scale);
        let fisher = kronecker_factor(v.view(), 1.0 / scale);
        pack_lower_tri(&fisher, &mut self.factor)
    }

    pub fn update_kronecker_average(&mut self, decay: f64) -> KfacResult<()> {
        let fresh = unpack_lower_tri(&self.factor, 2 * self.channels)?;
        if self.averaged {
            update_moving_average(&mut self.average, &fresh, decay);
        } else {
            self.average = fresh;
            self.averaged = true;
        }
        Ok(())
    }

    /// `lr_factor · (F + diag(act.., err..))⁻¹ [∇scale ; ∇bias]`
    pub fn update_kronecker_inverse(
        &mut self,
        layer: &dyn Layer,
        damping_act: f64,
        damping_err: f64,
        learning_rate_factor: f64,
    ) -> KfacResult<()> {
        let mut damped = self.average.clone();
        add_to_diagonal_split(&mut damped, damping_act, damping_err);
        self.inverse = spd_inverse(&damped)?;
        self.update_preconditioned_gradient(layer, learning_rate_factor)
    }

    pub fn update_preconditioned_gradient(&mut self, layer: &dyn Layer, learning_rate_factor: f64) -> KfacResult<()> {
        let mut gradient = Vec::with_capacity(2 * self.channels);
        for (idx, what) in [(0, "scale"), (1, "bias")] {
            let tensor = layer
                .weight_gradient(idx)
                .ok_or_else(|| KfacError::invalid_layer(&self.name, format!("no {} gradient", what)))?;
            let values = tensor_to_vec(tensor)?;
            if values.len() != self.channels {
                return Err(KfacError::DimensionMismatch {
                    expected: self.channels,
                    got: values.len(),
                });
            }
            gradient.extend(values);
        }
        let preconditioned = self.inverse.dot(&Array1::from(gradient));
        self.grad.clear();
        self.grad
            .extend(preconditioned.iter().map(|v| v * learning_rate_factor));
        Ok(())
    }

    pub fn local_kronecker_buffers(&mut self) -> Vec<&mut [f64]> {
        vec![self.factor.as_mut_slice()]
    }

    pub fn preconditioned_grad_buffers(&mut self) -> Vec<&mut [f64]> {
        vec![self.grad.as_mut_slice()]
    }

    pub fn apply_preconditioned_gradient(&self, layer: &mut dyn Layer) -> KfacResult<()> {
        let (scale, bias) = self.grad.split_at(self.channels);
        for (idx, values) in [(0, scale), (1, bias)] {
            let like = layer
                .weight_gradient(idx)
                .or_else(|| layer.weights(idx))
                .ok_or_else(|| KfacError::invalid_layer(&self.name, format!("missing weight #{}", idx)))?;
            let tensor = vec_to_tensor_like(values.to_vec(), like)?;
            layer.set_weight_gradient(idx, tensor)?;
        }
        Ok(())
    }

    pub fn preconditioned_gradient(&self) -> &[f64] {
        &self.grad
    }

    pub fn average_factor(&self) -> &Array2<f64> {
        &self.average
    }

    pub fn internal_matrix_info(&self) -> Vec<(String, usize, usize)> {
        let dim = 2 * self.channels;
        vec![
            ("fisher_factor".to_string(), dim, dim),
            ("fisher_average".to_string(), dim, dim),
            ("fisher_inverse".to_string(), dim, dim),
            ("preconditioned_grad".to_string(), dim, 1),
        ]
    }

    pub fn matrix_summaries(&self) -> Vec<String> {
        vec![matrix_summary(&format!("{}/F", self.name), &self.average)]
    }

    pub fn matrices(&self) -> Vec<(String, &Array2<f64>)> {
        vec![
            (format!("{}/F", self.name), &self.average),
            (format!("{}/F_inv", self.name), &self.inverse),
        ]
    }
}
