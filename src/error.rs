//! Error types for K-FAC preconditioning

use thiserror::Error;

#[derive(Error, Debug)]
pub enum KfacError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error(
        "K-FAC only supports layers with exactly one parent and one child \
         (layer: {layer}, #parent: {parents}, #child: {children})"
    )]
    Topology {
        layer: String,
        parents: usize,
        children: usize,
    },

    #[error("Invalid layer {layer}: {reason}")]
    InvalidLayer { layer: String, reason: String },

    #[error("Dimension mismatch: expected {expected}, got {got}")]
    DimensionMismatch { expected: usize, got: usize },

    #[error("Numerical error: {0}")]
    Numerical(String),

    #[error("Communication error: {0}")]
    Communication(String),

    #[error("Candle error: {0}")]
    CandleError(#[from] candle_core::Error),

    #[error("Serialization error: {0}")]
    SerializationError(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

impl KfacError {
    pub fn invalid_layer(layer: &str, reason: impl Into<String>) -> Self {
        KfacError::InvalidLayer {
            layer: layer.to_string(),
            reason: reason.into(),
        }
    }
}
