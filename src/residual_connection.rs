use candle_core::{Result, Tensor};
use candle_nn::{Dropout, Module, VarBuilder};

use crate::layer_norm::LayerNormalization;

/// Pre-LN residual: `xs + dropout(sub_layer(norm(xs)))`.
///
/// The sub-layer may return extra values (attention weights) alongside its
/// output; they are handed back untouched.
pub struct ResidualConnection {
    dropout: Dropout,
    norm: LayerNormalization,
}

impl ResidualConnection {
    pub fn new(features: usize, drop_p: f32, eps: f64, vb: VarBuilder) -> Result<Self> {
        let dropout = Dropout::new(drop_p);
        let norm = LayerNormalization::new(features, eps, vb)?;
        Ok(Self { dropout, norm })
    }

    pub fn forward<T>(
        &self,
        xs: &Tensor,
        sub_layer: impl FnOnce(&Tensor) -> Result<(Tensor, T)>,
        train: bool,
    ) -> Result<(Tensor, T)> {
        let (out, extra) = sub_layer(&self.norm.forward(xs)?)?;
        let out = (xs + self.dropout.forward(&out, train)?)?;
        Ok((out, extra))
    }
}
