use candle_core::{Result, Tensor};
use candle_nn::{linear, Dropout, Linear, Module, VarBuilder};

#[cfg(feature = "metal")]
use candle_core::D;
#[cfg(feature = "metal")]
use candle_nn::ops::softmax;

#[cfg(not(feature = "metal"))]
use candle_nn::ops::softmax_last_dim;

use crate::utils::masked_fill;

/// Scaled dot-product attention.
///
/// `mask` is broadcast against the scores; positions where it is zero get no weight.
pub fn attention(
    q: &Tensor,
    k: &Tensor,
    v: &Tensor,
    mask: Option<&Tensor>,
    dropout: Option<&Dropout>,
    train: bool,
) -> Result<(Tensor, Tensor)> {
    let head_size = q.dim(candle_core::D::Minus1)?;
    let scale = 1. / (head_size as f64).sqrt();

    // (batch, heads, q_len, k_len) = (batch, heads, q_len, head_sz) x (batch, heads, head_sz, k_len)
    let attention_scores = (q.matmul(&k.t()?)? * scale)?;

    let attention_scores = match mask {
        Some(m) => masked_fill(&attention_scores, m)?,
        None => attention_scores,
    };

    #[cfg(not(feature = "metal"))]
    let attention_weights = softmax_last_dim(&attention_scores)?;

    #[cfg(feature = "metal")]
    let attention_weights = softmax(&attention_scores, D::Minus1)?;

    let dropped = match dropout {
        Some(d) => d.forward(&attention_weights, train)?,
        None => attention_weights.clone(),
    };

    // (batch, heads, q_len, head_sz) = (batch, heads, q_len, k_len) x (batch, heads, k_len, head_sz)
    let attention_output = dropped.matmul(v)?;

    Ok((attention_output, attention_weights))
}

/// Multi-head attention with separate key / value / query projections into `adim`.
pub struct MultiHeadAttention {
    w_key: Linear,
    w_value: Linear,
    w_query: Linear,
    w_out: Linear,
    dropout: Dropout,
    n_heads: usize,
    d_k: usize,
}

impl MultiHeadAttention {
    pub fn new(
        kdim: usize,
        qdim: usize,
        adim: usize,
        n_heads: usize,
        dropout: f32,
        vb: VarBuilder,
    ) -> Result<Self> {
        if adim % n_heads != 0 {
            candle_core::bail!("attention dim {adim} is not divisible by {n_heads} heads");
        }
        let w_key = linear(kdim, adim, vb.pp("w_key"))?;
        let w_value = linear(kdim, adim, vb.pp("w_value"))?;
        let w_query = linear(qdim, adim, vb.pp("w_query"))?;
        let w_out = linear(adim, qdim, vb.pp("w_out"))?;

        Ok(Self {
            w_key,
            w_value,
            w_query,
            w_out,
            dropout: Dropout::new(dropout),
            n_heads,
            d_k: adim / n_heads,
        })
    }

    fn split_heads(&self, xs: &Tensor) -> Result<Tensor> {
        let (batch_size, seq_len, _) = xs.dims3()?;
        // (batch, seq_len, adim) -> (batch, heads, seq_len, d_k)
        xs.reshape((batch_size, seq_len, self.n_heads, self.d_k))?
            .transpose(1, 2)?
            .contiguous()
    }

    /// Returns the attended values `(batch, q_len, qdim)` and the weights
    /// `(batch, heads, q_len, k_len)`. `mask` is `(batch, q_len, k_len)`.
    pub fn forward(
        &self,
        query: &Tensor,
        key: &Tensor,
        value: &Tensor,
        mask: Option<&Tensor>,
        train: bool,
    ) -> Result<(Tensor, Tensor)> {
        let (batch_size, q_len, _) = query.dims3()?;
        let q = self.split_heads(&self.w_query.forward(query)?)?;
        let k = self.split_heads(&self.w_key.forward(key)?)?;
        let v = self.split_heads(&self.w_value.forward(value)?)?;

        let mask = match mask {
            Some(m) => Some(m.unsqueeze(1)?),
            None => None,
        };

        let (attention_output, attention_weights) =
            attention(&q, &k, &v, mask.as_ref(), Some(&self.dropout), train)?;

        let attention_output = attention_output // (batch, heads, q_len, d_k)
            .transpose(1, 2)? // (batch, q_len, heads, d_k)
            .contiguous()?
            .reshape((batch_size, q_len, self.n_heads * self.d_k))?
            .apply(&self.w_out)?; // (batch, q_len, qdim)

        Ok((attention_output, attention_weights))
    }
}

#[cfg(test)]
mod tests {
    use candle_core::{DType, Device, Tensor};
    use candle_nn::{VarBuilder, VarMap};

    use super::*;
    use crate::utils::{causal_mask, key_padding_mask};

    #[test]
    fn test_attention_weights_are_distributions() {
        let device = Device::Cpu;

        let q = Tensor::from_vec(vec![0.1f32, 0.2, 0.3, 0.4], (1, 1, 1, 4), &device).unwrap();
        let k = q.clone();
        let v = q.clone();

        let mask = causal_mask(1, &device).unwrap();

        let (output, weights) = attention(&q, &k, &v, Some(&mask), None, false).unwrap();

        assert_eq!(output.shape(), q.shape());
        let weights = weights.flatten_all().unwrap().to_vec1::<f32>().unwrap();
        assert_eq!(weights, vec![1.0]);
    }

    #[test]
    fn test_causal_attention_ignores_future() {
        let device = Device::Cpu;
        let q = Tensor::ones((1, 1, 3, 2), DType::F32, &device).unwrap();
        let mask = causal_mask(3, &device).unwrap().unsqueeze(0).unwrap();
        let (_, weights) = attention(&q, &q, &q, Some(&mask), None, false).unwrap();
        let weights = weights.squeeze(0).unwrap().squeeze(0).unwrap();
        let weights = weights.to_vec2::<f32>().unwrap();
        assert_eq!(weights[0], vec![1.0, 0.0, 0.0]);
        assert!((weights[1][0] - 0.5).abs() < 1e-6);
        assert_eq!(weights[1][2], 0.0);
    }

    #[test]
    fn test_multi_head_attention_cross_lengths() {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let mha = MultiHeadAttention::new(16, 8, 16, 4, 0.0, vb).unwrap();

        let query = Tensor::randn(0f32, 1., (2, 3, 8), &device).unwrap();
        let memory = Tensor::randn(0f32, 1., (2, 5, 16), &device).unwrap();
        let mask = key_padding_mask(&[5, 2], 3, 5, &device).unwrap();

        let (out, weights) = mha
            .forward(&query, &memory, &memory, Some(&mask), false)
            .unwrap();
        assert_eq!(out.dims3().unwrap(), (2, 3, 8));
        assert_eq!(weights.dims4().unwrap(), (2, 4, 3, 5));

        // the second utterance only has two valid keys
        let masked = weights
            .narrow(0, 1, 1)
            .unwrap()
            .narrow(3, 2, 3)
            .unwrap()
            .sum_all()
            .unwrap()
            .to_vec0::<f32>()
            .unwrap();
        assert_eq!(masked, 0.0);
    }

    #[test]
    fn test_rejects_indivisible_heads() {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        assert!(MultiHeadAttention::new(10, 10, 10, 3, 0.0, vb).is_err());
    }
}
