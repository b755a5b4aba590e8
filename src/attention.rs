use candle_core::{Module, Result, Tensor, D};
use candle_nn::{
    conv1d,
    ops::{sigmoid, softmax_last_dim},
    Conv1d, Conv1dConfig, Linear, VarBuilder,
};

use crate::{
    config::{AttentionType, Seq2seqConfig},
    utils::{masked_fill_with, uniform_linear, uniform_linear_no_bias, NEG_INF},
};

struct LocationFeatures {
    conv: Conv1d,
    w_conv: Linear,
}

/// Attention of the recurrent decoder over the encoder outputs.
pub struct AttentionMechanism {
    attention_type: AttentionType,
    w_enc: Linear,
    w_dec: Linear,
    v: Option<Linear>,
    location: Option<LocationFeatures>,
    sharpening_factor: f64,
    sigmoid_smoothing: bool,
}

impl AttentionMechanism {
    pub fn new(enc_dim: usize, dec_dim: usize, config: &Seq2seqConfig, vb: VarBuilder) -> Result<Self> {
        let init = config.parameter_init;
        let attn_dim = config.attention_dim;

        let w_enc = uniform_linear(enc_dim, attn_dim, init, vb.pp("w_enc"))?;
        let w_dec = uniform_linear_no_bias(dec_dim, attn_dim, init, vb.pp("w_dec"))?;

        let v = match config.attention_type {
            AttentionType::Content | AttentionType::Location => {
                Some(uniform_linear_no_bias(attn_dim, 1, init, vb.pp("v"))?)
            }
            AttentionType::DotProduct => None,
        };

        let location = match config.attention_type {
            AttentionType::Location => {
                let channels = config.attention_conv_num_channels;
                let conv_config = Conv1dConfig {
                    padding: config.attention_conv_width / 2,
                    ..Default::default()
                };
                Some(LocationFeatures {
                    conv: conv1d(1, channels, config.attention_conv_width, conv_config, vb.pp("conv"))?,
                    w_conv: uniform_linear_no_bias(channels, attn_dim, init, vb.pp("w_conv"))?,
                })
            }
            AttentionType::Content | AttentionType::DotProduct => None,
        };

        Ok(Self {
            attention_type: config.attention_type,
            w_enc,
            w_dec,
            v,
            location,
            sharpening_factor: config.sharpening_factor,
            sigmoid_smoothing: config.sigmoid_smoothing,
        })
    }

    /// Projects the encoder outputs once per utterance: `(batch, T, attention_dim)`.
    pub fn project_keys(&self, enc_out: &Tensor) -> Result<Tensor> {
        self.w_enc.forward(enc_out)
    }

    /// One attention step.
    ///
    /// enc_out: `(batch, T, enc_dim)`, keys: output of [`Self::project_keys`],
    /// mask: `(batch, T)` u8, dec_state: `(batch, dec_dim)`, aw_prev: `(batch, T)`.
    /// Returns the context `(batch, enc_dim)` and the weights `(batch, T)`.
    pub fn forward(
        &self,
        enc_out: &Tensor,
        keys: &Tensor,
        mask: &Tensor,
        dec_state: &Tensor,
        aw_prev: &Tensor,
    ) -> Result<(Tensor, Tensor)> {
        let query = self.w_dec.forward(dec_state)?.unsqueeze(1)?; // (batch, 1, attn_dim)

        let energy = match self.attention_type {
            AttentionType::DotProduct => keys.broadcast_mul(&query)?.sum(D::Minus1)?,
            AttentionType::Content | AttentionType::Location => {
                let mut hidden = keys.broadcast_add(&query)?;
                if let Some(location) = &self.location {
                    // (batch, 1, T) -> (batch, channels, T) -> (batch, T, attn_dim)
                    let conv = location.conv.forward(&aw_prev.unsqueeze(1)?)?;
                    let conv = location.w_conv.forward(&conv.transpose(1, 2)?.contiguous()?)?;
                    hidden = (hidden + conv)?;
                }
                match &self.v {
                    Some(v) => v.forward(&hidden.tanh()?)?.squeeze(D::Minus1)?,
                    None => candle_core::bail!("additive attention without a scoring vector"),
                }
            }
        };

        let energy = (energy * self.sharpening_factor)?;
        let aw = if self.sigmoid_smoothing {
            let gates = sigmoid(&energy)?.broadcast_mul(&mask.to_dtype(energy.dtype())?)?;
            // an all-padding row stays zero
            gates.broadcast_div(&(gates.sum_keepdim(D::Minus1)? + 1e-10)?)?
        } else {
            softmax_last_dim(&masked_fill_with(&energy, mask, NEG_INF)?)?
        };

        // (batch, 1, T) x (batch, T, enc_dim)
        let context = aw.unsqueeze(1)?.matmul(enc_out)?.squeeze(1)?;
        Ok((context, aw))
    }
}

#[cfg(test)]
mod tests {
    use candle_core::{DType, Device};
    use candle_nn::VarMap;

    use super::*;
    use crate::utils::sequence_mask;

    fn config(attention_type: AttentionType) -> Seq2seqConfig {
        Seq2seqConfig {
            attention_type,
            attention_dim: 6,
            attention_conv_num_channels: 3,
            attention_conv_width: 5,
            ..Default::default()
        }
    }

    #[test]
    fn test_weights_are_masked_distributions() {
        let device = Device::Cpu;
        let enc_out = Tensor::randn(0f32, 1., (2, 7, 8), &device).unwrap();
        let dec_state = Tensor::randn(0f32, 1., (2, 5), &device).unwrap();
        let mask = sequence_mask(&[7, 4], 7, &device).unwrap();
        let aw_prev = Tensor::zeros((2, 7), DType::F32, &device).unwrap();

        for attention_type in [
            AttentionType::Content,
            AttentionType::Location,
            AttentionType::DotProduct,
        ] {
            for sigmoid_smoothing in [false, true] {
                let varmap = VarMap::new();
                let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
                let config = Seq2seqConfig {
                    sigmoid_smoothing,
                    ..config(attention_type)
                };
                let attention = AttentionMechanism::new(8, 5, &config, vb).unwrap();
                let keys = attention.project_keys(&enc_out).unwrap();
                let (context, aw) = attention
                    .forward(&enc_out, &keys, &mask, &dec_state, &aw_prev)
                    .unwrap();

                assert_eq!(context.dims2().unwrap(), (2, 8));
                let aw = aw.to_vec2::<f32>().unwrap();
                for row in &aw {
                    let total: f32 = row.iter().sum();
                    assert!((total - 1.).abs() < 1e-5, "{attention_type}: {total}");
                }
                assert!(aw[1][4..].iter().all(|w| *w == 0.), "{attention_type}");
            }
        }
    }

    #[test]
    fn test_location_attention_has_conv_parameters() {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        AttentionMechanism::new(8, 5, &config(AttentionType::Location), vb).unwrap();
        let data = varmap.data().lock().unwrap();
        assert_eq!(data["conv.weight"].dims(), &[3, 1, 5]);
        assert!(data.contains_key("w_conv.weight"));
    }

    #[test]
    fn test_sigmoid_smoothing_with_empty_row() {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let config = Seq2seqConfig {
            sigmoid_smoothing: true,
            ..config(AttentionType::Content)
        };
        let attention = AttentionMechanism::new(8, 5, &config, vb).unwrap();
        let enc_out = Tensor::randn(0f32, 1., (2, 3, 8), &device).unwrap();
        let keys = attention.project_keys(&enc_out).unwrap();
        let mask = sequence_mask(&[3, 0], 3, &device).unwrap();
        let dec_state = Tensor::randn(0f32, 1., (2, 5), &device).unwrap();
        let aw_prev = Tensor::zeros((2, 3), DType::F32, &device).unwrap();

        let (context, aw) = attention
            .forward(&enc_out, &keys, &mask, &dec_state, &aw_prev)
            .unwrap();
        let aw = aw.to_vec2::<f32>().unwrap();
        assert!((aw[0].iter().sum::<f32>() - 1.).abs() < 1e-5);
        assert_eq!(aw[1], vec![0., 0., 0.]);
        let context = context.flatten_all().unwrap().to_vec1::<f32>().unwrap();
        assert!(context.iter().all(|x| x.is_finite()));
    }
}
