use candle_core::{Module, Result, Tensor};
use candle_nn::{linear, Linear, ModuleT, VarBuilder};

use crate::{
    config::{FfnNonlinear, PeType, SelfAttentionType, TransformerConfig},
    embeddings::{LabelEmbedding, PositionalEncoding},
    error::ModelError,
    feed_forward::PositionwiseFeedForward,
    layer_norm::LayerNormalization,
    multi_head_attention::MultiHeadAttention,
    residual_connection::ResidualConnection,
};

struct SourceAttention {
    attn: MultiHeadAttention,
    residual: ResidualConnection,
}

/// A single pre-LN layer of the transformer decoder.
pub struct TransformerDecoderBlock {
    self_attn: MultiHeadAttention,
    self_residual: ResidualConnection,
    src_attn: Option<SourceAttention>,
    feed_forward: PositionwiseFeedForward,
    ffn_residual: ResidualConnection,
}

/// Outputs of one decoder block.
pub struct DecoderBlockOutput {
    pub ys: Tensor,
    /// `(batch, heads, L, L)`
    pub yy_aws: Tensor,
    /// `(batch, heads, L, T)`, absent without source-target attention.
    pub xy_aws: Option<Tensor>,
}

impl TransformerDecoderBlock {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        d_model: usize,
        d_ff: usize,
        atype: SelfAttentionType,
        n_heads: usize,
        dropout: f32,
        dropout_att: f32,
        layer_norm_eps: f64,
        ffn_nonlinear: FfnNonlinear,
        src_tgt_attention: bool,
        vb: VarBuilder,
    ) -> Result<Self> {
        if atype == SelfAttentionType::Average {
            return Err(ModelError::not_implemented("average self-attention").into_candle());
        }

        let mha = |name: &str| {
            MultiHeadAttention::new(d_model, d_model, d_model, n_heads, dropout_att, vb.pp(name))
        };

        let self_attn = mha("self_attn")?;
        let self_residual = ResidualConnection::new(d_model, dropout, layer_norm_eps, vb.pp("norm1"))?;

        let src_attn = if src_tgt_attention {
            Some(SourceAttention {
                attn: mha("src_attn")?,
                residual: ResidualConnection::new(d_model, dropout, layer_norm_eps, vb.pp("norm2"))?,
            })
        } else {
            None
        };

        let feed_forward = PositionwiseFeedForward::new(
            d_model,
            d_ff,
            d_model,
            dropout,
            ffn_nonlinear,
            vb.pp("feed_forward"),
        )?;
        let ffn_residual = ResidualConnection::new(d_model, dropout, layer_norm_eps, vb.pp("norm3"))?;

        Ok(Self {
            self_attn,
            self_residual,
            src_attn,
            feed_forward,
            ffn_residual,
        })
    }

    /// ys: `(batch, L, d_model)`, yy_mask: `(batch, L, L)`,
    /// xs: encoder outputs `(batch, T, d_model)`, xy_mask: `(batch, L, T)`.
    pub fn forward(
        &self,
        ys: &Tensor,
        yy_mask: Option<&Tensor>,
        xs: Option<&Tensor>,
        xy_mask: Option<&Tensor>,
        train: bool,
    ) -> Result<DecoderBlockOutput> {
        let (ys, yy_aws) = self.self_residual.forward(
            ys,
            |ys| self.self_attn.forward(ys, ys, ys, yy_mask, train),
            train,
        )?;

        let (ys, xy_aws) = match (&self.src_attn, xs) {
            (Some(src), Some(xs)) => {
                let (ys, aws) = src.residual.forward(
                    &ys,
                    |ys| src.attn.forward(ys, xs, xs, xy_mask, train),
                    train,
                )?;
                (ys, Some(aws))
            }
            (Some(_), None) => candle_core::bail!("source-target attention needs encoder outputs"),
            (None, _) => (ys, None),
        };

        let (ys, ()) = self.ffn_residual.forward(
            &ys,
            |ys| Ok((self.feed_forward.forward_t(ys, train)?, ())),
            train,
        )?;

        Ok(DecoderBlockOutput { ys, yy_aws, xy_aws })
    }
}

/// Label embedding, positional encoding, a stack of decoder blocks, final norm
/// and the projection onto the vocabulary.
pub struct TransformerDecoder {
    embed: LabelEmbedding,
    pos_enc: PositionalEncoding,
    blocks: Vec<TransformerDecoderBlock>,
    norm: LayerNormalization,
    output: Linear,
}

impl TransformerDecoder {
    pub fn new(config: &TransformerConfig, vocab_size: usize, vb: VarBuilder) -> Result<Self> {
        let d_model = config.d_model;
        let d_embed = match config.pe_type {
            PeType::Concat => d_model / 2,
            PeType::None | PeType::Add => d_model,
        };
        let embed = LabelEmbedding::new(vocab_size, d_embed, 0., vb.pp("embed"))?;
        let pos_enc = PositionalEncoding::new(
            d_embed,
            config.dropout,
            config.pe_type,
            config.max_len,
            vb.dtype(),
            vb.device(),
        )?;

        let blocks = (0..config.dec_n_layers)
            .map(|i| {
                TransformerDecoderBlock::new(
                    d_model,
                    config.d_ff,
                    config.attention_type,
                    config.n_heads,
                    config.dropout,
                    config.dropout_att,
                    config.layer_norm_eps,
                    config.ffn_nonlinear,
                    config.src_tgt_attention,
                    vb.pp(format!("layers.{i}")),
                )
            })
            .collect::<Result<Vec<_>>>()?;

        let norm = LayerNormalization::new(d_model, config.layer_norm_eps, vb.pp("norm_out"))?;
        let output = linear(d_model, vocab_size, vb.pp("output"))?;

        Ok(Self {
            embed,
            pos_enc,
            blocks,
            norm,
            output,
        })
    }

    /// ys: `(batch, L)` token ids. Returns logits `(batch, L, vocab)`.
    pub fn forward(
        &self,
        ys: &Tensor,
        yy_mask: &Tensor,
        xs: &Tensor,
        xy_mask: &Tensor,
        train: bool,
    ) -> Result<Tensor> {
        let mut out = self
            .pos_enc
            .forward_t(&self.embed.forward_t(ys, train)?, train)?;
        for block in &self.blocks {
            out = block
                .forward(&out, Some(yy_mask), Some(xs), Some(xy_mask), train)?
                .ys;
        }
        self.output.forward(&self.norm.forward(&out)?)
    }
}

#[cfg(test)]
mod tests {
    use candle_core::{DType, Device};
    use candle_nn::VarMap;

    use super::*;
    use crate::utils::{causal_mask, key_padding_mask};

    fn block(src_tgt_attention: bool, vb: VarBuilder) -> Result<TransformerDecoderBlock> {
        TransformerDecoderBlock::new(
            16,
            32,
            SelfAttentionType::ScaledDot,
            4,
            0.1,
            0.1,
            1e-12,
            FfnNonlinear::Gelu,
            src_tgt_attention,
            vb,
        )
    }

    #[test]
    fn test_decoder_block_outputs() {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let block = block(true, vb).unwrap();

        let ys = Tensor::randn(0f32, 1., (2, 4, 16), &device).unwrap();
        let xs = Tensor::randn(0f32, 1., (2, 6, 16), &device).unwrap();
        let yy_mask = causal_mask(4, &device).unwrap();
        let xy_mask = key_padding_mask(&[6, 3], 4, 6, &device).unwrap();

        let out = block
            .forward(&ys, Some(&yy_mask), Some(&xs), Some(&xy_mask), true)
            .unwrap();
        assert_eq!(out.ys.dims3().unwrap(), (2, 4, 16));
        assert_eq!(out.yy_aws.dims4().unwrap(), (2, 4, 4, 4));
        assert_eq!(out.xy_aws.unwrap().dims4().unwrap(), (2, 4, 4, 6));
    }

    #[test]
    fn test_decoder_block_without_source_attention() {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let block = block(false, vb).unwrap();
        assert!(!varmap
            .data()
            .lock()
            .unwrap()
            .keys()
            .any(|k| k.starts_with("src_attn")));

        let ys = Tensor::randn(0f32, 1., (1, 3, 16), &device).unwrap();
        let out = block.forward(&ys, None, None, None, false).unwrap();
        assert!(out.xy_aws.is_none());
        assert_eq!(out.ys.dims3().unwrap(), (1, 3, 16));
    }

    #[test]
    fn test_average_self_attention_is_not_implemented() {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let err = TransformerDecoderBlock::new(
            16,
            32,
            SelfAttentionType::Average,
            4,
            0.1,
            0.1,
            1e-12,
            FfnNonlinear::Relu,
            true,
            vb,
        )
        .err()
        .unwrap();
        assert!(err.to_string().contains("not implemented"));
    }

    #[test]
    fn test_decoder_stack_logits() {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let config = TransformerConfig {
            d_model: 16,
            d_ff: 32,
            n_heads: 2,
            dec_n_layers: 2,
            ..Default::default()
        };
        let decoder = TransformerDecoder::new(&config, 29, vb).unwrap();

        let ys = Tensor::new(&[[27u32, 1, 2], [27, 5, 28]], &device).unwrap();
        let xs = Tensor::randn(0f32, 1., (2, 6, 16), &device).unwrap();
        let yy_mask = causal_mask(3, &device).unwrap();
        let xy_mask = key_padding_mask(&[6, 4], 3, 6, &device).unwrap();
        let logits = decoder
            .forward(&ys, &yy_mask, &xs, &xy_mask, false)
            .unwrap();
        assert_eq!(logits.dims3().unwrap(), (2, 3, 29));
    }
}
