use candle_core::{Module, Result, Tensor};
use candle_nn::{linear, Linear, ModuleT, VarBuilder};

use crate::{
    config::{FfnNonlinear, PeType, SelfAttentionType, TransformerConfig},
    embeddings::PositionalEncoding,
    error::ModelError,
    feed_forward::PositionwiseFeedForward,
    layer_norm::LayerNormalization,
    multi_head_attention::MultiHeadAttention,
    residual_connection::ResidualConnection,
    utils::key_padding_mask,
};

/// A single pre-LN layer of the transformer encoder.
pub struct TransformerEncoderBlock {
    self_attn: MultiHeadAttention,
    feed_forward: PositionwiseFeedForward,
    residual_connections: [ResidualConnection; 2],
}

impl TransformerEncoderBlock {
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
        vb: VarBuilder,
    ) -> Result<Self> {
        if atype == SelfAttentionType::Average {
            return Err(ModelError::not_implemented("average self-attention").into_candle());
        }
        let self_attn = MultiHeadAttention::new(
            d_model,
            d_model,
            d_model,
            n_heads,
            dropout_att,
            vb.pp("self_attn"),
        )?;
        let feed_forward = PositionwiseFeedForward::new(
            d_model,
            d_ff,
            d_model,
            dropout,
            ffn_nonlinear,
            vb.pp("feed_forward"),
        )?;
        let residual_connections = [
            ResidualConnection::new(d_model, dropout, layer_norm_eps, vb.pp("norm1"))?,
            ResidualConnection::new(d_model, dropout, layer_norm_eps, vb.pp("norm2"))?,
        ];

        Ok(Self {
            self_attn,
            feed_forward,
            residual_connections,
        })
    }

    /// xs: `(batch, T, d_model)`, xx_mask: `(batch, T, T)`.
    /// Returns the new states and the self-attention weights `(batch, heads, T, T)`.
    pub fn forward(
        &self,
        xs: &Tensor,
        xx_mask: Option<&Tensor>,
        train: bool,
    ) -> Result<(Tensor, Tensor)> {
        let (xs, xx_aws) = self.residual_connections[0].forward(
            xs,
            |xs| self.self_attn.forward(xs, xs, xs, xx_mask, train),
            train,
        )?;
        let (xs, ()) = self.residual_connections[1].forward(
            &xs,
            |xs| Ok((self.feed_forward.forward_t(xs, train)?, ())),
            train,
        )?;

        Ok((xs, xx_aws))
    }
}

/// Input projection, positional encoding, a stack of encoder blocks and a final norm.
pub struct TransformerEncoder {
    embed: Linear,
    pos_enc: PositionalEncoding,
    blocks: Vec<TransformerEncoderBlock>,
    norm: LayerNormalization,
}

impl TransformerEncoder {
    pub fn new(config: &TransformerConfig, vb: VarBuilder) -> Result<Self> {
        let d_model = config.d_model;
        // concat encoding appends its own channels, so the projection fills half
        let d_embed = match config.pe_type {
            PeType::Concat => d_model / 2,
            PeType::None | PeType::Add => d_model,
        };
        let embed = linear(config.stacked_input_size(), d_embed, vb.pp("embed"))?;
        let pos_enc = PositionalEncoding::new(
            d_embed,
            config.dropout,
            config.pe_type,
            config.max_len,
            vb.dtype(),
            vb.device(),
        )?;

        let blocks = (0..config.enc_n_layers)
            .map(|i| {
                TransformerEncoderBlock::new(
                    d_model,
                    config.d_ff,
                    config.attention_type,
                    config.n_heads,
                    config.dropout,
                    config.dropout_att,
                    config.layer_norm_eps,
                    config.ffn_nonlinear,
                    vb.pp(format!("layers.{i}")),
                )
            })
            .collect::<Result<Vec<_>>>()?;

        let norm = LayerNormalization::new(d_model, config.layer_norm_eps, vb.pp("norm_out"))?;

        Ok(Self {
            embed,
            pos_enc,
            blocks,
            norm,
        })
    }

    /// xs: `(batch, T, input_dim)`. Returns `(batch, T, d_model)` and the
    /// attention weights of every block.
    pub fn forward(
        &self,
        xs: &Tensor,
        x_lens: &[usize],
        train: bool,
    ) -> Result<(Tensor, Vec<Tensor>)> {
        let (_, max_len, _) = xs.dims3()?;
        // every query needs one key to attend to
        let x_lens = x_lens.iter().map(|&len| len.max(1)).collect::<Vec<_>>();
        let xx_mask = key_padding_mask(&x_lens, max_len, max_len, xs.device())?;

        let mut xs = self.pos_enc.forward_t(&self.embed.forward(xs)?, train)?;
        let mut aws = Vec::with_capacity(self.blocks.len());
        for block in &self.blocks {
            let (next, xx_aws) = block.forward(&xs, Some(&xx_mask), train)?;
            xs = next;
            aws.push(xx_aws);
        }
        Ok((self.norm.forward(&xs)?, aws))
    }
}
