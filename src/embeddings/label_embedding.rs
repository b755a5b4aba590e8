use candle_core::{Result, Tensor};
use candle_nn::{Dropout, Embedding, Init, Module, ModuleT, VarBuilder};

/// Token embedding followed by dropout, shared by both decoders.
pub struct LabelEmbedding {
    embedding: Embedding,
    dropout: Dropout,
}

impl LabelEmbedding {
    pub fn new(vocab_size: usize, embedding_dim: usize, drop_p: f32, vb: VarBuilder) -> Result<Self> {
        let init = Init::Randn {
            mean: 0.,
            stdev: 1.,
        };
        Self::with_init(vocab_size, embedding_dim, drop_p, init, vb)
    }

    pub fn with_init(
        vocab_size: usize,
        embedding_dim: usize,
        drop_p: f32,
        init: Init,
        vb: VarBuilder,
    ) -> Result<Self> {
        let embeddings = vb.get_with_hints((vocab_size, embedding_dim), "weight", init)?;
        Ok(Self {
            embedding: Embedding::new(embeddings, embedding_dim),
            dropout: Dropout::new(drop_p),
        })
    }
}

impl ModuleT for LabelEmbedding {
    fn forward_t(&self, ys: &Tensor, train: bool) -> Result<Tensor> {
        // (batch, seq_len) u32 -> (batch, seq_len, embedding_dim)
        self.dropout.forward(&self.embedding.forward(ys)?, train)
    }
}

#[cfg(test)]
mod tests {
    use candle_core::{DType, Device};
    use candle_nn::VarMap;

    use super::*;

    #[test]
    fn test_label_embedding_shapes() {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let embed = LabelEmbedding::new(29, 16, 0.1, vb).unwrap();

        let ys = Tensor::new(&[[27u32, 3, 4], [27, 1, 28]], &device).unwrap();
        assert_eq!(embed.forward_t(&ys, true).unwrap().dims3().unwrap(), (2, 3, 16));

        let step = Tensor::new(&[27u32, 27], &device).unwrap();
        assert_eq!(embed.forward_t(&step, false).unwrap().dims2().unwrap(), (2, 16));
    }
}
