use candle_core::{Device, Result, Tensor, D};
use candle_nn::{ops::log_softmax, VarBuilder};

use crate::{
    config::ModelConfig, data::Batch, seq2seq::AttentionSeq2seq, transformer::TransformerSeq2seq,
};

/// Common surface of the trainable recognizers.
pub trait SpeechModel {
    /// Training objective for one batch (a scalar tensor).
    fn loss(&self, batch: &Batch, step: usize, train: bool) -> Result<Tensor>;

    /// Best hypothesis per utterance, without sos / eos.
    fn decode(
        &self,
        xs: &Tensor,
        x_lens: &[usize],
        beam_width: usize,
        max_decode_len: usize,
    ) -> Result<Vec<Vec<u32>>>;

    /// Greedy CTC hypotheses, `None` without a CTC branch.
    fn decode_ctc(&self, xs: &Tensor, x_lens: &[usize]) -> Result<Option<Vec<Vec<u32>>>>;

    fn ctc_loss_weight(&self) -> f64;
}

/// `seed` drives the scheduled-sampling draws of the recurrent model.
pub fn build_model(config: &ModelConfig, seed: u64, vb: VarBuilder) -> Result<Box<dyn SpeechModel>> {
    let model: Box<dyn SpeechModel> = match config {
        ModelConfig::Rnn(config) => Box::new(AttentionSeq2seq::new(config, seed, vb)?),
        ModelConfig::Transformer(config) => Box::new(TransformerSeq2seq::new(config, vb)?),
    };
    Ok(model)
}

/// Teacher-forcing targets built from unpadded label sequences.
pub struct PaddedLabels {
    /// `(batch, L + 1)` sos followed by the labels, padded with eos.
    pub ys_in: Tensor,
    /// `(batch, L + 1)` labels followed by eos, padded with eos.
    pub ys_out: Tensor,
    /// `(batch, L + 1)` 1 on real targets.
    pub mask: Tensor,
    /// Target lengths including eos.
    pub lens: Vec<usize>,
}

impl PaddedLabels {
    pub fn new(ys: &[Vec<u32>], sos: u32, eos: u32, device: &Device) -> Result<Self> {
        let lens = ys.iter().map(|y| y.len() + 1).collect::<Vec<_>>();
        let max_len = lens.iter().copied().max().unwrap_or(1);
        let batch_size = ys.len();

        let mut ys_in = Vec::with_capacity(batch_size * max_len);
        let mut ys_out = Vec::with_capacity(batch_size * max_len);
        let mut mask = Vec::with_capacity(batch_size * max_len);
        for y in ys {
            ys_in.push(sos);
            ys_in.extend_from_slice(y);
            ys_in.resize(ys_in.len() + max_len - y.len() - 1, eos);

            ys_out.extend_from_slice(y);
            ys_out.resize(ys_out.len() + max_len - y.len(), eos);

            mask.extend((0..max_len).map(|t| u8::from(t <= y.len())));
        }

        Ok(Self {
            ys_in: Tensor::from_vec(ys_in, (batch_size, max_len), device)?,
            ys_out: Tensor::from_vec(ys_out, (batch_size, max_len), device)?,
            mask: Tensor::from_vec(mask, (batch_size, max_len), device)?,
            lens,
        })
    }
}

/// Cross entropy summed over the unmasked targets and divided by the batch size.
///
/// With `label_smoothing > 0` the target distribution puts `1 - p` on the label
/// and spreads `p` uniformly over the vocabulary.
pub fn sequence_cross_entropy(
    logits: &Tensor,
    targets: &Tensor,
    mask: &Tensor,
    label_smoothing: f64,
) -> Result<Tensor> {
    let (batch_size, max_len, vocab) = logits.dims3()?;
    let log_probs = log_softmax(&logits.reshape((batch_size * max_len, vocab))?, D::Minus1)?;
    let targets = targets.reshape((batch_size * max_len, 1))?;
    let mask = mask.reshape(batch_size * max_len)?.to_dtype(log_probs.dtype())?;

    let nll = log_probs.gather(&targets, 1)?.squeeze(1)?.neg()?;
    let per_token = if label_smoothing > 0. {
        let uniform = log_probs.mean(D::Minus1)?.neg()?;
        ((nll * (1. - label_smoothing))? + (uniform * label_smoothing)?)?
    } else {
        nll
    };

    (per_token * mask)?.sum_all()? / batch_size as f64
}

#[cfg(test)]
mod tests {
    use candle_core::DType;

    use super::*;

    #[test]
    fn test_padded_labels() {
        let device = Device::Cpu;
        let labels = PaddedLabels::new(&[vec![1, 2, 3], vec![4]], 7, 8, &device).unwrap();
        assert_eq!(
            labels.ys_in.to_vec2::<u32>().unwrap(),
            vec![vec![7, 1, 2, 3], vec![7, 4, 8, 8]]
        );
        assert_eq!(
            labels.ys_out.to_vec2::<u32>().unwrap(),
            vec![vec![1, 2, 3, 8], vec![4, 8, 8, 8]]
        );
        assert_eq!(
            labels.mask.to_vec2::<u8>().unwrap(),
            vec![vec![1, 1, 1, 1], vec![1, 1, 0, 0]]
        );
        assert_eq!(labels.lens, vec![4, 2]);
    }

    #[test]
    fn test_cross_entropy_ignores_padding() {
        let device = Device::Cpu;
        // uniform logits over 4 classes: every target costs ln 4
        let logits = Tensor::zeros((2, 3, 4), DType::F32, &device).unwrap();
        let targets = Tensor::new(&[[0u32, 1, 2], [3, 3, 3]], &device).unwrap();
        let mask = Tensor::new(&[[1u8, 1, 1], [1, 0, 0]], &device).unwrap();

        let loss = sequence_cross_entropy(&logits, &targets, &mask, 0.)
            .unwrap()
            .to_vec0::<f32>()
            .unwrap();
        assert!((loss - 4. * 4f32.ln() / 2.).abs() < 1e-5);

        // smoothing towards the uniform distribution changes nothing here
        let smoothed = sequence_cross_entropy(&logits, &targets, &mask, 0.1)
            .unwrap()
            .to_vec0::<f32>()
            .unwrap();
        assert!((smoothed - loss).abs() < 1e-5);
    }

    #[test]
    fn test_label_smoothing_penalizes_confidence() {
        let device = Device::Cpu;
        let logits = Tensor::new(&[[[10f32, 0., 0.]]], &device).unwrap();
        let targets = Tensor::new(&[[0u32]], &device).unwrap();
        let mask = Tensor::new(&[[1u8]], &device).unwrap();
        let plain = sequence_cross_entropy(&logits, &targets, &mask, 0.)
            .unwrap()
            .to_vec0::<f32>()
            .unwrap();
        let smoothed = sequence_cross_entropy(&logits, &targets, &mask, 0.1)
            .unwrap()
            .to_vec0::<f32>()
            .unwrap();
        assert!(smoothed > plain);
    }
}
