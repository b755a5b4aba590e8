use candle_core::{DType, IndexOp, Result, Tensor, D};
use candle_nn::{ops::log_softmax, VarBuilder};

use crate::{
    beam_search::{BeamSearch, StepDecoder},
    config::TransformerConfig,
    ctc::Ctc,
    data::Batch,
    decoder::TransformerDecoder,
    encoder::TransformerEncoder,
    error::ModelError,
    model::{sequence_cross_entropy, PaddedLabels, SpeechModel},
    utils::{causal_mask, key_padding_mask},
};

/// Transformer encoder-decoder with an optional CTC branch on the encoder.
pub struct TransformerSeq2seq {
    encoder: TransformerEncoder,
    decoder: TransformerDecoder,
    ctc: Option<Ctc>,
    label_smoothing_prob: f64,
    ctc_loss_weight: f64,
    sos: u32,
    eos: u32,
}

impl TransformerSeq2seq {
    pub fn new(config: &TransformerConfig, vb: VarBuilder) -> Result<Self> {
        config.validate().map_err(ModelError::into_candle)?;

        let vocab_size = config.num_classes + 2;
        let encoder = TransformerEncoder::new(config, vb.pp("encoder"))?;
        let decoder = TransformerDecoder::new(config, vocab_size, vb.pp("decoder"))?;
        let ctc = if config.ctc_loss_weight > 0. {
            let init = 1. / (config.d_model as f64).sqrt();
            Some(Ctc::new(config.d_model, config.num_classes, init, vb.pp("ctc"))?)
        } else {
            None
        };

        Ok(Self {
            encoder,
            decoder,
            ctc,
            label_smoothing_prob: config.label_smoothing_prob,
            ctc_loss_weight: config.ctc_loss_weight,
            sos: config.num_classes as u32,
            eos: config.num_classes as u32 + 1,
        })
    }

    /// Decoder logits `(batch, L, vocab)` for teacher-forced inputs `ys_in`.
    fn forward_decoder(
        &self,
        enc_out: &Tensor,
        x_lens: &[usize],
        ys_in: &Tensor,
        train: bool,
    ) -> Result<Tensor> {
        let (_, max_len) = ys_in.dims2()?;
        let (_, enc_len, _) = enc_out.dims3()?;
        let yy_mask = causal_mask(max_len, ys_in.device())?;
        let x_lens = x_lens.iter().map(|&len| len.max(1)).collect::<Vec<_>>();
        let xy_mask = key_padding_mask(&x_lens, max_len, enc_len, ys_in.device())?;
        self.decoder
            .forward(ys_in, &yy_mask, enc_out, &xy_mask, train)
    }
}

impl SpeechModel for TransformerSeq2seq {
    fn loss(&self, batch: &Batch, _step: usize, train: bool) -> Result<Tensor> {
        let (enc_out, _) = self.encoder.forward(&batch.xs, &batch.x_lens, train)?;

        let ctc_loss = match &self.ctc {
            Some(ctc) => Some(ctc.loss(&enc_out, &batch.x_lens, &batch.ys)?),
            None => None,
        };
        if self.ctc_loss_weight >= 1. {
            if let Some(ctc_loss) = ctc_loss {
                return Ok(ctc_loss);
            }
        }

        let labels = PaddedLabels::new(&batch.ys, self.sos, self.eos, enc_out.device())?;
        let logits = self.forward_decoder(&enc_out, &batch.x_lens, &labels.ys_in, train)?;
        let att_loss = sequence_cross_entropy(
            &logits,
            &labels.ys_out,
            &labels.mask,
            self.label_smoothing_prob,
        )?;

        match ctc_loss {
            Some(ctc_loss) => {
                (att_loss * (1. - self.ctc_loss_weight))? + (ctc_loss * self.ctc_loss_weight)?
            }
            None => Ok(att_loss),
        }
    }

    fn decode(
        &self,
        xs: &Tensor,
        x_lens: &[usize],
        beam_width: usize,
        max_decode_len: usize,
    ) -> Result<Vec<Vec<u32>>> {
        let (enc_out, _) = self.encoder.forward(xs, x_lens, false)?;
        let search = BeamSearch::new(beam_width, max_decode_len, self.sos, self.eos);

        x_lens
            .iter()
            .enumerate()
            .map(|(b, &len)| {
                let len = len.max(1);
                let enc_out = enc_out.narrow(0, b, 1)?.narrow(1, 0, len)?.contiguous()?;
                search.best(&PrefixDecoder {
                    model: self,
                    enc_out,
                    len,
                })
            })
            .collect()
    }

    fn decode_ctc(&self, xs: &Tensor, x_lens: &[usize]) -> Result<Option<Vec<Vec<u32>>>> {
        match &self.ctc {
            Some(ctc) => {
                let (enc_out, _) = self.encoder.forward(xs, x_lens, false)?;
                Ok(Some(ctc.greedy_decode(&enc_out, x_lens)?))
            }
            None => Ok(None),
        }
    }

    fn ctc_loss_weight(&self) -> f64 {
        self.ctc_loss_weight
    }
}

/// Re-runs the decoder over the whole prefix at every step.
struct PrefixDecoder<'a> {
    model: &'a TransformerSeq2seq,
    enc_out: Tensor,
    len: usize,
}

impl StepDecoder for PrefixDecoder<'_> {
    /// Tokens consumed so far.
    type State = Vec<u32>;

    fn initial_state(&self) -> Result<Vec<u32>> {
        Ok(vec![])
    }

    fn step(&self, prefix: &Vec<u32>, token: u32) -> Result<(Vec<f32>, Vec<u32>)> {
        let mut prefix = prefix.clone();
        prefix.push(token);

        let ys_in = Tensor::new(prefix.as_slice(), self.enc_out.device())?.unsqueeze(0)?;
        let logits = self
            .model
            .forward_decoder(&self.enc_out, &[self.len], &ys_in, false)?;
        let last = logits.i((0, prefix.len() - 1))?;
        let mut log_probs = log_softmax(&last, D::Minus1)?
            .to_dtype(DType::F32)?
            .to_vec1::<f32>()?;
        log_probs[self.model.sos as usize] = f32::NEG_INFINITY;
        Ok((log_probs, prefix))
    }
}
