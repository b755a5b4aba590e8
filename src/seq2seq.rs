use std::cell::RefCell;

use candle_core::{DType, IndexOp, Module, Result, Tensor, D};
use candle_nn::{ops::log_softmax, Dropout, Linear, ModuleT, VarBuilder};
use rand::{rngs::StdRng, SeedableRng};

use crate::{
    attention::AttentionMechanism,
    beam_search::{BeamSearch, StepDecoder},
    config::{InitDecState, Seq2seqConfig},
    ctc::Ctc,
    data::{coin, Batch},
    embeddings::LabelEmbedding,
    error::ModelError,
    model::{sequence_cross_entropy, PaddedLabels, SpeechModel},
    rnn::{CellState, RnnCell, RnnEncoder},
    utils::{sequence_mask, uniform_linear},
};

/// Recurrent decoder state carried between output steps.
#[derive(Debug, Clone)]
pub struct DecoderState {
    pub cells: Vec<CellState>,
    /// Previous context vector `(batch, enc_dim)`.
    pub context: Tensor,
    /// Previous attention weights `(batch, T)`.
    pub aw: Tensor,
}

/// Encoder outputs prepared for the attention decoder.
struct Memory {
    enc_out: Tensor,
    keys: Tensor,
    mask: Tensor,
}

/// Attention-based encoder-decoder over recurrent layers.
pub struct AttentionSeq2seq {
    encoder: RnnEncoder,
    embed: LabelEmbedding,
    cells: Vec<RnnCell>,
    dropout: Dropout,
    attention: AttentionMechanism,
    init_proj: Option<Linear>,
    w_d: Linear,
    w_c: Linear,
    fc: Linear,
    ctc: Option<Ctc>,
    init_dec_state: InitDecState,
    logits_temperature: f64,
    decoder_residual: bool,
    decoder_dense_residual: bool,
    label_smoothing_prob: f64,
    ctc_loss_weight: f64,
    scheduled_sampling_prob: f64,
    scheduled_sampling_ramp_max_step: usize,
    /// Scheduled sampling draws.
    rng: RefCell<StdRng>,
    sos: u32,
    eos: u32,
}

impl AttentionSeq2seq {
    pub fn new(config: &Seq2seqConfig, seed: u64, vb: VarBuilder) -> Result<Self> {
        config.validate().map_err(ModelError::into_candle)?;

        let init = config.parameter_init;
        let vocab_size = config.num_classes + 2;
        let dec_units = config.decoder_num_units;

        let encoder = RnnEncoder::new(config, vb.pp("encoder"))?;
        let enc_dim = encoder.output_dim();

        let vb_d = vb.pp("decoder");
        let embed = LabelEmbedding::with_init(
            vocab_size,
            config.embedding_dim,
            config.dropout_embedding,
            candle_nn::Init::Uniform { lo: -init, up: init },
            vb_d.pp("embed"),
        )?;
        let cells = (0..config.decoder_num_layers)
            .map(|l| {
                let input_size = if l == 0 {
                    config.embedding_dim + enc_dim
                } else {
                    dec_units
                };
                RnnCell::new(
                    config.decoder_type,
                    input_size,
                    dec_units,
                    init,
                    config.init_forget_gate_bias_with_one,
                    vb_d.pp(format!("rnn.{l}")),
                )
            })
            .collect::<Result<Vec<_>>>()?;
        let attention = AttentionMechanism::new(enc_dim, dec_units, config, vb_d.pp("attention"))?;

        let init_proj = match config.init_dec_state {
            InitDecState::Zero => None,
            InitDecState::Mean | InitDecState::Final => {
                Some(uniform_linear(enc_dim, dec_units, init, vb_d.pp("init"))?)
            }
        };

        let w_d = uniform_linear(dec_units, dec_units, init, vb_d.pp("w_d"))?;
        let w_c = uniform_linear(enc_dim, dec_units, init, vb_d.pp("w_c"))?;
        let fc = uniform_linear(dec_units, vocab_size, init, vb_d.pp("fc"))?;

        let ctc = if config.ctc_loss_weight > 0. {
            Some(Ctc::new(enc_dim, config.num_classes, init, vb.pp("ctc"))?)
        } else {
            None
        };

        Ok(Self {
            encoder,
            embed,
            cells,
            dropout: Dropout::new(config.dropout_decoder),
            attention,
            init_proj,
            w_d,
            w_c,
            fc,
            ctc,
            init_dec_state: config.init_dec_state,
            logits_temperature: config.logits_temperature,
            decoder_residual: config.decoder_residual,
            decoder_dense_residual: config.decoder_dense_residual,
            label_smoothing_prob: config.label_smoothing_prob,
            ctc_loss_weight: config.ctc_loss_weight,
            scheduled_sampling_prob: config.scheduled_sampling_prob,
            scheduled_sampling_ramp_max_step: config.scheduled_sampling_ramp_max_step,
            rng: RefCell::new(StdRng::seed_from_u64(seed)),
            sos: config.num_classes as u32,
            eos: config.num_classes as u32 + 1,
        })
    }

    fn memory(&self, enc_out: Tensor, x_lens: &[usize]) -> Result<Memory> {
        let (_, max_len, _) = enc_out.dims3()?;
        let mask = sequence_mask(x_lens, max_len, enc_out.device())?;
        let keys = self.attention.project_keys(&enc_out)?;
        Ok(Memory {
            enc_out,
            keys,
            mask,
        })
    }

    /// Initial decoder state from the encoder outputs.
    ///
    /// final_state: `(batch, enc_dim)` last hidden state of the encoder.
    fn initial_state(&self, memory: &Memory, x_lens: &[usize], final_state: &Tensor) -> Result<DecoderState> {
        let (batch_size, max_len, enc_dim) = memory.enc_out.dims3()?;
        let dtype = memory.enc_out.dtype();
        let device = memory.enc_out.device();

        let summary = match self.init_dec_state {
            InitDecState::Zero => None,
            InitDecState::Final => Some(final_state.clone()),
            InitDecState::Mean => {
                let mask = memory.mask.to_dtype(dtype)?.unsqueeze(2)?;
                let lens = x_lens.iter().map(|&l| l.max(1) as f32).collect::<Vec<_>>();
                let lens = Tensor::from_vec(lens, (batch_size, 1), device)?.to_dtype(dtype)?;
                let total = memory.enc_out.broadcast_mul(&mask)?.sum(1)?;
                Some(total.broadcast_div(&lens)?)
            }
        };

        let cells = self
            .cells
            .iter()
            .map(|cell| {
                let mut state = cell.zero_state(batch_size, dtype, device)?;
                if let (Some(summary), Some(proj)) = (&summary, &self.init_proj) {
                    state.h = proj.forward(summary)?.tanh()?;
                }
                Ok(state)
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(DecoderState {
            cells,
            context: Tensor::zeros((batch_size, enc_dim), dtype, device)?,
            aw: Tensor::zeros((batch_size, max_len), dtype, device)?,
        })
    }

    /// One output step. ys: `(batch,)` previous labels. Returns logits `(batch, vocab)`.
    fn decode_step(
        &self,
        memory: &Memory,
        state: &DecoderState,
        ys: &Tensor,
        train: bool,
    ) -> Result<(Tensor, DecoderState)> {
        let emb = self.embed.forward_t(ys, train)?;
        let mut input = Tensor::cat(&[&emb, &state.context], D::Minus1)?;

        let mut cells = Vec::with_capacity(self.cells.len());
        // outputs of the layers below, for dense residual connections
        let mut lower: Vec<Tensor> = Vec::new();
        for (l, (cell, prev)) in self.cells.iter().zip(&state.cells).enumerate() {
            let next = cell.step(&input, prev)?;
            let mut out = self.dropout.forward_t(&next.h, train)?;
            if l > 0 {
                if self.decoder_dense_residual {
                    let dims = out.dims().to_vec();
                    for below in lower.iter().filter(|b| b.dims() == dims.as_slice()) {
                        out = (out + below)?;
                    }
                } else if self.decoder_residual && out.dims() == input.dims() {
                    out = (out + &input)?;
                }
            }
            if self.decoder_dense_residual {
                lower.push(out.clone());
            }
            cells.push(next);
            input = out;
        }

        let (context, aw) =
            self.attention
                .forward(&memory.enc_out, &memory.keys, &memory.mask, &input, &state.aw)?;

        let logits = (self.w_d.forward(&input)? + self.w_c.forward(&context)?)?.tanh()?;
        let logits = (self.fc.forward(&logits)? / self.logits_temperature)?;
        Ok((logits, DecoderState { cells, context, aw }))
    }

    fn sampling_prob(&self, step: usize) -> f64 {
        if self.scheduled_sampling_ramp_max_step == 0 {
            return self.scheduled_sampling_prob;
        }
        let ramp = step as f64 / self.scheduled_sampling_ramp_max_step as f64;
        self.scheduled_sampling_prob * ramp.min(1.)
    }

    fn attention_loss(
        &self,
        memory: &Memory,
        mut state: DecoderState,
        batch: &Batch,
        step: usize,
        train: bool,
    ) -> Result<Tensor> {
        let labels = PaddedLabels::new(&batch.ys, self.sos, self.eos, memory.enc_out.device())?;
        let (_, max_len) = labels.ys_in.dims2()?;
        let sampling_prob = if train { self.sampling_prob(step) } else { 0. };
        let mut rng = self.rng.borrow_mut();

        let mut logits: Vec<Tensor> = Vec::with_capacity(max_len);
        for t in 0..max_len {
            let ys = match logits.last() {
                Some(prev) if coin(&mut *rng, sampling_prob) => prev.argmax(D::Minus1)?,
                _ => labels.ys_in.i((.., t))?.contiguous()?,
            };
            let (step_logits, next) = self.decode_step(memory, &state, &ys, train)?;
            logits.push(step_logits);
            state = next;
        }
        let logits = Tensor::stack(&logits, 1)?;

        sequence_cross_entropy(&logits, &labels.ys_out, &labels.mask, self.label_smoothing_prob)
    }
}

impl SpeechModel for AttentionSeq2seq {
    fn loss(&self, batch: &Batch, step: usize, train: bool) -> Result<Tensor> {
        let enc = self.encoder.forward(&batch.xs, &batch.x_lens, train)?;

        let ctc_loss = match &self.ctc {
            Some(ctc) => Some(ctc.loss(&enc.xs, &enc.x_lens, &batch.ys)?),
            None => None,
        };
        if self.ctc_loss_weight >= 1. {
            if let Some(ctc_loss) = ctc_loss {
                return Ok(ctc_loss);
            }
        }

        let memory = self.memory(enc.xs, &enc.x_lens)?;
        let state = self.initial_state(&memory, &enc.x_lens, &enc.final_state)?;
        let att_loss = self.attention_loss(&memory, state, batch, step, train)?;

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
        let enc = self.encoder.forward(xs, x_lens, false)?;
        let search = BeamSearch::new(beam_width, max_decode_len, self.sos, self.eos);

        enc.x_lens
            .iter()
            .enumerate()
            .map(|(b, &len)| {
                let len = len.max(1);
                let enc_out = enc.xs.narrow(0, b, 1)?.narrow(1, 0, len)?.contiguous()?;
                let final_state = enc.final_state.narrow(0, b, 1)?.contiguous()?;
                let memory = self.memory(enc_out, &[len])?;
                let init = self.initial_state(&memory, &[len], &final_state)?;
                search.best(&UtteranceDecoder {
                    model: self,
                    memory,
                    init,
                })
            })
            .collect()
    }

    fn decode_ctc(&self, xs: &Tensor, x_lens: &[usize]) -> Result<Option<Vec<Vec<u32>>>> {
        match &self.ctc {
            Some(ctc) => {
                let enc = self.encoder.forward(xs, x_lens, false)?;
                Ok(Some(ctc.greedy_decode(&enc.xs, &enc.x_lens)?))
            }
            None => Ok(None),
        }
    }

    fn ctc_loss_weight(&self) -> f64 {
        self.ctc_loss_weight
    }
}

/// Beam search view of a single encoded utterance.
struct UtteranceDecoder<'a> {
    model: &'a AttentionSeq2seq,
    memory: Memory,
    init: DecoderState,
}

impl StepDecoder for UtteranceDecoder<'_> {
    type State = DecoderState;

    fn initial_state(&self) -> Result<DecoderState> {
        Ok(self.init.clone())
    }

    fn step(&self, state: &DecoderState, token: u32) -> Result<(Vec<f32>, DecoderState)> {
        let ys = Tensor::new(&[token], self.memory.enc_out.device())?;
        let (logits, next) = self.model.decode_step(&self.memory, state, &ys, false)?;
        let mut log_probs = log_softmax(&logits, D::Minus1)?
            .squeeze(0)?
            .to_dtype(DType::F32)?
            .to_vec1::<f32>()?;
        // sos is an input symbol only
        log_probs[self.model.sos as usize] = f32::NEG_INFINITY;
        Ok((log_probs, next))
    }
}
