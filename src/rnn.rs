use candle_core::{DType, Module, Result, Tensor, D};
use candle_nn::{ops::sigmoid, Dropout, Linear, ModuleT, VarBuilder};

use crate::{
    config::{RnnType, Seq2seqConfig, SubsampleType},
    conv::ConvFrontEnd,
    utils::{sequence_mask, uniform_linear},
};

/// Hidden state of a recurrent cell. `c` is only set for LSTM cells.
#[derive(Debug, Clone)]
pub struct CellState {
    pub h: Tensor,
    pub c: Option<Tensor>,
}

impl CellState {
    /// Keeps `self` where `mask` (batch, 1) is zero and takes `next` elsewhere.
    fn blend(&self, next: CellState, mask: &Tensor) -> Result<CellState> {
        let pick = |new: &Tensor, old: &Tensor| old + (new - old)?.broadcast_mul(mask)?;
        let h = pick(&next.h, &self.h)?;
        let c = match (next.c, &self.c) {
            (Some(new), Some(old)) => Some(pick(&new, old)?),
            (new, _) => new,
        };
        Ok(CellState { h, c })
    }
}

/// LSTM cell with the PyTorch gate layout (input, forget, cell, output).
pub struct LstmCell {
    w_ih: Linear,
    w_hh: Linear,
    forget_bias: Option<Tensor>,
    hidden_size: usize,
}

impl LstmCell {
    pub fn new(
        input_size: usize,
        hidden_size: usize,
        parameter_init: f64,
        forget_bias_one: bool,
        vb: VarBuilder,
    ) -> Result<Self> {
        let w_ih = uniform_linear(input_size, 4 * hidden_size, parameter_init, vb.pp("w_ih"))?;
        let w_hh = uniform_linear(hidden_size, 4 * hidden_size, parameter_init, vb.pp("w_hh"))?;
        let forget_bias = if forget_bias_one {
            let offsets = (0..4 * hidden_size)
                .map(|i| if i / hidden_size == 1 { 1f32 } else { 0. })
                .collect::<Vec<_>>();
            Some(Tensor::from_vec(offsets, 4 * hidden_size, vb.device())?.to_dtype(vb.dtype())?)
        } else {
            None
        };
        Ok(Self {
            w_ih,
            w_hh,
            forget_bias,
            hidden_size,
        })
    }

    pub fn step(&self, xs: &Tensor, state: &CellState) -> Result<CellState> {
        let mut gates = (self.w_ih.forward(xs)? + self.w_hh.forward(&state.h)?)?;
        if let Some(bias) = &self.forget_bias {
            gates = gates.broadcast_add(bias)?;
        }
        let chunks = gates.chunk(4, D::Minus1)?;
        let in_gate = sigmoid(&chunks[0])?;
        let forget_gate = sigmoid(&chunks[1])?;
        let cell_gate = chunks[2].tanh()?;
        let out_gate = sigmoid(&chunks[3])?;

        let c_prev = match &state.c {
            Some(c) => c.clone(),
            None => state.h.zeros_like()?,
        };
        let c = ((forget_gate * c_prev)? + (in_gate * cell_gate)?)?;
        let h = (out_gate * c.tanh()?)?;
        Ok(CellState { h, c: Some(c) })
    }
}

/// GRU cell with the PyTorch gate layout (reset, update, new).
pub struct GruCell {
    w_ih: Linear,
    w_hh: Linear,
    hidden_size: usize,
}

impl GruCell {
    pub fn new(input_size: usize, hidden_size: usize, parameter_init: f64, vb: VarBuilder) -> Result<Self> {
        let w_ih = uniform_linear(input_size, 3 * hidden_size, parameter_init, vb.pp("w_ih"))?;
        let w_hh = uniform_linear(hidden_size, 3 * hidden_size, parameter_init, vb.pp("w_hh"))?;
        Ok(Self {
            w_ih,
            w_hh,
            hidden_size,
        })
    }

    pub fn step(&self, xs: &Tensor, state: &CellState) -> Result<CellState> {
        let gi = self.w_ih.forward(xs)?.chunk(3, D::Minus1)?;
        let gh = self.w_hh.forward(&state.h)?.chunk(3, D::Minus1)?;
        let reset = sigmoid(&(&gi[0] + &gh[0])?)?;
        let update = sigmoid(&(&gi[1] + &gh[1])?)?;
        let candidate = (&gi[2] + (reset * &gh[2])?)?.tanh()?;
        // h = (1 - z) * n + z * h_prev
        let h = (&candidate + (update * (&state.h - &candidate)?)?)?;
        Ok(CellState { h, c: None })
    }
}

pub enum RnnCell {
    Lstm(LstmCell),
    Gru(GruCell),
}

impl RnnCell {
    pub fn new(
        rnn_type: RnnType,
        input_size: usize,
        hidden_size: usize,
        parameter_init: f64,
        forget_bias_one: bool,
        vb: VarBuilder,
    ) -> Result<Self> {
        Ok(match rnn_type {
            RnnType::Lstm => Self::Lstm(LstmCell::new(
                input_size,
                hidden_size,
                parameter_init,
                forget_bias_one,
                vb,
            )?),
            RnnType::Gru => Self::Gru(GruCell::new(input_size, hidden_size, parameter_init, vb)?),
        })
    }

    pub fn hidden_size(&self) -> usize {
        match self {
            Self::Lstm(cell) => cell.hidden_size,
            Self::Gru(cell) => cell.hidden_size,
        }
    }

    pub fn zero_state(&self, batch_size: usize, dtype: DType, device: &candle_core::Device) -> Result<CellState> {
        let h = Tensor::zeros((batch_size, self.hidden_size()), dtype, device)?;
        let c = match self {
            Self::Lstm(_) => Some(h.clone()),
            Self::Gru(_) => None,
        };
        Ok(CellState { h, c })
    }

    pub fn step(&self, xs: &Tensor, state: &CellState) -> Result<CellState> {
        match self {
            Self::Lstm(cell) => cell.step(xs, state),
            Self::Gru(cell) => cell.step(xs, state),
        }
    }
}

/// A (bi)directional recurrent layer over padded sequences.
pub struct RecurrentLayer {
    fwd: RnnCell,
    bwd: Option<RnnCell>,
}

impl RecurrentLayer {
    pub fn new(
        rnn_type: RnnType,
        input_size: usize,
        hidden_size: usize,
        bidirectional: bool,
        parameter_init: f64,
        forget_bias_one: bool,
        vb: VarBuilder,
    ) -> Result<Self> {
        let cell = |name: &str| {
            RnnCell::new(
                rnn_type,
                input_size,
                hidden_size,
                parameter_init,
                forget_bias_one,
                vb.pp(name),
            )
        };
        let fwd = cell("fwd")?;
        let bwd = if bidirectional { Some(cell("bwd")?) } else { None };
        Ok(Self { fwd, bwd })
    }

    pub fn output_dim(&self) -> usize {
        self.fwd.hidden_size() * if self.bwd.is_some() { 2 } else { 1 }
    }

    /// Runs one direction. Padded frames keep the previous state and emit zeros,
    /// so the backward pass starts from a zero state at each utterance's last frame.
    fn run(cell: &RnnCell, xs: &Tensor, mask: &Tensor, reverse: bool) -> Result<(Tensor, Tensor)> {
        let (batch_size, max_len, _) = xs.dims3()?;
        let mut state = cell.zero_state(batch_size, xs.dtype(), xs.device())?;
        let mut outputs = vec![None; max_len];

        let order: Box<dyn Iterator<Item = usize>> = if reverse {
            Box::new((0..max_len).rev())
        } else {
            Box::new(0..max_len)
        };
        for t in order {
            let x_t = xs.narrow(1, t, 1)?.squeeze(1)?;
            let m_t = mask.narrow(1, t, 1)?; // (batch, 1)
            let next = cell.step(&x_t, &state)?;
            state = state.blend(next, &m_t)?;
            outputs[t] = Some(state.h.broadcast_mul(&m_t)?);
        }

        let outputs = outputs.into_iter().flatten().collect::<Vec<_>>();
        Ok((Tensor::stack(&outputs, 1)?, state.h))
    }

    /// xs: `(batch, T, input)`, mask: `(batch, T)` float. Returns the outputs
    /// `(batch, T, output_dim)` and the final hidden state `(batch, output_dim)`.
    pub fn forward(&self, xs: &Tensor, mask: &Tensor) -> Result<(Tensor, Tensor)> {
        let (out_fwd, final_fwd) = Self::run(&self.fwd, xs, mask, false)?;
        match &self.bwd {
            Some(bwd) => {
                let (out_bwd, final_bwd) = Self::run(bwd, xs, mask, true)?;
                Ok((
                    Tensor::cat(&[&out_fwd, &out_bwd], D::Minus1)?,
                    Tensor::cat(&[&final_fwd, &final_bwd], D::Minus1)?,
                ))
            }
            None => Ok((out_fwd, final_fwd)),
        }
    }
}

/// Output of [`RnnEncoder::forward`].
pub struct EncoderOutput {
    /// `(batch, T', output_dim)`
    pub xs: Tensor,
    /// Frame counts after subsampling.
    pub x_lens: Vec<usize>,
    /// Final hidden state of the last layer, `(batch, output_dim)`. A CNN-only
    /// encoder reports the mean over valid frames instead.
    pub final_state: Tensor,
}

struct EncoderLayer {
    rnn: RecurrentLayer,
    proj: Option<Linear>,
    subsample: Option<(SubsampleType, Option<Linear>)>,
}

/// Stacked recurrent encoder with optional projection, residual connections
/// and pyramidal subsampling, optionally behind a convolution front-end.
pub struct RnnEncoder {
    conv: Option<ConvFrontEnd>,
    layers: Vec<EncoderLayer>,
    dropout_input: Dropout,
    dropout: Dropout,
    residual: bool,
    dense_residual: bool,
    output_dim: usize,
}

impl RnnEncoder {
    pub fn new(config: &Seq2seqConfig, vb: VarBuilder) -> Result<Self> {
        let conv = if config.conv_channels.is_empty() {
            None
        } else {
            Some(ConvFrontEnd::new(config, vb.pp("conv"))?)
        };
        let mut input_dim = match &conv {
            Some(conv) => conv.output_dim(),
            None => config.stacked_input_size(),
        };
        let (rnn_type, num_layers) = match config.encoder_type.rnn_type() {
            Some(rnn_type) => (rnn_type, config.encoder_num_layers),
            None => (RnnType::Lstm, 0),
        };
        let mut layers = Vec::with_capacity(num_layers);

        for l in 0..num_layers {
            let vb_l = vb.pp(format!("layers.{l}"));
            let rnn = RecurrentLayer::new(
                rnn_type,
                input_dim,
                config.encoder_num_units,
                config.encoder_bidirectional,
                config.parameter_init,
                config.init_forget_gate_bias_with_one,
                vb_l.pp("rnn"),
            )?;
            let mut out_dim = rnn.output_dim();

            // projection between layers, not after the last one
            let proj = if config.encoder_num_proj > 0 && l + 1 < num_layers {
                let proj = uniform_linear(
                    out_dim,
                    config.encoder_num_proj,
                    config.parameter_init,
                    vb_l.pp("proj"),
                )?;
                out_dim = config.encoder_num_proj;
                Some(proj)
            } else {
                None
            };

            let subsample = if config.subsample_list.get(l).copied().unwrap_or(false) {
                let merge = match config.subsample_type {
                    SubsampleType::Concat => Some(uniform_linear(
                        out_dim * 2,
                        out_dim,
                        config.parameter_init,
                        vb_l.pp("concat"),
                    )?),
                    SubsampleType::Drop => None,
                };
                Some((config.subsample_type, merge))
            } else {
                None
            };

            layers.push(EncoderLayer {
                rnn,
                proj,
                subsample,
            });
            input_dim = out_dim;
        }

        Ok(Self {
            conv,
            layers,
            dropout_input: Dropout::new(config.dropout_input),
            dropout: Dropout::new(config.dropout_encoder),
            residual: config.encoder_residual,
            dense_residual: config.encoder_dense_residual,
            output_dim: input_dim,
        })
    }

    pub fn output_dim(&self) -> usize {
        self.output_dim
    }

    pub fn forward(&self, xs: &Tensor, x_lens: &[usize], train: bool) -> Result<EncoderOutput> {
        let xs = self.dropout_input.forward_t(xs, train)?;
        let (mut xs, mut x_lens) = match &self.conv {
            Some(conv) => conv.forward_t(&xs, x_lens, train)?,
            None => (xs, x_lens.to_vec()),
        };
        let mut final_state = None;
        // outputs of earlier layers for dense residual connections
        let mut history: Vec<Tensor> = Vec::new();

        for layer in &self.layers {
            let (_, max_len, _) = xs.dims3()?;
            let mask = sequence_mask(&x_lens, max_len, xs.device())?.to_dtype(xs.dtype())?;

            let (mut out, last) = layer.rnn.forward(&xs, &mask)?;
            final_state = Some(last);
            out = self.dropout.forward_t(&out, train)?;
            if let Some(proj) = &layer.proj {
                out = proj.forward(&out)?;
            }

            if out.dims() == xs.dims() {
                if self.dense_residual {
                    let dims = out.dims().to_vec();
                    for prev in history.iter().filter(|p| p.dims() == dims.as_slice()) {
                        out = (out + prev)?;
                    }
                    out = (out + &xs)?;
                } else if self.residual {
                    out = (out + &xs)?;
                }
            }

            if let Some((kind, merge)) = &layer.subsample {
                history.clear();
                out = subsample(&out, *kind, merge.as_ref())?;
                x_lens = x_lens
                    .iter()
                    .map(|&len| len.div_ceil(2))
                    .collect();
            } else {
                history.push(xs.clone());
            }
            xs = out;
        }

        let final_state = match final_state {
            Some(state) => state,
            None => masked_mean(&xs, &x_lens)?,
        };
        Ok(EncoderOutput {
            xs,
            x_lens,
            final_state,
        })
    }
}

/// Mean over the first `x_lens[b]` frames of each utterance, `(batch, dim)`.
fn masked_mean(xs: &Tensor, x_lens: &[usize]) -> Result<Tensor> {
    let (_, max_len, _) = xs.dims3()?;
    let mask = sequence_mask(x_lens, max_len, xs.device())?
        .to_dtype(xs.dtype())?
        .unsqueeze(2)?;
    let counts = mask.sum(1)?.maximum(1f64)?;
    xs.broadcast_mul(&mask)?.sum(1)?.broadcast_div(&counts)
}

/// Halves the time resolution to `ceil(T / 2)`. `Drop` keeps every other
/// frame, `Concat` stacks adjacent frame pairs (an odd tail is paired with a
/// zero frame) and projects them back to the original width.
fn subsample(xs: &Tensor, kind: SubsampleType, merge: Option<&Linear>) -> Result<Tensor> {
    let (batch_size, max_len, dim) = xs.dims3()?;
    match (kind, merge) {
        (SubsampleType::Drop, _) => {
            let keep = (0..max_len as u32).step_by(2).collect::<Vec<_>>();
            let keep = Tensor::from_vec(keep.clone(), keep.len(), xs.device())?;
            xs.contiguous()?.index_select(&keep, 1)
        }
        (SubsampleType::Concat, Some(merge)) => {
            let half = max_len.div_ceil(2);
            xs.pad_with_zeros(1, 0, half * 2 - max_len)?
                .contiguous()?
                .reshape((batch_size, half, dim * 2))?
                .apply(merge)?
                .tanh()
        }
        (SubsampleType::Concat, None) => candle_core::bail!("concat subsampling needs a projection"),
    }
}

#[cfg(test)]
mod tests {
    use candle_core::Device;
    use candle_nn::VarMap;

    use super::*;
    use crate::config::EncoderType;

    fn vb(varmap: &VarMap) -> VarBuilder<'_> {
        VarBuilder::from_varmap(varmap, DType::F32, &Device::Cpu)
    }

    #[test]
    fn test_lstm_forget_bias_offsets() {
        let varmap = VarMap::new();
        let cell = LstmCell::new(3, 2, 0.1, true, vb(&varmap)).unwrap();
        let bias = cell.forget_bias.as_ref().unwrap().to_vec1::<f32>().unwrap();
        assert_eq!(bias, vec![0., 0., 1., 1., 0., 0., 0., 0.]);
    }

    #[test]
    fn test_cells_keep_hidden_size() {
        let varmap = VarMap::new();
        let device = Device::Cpu;
        let xs = Tensor::randn(0f32, 1., (2, 3), &device).unwrap();
        for rnn_type in [RnnType::Lstm, RnnType::Gru] {
            let cell = RnnCell::new(rnn_type, 3, 5, 0.1, true, vb(&varmap).pp(rnn_type.as_str())).unwrap();
            let state = cell.zero_state(2, DType::F32, &device).unwrap();
            let next = cell.step(&xs, &state).unwrap();
            assert_eq!(next.h.dims2().unwrap(), (2, 5));
            assert_eq!(next.c.is_some(), rnn_type == RnnType::Lstm);
        }
    }

    #[test]
    fn test_padded_frames_emit_zeros_and_keep_state() {
        let varmap = VarMap::new();
        let device = Device::Cpu;
        let layer = RecurrentLayer::new(RnnType::Gru, 3, 4, true, 0.1, false, vb(&varmap)).unwrap();
        assert_eq!(layer.output_dim(), 8);

        let xs = Tensor::randn(0f32, 1., (2, 5, 3), &device).unwrap();
        let mask = sequence_mask(&[5, 2], 5, &device)
            .unwrap()
            .to_dtype(DType::F32)
            .unwrap();
        let (out, last) = layer.forward(&xs, &mask).unwrap();
        assert_eq!(out.dims3().unwrap(), (2, 5, 8));
        assert_eq!(last.dims2().unwrap(), (2, 8));

        let padded = out
            .narrow(0, 1, 1)
            .unwrap()
            .narrow(1, 2, 3)
            .unwrap()
            .abs()
            .unwrap()
            .sum_all()
            .unwrap()
            .to_vec0::<f32>()
            .unwrap();
        assert_eq!(padded, 0.);

        // the forward final state of the short utterance is its output at t = 1
        let at_last_frame = out.narrow(0, 1, 1).unwrap().narrow(1, 1, 1).unwrap();
        let at_last_frame = at_last_frame.narrow(2, 0, 4).unwrap().flatten_all().unwrap();
        let final_fwd = last.narrow(0, 1, 1).unwrap().narrow(1, 0, 4).unwrap().flatten_all().unwrap();
        assert_eq!(
            at_last_frame.to_vec1::<f32>().unwrap(),
            final_fwd.to_vec1::<f32>().unwrap()
        );
    }

    #[test]
    fn test_short_utterance_is_independent_of_padding() {
        let varmap = VarMap::new();
        let device = Device::Cpu;
        let layer = RecurrentLayer::new(RnnType::Lstm, 3, 4, true, 0.1, true, vb(&varmap)).unwrap();

        let short = Tensor::randn(0f32, 1., (1, 2, 3), &device).unwrap();
        let noise = Tensor::randn(0f32, 1., (1, 3, 3), &device).unwrap();
        let padded = Tensor::cat(&[&short, &noise], 1).unwrap();

        let mask_short = Tensor::ones((1, 2), DType::F32, &device).unwrap();
        let mask_padded = sequence_mask(&[2], 5, &device)
            .unwrap()
            .to_dtype(DType::F32)
            .unwrap();

        let (a, _) = layer.forward(&short, &mask_short).unwrap();
        let (b, _) = layer.forward(&padded, &mask_padded).unwrap();
        let b = b.narrow(1, 0, 2).unwrap();
        let diff = (a - b)
            .unwrap()
            .abs()
            .unwrap()
            .max_keepdim(2)
            .unwrap()
            .flatten_all()
            .unwrap()
            .to_vec1::<f32>()
            .unwrap();
        assert!(diff.iter().all(|d| *d < 1e-5));
    }

    fn encoder_config() -> Seq2seqConfig {
        Seq2seqConfig {
            input_size: 6,
            encoder_num_units: 4,
            encoder_num_layers: 2,
            dropout_input: 0.,
            dropout_encoder: 0.,
            ..Default::default()
        }
    }

    #[test]
    fn test_encoder_subsampling() {
        let device = Device::Cpu;
        for (kind, lens) in [
            (SubsampleType::Drop, vec![4, 3]),
            (SubsampleType::Concat, vec![4, 3]),
        ] {
            let varmap = VarMap::new();
            let config = Seq2seqConfig {
                subsample_list: vec![true, false],
                subsample_type: kind,
                ..encoder_config()
            };
            let encoder = RnnEncoder::new(&config, vb(&varmap)).unwrap();
            let xs = Tensor::randn(0f32, 1., (2, 7, 6), &device).unwrap();
            let out = encoder.forward(&xs, &[7, 5], false).unwrap();
            assert_eq!(out.x_lens, lens, "{kind}");
            assert_eq!(out.xs.dims3().unwrap().2, 8);
            assert_eq!(out.final_state.dims2().unwrap(), (2, 8));
        }
    }

    #[test]
    fn test_drop_subsampling_in_eval_mode() {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let config = Seq2seqConfig {
            subsample_list: vec![true, true],
            subsample_type: SubsampleType::Drop,
            ..encoder_config()
        };
        let encoder = RnnEncoder::new(&config, vb(&varmap)).unwrap();
        let xs = Tensor::randn(0f32, 1., (2, 8, 6), &device).unwrap();
        let out = encoder.forward(&xs, &[8, 5], false).unwrap();
        assert_eq!(out.xs.dims3().unwrap(), (2, 2, 8));
        assert_eq!(out.x_lens, vec![2, 2]);
    }

    #[test]
    fn test_concat_subsampling_keeps_single_frame() {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let config = Seq2seqConfig {
            subsample_list: vec![true, true],
            subsample_type: SubsampleType::Concat,
            ..encoder_config()
        };
        let encoder = RnnEncoder::new(&config, vb(&varmap)).unwrap();
        let xs = Tensor::randn(0f32, 1., (2, 5, 6), &device).unwrap();
        let out = encoder.forward(&xs, &[5, 1], false).unwrap();
        assert_eq!(out.x_lens, vec![2, 1]);
        assert_eq!(out.xs.dims3().unwrap(), (2, 2, 8));
    }

    #[test]
    fn test_dense_residual_sums_earlier_inputs() {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let config = Seq2seqConfig {
            input_size: 4,
            encoder_bidirectional: false,
            encoder_dense_residual: true,
            ..encoder_config()
        };
        let encoder = RnnEncoder::new(&config, vb(&varmap)).unwrap();
        let xs = Tensor::randn(0f32, 1., (1, 5, 4), &device).unwrap();
        let out = encoder.forward(&xs, &[5], false).unwrap();

        let mask = Tensor::ones((1, 5), DType::F32, &device).unwrap();
        let (r0, _) = encoder.layers[0].rnn.forward(&xs, &mask).unwrap();
        let h0 = (r0 + &xs).unwrap();
        let (r1, _) = encoder.layers[1].rnn.forward(&h0, &mask).unwrap();
        // layer 1 adds its own input and every earlier input
        let expected = ((r1 + &h0).unwrap() + &xs).unwrap();

        let diff = (out.xs - expected)
            .unwrap()
            .abs()
            .unwrap()
            .flatten_all()
            .unwrap()
            .max(0)
            .unwrap()
            .to_vec0::<f32>()
            .unwrap();
        assert!(diff < 1e-5, "{diff}");
    }

    #[test]
    fn test_cnn_encoder_reports_mean_state() {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let config = Seq2seqConfig {
            encoder_type: EncoderType::Cnn,
            conv_channels: vec![2],
            conv_poolings: vec![vec![2, 2]],
            batch_norm: true,
            ..encoder_config()
        };
        let encoder = RnnEncoder::new(&config, vb(&varmap)).unwrap();
        assert!(encoder.layers.is_empty());
        assert_eq!(encoder.output_dim(), 2 * 3);

        let xs = Tensor::randn(0f32, 1., (2, 8, 6), &device).unwrap();
        let out = encoder.forward(&xs, &[8, 4], false).unwrap();
        assert_eq!(out.xs.dims3().unwrap(), (2, 4, 6));
        assert_eq!(out.x_lens, vec![4, 2]);

        // mean over the two valid frames of the short utterance
        let short = out.xs.narrow(0, 1, 1).unwrap().narrow(1, 0, 2).unwrap();
        let expected = (short.sum(1).unwrap() / 2.).unwrap().flatten_all().unwrap();
        let state = out.final_state.narrow(0, 1, 1).unwrap().flatten_all().unwrap();
        let diff = (expected - state)
            .unwrap()
            .abs()
            .unwrap()
            .max(0)
            .unwrap()
            .to_vec0::<f32>()
            .unwrap();
        assert!(diff < 1e-5);
    }

    #[test]
    fn test_cldnn_encoder() {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let config = Seq2seqConfig {
            conv_channels: vec![2, 2],
            conv_poolings: vec![vec![2, 2], vec![]],
            subsample_list: vec![false, true],
            ..encoder_config()
        };
        let encoder = RnnEncoder::new(&config, vb(&varmap)).unwrap();
        let xs = Tensor::randn(0f32, 1., (2, 8, 6), &device).unwrap();
        let out = encoder.forward(&xs, &[8, 6], true).unwrap();
        assert_eq!(out.xs.dims3().unwrap(), (2, 2, 8));
        assert_eq!(out.x_lens, vec![2, 2]);
        assert_eq!(out.final_state.dims2().unwrap(), (2, 8));

        let data = varmap.data().lock().unwrap();
        assert!(data.contains_key("conv.layers.1.weight"));
        assert!(data.contains_key("layers.0.rnn.fwd.w_ih.weight"));
    }

    #[test]
    fn test_encoder_projection_and_residual() {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let config = Seq2seqConfig {
            encoder_num_layers: 3,
            encoder_bidirectional: false,
            encoder_num_proj: 4,
            encoder_residual: true,
            encoder_type: EncoderType::Gru,
            ..encoder_config()
        };
        let encoder = RnnEncoder::new(&config, vb(&varmap)).unwrap();
        assert_eq!(encoder.output_dim(), 4);
        let xs = Tensor::randn(0f32, 1., (1, 5, 6), &device).unwrap();
        let out = encoder.forward(&xs, &[5], true).unwrap();
        assert_eq!(out.xs.dims3().unwrap(), (1, 5, 4));

        let data = varmap.data().lock().unwrap();
        assert!(data.contains_key("layers.0.proj.weight"));
        assert!(data.contains_key("layers.1.proj.weight"));
        assert!(!data.contains_key("layers.2.proj.weight"));
    }
}
