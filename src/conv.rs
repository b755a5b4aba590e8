use candle_core::{Result, Tensor};
use candle_nn::{batch_norm, BatchNorm, BatchNormConfig, Init, ModuleT, VarBuilder};

use crate::{config::Seq2seqConfig, error::ModelError};

/// Frames left after a "same"-padded convolution with `kernel` and `stride`.
fn conv_output_len(len: usize, kernel: usize, stride: usize) -> usize {
    let padded = len + 2 * (kernel / 2);
    (padded + 1).saturating_sub(kernel).div_ceil(stride)
}

/// Keeps every `stride`-th index along `dim`.
fn decimate(xs: &Tensor, dim: usize, stride: usize) -> Result<Tensor> {
    if stride <= 1 {
        return Ok(xs.clone());
    }
    let keep = (0..xs.dim(dim)? as u32).step_by(stride).collect::<Vec<_>>();
    let keep = Tensor::from_vec(keep.clone(), keep.len(), xs.device())?;
    xs.contiguous()?.index_select(&keep, dim)
}

struct ConvLayer {
    /// `(out_channels, in_channels, kernel_t, kernel_f)`
    weight: Tensor,
    bias: Tensor,
    kernel: [usize; 2],
    stride: [usize; 2],
    pooling: Option<[usize; 2]>,
    batch_norm: Option<BatchNorm>,
}

impl ConvLayer {
    fn output_len(&self, len: usize) -> usize {
        let len = conv_output_len(len, self.kernel[0], self.stride[0]);
        match self.pooling {
            Some([pool_t, _]) => len / pool_t,
            None => len,
        }
    }

    /// xs: `(batch, channels, T, F)`
    fn forward_t(&self, xs: &Tensor, train: bool) -> Result<Tensor> {
        let [kt, kf] = self.kernel;
        let xs = xs
            .pad_with_zeros(2, kt / 2, kt / 2)?
            .pad_with_zeros(3, kf / 2, kf / 2)?;
        let out_channels = self.bias.dim(0)?;
        let xs = xs
            .conv2d(&self.weight, 0, 1, 1, 1)?
            .broadcast_add(&self.bias.reshape((1, out_channels, 1, 1))?)?;
        let mut xs = decimate(&decimate(&xs, 2, self.stride[0])?, 3, self.stride[1])?;
        if let Some(bn) = &self.batch_norm {
            xs = bn.forward_t(&xs, train)?;
        }
        let xs = xs.relu()?;
        match self.pooling {
            Some([pool_t, pool_f]) => xs.max_pool2d((pool_t, pool_f)),
            None => Ok(xs),
        }
    }
}

/// 2-D convolution front-end over `(time, freq)` with optional batch
/// normalization and max pooling. Used alone as a CNN encoder or in front of
/// the recurrent layers (CLDNN).
pub struct ConvFrontEnd {
    layers: Vec<ConvLayer>,
    input_channels: usize,
    output_dim: usize,
}

impl ConvFrontEnd {
    pub fn new(config: &Seq2seqConfig, vb: VarBuilder) -> Result<Self> {
        let input_channels = config.conv_input_channels;
        let mut channels = input_channels;
        let mut freq = config.stacked_input_size() / input_channels;
        let init = Init::Uniform {
            lo: -config.parameter_init,
            up: config.parameter_init,
        };

        let mut layers = Vec::with_capacity(config.conv_channels.len());
        for (i, &out_channels) in config.conv_channels.iter().enumerate() {
            let vb_l = vb.pp(format!("layers.{i}"));
            let kernel = config.conv_kernel_sizes.get(i).copied().unwrap_or([3, 3]);
            let stride = config.conv_strides.get(i).copied().unwrap_or([1, 1]);
            let pooling = match config.conv_poolings.get(i).map(Vec::as_slice) {
                Some(&[pool_t, pool_f]) if pool_t * pool_f > 1 => Some([pool_t, pool_f]),
                _ => None,
            };

            let weight = vb_l.get_with_hints(
                (out_channels, channels, kernel[0], kernel[1]),
                "weight",
                init,
            )?;
            let bias = vb_l.get_with_hints(out_channels, "bias", init)?;
            let batch_norm = if config.batch_norm {
                Some(batch_norm(out_channels, BatchNormConfig::default(), vb_l.pp("batch_norm"))?)
            } else {
                None
            };

            freq = conv_output_len(freq, kernel[1], stride[1]);
            if let Some([_, pool_f]) = pooling {
                freq /= pool_f;
            }
            if freq == 0 {
                return Err(ModelError::InvalidConfig(format!(
                    "conv layer {i} leaves no frequency bins"
                ))
                .into_candle());
            }

            layers.push(ConvLayer {
                weight,
                bias,
                kernel,
                stride,
                pooling,
                batch_norm,
            });
            channels = out_channels;
        }

        Ok(Self {
            layers,
            input_channels,
            output_dim: channels * freq,
        })
    }

    /// Feature width of each output frame.
    pub fn output_dim(&self) -> usize {
        self.output_dim
    }

    /// xs: `(batch, T, input)`. Returns `(batch, T', output_dim)` and the frame
    /// counts after striding and pooling, at least 1 each.
    pub fn forward_t(&self, xs: &Tensor, x_lens: &[usize], train: bool) -> Result<(Tensor, Vec<usize>)> {
        let (batch_size, max_len, dim) = xs.dims3()?;
        let mut xs = xs
            .reshape((batch_size, max_len, self.input_channels, dim / self.input_channels))?
            .transpose(1, 2)?
            .contiguous()?;
        let mut x_lens = x_lens.to_vec();
        for layer in &self.layers {
            xs = layer.forward_t(&xs, train)?;
            x_lens = x_lens.iter().map(|&len| layer.output_len(len)).collect();
        }

        let (batch_size, channels, max_len, freq) = xs.dims4()?;
        let xs = xs
            .transpose(1, 2)?
            .contiguous()?
            .reshape((batch_size, max_len, channels * freq))?;
        let x_lens = x_lens.into_iter().map(|len| len.clamp(1, max_len.max(1))).collect();
        Ok((xs, x_lens))
    }
}
