use candle_core::{DType, Device, IndexOp, Result, Tensor, D};
use candle_nn::{Dropout, ModuleT};

use crate::config::PeType;

/// Sinusoidal positional encoding.
///
/// The input is scaled by `sqrt(d_model)` before the table is added (`add`)
/// or appended (`concat`). With `none` only the scaling is applied.
pub struct PositionalEncoding {
    d_model: usize,
    pe_type: PeType,
    pe: Option<Tensor>,
    dropout: Dropout,
}

impl PositionalEncoding {
    pub fn new(
        d_model: usize,
        drop_p: f32,
        pe_type: PeType,
        max_len: usize,
        dtype: DType,
        device: &Device,
    ) -> Result<Self> {
        let pe = match pe_type {
            PeType::None => None,
            PeType::Add | PeType::Concat => Some(sinusoid_table(max_len, d_model, dtype, device)?),
        };

        Ok(Self {
            d_model,
            pe_type,
            pe,
            dropout: Dropout::new(drop_p),
        })
    }

    /// Width of the output features.
    pub fn output_dim(&self) -> usize {
        match self.pe_type {
            PeType::Concat => self.d_model * 2,
            PeType::None | PeType::Add => self.d_model,
        }
    }
}

/// (1, max_len, d_model) table, sin on even and cos on odd channels.
fn sinusoid_table(max_len: usize, d_model: usize, dtype: DType, device: &Device) -> Result<Tensor> {
    let half_d_model = d_model / 2;

    // 1 / 10_000^(2i / d_model) = exp{ -2i / d_model * ln[ 10_000 ] }
    let div_term = (Tensor::arange(0u32, half_d_model as u32, device)?.to_dtype(DType::F32)?
        * (-2. * (10_000f64.ln() / d_model as f64)))?
        .exp()?
        .reshape((1, half_d_model))?;

    let pos = Tensor::arange(0u32, max_len as u32, device)?
        .to_dtype(DType::F32)?
        .reshape((max_len, 1))?;

    let angles = pos.matmul(&div_term)?;

    // (max_len, half, 2) -> (max_len, d_model) interleaves sin and cos
    Tensor::stack(&[&angles.sin()?, &angles.cos()?], 2)?
        .reshape((max_len, d_model))?
        .to_dtype(dtype)?
        .unsqueeze(0)
}

impl ModuleT for PositionalEncoding {
    fn forward_t(&self, xs: &Tensor, train: bool) -> Result<Tensor> {
        // xs: (batch, seq_len, d_model)
        let xs = (xs * (self.d_model as f64).sqrt())?;

        let pe = match (&self.pe_type, &self.pe) {
            (PeType::None, _) | (_, None) => return Ok(xs),
            (_, Some(pe)) => pe,
        };

        let (batch_size, seq_len, _) = xs.dims3()?;
        if seq_len > pe.dim(1)? {
            candle_core::bail!(
                "sequence of length {seq_len} exceeds the positional table ({})",
                pe.dim(1)?
            );
        }
        let pe = pe.i((.., ..seq_len, ..))?;

        let xs = match self.pe_type {
            PeType::Add => xs.broadcast_add(&pe)?,
            _ => {
                let pe = pe.broadcast_as((batch_size, seq_len, self.d_model))?;
                Tensor::cat(&[&xs, &pe.contiguous()?], D::Minus1)?
            }
        };

        self.dropout.forward(&xs, train)
    }
}
