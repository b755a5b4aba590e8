use candle_core::utils::{cuda_is_available, metal_is_available};
use candle_core::{DType, Device, Result, Tensor};
use candle_nn::{Init, Linear, VarBuilder};

/// Large finite negative used instead of -inf where a row may be fully masked.
pub const NEG_INF: f64 = -1e30;

pub fn device(cpu: bool) -> Result<Device> {
    if cpu {
        Ok(Device::Cpu)
    } else if cuda_is_available() {
        Ok(Device::new_cuda(0)?)
    } else if metal_is_available() {
        Ok(Device::new_metal(0)?)
    } else {
        #[cfg(all(target_os = "macos", target_arch = "aarch64"))]
        {
            log::info!("Running on CPU, to run on GPU(metal), build with `--features metal`");
        }
        #[cfg(not(all(target_os = "macos", target_arch = "aarch64")))]
        {
            log::info!("Running on CPU, to run on GPU, build with `--features cuda`");
        }
        Ok(Device::Cpu)
    }
}

/// (1, size, size) lower triangular u8 mask, 1 = may attend.
pub fn causal_mask(size: usize, device: &Device) -> Result<Tensor> {
    Tensor::tril2(size, DType::U8, device)?.unsqueeze(0)
}

/// (batch, max_len) u8 mask with 1 on the first `lens[b]` positions.
pub fn sequence_mask(lens: &[usize], max_len: usize, device: &Device) -> Result<Tensor> {
    let data = lens
        .iter()
        .flat_map(|&len| (0..max_len).map(move |t| u8::from(t < len)))
        .collect::<Vec<_>>();
    Tensor::from_vec(data, (lens.len(), max_len), device)
}

/// Mask letting every query attend to the valid keys only: (batch, q_len, k_len).
pub fn key_padding_mask(k_lens: &[usize], q_len: usize, k_len: usize, device: &Device) -> Result<Tensor> {
    sequence_mask(k_lens, k_len, device)?
        .unsqueeze(1)?
        .broadcast_as((k_lens.len(), q_len, k_len))?
        .contiguous()
}

/// Replaces the scores where `attn_mask` is zero with -inf.
pub fn masked_fill(attn_weights: &Tensor, attn_mask: &Tensor) -> Result<Tensor> {
    masked_fill_with(attn_weights, attn_mask, f64::NEG_INFINITY)
}

pub fn masked_fill_with(attn_weights: &Tensor, attn_mask: &Tensor, value: f64) -> Result<Tensor> {
    let attn_device = attn_weights.device();
    let attn_dtype = attn_weights.dtype();
    let attn_shape = attn_weights.shape();

    let attn_mask = attn_mask.broadcast_as(attn_shape)?;
    let mask_value = Tensor::new(value as f32, attn_device)?
        .broadcast_as(attn_shape)?
        .to_dtype(attn_dtype)?;
    attn_mask.where_cond(attn_weights, &mask_value)
}

/// Linear layer whose weight and bias are drawn from U(-init, init).
pub fn uniform_linear(in_dim: usize, out_dim: usize, init: f64, vb: VarBuilder) -> Result<Linear> {
    let hints = Init::Uniform { lo: -init, up: init };
    let weight = vb.get_with_hints((out_dim, in_dim), "weight", hints)?;
    let bias = vb.get_with_hints(out_dim, "bias", hints)?;
    Ok(Linear::new(weight, Some(bias)))
}

pub fn uniform_linear_no_bias(
    in_dim: usize,
    out_dim: usize,
    init: f64,
    vb: VarBuilder,
) -> Result<Linear> {
    let hints = Init::Uniform { lo: -init, up: init };
    let weight = vb.get_with_hints((out_dim, in_dim), "weight", hints)?;
    Ok(Linear::new(weight, None))
}
