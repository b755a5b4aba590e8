use candle_core::{Device, IndexOp, Module, Result, Tensor, D};
use candle_nn::{ops::log_softmax, Linear, VarBuilder};

use crate::utils::{uniform_linear, NEG_INF};

/// Connectionist temporal classification branch on top of encoder outputs.
///
/// Labels `0..num_classes` map onto the same output ids, the blank is `num_classes`.
pub struct Ctc {
    output: Linear,
    blank: u32,
}

impl Ctc {
    pub fn new(enc_dim: usize, num_classes: usize, parameter_init: f64, vb: VarBuilder) -> Result<Self> {
        let output = uniform_linear(enc_dim, num_classes + 1, parameter_init, vb)?;
        Ok(Self {
            output,
            blank: num_classes as u32,
        })
    }

    pub fn blank(&self) -> u32 {
        self.blank
    }

    /// enc_out: `(batch, T, enc_dim)` -> log probabilities `(batch, T, num_classes + 1)`.
    pub fn log_probs(&self, enc_out: &Tensor) -> Result<Tensor> {
        log_softmax(&self.output.forward(enc_out)?, D::Minus1)
    }

    /// Negative log likelihood averaged over the batch.
    pub fn loss(&self, enc_out: &Tensor, x_lens: &[usize], labels: &[Vec<u32>]) -> Result<Tensor> {
        ctc_loss(&self.log_probs(enc_out)?, x_lens, labels, self.blank)
    }

    pub fn greedy_decode(&self, enc_out: &Tensor, x_lens: &[usize]) -> Result<Vec<Vec<u32>>> {
        let best = self.log_probs(enc_out)?.argmax(D::Minus1)?.to_vec2::<u32>()?;
        Ok(best
            .iter()
            .zip(x_lens)
            .map(|(path, &len)| collapse_path(&path[..len.min(path.len())], self.blank))
            .collect())
    }
}

/// Merges repeated ids and drops blanks.
pub fn collapse_path(path: &[u32], blank: u32) -> Vec<u32> {
    let mut out = Vec::new();
    let mut prev = None;
    for &id in path {
        if Some(id) != prev && id != blank {
            out.push(id);
        }
        prev = Some(id);
    }
    out
}

/// Minimum number of frames needed to emit `labels` (repeats need a blank in between).
fn min_frames(labels: &[u32]) -> usize {
    labels.len() + labels.windows(2).filter(|w| w[0] == w[1]).count()
}

fn log_sum_exp(xs: &Tensor, dim: usize) -> Result<Tensor> {
    let max = xs.max_keepdim(dim)?;
    let sum = xs.broadcast_sub(&max)?.exp()?.sum_keepdim(dim)?;
    (max + sum.log()?)?.squeeze(dim)
}

/// Shifts a `(S,)` vector `k` steps to the right, filling with log(0).
fn shift_right(alpha: &Tensor, k: usize, device: &Device) -> Result<Tensor> {
    let s = alpha.dim(0)?;
    let fill = Tensor::full(NEG_INF as f32, k.min(s), device)?.to_dtype(alpha.dtype())?;
    if k >= s {
        return Ok(fill);
    }
    Tensor::cat(&[&fill, &alpha.narrow(0, 0, s - k)?], 0)
}

/// CTC forward algorithm in log space.
///
/// log_probs: `(batch, T, V)` log softmax outputs. Utterances whose frames
/// cannot cover their labels are skipped.
pub fn ctc_loss(log_probs: &Tensor, x_lens: &[usize], labels: &[Vec<u32>], blank: u32) -> Result<Tensor> {
    let device = log_probs.device();
    let dtype = log_probs.dtype();
    let batch_size = labels.len();

    let mut total = Tensor::zeros((), dtype, device)?;
    for (b, (label, &t_len)) in labels.iter().zip(x_lens).enumerate() {
        if t_len == 0 || t_len < min_frames(label) {
            log::warn!(
                "utterance {b}: {t_len} frames cannot emit {} labels, skipped in CTC loss",
                label.len()
            );
            continue;
        }

        let mut ext = Vec::with_capacity(label.len() * 2 + 1);
        ext.push(blank);
        for &id in label {
            ext.push(id);
            ext.push(blank);
        }
        let s = ext.len();

        let skip = (0..s)
            .map(|i| {
                if i >= 2 && ext[i] != blank && ext[i] != ext[i - 2] {
                    0f32
                } else {
                    NEG_INF as f32
                }
            })
            .collect::<Vec<_>>();
        let skip = Tensor::from_vec(skip, s, device)?.to_dtype(dtype)?;
        let init = (0..s)
            .map(|i| if i < 2 { 0f32 } else { NEG_INF as f32 })
            .collect::<Vec<_>>();
        let init = Tensor::from_vec(init, s, device)?.to_dtype(dtype)?;

        // (T, S) emission scores of the extended label sequence
        let ext = Tensor::from_vec(ext, s, device)?;
        let emit = log_probs.i(b)?.narrow(0, 0, t_len)?.index_select(&ext, 1)?;

        let mut alpha = (emit.i(0)? + init)?;
        for t in 1..t_len {
            let stay = alpha.clone();
            let step = shift_right(&alpha, 1, device)?;
            let jump = (shift_right(&alpha, 2, device)? + &skip)?;
            let paths = Tensor::stack(&[&stay, &step, &jump], 0)?;
            alpha = (log_sum_exp(&paths, 0)? + emit.i(t)?)?;
        }

        let log_likelihood = if s == 1 {
            alpha.i(0)?
        } else {
            log_sum_exp(&alpha.narrow(0, s - 2, 2)?, 0)?
        };
        total = (total - log_likelihood)?;
    }

    total / batch_size.max(1) as f64
}

#[cfg(test)]
mod tests {
    use candle_core::{DType, Device};
    use candle_nn::{VarBuilder, VarMap};

    use super::*;

    #[test]
    fn test_collapse_path() {
        assert_eq!(collapse_path(&[3, 3, 0, 3, 1, 1, 3], 3), vec![0, 1]);
        assert_eq!(collapse_path(&[0, 0, 2, 0, 0], 2), vec![0, 0]);
        assert!(collapse_path(&[], 2).is_empty());
    }

    #[test]
    fn test_min_frames_counts_repeats() {
        assert_eq!(min_frames(&[1, 2, 3]), 3);
        assert_eq!(min_frames(&[1, 1, 2, 2]), 6);
    }

    #[test]
    fn test_uniform_distribution_likelihood() {
        // two classes + blank, uniform outputs: every path has prob (1/3)^T
        let device = Device::Cpu;
        let t = 3;
        let log_probs = Tensor::full((1f32 / 3.).ln(), (1, t, 3), &device).unwrap();

        // count the alignments of label [0] over 3 frames with blank 2
        let expected_paths = brute_force_paths(&[0], t, 3, 2);
        let expected = -((expected_paths as f32) * (1f32 / 3.).powi(t as i32)).ln();

        let loss = ctc_loss(&log_probs, &[t], &[vec![0]], 2)
            .unwrap()
            .to_vec0::<f32>()
            .unwrap();
        assert!((loss - expected).abs() < 1e-4, "{loss} vs {expected}");
    }

    fn brute_force_paths(label: &[u32], t: usize, vocab: u32, blank: u32) -> usize {
        let total = (vocab as usize).pow(t as u32);
        (0..total)
            .filter(|&code| {
                let mut idx = code;
                let path = (0..t)
                    .map(|_| {
                        let id = (idx % vocab as usize) as u32;
                        idx /= vocab as usize;
                        id
                    })
                    .collect::<Vec<_>>();
                collapse_path(&path, blank) == label
            })
            .count()
    }

    #[test]
    fn test_ctc_branch_loss_and_decode() {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let ctc = Ctc::new(8, 5, 0.1, vb).unwrap();
        assert_eq!(ctc.blank(), 5);

        let enc_out = Tensor::randn(0f32, 1., (2, 6, 8), &device).unwrap();
        let loss = ctc
            .loss(&enc_out, &[6, 4], &[vec![1, 2, 2], vec![4]])
            .unwrap()
            .to_vec0::<f32>()
            .unwrap();
        assert!(loss.is_finite() && loss > 0.);

        let hyps = ctc.greedy_decode(&enc_out, &[6, 4]).unwrap();
        assert_eq!(hyps.len(), 2);
        assert!(hyps.iter().flatten().all(|&id| id < 5));
    }

    #[test]
    fn test_infeasible_utterance_is_skipped() {
        let device = Device::Cpu;
        let log_probs = Tensor::full((0.5f32).ln(), (1, 1, 2), &device).unwrap();
        let loss = ctc_loss(&log_probs, &[1], &[vec![0, 0]], 1)
            .unwrap()
            .to_vec0::<f32>()
            .unwrap();
        assert_eq!(loss, 0.);
    }
}
