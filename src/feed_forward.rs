use candle_core::{Result, Tensor, D};
use candle_nn::{linear, ops::sigmoid, Dropout, Linear, Module, ModuleT, VarBuilder};

use crate::config::FfnNonlinear;

/// `Linear(d, 2d)` followed by a gated linear unit over the last dimension.
pub struct LinearGluBlock {
    fc: Linear,
}

impl LinearGluBlock {
    pub fn new(size: usize, vb: VarBuilder) -> Result<Self> {
        let fc = linear(size, size * 2, vb.pp("fc"))?;
        Ok(Self { fc })
    }
}

impl Module for LinearGluBlock {
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        let xs = self.fc.forward(xs)?;
        let halves = xs.chunk(2, D::Minus1)?;
        halves[0].mul(&sigmoid(&halves[1])?)
    }
}

enum Nonlinear {
    Relu,
    Gelu,
    GeluAccurate,
    Glu(LinearGluBlock),
}

impl Module for Nonlinear {
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        match self {
            Self::Relu => xs.relu(),
            Self::Gelu => xs.gelu_erf(),
            Self::GeluAccurate => xs.gelu(),
            Self::Glu(block) => block.forward(xs),
        }
    }
}

/// Position-wise fully connected network: `w_2(dropout(nonlinear(w_1(x))))`.
pub struct PositionwiseFeedForward {
    w_1: Linear,
    w_2: Linear,
    dropout: Dropout,
    nonlinear: Nonlinear,
}

impl PositionwiseFeedForward {
    pub fn new(
        d_in: usize,
        d_ff: usize,
        d_out: usize,
        dropout: f32,
        nonlinear: FfnNonlinear,
        vb: VarBuilder,
    ) -> Result<Self> {
        let w_1 = linear(d_in, d_ff, vb.pp("w_1"))?;
        let w_2 = linear(d_ff, d_out, vb.pp("w_2"))?;
        let nonlinear = match nonlinear {
            FfnNonlinear::Relu => Nonlinear::Relu,
            FfnNonlinear::Gelu => Nonlinear::Gelu,
            FfnNonlinear::GeluAccurate => Nonlinear::GeluAccurate,
            FfnNonlinear::Glu => Nonlinear::Glu(LinearGluBlock::new(d_ff, vb.pp("glu"))?),
        };

        Ok(Self {
            w_1,
            w_2,
            dropout: Dropout::new(dropout),
            nonlinear,
        })
    }
}

impl ModuleT for PositionwiseFeedForward {
    fn forward_t(&self, xs: &Tensor, train: bool) -> Result<Tensor> {
        xs.apply(&self.w_1)?
            .apply(&self.nonlinear)?
            .apply_t(&self.dropout, train)?
            .apply(&self.w_2)
    }
}

#[cfg(test)]
mod tests {
    use candle_core::{DType, Device};
    use candle_nn::VarMap;

    use super::*;

    fn build(nonlinear: FfnNonlinear) -> (VarMap, PositionwiseFeedForward) {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let ffn = PositionwiseFeedForward::new(8, 32, 6, 0.1, nonlinear, vb).unwrap();
        (varmap, ffn)
    }

    #[test]
    fn test_every_nonlinearity_keeps_positions() {
        let xs = Tensor::randn(0f32, 1., (2, 5, 8), &Device::Cpu).unwrap();
        for nonlinear in [
            FfnNonlinear::Relu,
            FfnNonlinear::Gelu,
            FfnNonlinear::GeluAccurate,
            FfnNonlinear::Glu,
        ] {
            let (_varmap, ffn) = build(nonlinear);
            let ys = ffn.forward_t(&xs, true).unwrap();
            assert_eq!(ys.dims3().unwrap(), (2, 5, 6), "{nonlinear}");
        }
    }

    #[test]
    fn test_glu_adds_gate_parameters() {
        let (varmap, _) = build(FfnNonlinear::Glu);
        let data = varmap.data().lock().unwrap();
        assert_eq!(data["glu.fc.weight"].dims(), &[64, 32]);
    }

    #[test]
    fn test_eval_is_deterministic() {
        let (_varmap, ffn) = build(FfnNonlinear::Relu);
        let xs = Tensor::randn(0f32, 1., (1, 3, 8), &Device::Cpu).unwrap();
        let a = ffn.forward_t(&xs, false).unwrap().to_vec3::<f32>().unwrap();
        let b = ffn.forward_t(&xs, false).unwrap().to_vec3::<f32>().unwrap();
        assert_eq!(a, b);
    }
}
