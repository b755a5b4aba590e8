use candle_core::{Result, Tensor, D};
use candle_nn::{Init, Module, VarBuilder};

/// Layer normalization over the last dimension with a learnable gain and bias.
#[derive(Debug, Clone)]
pub struct LayerNormalization {
    eps: f64,
    gamma: Tensor,
    beta: Tensor,
}

impl LayerNormalization {
    pub fn new(features: usize, eps: f64, vb: VarBuilder) -> Result<Self> {
        let gamma = vb.get_with_hints(features, "weight", Init::Const(1.))?;
        let beta = vb.get_with_hints(features, "bias", Init::Const(0.))?;
        Ok(Self { eps, gamma, beta })
    }
}

impl Module for LayerNormalization {
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        let mean = xs.mean_keepdim(D::Minus1)?;
        let centered = xs.broadcast_sub(&mean)?;
        let var = centered.sqr()?.mean_keepdim(D::Minus1)?;
        centered
            .broadcast_div(&(var + self.eps)?.sqrt()?)?
            .broadcast_mul(&self.gamma)?
            .broadcast_add(&self.beta)
    }
}

#[cfg(test)]
mod tests {
    use candle_core::{test_utils::to_vec3_round, DType, Device};
    use candle_nn::VarMap;

    use super::*;

    #[test]
    fn test_layer_norm() {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let layer = LayerNormalization::new(3, 1e-5, vb).unwrap();
        let xs = Tensor::new(
            &[[[1f32, 2., 3.], [4., 5., 6.], [9., 8., 7.]]],
            &Device::Cpu,
        )
        .unwrap();
        let ys = layer.forward(&xs).unwrap();
        assert_eq!(
            to_vec3_round(&ys, 4).unwrap(),
            &[[
                [-1.2247, 0.0, 1.2247],
                [-1.2247, 0.0, 1.2247],
                [1.2247, 0.0, -1.2247]
            ]]
        );
    }

    #[test]
    fn test_layer_norm_registers_parameters() {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        LayerNormalization::new(8, 1e-12, vb.pp("norm1")).unwrap();
        let data = varmap.data().lock().unwrap();
        assert!(data.contains_key("norm1.weight"));
        assert!(data.contains_key("norm1.bias"));
    }
}
