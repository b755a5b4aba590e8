use std::{fmt, path::Path, str::FromStr};

use serde::{Deserialize, Serialize};

use crate::error::ModelError;

macro_rules! named_enum {
    ($(#[$meta:meta])* $name:ident { $($variant:ident => $label:literal),+ $(,)? }) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
        #[serde(rename_all = "snake_case")]
        pub enum $name {
            $($variant),+
        }

        impl $name {
            pub fn as_str(&self) -> &'static str {
                match self {
                    $(Self::$variant => $label),+
                }
            }
        }

        impl FromStr for $name {
            type Err = ModelError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($label => Ok(Self::$variant),)+
                    other => Err(ModelError::not_implemented(other)),
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }
    };
}

named_enum!(
    /// Recurrent cell used by the encoder and the attention decoder.
    RnnType { Lstm => "lstm", Gru => "gru" }
);

named_enum!(
    /// Encoder family. `Cnn` runs the convolutional front-end alone.
    EncoderType { Lstm => "lstm", Gru => "gru", Cnn => "cnn" }
);

impl EncoderType {
    /// Recurrent cell of the encoder layers, `None` for a pure CNN encoder.
    pub fn rnn_type(self) -> Option<RnnType> {
        match self {
            Self::Lstm => Some(RnnType::Lstm),
            Self::Gru => Some(RnnType::Gru),
            Self::Cnn => None,
        }
    }
}

named_enum!(
    /// Scoring function of the recurrent decoder's attention.
    AttentionType {
        Content => "content",
        Location => "location",
        DotProduct => "dot_product",
    }
);

named_enum!(SelfAttentionType { ScaledDot => "scaled_dot", Average => "average" });

named_enum!(PeType { None => "none", Add => "add", Concat => "concat" });

named_enum!(FfnNonlinear {
    Relu => "relu",
    Gelu => "gelu",
    GeluAccurate => "gelu_accurate",
    Glu => "glu",
});

named_enum!(SubsampleType { Drop => "drop", Concat => "concat" });

named_enum!(InitDecState { Zero => "zero", Mean => "mean", Final => "final" });

named_enum!(LabelType { Char => "char", Word => "word" });

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Seq2seqConfig {
    pub input_size: usize,
    pub encoder_type: EncoderType,
    pub encoder_bidirectional: bool,
    pub encoder_num_units: usize,
    pub encoder_num_proj: usize,
    pub encoder_num_layers: usize,
    pub attention_type: AttentionType,
    pub attention_dim: usize,
    pub decoder_type: RnnType,
    pub decoder_num_units: usize,
    pub decoder_num_layers: usize,
    pub embedding_dim: usize,
    pub dropout_input: f32,
    pub dropout_encoder: f32,
    pub dropout_decoder: f32,
    pub dropout_embedding: f32,
    pub num_classes: usize,
    pub parameter_init: f64,
    pub init_forget_gate_bias_with_one: bool,
    pub subsample_list: Vec<bool>,
    pub subsample_type: SubsampleType,
    pub init_dec_state: InitDecState,
    pub sharpening_factor: f64,
    pub logits_temperature: f64,
    pub sigmoid_smoothing: bool,
    pub ctc_loss_weight: f64,
    pub attention_conv_num_channels: usize,
    pub attention_conv_width: usize,
    pub num_stack: usize,
    pub splice: usize,
    pub scheduled_sampling_prob: f64,
    pub scheduled_sampling_ramp_max_step: usize,
    pub label_smoothing_prob: f64,
    pub encoder_residual: bool,
    pub encoder_dense_residual: bool,
    pub decoder_residual: bool,
    pub decoder_dense_residual: bool,
    /// Output channels of each convolution layer. Empty disables the front-end.
    pub conv_channels: Vec<usize>,
    /// `[time, freq]` kernel per layer.
    pub conv_kernel_sizes: Vec<[usize; 2]>,
    /// `[time, freq]` stride per layer.
    pub conv_strides: Vec<[usize; 2]>,
    /// `[time, freq]` max pooling per layer, empty for none.
    pub conv_poolings: Vec<Vec<usize>>,
    /// Channels the input features are split into before the first convolution.
    pub conv_input_channels: usize,
    pub batch_norm: bool,
}

impl Default for Seq2seqConfig {
    fn default() -> Self {
        Self {
            input_size: 40,
            encoder_type: EncoderType::Lstm,
            encoder_bidirectional: true,
            encoder_num_units: 256,
            encoder_num_proj: 0,
            encoder_num_layers: 2,
            attention_type: AttentionType::Location,
            attention_dim: 128,
            decoder_type: RnnType::Lstm,
            decoder_num_units: 256,
            decoder_num_layers: 2,
            embedding_dim: 32,
            dropout_input: 0.1,
            dropout_encoder: 0.1,
            dropout_decoder: 0.1,
            dropout_embedding: 0.1,
            num_classes: 27,
            parameter_init: 0.1,
            init_forget_gate_bias_with_one: true,
            subsample_list: vec![],
            subsample_type: SubsampleType::Concat,
            init_dec_state: InitDecState::Final,
            sharpening_factor: 1.,
            logits_temperature: 1.,
            sigmoid_smoothing: false,
            ctc_loss_weight: 0.,
            attention_conv_num_channels: 10,
            attention_conv_width: 201,
            num_stack: 1,
            splice: 1,
            scheduled_sampling_prob: 0.1,
            scheduled_sampling_ramp_max_step: 200,
            label_smoothing_prob: 0.,
            encoder_residual: false,
            encoder_dense_residual: false,
            decoder_residual: false,
            decoder_dense_residual: false,
            conv_channels: vec![],
            conv_kernel_sizes: vec![],
            conv_strides: vec![],
            conv_poolings: vec![],
            conv_input_channels: 1,
            batch_norm: false,
        }
    }
}

impl Seq2seqConfig {
    pub fn validate(&self) -> Result<(), ModelError> {
        if self.encoder_type == EncoderType::Cnn {
            if self.conv_channels.is_empty() {
                return Err(ModelError::InvalidConfig(
                    "cnn encoder needs conv_channels".to_string(),
                ));
            }
            if !self.subsample_list.is_empty() {
                return Err(ModelError::InvalidConfig(
                    "subsample_list applies to recurrent layers only".to_string(),
                ));
            }
        }
        if !self.conv_channels.is_empty() {
            let n = self.conv_channels.len();
            let lists = [
                self.conv_kernel_sizes.len(),
                self.conv_strides.len(),
                self.conv_poolings.len(),
            ];
            if lists.iter().any(|&len| len != 0 && len != n) {
                return Err(ModelError::InvalidConfig(format!(
                    "conv kernel/stride/pooling lists must be empty or have {n} entries"
                )));
            }
            if self.conv_poolings.iter().any(|p| !p.is_empty() && p.len() != 2) {
                return Err(ModelError::InvalidConfig(
                    "conv_poolings entries are [time, freq] or empty".to_string(),
                ));
            }
            let strides_ok = self.conv_strides.iter().flatten().all(|&s| s > 0);
            let kernels_ok = self.conv_kernel_sizes.iter().flatten().all(|&k| k > 0);
            if !strides_ok || !kernels_ok || self.conv_channels.contains(&0) {
                return Err(ModelError::InvalidConfig(
                    "conv kernels, strides and channels must be positive".to_string(),
                ));
            }
            if self.conv_input_channels == 0
                || self.stacked_input_size() % self.conv_input_channels != 0
            {
                return Err(ModelError::InvalidConfig(format!(
                    "{} input features cannot be split into {} channels",
                    self.stacked_input_size(),
                    self.conv_input_channels
                )));
            }
        }
        let recurrent = self.encoder_type.rnn_type().is_some();
        if (recurrent && self.encoder_num_layers == 0) || self.decoder_num_layers == 0 {
            return Err(ModelError::InvalidConfig(
                "encoder and decoder need at least one layer".to_string(),
            ));
        }
        if !self.subsample_list.is_empty() && self.subsample_list.len() != self.encoder_num_layers
        {
            return Err(ModelError::InvalidConfig(format!(
                "subsample_list has {} entries for {} encoder layers",
                self.subsample_list.len(),
                self.encoder_num_layers
            )));
        }
        if self.attention_type == AttentionType::Location && self.attention_conv_width % 2 == 0 {
            return Err(ModelError::InvalidConfig(
                "attention_conv_width must be odd".to_string(),
            ));
        }
        Ok(())
    }

    /// Feature dimension seen by the first encoder layer.
    pub fn stacked_input_size(&self) -> usize {
        self.input_size * self.splice * self.num_stack
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransformerConfig {
    pub input_size: usize,
    pub d_model: usize,
    pub d_ff: usize,
    pub n_heads: usize,
    pub enc_n_layers: usize,
    pub dec_n_layers: usize,
    pub attention_type: SelfAttentionType,
    pub pe_type: PeType,
    pub dropout: f32,
    pub dropout_att: f32,
    pub layer_norm_eps: f64,
    pub ffn_nonlinear: FfnNonlinear,
    pub num_classes: usize,
    pub ctc_loss_weight: f64,
    pub label_smoothing_prob: f64,
    pub src_tgt_attention: bool,
    pub max_len: usize,
    pub num_stack: usize,
    pub splice: usize,
}

impl Default for TransformerConfig {
    fn default() -> Self {
        Self {
            input_size: 40,
            d_model: 128,
            d_ff: 512,
            n_heads: 4,
            enc_n_layers: 2,
            dec_n_layers: 2,
            attention_type: SelfAttentionType::ScaledDot,
            pe_type: PeType::Add,
            dropout: 0.1,
            dropout_att: 0.1,
            layer_norm_eps: 1e-12,
            ffn_nonlinear: FfnNonlinear::Relu,
            num_classes: 27,
            ctc_loss_weight: 0.,
            label_smoothing_prob: 0.,
            src_tgt_attention: true,
            max_len: 5000,
            num_stack: 1,
            splice: 1,
        }
    }
}

impl TransformerConfig {
    pub fn validate(&self) -> Result<(), ModelError> {
        if self.d_model % self.n_heads != 0 {
            return Err(ModelError::InvalidConfig(format!(
                "d_model {} is not divisible by n_heads {}",
                self.d_model, self.n_heads
            )));
        }
        if self.d_model % 2 != 0 {
            return Err(ModelError::InvalidConfig(
                "d_model must be even for sinusoidal positions".to_string(),
            ));
        }
        if self.pe_type == PeType::Concat && self.d_model % 4 != 0 {
            return Err(ModelError::InvalidConfig(
                "concat positional encoding needs d_model divisible by 4".to_string(),
            ));
        }
        Ok(())
    }

    pub fn stacked_input_size(&self) -> usize {
        self.input_size * self.splice * self.num_stack
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "arch", rename_all = "snake_case")]
pub enum ModelConfig {
    Rnn(Seq2seqConfig),
    Transformer(TransformerConfig),
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self::Rnn(Seq2seqConfig::default())
    }
}

impl ModelConfig {
    pub fn num_classes(&self) -> usize {
        match self {
            Self::Rnn(c) => c.num_classes,
            Self::Transformer(c) => c.num_classes,
        }
    }

    pub fn num_stack(&self) -> usize {
        match self {
            Self::Rnn(c) => c.num_stack,
            Self::Transformer(c) => c.num_stack,
        }
    }

    pub fn splice(&self) -> usize {
        match self {
            Self::Rnn(c) => c.splice,
            Self::Transformer(c) => c.splice,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainConfig {
    pub label_type: LabelType,
    pub batch_size: usize,
    pub max_step: usize,
    pub lr: f64,
    pub weight_decay: f64,
    pub clip_grad_norm: f64,
    pub decode_interval: usize,
    pub beam_width: usize,
    pub max_decode_len: usize,
    pub convergence_ler: f64,
    pub decay_start_epoch: usize,
    pub decay_rate: f64,
    pub decay_patient_epoch: usize,
    pub seed: u64,
    pub cpu: bool,
    /// Standard deviation of the Gaussian noise added to every weight before
    /// each step, 0 disables it.
    pub weight_noise_std: f64,
    /// Noise is injected once the training loss drops below this value.
    pub weight_noise_start_loss: f32,
}

impl Default for TrainConfig {
    fn default() -> Self {
        Self {
            label_type: LabelType::Char,
            batch_size: 2,
            max_step: 1000,
            lr: 1e-3,
            weight_decay: 1e-8,
            clip_grad_norm: 5.,
            decode_interval: 10,
            beam_width: 2,
            max_decode_len: 60,
            convergence_ler: 0.1,
            decay_start_epoch: 20,
            decay_rate: 0.9,
            decay_patient_epoch: 10,
            seed: 1623,
            cpu: false,
            weight_noise_std: 0.,
            weight_noise_start_loss: 50.,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub train: TrainConfig,
    pub model: ModelConfig,
}

impl Config {
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ModelError> {
        let file = std::fs::File::open(path)?;
        let config = serde_json::from_reader(std::io::BufReader::new(file))?;
        Ok(config)
    }
}
