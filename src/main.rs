pub mod attention;
pub mod beam_search;
pub mod config;
pub mod conv;
pub mod ctc;
pub mod data;
pub mod decoder;
pub mod embeddings;
pub mod encoder;
pub mod error;
pub mod feed_forward;
pub mod layer_norm;
pub mod lr_controller;
pub mod metrics;
pub mod model;
pub mod multi_head_attention;
pub mod residual_connection;
pub mod rnn;
pub mod seq2seq;
pub mod train;
pub mod transformer;
pub mod utils;

use anyhow::Result;
use config::{
    AttentionType, Config, EncoderType, InitDecState, LabelType, ModelConfig, PeType, RnnType,
    Seq2seqConfig, SubsampleType, TrainConfig, TransformerConfig,
};
use train::check;

/// Small model configurations exercised when no config file is given.
fn builtin_configs() -> Vec<(&'static str, Config)> {
    let rnn = |label_type: LabelType, model: Seq2seqConfig| Config {
        train: TrainConfig {
            label_type,
            weight_noise_std: 1e-9,
            ..Default::default()
        },
        model: ModelConfig::Rnn(Seq2seqConfig {
            num_classes: data::num_classes(label_type),
            ..model
        }),
    };
    let transformer = |label_type: LabelType, model: TransformerConfig| Config {
        train: TrainConfig {
            label_type,
            lr: 5e-4,
            ..Default::default()
        },
        model: ModelConfig::Transformer(TransformerConfig {
            num_classes: data::num_classes(label_type),
            ..model
        }),
    };

    // two 3x3 convolutions, each followed by 2x2 max pooling
    let vgg = Seq2seqConfig {
        conv_channels: vec![32, 32],
        conv_kernel_sizes: vec![[3, 3], [3, 3]],
        conv_strides: vec![[1, 1], [1, 1]],
        conv_poolings: vec![vec![2, 2], vec![2, 2]],
        ..Default::default()
    };

    vec![
        ("lstm, location attention", rnn(LabelType::Char, Seq2seqConfig::default())),
        (
            "gru, content attention, word labels",
            rnn(
                LabelType::Word,
                Seq2seqConfig {
                    encoder_type: EncoderType::Gru,
                    decoder_type: RnnType::Gru,
                    attention_type: AttentionType::Content,
                    ..Default::default()
                },
            ),
        ),
        (
            "dot product attention, mean init",
            rnn(
                LabelType::Char,
                Seq2seqConfig {
                    attention_type: AttentionType::DotProduct,
                    init_dec_state: InitDecState::Mean,
                    ..Default::default()
                },
            ),
        ),
        (
            "pyramidal encoder, ctc",
            rnn(
                LabelType::Char,
                Seq2seqConfig {
                    subsample_list: vec![true, false],
                    subsample_type: SubsampleType::Drop,
                    ctc_loss_weight: 0.2,
                    ..Default::default()
                },
            ),
        ),
        (
            "stacked frames, projection, residual",
            rnn(
                LabelType::Char,
                Seq2seqConfig {
                    num_stack: 2,
                    splice: 3,
                    encoder_num_layers: 3,
                    encoder_num_proj: 256,
                    encoder_residual: true,
                    decoder_residual: true,
                    label_smoothing_prob: 0.1,
                    ..Default::default()
                },
            ),
        ),
        (
            "dense residual encoder and decoder",
            rnn(
                LabelType::Char,
                Seq2seqConfig {
                    encoder_num_layers: 3,
                    encoder_num_proj: 256,
                    encoder_dense_residual: true,
                    decoder_dense_residual: true,
                    ..Default::default()
                },
            ),
        ),
        (
            "cnn encoder, batch norm",
            rnn(
                LabelType::Char,
                Seq2seqConfig {
                    encoder_type: EncoderType::Cnn,
                    batch_norm: true,
                    ..vgg.clone()
                },
            ),
        ),
        ("cldnn", rnn(LabelType::Char, vgg.clone())),
        (
            "cldnn, batch norm",
            rnn(
                LabelType::Char,
                Seq2seqConfig {
                    batch_norm: true,
                    ..vgg
                },
            ),
        ),
        ("transformer", transformer(LabelType::Char, TransformerConfig::default())),
        (
            "transformer, concat positions, ctc, word labels",
            transformer(
                LabelType::Word,
                TransformerConfig {
                    pe_type: PeType::Concat,
                    ctc_loss_weight: 0.3,
                    label_smoothing_prob: 0.1,
                    ..Default::default()
                },
            ),
        ),
    ]
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let configs = match std::env::args().nth(1) {
        Some(path) => vec![("config file", Config::from_file(&path)?)],
        None => builtin_configs(),
    };

    let mut failures = 0;
    for (name, config) in configs {
        log::info!("========== {name} ==========");
        let report = check(&config)?;
        if report.converged {
            log::info!("{name}: converged in {} steps", report.steps);
        } else {
            log::warn!("{name}: ler {:.3} after {} steps", report.ler, report.steps);
            failures += 1;
        }
    }

    if failures > 0 {
        anyhow::bail!("{failures} configuration(s) did not converge");
    }
    Ok(())
}
