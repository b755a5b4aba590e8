use anyhow::{ensure, Result};
use candle_core::{backprop::GradStore, DType, Tensor, Var};
use candle_nn::{
    optim::{AdamW, ParamsAdamW},
    Optimizer, VarBuilder, VarMap,
};
use rand::{rngs::StdRng, SeedableRng};
use rand_distr::{Distribution, Normal};

use crate::{
    config::{Config, LabelType},
    data::{self, generate_data},
    lr_controller::Controller,
    metrics::{compute_cer, compute_wer},
    model::build_model,
    utils::device,
};

/// Rescales the gradients of `vars` so that their global L2 norm is at most
/// `max_norm`. Returns the norm before clipping.
pub fn clip_grad_norm(vars: &[Var], grads: &mut GradStore, max_norm: f64) -> candle_core::Result<f64> {
    let mut total = 0f64;
    for var in vars {
        if let Some(grad) = grads.get(var.as_tensor()) {
            total += grad.sqr()?.sum_all()?.to_dtype(DType::F64)?.to_scalar::<f64>()?;
        }
    }
    let norm = total.sqrt();

    if max_norm > 0. && norm > max_norm {
        let scale = max_norm / (norm + 1e-6);
        for var in vars {
            if let Some(grad) = grads.get(var.as_tensor()) {
                let clipped = (grad * scale)?;
                grads.insert(var.as_tensor(), clipped);
            }
        }
    }
    Ok(norm)
}

/// Adds Gaussian noise with standard deviation `std` to every variable in place.
pub fn inject_weight_noise(vars: &[Var], std: f64, rng: &mut StdRng) -> candle_core::Result<()> {
    let normal = Normal::new(0f32, std as f32).map_err(candle_core::Error::wrap)?;
    for var in vars {
        let noise = (0..var.elem_count()).map(|_| normal.sample(rng)).collect::<Vec<_>>();
        let noise = Tensor::from_vec(noise, var.shape(), var.device())?.to_dtype(var.dtype())?;
        var.set(&(var.as_tensor() + noise)?)?;
    }
    Ok(())
}

/// Label error rate of one utterance: CER for characters, WER for words.
pub fn label_error_rate(label_type: LabelType, reference: &[u32], hypothesis: &[u32]) -> f64 {
    let reference = data::labels_to_text(label_type, reference);
    let hypothesis = data::labels_to_text(label_type, hypothesis);
    match label_type {
        LabelType::Char => compute_cer(
            &reference.replace('_', " "),
            &hypothesis.replace('_', " "),
            true,
        ),
        LabelType::Word => {
            let reference = reference.split('_').filter(|w| !w.is_empty()).collect::<Vec<_>>();
            let hypothesis = hypothesis.split('_').filter(|w| !w.is_empty()).collect::<Vec<_>>();
            compute_wer(&reference, &hypothesis, true)
        }
    }
}

/// Outcome of a [`check`] run.
#[derive(Debug, Clone)]
pub struct Report {
    pub steps: usize,
    pub first_loss: f32,
    pub last_loss: f32,
    /// Label error rate at the last evaluation, 1.0 if never evaluated.
    pub ler: f64,
    pub converged: bool,
    pub learning_rate: f64,
    /// Whether weight noise was switched on during the run.
    pub weight_noise: bool,
}

/// Overfits a model on one toy batch until its label error rate drops below
/// the convergence threshold or `max_step` is reached.
pub fn check(config: &Config) -> Result<Report> {
    let train = &config.train;
    let device = device(train.cpu)?;

    let num_classes = data::num_classes(train.label_type);
    ensure!(
        config.model.num_classes() == num_classes,
        "model predicts {} classes but {} labels have {num_classes}",
        config.model.num_classes(),
        train.label_type
    );

    let batch = generate_data(
        train.label_type,
        train.batch_size,
        config.model.num_stack(),
        config.model.splice(),
        train.seed,
        &device,
    )?;

    let varmap = VarMap::new();
    let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
    let model = build_model(&config.model, train.seed, vb)?;

    let vars = varmap.all_vars();
    let num_params = vars.iter().map(|v| v.elem_count()).sum::<usize>();
    log::info!("total parameters: {:.3} M", num_params as f64 / 1e6);

    let mut optimizer = AdamW::new(
        vars.clone(),
        ParamsAdamW {
            lr: train.lr,
            weight_decay: train.weight_decay,
            ..Default::default()
        },
    )?;
    let mut controller = Controller::new(
        train.lr,
        train.decay_start_epoch,
        train.decay_rate,
        train.decay_patient_epoch,
        true,
    );

    let mut learning_rate = train.lr;
    let mut first_loss = None;
    let mut last_loss = f32::NAN;
    let mut ler = 1.;
    let mut converged = false;
    let mut steps = 0;
    let mut weight_noise = false;
    let mut noise_rng = StdRng::seed_from_u64(train.seed.wrapping_add(1));

    for step in 0..train.max_step {
        if train.weight_noise_std > 0. && last_loss < train.weight_noise_start_loss {
            if !weight_noise {
                log::info!(
                    "loss {last_loss:.3} below {:.1}, injecting weight noise (std {})",
                    train.weight_noise_start_loss,
                    train.weight_noise_std
                );
                weight_noise = true;
            }
            inject_weight_noise(&vars, train.weight_noise_std, &mut noise_rng)?;
        }

        let loss = model.loss(&batch, step, true)?;
        let mut grads = loss.backward()?;
        clip_grad_norm(&vars, &mut grads, train.clip_grad_norm)?;
        optimizer.step(&grads)?;

        last_loss = loss.to_dtype(DType::F32)?.to_scalar::<f32>()?;
        first_loss.get_or_insert(last_loss);
        steps = step + 1;

        if train.decode_interval == 0 || steps % train.decode_interval != 0 {
            continue;
        }

        let dev_loss = model.loss(&batch, step, false)?.to_dtype(DType::F32)?.to_scalar::<f32>()?;
        let hyps = model.decode(&batch.xs, &batch.x_lens, train.beam_width, train.max_decode_len)?;
        let Some(hyp) = hyps.first() else {
            continue;
        };
        ler = label_error_rate(train.label_type, &batch.ys[0], hyp);

        log::info!(
            "step: {steps}, loss: {last_loss:.3}, dev loss: {dev_loss:.3}, ler: {ler:.3}, lr: {learning_rate:.5}"
        );
        log::info!("ref: {}", data::labels_to_text(train.label_type, &batch.ys[0]));
        log::info!("hyp: {}", data::labels_to_text(train.label_type, hyp));

        if model.ctc_loss_weight() >= 0.1 {
            if let Some(ctc_hyps) = model.decode_ctc(&batch.xs, &batch.x_lens)? {
                if let Some(ctc_hyp) = ctc_hyps.first() {
                    log::info!("hyp (ctc): {}", data::labels_to_text(train.label_type, ctc_hyp));
                }
            }
        }

        if ler < train.convergence_ler {
            log::info!("converged after {steps} steps");
            converged = true;
            break;
        }

        learning_rate = controller.decay_lr(&mut optimizer, learning_rate, step, ler);
    }

    Ok(Report {
        steps,
        first_loss: first_loss.unwrap_or(f32::NAN),
        last_loss,
        ler,
        converged,
        learning_rate,
        weight_noise,
    })
}
