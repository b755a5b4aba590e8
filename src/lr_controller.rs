use candle_nn::Optimizer;

/// Decays the learning rate when a validation metric stops improving.
#[derive(Debug, Clone)]
pub struct Controller {
    pub learning_rate_init: f64,
    decay_start_epoch: usize,
    decay_rate: f64,
    decay_patient_epoch: usize,
    lower_better: bool,
    best_value: f64,
    not_improved_epoch: usize,
}

impl Controller {
    pub fn new(
        learning_rate_init: f64,
        decay_start_epoch: usize,
        decay_rate: f64,
        decay_patient_epoch: usize,
        lower_better: bool,
    ) -> Self {
        Self {
            learning_rate_init,
            decay_start_epoch,
            decay_rate,
            decay_patient_epoch,
            lower_better,
            best_value: f64::INFINITY,
            not_improved_epoch: 0,
        }
    }

    /// Returns the learning rate to use from now on and pushes it into `optimizer`.
    pub fn decay_lr<O: Optimizer>(
        &mut self,
        optimizer: &mut O,
        learning_rate: f64,
        epoch: usize,
        value: f64,
    ) -> f64 {
        let value = if self.lower_better { value } else { -value };

        if epoch < self.decay_start_epoch {
            self.best_value = self.best_value.min(value);
            return learning_rate;
        }

        if value < self.best_value {
            self.best_value = value;
            self.not_improved_epoch = 0;
            learning_rate
        } else if self.not_improved_epoch < self.decay_patient_epoch {
            self.not_improved_epoch += 1;
            learning_rate
        } else {
            let learning_rate = learning_rate * self.decay_rate;
            self.not_improved_epoch = 0;
            optimizer.set_learning_rate(learning_rate);
            log::debug!("learning rate decayed to {learning_rate:.6}");
            learning_rate
        }
    }
}
