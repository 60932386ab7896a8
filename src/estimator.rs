//! Train / predict entry points around a [`Transformer`].
//!
//! Each call builds the forward pass twice over the same parameters: the
//! first pass feeds the loss (or is discarded when predicting), the second
//! runs with dropout off. Both read the weights before the optimizer writes
//! them, so the passes never see different parameter values.

use tch::{nn, nn::OptimizerConfig, Device, Tensor};
use tracing::{debug, info};

use crate::config::{ModelArgs, Params};
use crate::data::Features;
use crate::error::Result;
use crate::generation::greedy_decode;
use crate::model::Transformer;
use crate::training::{label_smoothing_sequence_loss, padding_weights, sequence_loss, LearningRate};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Train,
    Predict,
}

/// Values reported by one optimizer step.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TrainOutput {
    pub loss: f64,
    pub lr: f64,
    /// Global step after the update.
    pub step: i64,
}

#[derive(Debug)]
pub enum ModelOutput {
    Train(TrainOutput),
    /// Greedy ids, `[batch, time]`.
    Predict { ids: Tensor },
}

/// Owns the parameter store, the model and its Adam optimizer.
pub struct Estimator {
    vs: nn::VarStore,
    model: Transformer,
    optimizer: nn::Optimizer,
    schedule: LearningRate,
    global_step: i64,
}

impl Estimator {
    pub fn new(device: Device, args: &ModelArgs, params: &Params) -> Result<Self> {
        let vs = nn::VarStore::new(device);
        let model = Transformer::new(&vs.root(), args, params)?;
        let schedule = LearningRate::from_args(args);
        let optimizer = nn::Adam::default().build(&vs, schedule.at(1))?;

        debug!(
            variables = vs.variables().len(),
            schedule = ?schedule,
            "estimator ready"
        );
        Ok(Self { vs, model, optimizer, schedule, global_step: 0 })
    }

    pub fn model(&self) -> &Transformer {
        &self.model
    }

    pub fn var_store(&self) -> &nn::VarStore {
        &self.vs
    }

    pub fn global_step(&self) -> i64 {
        self.global_step
    }

    /// Runs `features` through the model in the given mode.
    pub fn model_fn(&mut self, mode: Mode, features: &Features) -> Result<ModelOutput> {
        match mode {
            Mode::Train => self.train_step(features).map(ModelOutput::Train),
            Mode::Predict => self.predict(features).map(|ids| ModelOutput::Predict { ids }),
        }
    }

    fn loss(&self, logits: &Tensor, targets: &Tensor) -> Tensor {
        let args = self.model.args();
        let weights = padding_weights(targets);
        if args.label_smoothing {
            label_smoothing_sequence_loss(
                logits,
                targets,
                &weights,
                self.model.params().target_vocab_size,
                args.smoothing,
            )
        } else {
            sequence_loss(logits, targets, &weights)
        }
    }

    /// One optimizer step on `features`.
    pub fn train_step(&mut self, features: &Features) -> Result<TrainOutput> {
        let out = self.model.forward(&features.source, &features.target, true)?;
        // Same parameters, dropout off; only read, never differentiated.
        tch::no_grad(|| self.model.forward(&features.source, &features.target, false))?;

        let loss = self.loss(&out.logits, &features.target);
        let loss_value = loss.double_value(&[]);

        // The step is counted from 1 so the warmup rate is never zero.
        let lr = self.schedule.at(self.global_step + 1);
        self.optimizer.set_lr(lr);
        self.optimizer.backward_step(&loss);
        self.global_step += 1;

        let every = self.model.args().log_every_n_iter;
        if every > 0 && self.global_step % every == 0 {
            info!(step = self.global_step, lr, loss = loss_value, "train");
        }

        Ok(TrainOutput { loss: loss_value, lr, step: self.global_step })
    }

    /// Greedy ids for `features` under teacher forcing, `[batch, time]`.
    pub fn predict(&self, features: &Features) -> Result<Tensor> {
        tch::no_grad(|| -> Result<Tensor> {
            self.model.forward(&features.source, &features.target, false)?;
            let out = self.model.forward(&features.source, &features.target, false)?;
            Ok(out.ids)
        })
    }

    /// Loss on `features` with dropout off and no update.
    pub fn evaluate_loss(&self, features: &Features) -> Result<f64> {
        tch::no_grad(|| -> Result<f64> {
            let out = self.model.forward(&features.source, &features.target, false)?;
            Ok(self.loss(&out.logits, &features.target).double_value(&[]))
        })
    }

    /// Autoregressive greedy decoding of `source` for `max_len` positions.
    pub fn greedy_decode(&self, source: &Tensor, max_len: i64) -> Result<Tensor> {
        greedy_decode(&self.model, source, max_len)
    }
}
