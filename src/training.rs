//! Training objective and learning-rate schedule.

use tch::{Kind, Tensor};

use crate::config::ModelArgs;

/// Rate used when no warmup is configured.
pub const DEFAULT_LEARNING_RATE: f64 = 1e-4;

/// `1.0` for real tokens, `0.0` for padding.
pub fn padding_weights(targets: &Tensor) -> Tensor {
    targets.ne(0).to_kind(Kind::Float)
}

fn weighted_mean(xent: &Tensor, weights: &Tensor) -> Tensor {
    (xent * weights).sum(Kind::Float) / (weights.sum(Kind::Float) + 1e-12)
}

/// Token-level cross entropy of `logits` (`[batch, time, vocab]`) against
/// `targets` (`[batch, time]`), averaged over the non-zero `weights`.
pub fn sequence_loss(logits: &Tensor, targets: &Tensor, weights: &Tensor) -> Tensor {
    let log_probs = logits.log_softmax(-1, Kind::Float);
    let xent = -log_probs
        .gather(-1, &targets.to_kind(Kind::Int64).unsqueeze(-1), false)
        .squeeze_dim(-1);
    weighted_mean(&xent, weights)
}

/// One-hot targets softened by `smoothing`: the true class keeps
/// `1 - smoothing`, the other `depth - 1` classes share the rest evenly.
pub fn smoothed_targets(targets: &Tensor, depth: i64, smoothing: f64) -> Tensor {
    let confidence = 1.0 - smoothing;
    let low_confidence = if depth > 1 { smoothing / (depth - 1) as f64 } else { 0.0 };
    targets.to_kind(Kind::Int64).one_hot(depth).to_kind(Kind::Float) * (confidence - low_confidence)
        + low_confidence
}

/// Cross entropy against [`smoothed_targets`], shifted by the entropy of the
/// smoothed distribution so that a perfect prediction scores zero.
pub fn label_smoothing_sequence_loss(
    logits: &Tensor,
    targets: &Tensor,
    weights: &Tensor,
    depth: i64,
    smoothing: f64,
) -> Tensor {
    let soft_targets = smoothed_targets(targets, depth, smoothing);
    let xent = -(soft_targets * logits.log_softmax(-1, Kind::Float)).sum_dim_intlist(
        [-1i64].as_slice(),
        false,
        Kind::Float,
    );

    let confidence = 1.0 - smoothing;
    let low_confidence = if depth > 1 { smoothing / (depth - 1) as f64 } else { 0.0 };
    let mut entropy = -confidence * confidence.ln();
    if low_confidence > 0.0 {
        entropy -= (depth - 1) as f64 * low_confidence * low_confidence.ln();
    }

    weighted_mean(&(xent - entropy), weights)
}

/// Learning rate as a function of the 1-based step number.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum LearningRate {
    /// `hidden_units^-0.5 * min(step^-0.5, step * warmup_steps^-1.5)`
    Warmup { hidden_units: i64, warmup_steps: i64 },
    Constant(f64),
}

impl LearningRate {
    pub fn from_args(args: &ModelArgs) -> Self {
        if args.warmup_steps > 0 {
            LearningRate::Warmup { hidden_units: args.hidden_units, warmup_steps: args.warmup_steps }
        } else {
            LearningRate::Constant(DEFAULT_LEARNING_RATE)
        }
    }

    /// Rate for `step`; steps below 1 are treated as 1.
    pub fn at(&self, step: i64) -> f64 {
        match *self {
            LearningRate::Warmup { hidden_units, warmup_steps } => {
                let step = step.max(1) as f64;
                let warmup = (warmup_steps as f64).powf(-1.5);
                (hidden_units as f64).powf(-0.5) * step.powf(-0.5).min(step * warmup)
            }
            LearningRate::Constant(lr) => lr,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tch::Device;

    fn targets() -> Tensor {
        Tensor::from_slice(&[1i64, 2, 3, 0, 4, 0]).view([2, 3])
    }

    #[test]
    fn test_padding_weights() {
        let weights = padding_weights(&targets());
        assert_eq!(Vec::<f32>::try_from(&weights.view([-1])).unwrap(), vec![1., 1., 1., 0., 1., 0.]);
    }

    #[test]
    fn test_uniform_logits_give_log_vocab() {
        let logits = Tensor::zeros([2, 3, 5], (Kind::Float, Device::Cpu));
        let loss = sequence_loss(&logits, &targets(), &padding_weights(&targets()));
        assert!((loss.double_value(&[]) - 5f64.ln()).abs() < 1e-5);
    }

    #[test]
    fn test_padding_positions_do_not_count() {
        tch::manual_seed(0);
        let logits = Tensor::randn([2, 3, 5], (Kind::Float, Device::Cpu));
        let weights = padding_weights(&targets());
        let loss = sequence_loss(&logits, &targets(), &weights).double_value(&[]);

        // Overwrite the logits of the two padding positions.
        let changed = logits.copy();
        let _ = changed.select(0, 1).select(0, 0).fill_(100.0);
        let _ = changed.select(0, 1).select(0, 2).fill_(-100.0);
        let other = sequence_loss(&changed, &targets(), &weights).double_value(&[]);
        assert!((loss - other).abs() < 1e-6);
    }

    #[test]
    fn test_smoothed_targets_sum_to_one() {
        let depth = 6;
        let mut previous = f64::INFINITY;
        for smoothing in [0.0, 0.1, 0.2, 0.5] {
            let soft = smoothed_targets(&targets(), depth, smoothing);
            assert_eq!(soft.size(), vec![2, 3, depth]);
            let sums = soft.sum_dim_intlist([-1i64].as_slice(), false, Kind::Float);
            for value in Vec::<f32>::try_from(&sums.view([-1])).unwrap() {
                assert!((value as f64 - 1.0).abs() < 1e-6);
            }
            let true_class = soft.double_value(&[0, 0, 1]);
            assert!((true_class - (1.0 - smoothing)).abs() < 1e-6);
            assert!(true_class < previous);
            previous = true_class;
        }
    }

    #[test]
    fn test_label_smoothing_without_smoothing_matches_plain_loss() {
        tch::manual_seed(1);
        let logits = Tensor::randn([2, 3, 5], (Kind::Float, Device::Cpu));
        let weights = padding_weights(&targets());
        let plain = sequence_loss(&logits, &targets(), &weights).double_value(&[]);
        let smoothed = label_smoothing_sequence_loss(&logits, &targets(), &weights, 5, 0.0).double_value(&[]);
        assert!((plain - smoothed).abs() < 1e-5);
    }

    #[test]
    fn test_label_smoothing_perfect_prediction_is_zero() {
        let weights = padding_weights(&targets());
        let logits = smoothed_targets(&targets(), 5, 0.1).log();
        let loss = label_smoothing_sequence_loss(&logits, &targets(), &weights, 5, 0.1).double_value(&[]);
        assert!(loss.abs() < 1e-5, "loss = {loss}");
    }

    #[test]
    fn test_warmup_schedule() {
        let schedule = LearningRate::Warmup { hidden_units: 512, warmup_steps: 4000 };

        let first = schedule.at(1);
        assert!((first - 512f64.powf(-0.5) * 4000f64.powf(-1.5)).abs() < 1e-12);

        // Both branches of the min meet at the warmup step.
        let peak = schedule.at(4000);
        let rising = 512f64.powf(-0.5) * 4000.0 * 4000f64.powf(-1.5);
        let decaying = 512f64.powf(-0.5) * 4000f64.powf(-0.5);
        assert!((rising - decaying).abs() < 1e-12);
        assert!((peak - decaying).abs() < 1e-12);

        let later = schedule.at(8000);
        assert!((later - 512f64.powf(-0.5) * 8000f64.powf(-0.5)).abs() < 1e-12);
        assert!(later < peak);
        assert!(first < peak);
    }

    #[test]
    fn test_step_zero_counts_as_one() {
        let schedule = LearningRate::Warmup { hidden_units: 512, warmup_steps: 4000 };
        assert_eq!(schedule.at(0), schedule.at(1));
        assert!(schedule.at(0).is_finite());
    }

    #[test]
    fn test_schedule_from_args() {
        let args = ModelArgs { warmup_steps: 0, ..ModelArgs::default() };
        assert_eq!(LearningRate::from_args(&args), LearningRate::Constant(DEFAULT_LEARNING_RATE));
        assert_eq!(LearningRate::from_args(&args).at(10_000), 1e-4);

        let args = ModelArgs { hidden_units: 64, warmup_steps: 10, ..ModelArgs::default() };
        assert_eq!(
            LearningRate::from_args(&args),
            LearningRate::Warmup { hidden_units: 64, warmup_steps: 10 }
        );
    }
}
