use tch::{Kind, Tensor};

use crate::error::{ModelError, Result};
use crate::model::Transformer;

/// Decodes `sources` autoregressively, one position at a time, always taking
/// the arg-max token.
///
/// Args:
///   model: The model to decode with; dropout is disabled.
///   sources: Source ids, shape `[batch, time]`.
///   max_len: Number of target positions to produce.
///
/// Returns:
///   Ids of shape `[batch, max_len]`.
pub fn greedy_decode(model: &Transformer, sources: &Tensor, max_len: i64) -> Result<Tensor> {
    let (batch, _) = sources.size2()?;
    if max_len <= 0 {
        return Err(ModelError::config(format!("max_len must be positive, got {max_len}")));
    }

    tch::no_grad(|| -> Result<Tensor> {
        let encoded = model.encode(sources, false)?;
        let targets = Tensor::zeros([batch, max_len], (Kind::Int64, sources.device()));

        // Position t only sees targets[..t] through the shifted, causal decoder,
        // so the zeros still ahead of it do not matter.
        for t in 0..max_len {
            let logits = model.decode(&targets, sources, &encoded, false)?;
            let next = logits.select(1, t).argmax(-1, false);
            targets.narrow(1, t, 1).copy_(&next.unsqueeze(1));
        }
        Ok(targets)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Activation, ModelArgs, Params};
    use tch::{nn, Device};

    fn model(vs: &nn::VarStore) -> Transformer {
        let args = ModelArgs {
            hidden_units: 16,
            num_heads: 2,
            num_blocks: 1,
            dropout_rate: 0.2,
            ..ModelArgs::default()
        };
        let params = Params {
            source_vocab_size: 9,
            target_vocab_size: 11,
            start_symbol: 1,
            activation: Activation::Relu,
        };
        Transformer::new(&vs.root(), &args, &params).unwrap()
    }

    #[test]
    fn test_greedy_decode_shape() {
        tch::manual_seed(3);
        let vs = nn::VarStore::new(Device::Cpu);
        let model = model(&vs);
        let sources = Tensor::from_slice(&[2i64, 3, 4, 0, 5, 6, 0, 0]).view([2, 4]);

        let ids = greedy_decode(&model, &sources, 6).unwrap();
        assert_eq!(ids.size(), vec![2, 6]);
        assert!(ids.min().int64_value(&[]) >= 0);
        assert!(ids.max().int64_value(&[]) < 11);
    }

    #[test]
    fn test_greedy_decode_agrees_with_teacher_forcing() {
        tch::manual_seed(4);
        let vs = nn::VarStore::new(Device::Cpu);
        let model = model(&vs);
        let sources = Tensor::from_slice(&[2i64, 3, 4, 5, 6, 7, 8, 0]).view([2, 4]);

        let decoded = greedy_decode(&model, &sources, 5).unwrap();
        // Feeding the decoded ids back as targets reproduces them.
        let forced = tch::no_grad(|| model.forward(&sources, &decoded, false)).unwrap();
        assert!(forced.ids.equal(&decoded));
    }

    #[test]
    fn test_greedy_decode_rejects_empty_length() {
        let vs = nn::VarStore::new(Device::Cpu);
        let model = model(&vs);
        let sources = Tensor::ones([1, 3], (Kind::Int64, Device::Cpu));
        assert!(matches!(greedy_decode(&model, &sources, 0), Err(ModelError::Configuration(_))));
    }
}
