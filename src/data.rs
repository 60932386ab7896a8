use rand::Rng;
use tch::{Device, Tensor};

use crate::error::{ModelError, Result};

/// Ids reserved below this value: 0 is padding, 1 the start symbol.
pub const FIRST_TOKEN: i64 = 2;

/// One batch as handed to the model: integer id tensors of shape
/// `[batch, time]`, padded with 0.
#[derive(Debug)]
pub struct Features {
    pub source: Tensor,
    pub target: Tensor,
}

impl Features {
    pub fn new(source: Tensor, target: Tensor) -> Self {
        Self { source, target }
    }
}

/// Generates a random batch for the copy task: every target equals its source.
///
/// Each row holds between 1 and `seq_len` tokens drawn from
/// `FIRST_TOKEN..vocab_size`, followed by padding.
pub fn copy_task_batch<R: Rng>(
    rng: &mut R,
    batch_size: i64,
    seq_len: i64,
    vocab_size: i64,
    device: Device,
) -> Result<Features> {
    if batch_size <= 0 || seq_len <= 0 {
        return Err(ModelError::config(format!(
            "batch_size and seq_len must be positive, got {batch_size} and {seq_len}"
        )));
    }
    if vocab_size <= FIRST_TOKEN {
        return Err(ModelError::config(format!(
            "copy task needs a vocabulary larger than {FIRST_TOKEN}, got {vocab_size}"
        )));
    }

    let mut ids = Vec::with_capacity((batch_size * seq_len) as usize);
    for _ in 0..batch_size {
        let len = rng.gen_range(1..=seq_len);
        for position in 0..seq_len {
            if position < len {
                ids.push(rng.gen_range(FIRST_TOKEN..vocab_size));
            } else {
                ids.push(0);
            }
        }
    }

    let source = Tensor::from_slice(&ids).view([batch_size, seq_len]).to_device(device);
    let target = source.copy();
    Ok(Features { source, target })
}
