use std::borrow::Borrow;

use tch::{nn, Device, Kind, Tensor};

use crate::config::PositionalEncodingKind;
use crate::error::{ModelError, Result};

/// Token embedding backed by a `lookup_table` variable.
///
/// The table handle may be shared with other layers (see [`Embedding::tied`]);
/// sharing aliases the storage, so an optimizer update is seen by every holder.
#[derive(Debug)]
pub struct Embedding {
    table: Tensor,
    vocab_size: i64,
    hidden_units: i64,
    zero_pad: bool,
    scale: bool,
}

impl Embedding {
    /// Creates a new embedding table under `vs / "lookup_table"`.
    ///
    /// Args:
    ///   vs: The `nn::Path` the table is registered under.
    ///   vocab_size: Number of rows (ids `0..vocab_size`).
    ///   hidden_units: Width of each embedding vector.
    ///   zero_pad: Treat row 0 as a constant zero vector.
    ///   scale: Multiply the looked-up vectors by `sqrt(hidden_units)`.
    pub fn new<'a, P: Borrow<nn::Path<'a>>>(
        vs: P,
        vocab_size: i64,
        hidden_units: i64,
        zero_pad: bool,
        scale: bool,
    ) -> Result<Self> {
        if vocab_size <= 0 || hidden_units <= 0 {
            return Err(ModelError::config(format!(
                "embedding needs positive sizes, got vocab_size={vocab_size} hidden_units={hidden_units}"
            )));
        }
        let vs = vs.borrow();

        // Glorot-uniform, like a dense kernel of the same shape.
        let bound = (6.0 / (vocab_size + hidden_units) as f64).sqrt();
        let table = vs.var(
            "lookup_table",
            &[vocab_size, hidden_units],
            nn::Init::Uniform { lo: -bound, up: bound },
        );

        Ok(Self { table, vocab_size, hidden_units, zero_pad, scale })
    }

    /// Returns an embedding reading from the same table as `self`.
    pub fn tied(&self, zero_pad: bool, scale: bool) -> Self {
        Self {
            table: self.table.shallow_clone(),
            vocab_size: self.vocab_size,
            hidden_units: self.hidden_units,
            zero_pad,
            scale,
        }
    }

    pub fn table(&self) -> &Tensor {
        &self.table
    }

    pub fn vocab_size(&self) -> i64 {
        self.vocab_size
    }

    /// Looks up `ids` of shape `[batch, time]`, returning `[batch, time, hidden_units]`.
    pub fn forward(&self, ids: &Tensor) -> Tensor {
        // Row 0 is swapped for zeros before the lookup, so padding carries
        // no signal whatever the learned values are.
        let table = if self.zero_pad {
            let zeros = Tensor::zeros([1, self.hidden_units], (self.table.kind(), self.table.device()));
            Tensor::cat(&[zeros, self.table.narrow(0, 1, self.vocab_size - 1)], 0)
        } else {
            self.table.shallow_clone()
        };

        let xs = Tensor::embedding(&table, ids, -1, false, false);
        if self.scale {
            xs * (self.hidden_units as f64).sqrt()
        } else {
            xs
        }
    }
}

/// Additive position signal, one of two flavours.
#[derive(Debug)]
pub enum PositionalEncoding {
    /// Fixed sin/cos table of shape `[max_length, hidden_units]`, no parameters.
    Sinusoidal { table: Tensor },
    /// Trainable table indexed by absolute position.
    Learned(Embedding),
}

impl PositionalEncoding {
    /// Creates the encoder selected by `kind`.
    ///
    /// Args:
    ///   vs: The `nn::Path` used by the learned variant for its table; the
    ///       sinusoid table is built on the same device.
    ///   kind: Sinusoidal or learned.
    ///   hidden_units: Width of the produced vectors.
    ///   max_length: Number of positions either table covers.
    pub fn new<'a, P: Borrow<nn::Path<'a>>>(
        vs: P,
        kind: PositionalEncodingKind,
        hidden_units: i64,
        max_length: i64,
    ) -> Result<Self> {
        match kind {
            PositionalEncodingKind::Sinusoidal => {
                if hidden_units <= 0 || max_length <= 0 {
                    return Err(ModelError::config(format!(
                        "positional encoding needs positive sizes, got max_length={max_length} hidden_units={hidden_units}"
                    )));
                }
                let table = sinusoid_table(max_length, hidden_units, vs.borrow().device());
                Ok(PositionalEncoding::Sinusoidal { table })
            }
            PositionalEncodingKind::Learned => Ok(PositionalEncoding::Learned(Embedding::new(
                vs,
                max_length,
                hidden_units,
                false,
                false,
            )?)),
        }
    }

    /// Longest sequence the encoder can produce positions for.
    pub fn max_length(&self) -> i64 {
        match self {
            PositionalEncoding::Sinusoidal { table } => table.size()[0],
            PositionalEncoding::Learned(embedding) => embedding.vocab_size(),
        }
    }

    /// Produces the position tensor for `ids` (`[batch, time]`), shaped
    /// `[batch, time, hidden_units]` so it can be added to the embeddings.
    pub fn produce(&self, ids: &Tensor) -> Result<Tensor> {
        let (batch, time) = ids.size2()?;
        let max_length = self.max_length();
        if time > max_length {
            return Err(ModelError::ShapeMismatch { expected: vec![batch, max_length], got: vec![batch, time] });
        }
        match self {
            PositionalEncoding::Sinusoidal { table } => {
                let (_, hidden_units) = table.size2()?;
                // [time, hidden_units] -> [batch, time, hidden_units]
                Ok(table.narrow(0, 0, time).unsqueeze(0).expand([batch, time, hidden_units], false))
            }
            PositionalEncoding::Learned(embedding) => {
                let positions = Tensor::arange(time, (Kind::Int64, ids.device()))
                    .unsqueeze(0)
                    .expand([batch, time], false);
                Ok(embedding.forward(&positions))
            }
        }
    }
}

/// Builds the `[len, hidden_units]` sinusoid table on `device`.
///
/// Channel `i` at position `pos` uses the angle `pos / 10000^(2*(i/2)/hidden_units)`;
/// even channels take its sine, odd channels its cosine.
pub fn sinusoid_table(len: i64, hidden_units: i64, device: Device) -> Tensor {
    let options = (Kind::Float, device);
    let table = Tensor::zeros([len, hidden_units], options);

    // Shape: [len, 1]
    let position = Tensor::arange(len, options).unsqueeze(-1);

    // 1 / 10000^(2i / hidden_units), one entry per sin/cos pair.
    // Shape: [ceil(hidden_units / 2)]
    let div_term = (Tensor::arange_start_step(0, hidden_units, 2, options)
        * -(10000f64.ln() / hidden_units as f64))
        .exp();

    // Shape: [len, ceil(hidden_units / 2)]
    let angles = position * div_term;
    table.slice(1, 0, hidden_units, 2).copy_(&angles.sin());
    // An odd width has one cosine column fewer than sine columns.
    table.slice(1, 1, hidden_units, 2).copy_(&angles.narrow(1, 0, hidden_units / 2).cos());
    table
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ids() -> Tensor {
        Tensor::from_slice(&[0i64, 3, 5, 0, 1, 2, 0, 0]).view([2, 4])
    }

    #[test]
    fn test_zero_pad_row_is_zero_for_any_table() {
        let vs = nn::VarStore::new(Device::Cpu);
        let embedding = Embedding::new(&vs.root() / "emb", 8, 16, true, true).unwrap();

        let mut table = embedding.table().shallow_clone();
        let _ = tch::no_grad(|| table.fill_(3.5));

        let out = embedding.forward(&ids());
        assert_eq!(out.size(), vec![2, 4, 16]);
        let pad = out.select(0, 0).select(0, 0);
        assert_eq!(pad.abs().sum(Kind::Float).double_value(&[]), 0.0);
        let token = out.select(0, 0).select(0, 1);
        let expected = 3.5 * 16f64.sqrt();
        assert!((token.double_value(&[0]) - expected).abs() < 1e-4);
    }

    #[test]
    fn test_without_zero_pad_row_zero_is_learned() {
        let vs = nn::VarStore::new(Device::Cpu);
        let embedding = Embedding::new(&vs.root() / "emb", 8, 4, false, false).unwrap();
        let mut table = embedding.table().shallow_clone();
        let _ = tch::no_grad(|| table.fill_(1.0));

        let out = embedding.forward(&ids());
        assert_eq!(out.select(0, 0).select(0, 0).double_value(&[0]), 1.0);
    }

    #[test]
    fn test_tied_embedding_shares_storage() {
        let vs = nn::VarStore::new(Device::Cpu);
        let embedding = Embedding::new(&vs.root() / "emb", 8, 4, true, true).unwrap();
        let tied = embedding.tied(true, true);
        assert_eq!(embedding.table().data_ptr(), tied.table().data_ptr());
        assert_eq!(vs.variables().len(), 1);
    }

    #[test]
    fn test_rejects_non_positive_sizes() {
        let vs = nn::VarStore::new(Device::Cpu);
        assert!(matches!(
            Embedding::new(&vs.root() / "a", 0, 4, true, true),
            Err(ModelError::Configuration(_))
        ));
        assert!(matches!(
            Embedding::new(&vs.root() / "b", 4, 0, true, true),
            Err(ModelError::Configuration(_))
        ));
    }

    #[test]
    fn test_sinusoid_values() {
        let vs = nn::VarStore::new(Device::Cpu);
        let pe = PositionalEncoding::new(&vs.root(), PositionalEncodingKind::Sinusoidal, 4, 3).unwrap();
        let table = match &pe {
            PositionalEncoding::Sinusoidal { table } => table.shallow_clone(),
            other => panic!("unexpected encoding {other:?}"),
        };
        assert_eq!(table.size(), vec![3, 4]);
        // Position 0: sin(0) = 0 on even channels, cos(0) = 1 on odd ones.
        assert_eq!(table.double_value(&[0, 0]), 0.0);
        assert_eq!(table.double_value(&[0, 1]), 1.0);
        // Channels 0 and 1 share the angle pos / 10000^0 = pos.
        assert!((table.double_value(&[1, 0]) - 1f64.sin()).abs() < 1e-6);
        assert!((table.double_value(&[1, 1]) - 1f64.cos()).abs() < 1e-6);
        // Channels 2 and 3 use pos / 10000^(2/4) = pos / 100.
        assert!((table.double_value(&[2, 2]) - 0.02f64.sin()).abs() < 1e-6);
        assert!((table.double_value(&[2, 3]) - 0.02f64.cos()).abs() < 1e-6);
    }

    #[test]
    fn test_sinusoid_odd_width() {
        let table = sinusoid_table(4, 5, Device::Cpu);
        assert_eq!(table.size(), vec![4, 5]);
        // The last channel is even, so it carries a sine.
        let angle = 3.0 / 10000f64.powf(4.0 / 5.0);
        assert!((table.double_value(&[3, 4]) - angle.sin()).abs() < 1e-6);
    }

    #[test]
    fn test_sinusoidal_rejects_long_sequences() {
        let vs = nn::VarStore::new(Device::Cpu);
        let pe = PositionalEncoding::new(&vs.root(), PositionalEncodingKind::Sinusoidal, 6, 4).unwrap();
        assert_eq!(pe.max_length(), 4);
        assert_eq!(pe.produce(&ids()).unwrap().size(), vec![2, 4, 6]);

        let too_long = Tensor::ones([1, 5], (Kind::Int64, Device::Cpu));
        assert!(matches!(pe.produce(&too_long), Err(ModelError::ShapeMismatch { .. })));
    }

    #[test]
    fn test_sinusoidal_produce_shape_ignores_ids() {
        let vs = nn::VarStore::new(Device::Cpu);
        let pe = PositionalEncoding::new(&vs.root(), PositionalEncodingKind::Sinusoidal, 6, 10).unwrap();
        let out = pe.produce(&ids()).unwrap();
        assert_eq!(out.size(), vec![2, 4, 6]);
        assert!(out.select(0, 0).allclose(&out.select(0, 1), 1e-6, 1e-6, false));
        assert!(vs.variables().is_empty());
    }

    #[test]
    fn test_learned_produce() {
        let vs = nn::VarStore::new(Device::Cpu);
        let pe = PositionalEncoding::new(&vs.root() / "pos", PositionalEncodingKind::Learned, 6, 4).unwrap();
        let out = pe.produce(&ids()).unwrap();
        assert_eq!(out.size(), vec![2, 4, 6]);
        assert_eq!(vs.variables().len(), 1);

        let too_long = Tensor::ones([1, 5], (Kind::Int64, Device::Cpu));
        assert!(matches!(pe.produce(&too_long), Err(ModelError::ShapeMismatch { .. })));
    }
}
