//! Hyperparameters and per-dataset parameters.
//!
//! [`ModelArgs`] carries the architecture and training switches, [`Params`]
//! the values that come from the data side (vocabulary sizes, start symbol).

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use tch::Tensor;

use crate::error::{ModelError, Result};

/// Activation used inside the feed-forward sublayer (and optionally on the
/// attention projections).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Activation {
    Relu,
    #[default]
    Elu,
    Gelu,
}

impl Activation {
    pub fn apply(&self, xs: &Tensor) -> Tensor {
        match self {
            Activation::Relu => xs.relu(),
            Activation::Elu => xs.elu(),
            Activation::Gelu => xs.gelu("none"),
        }
    }
}

/// Which positional signal is added to the token embeddings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PositionalEncodingKind {
    #[default]
    Sinusoidal,
    Learned,
}

impl FromStr for PositionalEncodingKind {
    type Err = ModelError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "sinusoidal" => Ok(PositionalEncodingKind::Sinusoidal),
            "learned" => Ok(PositionalEncodingKind::Learned),
            other => Err(ModelError::config(format!(
                "positional encoding has to be either 'sinusoidal' or 'learned', got '{other}'"
            ))),
        }
    }
}

impl fmt::Display for PositionalEncodingKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PositionalEncodingKind::Sinusoidal => write!(f, "sinusoidal"),
            PositionalEncodingKind::Learned => write!(f, "learned"),
        }
    }
}

/// Model and training hyperparameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelArgs {
    /// Width of every hidden tensor.
    pub hidden_units: i64,
    pub num_heads: i64,
    /// Number of encoder blocks; the decoder has the same number.
    pub num_blocks: i64,
    pub dropout_rate: f64,
    pub positional_encoding: PositionalEncodingKind,
    /// Decoder reads its inputs through the encoder's embedding table.
    pub tied_embedding: bool,
    /// Output projection reuses the (transposed) embedding table.
    pub tied_proj_weight: bool,
    pub label_smoothing: bool,
    /// Mass taken from the true class when `label_smoothing` is on.
    pub smoothing: f64,
    /// Zero disables the warmup schedule in favour of a constant rate.
    pub warmup_steps: i64,
    /// Longest sequence the learned positional table can index.
    pub max_length: i64,
    pub log_every_n_iter: i64,
}

impl Default for ModelArgs {
    fn default() -> Self {
        Self {
            hidden_units: 128,
            num_heads: 8,
            num_blocks: 2,
            dropout_rate: 0.1,
            positional_encoding: PositionalEncodingKind::Sinusoidal,
            tied_embedding: false,
            tied_proj_weight: true,
            label_smoothing: true,
            smoothing: 0.1,
            warmup_steps: 4000,
            max_length: 100,
            log_every_n_iter: 100,
        }
    }
}

impl ModelArgs {
    /// Parses a JSON document; missing fields take their default value.
    pub fn from_json(json: &str) -> Result<Self> {
        let args: ModelArgs = serde_json::from_str(json)
            .map_err(|e| ModelError::config(format!("invalid model args: {e}")))?;
        args.validate()?;
        Ok(args)
    }

    pub fn validate(&self) -> Result<()> {
        if self.hidden_units <= 0 {
            return Err(ModelError::config(format!(
                "hidden_units must be positive, got {}",
                self.hidden_units
            )));
        }
        if self.num_heads <= 0 {
            return Err(ModelError::config(format!(
                "num_heads must be positive, got {}",
                self.num_heads
            )));
        }
        if self.hidden_units % self.num_heads != 0 {
            return Err(ModelError::config(format!(
                "hidden_units ({}) must be divisible by num_heads ({})",
                self.hidden_units, self.num_heads
            )));
        }
        if self.num_blocks <= 0 {
            return Err(ModelError::config(format!(
                "num_blocks must be positive, got {}",
                self.num_blocks
            )));
        }
        if !(0.0..1.0).contains(&self.dropout_rate) {
            return Err(ModelError::config(format!(
                "dropout_rate must be in [0, 1), got {}",
                self.dropout_rate
            )));
        }
        if !(0.0..1.0).contains(&self.smoothing) {
            return Err(ModelError::config(format!(
                "smoothing must be in [0, 1), got {}",
                self.smoothing
            )));
        }
        if self.warmup_steps < 0 {
            return Err(ModelError::config(format!(
                "warmup_steps must be non-negative, got {}",
                self.warmup_steps
            )));
        }
        if self.max_length <= 0 {
            return Err(ModelError::config(format!(
                "max_length must be positive, got {}",
                self.max_length
            )));
        }
        Ok(())
    }
}

/// Values supplied by the data pipeline.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Params {
    pub source_vocab_size: i64,
    pub target_vocab_size: i64,
    pub start_symbol: i64,
    pub activation: Activation,
}

impl Params {
    pub fn validate(&self) -> Result<()> {
        if self.source_vocab_size <= 0 || self.target_vocab_size <= 0 {
            return Err(ModelError::config(format!(
                "vocabulary sizes must be positive, got source={} target={}",
                self.source_vocab_size, self.target_vocab_size
            )));
        }
        // Id 0 is padding, so the start symbol has to be a real token.
        if !(1..self.target_vocab_size).contains(&self.start_symbol) {
            return Err(ModelError::config(format!(
                "start_symbol {} must be a non-padding id below {}",
                self.start_symbol, self.target_vocab_size
            )));
        }
        Ok(())
    }
}
