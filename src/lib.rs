//! Encoder-decoder Transformer for neural machine translation, built on `tch`.
//!
//! ```text
//! source → Embedding + Positional → Dropout → [Self-Attention → FeedForward] × N ─┐
//! target → shift right → Embedding + Positional → Dropout →                        │
//!     [Causal Self-Attention → Cross-Attention(encoded) → FeedForward] × N  ←──────┘
//!     → Output Projection → {loss + Adam step | greedy ids}
//! ```

pub mod config;
pub mod data;
pub mod embedding;
pub mod error;
pub mod estimator;
pub mod generation;
pub mod layers;
pub mod model;
pub mod training;

pub use config::{Activation, ModelArgs, Params, PositionalEncodingKind};
pub use data::Features;
pub use embedding::{Embedding, PositionalEncoding};
pub use error::{ModelError, Result};
pub use estimator::{Estimator, Mode, ModelOutput, TrainOutput};
pub use layers::{FeedForward, MultiHeadAttention};
pub use model::{decoder_inputs, OutputProjection, Transformer};
pub use training::LearningRate;
