use std::borrow::Borrow;
use std::fmt;

use tch::{nn, Kind, Tensor};
use tracing::debug;

use crate::config::{ModelArgs, Params};
use crate::embedding::{Embedding, PositionalEncoding};
use crate::error::{ModelError, Result};
use crate::layers::{FeedForward, MultiHeadAttention};

/// Where a group of parameters lives in the `VarStore`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scope {
    EncoderEmbedding,
    EncoderPositionalEncoding,
    EncoderAttention(usize),
    EncoderFeedForward(usize),
    DecoderEmbedding,
    DecoderPositionalEncoding,
    DecoderSelfAttention(usize),
    DecoderAttention(usize),
    DecoderFeedForward(usize),
    OutputLayer,
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Scope::EncoderEmbedding => write!(f, "encoder_embedding"),
            Scope::EncoderPositionalEncoding => write!(f, "encoder_positional_encoding"),
            Scope::EncoderAttention(i) => write!(f, "encoder_attn_{i}"),
            Scope::EncoderFeedForward(i) => write!(f, "encoder_feedforward_{i}"),
            Scope::DecoderEmbedding => write!(f, "decoder_embedding"),
            Scope::DecoderPositionalEncoding => write!(f, "decoder_positional_encoding"),
            Scope::DecoderSelfAttention(i) => write!(f, "decoder_self_attn_{i}"),
            Scope::DecoderAttention(i) => write!(f, "decoder_attn_{i}"),
            Scope::DecoderFeedForward(i) => write!(f, "decoder_feedforward_{i}"),
            Scope::OutputLayer => write!(f, "output_layer"),
        }
    }
}

#[derive(Debug)]
struct EncoderBlock {
    attention: MultiHeadAttention,
    feedforward: FeedForward,
}

#[derive(Debug)]
struct DecoderBlock {
    self_attention: MultiHeadAttention,
    attention: MultiHeadAttention,
    feedforward: FeedForward,
}

/// Maps decoder states to vocabulary logits.
#[derive(Debug)]
pub enum OutputProjection {
    Dense(nn::Linear),
    /// `decoded · weightᵗ + bias`, with `weight` aliasing an embedding table.
    Tied { weight: Tensor, bias: Tensor },
}

impl OutputProjection {
    pub fn forward(&self, decoded: &Tensor) -> Tensor {
        match self {
            OutputProjection::Dense(linear) => decoded.apply(linear),
            OutputProjection::Tied { weight, bias } => decoded.matmul(&weight.tr()) + bias,
        }
    }

    /// The `[target_vocab_size, hidden_units]` weight matrix.
    pub fn weight(&self) -> &Tensor {
        match self {
            OutputProjection::Dense(linear) => &linear.ws,
            OutputProjection::Tied { weight, .. } => weight,
        }
    }
}

/// Result of one forward pass.
#[derive(Debug)]
pub struct ForwardOutput {
    /// `[batch, time, target_vocab_size]`
    pub logits: Tensor,
    /// Greedy ids, `[batch, time]`.
    pub ids: Tensor,
}

/// Shifts `targets` right by one step, inserting `start_symbol` in front and
/// dropping the last token: `[a, b, c, d]` becomes `[s, a, b, c]`.
pub fn decoder_inputs(targets: &Tensor, start_symbol: i64) -> Result<Tensor> {
    let (batch, time) = targets.size2()?;
    if time < 1 {
        return Err(ModelError::ShapeMismatch { expected: vec![batch, 1], got: vec![batch, time] });
    }
    let start = Tensor::full([batch, 1], start_symbol, (Kind::Int64, targets.device()));
    let body = targets.narrow(1, 0, time - 1).to_kind(Kind::Int64);
    Ok(Tensor::cat(&[start, body], 1))
}

/// Encoder-decoder Transformer.
///
/// All parameters are created in [`Transformer::new`]; every later call to
/// [`Transformer::forward`] reads the same tensors, so two passes over one
/// batch see identical weights.
#[derive(Debug)]
pub struct Transformer {
    args: ModelArgs,
    params: Params,
    encoder_embedding: Embedding,
    encoder_position: PositionalEncoding,
    encoder_blocks: Vec<EncoderBlock>,
    decoder_embedding: Embedding,
    decoder_position: PositionalEncoding,
    decoder_blocks: Vec<DecoderBlock>,
    projection: OutputProjection,
}

impl Transformer {
    /// Creates a new encoder-decoder Transformer.
    ///
    /// Args:
    ///   vs: The `nn::Path` for `VarStore` ownership.
    ///   args: Architecture hyperparameters.
    ///   params: Vocabulary sizes, start symbol and feed-forward activation.
    pub fn new<'a, P: Borrow<nn::Path<'a>>>(vs: P, args: &ModelArgs, params: &Params) -> Result<Self> {
        let vs = vs.borrow();
        args.validate()?;
        params.validate()?;
        if args.tied_embedding && params.source_vocab_size != params.target_vocab_size {
            return Err(ModelError::config(format!(
                "tied_embedding needs equal vocabularies, got source={} target={}",
                params.source_vocab_size, params.target_vocab_size
            )));
        }

        let hidden = args.hidden_units;
        let ff_units = [4 * hidden, hidden];
        let attention = |scope: Scope, causality: bool| {
            MultiHeadAttention::new(
                vs / scope,
                hidden,
                hidden,
                hidden,
                args.num_heads,
                args.dropout_rate,
                causality,
                None,
            )
        };

        let encoder_embedding =
            Embedding::new(vs / Scope::EncoderEmbedding, params.source_vocab_size, hidden, true, true)?;
        let encoder_position = PositionalEncoding::new(
            vs / Scope::EncoderPositionalEncoding,
            args.positional_encoding,
            hidden,
            args.max_length,
        )?;
        let encoder_blocks = (0..args.num_blocks as usize)
            .map(|i| -> Result<EncoderBlock> {
                Ok(EncoderBlock {
                    attention: attention(Scope::EncoderAttention(i), false)?,
                    feedforward: FeedForward::new(
                        vs / Scope::EncoderFeedForward(i),
                        hidden,
                        ff_units,
                        params.activation,
                    )?,
                })
            })
            .collect::<Result<Vec<_>>>()?;

        let decoder_embedding = if args.tied_embedding {
            encoder_embedding.tied(true, true)
        } else {
            Embedding::new(vs / Scope::DecoderEmbedding, params.target_vocab_size, hidden, true, true)?
        };
        let decoder_position = PositionalEncoding::new(
            vs / Scope::DecoderPositionalEncoding,
            args.positional_encoding,
            hidden,
            args.max_length,
        )?;
        let decoder_blocks = (0..args.num_blocks as usize)
            .map(|i| -> Result<DecoderBlock> {
                Ok(DecoderBlock {
                    self_attention: attention(Scope::DecoderSelfAttention(i), true)?,
                    attention: attention(Scope::DecoderAttention(i), false)?,
                    feedforward: FeedForward::new(
                        vs / Scope::DecoderFeedForward(i),
                        hidden,
                        ff_units,
                        params.activation,
                    )?,
                })
            })
            .collect::<Result<Vec<_>>>()?;

        let projection = if args.tied_proj_weight {
            // With tied embeddings both tables are the same storage.
            let weight = if args.tied_embedding {
                encoder_embedding.table().shallow_clone()
            } else {
                decoder_embedding.table().shallow_clone()
            };
            let bias = vs.var("bias", &[params.target_vocab_size], nn::Init::Const(0.01));
            OutputProjection::Tied { weight, bias }
        } else {
            OutputProjection::Dense(nn::linear(
                vs / Scope::OutputLayer,
                hidden,
                params.target_vocab_size,
                Default::default(),
            ))
        };

        debug!(
            hidden_units = hidden,
            num_blocks = args.num_blocks,
            num_heads = args.num_heads,
            positional_encoding = %args.positional_encoding,
            tied_embedding = args.tied_embedding,
            tied_proj_weight = args.tied_proj_weight,
            "built transformer"
        );

        Ok(Self {
            args: args.clone(),
            params: *params,
            encoder_embedding,
            encoder_position,
            encoder_blocks,
            decoder_embedding,
            decoder_position,
            decoder_blocks,
            projection,
        })
    }

    pub fn args(&self) -> &ModelArgs {
        &self.args
    }

    pub fn params(&self) -> &Params {
        &self.params
    }

    pub fn encoder_embedding(&self) -> &Embedding {
        &self.encoder_embedding
    }

    pub fn decoder_embedding(&self) -> &Embedding {
        &self.decoder_embedding
    }

    pub fn projection(&self) -> &OutputProjection {
        &self.projection
    }

    /// Runs the encoder stack over `sources` (`[batch, time]`).
    pub fn encode(&self, sources: &Tensor, train: bool) -> Result<Tensor> {
        // Shape: [batch, time, hidden_units]
        let embedded = self.encoder_embedding.forward(sources) + self.encoder_position.produce(sources)?;
        let mut encoded = embedded.dropout(self.args.dropout_rate, train);

        for block in &self.encoder_blocks {
            encoded = block.attention.forward(&encoded, &encoded, sources, sources, train)?;
            encoded = block.feedforward.forward(&encoded)?;
        }
        Ok(encoded)
    }

    /// Runs the decoder stack on the shifted `targets` against `encoded`
    /// (the encoder output for `sources`), returning the logits.
    pub fn decode(&self, targets: &Tensor, sources: &Tensor, encoded: &Tensor, train: bool) -> Result<Tensor> {
        let inputs = decoder_inputs(targets, self.params.start_symbol)?;

        // Shape: [batch, time, hidden_units]
        let embedded = self.decoder_embedding.forward(&inputs) + self.decoder_position.produce(&inputs)?;
        let mut decoded = embedded.dropout(self.args.dropout_rate, train);

        // Each block: masked self-attention, attention over `encoded`, feed-forward.
        for block in &self.decoder_blocks {
            decoded = block.self_attention.forward(&decoded, &decoded, &inputs, &inputs, train)?;
            decoded = block.attention.forward(&decoded, encoded, &inputs, sources, train)?;
            decoded = block.feedforward.forward(&decoded)?;
        }
        // Shape: [batch, time, target_vocab_size]
        Ok(self.projection.forward(&decoded))
    }

    /// Full teacher-forced pass: logits for every target position plus the
    /// greedy ids. Dropout is active only when `train` is set.
    pub fn forward(&self, sources: &Tensor, targets: &Tensor, train: bool) -> Result<ForwardOutput> {
        let (source_batch, _) = sources.size2()?;
        let (target_batch, target_time) = targets.size2()?;
        if source_batch != target_batch {
            return Err(ModelError::ShapeMismatch {
                expected: vec![source_batch, target_time],
                got: vec![target_batch, target_time],
            });
        }

        let encoded = self.encode(sources, train)?;
        let logits = self.decode(targets, sources, &encoded, train)?;
        let ids = logits.argmax(-1, false);
        Ok(ForwardOutput { logits, ids })
    }
}
