use std::borrow::Borrow;

use tch::{nn, Kind, Tensor};

use crate::config::Activation;
use crate::error::{ModelError, Result};

/// Score given to masked positions before the softmax; small enough that
/// `exp` underflows to exactly zero in f32.
const MASK_VALUE: f64 = -1e9;

fn layer_norm(vs: &nn::Path, width: i64) -> nn::LayerNorm {
    nn::layer_norm(vs / "norm", vec![width], nn::LayerNormConfig { eps: 1e-8, ..Default::default() })
}

fn expect_ids(ids: &Tensor, batch: i64, time: i64) -> Result<()> {
    let got = ids.size();
    if got != [batch, time] {
        return Err(ModelError::ShapeMismatch { expected: vec![batch, time], got });
    }
    Ok(())
}

#[derive(Debug)]
pub struct MultiHeadAttention {
    query: nn::Linear,
    key: nn::Linear,
    value: nn::Linear,
    norm: nn::LayerNorm,
    num_units: i64,
    num_heads: i64,
    dropout_rate: f64,
    causality: bool,
    activation: Option<Activation>,
}

impl MultiHeadAttention {
    /// Creates a new MultiHeadAttention layer.
    ///
    /// Args:
    ///   vs: The `nn::Path` for `VarStore` ownership.
    ///   query_dim: Channel width of the queries (also the residual width).
    ///   key_dim: Channel width of the keys, which double as values.
    ///   num_units: Width of the Q/K/V projections; must equal `query_dim`.
    ///   num_heads: Number of heads; must divide `num_units`.
    ///   dropout_rate: Dropout applied to the attention weights while training.
    ///   causality: Forbid attending to later key positions.
    ///   activation: Optional activation on the Q/K/V projections.
    #[allow(clippy::too_many_arguments)]
    pub fn new<'a, P: Borrow<nn::Path<'a>>>(
        vs: P,
        query_dim: i64,
        key_dim: i64,
        num_units: i64,
        num_heads: i64,
        dropout_rate: f64,
        causality: bool,
        activation: Option<Activation>,
    ) -> Result<Self> {
        let vs = vs.borrow();
        if num_units <= 0 || num_heads <= 0 || num_units % num_heads != 0 {
            return Err(ModelError::config(format!(
                "num_units ({num_units}) must be a positive multiple of num_heads ({num_heads})"
            )));
        }
        if query_dim != num_units {
            return Err(ModelError::ShapeMismatch { expected: vec![num_units], got: vec![query_dim] });
        }

        let query = nn::linear(vs / "query", query_dim, num_units, Default::default());
        let key = nn::linear(vs / "key", key_dim, num_units, Default::default());
        let value = nn::linear(vs / "value", key_dim, num_units, Default::default());
        let norm = layer_norm(vs, num_units);

        Ok(Self { query, key, value, norm, num_units, num_heads, dropout_rate, causality, activation })
    }

    /// Attends from `queries` (`[batch, time_q, query_dim]`) to `keys`
    /// (`[batch, time_k, key_dim]`). `query_ids` and `key_ids` are the token ids
    /// the two tensors were built from; id 0 marks padding.
    pub fn forward(
        &self,
        queries: &Tensor,
        keys: &Tensor,
        query_ids: &Tensor,
        key_ids: &Tensor,
        train: bool,
    ) -> Result<Tensor> {
        self.forward_with_weights(queries, keys, query_ids, key_ids, train)
            .map(|(out, _)| out)
    }

    /// Same as [`forward`](Self::forward), also returning the attention weights
    /// (`[num_heads * batch, time_q, time_k]`, before dropout).
    pub fn forward_with_weights(
        &self,
        queries: &Tensor,
        keys: &Tensor,
        query_ids: &Tensor,
        key_ids: &Tensor,
        train: bool,
    ) -> Result<(Tensor, Tensor)> {
        let (batch, len_q, width) = queries.size3()?;
        let (_, len_k, _) = keys.size3()?;
        if width != self.num_units {
            return Err(ModelError::ShapeMismatch {
                expected: vec![batch, len_q, self.num_units],
                got: vec![batch, len_q, width],
            });
        }
        expect_ids(query_ids, batch, len_q)?;
        expect_ids(key_ids, batch, len_k)?;

        let project = |layer: &nn::Linear, xs: &Tensor| {
            let ys = xs.apply(layer);
            match self.activation {
                Some(activation) => activation.apply(&ys),
                None => ys,
            }
        };
        // 1. Linear projections.
        // Shape: [batch, time_q, num_units] for q, [batch, time_k, num_units] for k and v.
        let q = project(&self.query, queries);
        let k = project(&self.key, keys);
        let v = project(&self.value, keys);

        // 2. Split heads, stacked on the batch axis head-major.
        // Shape: [num_heads * batch, time, num_units / num_heads]
        let q = Tensor::cat(q.chunk(self.num_heads, 2).as_slice(), 0);
        let k = Tensor::cat(k.chunk(self.num_heads, 2).as_slice(), 0);
        let v = Tensor::cat(v.chunk(self.num_heads, 2).as_slice(), 0);

        // 3. Scaled dot-product scores.
        // Shape: [num_heads * batch, time_q, time_k]
        let head_dim = self.num_units / self.num_heads;
        let scores = q.matmul(&k.transpose(-2, -1)) / (head_dim as f64).sqrt();

        // 4. Key padding, plus the future positions when causal.
        // Shape: [num_heads * batch, 1, time_k], or [.., time_q, time_k] with causality.
        let key_pad = key_ids.eq(0).repeat([self.num_heads, 1]).unsqueeze(1);
        let mask = if self.causality {
            let future = Tensor::ones([len_q, len_k], (Kind::Bool, queries.device()))
                .triu(1)
                .unsqueeze(0);
            key_pad.logical_or(&future)
        } else {
            key_pad
        };
        // A row whose keys are all masked would otherwise softmax to a uniform
        // spread over them; the second fill pins every masked weight to 0.
        let weights = scores
            .masked_fill(&mask, MASK_VALUE)
            .softmax(-1, Kind::Float)
            .masked_fill(&mask, 0.0);

        // 5. Padding queries attend to nothing.
        // Shape: [num_heads * batch, time_q, 1]
        let query_keep = query_ids
            .ne(0)
            .to_kind(Kind::Float)
            .repeat([self.num_heads, 1])
            .unsqueeze(-1);
        let weights = weights * query_keep;

        // 6. Weighted sum of values, heads merged back onto the channels.
        // Shape: [num_heads * batch, time_q, head_dim] -> [batch, time_q, num_units]
        let out = weights.dropout(self.dropout_rate, train).matmul(&v);
        let out = Tensor::cat(out.chunk(self.num_heads, 0).as_slice(), 2);

        // 7. Residual connection and layer norm.
        let out = (out + queries).apply(&self.norm);

        Ok((out, weights))
    }
}

/// Position-wise feed-forward sublayer with residual connection.
#[derive(Debug)]
pub struct FeedForward {
    inner: nn::Linear,
    outer: nn::Linear,
    norm: nn::LayerNorm,
    input_dim: i64,
    activation: Activation,
}

impl FeedForward {
    /// Creates a new FeedForward layer.
    ///
    /// Args:
    ///   vs: The `nn::Path` for `VarStore` ownership.
    ///   input_dim: Channel width of the input.
    ///   num_units: `[inner_dim, output_dim]`; `output_dim` must equal `input_dim`.
    ///   activation: Applied after the inner transform only.
    pub fn new<'a, P: Borrow<nn::Path<'a>>>(
        vs: P,
        input_dim: i64,
        num_units: [i64; 2],
        activation: Activation,
    ) -> Result<Self> {
        let vs = vs.borrow();
        let [inner_dim, output_dim] = num_units;
        if inner_dim <= 0 {
            return Err(ModelError::config(format!("inner_dim must be positive, got {inner_dim}")));
        }
        if output_dim != input_dim {
            return Err(ModelError::ShapeMismatch { expected: vec![input_dim], got: vec![output_dim] });
        }

        let inner = nn::linear(vs / "inner", input_dim, inner_dim, Default::default());
        let outer = nn::linear(vs / "outer", inner_dim, output_dim, Default::default());
        let norm = layer_norm(vs, output_dim);

        Ok(Self { inner, outer, norm, input_dim, activation })
    }

    /// Applies the sublayer to `xs` of shape `[batch, time, input_dim]`.
    pub fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        let size = xs.size();
        if size.last() != Some(&self.input_dim) {
            let mut expected = size.clone();
            if let Some(last) = expected.last_mut() {
                *last = self.input_dim;
            }
            return Err(ModelError::ShapeMismatch { expected, got: size });
        }
        let ys = self.activation.apply(&xs.apply(&self.inner)).apply(&self.outer);
        Ok((ys + xs).apply(&self.norm))
    }
}
