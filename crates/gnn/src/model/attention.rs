//! Masked multi-head self-attention with an optional additive score bias.
//!
//! The stock transformer attention is not enough here: the edge branches
//! inject a per-pair float bias into the attention scores, and padded slots
//! must be invisible both as keys (masked before softmax) and as queries
//! (zeroed after the output projection, so pooling over rows cannot pick up
//! padding content).

use burn::nn::{Linear, LinearConfig};
use burn::prelude::*;
use burn::tensor::activation::softmax;

const MASK_FILL: f32 = -1e9;

/// Configuration for [`MaskedAttention`].
#[derive(Config, Debug)]
pub struct MaskedAttentionConfig {
    /// Model width; split evenly across heads.
    pub d_model: usize,
    /// Number of attention heads.
    #[config(default = 4)]
    pub n_heads: usize,
}

impl MaskedAttentionConfig {
    /// Initialize the module.
    ///
    /// # Panics
    /// Panics if `d_model` is not divisible by `n_heads`.
    pub fn init<B: Backend>(&self, device: &B::Device) -> MaskedAttention<B> {
        assert!(
            self.n_heads > 0 && self.d_model % self.n_heads == 0,
            "d_model {} not divisible by n_heads {}",
            self.d_model,
            self.n_heads
        );
        MaskedAttention {
            query: LinearConfig::new(self.d_model, self.d_model).init(device),
            key: LinearConfig::new(self.d_model, self.d_model).init(device),
            value: LinearConfig::new(self.d_model, self.d_model).init(device),
            output: LinearConfig::new(self.d_model, self.d_model).init(device),
            n_heads: self.n_heads,
            d_head: self.d_model / self.n_heads,
        }
    }
}

/// Multi-head scaled dot-product attention over padded object slots.
#[derive(Module, Debug)]
pub struct MaskedAttention<B: Backend> {
    query: Linear<B>,
    key: Linear<B>,
    value: Linear<B>,
    output: Linear<B>,
    n_heads: usize,
    d_head: usize,
}

impl<B: Backend> MaskedAttention<B> {
    /// Attend over `x` of shape `[batch, n, d_model]`.
    ///
    /// `mask` is `[batch, n]` with 1.0 for real slots and 0.0 for padding.
    /// `bias`, if given, is `[batch, n, n]` and is added to the raw scores,
    /// broadcast across heads.
    pub fn forward(
        &self,
        x: Tensor<B, 3>,
        mask: Tensor<B, 2>,
        bias: Option<Tensor<B, 3>>,
    ) -> Tensor<B, 3> {
        let [batch, n, d_model] = x.dims();

        let q = self.split_heads(self.query.forward(x.clone()), batch, n);
        let k = self.split_heads(self.key.forward(x.clone()), batch, n);
        let v = self.split_heads(self.value.forward(x), batch, n);

        let scale = (self.d_head as f32).sqrt();
        let mut scores = q.matmul(k.transpose()) / scale;

        if let Some(bias) = bias {
            let bias = bias
                .reshape([batch, 1, n, n])
                .expand([batch, self.n_heads, n, n]);
            scores = scores + bias;
        }

        // Keys at padded slots are removed from every softmax.
        let key_padding = mask
            .clone()
            .equal_elem(0.0)
            .reshape([batch, 1, 1, n])
            .expand([batch, self.n_heads, n, n]);
        let scores = scores.mask_fill(key_padding, MASK_FILL);

        let attn = softmax(scores, 3);
        let context = attn.matmul(v);

        let context = context
            .swap_dims(1, 2)
            .reshape([batch, n, d_model]);
        let projected = self.output.forward(context);

        // Padded query rows attended uniformly over masked keys; zero them
        // so pooled outputs cannot depend on padding content.
        projected * mask.reshape([batch, n, 1])
    }

    fn split_heads(&self, x: Tensor<B, 3>, batch: usize, n: usize) -> Tensor<B, 4> {
        x.reshape([batch, n, self.n_heads, self.d_head])
            .swap_dims(1, 2)
    }
}
