//! Classifier head on top of the branch encoder.

use burn::nn::{Dropout, DropoutConfig, LayerNorm, LayerNormConfig, Linear, LinearConfig};
use burn::prelude::*;
use burn::tensor::activation::{relu, sigmoid};

use crate::model::batch::EventBatch;
use crate::model::encoder::{AttentionEncoder, AttentionEncoderConfig, Channel};

/// Configuration for the full event classifier.
#[derive(Config, Debug)]
pub struct EventClassifierConfig {
    /// Analysis channel; fixes the encoder branch set.
    pub channel: Channel,
    /// Per-jet auxiliary feature count (tagger scores).
    #[config(default = 2)]
    pub n_jet_aux: usize,
    /// Per-lepton auxiliary feature count.
    #[config(default = 2)]
    pub n_lepton_aux: usize,
    /// Global scalar count.
    #[config(default = 4)]
    pub n_globals: usize,
    /// Branch embedding width.
    #[config(default = 16)]
    pub embed_dim: usize,
    /// Hidden width of the head MLP.
    #[config(default = 64)]
    pub hidden_dim: usize,
    /// Attention heads per branch.
    #[config(default = 4)]
    pub n_heads: usize,
    /// Dropout probability in the head.
    #[config(default = 0.2)]
    pub dropout: f64,
}

impl EventClassifierConfig {
    fn encoder_config(&self) -> AttentionEncoderConfig {
        AttentionEncoderConfig::new(
            self.channel,
            self.n_jet_aux + 4,
            self.n_lepton_aux + 4,
            self.n_globals,
        )
        .with_embed_dim(self.embed_dim)
        .with_n_heads(self.n_heads)
    }

    /// Initialize the classifier.
    ///
    /// # Panics
    /// Panics if `embed_dim` is not divisible by `n_heads`.
    pub fn init<B: Backend>(&self, device: &B::Device) -> EventClassifier<B> {
        let encoder_config = self.encoder_config();
        let concat_dim = encoder_config.output_dim();
        EventClassifier {
            encoder: encoder_config.init(device),
            fc1: LinearConfig::new(concat_dim, self.hidden_dim).init(device),
            norm1: LayerNormConfig::new(self.hidden_dim).init(device),
            drop1: DropoutConfig::new(self.dropout).init(),
            fc2: LinearConfig::new(self.hidden_dim, self.hidden_dim).init(device),
            norm2: LayerNormConfig::new(self.hidden_dim).init(device),
            drop2: DropoutConfig::new(self.dropout).init(),
            out: LinearConfig::new(self.hidden_dim, 2).init(device),
        }
    }
}

/// Encoder plus a two-layer MLP head emitting two class logits.
#[derive(Module, Debug)]
pub struct EventClassifier<B: Backend> {
    encoder: AttentionEncoder<B>,
    fc1: Linear<B>,
    norm1: LayerNorm<B>,
    drop1: Dropout,
    fc2: Linear<B>,
    norm2: LayerNorm<B>,
    drop2: Dropout,
    out: Linear<B>,
}

impl<B: Backend> EventClassifier<B> {
    /// Forward pass to the raw `[batch, 2]` logits.
    pub fn forward(&self, batch: &EventBatch<B>) -> Tensor<B, 2> {
        let x = self.encoder.forward(batch);
        let x = self.drop1.forward(relu(self.norm1.forward(self.fc1.forward(x))));
        let x = self.drop2.forward(relu(self.norm2.forward(self.fc2.forward(x))));
        self.out.forward(x)
    }

    /// Signal probability in [0, 1]: sigmoid of the signal logit.
    pub fn score(&self, batch: &EventBatch<B>) -> Tensor<B, 1> {
        let logits = self.forward(batch);
        let [n_events, _] = logits.dims();
        sigmoid(logits.narrow(1, 0, 1).reshape([n_events]))
    }
}
