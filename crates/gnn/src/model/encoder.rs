//! Per-channel branch encoder.
//!
//! Each analysis channel runs a fixed set of branches over the batch:
//! object branches (embed, attend, normalize, sum-pool) for jets and
//! leptons; pair branches (embed, attend, normalize, mean-pool) for the
//! edge grids and the jet/dijet cross lists against leptons and the boson
//! candidate; a linear embedding of the global scalars; and the raw
//! one-hot categorical. The jet branch additionally receives an additive
//! attention bias distilled from the jet-jet edge grid.

use std::fmt;
use std::str::FromStr;

use burn::nn::conv::{Conv1d, Conv1dConfig};
use burn::nn::{BatchNorm, BatchNormConfig, LayerNorm, LayerNormConfig, Linear, LinearConfig};
use burn::prelude::*;
use burn::tensor::activation::relu;
use serde::{Deserialize, Serialize};

use crate::model::attention::{MaskedAttention, MaskedAttentionConfig};
use crate::model::batch::EventBatch;
use crate::model::kinematics::N_PAIR_FEATURES;

/// Analysis channel, selecting the branch set and categorical alphabet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Channel {
    /// Z to two charged leptons.
    TwoLepton,
    /// W to lepton plus neutrino.
    OneLepton,
    /// Z to neutrinos; no reconstructed leptons.
    ZeroLepton,
}

impl Channel {
    /// Number of encoder branches concatenated into the event embedding.
    pub fn n_branches(&self) -> usize {
        match self {
            Self::TwoLepton => 9,
            Self::OneLepton => 8,
            Self::ZeroLepton => 6,
        }
    }

    /// Width of the one-hot lepton-flavor block appended to the embedding.
    pub fn categorical_dim(&self) -> usize {
        match self {
            Self::TwoLepton | Self::OneLepton => 2,
            Self::ZeroLepton => 0,
        }
    }

    pub fn uses_leptons(&self) -> bool {
        !matches!(self, Self::ZeroLepton)
    }

    /// Whether the channel carries a lepton-lepton edge branch.
    pub fn has_lepton_edges(&self) -> bool {
        matches!(self, Self::TwoLepton)
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::TwoLepton => write!(f, "TwoLepton"),
            Self::OneLepton => write!(f, "OneLepton"),
            Self::ZeroLepton => write!(f, "ZeroLepton"),
        }
    }
}

impl FromStr for Channel {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "TwoLepton" => Ok(Self::TwoLepton),
            "OneLepton" => Ok(Self::OneLepton),
            "ZeroLepton" => Ok(Self::ZeroLepton),
            other => anyhow::bail!("Unrecognized channel identifier: {other}"),
        }
    }
}

/// Reduces the 7 edge channels of a pair grid to one additive attention
/// bias per pair: kernel-1 conv, batch norm, ReLU. Sentinel-filled masked
/// entries come out at zero after the ReLU.
#[derive(Module, Debug)]
pub struct EdgeBias<B: Backend> {
    conv: Conv1d<B>,
    norm: BatchNorm<B, 1>,
}

#[derive(Config, Debug)]
pub struct EdgeBiasConfig {}

impl EdgeBiasConfig {
    pub fn init<B: Backend>(&self, device: &B::Device) -> EdgeBias<B> {
        EdgeBias {
            conv: Conv1dConfig::new(N_PAIR_FEATURES, 1, 1).init(device),
            norm: BatchNormConfig::new(1).init(device),
        }
    }
}

impl<B: Backend> EdgeBias<B> {
    /// `[batch, n, m, 7]` grid to `[batch, n, m]` bias.
    pub fn forward(&self, grid: Tensor<B, 4>) -> Tensor<B, 3> {
        let [batch, n, m, channels] = grid.dims();
        let x = grid.reshape([batch, n * m, channels]).swap_dims(1, 2);
        let x = self.conv.forward(x);
        let x = self.norm.forward(x);
        let x = relu(x);
        x.reshape([batch, n, m])
    }
}

/// Object-collection branch: embed, attend, normalize, masked sum-pool.
/// Sum pooling keeps object multiplicity visible in the embedding.
#[derive(Module, Debug)]
pub struct ObjectBranch<B: Backend> {
    embed: Linear<B>,
    attention: MaskedAttention<B>,
    norm: LayerNorm<B>,
}

#[derive(Config, Debug)]
pub struct ObjectBranchConfig {
    pub input_dim: usize,
    pub embed_dim: usize,
    #[config(default = 4)]
    pub n_heads: usize,
}

impl ObjectBranchConfig {
    pub fn init<B: Backend>(&self, device: &B::Device) -> ObjectBranch<B> {
        ObjectBranch {
            embed: LinearConfig::new(self.input_dim, self.embed_dim).init(device),
            attention: MaskedAttentionConfig::new(self.embed_dim)
                .with_n_heads(self.n_heads)
                .init(device),
            norm: LayerNormConfig::new(self.embed_dim).init(device),
        }
    }
}

impl<B: Backend> ObjectBranch<B> {
    pub fn forward(
        &self,
        x: Tensor<B, 3>,
        mask: Tensor<B, 2>,
        bias: Option<Tensor<B, 3>>,
    ) -> Tensor<B, 2> {
        let x = self.embed.forward(x);
        let x = self.attention.forward(x, mask.clone(), bias);
        let x = self.norm.forward(x);
        let [batch, n, d] = x.dims();
        // Re-mask after the norm: LayerNorm shifts zero rows off zero.
        let x = x * mask.reshape([batch, n, 1]);
        x.sum_dim(1).reshape([batch, d])
    }
}

/// Pair-list branch: embed, attend, normalize, masked mean-pool.
#[derive(Module, Debug)]
pub struct PairBranch<B: Backend> {
    embed: Linear<B>,
    attention: MaskedAttention<B>,
    norm: LayerNorm<B>,
}

#[derive(Config, Debug)]
pub struct PairBranchConfig {
    pub embed_dim: usize,
    #[config(default = 4)]
    pub n_heads: usize,
}

impl PairBranchConfig {
    pub fn init<B: Backend>(&self, device: &B::Device) -> PairBranch<B> {
        PairBranch {
            embed: LinearConfig::new(N_PAIR_FEATURES, self.embed_dim).init(device),
            attention: MaskedAttentionConfig::new(self.embed_dim)
                .with_n_heads(self.n_heads)
                .init(device),
            norm: LayerNormConfig::new(self.embed_dim).init(device),
        }
    }
}

impl<B: Backend> PairBranch<B> {
    pub fn forward(&self, x: Tensor<B, 3>, mask: Tensor<B, 2>) -> Tensor<B, 2> {
        let x = self.embed.forward(x);
        let x = self.attention.forward(x, mask.clone(), None);
        let x = self.norm.forward(x);
        let [batch, n, d] = x.dims();
        let x = x * mask.clone().reshape([batch, n, 1]);
        let summed = x.sum_dim(1).reshape([batch, d]);
        let counts = mask.sum_dim(1).clamp_min(1.0);
        summed / counts
    }
}

/// Configuration for [`AttentionEncoder`].
#[derive(Config, Debug)]
pub struct AttentionEncoderConfig {
    pub channel: Channel,
    pub jet_width: usize,
    pub lepton_width: usize,
    pub n_globals: usize,
    #[config(default = 16)]
    pub embed_dim: usize,
    #[config(default = 4)]
    pub n_heads: usize,
}

impl AttentionEncoderConfig {
    /// Width of the concatenated event embedding.
    pub fn output_dim(&self) -> usize {
        self.embed_dim * self.channel.n_branches() + self.channel.categorical_dim()
    }

    pub fn init<B: Backend>(&self, device: &B::Device) -> AttentionEncoder<B> {
        let object = |input_dim: usize| {
            ObjectBranchConfig::new(input_dim, self.embed_dim)
                .with_n_heads(self.n_heads)
                .init(device)
        };
        let pair = || {
            PairBranchConfig::new(self.embed_dim)
                .with_n_heads(self.n_heads)
                .init(device)
        };
        let channel = self.channel;

        AttentionEncoder {
            jets: object(self.jet_width),
            jet_bias: EdgeBiasConfig::new().init(device),
            leptons: channel.uses_leptons().then(|| object(self.lepton_width)),
            boson_embed: (!channel.uses_leptons())
                .then(|| LinearConfig::new(4, self.embed_dim).init(device)),
            jet_edges: pair(),
            lepton_edges: channel.has_lepton_edges().then(pair),
            jet_lepton: channel.uses_leptons().then(pair),
            dijet_lepton: channel.uses_leptons().then(pair),
            jet_boson: pair(),
            dijet_boson: pair(),
            globals: LinearConfig::new(self.n_globals, self.embed_dim).init(device),
        }
    }
}

/// The per-channel branch encoder producing a fixed-width event embedding.
#[derive(Module, Debug)]
pub struct AttentionEncoder<B: Backend> {
    jets: ObjectBranch<B>,
    jet_bias: EdgeBias<B>,
    leptons: Option<ObjectBranch<B>>,
    boson_embed: Option<Linear<B>>,
    jet_edges: PairBranch<B>,
    lepton_edges: Option<PairBranch<B>>,
    jet_lepton: Option<PairBranch<B>>,
    dijet_lepton: Option<PairBranch<B>>,
    jet_boson: PairBranch<B>,
    dijet_boson: PairBranch<B>,
    globals: Linear<B>,
}

impl<B: Backend> AttentionEncoder<B> {
    /// Encode a batch into `[batch, embed_dim * n_branches + categorical]`.
    pub fn forward(&self, batch: &EventBatch<B>) -> Tensor<B, 2> {
        let [n_events, _, _] = batch.boson.dims();

        let bias = self.jet_bias.forward(batch.jet_edge_grid.clone());
        let mut parts = vec![self.jets.forward(
            batch.jet_feats.clone(),
            batch.jet_mask.clone(),
            Some(bias),
        )];

        parts.push(
            self.jet_edges
                .forward(batch.jet_pairs.clone(), batch.jet_pair_mask.clone()),
        );

        if let (Some(branch), Some((feats, mask))) = (&self.leptons, &batch.leptons) {
            parts.push(branch.forward(feats.clone(), mask.clone(), None));
        }
        if let Some(embed) = &self.boson_embed {
            parts.push(embed.forward(batch.boson.clone().reshape([n_events, 4])));
        }

        if let (Some(branch), Some((feats, mask))) = (&self.lepton_edges, &batch.lepton_pairs) {
            parts.push(branch.forward(feats.clone(), mask.clone()));
        }
        if let (Some(branch), Some((feats, mask))) = (&self.jet_lepton, &batch.jet_lepton_pairs) {
            parts.push(branch.forward(feats.clone(), mask.clone()));
        }
        if let (Some(branch), Some((feats, mask))) = (&self.dijet_lepton, &batch.dijet_lepton_pairs)
        {
            parts.push(branch.forward(feats.clone(), mask.clone()));
        }
        parts.push(
            self.jet_boson
                .forward(batch.jet_boson_pairs.clone(), batch.jet_boson_mask.clone()),
        );
        parts.push(
            self.dijet_boson
                .forward(batch.dijet_boson_pairs.clone(), batch.dijet_boson_mask.clone()),
        );

        parts.push(self.globals.forward(batch.globals.clone()));

        if let Some(categorical) = &batch.categorical {
            parts.push(categorical.clone());
        }

        Tensor::cat(parts, 1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::batch::FeatureBuilder;
    use burn::backend::ndarray::NdArray;
    use event_table::{EventTable, TableSchema};

    type TestBackend = NdArray<f32>;

    fn encoder_config(channel: Channel) -> AttentionEncoderConfig {
        AttentionEncoderConfig::new(channel, 6, 6, 4)
            .with_embed_dim(8)
            .with_n_heads(2)
    }

    fn test_batch(channel: Channel, n_events: usize) -> crate::model::batch::HostBatch {
        let mut table = EventTable::zeros(TableSchema::default(), n_events);
        for event in 0..n_events {
            for slot in 0..3 {
                table.set_jet(event, slot, [80.0 - 20.0 * slot as f32, 0.2, 0.5, 5.0], &[0.6, 0.3]);
            }
            table.set_lepton(event, 0, [35.0, -0.2, 2.1, 0.105], &[0.02, 0.03]);
            table.set_lepton(event, 1, [22.0, 0.9, -1.0, 0.105], &[0.05, 0.07]);
            table.set_boson(event, [110.0, 0.4, 0.9, 91.0]);
            table.set_globals(event, &[1.0, 25.0, 40.0, -0.5]);
        }
        let builder = FeatureBuilder::new(TableSchema::default(), channel).unwrap();
        let indices: Vec<usize> = (0..n_events).collect();
        builder.assemble(&table, &indices).unwrap()
    }

    #[test]
    fn test_channel_parsing() {
        assert_eq!("TwoLepton".parse::<Channel>().unwrap(), Channel::TwoLepton);
        assert_eq!("ZeroLepton".parse::<Channel>().unwrap(), Channel::ZeroLepton);
        assert!("DiTau".parse::<Channel>().is_err());
        assert_eq!(Channel::OneLepton.to_string(), "OneLepton");
    }

    #[test]
    fn test_branch_counts() {
        assert_eq!(Channel::TwoLepton.n_branches(), 9);
        assert_eq!(Channel::OneLepton.n_branches(), 8);
        assert_eq!(Channel::ZeroLepton.n_branches(), 6);
        assert_eq!(Channel::ZeroLepton.categorical_dim(), 0);
        assert!(!Channel::OneLepton.has_lepton_edges());
    }

    #[test]
    fn test_encoder_output_width_per_channel() {
        let device = Default::default();
        for channel in [Channel::TwoLepton, Channel::OneLepton, Channel::ZeroLepton] {
            let config = encoder_config(channel);
            let encoder = config.init::<TestBackend>(&device);
            let batch = test_batch(channel, 3).to_device::<TestBackend>(&device);
            let out = encoder.forward(&batch);
            assert_eq!(
                out.dims(),
                [3, config.output_dim()],
                "channel {channel}"
            );
        }
    }

    #[test]
    fn test_edge_bias_shape() {
        let device = Default::default();
        let bias = EdgeBiasConfig::new().init::<TestBackend>(&device);
        let grid = Tensor::zeros([2, 5, 5, N_PAIR_FEATURES], &device);
        let out = bias.forward(grid);
        assert_eq!(out.dims(), [2, 5, 5]);
    }

    #[test]
    fn test_pair_branch_mean_pool_ignores_padding() {
        use burn::tensor::TensorData;
        let device = Default::default();
        let branch = PairBranchConfig::new(8).with_n_heads(2).init::<TestBackend>(&device);

        let real = vec![0.5_f32; N_PAIR_FEATURES];
        let mut feats_a = real.clone();
        feats_a.extend(vec![-1e6_f32; N_PAIR_FEATURES]);
        let mut feats_b = real;
        feats_b.extend(vec![7.0_f32; N_PAIR_FEATURES]);

        let mask = Tensor::from_data(TensorData::new(vec![1.0_f32, 0.0], [1, 2]), &device);
        let out_a = branch.forward(
            Tensor::from_data(TensorData::new(feats_a, [1, 2, N_PAIR_FEATURES]), &device),
            mask.clone(),
        );
        let out_b = branch.forward(
            Tensor::from_data(TensorData::new(feats_b, [1, 2, N_PAIR_FEATURES]), &device),
            mask,
        );
        let diff: f32 = (out_a - out_b).abs().sum().into_scalar().elem();
        assert!(diff < 1e-6, "masked pair content leaked, diff={diff}");
    }
}
