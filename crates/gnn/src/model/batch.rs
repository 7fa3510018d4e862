//! Host batch assembly and the host-to-tensor bridge.
//!
//! [`FeatureBuilder`] turns a slice of event indices into a [`HostBatch`]:
//! plain f32 buffers holding object features, pairwise grids, upper
//! triangles, cross-collection pair lists, one-hot categoricals, globals,
//! labels, and weights. [`HostBatch::to_device`] uploads those buffers as
//! burn tensors; no kinematics run on the device.

use burn::prelude::*;
use burn::tensor::TensorData;
use event_table::{EventTable, TableSchema};

use crate::model::encoder::Channel;
use crate::model::kinematics::{
    pairwise_interaction, self_interaction, upper_triangle, FourMomentum, N_PAIR_FEATURES,
};

/// Assembled per-batch host buffers, shapes recorded alongside.
#[derive(Debug, Clone)]
pub struct HostBatch {
    pub n_events: usize,
    pub max_jets: usize,
    pub max_leptons: usize,
    pub jet_width: usize,
    pub lepton_width: usize,
    pub n_globals: usize,
    pub categorical_dim: usize,

    /// `[n, max_jets, jet_width]`, tagger scores then (pt, eta, phi, mass).
    pub jet_feats: Vec<f32>,
    /// `[n, max_jets]`, 1.0 real / 0.0 padding.
    pub jet_mask: Vec<f32>,
    /// `[n, max_jets, max_jets, 7]`, sentinel-filled where masked.
    pub jet_edge_grid: Vec<f32>,
    /// `[n, n_jet_pairs, 7]` strict upper triangle.
    pub jet_pair_feats: Vec<f32>,
    pub jet_pair_mask: Vec<f32>,

    /// Empty for the zero-lepton channel.
    pub lepton_feats: Vec<f32>,
    pub lepton_mask: Vec<f32>,
    /// Populated only when the channel has lepton edges.
    pub lepton_pair_feats: Vec<f32>,
    pub lepton_pair_mask: Vec<f32>,
    /// `[n, max_jets * max_leptons, 7]` row-major cross pairs.
    pub jet_lepton_feats: Vec<f32>,
    pub jet_lepton_mask: Vec<f32>,
    /// `[n, n_jet_pairs * max_leptons, 7]` dijet x lepton cross pairs.
    pub dijet_lepton_feats: Vec<f32>,
    pub dijet_lepton_mask: Vec<f32>,

    /// `[n, 1, 4]` boson-candidate proxy.
    pub boson_feats: Vec<f32>,
    /// `[n, max_jets, 7]` jet x boson pairs.
    pub jet_boson_feats: Vec<f32>,
    pub jet_boson_mask: Vec<f32>,
    /// `[n, n_jet_pairs, 7]` dijet x boson pairs.
    pub dijet_boson_feats: Vec<f32>,
    pub dijet_boson_mask: Vec<f32>,

    pub globals: Vec<f32>,
    pub categorical: Vec<f32>,
    pub labels: Vec<f32>,
    pub weights: Vec<f32>,
}

impl HostBatch {
    pub fn n_jet_pairs(&self) -> usize {
        self.max_jets * (self.max_jets - 1) / 2
    }

    pub fn n_lepton_pairs(&self) -> usize {
        self.max_leptons * self.max_leptons.saturating_sub(1) / 2
    }

    /// Upload all buffers to the device as burn tensors.
    pub fn to_device<B: Backend>(&self, device: &B::Device) -> EventBatch<B> {
        let n = self.n_events;
        let jets = self.max_jets;

        let leptons = if self.lepton_feats.is_empty() {
            None
        } else {
            Some((
                tensor3::<B>(
                    &self.lepton_feats,
                    [n, self.max_leptons, self.lepton_width],
                    device,
                ),
                tensor2::<B>(&self.lepton_mask, [n, self.max_leptons], device),
            ))
        };
        let lepton_pairs = if self.lepton_pair_feats.is_empty() {
            None
        } else {
            Some((
                tensor3::<B>(
                    &self.lepton_pair_feats,
                    [n, self.n_lepton_pairs(), N_PAIR_FEATURES],
                    device,
                ),
                tensor2::<B>(&self.lepton_pair_mask, [n, self.n_lepton_pairs()], device),
            ))
        };
        let jet_lepton_pairs = if self.jet_lepton_feats.is_empty() {
            None
        } else {
            Some((
                tensor3::<B>(
                    &self.jet_lepton_feats,
                    [n, jets * self.max_leptons, N_PAIR_FEATURES],
                    device,
                ),
                tensor2::<B>(&self.jet_lepton_mask, [n, jets * self.max_leptons], device),
            ))
        };
        let dijet_lepton_pairs = if self.dijet_lepton_feats.is_empty() {
            None
        } else {
            Some((
                tensor3::<B>(
                    &self.dijet_lepton_feats,
                    [n, self.n_jet_pairs() * self.max_leptons, N_PAIR_FEATURES],
                    device,
                ),
                tensor2::<B>(
                    &self.dijet_lepton_mask,
                    [n, self.n_jet_pairs() * self.max_leptons],
                    device,
                ),
            ))
        };
        let categorical = if self.categorical_dim == 0 {
            None
        } else {
            Some(tensor2::<B>(
                &self.categorical,
                [n, self.categorical_dim],
                device,
            ))
        };

        EventBatch {
            jet_feats: tensor3::<B>(&self.jet_feats, [n, jets, self.jet_width], device),
            jet_mask: tensor2::<B>(&self.jet_mask, [n, jets], device),
            jet_edge_grid: Tensor::from_data(
                TensorData::new(
                    self.jet_edge_grid.clone(),
                    [n, jets, jets, N_PAIR_FEATURES],
                ),
                device,
            ),
            jet_pairs: tensor3::<B>(
                &self.jet_pair_feats,
                [n, self.n_jet_pairs(), N_PAIR_FEATURES],
                device,
            ),
            jet_pair_mask: tensor2::<B>(&self.jet_pair_mask, [n, self.n_jet_pairs()], device),
            leptons,
            lepton_pairs,
            jet_lepton_pairs,
            dijet_lepton_pairs,
            boson: tensor3::<B>(&self.boson_feats, [n, 1, 4], device),
            jet_boson_pairs: tensor3::<B>(
                &self.jet_boson_feats,
                [n, jets, N_PAIR_FEATURES],
                device,
            ),
            jet_boson_mask: tensor2::<B>(&self.jet_boson_mask, [n, jets], device),
            dijet_boson_pairs: tensor3::<B>(
                &self.dijet_boson_feats,
                [n, self.n_jet_pairs(), N_PAIR_FEATURES],
                device,
            ),
            dijet_boson_mask: tensor2::<B>(&self.dijet_boson_mask, [n, self.n_jet_pairs()], device),
            globals: tensor2::<B>(&self.globals, [n, self.n_globals], device),
            categorical,
            labels: Tensor::from_data(TensorData::new(self.labels.clone(), [n]), device),
            weights: Tensor::from_data(TensorData::new(self.weights.clone(), [n]), device),
        }
    }
}

fn tensor2<B: Backend>(data: &[f32], shape: [usize; 2], device: &B::Device) -> Tensor<B, 2> {
    Tensor::from_data(TensorData::new(data.to_vec(), shape), device)
}

fn tensor3<B: Backend>(data: &[f32], shape: [usize; 3], device: &B::Device) -> Tensor<B, 3> {
    Tensor::from_data(TensorData::new(data.to_vec(), shape), device)
}

/// A [`HostBatch`] uploaded to a backend device.
#[derive(Debug, Clone)]
pub struct EventBatch<B: Backend> {
    pub jet_feats: Tensor<B, 3>,
    pub jet_mask: Tensor<B, 2>,
    pub jet_edge_grid: Tensor<B, 4>,
    pub jet_pairs: Tensor<B, 3>,
    pub jet_pair_mask: Tensor<B, 2>,
    pub leptons: Option<(Tensor<B, 3>, Tensor<B, 2>)>,
    pub lepton_pairs: Option<(Tensor<B, 3>, Tensor<B, 2>)>,
    pub jet_lepton_pairs: Option<(Tensor<B, 3>, Tensor<B, 2>)>,
    pub dijet_lepton_pairs: Option<(Tensor<B, 3>, Tensor<B, 2>)>,
    pub boson: Tensor<B, 3>,
    pub jet_boson_pairs: Tensor<B, 3>,
    pub jet_boson_mask: Tensor<B, 2>,
    pub dijet_boson_pairs: Tensor<B, 3>,
    pub dijet_boson_mask: Tensor<B, 2>,
    pub globals: Tensor<B, 2>,
    pub categorical: Option<Tensor<B, 2>>,
    pub labels: Tensor<B, 1>,
    pub weights: Tensor<B, 1>,
}

/// Computes all FeatureGeometry products for a batch of events.
///
/// Holds the table schema and analysis channel so configured widths can be
/// checked against the actual table once per batch; a disagreement is a
/// hard error, never a silent reshape.
#[derive(Debug, Clone)]
pub struct FeatureBuilder {
    schema: TableSchema,
    channel: Channel,
}

impl FeatureBuilder {
    pub fn new(schema: TableSchema, channel: Channel) -> anyhow::Result<Self> {
        if schema.max_jets < 2 {
            anyhow::bail!("Channel {channel} needs at least 2 jet slots, schema has {}", schema.max_jets);
        }
        match channel {
            Channel::TwoLepton if schema.max_leptons < 2 => {
                anyhow::bail!("Channel {channel} needs 2 lepton slots, schema has {}", schema.max_leptons)
            }
            Channel::OneLepton if schema.max_leptons < 1 => {
                anyhow::bail!("Channel {channel} needs a lepton slot, schema has none")
            }
            _ => {}
        }
        Ok(Self { schema, channel })
    }

    pub fn channel(&self) -> Channel {
        self.channel
    }

    pub fn schema(&self) -> &TableSchema {
        &self.schema
    }

    /// Per-object feature width of the jet collection.
    pub fn jet_width(&self) -> usize {
        self.schema.n_jet_aux() + 4
    }

    /// Per-object feature width of the lepton collection.
    pub fn lepton_width(&self) -> usize {
        self.schema.n_lepton_aux() + 4
    }

    /// Verify that a table's layout matches the configured schema.
    pub fn check_table(&self, table: &EventTable) -> anyhow::Result<()> {
        let checks = [
            ("jet capacity", table.jet_p4.capacity(), self.schema.max_jets),
            ("jet aux width", table.jet_aux.width(), self.schema.n_jet_aux()),
            ("lepton capacity", table.lepton_p4.capacity(), self.schema.max_leptons),
            ("lepton aux width", table.lepton_aux.width(), self.schema.n_lepton_aux()),
            ("global width", table.globals.width(), self.schema.n_globals()),
        ];
        for (name, actual, configured) in checks {
            if actual != configured {
                anyhow::bail!("Configured {name} is {configured} but the table has {actual}");
            }
        }
        Ok(())
    }

    /// Assemble the host batch for the given event indices.
    pub fn assemble(&self, table: &EventTable, indices: &[usize]) -> anyhow::Result<HostBatch> {
        self.check_table(table)?;
        let n_table = table.n_events();
        if let Some(&bad) = indices.iter().find(|&&i| i >= n_table) {
            anyhow::bail!("Event index {bad} out of range for table of {n_table} events");
        }

        let n = indices.len();
        let jets_cap = self.schema.max_jets;
        let leps_cap = self.schema.max_leptons;
        let categorical_dim = self.channel.categorical_dim();

        let mut batch = HostBatch {
            n_events: n,
            max_jets: jets_cap,
            max_leptons: if self.channel.uses_leptons() { leps_cap } else { 0 },
            jet_width: self.jet_width(),
            lepton_width: self.lepton_width(),
            n_globals: self.schema.n_globals(),
            categorical_dim,
            jet_feats: Vec::with_capacity(n * jets_cap * self.jet_width()),
            jet_mask: Vec::with_capacity(n * jets_cap),
            jet_edge_grid: Vec::with_capacity(n * jets_cap * jets_cap * N_PAIR_FEATURES),
            jet_pair_feats: Vec::new(),
            jet_pair_mask: Vec::new(),
            lepton_feats: Vec::new(),
            lepton_mask: Vec::new(),
            lepton_pair_feats: Vec::new(),
            lepton_pair_mask: Vec::new(),
            jet_lepton_feats: Vec::new(),
            jet_lepton_mask: Vec::new(),
            dijet_lepton_feats: Vec::new(),
            dijet_lepton_mask: Vec::new(),
            boson_feats: Vec::with_capacity(n * 4),
            jet_boson_feats: Vec::new(),
            jet_boson_mask: Vec::new(),
            dijet_boson_feats: Vec::new(),
            dijet_boson_mask: Vec::new(),
            globals: Vec::with_capacity(n * self.schema.n_globals()),
            categorical: Vec::with_capacity(n * categorical_dim),
            labels: Vec::with_capacity(n),
            weights: Vec::with_capacity(n),
        };

        for &event in indices {
            let jets: Vec<FourMomentum> = (0..jets_cap)
                .map(|slot| FourMomentum::from_slice(table.jet_p4.row(event, slot)))
                .collect();

            for (slot, jet) in jets.iter().enumerate() {
                batch.jet_feats.extend_from_slice(table.jet_aux.row(event, slot));
                batch.jet_feats.extend_from_slice(table.jet_p4.row(event, slot));
                batch.jet_mask.push(if jet.is_padding() { 0.0 } else { 1.0 });
            }

            let jet_grid = self_interaction(&jets);
            batch.jet_edge_grid.extend_from_slice(&jet_grid.features);

            let jet_pairs = upper_triangle(&jet_grid);
            batch.jet_pair_feats.extend_from_slice(&jet_pairs.features);
            for &real in &jet_pairs.mask {
                batch.jet_pair_mask.push(if real { 1.0 } else { 0.0 });
            }

            let boson = FourMomentum::from_slice(table.boson_p4.row(event, 0));
            batch
                .boson_feats
                .extend_from_slice(table.boson_p4.row(event, 0));

            let jet_boson = pairwise_interaction(&jets, std::slice::from_ref(&boson));
            batch.jet_boson_feats.extend_from_slice(&jet_boson.features);
            for &real in &jet_boson.mask {
                batch.jet_boson_mask.push(if real { 1.0 } else { 0.0 });
            }

            // Dijet momenta from masked pairs are zero, so the cross grids
            // treat them as padding.
            let dijet_boson = pairwise_interaction(&jet_pairs.momenta, std::slice::from_ref(&boson));
            batch
                .dijet_boson_feats
                .extend_from_slice(&dijet_boson.features);
            for &real in &dijet_boson.mask {
                batch.dijet_boson_mask.push(if real { 1.0 } else { 0.0 });
            }

            if self.channel.uses_leptons() {
                let leptons: Vec<FourMomentum> = (0..leps_cap)
                    .map(|slot| FourMomentum::from_slice(table.lepton_p4.row(event, slot)))
                    .collect();
                for (slot, lepton) in leptons.iter().enumerate() {
                    batch
                        .lepton_feats
                        .extend_from_slice(table.lepton_aux.row(event, slot));
                    batch
                        .lepton_feats
                        .extend_from_slice(table.lepton_p4.row(event, slot));
                    batch
                        .lepton_mask
                        .push(if lepton.is_padding() { 0.0 } else { 1.0 });
                }

                if self.channel.has_lepton_edges() {
                    let lepton_pairs = upper_triangle(&self_interaction(&leptons));
                    batch
                        .lepton_pair_feats
                        .extend_from_slice(&lepton_pairs.features);
                    for &real in &lepton_pairs.mask {
                        batch.lepton_pair_mask.push(if real { 1.0 } else { 0.0 });
                    }
                }

                let cross = pairwise_interaction(&jets, &leptons);
                batch.jet_lepton_feats.extend_from_slice(&cross.features);
                for &real in &cross.mask {
                    batch.jet_lepton_mask.push(if real { 1.0 } else { 0.0 });
                }

                let dijet_cross = pairwise_interaction(&jet_pairs.momenta, &leptons);
                batch
                    .dijet_lepton_feats
                    .extend_from_slice(&dijet_cross.features);
                for &real in &dijet_cross.mask {
                    batch.dijet_lepton_mask.push(if real { 1.0 } else { 0.0 });
                }
            }

            if categorical_dim > 0 {
                let flavor = table.flavor[event];
                if flavor < 0 || flavor as usize >= categorical_dim {
                    anyhow::bail!(
                        "Flavor code {flavor} in event {event} outside the {categorical_dim}-class alphabet"
                    );
                }
                for class in 0..categorical_dim {
                    batch
                        .categorical
                        .push(if class == flavor as usize { 1.0 } else { 0.0 });
                }
            }

            batch.globals.extend_from_slice(table.globals.row(event, 0));
            batch.labels.push(table.labels[event]);
            batch.weights.push(table.weights[event]);
        }

        Ok(batch)
    }
}
