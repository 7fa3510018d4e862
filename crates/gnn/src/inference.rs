//! Batched scoring of event tables with a trained classifier.

use std::path::Path;

use burn::prelude::*;
use burn::record::{FullPrecisionSettings, NamedMpkFileRecorder};

use event_table::EventTable;

use crate::model::batch::FeatureBuilder;
use crate::model::classifier::{EventClassifier, EventClassifierConfig};
use crate::training::data::WeightedEventSet;
use crate::training::metrics::weighted_auc;

/// A trained classifier bound to a feature builder for scoring tables.
pub struct EventScorer<B: Backend> {
    model: EventClassifier<B>,
    builder: FeatureBuilder,
    device: B::Device,
    batch_size: usize,
}

impl<B: Backend> EventScorer<B> {
    /// Load a scorer from a saved checkpoint.
    pub fn load(
        checkpoint: &Path,
        model_config: &EventClassifierConfig,
        builder: FeatureBuilder,
        device: &B::Device,
    ) -> anyhow::Result<Self> {
        let model = model_config
            .init::<B>(device)
            .load_file(
                checkpoint,
                &NamedMpkFileRecorder::<FullPrecisionSettings>::new(),
                device,
            )
            .map_err(|e| {
                anyhow::anyhow!("Failed to load model from {}: {e}", checkpoint.display())
            })?;
        tracing::info!(checkpoint = %checkpoint.display(), "Loaded scorer");
        Ok(Self::from_model(model, builder, device))
    }

    /// Wrap an in-memory model, e.g. one just returned by training.
    pub fn from_model(model: EventClassifier<B>, builder: FeatureBuilder, device: &B::Device) -> Self {
        Self {
            model,
            builder,
            device: device.clone(),
            batch_size: 1024,
        }
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    /// Score every event in table order.
    pub fn score_table(&self, table: &EventTable) -> anyhow::Result<Vec<f32>> {
        self.builder.check_table(table)?;
        let mut scores = Vec::with_capacity(table.n_events());
        let indices: Vec<usize> = (0..table.n_events()).collect();
        for chunk in indices.chunks(self.batch_size) {
            let batch = self
                .builder
                .assemble(table, chunk)?
                .to_device::<B>(&self.device);
            let chunk_scores: Vec<f32> = self
                .model
                .score(&batch)
                .into_data()
                .to_vec()
                .map_err(|e| anyhow::anyhow!("Failed to read scores back: {e:?}"))?;
            scores.extend(chunk_scores);
        }
        Ok(scores)
    }

    /// Weighted AUC of the scorer against the set's labels, using the
    /// rebalanced weights so both classes count equally.
    pub fn evaluate(&self, set: &WeightedEventSet) -> anyhow::Result<f64> {
        let table = set.table();
        let scores = self.score_table(table)?;
        weighted_auc(&scores, &table.labels, set.weights())
    }
}
