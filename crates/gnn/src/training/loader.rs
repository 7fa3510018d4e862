//! Epoch batch planning and prefetching batch assembly.
//!
//! The plan fixes which events land in which batch before any work starts,
//! so the batch sequence is a pure function of (plan, epoch). Worker
//! threads only parallelize assembly: worker `w` builds batches `w`,
//! `w + W`, ... into its own bounded channel and the consumer drains the
//! channels round-robin, which makes a 0-worker and an N-worker run
//! produce identical batch sequences.

use rand::distributions::{Distribution, WeightedIndex};
use rand::seq::SliceRandom;
use rand::SeedableRng;

use crate::model::batch::{FeatureBuilder, HostBatch};
use crate::training::data::WeightedEventSet;

/// How an epoch's event order is drawn.
#[derive(Debug, Clone, PartialEq)]
pub enum BatchPlan {
    /// Table order, unchanged every epoch.
    Sequential,
    /// Seeded shuffle, reseeded per epoch.
    Shuffled { seed: u64 },
    /// Weighted sampling with replacement, probability proportional to
    /// max(weight, 0). Negative-weight events are never drawn.
    WeightedReplacement { seed: u64 },
}

/// Assembles an epoch's batches for a subset of a [`WeightedEventSet`].
pub struct BatchLoader<'a> {
    set: &'a WeightedEventSet,
    builder: &'a FeatureBuilder,
    indices: Vec<usize>,
    batch_size: usize,
    num_workers: usize,
}

impl<'a> BatchLoader<'a> {
    pub fn new(
        set: &'a WeightedEventSet,
        builder: &'a FeatureBuilder,
        indices: Vec<usize>,
        batch_size: usize,
        num_workers: usize,
    ) -> anyhow::Result<Self> {
        if batch_size == 0 {
            anyhow::bail!("Batch size must be positive");
        }
        if indices.is_empty() {
            anyhow::bail!("Batch loader needs at least one event");
        }
        Ok(Self {
            set,
            builder,
            indices,
            batch_size,
            num_workers,
        })
    }

    pub fn n_events(&self) -> usize {
        self.indices.len()
    }

    pub fn n_batches(&self) -> usize {
        self.indices.len().div_ceil(self.batch_size)
    }

    /// The epoch's event order under the given plan.
    fn epoch_order(&self, plan: &BatchPlan, epoch: u64) -> anyhow::Result<Vec<usize>> {
        match plan {
            BatchPlan::Sequential => Ok(self.indices.clone()),
            BatchPlan::Shuffled { seed } => {
                let mut order = self.indices.clone();
                let mut rng = rand::rngs::StdRng::seed_from_u64(seed.wrapping_add(epoch));
                order.shuffle(&mut rng);
                Ok(order)
            }
            BatchPlan::WeightedReplacement { seed } => {
                let probabilities: Vec<f32> = self
                    .indices
                    .iter()
                    .map(|&i| self.set.weights()[i].max(0.0))
                    .collect();
                let dist = WeightedIndex::new(&probabilities).map_err(|e| {
                    anyhow::anyhow!("Cannot build sampling distribution: {e}")
                })?;
                let mut rng = rand::rngs::StdRng::seed_from_u64(seed.wrapping_add(epoch));
                Ok((0..self.indices.len())
                    .map(|_| self.indices[dist.sample(&mut rng)])
                    .collect())
            }
        }
    }

    fn assemble(&self, chunk: &[usize]) -> anyhow::Result<HostBatch> {
        let mut batch = self.builder.assemble(self.set.table(), chunk)?;
        // Training weights come from the rebalanced set, not the raw table.
        for (w, &event) in batch.weights.iter_mut().zip(chunk) {
            *w = self.set.weights()[event];
        }
        Ok(batch)
    }

    /// Fold over the epoch's batches in deterministic batch order.
    ///
    /// With `num_workers == 0` assembly runs inline; otherwise scoped
    /// worker threads prefetch into bounded channels.
    pub fn fold_batches<T, F>(
        &self,
        plan: &BatchPlan,
        epoch: u64,
        init: T,
        mut f: F,
    ) -> anyhow::Result<T>
    where
        T: Send,
        F: FnMut(T, usize, HostBatch) -> anyhow::Result<T> + Send,
    {
        let order = self.epoch_order(plan, epoch)?;
        let chunks: Vec<&[usize]> = order.chunks(self.batch_size).collect();

        if self.num_workers == 0 {
            let mut acc = init;
            for (batch_index, chunk) in chunks.iter().enumerate() {
                let batch = self.assemble(chunk)?;
                acc = f(acc, batch_index, batch)?;
            }
            return Ok(acc);
        }

        let workers = self.num_workers.min(chunks.len());
        std::thread::scope(|scope| {
            let mut receivers = Vec::with_capacity(workers);
            for worker in 0..workers {
                let (tx, rx) = std::sync::mpsc::sync_channel::<anyhow::Result<HostBatch>>(2);
                receivers.push(rx);
                let worker_chunks: Vec<&[usize]> =
                    chunks.iter().skip(worker).step_by(workers).copied().collect();
                scope.spawn(move || {
                    for chunk in worker_chunks {
                        if tx.send(self.assemble(chunk)).is_err() {
                            // Consumer bailed; stop assembling.
                            break;
                        }
                    }
                });
            }

            let mut acc = init;
            for batch_index in 0..chunks.len() {
                let batch = receivers[batch_index % workers]
                    .recv()
                    .map_err(|_| anyhow::anyhow!("Prefetch worker exited early"))??;
                acc = f(acc, batch_index, batch)?;
            }
            Ok(acc)
        })
    }
}
