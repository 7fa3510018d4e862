//! Hyperparameter search plumbing.
//!
//! The search driver itself lives outside this crate; a trial shows up
//! here as a [`TrialController`] that hands out parameter suggestions and
//! decides on pruning. [`run_trial`] turns one controller into a full
//! training run in its own run directory.

use std::path::Path;

use burn::tensor::backend::AutodiffBackend;

use crate::model::batch::FeatureBuilder;
use crate::model::classifier::EventClassifierConfig;
use crate::rundir::RunDir;
use crate::training::data::WeightedEventSet;
use crate::training::trainer::{train, TrainOutcome, TrainingConfig};

/// One trial's view of the search driver.
pub trait TrialController {
    /// Suggest a float in `[low, high]`.
    fn suggest_float(&mut self, name: &str, low: f64, high: f64) -> f64;
    /// Suggest an integer in `[low, high]` stepping by `step` from `low`.
    fn suggest_int(&mut self, name: &str, low: usize, high: usize, step: usize) -> usize;
    /// Report an epoch's validation loss; `true` means prune now.
    fn report(&mut self, epoch: usize, val_loss: f64) -> bool;
    /// Trial index within the study.
    fn index(&self) -> usize;
}

/// Parameter ranges explored per trial.
#[derive(Debug, Clone, PartialEq)]
pub struct SearchSpace {
    pub lr: (f64, f64),
    pub dropout: (f64, f64),
    /// (low, high, step); bounds and step keep the hidden width a
    /// multiple of the head count.
    pub hidden_dim: (usize, usize, usize),
    pub embed_dim: (usize, usize, usize),
}

impl Default for SearchSpace {
    fn default() -> Self {
        Self {
            lr: (5e-3, 1e-2),
            dropout: (0.1, 0.3),
            hidden_dim: (32, 128, 16),
            embed_dim: (8, 32, 4),
        }
    }
}

/// Execution slot for a trial: which accelerator and which CPUs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrialSlot {
    pub device_index: usize,
    pub cpu_set: Vec<usize>,
}

/// Round-robin assignment of trials to execution slots.
#[derive(Debug, Clone)]
pub struct ResourceMap {
    slots: Vec<TrialSlot>,
}

impl ResourceMap {
    pub fn new(slots: Vec<TrialSlot>) -> anyhow::Result<Self> {
        if slots.is_empty() {
            anyhow::bail!("Resource map needs at least one slot");
        }
        Ok(Self { slots })
    }

    /// Single-slot map covering the given CPUs on device 0.
    pub fn single(cpu_set: Vec<usize>) -> Self {
        Self {
            slots: vec![TrialSlot {
                device_index: 0,
                cpu_set,
            }],
        }
    }

    pub fn n_slots(&self) -> usize {
        self.slots.len()
    }

    pub fn slot_for(&self, trial_index: usize) -> &TrialSlot {
        &self.slots[trial_index % self.slots.len()]
    }
}

/// Run one search trial end to end.
///
/// Parameters are drawn from the controller, the base configs are
/// overridden with them, and the run directory name records every
/// resolved value. The trial's slot caps the prefetch worker count and
/// picks the device.
#[allow(clippy::too_many_arguments)]
pub fn run_trial<B: AutodiffBackend>(
    space: &SearchSpace,
    base_training: &TrainingConfig,
    base_model: &EventClassifierConfig,
    set: &WeightedEventSet,
    builder: &FeatureBuilder,
    resources: &ResourceMap,
    base_dir: &Path,
    devices: &[B::Device],
    trial: &mut dyn TrialController,
) -> anyhow::Result<TrainOutcome> {
    let lr = trial.suggest_float("lr", space.lr.0, space.lr.1);
    let dropout = trial.suggest_float("dropout", space.dropout.0, space.dropout.1);
    let hidden_dim = trial.suggest_int(
        "hidden_dim",
        space.hidden_dim.0,
        space.hidden_dim.1,
        space.hidden_dim.2,
    );
    let embed_dim = trial.suggest_int(
        "embed_dim",
        space.embed_dim.0,
        space.embed_dim.1,
        space.embed_dim.2,
    );

    let slot = resources.slot_for(trial.index());
    let device = devices
        .get(slot.device_index)
        .ok_or_else(|| {
            anyhow::anyhow!(
                "Slot wants device {} but only {} devices are available",
                slot.device_index,
                devices.len()
            )
        })?;

    let training = base_training
        .clone()
        .with_lr(lr)
        .with_num_workers(base_training.num_workers.min(slot.cpu_set.len()));
    let model = base_model
        .clone()
        .with_dropout(dropout)
        .with_hidden_dim(hidden_dim)
        .with_embed_dim(embed_dim);

    let run_dir = RunDir::new(base_dir)
        .with_label(&format!("trial{}", trial.index()))
        .with_param("lr", format!("{lr:.5}"))
        .with_param("drop", format!("{dropout:.3}"))
        .with_param("hidden", hidden_dim)
        .with_param("embed", embed_dim);

    tracing::info!(
        trial = trial.index(),
        device = slot.device_index,
        workers = training.num_workers,
        run = %run_dir.path().display(),
        "Starting trial"
    );

    let (_, outcome) = train::<B>(
        &training,
        &model,
        set,
        builder,
        &run_dir,
        device,
        Some(trial),
    )?;
    Ok(outcome)
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Deterministic controller: midpoints for floats, stepped midpoints
    /// for integers, optional pruning after a fixed epoch.
    pub struct MockTrial {
        pub index: usize,
        pub prune_after: Option<usize>,
        pub suggested: Vec<(String, f64)>,
    }

    impl MockTrial {
        pub fn new(index: usize) -> Self {
            Self {
                index,
                prune_after: None,
                suggested: Vec::new(),
            }
        }
    }

    impl TrialController for MockTrial {
        fn suggest_float(&mut self, name: &str, low: f64, high: f64) -> f64 {
            let value = 0.5 * (low + high);
            self.suggested.push((name.to_string(), value));
            value
        }

        fn suggest_int(&mut self, name: &str, low: usize, high: usize, step: usize) -> usize {
            let steps = (high - low) / step;
            let value = low + (steps / 2) * step;
            self.suggested.push((name.to_string(), value as f64));
            value
        }

        fn report(&mut self, epoch: usize, _val_loss: f64) -> bool {
            self.prune_after.is_some_and(|cutoff| epoch >= cutoff)
        }

        fn index(&self) -> usize {
            self.index
        }
    }

    #[test]
    fn test_default_space_respects_head_divisibility() {
        let space = SearchSpace::default();
        let (low, high, step) = space.hidden_dim;
        let mut width = low;
        while width <= high {
            assert_eq!(width % 4, 0, "hidden width {width} not a multiple of 4");
            width += step;
        }
        let (low, high, step) = space.embed_dim;
        let mut width = low;
        while width <= high {
            assert_eq!(width % 4, 0, "embed width {width} not a multiple of 4");
            width += step;
        }
    }

    #[test]
    fn test_resource_map_round_robin() {
        let map = ResourceMap::new(vec![
            TrialSlot {
                device_index: 0,
                cpu_set: vec![0, 1],
            },
            TrialSlot {
                device_index: 1,
                cpu_set: vec![2, 3],
            },
        ])
        .unwrap();
        assert_eq!(map.slot_for(0).device_index, 0);
        assert_eq!(map.slot_for(1).device_index, 1);
        assert_eq!(map.slot_for(2).device_index, 0);
        assert_eq!(map.slot_for(5).device_index, 1);
    }

    #[test]
    fn test_resource_map_rejects_empty() {
        assert!(ResourceMap::new(vec![]).is_err());
    }

    #[test]
    fn test_mock_trial_suggests_stepped_midpoints() {
        let mut trial = MockTrial::new(0);
        let space = SearchSpace::default();
        let lr = trial.suggest_float("lr", space.lr.0, space.lr.1);
        assert!((lr - 0.0075).abs() < 1e-12);
        let hidden = trial.suggest_int(
            "hidden_dim",
            space.hidden_dim.0,
            space.hidden_dim.1,
            space.hidden_dim.2,
        );
        // 6 steps from 32 to 128; midpoint lands on a grid point.
        assert_eq!(hidden, 80);
        assert_eq!(trial.suggested.len(), 2);
    }

    #[test]
    fn test_mock_trial_prunes_at_cutoff() {
        let mut trial = MockTrial::new(1);
        trial.prune_after = Some(3);
        assert!(!trial.report(0, 1.0));
        assert!(!trial.report(2, 1.0));
        assert!(trial.report(3, 1.0));
        assert!(trial.report(7, 1.0));
    }
}
