//! Adam training loop with plateau learning-rate reduction, early
//! stopping, checkpointing, and trial reporting.

use std::path::Path;
use std::time::Instant;

use burn::grad_clipping::GradientClippingConfig;
use burn::module::AutodiffModule;
use burn::optim::{AdamConfig, GradientsParams, Optimizer};
use burn::prelude::*;
use burn::record::{FullPrecisionSettings, NamedMpkFileRecorder};
use burn::tensor::backend::AutodiffBackend;
use indicatif::{ProgressBar, ProgressStyle};
use serde::{Deserialize, Serialize};

use crate::model::batch::FeatureBuilder;
use crate::model::classifier::{EventClassifier, EventClassifierConfig};
use crate::rundir::RunDir;
use crate::search::TrialController;
use crate::training::data::WeightedEventSet;
use crate::training::loader::{BatchLoader, BatchPlan};
use crate::training::loss::{mean_bce, weighted_bce};
use crate::training::metrics::{EpochRecord, LossHistory};

/// How training and validation subsets are chosen.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum SplitStrategy {
    /// Even event numbers train, odd validate. Deterministic and
    /// exhaustive.
    Parity,
    /// Seeded shuffle split with the given training fraction.
    Random { fraction: f64, seed: u64 },
}

/// Training hyperparameters.
#[derive(Config, Debug)]
pub struct TrainingConfig {
    /// Initial Adam learning rate.
    #[config(default = 0.00776)]
    pub lr: f64,
    /// Epoch cap.
    #[config(default = 1000)]
    pub max_epochs: usize,
    /// Epochs without validation improvement before stopping.
    #[config(default = 80)]
    pub early_stop_patience: usize,
    /// Epochs between status logs, intermediate checkpoints, and
    /// loss-curve refreshes.
    #[config(default = 20)]
    pub report_every: usize,
    /// Multiplier applied to the learning rate on a plateau.
    #[config(default = 0.7)]
    pub plateau_factor: f64,
    /// Plateau length before the learning rate is reduced.
    #[config(default = 15)]
    pub plateau_patience: usize,
    /// Gradient norm clip.
    #[config(default = 10.0)]
    pub grad_clip_norm: f64,
    /// Training batch size.
    #[config(default = 256)]
    pub batch_size: usize,
    /// Validation batch size.
    #[config(default = 1024)]
    pub eval_batch_size: usize,
    /// Prefetch workers; 0 assembles batches inline.
    #[config(default = 0)]
    pub num_workers: usize,
    /// Weighted sampling with an unweighted loss; otherwise shuffled
    /// sampling with a weighted loss.
    #[config(default = true)]
    pub weighted_sampling: bool,
    /// Epoch sampling seed.
    #[config(default = 42)]
    pub seed: u64,
    /// Train/validation split.
    #[config(default = "SplitStrategy::Parity")]
    pub split: SplitStrategy,
}

/// Reduce-on-plateau learning rate schedule.
#[derive(Debug, Clone)]
pub struct PlateauScheduler {
    lr: f64,
    factor: f64,
    patience: usize,
    best: f64,
    since_improvement: usize,
}

impl PlateauScheduler {
    pub fn new(initial_lr: f64, factor: f64, patience: usize) -> Self {
        Self {
            lr: initial_lr,
            factor,
            patience,
            best: f64::INFINITY,
            since_improvement: 0,
        }
    }

    pub fn lr(&self) -> f64 {
        self.lr
    }

    /// Observe a validation loss and return the learning rate for the
    /// next epoch.
    pub fn step(&mut self, val_loss: f64) -> f64 {
        if val_loss < self.best {
            self.best = val_loss;
            self.since_improvement = 0;
        } else {
            self.since_improvement += 1;
            if self.since_improvement > self.patience {
                self.lr *= self.factor;
                self.since_improvement = 0;
                tracing::info!(lr = self.lr, "Plateau reached, learning rate reduced");
            }
        }
        self.lr
    }
}

/// Whether the loop should keep going after an epoch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Progress {
    Continue,
    Stop,
}

/// Early-stopping state threaded explicitly through the loop.
#[derive(Debug, Clone)]
pub struct TrainerState {
    pub best_loss: f64,
    pub best_epoch: usize,
    pub since_improvement: usize,
    pub patience: usize,
}

impl TrainerState {
    pub fn new(patience: usize) -> Self {
        Self {
            best_loss: f64::INFINITY,
            best_epoch: 0,
            since_improvement: 0,
            patience,
        }
    }

    /// Record an epoch's validation loss and decide whether to continue.
    pub fn observe(&mut self, epoch: usize, val_loss: f64) -> Progress {
        if val_loss < self.best_loss {
            self.best_loss = val_loss;
            self.best_epoch = epoch;
            self.since_improvement = 0;
            return Progress::Continue;
        }
        self.since_improvement += 1;
        if self.since_improvement > self.patience {
            Progress::Stop
        } else {
            Progress::Continue
        }
    }
}

/// Why a completed run stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StopReason {
    EarlyStop,
    MaxEpochs,
}

/// Outcome of a training run. Pruning is control flow, not failure.
#[derive(Debug, Clone, PartialEq)]
pub enum TrainOutcome {
    Completed {
        best_loss: f64,
        best_epoch: usize,
        reason: StopReason,
    },
    Pruned {
        epoch: usize,
    },
}

/// Run the training loop and return the best model with the outcome.
///
/// Every epoch: train over the sampled batches, validate on the held-out
/// subset with autodiff disabled, step the plateau scheduler, check for
/// improvement, and give an attached trial the chance to prune. Every
/// `report_every` epochs the best model so far is checkpointed and the
/// loss artifacts are refreshed. On completion the best-epoch parameters are
/// saved and returned as the live model.
#[allow(clippy::too_many_arguments)]
pub fn train<B: AutodiffBackend>(
    config: &TrainingConfig,
    model_config: &EventClassifierConfig,
    set: &WeightedEventSet,
    builder: &FeatureBuilder,
    run_dir: &RunDir,
    device: &B::Device,
    mut trial: Option<&mut dyn TrialController>,
) -> anyhow::Result<(EventClassifier<B>, TrainOutcome)> {
    run_dir.create()?;

    let (train_indices, val_indices) = match &config.split {
        SplitStrategy::Parity => set.split_parity(),
        SplitStrategy::Random { fraction, seed } => set.split_random(*fraction, *seed),
    };
    tracing::info!(
        train_events = train_indices.len(),
        val_events = val_indices.len(),
        channel = %builder.channel(),
        run = %run_dir.path().display(),
        "Starting training"
    );

    let train_loader = BatchLoader::new(
        set,
        builder,
        train_indices,
        config.batch_size,
        config.num_workers,
    )?;
    let val_loader = BatchLoader::new(
        set,
        builder,
        val_indices,
        config.eval_batch_size,
        config.num_workers,
    )?;
    let plan = if config.weighted_sampling {
        BatchPlan::WeightedReplacement { seed: config.seed }
    } else {
        BatchPlan::Shuffled { seed: config.seed }
    };

    let mut optimizer = AdamConfig::new()
        .with_grad_clipping(Some(GradientClippingConfig::Norm(
            config.grad_clip_norm as f32,
        )))
        .init();

    let mut model = model_config.init::<B>(device);
    let mut best_model = model.clone();
    let mut scheduler = PlateauScheduler::new(config.lr, config.plateau_factor, config.plateau_patience);
    let mut state = TrainerState::new(config.early_stop_patience);
    let mut history = LossHistory::new();
    let mut lr = config.lr;
    let recorder = NamedMpkFileRecorder::<FullPrecisionSettings>::new();
    let started = Instant::now();

    let progress = if trial.is_none() {
        let pb = ProgressBar::new(config.max_epochs as u64);
        pb.set_style(
            ProgressStyle::default_bar()
                .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} ({eta}) {msg}")
                .unwrap_or_else(|_| ProgressStyle::default_bar())
                .progress_chars("=> "),
        );
        Some(pb)
    } else {
        None
    };

    let mut reason = StopReason::MaxEpochs;
    for epoch in 0..config.max_epochs {
        let (m, o, loss_sum, n_batches) = train_loader.fold_batches(
            &plan,
            epoch as u64,
            (model, optimizer, 0.0_f64, 0_usize),
            |(model, mut optimizer, sum, count), _, host| {
                let batch = host.to_device::<B>(device);
                let probs = model.score(&batch);
                let loss = if config.weighted_sampling {
                    mean_bce(probs, batch.labels.clone())
                } else {
                    weighted_bce(probs, batch.labels.clone(), batch.weights.clone())
                };
                let loss_value: f64 = loss.clone().into_scalar().elem();
                let grads = GradientsParams::from_grads(loss.backward(), &model);
                let model = optimizer.step(lr, model, grads);
                Ok((model, optimizer, sum + loss_value, count + 1))
            },
        )?;
        model = m;
        optimizer = o;
        let train_loss = loss_sum / n_batches.max(1) as f64;

        let val_model = model.valid();
        let (val_sum, val_batches) = val_loader.fold_batches(
            &BatchPlan::Sequential,
            0,
            (0.0_f64, 0_usize),
            move |(sum, count), _, host| {
                let batch = host.to_device::<B::InnerBackend>(device);
                let probs = val_model.score(&batch);
                let loss = if config.weighted_sampling {
                    mean_bce(probs, batch.labels.clone())
                } else {
                    weighted_bce(probs, batch.labels.clone(), batch.weights.clone())
                };
                let loss_value: f64 = loss.into_scalar().elem();
                Ok((sum + loss_value, count + 1))
            },
        )?;
        let val_loss = val_sum / val_batches.max(1) as f64;

        if val_loss < state.best_loss {
            best_model = model.clone();
        }
        let progress_decision = state.observe(epoch, val_loss);
        lr = scheduler.step(val_loss);
        history.push(EpochRecord {
            epoch,
            train_loss,
            val_loss,
            best_loss: state.best_loss,
            lr,
        });

        if let Some(t) = trial.as_deref_mut() {
            if t.report(epoch, val_loss) {
                tracing::info!(epoch, val_loss, "Trial pruned");
                return Ok((best_model, TrainOutcome::Pruned { epoch }));
            }
        }

        if config.report_every > 0 && epoch > 0 && epoch % config.report_every == 0 {
            tracing::info!(
                epoch,
                train_loss = format!("{train_loss:.5}"),
                val_loss = format!("{val_loss:.5}"),
                best_loss = format!("{:.5}", state.best_loss),
                lr = format!("{lr:.2e}"),
                "Epoch status"
            );
            let checkpoint_dir = run_dir.checkpoints_dir().join(format!("epoch_{epoch}"));
            std::fs::create_dir_all(&checkpoint_dir)?;
            best_model
                .clone()
                .save_file(checkpoint_dir.join("model"), &recorder)
                .map_err(|e| anyhow::anyhow!("Failed to save checkpoint at epoch {epoch}: {e}"))?;
            history.save_json(&run_dir.artifact("history.json"))?;
            history.plot(&run_dir.artifact("loss.png"))?;
        }

        if let Some(pb) = &progress {
            pb.set_message(format!("val {val_loss:.5}"));
            pb.inc(1);
        }

        if progress_decision == Progress::Stop {
            reason = StopReason::EarlyStop;
            break;
        }
    }

    if let Some(pb) = &progress {
        pb.finish_with_message("done");
    }

    best_model
        .clone()
        .save_file(run_dir.artifact("model_best"), &recorder)
        .map_err(|e| anyhow::anyhow!("Failed to save best model: {e}"))?;
    model_config
        .save(run_dir.artifact("model_config.json"))
        .map_err(|e| anyhow::anyhow!("Failed to save model config: {e}"))?;
    config
        .save(run_dir.artifact("training_config.json"))
        .map_err(|e| anyhow::anyhow!("Failed to save training config: {e}"))?;
    if !history.is_empty() {
        history.save_json(&run_dir.artifact("history.json"))?;
        history.plot(&run_dir.artifact("loss.png"))?;
    }

    tracing::info!(
        best_loss = state.best_loss,
        best_epoch = state.best_epoch,
        ?reason,
        elapsed_secs = format!("{:.1}", started.elapsed().as_secs_f64()),
        "Training finished"
    );

    Ok((
        best_model,
        TrainOutcome::Completed {
            best_loss: state.best_loss,
            best_epoch: state.best_epoch,
            reason,
        },
    ))
}

/// Load a classifier from a saved checkpoint: fresh model from config,
/// recorded weights on top.
pub fn resume_from_checkpoint<B: Backend>(
    path: &Path,
    config: &EventClassifierConfig,
    device: &B::Device,
) -> anyhow::Result<EventClassifier<B>> {
    let model = config
        .init::<B>(device)
        .load_file(
            path,
            &NamedMpkFileRecorder::<FullPrecisionSettings>::new(),
            device,
        )
        .map_err(|e| anyhow::anyhow!("Failed to load checkpoint from {}: {e}", path.display()))?;
    Ok(model)
}
