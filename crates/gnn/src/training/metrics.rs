//! Loss history, its artifacts, and evaluation metrics.

use std::path::Path;

use serde::{Deserialize, Serialize};

/// One epoch's losses and learning rate.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct EpochRecord {
    pub epoch: usize,
    pub train_loss: f64,
    pub val_loss: f64,
    pub best_loss: f64,
    pub lr: f64,
}

/// Per-epoch training history with JSON persistence and a PNG loss curve.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LossHistory {
    records: Vec<EpochRecord>,
}

impl LossHistory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, record: EpochRecord) {
        self.records.push(record);
    }

    pub fn records(&self) -> &[EpochRecord] {
        &self.records
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn last(&self) -> Option<&EpochRecord> {
        self.records.last()
    }

    pub fn save_json(&self, path: &Path) -> anyhow::Result<()> {
        let file = std::fs::File::create(path)
            .map_err(|e| anyhow::anyhow!("Failed to create {}: {e}", path.display()))?;
        serde_json::to_writer_pretty(file, self)?;
        Ok(())
    }

    pub fn load_json(path: &Path) -> anyhow::Result<Self> {
        let file = std::fs::File::open(path)
            .map_err(|e| anyhow::anyhow!("Failed to open {}: {e}", path.display()))?;
        Ok(serde_json::from_reader(file)?)
    }

    /// Render train/validation/best loss curves with the learning rate on
    /// a secondary log axis.
    pub fn plot(&self, path: &Path) -> anyhow::Result<()> {
        use plotters::prelude::*;

        if self.records.is_empty() {
            anyhow::bail!("Loss history is empty, nothing to plot");
        }

        let draw_err = |e: &dyn std::fmt::Display| anyhow::anyhow!("Loss plot failed: {e}");

        let root = BitMapBackend::new(path, (900, 600)).into_drawing_area();
        root.fill(&WHITE).map_err(|e| draw_err(&e))?;

        let max_epoch = self.records.last().map(|r| r.epoch as u32).unwrap_or(0) + 1;
        let mut loss_lo = f64::INFINITY;
        let mut loss_hi = f64::NEG_INFINITY;
        let mut lr_lo = f64::INFINITY;
        let mut lr_hi = f64::NEG_INFINITY;
        for r in &self.records {
            for v in [r.train_loss, r.val_loss, r.best_loss] {
                loss_lo = loss_lo.min(v);
                loss_hi = loss_hi.max(v);
            }
            lr_lo = lr_lo.min(r.lr);
            lr_hi = lr_hi.max(r.lr);
        }
        let pad = (loss_hi - loss_lo).max(1e-6) * 0.05;

        let mut chart = ChartBuilder::on(&root)
            .caption("Training history", ("sans-serif", 24))
            .margin(10)
            .x_label_area_size(40)
            .y_label_area_size(60)
            .right_y_label_area_size(60)
            .build_cartesian_2d(0..max_epoch, (loss_lo - pad)..(loss_hi + pad))
            .map_err(|e| draw_err(&e))?
            .set_secondary_coord(0..max_epoch, ((lr_lo * 0.5)..(lr_hi * 2.0)).log_scale());

        chart
            .configure_mesh()
            .x_desc("epoch")
            .y_desc("loss")
            .draw()
            .map_err(|e| draw_err(&e))?;
        chart
            .configure_secondary_axes()
            .y_desc("learning rate")
            .draw()
            .map_err(|e| draw_err(&e))?;

        let series: [(&str, &RGBColor, fn(&EpochRecord) -> f64); 3] = [
            ("train", &BLUE, |r| r.train_loss),
            ("validation", &RED, |r| r.val_loss),
            ("best", &GREEN, |r| r.best_loss),
        ];
        for (label, color, value) in series {
            chart
                .draw_series(LineSeries::new(
                    self.records.iter().map(|r| (r.epoch as u32, value(r))),
                    color,
                ))
                .map_err(|e| draw_err(&e))?
                .label(label)
                .legend(move |(x, y)| PathElement::new(vec![(x, y), (x + 16, y)], color));
        }
        chart
            .draw_secondary_series(LineSeries::new(
                self.records.iter().map(|r| (r.epoch as u32, r.lr)),
                &BLACK,
            ))
            .map_err(|e| draw_err(&e))?
            .label("lr")
            .legend(|(x, y)| PathElement::new(vec![(x, y), (x + 16, y)], &BLACK));

        chart
            .configure_series_labels()
            .background_style(WHITE.mix(0.8))
            .border_style(BLACK)
            .draw()
            .map_err(|e| draw_err(&e))?;
        root.present().map_err(|e| draw_err(&e))?;
        Ok(())
    }
}

/// Weight-aware area under the ROC curve.
///
/// Ties in score contribute half. Weights enter as-is; callers decide
/// whether to clip negative weights beforehand.
pub fn weighted_auc(scores: &[f32], labels: &[f32], weights: &[f32]) -> anyhow::Result<f64> {
    if scores.len() != labels.len() || scores.len() != weights.len() {
        anyhow::bail!(
            "AUC input lengths disagree: {} scores, {} labels, {} weights",
            scores.len(),
            labels.len(),
            weights.len()
        );
    }

    let mut order: Vec<usize> = (0..scores.len()).collect();
    order.sort_by(|&a, &b| scores[a].total_cmp(&scores[b]));

    let mut cum_neg = 0.0_f64;
    let mut numerator = 0.0_f64;
    let mut pos_total = 0.0_f64;
    let mut neg_total = 0.0_f64;

    let mut i = 0;
    while i < order.len() {
        let mut j = i;
        let mut group_pos = 0.0_f64;
        let mut group_neg = 0.0_f64;
        while j < order.len() && scores[order[j]] == scores[order[i]] {
            let idx = order[j];
            if labels[idx] == 1.0 {
                group_pos += weights[idx] as f64;
            } else {
                group_neg += weights[idx] as f64;
            }
            j += 1;
        }
        numerator += group_pos * (cum_neg + 0.5 * group_neg);
        cum_neg += group_neg;
        pos_total += group_pos;
        neg_total += group_neg;
        i = j;
    }

    if pos_total <= 0.0 || neg_total <= 0.0 {
        anyhow::bail!(
            "AUC needs both classes with positive weight: pos={pos_total:.3}, neg={neg_total:.3}"
        );
    }
    Ok(numerator / (pos_total * neg_total))
}
