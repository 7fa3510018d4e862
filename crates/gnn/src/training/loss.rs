//! Binary cross-entropy losses over signal probabilities.

use burn::prelude::*;

const PROB_EPS: f32 = 1e-7;

/// Per-event binary cross-entropy of probabilities against {0, 1} targets.
/// Probabilities are clamped away from the endpoints before the logs.
pub fn binary_cross_entropy<B: Backend>(
    probs: Tensor<B, 1>,
    targets: Tensor<B, 1>,
) -> Tensor<B, 1> {
    let p = probs.clamp(PROB_EPS, 1.0 - PROB_EPS);
    let positive = targets.clone() * p.clone().log();
    let negative = (targets.ones_like() - targets) * (p.ones_like() - p).log();
    (positive + negative).neg()
}

/// Mean unweighted BCE, used in weighted-sampling mode where the draw
/// probabilities already carry the weights.
pub fn mean_bce<B: Backend>(probs: Tensor<B, 1>, targets: Tensor<B, 1>) -> Tensor<B, 1> {
    binary_cross_entropy(probs, targets).mean()
}

/// Mean of weight-multiplied per-event BCE. Signed weights flip the loss
/// direction of their events.
pub fn weighted_bce<B: Backend>(
    probs: Tensor<B, 1>,
    targets: Tensor<B, 1>,
    weights: Tensor<B, 1>,
) -> Tensor<B, 1> {
    (binary_cross_entropy(probs, targets) * weights).mean()
}
