//! Training pipeline: weighted event sets and splits, batch planning with
//! prefetch workers, loss functions, loss history and plotting, and the
//! Adam training loop with plateau scheduling and early stopping.

pub mod data;
pub mod loader;
pub mod loss;
pub mod metrics;
pub mod trainer;
