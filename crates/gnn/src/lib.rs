//! Graph-attention classifier for V+heavy-flavour collision events.
//!
//! Builds pairwise relativistic kinematics on the host, runs them through a
//! masked multi-head attention encoder with per-channel branch sets, and
//! trains a binary signal/background classifier with early stopping,
//! plateau learning-rate reduction, and hyperparameter-search hooks.

pub mod inference;
pub mod model;
pub mod rundir;
pub mod search;
pub mod training;
