//! Model components: host-side pairwise kinematics, batch assembly and
//! tensor upload, masked attention, the per-channel branch encoder, and the
//! classifier head.

pub mod attention;
pub mod batch;
pub mod classifier;
pub mod encoder;
pub mod kinematics;
