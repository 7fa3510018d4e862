//! Flat per-event feature table consumed by the graph-attention classifier.
//!
//! The upstream columnar pipeline produces one row per collision event:
//! zero-padded jet and lepton collections, a boson-candidate 4-vector,
//! global scalars, a categorical lepton-flavour code, and label/weight
//! columns. This crate owns the in-memory layout ([`EventTable`]) and its
//! Parquet reader/writer; it knows nothing about tensors or training.

pub mod reader;
pub mod types;
pub mod writer;

pub use reader::EventTableReader;
pub use types::{EventTable, ObjectBlock, TableSchema, Tagger};
pub use writer::EventTableWriter;
