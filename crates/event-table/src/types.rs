//! Data types for the per-event feature table.

use std::fmt;
use std::path::Path;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Jet tagger whose discriminant scores are carried as per-jet auxiliary
/// features. The identifier also selects the Parquet column names.
///
/// An unrecognized tagger is a hard error at construction time: the model
/// width depends on the tagger's score count, so there is no sensible
/// fallback.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Tagger {
    /// ParticleNet charm taggers (CvL, CvB).
    PNet,
    /// DeepJet / DeepFlavour charm taggers.
    DeepFlav,
    /// Robust particle transformer charm taggers.
    RobustParT,
}

impl Tagger {
    /// Parquet column names of this tagger's per-jet scores, in table order.
    pub fn score_columns(&self) -> [&'static str; 2] {
        match self {
            Self::PNet => ["jet_btag_pnet_cvl", "jet_btag_pnet_cvb"],
            Self::DeepFlav => ["jet_btag_deepflav_cvl", "jet_btag_deepflav_cvb"],
            Self::RobustParT => ["jet_btag_robustpart_cvl", "jet_btag_robustpart_cvb"],
        }
    }

    /// Number of per-jet scores this tagger contributes.
    pub fn n_scores(&self) -> usize {
        self.score_columns().len()
    }
}

impl fmt::Display for Tagger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::PNet => write!(f, "PNet"),
            Self::DeepFlav => write!(f, "DeepFlav"),
            Self::RobustParT => write!(f, "RobustParT"),
        }
    }
}

impl FromStr for Tagger {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PNet" => Ok(Self::PNet),
            "DeepFlav" => Ok(Self::DeepFlav),
            "RobustParT" => Ok(Self::RobustParT),
            other => anyhow::bail!("Unrecognized tagger identifier: {other}"),
        }
    }
}

/// Order of the four kinematic components in every p4 block.
pub const P4_COLUMNS: [&str; 4] = ["pt", "eta", "phi", "mass"];

/// Configured layout of the per-event table.
///
/// Capacities and auxiliary column lists are fixed per analysis channel and
/// shared between the Parquet reader and the model configuration, so widths
/// can never silently disagree.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TableSchema {
    /// Fixed jet-collection capacity; events with more jets are truncated,
    /// events with fewer are zero-padded.
    #[serde(default = "default_max_jets")]
    pub max_jets: usize,
    /// Fixed lepton-collection capacity.
    #[serde(default = "default_max_leptons")]
    pub max_leptons: usize,
    /// Jet tagger providing the per-jet auxiliary scores.
    #[serde(default = "default_tagger")]
    pub tagger: Tagger,
    /// Per-lepton auxiliary column names (isolation variables).
    #[serde(default = "default_lepton_aux")]
    pub lepton_aux: Vec<String>,
    /// Per-event global scalar column names (era code, vertex count, MET).
    #[serde(default = "default_globals")]
    pub globals: Vec<String>,
}

fn default_max_jets() -> usize {
    6
}

fn default_max_leptons() -> usize {
    2
}

fn default_tagger() -> Tagger {
    Tagger::PNet
}

fn default_lepton_aux() -> Vec<String> {
    vec!["lep_mini_iso".to_string(), "lep_rel_iso03".to_string()]
}

fn default_globals() -> Vec<String> {
    vec![
        "era".to_string(),
        "n_pv".to_string(),
        "met_pt".to_string(),
        "met_phi".to_string(),
    ]
}

impl Default for TableSchema {
    fn default() -> Self {
        Self {
            max_jets: default_max_jets(),
            max_leptons: default_max_leptons(),
            tagger: default_tagger(),
            lepton_aux: default_lepton_aux(),
            globals: default_globals(),
        }
    }
}

impl TableSchema {
    /// Load a schema from a TOML file.
    pub fn from_toml_file(path: &Path) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("Failed to read schema {}: {e}", path.display()))?;
        let schema: Self = toml::from_str(&contents)?;
        tracing::info!(path = %path.display(), tagger = %schema.tagger, "Loaded table schema");
        Ok(schema)
    }

    /// Number of per-jet auxiliary features (tagger scores).
    pub fn n_jet_aux(&self) -> usize {
        self.tagger.n_scores()
    }

    /// Number of per-lepton auxiliary features.
    pub fn n_lepton_aux(&self) -> usize {
        self.lepton_aux.len()
    }

    /// Number of per-event global scalars.
    pub fn n_globals(&self) -> usize {
        self.globals.len()
    }
}

/// Zero-padded `[n_events, capacity, width]` block of f32 features.
///
/// Rows beyond an event's true object count are all-zero. Presence is
/// derived, never flagged: a p4 row is padding iff all four kinematic
/// components are zero.
#[derive(Debug, Clone, PartialEq)]
pub struct ObjectBlock {
    data: Vec<f32>,
    n_events: usize,
    capacity: usize,
    width: usize,
}

impl ObjectBlock {
    /// Create a zero-filled block.
    pub fn zeros(n_events: usize, capacity: usize, width: usize) -> Self {
        Self {
            data: vec![0.0; n_events * capacity * width],
            n_events,
            capacity,
            width,
        }
    }

    /// Wrap an existing flat buffer, validating its length.
    pub fn from_vec(
        data: Vec<f32>,
        n_events: usize,
        capacity: usize,
        width: usize,
    ) -> anyhow::Result<Self> {
        if data.len() != n_events * capacity * width {
            anyhow::bail!(
                "ObjectBlock buffer length {} does not match {n_events}x{capacity}x{width}",
                data.len()
            );
        }
        Ok(Self {
            data,
            n_events,
            capacity,
            width,
        })
    }

    pub fn n_events(&self) -> usize {
        self.n_events
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn width(&self) -> usize {
        self.width
    }

    /// One object's feature row.
    pub fn row(&self, event: usize, slot: usize) -> &[f32] {
        let start = (event * self.capacity + slot) * self.width;
        &self.data[start..start + self.width]
    }

    /// Mutable feature row.
    pub fn row_mut(&mut self, event: usize, slot: usize) -> &mut [f32] {
        let start = (event * self.capacity + slot) * self.width;
        &mut self.data[start..start + self.width]
    }

    /// All rows of one event, flattened to `capacity * width`.
    pub fn event(&self, event: usize) -> &[f32] {
        let start = event * self.capacity * self.width;
        &self.data[start..start + self.capacity * self.width]
    }

    /// Mutable view of one event's rows.
    pub fn event_mut(&mut self, event: usize) -> &mut [f32] {
        let start = event * self.capacity * self.width;
        &mut self.data[start..start + self.capacity * self.width]
    }

    /// Whether a row is all-zero (a padding row for p4 blocks).
    pub fn row_is_zero(&self, event: usize, slot: usize) -> bool {
        self.row(event, slot).iter().all(|&v| v == 0.0)
    }

    /// The whole flat buffer.
    pub fn as_slice(&self) -> &[f32] {
        &self.data
    }
}

/// The flat per-event feature table.
///
/// One entry per collision event. Object collections are zero-padded to the
/// schema capacities; the boson candidate and global scalars are
/// single-slot blocks. Weights may carry sign (negative generator weights).
#[derive(Debug, Clone)]
pub struct EventTable {
    pub schema: TableSchema,
    /// Per-jet tagger scores, `[n, max_jets, n_jet_aux]`.
    pub jet_aux: ObjectBlock,
    /// Per-jet (pt, eta, phi, mass), `[n, max_jets, 4]`.
    pub jet_p4: ObjectBlock,
    /// Per-lepton isolation variables, `[n, max_leptons, n_lepton_aux]`.
    pub lepton_aux: ObjectBlock,
    /// Per-lepton (pt, eta, phi, mass), `[n, max_leptons, 4]`.
    pub lepton_p4: ObjectBlock,
    /// Boson-candidate proxy 4-vector, `[n, 1, 4]`.
    pub boson_p4: ObjectBlock,
    /// Global scalars, `[n, 1, n_globals]`.
    pub globals: ObjectBlock,
    /// Categorical lepton-flavour code (2-class alphabet).
    pub flavor: Vec<i32>,
    /// Event number, used for the parity train/validation split.
    pub event_number: Vec<i64>,
    /// Binary class label (1 = signal).
    pub labels: Vec<f32>,
    /// Per-event training weight, possibly signed.
    pub weights: Vec<f32>,
}

impl EventTable {
    /// Create a zero-filled table for `n_events` events.
    pub fn zeros(schema: TableSchema, n_events: usize) -> Self {
        let jet_aux = ObjectBlock::zeros(n_events, schema.max_jets, schema.n_jet_aux());
        let jet_p4 = ObjectBlock::zeros(n_events, schema.max_jets, 4);
        let lepton_aux = ObjectBlock::zeros(n_events, schema.max_leptons, schema.n_lepton_aux());
        let lepton_p4 = ObjectBlock::zeros(n_events, schema.max_leptons, 4);
        let boson_p4 = ObjectBlock::zeros(n_events, 1, 4);
        let globals = ObjectBlock::zeros(n_events, 1, schema.n_globals());
        Self {
            schema,
            jet_aux,
            jet_p4,
            lepton_aux,
            lepton_p4,
            boson_p4,
            globals,
            flavor: vec![0; n_events],
            event_number: vec![0; n_events],
            labels: vec![0.0; n_events],
            weights: vec![1.0; n_events],
        }
    }

    /// Number of events in the table.
    pub fn n_events(&self) -> usize {
        self.labels.len()
    }

    /// Check that every column agrees on the event count.
    pub fn validate(&self) -> anyhow::Result<()> {
        let n = self.n_events();
        let counts = [
            ("jet_aux", self.jet_aux.n_events()),
            ("jet_p4", self.jet_p4.n_events()),
            ("lepton_aux", self.lepton_aux.n_events()),
            ("lepton_p4", self.lepton_p4.n_events()),
            ("boson_p4", self.boson_p4.n_events()),
            ("globals", self.globals.n_events()),
            ("flavor", self.flavor.len()),
            ("event_number", self.event_number.len()),
            ("weights", self.weights.len()),
        ];
        for (name, count) in counts {
            if count != n {
                anyhow::bail!("Column {name} has {count} events, expected {n}");
            }
        }
        Ok(())
    }

    /// Set a jet's p4 and auxiliary scores.
    pub fn set_jet(&mut self, event: usize, slot: usize, p4: [f32; 4], aux: &[f32]) {
        self.jet_p4.row_mut(event, slot).copy_from_slice(&p4);
        self.jet_aux.row_mut(event, slot).copy_from_slice(aux);
    }

    /// Set a lepton's p4 and auxiliary variables.
    pub fn set_lepton(&mut self, event: usize, slot: usize, p4: [f32; 4], aux: &[f32]) {
        self.lepton_p4.row_mut(event, slot).copy_from_slice(&p4);
        self.lepton_aux.row_mut(event, slot).copy_from_slice(aux);
    }

    /// Set the boson-candidate proxy 4-vector.
    pub fn set_boson(&mut self, event: usize, p4: [f32; 4]) {
        self.boson_p4.row_mut(event, 0).copy_from_slice(&p4);
    }

    /// Set the global scalar vector.
    pub fn set_globals(&mut self, event: usize, values: &[f32]) {
        self.globals.row_mut(event, 0).copy_from_slice(values);
    }

    /// Whether a jet slot is a padding row (all-zero p4).
    pub fn jet_is_padding(&self, event: usize, slot: usize) -> bool {
        self.jet_p4.row_is_zero(event, slot)
    }

    /// Whether a lepton slot is a padding row (all-zero p4).
    pub fn lepton_is_padding(&self, event: usize, slot: usize) -> bool {
        self.lepton_p4.row_is_zero(event, slot)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tagger_parse_and_columns() {
        assert_eq!("PNet".parse::<Tagger>().unwrap(), Tagger::PNet);
        assert_eq!("DeepFlav".parse::<Tagger>().unwrap(), Tagger::DeepFlav);
        assert_eq!("RobustParT".parse::<Tagger>().unwrap(), Tagger::RobustParT);
        assert_eq!(
            Tagger::PNet.score_columns(),
            ["jet_btag_pnet_cvl", "jet_btag_pnet_cvb"]
        );
        assert_eq!(Tagger::DeepFlav.n_scores(), 2);
    }

    #[test]
    fn test_unrecognized_tagger_is_fatal() {
        let err = "DeepCSV".parse::<Tagger>().unwrap_err();
        assert!(err.to_string().contains("Unrecognized tagger"));
    }

    #[test]
    fn test_schema_defaults() {
        let schema = TableSchema::default();
        assert_eq!(schema.max_jets, 6);
        assert_eq!(schema.max_leptons, 2);
        assert_eq!(schema.n_jet_aux(), 2);
        assert_eq!(schema.n_lepton_aux(), 2);
        assert_eq!(schema.n_globals(), 4);
    }

    #[test]
    fn test_schema_from_toml() {
        let toml_str = r#"
max_jets = 4
tagger = "DeepFlav"
globals = ["era", "n_pv"]
"#;
        let schema: TableSchema = toml::from_str(toml_str).unwrap();
        assert_eq!(schema.max_jets, 4);
        assert_eq!(schema.max_leptons, 2); // default
        assert_eq!(schema.tagger, Tagger::DeepFlav);
        assert_eq!(schema.n_globals(), 2);
    }

    #[test]
    fn test_block_rows() {
        let mut block = ObjectBlock::zeros(2, 3, 4);
        block.row_mut(1, 2).copy_from_slice(&[1.0, 2.0, 3.0, 4.0]);
        assert_eq!(block.row(1, 2), &[1.0, 2.0, 3.0, 4.0]);
        assert_eq!(block.row(0, 0), &[0.0; 4]);
        assert!(block.row_is_zero(0, 1));
        assert!(!block.row_is_zero(1, 2));
        assert_eq!(block.event(1).len(), 12);
    }

    #[test]
    fn test_block_length_mismatch() {
        let err = ObjectBlock::from_vec(vec![0.0; 10], 2, 3, 4).unwrap_err();
        assert!(err.to_string().contains("does not match"));
    }

    #[test]
    fn test_table_padding_derived_from_p4() {
        let mut table = EventTable::zeros(TableSchema::default(), 1);
        table.set_jet(0, 0, [50.0, 0.1, 0.2, 5.0], &[0.9, 0.1]);
        // Slot 1 keeps a zero p4 but gets garbage aux content: still padding.
        table.jet_aux.row_mut(0, 1).copy_from_slice(&[0.7, 0.7]);
        assert!(!table.jet_is_padding(0, 0));
        assert!(table.jet_is_padding(0, 1));
        assert!(table.lepton_is_padding(0, 0));
    }

    #[test]
    fn test_table_validate() {
        let mut table = EventTable::zeros(TableSchema::default(), 3);
        table.validate().unwrap();
        table.weights.pop();
        assert!(table.validate().is_err());
    }
}
