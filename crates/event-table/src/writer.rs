//! Writes an [`EventTable`] to a Parquet file using Arrow.

use std::path::PathBuf;
use std::sync::Arc;

use arrow::array::{ArrayRef, Float32Array, Float32Builder, Int32Array, Int64Array, ListBuilder};
use arrow::datatypes::{DataType, Field, Schema};
use arrow::record_batch::RecordBatch;
use parquet::arrow::ArrowWriter;

use crate::types::{EventTable, ObjectBlock, TableSchema, P4_COLUMNS};

fn list_field(name: &str) -> Field {
    Field::new(
        name,
        DataType::List(Arc::new(Field::new("item", DataType::Float32, true))),
        false,
    )
}

/// Arrow schema of the on-disk table. Object collections are variable-length
/// float lists (padding rows are trimmed on write and restored on read);
/// boson components, globals, and per-event scalars are flat columns.
pub fn table_arrow_schema(schema: &TableSchema, with_score: bool) -> Schema {
    let mut fields = Vec::new();
    for component in P4_COLUMNS {
        fields.push(list_field(&format!("jet_{component}")));
    }
    for column in schema.tagger.score_columns() {
        fields.push(list_field(column));
    }
    for component in P4_COLUMNS {
        fields.push(list_field(&format!("lep_{component}")));
    }
    for column in &schema.lepton_aux {
        fields.push(list_field(column));
    }
    for component in P4_COLUMNS {
        fields.push(Field::new(
            format!("boson_{component}"),
            DataType::Float32,
            false,
        ));
    }
    for column in &schema.globals {
        fields.push(Field::new(column, DataType::Float32, false));
    }
    fields.push(Field::new("flavor", DataType::Int32, false));
    fields.push(Field::new("event", DataType::Int64, false));
    fields.push(Field::new("label", DataType::Float32, false));
    fields.push(Field::new("weight", DataType::Float32, false));
    if with_score {
        fields.push(Field::new("score", DataType::Float32, false));
    }
    Schema::new(fields)
}

/// Writes an [`EventTable`] (optionally with per-event classifier scores)
/// to a single Parquet file.
pub struct EventTableWriter {
    output_path: PathBuf,
    scores: Option<Vec<f32>>,
}

impl EventTableWriter {
    /// Create a writer that will write to the given path.
    pub fn new(output_path: PathBuf) -> Self {
        Self {
            output_path,
            scores: None,
        }
    }

    /// Attach a per-event score column to the output.
    pub fn with_scores(mut self, scores: Vec<f32>) -> Self {
        self.scores = Some(scores);
        self
    }

    /// Write the table and return the output path.
    pub fn write(self, table: &EventTable) -> anyhow::Result<PathBuf> {
        table.validate()?;
        if let Some(scores) = &self.scores {
            if scores.len() != table.n_events() {
                anyhow::bail!(
                    "Score column has {} entries for {} events",
                    scores.len(),
                    table.n_events()
                );
            }
        }

        let schema = Arc::new(table_arrow_schema(&table.schema, self.scores.is_some()));
        let batch = build_record_batch(table, self.scores.as_deref(), schema.clone())?;

        let file = std::fs::File::create(&self.output_path)
            .map_err(|e| anyhow::anyhow!("Failed to create {}: {e}", self.output_path.display()))?;
        let mut writer = ArrowWriter::try_new(file, schema, None)?;
        writer.write(&batch)?;
        writer.close()?;

        tracing::info!(
            events = table.n_events(),
            path = %self.output_path.display(),
            "Wrote event table"
        );

        Ok(self.output_path)
    }
}

/// One list column of an object collection: `component` of `values`, with
/// padding rows (all-zero p4 in `presence`) trimmed per event.
fn padded_list_column(presence: &ObjectBlock, values: &ObjectBlock, component: usize) -> ArrayRef {
    let mut builder = ListBuilder::new(Float32Builder::new());
    for event in 0..presence.n_events() {
        for slot in 0..presence.capacity() {
            if presence.row_is_zero(event, slot) {
                continue;
            }
            builder.values().append_value(values.row(event, slot)[component]);
        }
        builder.append(true);
    }
    Arc::new(builder.finish())
}

/// One flat f32 column from a single-slot block.
fn scalar_column(block: &ObjectBlock, component: usize) -> ArrayRef {
    let values: Float32Array = (0..block.n_events())
        .map(|event| Some(block.row(event, 0)[component]))
        .collect();
    Arc::new(values)
}

fn build_record_batch(
    table: &EventTable,
    scores: Option<&[f32]>,
    schema: Arc<Schema>,
) -> anyhow::Result<RecordBatch> {
    let mut columns: Vec<ArrayRef> = Vec::with_capacity(schema.fields().len());

    for component in 0..4 {
        columns.push(padded_list_column(&table.jet_p4, &table.jet_p4, component));
    }
    for component in 0..table.schema.n_jet_aux() {
        columns.push(padded_list_column(&table.jet_p4, &table.jet_aux, component));
    }
    for component in 0..4 {
        columns.push(padded_list_column(
            &table.lepton_p4,
            &table.lepton_p4,
            component,
        ));
    }
    for component in 0..table.schema.n_lepton_aux() {
        columns.push(padded_list_column(
            &table.lepton_p4,
            &table.lepton_aux,
            component,
        ));
    }
    for component in 0..4 {
        columns.push(scalar_column(&table.boson_p4, component));
    }
    for component in 0..table.schema.n_globals() {
        columns.push(scalar_column(&table.globals, component));
    }

    let flavor: Int32Array = table.flavor.iter().map(|&v| Some(v)).collect();
    columns.push(Arc::new(flavor));
    let event_number: Int64Array = table.event_number.iter().map(|&v| Some(v)).collect();
    columns.push(Arc::new(event_number));
    let labels: Float32Array = table.labels.iter().map(|&v| Some(v)).collect();
    columns.push(Arc::new(labels));
    let weights: Float32Array = table.weights.iter().map(|&v| Some(v)).collect();
    columns.push(Arc::new(weights));
    if let Some(scores) = scores {
        let scores: Float32Array = scores.iter().map(|&v| Some(v)).collect();
        columns.push(Arc::new(scores));
    }

    Ok(RecordBatch::try_new(schema, columns)?)
}
