//! Reads an [`EventTable`] from Parquet files.

use std::path::{Path, PathBuf};

use arrow::array::{Array, Float32Array, Int32Array, Int64Array, ListArray};
use arrow::record_batch::RecordBatch;
use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;

use crate::types::{EventTable, ObjectBlock, TableSchema, P4_COLUMNS};

/// Static methods for reading event tables from Parquet files.
///
/// Columns are resolved by name against the configured [`TableSchema`].
/// Object lists longer than the schema capacity are truncated (collections
/// are pt-ordered upstream, so truncation drops the softest objects); shorter
/// lists are zero-padded. Lepton columns are optional so zero-lepton channel
/// files can omit them entirely.
pub struct EventTableReader;

impl EventTableReader {
    /// Read one Parquet file into an [`EventTable`].
    pub fn read(path: &Path, schema: &TableSchema) -> anyhow::Result<EventTable> {
        let file = std::fs::File::open(path)
            .map_err(|e| anyhow::anyhow!("Failed to open {}: {e}", path.display()))?;
        let reader = ParquetRecordBatchReaderBuilder::try_new(file)?.build()?;

        let mut tables = Vec::new();
        for batch_result in reader {
            let batch = batch_result?;
            tables.push(extract_table_from_batch(&batch, schema)?);
        }
        let table = concat_tables(schema.clone(), tables);
        table.validate()?;

        tracing::debug!(
            events = table.n_events(),
            path = %path.display(),
            "Read event table"
        );

        Ok(table)
    }

    /// Read and concatenate multiple Parquet files.
    pub fn read_multiple(paths: &[PathBuf], schema: &TableSchema) -> anyhow::Result<EventTable> {
        let mut tables = Vec::with_capacity(paths.len());
        for path in paths {
            tables.push(Self::read(path, schema)?);
        }
        Ok(concat_tables(schema.clone(), tables))
    }
}

fn concat_tables(schema: TableSchema, tables: Vec<EventTable>) -> EventTable {
    let total: usize = tables.iter().map(|t| t.n_events()).sum();
    let mut merged = EventTable::zeros(schema, total);
    let mut offset = 0;
    for table in tables {
        for event in 0..table.n_events() {
            let dst = offset + event;
            merged
                .jet_aux
                .event_mut(dst)
                .copy_from_slice(table.jet_aux.event(event));
            merged
                .jet_p4
                .event_mut(dst)
                .copy_from_slice(table.jet_p4.event(event));
            merged
                .lepton_aux
                .event_mut(dst)
                .copy_from_slice(table.lepton_aux.event(event));
            merged
                .lepton_p4
                .event_mut(dst)
                .copy_from_slice(table.lepton_p4.event(event));
            merged
                .boson_p4
                .event_mut(dst)
                .copy_from_slice(table.boson_p4.event(event));
            merged
                .globals
                .event_mut(dst)
                .copy_from_slice(table.globals.event(event));
            merged.flavor[dst] = table.flavor[event];
            merged.event_number[dst] = table.event_number[event];
            merged.labels[dst] = table.labels[event];
            merged.weights[dst] = table.weights[event];
        }
        offset += table.n_events();
    }
    merged
}

fn list_column<'a>(batch: &'a RecordBatch, name: &str) -> anyhow::Result<&'a ListArray> {
    let column = batch
        .column_by_name(name)
        .ok_or_else(|| anyhow::anyhow!("Missing column {name}"))?;
    column
        .as_any()
        .downcast_ref::<ListArray>()
        .ok_or_else(|| anyhow::anyhow!("Column {name} is not a List<Float32>"))
}

/// A list column that may be absent (zero-lepton channel files carry no
/// lepton columns at all). Present but mistyped is still an error.
fn optional_list_column<'a>(
    batch: &'a RecordBatch,
    name: &str,
) -> anyhow::Result<Option<&'a ListArray>> {
    match batch.column_by_name(name) {
        None => Ok(None),
        Some(column) => column
            .as_any()
            .downcast_ref::<ListArray>()
            .map(Some)
            .ok_or_else(|| anyhow::anyhow!("Column {name} is not a List<Float32>")),
    }
}

fn f32_column<'a>(batch: &'a RecordBatch, name: &str) -> anyhow::Result<&'a Float32Array> {
    let column = batch
        .column_by_name(name)
        .ok_or_else(|| anyhow::anyhow!("Missing column {name}"))?;
    column
        .as_any()
        .downcast_ref::<Float32Array>()
        .ok_or_else(|| anyhow::anyhow!("Column {name} is not Float32"))
}

/// Copy one list column into `component` of an object block, truncating to
/// the block capacity and leaving missing slots zero.
fn fill_component(
    block: &mut ObjectBlock,
    list: &ListArray,
    component: usize,
    name: &str,
) -> anyhow::Result<()> {
    for event in 0..block.n_events() {
        let values = list.value(event);
        let values = values
            .as_any()
            .downcast_ref::<Float32Array>()
            .ok_or_else(|| anyhow::anyhow!("Column {name} items are not Float32"))?;
        let count = values.len().min(block.capacity());
        for slot in 0..count {
            block.row_mut(event, slot)[component] = values.value(slot);
        }
    }
    Ok(())
}

fn extract_table_from_batch(
    batch: &RecordBatch,
    schema: &TableSchema,
) -> anyhow::Result<EventTable> {
    let n = batch.num_rows();
    let mut table = EventTable::zeros(schema.clone(), n);

    for (component, suffix) in P4_COLUMNS.iter().enumerate() {
        let name = format!("jet_{suffix}");
        let list = list_column(batch, &name)?;
        fill_component(&mut table.jet_p4, list, component, &name)?;
    }
    for (component, name) in schema.tagger.score_columns().iter().enumerate() {
        let list = list_column(batch, name)?;
        fill_component(&mut table.jet_aux, list, component, name)?;
    }
    for (component, suffix) in P4_COLUMNS.iter().enumerate() {
        let name = format!("lep_{suffix}");
        if let Some(list) = optional_list_column(batch, &name)? {
            fill_component(&mut table.lepton_p4, list, component, &name)?;
        }
    }
    for (component, name) in schema.lepton_aux.iter().enumerate() {
        if let Some(list) = optional_list_column(batch, name)? {
            fill_component(&mut table.lepton_aux, list, component, name)?;
        }
    }

    for (component, suffix) in P4_COLUMNS.iter().enumerate() {
        let name = format!("boson_{suffix}");
        let values = f32_column(batch, &name)?;
        for event in 0..n {
            table.boson_p4.row_mut(event, 0)[component] = values.value(event);
        }
    }
    for (component, name) in schema.globals.iter().enumerate() {
        let values = f32_column(batch, name)?;
        for event in 0..n {
            table.globals.row_mut(event, 0)[component] = values.value(event);
        }
    }

    let flavor = batch
        .column_by_name("flavor")
        .and_then(|c| c.as_any().downcast_ref::<Int32Array>())
        .ok_or_else(|| anyhow::anyhow!("Missing or mistyped column flavor"))?;
    let event_number = batch
        .column_by_name("event")
        .and_then(|c| c.as_any().downcast_ref::<Int64Array>())
        .ok_or_else(|| anyhow::anyhow!("Missing or mistyped column event"))?;
    let labels = f32_column(batch, "label")?;
    let weights = f32_column(batch, "weight")?;

    for event in 0..n {
        table.flavor[event] = flavor.value(event);
        table.event_number[event] = event_number.value(event);
        table.labels[event] = labels.value(event);
        table.weights[event] = weights.value(event);
    }

    Ok(table)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Tagger;
    use crate::writer::EventTableWriter;
    use tempfile::TempDir;

    fn make_test_table(n_events: usize) -> EventTable {
        let mut table = EventTable::zeros(TableSchema::default(), n_events);
        for event in 0..n_events {
            let n_jets = 2 + event % 4;
            for slot in 0..n_jets {
                let pt = 100.0 - 10.0 * slot as f32;
                table.set_jet(
                    event,
                    slot,
                    [pt, 0.1 * slot as f32, -0.2 * slot as f32, 5.0],
                    &[0.8 - 0.1 * slot as f32, 0.1 + 0.05 * slot as f32],
                );
            }
            let n_leptons = (event % 3).min(2);
            for slot in 0..n_leptons {
                table.set_lepton(
                    event,
                    slot,
                    [45.0, -0.4, 1.3, 0.105],
                    &[0.02, 0.05],
                );
            }
            table.set_boson(event, [150.0, 0.3, -1.0, 91.2]);
            table.set_globals(event, &[1.0, 32.0, 60.0, 0.7]);
            table.flavor[event] = (event % 2) as i32;
            table.event_number[event] = event as i64;
            table.labels[event] = if event % 2 == 0 { 1.0 } else { 0.0 };
            table.weights[event] = 0.5 + event as f32;
        }
        table
    }

    #[test]
    fn test_roundtrip_write_read() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("roundtrip.parquet");
        let table = make_test_table(20);
        EventTableWriter::new(path.clone()).write(&table).unwrap();

        let read = EventTableReader::read(&path, &table.schema).unwrap();
        assert_eq!(read.n_events(), 20);
        assert_eq!(read.jet_p4, table.jet_p4);
        assert_eq!(read.jet_aux, table.jet_aux);
        assert_eq!(read.lepton_p4, table.lepton_p4);
        assert_eq!(read.lepton_aux, table.lepton_aux);
        assert_eq!(read.boson_p4, table.boson_p4);
        assert_eq!(read.globals, table.globals);
        assert_eq!(read.flavor, table.flavor);
        assert_eq!(read.event_number, table.event_number);
        assert_eq!(read.labels, table.labels);
        assert_eq!(read.weights, table.weights);
    }

    #[test]
    fn test_truncation_to_smaller_capacity() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("wide.parquet");

        let mut table = EventTable::zeros(TableSchema::default(), 1);
        for slot in 0..6 {
            table.set_jet(0, slot, [90.0 - 10.0 * slot as f32, 0.0, 0.0, 4.0], &[0.5, 0.5]);
        }
        EventTableWriter::new(path.clone()).write(&table).unwrap();

        let narrow = TableSchema {
            max_jets: 3,
            ..TableSchema::default()
        };
        let read = EventTableReader::read(&path, &narrow).unwrap();
        assert_eq!(read.jet_p4.capacity(), 3);
        // Leading (hardest) jets survive.
        assert_eq!(read.jet_p4.row(0, 0)[0], 90.0);
        assert_eq!(read.jet_p4.row(0, 2)[0], 70.0);
    }

    #[test]
    fn test_missing_lepton_columns_zero_filled() {
        use arrow::array::{Float32Builder, Int32Array, Int64Array, ListBuilder};
        use arrow::datatypes::{DataType, Field, Schema};
        use parquet::arrow::ArrowWriter;
        use std::sync::Arc;

        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("nolep.parquet");
        let schema = TableSchema::default();

        // A file carrying only jet, boson, global, and scalar columns.
        let mut fields = Vec::new();
        let mut columns: Vec<arrow::array::ArrayRef> = Vec::new();
        let list_type = DataType::List(Arc::new(Field::new("item", DataType::Float32, true)));
        let jet_values: [(&str, f32); 6] = [
            ("jet_pt", 60.0),
            ("jet_eta", 0.5),
            ("jet_phi", -1.0),
            ("jet_mass", 7.0),
            ("jet_btag_pnet_cvl", 0.9),
            ("jet_btag_pnet_cvb", 0.2),
        ];
        for (name, value) in jet_values {
            fields.push(Field::new(name, list_type.clone(), false));
            let mut builder = ListBuilder::new(Float32Builder::new());
            builder.values().append_value(value);
            builder.append(true);
            columns.push(Arc::new(builder.finish()));
        }
        for name in ["boson_pt", "boson_eta", "boson_phi", "boson_mass"] {
            fields.push(Field::new(name, DataType::Float32, false));
            columns.push(Arc::new(Float32Array::from(vec![100.0_f32])));
        }
        for name in &schema.globals {
            fields.push(Field::new(name, DataType::Float32, false));
            columns.push(Arc::new(Float32Array::from(vec![2.0_f32])));
        }
        fields.push(Field::new("flavor", DataType::Int32, false));
        columns.push(Arc::new(Int32Array::from(vec![0])));
        fields.push(Field::new("event", DataType::Int64, false));
        columns.push(Arc::new(Int64Array::from(vec![7_i64])));
        for name in ["label", "weight"] {
            fields.push(Field::new(name, DataType::Float32, false));
            columns.push(Arc::new(Float32Array::from(vec![1.0_f32])));
        }

        let arrow_schema = Arc::new(Schema::new(fields));
        let batch = RecordBatch::try_new(arrow_schema.clone(), columns).unwrap();
        let file = std::fs::File::create(&path).unwrap();
        let mut writer = ArrowWriter::try_new(file, arrow_schema, None).unwrap();
        writer.write(&batch).unwrap();
        writer.close().unwrap();

        let read = EventTableReader::read(&path, &schema).unwrap();
        assert_eq!(read.n_events(), 1);
        assert_eq!(read.jet_p4.row(0, 0)[0], 60.0);
        assert!(read.lepton_is_padding(0, 0));
        assert!(read.lepton_is_padding(0, 1));
        assert_eq!(read.lepton_aux.row(0, 0), &[0.0, 0.0]);
    }

    #[test]
    fn test_missing_jet_column_is_fatal() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("pnet.parquet");
        let table = make_test_table(3);
        EventTableWriter::new(path.clone()).write(&table).unwrap();

        // Reading with a different tagger asks for columns the file lacks.
        let other = TableSchema {
            tagger: Tagger::DeepFlav,
            ..TableSchema::default()
        };
        let err = EventTableReader::read(&path, &other).unwrap_err();
        assert!(err.to_string().contains("jet_btag_deepflav_cvl"));
    }

    #[test]
    fn test_read_multiple_concatenates() {
        let tmp = TempDir::new().unwrap();
        let path_a = tmp.path().join("a.parquet");
        let path_b = tmp.path().join("b.parquet");

        let mut table_a = make_test_table(4);
        for event in 0..4 {
            table_a.event_number[event] = event as i64;
        }
        let mut table_b = make_test_table(3);
        for event in 0..3 {
            table_b.event_number[event] = 100 + event as i64;
        }
        EventTableWriter::new(path_a.clone()).write(&table_a).unwrap();
        EventTableWriter::new(path_b.clone()).write(&table_b).unwrap();

        let merged =
            EventTableReader::read_multiple(&[path_a, path_b], &TableSchema::default()).unwrap();
        assert_eq!(merged.n_events(), 7);
        assert_eq!(merged.event_number[3], 3);
        assert_eq!(merged.event_number[4], 100);
        assert_eq!(merged.jet_p4.event(5), table_b.jet_p4.event(1));
    }
}
