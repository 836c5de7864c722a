use crate::api_client::ReportRow;
use crate::error::Error;
use datafusion::arrow::array::{ArrayRef, RecordBatch, StringBuilder};
use datafusion::arrow::csv::{Writer, WriterBuilder};
use datafusion::arrow::datatypes::{DataType, Field, Schema, SchemaRef};
use serde::Serialize;
use serde_json::Value;
use std::fs::{self, File};
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Column tagging every output row with the advertiser it was fetched for.
pub const ADVERTISER_COLUMN: &str = "ex_advertiser_id";

const TIME_DIMENSIONS: [&str; 2] = ["stat_time_day", "stat_time_hour"];

/// Description of the output table: its columns, primary key and load mode.
#[derive(Serialize, Debug, Clone, PartialEq)]
pub struct OutputTable {
    #[serde(skip)]
    pub name: String,
    pub incremental: bool,
    pub primary_key: Vec<String>,
    pub columns: Vec<String>,
}

impl OutputTable {
    ///
    /// Builds the table definition for the declared dimensions and metrics.
    ///
    /// # Arguments
    /// * `name` - The user supplied table name, sanitized with [`normalize_table_name`]
    /// * `dimensions` - Declared dimensions, in order
    /// * `metrics` - Declared metrics, in order
    /// * `incremental` - Whether the destination upserts by primary key
    pub fn new(name: &str, dimensions: &[String], metrics: &[String], incremental: bool) -> Self {
        let (columns, primary_key) = columns_and_keys(dimensions, metrics);
        OutputTable {
            name: normalize_table_name(name),
            incremental,
            primary_key,
            columns,
        }
    }

    /// True when the table is loaded incrementally without any time dimension
    /// in its key, so every load overwrites rows with no bounded date range.
    pub fn lacks_time_key(&self) -> bool {
        self.incremental
            && !self
                .columns
                .iter()
                .any(|column| TIME_DIMENSIONS.contains(&column.as_str()))
    }

    /// Directory holding one sliced file per advertiser.
    pub fn slices_dir(&self, tables_dir: &Path) -> PathBuf {
        tables_dir.join(&self.name)
    }

    /// Arrow schema of the output: every column is a nullable string.
    pub fn schema(&self) -> SchemaRef {
        Arc::new(Schema::new(
            self.columns
                .iter()
                .map(|column| Field::new(column, DataType::Utf8, true))
                .collect::<Vec<_>>(),
        ))
    }

    /// Writes `<name>.manifest` next to the sliced directory.
    pub fn write_manifest(&self, tables_dir: &Path) -> Result<PathBuf, Error> {
        let path = tables_dir.join(format!("{}.manifest", self.name));
        let file = File::create(&path)?;
        serde_json::to_writer_pretty(file, self)?;
        Ok(path)
    }
}

/// Output columns are the advertiser tag, then dimensions, then metrics. The
/// primary key is the tag plus dimensions.
pub fn columns_and_keys(dimensions: &[String], metrics: &[String]) -> (Vec<String>, Vec<String>) {
    let primary_key: Vec<String> = std::iter::once(ADVERTISER_COLUMN.to_string())
        .chain(dimensions.iter().cloned())
        .collect();
    let columns = primary_key.iter().chain(metrics).cloned().collect();
    (columns, primary_key)
}

/// Keeps `[A-Za-z0-9_-]` and appends `.csv`.
pub fn normalize_table_name(name: &str) -> String {
    let cleaned: String = name
        .replace(".csv", "")
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || *c == '_' || *c == '-')
        .collect();
    format!("{cleaned}.csv")
}

/// Converts one page of report rows into a record batch matching `schema`.
///
/// Values are looked up by column name: the advertiser tag first, then the
/// row's metrics, then its dimensions. Missing keys and JSON nulls become nulls.
pub fn page_to_record_batch(
    rows: &[ReportRow],
    advertiser_id: &str,
    schema: SchemaRef,
) -> Result<RecordBatch, Error> {
    let mut builders: Vec<StringBuilder> = schema
        .fields()
        .iter()
        .map(|_| StringBuilder::with_capacity(rows.len(), rows.len() * 16))
        .collect();

    for row in rows {
        for (field, builder) in schema.fields().iter().zip(builders.iter_mut()) {
            let column = field.name().as_str();
            if column == ADVERTISER_COLUMN {
                builder.append_value(advertiser_id);
                continue;
            }

            let value = row
                .metrics
                .get(column)
                .or_else(|| row.dimensions.get(column));
            match value {
                None | Some(Value::Null) => builder.append_null(),
                Some(Value::String(text)) => builder.append_value(text),
                Some(other) => builder.append_value(other.to_string()),
            }
        }
    }

    let columns: Vec<ArrayRef> = builders
        .iter_mut()
        .map(|builder| Arc::new(builder.finish()) as ArrayRef)
        .collect();

    Ok(RecordBatch::try_new(schema, columns)?)
}

/// Header-less CSV file receiving every page fetched for one advertiser.
pub struct AdvertiserSink {
    advertiser_id: String,
    schema: SchemaRef,
    writer: Writer<File>,
    path: PathBuf,
    rows_written: usize,
}

impl AdvertiserSink {
    /// Creates (or truncates) `<dir>/<advertiser_id>.csv`.
    ///
    /// # Errors
    /// [`Error::ConfigValidation`] if the id is not a plain `[A-Za-z0-9_-]` token,
    /// so it can never name a file outside `dir`.
    pub fn create(dir: &Path, advertiser_id: &str, schema: SchemaRef) -> Result<Self, Error> {
        if !is_safe_file_stem(advertiser_id) {
            return Err(Error::ConfigValidation {
                message: format!("advertiser id '{advertiser_id}' is not a valid identifier"),
            });
        }

        let path = dir.join(format!("{advertiser_id}.csv"));
        let file = File::create(&path)?;
        let writer = WriterBuilder::new().with_header(false).build(file);

        Ok(AdvertiserSink {
            advertiser_id: advertiser_id.to_string(),
            schema,
            writer,
            path,
            rows_written: 0,
        })
    }

    /// Appends one page. The page is on disk when this returns.
    pub fn write_page(&mut self, rows: &[ReportRow]) -> Result<usize, Error> {
        if rows.is_empty() {
            return Ok(0);
        }

        let batch = page_to_record_batch(rows, &self.advertiser_id, self.schema.clone())?;
        self.writer.write(&batch)?;
        self.rows_written += rows.len();
        Ok(rows.len())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn rows_written(&self) -> usize {
        self.rows_written
    }
}

fn is_safe_file_stem(value: &str) -> bool {
    !value.is_empty()
        && value
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}

/// Creates the sliced output directory if it does not exist yet.
pub fn create_slices_dir(table: &OutputTable, tables_dir: &Path) -> Result<PathBuf, Error> {
    let dir = table.slices_dir(tables_dir);
    fs::create_dir_all(&dir)?;
    Ok(dir)
}

#[cfg(test)]
mod tests {
    use super::*;
    use datafusion::arrow::array::{Array, StringArray};
    use serde_json::json;
    use tempfile::TempDir;

    fn strings(items: &[&str]) -> Vec<String> {
        items.iter().map(|item| item.to_string()).collect()
    }

    fn row(value: Value) -> ReportRow {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn test_columns_and_keys() {
        let (columns, primary_key) = columns_and_keys(&strings(&["d1", "d2"]), &strings(&["m1"]));

        assert_eq!(columns, vec!["ex_advertiser_id", "d1", "d2", "m1"]);
        assert_eq!(primary_key, vec!["ex_advertiser_id", "d1", "d2"]);
    }

    #[test]
    fn test_normalize_table_name() {
        assert_eq!(normalize_table_name("My Report!! 2024.csv"), "MyReport2024.csv");
        assert_eq!(normalize_table_name("ads_report-v2"), "ads_report-v2.csv");
        assert_eq!(normalize_table_name("žluťoučký"), "luouk.csv");
    }

    #[test]
    fn test_lacks_time_key() {
        let table = OutputTable::new("t", &strings(&["campaign_id"]), &strings(&["spend"]), true);
        assert!(table.lacks_time_key());

        let table = OutputTable::new(
            "t",
            &strings(&["stat_time_hour", "campaign_id"]),
            &strings(&["spend"]),
            true,
        );
        assert!(!table.lacks_time_key());

        let table = OutputTable::new("t", &strings(&["campaign_id"]), &strings(&["spend"]), false);
        assert!(!table.lacks_time_key());
    }

    #[test]
    fn test_page_to_record_batch() {
        let table = OutputTable::new(
            "report",
            &strings(&["stat_time_day", "campaign_id"]),
            &strings(&["spend", "clicks"]),
            true,
        );
        let rows = vec![
            row(json!({
                "dimensions": { "stat_time_day": "2024-01-01 00:00:00", "campaign_id": "c1" },
                "metrics": { "spend": "12.5", "clicks": 7 }
            })),
            row(json!({
                "dimensions": { "stat_time_day": "2024-01-02 00:00:00", "campaign_id": null },
                "metrics": { "spend": "0", "unrequested": "x" }
            })),
        ];

        let batch = page_to_record_batch(&rows, "111", table.schema()).unwrap();
        assert_eq!(batch.num_rows(), 2);
        assert_eq!(batch.num_columns(), 5);

        let column = |index: usize| {
            batch
                .column(index)
                .as_any()
                .downcast_ref::<StringArray>()
                .unwrap()
                .clone()
        };
        assert_eq!(column(0).value(0), "111");
        assert_eq!(column(0).value(1), "111");
        assert_eq!(column(1).value(1), "2024-01-02 00:00:00");
        assert!(column(2).is_null(1));
        assert_eq!(column(4).value(0), "7");
        assert!(column(4).is_null(1));
    }

    #[test]
    fn test_sink_appends_pages_without_header() {
        let temp_dir = TempDir::new().unwrap();
        let table = OutputTable::new("report", &strings(&["stat_time_day"]), &strings(&["spend"]), true);
        let dir = create_slices_dir(&table, temp_dir.path()).unwrap();

        let mut sink = AdvertiserSink::create(&dir, "111", table.schema()).unwrap();
        sink.write_page(&[row(json!({
            "dimensions": { "stat_time_day": "2024-01-01 00:00:00" },
            "metrics": { "spend": "1.5" }
        }))])
        .unwrap();
        sink.write_page(&[]).unwrap();
        sink.write_page(&[row(json!({
            "dimensions": { "stat_time_day": "2024-01-02 00:00:00" },
            "metrics": { "spend": "2" }
        }))])
        .unwrap();

        assert_eq!(sink.rows_written(), 2);
        let contents = fs::read_to_string(sink.path()).unwrap();
        assert_eq!(
            contents,
            "111,2024-01-01 00:00:00,1.5\n111,2024-01-02 00:00:00,2\n"
        );
        assert_eq!(sink.path(), temp_dir.path().join("report.csv").join("111.csv"));
    }

    #[test]
    fn test_sink_rejects_ids_that_are_not_file_names() {
        let temp_dir = TempDir::new().unwrap();
        let table = OutputTable::new("report", &strings(&["stat_time_day"]), &strings(&["spend"]), true);
        let dir = create_slices_dir(&table, temp_dir.path()).unwrap();

        for advertiser_id in ["../escape", "a/b", "a\\b", "..", ""] {
            assert!(
                matches!(
                    AdvertiserSink::create(&dir, advertiser_id, table.schema()),
                    Err(Error::ConfigValidation { .. })
                ),
                "{advertiser_id:?}"
            );
        }
        assert!(!temp_dir.path().join("escape.csv").exists());
        assert_eq!(fs::read_dir(&dir).unwrap().count(), 0);

        assert!(AdvertiserSink::create(&dir, "7012345678901234567", table.schema()).is_ok());
    }

    #[test]
    fn test_write_manifest() {
        let temp_dir = TempDir::new().unwrap();
        let table = OutputTable::new("My Report", &strings(&["campaign_id"]), &strings(&["spend"]), true);

        let path = table.write_manifest(temp_dir.path()).unwrap();
        assert_eq!(path, temp_dir.path().join("MyReport.csv.manifest"));

        let manifest: Value = serde_json::from_str(&fs::read_to_string(path).unwrap()).unwrap();
        assert_eq!(
            manifest,
            json!({
                "incremental": true,
                "primary_key": ["ex_advertiser_id", "campaign_id"],
                "columns": ["ex_advertiser_id", "campaign_id", "spend"]
            })
        );
    }
}
