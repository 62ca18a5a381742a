//! Record types and intermediate record files.
//!
//! Every phase exchanges comma-delimited UTF-8 files with a header row.
//! Per table and phase the files are named:
//!
//! - `<table>.csv` - source export
//! - `<table>.target.csv` / `<table>.update.csv` - first pass output
//! - `<table>.target2.csv` / `<table>.update2.csv` - postprocessed, ready to load

use crate::error::{MigrateError, Result};
use indexmap::IndexMap;
use std::collections::BTreeMap;
use std::fs::File;
use std::path::{Path, PathBuf};

/// Name of the placeholder column offered to every source table, so that
/// mappings can feed computed-only target columns.
pub const PLACEHOLDER_COLUMN: &str = "_";

/// Primary key column of migrated tables.
pub const ID_COLUMN: &str = "id";

/// Kind of intermediate record file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileKind {
    Export,
    Target,
    Update,
    Target2,
    Update2,
}

impl FileKind {
    pub fn suffix(self) -> &'static str {
        match self {
            FileKind::Export => ".csv",
            FileKind::Target => ".target.csv",
            FileKind::Update => ".update.csv",
            FileKind::Target2 => ".target2.csv",
            FileKind::Update2 => ".update2.csv",
        }
    }

    /// Path of this kind of file for `table` inside `dir`.
    pub fn path(self, dir: &Path, table: &str) -> PathBuf {
        dir.join(format!("{}{}", table, self.suffix()))
    }

    /// Whether rows of this kind belong to the merge/update stream.
    pub fn is_update(self) -> bool {
        matches!(self, FileKind::Update | FileKind::Update2)
    }
}

/// Table name of a record file, e.g. `res_partner` for `res_partner.update.csv`.
pub fn table_from_path(path: &Path) -> Option<String> {
    let name = path.file_name()?.to_str()?;
    let stem = name.strip_suffix(".csv")?;
    let table = stem
        .strip_suffix(".target2")
        .or_else(|| stem.strip_suffix(".update2"))
        .or_else(|| stem.strip_suffix(".target"))
        .or_else(|| stem.strip_suffix(".update"))
        .unwrap_or(stem);
    Some(table.to_string())
}

/// Parse a raw identifier value.
pub fn parse_id(table: &str, column: &str, value: &str) -> Result<i64> {
    value.trim().parse::<i64>().map_err(|_| {
        MigrateError::invalid_record(
            table,
            format!("column {} holds non-numeric identifier '{}'", column, value),
        )
    })
}

/// One exported row of a source table, in header order.
#[derive(Debug, Clone, PartialEq)]
pub struct SourceRecord {
    table: String,
    fields: IndexMap<String, String>,
}

impl SourceRecord {
    pub fn new(table: impl Into<String>, fields: IndexMap<String, String>) -> Self {
        Self {
            table: table.into(),
            fields,
        }
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    pub fn get(&self, column: &str) -> Option<&str> {
        self.fields.get(column).map(String::as_str)
    }

    /// Iterate over (column, value) pairs in header order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.fields.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// The source-space identifier of this row, if it has one.
    pub fn id(&self) -> Result<Option<i64>> {
        match self.get(ID_COLUMN) {
            Some(v) if !v.is_empty() => parse_id(&self.table, ID_COLUMN, v).map(Some),
            _ => Ok(None),
        }
    }

    /// Append the placeholder column if the export didn't carry one.
    pub(crate) fn with_placeholder(mut self) -> Self {
        self.fields
            .entry(PLACEHOLDER_COLUMN.to_string())
            .or_default();
        self
    }
}

/// A candidate destination row being assembled or rewritten.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TargetRow {
    values: IndexMap<String, String>,
    discarded: bool,
}

impl TargetRow {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, column: &str) -> Option<&str> {
        self.values.get(column).map(String::as_str)
    }

    pub fn set(&mut self, column: impl Into<String>, value: impl Into<String>) {
        self.values.insert(column.into(), value.into());
    }

    pub fn remove(&mut self, column: &str) -> Option<String> {
        self.values.shift_remove(column)
    }

    pub fn contains(&self, column: &str) -> bool {
        self.values.contains_key(column)
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.values.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Mark the row for suppression.
    pub fn discard(&mut self) {
        self.discarded = true;
    }

    pub fn is_discarded(&self) -> bool {
        self.discarded
    }

    /// True when no column carries a value (vacuous fan-out).
    pub fn is_vacuous(&self) -> bool {
        self.values.values().all(|v| v.is_empty())
    }

    /// True when every column carries a value.
    pub fn is_complete(&self) -> bool {
        self.values.values().all(|v| !v.is_empty())
    }

    pub fn id(&self, table: &str) -> Result<Option<i64>> {
        match self.get(ID_COLUMN) {
            Some(v) if !v.is_empty() => parse_id(table, ID_COLUMN, v).map(Some),
            _ => Ok(None),
        }
    }
}

impl FromIterator<(String, String)> for TargetRow {
    fn from_iter<I: IntoIterator<Item = (String, String)>>(iter: I) -> Self {
        Self {
            values: iter.into_iter().collect(),
            discarded: false,
        }
    }
}

/// In-progress destination rows of one source row, keyed by destination table.
pub type TargetRows = BTreeMap<String, TargetRow>;

/// Read the header of a record file.
pub fn read_header(path: &Path) -> Result<Vec<String>> {
    let mut reader = csv::ReaderBuilder::new().has_headers(true).from_path(path)?;
    Ok(reader.headers()?.iter().map(str::to_string).collect())
}

/// Streaming reader over a record file, yielding rows keyed by header.
pub struct RecordReader {
    table: String,
    headers: Vec<String>,
    reader: csv::Reader<File>,
    record: csv::StringRecord,
}

impl RecordReader {
    pub fn open(path: &Path, table: impl Into<String>) -> Result<Self> {
        let mut reader = csv::ReaderBuilder::new().has_headers(true).from_path(path)?;
        let headers = reader.headers()?.iter().map(str::to_string).collect();
        Ok(Self {
            table: table.into(),
            headers,
            reader,
            record: csv::StringRecord::new(),
        })
    }

    pub fn headers(&self) -> &[String] {
        &self.headers
    }

    /// Read the next row, or `None` at end of file.
    pub fn next_row(&mut self) -> Result<Option<IndexMap<String, String>>> {
        if !self.reader.read_record(&mut self.record)? {
            return Ok(None);
        }
        let row = self
            .headers
            .iter()
            .cloned()
            .zip(self.record.iter().map(str::to_string))
            .collect();
        Ok(Some(row))
    }

    /// Read the next row as a source record.
    pub fn next_source(&mut self) -> Result<Option<SourceRecord>> {
        Ok(self
            .next_row()?
            .map(|fields| SourceRecord::new(self.table.clone(), fields)))
    }
}

/// Writer for one table's record file with a fixed header.
pub struct RecordWriter {
    columns: Vec<String>,
    writer: csv::Writer<File>,
    rows: u64,
}

impl RecordWriter {
    /// Create the file and write its header.
    pub fn create(path: &Path, columns: &[String]) -> Result<Self> {
        let mut writer = csv::WriterBuilder::new().from_path(path)?;
        writer.write_record(columns)?;
        Ok(Self {
            columns: columns.to_vec(),
            writer,
            rows: 0,
        })
    }

    /// Write a row projected onto the header; absent columns are written empty.
    pub fn write(&mut self, row: &TargetRow) -> Result<()> {
        self.writer
            .write_record(self.columns.iter().map(|c| row.get(c).unwrap_or("")))?;
        self.rows += 1;
        Ok(())
    }

    /// Number of data rows written so far.
    pub fn rows(&self) -> u64 {
        self.rows
    }

    pub fn flush(&mut self) -> Result<()> {
        self.writer.flush()?;
        Ok(())
    }
}

/// Whether a record file holds at least one data row.
pub fn has_data_rows(path: &Path) -> Result<bool> {
    let mut reader = csv::ReaderBuilder::new().has_headers(true).from_path(path)?;
    let mut record = csv::StringRecord::new();
    Ok(reader.read_record(&mut record)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_table_from_path() {
        let dir = Path::new("/tmp/run");
        for kind in [
            FileKind::Export,
            FileKind::Target,
            FileKind::Update,
            FileKind::Target2,
            FileKind::Update2,
        ] {
            let path = kind.path(dir, "res_partner");
            assert_eq!(table_from_path(&path).as_deref(), Some("res_partner"));
        }
        assert!(FileKind::Update2.is_update());
        assert!(!FileKind::Target2.is_update());
    }

    #[test]
    fn test_writer_projects_onto_header() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("res_partner.target.csv");
        let columns = vec!["id".to_string(), "name".to_string(), "ref".to_string()];

        let mut writer = RecordWriter::create(&path, &columns).unwrap();
        let mut row = TargetRow::new();
        row.set("name", "Acme, Inc.");
        row.set("id", "105");
        row.set("unknown", "ignored");
        writer.write(&row).unwrap();
        writer.flush().unwrap();
        assert_eq!(writer.rows(), 1);

        let mut reader = RecordReader::open(&path, "res_partner").unwrap();
        assert_eq!(reader.headers(), columns.as_slice());
        let read = reader.next_row().unwrap().unwrap();
        assert_eq!(read["id"], "105");
        assert_eq!(read["name"], "Acme, Inc.");
        assert_eq!(read["ref"], "");
        assert!(reader.next_row().unwrap().is_none());
    }

    #[test]
    fn test_large_fields_survive() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("ir_attachment.csv");
        let columns = vec!["id".to_string(), "datas".to_string()];
        let blob = "x".repeat(4 * 1024 * 1024);

        let mut writer = RecordWriter::create(&path, &columns).unwrap();
        let row: TargetRow = [("id".to_string(), "1".to_string()), ("datas".to_string(), blob.clone())]
            .into_iter()
            .collect();
        writer.write(&row).unwrap();
        writer.flush().unwrap();

        let mut reader = RecordReader::open(&path, "ir_attachment").unwrap();
        let record = reader.next_source().unwrap().unwrap();
        assert_eq!(record.get("datas").map(str::len), Some(blob.len()));
        assert_eq!(record.id().unwrap(), Some(1));
    }

    #[test]
    fn test_has_data_rows() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("res_users.update.csv");
        let columns = vec!["id".to_string()];
        let mut writer = RecordWriter::create(&path, &columns).unwrap();
        writer.flush().unwrap();
        assert!(!has_data_rows(&path).unwrap());

        let row: TargetRow = [("id".to_string(), "3".to_string())].into_iter().collect();
        writer.write(&row).unwrap();
        writer.flush().unwrap();
        assert!(has_data_rows(&path).unwrap());
    }

    #[test]
    fn test_target_row_predicates() {
        let mut row = TargetRow::new();
        row.set("partner_id", "");
        row.set("category_id", "");
        assert!(row.is_vacuous());
        assert!(!row.is_complete());

        row.set("partner_id", "105");
        assert!(!row.is_vacuous());
        assert!(!row.is_complete());

        row.set("category_id", "9");
        assert!(row.is_complete());
        assert_eq!(row.remove("category_id").as_deref(), Some("9"));
        assert_eq!(row.len(), 1);
    }

    #[test]
    fn test_non_numeric_id_rejected() {
        let fields: IndexMap<String, String> =
            [("id".to_string(), "abc".to_string())].into_iter().collect();
        let record = SourceRecord::new("res_partner", fields);
        assert!(record.id().is_err());
    }
}
