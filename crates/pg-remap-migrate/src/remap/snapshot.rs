//! Read-only view of destination rows that existed before the run.

use crate::record::ID_COLUMN;
use std::collections::{BTreeMap, HashMap};

/// One pre-existing destination row, column -> textual value.
pub type ExistingRow = BTreeMap<String, String>;

/// Snapshot collaborator consumed by the engine.
///
/// Values are compared textually, so implementations must render them the
/// same way the source export does.
pub trait ExistingSnapshot {
    /// Rows of `table` including their identifier.
    fn rows_with_id(&self, table: &str) -> &[ExistingRow];

    /// The same rows with the identifier column removed.
    fn rows_without_id(&self, table: &str) -> &[ExistingRow];

    /// Identifier of the first row whose values match `key` on every key
    /// column. An empty key never matches.
    fn find_id(&self, table: &str, key: &ExistingRow) -> Option<i64> {
        if key.is_empty() {
            return None;
        }
        self.rows_with_id(table)
            .iter()
            .find(|row| matches_key(row, key))
            .and_then(|row| row.get(ID_COLUMN)?.trim().parse().ok())
    }

    /// Whether any row matches `key` on every key column.
    fn contains(&self, table: &str, key: &ExistingRow) -> bool {
        !key.is_empty()
            && self
                .rows_without_id(table)
                .iter()
                .any(|row| matches_key(row, key))
    }
}

fn matches_key(row: &ExistingRow, key: &ExistingRow) -> bool {
    key.iter()
        .all(|(column, value)| row.get(column).is_some_and(|v| v == value))
}

/// In-memory snapshot filled from the destination database.
#[derive(Debug, Default, Clone)]
pub struct Snapshot {
    with_id: HashMap<String, Vec<ExistingRow>>,
    without_id: HashMap<String, Vec<ExistingRow>>,
}

impl Snapshot {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add rows of `table`; the id-less view is derived from them.
    pub fn insert_rows(&mut self, table: &str, rows: Vec<ExistingRow>) {
        let stripped = rows
            .iter()
            .map(|row| {
                let mut row = row.clone();
                row.remove(ID_COLUMN);
                row
            })
            .collect::<Vec<_>>();
        self.without_id
            .entry(table.to_string())
            .or_default()
            .extend(stripped);
        self.with_id.entry(table.to_string()).or_default().extend(rows);
    }

    pub fn tables(&self) -> impl Iterator<Item = &str> {
        self.with_id.keys().map(String::as_str)
    }

    pub fn row_count(&self) -> usize {
        self.with_id.values().map(Vec::len).sum()
    }
}

impl ExistingSnapshot for Snapshot {
    fn rows_with_id(&self, table: &str) -> &[ExistingRow] {
        self.with_id.get(table).map(Vec::as_slice).unwrap_or(&[])
    }

    fn rows_without_id(&self, table: &str) -> &[ExistingRow] {
        self.without_id.get(table).map(Vec::as_slice).unwrap_or(&[])
    }
}
