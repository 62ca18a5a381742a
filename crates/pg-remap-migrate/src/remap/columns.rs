//! Destination column resolution.
//!
//! Every exported file's header (plus the placeholder column) is run
//! through the mapping; the columns its rules target form the header of the
//! destination table's record files and the column order of its bulk load.

use crate::error::{MigrateError, Result};
use crate::mapping::{ColumnMapping, MappingLookup};
use crate::record::{read_header, table_from_path, PLACEHOLDER_COLUMN};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::Path;
use tracing::{debug, warn};

/// Per destination table, the sorted columns ever written to it.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TargetColumns {
    tables: BTreeMap<String, Vec<String>>,
    restricted: bool,
}

impl TargetColumns {
    pub fn from_map(tables: BTreeMap<String, BTreeSet<String>>) -> Self {
        Self {
            tables: tables
                .into_iter()
                .filter(|(_, columns)| !columns.is_empty())
                .map(|(table, columns)| (table, columns.into_iter().collect()))
                .collect(),
            restricted: false,
        }
    }

    pub fn get(&self, table: &str) -> Option<&[String]> {
        self.tables.get(table).map(Vec::as_slice)
    }

    pub fn contains(&self, table: &str, column: &str) -> bool {
        self.tables
            .get(table)
            .is_some_and(|columns| columns.binary_search_by(|c| c.as_str().cmp(column)).is_ok())
    }

    pub fn tables(&self) -> impl Iterator<Item = &str> {
        self.tables.keys().map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &[String])> {
        self.tables
            .iter()
            .map(|(table, columns)| (table.as_str(), columns.as_slice()))
    }

    pub fn len(&self) -> usize {
        self.tables.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tables.is_empty()
    }

    /// Whether columns absent from the real destination schema were removed.
    /// The transformer then skips them instead of carrying them to the writer.
    pub fn is_restricted(&self) -> bool {
        self.restricted
    }

    /// Intersect with the destination schema. Tables the destination lacks
    /// entirely are dropped. Returns the forgotten columns per table.
    pub fn forget_missing(
        &mut self,
        existing: &HashMap<String, Vec<String>>,
    ) -> BTreeMap<String, Vec<String>> {
        let mut forgotten = BTreeMap::new();
        self.tables.retain(|table, columns| {
            let Some(present) = existing.get(table) else {
                warn!("{}: table missing from destination, forgetting it", table);
                forgotten.insert(table.clone(), std::mem::take(columns));
                return false;
            };
            let (kept, dropped): (Vec<String>, Vec<String>) =
                std::mem::take(columns).into_iter().partition(|c| present.contains(c));
            if !dropped.is_empty() {
                warn!("{}: forgetting columns {:?}", table, dropped);
                forgotten.insert(table.clone(), dropped);
            }
            *columns = kept;
            !columns.is_empty()
        });
        self.restricted = true;
        forgotten
    }
}

/// Resolve the destination column sets from exported source files.
pub fn resolve_target_columns<P: AsRef<Path>>(
    files: &[P],
    mapping: &(impl MappingLookup + ?Sized),
) -> Result<TargetColumns> {
    let mut tables: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();

    for file in files {
        let path = file.as_ref();
        let source_table = table_from_path(path).ok_or_else(|| {
            MigrateError::Config(format!("cannot derive table name from {}", path.display()))
        })?;
        let mut header = read_header(path)?;
        if !header.iter().any(|c| c == PLACEHOLDER_COLUMN) {
            header.push(PLACEHOLDER_COLUMN.to_string());
        }

        for column in &header {
            match mapping.resolve(&source_table, column) {
                None => {
                    if column != PLACEHOLDER_COLUMN {
                        warn!("no mapping for {}.{}, column dropped", source_table, column);
                    }
                }
                Some(ColumnMapping::Forget) | Some(ColumnMapping::Copy) => {}
                Some(ColumnMapping::Targets(targets)) => {
                    for (target, _) in targets {
                        if target.column == PLACEHOLDER_COLUMN {
                            continue;
                        }
                        tables
                            .entry(target.table.clone())
                            .or_default()
                            .insert(target.column.clone());
                    }
                }
            }
        }
        debug!("{}: resolved {} header columns", source_table, header.len());
    }

    Ok(TargetColumns::from_map(tables))
}
