//! Column mapping rules and the lookup the engine consumes them through.
//!
//! The engine never parses mapping files itself: it asks a [`MappingLookup`]
//! for the rule of each (source table, source column) pair and for the
//! per-table declarations (discriminators, deferred and stored columns,
//! identifier offsets, foreign keys). [`Mapping`] is the YAML-backed
//! implementation used by the command-line tool.

mod loader;

pub use loader::CustomRules;

use crate::error::{MigrateError, Result};
use crate::record::{SourceRecord, TargetRows};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use std::path::Path;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

/// A destination column, written `table.column` in mapping files.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TargetColumn {
    pub table: String,
    pub column: String,
}

impl TargetColumn {
    pub fn new(table: impl Into<String>, column: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            column: column.into(),
        }
    }

    /// Parse a `table.column` reference.
    pub fn parse(qualified: &str) -> Result<Self> {
        match qualified.split_once('.') {
            Some((table, column)) if !table.is_empty() && !column.is_empty() => {
                Ok(Self::new(table, column))
            }
            _ => Err(MigrateError::Mapping(format!(
                "target '{}' is not of the form table.column",
                qualified
            ))),
        }
    }
}

impl fmt::Display for TargetColumn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.table, self.column)
    }
}

/// Result of a custom rule.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CustomOutcome {
    /// Value for the target column; empty means NULL.
    Value(String),
    /// Suppress the whole destination row.
    Discard,
}

/// A computed column. Receives the full source row and the destination rows
/// assembled so far for it, and must not have side effects.
pub trait CustomRule: Send + Sync {
    fn apply(&self, source: &SourceRecord, targets: &TargetRows) -> CustomOutcome;
}

impl<F> CustomRule for F
where
    F: Fn(&SourceRecord, &TargetRows) -> CustomOutcome + Send + Sync,
{
    fn apply(&self, source: &SourceRecord, targets: &TargetRows) -> CustomOutcome {
        self(source, targets)
    }
}

/// How one target column is fed from a source column.
#[derive(Clone)]
pub enum MappingRule {
    /// Copy the raw value unchanged.
    Copy,
    /// Remove the column from the destination row.
    Forget,
    /// Polymorphic reference: the table the value points to is read from
    /// `companion` in the same destination row. When `companion` is the
    /// column itself the value is a composite `model,id`.
    Reference { companion: String },
    /// The source row's identity is relocated to this destination table.
    Moved,
    /// Value computed by a registered rule.
    Custom {
        name: String,
        rule: Arc<dyn CustomRule>,
    },
}

impl fmt::Debug for MappingRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MappingRule::Copy => write!(f, "Copy"),
            MappingRule::Forget => write!(f, "Forget"),
            MappingRule::Reference { companion } => write!(f, "Reference({})", companion),
            MappingRule::Moved => write!(f, "Moved"),
            MappingRule::Custom { name, .. } => write!(f, "Custom({})", name),
        }
    }
}

/// Everything a mapping says about one source column. No entry at all
/// means the column is unmapped.
#[derive(Debug, Clone)]
pub enum ColumnMapping {
    /// Identity copy into the same-named table and column.
    Copy,
    /// Explicitly excluded.
    Forget,
    /// One or more destination columns, each with its rule.
    Targets(Vec<(TargetColumn, MappingRule)>),
}

/// Mapping collaborator consumed by the engine.
pub trait MappingLookup {
    /// Rule for a source column; `None` when the mapping has no entry.
    fn resolve(&self, table: &str, column: &str) -> Option<&ColumnMapping>;

    /// Natural-key columns used to detect pre-existing destination rows.
    fn discriminators(&self, table: &str) -> &[String];

    /// Columns only written through a later merge.
    fn deferred(&self, table: &str) -> &[String];

    /// Columns to drop from the destination once migration completes.
    fn stored_columns(&self) -> &BTreeMap<String, Vec<String>>;

    /// Maximum identifier present in the destination table before migration.
    fn identifier_offset(&self, table: &str) -> Option<i64>;

    /// Allocate a fresh pre-offset identifier for a relocated row.
    fn allocate_id(&self, table: &str) -> Option<i64>;

    /// Foreign-key declarations, `table.column` -> referenced table.
    fn foreign_keys(&self) -> &BTreeMap<String, String>;
}

/// YAML-backed mapping.
#[derive(Debug, Default)]
pub struct Mapping {
    rules: HashMap<String, HashMap<String, ColumnMapping>>,
    discriminators: BTreeMap<String, Vec<String>>,
    deferred: BTreeMap<String, Vec<String>>,
    stored_fields: BTreeMap<String, Vec<String>>,
    foreign_keys: BTreeMap<String, String>,
    offsets: HashMap<String, i64>,
    counters: HashMap<String, AtomicI64>,
}

impl Mapping {
    /// Load and merge mapping files in order; later files win.
    pub fn load<P: AsRef<Path>>(paths: &[P], custom: &CustomRules) -> Result<Self> {
        let mut mapping = Mapping::default();
        for path in paths {
            let content = std::fs::read_to_string(path.as_ref()).map_err(|e| {
                MigrateError::Mapping(format!(
                    "cannot read mapping file {}: {}",
                    path.as_ref().display(),
                    e
                ))
            })?;
            mapping.merge_yaml(&content, custom)?;
        }
        Ok(mapping)
    }

    /// Parse a single mapping document.
    pub fn from_yaml(yaml: &str, custom: &CustomRules) -> Result<Self> {
        let mut mapping = Mapping::default();
        mapping.merge_yaml(yaml, custom)?;
        Ok(mapping)
    }

    /// Set or replace the rule of one source column.
    pub fn set_rule(&mut self, table: &str, column: &str, mapping: Option<ColumnMapping>) {
        let columns = self.rules.entry(table.to_string()).or_default();
        match mapping {
            Some(m) => {
                columns.insert(column.to_string(), m);
            }
            None => {
                columns.remove(column);
            }
        }
    }

    pub fn set_discriminators(&mut self, table: &str, columns: Vec<String>) {
        self.discriminators.insert(table.to_string(), columns);
    }

    pub fn set_deferred(&mut self, table: &str, columns: Vec<String>) {
        self.deferred.insert(table.to_string(), columns);
    }

    pub fn set_stored_fields(&mut self, table: &str, columns: Vec<String>) {
        self.stored_fields.insert(table.to_string(), columns);
    }

    /// Declare a foreign key, overriding any discovered one.
    pub fn declare_foreign_key(&mut self, field: &str, target_table: &str) {
        self.foreign_keys
            .insert(field.to_string(), target_table.to_string());
    }

    /// Merge foreign keys discovered in the destination schema. Declarations
    /// from mapping files take precedence.
    pub fn add_discovered_foreign_keys(&mut self, discovered: BTreeMap<String, String>) {
        for (field, target) in discovered {
            self.foreign_keys.entry(field).or_insert(target);
        }
    }

    /// Destination tables fed by any rule of `source_table`.
    pub fn target_tables_of(&self, source_table: &str) -> BTreeSet<String> {
        let mut tables = BTreeSet::new();
        if let Some(columns) = self.rules.get(source_table) {
            for mapping in columns.values() {
                match mapping {
                    ColumnMapping::Copy => {
                        tables.insert(source_table.to_string());
                    }
                    ColumnMapping::Forget => {}
                    ColumnMapping::Targets(targets) => {
                        tables.extend(targets.iter().map(|(t, _)| t.table.clone()));
                    }
                }
            }
        }
        tables
    }

    /// Install identifier offsets and seed the relocation id counters.
    ///
    /// `offsets` holds the destination max id per table. `source_max_ids`
    /// holds the max id of each source table; every destination table's
    /// counter starts after the largest id migrated into it, so that
    /// relocated ids stay disjoint from offset ids of the same table.
    pub fn set_database_ids(
        &mut self,
        offsets: HashMap<String, i64>,
        source_max_ids: &HashMap<String, i64>,
    ) {
        let mut seeds: HashMap<String, i64> = HashMap::new();
        for (source_table, max_id) in source_max_ids {
            for target in self.target_tables_of(source_table) {
                let seed = seeds.entry(target).or_insert(0);
                *seed = (*seed).max(*max_id);
            }
        }
        for table in offsets.keys() {
            seeds.entry(table.clone()).or_insert(0);
        }

        self.counters = seeds
            .into_iter()
            .map(|(table, seed)| (table, AtomicI64::new(seed)))
            .collect();
        self.offsets = offsets;
    }
}

impl MappingLookup for Mapping {
    fn resolve(&self, table: &str, column: &str) -> Option<&ColumnMapping> {
        self.rules.get(table)?.get(column)
    }

    fn discriminators(&self, table: &str) -> &[String] {
        self.discriminators
            .get(table)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    fn deferred(&self, table: &str) -> &[String] {
        self.deferred.get(table).map(Vec::as_slice).unwrap_or(&[])
    }

    fn stored_columns(&self) -> &BTreeMap<String, Vec<String>> {
        &self.stored_fields
    }

    fn identifier_offset(&self, table: &str) -> Option<i64> {
        self.offsets.get(table).copied()
    }

    fn allocate_id(&self, table: &str) -> Option<i64> {
        self.counters
            .get(table)
            .map(|counter| counter.fetch_add(1, Ordering::Relaxed) + 1)
    }

    fn foreign_keys(&self) -> &BTreeMap<String, String> {
        &self.foreign_keys
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_target_column_parse() {
        let col = TargetColumn::parse("res_partner.parent_id").unwrap();
        assert_eq!(col.table, "res_partner");
        assert_eq!(col.column, "parent_id");
        assert_eq!(col.to_string(), "res_partner.parent_id");
        assert!(TargetColumn::parse("res_partner").is_err());
        assert!(TargetColumn::parse(".id").is_err());
    }

    #[test]
    fn test_allocate_id_starts_after_largest_migrated_id() {
        let mut mapping = Mapping::default();
        mapping.set_rule(
            "res_partner_address",
            "id",
            Some(ColumnMapping::Targets(vec![(
                TargetColumn::new("res_partner", "id"),
                MappingRule::Moved,
            )])),
        );
        mapping.set_rule("res_partner", "id", Some(ColumnMapping::Copy));

        let offsets = HashMap::from([("res_partner".to_string(), 40)]);
        let source_max = HashMap::from([
            ("res_partner".to_string(), 12),
            ("res_partner_address".to_string(), 30),
        ]);
        mapping.set_database_ids(offsets, &source_max);

        assert_eq!(mapping.identifier_offset("res_partner"), Some(40));
        assert_eq!(mapping.identifier_offset("res_users"), None);
        assert_eq!(mapping.allocate_id("res_partner"), Some(31));
        assert_eq!(mapping.allocate_id("res_partner"), Some(32));
        assert_eq!(mapping.allocate_id("unknown"), None);
    }

    #[test]
    fn test_declared_foreign_keys_win_over_discovered() {
        let mut mapping = Mapping::default();
        mapping.declare_foreign_key("ir_property.company_id", "res_company");
        mapping.add_discovered_foreign_keys(BTreeMap::from([
            ("ir_property.company_id".to_string(), "res_partner".to_string()),
            ("res_users.partner_id".to_string(), "res_partner".to_string()),
        ]));

        let fks = mapping.foreign_keys();
        assert_eq!(fks["ir_property.company_id"], "res_company");
        assert_eq!(fks["res_users.partner_id"], "res_partner");
    }

    #[test]
    fn test_closure_custom_rule() {
        let rule: Arc<dyn CustomRule> = Arc::new(|source: &SourceRecord, _: &TargetRows| {
            match source.get("active") {
                Some("f") => CustomOutcome::Discard,
                _ => CustomOutcome::Value("kept".to_string()),
            }
        });
        let fields = [("active".to_string(), "f".to_string())].into_iter().collect();
        let record = SourceRecord::new("res_partner", fields);
        assert_eq!(rule.apply(&record, &TargetRows::new()), CustomOutcome::Discard);
    }
}
