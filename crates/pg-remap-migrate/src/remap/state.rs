//! Process-scoped identifier state shared by the transform and postprocess
//! passes.
//!
//! The maps grow while the Row Transformer walks tables in scheduler order
//! and are only read afterwards. Nothing here is synchronized: the passes are
//! strictly sequential.

use crate::mapping::MappingLookup;
use serde::Serialize;
use std::collections::HashMap;
use std::fmt;
use tracing::warn;

/// Per table, source-space identifier -> identifier to use downstream.
#[derive(Debug, Default, Clone)]
pub struct ForeignKeyMap {
    tables: HashMap<String, HashMap<i64, i64>>,
}

impl ForeignKeyMap {
    pub fn get(&self, table: &str, id: i64) -> Option<i64> {
        self.tables.get(table)?.get(&id).copied()
    }

    pub fn has_table(&self, table: &str) -> bool {
        self.tables.get(table).is_some_and(|m| !m.is_empty())
    }

    pub fn len(&self) -> usize {
        self.tables.values().map(HashMap::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Record a mapping. Entries are never altered once written: a second,
    /// different value for the same pair is ignored and reported.
    pub fn record(&mut self, table: &str, source_id: i64, new_id: i64) -> bool {
        let entries = self.tables.entry(table.to_string()).or_default();
        match entries.get(&source_id) {
            None => {
                entries.insert(source_id, new_id);
                true
            }
            Some(&current) => {
                if current != new_id {
                    warn!(
                        "{}: id {} already maps to {}, ignoring remap to {}",
                        table, source_id, current, new_id
                    );
                }
                false
            }
        }
    }

    /// Point a relocated row at the pre-existing row it was merged into.
    /// This is the only sanctioned rewrite of an entry: the freshly
    /// allocated relocation id is replaced before any reader has seen it.
    pub(crate) fn redirect_relocation(&mut self, source_table: &str, source_id: i64, existing_id: i64) {
        if let Some(entry) = self
            .tables
            .get_mut(source_table)
            .and_then(|m| m.get_mut(&source_id))
        {
            *entry = existing_id;
        }
    }
}

/// Source table -> destination table its identities were relocated to.
#[derive(Debug, Default, Clone)]
pub struct MovedTableMap {
    moves: HashMap<String, String>,
}

impl MovedTableMap {
    /// Record a relocation; the first destination seen for a table wins.
    pub fn record(&mut self, source_table: &str, destination: &str) {
        self.moves
            .entry(source_table.to_string())
            .or_insert_with(|| destination.to_string());
    }

    pub fn get(&self, source_table: &str) -> Option<&str> {
        self.moves.get(source_table).map(String::as_str)
    }

    /// Table whose identifier offset applies to references aimed at `table`.
    pub fn effective<'a>(&'a self, table: &'a str) -> &'a str {
        self.get(table).unwrap_or(table)
    }
}

/// Polymorphic reference columns: `table.column` -> companion column.
#[derive(Debug, Default, Clone)]
pub struct ReferenceRegistry {
    companions: HashMap<String, String>,
}

impl ReferenceRegistry {
    pub fn register(&mut self, table: &str, column: &str, companion: &str) {
        self.companions
            .entry(format!("{}.{}", table, column))
            .or_insert_with(|| companion.to_string());
    }

    pub fn companion(&self, table: &str, column: &str) -> Option<&str> {
        self.companions
            .get(&format!("{}.{}", table, column))
            .map(String::as_str)
    }
}

/// A composite `model,id` reference, e.g. `res.partner,5`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PolymorphicRef {
    pub model: String,
    pub id: i64,
}

impl PolymorphicRef {
    pub fn parse(value: &str) -> Option<Self> {
        let (model, id) = value.split_once(',')?;
        let model = model.trim();
        if model.is_empty() {
            return None;
        }
        Some(Self {
            model: model.to_string(),
            id: id.trim().parse().ok()?,
        })
    }

    /// Table backing a model name: `res.partner` -> `res_partner`.
    pub fn table_of(model: &str) -> String {
        model.replace('.', "_")
    }

    pub fn table(&self) -> String {
        Self::table_of(&self.model)
    }
}

impl fmt::Display for PolymorphicRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{},{}", self.model, self.id)
    }
}

/// Counters for one migration run.
#[derive(Debug, Default, Clone, Serialize)]
pub struct ProcessStats {
    /// Source rows read.
    pub rows_read: u64,
    /// Rows written to the insert stream in the first pass.
    pub rows_inserted: u64,
    /// Rows merged into pre-existing destination rows.
    pub rows_merged: u64,
    /// Companion rows carrying deferred columns.
    pub rows_deferred: u64,
    /// Vacuous fan-outs and incomplete many-to-many links.
    pub rows_suppressed: u64,
    /// Rows discarded by custom rules.
    pub rows_rejected: u64,
    /// Rows dropped in the second pass for unresolvable references.
    pub rows_unresolved: u64,
    /// Keyless rows already present in the destination.
    pub rows_duplicate: u64,
    /// Rows written to load-ready files.
    pub rows_written: u64,
}

/// All identifier state of a run.
#[derive(Debug, Default)]
pub struct RemapState {
    pub fk_map: ForeignKeyMap,
    pub moved: MovedTableMap,
    pub references: ReferenceRegistry,
    pub stats: ProcessStats,
}

impl RemapState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Final identifier for a reference to `table` holding source-space `id`:
    /// the mapped value when the row was merged or relocated, otherwise the
    /// deterministic offset of the (possibly relocated) table.
    pub fn resolve_reference(
        &self,
        mapping: &(impl MappingLookup + ?Sized),
        table: &str,
        id: i64,
    ) -> Option<i64> {
        if let Some(mapped) = self.fk_map.get(table, id) {
            return Some(mapped);
        }
        let effective = self.moved.effective(table);
        mapping.identifier_offset(effective).map(|offset| id + offset)
    }

    /// Final identifier of a row of `table` itself.
    pub fn resolve_own_id(
        &self,
        mapping: &(impl MappingLookup + ?Sized),
        table: &str,
        id: i64,
    ) -> Option<i64> {
        self.fk_map
            .get(table, id)
            .or_else(|| mapping.identifier_offset(table).map(|offset| id + offset))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mapping::Mapping;

    #[test]
    fn test_fk_map_entries_are_immutable() {
        let mut map = ForeignKeyMap::default();
        assert!(map.record("res_partner", 5, 7));
        assert!(!map.record("res_partner", 5, 105));
        assert_eq!(map.get("res_partner", 5), Some(7));
        assert!(map.has_table("res_partner"));
        assert!(!map.has_table("res_users"));
        assert_eq!(map.len(), 1);
    }

    #[test]
    fn test_redirect_relocation() {
        let mut map = ForeignKeyMap::default();
        map.record("res_partner_address", 3, 151);
        map.redirect_relocation("res_partner_address", 3, 9);
        assert_eq!(map.get("res_partner_address", 3), Some(9));

        map.redirect_relocation("res_partner_address", 4, 9);
        assert_eq!(map.get("res_partner_address", 4), None);
    }

    #[test]
    fn test_polymorphic_ref() {
        let r = PolymorphicRef::parse("res.partner,5").unwrap();
        assert_eq!(r.model, "res.partner");
        assert_eq!(r.id, 5);
        assert_eq!(r.table(), "res_partner");
        assert_eq!(PolymorphicRef { id: 7, ..r }.to_string(), "res.partner,7");

        assert!(PolymorphicRef::parse("res.partner").is_none());
        assert!(PolymorphicRef::parse("res.partner,abc").is_none());
        assert!(PolymorphicRef::parse(",5").is_none());
    }

    #[test]
    fn test_resolve_reference_follows_moves() {
        let mut mapping = Mapping::default();
        mapping.set_database_ids(
            HashMap::from([
                ("res_partner".to_string(), 100),
                ("res_partner_address".to_string(), 10),
            ]),
            &HashMap::new(),
        );

        let mut state = RemapState::new();
        state.fk_map.record("res_partner", 5, 7);
        state.moved.record("res_partner_address", "res_partner");

        assert_eq!(state.resolve_reference(&mapping, "res_partner", 5), Some(7));
        assert_eq!(state.resolve_reference(&mapping, "res_partner", 6), Some(106));
        assert_eq!(
            state.resolve_reference(&mapping, "res_partner_address", 2),
            Some(102)
        );
        assert_eq!(state.resolve_reference(&mapping, "res_country", 2), None);
        assert_eq!(state.resolve_own_id(&mapping, "res_partner_address", 2), Some(12));
    }
}
