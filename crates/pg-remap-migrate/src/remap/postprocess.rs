//! Second pass: finalize foreign keys and polymorphic references.
//!
//! Runs once every table went through the transformer, so the foreign key
//! map is complete for every table a reference can point to. The state is
//! only read here.

use super::snapshot::{ExistingRow, ExistingSnapshot};
use super::state::{PolymorphicRef, RemapState};
use super::transform::Stream;
use crate::error::Result;
use crate::mapping::MappingLookup;
use crate::record::{RecordReader, RecordWriter, TargetRow, ID_COLUMN};
use serde::Serialize;
use std::path::Path;
use tracing::{debug, warn};

/// What became of one first-pass row.
#[derive(Debug, Clone, PartialEq)]
pub enum RowOutcome {
    Write(TargetRow),
    /// A reference could not be resolved; the reason names table, column
    /// and value.
    Unresolved(String),
    /// Keyless row already present in the destination.
    Duplicate,
}

/// Counters of one postprocessed file.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PostprocessStats {
    pub written: u64,
    pub unresolved: u64,
    pub duplicates: u64,
}

pub struct Postprocessor<'a, M: MappingLookup + ?Sized, S: ExistingSnapshot + ?Sized> {
    mapping: &'a M,
    snapshot: &'a S,
    state: &'a RemapState,
}

impl<'a, M, S> Postprocessor<'a, M, S>
where
    M: MappingLookup + ?Sized,
    S: ExistingSnapshot + ?Sized,
{
    pub fn new(mapping: &'a M, snapshot: &'a S, state: &'a RemapState) -> Self {
        Self {
            mapping,
            snapshot,
            state,
        }
    }

    /// Rewrite `input` into `output`, both with the same header.
    pub fn process_file(
        &self,
        input: &Path,
        output: &Path,
        table: &str,
        stream: Stream,
    ) -> Result<PostprocessStats> {
        let mut reader = RecordReader::open(input, table)?;
        let header = reader.headers().to_vec();
        let mut writer = RecordWriter::create(output, &header)?;
        let mut stats = PostprocessStats::default();

        while let Some(fields) = reader.next_row()? {
            let row: TargetRow = fields.into_iter().collect();
            match self.rewrite(table, row, stream) {
                RowOutcome::Write(row) => {
                    writer.write(&row)?;
                    stats.written += 1;
                }
                RowOutcome::Unresolved(reason) => {
                    warn!("{}: row dropped, {}", table, reason);
                    stats.unresolved += 1;
                }
                RowOutcome::Duplicate => stats.duplicates += 1,
            }
        }
        writer.flush()?;
        debug!(
            "{}: postprocessed {:?} stream, {} written, {} unresolved, {} duplicate",
            table, stream, stats.written, stats.unresolved, stats.duplicates
        );
        Ok(stats)
    }

    /// Finalize one row of `table`.
    pub fn rewrite(&self, table: &str, row: TargetRow, stream: Stream) -> RowOutcome {
        let mut out = row.clone();

        for (column, value) in row.iter() {
            if value.is_empty() {
                continue;
            }

            if column == ID_COLUMN && stream == Stream::Update {
                let Ok(id) = value.trim().parse::<i64>() else {
                    return unresolved(table, column, value, "non-numeric id");
                };
                match self.state.resolve_own_id(self.mapping, table, id) {
                    Some(resolved) => out.set(column, resolved.to_string()),
                    None => return unresolved(table, column, value, "no identifier offset"),
                }
                continue;
            }

            if let Some(referenced) = self
                .mapping
                .foreign_keys()
                .get(&format!("{}.{}", table, column))
            {
                let Ok(id) = value.trim().parse::<i64>() else {
                    return unresolved(table, column, value, "non-numeric foreign key");
                };
                match self.state.resolve_reference(self.mapping, referenced, id) {
                    Some(resolved) => out.set(column, resolved.to_string()),
                    None => {
                        return unresolved(table, column, value, &format!("unknown table {}", referenced))
                    }
                }
                continue;
            }

            if let Some(companion) = self.state.references.companion(table, column) {
                if companion == column {
                    let Some(reference) = PolymorphicRef::parse(value) else {
                        return unresolved(table, column, value, "malformed model,id reference");
                    };
                    let target = reference.table();
                    match self.state.resolve_reference(self.mapping, &target, reference.id) {
                        Some(id) => out.set(column, PolymorphicRef { id, ..reference }.to_string()),
                        None => {
                            return unresolved(table, column, value, &format!("unknown table {}", target))
                        }
                    }
                } else {
                    let Some(model) = row.get(companion) else {
                        return unresolved(
                            table,
                            column,
                            value,
                            &format!("companion column {} missing", companion),
                        );
                    };
                    if model.is_empty() {
                        continue;
                    }
                    let target = PolymorphicRef::table_of(model);
                    let Ok(id) = value.trim().parse::<i64>() else {
                        return unresolved(table, column, value, "non-numeric reference");
                    };
                    match self.state.resolve_reference(self.mapping, &target, id) {
                        Some(resolved) => out.set(column, resolved.to_string()),
                        None => {
                            return unresolved(table, column, value, &format!("unknown table {}", target))
                        }
                    }
                }
            }
        }

        if !out.contains(ID_COLUMN) && self.already_present(table, &out) {
            return RowOutcome::Duplicate;
        }
        RowOutcome::Write(out)
    }

    /// Keyless rows are compared on their discriminators when declared,
    /// otherwise on every column.
    fn already_present(&self, table: &str, row: &TargetRow) -> bool {
        let discriminators = self.mapping.discriminators(table);
        let key: ExistingRow = if discriminators.is_empty() {
            row.iter()
                .map(|(c, v)| (c.to_string(), v.to_string()))
                .collect()
        } else {
            discriminators
                .iter()
                .map(|c| (c.clone(), row.get(c).unwrap_or("").to_string()))
                .collect()
        };
        self.snapshot.contains(table, &key)
    }
}

fn unresolved(table: &str, column: &str, value: &str, reason: &str) -> RowOutcome {
    RowOutcome::Unresolved(format!("{}.{} = '{}': {}", table, column, value, reason))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mapping::Mapping;
    use crate::remap::snapshot::Snapshot;
    use std::collections::HashMap;

    fn row(pairs: &[(&str, &str)]) -> TargetRow {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    fn mapping() -> Mapping {
        let mut mapping = Mapping::default();
        mapping.declare_foreign_key("res_users.partner_id", "res_partner");
        mapping.declare_foreign_key("res_users.address_id", "res_partner_address");
        mapping.declare_foreign_key("res_partner_category_rel.partner_id", "res_partner");
        mapping.declare_foreign_key("res_partner_category_rel.category_id", "res_partner_category");
        mapping.set_database_ids(
            HashMap::from([
                ("res_partner".to_string(), 100),
                ("res_partner_category".to_string(), 0),
                ("res_users".to_string(), 10),
                ("mail_message".to_string(), 1000),
            ]),
            &HashMap::new(),
        );
        mapping
    }

    fn state() -> RemapState {
        let mut state = RemapState::new();
        state.fk_map.record("res_partner", 5, 7);
        state.fk_map.record("res_partner_address", 3, 151);
        state.moved.record("res_partner_address", "res_partner");
        state
            .references
            .register("ir_property", "res_id", "res_id");
        state
            .references
            .register("mail_message", "res_id", "model");
        state
    }

    #[test]
    fn test_foreign_keys_resolve_through_map_or_offset() {
        let mapping = mapping();
        let state = state();
        let snapshot = Snapshot::new();
        let pp = Postprocessor::new(&mapping, &snapshot, &state);

        let out = pp.rewrite(
            "res_users",
            row(&[("id", "12"), ("partner_id", "5"), ("address_id", "4")]),
            Stream::Insert,
        );
        let RowOutcome::Write(out) = out else {
            panic!("row dropped: {:?}", out)
        };
        assert_eq!(out.get("id"), Some("12"));
        assert_eq!(out.get("partner_id"), Some("7"));
        assert_eq!(out.get("address_id"), Some("104"));
    }

    #[test]
    fn test_update_stream_ids_are_translated() {
        let mapping = mapping();
        let state = state();
        let snapshot = Snapshot::new();
        let pp = Postprocessor::new(&mapping, &snapshot, &state);

        let merged = pp.rewrite("res_partner", row(&[("id", "5"), ("name", "Acme")]), Stream::Update);
        assert_eq!(merged, RowOutcome::Write(row(&[("id", "7"), ("name", "Acme")])));

        let deferred = pp.rewrite("res_partner", row(&[("id", "6"), ("name", "")]), Stream::Update);
        assert_eq!(deferred, RowOutcome::Write(row(&[("id", "106"), ("name", "")])));
    }

    #[test]
    fn test_polymorphic_references() {
        let mapping = mapping();
        let state = state();
        let snapshot = Snapshot::new();
        let pp = Postprocessor::new(&mapping, &snapshot, &state);

        let out = pp.rewrite("ir_property", row(&[("id", "1"), ("res_id", "res.partner,5")]), Stream::Insert);
        assert_eq!(out, RowOutcome::Write(row(&[("id", "1"), ("res_id", "res.partner,7")])));

        let out = pp.rewrite("ir_property", row(&[("id", "1"), ("res_id", "res.partner,8")]), Stream::Insert);
        assert_eq!(out, RowOutcome::Write(row(&[("id", "1"), ("res_id", "res.partner,108")])));

        let out = pp.rewrite(
            "mail_message",
            row(&[("id", "1"), ("model", "res.partner"), ("res_id", "5")]),
            Stream::Insert,
        );
        assert_eq!(
            out,
            RowOutcome::Write(row(&[("id", "1"), ("model", "res.partner"), ("res_id", "7")]))
        );

        let out = pp.rewrite(
            "mail_message",
            row(&[("id", "1"), ("model", ""), ("res_id", "5")]),
            Stream::Insert,
        );
        assert!(matches!(out, RowOutcome::Write(r) if r.get("res_id") == Some("5")));
    }

    #[test]
    fn test_unknown_reference_table_drops_row() {
        let mapping = mapping();
        let state = state();
        let snapshot = Snapshot::new();
        let pp = Postprocessor::new(&mapping, &snapshot, &state);

        let out = pp.rewrite("ir_property", row(&[("id", "1"), ("res_id", "x.unknown,5")]), Stream::Insert);
        assert!(matches!(out, RowOutcome::Unresolved(reason) if reason.contains("x_unknown")));

        let out = pp.rewrite("ir_property", row(&[("id", "1"), ("res_id", "garbage")]), Stream::Insert);
        assert!(matches!(out, RowOutcome::Unresolved(_)));
    }

    #[test]
    fn test_missing_companion_column_drops_row() {
        let mapping = mapping();
        let state = state();
        let snapshot = Snapshot::new();
        let pp = Postprocessor::new(&mapping, &snapshot, &state);

        let out = pp.rewrite("mail_message", row(&[("id", "1"), ("res_id", "5")]), Stream::Insert);
        assert!(
            matches!(&out, RowOutcome::Unresolved(reason) if reason.contains("companion column model missing")),
            "got {:?}",
            out
        );
    }

    #[test]
    fn test_existing_keyless_links_are_not_duplicated() {
        let mapping = mapping();
        let state = state();
        let mut snapshot = Snapshot::new();
        snapshot.insert_rows(
            "res_partner_category_rel",
            vec![[("partner_id", "7"), ("category_id", "9")]
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect()],
        );
        let pp = Postprocessor::new(&mapping, &snapshot, &state);

        let out = pp.rewrite(
            "res_partner_category_rel",
            row(&[("partner_id", "5"), ("category_id", "9")]),
            Stream::Insert,
        );
        assert_eq!(out, RowOutcome::Duplicate);

        let out = pp.rewrite(
            "res_partner_category_rel",
            row(&[("partner_id", "6"), ("category_id", "9")]),
            Stream::Insert,
        );
        assert_eq!(
            out,
            RowOutcome::Write(row(&[("partner_id", "106"), ("category_id", "9")]))
        );
    }
}
