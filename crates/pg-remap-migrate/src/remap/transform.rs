//! Row Transformer: first pass over exported source rows.
//!
//! Each source row fans out into at most one candidate row per destination
//! table. A candidate either matches a pre-existing destination row through
//! its discriminators and goes to the update stream, or is new: its id is
//! offset, deferred columns are split off into an update companion row, and
//! it goes to the insert stream.
//!
//! Ids on the update stream stay in source space (the allocated id for
//! relocated rows). The postprocessor translates them through the foreign
//! key map, falling back to the table offset.

use super::columns::TargetColumns;
use super::snapshot::{ExistingRow, ExistingSnapshot};
use super::state::RemapState;
use crate::error::{MigrateError, Result};
use crate::mapping::{ColumnMapping, CustomOutcome, MappingLookup, MappingRule, TargetColumn};
use crate::record::{
    parse_id, FileKind, RecordReader, RecordWriter, SourceRecord, TargetRow, TargetRows,
    ID_COLUMN, PLACEHOLDER_COLUMN,
};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::Path;
use tracing::{debug, warn};

/// Which stream a finished row belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stream {
    Insert,
    Update,
}

impl Stream {
    pub fn first_pass_file(self) -> FileKind {
        match self {
            Stream::Insert => FileKind::Target,
            Stream::Update => FileKind::Update,
        }
    }

    pub fn load_file(self) -> FileKind {
        match self {
            Stream::Insert => FileKind::Target2,
            Stream::Update => FileKind::Update2,
        }
    }
}

/// A finished destination row.
#[derive(Debug, Clone, PartialEq)]
pub struct Emitted {
    pub table: String,
    pub stream: Stream,
    pub row: TargetRow,
}

/// Insert and update writers of every destination table.
pub struct StreamWriters {
    insert: BTreeMap<String, RecordWriter>,
    update: BTreeMap<String, RecordWriter>,
}

impl StreamWriters {
    /// Create `<table>.target.csv` and `<table>.update.csv` for every table.
    pub fn create(dir: &Path, columns: &TargetColumns) -> Result<Self> {
        let mut insert = BTreeMap::new();
        let mut update = BTreeMap::new();
        for (table, header) in columns.iter() {
            insert.insert(
                table.to_string(),
                RecordWriter::create(&FileKind::Target.path(dir, table), header)?,
            );
            update.insert(
                table.to_string(),
                RecordWriter::create(&FileKind::Update.path(dir, table), header)?,
            );
        }
        Ok(Self { insert, update })
    }

    pub fn writer(&mut self, table: &str, stream: Stream) -> Option<&mut RecordWriter> {
        match stream {
            Stream::Insert => self.insert.get_mut(table),
            Stream::Update => self.update.get_mut(table),
        }
    }

    pub fn flush(&mut self) -> Result<()> {
        for writer in self.insert.values_mut().chain(self.update.values_mut()) {
            writer.flush()?;
        }
        Ok(())
    }
}

pub struct RowTransformer<'a, M: MappingLookup + ?Sized, S: ExistingSnapshot + ?Sized> {
    mapping: &'a M,
    snapshot: &'a S,
    columns: &'a TargetColumns,
    state: &'a mut RemapState,
    unwritable: HashSet<String>,
}

impl<'a, M, S> RowTransformer<'a, M, S>
where
    M: MappingLookup + ?Sized,
    S: ExistingSnapshot + ?Sized,
{
    pub fn new(
        mapping: &'a M,
        snapshot: &'a S,
        columns: &'a TargetColumns,
        state: &'a mut RemapState,
    ) -> Self {
        Self {
            mapping,
            snapshot,
            columns,
            state,
            unwritable: HashSet::new(),
        }
    }

    /// Transform every row of one exported file into the stream writers.
    pub fn process_file(
        &mut self,
        path: &Path,
        source_table: &str,
        writers: &mut StreamWriters,
    ) -> Result<u64> {
        let mut reader = RecordReader::open(path, source_table)?;
        let mut rows = 0;
        while let Some(record) = reader.next_source()? {
            rows += 1;
            for emitted in self.transform(record)? {
                match writers.writer(&emitted.table, emitted.stream) {
                    Some(writer) => writer.write(&emitted.row)?,
                    None => {
                        if self.unwritable.insert(emitted.table.clone()) {
                            warn!(
                                "{}: rows from {} have no destination columns, dropped",
                                emitted.table, source_table
                            );
                        }
                    }
                }
            }
        }
        debug!("{}: transformed {} rows", source_table, rows);
        Ok(rows)
    }

    /// Transform one source row into finished destination rows.
    pub fn transform(&mut self, record: SourceRecord) -> Result<Vec<Emitted>> {
        self.state.stats.rows_read += 1;
        let record = record.with_placeholder();
        let source_table = record.table().to_string();
        let mut targets = TargetRows::new();
        let mut relocated: HashMap<String, i64> = HashMap::new();

        for (column, value) in record.iter() {
            let rules: Vec<(TargetColumn, MappingRule)> =
                match self.mapping.resolve(&source_table, column) {
                    None | Some(ColumnMapping::Forget) => continue,
                    Some(ColumnMapping::Copy) => {
                        vec![(TargetColumn::new(&source_table, column), MappingRule::Copy)]
                    }
                    Some(ColumnMapping::Targets(rules)) => rules.clone(),
                };
            for (target, rule) in rules {
                if let Some(source_id) =
                    self.apply_rule(&record, &mut targets, &target, &rule, value)?
                {
                    relocated.insert(target.table.clone(), source_id);
                }
            }
        }

        let mut emitted = Vec::new();
        for (table, row) in targets {
            let relocated_from = relocated.get(&table).copied();
            self.finish_row(&source_table, table, row, relocated_from, &mut emitted)?;
        }
        Ok(emitted)
    }

    /// Apply one rule; returns the source id when the row was relocated.
    fn apply_rule(
        &mut self,
        record: &SourceRecord,
        targets: &mut TargetRows,
        target: &TargetColumn,
        rule: &MappingRule,
        value: &str,
    ) -> Result<Option<i64>> {
        let custom = match rule {
            MappingRule::Custom { rule, .. } => Some(rule.apply(record, targets)),
            _ => None,
        };

        let row = targets.entry(target.table.clone()).or_default();
        if target.column == PLACEHOLDER_COLUMN {
            return Ok(None);
        }
        if self.columns.is_restricted() && !self.columns.contains(&target.table, &target.column) {
            return Ok(None);
        }

        match rule {
            MappingRule::Copy => row.set(&target.column, value),
            MappingRule::Reference { companion } => {
                row.set(&target.column, value);
                self.state
                    .references
                    .register(&target.table, &target.column, companion);
            }
            MappingRule::Forget => {
                row.remove(&target.column);
            }
            MappingRule::Moved => {
                let source_table = record.table();
                let new_id = self.mapping.allocate_id(&target.table).ok_or_else(|| {
                    MigrateError::Mapping(format!(
                        "{}: no id counter for relocation target {}",
                        source_table, target.table
                    ))
                })?;
                let offset = self.mapping.identifier_offset(&target.table).ok_or_else(|| {
                    MigrateError::Mapping(format!(
                        "{}: relocation target {} has no identifier offset",
                        source_table, target.table
                    ))
                })?;
                row.set(&target.column, new_id.to_string());
                self.state.moved.record(source_table, &target.table);
                if !value.is_empty() {
                    let source_id = parse_id(source_table, &target.column, value)?;
                    self.state
                        .fk_map
                        .record(source_table, source_id, new_id + offset);
                    return Ok(Some(source_id));
                }
            }
            MappingRule::Custom { .. } => match custom {
                Some(CustomOutcome::Value(v)) => row.set(&target.column, v),
                Some(CustomOutcome::Discard) => row.discard(),
                None => {}
            },
        }
        Ok(None)
    }

    fn finish_row(
        &mut self,
        source_table: &str,
        table: String,
        mut row: TargetRow,
        relocated_from: Option<i64>,
        emitted: &mut Vec<Emitted>,
    ) -> Result<()> {
        if row.is_discarded() {
            self.state.stats.rows_rejected += 1;
            return Ok(());
        }
        if row.is_vacuous() {
            self.state.stats.rows_suppressed += 1;
            return Ok(());
        }

        if let Some(source_id) = row.id(&table)? {
            if let Some(existing_id) = self.match_existing(&table, &row)? {
                self.state.fk_map.record(&table, source_id, existing_id);
                if let Some(original_id) = relocated_from {
                    self.state
                        .fk_map
                        .redirect_relocation(source_table, original_id, existing_id);
                }
                self.state.stats.rows_merged += 1;
                emitted.push(Emitted {
                    table,
                    stream: Stream::Update,
                    row,
                });
                return Ok(());
            }

            let offset = self.mapping.identifier_offset(&table).ok_or_else(|| {
                MigrateError::Mapping(format!("{}: no identifier offset", table))
            })?;
            row.set(ID_COLUMN, (source_id + offset).to_string());

            let deferred = self.mapping.deferred(&table);
            if !deferred.is_empty() {
                let mut companion = TargetRow::new();
                companion.set(ID_COLUMN, source_id.to_string());
                for column in deferred {
                    if let Some(value) = row.remove(column) {
                        if !value.is_empty() {
                            companion.set(column, value);
                        }
                    }
                }
                if companion.len() > 1 {
                    self.state.stats.rows_deferred += 1;
                    emitted.push(Emitted {
                        table: table.clone(),
                        stream: Stream::Update,
                        row: companion,
                    });
                }
            }
        }

        if !row.contains(ID_COLUMN) && row.len() == 2 && !row.is_complete() {
            self.state.stats.rows_suppressed += 1;
            return Ok(());
        }

        self.state.stats.rows_inserted += 1;
        emitted.push(Emitted {
            table,
            stream: Stream::Insert,
            row,
        });
        Ok(())
    }

    /// Id of the pre-existing row matching `row` on its discriminators.
    fn match_existing(&self, table: &str, row: &TargetRow) -> Result<Option<i64>> {
        let discriminators = self.mapping.discriminators(table);
        if discriminators.is_empty() {
            return Ok(None);
        }
        let mut key = ExistingRow::new();
        for column in discriminators {
            let value = row.get(column).unwrap_or("");
            if value.is_empty() {
                return Ok(None);
            }
            key.insert(column.clone(), self.translate_key_value(table, column, value)?);
        }
        Ok(self.snapshot.find_id(table, &key))
    }

    /// Discriminator values that are foreign keys are compared in their
    /// final form.
    fn translate_key_value(&self, table: &str, column: &str, value: &str) -> Result<String> {
        let Some(referenced) = self
            .mapping
            .foreign_keys()
            .get(&format!("{}.{}", table, column))
        else {
            return Ok(value.to_string());
        };
        let id = parse_id(table, column, value)?;
        Ok(self
            .state
            .resolve_reference(self.mapping, referenced, id)
            .map(|resolved| resolved.to_string())
            .unwrap_or_else(|| value.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mapping::{CustomRules, Mapping};
    use crate::remap::snapshot::Snapshot;
    use indexmap::IndexMap;

    fn record(table: &str, pairs: &[(&str, &str)]) -> SourceRecord {
        let fields: IndexMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        SourceRecord::new(table, fields)
    }

    fn existing(pairs: &[(&str, &str)]) -> ExistingRow {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    fn mapping(yaml: &str, offsets: &[(&str, i64)]) -> Mapping {
        let mut custom = CustomRules::new();
        custom.register("inactive_discard", |source: &SourceRecord, _: &TargetRows| {
            match source.get("active") {
                Some("f") => CustomOutcome::Discard,
                other => CustomOutcome::Value(other.unwrap_or_default().to_string()),
            }
        });
        let mut mapping = Mapping::from_yaml(yaml, &custom).unwrap();
        let offsets = offsets.iter().map(|(t, o)| (t.to_string(), *o)).collect();
        let source_max = HashMap::from([
            ("res_partner".to_string(), 50),
            ("res_partner_address".to_string(), 20),
        ]);
        mapping.set_database_ids(offsets, &source_max);
        mapping
    }

    const PARTNER: &str = r#"
rules:
  res_partner:
    id:
      res_partner.id: __copy__
    name:
      res_partner.name: __copy__
    parent_id:
      res_partner.parent_id: __copy__
    active:
      res_partner.active: "@inactive_discard"
    comment: __forget__
"#;

    fn columns() -> TargetColumns {
        TargetColumns::default()
    }

    #[test]
    fn test_new_row_gets_offset_id() {
        let mapping = mapping(PARTNER, &[("res_partner", 100)]);
        let snapshot = Snapshot::new();
        let columns = columns();
        let mut state = RemapState::new();
        let mut transformer = RowTransformer::new(&mapping, &snapshot, &columns, &mut state);

        let out = transformer
            .transform(record("res_partner", &[("id", "5"), ("name", "Acme"), ("comment", "x")]))
            .unwrap();

        assert_eq!(out.len(), 1);
        assert_eq!(out[0].stream, Stream::Insert);
        assert_eq!(out[0].row.get("id"), Some("105"));
        assert_eq!(out[0].row.get("name"), Some("Acme"));
        assert!(!out[0].row.contains("comment"));
        assert_eq!(state.stats.rows_inserted, 1);
    }

    #[test]
    fn test_discriminator_match_goes_to_update_stream() {
        let yaml = format!("{}\ndiscriminators:\n  res_partner: [name]\n", PARTNER);
        let mapping = mapping(&yaml, &[("res_partner", 100)]);
        let mut snapshot = Snapshot::new();
        snapshot.insert_rows("res_partner", vec![existing(&[("id", "7"), ("name", "Acme")])]);
        let columns = columns();
        let mut state = RemapState::new();
        let mut transformer = RowTransformer::new(&mapping, &snapshot, &columns, &mut state);

        let out = transformer
            .transform(record("res_partner", &[("id", "5"), ("name", "Acme")]))
            .unwrap();

        assert_eq!(out.len(), 1);
        assert_eq!(out[0].stream, Stream::Update);
        assert_eq!(out[0].row.get("id"), Some("5"));
        assert_eq!(state.fk_map.get("res_partner", 5), Some(7));
        assert_eq!(state.stats.rows_merged, 1);
    }

    #[test]
    fn test_empty_discriminator_never_matches() {
        let yaml = format!("{}\ndiscriminators:\n  res_partner: [name, parent_id]\n", PARTNER);
        let mapping = mapping(&yaml, &[("res_partner", 100)]);
        let mut snapshot = Snapshot::new();
        snapshot.insert_rows(
            "res_partner",
            vec![existing(&[("id", "7"), ("name", "Acme"), ("parent_id", "")])],
        );
        let columns = columns();
        let mut state = RemapState::new();
        let mut transformer = RowTransformer::new(&mapping, &snapshot, &columns, &mut state);

        let out = transformer
            .transform(record("res_partner", &[("id", "5"), ("name", "Acme"), ("parent_id", "")]))
            .unwrap();

        assert_eq!(out[0].stream, Stream::Insert);
        assert_eq!(out[0].row.get("id"), Some("105"));
        assert!(state.fk_map.is_empty());
    }

    #[test]
    fn test_deferred_columns_split_into_companion_row() {
        let yaml = format!("{}\ndeferred:\n  res_partner: [parent_id]\n", PARTNER);
        let mapping = mapping(&yaml, &[("res_partner", 100)]);
        let snapshot = Snapshot::new();
        let columns = columns();
        let mut state = RemapState::new();
        let mut transformer = RowTransformer::new(&mapping, &snapshot, &columns, &mut state);

        let out = transformer
            .transform(record("res_partner", &[("id", "5"), ("name", "Acme"), ("parent_id", "6")]))
            .unwrap();
        assert_eq!(out.len(), 2);
        let update = out.iter().find(|e| e.stream == Stream::Update).unwrap();
        let insert = out.iter().find(|e| e.stream == Stream::Insert).unwrap();
        assert_eq!(update.row.get("id"), Some("5"));
        assert_eq!(update.row.get("parent_id"), Some("6"));
        assert!(!insert.row.contains("parent_id"));
        assert_eq!(insert.row.get("id"), Some("105"));

        let out = transformer
            .transform(record("res_partner", &[("id", "6"), ("name", "Top"), ("parent_id", "")]))
            .unwrap();
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].stream, Stream::Insert);
    }

    #[test]
    fn test_custom_rule_discard() {
        let mapping = mapping(PARTNER, &[("res_partner", 100)]);
        let snapshot = Snapshot::new();
        let columns = columns();
        let mut state = RemapState::new();
        let mut transformer = RowTransformer::new(&mapping, &snapshot, &columns, &mut state);

        let out = transformer
            .transform(record("res_partner", &[("id", "5"), ("name", "Old"), ("active", "f")]))
            .unwrap();
        assert!(out.is_empty());
        assert_eq!(state.stats.rows_rejected, 1);
    }

    #[test]
    fn test_moved_rows_get_allocated_ids() {
        let yaml = r#"
rules:
  res_partner:
    id:
      res_partner.id: __copy__
  res_partner_address:
    id:
      res_partner.id: __moved__
    street:
      res_partner.street: __copy__
discriminators:
  res_partner: [street]
"#;
        let mapping = mapping(yaml, &[("res_partner", 100)]);
        let mut snapshot = Snapshot::new();
        snapshot.insert_rows("res_partner", vec![existing(&[("id", "9"), ("street", "Dock Rd")])]);
        let columns = columns();
        let mut state = RemapState::new();
        let mut transformer = RowTransformer::new(&mapping, &snapshot, &columns, &mut state);

        let out = transformer
            .transform(record("res_partner_address", &[("id", "3"), ("street", "Main St")]))
            .unwrap();
        assert_eq!(out[0].table, "res_partner");
        assert_eq!(out[0].stream, Stream::Insert);
        assert_eq!(out[0].row.get("id"), Some("151"));

        let out = transformer
            .transform(record("res_partner_address", &[("id", "4"), ("street", "Dock Rd")]))
            .unwrap();
        assert_eq!(out[0].stream, Stream::Update);
        assert_eq!(out[0].row.get("id"), Some("52"));

        assert_eq!(state.fk_map.get("res_partner_address", 3), Some(151));
        assert_eq!(state.fk_map.get("res_partner_address", 4), Some(9));
        assert_eq!(state.fk_map.get("res_partner", 52), Some(9));
        assert_eq!(state.moved.get("res_partner_address"), Some("res_partner"));
    }

    #[test]
    fn test_vacuous_fan_out_and_incomplete_links_suppressed() {
        let yaml = r#"
rules:
  res_partner:
    id:
      res_partner.id: __copy__
    category_id:
      res_partner_category_rel.category_id: __copy__
    rel_partner:
      res_partner_category_rel.partner_id: __copy__
    fax:
      res_partner_fax.fax: __copy__
"#;
        let mapping = mapping(yaml, &[("res_partner", 100)]);
        let snapshot = Snapshot::new();
        let columns = columns();
        let mut state = RemapState::new();
        let mut transformer = RowTransformer::new(&mapping, &snapshot, &columns, &mut state);

        let out = transformer
            .transform(record(
                "res_partner",
                &[("id", "5"), ("category_id", ""), ("rel_partner", "105"), ("fax", "")],
            ))
            .unwrap();

        assert_eq!(out.len(), 1);
        assert_eq!(out[0].table, "res_partner");
        assert_eq!(state.stats.rows_suppressed, 2);
    }

    #[test]
    fn test_restricted_columns_are_skipped() {
        let mapping = mapping(PARTNER, &[("res_partner", 100)]);
        let snapshot = Snapshot::new();
        let mut columns = TargetColumns::from_map(BTreeMap::from([(
            "res_partner".to_string(),
            ["id", "name", "parent_id"].iter().map(|c| c.to_string()).collect(),
        )]));
        columns.forget_missing(&HashMap::from([(
            "res_partner".to_string(),
            vec!["id".to_string(), "name".to_string()],
        )]));
        let mut state = RemapState::new();
        let mut transformer = RowTransformer::new(&mapping, &snapshot, &columns, &mut state);

        let out = transformer
            .transform(record("res_partner", &[("id", "5"), ("name", "Acme"), ("parent_id", "2")]))
            .unwrap();
        assert!(!out[0].row.contains("parent_id"));
    }
}
