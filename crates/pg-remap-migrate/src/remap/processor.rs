//! Two-pass driver over a work directory of exported files.

use super::columns::TargetColumns;
use super::postprocess::Postprocessor;
use super::scheduler;
use super::snapshot::ExistingSnapshot;
use super::state::{ProcessStats, RemapState};
use super::transform::{RowTransformer, Stream, StreamWriters};
use crate::error::Result;
use crate::mapping::MappingLookup;
use crate::record::{has_data_rows, FileKind};
use serde::Serialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Instant;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Default)]
pub struct ProcessorOptions {
    /// Generic property store, always processed last.
    pub property_table: Option<String>,
    /// Remove exported and first-pass files once consumed.
    pub delete_consumed_files: bool,
}

/// Load-ready output of a run.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ProcessOutcome {
    /// Source tables in the order they were transformed.
    pub order: Vec<String>,
    /// `<table>.target2.csv` files per destination table.
    pub target_files: Vec<(String, PathBuf)>,
    /// `<table>.update2.csv` files holding at least one row.
    pub update_files: Vec<(String, PathBuf)>,
    pub stats: ProcessStats,
}

pub struct Processor<'a, M: MappingLookup + ?Sized, S: ExistingSnapshot + ?Sized> {
    mapping: &'a M,
    snapshot: &'a S,
    columns: &'a TargetColumns,
    options: ProcessorOptions,
    state: RemapState,
}

impl<'a, M, S> Processor<'a, M, S>
where
    M: MappingLookup + ?Sized,
    S: ExistingSnapshot + ?Sized,
{
    pub fn new(
        mapping: &'a M,
        snapshot: &'a S,
        columns: &'a TargetColumns,
        options: ProcessorOptions,
    ) -> Self {
        Self {
            mapping,
            snapshot,
            columns,
            options,
            state: RemapState::new(),
        }
    }

    pub fn state(&self) -> &RemapState {
        &self.state
    }

    /// Processing order of `source_tables`.
    pub fn schedule(&self, source_tables: &[String]) -> Vec<String> {
        scheduler::schedule(
            source_tables,
            self.columns.tables(),
            self.mapping,
            self.options.property_table.as_deref(),
        )
    }

    /// Transform every exported table, then finalize references.
    pub fn process(&mut self, work_dir: &Path, source_tables: &[String]) -> Result<ProcessOutcome> {
        let order = self.schedule(source_tables);
        info!("Processing {} tables: {}", order.len(), order.join(", "));

        let start = Instant::now();
        self.transform_all(work_dir, &order)?;
        info!(
            "Transformed {} rows in {:.1}s ({} inserted, {} merged, {} deferred)",
            self.state.stats.rows_read,
            start.elapsed().as_secs_f64(),
            self.state.stats.rows_inserted,
            self.state.stats.rows_merged,
            self.state.stats.rows_deferred
        );

        let start = Instant::now();
        let mut outcome = self.postprocess_all(work_dir, &order)?;
        info!(
            "Postprocessed in {:.1}s ({} written, {} unresolved, {} duplicate)",
            start.elapsed().as_secs_f64(),
            self.state.stats.rows_written,
            self.state.stats.rows_unresolved,
            self.state.stats.rows_duplicate
        );

        outcome.order = order;
        outcome.stats = self.state.stats.clone();
        Ok(outcome)
    }

    fn transform_all(&mut self, work_dir: &Path, order: &[String]) -> Result<()> {
        let mut writers = StreamWriters::create(work_dir, self.columns)?;
        let mut transformer =
            RowTransformer::new(self.mapping, self.snapshot, self.columns, &mut self.state);

        for table in order {
            let path = FileKind::Export.path(work_dir, table);
            if !path.exists() {
                warn!("{}: no exported file at {}, skipping", table, path.display());
                continue;
            }
            transformer.process_file(&path, table, &mut writers)?;
            if self.options.delete_consumed_files {
                remove_consumed(&path);
            }
        }
        writers.flush()
    }

    fn postprocess_all(&mut self, work_dir: &Path, order: &[String]) -> Result<ProcessOutcome> {
        let mut outcome = ProcessOutcome::default();
        let postprocessor = Postprocessor::new(self.mapping, self.snapshot, &self.state);
        let mut totals = (0, 0, 0);

        for table in load_order(order, self.columns.tables()) {
            let table = table.as_str();
            for stream in [Stream::Insert, Stream::Update] {
                let input = stream.first_pass_file().path(work_dir, table);
                let output = stream.load_file().path(work_dir, table);
                let stats = postprocessor.process_file(&input, &output, table, stream)?;
                totals.0 += stats.written;
                totals.1 += stats.unresolved;
                totals.2 += stats.duplicates;

                if self.options.delete_consumed_files {
                    remove_consumed(&input);
                }
                match stream {
                    Stream::Insert => outcome.target_files.push((table.to_string(), output)),
                    Stream::Update if has_data_rows(&output)? => {
                        outcome.update_files.push((table.to_string(), output))
                    }
                    Stream::Update => debug!("{}: no updates", table),
                }
            }
        }

        self.state.stats.rows_written += totals.0;
        self.state.stats.rows_unresolved += totals.1;
        self.state.stats.rows_duplicate += totals.2;
        Ok(outcome)
    }
}

/// Destination tables in load order: those named in the processing order
/// keep that order, the others follow.
fn load_order<'a>(
    order: &[String],
    destination_tables: impl IntoIterator<Item = &'a str>,
) -> Vec<String> {
    let mut remaining: Vec<&str> = destination_tables.into_iter().collect();
    let mut tables = Vec::with_capacity(remaining.len());
    for table in order {
        if let Some(pos) = remaining.iter().position(|t| t == table) {
            tables.push(remaining.remove(pos).to_string());
        }
    }
    tables.extend(remaining.into_iter().map(str::to_string));
    tables
}

fn remove_consumed(path: &Path) {
    if let Err(e) = fs::remove_file(path) {
        warn!("Couldn't remove {}: {}", path.display(), e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mapping::{CustomRules, Mapping};
    use crate::remap::columns::resolve_target_columns;
    use crate::remap::snapshot::Snapshot;
    use std::collections::HashMap;
    use tempfile::TempDir;

    const MAPPING: &str = r#"
rules:
  res_partner:
    id:
      res_partner.id: __copy__
    name:
      res_partner.name: __copy__
    parent_id:
      res_partner.parent_id: __copy__
deferred:
  res_partner: [parent_id]
foreign_keys:
  res_partner.parent_id: res_partner
"#;

    #[test]
    fn test_process_writes_load_ready_files() {
        let dir = TempDir::new().unwrap();
        let export = FileKind::Export.path(dir.path(), "res_partner");
        fs::write(&export, "id,name,parent_id\n1,Top,\n2,Child,1\n").unwrap();

        let mut mapping = Mapping::from_yaml(MAPPING, &CustomRules::new()).unwrap();
        mapping.set_database_ids(
            HashMap::from([("res_partner".to_string(), 10)]),
            &HashMap::from([("res_partner".to_string(), 2)]),
        );
        let columns = resolve_target_columns(&[&export], &mapping).unwrap();
        let snapshot = Snapshot::new();
        let options = ProcessorOptions {
            property_table: None,
            delete_consumed_files: true,
        };
        let mut processor = Processor::new(&mapping, &snapshot, &columns, options);

        let outcome = processor
            .process(dir.path(), &["res_partner".to_string()])
            .unwrap();

        assert_eq!(outcome.order, vec!["res_partner"]);
        assert_eq!(outcome.target_files.len(), 1);
        assert_eq!(outcome.update_files.len(), 1);
        assert!(!export.exists());
        assert!(!FileKind::Target.path(dir.path(), "res_partner").exists());

        let inserted = fs::read_to_string(&outcome.target_files[0].1).unwrap();
        assert_eq!(inserted, "id,name,parent_id\n11,Top,\n12,Child,\n");
        let updated = fs::read_to_string(&outcome.update_files[0].1).unwrap();
        assert_eq!(updated, "id,name,parent_id\n12,,11\n");
        assert_eq!(outcome.stats.rows_read, 2);
        assert_eq!(outcome.stats.rows_deferred, 1);
        assert_eq!(outcome.stats.rows_written, 3);
    }

    #[test]
    fn test_load_follows_processing_order() {
        let order = vec![
            "res_company".to_string(),
            "res_partner".to_string(),
            "ir_property".to_string(),
        ];
        let destination = ["ir_property", "mail_message", "res_company", "res_partner"];

        assert_eq!(
            load_order(&order, destination),
            vec!["res_company", "res_partner", "ir_property", "mail_message"]
        );
    }

    #[test]
    fn test_missing_consumed_file_is_not_fatal() {
        let dir = TempDir::new().unwrap();
        remove_consumed(&dir.path().join("gone.csv"));
        assert!(dir.path().exists());
    }
}
