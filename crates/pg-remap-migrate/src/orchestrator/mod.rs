//! Migration orchestrator - main workflow coordinator.

use crate::config::Config;
use crate::error::{MigrateError, Result};
use crate::mapping::{CustomRules, Mapping, MappingLookup};
use crate::record::FileKind;
use crate::remap::{
    resolve_target_columns, schedule, ProcessStats, Processor, ProcessorOptions, TargetColumns,
};
use crate::source::{export_tables, SourcePool};
use crate::target::{capture_snapshot, PgPool, TargetPool, TargetSession, UpdateReport};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Connections used for introspection; the writes use one more.
const TARGET_POOL_SIZE: usize = 2;

/// Migration orchestrator.
pub struct Orchestrator {
    config: Config,
    custom: CustomRules,
}

/// Result of a migration run.
#[derive(Debug, Clone, Serialize)]
pub struct MigrationResult {
    /// Unique run identifier.
    pub run_id: String,

    /// Final status: committed, rolled_back or blocked.
    pub status: String,

    /// Total duration in seconds.
    pub duration_seconds: f64,

    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,

    /// SHA-256 of the configuration the run used.
    pub config_hash: String,

    /// Source tables, in processing order.
    pub tables_processed: Vec<String>,

    /// Destination tables written.
    pub target_tables: Vec<String>,

    /// Rows bulk loaded.
    pub rows_loaded: u64,

    /// Engine counters.
    pub stats: ProcessStats,

    /// Deferred update outcome per table.
    pub updates: UpdateReport,

    /// Directory holding the intermediate files.
    pub work_dir: PathBuf,
}

impl MigrationResult {
    /// Convert result to JSON string.
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}

/// Connection test outcome.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthCheckResult {
    pub source_connected: bool,
    pub source_latency_ms: u64,
    pub source_error: Option<String>,
    pub target_connected: bool,
    pub target_latency_ms: u64,
    pub target_error: Option<String>,
    pub healthy: bool,
}

/// Processing plan derived from already exported files.
#[derive(Debug, Clone, Serialize)]
pub struct Plan {
    pub order: Vec<String>,
    pub target_columns: BTreeMap<String, Vec<String>>,
    pub missing_exports: Vec<String>,
}

/// What the write phase did before the commit decision.
struct WriteSummary {
    rows_loaded: u64,
    updates: UpdateReport,
}

impl Orchestrator {
    /// Create a new orchestrator.
    pub fn new(config: Config) -> Self {
        Self {
            config,
            custom: CustomRules::new(),
        }
    }

    /// Custom rules mapping files may reference as `@name`.
    pub fn with_custom_rules(mut self, custom: CustomRules) -> Self {
        self.custom = custom;
        self
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Test both database connections.
    pub async fn health_check(&self) -> Result<HealthCheckResult> {
        let start = Instant::now();
        let source = SourcePool::new(&self.config.source, 1).await;
        let source_latency_ms = start.elapsed().as_millis() as u64;

        let start = Instant::now();
        let target = PgPool::new(&self.config.target, 1).await;
        let target_latency_ms = start.elapsed().as_millis() as u64;

        let source_error = source.err().map(|e| e.to_string());
        let target_error = target.err().map(|e| e.to_string());
        Ok(HealthCheckResult {
            source_connected: source_error.is_none(),
            source_latency_ms,
            target_connected: target_error.is_none(),
            target_latency_ms,
            healthy: source_error.is_none() && target_error.is_none(),
            source_error,
            target_error,
        })
    }

    /// Resolve columns and processing order from exported files in
    /// `work_dir`, without touching either database.
    pub fn plan(&self, work_dir: &Path) -> Result<Plan> {
        let mapping = Mapping::load(&self.config.migration.mapping_files, &self.custom)?;
        let tables = self.config.migration.effective_tables();

        let (files, missing): (Vec<_>, Vec<_>) = tables
            .iter()
            .map(|t| (t.clone(), FileKind::Export.path(work_dir, t)))
            .partition(|(_, path)| path.exists());
        let files: Vec<PathBuf> = files.into_iter().map(|(_, path)| path).collect();

        let columns = resolve_target_columns(&files, &mapping)?;
        let order = schedule(&tables, columns.tables(), &mapping, self.property_table());
        Ok(Plan {
            order,
            target_columns: columns
                .iter()
                .map(|(t, c)| (t.to_string(), c.to_vec()))
                .collect(),
            missing_exports: missing.into_iter().map(|(t, _)| t).collect(),
        })
    }

    fn property_table(&self) -> Option<&str> {
        Some(self.config.migration.property_table.as_str()).filter(|t| !t.is_empty())
    }

    /// Run the migration.
    ///
    /// All writes happen in one transaction. It is committed only when the
    /// deferred updates all succeeded and `confirm` accepts the result;
    /// otherwise it is rolled back and the destination is left unchanged.
    pub async fn run<F>(
        self,
        cancel: Option<watch::Receiver<bool>>,
        confirm: F,
    ) -> Result<MigrationResult>
    where
        F: FnOnce(&MigrationResult) -> bool,
    {
        let run_id = Uuid::new_v4().to_string();
        let cancel = cancel.unwrap_or_else(|| watch::channel(false).1);
        let (work_dir, owned) = self.prepare_work_dir(&run_id)?;
        info!("Starting run {} in {}", run_id, work_dir.display());

        let result = self.run_in(&run_id, &work_dir, &cancel, confirm).await;

        if owned && !self.config.migration.keep_files {
            match std::fs::remove_dir_all(&work_dir) {
                Ok(()) => debug!("Removed {}", work_dir.display()),
                Err(e) => warn!("Could not remove {}: {}", work_dir.display(), e),
            }
        } else {
            info!("Intermediate files kept in {}", work_dir.display());
        }
        result
    }

    fn prepare_work_dir(&self, run_id: &str) -> Result<(PathBuf, bool)> {
        match &self.config.migration.work_dir {
            Some(dir) => {
                std::fs::create_dir_all(dir)?;
                Ok((dir.clone(), false))
            }
            None => {
                let dir = std::env::temp_dir().join(format!("pg-remap-migrate-{}", run_id));
                std::fs::create_dir_all(&dir)?;
                Ok((dir, true))
            }
        }
    }

    async fn run_in<F>(
        &self,
        run_id: &str,
        work_dir: &Path,
        cancel: &watch::Receiver<bool>,
        confirm: F,
    ) -> Result<MigrationResult>
    where
        F: FnOnce(&MigrationResult) -> bool,
    {
        let started_at = Utc::now();
        let start = Instant::now();
        let migration = &self.config.migration;
        let tables = migration.effective_tables();
        let workers = migration.get_workers();

        info!("Phase 1: exporting {} source tables ({} workers)", tables.len(), workers);
        let source = Arc::new(SourcePool::new(&self.config.source, workers).await?);
        let files = export_tables(source.clone(), &tables, work_dir, workers).await?;
        check_cancel(cancel)?;

        info!("Phase 2: resolving target columns");
        let mut mapping = Mapping::load(&migration.mapping_files, &self.custom)?;
        let target = PgPool::new(&self.config.target, TARGET_POOL_SIZE).await?;
        let mut columns = resolve_target_columns(&files, &mapping)?;
        let destination: Vec<String> = columns.tables().map(str::to_string).collect();
        if migration.forget_missing_columns {
            let existing = target.table_columns(&destination).await?;
            columns.forget_missing(&existing);
        }
        let destination: Vec<String> = columns.tables().map(str::to_string).collect();
        info!("{} destination tables", destination.len());

        info!("Phase 3: computing identifier offsets");
        let offsets = target.max_ids(&destination).await?;
        let source_max_ids = source.max_ids(&tables).await?;
        mapping.set_database_ids(offsets, &source_max_ids);

        info!("Phase 4: collecting foreign keys and existing rows");
        let discovered = target
            .foreign_keys(&destination)
            .await?
            .into_iter()
            .filter(|(_, referenced)| destination.contains(referenced))
            .collect();
        mapping.add_discovered_foreign_keys(discovered);
        debug!("{} foreign keys to remap", mapping.foreign_keys().len());
        let snapshot = capture_snapshot(&target, &columns, &mapping).await?;
        check_cancel(cancel)?;

        info!("Phase 5: processing record files");
        let options = ProcessorOptions {
            property_table: self.property_table().map(str::to_string),
            delete_consumed_files: migration.delete_consumed_files,
        };
        let mut processor = Processor::new(&mapping, &snapshot, &columns, options);
        let outcome = processor.process(work_dir, &tables)?;
        check_cancel(cancel)?;

        info!("Phase 6: writing to target");
        let session = target.session().await?;
        let summary = match self
            .write(&session, &mapping, &columns, &outcome.target_files, &outcome.update_files)
            .await
        {
            Ok(summary) => summary,
            Err(e) => {
                error!("Write phase failed: {}", e);
                session.rollback().await?;
                return Err(e);
            }
        };
        if check_cancel(cancel).is_err() {
            session.rollback().await?;
            return Err(MigrateError::Cancelled);
        }

        let mut result = MigrationResult {
            run_id: run_id.to_string(),
            status: "pending".to_string(),
            duration_seconds: start.elapsed().as_secs_f64(),
            started_at,
            completed_at: Utc::now(),
            config_hash: self.config.hash(),
            tables_processed: outcome.order,
            target_tables: destination,
            rows_loaded: summary.rows_loaded,
            stats: outcome.stats,
            updates: summary.updates,
            work_dir: work_dir.to_path_buf(),
        };

        if let Err(e) = result.updates.ensure_committable() {
            session.rollback().await?;
            error!("{}; nothing was committed", e);
            return Err(e);
        }

        if confirm(&result) {
            session.commit().await?;
            result.status = "committed".to_string();
        } else {
            session.rollback().await?;
            result.status = "rolled_back".to_string();
            info!("Run finished without writing; confirm to commit");
        }
        result.completed_at = Utc::now();
        result.duration_seconds = start.elapsed().as_secs_f64();

        info!(
            "Run {} {}: {} rows read, {} loaded in {:.1}s",
            result.run_id,
            result.status,
            result.stats.rows_read,
            result.rows_loaded,
            result.duration_seconds
        );
        Ok(result)
    }

    async fn write(
        &self,
        session: &TargetSession,
        mapping: &Mapping,
        columns: &TargetColumns,
        target_files: &[(String, PathBuf)],
        update_files: &[(String, PathBuf)],
    ) -> Result<WriteSummary> {
        let rows_loaded = session.load_files(target_files).await?;
        let updates = session.apply_updates(update_files).await?;
        if self.config.migration.drop_stored_columns {
            session.drop_stored_columns(mapping.stored_columns()).await?;
        }
        if self.config.migration.reset_sequences {
            let with_id: Vec<String> = columns
                .iter()
                .filter(|(_, c)| c.iter().any(|c| c == crate::record::ID_COLUMN))
                .map(|(t, _)| t.to_string())
                .collect();
            session.reset_sequences(&with_id).await?;
        }
        Ok(WriteSummary {
            rows_loaded,
            updates,
        })
    }
}

fn check_cancel(cancel: &watch::Receiver<bool>) -> Result<()> {
    if *cancel.borrow() {
        warn!("Cancellation requested, stopping before commit");
        return Err(MigrateError::Cancelled);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn config(dir: &Path) -> Config {
        let mapping = dir.join("mapping.yml");
        fs::write(
            &mapping,
            r#"
rules:
  res_partner:
    id:
      res_partner.id: __copy__
    company_id:
      res_partner.company_id: __copy__
  res_company:
    id:
      res_company.id: __copy__
    name:
      res_company.name: __copy__
discriminators:
  res_partner: [company_id]
foreign_keys:
  res_partner.company_id: res_company
"#,
        )
        .unwrap();
        let yaml = format!(
            r#"
source: {{ host: db1, database: erp_v6, user: odoo }}
target: {{ host: db2, database: erp_v7, user: odoo }}
migration:
  tables: [res_partner, res_company, res_users]
  mapping_files: ["{}"]
"#,
            mapping.display()
        );
        Config::from_yaml(&yaml).unwrap()
    }

    #[test]
    fn test_plan_orders_discriminator_targets_first() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("res_partner.csv"), "id,company_id\n").unwrap();
        fs::write(dir.path().join("res_company.csv"), "id,name\n").unwrap();

        let orchestrator = Orchestrator::new(config(dir.path()));
        let plan = orchestrator.plan(dir.path()).unwrap();

        assert_eq!(plan.order, vec!["res_company", "res_partner", "res_users"]);
        assert_eq!(plan.target_columns["res_company"], vec!["id", "name"]);
        assert_eq!(plan.missing_exports, vec!["res_users"]);
    }

    #[test]
    fn test_check_cancel() {
        let (tx, rx) = watch::channel(false);
        assert!(check_cancel(&rx).is_ok());
        tx.send(true).unwrap();
        assert!(matches!(check_cancel(&rx), Err(MigrateError::Cancelled)));
    }

    #[test]
    fn test_result_serializes() {
        let result = MigrationResult {
            run_id: "run".into(),
            status: "rolled_back".into(),
            duration_seconds: 1.5,
            started_at: Utc::now(),
            completed_at: Utc::now(),
            config_hash: "abc".into(),
            tables_processed: vec!["res_partner".into()],
            target_tables: vec!["res_partner".into()],
            rows_loaded: 3,
            stats: ProcessStats::default(),
            updates: UpdateReport::default(),
            work_dir: PathBuf::from("/tmp/run"),
        };
        let json = result.to_json().unwrap();
        assert!(json.contains("\"status\": \"rolled_back\""));
        assert!(json.contains("\"rows_merged\": 0"));
    }
}
