//! Configuration type definitions with auto-tuning based on system resources.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use sysinfo::System;
use tracing::info;

/// System resource information for auto-tuning.
#[derive(Debug, Clone)]
pub struct SystemResources {
    /// Total RAM in GB.
    pub total_memory_gb: f64,
    /// Number of CPU cores.
    pub cpu_cores: usize,
}

impl SystemResources {
    /// Detect system resources.
    pub fn detect() -> Self {
        let mut sys = System::new_all();
        sys.refresh_all();

        let total_memory_gb = sys.total_memory() as f64 / (1024.0 * 1024.0 * 1024.0);
        let cpu_cores = sys.cpus().len();

        Self {
            total_memory_gb,
            cpu_cores,
        }
    }

    /// Log detected system resources.
    pub fn log(&self) {
        info!(
            "System resources: {:.1} GB RAM, {} CPU cores",
            self.total_memory_gb, self.cpu_cores
        );
    }
}

/// Root configuration structure.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Source database configuration (old schema version).
    pub source: DatabaseConfig,

    /// Destination database configuration (new schema version).
    pub target: DatabaseConfig,

    /// Migration behavior configuration.
    pub migration: MigrationConfig,
}

impl Config {
    /// Apply auto-tuned defaults based on system resources.
    /// Only fills in values that weren't explicitly set in the config file.
    pub fn with_auto_tuning(mut self) -> Self {
        let resources = SystemResources::detect();
        resources.log();
        self.migration = self.migration.with_auto_tuning(&resources);
        self
    }
}

/// PostgreSQL connection settings, used for both sides of the migration.
#[derive(Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// Database host.
    pub host: String,

    /// Database port (default: 5432).
    #[serde(default = "default_pg_port")]
    pub port: u16,

    /// Database name.
    pub database: String,

    /// Username.
    pub user: String,

    /// Password.
    #[serde(default)]
    pub password: String,

    /// Schema holding the application tables (default: "public").
    #[serde(default = "default_public_schema")]
    pub schema: String,
}

impl fmt::Debug for DatabaseConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DatabaseConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("database", &self.database)
            .field("user", &self.user)
            .field("password", &"[REDACTED]")
            .field("schema", &self.schema)
            .finish()
    }
}

/// Migration behavior configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MigrationConfig {
    /// Source tables to export and migrate.
    pub tables: Vec<String>,

    /// Tables removed from `tables` before export.
    #[serde(default)]
    pub exclude_tables: Vec<String>,

    /// Mapping files, merged in order (later files win).
    pub mapping_files: Vec<PathBuf>,

    /// Directory for intermediate record files. A fresh temp dir if unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub work_dir: Option<PathBuf>,

    /// Keep intermediate record files after the run (default: false).
    #[serde(default)]
    pub keep_files: bool,

    /// Delete export and pass-1 files as soon as they are consumed (default: false).
    #[serde(default)]
    pub delete_consumed_files: bool,

    /// Drop target columns that don't exist in the destination schema (default: false).
    #[serde(default)]
    pub forget_missing_columns: bool,

    /// Generic property store table, always processed last.
    #[serde(default = "default_property_table")]
    pub property_table: String,

    /// Parallel export workers. Auto-tuned based on CPU cores if not set.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workers: Option<usize>,

    /// Drop stored (computed) columns after the deferred updates (default: true).
    #[serde(default = "default_true")]
    pub drop_stored_columns: bool,

    /// Reset id sequences to the new maximum after loading (default: true).
    #[serde(default = "default_true")]
    pub reset_sequences: bool,
}

impl MigrationConfig {
    /// Apply auto-tuned defaults based on system resources.
    pub fn with_auto_tuning(mut self, resources: &SystemResources) -> Self {
        // Leave two cores of headroom for the databases themselves
        if self.workers.is_none() {
            self.workers = Some(resources.cpu_cores.saturating_sub(2).max(1));
        }

        info!("Auto-tuned config: workers={}", self.get_workers());

        self
    }

    /// Source tables to migrate, with exclusions applied.
    pub fn effective_tables(&self) -> Vec<String> {
        self.tables
            .iter()
            .filter(|t| !self.exclude_tables.contains(t))
            .cloned()
            .collect()
    }

    pub fn get_workers(&self) -> usize {
        self.workers.unwrap_or(2)
    }
}

// Default value functions for serde
fn default_pg_port() -> u16 {
    5432
}

fn default_public_schema() -> String {
    "public".to_string()
}

fn default_property_table() -> String {
    "ir_property".to_string()
}

fn default_true() -> bool {
    true
}
