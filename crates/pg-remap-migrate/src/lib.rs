//! # pg-remap-migrate
//!
//! Bulk record migration between two versions of a PostgreSQL application
//! schema.
//!
//! Records exported from the old database are rewritten through declarative
//! mapping rules and merged into a new database that may already hold data:
//!
//! - **Export** of every source table with the PostgreSQL COPY protocol
//! - **Id offsetting** so migrated rows never collide with existing ones
//! - **Natural-key merging** of rows the destination already has
//! - **Foreign-key and polymorphic reference rewriting** in a second pass
//! - **Deferred updates** for self and cyclic references
//! - **Single-transaction load** with an explicit commit decision
//!
//! ## Example
//!
//! ```rust,no_run
//! use pg_remap_migrate::{Config, Orchestrator};
//!
//! #[tokio::main]
//! async fn main() -> pg_remap_migrate::Result<()> {
//!     let config = Config::load("config.yaml")?.with_auto_tuning();
//!     let orchestrator = Orchestrator::new(config);
//!     let result = orchestrator.run(None, |_| true).await?;
//!     println!("Loaded {} rows ({})", result.rows_loaded, result.status);
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod error;
pub mod mapping;
pub mod orchestrator;
pub mod record;
pub mod remap;
pub mod source;
pub mod target;

// Re-exports for convenient access
pub use config::{Config, DatabaseConfig, MigrationConfig};
pub use error::{MigrateError, Result};
pub use mapping::{ColumnMapping, CustomRule, CustomRules, Mapping, MappingLookup, MappingRule};
pub use orchestrator::{HealthCheckResult, MigrationResult, Orchestrator, Plan};
pub use remap::{ProcessOutcome, ProcessStats, Processor, ProcessorOptions, Snapshot};
pub use source::SourcePool;
pub use target::{PgPool, TargetPool, UpdateReport};
