//! Source database export.
//!
//! Every migrated table is streamed with `COPY ... TO STDOUT` in CSV format
//! into `<table>.csv` in the work directory.

use crate::config::DatabaseConfig;
use crate::error::{MigrateError, Result};
use crate::record::FileKind;
use crate::target::{qualify_table, quote_ident};
use deadpool_postgres::{Object, Pool};
use futures::StreamExt;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::sync::Semaphore;
use tracing::{debug, info};

/// Read-only connection pool on the source database.
pub struct SourcePool {
    pool: Pool,
    schema: String,
}

impl SourcePool {
    /// Create the pool and test one connection.
    pub async fn new(config: &DatabaseConfig, max_conns: usize) -> Result<Self> {
        let pool = config.build_pool(max_conns)?;
        let source = Self {
            pool,
            schema: config.schema.clone(),
        };
        source.test_connection().await?;
        info!(
            "Connected to source: {}:{}/{}",
            config.host, config.port, config.database
        );
        Ok(source)
    }

    async fn client(&self, context: &str) -> Result<Object> {
        self.pool
            .get()
            .await
            .map_err(|e| MigrateError::pool(e.to_string(), context))
    }

    pub async fn test_connection(&self) -> Result<()> {
        let client = self.client("testing source connection").await?;
        client
            .simple_query("SELECT 1")
            .await
            .map_err(MigrateError::Source)?;
        Ok(())
    }

    /// Export `table` to `<dir>/<table>.csv`; returns the number of bytes written.
    pub async fn export_table(&self, table: &str, dir: &Path) -> Result<u64> {
        let client = self.client("exporting table").await?;
        let query = format!(
            "COPY {} TO STDOUT WITH (FORMAT csv, HEADER true)",
            qualify_table(&self.schema, table)
        );
        debug!("{}", query);

        let stream = client.copy_out(&query).await.map_err(MigrateError::Source)?;
        futures::pin_mut!(stream);

        let path = FileKind::Export.path(dir, table);
        let mut file = tokio::fs::File::create(&path).await?;
        let mut written = 0u64;
        while let Some(chunk) = stream.next().await {
            let bytes = chunk.map_err(MigrateError::Source)?;
            file.write_all(&bytes).await?;
            written += bytes.len() as u64;
        }
        file.flush().await?;
        Ok(written)
    }

    /// Max `id` of every table that has an `id` column.
    pub async fn max_ids(&self, tables: &[String]) -> Result<HashMap<String, i64>> {
        let client = self.client("reading source ids").await?;
        max_ids(&client, &self.schema, tables)
            .await
            .map_err(MigrateError::Source)
    }
}

/// Max `id` per table, 0 for empty tables; tables without `id` are left out.
pub(crate) async fn max_ids(
    client: &Object,
    schema: &str,
    tables: &[String],
) -> std::result::Result<HashMap<String, i64>, tokio_postgres::Error> {
    let rows = client
        .query(
            "SELECT table_name::text FROM information_schema.columns \
             WHERE table_schema::text = $1 AND column_name::text = 'id' \
             AND table_name::text = ANY($2)",
            &[&schema, &tables],
        )
        .await?;

    let mut ids = HashMap::new();
    for row in rows {
        let table: String = row.get(0);
        let query = format!(
            "SELECT COALESCE(MAX({}), 0)::int8 FROM {}",
            quote_ident("id"),
            qualify_table(schema, &table)
        );
        let max: i64 = client.query_one(&query, &[]).await?.get(0);
        ids.insert(table, max);
    }
    Ok(ids)
}

/// Export `tables` concurrently with at most `workers` tables in flight.
pub async fn export_tables(
    source: Arc<SourcePool>,
    tables: &[String],
    dir: &Path,
    workers: usize,
) -> Result<Vec<PathBuf>> {
    let semaphore = Arc::new(Semaphore::new(workers.max(1)));
    let mut handles = Vec::with_capacity(tables.len());

    for table in tables {
        let permit = semaphore
            .clone()
            .acquire_owned()
            .await
            .map_err(|e| MigrateError::pool(e.to_string(), "acquiring export worker"))?;
        let source = source.clone();
        let name = table.clone();
        let dir = dir.to_path_buf();
        let handle = tokio::spawn(async move {
            let result = source.export_table(&name, &dir).await;
            drop(permit);
            result
        });
        handles.push((table.clone(), handle));
    }

    let mut files = Vec::with_capacity(handles.len());
    for (table, handle) in handles {
        let bytes = handle
            .await
            .map_err(|e| MigrateError::pool(e.to_string(), format!("export task for {}", table)))??;
        debug!("{}: exported {} bytes", table, bytes);
        files.push(FileKind::Export.path(dir, &table));
    }
    info!("Exported {} tables", files.len());
    Ok(files)
}
