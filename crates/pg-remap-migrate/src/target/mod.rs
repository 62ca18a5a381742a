//! Destination database operations.
//!
//! Introspection (column sets, id offsets, foreign keys, primary keys and the
//! pre-migration snapshot) goes through [`TargetPool`]. Every write happens
//! on one [`TargetSession`] inside a single transaction, so that a failed or
//! unconfirmed run leaves the destination untouched.

use crate::config::DatabaseConfig;
use crate::error::{MigrateError, Result};
use crate::mapping::MappingLookup;
use crate::record::{has_data_rows, read_header, ID_COLUMN};
use crate::remap::{ExistingRow, Snapshot, TargetColumns};
use async_trait::async_trait;
use bytes::BytesMut;
use deadpool_postgres::{Object, Pool};
use futures::{SinkExt, StreamExt};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use tokio::io::AsyncReadExt;
use tracing::{debug, error, info, warn};

/// Prefix of the staging tables used to merge deferred updates.
const STAGING_PREFIX: &str = "_staging_";

/// COPY chunk size when streaming record files.
const CHUNK_SIZE: usize = 1024 * 1024;

/// Quote a PostgreSQL identifier.
pub fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// Fully qualify a table name.
pub fn qualify_table(schema: &str, table: &str) -> String {
    format!("{}.{}", quote_ident(schema), quote_ident(table))
}

/// Session-local staging table for `table`, always resolved in `pg_temp`
/// so a destination table of the same name is never touched.
pub fn staging_table(table: &str) -> String {
    qualify_table("pg_temp", &format!("{}{}", STAGING_PREFIX, table))
}

/// Build the UPDATE merging staged rows of `staging` into `schema.table`.
///
/// Staged rows are matched on the primary key; every other staged column
/// overwrites the destination value unless the staged value is null.
/// Returns `None` when the staged columns are all key columns.
pub fn merge_statement(
    schema: &str,
    table: &str,
    staging: &str,
    header: &[String],
    pk: &[String],
) -> Result<Option<String>> {
    if pk.is_empty() {
        return Err(MigrateError::NoPrimaryKey(table.to_string()));
    }
    if let Some(missing) = pk.iter().find(|c| !header.contains(c)) {
        return Err(MigrateError::invalid_record(
            table,
            format!("update file lacks primary key column {}", missing),
        ));
    }

    let target = qualify_table(schema, table);
    let assignments = header
        .iter()
        .filter(|c| !pk.contains(c))
        .map(|c| {
            let c = quote_ident(c);
            format!("{c} = COALESCE({staging}.{c}, {target}.{c})")
        })
        .collect::<Vec<_>>();
    if assignments.is_empty() {
        return Ok(None);
    }

    let join = pk
        .iter()
        .map(|c| {
            let c = quote_ident(c);
            format!("{target}.{c} = {staging}.{c}")
        })
        .collect::<Vec<_>>()
        .join(" AND ");
    Ok(Some(format!(
        "UPDATE {target} SET {} FROM {staging} WHERE {join}",
        assignments.join(", ")
    )))
}

fn column_list(columns: &[String]) -> String {
    columns
        .iter()
        .map(|c| quote_ident(c))
        .collect::<Vec<_>>()
        .join(", ")
}

/// Read-side operations on the destination database.
#[async_trait]
pub trait TargetPool: Send + Sync {
    async fn test_connection(&self) -> Result<()>;

    /// Real columns of each existing table among `tables`.
    async fn table_columns(&self, tables: &[String]) -> Result<HashMap<String, Vec<String>>>;

    /// Max `id` per table (0 when empty), for tables with an `id` column.
    async fn max_ids(&self, tables: &[String]) -> Result<HashMap<String, i64>>;

    /// Foreign keys declared on `tables`, `table.column` -> referenced table.
    async fn foreign_keys(&self, tables: &[String]) -> Result<BTreeMap<String, String>>;

    /// Primary key columns of `table`, empty when it has none.
    async fn primary_key(&self, table: &str) -> Result<Vec<String>>;

    /// Current values of `columns` for every row of `table`, rendered as CSV
    /// text the same way the source export renders them.
    async fn existing_rows(&self, table: &str, columns: &[String]) -> Result<Vec<ExistingRow>>;
}

/// PostgreSQL destination pool.
pub struct PgPool {
    pool: Pool,
    schema: String,
}

impl PgPool {
    /// Create the pool and test one connection.
    pub async fn new(config: &DatabaseConfig, max_conns: usize) -> Result<Self> {
        let pool = config.build_pool(max_conns)?;
        let target = Self {
            pool,
            schema: config.schema.clone(),
        };
        target.test_connection().await?;
        info!(
            "Connected to target: {}:{}/{}",
            config.host, config.port, config.database
        );
        Ok(target)
    }

    pub fn schema(&self) -> &str {
        &self.schema
    }

    async fn client(&self, context: &str) -> Result<Object> {
        self.pool
            .get()
            .await
            .map_err(|e| MigrateError::pool(e.to_string(), context))
    }

    /// Open the session carrying the run's single write transaction.
    pub async fn session(&self) -> Result<TargetSession> {
        let client = self.client("opening write session").await?;
        client.batch_execute("BEGIN").await?;
        debug!("Write transaction opened");
        Ok(TargetSession {
            client: Some(client),
            schema: self.schema.clone(),
            open: true,
        })
    }
}

#[async_trait]
impl TargetPool for PgPool {
    async fn test_connection(&self) -> Result<()> {
        let client = self.client("testing target connection").await?;
        client.simple_query("SELECT 1").await?;
        Ok(())
    }

    async fn table_columns(&self, tables: &[String]) -> Result<HashMap<String, Vec<String>>> {
        let client = self.client("reading target columns").await?;
        let rows = client
            .query(
                "SELECT table_name::text, column_name::text FROM information_schema.columns \
                 WHERE table_schema::text = $1 AND table_name::text = ANY($2) \
                 ORDER BY table_name, ordinal_position",
                &[&self.schema, &tables],
            )
            .await?;

        let mut columns: HashMap<String, Vec<String>> = HashMap::new();
        for row in rows {
            columns.entry(row.get(0)).or_default().push(row.get(1));
        }
        Ok(columns)
    }

    async fn max_ids(&self, tables: &[String]) -> Result<HashMap<String, i64>> {
        let client = self.client("reading target ids").await?;
        Ok(crate::source::max_ids(&client, &self.schema, tables).await?)
    }

    async fn foreign_keys(&self, tables: &[String]) -> Result<BTreeMap<String, String>> {
        let client = self.client("reading target foreign keys").await?;
        let rows = client
            .query(
                "SELECT kcu.table_name::text, kcu.column_name::text, ccu.table_name::text \
                 FROM information_schema.table_constraints tc \
                 JOIN information_schema.key_column_usage kcu \
                   ON tc.constraint_name = kcu.constraint_name \
                  AND tc.table_schema = kcu.table_schema \
                 JOIN information_schema.constraint_column_usage ccu \
                   ON tc.constraint_name = ccu.constraint_name \
                  AND tc.table_schema = ccu.table_schema \
                 WHERE tc.constraint_type = 'FOREIGN KEY' \
                   AND tc.table_schema::text = $1 \
                   AND kcu.table_name::text = ANY($2)",
                &[&self.schema, &tables],
            )
            .await?;

        Ok(rows
            .into_iter()
            .map(|row| {
                let table: String = row.get(0);
                let column: String = row.get(1);
                (format!("{}.{}", table, column), row.get(2))
            })
            .collect())
    }

    async fn primary_key(&self, table: &str) -> Result<Vec<String>> {
        let client = self.client("reading primary key").await?;
        primary_key(&client, &self.schema, table).await
    }

    async fn existing_rows(&self, table: &str, columns: &[String]) -> Result<Vec<ExistingRow>> {
        let client = self.client("reading existing rows").await?;
        let query = format!(
            "COPY (SELECT {} FROM {}) TO STDOUT WITH (FORMAT csv, HEADER true)",
            column_list(columns),
            qualify_table(&self.schema, table)
        );
        let stream = client.copy_out(&query).await?;
        futures::pin_mut!(stream);

        let mut data = Vec::new();
        while let Some(chunk) = stream.next().await {
            data.extend_from_slice(&chunk?);
        }

        let mut reader = csv::ReaderBuilder::new()
            .has_headers(true)
            .from_reader(data.as_slice());
        let headers = reader.headers()?.clone();
        let mut rows = Vec::new();
        for record in reader.records() {
            let record = record?;
            rows.push(
                headers
                    .iter()
                    .zip(record.iter())
                    .map(|(c, v)| (c.to_string(), v.to_string()))
                    .collect(),
            );
        }
        Ok(rows)
    }
}

async fn primary_key(client: &Object, schema: &str, table: &str) -> Result<Vec<String>> {
    let rows = client
        .query(
            "SELECT kcu.column_name::text \
             FROM information_schema.table_constraints tc \
             JOIN information_schema.key_column_usage kcu \
               ON tc.constraint_name = kcu.constraint_name \
              AND tc.table_schema = kcu.table_schema \
             WHERE tc.constraint_type = 'PRIMARY KEY' \
               AND tc.table_schema::text = $1 \
               AND tc.table_name::text = $2 \
             ORDER BY kcu.ordinal_position",
            &[&schema, &table],
        )
        .await?;
    Ok(rows.into_iter().map(|row| row.get(0)).collect())
}

/// Capture the destination rows the engine matches against.
///
/// Tables with discriminators contribute their discriminator columns (plus
/// `id` when they have one). Keyless tables without discriminators are
/// link tables and contribute every migrated column.
pub async fn capture_snapshot<M>(
    target: &(dyn TargetPool + '_),
    columns: &TargetColumns,
    mapping: &M,
) -> Result<Snapshot>
where
    M: MappingLookup + Sync + ?Sized,
{
    let mut snapshot = Snapshot::new();
    for (table, table_columns) in columns.iter() {
        let has_id = table_columns.iter().any(|c| c == ID_COLUMN);
        let discriminators = mapping.discriminators(table);

        let mut selected: Vec<String> = if !discriminators.is_empty() {
            discriminators.to_vec()
        } else if !has_id {
            table_columns.to_vec()
        } else {
            continue;
        };
        if has_id {
            selected.insert(0, ID_COLUMN.to_string());
        }

        let rows = target.existing_rows(table, &selected).await?;
        debug!("{}: {} existing rows", table, rows.len());
        snapshot.insert_rows(table, rows);
    }
    info!(
        "Captured {} existing rows from {} tables",
        snapshot.row_count(),
        snapshot.tables().count()
    );
    Ok(snapshot)
}

/// Outcome of the deferred updates.
#[derive(Debug, Clone, Default, Serialize)]
pub struct UpdateReport {
    /// Tables merged, with the number of staged rows.
    pub applied: Vec<(String, u64)>,
    /// Tables whose merge failed, with the reason.
    pub failed: Vec<(String, String)>,
}

impl UpdateReport {
    pub fn is_success(&self) -> bool {
        self.failed.is_empty()
    }

    /// Record the merge outcome of one table.
    pub fn record(&mut self, table: &str, result: Result<u64>) {
        match result {
            Ok(rows) => {
                info!("{}: merged {} updated rows", table, rows);
                self.applied.push((table.to_string(), rows));
            }
            Err(e) => {
                error!("{}: deferred update failed: {}", table, e);
                self.failed.push((table.to_string(), e.to_string()));
            }
        }
    }

    /// Refuse the commit when any table failed to merge.
    pub fn ensure_committable(&self) -> Result<()> {
        if self.is_success() {
            return Ok(());
        }
        let failed = self
            .failed
            .iter()
            .map(|(table, _)| table.as_str())
            .collect::<Vec<_>>()
            .join(", ");
        Err(MigrateError::CommitBlocked(format!(
            "deferred updates failed for {}",
            failed
        )))
    }
}

/// The run's write transaction on one destination connection.
pub struct TargetSession {
    client: Option<Object>,
    schema: String,
    open: bool,
}

impl TargetSession {
    fn client(&self) -> Result<&Object> {
        self.client
            .as_ref()
            .ok_or_else(|| MigrateError::pool("session already closed", "write session"))
    }

    /// Stream a record file into `table` with COPY; returns rows copied.
    async fn copy_file(&self, table: &str, path: &Path) -> Result<u64> {
        let header = read_header(path)?;
        let statement = format!(
            "COPY {} ({}) FROM STDIN WITH (FORMAT csv, HEADER true)",
            qualify_table(&self.schema, table),
            column_list(&header)
        );
        let sink = self.client()?.copy_in(&statement).await?;
        futures::pin_mut!(sink);

        let mut file = tokio::fs::File::open(path).await?;
        let mut buf = BytesMut::with_capacity(CHUNK_SIZE);
        loop {
            buf.reserve(CHUNK_SIZE);
            if file.read_buf(&mut buf).await? == 0 {
                break;
            }
            if buf.len() >= CHUNK_SIZE {
                sink.send(buf.split().freeze()).await?;
            }
        }
        if !buf.is_empty() {
            sink.send(buf.split().freeze()).await?;
        }
        Ok(sink.finish().await?)
    }

    async fn savepoint<T>(&self, name: &str, result: Result<T>) -> Result<T> {
        match result {
            Ok(value) => {
                self.client()?
                    .batch_execute(&format!("RELEASE SAVEPOINT {}", name))
                    .await?;
                Ok(value)
            }
            Err(e) => {
                self.client()?
                    .batch_execute(&format!("ROLLBACK TO SAVEPOINT {}", name))
                    .await?;
                Err(e)
            }
        }
    }

    /// Bulk load `<table>.target2.csv` files.
    ///
    /// Tables are loaded in the given order, each under a savepoint. Tables
    /// that fail are retried in further rounds, since a later table may
    /// provide the rows they reference. Loading stops when a round makes no
    /// progress; tables still pending are reported as residual.
    pub async fn load_files(&self, files: &[(String, PathBuf)]) -> Result<u64> {
        let mut pending = Vec::new();
        for (table, path) in files {
            if has_data_rows(path)? {
                pending.push((table.clone(), path.clone()));
            } else {
                debug!("{}: nothing to load", table);
            }
        }

        let mut total = 0;
        let mut round = 1;
        while !pending.is_empty() {
            let before = pending.len();
            let mut failed = Vec::new();
            for (table, path) in pending {
                self.client()?.batch_execute("SAVEPOINT load_table").await?;
                let result = self.copy_file(&table, &path).await;
                match self.savepoint("load_table", result).await {
                    Ok(rows) => {
                        info!("{}: loaded {} rows", table, rows);
                        total += rows;
                    }
                    Err(e) => {
                        warn!("{}: load failed in round {}: {}", table, round, e);
                        failed.push((table, path));
                    }
                }
            }
            if failed.len() == before {
                let tables = failed.into_iter().map(|(t, _)| t).collect::<Vec<_>>();
                error!("Tables left unmigrated: {}", tables.join(", "));
                return Err(MigrateError::ResidualRows(tables));
            }
            pending = failed;
            round += 1;
        }
        Ok(total)
    }

    /// Merge `<table>.update2.csv` files into their tables.
    ///
    /// Rows are staged in a temporary table, then every staged non-null value
    /// overwrites the destination column; null values leave it unchanged.
    /// A failing table is rolled back to its savepoint and reported.
    pub async fn apply_updates(&self, files: &[(String, PathBuf)]) -> Result<UpdateReport> {
        let mut report = UpdateReport::default();
        for (table, path) in files {
            if !has_data_rows(path)? {
                continue;
            }
            self.client()?.batch_execute("SAVEPOINT update_table").await?;
            let result = self.merge_updates(table, path).await;
            let result = self.savepoint("update_table", result).await;
            report.record(table, result);
        }
        Ok(report)
    }

    async fn merge_updates(&self, table: &str, path: &Path) -> Result<u64> {
        let pk = primary_key(self.client()?, &self.schema, table).await?;
        let header = read_header(path)?;
        let staging = staging_table(table);
        let update = merge_statement(&self.schema, table, &staging, &header, &pk)?;

        self.client()?
            .batch_execute(&format!(
                "DROP TABLE IF EXISTS {staging}; \
                 CREATE TEMP TABLE {staging} AS SELECT * FROM {} WITH NO DATA",
                qualify_table(&self.schema, table)
            ))
            .await?;

        let statement = format!(
            "COPY {} ({}) FROM STDIN WITH (FORMAT csv, HEADER true)",
            staging,
            column_list(&header)
        );
        let rows = self.copy_into(&statement, path).await?;

        if let Some(update) = update {
            debug!("{}", update);
            self.client()?.batch_execute(&update).await?;
        }

        self.client()?
            .batch_execute(&format!("DROP TABLE {staging}"))
            .await?;
        Ok(rows)
    }

    async fn copy_into(&self, statement: &str, path: &Path) -> Result<u64> {
        let sink = self.client()?.copy_in(statement).await?;
        futures::pin_mut!(sink);
        let data = tokio::fs::read(path).await?;
        for chunk in data.chunks(CHUNK_SIZE) {
            sink.send(bytes::Bytes::copy_from_slice(chunk)).await?;
        }
        Ok(sink.finish().await?)
    }

    /// Drop stored columns, e.g. computed fields the new schema recomputes.
    pub async fn drop_stored_columns(&self, stored: &BTreeMap<String, Vec<String>>) -> Result<()> {
        for (table, columns) in stored {
            for column in columns {
                info!("{}: dropping stored column {}", table, column);
                self.client()?
                    .batch_execute(&format!(
                        "ALTER TABLE {} DROP COLUMN IF EXISTS {} CASCADE",
                        qualify_table(&self.schema, table),
                        quote_ident(column)
                    ))
                    .await?;
            }
        }
        Ok(())
    }

    /// Move every `id` sequence past the new max id.
    pub async fn reset_sequences(&self, tables: &[String]) -> Result<()> {
        for table in tables {
            let qualified = qualify_table(&self.schema, table);
            let row = self
                .client()?
                .query_one(
                    "SELECT pg_get_serial_sequence($1, 'id')",
                    &[&qualified],
                )
                .await?;
            let Some(sequence) = row.get::<_, Option<String>>(0) else {
                continue;
            };
            self.client()?
                .execute(
                    &format!(
                        "SELECT setval($1::text::regclass, (SELECT COALESCE(MAX({}), 0) + 1 FROM {}), false)",
                        quote_ident(ID_COLUMN),
                        qualified
                    ),
                    &[&sequence],
                )
                .await?;
            debug!("{}: sequence {} reset", table, sequence);
        }
        Ok(())
    }

    pub async fn commit(mut self) -> Result<()> {
        self.client()?.batch_execute("COMMIT").await?;
        self.open = false;
        info!("Transaction committed");
        Ok(())
    }

    pub async fn rollback(mut self) -> Result<()> {
        self.client()?.batch_execute("ROLLBACK").await?;
        self.open = false;
        info!("Transaction rolled back");
        Ok(())
    }
}

impl Drop for TargetSession {
    /// An unfinished transaction must not go back to the pool: the
    /// connection is detached and closed, which makes the server roll back.
    fn drop(&mut self) {
        if !self.open {
            return;
        }
        if let Some(client) = self.client.take() {
            warn!("Write session dropped before commit, rolling back");
            drop(Object::take(client));
        }
    }
}
