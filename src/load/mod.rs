//! Upserts normalized table files into the database.

use anyhow::{bail, Result};
use async_trait::async_trait;
use serde::Serialize;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

use crate::config::LoadConfig;
use crate::extract::progress_bar;
use crate::run::{RunReport, RunTracker};
use crate::schema::{Cell, TableSchema, CATALOG};
use crate::tabular::{read_table, table_parts, Row};

mod memory;
mod postgres;

pub use memory::MemoryStore;
pub use postgres::{create_table_sql, quote_ident, upsert_sql, PgStore};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Upserted {
    Inserted,
    Updated,
    /// An identical row already existed.
    Unchanged,
}

/// Destination of keyed table rows.
#[async_trait]
pub trait TableStore {
    /// Creates the table with its primary key if it does not exist.
    async fn ensure_table(&mut self, schema: &TableSchema) -> Result<()>;

    /// Inserts the row, or overwrites the non-key columns of the row with the same key.
    async fn upsert(&mut self, schema: &TableSchema, cells: &[Cell]) -> Result<Upserted>;
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct TableLoad {
    pub table: &'static str,
    pub files: usize,
    pub rows: usize,
    pub inserted: usize,
    pub updated: usize,
    pub unchanged: usize,
    pub failed: usize,
}

fn read_parts(files: &[PathBuf], tracker: &mut RunTracker) -> Vec<Row> {
    let mut rows = Vec::new();
    for file in files {
        match read_table(file) {
            Ok(table) => {
                if table.unreadable > 0 {
                    tracker.skipped(table.unreadable);
                }
                rows.extend(table.rows);
            }
            Err(e) => {
                warn!(file = %file.display(), "Skipping unreadable file: {:#}", e);
                tracker.skipped(1);
            }
        }
    }
    rows
}

/// Loads one table from its files, one upsert per row, in file order.
pub async fn load_table<S>(
    store: &mut S,
    schema: &'static TableSchema,
    files: &[PathBuf],
    tracker: &mut RunTracker,
) -> Result<TableLoad>
where
    S: TableStore + Send,
{
    let rows = read_parts(files, tracker);
    let mut report = TableLoad {
        table: schema.name,
        files: files.len(),
        rows: rows.len(),
        ..Default::default()
    };

    if let Err(e) = store.ensure_table(schema).await {
        warn!(table = schema.name, "Skipping table: {:#}", e);
        report.failed = rows.len();
        tracker.processed(rows.len());
        tracker.skipped(rows.len());
        return Ok(report);
    }

    let pb = progress_bar(rows.len() as u64);
    for (idx, row) in rows.iter().enumerate() {
        tracker.processed(1);
        let cells = schema.coerce(row);
        match store.upsert(schema, &cells).await {
            Ok(Upserted::Inserted) => report.inserted += 1,
            Ok(Upserted::Updated) => report.updated += 1,
            Ok(Upserted::Unchanged) => report.unchanged += 1,
            Err(e) => {
                warn!(table = schema.name, row = idx + 1, "Row failed: {:#}", e);
                report.failed += 1;
                tracker.skipped(1);
                pb.inc(1);
                continue;
            }
        }
        tracker.written(1);
        pb.inc(1);
    }
    pb.finish_and_clear();

    info!(
        table = schema.name,
        rows = report.rows,
        inserted = report.inserted,
        updated = report.updated,
        unchanged = report.unchanged,
        failed = report.failed,
        "Loaded table"
    );
    Ok(report)
}

/// Loads every catalog table that has files in `dir`, in catalog order.
pub async fn load_tables<S>(
    store: &mut S,
    dir: &Path,
    catalog: &[&'static TableSchema],
    tracker: &mut RunTracker,
) -> Result<Vec<TableLoad>>
where
    S: TableStore + Send,
{
    let mut loads = Vec::new();
    for schema in catalog.iter().copied() {
        let files = table_parts(dir, schema.name)?;
        if files.is_empty() {
            info!(table = schema.name, "No files, skipping");
            continue;
        }
        loads.push(load_table(store, schema, &files, tracker).await?);
    }
    Ok(loads)
}

pub fn run(config: LoadConfig) -> Result<RunReport> {
    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(run_async(config))
}

pub async fn run_async(config: LoadConfig) -> Result<RunReport> {
    let mut tracker = RunTracker::new("load");
    if !config.input_dir.is_dir() {
        bail!("Input directory not found: {}", config.input_dir.display());
    }

    let mut store = PgStore::connect(&config.db).await?;
    tracker.start();

    let loads = load_tables(&mut store, &config.input_dir, CATALOG, &mut tracker).await?;
    if loads.is_empty() {
        warn!("No table files found in {}", config.input_dir.display());
    }

    store.close().await?;
    Ok(tracker.finish())
}
