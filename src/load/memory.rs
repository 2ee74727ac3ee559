use anyhow::{bail, Result};
use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};

use super::{TableStore, Upserted};
use crate::schema::{Cell, TableSchema};

/// Key cells rendered for ordering; `Cell` holds floats and has no total order.
type KeyText = Vec<String>;

#[derive(Debug, Default)]
struct MemoryTable {
    rows: BTreeMap<KeyText, Vec<Cell>>,
}

/// Keyed tables held in memory, with the same upsert rules as `PgStore`.
#[derive(Debug, Default)]
pub struct MemoryStore {
    tables: HashMap<String, MemoryTable>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn has_table(&self, name: &str) -> bool {
        self.tables.contains_key(name)
    }

    pub fn len(&self, name: &str) -> usize {
        self.tables.get(name).map(|t| t.rows.len()).unwrap_or(0)
    }

    /// Rows of `name` in primary-key order.
    pub fn rows(&self, name: &str) -> Vec<&[Cell]> {
        self.tables
            .get(name)
            .map(|t| t.rows.values().map(Vec::as_slice).collect())
            .unwrap_or_default()
    }

    /// The row of `name` whose key cells, in primary-key order, render as `key`.
    pub fn get(&self, name: &str, key: &[&str]) -> Option<&[Cell]> {
        let key: KeyText = key.iter().map(|k| k.to_string()).collect();
        self.tables
            .get(name)
            .and_then(|t| t.rows.get(&key))
            .map(Vec::as_slice)
    }
}

fn key_text(cell: &Cell) -> String {
    match cell {
        Cell::Null => String::new(),
        Cell::Text(s) => s.clone(),
        Cell::Integer(i) => i.to_string(),
        Cell::Float(f) => f.to_string(),
        Cell::Boolean(b) => b.to_string(),
        Cell::Date(d) => d.to_string(),
        Cell::Timestamp(t) => t.to_string(),
        Cell::TimestampTz(t) => t.to_rfc3339(),
    }
}

#[async_trait]
impl TableStore for MemoryStore {
    async fn ensure_table(&mut self, schema: &TableSchema) -> Result<()> {
        self.tables.entry(schema.name.to_string()).or_default();
        Ok(())
    }

    async fn upsert(&mut self, schema: &TableSchema, cells: &[Cell]) -> Result<Upserted> {
        let table = match self.tables.get_mut(schema.name) {
            Some(t) => t,
            None => bail!("relation \"{}\" does not exist", schema.name),
        };
        if cells.len() != schema.columns.len() {
            bail!(
                "{} expects {} values, got {}",
                schema.name,
                schema.columns.len(),
                cells.len()
            );
        }

        let mut key = Vec::with_capacity(schema.primary_key.len());
        for name in schema.primary_key {
            let cell = match schema.columns.iter().position(|c| c.name == *name) {
                Some(idx) => &cells[idx],
                None => bail!("{} has no column {}", schema.name, name),
            };
            if cell.is_null() {
                bail!(
                    "null value in column \"{}\" violates not-null constraint",
                    name
                );
            }
            key.push(key_text(cell));
        }

        Ok(match table.rows.get_mut(&key) {
            None => {
                table.rows.insert(key, cells.to_vec());
                Upserted::Inserted
            }
            Some(existing) if existing.as_slice() == cells => Upserted::Unchanged,
            Some(existing) => {
                *existing = cells.to_vec();
                Upserted::Updated
            }
        })
    }
}
