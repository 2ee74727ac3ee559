use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use sqlx::postgres::{PgArguments, PgConnectOptions, PgConnection};
use sqlx::query::Query;
use sqlx::{Connection, Postgres, Row as _};
use tracing::{debug, info};

use super::{TableStore, Upserted};
use crate::config::DbConfig;
use crate::schema::{Cell, ColumnType, TableSchema};

pub fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

fn column_list(names: impl Iterator<Item = String>) -> String {
    names.collect::<Vec<_>>().join(", ")
}

pub fn create_table_sql(schema: &TableSchema) -> String {
    let columns = column_list(
        schema
            .columns
            .iter()
            .map(|c| format!("{} {}", quote_ident(c.name), c.sql_type)),
    );
    let key = column_list(schema.primary_key.iter().map(|k| quote_ident(k)));
    format!(
        "CREATE TABLE IF NOT EXISTS {} ({}, PRIMARY KEY ({}))",
        quote_ident(schema.name),
        columns,
        key
    )
}

/// Single-row upsert. Returns one row `(inserted bool)` when the row was
/// inserted or changed, and no row when an identical row already existed.
pub fn upsert_sql(schema: &TableSchema) -> String {
    let table = quote_ident(schema.name);
    let columns = column_list(schema.columns.iter().map(|c| quote_ident(c.name)));
    let placeholders = column_list((1..=schema.columns.len()).map(|i| format!("${}", i)));
    let key = column_list(schema.primary_key.iter().map(|k| quote_ident(k)));

    let payload: Vec<String> = schema.non_key_columns().map(|c| quote_ident(c.name)).collect();
    let action = if payload.is_empty() {
        "DO NOTHING".to_string()
    } else {
        let set = column_list(payload.iter().map(|c| format!("{c} = EXCLUDED.{c}")));
        let current = column_list(payload.iter().map(|c| format!("{table}.{c}")));
        let incoming = column_list(payload.iter().map(|c| format!("EXCLUDED.{c}")));
        format!(
            "DO UPDATE SET {} WHERE ({}) IS DISTINCT FROM ({})",
            set, current, incoming
        )
    };

    format!(
        "INSERT INTO {} ({}) VALUES ({}) ON CONFLICT ({}) {} RETURNING (xmax = 0) AS inserted",
        table, columns, placeholders, key, action
    )
}

type PgQuery<'q> = Query<'q, Postgres, PgArguments>;

fn bind_cell<'q>(query: PgQuery<'q>, sql_type: ColumnType, cell: &Cell) -> PgQuery<'q> {
    match cell {
        Cell::Text(s) => query.bind(s.clone()),
        Cell::Integer(i) => query.bind(*i),
        Cell::Float(f) => query.bind(*f),
        Cell::Boolean(b) => query.bind(*b),
        Cell::Date(d) => query.bind(*d),
        Cell::Timestamp(t) => query.bind(*t),
        Cell::TimestampTz(t) => query.bind(*t),
        // NULL still needs the column's type.
        Cell::Null => match sql_type {
            ColumnType::Text | ColumnType::Varchar(_) => query.bind(None::<String>),
            ColumnType::Integer => query.bind(None::<i32>),
            ColumnType::Float => query.bind(None::<f64>),
            ColumnType::Boolean => query.bind(None::<bool>),
            ColumnType::Date => query.bind(None::<NaiveDate>),
            ColumnType::Timestamp => query.bind(None::<NaiveDateTime>),
            ColumnType::TimestampTz => query.bind(None::<DateTime<Utc>>),
        },
    }
}

/// One PostgreSQL connection with `search_path` set to the target schema.
pub struct PgStore {
    conn: PgConnection,
}

impl PgStore {
    pub async fn connect(config: &DbConfig) -> Result<Self> {
        let options = PgConnectOptions::new()
            .host(&config.host)
            .port(config.port)
            .username(&config.user)
            .password(&config.password)
            .database(&config.database);

        info!(
            host = %config.host,
            port = config.port,
            database = %config.database,
            schema = %config.schema,
            "Connecting to PostgreSQL"
        );
        let mut conn = PgConnection::connect_with(&options)
            .await
            .with_context(|| format!("Failed to connect to {}:{}", config.host, config.port))?;

        sqlx::query(&format!("SET search_path TO {}", quote_ident(&config.schema)))
            .execute(&mut conn)
            .await
            .with_context(|| format!("Failed to select schema {}", config.schema))?;

        Ok(Self { conn })
    }

    pub async fn close(self) -> Result<()> {
        self.conn.close().await?;
        Ok(())
    }
}

#[async_trait]
impl TableStore for PgStore {
    async fn ensure_table(&mut self, schema: &TableSchema) -> Result<()> {
        let sql = create_table_sql(schema);
        debug!(%sql, "Ensuring table");
        sqlx::query(&sql)
            .execute(&mut self.conn)
            .await
            .with_context(|| format!("Failed to create table {}", schema.name))?;
        Ok(())
    }

    async fn upsert(&mut self, schema: &TableSchema, cells: &[Cell]) -> Result<Upserted> {
        let sql = upsert_sql(schema);
        let mut query = sqlx::query(&sql);
        for (column, cell) in schema.columns.iter().zip(cells) {
            query = bind_cell(query, column.sql_type, cell);
        }

        let row = query.fetch_optional(&mut self.conn).await?;
        Ok(match row {
            None => Upserted::Unchanged,
            Some(row) if row.try_get::<bool, _>("inserted")? => Upserted::Inserted,
            Some(_) => Upserted::Updated,
        })
    }
}
