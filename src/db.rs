use std::collections::HashSet;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use sqlx::postgres::{PgConnection, PgPoolOptions};
use sqlx::types::Json;
use sqlx::{PgPool, Row};
use tracing::{debug, warn};

use crate::backup::entities::Entity;
use crate::backup::export::{
    ColumnKind, ColumnTypes, EntityRows, EntityStore, ReplayPlan, Row as ExportRow,
};
use crate::backup::{BackupError, Result};

// Database connection pool type
pub type DbPool = PgPool;

impl From<sqlx::Error> for BackupError {
    fn from(error: sqlx::Error) -> Self {
        BackupError::Database(error.to_string())
    }
}

/// Connect to the panel database
pub async fn init_pool(url: &str) -> std::result::Result<DbPool, sqlx::Error> {
    PgPoolOptions::new()
        .max_connections(5)
        .acquire_timeout(Duration::from_secs(10))
        .connect(url)
        .await
}

/// Quote an identifier for interpolation into SQL
fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

fn column_kind(data_type: &str, nullable: bool) -> ColumnKind {
    match data_type {
        "bigint" => ColumnKind::BigInt,
        "timestamp without time zone" | "timestamp with time zone" => {
            ColumnKind::Timestamp { nullable }
        }
        _ => ColumnKind::Other,
    }
}

/// Column layout of a table in the current schema; empty when the table
/// does not exist
async fn load_columns(conn: &mut PgConnection, table: &str) -> Result<ColumnTypes> {
    let rows = sqlx::query(
        r#"
        SELECT column_name::text AS column_name,
               data_type::text AS data_type,
               is_nullable::text AS is_nullable
        FROM information_schema.columns
        WHERE table_schema = current_schema() AND table_name = $1
        ORDER BY ordinal_position
        "#,
    )
    .bind(table)
    .fetch_all(&mut *conn)
    .await?;

    let mut columns = ColumnTypes::new();
    for row in rows {
        let name: String = row.try_get("column_name")?;
        let data_type: String = row.try_get("data_type")?;
        let is_nullable: String = row.try_get("is_nullable")?;
        columns = columns.with(&name, column_kind(&data_type, is_nullable == "YES"));
    }
    Ok(columns)
}

/// Tables in the current schema
async fn existing_tables(conn: &mut PgConnection) -> Result<HashSet<String>> {
    let names: Vec<String> = sqlx::query_scalar(
        r#"
        SELECT table_name::text
        FROM information_schema.tables
        WHERE table_schema = current_schema()
        "#,
    )
    .fetch_all(&mut *conn)
    .await?;
    Ok(names.into_iter().collect())
}

fn table_exists(entity: &Entity, tables: &HashSet<String>) -> bool {
    tables.contains(entity.table)
}

/// Entity store backed by the live Postgres database
pub struct PgEntityStore {
    pool: DbPool,
}

impl PgEntityStore {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl EntityStore for PgEntityStore {
    async fn snapshot(&self, entities: &[&'static Entity]) -> Result<Vec<EntityRows>> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("SET TRANSACTION ISOLATION LEVEL REPEATABLE READ, READ ONLY")
            .execute(&mut *tx)
            .await?;

        let mut snapshot = Vec::with_capacity(entities.len());
        for &entity in entities {
            let columns = load_columns(&mut tx, entity.table).await?;
            if columns.is_empty() {
                warn!("Table {} does not exist, exporting it empty", entity.table);
                snapshot.push(EntityRows { entity, columns, rows: Vec::new() });
                continue;
            }

            let order = if columns.contains("id") { " ORDER BY t.\"id\"" } else { "" };
            let values: Vec<Value> = sqlx::query_scalar(&format!(
                "SELECT row_to_json(t) FROM {} t{}",
                quote_ident(entity.table),
                order
            ))
            .fetch_all(&mut *tx)
            .await?;

            let rows = values
                .into_iter()
                .filter_map(|value| match value {
                    Value::Object(row) => Some(row),
                    _ => None,
                })
                .collect::<Vec<ExportRow>>();
            debug!("Exported {} rows from {}", rows.len(), entity.table);
            snapshot.push(EntityRows { entity, columns, rows });
        }

        tx.commit().await?;
        Ok(snapshot)
    }

    async fn column_types(&self, entity: &'static Entity) -> Result<ColumnTypes> {
        let mut conn = self.pool.acquire().await?;
        load_columns(&mut conn, entity.table).await
    }

    async fn replace_all(&self, plan: &ReplayPlan) -> Result<()> {
        // Dropping the transaction without commit rolls everything back
        let mut tx = self.pool.begin().await?;
        let tables = existing_tables(&mut tx).await?;

        for &entity in &plan.deletes {
            if !table_exists(entity, &tables) {
                warn!("Table {} does not exist, nothing to delete", entity.table);
                continue;
            }
            sqlx::query(&format!("DELETE FROM {}", quote_ident(entity.table)))
                .execute(&mut *tx)
                .await?;
        }

        for (entity, rows) in &plan.inserts {
            if rows.is_empty() {
                continue;
            }
            if !table_exists(entity, &tables) {
                warn!(
                    "Table {} does not exist, skipping {} exported rows",
                    entity.table,
                    rows.len()
                );
                continue;
            }
            let live = load_columns(&mut tx, entity.table).await?;
            let mut names: Vec<&str> = Vec::new();
            for row in rows {
                for key in row.keys() {
                    if !names.contains(&key.as_str()) {
                        if live.contains(key) {
                            names.push(key.as_str());
                        } else {
                            warn!(
                                "Dropping column {}.{} missing from the live table",
                                entity.table, key
                            );
                        }
                    }
                }
            }
            if names.is_empty() {
                continue;
            }

            let column_list = names
                .iter()
                .map(|n| quote_ident(n))
                .collect::<Vec<_>>()
                .join(", ");
            let table = quote_ident(entity.table);
            sqlx::query(&format!(
                "INSERT INTO {table} ({column_list}) \
                 SELECT {column_list} FROM json_populate_recordset(NULL::{table}, $1::json)"
            ))
            .bind(Json(rows))
            .execute(&mut *tx)
            .await?;
            debug!("Inserted {} rows into {}", rows.len(), entity.table);
        }

        for &entity in &plan.sequences {
            if !table_exists(entity, &tables) {
                continue;
            }
            if !load_columns(&mut tx, entity.table).await?.contains("id") {
                continue;
            }
            let table = quote_ident(entity.table);
            let sequence: Option<String> =
                sqlx::query_scalar("SELECT pg_get_serial_sequence($1, 'id')")
                    .bind(&table)
                    .fetch_one(&mut *tx)
                    .await?;
            let Some(sequence) = sequence else {
                continue;
            };
            sqlx::query(&format!(
                "SELECT setval($1::text::regclass, COALESCE(MAX(\"id\"), 1), \
                 MAX(\"id\") IS NOT NULL) FROM {table}"
            ))
            .bind(&sequence)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }
}
