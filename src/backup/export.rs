//! Structured JSON export of every persisted entity
//!
//! The document is tagged with [`EXPORT_FORMAT`] and keeps original primary
//! keys. 64-bit integer columns are written as decimal strings so readers
//! without native 64-bit integers do not lose precision.

use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use chrono::{DateTime, NaiveDateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::backup::entities::{self, Entity};
use crate::backup::{BackupError, Result};

/// Format tag of the structured export
pub const EXPORT_FORMAT: &str = "prisma-json-v1";

/// One row, keyed by column name
pub type Row = Map<String, Value>;

/// Column categories that need conversion on the way in or out
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnKind {
    BigInt,
    Timestamp { nullable: bool },
    Other,
}

/// Column layout of one live table
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ColumnTypes {
    columns: HashMap<String, ColumnKind>,
}

impl ColumnTypes {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, column: &str, kind: ColumnKind) -> Self {
        self.insert(column, kind);
        self
    }

    pub fn insert(&mut self, column: &str, kind: ColumnKind) {
        self.columns.insert(column.to_string(), kind);
    }

    pub fn get(&self, column: &str) -> Option<ColumnKind> {
        self.columns.get(column).copied()
    }

    pub fn contains(&self, column: &str) -> bool {
        self.columns.contains_key(column)
    }

    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, ColumnKind)> {
        self.columns.iter().map(|(name, kind)| (name.as_str(), *kind))
    }
}

/// Rows of one entity as read from the live database
#[derive(Debug, Clone)]
pub struct EntityRows {
    pub entity: &'static Entity,
    pub columns: ColumnTypes,
    pub rows: Vec<Row>,
}

/// Everything a structured restore does, in order, inside one transaction
#[derive(Debug, Clone)]
pub struct ReplayPlan {
    /// Entities to empty, children before parents
    pub deletes: Vec<&'static Entity>,
    /// Rows to insert, parents before children
    pub inserts: Vec<(&'static Entity, Vec<Row>)>,
    /// Entities whose id sequence is reset to the restored maximum
    pub sequences: Vec<&'static Entity>,
}

impl ReplayPlan {
    /// Plan the replay of an export against the live column layout
    ///
    /// Every row is decoded up front so a bad value fails before the
    /// transaction starts.
    pub async fn for_export(export: &StructuredExport, store: &dyn EntityStore) -> Result<Self> {
        let now = Utc::now();
        let mut inserts = Vec::with_capacity(entities::ENTITIES.len());

        for &entity in entities::insert_order() {
            let columns = store.column_types(entity).await?;
            let rows = export
                .rows(entity.key)
                .iter()
                .cloned()
                .map(|row| decode_row(row, &columns, now))
                .collect::<Result<Vec<_>>>()?;
            inserts.push((entity, rows));
        }

        Ok(Self {
            deletes: entities::delete_order(),
            inserts,
            sequences: entities::insert_order()
                .iter()
                .copied()
                .filter(|entity| entity.serial_id)
                .collect(),
        })
    }
}

/// Typed data-access boundary used by the structured export and restore
#[async_trait]
pub trait EntityStore: Send + Sync {
    /// Read all rows of the given entities from one consistent snapshot
    async fn snapshot(&self, entities: &[&'static Entity]) -> Result<Vec<EntityRows>>;

    /// Column layout of the live table behind an entity
    async fn column_types(&self, entity: &'static Entity) -> Result<ColumnTypes>;

    /// Apply a replay plan atomically: either every step lands or none does
    async fn replace_all(&self, plan: &ReplayPlan) -> Result<()>;
}

/// The tagged export document
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct StructuredExport {
    pub format: String,
    #[serde(default)]
    pub generated_at: String,
    pub data: BTreeMap<String, Vec<Row>>,
}

impl StructuredExport {
    /// Build an export from snapshot rows, encoding 64-bit columns
    pub fn from_snapshot(snapshot: Vec<EntityRows>, generated_at: DateTime<Utc>) -> Self {
        let data = snapshot
            .into_iter()
            .map(|entity_rows| {
                let columns = entity_rows.columns;
                let rows = entity_rows
                    .rows
                    .into_iter()
                    .map(|row| encode_row(row, &columns))
                    .collect();
                (entity_rows.entity.key.to_string(), rows)
            })
            .collect();

        Self {
            format: EXPORT_FORMAT.to_string(),
            generated_at: generated_at.to_rfc3339_opts(SecondsFormat::Millis, true),
            data,
        }
    }

    /// Parse an export document, checking the format tag before anything else
    pub fn from_slice(bytes: &[u8]) -> Result<Self> {
        let value: Value = serde_json::from_slice(bytes)?;
        match value.get("format").and_then(Value::as_str) {
            Some(EXPORT_FORMAT) => Ok(serde_json::from_value(value)?),
            Some(other) => Err(BackupError::UnsupportedFormat(other.to_string())),
            None => Err(BackupError::UnsupportedFormat(String::from("<missing format tag>"))),
        }
    }

    /// Rows stored under an entity key
    pub fn rows(&self, key: &str) -> &[Row] {
        self.data.get(key).map(Vec::as_slice).unwrap_or_default()
    }

    /// Keys present in the document that no registered entity claims
    pub fn unknown_keys(&self) -> Vec<&str> {
        self.data
            .keys()
            .map(String::as_str)
            .filter(|key| entities::find(key).is_none())
            .collect()
    }
}

/// Convert 64-bit integer columns to decimal strings
pub fn encode_row(mut row: Row, columns: &ColumnTypes) -> Row {
    for (name, value) in row.iter_mut() {
        if columns.get(name) == Some(ColumnKind::BigInt) {
            if let Value::Number(number) = value {
                *value = Value::String(number.to_string());
            }
        }
    }
    row
}

/// Convert an exported row back into values the live table accepts
///
/// Decimal strings in 64-bit columns become integers again. Timestamps are
/// normalised to RFC 3339; a missing, null or unparseable value in a NOT
/// NULL timestamp column becomes `now`.
pub fn decode_row(mut row: Row, columns: &ColumnTypes, now: DateTime<Utc>) -> Result<Row> {
    for (name, kind) in columns.iter() {
        match kind {
            ColumnKind::BigInt => {
                let parsed = match row.get(name) {
                    Some(Value::String(text)) => Some(text.trim().parse::<i64>().map_err(|_| {
                        BackupError::InvalidArchive(format!(
                            "column {} holds '{}', expected a 64-bit integer",
                            name, text
                        ))
                    })?),
                    _ => None,
                };
                if let Some(parsed) = parsed {
                    row.insert(name.to_string(), Value::from(parsed));
                }
            }
            ColumnKind::Timestamp { nullable } => {
                let decoded = match row.get(name) {
                    Some(Value::String(text)) => parse_timestamp(text),
                    _ => None,
                };
                match decoded {
                    Some(timestamp) => {
                        row.insert(name.to_string(), Value::String(format_timestamp(timestamp)));
                    }
                    None if nullable && matches!(row.get(name), None | Some(Value::Null)) => {}
                    None if nullable => {
                        row.insert(name.to_string(), Value::Null);
                    }
                    None => {
                        row.insert(name.to_string(), Value::String(format_timestamp(now)));
                    }
                }
            }
            ColumnKind::Other => {}
        }
    }
    Ok(row)
}

fn parse_timestamp(text: &str) -> Option<DateTime<Utc>> {
    if let Ok(timestamp) = DateTime::parse_from_rfc3339(text) {
        return Some(timestamp.with_timezone(&Utc));
    }
    ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"]
        .iter()
        .find_map(|format| NaiveDateTime::parse_from_str(text, format).ok())
        .map(|naive| naive.and_utc())
}

fn format_timestamp(timestamp: DateTime<Utc>) -> String {
    timestamp.to_rfc3339_opts(SecondsFormat::Millis, true)
}
