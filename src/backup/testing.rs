//! Test doubles shared by the backup test modules

use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;

use async_trait::async_trait;
use serde_json::Value;

use crate::backup::entities::Entity;
use crate::backup::export::{ColumnTypes, EntityRows, EntityStore, ReplayPlan, Row};
use crate::backup::{BackupError, Result};

#[derive(Debug, Clone, Default)]
struct MemoryState {
    tables: BTreeMap<&'static str, Vec<Row>>,
    /// Postgres-style sequence state: (value, is_called)
    sequences: HashMap<&'static str, (i64, bool)>,
}

/// In-memory entity store with transactional `replace_all`
#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<MemoryState>,
    columns: HashMap<&'static str, ColumnTypes>,
    fail_snapshot: bool,
    fail_insert_into: Option<&'static str>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_rows(self, key: &'static str, rows: Vec<Value>) -> Self {
        let rows = rows
            .into_iter()
            .map(|value| value.as_object().cloned().unwrap_or_default())
            .collect();
        self.state.lock().unwrap().tables.insert(key, rows);
        self
    }

    pub fn with_columns(mut self, key: &'static str, columns: ColumnTypes) -> Self {
        self.columns.insert(key, columns);
        self
    }

    pub fn failing_snapshot(mut self) -> Self {
        self.fail_snapshot = true;
        self
    }

    pub fn failing_insert_into(mut self, key: &'static str) -> Self {
        self.fail_insert_into = Some(key);
        self
    }

    pub fn rows(&self, key: &str) -> Vec<Row> {
        self.state.lock().unwrap().tables.get(key).cloned().unwrap_or_default()
    }

    /// Insert a row the way the application would, taking the next id
    /// from the entity's sequence
    pub fn insert_next(&self, key: &'static str) -> i64 {
        let mut state = self.state.lock().unwrap();
        let (value, is_called) = state.sequences.get(key).copied().unwrap_or((1, false));
        let id = if is_called { value + 1 } else { value };
        state.sequences.insert(key, (id, true));

        let mut row = Row::new();
        row.insert("id".to_string(), Value::from(id));
        state.tables.entry(key).or_default().push(row);
        id
    }
}

#[async_trait]
impl EntityStore for MemoryStore {
    async fn snapshot(&self, entities: &[&'static Entity]) -> Result<Vec<EntityRows>> {
        if self.fail_snapshot {
            return Err(BackupError::Database(String::from("connection refused")));
        }
        let state = self.state.lock().unwrap();
        Ok(entities
            .iter()
            .map(|&entity| EntityRows {
                entity,
                columns: self.columns.get(entity.key).cloned().unwrap_or_default(),
                rows: state.tables.get(entity.key).cloned().unwrap_or_default(),
            })
            .collect())
    }

    async fn column_types(&self, entity: &'static Entity) -> Result<ColumnTypes> {
        Ok(self.columns.get(entity.key).cloned().unwrap_or_default())
    }

    async fn replace_all(&self, plan: &ReplayPlan) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        // Work on a copy so a failure leaves the committed state untouched
        let mut staged = state.clone();

        for entity in &plan.deletes {
            staged.tables.remove(entity.key);
        }
        for (entity, rows) in &plan.inserts {
            if self.fail_insert_into == Some(entity.key) {
                return Err(BackupError::Database(format!(
                    "insert into {} violates a constraint",
                    entity.table
                )));
            }
            staged.tables.entry(entity.key).or_default().extend(rows.iter().cloned());
        }
        for entity in &plan.sequences {
            let max_id = staged
                .tables
                .get(entity.key)
                .into_iter()
                .flatten()
                .filter_map(|row| row.get("id").and_then(Value::as_i64))
                .max();
            staged
                .sequences
                .insert(entity.key, (max_id.unwrap_or(1), max_id.is_some()));
        }

        *state = staged;
        Ok(())
    }
}
