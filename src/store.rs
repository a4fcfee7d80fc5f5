//! Task-log persistence used by the controller.
//!
//! The relational store itself lives outside this crate; the dispatch path
//! only needs "create a record", "update a record by id with a field map",
//! "read a record" and "close the pool". [`MemoryTaskLogStore`] backs the
//! binary and the tests.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::RwLock;

/// Column-name to value map for partial updates.
pub type FieldMap = BTreeMap<String, Value>;

pub const FIELD_STATUS: &str = "status";
pub const FIELD_RESULT: &str = "result";
pub const FIELD_END_TIME: &str = "end_time";

/// Note written on a run that was stopped while no controller-side handle existed.
pub const ORPHANED_STOP_NOTE: &str = "manually stopped after controller restart";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskLogStatus {
    Failure,
    Running,
    Finish,
    Cancel,
}

impl std::fmt::Display for TaskLogStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TaskLogStatus::Failure => write!(f, "failure"),
            TaskLogStatus::Running => write!(f, "running"),
            TaskLogStatus::Finish => write!(f, "finish"),
            TaskLogStatus::Cancel => write!(f, "cancel"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskLog {
    pub id: i64,
    pub task_id: i64,
    pub name: String,
    pub command: String,
    pub hosts: Vec<String>,
    pub status: TaskLogStatus,
    pub result: String,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
}

/// Fields supplied when a run starts; the store assigns the id.
#[derive(Debug, Clone)]
pub struct NewTaskLog {
    pub task_id: i64,
    pub name: String,
    pub command: String,
    pub hosts: Vec<String>,
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("task log {0} not found")]
    NotFound(i64),

    #[error("invalid value for field {field}: {reason}")]
    InvalidField { field: String, reason: String },

    #[error("store is closed")]
    Closed,
}

#[async_trait]
pub trait TaskLogStore: Send + Sync {
    async fn create(&self, log: NewTaskLog) -> Result<TaskLog, StoreError>;

    /// Update the record `id` with `fields`; returns the number of rows touched.
    async fn update(&self, id: i64, fields: FieldMap) -> Result<u64, StoreError>;

    /// Like [`update`](Self::update), but only touches the record while its
    /// status is still `expected`. Returns 0 when the record moved on.
    async fn update_if(
        &self,
        id: i64,
        expected: TaskLogStatus,
        fields: FieldMap,
    ) -> Result<u64, StoreError>;

    async fn get(&self, id: i64) -> Result<Option<TaskLog>, StoreError>;

    /// Release the connection pool. Every later call fails with [`StoreError::Closed`].
    async fn close(&self) -> Result<(), StoreError>;
}

/// Field map marking a run cancelled with an explanatory note.
pub fn cancelled_fields(note: &str) -> FieldMap {
    let mut fields = FieldMap::new();
    fields.insert(FIELD_STATUS.to_string(), serde_json::json!(TaskLogStatus::Cancel));
    fields.insert(FIELD_RESULT.to_string(), Value::String(note.to_string()));
    fields.insert(FIELD_END_TIME.to_string(), serde_json::json!(Utc::now()));
    fields
}

/// Field map for a finished run.
pub fn finished_fields(status: TaskLogStatus, result: &str) -> FieldMap {
    let mut fields = FieldMap::new();
    fields.insert(FIELD_STATUS.to_string(), serde_json::json!(status));
    fields.insert(FIELD_RESULT.to_string(), Value::String(result.to_string()));
    fields.insert(FIELD_END_TIME.to_string(), serde_json::json!(Utc::now()));
    fields
}

/// In-process task-log table.
#[derive(Debug)]
pub struct MemoryTaskLogStore {
    logs: RwLock<HashMap<i64, TaskLog>>,
    next_id: AtomicI64,
    closed: AtomicBool,
}

impl Default for MemoryTaskLogStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryTaskLogStore {
    pub fn new() -> Self {
        Self {
            logs: RwLock::new(HashMap::new()),
            next_id: AtomicI64::new(1),
            closed: AtomicBool::new(false),
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn ensure_open(&self) -> Result<(), StoreError> {
        if self.is_closed() {
            Err(StoreError::Closed)
        } else {
            Ok(())
        }
    }
}

fn apply_field(log: &mut TaskLog, field: &str, value: Value) -> Result<(), StoreError> {
    let invalid = |reason: String| StoreError::InvalidField {
        field: field.to_string(),
        reason,
    };
    match field {
        FIELD_STATUS => {
            log.status = serde_json::from_value(value).map_err(|e| invalid(e.to_string()))?;
        }
        FIELD_RESULT => {
            log.result = value
                .as_str()
                .ok_or_else(|| invalid("expected a string".to_string()))?
                .to_string();
        }
        FIELD_END_TIME => {
            log.end_time = serde_json::from_value(value).map_err(|e| invalid(e.to_string()))?;
        }
        other => return Err(invalid(format!("unknown column {other}"))),
    }
    Ok(())
}

fn apply_fields(log: &mut TaskLog, fields: FieldMap) -> Result<u64, StoreError> {
    // Validate against a copy so a bad field leaves the row untouched.
    let mut updated = log.clone();
    for (field, value) in fields {
        apply_field(&mut updated, &field, value)?;
    }
    *log = updated;
    Ok(1)
}

#[async_trait]
impl TaskLogStore for MemoryTaskLogStore {
    async fn create(&self, log: NewTaskLog) -> Result<TaskLog, StoreError> {
        self.ensure_open()?;
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let record = TaskLog {
            id,
            task_id: log.task_id,
            name: log.name,
            command: log.command,
            hosts: log.hosts,
            status: TaskLogStatus::Running,
            result: String::new(),
            start_time: Utc::now(),
            end_time: None,
        };
        self.logs.write().await.insert(id, record.clone());
        Ok(record)
    }

    async fn update(&self, id: i64, fields: FieldMap) -> Result<u64, StoreError> {
        self.ensure_open()?;
        let mut logs = self.logs.write().await;
        match logs.get_mut(&id) {
            Some(log) => apply_fields(log, fields),
            None => Ok(0),
        }
    }

    async fn update_if(
        &self,
        id: i64,
        expected: TaskLogStatus,
        fields: FieldMap,
    ) -> Result<u64, StoreError> {
        self.ensure_open()?;
        let mut logs = self.logs.write().await;
        match logs.get_mut(&id) {
            Some(log) if log.status == expected => apply_fields(log, fields),
            _ => Ok(0),
        }
    }

    async fn get(&self, id: i64) -> Result<Option<TaskLog>, StoreError> {
        self.ensure_open()?;
        Ok(self.logs.read().await.get(&id).cloned())
    }

    async fn close(&self) -> Result<(), StoreError> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Err(StoreError::Closed);
        }
        tracing::info!("Task log store closed");
        Ok(())
    }
}
