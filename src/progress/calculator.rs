//! Progress calculation: a pure function of a task's stored field state.
//!
//! The percentage counts COMPLETE responses against the number of fields the
//! task type's form defines. The fingerprint hashes the same inputs so the
//! updater can tell whether anything it depends on has moved.

use std::collections::HashMap;

use serde::Serialize;
use sha2::{Digest, Sha256};
use tracing::{debug, info};

use super::db::{DbHandle, ProgressDb};
use super::models::{FieldDefinition, FieldStatus, FormResponse, Task, TaskType};
use crate::errors::ProgressError;

/// `round(100 * completed / total)` with halves rounded up, 0 when `total` is 0.
pub fn completion_percentage(completed: usize, total: usize) -> u8 {
    if total == 0 {
        return 0;
    }
    let completed = completed.min(total) as u64;
    let total = total as u64;
    ((200 * completed + total) / (2 * total)) as u8
}

#[derive(Debug, Clone, Copy, Default)]
pub struct CalculateOptions {
    /// Log the per-field breakdown.
    pub debug: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressSnapshot {
    pub task_id: i64,
    pub task_type: TaskType,
    pub total_fields: usize,
    pub completed_fields: usize,
    pub percentage: u8,
    pub fingerprint: String,
}

/// Compute a snapshot from a form definition and the task's responses.
///
/// Responses for keys outside the definition are ignored. The fingerprint
/// covers the task type and, for every defined field in key order, the
/// response status and value (or a missing marker).
pub fn snapshot(
    task_id: i64,
    task_type: TaskType,
    definitions: &[FieldDefinition],
    responses: &[FormResponse],
    options: CalculateOptions,
) -> ProgressSnapshot {
    let by_key: HashMap<&str, &FormResponse> = responses
        .iter()
        .map(|r| (r.field_key.as_str(), r))
        .collect();

    let mut keys: Vec<&str> = definitions.iter().map(|d| d.field_key.as_str()).collect();
    keys.sort_unstable();
    keys.dedup();

    let mut hasher = Sha256::new();
    hasher.update(task_type.as_str().as_bytes());

    let mut completed = 0usize;
    for key in &keys {
        hasher.update(b"\n");
        hasher.update(key.as_bytes());
        match by_key.get(key) {
            Some(response) => {
                hasher.update(b"\x1f");
                hasher.update(response.status.as_str().as_bytes());
                hasher.update(b"\x1f");
                hasher.update(response.value.as_bytes());
                if response.status == FieldStatus::Complete {
                    completed += 1;
                }
                if options.debug {
                    debug!(
                        task_id,
                        field_key = %key,
                        status = response.status.as_str(),
                        "field response"
                    );
                }
            }
            None => {
                hasher.update(b"\x1f-");
                if options.debug {
                    debug!(task_id, field_key = %key, "field has no response");
                }
            }
        }
    }

    let total = keys.len();
    let percentage = completion_percentage(completed, total);
    if options.debug {
        info!(
            task_id,
            task_type = %task_type,
            completed,
            total,
            percentage,
            "calculated task progress"
        );
    }

    ProgressSnapshot {
        task_id,
        task_type,
        total_fields: total,
        completed_fields: completed,
        percentage,
        fingerprint: format!("{:x}", hasher.finalize()),
    }
}

/// Load a task and compute its snapshot against the current database state.
///
/// When `expected` is given the task must be of that type.
pub fn load_snapshot(
    db: &ProgressDb,
    task_id: i64,
    expected: Option<TaskType>,
    options: CalculateOptions,
) -> Result<(Task, ProgressSnapshot), ProgressError> {
    let task = db
        .get_task(task_id)
        .map_err(ProgressError::Database)?
        .ok_or(ProgressError::TaskNotFound { id: task_id })?;
    if let Some(expected) = expected {
        if expected != task.task_type {
            return Err(ProgressError::WrongTaskType {
                id: task_id,
                expected: expected.to_string(),
                actual: task.task_type.to_string(),
            });
        }
    }
    let definitions = db
        .list_field_definitions(task.task_type)
        .map_err(ProgressError::Database)?;
    let responses = db
        .list_form_responses(task_id)
        .map_err(ProgressError::Database)?;
    let snap = snapshot(task_id, task.task_type, &definitions, &responses, options);
    Ok((task, snap))
}

/// Async front end over [`load_snapshot`].
#[derive(Clone)]
pub struct ProgressCalculator {
    db: DbHandle,
}

impl ProgressCalculator {
    pub fn new(db: DbHandle) -> Self {
        Self { db }
    }

    pub async fn calculate(
        &self,
        task_id: i64,
        task_type: Option<TaskType>,
        options: CalculateOptions,
    ) -> Result<ProgressSnapshot, ProgressError> {
        self.db
            .call(move |db| Ok(load_snapshot(db, task_id, task_type, options)))
            .await
            .map_err(ProgressError::Database)?
            .map(|(_, snap)| snap)
    }
}
