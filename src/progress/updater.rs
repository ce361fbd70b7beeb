use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use super::calculator::{CalculateOptions, ProgressSnapshot, load_snapshot};
use super::db::{DbHandle, ProgressDb};
use super::models::{Task, TaskStatus, TaskType};
use super::ws::{EventBroadcaster, WsMessage};
use crate::errors::ProgressError;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct UpdateOptions {
    pub debug: bool,
    /// Persist and broadcast even when nothing changed.
    pub force_update: bool,
    pub skip_broadcast: bool,
    /// Never lower stored progress or move status backwards.
    pub preserve_existing: bool,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum UpdateOutcome {
    /// Stored state already matched the field state.
    Unchanged { task: Task },
    Updated {
        task: Task,
        previous_progress: u8,
        previous_status: TaskStatus,
    },
    /// Submitted or later; progress is frozen.
    Locked { task: Task },
}

impl UpdateOutcome {
    pub fn task(&self) -> &Task {
        match self {
            Self::Unchanged { task } | Self::Updated { task, .. } | Self::Locked { task } => task,
        }
    }

    pub fn is_updated(&self) -> bool {
        matches!(self, Self::Updated { .. })
    }
}

/// Decide and persist a task's progress inside a single database critical
/// section. Returns the outcome and the snapshot it was based on.
pub fn apply_update(
    db: &ProgressDb,
    task_id: i64,
    task_type: Option<TaskType>,
    options: UpdateOptions,
) -> Result<(UpdateOutcome, ProgressSnapshot), ProgressError> {
    let (task, snap) = load_snapshot(
        db,
        task_id,
        task_type,
        CalculateOptions {
            debug: options.debug,
        },
    )?;

    if task.status.is_locked() {
        debug!(task_id, status = %task.status, "task locked, progress not rewritten");
        return Ok((UpdateOutcome::Locked { task }, snap));
    }

    let mut progress = snap.percentage;
    let mut status = TaskStatus::for_progress(progress, task.status);
    if options.preserve_existing {
        progress = progress.max(task.progress);
        status = TaskStatus::for_progress(progress, task.status);
        if status.rank() < task.status.rank() {
            status = task.status;
        }
    }

    let values_match = task.progress == progress && task.status == status;
    let fingerprint_matches = task.progress_fingerprint.as_deref() == Some(snap.fingerprint.as_str());

    if !options.force_update && values_match {
        if fingerprint_matches {
            return Ok((UpdateOutcome::Unchanged { task }, snap));
        }
        // Field state moved without moving the result; refresh the key only.
        let task = db
            .write_task_progress(task_id, progress, status, Some(&snap.fingerprint))
            .map_err(ProgressError::Database)?;
        return Ok((UpdateOutcome::Unchanged { task }, snap));
    }

    let previous_progress = task.progress;
    let previous_status = task.status;
    let task = db
        .write_task_progress(task_id, progress, status, Some(&snap.fingerprint))
        .map_err(ProgressError::Database)?;

    if options.debug {
        info!(
            task_id,
            previous_progress,
            progress,
            status = %status,
            forced = options.force_update,
            "persisted task progress"
        );
    }

    Ok((
        UpdateOutcome::Updated {
            task,
            previous_progress,
            previous_status,
        },
        snap,
    ))
}

/// Persists calculated progress and announces changes.
#[derive(Clone)]
pub struct ProgressUpdater {
    db: DbHandle,
    broadcaster: EventBroadcaster,
}

impl ProgressUpdater {
    pub fn new(db: DbHandle, broadcaster: EventBroadcaster) -> Self {
        Self { db, broadcaster }
    }

    pub async fn update(
        &self,
        task_id: i64,
        task_type: Option<TaskType>,
        options: UpdateOptions,
    ) -> Result<UpdateOutcome, ProgressError> {
        let (outcome, _) = self
            .db
            .call(move |db| Ok(apply_update(db, task_id, task_type, options)))
            .await
            .map_err(ProgressError::Database)??;

        if outcome.is_updated() && !options.skip_broadcast {
            self.broadcaster
                .publish(&WsMessage::task_updated(outcome.task()));
        }
        Ok(outcome)
    }
}
