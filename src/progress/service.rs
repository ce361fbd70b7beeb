//! Task operations shared by the HTTP API, the WebSocket greeting and the CLI.
//!
//! Every mutation that clients care about goes out through the broadcaster
//! after the database write has committed.

use std::collections::BTreeMap;
use std::sync::Arc;

use tracing::{info, warn};

use super::calculator::{CalculateOptions, ProgressCalculator, ProgressSnapshot};
use super::db::{DbHandle, SubmitResult};
use super::models::*;
use super::updater::{ProgressUpdater, UpdateOptions, UpdateOutcome};
use super::ws::{EventBroadcaster, WsMessage};
use crate::config::TabsSection;
use crate::errors::ProgressError;

pub const FILE_VAULT_TAB: &str = "file-vault";

#[derive(Clone)]
pub struct TaskService {
    db: DbHandle,
    broadcaster: EventBroadcaster,
    tabs: Arc<TabsSection>,
    calculator: ProgressCalculator,
    updater: ProgressUpdater,
}

impl TaskService {
    pub fn new(db: DbHandle, broadcaster: EventBroadcaster, tabs: TabsSection) -> Self {
        Self {
            calculator: ProgressCalculator::new(db.clone()),
            updater: ProgressUpdater::new(db.clone(), broadcaster.clone()),
            db,
            broadcaster,
            tabs: Arc::new(tabs),
        }
    }

    pub fn db(&self) -> &DbHandle {
        &self.db
    }

    pub fn broadcaster(&self) -> &EventBroadcaster {
        &self.broadcaster
    }

    /// Run a database closure, folding both error layers into `ProgressError`.
    async fn with_db<F, R>(&self, f: F) -> Result<R, ProgressError>
    where
        F: FnOnce(&super::db::ProgressDb) -> Result<R, ProgressError> + Send + 'static,
        R: Send + 'static,
    {
        self.db
            .call(move |db| Ok(f(db)))
            .await
            .map_err(ProgressError::Database)?
    }

    // ── Companies ─────────────────────────────────────────────────────

    pub async fn create_company(
        &self,
        name: String,
        category: CompanyCategory,
        is_demo: bool,
    ) -> Result<Company, ProgressError> {
        if name.trim().is_empty() {
            return Err(ProgressError::BadRequest("company name is required".into()));
        }
        let base = self.tabs.base.clone();
        self.with_db(move |db| {
            db.create_company(&name, category, is_demo, &base)
                .map_err(ProgressError::Database)
        })
        .await
    }

    pub async fn get_company(&self, id: i64) -> Result<Company, ProgressError> {
        self.with_db(move |db| {
            db.get_company(id)
                .map_err(ProgressError::Database)?
                .ok_or(ProgressError::CompanyNotFound { id })
        })
        .await
    }

    pub async fn list_companies(&self) -> Result<Vec<Company>, ProgressError> {
        self.with_db(|db| db.list_companies().map_err(ProgressError::Database))
            .await
    }

    /// Grant the file-vault tab. Always broadcasts so every open view converges
    /// even when the tab was already present.
    pub async fn unlock_file_vault(&self, company_id: i64) -> Result<Company, ProgressError> {
        let company = self
            .with_db(move |db| {
                let company = db
                    .get_company(company_id)
                    .map_err(ProgressError::Database)?
                    .ok_or(ProgressError::CompanyNotFound { id: company_id })?;
                if company.available_tabs.iter().any(|t| t == FILE_VAULT_TAB) {
                    return Ok(company);
                }
                let mut tabs = company.available_tabs.clone();
                tabs.push(FILE_VAULT_TAB.to_string());
                db.set_company_tabs(company_id, &tabs)
                    .map_err(ProgressError::Database)
            })
            .await?;
        info!(company_id, tabs = ?company.available_tabs, "file vault unlocked");
        self.broadcaster
            .publish(&WsMessage::company_tabs_updated(&company));
        Ok(company)
    }

    /// Snapshot pushed to a socket right after it connects.
    pub async fn initial_data(&self, company_id: i64) -> Result<WsMessage, ProgressError> {
        self.with_db(move |db| {
            let company = db
                .get_company(company_id)
                .map_err(ProgressError::Database)?
                .ok_or(ProgressError::CompanyNotFound { id: company_id })?;
            let tasks = db
                .list_tasks(Some(company_id))
                .map_err(ProgressError::Database)?;
            Ok(WsMessage::InitialData {
                company_id,
                available_tabs: company.available_tabs,
                tasks: tasks.iter().map(TaskSummary::from).collect(),
            })
        })
        .await
    }

    // ── Tasks ─────────────────────────────────────────────────────────

    pub async fn create_task(
        &self,
        company_id: i64,
        title: String,
        task_type: TaskType,
    ) -> Result<Task, ProgressError> {
        let task = self
            .with_db(move |db| {
                db.get_company(company_id)
                    .map_err(ProgressError::Database)?
                    .ok_or(ProgressError::CompanyNotFound { id: company_id })?;
                db.create_task(company_id, &title, task_type)
                    .map_err(ProgressError::Database)
            })
            .await?;
        self.broadcaster.publish(&WsMessage::task_created(&task));
        Ok(task)
    }

    pub async fn get_task(&self, id: i64) -> Result<Task, ProgressError> {
        self.with_db(move |db| {
            db.get_task(id)
                .map_err(ProgressError::Database)?
                .ok_or(ProgressError::TaskNotFound { id })
        })
        .await
    }

    pub async fn list_tasks(&self, company_id: Option<i64>) -> Result<Vec<Task>, ProgressError> {
        self.with_db(move |db| db.list_tasks(company_id).map_err(ProgressError::Database))
            .await
    }

    pub async fn list_responses(&self, task_id: i64) -> Result<Vec<FormResponse>, ProgressError> {
        self.with_db(move |db| {
            db.get_task(task_id)
                .map_err(ProgressError::Database)?
                .ok_or(ProgressError::TaskNotFound { id: task_id })?;
            db.list_form_responses(task_id)
                .map_err(ProgressError::Database)
        })
        .await
    }

    /// Save one field answer and recompute the task's progress.
    ///
    /// A failed recompute is logged and reported as no progress change; the
    /// saved response stands.
    pub async fn record_response(
        &self,
        task_id: i64,
        field_key: String,
        value: String,
        status: Option<FieldStatus>,
    ) -> Result<(FormResponse, Option<UpdateOutcome>), ProgressError> {
        let response = self
            .with_db(move |db| {
                let task = db
                    .get_task(task_id)
                    .map_err(ProgressError::Database)?
                    .ok_or(ProgressError::TaskNotFound { id: task_id })?;
                if task.status.is_locked() {
                    return Err(ProgressError::TaskLocked {
                        id: task_id,
                        status: task.status.to_string(),
                    });
                }
                let defs = db
                    .list_field_definitions(task.task_type)
                    .map_err(ProgressError::Database)?;
                if !defs.iter().any(|d| d.field_key == field_key) {
                    return Err(ProgressError::UnknownField {
                        task_type: task.task_type.to_string(),
                        field_key,
                    });
                }
                let status = status.unwrap_or_else(|| FieldStatus::infer(&value));
                db.upsert_form_response(task_id, &field_key, &value, status)
                    .map_err(ProgressError::Database)
            })
            .await?;

        let outcome = match self
            .updater
            .update(task_id, None, UpdateOptions::default())
            .await
        {
            Ok(outcome) => Some(outcome),
            Err(e) => {
                warn!(task_id, error = %e, "progress update failed after saving response");
                None
            }
        };
        Ok((response, outcome))
    }

    pub async fn calculate(
        &self,
        task_id: i64,
        options: CalculateOptions,
    ) -> Result<ProgressSnapshot, ProgressError> {
        self.calculator.calculate(task_id, None, options).await
    }

    pub async fn update_progress(
        &self,
        task_id: i64,
        options: UpdateOptions,
    ) -> Result<UpdateOutcome, ProgressError> {
        self.updater.update(task_id, None, options).await
    }

    /// Lock a complete task and unlock whatever tabs its submission grants.
    pub async fn submit(&self, task_id: i64) -> Result<SubmitResult, ProgressError> {
        let tabs = self.tabs.clone();
        let submitted_at = chrono::Utc::now().to_rfc3339();
        let result = self
            .with_db(move |db| {
                let task = db
                    .get_task(task_id)
                    .map_err(ProgressError::Database)?
                    .ok_or(ProgressError::TaskNotFound { id: task_id })?;
                if task.status.is_locked() {
                    return Err(ProgressError::TaskLocked {
                        id: task_id,
                        status: task.status.to_string(),
                    });
                }
                if task.progress < 100 {
                    return Err(ProgressError::TaskIncomplete {
                        id: task_id,
                        progress: task.progress,
                    });
                }
                db.submit_task(task_id, &tabs, &submitted_at)
                    .map_err(ProgressError::Database)
            })
            .await?;

        info!(
            task_id,
            company_id = result.company.id,
            tabs_changed = result.tabs_changed,
            "task submitted"
        );
        self.broadcaster
            .publish(&WsMessage::task_updated(&result.task));
        if result.tabs_changed {
            self.broadcaster
                .publish(&WsMessage::company_tabs_updated(&result.company));
        }
        Ok(result)
    }

    /// Operator override of a task's progress, recorded in its metadata.
    ///
    /// The stored fingerprint is cleared so the next recompute from field
    /// state replaces the override.
    pub async fn override_progress(
        &self,
        task_id: i64,
        progress: u8,
        reason: String,
    ) -> Result<Task, ProgressError> {
        if progress > 100 {
            return Err(ProgressError::BadRequest(format!(
                "progress must be between 0 and 100, got {}",
                progress
            )));
        }
        if reason.trim().is_empty() {
            return Err(ProgressError::BadRequest(
                "an override reason is required".into(),
            ));
        }
        let at = chrono::Utc::now().to_rfc3339();
        let task = self
            .with_db(move |db| {
                let task = db
                    .get_task(task_id)
                    .map_err(ProgressError::Database)?
                    .ok_or(ProgressError::TaskNotFound { id: task_id })?;
                if task.status.is_locked() {
                    return Err(ProgressError::TaskLocked {
                        id: task_id,
                        status: task.status.to_string(),
                    });
                }
                let mut metadata = task.metadata.clone();
                metadata.insert(
                    "progress_override".into(),
                    serde_json::json!({
                        "value": progress,
                        "previous": task.progress,
                        "reason": reason,
                        "at": at,
                    }),
                );
                let status = TaskStatus::for_progress(progress, task.status);
                db.override_task_progress(task_id, progress, status, &metadata)
                    .map_err(ProgressError::Database)
            })
            .await?;
        warn!(task_id, progress, "task progress overridden");
        self.broadcaster.publish(&WsMessage::task_updated(&task));
        Ok(task)
    }

    // ── Form definitions ──────────────────────────────────────────────

    pub async fn field_definitions(
        &self,
        task_type: TaskType,
    ) -> Result<Vec<FieldDefinition>, ProgressError> {
        self.with_db(move |db| {
            db.list_field_definitions(task_type)
                .map_err(ProgressError::Database)
        })
        .await
    }

    pub async fn field_groups(
        &self,
        task_type: TaskType,
    ) -> Result<Vec<FieldGroupSummary>, ProgressError> {
        self.with_db(move |db| db.field_groups(task_type).map_err(ProgressError::Database))
            .await
    }

    pub async fn import_fields(
        &self,
        defs: Vec<NewFieldDefinition>,
    ) -> Result<usize, ProgressError> {
        if let Some(bad) = defs.iter().find(|d| d.field_key.trim().is_empty()) {
            return Err(ProgressError::BadRequest(format!(
                "empty field_key in {} definitions",
                bad.task_type
            )));
        }
        self.with_db(move |db| {
            for def in &defs {
                db.define_field(def).map_err(ProgressError::Database)?;
            }
            Ok(defs.len())
        })
        .await
    }

    // ── Demo autofill ─────────────────────────────────────────────────

    /// Demo values for every field of a demo company's task.
    pub async fn demo_values(
        &self,
        task_id: i64,
        expected: TaskType,
    ) -> Result<BTreeMap<String, String>, ProgressError> {
        self.with_db(move |db| {
            let (_, defs) = demo_target(db, task_id, expected)?;
            Ok(defs
                .into_iter()
                .map(|d| {
                    let value = demo_value_for(&d);
                    (d.field_key, value)
                })
                .collect())
        })
        .await
    }

    /// Fill every field with its demo value and force a progress update.
    pub async fn apply_demo_data(
        &self,
        task_id: i64,
        expected: TaskType,
    ) -> Result<UpdateOutcome, ProgressError> {
        let written = self
            .with_db(move |db| {
                let (task, defs) = demo_target(db, task_id, expected)?;
                if task.status.is_locked() {
                    return Err(ProgressError::TaskLocked {
                        id: task_id,
                        status: task.status.to_string(),
                    });
                }
                let values: Vec<(String, String)> = defs
                    .iter()
                    .map(|def| (def.field_key.clone(), demo_value_for(def)))
                    .collect();
                db.fill_form_responses(task_id, &values, FieldStatus::Complete)
                    .map_err(ProgressError::Database)
            })
            .await?;
        info!(task_id, task_type = %expected, fields = written, "applied demo data");

        self.updater
            .update(
                task_id,
                Some(expected),
                UpdateOptions {
                    force_update: true,
                    ..Default::default()
                },
            )
            .await
    }
}

fn demo_target(
    db: &super::db::ProgressDb,
    task_id: i64,
    expected: TaskType,
) -> Result<(Task, Vec<FieldDefinition>), ProgressError> {
    let task = db
        .get_task(task_id)
        .map_err(ProgressError::Database)?
        .ok_or(ProgressError::TaskNotFound { id: task_id })?;
    if task.task_type != expected {
        return Err(ProgressError::WrongTaskType {
            id: task_id,
            expected: expected.to_string(),
            actual: task.task_type.to_string(),
        });
    }
    let company = db
        .get_company(task.company_id)
        .map_err(ProgressError::Database)?
        .ok_or(ProgressError::CompanyNotFound {
            id: task.company_id,
        })?;
    if !company.is_demo {
        return Err(ProgressError::DemoOnly {
            company_id: company.id,
        });
    }
    let defs = db
        .list_field_definitions(task.task_type)
        .map_err(ProgressError::Database)?;
    Ok((task, defs))
}

fn demo_value_for(def: &FieldDefinition) -> String {
    match &def.demo_value {
        Some(v) if !v.trim().is_empty() => v.clone(),
        _ => format!("Demo {}", def.field_key),
    }
}
