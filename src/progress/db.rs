use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;

use anyhow::{Context, Result};
use rusqlite::{Connection, OptionalExtension, params};

use super::models::*;
use crate::config::TabsSection;

/// Async-safe handle to the progress database.
///
/// Wraps `ProgressDb` behind `Arc<Mutex>` and runs all access on tokio's
/// blocking thread pool via `spawn_blocking`, preventing synchronous SQLite
/// I/O from tying up async worker threads. Every `call` closure runs with
/// exclusive access, so a read-compute-write inside one closure is atomic
/// with respect to other callers.
#[derive(Clone)]
pub struct DbHandle {
    inner: Arc<std::sync::Mutex<ProgressDb>>,
}

impl DbHandle {
    pub fn new(db: ProgressDb) -> Self {
        Self {
            inner: Arc::new(std::sync::Mutex::new(db)),
        }
    }

    /// Run a closure with access to the database on a blocking thread.
    /// All data passed into `f` must be owned (`'static`).
    pub async fn call<F, R>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&ProgressDb) -> Result<R> + Send + 'static,
        R: Send + 'static,
    {
        let db = self.inner.clone();
        tokio::task::spawn_blocking(move || {
            let guard = db
                .lock()
                .map_err(|e| anyhow::anyhow!("DB lock poisoned: {}", e))?;
            f(&guard)
        })
        .await
        .context("DB task panicked")?
    }

    /// Acquire the database mutex synchronously. Only for startup, CLI
    /// commands and tests; never from a hot async path.
    pub fn lock_sync(&self) -> Result<std::sync::MutexGuard<'_, ProgressDb>> {
        self.inner
            .lock()
            .map_err(|e| anyhow::anyhow!("DB lock poisoned: {}", e))
    }
}

/// Result of a submission: the locked task and the company's tab state.
#[derive(Debug, Clone)]
pub struct SubmitResult {
    pub task: Task,
    pub company: Company,
    pub tabs_changed: bool,
}

pub struct ProgressDb {
    conn: Connection,
}

impl ProgressDb {
    /// Open (or create) a SQLite database at the given path and run migrations.
    pub fn new(path: &Path) -> Result<Self> {
        let conn = Connection::open(path).context("Failed to open SQLite database")?;
        let db = Self { conn };
        db.init()?;
        Ok(db)
    }

    /// Create an in-memory SQLite database (for testing).
    pub fn new_in_memory() -> Result<Self> {
        let conn =
            Connection::open_in_memory().context("Failed to open in-memory SQLite database")?;
        let db = Self { conn };
        db.init()?;
        Ok(db)
    }

    fn init(&self) -> Result<()> {
        self.conn
            .execute_batch("PRAGMA foreign_keys = ON;")
            .context("Failed to enable foreign keys")?;
        self.run_migrations().context("Failed to run migrations")?;
        Ok(())
    }

    fn run_migrations(&self) -> Result<()> {
        self.conn
            .execute_batch(
                "
                CREATE TABLE IF NOT EXISTS companies (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    name TEXT NOT NULL,
                    category TEXT NOT NULL,
                    accreditation_status TEXT NOT NULL DEFAULT 'PENDING',
                    available_tabs TEXT NOT NULL DEFAULT '[]',
                    is_demo INTEGER NOT NULL DEFAULT 0,
                    created_at TEXT NOT NULL DEFAULT (datetime('now'))
                );

                CREATE TABLE IF NOT EXISTS tasks (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    company_id INTEGER NOT NULL REFERENCES companies(id) ON DELETE CASCADE,
                    title TEXT NOT NULL,
                    task_type TEXT NOT NULL,
                    status TEXT NOT NULL DEFAULT 'not_started',
                    progress INTEGER NOT NULL DEFAULT 0 CHECK (progress BETWEEN 0 AND 100),
                    metadata TEXT NOT NULL DEFAULT '{}',
                    progress_fingerprint TEXT,
                    created_at TEXT NOT NULL DEFAULT (datetime('now')),
                    updated_at TEXT NOT NULL DEFAULT (datetime('now'))
                );

                CREATE TABLE IF NOT EXISTS form_fields (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    task_type TEXT NOT NULL,
                    field_key TEXT NOT NULL,
                    group_name TEXT NOT NULL DEFAULT '',
                    display_order INTEGER NOT NULL DEFAULT 0,
                    demo_value TEXT,
                    UNIQUE(task_type, field_key)
                );

                CREATE TABLE IF NOT EXISTS form_responses (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    task_id INTEGER NOT NULL REFERENCES tasks(id) ON DELETE CASCADE,
                    field_key TEXT NOT NULL,
                    value TEXT NOT NULL DEFAULT '',
                    status TEXT NOT NULL DEFAULT 'EMPTY',
                    updated_at TEXT NOT NULL DEFAULT (datetime('now')),
                    UNIQUE(task_id, field_key)
                );

                CREATE INDEX IF NOT EXISTS idx_tasks_company ON tasks(company_id);
                CREATE INDEX IF NOT EXISTS idx_form_fields_type ON form_fields(task_type);
                CREATE INDEX IF NOT EXISTS idx_form_responses_task ON form_responses(task_id);
                ",
            )
            .context("Failed to create tables")?;
        Ok(())
    }

    // ── Companies ─────────────────────────────────────────────────────

    pub fn create_company(
        &self,
        name: &str,
        category: CompanyCategory,
        is_demo: bool,
        available_tabs: &[String],
    ) -> Result<Company> {
        let tabs = serde_json::to_string(available_tabs).context("Failed to encode tabs")?;
        self.conn
            .execute(
                "INSERT INTO companies (name, category, is_demo, available_tabs) VALUES (?1, ?2, ?3, ?4)",
                params![name, category.as_str(), is_demo, tabs],
            )
            .context("Failed to insert company")?;
        let id = self.conn.last_insert_rowid();
        self.get_company(id)?
            .context("Company not found after insert")
    }

    pub fn get_company(&self, id: i64) -> Result<Option<Company>> {
        let row = self
            .conn
            .query_row(
                "SELECT id, name, category, accreditation_status, available_tabs, is_demo, created_at
                 FROM companies WHERE id = ?1",
                params![id],
                CompanyRow::from_row,
            )
            .optional()
            .context("Failed to query company")?;
        row.map(CompanyRow::into_company).transpose()
    }

    pub fn list_companies(&self) -> Result<Vec<Company>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT id, name, category, accreditation_status, available_tabs, is_demo, created_at
                 FROM companies ORDER BY id",
            )
            .context("Failed to prepare list_companies")?;
        let rows = stmt
            .query_map([], CompanyRow::from_row)
            .context("Failed to query companies")?;
        let mut companies = Vec::new();
        for row in rows {
            let r = row.context("Failed to read company row")?;
            companies.push(r.into_company()?);
        }
        Ok(companies)
    }

    pub fn set_company_tabs(&self, id: i64, tabs: &[String]) -> Result<Company> {
        let encoded = serde_json::to_string(tabs).context("Failed to encode tabs")?;
        self.conn
            .execute(
                "UPDATE companies SET available_tabs = ?1 WHERE id = ?2",
                params![encoded, id],
            )
            .context("Failed to update company tabs")?;
        self.get_company(id)?
            .context("Company not found after tab update")
    }

    // ── Tasks ─────────────────────────────────────────────────────────

    pub fn create_task(&self, company_id: i64, title: &str, task_type: TaskType) -> Result<Task> {
        self.conn
            .execute(
                "INSERT INTO tasks (company_id, title, task_type) VALUES (?1, ?2, ?3)",
                params![company_id, title, task_type.as_str()],
            )
            .context("Failed to insert task")?;
        let id = self.conn.last_insert_rowid();
        self.get_task(id)?.context("Task not found after insert")
    }

    pub fn get_task(&self, id: i64) -> Result<Option<Task>> {
        let row = self
            .conn
            .query_row(
                "SELECT id, company_id, title, task_type, status, progress, metadata, progress_fingerprint, created_at, updated_at
                 FROM tasks WHERE id = ?1",
                params![id],
                TaskRow::from_row,
            )
            .optional()
            .context("Failed to query task")?;
        row.map(TaskRow::into_task).transpose()
    }

    pub fn list_tasks(&self, company_id: Option<i64>) -> Result<Vec<Task>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT id, company_id, title, task_type, status, progress, metadata, progress_fingerprint, created_at, updated_at
                 FROM tasks WHERE (?1 IS NULL OR company_id = ?1) ORDER BY id",
            )
            .context("Failed to prepare list_tasks")?;
        let rows = stmt
            .query_map(params![company_id], TaskRow::from_row)
            .context("Failed to query tasks")?;
        let mut tasks = Vec::new();
        for row in rows {
            let r = row.context("Failed to read task row")?;
            tasks.push(r.into_task()?);
        }
        Ok(tasks)
    }

    pub fn write_task_progress(
        &self,
        id: i64,
        progress: u8,
        status: TaskStatus,
        fingerprint: Option<&str>,
    ) -> Result<Task> {
        self.conn
            .execute(
                "UPDATE tasks SET progress = ?1, status = ?2, progress_fingerprint = ?3, updated_at = datetime('now') WHERE id = ?4",
                params![progress, status.as_str(), fingerprint, id],
            )
            .context("Failed to update task progress")?;
        self.get_task(id)?
            .context("Task not found after progress update")
    }

    /// Store an override's audit metadata together with the new progress.
    /// The fingerprint is cleared so the next calculation is not skipped.
    pub fn override_task_progress(
        &self,
        id: i64,
        progress: u8,
        status: TaskStatus,
        metadata: &serde_json::Map<String, serde_json::Value>,
    ) -> Result<Task> {
        let encoded = serde_json::to_string(metadata).context("Failed to encode metadata")?;
        // Safety: DbHandle's Mutex already guarantees single-threaded access.
        let tx = self
            .conn
            .unchecked_transaction()
            .context("Failed to begin transaction")?;
        tx.execute(
            "UPDATE tasks SET metadata = ?1, progress = ?2, status = ?3, progress_fingerprint = NULL, updated_at = datetime('now') WHERE id = ?4",
            params![encoded, progress, status.as_str(), id],
        )
        .context("Failed to write progress override")?;
        tx.commit().context("Failed to commit progress override")?;
        self.get_task(id)?
            .context("Task not found after progress override")
    }

    /// Distinct task types for which the company has a submitted (or later) task.
    pub fn submitted_task_types(&self, company_id: i64) -> Result<Vec<TaskType>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT DISTINCT task_type FROM tasks
                 WHERE company_id = ?1 AND status IN ('submitted', 'approved')
                 ORDER BY task_type",
            )
            .context("Failed to prepare submitted_task_types")?;
        let rows = stmt
            .query_map(params![company_id], |row| row.get::<_, String>(0))
            .context("Failed to query submitted task types")?;
        let mut types = Vec::new();
        for row in rows {
            let raw = row.context("Failed to read task type")?;
            types.push(TaskType::from_str(&raw).map_err(|e| anyhow::anyhow!(e))?);
        }
        Ok(types)
    }

    /// Lock a task as submitted and recompute its company's tabs, atomically.
    pub fn submit_task(&self, id: i64, tabs: &TabsSection, submitted_at: &str) -> Result<SubmitResult> {
        // Safety: DbHandle's Mutex already guarantees single-threaded access.
        let tx = self
            .conn
            .unchecked_transaction()
            .context("Failed to begin transaction")?;

        let task = self.get_task(id)?.context("Task not found for submission")?;
        let mut metadata = task.metadata.clone();
        metadata.insert("submitted_at".into(), serde_json::Value::from(submitted_at));
        metadata.insert("locked".into(), serde_json::Value::Bool(true));
        let encoded = serde_json::to_string(&metadata).context("Failed to encode metadata")?;

        tx.execute(
            "UPDATE tasks SET status = 'submitted', progress = 100, metadata = ?1, updated_at = datetime('now') WHERE id = ?2",
            params![encoded, id],
        )
        .context("Failed to mark task submitted")?;

        let company = self
            .get_company(task.company_id)?
            .context("Company not found for submission")?;
        let submitted = self.submitted_task_types(task.company_id)?;
        let derived = tabs.derive(&submitted, &company.available_tabs);
        let tabs_changed = derived != company.available_tabs;
        if tabs_changed {
            let encoded_tabs = serde_json::to_string(&derived).context("Failed to encode tabs")?;
            tx.execute(
                "UPDATE companies SET available_tabs = ?1 WHERE id = ?2",
                params![encoded_tabs, task.company_id],
            )
            .context("Failed to update company tabs")?;
        }

        tx.commit().context("Failed to commit submission")?;

        let task = self.get_task(id)?.context("Task not found after submission")?;
        let company = self
            .get_company(task.company_id)?
            .context("Company not found after submission")?;
        Ok(SubmitResult {
            task,
            company,
            tabs_changed,
        })
    }

    // ── Form definitions ──────────────────────────────────────────────

    pub fn define_field(&self, def: &NewFieldDefinition) -> Result<FieldDefinition> {
        self.conn
            .execute(
                "INSERT INTO form_fields (task_type, field_key, group_name, display_order, demo_value)
                 VALUES (?1, ?2, ?3, ?4, ?5)
                 ON CONFLICT(task_type, field_key) DO UPDATE SET
                    group_name = excluded.group_name,
                    display_order = excluded.display_order,
                    demo_value = excluded.demo_value",
                params![
                    def.task_type.as_str(),
                    def.field_key,
                    def.group_name,
                    def.display_order,
                    def.demo_value
                ],
            )
            .context("Failed to upsert field definition")?;
        self.list_field_definitions(def.task_type)?
            .into_iter()
            .find(|f| f.field_key == def.field_key)
            .context("Field definition not found after upsert")
    }

    pub fn list_field_definitions(&self, task_type: TaskType) -> Result<Vec<FieldDefinition>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT id, task_type, field_key, group_name, display_order, demo_value
                 FROM form_fields WHERE task_type = ?1 ORDER BY display_order, id",
            )
            .context("Failed to prepare list_field_definitions")?;
        let rows = stmt
            .query_map(params![task_type.as_str()], |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, i32>(4)?,
                    row.get::<_, Option<String>>(5)?,
                ))
            })
            .context("Failed to query field definitions")?;
        let mut defs = Vec::new();
        for row in rows {
            let (id, raw_type, field_key, group_name, display_order, demo_value) =
                row.context("Failed to read field definition row")?;
            defs.push(FieldDefinition {
                id,
                task_type: TaskType::from_str(&raw_type).map_err(|e| anyhow::anyhow!(e))?,
                field_key,
                group_name,
                display_order,
                demo_value,
            });
        }
        Ok(defs)
    }

    pub fn field_groups(&self, task_type: TaskType) -> Result<Vec<FieldGroupSummary>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT group_name, COUNT(*) FROM form_fields
                 WHERE task_type = ?1 GROUP BY group_name ORDER BY group_name",
            )
            .context("Failed to prepare field_groups")?;
        let rows = stmt
            .query_map(params![task_type.as_str()], |row| {
                Ok(FieldGroupSummary {
                    group_name: row.get(0)?,
                    field_count: row.get(1)?,
                })
            })
            .context("Failed to query field groups")?;
        let mut groups = Vec::new();
        for row in rows {
            groups.push(row.context("Failed to read field group row")?);
        }
        Ok(groups)
    }

    // ── Form responses ────────────────────────────────────────────────

    pub fn upsert_form_response(
        &self,
        task_id: i64,
        field_key: &str,
        value: &str,
        status: FieldStatus,
    ) -> Result<FormResponse> {
        self.conn
            .execute(
                "INSERT INTO form_responses (task_id, field_key, value, status)
                 VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(task_id, field_key) DO UPDATE SET
                    value = excluded.value,
                    status = excluded.status,
                    updated_at = datetime('now')",
                params![task_id, field_key, value, status.as_str()],
            )
            .context("Failed to upsert form response")?;
        let row = self
            .conn
            .query_row(
                "SELECT id, task_id, field_key, value, status, updated_at
                 FROM form_responses WHERE task_id = ?1 AND field_key = ?2",
                params![task_id, field_key],
                FormResponseRow::from_row,
            )
            .context("Form response not found after upsert")?;
        row.into_form_response()
    }

    /// Upsert every `(field_key, value)` pair with one status. Either all
    /// rows are written or none are.
    pub fn fill_form_responses(
        &self,
        task_id: i64,
        values: &[(String, String)],
        status: FieldStatus,
    ) -> Result<usize> {
        // Safety: DbHandle's Mutex already guarantees single-threaded access.
        let tx = self
            .conn
            .unchecked_transaction()
            .context("Failed to begin transaction")?;
        for (field_key, value) in values {
            tx.execute(
                "INSERT INTO form_responses (task_id, field_key, value, status)
                 VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(task_id, field_key) DO UPDATE SET
                    value = excluded.value,
                    status = excluded.status,
                    updated_at = datetime('now')",
                params![task_id, field_key, value, status.as_str()],
            )
            .with_context(|| format!("Failed to fill form response {}", field_key))?;
        }
        tx.commit().context("Failed to commit form responses")?;
        Ok(values.len())
    }

    pub fn list_form_responses(&self, task_id: i64) -> Result<Vec<FormResponse>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT id, task_id, field_key, value, status, updated_at
                 FROM form_responses WHERE task_id = ?1 ORDER BY field_key",
            )
            .context("Failed to prepare list_form_responses")?;
        let rows = stmt
            .query_map(params![task_id], FormResponseRow::from_row)
            .context("Failed to query form responses")?;
        let mut responses = Vec::new();
        for row in rows {
            let r = row.context("Failed to read form response row")?;
            responses.push(r.into_form_response()?);
        }
        Ok(responses)
    }
}

// ── Row helpers ──────────────────────────────────────────────────────

struct CompanyRow {
    id: i64,
    name: String,
    category: String,
    accreditation_status: String,
    available_tabs: String,
    is_demo: bool,
    created_at: String,
}

impl CompanyRow {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            name: row.get(1)?,
            category: row.get(2)?,
            accreditation_status: row.get(3)?,
            available_tabs: row.get(4)?,
            is_demo: row.get(5)?,
            created_at: row.get(6)?,
        })
    }

    fn into_company(self) -> Result<Company> {
        let category = CompanyCategory::from_str(&self.category).map_err(|e| anyhow::anyhow!(e))?;
        let accreditation_status = AccreditationStatus::from_str(&self.accreditation_status)
            .map_err(|e| anyhow::anyhow!(e))?;
        let available_tabs: Vec<String> = serde_json::from_str(&self.available_tabs)
            .with_context(|| format!("Corrupt available_tabs for company {}", self.id))?;
        Ok(Company {
            id: self.id,
            name: self.name,
            category,
            accreditation_status,
            available_tabs,
            is_demo: self.is_demo,
            created_at: self.created_at,
        })
    }
}

struct TaskRow {
    id: i64,
    company_id: i64,
    title: String,
    task_type: String,
    status: String,
    progress: i64,
    metadata: String,
    progress_fingerprint: Option<String>,
    created_at: String,
    updated_at: String,
}

impl TaskRow {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            company_id: row.get(1)?,
            title: row.get(2)?,
            task_type: row.get(3)?,
            status: row.get(4)?,
            progress: row.get(5)?,
            metadata: row.get(6)?,
            progress_fingerprint: row.get(7)?,
            created_at: row.get(8)?,
            updated_at: row.get(9)?,
        })
    }

    fn into_task(self) -> Result<Task> {
        let task_type = TaskType::from_str(&self.task_type).map_err(|e| anyhow::anyhow!(e))?;
        let status = TaskStatus::from_str(&self.status).map_err(|e| anyhow::anyhow!(e))?;
        let progress = u8::try_from(self.progress)
            .with_context(|| format!("Progress out of range for task {}", self.id))?;
        let metadata = serde_json::from_str(&self.metadata)
            .with_context(|| format!("Corrupt metadata for task {}", self.id))?;
        Ok(Task {
            id: self.id,
            company_id: self.company_id,
            title: self.title,
            task_type,
            status,
            progress,
            metadata,
            progress_fingerprint: self.progress_fingerprint,
            created_at: self.created_at,
            updated_at: self.updated_at,
        })
    }
}

struct FormResponseRow {
    id: i64,
    task_id: i64,
    field_key: String,
    value: String,
    status: String,
    updated_at: String,
}

impl FormResponseRow {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            task_id: row.get(1)?,
            field_key: row.get(2)?,
            value: row.get(3)?,
            status: row.get(4)?,
            updated_at: row.get(5)?,
        })
    }

    fn into_form_response(self) -> Result<FormResponse> {
        let status = FieldStatus::from_str(&self.status).map_err(|e| anyhow::anyhow!(e))?;
        Ok(FormResponse {
            id: self.id,
            task_id: self.task_id,
            field_key: self.field_key,
            value: self.value,
            status,
            updated_at: self.updated_at,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn seed_company(db: &ProgressDb) -> Result<Company> {
        db.create_company(
            "Acme Payments",
            CompanyCategory::FinTech,
            false,
            &["task-center".to_string()],
        )
    }

    fn define(db: &ProgressDb, task_type: TaskType, key: &str, group: &str) -> Result<FieldDefinition> {
        db.define_field(&NewFieldDefinition {
            task_type,
            field_key: key.to_string(),
            group_name: group.to_string(),
            display_order: 0,
            demo_value: None,
        })
    }

    #[test]
    fn test_create_database_and_run_migrations() -> Result<()> {
        let db = ProgressDb::new_in_memory()?;
        let tables: Vec<String> = {
            let mut stmt = db
                .conn
                .prepare("SELECT name FROM sqlite_master WHERE type='table' ORDER BY name")?;
            let rows = stmt.query_map([], |row| row.get(0))?;
            rows.collect::<rusqlite::Result<_>>()?
        };
        for expected in ["companies", "form_fields", "form_responses", "tasks"] {
            assert!(tables.contains(&expected.to_string()), "missing {}", expected);
        }
        Ok(())
    }

    #[test]
    fn test_migrations_are_rerunnable() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("progress.db");
        {
            let db = ProgressDb::new(&path)?;
            seed_company(&db)?;
        }
        let db = ProgressDb::new(&path)?;
        assert_eq!(db.list_companies()?.len(), 1);
        Ok(())
    }

    #[test]
    fn test_create_and_get_company() -> Result<()> {
        let db = ProgressDb::new_in_memory()?;
        let company = seed_company(&db)?;
        assert_eq!(company.name, "Acme Payments");
        assert_eq!(company.category, CompanyCategory::FinTech);
        assert_eq!(company.accreditation_status, AccreditationStatus::Pending);
        assert_eq!(company.available_tabs, vec!["task-center"]);
        assert!(!company.is_demo);

        assert!(db.get_company(company.id)?.is_some());
        assert!(db.get_company(999)?.is_none());
        Ok(())
    }

    #[test]
    fn test_set_company_tabs_keeps_order() -> Result<()> {
        let db = ProgressDb::new_in_memory()?;
        let company = seed_company(&db)?;
        let tabs = vec![
            "task-center".to_string(),
            "file-vault".to_string(),
            "dashboard".to_string(),
        ];
        let updated = db.set_company_tabs(company.id, &tabs)?;
        assert_eq!(updated.available_tabs, tabs);
        Ok(())
    }

    #[test]
    fn test_create_task_defaults() -> Result<()> {
        let db = ProgressDb::new_in_memory()?;
        let company = seed_company(&db)?;
        let task = db.create_task(company.id, "KYB Form", TaskType::CompanyKyb)?;
        assert_eq!(task.company_id, company.id);
        assert_eq!(task.status, TaskStatus::NotStarted);
        assert_eq!(task.progress, 0);
        assert!(task.metadata.is_empty());
        assert!(task.progress_fingerprint.is_none());
        Ok(())
    }

    #[test]
    fn test_create_task_for_missing_company_fails() -> Result<()> {
        let db = ProgressDb::new_in_memory()?;
        assert!(db.create_task(42, "Orphan", TaskType::Ky3p).is_err());
        Ok(())
    }

    #[test]
    fn test_list_tasks_filters_by_company() -> Result<()> {
        let db = ProgressDb::new_in_memory()?;
        let a = seed_company(&db)?;
        let b = db.create_company("Bank B", CompanyCategory::Bank, false, &[])?;
        db.create_task(a.id, "KYB", TaskType::CompanyKyb)?;
        db.create_task(a.id, "KY3P", TaskType::Ky3p)?;
        db.create_task(b.id, "Open Banking", TaskType::OpenBanking)?;

        assert_eq!(db.list_tasks(None)?.len(), 3);
        assert_eq!(db.list_tasks(Some(a.id))?.len(), 2);
        let b_tasks = db.list_tasks(Some(b.id))?;
        assert_eq!(b_tasks.len(), 1);
        assert_eq!(b_tasks[0].task_type, TaskType::OpenBanking);
        Ok(())
    }

    #[test]
    fn test_write_task_progress() -> Result<()> {
        let db = ProgressDb::new_in_memory()?;
        let company = seed_company(&db)?;
        let task = db.create_task(company.id, "KYB", TaskType::CompanyKyb)?;
        let updated = db.write_task_progress(task.id, 13, TaskStatus::InProgress, Some("abc"))?;
        assert_eq!(updated.progress, 13);
        assert_eq!(updated.status, TaskStatus::InProgress);
        assert_eq!(updated.progress_fingerprint.as_deref(), Some("abc"));
        Ok(())
    }

    #[test]
    fn test_progress_check_constraint() -> Result<()> {
        let db = ProgressDb::new_in_memory()?;
        let company = seed_company(&db)?;
        let task = db.create_task(company.id, "KYB", TaskType::CompanyKyb)?;
        assert!(
            db.write_task_progress(task.id, 101, TaskStatus::InProgress, None)
                .is_err()
        );
        Ok(())
    }

    #[test]
    fn test_override_task_progress_writes_together() -> Result<()> {
        let db = ProgressDb::new_in_memory()?;
        let company = seed_company(&db)?;
        let task = db.create_task(company.id, "KYB", TaskType::CompanyKyb)?;
        db.write_task_progress(task.id, 40, TaskStatus::InProgress, Some("abc"))?;

        let mut metadata = serde_json::Map::new();
        metadata.insert("progress_override".into(), serde_json::json!({"value": 70}));
        let updated = db.override_task_progress(task.id, 70, TaskStatus::InProgress, &metadata)?;
        assert_eq!(updated.progress, 70);
        assert_eq!(updated.metadata["progress_override"]["value"], 70);
        assert!(updated.progress_fingerprint.is_none());
        Ok(())
    }

    #[test]
    fn test_rejected_override_leaves_task_untouched() -> Result<()> {
        let db = ProgressDb::new_in_memory()?;
        let company = seed_company(&db)?;
        let task = db.create_task(company.id, "KYB", TaskType::CompanyKyb)?;
        db.write_task_progress(task.id, 40, TaskStatus::InProgress, None)?;

        let mut metadata = serde_json::Map::new();
        metadata.insert("progress_override".into(), serde_json::json!({"value": 101}));
        assert!(
            db.override_task_progress(task.id, 101, TaskStatus::ReadyForSubmission, &metadata)
                .is_err()
        );
        let after = db.get_task(task.id)?.context("task vanished")?;
        assert_eq!(after.progress, 40);
        assert_eq!(after.status, TaskStatus::InProgress);
        assert!(!after.metadata.contains_key("progress_override"));
        Ok(())
    }

    #[test]
    fn test_define_field_upserts() -> Result<()> {
        let db = ProgressDb::new_in_memory()?;
        define(&db, TaskType::Ky3p, "encryption_at_rest", "Data Security")?;
        let updated = db.define_field(&NewFieldDefinition {
            task_type: TaskType::Ky3p,
            field_key: "encryption_at_rest".to_string(),
            group_name: "Security".to_string(),
            display_order: 4,
            demo_value: Some("AES-256".to_string()),
        })?;
        assert_eq!(updated.group_name, "Security");
        assert_eq!(updated.display_order, 4);
        assert_eq!(db.list_field_definitions(TaskType::Ky3p)?.len(), 1);
        assert!(db.list_field_definitions(TaskType::CompanyKyb)?.is_empty());
        Ok(())
    }

    #[test]
    fn test_field_groups_counts() -> Result<()> {
        let db = ProgressDb::new_in_memory()?;
        define(&db, TaskType::Ky3p, "a", "Access Control")?;
        define(&db, TaskType::Ky3p, "b", "Access Control")?;
        define(&db, TaskType::Ky3p, "c", "Data Security")?;
        define(&db, TaskType::CompanyKyb, "legal_name", "Company Profile")?;

        let groups = db.field_groups(TaskType::Ky3p)?;
        assert_eq!(
            groups,
            vec![
                FieldGroupSummary {
                    group_name: "Access Control".to_string(),
                    field_count: 2
                },
                FieldGroupSummary {
                    group_name: "Data Security".to_string(),
                    field_count: 1
                },
            ]
        );
        Ok(())
    }

    #[test]
    fn test_upsert_form_response_overwrites() -> Result<()> {
        let db = ProgressDb::new_in_memory()?;
        let company = seed_company(&db)?;
        let task = db.create_task(company.id, "KYB", TaskType::CompanyKyb)?;
        db.upsert_form_response(task.id, "legal_name", "", FieldStatus::Empty)?;
        let response =
            db.upsert_form_response(task.id, "legal_name", "Acme Ltd", FieldStatus::Complete)?;
        assert_eq!(response.value, "Acme Ltd");
        assert_eq!(response.status, FieldStatus::Complete);

        let all = db.list_form_responses(task.id)?;
        assert_eq!(all.len(), 1);
        Ok(())
    }

    #[test]
    fn test_fill_form_responses_upserts_all() -> Result<()> {
        let db = ProgressDb::new_in_memory()?;
        let company = seed_company(&db)?;
        let task = db.create_task(company.id, "KYB", TaskType::CompanyKyb)?;
        db.upsert_form_response(task.id, "legal_name", "", FieldStatus::Empty)?;

        let values = vec![
            ("legal_name".to_string(), "Acme Ltd".to_string()),
            ("tax_id".to_string(), "12-3456789".to_string()),
        ];
        assert_eq!(db.fill_form_responses(task.id, &values, FieldStatus::Complete)?, 2);
        let all = db.list_form_responses(task.id)?;
        assert_eq!(all.len(), 2);
        assert!(all.iter().all(|r| r.status == FieldStatus::Complete));
        assert_eq!(all[0].value, "Acme Ltd");
        Ok(())
    }

    #[test]
    fn test_fill_form_responses_is_all_or_nothing() -> Result<()> {
        let db = ProgressDb::new_in_memory()?;
        let company = seed_company(&db)?;
        let task = db.create_task(company.id, "KYB", TaskType::CompanyKyb)?;
        db.conn.execute_batch(
            "CREATE TRIGGER reject_tax_id BEFORE INSERT ON form_responses
             WHEN NEW.field_key = 'tax_id'
             BEGIN SELECT RAISE(ABORT, 'tax_id rejected'); END;",
        )?;

        let values = vec![
            ("legal_name".to_string(), "Acme Ltd".to_string()),
            ("tax_id".to_string(), "12-3456789".to_string()),
        ];
        assert!(
            db.fill_form_responses(task.id, &values, FieldStatus::Complete)
                .is_err()
        );
        assert!(db.list_form_responses(task.id)?.is_empty());
        Ok(())
    }

    #[test]
    fn test_submit_task_unlocks_tabs_atomically() -> Result<()> {
        let db = ProgressDb::new_in_memory()?;
        let company = seed_company(&db)?;
        let task = db.create_task(company.id, "KYB", TaskType::CompanyKyb)?;
        db.write_task_progress(task.id, 100, TaskStatus::ReadyForSubmission, None)?;

        let result = db.submit_task(task.id, &TabsSection::default(), "2026-01-01T00:00:00Z")?;
        assert_eq!(result.task.status, TaskStatus::Submitted);
        assert_eq!(result.task.progress, 100);
        assert_eq!(result.task.metadata["locked"], serde_json::Value::Bool(true));
        assert_eq!(result.task.metadata["submitted_at"], "2026-01-01T00:00:00Z");
        assert!(result.tabs_changed);
        assert_eq!(result.company.available_tabs, vec!["task-center", "file-vault"]);

        assert_eq!(db.submitted_task_types(company.id)?, vec![TaskType::CompanyKyb]);
        Ok(())
    }

    #[test]
    fn test_submit_task_without_new_tabs() -> Result<()> {
        let db = ProgressDb::new_in_memory()?;
        let company = seed_company(&db)?;
        let task = db.create_task(company.id, "KY3P", TaskType::Ky3p)?;
        let result = db.submit_task(task.id, &TabsSection::default(), "2026-01-01T00:00:00Z")?;
        assert!(!result.tabs_changed);
        assert_eq!(result.company.available_tabs, vec!["task-center"]);
        Ok(())
    }

    #[test]
    fn test_delete_company_cascades() -> Result<()> {
        let db = ProgressDb::new_in_memory()?;
        let company = seed_company(&db)?;
        let task = db.create_task(company.id, "KYB", TaskType::CompanyKyb)?;
        db.upsert_form_response(task.id, "legal_name", "Acme", FieldStatus::Complete)?;

        db.conn
            .execute("DELETE FROM companies WHERE id = ?1", params![company.id])?;
        assert!(db.get_task(task.id)?.is_none());
        assert!(db.list_form_responses(task.id)?.is_empty());
        Ok(())
    }
}
