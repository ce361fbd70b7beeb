use std::str::FromStr;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum TaskType {
    CompanyKyb,
    #[serde(alias = "security_assessment")]
    Ky3p,
    OpenBanking,
    CompanyCard,
    UserOnboarding,
    FileRequest,
}

impl TaskType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::CompanyKyb => "company_kyb",
            Self::Ky3p => "ky3p",
            Self::OpenBanking => "open_banking",
            Self::CompanyCard => "company_card",
            Self::UserOnboarding => "user_onboarding",
            Self::FileRequest => "file_request",
        }
    }

    /// URL segment used by the demo-autofill routes, for form-backed types.
    pub fn form_slug(&self) -> Option<&'static str> {
        match self {
            Self::CompanyKyb => Some("kyb"),
            Self::Ky3p => Some("ky3p"),
            Self::OpenBanking => Some("open-banking"),
            _ => None,
        }
    }
}

impl std::fmt::Display for TaskType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "company_kyb" | "kyb" => Ok(Self::CompanyKyb),
            "ky3p" | "security_assessment" => Ok(Self::Ky3p),
            "open_banking" | "open-banking" => Ok(Self::OpenBanking),
            "company_card" => Ok(Self::CompanyCard),
            "user_onboarding" => Ok(Self::UserOnboarding),
            "file_request" => Ok(Self::FileRequest),
            _ => Err(format!("Invalid task type: {}", s)),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    NotStarted,
    Pending,
    InProgress,
    ReadyForSubmission,
    Submitted,
    Approved,
    Rejected,
    Failed,
    Archived,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NotStarted => "not_started",
            Self::Pending => "pending",
            Self::InProgress => "in_progress",
            Self::ReadyForSubmission => "ready_for_submission",
            Self::Submitted => "submitted",
            Self::Approved => "approved",
            Self::Rejected => "rejected",
            Self::Failed => "failed",
            Self::Archived => "archived",
        }
    }

    /// Locked tasks are no longer driven by their field responses.
    pub fn is_locked(&self) -> bool {
        matches!(
            self,
            Self::Submitted | Self::Approved | Self::Rejected | Self::Archived
        )
    }

    /// Position in the lifecycle, used to avoid moving a task backwards.
    pub fn rank(&self) -> u8 {
        match self {
            Self::NotStarted | Self::Pending | Self::Failed => 0,
            Self::InProgress => 1,
            Self::ReadyForSubmission => 2,
            Self::Submitted => 3,
            Self::Approved | Self::Rejected | Self::Archived => 4,
        }
    }

    /// Status implied by a completion percentage, given the current status.
    pub fn for_progress(progress: u8, current: TaskStatus) -> TaskStatus {
        match progress {
            0 if current == Self::Pending => Self::Pending,
            0 => Self::NotStarted,
            100..=u8::MAX => Self::ReadyForSubmission,
            _ => Self::InProgress,
        }
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "not_started" => Ok(Self::NotStarted),
            "pending" => Ok(Self::Pending),
            "in_progress" => Ok(Self::InProgress),
            "ready_for_submission" => Ok(Self::ReadyForSubmission),
            "submitted" => Ok(Self::Submitted),
            "approved" => Ok(Self::Approved),
            "rejected" => Ok(Self::Rejected),
            "failed" => Ok(Self::Failed),
            "archived" => Ok(Self::Archived),
            _ => Err(format!("Invalid task status: {}", s)),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FieldStatus {
    Complete,
    Incomplete,
    Empty,
    Invalid,
}

impl FieldStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Complete => "COMPLETE",
            Self::Incomplete => "INCOMPLETE",
            Self::Empty => "EMPTY",
            Self::Invalid => "INVALID",
        }
    }

    /// Status assumed for a value when the caller does not provide one.
    pub fn infer(value: &str) -> FieldStatus {
        if value.trim().is_empty() {
            Self::Empty
        } else {
            Self::Complete
        }
    }
}

impl FromStr for FieldStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "COMPLETE" => Ok(Self::Complete),
            "INCOMPLETE" => Ok(Self::Incomplete),
            "EMPTY" => Ok(Self::Empty),
            "INVALID" => Ok(Self::Invalid),
            _ => Err(format!("Invalid field status: {}", s)),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum CompanyCategory {
    Bank,
    FinTech,
    /// The platform operator itself.
    Invela,
}

impl CompanyCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Bank => "Bank",
            Self::FinTech => "FinTech",
            Self::Invela => "Invela",
        }
    }
}

impl FromStr for CompanyCategory {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Bank" => Ok(Self::Bank),
            "FinTech" => Ok(Self::FinTech),
            "Invela" => Ok(Self::Invela),
            _ => Err(format!("Invalid company category: {}", s)),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AccreditationStatus {
    Pending,
    Approved,
    Revoked,
}

impl AccreditationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Approved => "APPROVED",
            Self::Revoked => "REVOKED",
        }
    }
}

impl FromStr for AccreditationStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PENDING" => Ok(Self::Pending),
            "APPROVED" => Ok(Self::Approved),
            "REVOKED" => Ok(Self::Revoked),
            _ => Err(format!("Invalid accreditation status: {}", s)),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Company {
    pub id: i64,
    pub name: String,
    pub category: CompanyCategory,
    pub accreditation_status: AccreditationStatus,
    pub available_tabs: Vec<String>,
    pub is_demo: bool,
    pub created_at: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: i64,
    pub company_id: i64,
    pub title: String,
    pub task_type: TaskType,
    pub status: TaskStatus,
    pub progress: u8,
    pub metadata: serde_json::Map<String, serde_json::Value>,
    /// Hash of the field state the stored progress was derived from.
    pub progress_fingerprint: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FormResponse {
    pub id: i64,
    pub task_id: i64,
    pub field_key: String,
    pub value: String,
    pub status: FieldStatus,
    pub updated_at: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FieldDefinition {
    pub id: i64,
    pub task_type: TaskType,
    pub field_key: String,
    pub group_name: String,
    pub display_order: i32,
    pub demo_value: Option<String>,
}

/// Input shape for `import-fields` and `ProgressDb::define_field`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewFieldDefinition {
    pub task_type: TaskType,
    pub field_key: String,
    #[serde(default)]
    pub group_name: String,
    #[serde(default)]
    pub display_order: i32,
    #[serde(default)]
    pub demo_value: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FieldGroupSummary {
    pub group_name: String,
    pub field_count: i64,
}

/// Compact task view pushed to clients in `initial_data`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TaskSummary {
    pub task_id: i64,
    pub task_type: TaskType,
    pub progress: u8,
    pub status: TaskStatus,
}

impl From<&Task> for TaskSummary {
    fn from(task: &Task) -> Self {
        Self {
            task_id: task.id,
            task_type: task.task_type,
            progress: task.progress,
            status: task.status,
        }
    }
}
