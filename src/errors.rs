//! Typed error hierarchy for taskpulse.
//!
//! Two top-level enums cover the two halves of the notification flow:
//! - `ProgressError`: calculator, updater, submission and HTTP API failures
//! - `BridgeError`: client-side hub and subscriber bridge failures

use thiserror::Error;

/// Errors from the server-side progress flow.
#[derive(Debug, Error)]
pub enum ProgressError {
    #[error("Task {id} not found")]
    TaskNotFound { id: i64 },

    #[error("Company {id} not found")]
    CompanyNotFound { id: i64 },

    #[error("Field '{field_key}' is not part of the {task_type} form")]
    UnknownField { task_type: String, field_key: String },

    #[error("Task {id} is locked ({status}) and cannot be modified")]
    TaskLocked { id: i64, status: String },

    #[error("Task {id} is not complete ({progress}%) and cannot be submitted")]
    TaskIncomplete { id: i64, progress: u8 },

    #[error("Demo data is only available for demo companies (company {company_id})")]
    DemoOnly { company_id: i64 },

    #[error("Task {id} is a {actual} task, expected {expected}")]
    WrongTaskType {
        id: i64,
        expected: String,
        actual: String,
    },

    #[error("Invalid request: {0}")]
    BadRequest(String),

    #[error("Database error: {0}")]
    Database(#[source] anyhow::Error),
}

/// Errors from the client-side subscriber bridge.
#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("Client hub is closed")]
    Closed,

    #[error("Bridge has been torn down")]
    TornDown,

    #[error("WebSocket transport error: {0}")]
    Transport(String),

    #[error("Malformed frame: {0}")]
    InvalidFrame(String),
}
