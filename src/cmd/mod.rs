//! CLI command implementations.
//!
//! Each submodule owns one or more related `Commands` variants:
//!
//! | Module     | Commands handled                           |
//! |------------|--------------------------------------------|
//! | `serve`    | `Serve`, `Init`                            |
//! | `fields`   | `ImportFields`, `FieldGroups`              |
//! | `progress` | `Recalculate`, `OverrideProgress`          |

pub mod fields;
pub mod progress;
pub mod serve;

pub use fields::{cmd_field_groups, cmd_import_fields};
pub use progress::{cmd_override_progress, cmd_recalculate};
pub use serve::{cmd_init, cmd_serve};

use anyhow::{Context, Result};
use taskpulse::config::TaskpulseConfig;
use taskpulse::progress::db::{DbHandle, ProgressDb};
use taskpulse::progress::service::TaskService;
use taskpulse::progress::ws::EventBroadcaster;

/// Open the configured database for a one-shot command.
///
/// Broadcasts from these commands reach no sockets; connected clients pick
/// the change up from `initial_data` on their next connect.
pub(crate) fn open_service(config: &TaskpulseConfig) -> Result<TaskService> {
    let path = &config.database.path;
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent).context("Failed to create database directory")?;
        }
    }
    let db = ProgressDb::new(path)
        .with_context(|| format!("Failed to open database at {}", path.display()))?;
    Ok(TaskService::new(
        DbHandle::new(db),
        EventBroadcaster::new(config.websocket.channel_capacity),
        config.tabs.clone(),
    ))
}
