use anyhow::Result;
use taskpulse::config::TaskpulseConfig;
use taskpulse::progress::updater::{UpdateOptions, UpdateOutcome};

use super::open_service;

pub async fn cmd_recalculate(
    config: &TaskpulseConfig,
    task_id: i64,
    force: bool,
    skip_broadcast: bool,
    debug: bool,
) -> Result<()> {
    let service = open_service(config)?;
    let outcome = service
        .update_progress(
            task_id,
            UpdateOptions {
                debug,
                force_update: force,
                skip_broadcast,
                preserve_existing: false,
            },
        )
        .await?;

    match &outcome {
        UpdateOutcome::Updated {
            task,
            previous_progress,
            ..
        } => println!(
            "Task {}: {}% -> {}% ({})",
            task.id, previous_progress, task.progress, task.status
        ),
        UpdateOutcome::Unchanged { task } => {
            println!("Task {}: unchanged at {}% ({})", task.id, task.progress, task.status)
        }
        UpdateOutcome::Locked { task } => println!(
            "Task {} is {} and locked at {}%",
            task.id, task.status, task.progress
        ),
    }
    Ok(())
}

pub async fn cmd_override_progress(
    config: &TaskpulseConfig,
    task_id: i64,
    progress: u8,
    reason: String,
) -> Result<()> {
    let service = open_service(config)?;
    let task = service.override_progress(task_id, progress, reason).await?;
    println!(
        "Task {} progress overridden to {}% ({})",
        task.id, task.progress, task.status
    );
    Ok(())
}
