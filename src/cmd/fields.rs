use anyhow::{Context, Result};
use std::path::Path;
use std::str::FromStr;
use taskpulse::config::TaskpulseConfig;
use taskpulse::progress::models::{NewFieldDefinition, TaskType};

use super::open_service;

/// Load form field definitions from a JSON array and upsert them.
pub async fn cmd_import_fields(config: &TaskpulseConfig, file: &Path) -> Result<()> {
    let content = std::fs::read_to_string(file)
        .with_context(|| format!("Failed to read {}", file.display()))?;
    let defs: Vec<NewFieldDefinition> = serde_json::from_str(&content)
        .with_context(|| format!("Invalid field definitions in {}", file.display()))?;

    let service = open_service(config)?;
    let count = service.import_fields(defs).await?;
    tracing::info!(count, file = %file.display(), "imported field definitions");
    println!("Imported {} field definitions", count);
    Ok(())
}

/// Print per-group field counts for a form.
pub async fn cmd_field_groups(config: &TaskpulseConfig, task_type: &str) -> Result<()> {
    let task_type = TaskType::from_str(task_type).map_err(anyhow::Error::msg)?;
    let service = open_service(config)?;
    let groups = service.field_groups(task_type).await?;

    if groups.is_empty() {
        println!("No fields defined for {}", task_type);
        return Ok(());
    }

    let total: i64 = groups.iter().map(|g| g.field_count).sum();
    println!("Fields per group ({}):", task_type);
    for group in &groups {
        let name = if group.group_name.is_empty() {
            "(ungrouped)"
        } else {
            group.group_name.as_str()
        };
        println!("  {}: {}", name, group.field_count);
    }
    println!("Total: {} fields in {} groups", total, groups.len());
    Ok(())
}
