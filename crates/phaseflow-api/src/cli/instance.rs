//! Instance CLI commands: run, start, next, validate, list, show, stats,
//! pause, resume, cancel, remove.

use anyhow::{Result, anyhow};
use comfy_table::{Cell, Color, ContentArrangement, Table, presets};
use console::style;
use tracing::Instrument;

use phaseflow_core::engine::PhaseExecution;
use phaseflow_core::manager::ManagerError;
use phaseflow_core::repository::{InstanceStore, StorageArea};
use phaseflow_observe::workflow_attrs::{
    INSTANCE_ID, OP_CANCEL, OP_EXECUTE_PHASE, OP_PAUSE, OP_REMOVE, OP_RESUME, OP_START, OPERATION,
    TEMPLATE_ID,
};
use phaseflow_types::instance::{InstanceOptions, InstanceSnapshot, InstanceStatus, PhaseStatus};

use crate::state::AppState;

// ---------------------------------------------------------------------------
// Driving instances
// ---------------------------------------------------------------------------

/// Create an instance, start it and execute up to `max_phases` phases.
///
/// ```bash
/// pflow run greenfield --label nightly
/// pflow run greenfield --phases 1
/// ```
pub async fn run(
    state: &AppState,
    template_id: &str,
    max_phases: Option<usize>,
    options: InstanceOptions,
    json: bool,
) -> Result<()> {
    let instance_id = create_and_start(state, template_id, options).await?;

    let mut executions = Vec::new();
    let limit = max_phases.unwrap_or(usize::MAX);
    while executions.len() < limit {
        let execution = execute_phase(state, &instance_id).await?;
        let done = execution.next_phase.is_none() || execution.status.is_terminal();
        if !json {
            print_execution(&execution);
        }
        executions.push(execution);
        if done {
            break;
        }
    }

    let snapshot = live_snapshot(state, &instance_id).await?;
    if json {
        let out = serde_json::json!({
            "instanceId": instance_id,
            "executions": executions,
            "instance": snapshot,
        });
        println!("{}", serde_json::to_string_pretty(&out)?);
        return Ok(());
    }

    println!();
    println!(
        "  {} {} {} ({}%)",
        style("▸").cyan().bold(),
        style(&instance_id).bold(),
        status_label(snapshot.status),
        snapshot.progress.overall
    );
    println!();
    Ok(())
}

/// Create and start an instance without executing a phase.
pub async fn start(
    state: &AppState,
    template_id: &str,
    options: InstanceOptions,
    json: bool,
) -> Result<()> {
    let instance_id = create_and_start(state, template_id, options).await?;
    let snapshot = live_snapshot(state, &instance_id).await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&snapshot)?);
        return Ok(());
    }

    println!();
    println!(
        "  {} Started {} from template {}",
        style("✓").green().bold(),
        style(&instance_id).bold(),
        style(template_id).cyan()
    );
    if let Some(phase) = snapshot.phases.get(snapshot.current_phase_index) {
        println!("  Current phase: {}", style(&phase.id).cyan());
    }
    println!(
        "  Continue with: {}",
        style(format!("pflow next {instance_id}")).yellow()
    );
    println!();
    Ok(())
}

/// Execute the current phase of a running instance.
pub async fn next(state: &AppState, instance_id: &str, json: bool) -> Result<()> {
    let execution = execute_phase(state, instance_id).await?;
    if json {
        println!("{}", serde_json::to_string_pretty(&execution)?);
    } else {
        print_execution(&execution);
    }
    Ok(())
}

/// Run the current phase's gates and print the report.
pub async fn validate(state: &AppState, instance_id: &str, json: bool) -> Result<()> {
    let report = state.engine.validate(instance_id).await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }

    println!();
    for check in &report.checks {
        let mark = if check.passed {
            style("✓").green()
        } else {
            style("✗").red()
        };
        println!("  {mark} {}", check.gate);
    }
    for error in &report.errors {
        println!("  {} {error}", style("error:").red().bold());
    }
    for warning in &report.warnings {
        println!("  {} {warning}", style("warning:").yellow().bold());
    }
    let verdict = if report.passed {
        style("gates passed").green().bold()
    } else {
        style("gates failed").red().bold()
    };
    println!("  {verdict}");
    println!();
    Ok(())
}

async fn create_and_start(
    state: &AppState,
    template_id: &str,
    options: InstanceOptions,
) -> Result<String> {
    let instance_id = state
        .manager
        .create_instance(template_id, options.clone())
        .await?;

    let span = tracing::info_span!(
        "workflow",
        { OPERATION } = OP_START,
        { INSTANCE_ID } = instance_id.as_str(),
        { TEMPLATE_ID } = template_id,
    );
    state
        .engine
        .start_workflow(&instance_id, options)
        .instrument(span)
        .await?;
    Ok(instance_id)
}

async fn execute_phase(state: &AppState, instance_id: &str) -> Result<PhaseExecution> {
    let span = tracing::info_span!(
        "workflow",
        { OPERATION } = OP_EXECUTE_PHASE,
        { INSTANCE_ID } = instance_id,
    );
    let execution = state
        .engine
        .execute_next_phase(instance_id, InstanceOptions::default())
        .instrument(span)
        .await?;
    Ok(execution)
}

fn print_execution(execution: &PhaseExecution) {
    let mark = if execution.success {
        style("✓").green().bold()
    } else {
        style("✗").red().bold()
    };
    let next = match &execution.next_phase {
        Some(phase) => format!("next: {}", phase.id),
        None => format!("instance {}", execution.status),
    };
    println!(
        "  {mark} phase {} {} {}",
        style(execution.phase.index + 1).dim(),
        style(&execution.phase.id).cyan(),
        style(format!("({next})")).dim()
    );
}

// ---------------------------------------------------------------------------
// Queries
// ---------------------------------------------------------------------------

/// List live instances, or stored snapshots of one storage area.
pub async fn list(
    state: &AppState,
    status: Option<String>,
    template: Option<String>,
    area: Option<StorageArea>,
    json: bool,
) -> Result<()> {
    let snapshots = match area {
        Some(area) => stored_snapshots(state, area).await?,
        None => live_snapshots(state, status, template).await?,
    };

    if json {
        println!("{}", serde_json::to_string_pretty(&snapshots)?);
        return Ok(());
    }

    if snapshots.is_empty() {
        println!();
        println!(
            "  {} No instances found. Start one with: {}",
            style("i").blue().bold(),
            style("pflow run <template>").yellow()
        );
        println!();
        return Ok(());
    }

    let mut table = Table::new();
    table.load_preset(presets::UTF8_FULL_CONDENSED);
    table.set_content_arrangement(ContentArrangement::Dynamic);
    table.set_header(vec![
        Cell::new("Instance").fg(Color::White),
        Cell::new("Template").fg(Color::White),
        Cell::new("Status").fg(Color::White),
        Cell::new("Phase").fg(Color::White),
        Cell::new("Progress").fg(Color::White),
        Cell::new("Started").fg(Color::White),
    ]);

    for snapshot in &snapshots {
        let phase = snapshot
            .phases
            .get(snapshot.current_phase_index)
            .map(|p| p.id.clone())
            .unwrap_or_else(|| "-".to_string());
        let started = snapshot
            .started_at
            .map(|dt| format_relative_time(&dt))
            .unwrap_or_else(|| "not started".to_string());

        table.add_row(vec![
            Cell::new(&snapshot.instance_id).fg(Color::Cyan),
            Cell::new(&snapshot.template.id),
            status_cell(snapshot.status),
            Cell::new(phase),
            Cell::new(format!("{:>3}%", snapshot.progress.overall)),
            Cell::new(started).fg(Color::DarkGrey),
        ]);
    }

    println!();
    println!("{table}");
    println!();
    println!(
        "  {} instance{}",
        style(snapshots.len()).bold(),
        if snapshots.len() == 1 { "" } else { "s" }
    );
    println!();
    Ok(())
}

/// Show one instance, live or stored in any area.
pub async fn show(state: &AppState, instance_id: &str, json: bool) -> Result<()> {
    let (snapshot, area) = find_snapshot(state, instance_id).await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&snapshot)?);
        return Ok(());
    }

    println!();
    println!(
        "  {} {}",
        style(&snapshot.instance_id).bold(),
        status_label(snapshot.status)
    );
    println!();
    println!("  Template:   {}", style(snapshot.template.display_name()).cyan());
    println!("  Stored in:  {area}");
    println!(
        "  Progress:   {}% ({}/{} phases)",
        snapshot.progress.overall, snapshot.progress.completed_phases, snapshot.progress.total_phases
    );
    println!("  Created:    {}", format_relative_time(&snapshot.created_at));
    if let Some(completed_at) = snapshot.completed_at {
        println!("  Finished:   {}", format_relative_time(&completed_at));
    }
    if let Some(label) = &snapshot.options.label {
        println!("  Label:      {label}");
    }

    let mut table = Table::new();
    table.load_preset(presets::UTF8_FULL_CONDENSED);
    table.set_content_arrangement(ContentArrangement::Dynamic);
    table.set_header(vec![
        Cell::new("#").fg(Color::White),
        Cell::new("Phase").fg(Color::White),
        Cell::new("Status").fg(Color::White),
        Cell::new("Duration").fg(Color::White),
        Cell::new("Artifacts").fg(Color::White),
    ]);
    for phase in &snapshot.phases {
        let status = match phase.status {
            PhaseStatus::Completed => Cell::new("✓ completed").fg(Color::Green),
            PhaseStatus::Failed => Cell::new("✗ failed").fg(Color::Red),
            PhaseStatus::Active | PhaseStatus::Executing => {
                Cell::new(format!("● {}", phase.status)).fg(Color::Cyan)
            }
            PhaseStatus::Pending => Cell::new("○ pending").fg(Color::DarkGrey),
        };
        let duration = phase
            .duration_ms
            .map(|ms| format!("{ms} ms"))
            .unwrap_or_default();
        table.add_row(vec![
            Cell::new(phase.index + 1),
            Cell::new(&phase.id),
            status,
            Cell::new(duration),
            Cell::new(phase.artifacts.join(", ")),
        ]);
    }
    println!();
    println!("{table}");

    for blocker in &snapshot.metrics.blockers {
        println!(
            "  {} {}: {}",
            style("blocker").red().bold(),
            blocker.phase_id,
            blocker.reason
        );
    }
    println!();
    Ok(())
}

/// Print aggregate statistics.
pub async fn stats(state: &AppState, json: bool) -> Result<()> {
    let stats = state.manager.get_statistics().await;

    if json {
        let out = serde_json::json!({
            "version": env!("CARGO_PKG_VERSION"),
            "dataDir": state.data_dir.display().to_string(),
            "storageRoot": state.storage_root.display().to_string(),
            "maxInstances": state.config.manager.max_instances,
            "statistics": stats,
        });
        println!("{}", serde_json::to_string_pretty(&out)?);
        return Ok(());
    }

    println!();
    println!(
        "  {} Phaseflow v{}",
        style("⚡").bold(),
        env!("CARGO_PKG_VERSION")
    );
    println!();
    println!(
        "  Instances:  {} live (limit {})",
        style(stats.total).bold(),
        state.config.manager.max_instances
    );
    for (status, count) in &stats.by_status {
        println!("    {status:<12} {count}");
    }
    if !stats.by_template.is_empty() {
        println!("  Templates:");
        for (template, count) in &stats.by_template {
            println!("    {template:<12} {count}");
        }
    }
    println!("  Progress:   {:.1}% average", stats.average_progress);
    if let Some(oldest) = &stats.oldest {
        println!(
            "  Oldest:     {} ({})",
            oldest.instance_id,
            format_relative_time(&oldest.started_at)
        );
    }
    if let Some(newest) = &stats.newest {
        println!(
            "  Newest:     {} ({})",
            newest.instance_id,
            format_relative_time(&newest.started_at)
        );
    }
    println!("  Storage:    {}", style(state.storage_root.display()).dim());
    println!();
    Ok(())
}

// ---------------------------------------------------------------------------
// Operator actions
// ---------------------------------------------------------------------------

/// Operator actions on a live instance.
#[derive(Debug, Clone)]
pub enum Operation {
    Pause,
    Resume,
    Cancel { reason: Option<String> },
}

pub async fn operate(
    state: &AppState,
    instance_id: &str,
    operation: Operation,
    json: bool,
) -> Result<()> {
    let (op_name, verb) = match &operation {
        Operation::Pause => (OP_PAUSE, "Paused"),
        Operation::Resume => (OP_RESUME, "Resumed"),
        Operation::Cancel { .. } => (OP_CANCEL, "Cancelled"),
    };
    let span = tracing::info_span!("workflow", { OPERATION } = op_name, { INSTANCE_ID } = instance_id);

    async {
        match operation {
            Operation::Pause => state.manager.pause_instance(instance_id).await,
            Operation::Resume => state.manager.resume_instance(instance_id).await,
            Operation::Cancel { reason } => state.manager.cancel_instance(instance_id, reason).await,
        }
    }
    .instrument(span)
    .await?;

    let snapshot = live_snapshot(state, instance_id).await?;
    if json {
        println!("{}", serde_json::to_string_pretty(&snapshot)?);
    } else {
        println!();
        println!(
            "  {} {verb} {} {}",
            style("✓").green().bold(),
            style(instance_id).bold(),
            status_label(snapshot.status)
        );
        println!();
    }
    Ok(())
}

/// Remove an instance. Live instances go through the manager; folders left
/// in a terminal area by earlier runs are deleted or archived directly.
pub async fn remove(state: &AppState, instance_id: &str, archive: bool, json: bool) -> Result<()> {
    let span = tracing::info_span!("workflow", { OPERATION } = OP_REMOVE, { INSTANCE_ID } = instance_id);

    async {
        match state.manager.remove_instance(instance_id, archive).await {
            Ok(()) => Ok(()),
            Err(ManagerError::InstanceNotFound(_)) => remove_stored(state, instance_id, archive).await,
            Err(err) => Err(err.into()),
        }
    }
    .instrument(span)
    .await?;

    if json {
        let out = serde_json::json!({ "instanceId": instance_id, "archived": archive });
        println!("{}", serde_json::to_string_pretty(&out)?);
    } else {
        let what = if archive { "Archived" } else { "Removed" };
        println!();
        println!("  {} {what} {}", style("✓").green().bold(), style(instance_id).bold());
        println!();
    }
    Ok(())
}

async fn remove_stored(state: &AppState, instance_id: &str, archive: bool) -> Result<()> {
    let store = state.manager.store();
    for area in [StorageArea::Completed, StorageArea::Failed, StorageArea::Archived] {
        if store.load_snapshot(area, instance_id).await?.is_none() {
            continue;
        }
        if !archive {
            store.delete(area, instance_id).await?;
        } else if area != StorageArea::Archived {
            store.relocate(instance_id, area, StorageArea::Archived).await?;
        }
        return Ok(());
    }
    Err(anyhow!("instance not found: {instance_id}"))
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

async fn live_snapshot(state: &AppState, instance_id: &str) -> Result<InstanceSnapshot> {
    let shared = state
        .manager
        .get_instance(instance_id)
        .ok_or_else(|| anyhow!("instance not found: {instance_id}"))?;
    let snapshot = shared.lock().await.snapshot();
    Ok(snapshot)
}

async fn live_snapshots(
    state: &AppState,
    status: Option<String>,
    template: Option<String>,
) -> Result<Vec<InstanceSnapshot>> {
    let instances = match (status, template) {
        (Some(status), _) => {
            let status = status.parse::<InstanceStatus>().map_err(|e| anyhow!(e))?;
            state.manager.get_instances_by_status(status).await
        }
        (None, Some(template)) => state.manager.get_instances_by_template(&template),
        (None, None) => state.manager.get_all_instances(),
    };

    let mut snapshots = Vec::with_capacity(instances.len());
    for shared in instances {
        snapshots.push(shared.lock().await.snapshot());
    }
    snapshots.sort_by(|a, b| a.created_at.cmp(&b.created_at));
    Ok(snapshots)
}

async fn stored_snapshots(state: &AppState, area: StorageArea) -> Result<Vec<InstanceSnapshot>> {
    let store = state.manager.store();
    let mut snapshots = Vec::new();
    for instance_id in store.list_instance_ids(area).await? {
        match store.load_snapshot(area, &instance_id).await {
            Ok(Some(snapshot)) => snapshots.push(snapshot),
            Ok(None) => {}
            Err(err) => {
                tracing::warn!(instance_id = instance_id.as_str(), error = %err, "unreadable snapshot");
            }
        }
    }
    Ok(snapshots)
}

async fn find_snapshot(state: &AppState, instance_id: &str) -> Result<(InstanceSnapshot, StorageArea)> {
    if let Some(area) = state.manager.instance_area(instance_id).await {
        return Ok((live_snapshot(state, instance_id).await?, area));
    }
    for area in StorageArea::ALL {
        if let Some(snapshot) = state.manager.store().load_snapshot(area, instance_id).await? {
            return Ok((snapshot, area));
        }
    }
    Err(anyhow!("instance not found: {instance_id}"))
}

fn status_cell(status: InstanceStatus) -> Cell {
    let cell = Cell::new(status_text(status));
    match status {
        InstanceStatus::Running => cell.fg(Color::Green),
        InstanceStatus::Paused => cell.fg(Color::Yellow),
        InstanceStatus::Completed => cell.fg(Color::Cyan),
        InstanceStatus::Failed => cell.fg(Color::Red),
        InstanceStatus::Cancelled => cell.fg(Color::DarkGrey),
        InstanceStatus::Initializing | InstanceStatus::Initialized => cell,
    }
}

fn status_label(status: InstanceStatus) -> console::StyledObject<String> {
    let text = status_text(status);
    match status {
        InstanceStatus::Running => style(text).green(),
        InstanceStatus::Paused => style(text).yellow(),
        InstanceStatus::Completed => style(text).cyan(),
        InstanceStatus::Failed => style(text).red(),
        _ => style(text).dim(),
    }
}

fn status_text(status: InstanceStatus) -> String {
    let symbol = match status {
        InstanceStatus::Running => "●",
        InstanceStatus::Paused => "◐",
        InstanceStatus::Completed => "✓",
        InstanceStatus::Failed => "✗",
        InstanceStatus::Cancelled => "◌",
        InstanceStatus::Initializing | InstanceStatus::Initialized => "○",
    };
    format!("{symbol} {status}")
}

fn format_relative_time(dt: &chrono::DateTime<chrono::Utc>) -> String {
    let now = chrono::Utc::now();
    let diff = now - *dt;

    if diff.num_minutes() < 1 {
        "just now".to_string()
    } else if diff.num_hours() < 1 {
        format!("{}m ago", diff.num_minutes())
    } else if diff.num_days() < 1 {
        format!("{}h ago", diff.num_hours())
    } else if diff.num_days() < 30 {
        format!("{}d ago", diff.num_days())
    } else {
        dt.format("%Y-%m-%d").to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, Utc};

    #[test]
    fn relative_time_buckets() {
        assert_eq!(format_relative_time(&Utc::now()), "just now");
        assert_eq!(format_relative_time(&(Utc::now() - Duration::minutes(5))), "5m ago");
        assert_eq!(format_relative_time(&(Utc::now() - Duration::hours(3))), "3h ago");
        assert_eq!(format_relative_time(&(Utc::now() - Duration::days(2))), "2d ago");
    }

    #[test]
    fn status_text_has_symbol() {
        assert_eq!(status_text(InstanceStatus::Completed), "✓ completed");
        assert_eq!(status_text(InstanceStatus::Paused), "◐ paused");
    }
}
