//! Session inspection commands: `hitl status`, `hitl history` and
//! `hitl abandon`.

use anyhow::Result;
use tracing::info;

use hitl_control::runtime;
use hitl_control::session::SessionStatus;

fn styled_status(status: SessionStatus) -> console::StyledObject<&'static str> {
    let label = console::style(status.as_str());
    match status {
        SessionStatus::Completed | SessionStatus::Approved => label.green(),
        SessionStatus::PausedHitl => label.yellow(),
        SessionStatus::UserInterventionRequired => label.magenta(),
        SessionStatus::Rejected | SessionStatus::Failed => label.red(),
        SessionStatus::Created | SessionStatus::Running => label.cyan(),
    }
}

pub fn cmd_status(task: &str) -> Result<()> {
    let runtime = runtime::global()?;
    let session = runtime.store.require(task)?;

    println!();
    println!("Task:       {}", session.task_id);
    println!("Status:     {}", styled_status(session.status));
    println!(
        "Phase:      {}",
        session.current_phase.as_deref().unwrap_or("-")
    );
    if let Some(checkpoint) = session.current_checkpoint {
        println!("Checkpoint: {}", checkpoint);
    }
    if session.rerun_count > 0 {
        println!("Reruns:     {}/{}", session.rerun_count, session.max_reruns);
    }
    println!("Request:    {}", session.request_ref);
    println!("Created:    {}", session.created_at.format("%Y-%m-%d %H:%M:%S UTC"));
    println!("Updated:    {}", session.updated_at.format("%Y-%m-%d %H:%M:%S UTC"));

    if let Some(ctx) = &session.hitl_context {
        println!();
        println!("{}", console::style("Review").bold());
        println!("  {}", ctx.message.replace('\n', "\n  "));
        for artifact in &ctx.artifacts {
            println!("  - {}", artifact);
        }
        if let Some(decision) = ctx.decision {
            println!("  Decision: {}", decision);
        }
        if ctx.is_exception {
            println!("  {}", console::style("Approved as an exception").yellow());
        }
        if let Some(comment) = &ctx.approver_comment {
            println!("  Approved with comment: {}", comment);
        }
        if let Some(request) = &ctx.rule_override_request {
            println!("  Rule override requested: {}", request.comment);
            println!("    {}", console::style(&request.proposed_change).dim());
        }
        if let Some(reason) = &ctx.rejection_reason {
            println!("  Rejected: {}", console::style(reason).red());
        }
        if let Some(phase) = &ctx.rerun_phase {
            println!("  Rework from: {}", phase);
        }
    }
    println!();
    Ok(())
}

pub fn cmd_history(task: &str, json: bool) -> Result<()> {
    let runtime = runtime::global()?;
    let session = runtime.store.require(task)?;

    if json {
        println!("{}", serde_json::to_string_pretty(session.history())?);
        return Ok(());
    }

    println!();
    println!("History for {}", session.task_id);
    println!();
    for entry in session.history() {
        let detail = if entry.detail.is_null() {
            String::new()
        } else {
            entry.detail.to_string()
        };
        let event = serde_json::to_value(entry.event)?;
        println!(
            "{}  {:<18} {}",
            entry.timestamp.format("%Y-%m-%d %H:%M:%S"),
            event.as_str().unwrap_or_default(),
            console::style(detail).dim()
        );
    }
    println!();
    Ok(())
}

/// Mark a task that needs a person as failed, ending its lifecycle.
pub fn cmd_abandon(task: &str, reason: &str) -> Result<()> {
    let runtime = runtime::global()?;
    let session = runtime.store.fail(task, reason)?;
    info!(task, from = %session.status, "task abandoned");
    println!(
        "{} Task {} marked {}",
        console::style("✗").red().bold(),
        task,
        styled_status(session.status)
    );
    Ok(())
}
