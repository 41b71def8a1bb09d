//! Reviewer commands: `hitl pending`, `approve`, `reject`, `decide`,
//! `feedback` and `review`.

use anyhow::{Context, Result};
use dialoguer::{Confirm, Input, Select, theme::ColorfulTheme};

use hitl_control::runtime;
use hitl_control::session::{HitlDecision, PendingRequest, SessionStatus};
use hitl_control::util::truncate;

fn format_wait(secs: i64) -> String {
    match secs {
        s if s < 60 => format!("{}s", s.max(0)),
        s if s < 3600 => format!("{}m", s / 60),
        s if s < 86_400 => format!("{}h{:02}m", s / 3600, (s % 3600) / 60),
        s => format!("{}d{}h", s / 86_400, (s % 86_400) / 3600),
    }
}

fn first_line(message: &str) -> &str {
    message.lines().next().unwrap_or_default()
}

pub fn cmd_pending(json: bool) -> Result<()> {
    let runtime = runtime::global()?;
    let pending = runtime.store.pending_requests()?;

    if json {
        println!("{}", serde_json::to_string_pretty(&pending)?);
        return Ok(());
    }
    if pending.is_empty() {
        println!("No tasks are waiting for review.");
        return Ok(());
    }

    println!();
    println!(
        "{:<24} {:<16} {:<14} {:<8} Message",
        "Task", "Checkpoint", "Phase", "Waiting"
    );
    println!(
        "{:<24} {:<16} {:<14} {:<8} -------",
        "------------------------", "----------------", "--------------", "--------"
    );
    for request in &pending {
        println!(
            "{:<24} {:<16} {:<14} {:<8} {}",
            request.task_id,
            request.checkpoint.as_str(),
            request.phase.as_deref().unwrap_or("-"),
            format_wait(request.waiting_secs),
            truncate(first_line(&request.message), 60)
        );
    }
    println!();
    Ok(())
}

pub fn cmd_approve(task: &str, comment: Option<&str>) -> Result<()> {
    let runtime = runtime::global()?;
    let session = runtime.store.approve(task, comment)?;
    let checkpoint = session
        .hitl_context
        .as_ref()
        .map(|ctx| ctx.checkpoint.to_string())
        .unwrap_or_default();
    println!(
        "{} Approved {} at {}",
        console::style("✓").green().bold(),
        task,
        checkpoint
    );
    println!("  Continue with: hitl resume {}", task);
    Ok(())
}

pub fn cmd_reject(task: &str, reason: &str) -> Result<()> {
    let runtime = runtime::global()?;
    runtime.store.reject(task, reason)?;
    println!(
        "{} Rejected {}: {}",
        console::style("✗").red().bold(),
        task,
        reason
    );
    Ok(())
}

/// Record an exception approval, a rule-override request, or a rejection
/// for rework.
pub fn cmd_decide(
    task: &str,
    decision: HitlDecision,
    comment: Option<&str>,
    rule_override: Option<&str>,
) -> Result<()> {
    let runtime = runtime::global()?;
    let proposed = rule_override
        .map(serde_json::from_str::<serde_json::Value>)
        .transpose()
        .context("--rule-override must be a JSON value")?;
    let session = runtime
        .store
        .decide(task, decision, comment.unwrap_or_default(), proposed)?;

    println!(
        "{} {} recorded for {}",
        console::style("✓").green().bold(),
        decision,
        task
    );
    match session.status {
        SessionStatus::Approved => println!("  Continue with: hitl resume {}", task),
        SessionStatus::UserInterventionRequired => {
            println!("  Waiting on an administrator. Then: hitl rerun {}", task);
        }
        _ => {
            let phase = session
                .hitl_context
                .as_ref()
                .and_then(|ctx| ctx.rerun_phase.as_deref())
                .unwrap_or("-");
            println!("  Rework from {}. Start over with: hitl run {}", phase, task);
        }
    }
    Ok(())
}

pub fn cmd_feedback(task: &str, feedback: &str) -> Result<()> {
    let runtime = runtime::global()?;
    let record = runtime.store.save_feedback(task, feedback)?;
    println!(
        "{} Feedback saved to {}",
        console::style("✓").green().bold(),
        record.path.display()
    );
    Ok(())
}

fn print_request(request: &PendingRequest) {
    println!();
    println!(
        "{} {} at {} ({}, waiting {})",
        console::style("Review").bold().cyan(),
        request.task_id,
        request.checkpoint,
        request.phase.as_deref().unwrap_or("-"),
        format_wait(request.waiting_secs)
    );
    println!();
    println!("  {}", request.message.replace('\n', "\n  "));
    if !request.artifacts.is_empty() {
        println!();
        println!("  Artifacts:");
        for artifact in &request.artifacts {
            println!("    - {}", artifact);
        }
    }
    println!();
}

pub async fn cmd_review() -> Result<()> {
    let runtime = runtime::global()?;
    let theme = ColorfulTheme::default();

    loop {
        let pending = runtime.store.pending_requests()?;
        if pending.is_empty() {
            println!("No tasks are waiting for review.");
            return Ok(());
        }

        let mut items: Vec<String> = pending
            .iter()
            .map(|r| {
                format!(
                    "{}  {}  ({}, waiting {})",
                    r.task_id,
                    r.checkpoint,
                    r.phase.as_deref().unwrap_or("-"),
                    format_wait(r.waiting_secs)
                )
            })
            .collect();
        items.push("Done".to_string());

        let selection = Select::with_theme(&theme)
            .with_prompt("Select a task to review")
            .items(&items)
            .default(0)
            .interact()?;
        let Some(request) = pending.get(selection) else {
            return Ok(());
        };
        print_request(request);

        let actions = &["Approve", "Approve with comment", "Reject", "Skip"];
        let action = Select::with_theme(&theme)
            .with_prompt("Decision")
            .items(actions)
            .default(0)
            .interact()?;

        match action {
            0 | 1 => {
                let comment: Option<String> = if action == 1 {
                    Some(Input::<String>::with_theme(&theme).with_prompt("Comment").interact_text()?)
                } else {
                    None
                };
                cmd_approve(&request.task_id, comment.as_deref())?;
                let resume_now = Confirm::with_theme(&theme)
                    .with_prompt(format!("Resume {} now?", request.task_id))
                    .default(false)
                    .interact()?;
                if resume_now {
                    super::cmd_resume(&request.task_id, None, false).await?;
                }
            }
            2 => {
                let reason = Input::<String>::with_theme(&theme)
                    .with_prompt("Reason")
                    .validate_with(|input: &String| {
                        if input.trim().is_empty() {
                            Err("A reason is required")
                        } else {
                            Ok(())
                        }
                    })
                    .interact_text()?;
                cmd_reject(&request.task_id, &reason)?;
            }
            _ => println!("Skipped {}", request.task_id),
        }
    }
}
