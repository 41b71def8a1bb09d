//! Task execution commands: `hitl run`, `hitl resume` and `hitl rerun`.

use anyhow::{Context, Result};
use serde_json::{Map, json};
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use tracing::warn;
use uuid::Uuid;

use hitl_control::orchestrator::{Driver, DriverOutcome, WaitPolicy};
use hitl_control::runtime::{self, Runtime};

fn request_digest(text: &str) -> String {
    format!("{:x}", Sha256::digest(text.as_bytes()))
}

fn generate_task_id() -> String {
    let id = Uuid::new_v4().simple().to_string();
    format!("task-{}", &id[..8])
}

fn read_request(path: &Path) -> Result<String> {
    std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read request document: {}", path.display()))
}

fn driver_for(runtime: &Runtime, wait: bool) -> Driver {
    if wait {
        runtime.driver_with(WaitPolicy::Poll {
            interval: runtime.config.poll_interval(),
            timeout: runtime.config.poll_timeout(),
        })
    } else {
        runtime.driver()
    }
}

pub async fn cmd_run(task: Option<&str>, request: &Path, wait: bool) -> Result<()> {
    let runtime = runtime::global()?;
    let request_path = std::path::absolute(request)
        .with_context(|| format!("Failed to resolve {}", request.display()))?;
    let request_text = read_request(&request_path)?;
    let task_id = task.map(str::to_string).unwrap_or_else(generate_task_id);

    let driver = driver_for(&runtime, wait);
    let phases: Vec<_> = driver.pipeline().iter().map(|p| p.name.clone()).collect();
    let mut metadata = Map::new();
    metadata.insert("requestDigest".into(), json!(request_digest(&request_text)));
    metadata.insert("pipeline".into(), json!(phases));

    println!();
    println!(
        "{} {} ({})",
        console::style("Running task").bold(),
        console::style(&task_id).cyan(),
        phases.join(" → ")
    );

    let outcome = driver
        .run(
            &task_id,
            &request_path.display().to_string(),
            &request_text,
            metadata,
        )
        .await?;
    report_outcome(&task_id, &outcome)
}

pub async fn cmd_resume(task: &str, request: Option<&Path>, wait: bool) -> Result<()> {
    let runtime = runtime::global()?;
    let session = runtime.store.require(task)?;

    let request_path = match request {
        Some(path) => path.to_path_buf(),
        None => PathBuf::from(&session.request_ref),
    };
    let request_text = read_request(&request_path)?;
    if let Some(recorded) = session.metadata.get("requestDigest").and_then(|v| v.as_str()) {
        if recorded != request_digest(&request_text) {
            warn!(task, path = %request_path.display(), "request document changed since the task started");
        }
    }

    let outcome = driver_for(&runtime, wait).resume(task, &request_text).await?;
    report_outcome(task, &outcome)
}

pub async fn cmd_rerun(
    task: &str,
    from: Option<&str>,
    request: Option<&Path>,
    wait: bool,
) -> Result<()> {
    let runtime = runtime::global()?;
    let session = runtime.store.require(task)?;
    let request_path = match request {
        Some(path) => path.to_path_buf(),
        None => PathBuf::from(&session.request_ref),
    };
    let request_text = read_request(&request_path)?;

    let outcome = driver_for(&runtime, wait)
        .rerun(task, from, &request_text)
        .await?;
    report_outcome(task, &outcome)
}

fn report_outcome(task_id: &str, outcome: &DriverOutcome) -> Result<()> {
    println!();
    match outcome {
        DriverOutcome::Completed => {
            println!(
                "{} Task {} completed",
                console::style("✓").green().bold(),
                task_id
            );
        }
        DriverOutcome::Paused { checkpoint } => {
            println!(
                "{} Task {} is waiting for review at {}",
                console::style("⏸").yellow().bold(),
                task_id,
                console::style(checkpoint).yellow()
            );
            println!();
            println!("  Approve:  hitl approve {} [--comment <text>]", task_id);
            println!("  Reject:   hitl reject {} --reason <text>", task_id);
            println!("  Then:     hitl resume {}", task_id);
        }
        DriverOutcome::Rejected { reason } => {
            println!(
                "{} Task {} was rejected: {}",
                console::style("✗").red().bold(),
                task_id,
                reason
            );
        }
        DriverOutcome::InterventionRequired { reruns } => {
            println!(
                "{} Task {} needs a person after {} reruns",
                console::style("!").magenta().bold(),
                task_id,
                reruns
            );
            println!("  Give up with: hitl abandon {} --reason <text>", task_id);
        }
        DriverOutcome::AlreadyRunning => {
            println!("Task {} is already running; nothing to resume.", task_id);
        }
        DriverOutcome::Failed { error } => {
            anyhow::bail!("Task {} failed: {}", task_id, error);
        }
    }
    println!();
    Ok(())
}
