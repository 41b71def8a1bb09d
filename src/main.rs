use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;
use tracing::warn;

use hitl_control::config::HitlConfig;
use hitl_control::runtime::{self, Runtime};
use hitl_control::session::HitlDecision;

mod cmd;

#[derive(Parser)]
#[command(name = "hitl")]
#[command(version, about = "Drive model-backed task pipelines through human approval checkpoints")]
pub struct Cli {
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[arg(long, global = true)]
    pub project_dir: Option<PathBuf>,

    /// Diagnostic log format on stderr and in the log file
    #[arg(long, value_enum, default_value = "text", global = true)]
    pub log_format: LogFormat,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum LogFormat {
    Text,
    Json,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum DecisionArg {
    /// Accept the checkpoint as an exception to the rules
    ExceptionApproval,
    /// Ask an administrator to change the rule that blocked the task
    RuleOverride,
    /// Send the paused phase back for rework
    Reject,
}

impl From<DecisionArg> for HitlDecision {
    fn from(arg: DecisionArg) -> Self {
        match arg {
            DecisionArg::ExceptionApproval => HitlDecision::ExceptionApproval,
            DecisionArg::RuleOverride => HitlDecision::RuleOverride,
            DecisionArg::Reject => HitlDecision::Reject,
        }
    }
}

#[derive(Subcommand)]
pub enum Commands {
    /// Create .hitl/ and a default hitl.toml
    Init {
        /// Overwrite an existing hitl.toml
        #[arg(long)]
        force: bool,
    },
    /// Start a task and drive it until it completes or pauses
    Run {
        /// Task id (generated when omitted)
        task: Option<String>,

        /// Path to the request document
        #[arg(short, long)]
        request: PathBuf,

        /// Wait for reviewer decisions instead of exiting at a checkpoint
        #[arg(long)]
        wait: bool,
    },
    /// Continue an approved task
    Resume {
        task: String,

        /// Request document (defaults to the one the task was started with)
        #[arg(short, long)]
        request: Option<PathBuf>,

        /// Wait for reviewer decisions instead of exiting at a checkpoint
        #[arg(long)]
        wait: bool,
    },
    /// Run a paused task's pipeline again, within its rerun budget
    Rerun {
        task: String,

        /// Phase to restart from (defaults to the phase that paused)
        #[arg(long)]
        from: Option<String>,

        /// Request document (defaults to the one the task was started with)
        #[arg(short, long)]
        request: Option<PathBuf>,

        /// Wait for reviewer decisions instead of exiting at a checkpoint
        #[arg(long)]
        wait: bool,
    },
    /// Show one task's session
    Status { task: String },
    /// List tasks waiting for a reviewer
    Pending {
        #[arg(long)]
        json: bool,
    },
    /// Approve a task's pending checkpoint
    Approve {
        task: String,
        #[arg(short, long)]
        comment: Option<String>,
    },
    /// Reject a task's pending checkpoint
    Reject {
        task: String,
        #[arg(short, long)]
        reason: String,
    },
    /// Record a reviewer decision on a task's pending checkpoint
    Decide {
        task: String,

        #[arg(value_enum)]
        decision: DecisionArg,

        /// Required for reject
        #[arg(short, long)]
        comment: Option<String>,

        /// Proposed rule change, as JSON
        #[arg(long)]
        rule_override: Option<String>,
    },
    /// Save free-form reviewer feedback for a task
    Feedback { task: String, feedback: String },
    /// Mark a task that needs a person as failed
    Abandon {
        task: String,
        #[arg(short, long)]
        reason: String,
    },
    /// Walk through pending reviews interactively
    Review,
    /// Show a task's session history
    History {
        task: String,
        #[arg(long)]
        json: bool,
    },
    /// Serve the reviewer HTTP API
    Serve {
        #[arg(short, long, default_value = "7420")]
        port: u16,

        #[arg(long, default_value = "127.0.0.1")]
        host: String,

        /// Allow cross-origin requests
        #[arg(long)]
        cors: bool,
    },
    /// Check whether an artifact path (and optionally its content) may be written
    CheckPath {
        path: String,

        /// File whose content is scanned for secrets
        #[arg(long)]
        content: Option<PathBuf>,
    },
    /// View or validate configuration
    Config {
        #[command(subcommand)]
        command: Option<ConfigCommands>,
    },
}

#[derive(Subcommand, Clone)]
pub enum ConfigCommands {
    /// Show the effective configuration
    Show,
    /// Validate configuration and show any warnings
    Validate,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let project_dir = match cli.project_dir.clone() {
        Some(dir) => dir,
        None => std::env::current_dir().context("Failed to get current directory")?,
    };

    if let Commands::Init { force } = &cli.command {
        return cmd::cmd_init(&project_dir, *force);
    }

    let config = HitlConfig::load(&project_dir)
        .context("Failed to load configuration")?
        .with_verbose(cli.verbose);
    let _log_guard = hitl_control::logging::init_logging(
        cli.verbose,
        &config.toml.logging,
        cli.log_format == LogFormat::Json,
        &project_dir,
    )?;
    for warning in config.validate() {
        warn!("{}", warning);
    }
    runtime::install(Runtime::build(config)?);

    match &cli.command {
        Commands::Init { .. } => {}
        Commands::Run {
            task,
            request,
            wait,
        } => cmd::cmd_run(task.as_deref(), request, *wait).await?,
        Commands::Resume {
            task,
            request,
            wait,
        } => cmd::cmd_resume(task, request.as_deref(), *wait).await?,
        Commands::Rerun {
            task,
            from,
            request,
            wait,
        } => cmd::cmd_rerun(task, from.as_deref(), request.as_deref(), *wait).await?,
        Commands::Status { task } => cmd::cmd_status(task)?,
        Commands::Pending { json } => cmd::cmd_pending(*json)?,
        Commands::Approve { task, comment } => cmd::cmd_approve(task, comment.as_deref())?,
        Commands::Reject { task, reason } => cmd::cmd_reject(task, reason)?,
        Commands::Decide {
            task,
            decision,
            comment,
            rule_override,
        } => cmd::cmd_decide(
            task,
            (*decision).into(),
            comment.as_deref(),
            rule_override.as_deref(),
        )?,
        Commands::Feedback { task, feedback } => cmd::cmd_feedback(task, feedback)?,
        Commands::Abandon { task, reason } => cmd::cmd_abandon(task, reason)?,
        Commands::Review => cmd::cmd_review().await?,
        Commands::History { task, json } => cmd::cmd_history(task, *json)?,
        Commands::Serve { port, host, cors } => cmd::cmd_serve(*port, host, *cors).await?,
        Commands::CheckPath { path, content } => cmd::cmd_check_path(path, content.as_deref())?,
        Commands::Config { command } => cmd::cmd_config(command.clone())?,
    }

    Ok(())
}
