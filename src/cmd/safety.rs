//! Output gate check: `hitl check-path`.

use anyhow::{Context, Result};
use std::path::Path;

use hitl_control::runtime;

pub fn cmd_check_path(path: &str, content_file: Option<&Path>) -> Result<()> {
    let runtime = runtime::global()?;
    let gate = &runtime.gate;
    if !gate.is_active() {
        println!("Output gate is disabled; every path is allowed.");
        return Ok(());
    }

    let content = match content_file {
        Some(file) => std::fs::read_to_string(file)
            .with_context(|| format!("Failed to read {}", file.display()))?,
        None => String::new(),
    };
    let check = gate.validate_file_write(path, &content);

    for finding in &check.content_violations {
        println!(
            "  {} {} x{} (would be masked)",
            console::style("secret").yellow(),
            finding.kind,
            finding.count
        );
    }

    if check.allowed {
        println!("{} {} is allowed", console::style("✓").green().bold(), path);
        Ok(())
    } else {
        for violation in &check.path_violations {
            println!("  {} {}", console::style("-").red(), violation);
        }
        anyhow::bail!("Path '{}' is not allowed", path)
    }
}
