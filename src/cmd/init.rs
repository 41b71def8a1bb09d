//! Project initialization: `hitl init`.

use anyhow::Result;
use std::path::Path;

use hitl_control::config::{HitlConfig, HitlToml};

pub fn cmd_init(project_dir: &Path, force: bool) -> Result<()> {
    let config = HitlConfig::from_parts(project_dir.to_path_buf(), HitlToml::default());
    let created = config.ensure_directories()?;
    let config_file = config.config_file();

    if config_file.exists() && !force {
        println!(
            "Already initialized: {} (use --force to overwrite)",
            config_file.display()
        );
        return Ok(());
    }

    HitlToml::default().save(&config_file)?;
    if created {
        println!("Initialized HITL project in {}", config.hitl_dir.display());
    } else {
        println!("Wrote default configuration to {}", config_file.display());
    }
    println!();
    println!("Next steps:");
    println!("  1. Set ANTHROPIC_API_KEY, OPENAI_API_KEY or GEMINI_API_KEY (or add them to .env)");
    println!("  2. hitl run <task> --request <request.md>");
    Ok(())
}
