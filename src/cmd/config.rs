//! Configuration view and validation commands: `hitl config`.

use anyhow::{Context, Result};

use super::super::ConfigCommands;
use hitl_control::runtime;

pub fn cmd_config(command: Option<ConfigCommands>) -> Result<()> {
    let runtime = runtime::global()?;
    let config = &runtime.config;
    let config_path = config.config_file();

    match command {
        None | Some(ConfigCommands::Show) => {
            println!();
            if config_path.exists() {
                println!("Config file: {}", config_path.display());
            } else {
                println!("Config file: {} (not found, using defaults)", config_path.display());
            }
            println!("Effective configuration (file + environment):");
            println!();
            let rendered =
                toml::to_string_pretty(&config.toml).context("Failed to render configuration")?;
            println!("{}", rendered);

            let providers = config.provider_configs();
            println!("Provider keys:");
            for name in &config.toml.providers.order {
                let has_key = providers
                    .get(name)
                    .and_then(|p| p.api_key.as_deref())
                    .is_some_and(|k| !k.is_empty());
                let marker = if has_key {
                    console::style("set").green()
                } else {
                    console::style("missing").red()
                };
                println!("  {:<10} {}", name, marker);
            }
            println!();
        }
        Some(ConfigCommands::Validate) => {
            let warnings = config.validate();
            if warnings.is_empty() {
                println!("{} Configuration is valid", console::style("✓").green().bold());
            } else {
                println!("Configuration warnings:");
                for warning in &warnings {
                    println!("  {} {}", console::style("⚠").yellow(), warning);
                }
            }
        }
    }
    Ok(())
}
