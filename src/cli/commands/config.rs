//! Config command - show or initialize configuration

use crate::cli::args::{ConfigAction, ConfigArgs};
use crate::config::{Config, ConfigManager};
use crate::error::KilnResult;
use console::style;

/// Execute the config command
pub fn execute(args: ConfigArgs, manager: &ConfigManager, config: &Config) -> KilnResult<()> {
    match args.action {
        ConfigAction::Show => show_config(config),
        ConfigAction::Path => {
            println!("{}", manager.config_path().display());
            Ok(())
        }
        ConfigAction::Init { force } => init_config(manager, force),
    }
}

fn show_config(config: &Config) -> KilnResult<()> {
    let toml =
        toml::to_string_pretty(config).unwrap_or_else(|_| "Error serializing config".to_string());
    println!("{}", toml);
    Ok(())
}

fn init_config(manager: &ConfigManager, force: bool) -> KilnResult<()> {
    let path = manager.config_path();

    if path.exists() && !force {
        println!(
            "{} config already exists at {} (use --force to overwrite)",
            style("note:").yellow(),
            path.display()
        );
        return Ok(());
    }

    manager.save(&Config::default())?;
    println!(
        "{} configuration written to {}",
        style("Initialized").green().bold(),
        path.display()
    );
    Ok(())
}
