//! Configuration management commands.

use std::path::Path;

use conduit_core::config::IssueSeverity;
use conduit_core::error::format_error_with_suggestion;
use conduit_core::Config;

use crate::ConfigAction;

pub fn handle(action: ConfigAction, config: Config, path: Option<&Path>) -> anyhow::Result<()> {
    match action {
        ConfigAction::Show => {
            let rendered = config
                .to_toml()
                .map_err(|e| anyhow::anyhow!(format_error_with_suggestion(&e)))?;
            println!("{}", rendered);
        }
        ConfigAction::Validate => {
            match path {
                Some(path) => println!("Validating {}\n", path.display()),
                None => println!("Validating configuration\n"),
            }

            let result = config.validate();
            if result.issues.is_empty() {
                println!("  ✓ No issues found");
                return Ok(());
            }
            for issue in &result.issues {
                let marker = match issue.severity {
                    IssueSeverity::Error => "✗ error",
                    IssueSeverity::Warning => "! warning",
                };
                println!("  {} {}: {}", marker, issue.field, issue.message);
            }
            if !result.is_ok() {
                anyhow::bail!("{} configuration error(s)", result.errors().len());
            }
        }
        ConfigAction::Path => {
            println!("{}", Config::config_dir().join("config.toml").display());
        }
    }
    Ok(())
}
