//! Config command handlers

use anyhow::{bail, Context, Result};

use tasksync_core::Config;

use crate::output::{Output, OutputFormat};

const KEYS: &str = "data_dir, api_url, user_id, request_timeout_secs, max_pull_pages, \
                    retry.max_attempts, retry.backoff_base_secs, retry.backoff_max_secs";

/// Show current configuration
pub fn show(output: &Output) -> Result<()> {
    let config = Config::load().context("Failed to load configuration")?;

    match output.format {
        OutputFormat::Json => output.json(&config),
        OutputFormat::Quiet => {
            println!("{}", config.data_dir.display());
        }
        OutputFormat::Human => {
            println!("Configuration:");
            println!("  data_dir:             {}", config.data_dir.display());
            println!(
                "  api_url:              {}",
                config.api_url.as_deref().unwrap_or("(not set)")
            );
            println!(
                "  user_id:              {}",
                config.user_id.as_deref().unwrap_or("(not set)")
            );
            println!("  request_timeout_secs: {}", config.request_timeout_secs);
            println!("  max_pull_pages:       {}", config.max_pull_pages);
            println!("  retry.max_attempts:   {}", config.retry.max_attempts);
            println!("  retry.backoff_base:   {}s", config.retry.backoff_base_secs);
            println!("  retry.backoff_max:    {}s", config.retry.backoff_max_secs);
            println!();
            println!("Config file: {}", Config::config_file_path().display());
        }
    }

    Ok(())
}

/// Set a configuration value
pub fn set(key: String, value: String, output: &Output) -> Result<()> {
    let mut config = Config::load().context("Failed to load configuration")?;
    apply(&mut config, &key, &value)?;
    config.save().context("Failed to save configuration")?;

    output.success(&format!("Set {} = {}", key, value));

    Ok(())
}

fn optional(value: &str) -> Option<String> {
    if value.is_empty() || value == "none" {
        None
    } else {
        Some(value.to_string())
    }
}

fn apply(config: &mut Config, key: &str, value: &str) -> Result<()> {
    match key {
        "data_dir" => config.data_dir = value.into(),
        "api_url" => config.api_url = optional(value),
        "user_id" => config.user_id = optional(value),
        "request_timeout_secs" => {
            config.request_timeout_secs = value
                .parse()
                .context("Invalid value for request_timeout_secs. Use a number of seconds.")?;
        }
        "max_pull_pages" => {
            config.max_pull_pages = value
                .parse()
                .context("Invalid value for max_pull_pages. Use a positive number.")?;
        }
        "retry.max_attempts" => {
            config.retry.max_attempts = value
                .parse()
                .context("Invalid value for retry.max_attempts. Use 0 for unlimited.")?;
        }
        "retry.backoff_base_secs" => {
            config.retry.backoff_base_secs = value
                .parse()
                .context("Invalid value for retry.backoff_base_secs")?;
        }
        "retry.backoff_max_secs" => {
            config.retry.backoff_max_secs = value
                .parse()
                .context("Invalid value for retry.backoff_max_secs")?;
        }
        _ => {
            bail!(
                "Unknown configuration key: '{}'\n\
                 Valid keys: {}",
                key,
                KEYS
            );
        }
    }
    Ok(())
}
