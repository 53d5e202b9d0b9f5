//! CLI parsing and command execution
//!
//! This module handles command-line argument parsing and routes commands to the appropriate handlers.

use anyhow::{Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use tracing::info;

use crate::config::{resolve_config_path, Config, FileConfigStore, DEFAULT_CONFIG_FILE};
use crate::destinations::GithubSecrets;
use crate::providers::IamProviderFactory;
use crate::rotation::{self, KeySetOutcome, RotationOptions};

#[derive(Parser)]
#[command(name = "aws-key-rotator")]
#[command(about = "Rotate AWS IAM access keys into GitHub Actions secrets", long_about = None)]
#[command(version)]
pub struct Cli {
    /// Relative or absolute path to the YAML file with the rotation settings
    #[arg(short, long = "config-file", env = "ROTATE_CONFIG", default_value = DEFAULT_CONFIG_FILE)]
    pub config_file: PathBuf,

    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Rotate every key set whose access key is older than its maximum age (default)
    Rotate {
        /// Dry run - only show what would be rotated
        #[arg(long)]
        dry_run: bool,
    },

    /// Write a sample configuration file
    Init {
        /// Output path for the configuration file
        #[arg(short, long, default_value = DEFAULT_CONFIG_FILE)]
        output: PathBuf,

        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },

    /// Show the age of each key set's access key without changing anything
    Check,
}

/// Execute a CLI command
pub async fn execute(cli: Cli) -> Result<()> {
    let cwd = std::env::current_dir().context("Failed to determine working directory")?;

    match cli.command.unwrap_or(Commands::Rotate { dry_run: false }) {
        Commands::Init { output, force } => {
            let output = resolve_config_path(&output, &cwd);
            if output.exists() && !force {
                anyhow::bail!(
                    "{} already exists, pass --force to overwrite it",
                    output.display()
                );
            }
            Config::create_sample(&output)
                .with_context(|| format!("Failed to create sample config at {:?}", output))?;
            info!("Sample configuration created at {:?}", output);
            println!("Edit {} before running a rotation", output.display());
        }

        Commands::Check => {
            let config_path = resolve_config_path(&cli.config_file, &cwd);
            let Some(config) = load_config(&config_path)? else {
                return Ok(());
            };
            check(&config).await;
        }

        Commands::Rotate { dry_run } => {
            let config_path = resolve_config_path(&cli.config_file, &cwd);
            let Some(config) = load_config(&config_path)? else {
                return Ok(());
            };
            rotate(config, &config_path, dry_run).await?;
        }
    }

    Ok(())
}

/// Load and validate the config. A missing file prints the sample instead.
fn load_config(path: &Path) -> Result<Option<Config>> {
    if !path.exists() {
        print!("{}", missing_config_help()?);
        return Ok(None);
    }

    let config = Config::from_file(path)
        .with_context(|| format!("Failed to load config from {:?}", path))?;
    config.validate()?;

    Ok(Some(config))
}

/// Sample YAML followed by the hint shown when no config file exists
fn missing_config_help() -> Result<String> {
    Ok(format!(
        "{}\n\nCreate a configuration like the one above.\n",
        Config::sample().to_yaml()?
    ))
}

async fn rotate(mut config: Config, config_path: &Path, dry_run: bool) -> Result<()> {
    let github = GithubSecrets::new(&config.github).context("Failed to create GitHub client")?;
    let config_store = FileConfigStore::new(config_path);
    let options = RotationOptions {
        dry_run,
        now: Utc::now(),
    };

    let report = rotation::rotate_all(
        &mut config,
        &IamProviderFactory,
        &github,
        &config_store,
        options,
    )
    .await;

    for entry in &report.key_sets {
        match &entry.outcome {
            Ok(KeySetOutcome::Skipped { access_key_id, age }) => {
                println!(
                    "- {}: {} is {} day(s) old, not due",
                    entry.name,
                    access_key_id,
                    age.num_days()
                );
            }
            Ok(KeySetOutcome::WouldRotate { access_key_id, age }) => {
                println!(
                    "[DRY RUN] {}: would rotate {} ({} day(s) old)",
                    entry.name,
                    access_key_id,
                    age.num_days()
                );
            }
            Ok(KeySetOutcome::Rotated {
                old_access_key_id,
                new_access_key_id,
                destinations,
            }) => {
                println!(
                    "✓ {}: {} -> {} ({} secret(s) updated)",
                    entry.name, old_access_key_id, new_access_key_id, destinations
                );
            }
            Err(e) => {
                eprintln!("✗ {}: {:#}", entry.name, e);
            }
        }
    }

    if report.has_failures() {
        let failed = report.key_sets.iter().filter(|r| r.outcome.is_err()).count();
        anyhow::bail!("{} key set(s) failed to rotate", failed);
    }

    if !dry_run {
        println!("\nRotation complete! {} key(s) rotated", report.rotated());
    }

    Ok(())
}

async fn check(config: &Config) {
    let statuses = rotation::inspect(config, &IamProviderFactory, Utc::now()).await;

    for (name, status) in statuses {
        match status {
            Ok(status) => {
                println!(
                    "{} (user {}, max age {} day(s)){}",
                    name,
                    status.user,
                    status.max_age.num_days(),
                    if status.due { " - due for rotation" } else { "" }
                );
                if status.keys.len() != 1 {
                    println!(
                        "  ⚠️  {} access keys found, rotation will bail until exactly one remains",
                        status.keys.len()
                    );
                }
                for key in status.keys {
                    println!(
                        "  - {} created {} ({} day(s) old)",
                        key.access_key_id,
                        key.created_at.to_rfc3339(),
                        (Utc::now() - key.created_at).num_days()
                    );
                }
            }
            Err(e) => {
                eprintln!("✗ {}: {:#}", name, e);
            }
        }
    }
}
