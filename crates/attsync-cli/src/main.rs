//! attsync command line
//!
//! Runs reconciliations against the configured holding area. Results go to
//! stdout, logs to stderr.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{anyhow, Context};
use attsync_attachments::{join_delimited, ClaimSet, LocalStorage, ReconcileService};
use attsync_core::{AppConfig, LogFormat, LoggingConfig, ValidationMode};
use bytes::Bytes;
use clap::{Parser, Subcommand};
use tracing::{info, warn};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Parser)]
#[command(name = "attsync")]
#[command(about = "Reconcile committed attachment directories against claimed file lists")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Converge a directory onto the claimed files
    Reconcile {
        /// Directory under the storage root
        target_dir: String,
        /// Claimed file references
        claims: Vec<String>,
        /// Claims as one delimited string; output is delimited too
        #[arg(long, conflicts_with = "claims")]
        delimited: Option<String>,
        /// Only move files of this category (image, video, document, none)
        #[arg(long)]
        validate: Option<String>,
    },
    /// Copy a local file into the holding area
    Stage {
        path: PathBuf,
    },
    /// Remove a file from the holding area
    Discard {
        name: String,
    },
    /// Show the files committed to a directory
    List {
        target_dir: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    dotenvy::dotenv().ok();
    let config = AppConfig::from_env().context("invalid configuration")?;

    init_tracing(&config.logging);

    let storage = Arc::new(LocalStorage::from_config(&config.storage));
    info!(root = ?storage.root(), "Using storage root");
    let delimiter = config.reconcile.delimiter;
    let default_mode = config.reconcile.validation;
    let service = ReconcileService::new(storage, config.reconcile);

    match cli.command {
        Commands::Reconcile {
            target_dir,
            claims,
            delimited,
            validate,
        } => {
            let mode = match validate {
                Some(v) => ValidationMode::parse(&v)
                    .ok_or_else(|| anyhow!("unknown file category '{}'", v))?,
                None => default_mode,
            };
            let claim_set = match &delimited {
                Some(s) => ClaimSet::from_delimited(s, delimiter),
                None => ClaimSet::from_refs(&claims),
            };

            let report = service
                .reconcile_report(&target_dir, &claim_set, mode)
                .await?;
            if !report.is_clean() {
                warn!(
                    failed = report.failures().count(),
                    "Some operations did not complete"
                );
            }

            match delimited {
                Some(_) => println!("{}", join_delimited(&report.files, delimiter)),
                None => println!("{}", serde_json::to_string_pretty(&report.files)?),
            }
        }
        Commands::Stage { path } => {
            let data = tokio::fs::read(&path)
                .await
                .with_context(|| format!("couldn't read {}", path.display()))?;
            let original_name = path
                .file_name()
                .and_then(|n| n.to_str())
                .ok_or_else(|| anyhow!("{} has no usable file name", path.display()))?;

            let staged = service.stage(original_name, Bytes::from(data)).await?;
            println!("{}", serde_json::to_string_pretty(&staged)?);
        }
        Commands::Discard { name } => {
            service.discard(&name).await?;
        }
        Commands::List { target_dir } => {
            let files = service.committed(&target_dir).await?;
            println!("{}", serde_json::to_string_pretty(&files)?);
        }
    }

    Ok(())
}

/// Initialize structured logging on stderr
fn init_tracing(config: &LoggingConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.default_filter));
    let registry = tracing_subscriber::registry().with(filter);

    match config.format {
        LogFormat::Json => registry
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .init(),
        LogFormat::Pretty => registry
            .with(
                fmt::layer()
                    .with_target(true)
                    .with_writer(std::io::stderr),
            )
            .init(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_reconcile() {
        let cli = Cli::try_parse_from([
            "attsync",
            "reconcile",
            "entity/1",
            "a.png",
            "uploads/b.png",
            "--validate",
            "image",
        ])
        .unwrap();

        match cli.command {
            Commands::Reconcile {
                target_dir,
                claims,
                delimited,
                validate,
            } => {
                assert_eq!(target_dir, "entity/1");
                assert_eq!(claims, vec!["a.png", "uploads/b.png"]);
                assert_eq!(delimited, None);
                assert_eq!(validate.as_deref(), Some("image"));
            }
            _ => panic!("expected reconcile"),
        }
    }

    #[test]
    fn test_delimited_conflicts_with_claims() {
        let result = Cli::try_parse_from([
            "attsync",
            "reconcile",
            "entity/1",
            "a.png",
            "--delimited",
            "a.png|b.png",
        ]);
        assert!(result.is_err());
    }
}
