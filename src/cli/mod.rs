//! Operator command line.
//!
//! `replay` feeds stored webhook bodies through the same reconciliation path
//! the webhook layer uses, which is how a lost or failed delivery is repaired
//! by hand.

mod state;

pub use state::{build_service_from_env, build_service_with_pool, ReconciliationServiceType};

use crate::application::Outcome;
use crate::domain::StripeEvent;
use crate::infrastructure::AppConfig;
use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "filestore-billing", version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Apply stored provider event payloads, in the order given
    Replay(ReplayArgs),
}

#[derive(Args)]
struct ReplayArgs {
    /// JSON files, each holding one provider event envelope
    #[arg(required = true)]
    files: Vec<PathBuf>,

    /// Do not apply pending migrations before replaying
    #[arg(long)]
    skip_migrations: bool,
}

/// Entrypoint for the `filestore-billing` binary.
pub async fn run() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let config = AppConfig::from_env().context("load config")?;

    match cli.command {
        Commands::Replay(args) => replay(&config, args).await,
    }
}

async fn replay(config: &AppConfig, args: ReplayArgs) -> anyhow::Result<()> {
    let service = build_service_from_env(config, !args.skip_migrations).await?;

    for path in &args.files {
        let raw = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("read {}", path.display()))?;
        let event = StripeEvent::from_json(&raw)
            .with_context(|| format!("parse {}", path.display()))?;

        let outcome = service
            .dispatch(&event)
            .await
            .with_context(|| format!("reconcile {} ({})", event.id, event.event_type))?;

        match outcome {
            Outcome::Applied {
                user_id: Some(user_id),
            } => {
                let state = service
                    .billing_record(&user_id)
                    .await?
                    .map(|record| format!("{:?}", record.state()))
                    .unwrap_or_else(|| "NoRecord".to_string());
                println!("{}\t{}\t{}", event.id, user_id, state);
            }
            Outcome::Applied { user_id: None } => println!("{}\t-\tApplied", event.id),
            Outcome::Ignored => println!("{}\t-\tIgnored", event.id),
        }
    }

    info!(count = args.files.len(), "Replay finished");
    Ok(())
}
