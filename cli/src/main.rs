use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use serde::Serialize;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

use kmigrate_kernel::apply::{preview, ApplyOptions, Orchestrator};
use kmigrate_kernel::config::EngineConfig;
use kmigrate_kernel::driver::CommandDriver;
use kmigrate_kernel::ledger::LedgerBackend;
use kmigrate_kernel::migration::{ResourceKey, ResourceType};
use kmigrate_kernel::replay::KeyHistory;
use kmigrate_kernel::source::{DescriptorSource, DirectorySource};

/// Exit status after Ctrl-C, as a shell reports it.
const INTERRUPTED: u8 = 130;

/// Kafka resource migrations
#[derive(Parser, Debug)]
#[command(name = "kmigrate")]
#[command(about = "Versioned migrations for Kafka topics, ACLs and schemas", long_about = None)]
struct Cli {
    /// Path to engine config JSON
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    domain: Domain,
}

#[derive(Subcommand, Debug)]
enum Domain {
    /// Topic migrations
    Topics(DomainArgs),
    /// ACL migrations
    Acls(DomainArgs),
    /// Schema migrations
    Schemas(DomainArgs),
}

impl Domain {
    fn split(self) -> (ResourceType, Action) {
        match self {
            Domain::Topics(args) => (ResourceType::Topic, args.action),
            Domain::Acls(args) => (ResourceType::Acl, args.action),
            Domain::Schemas(args) => (ResourceType::Schema, args.action),
        }
    }
}

#[derive(Args, Debug)]
struct DomainArgs {
    #[command(subcommand)]
    action: Action,
}

#[derive(Subcommand, Debug)]
enum Action {
    /// Apply every pending migration found in DIR
    Apply {
        dir: PathBuf,

        /// Program invoked as `<driver> [args..] <TYPE> <name>` with the
        /// operation JSON on stdin
        #[arg(long)]
        driver: PathBuf,

        /// Extra leading argument for the driver (repeatable)
        #[arg(long = "driver-arg", allow_hyphen_values = true)]
        driver_args: Vec<String>,
    },

    /// Show what `apply` would do, without applying anything
    Plan { dir: PathBuf },

    /// Print the recorded history of one resource
    History { name: String },
}

#[derive(Debug, Serialize)]
struct HistoryOutput {
    key: ResourceKey,
    #[serde(flatten)]
    history: KeyHistory,
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("kmigrate=info,kmigrate_kernel=info"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn print_json(value: &impl Serialize) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

async fn execute(cli: Cli) -> Result<ExitCode> {
    // ----------------------------
    // Load config
    // ----------------------------
    let config = match &cli.config {
        Some(path) => EngineConfig::load(path)?,
        None => EngineConfig::default_config(),
    };

    let ledger: Arc<dyn LedgerBackend> = config.open_ledger().context("cannot open ledger")?;
    let (domain, action) = cli.domain.split();

    match action {
        Action::Apply {
            dir,
            driver,
            driver_args,
        } => {
            let groups = DirectorySource::new(&dir).load(domain)?;
            let run_id = Uuid::new_v4();
            let driver = CommandDriver::new(driver).with_args(driver_args);
            let orchestrator = Orchestrator::new(
                ledger,
                Arc::new(driver),
                ApplyOptions::from_config(&config, run_id),
            )
            .with_run_id(run_id);

            let report = orchestrator.run(&groups).await?;
            print_json(&report)?;

            Ok(if report.is_success() {
                ExitCode::SUCCESS
            } else {
                ExitCode::FAILURE
            })
        }

        Action::Plan { dir } => {
            let groups = DirectorySource::new(&dir).load(domain)?;
            let previews = preview(ledger.as_ref(), &groups, config.ledger_timeout()).await?;
            print_json(&previews)?;
            Ok(ExitCode::SUCCESS)
        }

        Action::History { name } => {
            let key = ResourceKey::new(domain, name);
            let history = tokio::time::timeout(config.ledger_timeout(), ledger.history(&key))
                .await
                .context("ledger timed out")??;

            print_json(&HistoryOutput { key, history })?;
            Ok(ExitCode::SUCCESS)
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    init_tracing();
    let cli = Cli::parse();

    tokio::select! {
        result = execute(cli) => match result {
            Ok(code) => code,
            Err(err) => {
                error!("{err:#}");
                ExitCode::FAILURE
            }
        },
        _ = tokio::signal::ctrl_c() => {
            info!("interrupted; commits made so far stand");
            ExitCode::from(INTERRUPTED)
        }
    }
}
