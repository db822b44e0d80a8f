use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use scaleio_config::Config;
use scaleio_executor::{LocalCoordinator, NodeLifecycle, Provisioner, SystemHost};
use scaleio_scheduler::offer::Offer;
use scaleio_scheduler::selection::SelectionReport;
use scaleio_scheduler::storage::RestStorageBackend;
use scaleio_scheduler::store::FileStore;
use scaleio_scheduler::topology::{decode, Role};
use scaleio_scheduler::ScaleIoScheduler;
use tracing::{info, warn};

mod logging;

use logging::{init_logging, LogFormat};

#[derive(Parser)]
#[command(name = "scaleio", version, about = "ScaleIO cluster control plane")]
struct Cli {
    /// Log output format
    #[arg(long, value_enum, default_value_t = LogFormat::Pretty, global = true)]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run role selection and the control loop until Ctrl-C
    Scheduler {
        /// Cluster configuration (TOML)
        #[arg(long)]
        config: PathBuf,
        /// Resource offers (JSON array)
        #[arg(long)]
        offers: PathBuf,
        /// Also install this host, registered under the given hostname
        #[arg(long)]
        agent: Option<String>,
    },
    /// Run one role selection pass and print the assignments
    Select {
        #[arg(long)]
        config: PathBuf,
        #[arg(long)]
        offers: PathBuf,
    },
    /// Print the topology each offer declares
    Decode {
        #[arg(long)]
        offers: PathBuf,
    },
}

fn load_offers(path: &Path) -> anyhow::Result<Vec<Offer>> {
    let content = std::fs::read_to_string(path).with_context(|| format!("cannot read {}", path.display()))?;
    let offers = serde_json::from_str(&content).with_context(|| format!("invalid offers in {}", path.display()))?;
    Ok(offers)
}

fn print_report(report: &SelectionReport) {
    for (persona, hostname) in &report.managers {
        println!("{:<14} {hostname}", persona.to_string());
    }
    for hostname in &report.data_nodes {
        println!("{:<14} {hostname}", "datanode");
    }
    for (hostname, e) in &report.failures {
        println!("{:<14} {hostname}: {e}", "failed");
    }
}

async fn open_store(config: &Config) -> anyhow::Result<FileStore> {
    let store = FileStore::open(Path::new(&config.scheduler.store_dir), &config.scheduler.framework_role).await?;
    info!(path = %store.path().display(), "opened metadata store");
    Ok(store)
}

#[tokio::main]
async fn main() -> ExitCode {
    match run().await {
        Ok(code) => code,
        Err(e) => {
            eprintln!("Error: {e:#}");
            ExitCode::FAILURE
        }
    }
}

async fn run() -> anyhow::Result<ExitCode> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Scheduler { config, offers, agent } => {
            let config = Config::load(&config)?;
            init_logging(cli.log_format, config.debug);
            let offers = load_offers(&offers)?;

            let store = open_store(&config).await?;
            let backend = RestStorageBackend::new()?;
            let executor_config = config.executor.clone();
            let scheduler = Arc::new(ScaleIoScheduler::new(config, Arc::new(store), Arc::new(backend)));

            match scheduler.resource_offers(&offers).await {
                Ok(report) => print_report(&report),
                Err(e) => warn!(error = %e, "role selection incomplete"),
            }

            let control = tokio::spawn(scheduler.control_loop().await.run());

            let agent = match agent {
                Some(hostname) => {
                    let setup = Provisioner::detect(&executor_config.download_dir).await?;
                    let lifecycle = NodeLifecycle::new(
                        hostname,
                        Arc::new(LocalCoordinator::new(Arc::clone(&scheduler))),
                        setup,
                        SystemHost::new(),
                        executor_config,
                    );
                    Some(tokio::spawn(lifecycle.run()))
                }
                None => None,
            };

            tokio::signal::ctrl_c().await?;
            info!("shutting down");

            control.abort();
            if let Some(agent) = agent {
                agent.abort();
            }
        }

        Commands::Select { config, offers } => {
            let config = Config::load(&config)?;
            init_logging(cli.log_format, config.debug);
            let offers = load_offers(&offers)?;

            let store = open_store(&config).await?;
            let backend = RestStorageBackend::new()?;
            let scheduler = ScaleIoScheduler::new(config, Arc::new(store), Arc::new(backend));

            let report = scheduler.resource_offers(&offers).await?;
            print_report(&report);
            if !report.failures.is_empty() {
                return Ok(ExitCode::FAILURE);
            }
        }

        Commands::Decode { offers } => {
            init_logging(cli.log_format, false);
            let offers = load_offers(&offers)?;

            let decoded: Vec<_> = offers
                .iter()
                .map(|offer| {
                    let attributes = offer.attribute_map();
                    serde_json::json!({
                        "hostname": offer.hostname,
                        "server": decode(&attributes, Role::Server),
                        "client": decode(&attributes, Role::Client),
                    })
                })
                .collect();

            println!("{}", serde_json::to_string_pretty(&decoded)?);
        }
    }

    Ok(ExitCode::SUCCESS)
}
