//! amphora-net: dry-run front end for the amphora network reconciler.
//!
//! Loads a substrate snapshot into the in-memory driver and either prints
//! the computed per-amphora deltas or applies them and checks convergence.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use amphora_net::config::{Config, DatabaseConfig};
use amphora_net::driver::InMemoryDriver;
use amphora_net::driver::memory::SubstrateSnapshot;
use amphora_net::model::{AvailabilityZone, LoadBalancer, Port};
use amphora_net::steps::network::DeltasInput;
use amphora_net::steps::reconcile::ApplyDeltasInput;
use amphora_net::steps::{ApplyDeltas, CalculateDelta, Services};
use amphora_net::store::{LoadBalancerStore, SqliteRepository};
use amphora_net::{Delta, Step, StepContext};

/// Amphora network reconciler
#[derive(Parser, Debug)]
#[command(name = "amphora-net", version, about)]
struct Args {
    /// Path to a JSON configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Management network used when the availability zone names none
    /// (repeatable, overrides the config file)
    #[arg(long = "boot-network")]
    boot_networks: Vec<String>,

    /// Database URL (overrides the config file)
    #[arg(long)]
    database_url: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Print the network deltas of every allocated amphora
    Plan {
        /// Snapshot of the load balancer and the network substrate
        #[arg(short, long)]
        snapshot: PathBuf,
    },

    /// Apply the deltas against the simulated substrate and check convergence
    Simulate {
        /// Snapshot of the load balancer and the network substrate
        #[arg(short, long)]
        snapshot: PathBuf,
    },

    /// Print the effective configuration
    Config,
}

/// Input document of `plan` and `simulate`.
#[derive(Debug, Deserialize)]
struct Snapshot {
    load_balancer: LoadBalancer,
    #[serde(default)]
    availability_zone: Option<AvailabilityZone>,
    #[serde(flatten)]
    substrate: SubstrateSnapshot,
}

#[derive(Debug, Serialize)]
struct SimulationReport {
    deltas: BTreeMap<String, Delta>,
    ports: BTreeMap<String, Vec<Port>>,
    converged: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "amphora_net=info,sqlx=warn".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => Config::load(path).await?,
        None => Config::default(),
    };
    if !args.boot_networks.is_empty() {
        config.controller.amp_boot_network_list = args.boot_networks.clone();
    }
    if let Some(url) = &args.database_url {
        config.database.url = url.clone();
    }

    match args.command {
        Commands::Plan { snapshot } => {
            let env = Environment::load(&snapshot, &config).await?;
            let deltas = env.calculate().await?;
            print_json(&deltas)?;
        }
        Commands::Simulate { snapshot } => {
            let env = Environment::load(&snapshot, &config).await?;
            let report = env.simulate().await?;
            if !report.converged {
                warn!("Recomputed deltas are not empty after applying them");
            }
            print_json(&report)?;
        }
        Commands::Config => print_json(&config)?,
    }

    Ok(())
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

async fn open_repository(database: &DatabaseConfig) -> Result<SqliteRepository> {
    let repo = if database.url == "sqlite::memory:" {
        SqliteRepository::in_memory().await
    } else {
        SqliteRepository::connect(&database.url, database.max_connections).await
    };
    repo.with_context(|| format!("failed to open database {}", database.url))
}

/// A loaded snapshot wired to the in-memory driver and a repository.
struct Environment {
    services: Services,
    boot_networks: Vec<String>,
    load_balancer_id: String,
    availability_zone: Option<AvailabilityZone>,
}

impl Environment {
    async fn load(path: &Path, config: &Config) -> Result<Self> {
        let raw = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("failed to read snapshot {}", path.display()))?;
        let snapshot: Snapshot = serde_json::from_str(&raw)
            .with_context(|| format!("invalid snapshot {}", path.display()))?;

        let driver = InMemoryDriver::from_snapshot(&snapshot.substrate)
            .context("failed to seed the simulated substrate")?;
        let repo = open_repository(&config.database).await?;
        repo.put_load_balancer(&snapshot.load_balancer)
            .await
            .context("failed to store the load balancer")?;

        info!(
            "Loaded load balancer {} with {} amphorae",
            snapshot.load_balancer.id,
            snapshot.load_balancer.amphorae.len()
        );

        Ok(Self {
            services: Services::new(Arc::new(driver), Arc::new(repo)),
            boot_networks: config.controller.amp_boot_network_list.clone(),
            load_balancer_id: snapshot.load_balancer.id,
            availability_zone: snapshot.availability_zone,
        })
    }

    async fn calculate(&self) -> Result<BTreeMap<String, Delta>> {
        let step = CalculateDelta::new(self.services.clone(), self.boot_networks.clone());
        let input = DeltasInput {
            load_balancer_id: self.load_balancer_id.clone(),
            availability_zone: self.availability_zone.clone(),
        };
        step.execute(&StepContext::new(), &input)
            .await
            .context("failed to calculate network deltas")
    }

    async fn simulate(&self) -> Result<SimulationReport> {
        let deltas = self.calculate().await?;
        let apply = ApplyDeltas::new(self.services.clone());
        let input = ApplyDeltasInput {
            load_balancer_id: self.load_balancer_id.clone(),
            deltas: deltas.clone(),
        };
        let ctx = StepContext::new();
        let ports = apply
            .execute(&ctx, &input)
            .await
            .context("failed to apply network deltas")?;

        let converged = self.calculate().await?.values().all(Delta::is_empty);
        info!("Simulation finished, converged: {}", converged);

        Ok(SimulationReport {
            deltas,
            ports,
            converged,
        })
    }
}
