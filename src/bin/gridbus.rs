use std::{path::PathBuf, sync::Arc};

use clap::{Parser, Subcommand};
use gridbus::{
    bus::{Callback, TransportRegistry},
    config::{AgentConfig, FieldConfig, MessageBusDefinitions},
    AreaAgent, AreaKind, AreaTopology, BusClient, ContextManager, CoordinatingAgent, Error,
    InternalResult,
};
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

const CONTEXT_MANAGER_APP_ID: &str = "context_manager";
const CONTEXT_MANAGER_DESCRIPTION: &str =
    "Provides topological context like neighbouring agents and devices to distributed agents";

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Bus definitions (YAML, or JSON with a .json extension)
    #[arg(short, long, default_value = "connections.yaml")]
    config: PathBuf,

    /// Client tunables (JSON)
    #[arg(short, long)]
    settings: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Print every message published on a bus
    Listen {
        /// Bus id, defaults to the first definition
        #[arg(short, long)]
        bus: Option<String>,

        #[arg(short, long, default_value = "/topic/goss.gridappsd.>")]
        topic: String,
    },
    /// Run the context managers of a feeder and its areas
    ContextManagers {
        /// Feeder topology (JSON)
        #[arg(short, long)]
        topology: PathBuf,

        /// Bus of the central platform, used to forward registrations and control commands
        #[arg(short, long)]
        platform_bus: Option<String>,

        #[arg(long)]
        simulation_id: Option<String>,
    },
}

async fn wait_for_shutdown() -> InternalResult<()> {
    tokio::signal::ctrl_c()
        .await
        .map_err(|e| Error::internal(format!("Failed to wait for Ctrl+C: {}", e)))
}

async fn listen(
    definitions: &MessageBusDefinitions,
    settings: &FieldConfig,
    bus: Option<&str>,
    topic: &str,
) -> InternalResult<()> {
    let definition = match bus {
        Some(id) => definitions.get(id),
        None => definitions.first(),
    }
    .ok_or_else(|| Error::internal("No matching bus definition"))?;

    let registry = TransportRegistry::default();
    let client = BusClient::from_definition(definition, &registry, settings.bus_client.clone())?;
    client.connect().await?;
    client
        .subscribe(
            topic,
            Callback::from_fn(|message| {
                println!("{} {:?}\n{}\n", message.destination, message.headers, message.body);
            }),
        )
        .await?;

    println!("Listening on {} at {}. Press Ctrl+C to stop.", definition.id(), topic);
    wait_for_shutdown().await?;
    client.disconnect().await?;
    Ok(())
}

async fn context_managers(
    definitions: &MessageBusDefinitions,
    settings: &FieldConfig,
    topology: AreaTopology,
    platform_bus: Option<&str>,
    simulation_id: Option<String>,
) -> InternalResult<()> {
    let registry = Arc::new(TransportRegistry::default());
    let feeder = definitions
        .get(&topology.id)
        .or_else(|| definitions.first())
        .ok_or_else(|| Error::internal("No bus definitions"))?;

    let platform = match platform_bus {
        Some(id) => {
            let definition = definitions
                .get(id)
                .ok_or_else(|| Error::internal(format!("Unknown platform bus {}", id)))?;
            let client =
                BusClient::from_definition(definition, &registry, settings.bus_client.clone())?;
            client.connect().await?;
            Some(client)
        }
        None => None,
    };

    let mut coordinator = CoordinatingAgent::new(
        topology.id.clone(),
        feeder,
        &registry,
        settings.bus_client.clone(),
    )
    .await?;
    if let Some(simulation_id) = &simulation_id {
        coordinator = coordinator.with_simulation_id(simulation_id.clone());
    }

    let manager = |kind: AreaKind, area: &AreaTopology| {
        let mut builder = AreaAgent::builder(
            kind,
            AgentConfig::new(CONTEXT_MANAGER_APP_ID, CONTEXT_MANAGER_DESCRIPTION),
            ContextManager::new(),
        )
        .topology(area.clone())
        .cim_profile(settings.cim_profile.clone())
        .bootstrap(settings.bootstrap.clone())
        .bus_config(settings.bus_client.clone())
        .transport_registry(registry.clone());
        if let Some(platform) = &platform {
            builder = builder.platform_bus(platform.clone());
        }
        if let Some(simulation_id) = &simulation_id {
            builder = builder.simulation_id(simulation_id.clone());
        }
        builder
    };

    let feeder_agent = manager(AreaKind::Feeder, &topology)
        .downstream(feeder.clone())
        .build()?;
    coordinator.spawn(feeder_agent).await?;

    for switch_area in &topology.switch_areas {
        let Some(switch_bus) = definitions.get(&switch_area.id) else {
            warn!("No bus definition for switch area {}", switch_area.id);
            continue;
        };
        info!("Creating switch area context manager {}", switch_area.id);
        let agent = manager(AreaKind::SwitchArea, switch_area)
            .upstream(feeder.clone())
            .downstream(switch_bus.clone())
            .build()?;
        coordinator.spawn(agent).await?;

        for secondary_area in &switch_area.secondary_areas {
            let Some(secondary_bus) = definitions.get(&secondary_area.id) else {
                warn!("No bus definition for secondary area {}", secondary_area.id);
                continue;
            };
            info!("Creating secondary area context manager {}", secondary_area.id);
            let agent = manager(AreaKind::SecondaryArea, secondary_area)
                .upstream(switch_bus.clone())
                .downstream(secondary_bus.clone())
                .build()?;
            coordinator.spawn(agent).await?;
        }
    }

    println!(
        "{} context managers running. Press Ctrl+C to stop.",
        coordinator.children().len()
    );
    wait_for_shutdown().await?;

    coordinator.disconnect().await?;
    if let Some(platform) = platform {
        platform.disconnect().await?;
    }
    Ok(())
}

async fn run(cli: &Cli) -> InternalResult<()> {
    let definitions = MessageBusDefinitions::from_file(&cli.config)?;
    debug!("Loaded {} bus definitions", definitions.len());
    let settings = match &cli.settings {
        Some(path) => FieldConfig::from_file(path)?,
        None => FieldConfig::default(),
    };

    match &cli.command {
        Command::Listen { bus, topic } => {
            listen(&definitions, &settings, bus.as_deref(), topic).await
        }
        Command::ContextManagers {
            topology,
            platform_bus,
            simulation_id,
        } => {
            let content = std::fs::read_to_string(topology)
                .map_err(|e| Error::internal(format!("Failed to read topology file: {}", e)))?;
            let topology: AreaTopology = serde_json::from_str(&content)
                .map_err(|e| Error::internal(format!("Failed to parse topology file: {}", e)))?;
            context_managers(
                &definitions,
                &settings,
                topology,
                platform_bus.as_deref(),
                simulation_id.clone(),
            )
            .await
        }
    }
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    if let Err(e) = run(&cli).await {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}
