use std::sync::Arc;

use parking_lot::RwLock;
use serde::Serialize;
use tracing::{info, instrument, warn};

use super::{area::DistributedAgent, AgentResult};
use crate::{
    bus::{BusClient, TransportRegistry},
    config::{BusClientConfig, MessageBusDefinition},
    topics,
};

/// Root of an agent tree: connected to the system bus, it starts the
/// distributed agents of a feeder and keeps them.
pub struct CoordinatingAgent {
    feeder_id: String,
    system_bus: BusClient,
    simulation_id: Option<String>,
    children: RwLock<Vec<Arc<dyn DistributedAgent>>>,
}

impl CoordinatingAgent {
    /// Connects to the system bus described by `definition`.
    pub async fn new(
        feeder_id: impl Into<String>,
        definition: &MessageBusDefinition,
        registry: &TransportRegistry,
        config: BusClientConfig,
    ) -> AgentResult<Self> {
        let system_bus = BusClient::from_definition(definition, registry, config)?;
        Self::with_client(feeder_id, system_bus).await
    }

    pub async fn with_client(feeder_id: impl Into<String>, system_bus: BusClient) -> AgentResult<Self> {
        system_bus.connect().await?;
        let feeder_id = feeder_id.into();
        info!("Coordinating agent for {} on bus {}", feeder_id, system_bus.id());
        Ok(Self {
            feeder_id,
            system_bus,
            simulation_id: None,
            children: RwLock::new(Vec::new()),
        })
    }

    pub fn with_simulation_id(mut self, simulation_id: impl Into<String>) -> Self {
        self.simulation_id = Some(simulation_id.into());
        self
    }

    pub fn feeder_id(&self) -> &str {
        &self.feeder_id
    }

    pub fn simulation_id(&self) -> Option<&str> {
        self.simulation_id.as_deref()
    }

    pub fn system_bus(&self) -> &BusClient {
        &self.system_bus
    }

    /// Connects `child` through registration and keeps it. A child that
    /// fails to connect is not kept.
    #[instrument(skip(self, child), fields(agent = %child.agent_id()))]
    pub async fn spawn<A: DistributedAgent + 'static>(&self, child: A) -> AgentResult<Arc<A>> {
        child.connect().await?;
        let child = Arc::new(child);
        let entry: Arc<dyn DistributedAgent> = child.clone();
        self.children.write().push(entry);
        info!("Spawned agent {}", child.agent_id());
        Ok(child)
    }

    pub fn children(&self) -> Vec<Arc<dyn DistributedAgent>> {
        self.children.read().clone()
    }

    pub async fn publish_to_system_bus<T: Serialize + Sync + ?Sized>(&self, message: &T) -> AgentResult<()> {
        self.system_bus
            .send(&topics::field_message_bus_topic(self.system_bus.id()), message)
            .await?;
        Ok(())
    }

    /// Disconnects every child, then the system bus.
    pub async fn disconnect(&self) -> AgentResult<()> {
        for child in self.children() {
            if let Err(e) = child.disconnect().await {
                warn!("Failed to disconnect {}: {}", child.agent_id(), e);
            }
        }
        self.system_bus.disconnect().await?;
        Ok(())
    }
}
