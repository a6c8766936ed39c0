use std::sync::{Arc, OnceLock, Weak};

use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::{debug, error, info, instrument, warn};

use super::{
    handler::{AgentContext, AgentHandler, BusSide, HandlerKind},
    interceptor::HandlerInterceptor,
    role::{derive_agent_id, AgentRole, AreaKind},
    AgentError, AgentResult,
};
use crate::{
    bus::{BusClient, Callback, Message, TransportRegistry},
    config::{AgentConfig, BootstrapConfig, BusClientConfig, CimProfile, ConfigError, MessageBusDefinition},
    context::{ContextClient, RetryPolicy},
    topics,
    topology::AreaTopology,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum::Display)]
pub enum AgentState {
    Constructed,
    BootstrappingTopology,
    Subscribed,
    Registered,
    Connected,
    Disconnected,
}

/// Lifecycle surface shared by every agent regardless of its handler.
#[async_trait]
pub trait DistributedAgent: Send + Sync {
    fn agent_id(&self) -> &str;

    fn role(&self) -> AgentRole;

    fn state(&self) -> AgentState;

    /// Drives the agent from `Constructed` to `Connected`.
    async fn connect(&self) -> AgentResult<()>;

    async fn disconnect(&self) -> AgentResult<()>;
}

struct AgentInner<H: AgentHandler> {
    agent_id: String,
    role: AgentRole,
    config: AgentConfig,
    upstream: BusClient,
    downstream: BusClient,
    platform: Option<BusClient>,
    supplied_topology: Mutex<Option<AreaTopology>>,
    simulation_id: Option<String>,
    cim_profile: CimProfile,
    bootstrap: BootstrapConfig,
    handler: H,
    interceptors: Vec<Arc<dyn HandlerInterceptor>>,
    state: Mutex<AgentState>,
    context: OnceLock<Arc<AgentContext>>,
    fault: Mutex<Option<String>>,
}

/// Agent of one area.
pub struct AreaAgent<H: AgentHandler> {
    inner: Arc<AgentInner<H>>,
}

impl<H: AgentHandler> Clone for AreaAgent<H> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

enum BusSource {
    Definition(MessageBusDefinition),
    Client(BusClient),
}

pub struct AreaAgentBuilder<H: AgentHandler> {
    kind: AreaKind,
    config: AgentConfig,
    handler: H,
    upstream: Option<BusSource>,
    downstream: Option<BusSource>,
    platform: Option<BusClient>,
    topology: Option<AreaTopology>,
    simulation_id: Option<String>,
    cim_profile: CimProfile,
    bootstrap: BootstrapConfig,
    bus_config: BusClientConfig,
    registry: Option<Arc<TransportRegistry>>,
    interceptors: Vec<Arc<dyn HandlerInterceptor>>,
}

impl<H: AgentHandler> AreaAgentBuilder<H> {
    pub fn upstream(mut self, definition: MessageBusDefinition) -> Self {
        self.upstream = Some(BusSource::Definition(definition));
        self
    }

    pub fn downstream(mut self, definition: MessageBusDefinition) -> Self {
        self.downstream = Some(BusSource::Definition(definition));
        self
    }

    pub fn upstream_client(mut self, client: BusClient) -> Self {
        self.upstream = Some(BusSource::Client(client));
        self
    }

    pub fn downstream_client(mut self, client: BusClient) -> Self {
        self.downstream = Some(BusSource::Client(client));
        self
    }

    /// Connection to the central platform. Context managers without a
    /// supplied topology fetch it from there.
    pub fn platform_bus(mut self, client: BusClient) -> Self {
        self.platform = Some(client);
        self
    }

    pub fn topology(mut self, topology: AreaTopology) -> Self {
        self.topology = Some(topology);
        self
    }

    pub fn simulation_id(mut self, simulation_id: impl Into<String>) -> Self {
        self.simulation_id = Some(simulation_id.into());
        self
    }

    pub fn cim_profile(mut self, cim_profile: CimProfile) -> Self {
        self.cim_profile = cim_profile;
        self
    }

    pub fn bootstrap(mut self, bootstrap: BootstrapConfig) -> Self {
        self.bootstrap = bootstrap;
        self
    }

    pub fn bus_config(mut self, config: BusClientConfig) -> Self {
        self.bus_config = config;
        self
    }

    pub fn transport_registry(mut self, registry: Arc<TransportRegistry>) -> Self {
        self.registry = Some(registry);
        self
    }

    pub fn interceptor(mut self, interceptor: Arc<dyn HandlerInterceptor>) -> Self {
        self.interceptors.push(interceptor);
        self
    }

    fn client(&self, source: BusSource) -> AgentResult<BusClient> {
        match source {
            BusSource::Client(client) => Ok(client),
            BusSource::Definition(definition) => {
                let default_registry;
                let registry = match &self.registry {
                    Some(registry) => registry.as_ref(),
                    None => {
                        default_registry = TransportRegistry::default();
                        &default_registry
                    }
                };
                Ok(BusClient::from_definition(
                    &definition,
                    registry,
                    self.bus_config.clone(),
                )?)
            }
        }
    }

    pub fn build(mut self) -> AgentResult<AreaAgent<H>> {
        let upstream = self.upstream.take().map(|s| self.client(s)).transpose()?;
        let downstream = self.downstream.take().map(|s| self.client(s)).transpose()?;
        // 片方しかない場合は同じバスを上下で共有する
        let (upstream, downstream) = match (upstream, downstream) {
            (Some(up), Some(down)) => (up, down),
            (Some(bus), None) | (None, Some(bus)) => (bus.clone(), bus),
            (None, None) => return Err(ConfigError::NoBusDefined.into()),
        };

        let role = AgentRole::for_app(self.kind, &self.config.app_id);
        let agent_id = derive_agent_id(role, &self.config.app_id, downstream.id());
        debug!("Created {} agent {}", self.kind, agent_id);

        Ok(AreaAgent {
            inner: Arc::new(AgentInner {
                agent_id,
                role,
                config: self.config,
                upstream,
                downstream,
                platform: self.platform,
                supplied_topology: Mutex::new(self.topology),
                simulation_id: self.simulation_id,
                cim_profile: self.cim_profile,
                bootstrap: self.bootstrap,
                handler: self.handler,
                interceptors: self.interceptors,
                state: Mutex::new(AgentState::Constructed),
                context: OnceLock::new(),
                fault: Mutex::new(None),
            }),
        })
    }
}

impl<H: AgentHandler> AreaAgent<H> {
    pub fn builder(kind: AreaKind, config: AgentConfig, handler: H) -> AreaAgentBuilder<H> {
        AreaAgentBuilder {
            kind,
            config,
            handler,
            upstream: None,
            downstream: None,
            platform: None,
            topology: None,
            simulation_id: None,
            cim_profile: CimProfile::default(),
            bootstrap: BootstrapConfig::default(),
            bus_config: BusClientConfig::default(),
            registry: None,
            interceptors: Vec::new(),
        }
    }

    pub fn agent_id(&self) -> &str {
        &self.inner.agent_id
    }

    pub fn role(&self) -> AgentRole {
        self.inner.role
    }

    pub fn state(&self) -> AgentState {
        *self.inner.state.lock()
    }

    pub fn handler(&self) -> &H {
        &self.inner.handler
    }

    pub fn upstream(&self) -> &BusClient {
        &self.inner.upstream
    }

    pub fn downstream(&self) -> &BusClient {
        &self.inner.downstream
    }

    /// Available from `Subscribed` on.
    pub fn context(&self) -> Option<Arc<AgentContext>> {
        self.inner.context.get().cloned()
    }

    pub fn topology(&self) -> Option<AreaTopology> {
        self.context().map(|ctx| ctx.topology().clone())
    }

    /// Description of the fatal handler fault that stopped the agent.
    pub fn fault(&self) -> Option<String> {
        self.inner.fault.lock().clone()
    }

    fn shares_bus(&self) -> bool {
        self.inner.upstream.id() == self.inner.downstream.id()
    }

    fn transition(&self, next: AgentState) {
        let mut state = self.inner.state.lock();
        info!("Agent {}: {} -> {}", self.inner.agent_id, *state, next);
        *state = next;
    }

    #[instrument(skip(self), fields(agent = %self.inner.agent_id))]
    pub async fn connect(&self) -> AgentResult<()> {
        let state = self.state();
        if state != AgentState::Constructed {
            return Err(AgentError::InvalidState {
                agent_id: self.inner.agent_id.clone(),
                operation: "connect",
                state,
            });
        }

        self.inner.downstream.connect().await?;
        if !self.shares_bus() {
            self.inner.upstream.connect().await?;
        }

        self.transition(AgentState::BootstrappingTopology);
        let topology = self.bootstrap_topology().await?;
        let context = Arc::new(AgentContext {
            agent_id: self.inner.agent_id.clone(),
            app_id: self.inner.config.app_id.clone(),
            description: self.inner.config.description.clone(),
            role: self.inner.role,
            upstream: self.inner.upstream.clone(),
            downstream: self.inner.downstream.clone(),
            platform: self.inner.platform.clone(),
            topology,
            simulation_id: self.inner.simulation_id.clone(),
            cim_profile: self.inner.cim_profile.clone(),
        });
        let context = self.inner.context.get_or_init(|| context).clone();
        if self.inner.role.kind == AreaKind::SecondaryArea
            && context.topology().addressable_equipment.is_empty()
        {
            warn!(
                "No addressable equipment in secondary area {}",
                self.inner.downstream.id()
            );
        }

        self.subscribe_all().await?;
        self.transition(AgentState::Subscribed);

        if !self.inner.role.is_context_manager {
            ContextClient::register_agent(
                &self.inner.downstream,
                &self.inner.upstream,
                context.registration_details(),
            )
            .await?;
        }
        self.transition(AgentState::Registered);

        self.transition(AgentState::Connected);
        Ok(())
    }

    async fn bootstrap_topology(&self) -> AgentResult<AreaTopology> {
        if let Some(topology) = self.inner.supplied_topology.lock().take() {
            return Ok(topology);
        }

        let area_id = self.inner.downstream.id().to_string();
        let policy = RetryPolicy::RetryForever {
            backoff: self.inner.bootstrap.retry_backoff,
        };
        let client = if self.inner.role.is_context_manager {
            // コンテキストマネージャはプラットフォームから取得する
            let platform = self.inner.platform.clone().ok_or_else(|| {
                ConfigError::NoTopologySource {
                    agent_id: self.inner.agent_id.clone(),
                }
            })?;
            ContextClient::with_destination(platform, topics::REQUEST_FIELD)
        } else {
            ContextClient::new(self.inner.downstream.clone())
        };

        info!("Requesting topology for {} from {}", area_id, client.destination());
        let topology = client
            .with_timeout(self.inner.bootstrap.request_timeout)
            .get_context(&area_id, policy)
            .await?;
        Ok(topology)
    }

    async fn subscribe_all(&self) -> AgentResult<()> {
        let inner = &self.inner;
        let down = &inner.downstream;
        let up = &inner.upstream;
        let shared = self.shares_bus();
        let app_id = inner.config.app_id.as_str();
        let agent_id = inner.agent_id.as_str();

        let measurement_topic =
            topics::field_output_topic(down.id(), inner.simulation_id.as_deref());
        debug!("Subscribing to measurements on {}", measurement_topic);
        self.wire(down, &measurement_topic, HandlerKind::Measurement, BusSide::Downstream)
            .await?;

        let mut downstream_topics = vec![
            topics::field_message_bus_topic(down.id()),
            topics::field_message_bus_app_topic(down.id(), app_id),
        ];
        let mut upstream_topics = vec![
            topics::field_message_bus_topic(up.id()),
            topics::field_message_bus_app_topic(up.id(), app_id),
        ];
        if !inner.role.is_context_manager {
            downstream_topics.push(topics::field_message_bus_agent_topic(down.id(), agent_id));
            upstream_topics.push(topics::field_message_bus_agent_topic(up.id(), agent_id));
        }
        for topic in &downstream_topics {
            self.wire(down, topic, HandlerKind::DownstreamMessage, BusSide::Downstream)
                .await?;
        }
        if !shared {
            for topic in &upstream_topics {
                self.wire(up, topic, HandlerKind::UpstreamMessage, BusSide::Upstream)
                    .await?;
            }
        }

        let request_queue = topics::field_agent_request_queue(down.id(), agent_id);
        debug!("Subscribing to requests on {}", request_queue);
        self.wire(down, &request_queue, HandlerKind::Request, BusSide::Downstream)
            .await?;
        if !shared {
            let request_queue = topics::field_agent_request_queue(up.id(), agent_id);
            debug!("Subscribing to requests on {}", request_queue);
            self.wire(up, &request_queue, HandlerKind::Request, BusSide::Upstream)
                .await?;
        }
        Ok(())
    }

    async fn wire(&self, bus: &BusClient, topic: &str, kind: HandlerKind, side: BusSide) -> AgentResult<()> {
        let agent: Weak<AgentInner<H>> = Arc::downgrade(&self.inner);
        let callback = Callback::new(move |message: Message| {
            let agent = agent.clone();
            async move {
                if let Some(inner) = agent.upgrade() {
                    AreaAgent { inner }.dispatch(kind, side, message).await;
                }
            }
        });
        bus.subscribe(topic, callback).await?;
        Ok(())
    }

    async fn dispatch(&self, kind: HandlerKind, side: BusSide, message: Message) {
        if self.state() == AgentState::Disconnected {
            return;
        }
        let Some(ctx) = self.inner.context.get().cloned() else {
            debug!("Agent {} not ready, dropping {} message", self.inner.agent_id, kind);
            return;
        };

        for interceptor in &self.inner.interceptors {
            interceptor.before(&self.inner.agent_id, kind, &message);
        }
        let handler = &self.inner.handler;
        let outcome = match kind {
            HandlerKind::Measurement => handler.on_measurement(&ctx, message).await,
            HandlerKind::UpstreamMessage => handler.on_upstream_message(&ctx, message).await,
            HandlerKind::DownstreamMessage => handler.on_downstream_message(&ctx, message).await,
            HandlerKind::Request => handler.on_request(&ctx, side, message).await,
        };
        for interceptor in &self.inner.interceptors {
            interceptor.after(&self.inner.agent_id, kind, &outcome);
        }

        match outcome {
            Ok(()) => {}
            Err(e) if e.is_fatal() => {
                error!("Agent {} faulted: {}", self.inner.agent_id, e);
                *self.inner.fault.lock() = Some(e.to_string());
                let agent = self.clone();
                tokio::spawn(async move {
                    if let Err(e) = agent.disconnect().await {
                        warn!("Failed to disconnect faulted agent {}: {}", agent.agent_id(), e);
                    }
                });
            }
            Err(e) => warn!("{} handler of {} failed: {}", kind, self.inner.agent_id, e),
        }
    }

    /// Disconnects both buses. Idempotent.
    pub async fn disconnect(&self) -> AgentResult<()> {
        {
            let mut state = self.inner.state.lock();
            if *state == AgentState::Disconnected {
                return Ok(());
            }
            info!("Agent {}: {} -> {}", self.inner.agent_id, *state, AgentState::Disconnected);
            *state = AgentState::Disconnected;
        }
        self.inner.downstream.disconnect().await?;
        if !self.shares_bus() {
            self.inner.upstream.disconnect().await?;
        }
        Ok(())
    }
}

#[async_trait]
impl<H: AgentHandler> DistributedAgent for AreaAgent<H> {
    fn agent_id(&self) -> &str {
        AreaAgent::agent_id(self)
    }

    fn role(&self) -> AgentRole {
        AreaAgent::role(self)
    }

    fn state(&self) -> AgentState {
        AreaAgent::state(self)
    }

    async fn connect(&self) -> AgentResult<()> {
        AreaAgent::connect(self).await
    }

    async fn disconnect(&self) -> AgentResult<()> {
        AreaAgent::disconnect(self).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::{InMemoryBroker, MemoryTransport};
    use std::time::Duration;

    struct Recorder {
        seen: Mutex<Vec<(HandlerKind, String)>>,
    }

    impl Recorder {
        fn new() -> Self {
            Self {
                seen: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl AgentHandler for Recorder {
        async fn on_measurement(&self, _ctx: &AgentContext, message: Message) -> AgentResult<()> {
            self.seen.lock().push((HandlerKind::Measurement, message.body));
            Ok(())
        }

        async fn on_upstream_message(&self, _ctx: &AgentContext, message: Message) -> AgentResult<()> {
            self.seen.lock().push((HandlerKind::UpstreamMessage, message.body));
            Ok(())
        }

        async fn on_downstream_message(&self, _ctx: &AgentContext, message: Message) -> AgentResult<()> {
            self.seen.lock().push((HandlerKind::DownstreamMessage, message.body));
            Ok(())
        }

        async fn on_request(&self, ctx: &AgentContext, _side: BusSide, _message: Message) -> AgentResult<()> {
            Err(ctx.unimplemented(HandlerKind::Request))
        }
    }

    fn bus(id: &str, broker: &Arc<InMemoryBroker>) -> BusClient {
        BusClient::builder(id, Arc::new(MemoryTransport::new(broker.clone()))).build()
    }

    #[test]
    fn test_build_requires_a_bus() {
        let err = AreaAgent::builder(AreaKind::Feeder, AgentConfig::new("app", ""), Recorder::new())
            .build()
            .err()
            .unwrap();
        assert!(matches!(err, AgentError::Config(ConfigError::NoBusDefined)));
    }

    #[tokio::test]
    async fn test_single_bus_serves_both_sides() {
        let broker = Arc::new(InMemoryBroker::new());
        let agent = AreaAgent::builder(AreaKind::Feeder, AgentConfig::new("app", ""), Recorder::new())
            .downstream_client(bus("feeder1", &broker))
            .build()
            .unwrap();
        assert_eq!(agent.upstream().id(), "feeder1");
        assert_eq!(agent.agent_id(), "da_app_feeder1");
        assert_eq!(agent.state(), AgentState::Constructed);
    }

    #[tokio::test]
    async fn test_context_manager_without_topology_source() {
        let broker = Arc::new(InMemoryBroker::new());
        let agent = AreaAgent::builder(
            AreaKind::Feeder,
            AgentConfig::new("context_manager", ""),
            Recorder::new(),
        )
        .downstream_client(bus("feeder1", &broker))
        .build()
        .unwrap();
        let err = agent.connect().await.unwrap_err();
        assert!(matches!(
            err,
            AgentError::Config(ConfigError::NoTopologySource { .. })
        ));
    }

    #[tokio::test]
    async fn test_unimplemented_handler_faults_agent() {
        let broker = Arc::new(InMemoryBroker::new());
        let upstream = bus("feeder1", &broker);
        let agent = AreaAgent::builder(AreaKind::SwitchArea, AgentConfig::new("app", ""), Recorder::new())
            .upstream_client(upstream)
            .downstream_client(bus("switch1", &broker))
            .topology(AreaTopology::new("switch1"))
            .build()
            .unwrap();
        agent.connect().await.unwrap();
        assert_eq!(agent.state(), AgentState::Connected);

        let sender = bus("tester", &broker);
        sender.connect().await.unwrap();
        sender
            .send(&topics::field_agent_request_queue("switch1", agent.agent_id()), "ping")
            .await
            .unwrap();

        for _ in 0..50 {
            if agent.state() == AgentState::Disconnected {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(agent.state(), AgentState::Disconnected);
        assert!(agent.fault().unwrap().contains("request"));
        assert!(agent.connect().await.is_err());
    }
}
