use async_trait::async_trait;
use serde::Serialize;

use super::{role::AgentRole, AgentError, AgentResult};
use crate::{
    bus::{BusClient, Message},
    config::CimProfile,
    context::{AgentRegistrationDetails, ContextClient, DifferenceBuilder},
    topics,
    topology::AreaTopology,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum::Display)]
#[strum(serialize_all = "snake_case")]
pub enum HandlerKind {
    Measurement,
    UpstreamMessage,
    DownstreamMessage,
    Request,
}

/// Which of the agent's two buses a message arrived on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum::Display)]
#[strum(serialize_all = "snake_case")]
pub enum BusSide {
    Upstream,
    Downstream,
}

/// Behaviour of an agent. Every method is required; a handler that cannot
/// serve a call kind returns [`AgentError::UnimplementedHandler`], which stops
/// the agent.
#[async_trait]
pub trait AgentHandler: Send + Sync + 'static {
    /// Field or simulation output of the downstream area.
    async fn on_measurement(&self, ctx: &AgentContext, message: Message) -> AgentResult<()>;

    async fn on_upstream_message(&self, ctx: &AgentContext, message: Message) -> AgentResult<()>;

    async fn on_downstream_message(&self, ctx: &AgentContext, message: Message) -> AgentResult<()>;

    /// Message on one of the agent's request queues.
    async fn on_request(&self, ctx: &AgentContext, side: BusSide, message: Message) -> AgentResult<()>;
}

/// Everything a handler knows about the agent it runs in. Built once the
/// topology is known.
pub struct AgentContext {
    pub(super) agent_id: String,
    pub(super) app_id: String,
    pub(super) description: String,
    pub(super) role: AgentRole,
    pub(super) upstream: BusClient,
    pub(super) downstream: BusClient,
    pub(super) platform: Option<BusClient>,
    pub(super) topology: AreaTopology,
    pub(super) simulation_id: Option<String>,
    pub(super) cim_profile: CimProfile,
}

impl AgentContext {
    pub fn agent_id(&self) -> &str {
        &self.agent_id
    }

    pub fn app_id(&self) -> &str {
        &self.app_id
    }

    pub fn role(&self) -> AgentRole {
        self.role
    }

    pub fn upstream(&self) -> &BusClient {
        &self.upstream
    }

    pub fn downstream(&self) -> &BusClient {
        &self.downstream
    }

    pub fn bus(&self, side: BusSide) -> &BusClient {
        match side {
            BusSide::Upstream => &self.upstream,
            BusSide::Downstream => &self.downstream,
        }
    }

    /// Connection to the central platform, if the agent was given one.
    pub fn platform(&self) -> Option<&BusClient> {
        self.platform.as_ref()
    }

    pub fn topology(&self) -> &AreaTopology {
        &self.topology
    }

    pub fn simulation_id(&self) -> Option<&str> {
        self.simulation_id.as_deref()
    }

    pub fn cim_profile(&self) -> &CimProfile {
        &self.cim_profile
    }

    pub fn registration_details(&self) -> AgentRegistrationDetails {
        AgentRegistrationDetails {
            agent_id: self.agent_id.clone(),
            app_id: self.app_id.clone(),
            description: self.description.clone(),
            upstream_message_bus_id: self.upstream.id().to_string(),
            downstream_message_bus_id: self.downstream.id().to_string(),
        }
    }

    pub async fn publish_upstream<T: Serialize + Sync + ?Sized>(&self, message: &T) -> AgentResult<()> {
        self.upstream
            .send(&topics::field_message_bus_topic(self.upstream.id()), message)
            .await?;
        Ok(())
    }

    pub async fn publish_downstream<T: Serialize + Sync + ?Sized>(&self, message: &T) -> AgentResult<()> {
        self.downstream
            .send(&topics::field_message_bus_topic(self.downstream.id()), message)
            .await?;
        Ok(())
    }

    /// Answers `request` on the bus it arrived on. False when it had no `reply-to`.
    pub async fn reply<T: Serialize + Sync + ?Sized>(
        &self,
        side: BusSide,
        request: &Message,
        response: &T,
    ) -> AgentResult<bool> {
        Ok(self.bus(side).reply(request, response).await?)
    }

    /// Sends the differences to the downstream context manager. Only agents
    /// running against a simulation send control commands; returns false
    /// otherwise.
    pub async fn send_control_command(&self, differences: &DifferenceBuilder) -> AgentResult<bool> {
        let Some(simulation_id) = self.simulation_id.as_deref() else {
            return Ok(false);
        };
        let mut command = differences.build(None);
        command
            .input
            .simulation_id
            .get_or_insert_with(|| simulation_id.to_string());
        ContextClient::new(self.downstream.clone())
            .send_control_command(command)
            .await?;
        Ok(true)
    }

    /// The error a handler returns for a call kind it does not serve.
    pub fn unimplemented(&self, kind: HandlerKind) -> AgentError {
        AgentError::UnimplementedHandler {
            kind,
            agent_id: self.agent_id.clone(),
        }
    }
}
