use async_trait::async_trait;
use parking_lot::RwLock;
use tracing::{debug, info, trace, warn};

use super::protocol::{AgentRoster, ContextRequest, ContextResponse, InitializedResponse};
use crate::{
    agent::{AgentContext, AgentHandler, AgentResult, BusSide},
    bus::{BusClient, Message},
    topics,
};

/// Answers the context protocol for one area.
///
/// Registrations are kept in a roster (seeded with the manager itself) and
/// passed on to the platform's registration queue. Control commands go to the
/// simulation input topic, on the platform bus when there is one and on the
/// bus the command arrived on otherwise.
#[derive(Default)]
pub struct ContextManager {
    roster: RwLock<AgentRoster>,
}

impl ContextManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn roster(&self) -> AgentRoster {
        self.roster.read().clone()
    }

    fn seed(&self, ctx: &AgentContext) {
        if !self.roster.read().contains_key(ctx.agent_id()) {
            self.roster
                .write()
                .entry(ctx.agent_id().to_string())
                .or_insert_with(|| ctx.registration_details());
        }
    }

    fn forward_bus<'a>(ctx: &'a AgentContext, side: BusSide) -> &'a BusClient {
        ctx.platform().unwrap_or_else(|| ctx.bus(side))
    }

    async fn handle(&self, ctx: &AgentContext, side: BusSide, message: &Message, request: ContextRequest) -> AgentResult<()> {
        self.seed(ctx);
        if request.expects_reply() && message.reply_to().is_none() {
            warn!(
                "Dropping {} request on {} without reply-to",
                request.request_type(),
                message.destination
            );
            return Ok(());
        }
        match request {
            ContextRequest::GetContext { .. } => {
                let response = ContextResponse {
                    data: ctx.topology().clone(),
                };
                ctx.reply(side, message, &response).await?;
            }
            ContextRequest::RegisterAgent { agent } => {
                info!("Registering agent {} with {}", agent.agent_id, ctx.agent_id());
                if let Some(platform) = ctx.platform() {
                    let forward = ContextRequest::RegisterAgent {
                        agent: agent.clone(),
                    };
                    platform.send(topics::REGISTER_AGENT_QUEUE, &forward).await?;
                } else {
                    debug!("No platform bus, registration of {} stays local", agent.agent_id);
                }
                self.roster.write().insert(agent.agent_id.clone(), agent);
            }
            ContextRequest::GetAgents => {
                let roster = self.roster();
                ctx.reply(side, message, &roster).await?;
            }
            ContextRequest::IsInitialized => {
                ctx.reply(side, message, &InitializedResponse { initialized: true })
                    .await?;
            }
            ContextRequest::ControlCommand(command) => {
                let Some(simulation_id) = command.input.simulation_id.clone() else {
                    warn!("Dropping control command without simulation id");
                    return Ok(());
                };
                let topic = topics::simulation_input_topic(&simulation_id);
                debug!("Forwarding control command to {}", topic);
                Self::forward_bus(ctx, side).send(&topic, &command).await?;
            }
        }
        Ok(())
    }
}

#[async_trait]
impl AgentHandler for ContextManager {
    async fn on_measurement(&self, ctx: &AgentContext, message: Message) -> AgentResult<()> {
        trace!("{} ignores measurement on {}", ctx.agent_id(), message.destination);
        Ok(())
    }

    async fn on_upstream_message(&self, ctx: &AgentContext, message: Message) -> AgentResult<()> {
        trace!("{} ignores upstream message on {}", ctx.agent_id(), message.destination);
        Ok(())
    }

    async fn on_downstream_message(&self, ctx: &AgentContext, message: Message) -> AgentResult<()> {
        trace!("{} ignores downstream message on {}", ctx.agent_id(), message.destination);
        Ok(())
    }

    async fn on_request(&self, ctx: &AgentContext, side: BusSide, message: Message) -> AgentResult<()> {
        debug!("Received request on {}: {}", message.destination, message.body);
        match message.json::<ContextRequest>() {
            Ok(request) => self.handle(ctx, side, &message, request).await,
            Err(e) => {
                let request_type = message
                    .json::<serde_json::Value>()
                    .ok()
                    .and_then(|v| v.get("request_type").and_then(|t| t.as_str()).map(str::to_string))
                    .unwrap_or_default();
                warn!("Ignoring request of type '{}': {}", request_type, e);
                Ok(())
            }
        }
    }
}
