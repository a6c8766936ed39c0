use std::{future::Future, time::Duration};

use tracing::{debug, instrument, warn};

use super::{
    protocol::{
        AgentRegistrationDetails, AgentRoster, ContextRequest, ContextResponse, ControlCommand,
        InitializedResponse,
    },
    ContextError, ContextResult,
};
use crate::{bus::BusClient, topics, topology::AreaTopology};

/// What a requester does when a context request times out. Errors other than
/// timeouts are always returned at once.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryPolicy {
    Propagate,
    /// Gives up after `attempts` requests in total.
    Retry { attempts: u32, backoff: Duration },
    RetryForever { backoff: Duration },
}

impl RetryPolicy {
    /// Pause before the next attempt after `attempt` failed ones, or None to give up.
    pub fn backoff_after(&self, attempt: u32) -> Option<Duration> {
        match *self {
            RetryPolicy::Propagate => None,
            RetryPolicy::Retry { attempts, backoff } => (attempt < attempts).then_some(backoff),
            RetryPolicy::RetryForever { backoff } => Some(backoff),
        }
    }
}

async fn with_retry<T, F, Fut>(policy: RetryPolicy, request_type: &str, mut request: F) -> ContextResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = ContextResult<T>>,
{
    let mut attempt = 0u32;
    loop {
        attempt += 1;
        match request().await {
            Err(e) if e.is_timeout() => match policy.backoff_after(attempt) {
                Some(backoff) => {
                    warn!(
                        "{} request timed out (attempt {}). Trying again in {:?}",
                        request_type, attempt, backoff
                    );
                    tokio::time::sleep(backoff).await;
                }
                None => return Err(e),
            },
            result => return result,
        }
    }
}

/// Requester side of the context protocol, bound to one bus.
#[derive(Clone)]
pub struct ContextClient {
    bus: BusClient,
    destination: String,
    timeout: Duration,
}

impl ContextClient {
    /// Client addressing the context manager of `bus`.
    pub fn new(bus: BusClient) -> Self {
        let destination = topics::context_request_queue(bus.id());
        let timeout = bus.config().request_timeout;
        Self {
            bus,
            destination,
            timeout,
        }
    }

    /// Client addressing another responder, such as the platform field service.
    pub fn with_destination(bus: BusClient, destination: impl Into<String>) -> Self {
        Self {
            destination: destination.into(),
            ..Self::new(bus)
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn destination(&self) -> &str {
        &self.destination
    }

    async fn request(&self, request: &ContextRequest) -> ContextResult<serde_json::Value> {
        let payload = self
            .bus
            .get_response(&self.destination, request, Some(self.timeout))
            .await?;
        match payload.as_json() {
            Some(value) => Ok(value.clone()),
            None => Err(ContextError::invalid_response(
                request.request_type(),
                "response is not JSON",
            )),
        }
    }

    /// Topology of `area_id`.
    #[instrument(skip(self), fields(destination = %self.destination))]
    pub async fn get_context(&self, area_id: &str, policy: RetryPolicy) -> ContextResult<AreaTopology> {
        self.fetch_context(ContextRequest::get_context(area_id), policy)
            .await
    }

    /// Topology of a whole feeder model, optionally narrowed to one area.
    pub async fn get_context_by_feeder(
        &self,
        model_id: &str,
        area_id: Option<&str>,
        policy: RetryPolicy,
    ) -> ContextResult<AreaTopology> {
        let request = ContextRequest::GetContext {
            area_id: area_id.map(str::to_string),
            model_id: Some(model_id.to_string()),
        };
        self.fetch_context(request, policy).await
    }

    async fn fetch_context(&self, request: ContextRequest, policy: RetryPolicy) -> ContextResult<AreaTopology> {
        let value = with_retry(policy, request.request_type(), || self.request(&request)).await?;
        let response: ContextResponse = serde_json::from_value(value)
            .map_err(|e| ContextError::invalid_response("get_context", e))?;
        debug!("Received topology for {}", response.data.id);
        Ok(response.data)
    }

    #[instrument(skip(self), fields(destination = %self.destination))]
    pub async fn get_agents(&self, policy: RetryPolicy) -> ContextResult<AgentRoster> {
        let request = ContextRequest::GetAgents;
        let value = with_retry(policy, request.request_type(), || self.request(&request)).await?;
        serde_json::from_value(value).map_err(|e| ContextError::invalid_response("get_agents", e))
    }

    pub async fn is_initialized(&self, policy: RetryPolicy) -> ContextResult<bool> {
        let request = ContextRequest::IsInitialized;
        let value = with_retry(policy, request.request_type(), || self.request(&request)).await?;
        let response: InitializedResponse = serde_json::from_value(value)
            .map_err(|e| ContextError::invalid_response("is_initialized", e))?;
        Ok(response.initialized)
    }

    /// Fire-and-forget. The context manager forwards the command to the
    /// simulation input topic.
    pub async fn send_control_command(&self, command: ControlCommand) -> ContextResult<()> {
        if command.input.simulation_id.is_none() {
            return Err(ContextError::MissingSimulationId);
        }
        self.bus
            .send(&self.destination, &ContextRequest::ControlCommand(command))
            .await?;
        Ok(())
    }

    /// Announces an agent to the context managers of both its buses. A bus
    /// shared by both sides is told once.
    pub async fn register_agent(
        downstream: &BusClient,
        upstream: &BusClient,
        details: AgentRegistrationDetails,
    ) -> ContextResult<()> {
        let request = ContextRequest::RegisterAgent { agent: details };
        downstream
            .send(&topics::context_request_queue(downstream.id()), &request)
            .await?;
        if upstream.id() != downstream.id() {
            upstream
                .send(&topics::context_request_queue(upstream.id()), &request)
                .await?;
        }
        Ok(())
    }
}
