//! # Area Agents
//!
//! An [`AreaAgent`] sits between two buses of the grid hierarchy: the bus of
//! the area above it (upstream) and the bus of the area it serves
//! (downstream). Starting an agent walks it through
//!
//! ```text
//! Constructed → BootstrappingTopology → Subscribed → Registered → Connected → Disconnected
//! ```
//!
//! Behaviour lives in an [`AgentHandler`]. The role (area kind plus whether
//! the agent is its area's context manager) only changes addressing and which
//! channels are wired.

mod area;
mod coordinating;
mod handler;
mod interceptor;
mod role;

pub use area::{AgentState, AreaAgent, AreaAgentBuilder, DistributedAgent};
pub use coordinating::CoordinatingAgent;
pub use handler::{AgentContext, AgentHandler, BusSide, HandlerKind};
pub use interceptor::{CallCounter, HandlerInterceptor, PayloadSizeRecorder};
pub use role::{derive_agent_id, AgentRole, AreaKind};

use thiserror::Error;

use crate::{bus::BusError, config::ConfigError, context::ContextError};

#[derive(Error, Debug)]
pub enum AgentError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),
    #[error("Bus error: {0}")]
    Bus(#[from] BusError),
    #[error("Context error: {0}")]
    Context(#[from] ContextError),
    #[error("{kind} handler is not implemented by agent {agent_id}")]
    UnimplementedHandler { kind: HandlerKind, agent_id: String },
    #[error("Agent {agent_id} cannot {operation} while {state}")]
    InvalidState {
        agent_id: String,
        operation: &'static str,
        state: AgentState,
    },
    #[error("Handler failed: {0}")]
    Handler(String),
}

impl AgentError {
    pub fn is_timeout(&self) -> bool {
        match self {
            AgentError::Bus(e) => e.is_timeout(),
            AgentError::Context(e) => e.is_timeout(),
            _ => false,
        }
    }

    /// Faults that stop the agent instead of being logged and skipped.
    pub fn is_fatal(&self) -> bool {
        matches!(self, AgentError::UnimplementedHandler { .. })
    }
}

pub type AgentResult<T> = Result<T, AgentError>;
