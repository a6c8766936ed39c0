//! # Context Protocol
//!
//! The request vocabulary agents use to find out where they sit in the grid
//! and who their neighbours are. Requests go to the per-bus context request
//! queue (`topics::context_request_queue`); only context-manager agents answer
//! them.
//!
//! - [`ContextClient`]: requester side, with an explicit [`RetryPolicy`].
//! - [`ContextManager`]: responder side, an [`AgentHandler`](crate::agent::AgentHandler).
//! - [`DifferenceBuilder`]: builds the payload of a `control_command`.

mod client;
mod difference;
mod manager;
mod protocol;

pub use client::{ContextClient, RetryPolicy};
pub use difference::{Difference, DifferenceBuilder, DifferenceMessage};
pub use manager::ContextManager;
pub use protocol::{
    AgentRegistrationDetails, AgentRoster, ContextRequest, ContextResponse, ControlCommand,
    ControlInput, InitializedResponse,
};

use thiserror::Error;

use crate::{bus::BusError, config::ConfigError};

#[derive(Error, Debug)]
pub enum ContextError {
    #[error("Bus error: {0}")]
    Bus(#[from] BusError),
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),
    #[error("Invalid {request_type} response: {reason}")]
    InvalidResponse {
        request_type: &'static str,
        reason: String,
    },
    #[error("Control command has no simulation id")]
    MissingSimulationId,
}

impl ContextError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, ContextError::Bus(e) if e.is_timeout())
    }

    pub(crate) fn invalid_response(request_type: &'static str, reason: impl ToString) -> Self {
        ContextError::InvalidResponse {
            request_type,
            reason: reason.to_string(),
        }
    }
}

pub type ContextResult<T> = Result<T, ContextError>;
