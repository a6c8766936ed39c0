use thiserror::Error;

use crate::agent::AgentError;
use crate::bus::{BusError, RouterError, TransportError};
use crate::config::ConfigError;
use crate::context::ContextError;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Config error: {0}")]
    Config(#[from] ConfigError),
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),
    #[error("Router error: {0}")]
    Router(#[from] RouterError),
    #[error("Bus error: {0}")]
    Bus(#[from] BusError),
    #[error("Context error: {0}")]
    Context(#[from] ContextError),
    #[error("Agent error: {0}")]
    Agent(#[from] AgentError),

    #[error("Internal error: {0}")]
    Internal(String),
}

pub type InternalResult<T> = Result<T, Error>;

impl Error {
    pub fn internal<S: Into<String>>(message: S) -> Self {
        Error::Internal(message.into())
    }

    /// True when the underlying failure is a request timeout, at any nesting level.
    pub fn is_timeout(&self) -> bool {
        match self {
            Error::Bus(e) => e.is_timeout(),
            Error::Context(e) => e.is_timeout(),
            Error::Agent(e) => e.is_timeout(),
            _ => false,
        }
    }
}
