//! # gridbus
//!
//! Pub/sub client and agent hierarchy for distributed grid applications.
//!
//! ```text
//! CoordinatingAgent ── system bus
//!   └─ AreaAgent (feeder) ── upstream bus / downstream bus
//!        └─ AreaAgent (switch area)
//!             └─ AreaAgent (secondary area)
//! ```
//!
//! - [`bus`]: transports, topic routing and request/response over pub/sub
//! - [`topics`]: canonical topic and queue names
//! - [`context`]: the context protocol agents rendezvous with
//! - [`agent`]: area agents and their lifecycle
//! - [`config`]: bus definitions and tunables

pub mod agent;
pub mod bus;
pub mod config;
pub mod context;
pub mod error;
pub mod topics;
pub mod topology;

pub use agent::{
    AgentContext, AgentError, AgentHandler, AgentResult, AgentRole, AgentState, AreaAgent,
    AreaKind, BusSide, CoordinatingAgent, DistributedAgent, HandlerKind,
};
pub use bus::{BusClient, BusError, BusResult, Callback, Message, Payload, TopicRouter};
pub use config::{ConfigError, ConfigResult, MessageBusDefinition, MessageBusDefinitions};
pub use context::{ContextClient, ContextError, ContextManager, ContextResult, RetryPolicy};
pub use error::*;
pub use topology::AreaTopology;
