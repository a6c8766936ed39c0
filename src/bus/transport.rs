use std::{fmt, sync::Arc};

use async_trait::async_trait;
use dashmap::DashMap;
use mockall::automock;
use secrecy::SecretString;
use thiserror::Error;
use tracing::debug;
use uuid::Uuid;

use super::{
    memory::{InMemoryBroker, MemoryTransport},
    message::{Headers, Message},
    stomp::StompTransport,
};
use crate::config::{
    ConfigError, ConfigResult, MessageBusDefinition, ARG_ADDRESS, ARG_PASSWORD, ARG_USER,
    CONNECTION_TYPE_GRIDAPPSD, CONNECTION_TYPE_MEMORY,
};

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("Connection failed: {0}")]
    Connection(String),
    #[error("Transport is not connected")]
    NotConnected,
    #[error("Protocol error: {0}")]
    Protocol(String),
    #[error("Unknown subscription: {0}")]
    SubscriptionNotFound(String),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type TransportResult<T> = Result<T, TransportError>;

/// Receives every message delivered for a subscription.
pub type MessageHandler = Arc<dyn Fn(Message) + Send + Sync>;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SubscriptionHandle(String);

impl SubscriptionHandle {
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for SubscriptionHandle {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SubscriptionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug)]
pub enum Credentials {
    Anonymous,
    Basic { user: String, password: SecretString },
    /// Bearer token obtained through the token handshake.
    Token { user: String, token: SecretString },
}

impl Credentials {
    pub fn from_definition(definition: &MessageBusDefinition) -> Self {
        match definition.arg(ARG_USER) {
            Some(user) => Credentials::Basic {
                user,
                password: SecretString::from(definition.arg(ARG_PASSWORD).unwrap_or_default()),
            },
            None => Credentials::Anonymous,
        }
    }

    pub fn user(&self) -> Option<&str> {
        match self {
            Credentials::Anonymous => None,
            Credentials::Basic { user, .. } | Credentials::Token { user, .. } => Some(user),
        }
    }
}

/// Connection to a broker.
///
/// `connect` and `disconnect` are idempotent. `publish` is fire-and-forget and
/// keeps per-destination order. A subscription delivers each matching message
/// once to its handler, even when several subscriptions of the same
/// connection match it.
#[automock]
#[async_trait]
pub trait MessageTransport: Send + Sync {
    async fn connect(&self, credentials: &Credentials) -> TransportResult<()>;

    async fn disconnect(&self) -> TransportResult<()>;

    fn is_connected(&self) -> bool;

    async fn publish(&self, destination: &str, headers: &Headers, body: &str)
        -> TransportResult<()>;

    async fn subscribe(
        &self,
        destination: &str,
        handler: MessageHandler,
    ) -> TransportResult<SubscriptionHandle>;

    async fn unsubscribe(&self, handle: &SubscriptionHandle) -> TransportResult<()>;

    /// Whether `publish` may be called concurrently without external locking.
    fn supports_concurrent_publish(&self) -> bool {
        false
    }
}

pub type TransportFactory =
    Arc<dyn Fn(&MessageBusDefinition) -> ConfigResult<Arc<dyn MessageTransport>> + Send + Sync>;

struct TransportEntry {
    required_args: Vec<String>,
    factory: TransportFactory,
}

/// Creates transports from bus definitions by `connection_type`.
pub struct TransportRegistry {
    entries: DashMap<String, TransportEntry>,
}

impl Default for TransportRegistry {
    fn default() -> Self {
        let registry = Self::empty();
        registry.register(
            CONNECTION_TYPE_GRIDAPPSD,
            &[ARG_ADDRESS, ARG_USER, ARG_PASSWORD],
            Arc::new(|definition| {
                let transport: Arc<dyn MessageTransport> =
                    Arc::new(StompTransport::from_definition(definition)?);
                Ok(transport)
            }),
        );
        registry
    }
}

impl TransportRegistry {
    pub fn empty() -> Self {
        Self {
            entries: DashMap::new(),
        }
    }

    /// Default registry plus the in-process transport bound to `broker`.
    pub fn with_memory_broker(broker: Arc<InMemoryBroker>) -> Self {
        let registry = Self::default();
        registry.register(
            CONNECTION_TYPE_MEMORY,
            &[],
            Arc::new(move |_| {
                let transport: Arc<dyn MessageTransport> =
                    Arc::new(MemoryTransport::new(broker.clone()));
                Ok(transport)
            }),
        );
        registry
    }

    pub fn register(&self, connection_type: &str, required_args: &[&str], factory: TransportFactory) {
        debug!("Registering transport for {}", connection_type);
        self.entries.insert(
            connection_type.to_string(),
            TransportEntry {
                required_args: required_args.iter().map(|s| s.to_string()).collect(),
                factory,
            },
        );
    }

    pub fn create(&self, definition: &MessageBusDefinition) -> ConfigResult<Arc<dyn MessageTransport>> {
        let entry = self
            .entries
            .get(definition.connection_type())
            .ok_or_else(|| ConfigError::UnknownConnectionType {
                connection_type: definition.connection_type().to_string(),
            })?;
        for key in &entry.required_args {
            definition.require_arg(key)?;
        }
        (entry.factory)(definition)
    }

    pub fn connection_types(&self) -> Vec<String> {
        self.entries.iter().map(|e| e.key().clone()).collect()
    }
}
