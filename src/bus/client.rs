//! # Bus Client
//!
//! Owns one transport and, once anything is subscribed, one [`TopicRouter`]
//! installed as the transport's only message handler for this client.
//!
//! ## Request/response
//!
//! `get_response` subscribes a fresh `/temp-queue/response.<uuid>` reply
//! destination, publishes the request with a `reply-to` header and waits for
//! the first reply. The reply subscription is removed on every exit path,
//! including when the returned future is dropped.
//!
//! Reply destinations are subscribed on the transport directly and complete
//! the waiting request from the receive path. They never enter the router
//! queue, so a callback may issue a request on its own bus while it holds the
//! only dispatch worker.
//!
//! ## Token authentication
//!
//! With token auth enabled, `connect` logs in with basic credentials, asks the
//! token service for a bearer token and reconnects with it. Running out of
//! attempts is an error.

use std::{collections::HashMap, sync::Arc, time::Duration};

use base64::{engine::general_purpose::STANDARD, Engine as _};
use parking_lot::Mutex;
use secrecy::{ExposeSecret, SecretString};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::{mpsc, Mutex as AsyncMutex};
use tracing::{debug, info, instrument, trace, warn};
use uuid::Uuid;

use super::{
    message::{encode_body, Headers, Message, Payload, REPLY_TO},
    request::PendingRequests,
    router::{Callback, RouterError, TopicRouter},
    transport::{
        Credentials, MessageHandler, MessageTransport, SubscriptionHandle, TransportError,
        TransportRegistry,
    },
};
use crate::{
    config::{BusClientConfig, ConfigError, MessageBusDefinition, ARG_USER, ARG_USE_TOKEN_AUTH},
    topics::{self, normalize_destination},
};

#[derive(Error, Debug)]
pub enum BusError {
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),
    #[error("Router error: {0}")]
    Router(#[from] RouterError),
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),
    #[error("Request {request_id} timed out after {timeout:?}")]
    Timeout { request_id: String, timeout: Duration },
    #[error("Response channel closed")]
    ChannelClosed,
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("Token authentication failed after {attempts} attempts")]
    AuthFailed { attempts: u32 },
}

impl BusError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, BusError::Timeout { .. })
    }
}

pub type BusResult<T> = Result<T, BusError>;

struct Routing {
    router: Arc<TopicRouter>,
    inlet: MessageHandler,
}

struct BusClientInner {
    id: String,
    transport: Arc<dyn MessageTransport>,
    credentials: Credentials,
    use_token_auth: bool,
    config: BusClientConfig,
    routing: Mutex<Option<Routing>>,
    subscriptions: AsyncMutex<HashMap<String, SubscriptionHandle>>,
    requests: PendingRequests,
    send_lock: AsyncMutex<()>,
}

/// Handle to one bus. Clones share the connection.
#[derive(Clone)]
pub struct BusClient {
    inner: Arc<BusClientInner>,
}

pub struct BusClientBuilder {
    id: String,
    transport: Arc<dyn MessageTransport>,
    credentials: Credentials,
    use_token_auth: bool,
    config: BusClientConfig,
}

impl BusClientBuilder {
    pub fn credentials(mut self, credentials: Credentials) -> Self {
        self.credentials = credentials;
        self
    }

    pub fn token_auth(mut self, enabled: bool) -> Self {
        self.use_token_auth = enabled;
        self
    }

    pub fn config(mut self, config: BusClientConfig) -> Self {
        self.config = config;
        self
    }

    pub fn build(self) -> BusClient {
        BusClient {
            inner: Arc::new(BusClientInner {
                id: self.id,
                transport: self.transport,
                credentials: self.credentials,
                use_token_auth: self.use_token_auth,
                config: self.config,
                routing: Mutex::new(None),
                subscriptions: AsyncMutex::new(HashMap::new()),
                requests: PendingRequests::new(),
                send_lock: AsyncMutex::new(()),
            }),
        }
    }
}

impl BusClient {
    pub fn builder(id: impl Into<String>, transport: Arc<dyn MessageTransport>) -> BusClientBuilder {
        BusClientBuilder {
            id: id.into(),
            transport,
            credentials: Credentials::Anonymous,
            use_token_auth: false,
            config: BusClientConfig::default(),
        }
    }

    /// Builds a client for `definition`, creating its transport through `registry`.
    pub fn from_definition(
        definition: &MessageBusDefinition,
        registry: &TransportRegistry,
        config: BusClientConfig,
    ) -> BusResult<Self> {
        let transport = registry.create(definition)?;
        Ok(Self::builder(definition.id(), transport)
            .credentials(Credentials::from_definition(definition))
            .token_auth(definition.flag(ARG_USE_TOKEN_AUTH))
            .config(config)
            .build())
    }

    pub fn id(&self) -> &str {
        &self.inner.id
    }

    pub fn is_connected(&self) -> bool {
        self.inner.transport.is_connected()
    }

    pub fn config(&self) -> &BusClientConfig {
        &self.inner.config
    }

    #[instrument(skip(self), fields(bus = %self.inner.id))]
    pub async fn connect(&self) -> BusResult<()> {
        if self.inner.use_token_auth {
            self.connect_with_token().await?;
        } else {
            self.inner.transport.connect(&self.inner.credentials).await?;
        }
        info!("Connected to bus {}", self.inner.id);
        Ok(())
    }

    async fn connect_with_token(&self) -> BusResult<()> {
        let transport = &self.inner.transport;
        transport.connect(&self.inner.credentials).await?;
        let token = match self.request_token().await {
            Ok(token) => token,
            Err(e) => {
                let _ = transport.disconnect().await;
                return Err(e);
            }
        };
        transport.disconnect().await?;
        let user = self.inner.credentials.user().unwrap_or_default().to_string();
        transport
            .connect(&Credentials::Token {
                user,
                token: SecretString::from(token),
            })
            .await?;
        debug!("Bus {} reconnected with token", self.inner.id);
        Ok(())
    }

    async fn request_token(&self) -> BusResult<String> {
        let Credentials::Basic { user, password } = &self.inner.credentials else {
            return Err(ConfigError::MissingConnectionArg {
                bus: self.inner.id.clone(),
                key: ARG_USER.to_string(),
            }
            .into());
        };
        let auth = &self.inner.config.auth;
        let transport = &self.inner.transport;

        let reply_queue = normalize_destination(&topics::token_reply_queue(
            user,
            &Uuid::new_v4().simple().to_string(),
        ));
        let (tx, mut rx) = mpsc::unbounded_channel::<String>();
        let handler: MessageHandler = Arc::new(move |m: Message| {
            let _ = tx.send(m.body);
        });
        let handle = transport.subscribe(&reply_queue, handler).await?;

        let credentials = STANDARD.encode(format!("{}:{}", user, password.expose_secret()));
        let mut headers = Headers::new();
        headers.insert(REPLY_TO.to_string(), reply_queue);

        let mut token = None;
        for attempt in 1..=auth.retries {
            transport
                .publish(&auth.token_topic, &headers, &credentials)
                .await?;
            match tokio::time::timeout(auth.retry_interval, rx.recv()).await {
                Ok(Some(body)) if !body.trim().is_empty() => {
                    token = Some(body.trim().to_string());
                    break;
                }
                Ok(Some(_)) => warn!("Empty token received on attempt {}", attempt),
                Ok(None) => break,
                Err(_) => debug!("No token after attempt {}", attempt),
            }
        }

        if let Err(e) = transport.unsubscribe(&handle).await {
            debug!("Failed to drop token subscription: {}", e);
        }
        token.ok_or(BusError::AuthFailed {
            attempts: auth.retries,
        })
    }

    /// Stops dispatch, drops every subscription and disconnects the transport.
    pub async fn disconnect(&self) -> BusResult<()> {
        let mut subscriptions = self.inner.subscriptions.lock().await;
        let routing = self.inner.routing.lock().take();
        if let Some(routing) = routing {
            routing.router.shutdown();
        }
        subscriptions.clear();
        self.inner.transport.disconnect().await?;
        info!("Disconnected from bus {}", self.inner.id);
        Ok(())
    }

    pub async fn send<T: Serialize + Sync + ?Sized>(&self, topic: &str, message: &T) -> BusResult<()> {
        self.send_with_headers(topic, message, Headers::new()).await
    }

    pub async fn send_with_headers<T: Serialize + Sync + ?Sized>(
        &self,
        topic: &str,
        message: &T,
        headers: Headers,
    ) -> BusResult<()> {
        let body = encode_body(message)?;
        let destination = normalize_destination(topic);
        trace!("Sending to {} on bus {}", destination, self.inner.id);
        let transport = &self.inner.transport;
        if transport.supports_concurrent_publish() {
            transport.publish(&destination, &headers, &body).await?;
        } else {
            let _guard = self.inner.send_lock.lock().await;
            transport.publish(&destination, &headers, &body).await?;
        }
        Ok(())
    }

    /// Sends `response` to the `reply-to` destination of `request`. Returns
    /// false when the request carried none.
    pub async fn reply<T: Serialize + Sync + ?Sized>(&self, request: &Message, response: &T) -> BusResult<bool> {
        match request.reply_to() {
            Some(destination) => {
                self.send(destination, response).await?;
                Ok(true)
            }
            None => {
                warn!("Request on {} has no reply-to header", request.destination);
                Ok(false)
            }
        }
    }

    fn routing(&self) -> (Arc<TopicRouter>, MessageHandler) {
        let mut routing = self.inner.routing.lock();
        let routing = routing.get_or_insert_with(|| {
            let router = Arc::new(TopicRouter::new(self.inner.config.dispatch_workers));
            let target = router.clone();
            let bus = self.inner.id.clone();
            let inlet: MessageHandler = Arc::new(move |message: Message| {
                if let Err(e) = target.on_message(message) {
                    warn!("Dropping message on bus {}: {}", bus, e);
                }
            });
            debug!("Installed router on bus {}", self.inner.id);
            Routing { router, inlet }
        });
        (routing.router.clone(), routing.inlet.clone())
    }

    pub async fn subscribe(&self, topic: &str, callback: Callback) -> BusResult<()> {
        let destination = normalize_destination(topic);
        let mut subscriptions = self.inner.subscriptions.lock().await;
        let (router, inlet) = self.routing();

        if router.add_callback(&destination, callback.clone())? {
            match self.inner.transport.subscribe(&destination, inlet).await {
                Ok(handle) => {
                    subscriptions.insert(destination.clone(), handle);
                }
                Err(e) => {
                    let _ = router.remove_callback(&destination, &callback);
                    return Err(e.into());
                }
            }
        }
        debug!("Subscribed to {} on bus {}", destination, self.inner.id);
        Ok(())
    }

    pub async fn unsubscribe(&self, topic: &str, callback: &Callback) -> BusResult<()> {
        let destination = normalize_destination(topic);
        let mut subscriptions = self.inner.subscriptions.lock().await;
        let router = self
            .inner
            .routing
            .lock()
            .as_ref()
            .map(|r| r.router.clone())
            .ok_or_else(|| RouterError::CallbackNotFound {
                topic: destination.clone(),
            })?;

        if router.remove_callback(&destination, callback)? {
            if let Some(handle) = subscriptions.remove(&destination) {
                match self.inner.transport.unsubscribe(&handle).await {
                    Ok(()) | Err(TransportError::NotConnected) => {}
                    Err(e) => return Err(e.into()),
                }
            }
        }
        debug!("Unsubscribed from {} on bus {}", destination, self.inner.id);
        Ok(())
    }

    /// Destinations with at least one callback.
    pub fn subscriptions(&self) -> Vec<String> {
        self.inner
            .routing
            .lock()
            .as_ref()
            .map(|r| r.router.patterns())
            .unwrap_or_default()
    }

    pub fn has_subscription(&self, topic: &str) -> bool {
        self.inner
            .routing
            .lock()
            .as_ref()
            .map(|r| r.router.has_pattern(topic))
            .unwrap_or(false)
    }

    pub fn pending_requests(&self) -> usize {
        self.inner.requests.len()
    }

    /// Sends `message` to `topic` and waits for the reply. `timeout` falls
    /// back to the configured request timeout.
    #[instrument(skip(self, message), fields(bus = %self.inner.id))]
    pub async fn get_response<T: Serialize + Sync + ?Sized>(
        &self,
        topic: &str,
        message: &T,
        timeout: Option<Duration>,
    ) -> BusResult<Payload> {
        let timeout = timeout.unwrap_or(self.inner.config.request_timeout);
        let request_id = Uuid::new_v4().to_string();
        let (reply_topic, rx) = self.inner.requests.register(&request_id);

        let handler: MessageHandler = {
            let requests = self.inner.requests.clone();
            let id = request_id.clone();
            Arc::new(move |m: Message| {
                if !requests.complete(&id, m) {
                    trace!("Late reply for {}", id);
                }
            })
        };
        let mut guard = ReplyGuard {
            client: Some(self.clone()),
            handle: None,
            request_id: request_id.clone(),
        };

        let reply_topic = normalize_destination(&reply_topic);
        guard.handle = Some(self.inner.transport.subscribe(&reply_topic, handler).await?);
        let mut headers = Headers::new();
        headers.insert(REPLY_TO.to_string(), reply_topic);
        self.send_with_headers(topic, message, headers).await?;

        let result = self
            .inner
            .requests
            .await_response(&request_id, timeout, rx)
            .await;
        guard.release().await;
        Ok(result?.payload())
    }
}

/// Removes a reply subscription when `get_response` exits, however it exits.
struct ReplyGuard {
    client: Option<BusClient>,
    handle: Option<SubscriptionHandle>,
    request_id: String,
}

impl ReplyGuard {
    async fn release(mut self) {
        if let Some(client) = self.client.take() {
            client.inner.requests.cancel(&self.request_id);
            if let Some(handle) = self.handle.take() {
                client.drop_reply_subscription(handle).await;
            }
        }
    }
}

impl Drop for ReplyGuard {
    fn drop(&mut self) {
        let Some(client) = self.client.take() else {
            return;
        };
        client.inner.requests.cancel(&self.request_id);
        let Some(handle) = self.handle.take() else {
            return;
        };
        if let Ok(runtime) = tokio::runtime::Handle::try_current() {
            runtime.spawn(async move { client.drop_reply_subscription(handle).await });
        }
    }
}

impl BusClient {
    async fn drop_reply_subscription(&self, handle: SubscriptionHandle) {
        match self.inner.transport.unsubscribe(&handle).await {
            Ok(()) | Err(TransportError::NotConnected) => {}
            Err(e) => debug!("Reply subscription {} cleanup: {}", handle, e),
        }
    }
}
