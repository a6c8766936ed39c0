//! In-process broker.
//!
//! Every [`MemoryTransport`] attached to one [`InMemoryBroker`] sees every
//! message published on it and delivers those matching its subscriptions.
//! Queue destinations are delivered to every subscriber, not load-balanced.

use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use tokio::{sync::broadcast, task::JoinHandle};
use tracing::{debug, trace, warn};

use super::{
    message::{Headers, Message},
    pattern::TopicPattern,
    transport::{
        Credentials, MessageHandler, MessageTransport, SubscriptionHandle, TransportError,
        TransportResult,
    },
};
use crate::topics::normalize_destination;

const DEFAULT_CAPACITY: usize = 1024;

/// How a connection authenticated itself.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Login {
    Anonymous,
    Basic { user: String },
    Token { user: String },
}

pub struct InMemoryBroker {
    sender: broadcast::Sender<Message>,
    logins: Mutex<Vec<Login>>,
    history: Option<Mutex<Vec<Message>>>,
}

impl Default for InMemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryBroker {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(DEFAULT_CAPACITY);
        Self {
            sender,
            logins: Mutex::new(Vec::new()),
            history: None,
        }
    }

    /// A broker that also records every published message.
    pub fn with_history() -> Self {
        Self {
            history: Some(Mutex::new(Vec::new())),
            ..Self::new()
        }
    }

    fn publish(&self, message: Message) {
        if let Some(history) = &self.history {
            history.lock().push(message.clone());
        }
        // 受信者がいない場合は破棄される
        if self.sender.send(message).is_err() {
            trace!("Message published with no connected receivers");
        }
    }

    fn attach(&self) -> broadcast::Receiver<Message> {
        self.sender.subscribe()
    }

    fn record_login(&self, login: Login) {
        self.logins.lock().push(login);
    }

    pub fn logins(&self) -> Vec<Login> {
        self.logins.lock().clone()
    }

    /// Messages published to `destination`. Empty unless built with history.
    pub fn published_to(&self, destination: &str) -> Vec<Message> {
        let destination = normalize_destination(destination);
        self.history
            .as_ref()
            .map(|h| {
                h.lock()
                    .iter()
                    .filter(|m| m.destination == destination)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn history(&self) -> Vec<Message> {
        self.history
            .as_ref()
            .map(|h| h.lock().clone())
            .unwrap_or_default()
    }
}

struct Subscription {
    handle: SubscriptionHandle,
    pattern: TopicPattern,
    handler: MessageHandler,
}

type SubscriptionTable = Arc<RwLock<Vec<Subscription>>>;

pub struct MemoryTransport {
    broker: Arc<InMemoryBroker>,
    connected: AtomicBool,
    subscriptions: SubscriptionTable,
    pump: Mutex<Option<JoinHandle<()>>>,
}

impl MemoryTransport {
    pub fn new(broker: Arc<InMemoryBroker>) -> Self {
        Self {
            broker,
            connected: AtomicBool::new(false),
            subscriptions: Arc::new(RwLock::new(Vec::new())),
            pump: Mutex::new(None),
        }
    }
}

async fn pump_loop(mut rx: broadcast::Receiver<Message>, subscriptions: SubscriptionTable) {
    loop {
        match rx.recv().await {
            Ok(message) => deliver(&subscriptions, message),
            Err(broadcast::error::RecvError::Lagged(n)) => {
                warn!("In-memory transport lagged, {} messages skipped", n);
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

/// Calls each distinct handler whose subscription matches, once.
fn deliver(subscriptions: &SubscriptionTable, message: Message) {
    let handlers: Vec<MessageHandler> = {
        let table = subscriptions.read();
        let mut handlers: Vec<MessageHandler> = Vec::new();
        for sub in table.iter().filter(|s| s.pattern.matches(&message.destination)) {
            if !handlers.iter().any(|h| Arc::ptr_eq(h, &sub.handler)) {
                handlers.push(sub.handler.clone());
            }
        }
        handlers
    };
    for handler in handlers {
        handler(message.clone());
    }
}

#[async_trait]
impl MessageTransport for MemoryTransport {
    async fn connect(&self, credentials: &Credentials) -> TransportResult<()> {
        let mut pump = self.pump.lock();
        if pump.is_some() {
            return Ok(());
        }
        let login = match credentials {
            Credentials::Anonymous => Login::Anonymous,
            Credentials::Basic { user, .. } => Login::Basic { user: user.clone() },
            Credentials::Token { user, .. } => Login::Token { user: user.clone() },
        };
        debug!("In-memory transport connecting as {:?}", login);
        self.broker.record_login(login);
        *pump = Some(tokio::spawn(pump_loop(
            self.broker.attach(),
            self.subscriptions.clone(),
        )));
        self.connected.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn disconnect(&self) -> TransportResult<()> {
        if let Some(pump) = self.pump.lock().take() {
            pump.abort();
        }
        self.subscriptions.write().clear();
        self.connected.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn publish(&self, destination: &str, headers: &Headers, body: &str) -> TransportResult<()> {
        if !self.is_connected() {
            return Err(TransportError::NotConnected);
        }
        self.broker.publish(Message {
            destination: normalize_destination(destination),
            headers: headers.clone(),
            body: body.to_string(),
        });
        Ok(())
    }

    async fn subscribe(
        &self,
        destination: &str,
        handler: MessageHandler,
    ) -> TransportResult<SubscriptionHandle> {
        if !self.is_connected() {
            return Err(TransportError::NotConnected);
        }
        let pattern =
            TopicPattern::parse(destination).map_err(|e| TransportError::Protocol(e.to_string()))?;
        let handle = SubscriptionHandle::new();
        self.subscriptions.write().push(Subscription {
            handle: handle.clone(),
            pattern,
            handler,
        });
        Ok(handle)
    }

    async fn unsubscribe(&self, handle: &SubscriptionHandle) -> TransportResult<()> {
        let mut table = self.subscriptions.write();
        let before = table.len();
        table.retain(|s| &s.handle != handle);
        if table.len() == before {
            return Err(TransportError::SubscriptionNotFound(handle.to_string()));
        }
        Ok(())
    }

    fn supports_concurrent_publish(&self) -> bool {
        true
    }
}

impl Drop for MemoryTransport {
    fn drop(&mut self) {
        if let Some(pump) = self.pump.lock().take() {
            pump.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::time::sleep;

    fn collector() -> (MessageHandler, Arc<Mutex<Vec<Message>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let handler: MessageHandler = Arc::new(move |m: Message| sink.lock().push(m));
        (handler, seen)
    }

    #[tokio::test]
    async fn test_publish_requires_connection() {
        let transport = MemoryTransport::new(Arc::new(InMemoryBroker::new()));
        let err = transport
            .publish("/topic/a", &Headers::new(), "x")
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::NotConnected));
    }

    #[tokio::test]
    async fn test_overlapping_subscriptions_deliver_once() {
        let broker = Arc::new(InMemoryBroker::new());
        let sub = MemoryTransport::new(broker.clone());
        let publisher = MemoryTransport::new(broker.clone());
        sub.connect(&Credentials::Anonymous).await.unwrap();
        publisher.connect(&Credentials::Anonymous).await.unwrap();

        let (handler, seen) = collector();
        sub.subscribe("/topic/a.b", handler.clone()).await.unwrap();
        sub.subscribe("/topic/a.>", handler).await.unwrap();

        publisher
            .publish("/topic/a.b", &Headers::new(), "hello")
            .await
            .unwrap();
        sleep(Duration::from_millis(50)).await;

        assert_eq!(seen.lock().len(), 1);
    }

    #[tokio::test]
    async fn test_unsubscribe_stops_delivery() {
        let broker = Arc::new(InMemoryBroker::with_history());
        let transport = MemoryTransport::new(broker.clone());
        transport.connect(&Credentials::Anonymous).await.unwrap();

        let (handler, seen) = collector();
        let handle = transport.subscribe("foo", handler).await.unwrap();
        transport.unsubscribe(&handle).await.unwrap();
        assert!(transport.unsubscribe(&handle).await.is_err());

        transport.publish("foo", &Headers::new(), "x").await.unwrap();
        sleep(Duration::from_millis(50)).await;

        assert!(seen.lock().is_empty());
        assert_eq!(broker.published_to("/queue/foo").len(), 1);
    }

    #[tokio::test]
    async fn test_connect_is_idempotent() {
        let broker = Arc::new(InMemoryBroker::new());
        let transport = MemoryTransport::new(broker.clone());
        transport.connect(&Credentials::Anonymous).await.unwrap();
        transport.connect(&Credentials::Anonymous).await.unwrap();
        assert_eq!(broker.logins(), vec![Login::Anonymous]);

        transport.disconnect().await.unwrap();
        transport.disconnect().await.unwrap();
        assert!(!transport.is_connected());
    }
}
