//! # Topic Router
//!
//! Maps inbound destinations to registered callbacks and dispatches them off
//! the transport's receive path.
//!
//! ## Matching
//!
//! - Exact subscriptions are looked up by destination.
//! - Wildcard subscriptions (`*`, `>`) are tried in registration order.
//! - If any exact subscription exists for a destination, wildcard
//!   subscriptions are not consulted for it.
//!
//! ## Dispatch
//!
//! `on_message` only enqueues. A fixed pool of worker tasks drains the queue
//! in submission order and runs the callbacks of one message sequentially.

use std::{
    collections::HashMap,
    fmt,
    panic::AssertUnwindSafe,
    sync::Arc,
};

use futures::{future::BoxFuture, FutureExt};
use parking_lot::{Mutex, RwLock};
use thiserror::Error;
use tokio::{
    sync::{broadcast, mpsc, Mutex as AsyncMutex},
    task::JoinHandle,
};
use tracing::{debug, error, trace};

use super::{message::Message, pattern::TopicPattern};
use crate::topics::normalize_destination;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum RouterError {
    #[error("Callback already registered on {topic}")]
    DuplicateCallback { topic: String },
    #[error("No such callback on {topic}")]
    CallbackNotFound { topic: String },
    #[error("Invalid topic pattern {pattern}: {reason}")]
    InvalidPattern { pattern: String, reason: String },
    #[error("Router is shut down")]
    Closed,
}

pub type RouterResult<T> = Result<T, RouterError>;

type CallbackFn = dyn Fn(Message) -> BoxFuture<'static, ()> + Send + Sync;

/// A subscriber. Two callbacks are the same callback when they are clones of
/// one handle.
#[derive(Clone)]
pub struct Callback {
    inner: Arc<CallbackFn>,
}

impl Callback {
    pub fn new<F, Fut>(f: F) -> Self
    where
        F: Fn(Message) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = ()> + Send + 'static,
    {
        Self {
            inner: Arc::new(move |message: Message| f(message).boxed()),
        }
    }

    /// Wraps a synchronous closure.
    pub fn from_fn<F>(f: F) -> Self
    where
        F: Fn(Message) + Send + Sync + 'static,
    {
        Self {
            inner: Arc::new(move |message: Message| {
                f(message);
                futures::future::ready(()).boxed()
            }),
        }
    }

    pub fn same(&self, other: &Callback) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    pub(crate) fn call(&self, message: Message) -> BoxFuture<'static, ()> {
        (self.inner)(message)
    }
}

impl PartialEq for Callback {
    fn eq(&self, other: &Self) -> bool {
        self.same(other)
    }
}

impl fmt::Debug for Callback {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Callback({:p})", Arc::as_ptr(&self.inner) as *const ())
    }
}

struct WildcardSubscription {
    pattern: TopicPattern,
    callbacks: Vec<Callback>,
}

#[derive(Default)]
struct RoutingTable {
    exact: HashMap<String, Vec<Callback>>,
    wildcard: Vec<WildcardSubscription>,
}

impl RoutingTable {
    fn resolve(&self, destination: &str) -> Vec<Callback> {
        if let Some(callbacks) = self.exact.get(destination) {
            if !callbacks.is_empty() {
                return callbacks.clone();
            }
        }
        self.wildcard
            .iter()
            .filter(|s| s.pattern.matches(destination))
            .flat_map(|s| s.callbacks.iter().cloned())
            .collect()
    }
}

pub struct TopicRouter {
    table: Arc<RwLock<RoutingTable>>,
    queue: mpsc::UnboundedSender<Message>,
    shutdown: broadcast::Sender<()>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl TopicRouter {
    /// Starts `workers` dispatch tasks (at least one) on the current runtime.
    pub fn new(workers: usize) -> Self {
        let table = Arc::new(RwLock::new(RoutingTable::default()));
        let (queue, rx) = mpsc::unbounded_channel();
        let (shutdown, _) = broadcast::channel(1);
        let rx = Arc::new(AsyncMutex::new(rx));

        let handles = (0..workers.max(1))
            .map(|id| {
                tokio::spawn(dispatch_loop(
                    id,
                    table.clone(),
                    rx.clone(),
                    shutdown.subscribe(),
                ))
            })
            .collect();

        Self {
            table,
            queue,
            shutdown,
            workers: Mutex::new(handles),
        }
    }

    /// Registers `callback` on `topic`. Returns true when this is the first
    /// callback for the pattern.
    pub fn add_callback(&self, topic: &str, callback: Callback) -> RouterResult<bool> {
        let pattern = TopicPattern::parse(topic)?;
        let key = pattern.as_str().to_string();
        let mut table = self.table.write();

        let callbacks = if pattern.is_wildcard() {
            let existing = table.wildcard.iter().position(|s| s.pattern.as_str() == key);
            match existing {
                Some(idx) => &mut table.wildcard[idx].callbacks,
                None => {
                    table.wildcard.push(WildcardSubscription {
                        pattern,
                        callbacks: Vec::new(),
                    });
                    let last = table.wildcard.len() - 1;
                    &mut table.wildcard[last].callbacks
                }
            }
        } else {
            table.exact.entry(key.clone()).or_default()
        };

        if callbacks.iter().any(|c| c.same(&callback)) {
            return Err(RouterError::DuplicateCallback { topic: key });
        }
        callbacks.push(callback);
        let first = callbacks.len() == 1;
        debug!("Added callback on {} (first: {})", key, first);
        Ok(first)
    }

    /// Removes one callback. Returns true when the pattern has no callbacks left
    /// and was dropped.
    pub fn remove_callback(&self, topic: &str, callback: &Callback) -> RouterResult<bool> {
        let key = normalize_destination(topic);
        let mut table = self.table.write();

        if let Some(callbacks) = table.exact.get_mut(&key) {
            let before = callbacks.len();
            callbacks.retain(|c| !c.same(callback));
            if callbacks.len() != before {
                let emptied = callbacks.is_empty();
                if emptied {
                    table.exact.remove(&key);
                }
                debug!("Removed callback on {} (pattern dropped: {})", key, emptied);
                return Ok(emptied);
            }
        }

        let wildcard_idx = table.wildcard.iter().position(|s| s.pattern.as_str() == key);
        if let Some(idx) = wildcard_idx {
            let callbacks = &mut table.wildcard[idx].callbacks;
            let before = callbacks.len();
            callbacks.retain(|c| !c.same(callback));
            if callbacks.len() != before {
                let emptied = callbacks.is_empty();
                if emptied {
                    table.wildcard.remove(idx);
                }
                debug!("Removed callback on {} (pattern dropped: {})", key, emptied);
                return Ok(emptied);
            }
        }

        Err(RouterError::CallbackNotFound { topic: key })
    }

    /// Queues `message` for dispatch.
    pub fn on_message(&self, mut message: Message) -> RouterResult<()> {
        message.destination = normalize_destination(&message.destination);
        trace!("Queueing message for {}", message.destination);
        self.queue.send(message).map_err(|_| RouterError::Closed)
    }

    /// Callbacks that a message sent to `destination` would reach.
    pub fn resolve(&self, destination: &str) -> Vec<Callback> {
        self.table.read().resolve(&normalize_destination(destination))
    }

    pub fn has_pattern(&self, topic: &str) -> bool {
        let key = normalize_destination(topic);
        let table = self.table.read();
        table.exact.contains_key(&key) || table.wildcard.iter().any(|s| s.pattern.as_str() == key)
    }

    pub fn callback_count(&self, topic: &str) -> usize {
        let key = normalize_destination(topic);
        let table = self.table.read();
        table.exact.get(&key).map(Vec::len).unwrap_or_else(|| {
            table
                .wildcard
                .iter()
                .find(|s| s.pattern.as_str() == key)
                .map(|s| s.callbacks.len())
                .unwrap_or(0)
        })
    }

    pub fn wildcard_pattern_count(&self) -> usize {
        self.table.read().wildcard.len()
    }

    pub fn patterns(&self) -> Vec<String> {
        let table = self.table.read();
        table
            .exact
            .keys()
            .cloned()
            .chain(table.wildcard.iter().map(|s| s.pattern.as_str().to_string()))
            .collect()
    }

    /// Stops the workers. Messages still queued are dropped.
    pub fn shutdown(&self) {
        let _ = self.shutdown.send(());
        self.workers.lock().clear();
    }
}

impl Drop for TopicRouter {
    fn drop(&mut self) {
        let _ = self.shutdown.send(());
    }
}

async fn dispatch_loop(
    worker_id: usize,
    table: Arc<RwLock<RoutingTable>>,
    queue: Arc<AsyncMutex<mpsc::UnboundedReceiver<Message>>>,
    mut shutdown: broadcast::Receiver<()>,
) {
    loop {
        let next = {
            let mut rx = queue.lock().await;
            tokio::select! {
                _ = shutdown.recv() => None,
                message = rx.recv() => message,
            }
        };
        let Some(message) = next else {
            debug!("Dispatch worker {} stopped", worker_id);
            break;
        };

        // ロックはawaitの前に解放する
        let callbacks = table.read().resolve(&message.destination);
        if callbacks.is_empty() {
            trace!("No callback for {}", message.destination);
            continue;
        }
        for callback in callbacks {
            let outcome = AssertUnwindSafe(async { callback.call(message.clone()).await })
                .catch_unwind()
                .await;
            if outcome.is_err() {
                error!("Callback for {} panicked", message.destination);
            }
        }
    }
}
