//! # Pending Requests
//!
//! Bridges the asynchronous bus and the blocking request/response pattern.
//! Each `get_response` call registers a oneshot sender under its request id;
//! the reply callback completes it, and the caller awaits the receiver with a
//! timeout.

use std::{sync::Arc, time::Duration};

use dashmap::DashMap;
use tokio::sync::oneshot;
use tracing::{instrument, trace};

use super::{message::Message, BusError, BusResult};
use crate::topics;

/// Type alias for request correlation identifiers
pub type RequestId = String;

/// A request awaiting its reply.
struct PendingRequest {
    /// Channel for delivering the response back to the requester
    sender: oneshot::Sender<Message>,
    /// Ephemeral destination the reply is expected on
    reply_topic: String,
}

#[derive(Clone, Default)]
pub struct PendingRequests {
    pending: Arc<DashMap<RequestId, PendingRequest>>,
}

impl PendingRequests {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `request_id` and returns its reply topic and response slot.
    pub fn register(&self, request_id: &str) -> (String, oneshot::Receiver<Message>) {
        let (tx, rx) = oneshot::channel();
        let reply_topic = topics::response_reply_topic(request_id);
        self.pending.insert(
            request_id.to_string(),
            PendingRequest {
                sender: tx,
                reply_topic: reply_topic.clone(),
            },
        );
        (reply_topic, rx)
    }

    /// Delivers `message` to the waiter. Returns false if nobody waits anymore.
    pub fn complete(&self, request_id: &str, message: Message) -> bool {
        match self.pending.remove(request_id) {
            Some((_, pending)) => {
                trace!("Completing request {} from {}", request_id, pending.reply_topic);
                pending.sender.send(message).is_ok()
            }
            None => false,
        }
    }

    pub fn cancel(&self, request_id: &str) {
        self.pending.remove(request_id);
    }

    pub fn is_pending(&self, request_id: &str) -> bool {
        self.pending.contains_key(request_id)
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    #[instrument(skip(self, rx))]
    pub async fn await_response(
        &self,
        request_id: &str,
        timeout: Duration,
        rx: oneshot::Receiver<Message>,
    ) -> BusResult<Message> {
        // タイムアウト用のスリープを作成
        let sleep = tokio::time::sleep(timeout);
        tokio::pin!(sleep);

        let result = tokio::select! {
            _ = &mut sleep => Err(BusError::Timeout {
                request_id: request_id.to_string(),
                timeout,
            }),
            result = rx => result.map_err(|_| BusError::ChannelClosed),
        };
        self.cancel(request_id);
        result
    }
}
