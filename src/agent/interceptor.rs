//! Hooks run around every handler call.

use dashmap::DashMap;

use super::{handler::HandlerKind, AgentResult};
use crate::bus::Message;

/// Observes handler calls of one agent. Hooks must not block.
pub trait HandlerInterceptor: Send + Sync {
    fn before(&self, _agent_id: &str, _kind: HandlerKind, _message: &Message) {}

    fn after(&self, _agent_id: &str, _kind: HandlerKind, _outcome: &AgentResult<()>) {}
}

/// Counts calls and failures per handler kind.
#[derive(Debug, Default)]
pub struct CallCounter {
    calls: DashMap<HandlerKind, u64>,
    failures: DashMap<HandlerKind, u64>,
}

impl CallCounter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn calls(&self, kind: HandlerKind) -> u64 {
        self.calls.get(&kind).map(|c| *c).unwrap_or(0)
    }

    pub fn failures(&self, kind: HandlerKind) -> u64 {
        self.failures.get(&kind).map(|c| *c).unwrap_or(0)
    }

    pub fn total(&self) -> u64 {
        self.calls.iter().map(|c| *c.value()).sum()
    }
}

impl HandlerInterceptor for CallCounter {
    fn before(&self, _agent_id: &str, kind: HandlerKind, _message: &Message) {
        *self.calls.entry(kind).or_insert(0) += 1;
    }

    fn after(&self, _agent_id: &str, kind: HandlerKind, outcome: &AgentResult<()>) {
        if outcome.is_err() {
            *self.failures.entry(kind).or_insert(0) += 1;
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PayloadStats {
    pub messages: u64,
    pub bytes: u64,
    pub largest: usize,
}

/// Records body sizes of the messages handed to each handler kind.
#[derive(Debug, Default)]
pub struct PayloadSizeRecorder {
    stats: DashMap<HandlerKind, PayloadStats>,
}

impl PayloadSizeRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stats(&self, kind: HandlerKind) -> PayloadStats {
        self.stats.get(&kind).map(|s| *s).unwrap_or_default()
    }

    pub fn bytes(&self, kind: HandlerKind) -> u64 {
        self.stats(kind).bytes
    }
}

impl HandlerInterceptor for PayloadSizeRecorder {
    fn before(&self, _agent_id: &str, kind: HandlerKind, message: &Message) {
        let size = message.size();
        let mut stats = self.stats.entry(kind).or_default();
        stats.messages += 1;
        stats.bytes += size as u64;
        stats.largest = stats.largest.max(size);
    }
}
