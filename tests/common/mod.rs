#![allow(dead_code)]

use std::{sync::Arc, time::Duration};

use gridbus::bus::{BusClient, InMemoryBroker, MemoryTransport};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

#[ctor::ctor]
fn init_tests() {
    // テストの前に一度だけ tracing_subscriber を初期化
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(EnvFilter::from_default_env())
        .finish();
    tracing::subscriber::set_global_default(subscriber).expect("Failed to set tracing subscriber");
}

pub fn memory_bus(id: &str, broker: &Arc<InMemoryBroker>) -> BusClient {
    BusClient::builder(id, Arc::new(MemoryTransport::new(broker.clone()))).build()
}

pub async fn connected_bus(id: &str, broker: &Arc<InMemoryBroker>) -> BusClient {
    let bus = memory_bus(id, broker);
    bus.connect().await.expect("in-memory connect");
    bus
}

/// Polls `check` for up to two seconds.
pub async fn eventually<F: Fn() -> bool>(check: F) -> bool {
    for _ in 0..200 {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    check()
}

/// Lets in-flight deliveries settle before asserting on absence.
pub async fn settle() {
    tokio::time::sleep(Duration::from_millis(100)).await;
}
