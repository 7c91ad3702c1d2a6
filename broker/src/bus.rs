use std::sync::Arc;

use tokio::sync::mpsc;

/// One consumed message plus the tag needed to settle it on its channel.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub body: Vec<u8>,
    pub tag: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExchangeType {
    Direct,
    Fanout,
}

/// One broker channel with its own prefetch window.
///
/// Declarations are idempotent. Consumed deliveries arrive on an mpsc
/// receiver and must be settled through `ack`/`nack` on the same channel;
/// the receiver closing means the channel (or the connection under it) is
/// gone.
#[async_trait::async_trait]
pub trait BusChannel: Send + Sync {
    async fn declare_exchange(&self, name: &str, kind: ExchangeType) -> anyhow::Result<()>;

    /// Declare a durable queue.
    async fn declare_queue(&self, name: &str) -> anyhow::Result<()>;

    async fn bind_queue(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> anyhow::Result<()>;

    /// Publish a persistent message.
    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        body: Vec<u8>,
    ) -> anyhow::Result<()>;

    async fn consume(
        &self,
        queue: &str,
        consumer_tag: &str,
    ) -> anyhow::Result<mpsc::Receiver<Delivery>>;

    async fn ack(&self, tag: u64) -> anyhow::Result<()>;

    async fn nack(&self, tag: u64, requeue: bool) -> anyhow::Result<()>;

    async fn cancel_consumer(&self, consumer_tag: &str) -> anyhow::Result<()>;

    async fn close(&self) -> anyhow::Result<()>;
}

/// One broker connection. Never shared across session workers.
#[async_trait::async_trait]
pub trait MessageBus: Send + Sync {
    async fn channel(&self, prefetch: u16) -> anyhow::Result<Arc<dyn BusChannel>>;

    async fn close(&self) -> anyhow::Result<()>;
}

/// Connection factory: the listener dials one connection for itself and one
/// per spawned worker, retrying with backoff until the broker is reachable.
#[async_trait::async_trait]
pub trait BusProvider: Send + Sync {
    async fn connect(&self) -> anyhow::Result<Arc<dyn MessageBus>>;
}
