//! Lapin-backed implementation of the bus traits.
//!
//! One `AmqpBus` wraps one AMQP connection; channels carry their own
//! prefetch window. Consumption forwards raw deliveries into an mpsc pipe so
//! the rest of the service never touches lapin types.

use std::sync::Arc;

use async_trait::async_trait;
use futures::StreamExt;
use lapin::options::{
    BasicAckOptions, BasicCancelOptions, BasicConsumeOptions, BasicNackOptions,
    BasicPublishOptions, BasicQosOptions, ExchangeDeclareOptions, QueueBindOptions,
    QueueDeclareOptions,
};
use lapin::types::FieldTable;
use lapin::{BasicProperties, Connection, ConnectionProperties, ExchangeKind};
use tokio::sync::mpsc;
use tracing::{error, info, warn};

use crate::bus::{BusChannel, BusProvider, Delivery, ExchangeType, MessageBus};
use crate::topology::reconnect_delay;

#[derive(Debug, Clone)]
pub struct BrokerConfig {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
}

impl BrokerConfig {
    fn uri(&self) -> String {
        format!(
            "amqp://{}:{}@{}:{}/%2f",
            self.user, self.password, self.host, self.port
        )
    }
}

/// Dials fresh AMQP connections, retrying with exponential backoff until the
/// broker answers.
pub struct AmqpProvider {
    config: BrokerConfig,
}

impl AmqpProvider {
    pub fn new(config: BrokerConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl BusProvider for AmqpProvider {
    async fn connect(&self) -> anyhow::Result<Arc<dyn MessageBus>> {
        let mut attempt = 0u32;
        loop {
            match AmqpBus::connect(&self.config).await {
                Ok(bus) => {
                    info!(
                        action = "broker_connect",
                        result = "success",
                        host = %self.config.host,
                        "connected to broker"
                    );
                    return Ok(Arc::new(bus));
                }
                Err(e) => {
                    let delay = reconnect_delay(attempt);
                    warn!(
                        action = "broker_connect",
                        result = "fail",
                        attempt,
                        delay_secs = delay.as_secs(),
                        error = ?e,
                        "broker connection failed; backing off"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }
}

pub struct AmqpBus {
    connection: Connection,
}

impl AmqpBus {
    pub async fn connect(config: &BrokerConfig) -> anyhow::Result<Self> {
        let connection =
            Connection::connect(&config.uri(), ConnectionProperties::default()).await?;
        Ok(Self { connection })
    }
}

#[async_trait]
impl MessageBus for AmqpBus {
    async fn channel(&self, prefetch: u16) -> anyhow::Result<Arc<dyn BusChannel>> {
        let channel = self.connection.create_channel().await?;
        channel
            .basic_qos(prefetch, BasicQosOptions::default())
            .await?;
        Ok(Arc::new(AmqpChannel { channel, prefetch }))
    }

    async fn close(&self) -> anyhow::Result<()> {
        self.connection.close(200, "shutdown").await?;
        Ok(())
    }
}

struct AmqpChannel {
    channel: lapin::Channel,
    prefetch: u16,
}

#[async_trait]
impl BusChannel for AmqpChannel {
    async fn declare_exchange(&self, name: &str, kind: ExchangeType) -> anyhow::Result<()> {
        let kind = match kind {
            ExchangeType::Direct => ExchangeKind::Direct,
            ExchangeType::Fanout => ExchangeKind::Fanout,
        };
        self.channel
            .exchange_declare(
                name,
                kind,
                ExchangeDeclareOptions { durable: true, ..Default::default() },
                FieldTable::default(),
            )
            .await?;
        Ok(())
    }

    async fn declare_queue(&self, name: &str) -> anyhow::Result<()> {
        self.channel
            .queue_declare(
                name,
                QueueDeclareOptions { durable: true, ..Default::default() },
                FieldTable::default(),
            )
            .await?;
        Ok(())
    }

    async fn bind_queue(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> anyhow::Result<()> {
        self.channel
            .queue_bind(
                queue,
                exchange,
                routing_key,
                QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await?;
        Ok(())
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        body: Vec<u8>,
    ) -> anyhow::Result<()> {
        self.channel
            .basic_publish(
                exchange,
                routing_key,
                BasicPublishOptions::default(),
                &body,
                BasicProperties::default().with_delivery_mode(2),
            )
            .await?
            .await?;
        Ok(())
    }

    async fn consume(
        &self,
        queue: &str,
        consumer_tag: &str,
    ) -> anyhow::Result<mpsc::Receiver<Delivery>> {
        let mut consumer = self
            .channel
            .basic_consume(
                queue,
                consumer_tag,
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await?;

        let buffer = usize::from(self.prefetch.max(1));
        let (tx, rx) = mpsc::channel(buffer);
        let queue_name = queue.to_string();

        tokio::spawn(async move {
            while let Some(delivery) = consumer.next().await {
                match delivery {
                    Ok(delivery) => {
                        let forwarded = Delivery {
                            body: delivery.data,
                            tag: delivery.delivery_tag,
                        };
                        if tx.send(forwarded).await.is_err() {
                            // Receiver dropped; the consumer side is done.
                            break;
                        }
                    }
                    Err(e) => {
                        error!(
                            action = "consume",
                            result = "fail",
                            queue = %queue_name,
                            error = ?e,
                            "consumer stream error"
                        );
                        break;
                    }
                }
            }
            // Dropping tx closes the receiver, signaling end of consumption.
        });

        Ok(rx)
    }

    async fn ack(&self, tag: u64) -> anyhow::Result<()> {
        self.channel.basic_ack(tag, BasicAckOptions::default()).await?;
        Ok(())
    }

    async fn nack(&self, tag: u64, requeue: bool) -> anyhow::Result<()> {
        self.channel
            .basic_nack(tag, BasicNackOptions { requeue, ..Default::default() })
            .await?;
        Ok(())
    }

    async fn cancel_consumer(&self, consumer_tag: &str) -> anyhow::Result<()> {
        self.channel
            .basic_cancel(consumer_tag, BasicCancelOptions::default())
            .await?;
        Ok(())
    }

    async fn close(&self) -> anyhow::Result<()> {
        self.channel.close(200, "shutdown").await?;
        Ok(())
    }
}
