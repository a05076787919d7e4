use async_trait::async_trait;
use futures::StreamExt;
use lapin::options::{
    BasicAckOptions, BasicConsumeOptions, BasicNackOptions, BasicPublishOptions,
    QueueDeclareOptions,
};
use lapin::types::FieldTable;
use lapin::{BasicProperties, Channel, Connection, ConnectionProperties};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use crate::config::{MqSettings, Settings};
use crate::error::{KmeError, Result};
use crate::pool::{ActivatedKey, Key};

/// The three pool mutations a master publishes and a slave applies.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum BrokerMessage {
    NewKey(Key),
    ActivatedKey(ActivatedKey),
    DeactivatedKey { key_id: uuid::Uuid },
}

/// Ordered pub/sub of pool mutations between a paired master/slave KME,
/// over a single named queue with exactly one competing consumer group.
///
/// Defined as a trait so the synchronizer (and its tests) can run against
/// an in-memory fake without a real broker connection.
#[async_trait]
pub trait BrokerClient: Send + Sync {
    async fn publish(&self, message: &BrokerMessage) -> Result<()>;

    /// The master's liveness probe for the slave: when this returns
    /// `false`, generation pauses.
    async fn has_consumers(&self) -> Result<bool>;
}

/// A `lapin`-backed [`BrokerClient`] over a single AMQP queue.
pub struct AmqpBroker {
    channel: Channel,
    queue_name: String,
    is_master: bool,
}

impl AmqpBroker {
    pub async fn connect(mq: &MqSettings, is_master: bool) -> Result<Self> {
        let url = format!(
            "amqp://{}:{}@{}:{}/",
            mq.mq_username, mq.mq_password, mq.mq_host, mq.mq_port
        );

        log::info!("connecting to broker at {}:{}", mq.mq_host, mq.mq_port);

        let connection = Connection::connect(&url, ConnectionProperties::default())
            .await
            .map_err(|e| KmeError::Transient(format!("could not connect to broker: {}", e)))?;

        let channel = connection
            .create_channel()
            .await
            .map_err(|e| KmeError::Transient(format!("could not open broker channel: {}", e)))?;

        channel
            .queue_declare(
                &mq.mq_shared_queue,
                QueueDeclareOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|e| KmeError::Transient(format!("could not declare queue: {}", e)))?;

        log::info!("connected to broker");

        Ok(Self {
            channel,
            queue_name: mq.mq_shared_queue.clone(),
            is_master,
        })
    }

    /// Start consuming messages, invoking `handler` for each one. On
    /// handler error the message is negatively acknowledged so the bus
    /// redelivers it; ordering guarantees mean handlers must treat
    /// mutations as idempotent by `key_id` to tolerate redelivery.
    pub async fn listen<F, Fut>(&self, handler: F) -> Result<()>
    where
        F: Fn(BrokerMessage) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<()>> + Send,
    {
        let mut consumer = self
            .channel
            .basic_consume(
                &self.queue_name,
                "kme-consumer",
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|e| KmeError::Transient(format!("could not start consuming: {}", e)))?;

        log::info!("broker listener created, listening for new messages");

        while let Some(delivery) = consumer.next().await {
            let delivery = match delivery {
                Ok(delivery) => delivery,
                Err(e) => {
                    log::error!("broker delivery error: {}", e);
                    continue;
                }
            };

            let parsed: std::result::Result<BrokerMessage, _> =
                serde_json::from_slice(&delivery.data);

            match parsed {
                Ok(message) => {
                    log::info!("received broker message: {:?}", discriminant_name(&message));

                    match handler(message).await {
                        Ok(()) => {
                            if let Err(e) =
                                delivery.ack(BasicAckOptions::default()).await
                            {
                                log::warn!("failed to ack broker message: {}", e);
                            }
                        }
                        Err(e) => {
                            log::warn!("handler failed, nacking for redelivery: {}", e);
                            if let Err(e) = delivery
                                .nack(BasicNackOptions {
                                    requeue: true,
                                    ..Default::default()
                                })
                                .await
                            {
                                log::warn!("failed to nack broker message: {}", e);
                            }
                        }
                    }
                }
                Err(e) => {
                    log::warn!("received non-decodable broker message: {}", e);
                    if let Err(e) = delivery.nack(BasicNackOptions::default()).await {
                        log::warn!("failed to nack broker message: {}", e);
                    }
                }
            }
        }

        Ok(())
    }
}

fn discriminant_name(message: &BrokerMessage) -> &'static str {
    match message {
        BrokerMessage::NewKey(_) => "new_key",
        BrokerMessage::ActivatedKey(_) => "activated_key",
        BrokerMessage::DeactivatedKey { .. } => "deactivated_key",
    }
}

#[async_trait]
impl BrokerClient for AmqpBroker {
    async fn publish(&self, message: &BrokerMessage) -> Result<()> {
        let body = serde_json::to_vec(message)?;

        self.channel
            .basic_publish(
                "",
                &self.queue_name,
                BasicPublishOptions::default(),
                &body,
                BasicProperties::default(),
            )
            .await
            .map_err(|e| KmeError::Transient(format!("could not publish to broker: {}", e)))?;

        Ok(())
    }

    async fn has_consumers(&self) -> Result<bool> {
        if !self.is_master {
            return Ok(true);
        }

        let queue = self
            .channel
            .queue_declare(
                &self.queue_name,
                QueueDeclareOptions {
                    passive: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| KmeError::Transient(format!("could not inspect queue: {}", e)))?;

        Ok(queue.consumer_count() > 0)
    }
}

/// In-memory fake used by the pool synchronizer's tests and by a paired
/// in-process test harness: publishing on one side makes the message
/// available to anything awaiting `recv` on the other.
pub struct InMemoryBroker {
    outbox: Mutex<Vec<BrokerMessage>>,
    consumers_present: std::sync::atomic::AtomicBool,
}

impl InMemoryBroker {
    pub fn new(consumers_present: bool) -> Self {
        Self {
            outbox: Mutex::new(Vec::new()),
            consumers_present: std::sync::atomic::AtomicBool::new(consumers_present),
        }
    }

    pub fn set_consumers_present(&self, present: bool) {
        self.consumers_present
            .store(present, std::sync::atomic::Ordering::SeqCst);
    }

    pub async fn drain(&self) -> Vec<BrokerMessage> {
        let mut outbox = self.outbox.lock().await;
        std::mem::take(&mut *outbox)
    }
}

#[async_trait]
impl BrokerClient for InMemoryBroker {
    async fn publish(&self, message: &BrokerMessage) -> Result<()> {
        self.outbox.lock().await.push(message.clone());
        Ok(())
    }

    async fn has_consumers(&self) -> Result<bool> {
        Ok(self
            .consumers_present
            .load(std::sync::atomic::Ordering::SeqCst))
    }
}

/// Convenience constructor matching the configuration shape in `settings.json`.
pub async fn connect(settings: &Settings) -> Result<AmqpBroker> {
    AmqpBroker::connect(&settings.mq, settings.is_master).await
}
