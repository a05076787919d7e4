use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;

use crate::broker::{BrokerClient, BrokerMessage};
use crate::config::Settings;
use crate::error::Result;
use crate::pool::{ActivatedKey, Key, KeyPool};
use crate::random;

const SLAVE_WAIT: Duration = Duration::from_secs(10);

/// Drives generation on the master, applies bus mutations on the slave.
///
/// Replaces shared-memory coordination between the two halves of a KME
/// pair with ordered messages: the pool is the only piece of mutable
/// state, and every mutation to it arrives either from this component's
/// generator loop (master) or from its bus handler (slave).
pub struct PoolSynchronizer<B: BrokerClient> {
    pool: Arc<KeyPool>,
    broker: Arc<B>,
    settings: Arc<Settings>,
}

impl<B: BrokerClient> PoolSynchronizer<B> {
    pub fn new(pool: Arc<KeyPool>, broker: Arc<B>, settings: Arc<Settings>) -> Self {
        Self {
            pool,
            broker,
            settings,
        }
    }

    /// The master's independent long-lived generation task. Runs until
    /// `shutdown` fires; it is only observed at a sleep boundary, never
    /// mid-generation.
    pub async fn run_master(&self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        loop {
            if *shutdown.borrow() {
                log::info!("generation loop received shutdown signal");
                return Ok(());
            }

            let count = self.pool.count().await;

            if count >= self.settings.max_key_count {
                log::debug!(
                    "pool full ({} >= {}), sleeping",
                    count,
                    self.settings.max_key_count
                );
                self.sleep_or_shutdown(
                    Duration::from_secs(self.settings.key_generation_timeout_in_seconds),
                    &mut shutdown,
                )
                .await;
                continue;
            }

            match self.broker.has_consumers().await {
                Ok(true) => {}
                Ok(false) => {
                    log::debug!("no slave consumer present yet, sleeping");
                    self.sleep_or_shutdown(SLAVE_WAIT, &mut shutdown).await;
                    continue;
                }
                Err(e) => {
                    log::warn!("could not probe consumer presence: {}", e);
                    self.sleep_or_shutdown(SLAVE_WAIT, &mut shutdown).await;
                    continue;
                }
            }

            let material = random::generate(self.settings.max_key_size)?;
            let key = Key::new(material);

            self.pool.insert(key.clone()).await;
            log::info!("generated key {}", key.key_id);

            if let Err(e) = self.broker.publish(&BrokerMessage::NewKey(key)).await {
                log::error!("failed to publish new_key: {}", e);
            }
        }
    }

    async fn sleep_or_shutdown(&self, duration: Duration, shutdown: &mut watch::Receiver<bool>) {
        tokio::select! {
            _ = tokio::time::sleep(duration) => {}
            _ = shutdown.changed() => {}
        }
    }

    /// Called by the request gateway on the master after a local
    /// activation, so the slave's ledger stays in sync.
    pub async fn notify_activated(&self, activated: ActivatedKey) -> Result<()> {
        self.broker
            .publish(&BrokerMessage::ActivatedKey(activated))
            .await
    }

    /// Called by the request gateway on the master after a local
    /// deactivation.
    pub async fn notify_deactivated(&self, key_id: uuid::Uuid) -> Result<()> {
        self.broker
            .publish(&BrokerMessage::DeactivatedKey { key_id })
            .await
    }

    /// Apply one bus-delivered mutation on the slave side. Idempotent by
    /// `key_id`: redelivery of an already-applied mutation is a no-op,
    /// never an error, so a handler failure never needs special-casing
    /// "already applied" as distinct from a genuine failure.
    pub async fn apply_bus_message(&self, message: BrokerMessage) -> Result<()> {
        match message {
            BrokerMessage::NewKey(key) => {
                log::info!("slave received new_key {}", key.key_id);
                self.pool.insert(key).await;
                Ok(())
            }
            BrokerMessage::ActivatedKey(activated) => {
                log::info!("slave received activated_key {}", activated.key_id);
                self.pool.adopt_activated(activated).await;
                Ok(())
            }
            BrokerMessage::DeactivatedKey { key_id } => {
                log::info!("slave received deactivated_key {}", key_id);
                match self.pool.deactivate(key_id).await {
                    Ok(_) => Ok(()),
                    Err(crate::error::KmeError::NotFound(_)) => {
                        // Already deactivated by a prior (redelivered) message.
                        Ok(())
                    }
                    Err(e) => Err(e),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::InMemoryBroker;
    use crate::config::MqSettings;

    fn test_settings(is_master: bool, max_key_count: usize) -> Settings {
        Settings {
            id: "tn-1".to_string(),
            server_cert_file: "s.pem".to_string(),
            server_key_file: "s.key".to_string(),
            ca_file: "ca.pem".to_string(),
            min_key_size: 64,
            max_key_size: 64,
            default_key_size: 64,
            max_key_count,
            max_keys_per_request: 10,
            key_generation_timeout_in_seconds: 1,
            is_master,
            mq: MqSettings {
                mq_host: "localhost".to_string(),
                mq_port: 5672,
                mq_username: "guest".to_string(),
                mq_password: "guest".to_string(),
                mq_shared_queue: "q".to_string(),
            },
            attached_kmes: vec![],
            attached_saes: vec![],
            attached_trusted_nodes: vec![],
        }
    }

    #[tokio::test]
    async fn master_pauses_when_pool_is_full() {
        let pool = Arc::new(KeyPool::new());
        pool.insert(Key::new(vec![0; 8])).await;

        let broker = Arc::new(InMemoryBroker::new(true));
        let settings = Arc::new(test_settings(true, 1));
        let sync = PoolSynchronizer::new(pool.clone(), broker.clone(), settings);

        let (tx, rx) = watch::channel(false);
        let handle = tokio::spawn(async move { sync.run_master(rx).await });

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(pool.count().await, 1);

        tx.send(true).unwrap();
        let _ = tokio::time::timeout(Duration::from_secs(2), handle).await;
    }

    #[tokio::test]
    async fn master_pauses_when_no_consumers() {
        let pool = Arc::new(KeyPool::new());
        let broker = Arc::new(InMemoryBroker::new(false));
        let settings = Arc::new(test_settings(true, 10));
        let sync = PoolSynchronizer::new(pool.clone(), broker.clone(), settings);

        let (tx, rx) = watch::channel(false);
        let handle = tokio::spawn(async move { sync.run_master(rx).await });

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(pool.count().await, 0);
        assert!(broker.drain().await.is_empty());

        tx.send(true).unwrap();
        let _ = tokio::time::timeout(Duration::from_secs(2), handle).await;
    }

    #[tokio::test]
    async fn slave_applies_new_key_then_activated_then_deactivated() {
        let pool = Arc::new(KeyPool::new());
        let broker = Arc::new(InMemoryBroker::new(true));
        let settings = Arc::new(test_settings(false, 10));
        let sync = PoolSynchronizer::new(pool.clone(), broker, settings);

        let key = Key::new(vec![1, 2, 3, 4, 5, 6, 7, 8]);
        let key_id = key.key_id;

        sync.apply_bus_message(BrokerMessage::NewKey(key)).await.unwrap();
        assert_eq!(pool.count().await, 1);

        let activated = ActivatedKey {
            key_id,
            master_sae_id: "m".to_string(),
            slave_sae_id: "s".to_string(),
            size_bits: 64,
            material_prefix: vec![1, 2, 3, 4, 5, 6, 7, 8],
        };
        sync.apply_bus_message(BrokerMessage::ActivatedKey(activated))
            .await
            .unwrap();

        assert_eq!(pool.count().await, 0);
        assert!(pool.lookup_activated(key_id).await.is_some());

        sync.apply_bus_message(BrokerMessage::DeactivatedKey { key_id })
            .await
            .unwrap();
        assert!(pool.lookup_activated(key_id).await.is_none());
    }

    #[tokio::test]
    async fn slave_replay_of_deactivated_is_idempotent() {
        let pool = Arc::new(KeyPool::new());
        let broker = Arc::new(InMemoryBroker::new(true));
        let settings = Arc::new(test_settings(false, 10));
        let sync = PoolSynchronizer::new(pool.clone(), broker, settings);

        let key_id = uuid::Uuid::new_v4();

        sync.apply_bus_message(BrokerMessage::DeactivatedKey { key_id })
            .await
            .unwrap();
        sync.apply_bus_message(BrokerMessage::DeactivatedKey { key_id })
            .await
            .unwrap();
    }
}
