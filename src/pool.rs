use std::collections::VecDeque;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::error::{KmeError, Result};

/// A synchronized, unactivated pool entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Key {
    pub key_id: Uuid,
    pub material: Vec<u8>,
    pub created_at: DateTime<Utc>,
}

impl Key {
    pub fn new(material: Vec<u8>) -> Self {
        Self {
            key_id: Uuid::new_v4(),
            material,
            created_at: Utc::now(),
        }
    }
}

/// A key that has been handed to a requesting SAE pair.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActivatedKey {
    pub key_id: Uuid,
    pub master_sae_id: String,
    pub slave_sae_id: String,
    pub size_bits: u32,
    pub material_prefix: Vec<u8>,
}

/// Metadata view of an activated key, without the material itself.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActivatedKeyMetadata {
    pub key_id: Uuid,
    pub master_sae_id: String,
    pub slave_sae_id: String,
    pub size_bits: u32,
}

impl From<&ActivatedKey> for ActivatedKeyMetadata {
    fn from(key: &ActivatedKey) -> Self {
        Self {
            key_id: key.key_id,
            master_sae_id: key.master_sae_id.clone(),
            slave_sae_id: key.slave_sae_id.clone(),
            size_bits: key.size_bits,
        }
    }
}

fn prefix(material: &[u8], size_bits: u32) -> Vec<u8> {
    let len = (size_bits / 8) as usize;
    material[..len].to_vec()
}

struct PoolState {
    pool: VecDeque<Key>,
    activated: Vec<ActivatedKey>,
}

/// Holds synchronized, unactivated keys and the activated-key ledger.
///
/// The pool is the single owner of its data: callers never receive a
/// reference into pool storage, only materialized copies. Every public
/// method below is one atomic critical section guarded by a single lock,
/// per the concurrency model.
pub struct KeyPool {
    state: Mutex<PoolState>,
}

impl KeyPool {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(PoolState {
                pool: VecDeque::new(),
                activated: Vec::new(),
            }),
        }
    }

    /// Append unless `key_id` is already present, in the pool or the ledger.
    /// Idempotent under bus replay.
    pub async fn insert(&self, key: Key) {
        let mut state = self.state.lock().await;

        let already_present = state.pool.iter().any(|k| k.key_id == key.key_id)
            || state.activated.iter().any(|k| k.key_id == key.key_id);

        if !already_present {
            state.pool.push_back(key);
        }
    }

    /// Remove and return one key in FIFO order.
    pub async fn take_one(&self) -> Option<Key> {
        let mut state = self.state.lock().await;
        state.pool.pop_front()
    }

    /// Size of the unactivated pool.
    pub async fn count(&self) -> usize {
        let state = self.state.lock().await;
        state.pool.len()
    }

    /// Remove from the pool, append to the activated ledger with a prefix
    /// of `size_bits`. Fails with `NotFound` if the key is not in the pool.
    pub async fn activate(
        &self,
        key_id: Uuid,
        master_sae_id: &str,
        slave_sae_id: &str,
        size_bits: u32,
    ) -> Result<ActivatedKey> {
        let mut state = self.state.lock().await;

        let idx = state
            .pool
            .iter()
            .position(|k| k.key_id == key_id)
            .ok_or_else(|| KmeError::NotFound(format!("key {} not in pool", key_id)))?;

        let key = state.pool.remove(idx).expect("index just found");

        let activated = ActivatedKey {
            key_id: key.key_id,
            master_sae_id: master_sae_id.to_string(),
            slave_sae_id: slave_sae_id.to_string(),
            size_bits,
            material_prefix: prefix(&key.material, size_bits),
        };

        state.activated.push(activated.clone());

        Ok(activated)
    }

    /// Insert into the activated ledger without consuming the pool. Used
    /// by the slave KME when it learns the master has activated a key.
    pub async fn adopt_activated(&self, activated: ActivatedKey) {
        let mut state = self.state.lock().await;

        if state.activated.iter().any(|k| k.key_id == activated.key_id) {
            return;
        }

        state.pool.retain(|k| k.key_id != activated.key_id);
        state.activated.push(activated);
    }

    pub async fn lookup_activated(&self, key_id: Uuid) -> Option<ActivatedKeyMetadata> {
        let state = self.state.lock().await;
        state
            .activated
            .iter()
            .find(|k| k.key_id == key_id)
            .map(ActivatedKeyMetadata::from)
    }

    /// Returns the full activated key, including material, if present.
    pub async fn lookup_activated_full(&self, key_id: Uuid) -> Option<ActivatedKey> {
        let state = self.state.lock().await;
        state.activated.iter().find(|k| k.key_id == key_id).cloned()
    }

    /// Remove from the activated ledger (and, defensively, the pool).
    /// Fails with `NotFound` if absent from both.
    pub async fn deactivate(&self, key_id: Uuid) -> Result<ActivatedKey> {
        let mut state = self.state.lock().await;

        let idx = state.activated.iter().position(|k| k.key_id == key_id);

        state.pool.retain(|k| k.key_id != key_id);

        match idx {
            Some(idx) => Ok(state.activated.remove(idx)),
            None => Err(KmeError::NotFound(format!(
                "key {} not in activated ledger",
                key_id
            ))),
        }
    }
}

impl Default for KeyPool {
    fn default() -> Self {
        Self::new()
    }
}
