use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::config::{AttachedKme, AttachedTrustedNode, Settings};
use crate::discovery::{discover, DiscoveryTransport, TrustedNodeRecord};
use crate::error::{KmeError, Result};
use crate::planner::find_path;
use crate::pool::{ActivatedKey, KeyPool};

const PEER_TIMEOUT: Duration = Duration::from_secs(5);

/// The end-to-end relay envelope carried hop-to-hop over `ext_keys`.
///
/// `path_to_go` always starts with the *receiving* node's own id: each
/// handler strips its own entry before deciding whether it is terminal.
/// This mirrors the reference implementation's wire convention exactly,
/// so an interop partner on an unmodified path sees the same shape.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelayEnvelope {
    pub first_key_id: Uuid,
    pub current_key_id: Uuid,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub xor_material: Option<String>,
    pub initiator_tn_id: String,
    pub initiator_sae_id: String,
    pub target_tn_id: String,
    pub target_sae_id: String,
    pub path_to_go: Vec<String>,
    pub discovered_network: Vec<TrustedNodeRecord>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VoidEnvelope {
    pub key_ids: Vec<Uuid>,
    pub initiator_sae_id: String,
    pub target_sae_id: String,
    pub path_to_go: Vec<String>,
    pub discovered_network: Vec<TrustedNodeRecord>,
}

/// The ETSI-shaped `{key_ID, key}` document exchanged on every southbound
/// call and, ultimately, returned to the relay initiator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeyDocument {
    #[serde(rename = "key_ID")]
    pub key_id: Uuid,
    pub key: String,
}

/// Outbound calls the relay state machine makes: southbound to the
/// locally-attached KME of a given hop link, and northbound to the
/// trusted node on the other end of that hop.
///
/// Defined as a trait so the chaining algorithm can be driven end-to-end
/// in tests without real mTLS sockets.
#[async_trait]
pub trait PeerClient: Send + Sync {
    async fn enc_keys(&self, kme: &AttachedKme, counterpart_id: &str, size_bits: u32) -> Result<KeyDocument>;
    async fn dec_keys(&self, kme: &AttachedKme, counterpart_id: &str, key_id: Uuid) -> Result<KeyDocument>;
    async fn ext_keys(&self, tn: &AttachedTrustedNode, envelope: &RelayEnvelope) -> Result<KeyDocument>;
    async fn void(&self, tn: &AttachedTrustedNode, envelope: &VoidEnvelope) -> Result<()>;
}

/// Production [`PeerClient`] over mTLS HTTP, one ad-hoc client per call so
/// each hop can present the credentials configured for that specific link.
pub struct HttpPeerClient;

impl HttpPeerClient {
    pub fn new() -> Self {
        Self
    }

    fn client_for(cert_file: &str, key_file: &str) -> Result<reqwest::Client> {
        let mut pem = std::fs::read(cert_file)?;
        let mut key = std::fs::read(key_file)?;
        pem.append(&mut key);

        let identity = reqwest::Identity::from_pem(&pem)
            .map_err(|e| KmeError::Fatal(format!("could not build TLS identity: {}", e)))?;

        reqwest::Client::builder()
            .identity(identity)
            .timeout(PEER_TIMEOUT)
            .build()
            .map_err(|e| KmeError::Fatal(format!("could not build http client: {}", e)))
    }
}

impl Default for HttpPeerClient {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl PeerClient for HttpPeerClient {
    async fn enc_keys(&self, kme: &AttachedKme, counterpart_id: &str, size_bits: u32) -> Result<KeyDocument> {
        let client = Self::client_for(&kme.sae_cert, &kme.sae_key)?;
        let url = format!(
            "{}/api/v1/keys/{}/enc_keys?number=1&size={}",
            kme.url, counterpart_id, size_bits
        );

        #[derive(Deserialize)]
        struct EncKeysResponse {
            keys: Vec<KeyDocument>,
        }

        let response: EncKeysResponse = client.get(&url).send().await?.json().await?;

        response
            .keys
            .into_iter()
            .next()
            .ok_or_else(|| KmeError::Relay(format!("no key returned by {}", kme.url)))
    }

    async fn dec_keys(&self, kme: &AttachedKme, counterpart_id: &str, key_id: Uuid) -> Result<KeyDocument> {
        let client = Self::client_for(&kme.sae_cert, &kme.sae_key)?;
        let url = format!(
            "{}/api/v1/keys/{}/dec_keys?key_ID={}",
            kme.url, counterpart_id, key_id
        );

        #[derive(Deserialize)]
        struct DecKeysResponse {
            keys: Vec<KeyDocument>,
        }

        let response: DecKeysResponse = client.get(&url).send().await?.json().await?;

        response
            .keys
            .into_iter()
            .next()
            .ok_or_else(|| KmeError::Relay(format!("no key returned by {}", kme.url)))
    }

    async fn ext_keys(&self, tn: &AttachedTrustedNode, envelope: &RelayEnvelope) -> Result<KeyDocument> {
        let client = Self::client_for(&tn.cert, &tn.key)?;
        let url = format!("{}/api/v1/kmapi/v1/ext_keys", tn.url);

        Ok(client.post(&url).json(envelope).send().await?.json().await?)
    }

    async fn void(&self, tn: &AttachedTrustedNode, envelope: &VoidEnvelope) -> Result<()> {
        let client = Self::client_for(&tn.cert, &tn.key)?;
        let url = format!("{}/api/v1/kmapi/v1/void", tn.url);

        client.post(&url).json(envelope).send().await?;
        Ok(())
    }
}

fn xor_bytes(a: &[u8], b: &[u8]) -> Result<Vec<u8>> {
    if a.len() != b.len() {
        return Err(KmeError::Relay(format!(
            "hop key length mismatch: {} vs {}",
            a.len(),
            b.len()
        )));
    }

    Ok(a.iter().zip(b.iter()).map(|(x, y)| x ^ y).collect())
}

fn decode_b64(s: &str) -> Result<Vec<u8>> {
    BASE64
        .decode(s)
        .map_err(|e| KmeError::Validation(format!("invalid base64: {}", e)))
}

/// The KME's own locally-configured link to a neighboring trusted node,
/// found by matching `linked_to` against that neighbor's id (see
/// `settings.json`'s `attached_kmes[].linked_to`).
fn find_link_kme<'a>(settings: &'a Settings, tn_id: &str) -> Option<&'a AttachedKme> {
    settings.attached_kmes.iter().find(|k| k.linked_to == tn_id)
}

fn find_record<'a>(records: &'a [TrustedNodeRecord], tn_id: &str) -> Option<&'a TrustedNodeRecord> {
    records.iter().find(|r| r.tn_id == tn_id)
}

/// Strips the receiving node's own id off the front of an incoming
/// `path_to_go`, per the wire convention documented on [`RelayEnvelope`].
fn strip_self(path_to_go: &[String], self_id: &str) -> Result<Vec<String>> {
    match path_to_go.split_first() {
        Some((first, rest)) if first == self_id => Ok(rest.to_vec()),
        Some((first, _)) => Err(KmeError::Validation(format!(
            "expected path_to_go to start with {}, got {}",
            self_id, first
        ))),
        None => Err(KmeError::Validation(
            "path_to_go was empty on arrival".to_string(),
        )),
    }
}

/// Per-hop XOR chaining, dec/enc key coordination, and final delivery.
///
/// Every per-hop RPC aborts the whole relay on failure; no partial key is
/// ever returned to a caller. Concurrent relays sharing a `first_key_id`
/// are rejected with `Conflict` before any hop is attempted.
pub struct RelayStateMachine<D: DiscoveryTransport, P: PeerClient> {
    settings: Arc<Settings>,
    pool: Arc<KeyPool>,
    discovery: Arc<D>,
    peer: Arc<P>,
    in_flight: Mutex<HashSet<Uuid>>,
}

impl<D: DiscoveryTransport, P: PeerClient> RelayStateMachine<D, P> {
    pub fn new(settings: Arc<Settings>, pool: Arc<KeyPool>, discovery: Arc<D>, peer: Arc<P>) -> Self {
        Self {
            settings,
            pool,
            discovery,
            peer,
            in_flight: Mutex::new(HashSet::new()),
        }
    }

    async fn claim(&self, first_key_id: Uuid) -> Result<()> {
        let mut in_flight = self.in_flight.lock().await;
        if !in_flight.insert(first_key_id) {
            return Err(KmeError::Conflict(format!(
                "relay for {} is already in flight",
                first_key_id
            )));
        }
        Ok(())
    }

    async fn release(&self, first_key_id: Uuid) {
        self.in_flight.lock().await.remove(&first_key_id);
    }

    /// Locates the remote trusted node (by id) that hosts `sae_id`, via a
    /// fresh discovery run, alongside the record for this node itself.
    async fn locate(&self, sae_id: &str) -> Result<(Vec<TrustedNodeRecord>, TrustedNodeRecord, TrustedNodeRecord)> {
        let records = discover(self.settings.as_ref(), self.discovery.as_ref()).await?;

        let point_a = find_record(&records, &self.settings.id)
            .cloned()
            .ok_or_else(|| KmeError::Routing("this trusted node is missing from its own discovery result".to_string()))?;

        let point_b = records
            .iter()
            .find(|r| r.tn_id != self.settings.id && r.sae_ids.iter().any(|s| s == sae_id))
            .cloned()
            .ok_or_else(|| KmeError::Routing(format!("the given sae_id {} cannot be routed to", sae_id)))?;

        Ok((records, point_a, point_b))
    }

    /// Initiates end-to-end delivery of a fresh key from `master_sae_id`
    /// (local) to `slave_sae_id` (remote), returning the delivered key
    /// document once the full chain has completed.
    pub async fn initiate_encryption(
        &self,
        master_sae_id: &str,
        slave_sae_id: &str,
        size_bits: u32,
    ) -> Result<KeyDocument> {
        let (records, point_a, point_b) = self.locate(slave_sae_id).await?;

        let path = find_path(&records, &point_a.tn_id, &point_b.tn_id)?;
        if path.len() < 2 {
            return Err(KmeError::Routing(
                "resolved path has no next hop to relay through".to_string(),
            ));
        }

        let first_key_id = Uuid::new_v4();
        self.claim(first_key_id).await?;

        let result = self
            .initiate_encryption_inner(master_sae_id, slave_sae_id, size_bits, first_key_id, &path, &point_b, records)
            .await;

        self.release(first_key_id).await;
        result
    }

    async fn initiate_encryption_inner(
        &self,
        master_sae_id: &str,
        slave_sae_id: &str,
        size_bits: u32,
        first_key_id: Uuid,
        path: &[String],
        point_b: &TrustedNodeRecord,
        records: Vec<TrustedNodeRecord>,
    ) -> Result<KeyDocument> {
        let next_hop = &path[1];

        let link_kme = find_link_kme(&self.settings, next_hop)
            .ok_or_else(|| KmeError::Routing(format!("no attached KME linked to {}", next_hop)))?;

        let q0 = self.peer.enc_keys(link_kme, next_hop, size_bits).await?;

        let envelope = RelayEnvelope {
            first_key_id,
            current_key_id: q0.key_id,
            xor_material: None,
            initiator_tn_id: self.settings.id.clone(),
            initiator_sae_id: master_sae_id.to_string(),
            target_tn_id: point_b.tn_id.clone(),
            target_sae_id: slave_sae_id.to_string(),
            path_to_go: path[1..].to_vec(),
            discovered_network: records,
        };

        let next_tn = self
            .settings
            .find_attached_trusted_node(next_hop)
            .ok_or_else(|| KmeError::Routing(format!("no attached trusted node {}", next_hop)))?;

        self.peer.ext_keys(next_tn, &envelope).await
    }

    /// Handles one incoming `ext_keys` hop, called by the gateway with the
    /// trusted node id resolved from the caller's mTLS certificate.
    pub async fn handle_ext_keys(&self, envelope: RelayEnvelope, caller_tn_id: &str) -> Result<KeyDocument> {
        let link_kme_prev = find_link_kme(&self.settings, caller_tn_id)
            .ok_or_else(|| KmeError::Identity(format!("no attached KME linked to caller {}", caller_tn_id)))?;

        let q_prev = self
            .peer
            .dec_keys(link_kme_prev, caller_tn_id, envelope.current_key_id)
            .await?;
        let q_prev_bytes = decode_b64(&q_prev.key)?;

        // `xor_material`, when present, already IS the accumulated secret:
        // the previous hop produced it as `carry XOR Q_prev` using its own
        // copy of this exact link key, so XOR-ing it with `q_prev` again
        // here would immediately cancel that hop's contribution back out.
        // Only the very first hop (no predecessor accumulator to combine)
        // seeds the chain with its own freshly-decrypted key. See
        // DESIGN.md for why the per-hop description this was traced from
        // does not hold up against its own worked example.
        let carry = match &envelope.xor_material {
            Some(xor_material) => {
                let decoded = decode_b64(xor_material)?;
                if decoded.len() != q_prev_bytes.len() {
                    return Err(KmeError::Relay(format!(
                        "hop key length mismatch: {} vs {}",
                        decoded.len(),
                        q_prev_bytes.len()
                    )));
                }
                decoded
            }
            None => q_prev_bytes,
        };

        let remaining = strip_self(&envelope.path_to_go, &self.settings.id)?;

        if remaining.is_empty() {
            let activated = ActivatedKey {
                key_id: envelope.first_key_id,
                master_sae_id: envelope.initiator_sae_id.clone(),
                slave_sae_id: envelope.target_sae_id.clone(),
                size_bits: (carry.len() * 8) as u32,
                material_prefix: carry.clone(),
            };
            self.pool.adopt_activated(activated).await;

            return Ok(KeyDocument {
                key_id: envelope.first_key_id,
                key: BASE64.encode(&carry),
            });
        }

        let next_hop = remaining[0].clone();
        let link_kme_next = find_link_kme(&self.settings, &next_hop)
            .ok_or_else(|| KmeError::Routing(format!("no attached KME linked to {}", next_hop)))?;

        let q_next = self
            .peer
            .enc_keys(link_kme_next, &next_hop, (carry.len() * 8) as u32)
            .await?;
        let q_next_bytes = decode_b64(&q_next.key)?;
        let mask = xor_bytes(&carry, &q_next_bytes)?;

        let next_envelope = RelayEnvelope {
            first_key_id: envelope.first_key_id,
            current_key_id: q_next.key_id,
            xor_material: Some(BASE64.encode(&mask)),
            initiator_tn_id: envelope.initiator_tn_id.clone(),
            initiator_sae_id: envelope.initiator_sae_id.clone(),
            target_tn_id: envelope.target_tn_id.clone(),
            target_sae_id: envelope.target_sae_id.clone(),
            path_to_go: remaining,
            discovered_network: envelope.discovered_network.clone(),
        };

        let next_tn = self
            .settings
            .find_attached_trusted_node(&next_hop)
            .ok_or_else(|| KmeError::Routing(format!("no attached trusted node {}", next_hop)))?;

        self.peer.ext_keys(next_tn, &next_envelope).await
    }

    /// Releases a previously relayed `first_key_id` end-to-end: deactivates
    /// it locally (best-effort) and walks the same path, asking every
    /// remaining hop to do the same.
    pub async fn initiate_void(
        &self,
        local_sae_id: &str,
        remote_sae_id: &str,
        key_ids: Vec<Uuid>,
    ) -> Result<()> {
        for key_id in &key_ids {
            let _ = self.pool.deactivate(*key_id).await;
        }

        let (records, point_a, point_b) = self.locate(remote_sae_id).await?;
        let path = find_path(&records, &point_a.tn_id, &point_b.tn_id)?;

        if path.len() < 2 {
            return Ok(());
        }

        let next_hop = &path[1];
        let next_tn = self
            .settings
            .find_attached_trusted_node(next_hop)
            .ok_or_else(|| KmeError::Routing(format!("no attached trusted node {}", next_hop)))?;

        let envelope = VoidEnvelope {
            key_ids,
            initiator_sae_id: local_sae_id.to_string(),
            target_sae_id: remote_sae_id.to_string(),
            path_to_go: path[1..].to_vec(),
            discovered_network: records,
        };

        self.peer.void(next_tn, &envelope).await
    }

    /// Handles one incoming `void` hop.
    pub async fn handle_void(&self, envelope: VoidEnvelope) -> Result<()> {
        for key_id in &envelope.key_ids {
            let _ = self.pool.deactivate(*key_id).await;
        }

        let remaining = strip_self(&envelope.path_to_go, &self.settings.id)?;

        if remaining.is_empty() {
            return Ok(());
        }

        let next_hop = remaining[0].clone();
        let next_tn = self
            .settings
            .find_attached_trusted_node(&next_hop)
            .ok_or_else(|| KmeError::Routing(format!("no attached trusted node {}", next_hop)))?;

        let forward = VoidEnvelope {
            key_ids: envelope.key_ids,
            initiator_sae_id: envelope.initiator_sae_id,
            target_sae_id: envelope.target_sae_id,
            path_to_go: remaining,
            discovered_network: envelope.discovered_network,
        };

        self.peer.void(next_tn, &forward).await
    }
}
