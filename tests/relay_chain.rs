//! End-to-end multi-hop relay: A initiates to C through intermediate B,
//! entirely in-process against fakes for discovery and the peer RPCs.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, OnceLock};

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use tokio::sync::Mutex;
use uuid::Uuid;

use qkd_kme::config::{AttachedKme, AttachedSae, AttachedTrustedNode, MqSettings, Settings};
use qkd_kme::discovery::{discover_trusted_nodes, DiscoveryTransport, TrustedNodeRecord};
use qkd_kme::error::Result;
use qkd_kme::pool::KeyPool;
use qkd_kme::relay::{KeyDocument, PeerClient, RelayEnvelope, RelayStateMachine, VoidEnvelope};

fn settings(id: &str, neighbors: &[&str], saes: &[&str]) -> Settings {
    Settings {
        id: id.to_string(),
        server_cert_file: "s.pem".to_string(),
        server_key_file: "s.key".to_string(),
        ca_file: "ca.pem".to_string(),
        min_key_size: 8,
        max_key_size: 64,
        default_key_size: 16,
        max_key_count: 10,
        max_keys_per_request: 10,
        key_generation_timeout_in_seconds: 1,
        is_master: true,
        mq: MqSettings {
            mq_host: "localhost".to_string(),
            mq_port: 5672,
            mq_username: "guest".to_string(),
            mq_password: "guest".to_string(),
            mq_shared_queue: "q".to_string(),
        },
        attached_kmes: neighbors
            .iter()
            .map(|n| AttachedKme {
                url: format!("https://kme-{}-{}", id, n),
                kme_id: format!("kme-{}-{}", id, n),
                kme_cert: "c".to_string(),
                sae_cert: "c".to_string(),
                sae_key: "k".to_string(),
                linked_to: n.to_string(),
                distance: 0,
            })
            .collect(),
        attached_saes: saes
            .iter()
            .map(|s| AttachedSae {
                sae_id: s.to_string(),
                sae_cert: "c".to_string(),
            })
            .collect(),
        attached_trusted_nodes: neighbors
            .iter()
            .map(|n| AttachedTrustedNode {
                url: format!("https://{}", n),
                id: n.to_string(),
                cert: "c".to_string(),
                key: "k".to_string(),
            })
            .collect(),
    }
}

/// Recurses straight into the neighbor's own `discover_trusted_nodes` call
/// instead of going over HTTP, mirroring the discovery module's own test
/// harness.
struct FakeOverlay {
    nodes: HashMap<String, Settings>,
}

#[async_trait]
impl DiscoveryTransport for FakeOverlay {
    async fn walk_to(
        &self,
        neighbor: &AttachedTrustedNode,
        walked: &[TrustedNodeRecord],
        distance: u32,
    ) -> Result<Vec<TrustedNodeRecord>> {
        let neighbor_settings = self.nodes.get(&neighbor.id).expect("neighbor configured");
        discover_trusted_nodes(neighbor_settings, self, walked.to_vec(), distance).await
    }
}

type Machine = RelayStateMachine<FakeOverlay, DispatchPeerClient>;

/// State shared by every node's [`DispatchPeerClient`]: the link key
/// material handed out by `enc_keys`, keyed by the `key_id` it was minted
/// under so a later `dec_keys` (on either end of that link) recovers the
/// same bytes, and a registry of every node's state machine so `ext_keys`/
/// `void` can be dispatched without a real socket.
struct Shared {
    link_material: Mutex<VecDeque<Vec<u8>>>,
    keys: Mutex<HashMap<Uuid, Vec<u8>>>,
    nodes: OnceLock<HashMap<String, Arc<Machine>>>,
}

/// One node's view of the dispatcher: `self_id` stands in for the mTLS
/// identity the gateway would otherwise resolve the caller from.
struct DispatchPeerClient {
    self_id: String,
    shared: Arc<Shared>,
}

#[async_trait]
impl PeerClient for DispatchPeerClient {
    async fn enc_keys(&self, _kme: &AttachedKme, _counterpart_id: &str, size_bits: u32) -> Result<KeyDocument> {
        let material = self
            .shared
            .link_material
            .lock()
            .await
            .pop_front()
            .unwrap_or_else(|| vec![0u8; (size_bits / 8) as usize]);

        let key_id = Uuid::new_v4();
        self.shared.keys.lock().await.insert(key_id, material.clone());

        Ok(KeyDocument {
            key_id,
            key: BASE64.encode(&material),
        })
    }

    async fn dec_keys(&self, _kme: &AttachedKme, _counterpart_id: &str, key_id: Uuid) -> Result<KeyDocument> {
        let material = self
            .shared
            .keys
            .lock()
            .await
            .get(&key_id)
            .cloned()
            .expect("key minted by a prior enc_keys call");

        Ok(KeyDocument {
            key_id,
            key: BASE64.encode(&material),
        })
    }

    async fn ext_keys(&self, tn: &AttachedTrustedNode, envelope: &RelayEnvelope) -> Result<KeyDocument> {
        let nodes = self.shared.nodes.get().expect("registry populated");
        let target = nodes.get(&tn.id).expect("target node wired into the registry");
        target.handle_ext_keys(envelope.clone(), &self.self_id).await
    }

    async fn void(&self, tn: &AttachedTrustedNode, envelope: &VoidEnvelope) -> Result<()> {
        let nodes = self.shared.nodes.get().expect("registry populated");
        let target = nodes.get(&tn.id).expect("target node wired into the registry");
        target.handle_void(envelope.clone()).await
    }
}

struct Node {
    machine: Arc<Machine>,
    pool: Arc<KeyPool>,
}

/// Wires up a small overlay: every id in `topology` gets a machine, a
/// pool, and a `DispatchPeerClient` pointed at the same shared registry.
/// `link_material` is consumed in the order `enc_keys` is called, which
/// for a straight chain A-B-C-... is one entry per link, in path order.
fn build_network(topology: &[(&'static str, &[&str], &[&str])], link_material: Vec<Vec<u8>>) -> HashMap<&'static str, Node> {
    let mut overlay_nodes = HashMap::new();
    for (id, neighbors, saes) in topology {
        overlay_nodes.insert(id.to_string(), settings(id, neighbors, saes));
    }
    let discovery = Arc::new(FakeOverlay { nodes: overlay_nodes });

    let shared = Arc::new(Shared {
        link_material: Mutex::new(VecDeque::from(link_material)),
        keys: Mutex::new(HashMap::new()),
        nodes: OnceLock::new(),
    });

    let mut nodes = HashMap::new();
    let mut registry = HashMap::new();

    for (id, neighbors, saes) in topology {
        let pool = Arc::new(KeyPool::new());
        let machine = Arc::new(RelayStateMachine::new(
            Arc::new(settings(id, neighbors, saes)),
            pool.clone(),
            discovery.clone(),
            Arc::new(DispatchPeerClient {
                self_id: id.to_string(),
                shared: shared.clone(),
            }),
        ));
        registry.insert(id.to_string(), machine.clone());
        nodes.insert(*id, Node { machine, pool });
    }

    shared.nodes.set(registry).unwrap_or_else(|_| panic!("registry set once"));
    nodes
}

/// The worked example: Q_AB = 0x0F0F, Q_BC = 0x00FF delivers 0x0FF0 at C,
/// with B, the one intermediate, never learning that value.
#[tokio::test]
async fn three_hop_relay_delivers_the_xor_of_every_link_key() {
    let nodes = build_network(
        &[("a", &["b"], &["sae-a"]), ("b", &["a", "c"], &[]), ("c", &["b"], &["sae-c"])],
        vec![vec![0x0F, 0x0F], vec![0x00, 0xFF]],
    );

    let delivered = nodes["a"]
        .machine
        .initiate_encryption("sae-a", "sae-c", 16)
        .await
        .unwrap();

    let bytes = BASE64.decode(&delivered.key).unwrap();
    assert_eq!(bytes, vec![0x0F, 0xF0]);

    let activated = nodes["c"].pool.lookup_activated_full(delivered.key_id).await.unwrap();
    assert_eq!(activated.material_prefix, vec![0x0F, 0xF0]);
    assert_eq!(activated.master_sae_id, "sae-a");
    assert_eq!(activated.slave_sae_id, "sae-c");

    // B only ever decrypted Q_AB and Q_BC individually; it never adopts an
    // activated ledger entry for a relay it merely forwarded.
    assert!(nodes["b"].pool.lookup_activated_full(delivered.key_id).await.is_none());
}

/// A relay over a path with no intermediate hop is just the one link key,
/// unmasked.
#[tokio::test]
async fn two_node_relay_reduces_to_the_single_link_key() {
    let nodes = build_network(
        &[("a", &["c"], &["sae-a"]), ("c", &["a"], &["sae-c"])],
        vec![vec![0xAB, 0xCD]],
    );

    let delivered = nodes["a"]
        .machine
        .initiate_encryption("sae-a", "sae-c", 16)
        .await
        .unwrap();

    let bytes = BASE64.decode(&delivered.key).unwrap();
    assert_eq!(bytes, vec![0xAB, 0xCD]);
}

/// A four-node chain accumulates every link key in turn: the fix to the
/// carry computation has to hold past a single intermediate, not just at
/// the boundary case.
#[tokio::test]
async fn four_hop_relay_accumulates_every_link_in_the_chain() {
    let nodes = build_network(
        &[
            ("a", &["b"], &["sae-a"]),
            ("b", &["a", "c"], &[]),
            ("c", &["b", "d"], &[]),
            ("d", &["c"], &["sae-d"]),
        ],
        vec![vec![0b1010_1010], vec![0b0110_0110], vec![0b0011_0011]],
    );

    let delivered = nodes["a"]
        .machine
        .initiate_encryption("sae-a", "sae-d", 8)
        .await
        .unwrap();

    let bytes = BASE64.decode(&delivered.key).unwrap();
    assert_eq!(bytes, vec![0b1010_1010 ^ 0b0110_0110 ^ 0b0011_0011]);
}

/// Voiding an activated relay key walks the same path and clears every
/// node's ledger entry.
#[tokio::test]
async fn void_clears_the_activated_ledger_on_every_hop() {
    let nodes = build_network(
        &[("a", &["b"], &["sae-a"]), ("b", &["a", "c"], &[]), ("c", &["b"], &["sae-c"])],
        vec![vec![0x0F, 0x0F], vec![0x00, 0xFF]],
    );

    let delivered = nodes["a"]
        .machine
        .initiate_encryption("sae-a", "sae-c", 16)
        .await
        .unwrap();

    assert!(nodes["c"].pool.lookup_activated(delivered.key_id).await.is_some());

    nodes["a"]
        .machine
        .initiate_void("sae-a", "sae-c", vec![delivered.key_id])
        .await
        .unwrap();

    assert!(nodes["c"].pool.lookup_activated(delivered.key_id).await.is_none());
}

/// Two independent relays between the same SAE pair, run concurrently,
/// each get their own `first_key_id` and complete without interfering
/// with each other's ledger entry.
#[tokio::test]
async fn independent_concurrent_relays_each_deliver_their_own_key() {
    let nodes = build_network(
        &[("a", &["b"], &["sae-a"]), ("b", &["a", "c"], &[]), ("c", &["b"], &["sae-c"])],
        vec![vec![0x11, 0x22], vec![0x33, 0x44], vec![0x55, 0x66], vec![0x77, 0x88]],
    );

    let (first, second) = tokio::join!(
        nodes["a"].machine.initiate_encryption("sae-a", "sae-c", 16),
        nodes["a"].machine.initiate_encryption("sae-a", "sae-c", 16),
    );

    let first = first.unwrap();
    let second = second.unwrap();
    assert_ne!(first.key_id, second.key_id);

    assert!(nodes["c"].pool.lookup_activated(first.key_id).await.is_some());
    assert!(nodes["c"].pool.lookup_activated(second.key_id).await.is_some());
}
