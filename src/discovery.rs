use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::config::{AttachedTrustedNode, Settings};
use crate::error::Result;

const DISCOVERY_TIMEOUT: Duration = Duration::from_secs(5);

/// One trusted node's view of itself and its immediate neighbors, as
/// carried in a discovery walk.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TrustedNodeRecord {
    pub tn_id: String,
    pub kme_ids: Vec<String>,
    pub sae_ids: Vec<String>,
    pub neighbor_tn_ids: Vec<String>,
    pub distance: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiscoverRequest {
    pub walked_nodes: Vec<TrustedNodeRecord>,
    pub distance: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiscoverResponse {
    pub walked_nodes: Vec<TrustedNodeRecord>,
}

/// Posts a discovery walk to one neighbor and returns what it reports.
/// Defined as a trait so the bounded-flood algorithm can be exercised
/// against an in-memory overlay in tests without real mTLS sockets.
#[async_trait]
pub trait DiscoveryTransport: Send + Sync {
    async fn walk_to(
        &self,
        neighbor: &AttachedTrustedNode,
        walked: &[TrustedNodeRecord],
        distance: u32,
    ) -> Result<Vec<TrustedNodeRecord>>;
}

/// Production transport: posts to `{neighbor.url}/api/v1/discover/trusted_nodes`
/// over mTLS, authenticating with the trusted node's own client cert/key.
pub struct HttpDiscoveryTransport {
    client: reqwest::Client,
}

impl HttpDiscoveryTransport {
    pub fn new() -> Result<Self> {
        let client = reqwest::Client::builder()
            .danger_accept_invalid_certs(false)
            .timeout(DISCOVERY_TIMEOUT)
            .build()?;

        Ok(Self { client })
    }
}

#[async_trait]
impl DiscoveryTransport for HttpDiscoveryTransport {
    async fn walk_to(
        &self,
        neighbor: &AttachedTrustedNode,
        walked: &[TrustedNodeRecord],
        distance: u32,
    ) -> Result<Vec<TrustedNodeRecord>> {
        let url = format!("{}/api/v1/discover/trusted_nodes", neighbor.url);

        let request = DiscoverRequest {
            walked_nodes: walked.to_vec(),
            distance,
        };

        let response = self
            .client
            .post(&url)
            .json(&request)
            .send()
            .await?
            .json::<DiscoverResponse>()
            .await?;

        Ok(response.walked_nodes)
    }
}

fn self_record(settings: &Settings, distance: u32) -> TrustedNodeRecord {
    let mut neighbor_ids: Vec<String> = settings
        .attached_trusted_nodes
        .iter()
        .map(|tn| tn.id.clone())
        .collect();
    neighbor_ids.sort();

    TrustedNodeRecord {
        tn_id: settings.id.clone(),
        kme_ids: settings.attached_kmes.iter().map(|k| k.kme_id.clone()).collect(),
        sae_ids: settings.attached_saes.iter().map(|s| s.sae_id.clone()).collect(),
        neighbor_tn_ids: neighbor_ids,
        distance,
    }
}

/// Bounded-flood discovery of the trusted-node overlay.
///
/// The caller builds its own record and appends it to `walked`. For each
/// configured neighbor not already present (by `tn_id`), it walks one hop
/// further and merges what comes back, deduplicating by `tn_id`. A peer
/// that fails to connect or times out fail-closes the *whole* call: only
/// `[self]` is returned, matching the depth-limited-walk behavior of the
/// reference implementation this protocol was distilled from.
///
/// Termination is guaranteed because the explicit visited set carried in
/// `walked` only grows, and each hop only recurses into ids absent from it.
pub async fn discover_trusted_nodes(
    settings: &Settings,
    transport: &dyn DiscoveryTransport,
    mut walked: Vec<TrustedNodeRecord>,
    distance: u32,
) -> Result<Vec<TrustedNodeRecord>> {
    let mine = self_record(settings, distance);
    walked.push(mine);

    let mut neighbors: Vec<&AttachedTrustedNode> = settings.attached_trusted_nodes.iter().collect();
    neighbors.sort_by(|a, b| a.id.cmp(&b.id));

    for neighbor in neighbors {
        if walked.iter().any(|w| w.tn_id == neighbor.id) {
            continue;
        }

        match transport.walk_to(neighbor, &walked, distance + 1).await {
            Ok(returned) => {
                for record in returned {
                    if !walked.iter().any(|w| w.tn_id == record.tn_id) {
                        walked.push(record);
                    }
                }
            }
            Err(e) => {
                log::error!("failed to reach trusted node {}: {}", neighbor.id, e);
                return Ok(vec![self_record(settings, distance)]);
            }
        }
    }

    Ok(walked)
}

/// Convenience entry point for a self-initiated discovery, starting at
/// distance 0 with an empty visited set.
pub async fn discover(settings: &Settings, transport: &dyn DiscoveryTransport) -> Result<Vec<TrustedNodeRecord>> {
    discover_trusted_nodes(settings, transport, Vec::new(), 0).await
}
