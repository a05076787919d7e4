use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::{Request, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::broker::BrokerClient;
use crate::config::Settings;
use crate::discovery::{self, DiscoverRequest, DiscoverResponse, DiscoveryTransport};
use crate::error::{KmeError, Result};
use crate::identity::{fingerprint_from_der, Identity, IdentityStore};
use crate::pool::KeyPool;
use crate::relay::{KeyDocument, PeerClient, RelayEnvelope, RelayStateMachine, VoidEnvelope};
use crate::sync::PoolSynchronizer;
use crate::tls::PeerCertificate;

/// Everything a request handler needs, shared read-only (behind `Arc`)
/// across every connection.
pub struct AppState<D: DiscoveryTransport, P: PeerClient, B: BrokerClient> {
    pub settings: Arc<Settings>,
    pub pool: Arc<KeyPool>,
    pub identity: Arc<IdentityStore>,
    pub discovery: Arc<D>,
    pub relay: Arc<RelayStateMachine<D, P>>,
    pub sync: Arc<PoolSynchronizer<B>>,
}

impl<D: DiscoveryTransport, P: PeerClient, B: BrokerClient> Clone for AppState<D, P, B> {
    fn clone(&self) -> Self {
        Self {
            settings: self.settings.clone(),
            pool: self.pool.clone(),
            identity: self.identity.clone(),
            discovery: self.discovery.clone(),
            relay: self.relay.clone(),
            sync: self.sync.clone(),
        }
    }
}

impl IntoResponse for KmeError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let body = Json(serde_json::json!({ "message": self.to_string() }));
        (status, body).into_response()
    }
}

/// Extracts the (CN, serial) fingerprint from the mTLS peer certificate the
/// `MtlsAcceptor` attached to the request.
fn caller_fingerprint<B>(req: &Request<B>) -> Result<(String, String)> {
    let cert = req
        .extensions()
        .get::<PeerCertificate>()
        .ok_or_else(|| KmeError::Identity("no client certificate presented".to_string()))?;

    fingerprint_from_der(&cert.0)
}

/// Resolves the caller's identity from the mTLS peer certificate.
fn caller_identity<B>(req: &Request<B>, identity: &IdentityStore) -> Result<Identity> {
    let (cn, serial) = caller_fingerprint(req)?;
    identity.resolve(&cn, &serial).map(Clone::clone)
}

/// Like [`caller_identity`], but requires the caller to resolve to a
/// recognized SAE and returns its id directly.
fn caller_sae<B>(req: &Request<B>, identity: &IdentityStore) -> Result<String> {
    let (cn, serial) = caller_fingerprint(req)?;
    identity.expect_sae(&cn, &serial)
}

/// Like [`caller_identity`], but requires the caller to resolve to a
/// recognized trusted node and returns its id directly.
fn caller_trusted_node<B>(req: &Request<B>, identity: &IdentityStore) -> Result<String> {
    let (cn, serial) = caller_fingerprint(req)?;
    identity.expect_trusted_node(&cn, &serial)
}

pub fn build_router<D, P, B>(state: Arc<AppState<D, P, B>>) -> Router
where
    D: DiscoveryTransport + 'static,
    P: PeerClient + 'static,
    B: BrokerClient + 'static,
{
    Router::new()
        .route("/api/v1/keys/:slave_sae_id/status", get(status::<D, P, B>))
        .route(
            "/api/v1/keys/:slave_sae_id/enc_keys",
            get(get_enc_keys::<D, P, B>).post(post_enc_keys::<D, P, B>),
        )
        .route(
            "/api/v1/keys/:master_sae_id/dec_keys",
            get(get_dec_keys::<D, P, B>).post(post_dec_keys::<D, P, B>),
        )
        .route(
            "/api/v1/discover/trusted_nodes",
            post(discover_trusted_nodes::<D, P, B>),
        )
        .route("/api/v1/kmapi/v1/ext_keys", post(ext_keys::<D, P, B>))
        .route("/api/v1/kmapi/v1/void", post(void::<D, P, B>))
        .route("/api/v1/kmapi/versions", get(versions))
        .layer(tower_http::trace::TraceLayer::new_for_http())
        .with_state(state)
}

async fn versions() -> impl IntoResponse {
    Json(serde_json::json!({ "versions": ["v1"], "extension": {} }))
}

#[derive(Debug, Serialize)]
struct StatusResponse {
    #[serde(rename = "source_KME_ID")]
    source_kme_id: String,
    #[serde(rename = "target_KME_ID")]
    target_kme_id: String,
    #[serde(rename = "master_SAE_ID")]
    master_sae_id: String,
    #[serde(rename = "slave_SAE_ID")]
    slave_sae_id: String,
    key_size: u32,
    stored_key_count: usize,
    max_key_count: usize,
    max_key_per_request: usize,
    max_key_size: u32,
    min_key_size: u32,
    #[serde(rename = "max_SAE_ID_count")]
    max_sae_id_count: u32,
}

async fn status<D: DiscoveryTransport, P: PeerClient, B: BrokerClient>(
    State(state): State<Arc<AppState<D, P, B>>>,
    Path(slave_sae_id): Path<String>,
    req: Request<axum::body::Body>,
) -> Result<Json<StatusResponse>> {
    let master_sae_id = caller_sae(&req, &state.identity)?;

    let target_kme_id = if state.settings.find_attached_sae(&slave_sae_id).is_some() {
        state.settings.id.clone()
    } else {
        let records = discovery::discover(&state.settings, state.discovery.as_ref()).await?;
        records
            .iter()
            .find(|r| r.tn_id != state.settings.id && r.sae_ids.iter().any(|s| s == &slave_sae_id))
            .map(|r| r.tn_id.clone())
            .ok_or_else(|| KmeError::Routing(format!("the given slave_sae_id {} cannot be routed to", slave_sae_id)))?
    };

    Ok(Json(StatusResponse {
        source_kme_id: state.settings.id.clone(),
        target_kme_id,
        master_sae_id,
        slave_sae_id,
        key_size: state.settings.default_key_size,
        stored_key_count: state.pool.count().await,
        max_key_count: state.settings.max_key_count,
        max_key_per_request: state.settings.max_keys_per_request,
        max_key_size: state.settings.max_key_size,
        min_key_size: state.settings.min_key_size,
        max_sae_id_count: 0,
    }))
}

#[derive(Debug, Default, Deserialize)]
struct EncKeysQuery {
    number: Option<usize>,
    size: Option<u32>,
}

#[derive(Debug, Serialize)]
struct EncKeysResponse {
    keys: Vec<KeyDocument>,
}

async fn get_enc_keys<D: DiscoveryTransport, P: PeerClient, B: BrokerClient>(
    State(state): State<Arc<AppState<D, P, B>>>,
    Path(slave_sae_id): Path<String>,
    Query(query): Query<EncKeysQuery>,
    req: Request<axum::body::Body>,
) -> Result<Json<EncKeysResponse>> {
    let caller = caller_identity(&req, &state.identity)?;
    enc_keys_core(&state, &slave_sae_id, caller, query).await
}

async fn post_enc_keys<D: DiscoveryTransport, P: PeerClient, B: BrokerClient>(
    State(state): State<Arc<AppState<D, P, B>>>,
    Path(slave_sae_id): Path<String>,
    req: Request<axum::body::Body>,
) -> Result<Json<EncKeysResponse>> {
    let caller = caller_identity(&req, &state.identity)?;

    let bytes = axum::body::to_bytes(req.into_body(), usize::MAX)
        .await
        .map_err(|e| KmeError::Validation(format!("could not read request body: {}", e)))?;
    let query: EncKeysQuery = if bytes.is_empty() {
        EncKeysQuery::default()
    } else {
        serde_json::from_slice(&bytes)?
    };

    enc_keys_core(&state, &slave_sae_id, caller, query).await
}

async fn enc_keys_core<D: DiscoveryTransport, P: PeerClient, B: BrokerClient>(
    state: &AppState<D, P, B>,
    slave_sae_id: &str,
    caller: Identity,
    query: EncKeysQuery,
) -> Result<Json<EncKeysResponse>> {
    let number = query.number.unwrap_or(1);
    let size_bits = query.size.unwrap_or(state.settings.default_key_size);
    state.settings.check_key_size(size_bits)?;
    state.settings.check_number(number, state.pool.count().await)?;

    match caller {
        Identity::Sae(master_sae_id) => {
            let mut keys = Vec::with_capacity(number);

            if state.settings.find_attached_sae(&slave_sae_id).is_some() {
                for _ in 0..number {
                    let key = state
                        .pool
                        .take_one()
                        .await
                        .ok_or_else(|| KmeError::NotFound("pool is empty".to_string()))?;
                    let activated = state
                        .pool
                        .activate(key.key_id, &master_sae_id, &slave_sae_id, size_bits)
                        .await?;

                    if state.settings.is_master {
                        state.sync.notify_activated(activated.clone()).await?;
                    }

                    keys.push(KeyDocument {
                        key_id: activated.key_id,
                        key: BASE64.encode(&activated.material_prefix),
                    });
                }
            } else {
                for _ in 0..number {
                    let doc = state
                        .relay
                        .initiate_encryption(&master_sae_id, &slave_sae_id, size_bits)
                        .await?;
                    keys.push(doc);
                }
            }

            Ok(Json(EncKeysResponse { keys }))
        }
        Identity::Kme(_) => {
            // A neighboring hop's relay logic pulling a fresh QKD key for
            // its link with us. `slave_sae_id` here is the remote trusted
            // node's own id, reused as the counterpart identity.
            let mut keys = Vec::with_capacity(number);
            for _ in 0..number {
                let key = state
                    .pool
                    .take_one()
                    .await
                    .ok_or_else(|| KmeError::NotFound("pool is empty".to_string()))?;
                let activated = state
                    .pool
                    .activate(key.key_id, &state.settings.id, &slave_sae_id, size_bits)
                    .await?;

                if state.settings.is_master {
                    state.sync.notify_activated(activated.clone()).await?;
                }

                keys.push(KeyDocument {
                    key_id: activated.key_id,
                    key: BASE64.encode(&activated.material_prefix),
                });
            }
            Ok(Json(EncKeysResponse { keys }))
        }
        Identity::TrustedNode(_) => Err(KmeError::Identity(
            "enc_keys is not callable by a trusted node directly".to_string(),
        )),
    }
}

#[derive(Debug, Deserialize)]
struct DecKeysQuery {
    #[serde(rename = "key_ID")]
    key_id: Uuid,
}

#[derive(Debug, Serialize)]
struct DecKeysResponse {
    keys: Vec<KeyDocument>,
}

async fn get_dec_keys<D: DiscoveryTransport, P: PeerClient, B: BrokerClient>(
    State(state): State<Arc<AppState<D, P, B>>>,
    Path(master_sae_id): Path<String>,
    Query(query): Query<DecKeysQuery>,
    req: Request<axum::body::Body>,
) -> Result<Json<DecKeysResponse>> {
    let caller = caller_identity(&req, &state.identity)?;
    dec_keys_core(&state, &master_sae_id, caller, query.key_id).await
}

async fn post_dec_keys<D: DiscoveryTransport, P: PeerClient, B: BrokerClient>(
    State(state): State<Arc<AppState<D, P, B>>>,
    Path(master_sae_id): Path<String>,
    req: Request<axum::body::Body>,
) -> Result<Json<DecKeysResponse>> {
    let caller = caller_identity(&req, &state.identity)?;

    let bytes = axum::body::to_bytes(req.into_body(), usize::MAX)
        .await
        .map_err(|e| KmeError::Validation(format!("could not read request body: {}", e)))?;
    let query: DecKeysQuery = serde_json::from_slice(&bytes)?;

    dec_keys_core(&state, &master_sae_id, caller, query.key_id).await
}

async fn dec_keys_core<D: DiscoveryTransport, P: PeerClient, B: BrokerClient>(
    state: &AppState<D, P, B>,
    master_sae_id: &str,
    caller: Identity,
    key_id: Uuid,
) -> Result<Json<DecKeysResponse>> {
    match caller {
        Identity::Sae(local_sae_id) => {
            if state.settings.find_attached_sae(master_sae_id).is_some() {
                let activated = state.pool.deactivate(key_id).await?;

                if state.settings.is_master {
                    state.sync.notify_deactivated(key_id).await?;
                }

                Ok(Json(DecKeysResponse {
                    keys: vec![KeyDocument {
                        key_id: activated.key_id,
                        key: BASE64.encode(&activated.material_prefix),
                    }],
                }))
            } else {
                let activated = state
                    .pool
                    .lookup_activated_full(key_id)
                    .await
                    .ok_or_else(|| KmeError::NotFound("key not yet delivered".to_string()))?;

                let document = KeyDocument {
                    key_id: activated.key_id,
                    key: BASE64.encode(&activated.material_prefix),
                };

                state
                    .relay
                    .initiate_void(&local_sae_id, master_sae_id, vec![key_id])
                    .await?;

                Ok(Json(DecKeysResponse { keys: vec![document] }))
            }
        }
        // The shared KME on this link serving a dec_keys call for a
        // previously-activated hop key: the requesting neighbor already
        // activated it via enc_keys, so this retrieval also completes its
        // lifecycle (ActivatedKey is removed when the counterpart retrieves
        // it).
        Identity::Kme(_) => {
            let activated = state.pool.deactivate(key_id).await?;

            if state.settings.is_master {
                state.sync.notify_deactivated(key_id).await?;
            }

            Ok(Json(DecKeysResponse {
                keys: vec![KeyDocument {
                    key_id: activated.key_id,
                    key: BASE64.encode(&activated.material_prefix),
                }],
            }))
        }
        Identity::TrustedNode(_) => Err(KmeError::Identity(
            "dec_keys is not callable by a trusted node directly".to_string(),
        )),
    }
}

async fn discover_trusted_nodes<D: DiscoveryTransport, P: PeerClient, B: BrokerClient>(
    State(state): State<Arc<AppState<D, P, B>>>,
    req: Request<axum::body::Body>,
) -> Result<Json<DiscoverResponse>>
where
    D: 'static,
{
    caller_identity(&req, &state.identity)?;

    let bytes = axum::body::to_bytes(req.into_body(), usize::MAX)
        .await
        .map_err(|e| KmeError::Validation(format!("could not read request body: {}", e)))?;
    let request: DiscoverRequest = serde_json::from_slice(&bytes)?;

    let walked_nodes = discovery::discover_trusted_nodes(
        &state.settings,
        state.discovery.as_ref(),
        request.walked_nodes,
        request.distance,
    )
    .await?;

    Ok(Json(DiscoverResponse { walked_nodes }))
}

async fn ext_keys<D: DiscoveryTransport, P: PeerClient, B: BrokerClient>(
    State(state): State<Arc<AppState<D, P, B>>>,
    req: Request<axum::body::Body>,
) -> Result<Json<KeyDocument>> {
    let caller_tn_id = caller_trusted_node(&req, &state.identity)?;

    let bytes = axum::body::to_bytes(req.into_body(), usize::MAX)
        .await
        .map_err(|e| KmeError::Validation(format!("could not read request body: {}", e)))?;
    // A tuple-shaped xor_material fails to deserialize as Option<String>
    // here, which is the scalar-only rejection the design calls for.
    let envelope: RelayEnvelope = serde_json::from_slice(&bytes)?;

    let document = state.relay.handle_ext_keys(envelope, &caller_tn_id).await?;
    Ok(Json(document))
}

async fn void<D: DiscoveryTransport, P: PeerClient, B: BrokerClient>(
    State(state): State<Arc<AppState<D, P, B>>>,
    req: Request<axum::body::Body>,
) -> Result<StatusCode> {
    caller_trusted_node(&req, &state.identity)?;

    let bytes = axum::body::to_bytes(req.into_body(), usize::MAX)
        .await
        .map_err(|e| KmeError::Validation(format!("could not read request body: {}", e)))?;
    let envelope: VoidEnvelope = serde_json::from_slice(&bytes)?;

    state.relay.handle_void(envelope).await?;
    Ok(StatusCode::NO_CONTENT)
}
