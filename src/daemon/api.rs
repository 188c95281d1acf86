// Copyright (c) 2026 LibreSeed
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//     http://www.apache.org/licenses/LICENSE-2.0
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! HTTP request surface on the loopback address.
//!
//! Handlers translate requests into component operations; errors map to
//! the statuses the protocol prescribes (400 malformed, 401 bad signature,
//! 403 inactive, 404 missing, 409 duplicate, 410 expired, 503 DHT down).

use crate::core::crypto::{self, CryptoError, PublicKey};
use crate::core::package::{info_hash_from_package_id, parse_package, PackageError};
use crate::daemon::Daemon;
use crate::networking::dht::DhtError;
use crate::registry::maintainers::MaintainerError;
use crate::registry::packages::{PackageInfo, RegistryError};
use axum::extract::{DefaultBodyLimit, Multipart, Path, Query, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use tracing::{info, warn};

/// Largest accepted package container upload.
const MAX_UPLOAD_BYTES: usize = 500 * 1024 * 1024;
/// Caller-facing deadline for an on-demand peer lookup.
const DISCOVERY_LOOKUP_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(30);

type AppState = Arc<Daemon>;

/// Build the full request router over a daemon.
pub fn router(daemon: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/status", get(status))
        .route("/stats", get(stats))
        .route("/shutdown", post(shutdown))
        .route("/metrics", get(metrics))
        .route("/packages/add", post(add_package))
        .route("/packages/list", get(list_packages))
        .route("/packages/remove", delete(remove_package_query).post(remove_package_json))
        .route("/packages/sign/:package_id", post(sign_package))
        .route("/maintainers", get(list_maintainers).post(register_maintainer))
        .route("/maintainers/:fingerprint", get(get_maintainer))
        .route("/maintainers/activate/:fingerprint", post(activate_maintainer))
        .route("/maintainers/deactivate/:fingerprint", post(deactivate_maintainer))
        .route("/signatures/pending", get(list_pending))
        .route("/dht/stats", get(dht_stats))
        .route("/dht/announcements", get(dht_announcements))
        .route("/dht/peers", get(dht_peers))
        .route("/dht/discovery", get(dht_discovery))
        .layer(DefaultBodyLimit::max(MAX_UPLOAD_BYTES))
        .with_state(daemon)
}

/// Handler-level error with its HTTP status.
#[derive(Debug)]
enum ApiError {
    BadRequest(String),
    Unauthorized(String),
    Forbidden(String),
    NotFound(String),
    Conflict(String),
    Gone(String),
    Internal(String),
    DhtDisabled,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::BadRequest(m) => (StatusCode::BAD_REQUEST, m),
            ApiError::Unauthorized(m) => (StatusCode::UNAUTHORIZED, m),
            ApiError::Forbidden(m) => (StatusCode::FORBIDDEN, m),
            ApiError::NotFound(m) => (StatusCode::NOT_FOUND, m),
            ApiError::Conflict(m) => (StatusCode::CONFLICT, m),
            ApiError::Gone(m) => (StatusCode::GONE, m),
            ApiError::Internal(m) => (StatusCode::INTERNAL_SERVER_ERROR, m),
            ApiError::DhtDisabled => (StatusCode::SERVICE_UNAVAILABLE, "dht disabled".to_string()),
        };
        (status, Json(json!({ "error": message }))).into_response()
    }
}

impl From<RegistryError> for ApiError {
    fn from(e: RegistryError) -> Self {
        match e {
            RegistryError::DuplicatePackage(_) => ApiError::Conflict(e.to_string()),
            RegistryError::PackageNotFound(_) => ApiError::NotFound(e.to_string()),
            RegistryError::InvalidRecord(_) => ApiError::BadRequest(e.to_string()),
            RegistryError::Io(_) | RegistryError::Corrupt(_) => ApiError::Internal(e.to_string()),
        }
    }
}

impl From<MaintainerError> for ApiError {
    fn from(e: MaintainerError) -> Self {
        match e {
            MaintainerError::MaintainerExists(_) => ApiError::Conflict(e.to_string()),
            MaintainerError::MaintainerNotFound(_) | MaintainerError::PendingNotFound(_) => {
                ApiError::NotFound(e.to_string())
            }
            MaintainerError::MaintainerInactive(_) => ApiError::Forbidden(e.to_string()),
            MaintainerError::PendingExpired(_) => ApiError::Gone(e.to_string()),
            MaintainerError::InvalidRecord(_) => ApiError::BadRequest(e.to_string()),
            MaintainerError::Corrupt(_) | MaintainerError::Io(_) => {
                ApiError::Internal(e.to_string())
            }
        }
    }
}

impl From<PackageError> for ApiError {
    fn from(e: PackageError) -> Self {
        ApiError::BadRequest(e.to_string())
    }
}

impl From<CryptoError> for ApiError {
    fn from(e: CryptoError) -> Self {
        ApiError::Unauthorized(e.to_string())
    }
}

impl From<DhtError> for ApiError {
    fn from(e: DhtError) -> Self {
        match e {
            DhtError::Disabled => ApiError::DhtDisabled,
            other => ApiError::Internal(other.to_string()),
        }
    }
}

async fn health() -> impl IntoResponse {
    Json(json!({ "status": "ok" }))
}

async fn status(State(daemon): State<AppState>) -> impl IntoResponse {
    Json(daemon.state().snapshot())
}

async fn stats(State(daemon): State<AppState>) -> impl IntoResponse {
    Json(daemon.statistics().snapshot())
}

async fn shutdown(State(daemon): State<AppState>) -> impl IntoResponse {
    info!("shutdown requested over http");
    daemon.request_shutdown();
    Json(json!({ "status": "shutting down" }))
}

async fn metrics(State(daemon): State<AppState>) -> impl IntoResponse {
    let m = daemon.metrics();
    m.packages.set(daemon.packages().len() as i64);
    m.peers.set(daemon.peer_manager().get_stats().tracked as i64);
    if let Some(dht) = daemon.dht() {
        let s = dht.stats();
        m.dht_nodes.set(s.nodes as i64);
        m.dht_queries.set(s.queries_sent as i64);
        m.dht_responses.set(s.responses_received as i64);
        m.dht_announces.set(s.announces as i64);
        m.dht_lookups.set(s.lookups as i64);
        m.dht_errors.set(s.errors as i64);
    }
    if let Some(discovery) = daemon.discovery() {
        let s = discovery.stats();
        m.cache_hits.set(s.hits as i64);
        m.cache_misses.set(s.misses as i64);
    }
    ([(header::CONTENT_TYPE, "text/plain; version=0.0.4")], m.render())
}

async fn add_package(
    State(daemon): State<AppState>,
    mut multipart: Multipart,
) -> Result<Response, ApiError> {
    let mut file_bytes: Option<Vec<u8>> = None;
    let mut file_name: Option<String> = None;
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| ApiError::BadRequest(format!("bad multipart body: {e}")))?
    {
        if field.name() == Some("file") {
            file_name = field.file_name().map(str::to_string);
            let bytes = field
                .bytes()
                .await
                .map_err(|e| ApiError::BadRequest(format!("bad multipart body: {e}")))?;
            file_bytes = Some(bytes.to_vec());
        }
    }
    let bytes = file_bytes
        .ok_or_else(|| ApiError::BadRequest("missing multipart field 'file'".to_string()))?;

    let pkg = match parse_package(&bytes, false) {
        Ok(pkg) => pkg,
        Err(e) => {
            daemon.metrics().rejects_total.inc();
            return Err(e.into());
        }
    };
    if let Err(e) = pkg.verify_signatures() {
        daemon.metrics().rejects_total.inc();
        warn!(package = %pkg.manifest.package_name, err = %e, "container rejected");
        return Err(e.into());
    }

    let package_id =
        if pkg.package_id.is_empty() { pkg.compute_package_id()? } else { pkg.package_id.clone() };
    if daemon.packages().package_exists(&package_id) {
        return Err(ApiError::Conflict(format!("duplicate package {package_id}")));
    }

    let file_hash = crypto::sha256_hex(&bytes);
    let file_name = file_name.unwrap_or_else(|| {
        format!("{}-{}.yaml", pkg.manifest.package_name, pkg.manifest.version)
    });
    let file_path = daemon.packages().store_package_file(&file_name, &bytes)?;

    let creator_fingerprint = pkg.manifest.creator_pub_key.fingerprint();
    let maintainer_fingerprint = pkg.manifest.maintainer_pub_key.fingerprint();
    let info = PackageInfo {
        package_id: package_id.clone(),
        name: pkg.manifest.package_name.clone(),
        version: pkg.manifest.version.clone(),
        description: pkg.manifest.description.clone(),
        file_path: file_path.clone(),
        file_hash: file_hash.clone(),
        file_size: bytes.len() as u64,
        created_at: pkg.manifest.created_at,
        creator_fingerprint: creator_fingerprint.clone(),
        manifest_signature: pkg.manifest_signature.to_hex(),
        maintainer_fingerprint: maintainer_fingerprint.clone(),
        maintainer_manifest_signature: pkg.maintainer_manifest_signature.to_hex(),
        announced_to_dht: false,
        last_announced: None,
    };

    if let Err(e) = daemon.packages().add_package(info) {
        if let Err(cleanup) = daemon.packages().delete_stored_file(&file_path) {
            warn!(path = %file_path.display(), err = %cleanup, "orphan file after failed ingest");
        }
        return Err(e.into());
    }

    if let Some(announcer) = daemon.announcer() {
        match info_hash_from_package_id(&package_id) {
            Ok(info_hash) => announcer.add_package(
                info_hash,
                &pkg.manifest.package_name,
                &creator_fingerprint,
                &maintainer_fingerprint,
            ),
            Err(_) => warn!(package_id, "ingested package id unusable as infohash"),
        }
    }

    daemon.statistics().incr_packages_seeded();
    daemon.statistics().add_downloaded(bytes.len() as u64);
    daemon.state().set_active_packages(daemon.packages().len() as u64);
    daemon.metrics().ingests_total.inc();
    info!(package_id, package = %pkg.manifest.package_name, "package ingested");

    Ok((
        StatusCode::CREATED,
        Json(json!({
            "status": "success",
            "package_id": package_id,
            "creator_fingerprint": creator_fingerprint,
            "maintainer_fingerprint": maintainer_fingerprint,
            "file_hash": file_hash,
            "verified": true,
        })),
    )
        .into_response())
}

async fn list_packages(State(daemon): State<AppState>) -> impl IntoResponse {
    let packages = daemon.packages().list_packages();
    Json(json!({ "count": packages.len(), "packages": packages }))
}

#[derive(Deserialize)]
struct RemoveParams {
    package_id: String,
}

async fn remove_package_query(
    State(daemon): State<AppState>,
    Query(params): Query<RemoveParams>,
) -> Result<Response, ApiError> {
    remove_package(daemon, params.package_id).await
}

async fn remove_package_json(
    State(daemon): State<AppState>,
    Json(params): Json<RemoveParams>,
) -> Result<Response, ApiError> {
    remove_package(daemon, params.package_id).await
}

async fn remove_package(daemon: AppState, package_id: String) -> Result<Response, ApiError> {
    if let Some(announcer) = daemon.announcer() {
        if let Ok(info_hash) = info_hash_from_package_id(&package_id) {
            announcer.remove_package(&info_hash);
        }
    }

    daemon.packages().remove_package(&package_id)?;
    daemon.state().set_active_packages(daemon.packages().len() as u64);
    daemon.metrics().removals_total.inc();
    info!(package_id, "package removed");

    Ok(Json(json!({ "status": "success", "package_id": package_id })).into_response())
}

#[derive(Deserialize)]
struct RegisterBody {
    public_key: String,
    name: String,
    #[serde(default)]
    email: Option<String>,
}

async fn register_maintainer(
    State(daemon): State<AppState>,
    Json(body): Json<RegisterBody>,
) -> Result<Response, ApiError> {
    let info = daemon.maintainers().register(&body.public_key, &body.name, body.email)?;
    info!(fingerprint = %info.fingerprint, name = %info.name, "maintainer registered");
    Ok((StatusCode::CREATED, Json(json!({ "maintainer": info }))).into_response())
}

async fn list_maintainers(State(daemon): State<AppState>) -> impl IntoResponse {
    let maintainers = daemon.maintainers().list();
    Json(json!({ "count": maintainers.len(), "maintainers": maintainers }))
}

async fn get_maintainer(
    State(daemon): State<AppState>,
    Path(fingerprint): Path<String>,
) -> Result<Response, ApiError> {
    let info = daemon.maintainers().get(&fingerprint)?;
    Ok(Json(json!({ "maintainer": info })).into_response())
}

async fn activate_maintainer(
    State(daemon): State<AppState>,
    Path(fingerprint): Path<String>,
) -> Result<Response, ApiError> {
    daemon.maintainers().activate(&fingerprint)?;
    Ok(Json(json!({ "status": "success", "fingerprint": fingerprint })).into_response())
}

async fn deactivate_maintainer(
    State(daemon): State<AppState>,
    Path(fingerprint): Path<String>,
) -> Result<Response, ApiError> {
    daemon.maintainers().deactivate(&fingerprint)?;
    Ok(Json(json!({ "status": "success", "fingerprint": fingerprint })).into_response())
}

async fn list_pending(State(daemon): State<AppState>) -> impl IntoResponse {
    let pending = daemon.maintainers().list_pending();

    // Packages still waiting for any co-signature also count as pending.
    let unsigned: Vec<PackageInfo> = daemon
        .packages()
        .list_packages()
        .into_iter()
        .filter(|p| p.maintainer_manifest_signature.is_empty())
        .collect();

    Json(json!({
        "count": pending.len() + unsigned.len(),
        "pending": pending,
        "unsigned_packages": unsigned,
    }))
}

#[derive(Deserialize)]
struct SignBody {
    maintainer_fingerprint: String,
    signature: String,
}

async fn sign_package(
    State(daemon): State<AppState>,
    Path(package_id): Path<String>,
    Json(body): Json<SignBody>,
) -> Result<Response, ApiError> {
    let maintainer = daemon.maintainers().get(&body.maintainer_fingerprint)?;
    if !maintainer.active {
        return Err(MaintainerError::MaintainerInactive(maintainer.fingerprint).into());
    }

    let info = daemon
        .packages()
        .get_package(&package_id)
        .ok_or_else(|| ApiError::NotFound(format!("package not found: {package_id}")))?;

    let raw = std::fs::read(&info.file_path)
        .map_err(|e| ApiError::Internal(format!("cannot read stored container: {e}")))?;
    let pkg = parse_package(&raw, false)
        .map_err(|e| ApiError::Internal(format!("stored container unreadable: {e}")))?;
    let manifest_bytes = pkg
        .manifest
        .canonical_bytes()
        .map_err(|e| ApiError::Internal(e.to_string()))?;

    let sig_bytes = hex::decode(body.signature.trim())
        .map_err(|_| ApiError::BadRequest("signature is not hex".to_string()))?;
    let key = PublicKey::from_hex(&maintainer.public_key)
        .map_err(|_| ApiError::Internal("stored maintainer key undecodable".to_string()))?;
    crypto::verify_raw(key.key_bytes(), &manifest_bytes, &sig_bytes)?;

    daemon.packages().update_maintainer_signature(
        &package_id,
        &maintainer.fingerprint,
        &hex::encode(&sig_bytes),
    )?;
    daemon.maintainers().increment_sign_count(&maintainer.fingerprint)?;
    if let Err(e) = daemon.maintainers().remove_pending(&package_id) {
        // No pending entry is normal for direct co-signing.
        if !matches!(e, MaintainerError::PendingNotFound(_)) {
            warn!(package_id, err = %e, "pending cleanup after co-sign failed");
        }
    }
    daemon.metrics().cosigns_total.inc();
    info!(package_id, maintainer = %maintainer.fingerprint, "package co-signed");

    Ok(Json(json!({
        "status": "success",
        "package_id": package_id,
        "maintainer_fingerprint": maintainer.fingerprint,
    }))
    .into_response())
}

async fn dht_stats(State(daemon): State<AppState>) -> Result<Response, ApiError> {
    let dht = daemon.dht().ok_or(ApiError::DhtDisabled)?;
    Ok(Json(dht.stats()).into_response())
}

async fn dht_announcements(State(daemon): State<AppState>) -> Result<Response, ApiError> {
    let announcer = daemon.announcer().ok_or(ApiError::DhtDisabled)?;
    let announcements = announcer.get_packages();
    Ok(Json(json!({ "count": announcements.len(), "announcements": announcements }))
        .into_response())
}

async fn dht_peers(State(daemon): State<AppState>) -> Result<Response, ApiError> {
    if daemon.dht().is_none() {
        return Err(ApiError::DhtDisabled);
    }
    let peers = daemon.peer_manager().get_all_peers();
    let stats = daemon.peer_manager().get_stats();
    Ok(Json(json!({ "count": peers.len(), "peers": peers, "stats": stats })).into_response())
}

#[derive(Deserialize)]
struct DiscoveryParams {
    #[serde(default)]
    info_hash: Option<String>,
}

async fn dht_discovery(
    State(daemon): State<AppState>,
    Query(params): Query<DiscoveryParams>,
) -> Result<Response, ApiError> {
    let discovery = daemon.discovery().ok_or(ApiError::DhtDisabled)?;

    // An explicit infohash triggers a lookup (cache first, then the DHT).
    if let Some(hex_hash) = params.info_hash.as_deref() {
        let raw = hex::decode(hex_hash)
            .map_err(|_| ApiError::BadRequest("info_hash is not hex".to_string()))?;
        let info_hash: [u8; 20] = raw
            .try_into()
            .map_err(|_| ApiError::BadRequest("info_hash must be 20 bytes".to_string()))?;
        let peers = discovery.find_peers(info_hash, DISCOVERY_LOOKUP_TIMEOUT).await?;
        return Ok(Json(json!({
            "info_hash": hex_hash,
            "count": peers.len(),
            "peers": peers,
        }))
        .into_response());
    }

    let results = discovery.get_all_results();
    Ok(Json(json!({
        "count": results.len(),
        "results": results,
        "stats": discovery.stats(),
    }))
    .into_response())
}
