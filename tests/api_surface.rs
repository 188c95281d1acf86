#![forbid(unsafe_code)]

//! End-to-end handler behavior through the HTTP router: ingest, listing,
//! removal, maintainer management, co-signing and DHT introspection.

mod common;

use axum::body::Body;
use axum::http::{header, Request, StatusCode};
use axum::Router;
use common::{keypair, signed_container_bytes, signed_package, wait_for, ScriptedDht};
use http_body_util::BodyExt;
use libreseed::core::config::DaemonConfig;
use libreseed::core::crypto::sign;
use libreseed::daemon::{api, Daemon};
use libreseed::networking::dht::DhtService;
use ring::signature::KeyPair;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tower::util::ServiceExt;

const BOUNDARY: &str = "libreseed-test-boundary";

struct TestDaemon {
    daemon: Arc<Daemon>,
    dht: Arc<ScriptedDht>,
    app: Router,
    _dir: tempfile::TempDir,
}

async fn spawn_daemon(enable_dht: bool) -> TestDaemon {
    let dir = tempfile::tempdir().unwrap();
    let mut cfg = DaemonConfig::default();
    cfg.storage_dir = dir.path().to_path_buf();
    cfg.listen_addr = "127.0.0.1:0".to_string();
    cfg.enable_dht = enable_dht;
    if !enable_dht {
        cfg.dht_bootstrap_nodes.clear();
    }

    let dht = Arc::new(ScriptedDht::new());
    let backend = enable_dht.then(|| dht.clone() as Arc<dyn DhtService>);
    let daemon = Arc::new(Daemon::with_dht_backend(cfg, backend).unwrap());
    daemon.start().await.unwrap();

    let app = api::router(Arc::clone(&daemon));
    TestDaemon { daemon, dht, app, _dir: dir }
}

fn multipart_body(file_name: &str, contents: &[u8]) -> Vec<u8> {
    let mut body = Vec::new();
    body.extend_from_slice(format!("--{BOUNDARY}\r\n").as_bytes());
    body.extend_from_slice(
        format!(
            "Content-Disposition: form-data; name=\"file\"; filename=\"{file_name}\"\r\n\
             Content-Type: application/octet-stream\r\n\r\n"
        )
        .as_bytes(),
    );
    body.extend_from_slice(contents);
    body.extend_from_slice(format!("\r\n--{BOUNDARY}--\r\n").as_bytes());
    body
}

async fn post_container(app: &Router, file_name: &str, contents: &[u8]) -> (StatusCode, Value) {
    let request = Request::builder()
        .method("POST")
        .uri("/packages/add")
        .header(header::CONTENT_TYPE, format!("multipart/form-data; boundary={BOUNDARY}"))
        .body(Body::from(multipart_body(file_name, contents)))
        .unwrap();
    send(app, request).await
}

async fn send(app: &Router, request: Request<Body>) -> (StatusCode, Value) {
    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    let value = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap_or(Value::Null)
    };
    (status, value)
}

async fn get(app: &Router, uri: &str) -> (StatusCode, Value) {
    send(app, Request::builder().uri(uri).body(Body::empty()).unwrap()).await
}

async fn post_json(app: &Router, uri: &str, body: Value) -> (StatusCode, Value) {
    let request = Request::builder()
        .method("POST")
        .uri(uri)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(body.to_string()))
        .unwrap();
    send(app, request).await
}

#[tokio::test]
async fn happy_path_ingest_then_list() {
    let t = spawn_daemon(true).await;
    let (container, pkg) = signed_container_bytes("test-pkg", "1.0.0");

    let (status, body) = post_container(&t.app, "test-pkg-1.0.0.yaml", &container).await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(body["status"], "success");
    assert_eq!(body["verified"], true);
    assert_eq!(body["package_id"], pkg.package_id.as_str());
    assert_eq!(
        body["creator_fingerprint"],
        pkg.manifest.creator_pub_key.fingerprint().as_str()
    );
    assert_eq!(
        body["maintainer_fingerprint"],
        pkg.manifest.maintainer_pub_key.fingerprint().as_str()
    );

    let (status, body) = get(&t.app, "/packages/list").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["count"], 1);
    assert_eq!(body["packages"][0]["package_id"], pkg.package_id.as_str());

    // The ingested package reaches the announcer.
    let dht = t.dht.clone();
    assert!(wait_for(Duration::from_secs(2), || !dht.announced().is_empty()).await);

    t.daemon.stop().await;
}

#[tokio::test]
async fn forged_maintainer_signature_rejected_without_side_effects() {
    let t = spawn_daemon(true).await;

    let creator = keypair();
    let maintainer = keypair();
    let stranger = keypair();
    let mut pkg = signed_package("test-pkg", "1.0.0", &creator, &maintainer);
    // Re-sign the manifest with a key that is not the declared maintainer.
    let payload = pkg.manifest.canonical_bytes().unwrap();
    pkg.maintainer_manifest_signature = sign(&stranger, &payload).unwrap();
    pkg.seal().unwrap();

    let (status, _) = post_container(&t.app, "forged.yaml", &pkg.to_bytes().unwrap()).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let (_, body) = get(&t.app, "/packages/list").await;
    assert_eq!(body["count"], 0);

    // Nothing was persisted under packages/.
    let stored: Vec<_> = std::fs::read_dir(t.daemon.packages().packages_dir())
        .map(|rd| rd.filter_map(Result::ok).collect())
        .unwrap_or_default();
    assert!(stored.is_empty(), "no file may be written for a rejected container");

    t.daemon.stop().await;
}

#[tokio::test]
async fn duplicate_ingest_is_a_client_error() {
    let t = spawn_daemon(true).await;
    let (container, _) = signed_container_bytes("test-pkg", "1.0.0");

    let (status, _) = post_container(&t.app, "dup.yaml", &container).await;
    assert_eq!(status, StatusCode::CREATED);
    let (status, _) = post_container(&t.app, "dup.yaml", &container).await;
    assert_eq!(status, StatusCode::CONFLICT);

    let (_, body) = get(&t.app, "/packages/list").await;
    assert_eq!(body["count"], 1);

    t.daemon.stop().await;
}

#[tokio::test]
async fn malformed_container_is_bad_request() {
    let t = spawn_daemon(false).await;
    let (status, _) = post_container(&t.app, "junk.yaml", b"]this is not a package[").await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    t.daemon.stop().await;
}

#[tokio::test]
async fn remove_deletes_entry_and_file() {
    let t = spawn_daemon(true).await;
    let (container, pkg) = signed_container_bytes("removable", "1.0.0");

    post_container(&t.app, "removable-1.0.0.yaml", &container).await;
    let file_path = t.daemon.packages().get_package(&pkg.package_id).unwrap().file_path;
    assert!(file_path.exists());

    let request = Request::builder()
        .method("DELETE")
        .uri(format!("/packages/remove?package_id={}", pkg.package_id))
        .body(Body::empty())
        .unwrap();
    let (status, body) = send(&t.app, request).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "success");

    assert!(!file_path.exists());
    let (_, body) = get(&t.app, "/packages/list").await;
    assert_eq!(body["count"], 0);

    // Removing again is a 404.
    let request = Request::builder()
        .method("POST")
        .uri("/packages/remove")
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(format!("{{\"package_id\":\"{}\"}}", pkg.package_id)))
        .unwrap();
    let (status, _) = send(&t.app, request).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    t.daemon.stop().await;
}

#[tokio::test]
async fn dht_disabled_gives_503_but_ingest_works() {
    let t = spawn_daemon(false).await;

    for uri in ["/dht/stats", "/dht/announcements", "/dht/peers", "/dht/discovery"] {
        let (status, _) = get(&t.app, uri).await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE, "{uri}");
    }
    assert!(t.daemon.announcer().is_none());

    let (container, _) = signed_container_bytes("offline-pkg", "1.0.0");
    let (status, _) = post_container(&t.app, "offline.yaml", &container).await;
    assert_eq!(status, StatusCode::CREATED);

    t.daemon.stop().await;
}

#[tokio::test]
async fn maintainer_registration_and_lookup() {
    let t = spawn_daemon(false).await;
    let kp = keypair();
    let key_hex = hex::encode(kp.public_key().as_ref());

    let (status, body) = post_json(
        &t.app,
        "/maintainers",
        serde_json::json!({ "public_key": &key_hex, "name": "alice", "email": "alice@example.org" }),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    let fingerprint = body["maintainer"]["fingerprint"].as_str().unwrap().to_string();

    // Duplicate registration conflicts.
    let (status, _) = post_json(
        &t.app,
        "/maintainers",
        serde_json::json!({ "public_key": &key_hex, "name": "alice" }),
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);

    // Bad key is a 400.
    let (status, _) = post_json(
        &t.app,
        "/maintainers",
        serde_json::json!({ "public_key": "zz", "name": "mallory" }),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, body) = get(&t.app, &format!("/maintainers/{fingerprint}")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["maintainer"]["name"], "alice");

    let (status, _) = get(&t.app, "/maintainers/0000000000000000").await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (_, body) = get(&t.app, "/maintainers").await;
    assert_eq!(body["count"], 1);

    t.daemon.stop().await;
}

#[tokio::test]
async fn cosign_flow_updates_package_and_counters() {
    let t = spawn_daemon(false).await;

    // Ingest a package, then register a co-signer.
    let (container, pkg) = signed_container_bytes("cosigned", "1.0.0");
    post_container(&t.app, "cosigned-1.0.0.yaml", &container).await;

    let cosigner = keypair();
    let key_hex = hex::encode(cosigner.public_key().as_ref());
    let (_, body) = post_json(
        &t.app,
        "/maintainers",
        serde_json::json!({ "public_key": key_hex, "name": "bob" }),
    )
    .await;
    let fingerprint = body["maintainer"]["fingerprint"].as_str().unwrap().to_string();

    // Bob signs the manifest bytes of the stored container.
    let payload = pkg.manifest.canonical_bytes().unwrap();
    let signature = sign(&cosigner, &payload).unwrap();

    let (status, body) = post_json(
        &t.app,
        &format!("/packages/sign/{}", pkg.package_id),
        serde_json::json!({
            "maintainer_fingerprint": fingerprint,
            "signature": signature.to_hex(),
        }),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "success");

    let stored = t.daemon.packages().get_package(&pkg.package_id).unwrap();
    assert_eq!(stored.maintainer_fingerprint, fingerprint);
    assert_eq!(stored.maintainer_manifest_signature, signature.to_hex());
    assert_eq!(t.daemon.maintainers().get(&fingerprint).unwrap().packages_signed, 1);

    // A garbage signature is a 401.
    let (status, _) = post_json(
        &t.app,
        &format!("/packages/sign/{}", pkg.package_id),
        serde_json::json!({
            "maintainer_fingerprint": fingerprint,
            "signature": hex::encode([0u8; 64]),
        }),
    )
    .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    // A deactivated maintainer may not sign.
    post_json(&t.app, &format!("/maintainers/deactivate/{fingerprint}"), Value::Null).await;
    let (status, _) = post_json(
        &t.app,
        &format!("/packages/sign/{}", pkg.package_id),
        serde_json::json!({
            "maintainer_fingerprint": fingerprint,
            "signature": signature.to_hex(),
        }),
    )
    .await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    // Unknown maintainer is a 404.
    let (status, _) = post_json(
        &t.app,
        &format!("/packages/sign/{}", pkg.package_id),
        serde_json::json!({
            "maintainer_fingerprint": "0000000000000000",
            "signature": signature.to_hex(),
        }),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    t.daemon.stop().await;
}

#[tokio::test]
async fn health_status_stats_and_metrics_respond() {
    let t = spawn_daemon(true).await;

    let (status, body) = get(&t.app, "/health").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");

    let (status, body) = get(&t.app, "/status").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "running");

    let (status, body) = get(&t.app, "/stats").await;
    assert_eq!(status, StatusCode::OK);
    assert!(body["total_packages_seeded"].is_u64());

    let response = t
        .app
        .clone()
        .oneshot(Request::builder().uri("/metrics").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let text =
        String::from_utf8(response.into_body().collect().await.unwrap().to_bytes().to_vec())
            .unwrap();
    assert!(text.contains("libreseed_packages"));

    let (status, body) = get(&t.app, "/dht/stats").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["nodes"], 5);

    t.daemon.stop().await;
}

#[tokio::test]
async fn discovery_endpoint_runs_lookups_and_reports_cache() {
    let t = spawn_daemon(true).await;
    let info_hash = [9u8; 20];
    t.dht.script_peers(info_hash, vec!["10.9.9.9:6881".parse().unwrap()]);

    let uri = format!("/dht/discovery?info_hash={}", hex::encode(info_hash));
    let (status, body) = get(&t.app, &uri).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["count"], 1);
    assert_eq!(body["peers"][0]["port"], 6881);

    // The result is now cached and visible in the snapshot view.
    let (status, body) = get(&t.app, "/dht/discovery").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["count"], 1);
    assert_eq!(body["stats"]["misses"], 1);

    // A malformed infohash is a 400.
    let (status, _) = get(&t.app, "/dht/discovery?info_hash=nothex").await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    t.daemon.stop().await;
}

#[tokio::test]
async fn pending_listing_includes_unsigned_packages_and_registry_entries() {
    let t = spawn_daemon(false).await;

    let (_, pkg) = signed_container_bytes("with-pending", "1.0.0");
    t.daemon
        .maintainers()
        .add_pending(
            &pkg.package_id,
            "with-pending",
            "1.0.0",
            &pkg.manifest.creator_pub_key.fingerprint(),
            &pkg.manifest.hash().unwrap(),
            Duration::from_secs(3600),
        )
        .unwrap();

    let (status, body) = get(&t.app, "/signatures/pending").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["pending"].as_array().unwrap().len(), 1);
    assert_eq!(body["pending"][0]["package_id"], pkg.package_id.as_str());

    t.daemon.stop().await;
}
