//! End-to-end sync against an in-process archive peer.

use axum::extract::State;
use axum::http::{header, StatusCode};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use field_agent::config::Config;
use field_agent::fs::metadata::{set_mtime, FileStamp};
use field_agent::manifest::{build_manifest, load_cache};
use field_agent::protocol::{
    BatchRequest, HealthResponse, BATCH_CONTENT_TYPE, BATCH_ROUTE, HEALTH_ROUTE, MANIFEST_ROUTE,
};
use field_agent::resilience::{
    Backoff, ConnectionPool, ConnectivityProbe, OperationQueue, ResilienceLayer,
    ResilienceSettings,
};
use field_agent::supervisor::{Disposition, RetryPolicy, SupervisedAction, Supervisor};
use field_agent::transfer::archive::pack_batch;
use field_agent::transfer::{SyncEngine, SyncSettings};
use field_agent::updates::ProductKind;
use std::collections::HashSet;
use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

#[derive(Clone)]
struct Peer {
    root: Arc<PathBuf>,
    omit: Arc<Mutex<HashSet<String>>>,
    batches: Arc<AtomicUsize>,
}

async fn manifest(State(peer): State<Peer>) -> impl IntoResponse {
    let root = Arc::clone(&peer.root);
    match tokio::task::spawn_blocking(move || build_manifest(&root, &[])).await {
        Ok(Ok(manifest)) => Json(manifest).into_response(),
        _ => StatusCode::INTERNAL_SERVER_ERROR.into_response(),
    }
}

async fn batch(State(peer): State<Peer>, Json(request): Json<BatchRequest>) -> impl IntoResponse {
    peer.batches.fetch_add(1, Ordering::SeqCst);
    let omit = peer.omit.lock().unwrap().clone();
    let files: Vec<String> = request
        .files
        .into_iter()
        .filter(|f| !omit.contains(f))
        .collect();

    let root = Arc::clone(&peer.root);
    let body = tokio::task::spawn_blocking(move || {
        let mut buf = Vec::new();
        pack_batch(&root, &files, &mut buf).map(|_| buf)
    })
    .await
    .unwrap()
    .unwrap();

    ([(header::CONTENT_TYPE, BATCH_CONTENT_TYPE)], body)
}

async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: "test".to_string(),
        files: None,
    })
}

async fn spawn_peer(root: &Path) -> (SocketAddr, Peer) {
    let peer = Peer {
        root: Arc::new(root.to_path_buf()),
        omit: Arc::new(Mutex::new(HashSet::new())),
        batches: Arc::new(AtomicUsize::new(0)),
    };

    let app = Router::new()
        .route(MANIFEST_ROUTE, get(manifest))
        .route(BATCH_ROUTE, post(batch))
        .route(HEALTH_ROUTE, get(health))
        .with_state(peer.clone());

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    (addr, peer)
}

fn resilience_at(base_url: &str, addr: SocketAddr) -> Arc<ResilienceLayer> {
    Arc::new(ResilienceLayer::new(
        ConnectionPool::new(base_url, Duration::from_secs(5), 3).unwrap(),
        // Connectivity checks target the peer itself, off the internet
        ConnectivityProbe::new(addr.to_string(), Duration::from_secs(1)),
        OperationQueue::new(16),
        ResilienceSettings::default(),
    ))
}

fn resilience(addr: SocketAddr) -> Arc<ResilienceLayer> {
    resilience_at(&format!("http://{}", addr), addr)
}

fn settings(mirror: &Path) -> SyncSettings {
    SyncSettings {
        root: mirror.to_path_buf(),
        extensions: vec!["png".to_string(), "jpg".to_string()],
        // Small ceiling so the test exercises several batches
        batch_ceiling: 16,
        max_concurrent_batches: 2,
        cache_file_name: ".sync_manifest.json".to_string(),
    }
}

fn engine(mirror: &Path, addr: SocketAddr) -> SyncEngine {
    SyncEngine::new(settings(mirror), resilience(addr))
}

fn write(root: &Path, path: &str, content: &str) {
    let full = root.join(path);
    fs::create_dir_all(full.parent().unwrap()).unwrap();
    fs::write(full, content).unwrap();
}

fn read(root: &Path, path: &str) -> String {
    fs::read_to_string(root.join(path)).unwrap()
}

#[tokio::test]
async fn test_sync_mirrors_then_is_idempotent() {
    let archive = TempDir::new().unwrap();
    let mirror = TempDir::new().unwrap();

    write(archive.path(), "charts/a.png", "alpha chart");
    write(archive.path(), "charts/sub/b.jpg", "bravo chart, new");
    write(archive.path(), "readme.txt", "not mirrored");

    write(mirror.path(), "charts/sub/b.jpg", "bravo chart, old");
    write(mirror.path(), "old/stale.png", "removed upstream");

    let (addr, peer) = spawn_peer(archive.path()).await;
    let engine = engine(mirror.path(), addr);
    let cancel = CancellationToken::new();

    let first = engine.sync(&cancel).await.unwrap();
    assert!(first.success);
    assert_eq!(first.files_transferred, 2);
    assert_eq!(first.files_deleted, 1);
    assert_eq!(first.files_failed, 0);
    assert!(first.wire_bytes > 0);

    assert_eq!(read(mirror.path(), "charts/a.png"), "alpha chart");
    assert_eq!(read(mirror.path(), "charts/sub/b.jpg"), "bravo chart, new");
    assert!(!mirror.path().join("old/stale.png").exists());
    assert!(!mirror.path().join("readme.txt").exists());
    assert!(mirror.path().join(".sync_manifest.json").exists());
    assert!(!mirror.path().join(".sync-tmp").exists());

    let batches_after_first = peer.batches.load(Ordering::SeqCst);

    let second = engine.sync(&cancel).await.unwrap();
    assert!(second.success);
    assert_eq!(second.files_transferred, 0);
    assert_eq!(second.files_deleted, 0);
    assert_eq!(peer.batches.load(Ordering::SeqCst), batches_after_first);
}

#[tokio::test]
async fn test_missing_entry_is_partial_then_recovered() {
    let archive = TempDir::new().unwrap();
    let mirror = TempDir::new().unwrap();

    write(archive.path(), "a.png", "first");
    write(archive.path(), "b.png", "second");

    let (addr, peer) = spawn_peer(archive.path()).await;
    peer.omit.lock().unwrap().insert("a.png".to_string());
    let engine = engine(mirror.path(), addr);
    let cancel = CancellationToken::new();

    let partial = engine.sync(&cancel).await.unwrap();
    assert!(!partial.success);
    assert_eq!(partial.files_transferred, 1);
    assert_eq!(partial.failed_paths, vec!["a.png".to_string()]);
    assert!(!mirror.path().join("a.png").exists());
    assert_eq!(read(mirror.path(), "b.png"), "second");

    // A partial result is retried by the supervisor
    let err = engine.run(&cancel).await.unwrap_err();
    assert_eq!(err.disposition, Disposition::Retry);

    peer.omit.lock().unwrap().clear();
    let recovered = engine.sync(&cancel).await.unwrap();
    assert!(recovered.success);
    assert_eq!(recovered.files_transferred, 1);
    assert_eq!(read(mirror.path(), "a.png"), "first");
}

#[tokio::test]
async fn test_unreachable_peer_is_retryable() {
    let mirror = TempDir::new().unwrap();

    // Reserve a port, then close it
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let engine = engine(mirror.path(), addr);
    let cancel = CancellationToken::new();

    assert!(engine.sync(&cancel).await.is_err());
    let err = engine.run(&cancel).await.unwrap_err();
    assert_eq!(err.disposition, Disposition::Retry);
}

#[tokio::test]
async fn test_supervised_sync_runs_on_schedule() {
    let archive = TempDir::new().unwrap();
    let mirror = TempDir::new().unwrap();
    write(archive.path(), "charts/c.png", "charlie");

    let (addr, _peer) = spawn_peer(archive.path()).await;
    let policy = RetryPolicy {
        interval: Duration::from_secs(3600),
        initial_delay: Duration::ZERO,
        max_attempts: 3,
        backoff: Backoff::new(Duration::from_secs(1), Duration::from_secs(5)),
    };
    let supervisor = Supervisor::new(engine(mirror.path(), addr), policy);

    supervisor.start().await;
    let mut succeeded = false;
    for _ in 0..200 {
        if supervisor.stats().await.successes >= 1 {
            succeeded = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    supervisor.stop().await;

    assert!(succeeded, "sync did not complete under supervision");
    assert_eq!(read(mirror.path(), "charts/c.png"), "charlie");
}

#[tokio::test]
async fn test_dropped_connection_is_retryable_whatever_the_url() {
    let mirror = TempDir::new().unwrap();

    // A peer that accepts and hangs up straight away
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        while let Ok((socket, _)) = listener.accept().await {
            drop(socket);
        }
    });

    for base in ["mirror", "dns-mirror", "tls-mirror"] {
        let resilience = resilience_at(&format!("http://{}/{}", addr, base), addr);
        let engine = SyncEngine::new(settings(mirror.path()), resilience);

        let err = engine.run(&CancellationToken::new()).await.unwrap_err();
        assert_eq!(err.disposition, Disposition::Retry, "base path {}: {}", base, err.reason);
    }
}

#[tokio::test]
async fn test_files_already_in_sync_keep_cached_checksums() {
    let archive = TempDir::new().unwrap();
    let mirror = TempDir::new().unwrap();

    write(archive.path(), "charts/a.png", "identical");
    write(mirror.path(), "charts/a.png", "identical");

    // Same content, different mtime on the mirror
    let local = mirror.path().join("charts/a.png");
    let stamp = FileStamp::from_path(&local).unwrap();
    let handle = fs::File::options().write(true).open(&local).unwrap();
    set_mtime(&handle, stamp.mtime - 3600).unwrap();
    drop(handle);

    let (addr, _peer) = spawn_peer(archive.path()).await;
    let engine = engine(mirror.path(), addr);
    let cancel = CancellationToken::new();

    let first = engine.sync(&cancel).await.unwrap();
    assert!(first.success);
    assert_eq!(first.files_transferred, 0);

    let second = engine.sync(&cancel).await.unwrap();
    assert!(second.success);
    assert_eq!(second.files_transferred, 0);

    // The cache entry must match the file on disk, or it is never reused
    let cache = load_cache(&mirror.path().join(".sync_manifest.json")).unwrap();
    let cached = cache.get("charts/a.png").unwrap();
    let on_disk = FileStamp::from_path(&local).unwrap();
    assert_eq!(cached.mtime, on_disk.mtime);
    assert_eq!(cached.size, on_disk.size);
}

#[tokio::test]
async fn test_custom_cache_file_survives_unfiltered_sync() {
    let archive = TempDir::new().unwrap();
    let mirror = TempDir::new().unwrap();
    write(archive.path(), "charts/a.png", "alpha");
    write(archive.path(), "notes.txt", "every file is mirrored");

    let (addr, _peer) = spawn_peer(archive.path()).await;
    let settings = SyncSettings {
        extensions: Vec::new(),
        cache_file_name: ".mirror-cache.json".to_string(),
        ..settings(mirror.path())
    };
    let engine = SyncEngine::new(settings, resilience(addr));
    let cancel = CancellationToken::new();
    let cache_path = mirror.path().join(".mirror-cache.json");

    let first = engine.sync(&cancel).await.unwrap();
    assert!(first.success);
    assert_eq!(first.files_transferred, 2);
    assert!(cache_path.exists());

    let second = engine.sync(&cancel).await.unwrap();
    assert!(second.success);
    assert_eq!(second.files_deleted, 0);
    assert_eq!(second.files_transferred, 0);
    assert!(cache_path.exists());
    assert!(load_cache(&cache_path).unwrap().get(".mirror-cache.json").is_none());
}

#[tokio::test]
async fn test_default_config_reports_product_updates() {
    let archive = TempDir::new().unwrap();
    let mirror = TempDir::new().unwrap();
    write(archive.path(), "charts/a.png", "alpha");
    write(archive.path(), "navdata/nav.db", "cycle 2411");
    write(archive.path(), "software/hxr/HHXRUp.dat", "hxr 8.1");
    write(archive.path(), "notes.txt", "not mirrored");

    let (addr, _peer) = spawn_peer(archive.path()).await;
    let mut config = Config::default();
    config.peer.url = format!("http://{}", addr);
    config.sync.mirror_root = mirror.path().to_path_buf();
    let engine = SyncEngine::new(config.sync_settings(), resilience(addr));
    let cancel = CancellationToken::new();

    let first = engine.sync(&cancel).await.unwrap();
    assert!(first.success);
    assert_eq!(first.files_transferred, 3);
    let kinds: Vec<ProductKind> = first.updates.iter().map(|u| u.kind).collect();
    assert_eq!(kinds, vec![ProductKind::NavDatabase, ProductKind::HxrSoftware]);
    assert_eq!(read(mirror.path(), "navdata/nav.db"), "cycle 2411");
    assert!(!mirror.path().join("notes.txt").exists());

    let second = engine.sync(&cancel).await.unwrap();
    assert_eq!(second.files_transferred, 0);
    assert!(second.updates.is_empty());
}

#[tokio::test]
async fn test_stopped_run_is_not_a_success() {
    let archive = TempDir::new().unwrap();
    let mirror = TempDir::new().unwrap();
    write(archive.path(), "charts/a.png", "alpha");

    let (addr, peer) = spawn_peer(archive.path()).await;
    let engine = engine(mirror.path(), addr);

    let cancel = CancellationToken::new();
    cancel.cancel();

    let err = engine.run(&cancel).await.unwrap_err();
    assert_eq!(err.disposition, Disposition::Retry);
    assert!(err.reason.contains("skipped"), "{}", err.reason);
    assert_eq!(peer.batches.load(Ordering::SeqCst), 0);
    assert!(!mirror.path().join("charts/a.png").exists());
    assert!(!mirror.path().join(".sync_manifest.json").exists());
}
