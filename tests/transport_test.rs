//! Integration tests for the HTTP transport against a mock remote store

use axum::body::Bytes;
use axum::extract::{Path as UrlPath, State};
use axum::http::{header::AUTHORIZATION, HeaderMap, StatusCode};
use axum::routing::{get, put};
use axum::{Json, Router};
use ble_sensor_agent::core::{Aggregator, DistanceModel, Sighting};
use ble_sensor_agent::delivery::{
    CheckpointStore, DeliveryStage, HttpTransport, HttpTransportConfig, Transport, TransportError,
    UploadOutcome,
};
use ble_sensor_agent::scanner::RawSighting;
use ble_sensor_agent::stats::create_shared_stats;
use chrono::Utc;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

const TOKEN: &str = "test-token";

#[derive(Debug, Clone)]
struct StoredFile {
    body: Vec<u8>,
    sensor_id: Option<String>,
}

#[derive(Clone, Default)]
struct MockStore {
    files: Arc<Mutex<HashMap<String, StoredFile>>>,
    reject_duplicates: bool,
}

impl MockStore {
    fn get(&self, path: &str) -> Option<StoredFile> {
        self.files.lock().unwrap().get(path).cloned()
    }

    fn len(&self) -> usize {
        self.files.lock().unwrap().len()
    }
}

async fn store_file(
    State(store): State<MockStore>,
    UrlPath(path): UrlPath<String>,
    headers: HeaderMap,
    body: Bytes,
) -> StatusCode {
    let authorized = headers
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .map(|v| v == format!("Bearer {TOKEN}"))
        .unwrap_or(false);
    if !authorized {
        return StatusCode::UNAUTHORIZED;
    }

    let sensor_id = headers
        .get("x-sensor-id")
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);

    let mut files = store.files.lock().unwrap();
    if store.reject_duplicates && files.contains_key(&path) {
        return StatusCode::CONFLICT;
    }
    files.insert(
        path,
        StoredFile {
            body: body.to_vec(),
            sensor_id,
        },
    );
    StatusCode::CREATED
}

/// Start a mock store on its own runtime thread and return its base URL.
fn spawn_store(reject_duplicates: bool) -> (String, MockStore) {
    let store = MockStore {
        reject_duplicates,
        ..MockStore::default()
    };

    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    listener.set_nonblocking(true).unwrap();
    let addr = listener.local_addr().unwrap();

    let state = store.clone();
    thread::spawn(move || {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        runtime.block_on(async move {
            let listener = tokio::net::TcpListener::from_std(listener).unwrap();
            let app = Router::new()
                .route("/health", get(|| async { Json(serde_json::json!({ "status": "ok" })) }))
                .route("/*path", put(store_file))
                .with_state(state);
            axum::serve(listener, app).await.unwrap();
        });
    });

    (format!("http://{addr}"), store)
}

fn transport(url: &str, token: &str) -> HttpTransport {
    let config = HttpTransportConfig::new(url, Some(token.to_string()), "sensorX")
        .with_timeout(Duration::from_secs(5));
    HttpTransport::new(config).expect("Failed to create transport")
}

fn local_file(dir: &tempfile::TempDir, contents: &str) -> std::path::PathBuf {
    let path = dir.path().join("scan_data_20240122_100000_000.json");
    std::fs::write(&path, contents).unwrap();
    path
}

#[test]
fn test_upload_stores_file() {
    let (url, store) = spawn_store(false);
    let dir = tempfile::tempdir().unwrap();
    let path = local_file(&dir, "[]");

    let outcome = transport(&url, TOKEN)
        .upload(&path, "lab/scan_data_20240122_100000_000.json")
        .expect("upload failed");

    assert_eq!(outcome, UploadOutcome::Stored);
    let stored = store.get("lab/scan_data_20240122_100000_000.json").unwrap();
    assert_eq!(stored.body, b"[]");
    assert_eq!(stored.sensor_id.as_deref(), Some("sensorX"));
}

#[test]
fn test_wrong_token_rejected() {
    let (url, store) = spawn_store(false);
    let dir = tempfile::tempdir().unwrap();
    let path = local_file(&dir, "[]");

    let result = transport(&url, "wrong-token").upload(&path, "scan_data_1.json");

    assert!(matches!(
        result,
        Err(TransportError::Remote { status: 401, .. })
    ));
    assert_eq!(store.len(), 0);
}

#[test]
fn test_duplicate_upload_reported_as_present() {
    let (url, store) = spawn_store(true);
    let dir = tempfile::tempdir().unwrap();
    let path = local_file(&dir, "[1]");
    let transport = transport(&url, TOKEN);

    assert_eq!(
        transport.upload(&path, "scan_data_1.json").unwrap(),
        UploadOutcome::Stored
    );
    assert_eq!(
        transport.upload(&path, "scan_data_1.json").unwrap(),
        UploadOutcome::AlreadyPresent
    );
    assert_eq!(store.len(), 1);
}

#[test]
fn test_health_check() {
    let (url, _store) = spawn_store(false);
    assert!(transport(&url, TOKEN).health_check().is_ok());

    // Nothing listening once the socket is closed
    let closed = {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap()
    };
    let result = transport(&format!("http://{closed}"), TOKEN).health_check();
    assert!(matches!(result, Err(TransportError::Network(_))));
}

#[test]
fn test_delivery_stage_over_http() {
    let (url, store) = spawn_store(false);
    let dir = tempfile::tempdir().unwrap();
    let checkpoints = CheckpointStore::open(dir.path()).unwrap();
    let stage = DeliveryStage::new(
        checkpoints.clone(),
        Box::new(transport(&url, TOKEN)),
        "lab",
        create_shared_stats(),
    );

    let model = DistanceModel::default();
    let mut aggregator = Aggregator::new(model);
    for rssi in [-55, -60, -65] {
        aggregator.ingest(Sighting::from_raw(
            RawSighting::new("AA:BB:CC:DD:EE:FF", Some("Tag".to_string()), rssi),
            &model,
        ));
    }
    let batch = aggregator.flush(Utc::now()).unwrap();

    let ack = stage.deliver(&batch).expect("delivery failed");

    assert_eq!(ack.devices, 1);
    assert_eq!(ack.remote_path, format!("lab/{}", batch.file_name()));
    assert!(checkpoints.pending().unwrap().is_empty());

    let stored = store.get(&ack.remote_path).unwrap();
    let summaries: Vec<serde_json::Value> = serde_json::from_slice(&stored.body).unwrap();
    assert_eq!(summaries.len(), 1);
    assert_eq!(summaries[0]["device_id"], "AA:BB:CC:DD:EE:FF");
    assert_eq!(summaries[0]["mean_signal_strength"], -60.0);
}
