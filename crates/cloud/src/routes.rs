//! HTTP surface of the cloud ingest API.

use std::path::PathBuf;
use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{delete, get, post};
use axum::{middleware, Router};
use serde::Deserialize;
use serde_json::{json, Map, Value};
use tokio::sync::Mutex;
use tracing::{error, info};

use crate::auth;
use crate::provisioning::{ProvisioningRegistry, GATEWAY_PROVISIONING_SECRET};
use crate::store::{CloudReading, CloudStore, Heartbeat};

/// Fixed bearer token shared by the gateway fleet (rotation out of scope).
pub const API_KEY: &str = "secretAPIkey";

// ---------------------------------------------------------------------------
// Composite app state shared across all handlers
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<CloudStore>,
    pub registry: Arc<Mutex<ProvisioningRegistry>>,
}

impl AppState {
    pub fn new(data_dir: PathBuf) -> Self {
        Self {
            store: Arc::new(CloudStore::new(data_dir)),
            registry: Arc::new(Mutex::new(ProvisioningRegistry::new())),
        }
    }
}

// ---------------------------------------------------------------------------
// Routes
// ---------------------------------------------------------------------------

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/ingest", post(ingest))
        .route("/devices/register", post(register_device))
        .route("/data", get(all_data))
        .route("/data/by-type/{sensor_type}", get(data_by_type))
        .route("/data/by-device/{device_id}", get(data_by_device))
        .route("/config/{gateway_id}", get(get_config).post(update_config))
        .route("/heartbeat", post(heartbeat))
        .route("/gateway-status", get(gateway_status))
        .route("/gateway/{gateway_id}", delete(remove_gateway))
        .route("/ml/model", get(ml_model))
        .route("/export", get(export))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            auth::gateway_auth,
        ))
        .with_state(state)
}

fn authorized(headers: &HeaderMap) -> bool {
    headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v == format!("Bearer {API_KEY}"))
}

fn unauthorized() -> Response {
    (
        StatusCode::UNAUTHORIZED,
        Json(json!({ "detail": "Unauthorized" })),
    )
        .into_response()
}

// ---------------------------------------------------------------------------
// Ingest
// ---------------------------------------------------------------------------

#[derive(Deserialize)]
struct IngestPayload {
    #[serde(rename = "gatewayId")]
    gateway_id: String,
    data: Vec<CloudReading>,
}

async fn ingest(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(payload): Json<IngestPayload>,
) -> Response {
    if !authorized(&headers) {
        return unauthorized();
    }

    let summary = state.store.ingest(payload.data).await;
    let total = state.store.record_count().await;
    info!(
        gateway = %payload.gateway_id,
        received = summary.received,
        duplicates = summary.duplicates,
        total = total,
        "ingested batch"
    );

    // Auto-export is driven by ingest traffic rather than a timer: bursts
    // are what fill the training rings.
    if let Some(result) = state.store.maybe_auto_export().await {
        match result {
            Ok(count) => info!(count, "training snapshot exported"),
            Err(e) => error!("training snapshot export failed: {e:#}"),
        }
    }

    Json(json!({
        "status": "ok",
        "received": summary.received,
        "duplicates": summary.duplicates,
    }))
    .into_response()
}

// ---------------------------------------------------------------------------
// Device provisioning
// ---------------------------------------------------------------------------

#[derive(Deserialize)]
struct RegisterDeviceParams {
    gateway_id: String,
}

async fn register_device(
    State(state): State<AppState>,
    Query(params): Query<RegisterDeviceParams>,
) -> Json<Value> {
    let (device_id, device_secret) = state
        .registry
        .lock()
        .await
        .register_device(&params.gateway_id);
    info!(device = %device_id, gateway = %params.gateway_id, "device registered");

    Json(json!({
        "device_id": device_id,
        "device_secret": device_secret,
    }))
}

// ---------------------------------------------------------------------------
// Read-only data views
// ---------------------------------------------------------------------------

async fn all_data(State(state): State<AppState>) -> Json<Value> {
    let data = state.store.all_records().await;
    Json(json!({ "count": data.len(), "data": data }))
}

async fn data_by_type(
    State(state): State<AppState>,
    Path(sensor_type): Path<String>,
) -> Json<Value> {
    let data = state.store.records_by_type(&sensor_type).await;
    Json(json!({
        "sensorType": sensor_type,
        "count": data.len(),
        "data": data,
    }))
}

async fn data_by_device(
    State(state): State<AppState>,
    Path(device_id): Path<String>,
) -> Json<Value> {
    let data = state.store.records_by_device(&device_id).await;
    Json(json!({
        "deviceId": device_id,
        "count": data.len(),
        "data": data,
    }))
}

// ---------------------------------------------------------------------------
// Gateway config
// ---------------------------------------------------------------------------

async fn get_config(
    State(state): State<AppState>,
    Path(gateway_id): Path<String>,
    headers: HeaderMap,
) -> Response {
    if !authorized(&headers) {
        return unauthorized();
    }
    let config = state.store.get_config(&gateway_id).await;
    Json(json!({ "config": config })).into_response()
}

async fn update_config(
    State(state): State<AppState>,
    Path(gateway_id): Path<String>,
    headers: HeaderMap,
    Json(patch): Json<Map<String, Value>>,
) -> Response {
    if !authorized(&headers) {
        return unauthorized();
    }
    let merged = state.store.update_config(&gateway_id, patch).await;
    info!(gateway = %gateway_id, config = %serde_json::Value::Object(merged.clone()), "config updated");
    Json(json!({ "status": "updated", "config": merged })).into_response()
}

// ---------------------------------------------------------------------------
// Heartbeat + gateway status
// ---------------------------------------------------------------------------

async fn heartbeat(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(hb): Json<Heartbeat>,
) -> Response {
    if !authorized(&headers) {
        return unauthorized();
    }

    state.store.record_heartbeat(&hb).await;

    if state.store.ensure_config(&hb.gateway_id).await {
        state
            .registry
            .lock()
            .await
            .register_gateway(&hb.gateway_id, GATEWAY_PROVISIONING_SECRET);
        info!(gateway = %hb.gateway_id, "default config created for new gateway");
    }

    info!(
        gateway = %hb.gateway_id,
        message_rate = hb.message_rate,
        records_sent = hb.records_sent,
        "heartbeat"
    );
    Json(json!({ "ok": true })).into_response()
}

async fn gateway_status(State(state): State<AppState>) -> Json<Value> {
    Json(state.store.gateway_status().await)
}

async fn remove_gateway(
    State(state): State<AppState>,
    Path(gateway_id): Path<String>,
    headers: HeaderMap,
) -> Response {
    if !authorized(&headers) {
        return unauthorized();
    }

    if state.store.remove_gateway(&gateway_id).await {
        info!(gateway = %gateway_id, "gateway deregistered from tracking");
        Json(json!({ "status": "removed", "gateway_id": gateway_id })).into_response()
    } else {
        Json(json!({ "status": "not_found", "gateway_id": gateway_id })).into_response()
    }
}

// ---------------------------------------------------------------------------
// Model + export
// ---------------------------------------------------------------------------

async fn ml_model(State(state): State<AppState>, headers: HeaderMap) -> Response {
    if !authorized(&headers) {
        return unauthorized();
    }

    match state.store.model().await {
        Some(model) => Json(json!({ "status": "ok", "model": model })).into_response(),
        None => Json(json!({
            "status": "pending",
            "model": null,
            "message": "Model not available yet",
        }))
        .into_response(),
    }
}

async fn export(State(state): State<AppState>) -> Response {
    match state.store.export_snapshot().await {
        Ok(count) => {
            info!(count, "training snapshot exported");
            Json(json!({ "status": "exported" })).into_response()
        }
        Err(e) => {
            error!("training snapshot export failed: {e:#}");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({ "detail": "export failed" })),
            )
                .into_response()
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================
