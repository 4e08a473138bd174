//! Gateway entry point: wires the MQTT ingestor, worker pool, batch buffer,
//! anomaly detector, peer replication, cloud uploader, and control-plane
//! client into one supervised process.
//!
//! Lifecycle:
//! - Startup: env config, bootstrap device secrets, one config fetch and
//!   heartbeat, then all long-lived tasks are spawned.
//! - Shutdown: SIGTERM/SIGINT flips a watch flag observed at every
//!   sleep/poll boundary; the buffer is flushed and the remaining records
//!   are uploaded best-effort before exit.

mod auth;
mod buffer;
mod config;
mod control;
mod detector;
mod mqtt;
mod peer;
mod reading;
mod state;
mod uploader;

use std::env;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use anyhow::Result;
use tokio::sync::{mpsc, watch, Mutex};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use auth::AuthOutcome;
use config::GatewayConfig;
use control::ControlPlane;
use mqtt::InboundMessage;
use peer::PeerSync;
use state::GatewayState;
use uploader::Uploader;

/// Fixed number of per-message pipeline workers.
const WORKER_COUNT: usize = 20;

/// Bound on the MQTT → worker hand-off queue.
const INGEST_QUEUE_DEPTH: usize = 1_000;

/// Bearer token accepted by the cloud API.
const API_KEY: &str = "secretAPIkey";

/// Devices registered when no device file is present.
const BOOTSTRAP_DEVICES: [&str; 2] = ["sensor-001", "sensor-002"];

#[tokio::main]
async fn main() -> Result<()> {
    // ── Structured logging ──────────────────────────────────────────
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .init();

    // ── Env config ──────────────────────────────────────────────────
    let gateway_id = env::var("GATEWAY_ID").unwrap_or_else(|_| "gateway-01".to_string());
    let cloud_url =
        env::var("CLOUD_API_URL").unwrap_or_else(|_| "http://cloud-api:8000".to_string());
    let mqtt_host = env::var("MQTT_HOST").unwrap_or_else(|_| "mqtt-broker".to_string());
    let mqtt_port: u16 = env::var("MQTT_PORT")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(1883);
    let peer_port: u16 = env::var("PEER_PORT")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(5000);
    let devices_path = env::var("DEVICES_PATH").unwrap_or_else(|_| "devices.toml".to_string());

    // ── Shared state ────────────────────────────────────────────────
    let state = GatewayState::new(gateway_id.clone(), GatewayConfig::default());

    // ── Bootstrap device secrets ────────────────────────────────────
    match config::load_devices(&devices_path) {
        Ok(file) => {
            let mut devices = state.devices.lock().await;
            config::apply_devices(&file, &mut devices);
            info!(
                path = %devices_path,
                devices = devices.len(),
                "device secrets seeded from file"
            );
        }
        Err(e) => {
            // No device file is the common case in containers; fall back to
            // the well-known bootstrap sensors.
            debug!("device file unavailable ({e:#}) — registering bootstrap sensors");
            let mut devices = state.devices.lock().await;
            for id in BOOTSTRAP_DEVICES {
                devices.add_device(id, auth::PROVISIONING_SECRET);
            }
        }
    }

    let control = Arc::new(ControlPlane::new(
        Arc::clone(&state),
        cloud_url.clone(),
        API_KEY.to_string(),
    ));
    let peer_sync = Arc::new(PeerSync::new(
        gateway_id.clone(),
        cloud_url.clone(),
        peer_port,
        Arc::clone(&state.buffer),
    ));
    let uploader = Arc::new(Uploader::new(
        Arc::clone(&state),
        &cloud_url,
        API_KEY.to_string(),
    ));

    // First config fetch + heartbeat.  The cloud may not be up yet; both are
    // retried by the control loop, so failures here only warn.
    if let Err(e) = control.refresh_config().await {
        warn!("initial config fetch failed: {e:#}");
    }
    if let Err(e) = control.send_heartbeat().await {
        warn!("initial heartbeat failed: {e:#}");
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // ── Worker pool ─────────────────────────────────────────────────
    let (worker_tx, worker_rx) = mpsc::channel::<InboundMessage>(INGEST_QUEUE_DEPTH);
    let worker_rx = Arc::new(Mutex::new(worker_rx));
    for _ in 0..WORKER_COUNT {
        let worker_rx = Arc::clone(&worker_rx);
        let state = Arc::clone(&state);
        let peer_sync = Arc::clone(&peer_sync);
        tokio::spawn(async move {
            loop {
                let msg = { worker_rx.lock().await.recv().await };
                match msg {
                    Some(msg) => process_message(&state, &peer_sync, msg).await,
                    None => break,
                }
            }
        });
    }

    // ── MQTT ingestor ───────────────────────────────────────────────
    let mut mqtt_handle = {
        let gateway_id = gateway_id.clone();
        let shutdown_rx = shutdown_rx.clone();
        tokio::spawn(async move {
            mqtt::run(&gateway_id, &mqtt_host, mqtt_port, worker_tx, shutdown_rx).await;
        })
    };

    // ── Peer replication ────────────────────────────────────────────
    let mut peer_server_handle = tokio::spawn(peer::serve(
        Arc::clone(&peer_sync),
        peer_port,
        shutdown_rx.clone(),
    ));
    tokio::spawn(Arc::clone(&peer_sync).sync_loop(shutdown_rx.clone()));

    // ── Uploader drain loop ─────────────────────────────────────────
    tokio::spawn(uploader::drain_loop(
        Arc::clone(&uploader),
        shutdown_rx.clone(),
    ));

    // ── Control-plane tickers ───────────────────────────────────────
    tokio::spawn(Arc::clone(&control).run_control_loop(shutdown_rx.clone()));
    tokio::spawn(Arc::clone(&control).run_model_loop(shutdown_rx.clone()));

    info!(
        gateway = %gateway_id,
        workers = WORKER_COUNT,
        peer_port,
        "gateway started"
    );

    // ── Signal handling ─────────────────────────────────────────────
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);
    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;

    let exit_reason: &str;
    loop {
        tokio::select! {
            _ = &mut ctrl_c => {
                exit_reason = "SIGINT";
                break;
            }

            _ = sigterm.recv() => {
                exit_reason = "SIGTERM";
                break;
            }

            result = &mut peer_server_handle => {
                error!("peer replication server exited unexpectedly: {result:?}");
                exit_reason = "peer server died";
                break;
            }

            result = &mut mqtt_handle => {
                error!("mqtt ingestor exited unexpectedly: {result:?}");
                exit_reason = "mqtt ingestor died";
                break;
            }
        }
    }

    // ── Graceful shutdown ───────────────────────────────────────────
    warn!(signal = exit_reason, "shutting down — draining buffer");
    let _ = shutdown_tx.send(true);
    uploader.shutdown_drain().await;

    info!("shutdown complete");
    Ok(())
}

// ---------------------------------------------------------------------------
// Per-message pipeline
// ---------------------------------------------------------------------------

/// Authenticate, score, buffer, and replicate one decoded MQTT message.
/// Runs on the worker pool.
async fn process_message(state: &Arc<GatewayState>, peer_sync: &PeerSync, msg: InboundMessage) {
    let mut reading = msg.reading;

    // Assigned exactly once, here, at the first gateway that accepts the
    // message; dedup and replication key off it from now on.
    reading.message_id = Some(Uuid::new_v4().to_string());

    let outcome = {
        let mut devices = state.devices.lock().await;
        devices.authenticate(&reading.device_id, msg.signature.as_deref())
    };
    match outcome {
        AuthOutcome::Rejected => {
            info!(device = %reading.device_id, "unauthorized device attempt");
            return;
        }
        AuthOutcome::AutoRegistered => {
            info!(device = %reading.device_id, "auto-registered device");
        }
        AuthOutcome::Accepted => {}
    }

    state.messages_accepted.fetch_add(1, Ordering::Relaxed);

    let key = reading::profile_key(&reading);
    let score = state.detector.score(&key, reading.value).await;
    reading.profile_key = Some(key.clone());
    reading.is_anomaly = Some(score.is_anomaly);
    reading.anomaly_score = Some(score.score);
    if score.has_profile {
        reading.model_timestamp = score.model_timestamp;
        if score.is_anomaly {
            warn!(
                profile = %key,
                value = reading.value,
                score = score.score,
                "anomaly detected"
            );
        }
    } else {
        debug!(profile = %key, "no profile yet");
    }

    let _ = state.buffer.lock().await.add(reading.clone());

    // Peers pull this record from the replication log.
    peer_sync.add_to_log(&reading).await;
}

// ===========================================================================
// Tests
// ===========================================================================
