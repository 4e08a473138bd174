//! Autoscaler control loop: polls the cloud's gateway status, applies
//! hysteresis, and scales the Docker gateway fleet up or down.

mod docker;
mod scaling;

use std::collections::HashMap;
use std::env;
use std::time::Duration;

use anyhow::Result;
use serde::Deserialize;
use tokio::time::Instant;
use tracing::{error, info, warn};

use docker::Docker;
use scaling::{ScaleAction, FLOOR_GATEWAY, MAX_GATEWAYS, SCALE_DOWN_THRESHOLD, SCALE_UP_THRESHOLD};

const POLL_INTERVAL: Duration = Duration::from_secs(15);
const COOLDOWN: Duration = Duration::from_secs(30);
const STATUS_TIMEOUT: Duration = Duration::from_secs(15);
const DEREGISTER_TIMEOUT: Duration = Duration::from_secs(5);

const API_KEY: &str = "secretAPIkey";

#[derive(Debug, Deserialize)]
struct StatusResponse {
    #[serde(default)]
    gateways: HashMap<String, GatewayInfo>,
    #[serde(default)]
    total_records_sent: u64,
}

#[derive(Debug, Deserialize)]
struct GatewayInfo {
    #[serde(default)]
    message_rate: u64,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .init();

    let cloud_url =
        env::var("CLOUD_API_URL").unwrap_or_else(|_| "http://localhost:8000".to_string());
    let client = reqwest::Client::new();
    let docker = Docker::from_env();
    let mut last_scale: Option<Instant> = None;

    info!(
        poll_secs = POLL_INTERVAL.as_secs(),
        up_threshold = SCALE_UP_THRESHOLD,
        down_threshold = SCALE_DOWN_THRESHOLD,
        max_gateways = MAX_GATEWAYS,
        "autoscaler started"
    );

    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);
    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;

    loop {
        run_tick(&client, &cloud_url, &docker, &mut last_scale).await;

        tokio::select! {
            _ = tokio::time::sleep(POLL_INTERVAL) => {}
            _ = &mut ctrl_c => break,
            _ = sigterm.recv() => break,
        }
    }

    info!("autoscaler stopped");
    Ok(())
}

async fn run_tick(
    client: &reqwest::Client,
    cloud_url: &str,
    docker: &Docker,
    last_scale: &mut Option<Instant>,
) {
    let Some(status) = fetch_status(client, cloud_url).await else {
        return; // cloud unreachable: sleep and retry
    };

    let running = match docker.running_gateways().await {
        Ok(running) => Some(running),
        Err(e) => {
            warn!("docker check failed: {e:#}");
            None
        }
    };

    // Deregister ghost entries the cloud still tracks but Docker no longer
    // runs.  The floor gateway is exempt.
    if let Some(running) = &running {
        for gateway_id in status.gateways.keys() {
            if gateway_id != FLOOR_GATEWAY && !running.contains(gateway_id) {
                info!(gateway = %gateway_id, "stale gateway (no container) — deregistering");
                deregister(client, cloud_url, gateway_id).await;
            }
        }
    }

    // Only gateways both reported and actually running count toward the
    // average, with the floor gateway always included.
    let rates: HashMap<String, u64> = status
        .gateways
        .iter()
        .filter(|(id, _)| match &running {
            Some(running) => running.contains(id.as_str()) || *id == FLOOR_GATEWAY,
            None => true,
        })
        .map(|(id, info)| (id.clone(), info.message_rate))
        .collect();

    if rates.is_empty() {
        info!("no gateways reporting yet");
        return;
    }

    let total: u64 = rates.values().sum();
    let avg = total as f64 / rates.len() as f64;
    let in_cooldown = last_scale.is_some_and(|t| t.elapsed() < COOLDOWN);

    info!(
        gateways = rates.len(),
        total_rate = total,
        avg_rate = avg,
        total_sent = status.total_records_sent,
        cooldown = in_cooldown,
        "fleet status"
    );

    if in_cooldown {
        return;
    }

    match scaling::decide(&rates) {
        ScaleAction::Up { gateway_id } => {
            info!(gateway = %gateway_id, avg_rate = avg, "scaling up");
            match docker.start_gateway(&gateway_id).await {
                Ok(()) => *last_scale = Some(Instant::now()),
                Err(e) => error!("scale up failed: {e:#}"),
            }
        }
        ScaleAction::Down { gateway_id } => {
            info!(gateway = %gateway_id, avg_rate = avg, "scaling down");
            if let Err(e) = docker.stop_gateway(&gateway_id).await {
                error!("scale down failed: {e:#}");
            }
            deregister(client, cloud_url, &gateway_id).await;
            *last_scale = Some(Instant::now());
        }
        ScaleAction::None => {}
    }
}

async fn fetch_status(client: &reqwest::Client, cloud_url: &str) -> Option<StatusResponse> {
    let result = client
        .get(format!("{cloud_url}/gateway-status"))
        .timeout(STATUS_TIMEOUT)
        .send()
        .await;

    match result {
        Ok(resp) if resp.status().is_success() => match resp.json::<StatusResponse>().await {
            Ok(status) => Some(status),
            Err(e) => {
                warn!("bad gateway-status response: {e}");
                None
            }
        },
        Ok(resp) => {
            warn!(status = %resp.status(), "gateway-status fetch failed");
            None
        }
        Err(e) => {
            warn!("cloud api unreachable: {e}");
            None
        }
    }
}

/// Tell the cloud to drop a gateway from its registry.  A 404 means it was
/// already gone.
async fn deregister(client: &reqwest::Client, cloud_url: &str, gateway_id: &str) {
    let result = client
        .delete(format!("{cloud_url}/gateway/{gateway_id}"))
        .bearer_auth(API_KEY)
        .timeout(DEREGISTER_TIMEOUT)
        .send()
        .await;

    match result {
        Ok(resp) if resp.status().is_success() => {
            info!(gateway = %gateway_id, "gateway deregistered");
        }
        Ok(resp) if resp.status() == reqwest::StatusCode::NOT_FOUND => {}
        Ok(resp) => warn!(gateway = %gateway_id, status = %resp.status(), "deregister failed"),
        Err(e) => warn!(gateway = %gateway_id, "deregister error: {e}"),
    }
}

// ===========================================================================
// Tests
// ===========================================================================
