//! Thin wrapper over the docker CLI for managing the gateway fleet.

use std::collections::HashSet;
use std::process::Output;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use tokio::process::Command;
use tokio::time::timeout;
use tracing::{info, warn};

use crate::scaling::is_gateway_container;

const PS_TIMEOUT: Duration = Duration::from_secs(10);
const RUN_TIMEOUT: Duration = Duration::from_secs(30);
const STOP_TIMEOUT: Duration = Duration::from_secs(30);
const RM_TIMEOUT: Duration = Duration::from_secs(10);

const DEFAULT_IMAGE: &str = "5ggateway-gateway-01";
const DEFAULT_NETWORK: &str = "5ggateway_default";

pub struct Docker {
    image: String,
    network: String,
}

impl Docker {
    pub fn from_env() -> Self {
        Self {
            image: std::env::var("GATEWAY_IMAGE").unwrap_or_else(|_| DEFAULT_IMAGE.to_string()),
            network: std::env::var("GATEWAY_NETWORK")
                .unwrap_or_else(|_| DEFAULT_NETWORK.to_string()),
        }
    }

    async fn run(args: &[&str], limit: Duration) -> Result<Output> {
        let output = timeout(limit, Command::new("docker").args(args).output())
            .await
            .context("docker command timed out")?
            .context("failed to spawn docker")?;
        Ok(output)
    }

    /// Names of running `gateway-NN` containers.
    pub async fn running_gateways(&self) -> Result<HashSet<String>> {
        let output = Self::run(
            &["ps", "--filter", "name=gateway-", "--format", "{{.Names}}"],
            PS_TIMEOUT,
        )
        .await?;

        if !output.status.success() {
            bail!(
                "docker ps failed: {}",
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }

        Ok(String::from_utf8_lossy(&output.stdout)
            .lines()
            .map(str::trim)
            .filter(|name| is_gateway_container(name))
            .map(str::to_string)
            .collect())
    }

    /// Start a new gateway container on the fleet network.
    pub async fn start_gateway(&self, gateway_id: &str) -> Result<()> {
        info!(gateway = %gateway_id, image = %self.image, "starting gateway container");

        let env = format!("GATEWAY_ID={gateway_id}");
        let output = Self::run(
            &[
                "run",
                "-d",
                "--name",
                gateway_id,
                "--network",
                self.network.as_str(),
                "-e",
                env.as_str(),
                self.image.as_str(),
            ],
            RUN_TIMEOUT,
        )
        .await?;

        if !output.status.success() {
            bail!(
                "docker run failed for {gateway_id}: {}",
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }

        info!(gateway = %gateway_id, "gateway container started");
        Ok(())
    }

    /// Stop and remove a gateway container.  An already-gone container is
    /// not an error.
    pub async fn stop_gateway(&self, gateway_id: &str) -> Result<()> {
        let output = Self::run(&["stop", gateway_id], STOP_TIMEOUT).await?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            if stderr.contains("No such container") {
                warn!(gateway = %gateway_id, "container already gone");
                return Ok(());
            }
            bail!("docker stop failed for {gateway_id}: {}", stderr.trim());
        }

        let output = Self::run(&["rm", gateway_id], RM_TIMEOUT).await?;
        if !output.status.success() {
            warn!(
                gateway = %gateway_id,
                "docker rm failed: {}",
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }

        info!(gateway = %gateway_id, "gateway container removed");
        Ok(())
    }
}
