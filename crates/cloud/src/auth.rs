//! Gateway authentication middleware for the protected ingest path.
//!
//! Validates the `gatewayid` + `secret` headers against the provisioning
//! registry; unknown gateways presenting the provisioning secret are
//! auto-registered so a freshly scaled-up gateway can upload without
//! operator action.  Other endpoints pass through untouched.

use axum::extract::{Request, State};
use axum::http::StatusCode;
use axum::middleware::Next;
use axum::response::{IntoResponse, Json, Response};
use serde_json::json;
use tracing::{info, warn};

use crate::provisioning::GATEWAY_PROVISIONING_SECRET;
use crate::routes::AppState;

/// Paths requiring gateway identity headers.
const PROTECTED_PATHS: [&str; 1] = ["/ingest"];

pub async fn gateway_auth(State(state): State<AppState>, request: Request, next: Next) -> Response {
    let path = request.uri().path().to_string();

    if PROTECTED_PATHS.iter().any(|p| path.starts_with(p)) {
        let gateway_id = header_value(&request, "gatewayid");
        let secret = header_value(&request, "secret");

        let mut registry = state.registry.lock().await;
        let valid = match (&gateway_id, &secret) {
            (Some(id), Some(secret)) => registry.validate_gateway(id, secret),
            _ => false,
        };

        if !valid {
            match (&gateway_id, &secret) {
                (Some(id), Some(secret)) if secret.as_str() == GATEWAY_PROVISIONING_SECRET => {
                    registry.register_gateway(id, secret);
                    info!(gateway = %id, "auto-registered new gateway");
                }
                _ => {
                    warn!(path = %path, gateway = ?gateway_id, "unauthorized gateway access");
                    return (
                        StatusCode::UNAUTHORIZED,
                        Json(json!({ "detail": "Invalid Gateway" })),
                    )
                        .into_response();
                }
            }
        }
    }

    next.run(request).await
}

fn header_value(request: &Request, name: &str) -> Option<String> {
    request
        .headers()
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
}
