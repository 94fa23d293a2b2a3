//! Health check endpoint.

use axum::Json;
use serde_json::{json, Value};
use std::time::{SystemTime, UNIX_EPOCH};

static START_TIME: std::sync::OnceLock<u64> = std::sync::OnceLock::new();

pub fn init_start_time() {
    START_TIME.get_or_init(|| {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs()
    });
}

/// GET /health - liveness probe
pub async fn health() -> Json<Value> {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs();
    let uptime = now.saturating_sub(*START_TIME.get().unwrap_or(&now));

    Json(json!({
        "status": "ok",
        "agent": env!("CARGO_PKG_VERSION"),
        "uptime_secs": uptime,
    }))
}
