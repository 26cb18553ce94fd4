// src/web.rs
//
// HTTP admin surface: config CRUD with hot reload, config download,
// manual poll trigger, and restart. JSON in, JSON out; validation
// failures map to 400 with the validation message.

use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::State,
    http::{header, StatusCode},
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use serde_json::{json, Value};
use tracing::error;

use crate::config::AppConfig;
use crate::service::BridgeService;
use crate::store::ConfigStore;

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<ConfigStore>,
    pub service: Arc<BridgeService>,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/config", get(get_config).post(update_config))
        .route("/api/config/download", get(download_config))
        .route("/api/poll", post(trigger_poll))
        .route("/api/restart", post(restart))
        .with_state(state)
}

async fn get_config(State(state): State<AppState>) -> Json<AppConfig> {
    Json(state.store.config())
}

async fn update_config(
    State(state): State<AppState>,
    Json(payload): Json<Value>,
) -> impl IntoResponse {
    if let Err(e) = state.store.update_from_value(payload) {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({ "error": e.to_string() })),
        );
    }

    if let Err(e) = state.service.reload().await {
        error!(error = %e, "reload after config save failed");
        return (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({ "error": e.to_string() })),
        );
    }

    (
        StatusCode::OK,
        Json(json!({
            "status": "ok",
            "message": "configuration saved and applied",
        })),
    )
}

async fn download_config(State(state): State<AppState>) -> impl IntoResponse {
    let path = state.store.path().to_path_buf();
    match tokio::fs::read(&path).await {
        Ok(bytes) => {
            let filename = path
                .file_name()
                .and_then(|name| name.to_str())
                .unwrap_or("config.json")
                .to_string();
            (
                [
                    (header::CONTENT_TYPE, "application/json".to_string()),
                    (
                        header::CONTENT_DISPOSITION,
                        format!("attachment; filename=\"{filename}\""),
                    ),
                ],
                bytes,
            )
                .into_response()
        }
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({ "error": e.to_string() })),
        )
            .into_response(),
    }
}

async fn trigger_poll(State(state): State<AppState>) -> Json<Value> {
    state.service.trigger_poll_all().await;
    Json(json!({ "status": "ok", "message": "polling requested" }))
}

async fn restart(State(state): State<AppState>, body: Bytes) -> impl IntoResponse {
    // Body is optional; default mode restarts the application itself
    let mode = serde_json::from_slice::<Value>(&body)
        .ok()
        .and_then(|v| {
            v.get("mode")
                .and_then(Value::as_str)
                .map(|s| s.trim().to_lowercase())
        })
        .unwrap_or_else(|| "app".to_string());

    let result = if mode == "service" {
        state.service.run_restart_command()
    } else {
        Ok(state.service.restart_self())
    };

    match result {
        Ok(message) => (
            StatusCode::OK,
            Json(json!({ "status": "ok", "message": message })),
        ),
        Err(e) => (
            StatusCode::BAD_REQUEST,
            Json(json!({ "error": e.to_string() })),
        ),
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn test_state(dir: &tempfile::TempDir) -> AppState {
        let store = Arc::new(ConfigStore::open(dir.path().join("config.json")).unwrap());
        let service = Arc::new(BridgeService::new(store.clone()));
        AppState { store, service }
    }

    #[tokio::test]
    async fn test_get_config_returns_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let state = test_state(&dir);

        let Json(config) = get_config(State(state)).await;
        assert_eq!(config, AppConfig::default());
    }

    #[tokio::test]
    async fn test_update_config_persists_and_answers_ok() {
        let dir = tempfile::tempdir().unwrap();
        let state = test_state(&dir);

        let response = update_config(
            State(state.clone()),
            Json(json!({
                "polling": { "interval_sec": 5 },
                "boards": [
                    { "name": "Sala", "type": "lights", "address": 3, "channel": 1 }
                ]
            })),
        )
        .await
        .into_response();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(state.store.config().polling.interval_sec, 5);
        assert_eq!(state.store.config().boards.len(), 1);
    }

    #[tokio::test]
    async fn test_update_config_validation_failure_is_400() {
        let dir = tempfile::tempdir().unwrap();
        let state = test_state(&dir);

        let response = update_config(
            State(state.clone()),
            Json(json!({ "polling": { "interval_sec": 0 } })),
        )
        .await
        .into_response();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        // Active config untouched
        assert_eq!(state.store.config().polling.interval_sec, 30);
    }

    #[tokio::test]
    async fn test_restart_service_mode_without_command_is_400() {
        let dir = tempfile::tempdir().unwrap();
        let state = test_state(&dir);

        let body = Bytes::from(serde_json::to_vec(&json!({ "mode": "service" })).unwrap());
        let response = restart(State(state), body).await.into_response();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }
}
