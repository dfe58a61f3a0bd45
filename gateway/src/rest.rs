use crate::engine::Engine;
use crate::errors::Error;
use crate::model::{Device, DevicePatch, HistoryQuery, Mode, NewDevice, SensorSample};
use crate::realtime::ws_handler;
use crate::storage::{with_timeout, Storage};
use crate::validate::validate_device_id;
use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::error;

const DEFAULT_HISTORY_LIMIT: usize = 100;
const MAX_HISTORY_LIMIT: usize = 1000;

#[derive(Clone)]
pub struct AppState {
    pub engine: Engine,
    pub storage: Arc<dyn Storage>,
    pub storage_timeout: Duration,
    pub shutdown: watch::Receiver<bool>,
}

#[derive(Debug, Deserialize)]
pub struct HistoryParams {
    limit: Option<usize>,
    start: Option<DateTime<Utc>>,
    end: Option<DateTime<Utc>>,
}

#[derive(Debug, Deserialize)]
pub struct PumpRequest {
    on: bool,
}

#[derive(Debug, Deserialize)]
pub struct ModeRequest {
    mode: Mode,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryResponse {
    pub device_id: String,
    pub data: Vec<SensorSample>,
    pub total: usize,
    pub limit: usize,
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    status: &'static str,
    devices: usize,
    subscribers: usize,
    storage: &'static str,
}

pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/ws", get(ws_handler))
        .route("/api/devices", get(list_devices).post(create_device))
        .route(
            "/api/devices/:id",
            get(get_device).patch(update_device).delete(delete_device),
        )
        .route("/api/devices/:id/pump", post(set_pump))
        .route("/api/devices/:id/mode", post(set_mode))
        .route("/api/devices/:id/history", get(get_history))
        .with_state(state)
}

async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        devices: state.engine.registry.len(),
        subscribers: state.engine.notifier.subscriber_count(),
        storage: state.storage.backend(),
    })
}

async fn list_devices(State(state): State<AppState>) -> Json<Vec<Device>> {
    Json(
        state
            .engine
            .registry
            .list()
            .iter()
            .map(Device::reported)
            .collect(),
    )
}

async fn get_device(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Device>, AppError> {
    let device = state
        .engine
        .registry
        .get(&id)
        .ok_or_else(|| Error::NotFound(id.clone()))?;
    Ok(Json(device.reported()))
}

async fn create_device(
    State(state): State<AppState>,
    Json(registration): Json<NewDevice>,
) -> Result<(StatusCode, Json<Device>), AppError> {
    validate_device_id(&registration.id)?;
    let device = state.engine.registry.create(registration)?;
    Ok((StatusCode::CREATED, Json(device.reported())))
}

async fn update_device(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(patch): Json<DevicePatch>,
) -> Result<Json<Device>, AppError> {
    let device = state.engine.registry.update(&id, &patch.administrative())?;
    Ok(Json(device.reported()))
}

async fn delete_device(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<StatusCode, AppError> {
    state.engine.registry.delete(&id)?;
    state.engine.last_seen.forget(&id);
    Ok(StatusCode::NO_CONTENT)
}

async fn set_pump(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(request): Json<PumpRequest>,
) -> Result<Json<Device>, AppError> {
    let device = state.engine.dispatcher.set_pump(&id, request.on)?;
    Ok(Json(device.reported()))
}

async fn set_mode(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(request): Json<ModeRequest>,
) -> Result<Json<Device>, AppError> {
    let device = state.engine.dispatcher.set_mode(&id, request.mode)?;
    Ok(Json(device.reported()))
}

async fn get_history(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(params): Query<HistoryParams>,
) -> Result<Json<HistoryResponse>, AppError> {
    if !state.engine.registry.contains(&id) {
        return Err(Error::NotFound(id).into());
    }

    let limit = params
        .limit
        .unwrap_or(DEFAULT_HISTORY_LIMIT)
        .clamp(1, MAX_HISTORY_LIMIT);
    let query = HistoryQuery {
        limit,
        start: params.start,
        end: params.end,
    };

    let data = with_timeout(
        state.storage_timeout,
        state.storage.query_sensor_history(&id, &query),
    )
    .await?;

    Ok(Json(HistoryResponse {
        device_id: id,
        total: data.len(),
        data,
        limit,
    }))
}

struct AppError(anyhow::Error);

impl AppError {
    fn status(&self) -> StatusCode {
        match self.0.downcast_ref::<Error>() {
            Some(Error::NotFound(_)) => StatusCode::NOT_FOUND,
            Some(Error::DuplicateId(_)) => StatusCode::CONFLICT,
            Some(Error::MalformedMessage(_)) => StatusCode::BAD_REQUEST,
            Some(Error::StorageUnavailable(_)) | Some(Error::Database(_)) => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            error!("API error: {}", self.0);
        }
        (
            status,
            Json(serde_json::json!({ "error": self.0.to_string() })),
        )
            .into_response()
    }
}

impl<E> From<E> for AppError
where
    E: Into<anyhow::Error>,
{
    fn from(err: E) -> Self {
        Self(err.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_status_mapping() {
        let cases = [
            (Error::NotFound("d1".into()), StatusCode::NOT_FOUND),
            (Error::DuplicateId("d1".into()), StatusCode::CONFLICT),
            (Error::MalformedMessage("bad".into()), StatusCode::BAD_REQUEST),
            (
                Error::StorageUnavailable("down".into()),
                StatusCode::SERVICE_UNAVAILABLE,
            ),
            (Error::ChannelSend, StatusCode::INTERNAL_SERVER_ERROR),
        ];

        for (err, expected) in cases {
            assert_eq!(AppError::from(err).status(), expected);
        }
    }
}
