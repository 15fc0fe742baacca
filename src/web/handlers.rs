//! HTTP request handlers.

use super::AppState;
use crate::db::HistoryQuery;
use crate::device::{DeviceConfig, ExpectedState, NotificationDelay};
use crate::monitor::save_logging_flag;
use crate::registry::RegistryError;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Json, Response},
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ============================================================================
// API: Devices
// ============================================================================

pub async fn handle_get_devices(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.monitor.devices())
}

pub async fn handle_get_device(
    State(state): State<AppState>,
    Path(address): Path<String>,
) -> impl IntoResponse {
    match state.monitor.device(&address) {
        Some(device) => Json(device).into_response(),
        None => (StatusCode::NOT_FOUND, "Device not found").into_response(),
    }
}

#[derive(Debug, Deserialize)]
pub struct CreateDeviceRequest {
    pub label: String,
    pub address: String,
    #[serde(default)]
    pub delay: NotificationDelay,
    #[serde(default)]
    pub expected: ExpectedState,
}

pub async fn handle_create_device(
    State(state): State<AppState>,
    Json(req): Json<CreateDeviceRequest>,
) -> impl IntoResponse {
    let config = DeviceConfig::new(&req.label, &req.address, req.delay, req.expected);

    match state.monitor.add_device(config) {
        Ok(device) => (StatusCode::CREATED, Json(device)).into_response(),
        Err(e) => registry_error(e),
    }
}

#[derive(Debug, Deserialize)]
pub struct UpdateDeviceRequest {
    pub delay: NotificationDelay,
    pub expected: ExpectedState,
}

pub async fn handle_update_device(
    State(state): State<AppState>,
    Path(address): Path<String>,
    Json(req): Json<UpdateDeviceRequest>,
) -> impl IntoResponse {
    match state.monitor.update_policy(&address, req.delay, req.expected) {
        Ok(device) => Json(device).into_response(),
        Err(e) => registry_error(e),
    }
}

pub async fn handle_delete_device(
    State(state): State<AppState>,
    Path(address): Path<String>,
) -> impl IntoResponse {
    match state.monitor.remove_device(&address) {
        Ok(_) => StatusCode::NO_CONTENT.into_response(),
        Err(e) => registry_error(e),
    }
}

pub async fn handle_get_delays() -> impl IntoResponse {
    Json(NotificationDelay::preset_labels())
}

fn registry_error(e: RegistryError) -> Response {
    let status = match e {
        RegistryError::DuplicateAddress(_) => StatusCode::CONFLICT,
        RegistryError::InvalidAddress(_) | RegistryError::InvalidLabel(_) => StatusCode::BAD_REQUEST,
        RegistryError::NotFound(_) => StatusCode::NOT_FOUND,
    };
    (status, e.to_string()).into_response()
}

// ============================================================================
// API: History
// ============================================================================

#[derive(Debug, Default, Deserialize)]
pub struct HistoryParams {
    #[serde(default)]
    pub address: Option<String>,
    #[serde(default)]
    pub start: Option<String>,
    #[serde(default)]
    pub end: Option<String>,
    #[serde(default)]
    pub limit: Option<u32>,
}

impl HistoryParams {
    fn to_query(&self) -> Result<HistoryQuery, String> {
        Ok(HistoryQuery {
            address: self.address.clone().filter(|a| !a.trim().is_empty()),
            start: parse_time(self.start.as_deref())?,
            end: parse_time(self.end.as_deref())?,
            limit: self.limit,
        })
    }
}

fn parse_time(value: Option<&str>) -> Result<Option<DateTime<Utc>>, String> {
    match value.map(str::trim).filter(|s| !s.is_empty()) {
        None => Ok(None),
        Some(s) => DateTime::parse_from_rfc3339(s)
            .map(|dt| Some(dt.with_timezone(&Utc)))
            .map_err(|_| format!("Invalid timestamp: {}", s)),
    }
}

pub async fn handle_get_history(
    State(state): State<AppState>,
    Query(params): Query<HistoryParams>,
) -> impl IntoResponse {
    let query = match params.to_query() {
        Ok(q) => q,
        Err(e) => return (StatusCode::BAD_REQUEST, e).into_response(),
    };

    match state.monitor.history().query(&query) {
        Ok(records) => Json(records).into_response(),
        Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response(),
    }
}

pub async fn handle_get_report(
    State(state): State<AppState>,
    Query(params): Query<HistoryParams>,
) -> impl IntoResponse {
    let query = match params.to_query() {
        Ok(q) => q,
        Err(e) => return (StatusCode::BAD_REQUEST, e).into_response(),
    };

    match state.monitor.history().report(&query) {
        Ok(report) => Json(report).into_response(),
        Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response(),
    }
}

// ============================================================================
// API: Logging toggle
// ============================================================================

#[derive(Debug, Serialize, Deserialize)]
pub struct LoggingState {
    pub enabled: bool,
}

pub async fn handle_get_logging(State(state): State<AppState>) -> impl IntoResponse {
    Json(LoggingState {
        enabled: state.monitor.history().is_enabled(),
    })
}

pub async fn handle_set_logging(
    State(state): State<AppState>,
    Json(req): Json<LoggingState>,
) -> impl IntoResponse {
    state.monitor.history().set_enabled(req.enabled);

    if let Err(e) = save_logging_flag(&state.config.logging_state_path, req.enabled) {
        tracing::error!(
            "Failed to save logging flag to {}: {}",
            state.config.logging_state_path,
            e
        );
    }

    Json(LoggingState {
        enabled: req.enabled,
    })
}
