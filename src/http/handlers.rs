//! HTTP handlers: the limited demo endpoint and override management.

use axum::body::Body;
use axum::extract::rejection::JsonRejection;
use axum::extract::{ConnectInfo, Query, State};
use axum::http::{Request, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Deserialize;
use std::fmt::Write;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::{error, info, warn};

use crate::ratelimit::{Admission, ClientKey, API_KEY_HEADER};
use crate::store::{ConfigStore, RateLimitConfig, StoreError};

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    pub admission: Arc<Admission>,
}

impl AppState {
    pub fn new(admission: Arc<Admission>) -> Self {
        Self { admission }
    }

    fn overrides(&self) -> &Arc<dyn ConfigStore> {
        self.admission.resolver().store()
    }
}

/// `?id=N` on the single-override endpoints.
#[derive(Debug, Deserialize)]
pub struct IdQuery {
    pub id: u64,
}

/// Errors returned by the management endpoints.
#[derive(Debug)]
pub enum ApiError {
    BadRequest(String),
    Store(StoreError),
    Internal(String),
}

impl From<StoreError> for ApiError {
    fn from(err: StoreError) -> Self {
        ApiError::Store(err)
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        ApiError::BadRequest(rejection.body_text())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        match self {
            ApiError::BadRequest(reason) => (StatusCode::BAD_REQUEST, reason).into_response(),
            ApiError::Store(StoreError::NotFound) => StatusCode::NOT_FOUND.into_response(),
            ApiError::Store(StoreError::Conflict(key)) => (
                StatusCode::CONFLICT,
                format!("an override for {key:?} already exists"),
            )
                .into_response(),
            ApiError::Store(err) => {
                error!(error = %err, "Override store failure");
                StatusCode::INTERNAL_SERVER_ERROR.into_response()
            }
            ApiError::Internal(reason) => {
                error!(reason = %reason, "Request failed");
                StatusCode::INTERNAL_SERVER_ERROR.into_response()
            }
        }
    }
}

fn validated(config: RateLimitConfig) -> Result<RateLimitConfig, ApiError> {
    if config.config_value.is_empty() {
        return Err(ApiError::BadRequest("config_value must not be empty".to_string()));
    }
    Ok(config)
}

/// `GET /rate-limit`: reports the identity and limits the caller runs under.
pub async fn rate_limit_info(
    State(state): State<AppState>,
    request: Request<Body>,
) -> Result<String, ApiError> {
    let key = ClientKey::from_request(&request);
    let cfg = state
        .admission
        .resolver()
        .resolve(key.as_str())
        .await
        .map_err(|e| ApiError::Internal(e.to_string()))?;

    let peer = request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.to_string())
        .unwrap_or_else(|| "unknown".to_string());

    let mut body = String::from("You are free to access the endpoint\n");
    if let Some(api_key) = request.headers().get(&API_KEY_HEADER) {
        if !api_key.is_empty() {
            let api_key = String::from_utf8_lossy(api_key.as_bytes());
            let _ = writeln!(body, "Your API key is: {}", api_key);
        }
    }
    let _ = writeln!(body, "Your IP address is: {}", peer);
    let _ = writeln!(body, "Your request limit is: {}", cfg.max_request);
    let _ = writeln!(body, "Your block time is: {}", cfg.block_time.as_secs());
    let _ = writeln!(body, "Your limit type is: {}", cfg.limit_type);

    Ok(body)
}

/// `GET /config?id=N`
pub async fn get_config(
    State(state): State<AppState>,
    Query(query): Query<IdQuery>,
) -> Result<Json<RateLimitConfig>, ApiError> {
    state
        .overrides()
        .get_by_id(query.id)
        .await?
        .map(Json)
        .ok_or(ApiError::Store(StoreError::NotFound))
}

/// `GET /configs`
pub async fn list_configs(
    State(state): State<AppState>,
) -> Result<Json<Vec<RateLimitConfig>>, ApiError> {
    Ok(Json(state.overrides().list().await?))
}

/// `POST /config`
pub async fn create_config(
    State(state): State<AppState>,
    body: Result<Json<RateLimitConfig>, JsonRejection>,
) -> Result<(StatusCode, Json<RateLimitConfig>), ApiError> {
    let Json(config) = body?;
    let created = state.overrides().create(validated(config)?).await?;

    info!(
        id = ?created.id,
        config_value = %created.config_value,
        max_request = created.max_request,
        block_time = created.block_time,
        "Rate limit override created"
    );
    Ok((StatusCode::CREATED, Json(created)))
}

/// `PATCH /config?id=N`: replaces every field of the override but its id.
pub async fn update_config(
    State(state): State<AppState>,
    Query(query): Query<IdQuery>,
    body: Result<Json<RateLimitConfig>, JsonRejection>,
) -> Result<Json<RateLimitConfig>, ApiError> {
    let Json(config) = body?;
    if config.id.is_some_and(|id| id != query.id) {
        warn!(id = query.id, body_id = ?config.id, "Ignoring id in override update body");
    }
    let updated = state
        .overrides()
        .update(query.id, validated(config)?)
        .await?;

    info!(id = query.id, config_value = %updated.config_value, "Rate limit override updated");
    Ok(Json(updated))
}

/// `DELETE /config?id=N`
pub async fn delete_config(
    State(state): State<AppState>,
    Query(query): Query<IdQuery>,
) -> Result<StatusCode, ApiError> {
    state.overrides().delete(query.id).await?;
    info!(id = query.id, "Rate limit override deleted");
    Ok(StatusCode::OK)
}
