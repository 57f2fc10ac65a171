use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
    response::Json,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, error};
use uuid::Uuid;

use tether_core::{
    relay, DeviceStore, RegistryError, RelayStore, SessionRegistry, SessionStore, SignalStore,
};
use tether_proto::{
    ClaimOutcome, DeviceRecord, MsgType, SessionCreated, Side, SignalPayload, SignalRecord,
};

use crate::auth;
use crate::config::Config;
use crate::ice;
use crate::metrics;

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn RelayStore>,
    pub registry: Arc<SessionRegistry>,
    pub config: Arc<Config>,
}

fn registry_status(err: &RegistryError) -> StatusCode {
    match err {
        RegistryError::Unauthorized(_) => StatusCode::FORBIDDEN,
        RegistryError::DeviceOffline => StatusCode::CONFLICT,
        RegistryError::UnknownDevice(_) => StatusCode::NOT_FOUND,
        RegistryError::SessionNotFound => StatusCode::NOT_FOUND,
        RegistryError::SessionExpired => StatusCode::GONE,
        RegistryError::Store(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

pub(crate) fn parse_sides(raw: Option<&str>) -> Result<Option<Vec<Side>>, StatusCode> {
    let Some(raw) = raw else {
        return Ok(None);
    };
    let mut sides = Vec::new();
    for part in raw.split(',') {
        let part = part.trim();
        if part.is_empty() {
            continue;
        }
        sides.push(part.parse::<Side>().map_err(|_| StatusCode::BAD_REQUEST)?);
    }
    Ok(if sides.is_empty() { None } else { Some(sides) })
}

#[derive(Debug, Serialize)]
pub struct HealthStatus {
    status: &'static str,
}

/// GET /health
pub async fn health_check() -> Json<HealthStatus> {
    Json(HealthStatus { status: "ok" })
}

/// GET /metrics
pub async fn metrics_handler() -> String {
    metrics::render()
}

#[derive(Debug, Deserialize)]
pub struct RegisterDeviceRequest {
    pub device_id: Option<String>,
    pub name: String,
}

/// POST /devices - register (or re-register) a device
pub async fn register_device(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(payload): Json<RegisterDeviceRequest>,
) -> Result<Json<DeviceRecord>, StatusCode> {
    let owner = auth::identity(&headers);
    let device_id = payload
        .device_id
        .unwrap_or_else(|| Uuid::new_v4().to_string());
    let device = state
        .registry
        .register_device(&device_id, &payload.name, owner.as_deref())
        .await
        .map_err(|err| {
            error!("device registration failed: {err}");
            registry_status(&err)
        })?;
    Ok(Json(device))
}

/// GET /devices - devices visible to the caller
pub async fn list_devices(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<Vec<DeviceRecord>>, StatusCode> {
    let identity = auth::identity(&headers);
    let devices = state.store.devices().await.map_err(|err| {
        error!("device listing failed: {err}");
        StatusCode::INTERNAL_SERVER_ERROR
    })?;
    let visible = devices
        .into_iter()
        .filter(|d| match (&identity, &d.owner) {
            (_, None) => true,
            (Some(caller), Some(owner)) => caller == owner,
            (None, Some(_)) => false,
        })
        .collect();
    Ok(Json(visible))
}

/// DELETE /devices/{id} - explicit removal
pub async fn remove_device(
    State(state): State<AppState>,
    Path(device_id): Path<String>,
    headers: HeaderMap,
) -> Result<StatusCode, StatusCode> {
    let caller = auth::require_identity(&headers)?;
    state
        .registry
        .remove_device(&device_id, &caller)
        .await
        .map_err(|err| {
            debug!("device removal failed: {err}");
            registry_status(&err)
        })?;
    Ok(StatusCode::NO_CONTENT)
}

/// POST /devices/{id}/heartbeat
pub async fn heartbeat(
    State(state): State<AppState>,
    Path(device_id): Path<String>,
) -> StatusCode {
    match state.registry.heartbeat(&device_id).await {
        Ok(()) => StatusCode::NO_CONTENT,
        Err(err @ RegistryError::UnknownDevice(_)) => registry_status(&err),
        Err(err) => {
            error!("heartbeat failed: {err}");
            registry_status(&err)
        }
    }
}

#[derive(Debug, Deserialize, Default)]
pub struct ClaimRequest {
    pub controller_type: Option<String>,
}

/// POST /devices/{id}/claim - atomic claim-and-kick
pub async fn claim_device(
    State(state): State<AppState>,
    Path(device_id): Path<String>,
    headers: HeaderMap,
    Json(payload): Json<ClaimRequest>,
) -> Result<Json<ClaimOutcome>, StatusCode> {
    let controller_id = auth::require_identity(&headers)?;
    let controller_type = payload
        .controller_type
        .unwrap_or_else(|| "controller".to_string());
    let outcome = state
        .registry
        .claim_device(&device_id, &controller_id, &controller_type)
        .await
        .map_err(|err| {
            debug!("claim of {device_id} failed: {err}");
            registry_status(&err)
        })?;
    metrics::CLAIMS
        .with_label_values(&[if outcome.claimed { "claimed" } else { "lost" }])
        .inc();
    Ok(Json(outcome))
}

#[derive(Debug, Deserialize)]
pub struct CreateSessionRequest {
    pub device_id: String,
}

/// POST /sessions - create a session on a claimed device
pub async fn create_session(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(payload): Json<CreateSessionRequest>,
) -> Result<Json<SessionCreated>, StatusCode> {
    let creator = auth::require_identity(&headers)?;
    let (session, credentials) = state
        .registry
        .create_session(&payload.device_id, &creator)
        .await
        .map_err(|err| {
            debug!("session creation failed: {err}");
            registry_status(&err)
        })?;
    metrics::SESSIONS_CREATED.inc();
    Ok(Json(SessionCreated {
        session_id: session.id,
        token: credentials.token,
        pin: credentials.pin,
        expires_at: session.expires_at,
        ice_server_config: ice::ice_config(&state.config, &creator, Utc::now()),
    }))
}

/// POST /sessions/{id}/end - idempotent
pub async fn end_session(
    State(state): State<AppState>,
    Path(session_id): Path<Uuid>,
    headers: HeaderMap,
) -> Result<StatusCode, StatusCode> {
    match state.store.session(session_id).await {
        Ok(Some(session)) => auth::authorize_session(&headers, &session)?,
        // Already hard-deleted: ending is a no-op, not an error.
        Ok(None) => return Ok(StatusCode::NO_CONTENT),
        Err(err) => {
            error!("session lookup failed: {err}");
            return Err(StatusCode::INTERNAL_SERVER_ERROR);
        }
    }
    state
        .registry
        .end_session(session_id)
        .await
        .map_err(|err| {
            error!("end session failed: {err}");
            registry_status(&err)
        })?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Debug, Deserialize)]
pub struct PublishSignalRequest {
    pub from_side: Side,
    pub msg_type: MsgType,
    pub payload: SignalPayload,
}

/// POST /sessions/{id}/signals - append one signal row
pub async fn publish_signal(
    State(state): State<AppState>,
    Path(session_id): Path<Uuid>,
    headers: HeaderMap,
    Json(payload): Json<PublishSignalRequest>,
) -> Result<Json<SignalRecord>, StatusCode> {
    // Kick and expiry notices originate from the registry and sweeper,
    // never from a party.
    if payload.from_side == Side::System {
        return Err(StatusCode::FORBIDDEN);
    }

    let session = match state.store.session(session_id).await {
        Ok(Some(session)) => session,
        Ok(None) => return Err(StatusCode::NOT_FOUND),
        Err(err) => {
            error!("session lookup failed: {err}");
            return Err(StatusCode::INTERNAL_SERVER_ERROR);
        }
    };
    auth::authorize_session(&headers, &session)?;
    if !session.is_open() {
        return Err(StatusCode::GONE);
    }

    let record = relay::publish(
        state.store.as_ref(),
        session_id,
        payload.from_side,
        payload.msg_type,
        payload.payload,
    )
    .await
    .map_err(|err| {
        error!("signal publish failed: {err}");
        StatusCode::INTERNAL_SERVER_ERROR
    })?;
    metrics::SIGNALS_PUBLISHED
        .with_label_values(&[record.msg_type.as_str()])
        .inc();
    Ok(Json(record))
}

#[derive(Debug, Deserialize)]
pub struct PollQuery {
    pub sides: Option<String>,
    pub after: Option<u64>,
}

/// GET /sessions/{id}/signals - the poll-fallback query: all signals
/// for the session from the sides of interest, ordered by creation.
pub async fn poll_signals(
    State(state): State<AppState>,
    Path(session_id): Path<Uuid>,
    headers: HeaderMap,
    Query(query): Query<PollQuery>,
) -> Result<Json<Vec<SignalRecord>>, StatusCode> {
    let session = match state.store.session(session_id).await {
        Ok(Some(session)) => session,
        Ok(None) => return Err(StatusCode::NOT_FOUND),
        Err(err) => {
            error!("session lookup failed: {err}");
            return Err(StatusCode::INTERNAL_SERVER_ERROR);
        }
    };
    auth::authorize_session(&headers, &session)?;

    let sides = parse_sides(query.sides.as_deref())?
        .unwrap_or_else(|| vec![Side::Controller, Side::Device, Side::System]);
    let rows = state
        .store
        .signals_for_session(session_id, &sides, query.after.unwrap_or(0))
        .await
        .map_err(|err| {
            error!("signal poll failed: {err}");
            StatusCode::INTERNAL_SERVER_ERROR
        })?;
    Ok(Json(rows))
}

#[derive(Debug, Serialize)]
pub struct SupportSessionCreated {
    pub session_id: Uuid,
    pub pin: String,
    pub token: String,
    pub expires_at: DateTime<Utc>,
}

/// POST /support/sessions - PIN + token for the quick-support flow
pub async fn create_support_session(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<SupportSessionCreated>, StatusCode> {
    let creator = auth::require_identity(&headers)?;
    let (session, credentials) = state
        .registry
        .create_support_session(&creator)
        .await
        .map_err(|err| {
            error!("support session creation failed: {err}");
            registry_status(&err)
        })?;
    metrics::SESSIONS_CREATED.inc();
    Ok(Json(SupportSessionCreated {
        session_id: session.id,
        pin: credentials.pin,
        token: credentials.token,
        expires_at: session.expires_at,
    }))
}

#[derive(Debug, Deserialize)]
pub struct SupportClaimRequest {
    pub pin: String,
}

#[derive(Debug, Serialize)]
pub struct SupportClaimResponse {
    pub session_id: Uuid,
    pub expires_at: DateTime<Utc>,
}

/// POST /support/claim - one-shot PIN redemption
pub async fn claim_support_session(
    State(state): State<AppState>,
    Json(payload): Json<SupportClaimRequest>,
) -> Result<Json<SupportClaimResponse>, StatusCode> {
    let session = state
        .registry
        .claim_support_session(payload.pin.trim())
        .await
        .map_err(|err| {
            debug!("support claim failed: {err}");
            registry_status(&err)
        })?;
    Ok(Json(SupportClaimResponse {
        session_id: session.id,
        expires_at: session.expires_at,
    }))
}

/// GET /ice-config - connection-setup credentials
pub async fn ice_config_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<tether_proto::IceConfig>, StatusCode> {
    let caller = auth::require_identity(&headers)?;
    Ok(Json(ice::ice_config(&state.config, &caller, Utc::now())))
}
