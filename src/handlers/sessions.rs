// src/handlers/sessions.rs

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    Json,
};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::json;
use uuid::Uuid;
use validator::Validate;

use crate::{
    common::error::AppError,
    config::AppState,
    models::{
        attribution::TrafficAttribution,
        tracking::{SessionGrant, VisitRequest},
    },
};

// ---
// 1. Payloads (O que o script da página envia)
// ---
#[derive(Debug, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct StartSessionPayload {
    pub guuid: Uuid,
    pub pool_id: Uuid,

    #[validate(length(min = 1, max = 2048, message = "A landing URL é obrigatória."))]
    pub landing_url: String,

    #[validate(length(max = 2048, message = "Referrer longo demais."))]
    pub http_referrer: Option<String>,

    #[validate(range(min = 0, max = 20000))]
    pub device_width: i32,
    #[validate(range(min = 0, max = 20000))]
    pub device_height: i32,

    #[validate(length(min = 1, max = 64))]
    pub device_type: String,
    #[validate(length(min = 1, max = 64))]
    pub device_browser: String,
    #[validate(length(max = 64))]
    pub device_platform: Option<String>,
}

#[derive(Debug, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct HeartbeatPayload {
    #[validate(length(min = 1, message = "O token é obrigatório."))]
    pub token: String,
    #[validate(length(max = 2048))]
    pub last_url: Option<String>,
}

#[derive(Debug, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct EndSessionPayload {
    #[validate(length(min = 1, message = "O token é obrigatório."))]
    pub token: String,
}

// ---
// 2. Resposta
// ---
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AssignedNumber {
    pub country_code: String,
    pub number: String,
    pub e164: String,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionGrantResponse {
    pub session_id: Uuid,
    pub session_uuid: Uuid,
    pub session_token: String,
    pub resumed: bool,
    pub assigned_number: AssignedNumber,
    pub targets: Vec<String>,
    pub attribution: TrafficAttribution,
}

impl From<SessionGrant> for SessionGrantResponse {
    fn from(grant: SessionGrant) -> Self {
        Self {
            session_id: grant.session.id,
            session_uuid: grant.session.uuid,
            assigned_number: AssignedNumber {
                e164: grant.phone_number.e164(),
                country_code: grant.phone_number.country_code,
                number: grant.phone_number.number,
            },
            session_token: grant.session.token,
            resumed: grant.resumed,
            targets: grant.targets,
            attribution: grant.attribution,
        }
    }
}

// ---
// 3. Handlers
// ---

// POST /api/sessions
pub async fn start_session(
    State(app_state): State<AppState>,
    Json(payload): Json<StartSessionPayload>,
) -> Result<impl IntoResponse, AppError> {
    payload.validate()?;

    let visit = VisitRequest {
        guuid: payload.guuid,
        pool_id: payload.pool_id,
        landing_url: payload.landing_url,
        http_referrer: payload.http_referrer,
        device_width: payload.device_width,
        device_height: payload.device_height,
        device_type: payload.device_type,
        device_browser: payload.device_browser,
        device_platform: payload.device_platform,
    };

    let grant = app_state
        .session_service
        .start_or_resume(&visit, Utc::now())
        .await?;

    let status = if grant.resumed { StatusCode::OK } else { StatusCode::CREATED };
    Ok((status, Json(SessionGrantResponse::from(grant))))
}

// POST /api/sessions/{id}/heartbeat
pub async fn heartbeat(
    State(app_state): State<AppState>,
    Path(session_id): Path<Uuid>,
    Json(payload): Json<HeartbeatPayload>,
) -> Result<impl IntoResponse, AppError> {
    payload.validate()?;

    app_state
        .session_service
        .heartbeat(session_id, &payload.token, payload.last_url.as_deref(), Utc::now())
        .await?;

    Ok(StatusCode::NO_CONTENT)
}

// POST /api/sessions/{id}/end
pub async fn end_session(
    State(app_state): State<AppState>,
    Path(session_id): Path<Uuid>,
    Json(payload): Json<EndSessionPayload>,
) -> Result<impl IntoResponse, AppError> {
    payload.validate()?;

    app_state
        .session_service
        .end(session_id, &payload.token, Utc::now())
        .await?;

    Ok(StatusCode::NO_CONTENT)
}

// GET /api/health
pub async fn health(State(app_state): State<AppState>) -> Result<impl IntoResponse, AppError> {
    app_state.store.health_check().await?;
    Ok(Json(json!({ "status": "OK", "store": app_state.store.backend_name() })))
}
