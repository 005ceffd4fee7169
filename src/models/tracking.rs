// src/models/tracking.rs

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::{types::Json, FromRow};
use uuid::Uuid;

use crate::models::{attribution::TrafficAttribution, swap_rules::SwapRuleDocument};

// ---
// 1. TrackingPool (O "Pool de Números")
// ---
// Conjunto de números da empresa que partilham as mesmas regras de troca.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
#[serde(rename_all = "camelCase")]
pub struct TrackingPool {
    pub id: Uuid,
    pub company_id: Uuid,
    pub name: String,
    pub swap_rules: Json<Value>,
    pub disabled: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl TrackingPool {
    /// Decodifica o documento de regras. Um documento que não decodifica
    /// é tratado como "nenhuma visita passa".
    pub fn swap_rules_document(&self) -> Option<SwapRuleDocument> {
        match serde_json::from_value(self.swap_rules.0.clone()) {
            Ok(document) => Some(document),
            Err(e) => {
                tracing::warn!(pool_id = %self.id, "Documento de regras ilegível: {}", e);
                None
            }
        }
    }
}

// ---
// 2. PhoneNumber (membro do pool)
// ---
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
#[serde(rename_all = "camelCase")]
pub struct PhoneNumber {
    pub id: Uuid,
    pub company_id: Uuid,
    // Números fora de pool existem; só o alocador os ignora
    pub keyword_tracking_pool_id: Option<Uuid>,
    pub country_code: String,
    pub number: String,
    pub last_assigned_at: Option<DateTime<Utc>>,
    pub total_assignments: i32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl PhoneNumber {
    pub fn e164(&self) -> String {
        format!("+{}{}", self.country_code, self.number)
    }
}

// ---
// 3. TrackingSession (A "Sessão do Visitante")
// ---
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
#[serde(rename_all = "camelCase")]
pub struct TrackingSession {
    pub id: Uuid,
    // Identificador estável do navegador (persistido no cliente)
    pub guuid: Uuid,
    // Identificador desta sessão
    pub uuid: Uuid,
    pub keyword_tracking_pool_id: Uuid,
    pub phone_number_id: Uuid,
    pub contact_id: Option<Uuid>,
    pub device_width: i32,
    pub device_height: i32,
    pub device_type: String,
    pub device_browser: String,
    pub device_platform: Option<String>,
    pub http_referrer: Option<String>,
    pub landing_url: String,
    pub last_url: String,
    #[serde(skip_serializing)]
    pub token: String,
    pub active: bool,
    pub last_activity_at: DateTime<Utc>,
    pub end_after: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Estado derivado de uma sessão. Nada disto é gravado: vem dos timestamps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SessionState {
    Open,
    Idle,
    Ended,
}

impl TrackingSession {
    pub fn state(&self, now: DateTime<Utc>, idle_timeout: Duration) -> SessionState {
        if self.ended_at.is_some() {
            SessionState::Ended
        } else if now - self.last_activity_at >= idle_timeout {
            SessionState::Idle
        } else {
            SessionState::Open
        }
    }

    pub fn is_ended(&self) -> bool {
        self.ended_at.is_some()
    }

    /// Passou do prazo natural (end_after).
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.end_after <= now
    }
}

/// Dados de uma visita que chega pedindo número.
#[derive(Debug, Clone)]
pub struct VisitRequest {
    pub guuid: Uuid,
    pub pool_id: Uuid,
    pub landing_url: String,
    pub http_referrer: Option<String>,
    pub device_width: i32,
    pub device_height: i32,
    pub device_type: String,
    pub device_browser: String,
    pub device_platform: Option<String>,
}

/// Linha a inserir; o número é escolhido pelo store na mesma transação.
#[derive(Debug, Clone)]
pub struct NewTrackingSession {
    pub guuid: Uuid,
    pub uuid: Uuid,
    pub device_width: i32,
    pub device_height: i32,
    pub device_type: String,
    pub device_browser: String,
    pub device_platform: Option<String>,
    pub http_referrer: Option<String>,
    pub landing_url: String,
    pub token: String,
    pub now: DateTime<Utc>,
    pub end_after: DateTime<Utc>,
}

/// O que o serviço devolve a quem pediu um número.
#[derive(Debug, Clone)]
pub struct SessionGrant {
    pub session: TrackingSession,
    pub phone_number: PhoneNumber,
    pub targets: Vec<String>,
    pub attribution: TrafficAttribution,
    pub resumed: bool,
}

/// Resultado de uma passada da varredura.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub hard_ended: usize,
    pub deactivated: usize,
    pub failed: usize,
}

impl SweepReport {
    pub fn is_empty(&self) -> bool {
        self.hard_ended == 0 && self.deactivated == 0 && self.failed == 0
    }
}
