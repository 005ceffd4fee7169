// src/db/memory_store.rs

//! Store em memória com a mesma semântica do repositório Postgres.
//!
//! Tudo fica atrás de um único `RwLock`: cada método do trait roda inteiro sob a trava,
//! o que torna cada operação atômica dentro do processo. Não é durável e não coordena
//! processos diferentes; serve para desenvolvimento local e para os testes.

use std::{collections::HashMap, sync::Arc};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::types::Json;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::{
    common::error::AppError,
    db::tracking_store::TrackingStore,
    models::{
        attribution::AttributionFields,
        tracking::{NewTrackingSession, PhoneNumber, TrackingPool, TrackingSession},
    },
};

#[derive(Debug, Default)]
struct MemoryState {
    pools: HashMap<Uuid, TrackingPool>,
    numbers: HashMap<Uuid, PhoneNumber>,
    sessions: HashMap<Uuid, TrackingSession>,
    attribution: HashMap<Uuid, AttributionFields>,
}

impl MemoryState {
    fn open_sessions_for(&self, pool_id: Uuid, number_id: Uuid) -> usize {
        self.sessions
            .values()
            .filter(|s| {
                s.keyword_tracking_pool_id == pool_id
                    && s.phone_number_id == number_id
                    && s.ended_at.is_none()
            })
            .count()
    }

    fn pool_numbers<'a>(&'a self, pool: &'a TrackingPool) -> impl Iterator<Item = &'a PhoneNumber> + 'a {
        self.numbers
            .values()
            .filter(move |n| n.keyword_tracking_pool_id == Some(pool.id) && n.company_id == pool.company_id)
    }

    // O alocador: mesmo ranking da query Postgres; None < Some reproduz o NULLS FIRST.
    // Sem travas de linha aqui, então nunca há AssignmentConflict.
    fn allocate(&mut self, pool: &TrackingPool, now: DateTime<Utc>) -> Option<PhoneNumber> {
        let number_id = self
            .pool_numbers(pool)
            .min_by_key(|n| (self.open_sessions_for(pool.id, n.id), n.last_assigned_at, n.id))
            .map(|n| n.id)?;

        let number = self.numbers.get_mut(&number_id)?;
        number.last_assigned_at = Some(now);
        number.total_assignments += 1;
        number.updated_at = now;
        Some(number.clone())
    }

    fn open_session(&self, guuid: Uuid, pool_id: Uuid) -> Option<&TrackingSession> {
        self.sessions
            .values()
            .find(|s| s.guuid == guuid && s.keyword_tracking_pool_id == pool_id && s.ended_at.is_none())
    }

    fn end(&mut self, session_id: Uuid, now: DateTime<Utc>) -> Option<TrackingSession> {
        let session = self.sessions.get_mut(&session_id)?;
        if session.ended_at.is_none() {
            session.ended_at = Some(now);
            session.active = false;
            session.updated_at = now;
        }
        Some(session.clone())
    }
}

#[derive(Clone, Default)]
pub struct InMemoryTrackingStore {
    state: Arc<RwLock<MemoryState>>,
}

impl InMemoryTrackingStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn create_pool(&self, company_id: Uuid, name: &str, swap_rules: Value) -> TrackingPool {
        let now = Utc::now();
        let pool = TrackingPool {
            id: Uuid::new_v4(),
            company_id,
            name: name.to_string(),
            swap_rules: Json(swap_rules),
            disabled: false,
            created_at: now,
            updated_at: now,
        };
        self.state.write().await.pools.insert(pool.id, pool.clone());
        pool
    }

    pub async fn add_phone_number(
        &self,
        pool: &TrackingPool,
        country_code: &str,
        number: &str,
        last_assigned_at: Option<DateTime<Utc>>,
    ) -> PhoneNumber {
        let now = Utc::now();
        let phone_number = PhoneNumber {
            id: Uuid::new_v4(),
            company_id: pool.company_id,
            keyword_tracking_pool_id: Some(pool.id),
            country_code: country_code.to_string(),
            number: number.to_string(),
            last_assigned_at,
            total_assignments: 0,
            created_at: now,
            updated_at: now,
        };
        self.state
            .write()
            .await
            .numbers
            .insert(phone_number.id, phone_number.clone());
        phone_number
    }

    #[cfg(test)]
    pub async fn set_pool_disabled(&self, pool_id: Uuid, disabled: bool) {
        if let Some(pool) = self.state.write().await.pools.get_mut(&pool_id) {
            pool.disabled = disabled;
        }
    }

    #[cfg(test)]
    pub async fn set_attribution_fields(&self, company_id: Uuid, fields: AttributionFields) {
        self.state.write().await.attribution.insert(company_id, fields);
    }

    #[cfg(test)]
    pub async fn insert_session(&self, session: TrackingSession) {
        self.state.write().await.sessions.insert(session.id, session);
    }

    #[cfg(test)]
    pub async fn insert_phone_number(&self, number: PhoneNumber) {
        self.state.write().await.numbers.insert(number.id, number);
    }
}

#[async_trait]
impl TrackingStore for InMemoryTrackingStore {
    async fn find_pool(&self, pool_id: Uuid) -> Result<Option<TrackingPool>, AppError> {
        Ok(self.state.read().await.pools.get(&pool_id).cloned())
    }

    async fn attribution_fields(&self, company_id: Uuid) -> Result<AttributionFields, AppError> {
        Ok(self
            .state
            .read()
            .await
            .attribution
            .get(&company_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn find_phone_number(&self, number_id: Uuid) -> Result<Option<PhoneNumber>, AppError> {
        Ok(self.state.read().await.numbers.get(&number_id).cloned())
    }

    async fn assign_number(
        &self,
        pool: &TrackingPool,
        now: DateTime<Utc>,
    ) -> Result<Option<PhoneNumber>, AppError> {
        Ok(self.state.write().await.allocate(pool, now))
    }

    async fn find_session(&self, session_id: Uuid) -> Result<Option<TrackingSession>, AppError> {
        Ok(self.state.read().await.sessions.get(&session_id).cloned())
    }

    async fn find_open_session(
        &self,
        guuid: Uuid,
        pool_id: Uuid,
    ) -> Result<Option<TrackingSession>, AppError> {
        Ok(self.state.read().await.open_session(guuid, pool_id).cloned())
    }

    async fn create_session(
        &self,
        new_session: NewTrackingSession,
        pool: &TrackingPool,
        superseded: Option<Uuid>,
    ) -> Result<(TrackingSession, PhoneNumber), AppError> {
        let mut state = self.state.write().await;
        let now = new_session.now;

        // Tudo é validado antes de mutar: sem transação, não há rollback.
        if let Some(open) = state.open_session(new_session.guuid, pool.id) {
            if Some(open.id) != superseded {
                return Err(AppError::SessionConflict);
            }
        }
        if state.pool_numbers(pool).next().is_none() {
            return Err(AppError::NoNumbersAvailable);
        }

        if let Some(old_id) = superseded {
            state.end(old_id, now);
        }
        let phone_number = state
            .allocate(pool, now)
            .ok_or(AppError::NoNumbersAvailable)?;

        let session = TrackingSession {
            id: Uuid::new_v4(),
            guuid: new_session.guuid,
            uuid: new_session.uuid,
            keyword_tracking_pool_id: pool.id,
            phone_number_id: phone_number.id,
            contact_id: None,
            device_width: new_session.device_width,
            device_height: new_session.device_height,
            device_type: new_session.device_type,
            device_browser: new_session.device_browser,
            device_platform: new_session.device_platform,
            http_referrer: new_session.http_referrer,
            last_url: new_session.landing_url.clone(),
            landing_url: new_session.landing_url,
            token: new_session.token,
            active: true,
            last_activity_at: now,
            end_after: new_session.end_after,
            ended_at: None,
            created_at: now,
            updated_at: now,
        };
        state.sessions.insert(session.id, session.clone());

        Ok((session, phone_number))
    }

    async fn touch_session(
        &self,
        session_id: Uuid,
        last_url: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<Option<TrackingSession>, AppError> {
        let mut state = self.state.write().await;
        let Some(session) = state.sessions.get_mut(&session_id) else {
            return Ok(None);
        };
        if session.ended_at.is_some() {
            return Ok(None);
        }
        session.active = true;
        session.last_activity_at = now;
        session.updated_at = now;
        if let Some(url) = last_url {
            session.last_url = url.to_string();
        }
        Ok(Some(session.clone()))
    }

    async fn end_session(
        &self,
        session_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<Option<TrackingSession>, AppError> {
        Ok(self.state.write().await.end(session_id, now))
    }

    async fn sweepable_sessions(
        &self,
        idle_before: DateTime<Utc>,
        now: DateTime<Utc>,
        after: Option<Uuid>,
        limit: i64,
    ) -> Result<Vec<TrackingSession>, AppError> {
        let state = self.state.read().await;
        let mut rows: Vec<TrackingSession> = state
            .sessions
            .values()
            .filter(|s| {
                s.ended_at.is_none()
                    && s.last_activity_at <= idle_before
                    && (s.active || s.end_after <= now)
                    && after.is_none_or(|cursor| s.id > cursor)
            })
            .cloned()
            .collect();
        rows.sort_by_key(|s| s.id);
        rows.truncate(usize::try_from(limit).unwrap_or(0));
        Ok(rows)
    }

    async fn hard_end_session(&self, session_id: Uuid, now: DateTime<Utc>) -> Result<bool, AppError> {
        let mut state = self.state.write().await;
        match state.sessions.get_mut(&session_id) {
            Some(session) if session.ended_at.is_none() && session.end_after <= now => {
                session.ended_at = Some(now);
                session.active = false;
                session.updated_at = now;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn deactivate_session(
        &self,
        session_id: Uuid,
        idle_before: DateTime<Utc>,
    ) -> Result<bool, AppError> {
        let mut state = self.state.write().await;
        match state.sessions.get_mut(&session_id) {
            Some(session)
                if session.ended_at.is_none()
                    && session.active
                    && session.last_activity_at <= idle_before =>
            {
                session.active = false;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn health_check(&self) -> Result<(), AppError> {
        Ok(())
    }

    fn backend_name(&self) -> &'static str {
        "memory"
    }
}
