// src/db/flaky_store.rs

// Store de teste: delega ao InMemoryTrackingStore e injeta falhas sob demanda.

use std::{
    collections::HashSet,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::{
    common::error::AppError,
    db::{InMemoryTrackingStore, TrackingStore},
    models::{
        attribution::AttributionFields,
        tracking::{NewTrackingSession, PhoneNumber, TrackingPool, TrackingSession},
    },
};

#[derive(Clone, Default)]
pub struct FlakyTrackingStore {
    pub inner: InMemoryTrackingStore,
    // Sessões cuja atualização da varredura falha
    broken_sessions: HashSet<Uuid>,
    // Quantas chamadas de create_session ainda devolvem AssignmentConflict
    pending_conflicts: Arc<AtomicUsize>,
    create_calls: Arc<AtomicUsize>,
}

impl FlakyTrackingStore {
    pub fn new(inner: InMemoryTrackingStore) -> Self {
        Self { inner, ..Self::default() }
    }

    pub fn with_broken_session(mut self, session_id: Uuid) -> Self {
        self.broken_sessions.insert(session_id);
        self
    }

    pub fn with_assignment_conflicts(self, count: usize) -> Self {
        self.pending_conflicts.store(count, Ordering::SeqCst);
        self
    }

    pub fn create_calls(&self) -> usize {
        self.create_calls.load(Ordering::SeqCst)
    }

    fn check_session(&self, session_id: Uuid) -> Result<(), AppError> {
        if self.broken_sessions.contains(&session_id) {
            return Err(AppError::DatabaseError(sqlx::Error::PoolTimedOut));
        }
        Ok(())
    }
}

#[async_trait]
impl TrackingStore for FlakyTrackingStore {
    async fn find_pool(&self, pool_id: Uuid) -> Result<Option<TrackingPool>, AppError> {
        self.inner.find_pool(pool_id).await
    }

    async fn attribution_fields(&self, company_id: Uuid) -> Result<AttributionFields, AppError> {
        self.inner.attribution_fields(company_id).await
    }

    async fn find_phone_number(&self, number_id: Uuid) -> Result<Option<PhoneNumber>, AppError> {
        self.inner.find_phone_number(number_id).await
    }

    async fn assign_number(
        &self,
        pool: &TrackingPool,
        now: DateTime<Utc>,
    ) -> Result<Option<PhoneNumber>, AppError> {
        self.inner.assign_number(pool, now).await
    }

    async fn find_session(&self, session_id: Uuid) -> Result<Option<TrackingSession>, AppError> {
        self.inner.find_session(session_id).await
    }

    async fn find_open_session(
        &self,
        guuid: Uuid,
        pool_id: Uuid,
    ) -> Result<Option<TrackingSession>, AppError> {
        self.inner.find_open_session(guuid, pool_id).await
    }

    async fn create_session(
        &self,
        new_session: NewTrackingSession,
        pool: &TrackingPool,
        superseded: Option<Uuid>,
    ) -> Result<(TrackingSession, PhoneNumber), AppError> {
        self.create_calls.fetch_add(1, Ordering::SeqCst);
        let conflicted = self
            .pending_conflicts
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if conflicted {
            return Err(AppError::AssignmentConflict);
        }
        self.inner.create_session(new_session, pool, superseded).await
    }

    async fn touch_session(
        &self,
        session_id: Uuid,
        last_url: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<Option<TrackingSession>, AppError> {
        self.inner.touch_session(session_id, last_url, now).await
    }

    async fn end_session(
        &self,
        session_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<Option<TrackingSession>, AppError> {
        self.inner.end_session(session_id, now).await
    }

    async fn sweepable_sessions(
        &self,
        idle_before: DateTime<Utc>,
        now: DateTime<Utc>,
        after: Option<Uuid>,
        limit: i64,
    ) -> Result<Vec<TrackingSession>, AppError> {
        self.inner.sweepable_sessions(idle_before, now, after, limit).await
    }

    async fn hard_end_session(&self, session_id: Uuid, now: DateTime<Utc>) -> Result<bool, AppError> {
        self.check_session(session_id)?;
        self.inner.hard_end_session(session_id, now).await
    }

    async fn deactivate_session(
        &self,
        session_id: Uuid,
        idle_before: DateTime<Utc>,
    ) -> Result<bool, AppError> {
        self.check_session(session_id)?;
        self.inner.deactivate_session(session_id, idle_before).await
    }

    async fn health_check(&self) -> Result<(), AppError> {
        self.inner.health_check().await
    }

    fn backend_name(&self) -> &'static str {
        "flaky"
    }
}
