// src/db/tracking_repo.rs

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{Executor, PgConnection, PgPool, Postgres};
use uuid::Uuid;

use crate::{
    common::error::AppError,
    db::tracking_store::TrackingStore,
    models::{
        attribution::{AttributionFields, CompanyAttributionSettings},
        tracking::{NewTrackingSession, PhoneNumber, TrackingPool, TrackingSession},
    },
};

// Seleção e reserva numa única instrução.
// FOR UPDATE ... SKIP LOCKED: uma transação concorrente pula o número que já está
// sendo reservado e fica com o próximo do ranking, em vez de esperar ou repetir o mesmo.
const RESERVE_NUMBER_SQL: &str = r#"
    WITH candidate AS (
        SELECT pn.id
        FROM phone_numbers pn
        WHERE pn.keyword_tracking_pool_id = $1
          AND pn.company_id = $2
        ORDER BY
            (
                SELECT COUNT(*)
                FROM keyword_tracking_pool_sessions s
                WHERE s.keyword_tracking_pool_id = $1
                  AND s.phone_number_id = pn.id
                  AND s.ended_at IS NULL
            ) ASC,
            pn.last_assigned_at ASC NULLS FIRST,
            pn.id ASC
        LIMIT 1
        FOR UPDATE OF pn SKIP LOCKED
    )
    UPDATE phone_numbers p
    SET last_assigned_at = $3,
        total_assignments = p.total_assignments + 1,
        updated_at = $3
    FROM candidate
    WHERE p.id = candidate.id
    RETURNING p.*
"#;

const INSERT_SESSION_SQL: &str = r#"
    INSERT INTO keyword_tracking_pool_sessions (
        guuid, uuid, keyword_tracking_pool_id, phone_number_id,
        device_width, device_height, device_type, device_browser, device_platform,
        http_referrer, landing_url, last_url, token,
        active, last_activity_at, end_after, created_at, updated_at
    )
    VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $11, $12, TRUE, $13, $14, $13, $13)
    RETURNING *
"#;

#[derive(Clone)]
pub struct PgTrackingRepository {
    pool: PgPool,
}

impl PgTrackingRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn reserve_number<'e, E>(
        executor: E,
        pool: &TrackingPool,
        now: DateTime<Utc>,
    ) -> Result<Option<PhoneNumber>, AppError>
    where
        E: Executor<'e, Database = Postgres>,
    {
        let number = sqlx::query_as::<_, PhoneNumber>(RESERVE_NUMBER_SQL)
            .bind(pool.id)
            .bind(pool.company_id)
            .bind(now)
            .fetch_optional(executor)
            .await?;
        Ok(number)
    }

    /// O alocador, partilhado por `assign_number` e `create_session`.
    /// `Ok(None)`: pool sem números; `Err(AssignmentConflict)`: todos travados agora.
    async fn allocate_number(
        conn: &mut PgConnection,
        pool: &TrackingPool,
        now: DateTime<Utc>,
    ) -> Result<Option<PhoneNumber>, AppError> {
        if let Some(number) = Self::reserve_number(&mut *conn, pool, now).await? {
            return Ok(Some(number));
        }
        if Self::count_pool_numbers(&mut *conn, pool).await? == 0 {
            Ok(None)
        } else {
            Err(AppError::AssignmentConflict)
        }
    }

    async fn count_pool_numbers<'e, E>(executor: E, pool: &TrackingPool) -> Result<i64, AppError>
    where
        E: Executor<'e, Database = Postgres>,
    {
        let count = sqlx::query_scalar::<_, i64>(
            r#"
            SELECT COUNT(*) FROM phone_numbers
            WHERE keyword_tracking_pool_id = $1 AND company_id = $2
            "#,
        )
        .bind(pool.id)
        .bind(pool.company_id)
        .fetch_one(executor)
        .await?;
        Ok(count)
    }
}

#[async_trait]
impl TrackingStore for PgTrackingRepository {
    async fn find_pool(&self, pool_id: Uuid) -> Result<Option<TrackingPool>, AppError> {
        let pool = sqlx::query_as::<_, TrackingPool>(
            "SELECT * FROM keyword_tracking_pools WHERE id = $1",
        )
        .bind(pool_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(pool)
    }

    async fn attribution_fields(&self, company_id: Uuid) -> Result<AttributionFields, AppError> {
        let settings = sqlx::query_as::<_, CompanyAttributionSettings>(
            r#"
            SELECT source_param, medium_param, content_param,
                   campaign_param, keyword_param, source_referrer_when_empty
            FROM company_attribution_settings
            WHERE company_id = $1
            "#,
        )
        .bind(company_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(settings.map(AttributionFields::from).unwrap_or_default())
    }

    async fn find_phone_number(&self, number_id: Uuid) -> Result<Option<PhoneNumber>, AppError> {
        let number = sqlx::query_as::<_, PhoneNumber>("SELECT * FROM phone_numbers WHERE id = $1")
            .bind(number_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(number)
    }

    async fn assign_number(
        &self,
        pool: &TrackingPool,
        now: DateTime<Utc>,
    ) -> Result<Option<PhoneNumber>, AppError> {
        let mut conn = self.pool.acquire().await?;
        Self::allocate_number(&mut conn, pool, now).await
    }

    async fn find_session(&self, session_id: Uuid) -> Result<Option<TrackingSession>, AppError> {
        let session = sqlx::query_as::<_, TrackingSession>(
            "SELECT * FROM keyword_tracking_pool_sessions WHERE id = $1",
        )
        .bind(session_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(session)
    }

    async fn find_open_session(
        &self,
        guuid: Uuid,
        pool_id: Uuid,
    ) -> Result<Option<TrackingSession>, AppError> {
        let session = sqlx::query_as::<_, TrackingSession>(
            r#"
            SELECT * FROM keyword_tracking_pool_sessions
            WHERE guuid = $1 AND keyword_tracking_pool_id = $2 AND ended_at IS NULL
            "#,
        )
        .bind(guuid)
        .bind(pool_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(session)
    }

    async fn create_session(
        &self,
        new_session: NewTrackingSession,
        pool: &TrackingPool,
        superseded: Option<Uuid>,
    ) -> Result<(TrackingSession, PhoneNumber), AppError> {
        let now = new_session.now;

        // 1. Inicia a transação
        let mut tx = self.pool.begin().await?;

        // 2. Trava consultiva por (guuid, pool), liberada no commit/rollback
        sqlx::query("SELECT pg_advisory_xact_lock(hashtextextended($1, 0))")
            .bind(format!("{}:{}", new_session.guuid, pool.id))
            .execute(&mut *tx)
            .await?;

        // 3. Encerra a sessão vencida que está sendo substituída
        if let Some(old_id) = superseded {
            sqlx::query(
                r#"
                UPDATE keyword_tracking_pool_sessions
                SET ended_at = $2, active = FALSE, updated_at = $2
                WHERE id = $1 AND ended_at IS NULL
                "#,
            )
            .bind(old_id)
            .bind(now)
            .execute(&mut *tx)
            .await?;
        }

        // 4. Alguém do mesmo guuid chegou antes?
        let already_open = sqlx::query_scalar::<_, bool>(
            r#"
            SELECT EXISTS (
                SELECT 1 FROM keyword_tracking_pool_sessions
                WHERE guuid = $1 AND keyword_tracking_pool_id = $2 AND ended_at IS NULL
            )
            "#,
        )
        .bind(new_session.guuid)
        .bind(pool.id)
        .fetch_one(&mut *tx)
        .await?;
        if already_open {
            return Err(AppError::SessionConflict);
        }

        // 5. Reserva o número dentro da mesma transação
        let phone_number = Self::allocate_number(&mut tx, pool, now)
            .await?
            .ok_or(AppError::NoNumbersAvailable)?;

        // 6. Cria a sessão
        let session = sqlx::query_as::<_, TrackingSession>(INSERT_SESSION_SQL)
            .bind(new_session.guuid)
            .bind(new_session.uuid)
            .bind(pool.id)
            .bind(phone_number.id)
            .bind(new_session.device_width)
            .bind(new_session.device_height)
            .bind(&new_session.device_type)
            .bind(&new_session.device_browser)
            .bind(&new_session.device_platform)
            .bind(&new_session.http_referrer)
            .bind(&new_session.landing_url)
            .bind(&new_session.token)
            .bind(now)
            .bind(new_session.end_after)
            .fetch_one(&mut *tx)
            .await
            .map_err(|e| {
                if let sqlx::Error::Database(db_err) = &e {
                    if db_err.is_unique_violation() {
                        return AppError::SessionConflict;
                    }
                }
                e.into()
            })?;

        // 7. Commit
        tx.commit().await?;

        Ok((session, phone_number))
    }

    async fn touch_session(
        &self,
        session_id: Uuid,
        last_url: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<Option<TrackingSession>, AppError> {
        let session = sqlx::query_as::<_, TrackingSession>(
            r#"
            UPDATE keyword_tracking_pool_sessions
            SET last_activity_at = $2,
                last_url = COALESCE($3, last_url),
                active = TRUE,
                updated_at = $2
            WHERE id = $1 AND ended_at IS NULL
            RETURNING *
            "#,
        )
        .bind(session_id)
        .bind(now)
        .bind(last_url)
        .fetch_optional(&self.pool)
        .await?;
        Ok(session)
    }

    async fn end_session(
        &self,
        session_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<Option<TrackingSession>, AppError> {
        // ended_at só é gravado uma vez; uma segunda chamada apenas relê a linha.
        let ended = sqlx::query_as::<_, TrackingSession>(
            r#"
            UPDATE keyword_tracking_pool_sessions
            SET ended_at = $2, active = FALSE, updated_at = $2
            WHERE id = $1 AND ended_at IS NULL
            RETURNING *
            "#,
        )
        .bind(session_id)
        .bind(now)
        .fetch_optional(&self.pool)
        .await?;

        match ended {
            Some(session) => Ok(Some(session)),
            None => self.find_session(session_id).await,
        }
    }

    async fn sweepable_sessions(
        &self,
        idle_before: DateTime<Utc>,
        now: DateTime<Utc>,
        after: Option<Uuid>,
        limit: i64,
    ) -> Result<Vec<TrackingSession>, AppError> {
        let sessions = sqlx::query_as::<_, TrackingSession>(
            r#"
            SELECT * FROM keyword_tracking_pool_sessions
            WHERE ended_at IS NULL
              AND last_activity_at <= $1
              AND (active OR end_after <= $2)
              AND ($3::uuid IS NULL OR id > $3)
            ORDER BY id ASC
            LIMIT $4
            "#,
        )
        .bind(idle_before)
        .bind(now)
        .bind(after)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(sessions)
    }

    async fn hard_end_session(&self, session_id: Uuid, now: DateTime<Utc>) -> Result<bool, AppError> {
        let result = sqlx::query(
            r#"
            UPDATE keyword_tracking_pool_sessions
            SET ended_at = $2, active = FALSE, updated_at = $2
            WHERE id = $1 AND ended_at IS NULL AND end_after <= $2
            "#,
        )
        .bind(session_id)
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn deactivate_session(
        &self,
        session_id: Uuid,
        idle_before: DateTime<Utc>,
    ) -> Result<bool, AppError> {
        // Reconfere a ociosidade: um heartbeat pode ter chegado depois da leitura do lote.
        let result = sqlx::query(
            r#"
            UPDATE keyword_tracking_pool_sessions
            SET active = FALSE
            WHERE id = $1 AND ended_at IS NULL AND active AND last_activity_at <= $2
            "#,
        )
        .bind(session_id)
        .bind(idle_before)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn health_check(&self) -> Result<(), AppError> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    fn backend_name(&self) -> &'static str {
        "postgres"
    }
}
