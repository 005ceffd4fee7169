// src/db/tracking_store.rs

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::{
    common::error::AppError,
    models::{
        attribution::AttributionFields,
        tracking::{NewTrackingSession, PhoneNumber, TrackingPool, TrackingSession},
    },
};

/// As primitivas atômicas de que os serviços precisam.
///
/// Os workers podem ser processos separados, então toda coordenação fica no store:
/// cada método é uma operação atômica, nunca um ler-depois-escrever na memória do serviço.
#[async_trait]
pub trait TrackingStore: Send + Sync {
    async fn find_pool(&self, pool_id: Uuid) -> Result<Option<TrackingPool>, AppError>;

    /// Listas de parâmetros da empresa; sem configuração, os padrões UTM.
    async fn attribution_fields(&self, company_id: Uuid) -> Result<AttributionFields, AppError>;

    async fn find_phone_number(&self, number_id: Uuid) -> Result<Option<PhoneNumber>, AppError>;

    /// Escolhe e reserva (last_assigned_at + contador) o número menos carregado do pool.
    /// Ranking: sessões abertas asc, last_assigned_at asc (nunca usado primeiro), id asc.
    ///
    /// `Ok(None)` quando o pool não tem números;
    /// `Err(AssignmentConflict)` quando todos os candidatos estão reservados por outra transação.
    async fn assign_number(
        &self,
        pool: &TrackingPool,
        now: DateTime<Utc>,
    ) -> Result<Option<PhoneNumber>, AppError>;

    async fn find_session(&self, session_id: Uuid) -> Result<Option<TrackingSession>, AppError>;

    /// A sessão aberta (ended_at nulo) do navegador neste pool, se houver.
    async fn find_open_session(
        &self,
        guuid: Uuid,
        pool_id: Uuid,
    ) -> Result<Option<TrackingSession>, AppError>;

    /// Verifica-e-cria sob trava de (guuid, pool): encerra `superseded` (se aberta),
    /// reserva um número e insere a sessão, tudo na mesma transação.
    ///
    /// `Err(SessionConflict)` se outra sessão aberta do mesmo guuid surgiu no meio tempo.
    async fn create_session(
        &self,
        new_session: NewTrackingSession,
        pool: &TrackingPool,
        superseded: Option<Uuid>,
    ) -> Result<(TrackingSession, PhoneNumber), AppError>;

    /// Atualiza last_activity_at (e last_url) de uma sessão ainda aberta, reativando-a.
    /// `Ok(None)` se a sessão já foi encerrada.
    async fn touch_session(
        &self,
        session_id: Uuid,
        last_url: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<Option<TrackingSession>, AppError>;

    /// Encerra a sessão se ainda aberta. Devolve a linha atual (encerrada agora ou antes).
    async fn end_session(
        &self,
        session_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<Option<TrackingSession>, AppError>;

    /// Candidatos da varredura: abertos, ociosos desde `idle_before` e ainda ativos ou vencidos.
    /// Paginação por id (`after`), no máximo `limit` linhas.
    async fn sweepable_sessions(
        &self,
        idle_before: DateTime<Utc>,
        now: DateTime<Utc>,
        after: Option<Uuid>,
        limit: i64,
    ) -> Result<Vec<TrackingSession>, AppError>;

    /// Encerramento definitivo (end_after vencido). `false` se a condição já não vale.
    async fn hard_end_session(&self, session_id: Uuid, now: DateTime<Utc>) -> Result<bool, AppError>;

    /// Desativa sem encerrar, desde que continue ociosa. `false` se a condição já não vale.
    async fn deactivate_session(
        &self,
        session_id: Uuid,
        idle_before: DateTime<Utc>,
    ) -> Result<bool, AppError>;

    async fn health_check(&self) -> Result<(), AppError>;

    fn backend_name(&self) -> &'static str;
}
