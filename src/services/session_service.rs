// src/services/session_service.rs

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use uuid::Uuid;

use crate::{
    common::error::AppError,
    db::TrackingStore,
    models::{
        attribution::VisitContext,
        tracking::{NewTrackingSession, SessionGrant, TrackingSession, VisitRequest},
    },
    services::{rule_evaluator, traffic_classifier},
};

#[derive(Clone)]
pub struct SessionService {
    store: Arc<dyn TrackingStore>,
    session_ttl: Duration,
}

impl SessionService {
    pub fn new(store: Arc<dyn TrackingStore>, session_ttl: Duration) -> Self {
        Self { store, session_ttl }
    }

    /// LÓGICA DE NEGÓCIO: devolve a sessão aberta do navegador (mesmo número) ou,
    /// se não houver uma válida, avalia as regras, reserva um número e cria a sessão.
    ///
    /// Conflitos de concorrência são repetidos uma única vez.
    pub async fn start_or_resume(
        &self,
        visit: &VisitRequest,
        now: DateTime<Utc>,
    ) -> Result<SessionGrant, AppError> {
        match self.try_start_or_resume(visit, now).await {
            Err(e) if e.is_retryable() => {
                tracing::debug!(guuid = %visit.guuid, "Conflito ao abrir sessão, repetindo: {}", e);
                self.try_start_or_resume(visit, now)
                    .await
                    .map_err(|e| match e {
                        AppError::AssignmentConflict => AppError::NoNumbersAvailable,
                        other => other,
                    })
            }
            result => result,
        }
    }

    async fn try_start_or_resume(
        &self,
        visit: &VisitRequest,
        now: DateTime<Utc>,
    ) -> Result<SessionGrant, AppError> {
        // 1. O pool existe e está ativo?
        let pool = self
            .store
            .find_pool(visit.pool_id)
            .await?
            .ok_or(AppError::PoolNotFound)?;
        if pool.disabled {
            return Err(AppError::PoolDisabled);
        }

        let fields = self.store.attribution_fields(pool.company_id).await?;
        let referrer = visit.http_referrer.as_deref().unwrap_or_default();
        let attribution = traffic_classifier::classify(&visit.landing_url, referrer, &fields);
        let document = pool.swap_rules_document();

        // 2. Afinidade: o visitante já tem sessão aberta neste pool?
        let mut superseded = None;
        if let Some(open) = self.store.find_open_session(visit.guuid, pool.id).await? {
            if !open.is_expired(now) {
                if let Some(session) = self
                    .store
                    .touch_session(open.id, Some(&visit.landing_url), now)
                    .await?
                {
                    let phone_number = self
                        .store
                        .find_phone_number(session.phone_number_id)
                        .await?
                        .ok_or_else(|| {
                            anyhow::anyhow!("sessão {} aponta para número inexistente", session.id)
                        })?;
                    return Ok(SessionGrant {
                        session,
                        phone_number,
                        targets: document.map(|d| d.targets).unwrap_or_default(),
                        attribution,
                        resumed: true,
                    });
                }
                // Encerrada entre a leitura e o toque: segue para criar outra.
            } else {
                superseded = Some(open.id);
            }
        }

        // 3. As regras de troca liberam esta visita?
        let context = VisitContext {
            device_type: visit.device_type.clone(),
            browser_type: visit.device_browser.clone(),
            http_referrer: referrer.to_string(),
            landing_url: visit.landing_url.clone(),
            medium_fields: fields.medium.clone(),
        };
        let targets = document
            .as_ref()
            .and_then(|d| rule_evaluator::swap_targets(d, &context))
            .map(<[String]>::to_vec)
            .ok_or(AppError::NotEligible)?;

        // 4. Reserva o número e cria a sessão (atômico no store)
        let (session, phone_number) = self
            .store
            .create_session(self.new_session(visit, now)?, &pool, superseded)
            .await?;

        tracing::info!(
            session_id = %session.id,
            pool_id = %pool.id,
            number = %phone_number.e164(),
            "Sessão aberta"
        );

        Ok(SessionGrant {
            session,
            phone_number,
            targets,
            attribution,
            resumed: false,
        })
    }

    fn new_session(
        &self,
        visit: &VisitRequest,
        now: DateTime<Utc>,
    ) -> Result<NewTrackingSession, AppError> {
        let end_after = now
            .checked_add_signed(self.session_ttl)
            .ok_or_else(|| anyhow::anyhow!("TTL de sessão estoura o calendário: {}", self.session_ttl))?;

        Ok(NewTrackingSession {
            guuid: visit.guuid,
            uuid: Uuid::new_v4(),
            device_width: visit.device_width,
            device_height: visit.device_height,
            device_type: visit.device_type.clone(),
            device_browser: visit.device_browser.clone(),
            device_platform: visit.device_platform.clone(),
            http_referrer: visit.http_referrer.clone().filter(|r| !r.trim().is_empty()),
            landing_url: visit.landing_url.clone(),
            token: generate_token(),
            now,
            end_after,
        })
    }

    /// Batimento do navegador: valida o token e renova a atividade.
    pub async fn heartbeat(
        &self,
        session_id: Uuid,
        token: &str,
        last_url: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<TrackingSession, AppError> {
        let session = self.authorized_session(session_id, token).await?;
        if session.is_ended() {
            return Err(AppError::SessionEnded);
        }

        self.store
            .touch_session(session.id, last_url, now)
            .await?
            .ok_or(AppError::SessionEnded)
    }

    /// Encerramento explícito. Idempotente: encerrar de novo devolve o mesmo estado final.
    pub async fn end(
        &self,
        session_id: Uuid,
        token: &str,
        now: DateTime<Utc>,
    ) -> Result<TrackingSession, AppError> {
        let session = self.authorized_session(session_id, token).await?;
        if session.is_ended() {
            return Ok(session);
        }

        let ended = self
            .store
            .end_session(session.id, now)
            .await?
            .ok_or(AppError::SessionNotFound)?;
        tracing::info!(session_id = %ended.id, "Sessão encerrada");
        Ok(ended)
    }

    async fn authorized_session(
        &self,
        session_id: Uuid,
        token: &str,
    ) -> Result<TrackingSession, AppError> {
        let session = self
            .store
            .find_session(session_id)
            .await?
            .ok_or(AppError::SessionNotFound)?;

        if !tokens_match(&session.token, token) {
            tracing::warn!(session_id = %session_id, "Token de sessão recusado");
            return Err(AppError::InvalidSessionToken);
        }
        Ok(session)
    }
}

// Segredo opaco da sessão: 64 caracteres hex de duas v4.
fn generate_token() -> String {
    format!("{}{}", Uuid::new_v4().simple(), Uuid::new_v4().simple())
}

// Comparação sem saída antecipada, para não vazar o prefixo correto pelo tempo.
fn tokens_match(expected: &str, given: &str) -> bool {
    expected.len() == given.len()
        && expected
            .bytes()
            .zip(given.bytes())
            .fold(0u8, |acc, (a, b)| acc | (a ^ b))
            == 0
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        db::{flaky_store::FlakyTrackingStore, InMemoryTrackingStore},
        models::{attribution::AttributionFields, tracking::TrackingPool},
    };
    use chrono::TimeZone;
    use serde_json::json;
    use std::collections::HashSet;

    fn t(minute: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 5, 4, 15, minute, 0).unwrap()
    }

    fn visit(guuid: Uuid, pool_id: Uuid, landing_url: &str) -> VisitRequest {
        VisitRequest {
            guuid,
            pool_id,
            landing_url: landing_url.to_string(),
            http_referrer: Some("https://www.google.com/".into()),
            device_width: 1440,
            device_height: 900,
            device_type: "DESKTOP".into(),
            device_browser: "FIREFOX".into(),
            device_platform: Some("Linux".into()),
        }
    }

    async fn fixture(numbers: usize, rules: serde_json::Value) -> (InMemoryTrackingStore, SessionService, TrackingPool) {
        let store = InMemoryTrackingStore::new();
        let pool = store.create_pool(Uuid::new_v4(), "Landing pages", rules).await;
        for i in 0..numbers {
            store
                .add_phone_number(&pool, "1", &format!("80055500{:02}", i), None)
                .await;
        }
        let service = SessionService::new(Arc::new(store.clone()), Duration::days(30));
        (store, service, pool)
    }

    fn allow_all() -> serde_json::Value {
        json!({
            "targets": ["18005551234"],
            "device_types": ["ALL"],
            "browser_types": ["ALL"],
            "inclusion_rules": [{ "rules": [{ "type": "ALL" }] }],
            "exclusion_rules": []
        })
    }

    #[tokio::test]
    async fn same_browser_gets_same_session_and_number() {
        let (_, service, pool) = fixture(3, allow_all()).await;
        let guuid = Uuid::new_v4();

        let first = service
            .start_or_resume(&visit(guuid, pool.id, "https://example.com/"), t(0))
            .await
            .expect("primeira visita");
        let second = service
            .start_or_resume(&visit(guuid, pool.id, "https://example.com/contact"), t(3))
            .await
            .expect("retorno");

        assert!(!first.resumed);
        assert!(second.resumed);
        assert_eq!(first.session.id, second.session.id);
        assert_eq!(first.phone_number.id, second.phone_number.id);
        assert_eq!(second.session.last_url, "https://example.com/contact");
        assert_eq!(second.session.last_activity_at, t(3));
        assert_eq!(first.targets, vec!["18005551234"]);
        assert!(first.attribution.is_organic);
    }

    #[tokio::test]
    async fn expired_session_is_ended_and_replaced() {
        let (store, _, pool) = fixture(2, allow_all()).await;
        let service = SessionService::new(Arc::new(store.clone()), Duration::minutes(10));
        let guuid = Uuid::new_v4();

        let first = service
            .start_or_resume(&visit(guuid, pool.id, "https://example.com/"), t(0))
            .await
            .unwrap();
        let second = service
            .start_or_resume(&visit(guuid, pool.id, "https://example.com/"), t(10))
            .await
            .unwrap();

        assert!(!second.resumed);
        assert_ne!(first.session.id, second.session.id);
        let old = store.find_session(first.session.id).await.unwrap().unwrap();
        assert_eq!(old.ended_at, Some(t(10)));
        assert!(!old.active);
    }

    #[tokio::test]
    async fn distinct_visitors_spread_across_pool() {
        let (_, service, pool) = fixture(3, allow_all()).await;

        let mut numbers = HashSet::new();
        for minute in 0..3 {
            let grant = service
                .start_or_resume(&visit(Uuid::new_v4(), pool.id, "https://example.com/"), t(minute))
                .await
                .unwrap();
            numbers.insert(grant.phone_number.id);
        }
        assert_eq!(numbers.len(), 3);
    }

    #[tokio::test]
    async fn concurrent_visitors_never_share_while_free_numbers_exist() {
        let (_, service, pool) = fixture(8, allow_all()).await;

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let service = service.clone();
                let request = visit(Uuid::new_v4(), pool.id, "https://example.com/");
                tokio::spawn(async move { service.start_or_resume(&request, t(0)).await })
            })
            .collect();

        let mut numbers = HashSet::new();
        for handle in handles {
            let grant = handle.await.expect("task").expect("grant");
            numbers.insert(grant.phone_number.id);
        }
        assert_eq!(numbers.len(), 8);
    }

    #[tokio::test]
    async fn concurrent_requests_from_one_browser_share_one_session() {
        let (_, service, pool) = fixture(4, allow_all()).await;
        let guuid = Uuid::new_v4();

        let handles: Vec<_> = (0..6)
            .map(|_| {
                let service = service.clone();
                let request = visit(guuid, pool.id, "https://example.com/");
                tokio::spawn(async move { service.start_or_resume(&request, t(0)).await })
            })
            .collect();

        let mut sessions = HashSet::new();
        let mut numbers = HashSet::new();
        for handle in handles {
            let grant = handle.await.expect("task").expect("grant");
            sessions.insert(grant.session.id);
            numbers.insert(grant.phone_number.id);
        }
        assert_eq!(sessions.len(), 1);
        assert_eq!(numbers.len(), 1);
    }

    #[tokio::test]
    async fn visit_failing_rules_is_not_eligible() {
        let rules = json!({
            "device_types": ["ALL"],
            "browser_types": ["ALL"],
            "inclusion_rules": [{ "rules": [{
                "type": "LANDING_PARAM", "field": "utm_source", "operator": "EQUALS", "inputs": ["google"]
            }]}]
        });
        let (_, service, pool) = fixture(1, rules).await;

        let err = service
            .start_or_resume(&visit(Uuid::new_v4(), pool.id, "http://x.com/?utm_source=bing"), t(0))
            .await
            .expect_err("não elegível");
        assert!(matches!(err, AppError::NotEligible));

        service
            .start_or_resume(&visit(Uuid::new_v4(), pool.id, "http://x.com/?utm_source=google"), t(0))
            .await
            .expect("elegível");
    }

    #[tokio::test]
    async fn company_field_lists_drive_eligibility() {
        let rules = json!({
            "inclusion_rules": [{ "rules": [{ "type": "PAID" }] }]
        });
        let (store, service, pool) = fixture(1, rules).await;
        store
            .set_attribution_fields(
                pool.company_id,
                AttributionFields {
                    medium: vec!["channel".into()],
                    ..AttributionFields::default()
                },
            )
            .await;

        let err = service
            .start_or_resume(&visit(Uuid::new_v4(), pool.id, "http://x.com/?utm_medium=cpc"), t(0))
            .await
            .expect_err("utm_medium não é a lista da empresa");
        assert!(matches!(err, AppError::NotEligible));

        let grant = service
            .start_or_resume(&visit(Uuid::new_v4(), pool.id, "http://x.com/?channel=cpc"), t(0))
            .await
            .expect("pago");
        assert!(grant.attribution.is_paid);
        assert_eq!(grant.attribution.medium.as_deref(), Some("cpc"));
    }

    #[tokio::test]
    async fn unusable_pools_are_rejected() {
        let (store, service, pool) = fixture(0, allow_all()).await;

        let err = service
            .start_or_resume(&visit(Uuid::new_v4(), pool.id, "http://x.com/"), t(0))
            .await
            .expect_err("pool vazio");
        assert!(matches!(err, AppError::NoNumbersAvailable));

        store.set_pool_disabled(pool.id, true).await;
        let err = service
            .start_or_resume(&visit(Uuid::new_v4(), pool.id, "http://x.com/"), t(0))
            .await
            .expect_err("pool desativado");
        assert!(matches!(err, AppError::PoolDisabled));

        let err = service
            .start_or_resume(&visit(Uuid::new_v4(), Uuid::new_v4(), "http://x.com/"), t(0))
            .await
            .expect_err("pool inexistente");
        assert!(matches!(err, AppError::PoolNotFound));
    }

    #[tokio::test]
    async fn heartbeat_requires_matching_token() {
        let (_, service, pool) = fixture(1, allow_all()).await;
        let grant = service
            .start_or_resume(&visit(Uuid::new_v4(), pool.id, "https://example.com/"), t(0))
            .await
            .unwrap();
        let id = grant.session.id;

        let err = service
            .heartbeat(id, "not-the-token", None, t(1))
            .await
            .expect_err("token errado");
        assert!(matches!(err, AppError::InvalidSessionToken));

        let session = service
            .heartbeat(id, &grant.session.token, Some("https://example.com/pricing"), t(2))
            .await
            .expect("heartbeat");
        assert_eq!(session.last_activity_at, t(2));
        assert_eq!(session.last_url, "https://example.com/pricing");

        let err = service
            .heartbeat(Uuid::new_v4(), &grant.session.token, None, t(2))
            .await
            .expect_err("sessão inexistente");
        assert!(matches!(err, AppError::SessionNotFound));
    }

    #[tokio::test]
    async fn end_is_idempotent_and_blocks_heartbeats() {
        let (_, service, pool) = fixture(1, allow_all()).await;
        let grant = service
            .start_or_resume(&visit(Uuid::new_v4(), pool.id, "https://example.com/"), t(0))
            .await
            .unwrap();
        let (id, token) = (grant.session.id, grant.session.token.clone());

        let first = service.end(id, &token, t(4)).await.expect("fim");
        let second = service.end(id, &token, t(8)).await.expect("fim de novo");
        assert_eq!(first.ended_at, Some(t(4)));
        assert_eq!(second.ended_at, Some(t(4)));
        assert!(!second.active);

        let err = service.heartbeat(id, &token, None, t(9)).await.expect_err("encerrada");
        assert!(matches!(err, AppError::SessionEnded));

        let err = service.end(id, "wrong", t(9)).await.expect_err("token errado");
        assert!(matches!(err, AppError::InvalidSessionToken));
    }

    #[tokio::test]
    async fn ended_session_frees_browser_for_a_new_one() {
        let (_, service, pool) = fixture(2, allow_all()).await;
        let guuid = Uuid::new_v4();
        let first = service
            .start_or_resume(&visit(guuid, pool.id, "https://example.com/"), t(0))
            .await
            .unwrap();
        service.end(first.session.id, &first.session.token, t(1)).await.unwrap();

        let second = service
            .start_or_resume(&visit(guuid, pool.id, "https://example.com/"), t(2))
            .await
            .unwrap();
        assert!(!second.resumed);
        assert_ne!(second.session.id, first.session.id);
    }

    #[tokio::test]
    async fn assignment_conflict_is_retried_once() {
        let (store, _, pool) = fixture(2, allow_all()).await;
        let flaky = FlakyTrackingStore::new(store).with_assignment_conflicts(1);
        let service = SessionService::new(Arc::new(flaky.clone()), Duration::days(30));

        let grant = service
            .start_or_resume(&visit(Uuid::new_v4(), pool.id, "https://example.com/"), t(0))
            .await
            .expect("segunda tentativa");
        assert!(!grant.resumed);
        assert_eq!(flaky.create_calls(), 2);
    }

    #[tokio::test]
    async fn persistent_assignment_conflict_means_no_numbers() {
        let (store, _, pool) = fixture(2, allow_all()).await;
        let flaky = FlakyTrackingStore::new(store).with_assignment_conflicts(2);
        let service = SessionService::new(Arc::new(flaky.clone()), Duration::days(30));

        let err = service
            .start_or_resume(&visit(Uuid::new_v4(), pool.id, "https://example.com/"), t(0))
            .await
            .expect_err("conflito persistente");
        assert!(matches!(err, AppError::NoNumbersAvailable));
        assert_eq!(flaky.create_calls(), 2);
    }

    #[tokio::test]
    async fn overflowing_ttl_is_an_error_not_a_panic() {
        let (store, _, pool) = fixture(1, allow_all()).await;
        let service = SessionService::new(Arc::new(store), Duration::MAX);

        let err = service
            .start_or_resume(&visit(Uuid::new_v4(), pool.id, "https://example.com/"), t(0))
            .await
            .expect_err("TTL estourado");
        assert!(matches!(err, AppError::InternalServerError(_)));
    }

    #[test]
    fn tokens_are_compared_exactly() {
        let token = generate_token();
        assert_eq!(token.len(), 64);
        assert!(tokens_match(&token, &token.clone()));
        assert!(!tokens_match(&token, &token[..63]));
        assert!(!tokens_match(&token, &generate_token()));
    }
}
