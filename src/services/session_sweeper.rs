// src/services/session_sweeper.rs

use std::{sync::Arc, time::Duration as StdDuration};

use chrono::{DateTime, Duration, Utc};
use tokio::task::JoinHandle;

use crate::{common::error::AppError, db::TrackingStore, models::tracking::{SessionState, SweepReport}};

// tokio::time::interval entra em pânico com período zero
const MIN_SWEEP_INTERVAL: StdDuration = StdDuration::from_secs(1);

/// Varredura periódica das sessões ociosas.
///
/// Para cada sessão sem atividade há mais de `idle_timeout`:
/// - `end_after` vencido -> encerramento definitivo (active = false, ended_at = agora);
/// - senão, ainda ativa -> só desativa (a linha continua aberta para a análise).
///
/// Cada linha é uma atualização condicional independente; o lote nunca segura trava.
#[derive(Clone)]
pub struct SessionSweeper {
    store: Arc<dyn TrackingStore>,
    idle_timeout: Duration,
    batch_size: i64,
}

impl SessionSweeper {
    pub fn new(store: Arc<dyn TrackingStore>, idle_timeout: Duration, batch_size: i64) -> Self {
        Self { store, idle_timeout, batch_size: batch_size.max(1) }
    }

    pub async fn run_once(&self, now: DateTime<Utc>) -> Result<SweepReport, AppError> {
        let idle_before = now - self.idle_timeout;
        let mut report = SweepReport::default();
        let mut cursor = None;

        loop {
            let batch = self
                .store
                .sweepable_sessions(idle_before, now, cursor, self.batch_size)
                .await?;
            let Some(last) = batch.last() else {
                break;
            };
            cursor = Some(last.id);
            let full_batch = batch.len() as i64 == self.batch_size;

            for session in &batch {
                let expired = session.is_expired(now);
                let outcome = match session.state(now, self.idle_timeout) {
                    SessionState::Ended => continue,
                    _ if expired => self.store.hard_end_session(session.id, now).await,
                    SessionState::Idle => self.store.deactivate_session(session.id, idle_before).await,
                    SessionState::Open => continue,
                };

                match outcome {
                    Ok(false) => {}
                    Ok(true) if expired => report.hard_ended += 1,
                    Ok(true) => report.deactivated += 1,
                    Err(e) => {
                        report.failed += 1;
                        tracing::error!(session_id = %session.id, "Falha ao varrer sessão: {:?}", e);
                    }
                }
            }

            if !full_batch {
                break;
            }
        }

        Ok(report)
    }

    /// Roda `run_once` a cada `interval` (no mínimo 1s) até o processo terminar.
    pub fn spawn(self, interval: StdDuration) -> JoinHandle<()> {
        let interval = interval.max(MIN_SWEEP_INTERVAL);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                match self.run_once(Utc::now()).await {
                    Ok(report) if !report.is_empty() => tracing::info!(
                        hard_ended = report.hard_ended,
                        deactivated = report.deactivated,
                        failed = report.failed,
                        "🧹 Varredura de sessões concluída"
                    ),
                    Ok(_) => {}
                    Err(e) => tracing::error!("🔥 Varredura de sessões falhou: {:?}", e),
                }
            }
        })
    }
}
