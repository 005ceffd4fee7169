// src/config.rs

use std::{env, str::FromStr, sync::Arc, time::Duration};

use anyhow::Context;
use serde_json::json;
use sqlx::{postgres::PgPoolOptions, PgPool};
use uuid::Uuid;

use crate::{
    db::{InMemoryTrackingStore, PgTrackingRepository, TrackingStore},
    services::{session_service::SessionService, session_sweeper::SessionSweeper},
};

/// Configuração lida do ambiente (com `.env` opcional).
#[derive(Debug, Clone)]
pub struct Settings {
    pub database_url: Option<String>,
    pub db_max_connections: u32,
    pub bind_addr: String,
    pub session_ttl: chrono::Duration,
    pub session_idle_timeout: chrono::Duration,
    pub sweep_interval: Duration,
    pub sweep_batch_size: i64,
    // Só para o store em memória: números do pool de demonstração ("1:8005550001,...")
    pub demo_pool_numbers: Vec<(String, String)>,
}

impl Settings {
    pub fn from_env() -> anyhow::Result<Self> {
        dotenvy::dotenv().ok();

        let ttl_days: i64 = positive_var("SESSION_TTL_DAYS", 30)?;
        let idle_minutes: i64 = positive_var("SESSION_IDLE_MINUTES", 5)?;

        Ok(Self {
            database_url: env::var("DATABASE_URL").ok().filter(|url| !url.trim().is_empty()),
            db_max_connections: positive_var("DB_MAX_CONNECTIONS", 5)?,
            bind_addr: env::var("BIND_ADDR").unwrap_or_else(|_| "0.0.0.0:3000".to_string()),
            session_ttl: days(ttl_days)?,
            session_idle_timeout: chrono::Duration::try_minutes(idle_minutes)
                .with_context(|| format!("SESSION_IDLE_MINUTES fora do intervalo: {}", idle_minutes))?,
            sweep_interval: Duration::from_secs(positive_var("SWEEP_INTERVAL_SECS", 60)?),
            sweep_batch_size: positive_var("SWEEP_BATCH_SIZE", 250)?,
            demo_pool_numbers: parse_demo_numbers(&env::var("DEMO_POOL_NUMBERS").unwrap_or_default())?,
        })
    }
}

// Inteiro estritamente positivo vindo do ambiente; ausente ou vazio usa o padrão.
fn positive_var<T>(name: &str, default: T) -> anyhow::Result<T>
where
    T: FromStr + PartialOrd + Default + std::fmt::Display,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    parse_positive(name, env::var(name).ok().as_deref(), default)
}

fn parse_positive<T>(name: &str, raw: Option<&str>, default: T) -> anyhow::Result<T>
where
    T: FromStr + PartialOrd + Default + std::fmt::Display,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    let value = match raw.map(str::trim) {
        Some(raw) if !raw.is_empty() => raw
            .parse()
            .with_context(|| format!("{} inválida: {:?}", name, raw))?,
        _ => default,
    };
    if value <= T::default() {
        anyhow::bail!("{} deve ser maior que zero (veio {})", name, value);
    }
    Ok(value)
}

// O TTL entra em `now + ttl` a cada sessão: precisa caber com folga no calendário.
const MAX_SESSION_TTL_DAYS: i64 = 3650;

fn days(ttl_days: i64) -> anyhow::Result<chrono::Duration> {
    if ttl_days > MAX_SESSION_TTL_DAYS {
        anyhow::bail!(
            "SESSION_TTL_DAYS acima do máximo ({} > {})",
            ttl_days,
            MAX_SESSION_TTL_DAYS
        );
    }
    chrono::Duration::try_days(ttl_days)
        .with_context(|| format!("SESSION_TTL_DAYS fora do intervalo: {}", ttl_days))
}

fn parse_demo_numbers(raw: &str) -> anyhow::Result<Vec<(String, String)>> {
    raw.split(',')
        .map(str::trim)
        .filter(|entry| !entry.is_empty())
        .map(|entry| {
            let (country_code, number) = entry
                .split_once(':')
                .with_context(|| format!("DEMO_POOL_NUMBERS: esperado código:número, veio {:?}", entry))?;
            Ok((country_code.trim().to_string(), number.trim().to_string()))
        })
        .collect()
}

// O estado compartilhado que será acessível em toda a aplicação
#[derive(Clone)]
pub struct AppState {
    pub settings: Settings,
    pub db_pool: Option<PgPool>,
    pub store: Arc<dyn TrackingStore>,
    pub session_service: SessionService,
}

impl AppState {
    pub async fn new(settings: Settings) -> anyhow::Result<Self> {
        let (store, db_pool): (Arc<dyn TrackingStore>, Option<PgPool>) = match &settings.database_url {
            Some(database_url) => {
                let db_pool = PgPoolOptions::new()
                    .max_connections(settings.db_max_connections)
                    .acquire_timeout(Duration::from_secs(3))
                    .connect(database_url)
                    .await
                    .context("Falha ao conectar ao banco de dados")?;
                tracing::info!("✅ Conexão com o banco de dados estabelecida com sucesso!");

                (Arc::new(PgTrackingRepository::new(db_pool.clone())), Some(db_pool))
            }
            None => {
                tracing::warn!("⚠️ DATABASE_URL não definida: usando store em memória (não durável).");
                let store = InMemoryTrackingStore::new();
                seed_demo_pool(&store, &settings.demo_pool_numbers).await;
                (Arc::new(store), None)
            }
        };

        Ok(Self::from_store(settings, store, db_pool))
    }

    /// Monta o gráfico de dependências sobre um store já pronto.
    pub fn from_store(
        settings: Settings,
        store: Arc<dyn TrackingStore>,
        db_pool: Option<PgPool>,
    ) -> Self {
        let session_service = SessionService::new(store.clone(), settings.session_ttl);
        Self {
            settings,
            db_pool,
            store,
            session_service,
        }
    }

    pub fn session_sweeper(&self) -> SessionSweeper {
        SessionSweeper::new(
            self.store.clone(),
            self.settings.session_idle_timeout,
            self.settings.sweep_batch_size,
        )
    }
}

async fn seed_demo_pool(store: &InMemoryTrackingStore, numbers: &[(String, String)]) {
    if numbers.is_empty() {
        return;
    }
    let pool = store
        .create_pool(
            Uuid::new_v4(),
            "Demo",
            json!({
                "device_types": ["ALL"],
                "browser_types": ["ALL"],
                "inclusion_rules": [{ "rules": [{ "type": "ALL" }] }],
                "exclusion_rules": []
            }),
        )
        .await;
    for (country_code, number) in numbers {
        store.add_phone_number(&pool, country_code, number, None).await;
    }
    tracing::info!(pool_id = %pool.id, numbers = numbers.len(), "Pool de demonstração criado");
}

#[cfg(test)]
impl Settings {
    pub fn for_tests() -> Self {
        Self {
            database_url: None,
            db_max_connections: 1,
            bind_addr: "127.0.0.1:0".to_string(),
            session_ttl: chrono::Duration::days(30),
            session_idle_timeout: chrono::Duration::minutes(5),
            sweep_interval: Duration::from_secs(60),
            sweep_batch_size: 100,
            demo_pool_numbers: Vec::new(),
        }
    }
}
