//src/main.rs

use anyhow::Context;
use axum::{
    routing::{get, post},
    Router,
};
use tokio::net::TcpListener;
use tracing_subscriber::EnvFilter;

mod common;
mod config;
mod db;
mod handlers;
mod models;
mod services;

use crate::config::{AppState, Settings};

fn router(app_state: AppState) -> Router {
    Router::new()
        .route("/api/health", get(handlers::sessions::health))
        .route("/api/sessions", post(handlers::sessions::start_session))
        .route("/api/sessions/{id}/heartbeat", post(handlers::sessions::heartbeat))
        .route("/api/sessions/{id}/end", post(handlers::sessions::end_session))
        .with_state(app_state)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_target(false)
        .compact()
        .init();

    let settings = Settings::from_env()?;
    let app_state = AppState::new(settings)
        .await
        .context("Falha ao inicializar o estado da aplicação.")?;

    // Migrações só fazem sentido com Postgres
    if let Some(db_pool) = &app_state.db_pool {
        sqlx::migrate!()
            .run(db_pool)
            .await
            .context("Falha ao rodar as migrações do banco de dados.")?;
        tracing::info!("✅ Migrações do banco de dados executadas com sucesso!");
    }

    app_state
        .session_sweeper()
        .spawn(app_state.settings.sweep_interval);

    let listener = TcpListener::bind(&app_state.settings.bind_addr)
        .await
        .context("Falha ao iniciar o listener TCP")?;
    tracing::info!("🚀 Servidor escutando em {}", listener.local_addr()?);

    axum::serve(listener, router(app_state))
        .await
        .context("Erro no servidor Axum")?;

    Ok(())
}
