// src/common/error.rs

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

// O tipo de erro único da aplicação: repositórios, serviços e handlers falam todos AppError.
#[derive(Debug, Error)]
pub enum AppError {
    #[error("Erro de validação")]
    ValidationError(#[from] validator::ValidationErrors),

    #[error("Pool de rastreamento não encontrado")]
    PoolNotFound,

    #[error("Pool de rastreamento desativado")]
    PoolDisabled,

    // A visita não passou nas regras de troca do pool
    #[error("Visita não elegível para troca de número")]
    NotEligible,

    #[error("Nenhum número disponível no pool")]
    NoNumbersAvailable,

    // Todos os candidatos estavam reservados por requisições concorrentes
    #[error("Conflito na reserva de número")]
    AssignmentConflict,

    // Outra requisição do mesmo guuid abriu a sessão primeiro
    #[error("Conflito na abertura de sessão")]
    SessionConflict,

    #[error("Sessão não encontrada")]
    SessionNotFound,

    #[error("Token de sessão inválido")]
    InvalidSessionToken,

    #[error("Sessão encerrada")]
    SessionEnded,

    #[error("Erro de banco de dados")]
    DatabaseError(#[from] sqlx::Error),

    #[error("Erro interno do servidor")]
    InternalServerError(#[from] anyhow::Error),
}

impl AppError {
    /// Conflitos de concorrência que o serviço resolve com uma nova tentativa.
    pub fn is_retryable(&self) -> bool {
        matches!(self, AppError::AssignmentConflict | AppError::SessionConflict)
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, error_message) = match self {
            AppError::ValidationError(errors) => {
                let mut details = std::collections::HashMap::new();
                for (field, field_errors) in errors.field_errors() {
                    let messages: Vec<String> = field_errors
                        .iter()
                        .map(|e| {
                            e.message
                                .as_ref()
                                .map(|m| m.to_string())
                                .unwrap_or_else(|| e.code.to_string())
                        })
                        .collect();
                    details.insert(field.to_string(), messages);
                }
                let body = Json(json!({
                    "error": "Um ou mais campos são inválidos.",
                    "details": details,
                }));
                return (StatusCode::BAD_REQUEST, body).into_response();
            }
            AppError::PoolNotFound => (StatusCode::NOT_FOUND, "Pool de rastreamento não encontrado."),
            AppError::PoolDisabled => (StatusCode::CONFLICT, "Pool de rastreamento desativado."),
            AppError::NotEligible => (
                StatusCode::UNPROCESSABLE_ENTITY,
                "A visita não se qualifica para troca de número.",
            ),
            AppError::NoNumbersAvailable => (
                StatusCode::SERVICE_UNAVAILABLE,
                "Nenhum número disponível no momento.",
            ),
            AppError::AssignmentConflict | AppError::SessionConflict => (
                StatusCode::CONFLICT,
                "Requisição concorrente em andamento, tente novamente.",
            ),
            AppError::SessionNotFound => (StatusCode::NOT_FOUND, "Sessão não encontrada."),
            AppError::InvalidSessionToken => (StatusCode::UNAUTHORIZED, "Token de sessão inválido."),
            AppError::SessionEnded => (StatusCode::GONE, "Sessão já encerrada."),

            // DatabaseError e InternalServerError viram 500; o detalhe fica só no log.
            ref e => {
                tracing::error!("Erro Interno do Servidor: {:?}", e);
                (StatusCode::INTERNAL_SERVER_ERROR, "Ocorreu um erro inesperado.")
            }
        };

        let body = Json(json!({ "error": error_message }));
        (status, body).into_response()
    }
}
