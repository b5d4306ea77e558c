use actix_web::{HttpResponse, ResponseError};
use thiserror::Error;

use crate::models::ApiResponse;

use crate::services::subscription_machine::TransitionError;

pub type AppResult<T> = Result<T, AppError>;

#[derive(Error, Debug)]
pub enum AppError {
    #[error("Database error: {0}")]
    DatabaseError(#[from] sea_orm::DbErr),

    #[error("Validation error: {0}")]
    ValidationError(String),

    #[error("Auth error: {0}")]
    AuthError(String),

    #[error("Forbidden: {0}")]
    Forbidden(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid transition: {0}")]
    InvalidTransition(#[from] TransitionError),

    #[error("Write conflict: {0}")]
    WriteConflict(String),

    #[error("Payment gateway error: {0}")]
    GatewayError(String),

    #[error("Payment gateway timed out: {0}")]
    GatewayTimeout(String),

    #[error("Payment gateway disabled")]
    GatewayDisabled,

    #[error("Stripe error: {0}")]
    StripeError(#[from] stripe::StripeError),

    #[error("Config error: {0}")]
    ConfigError(String),

    #[error("Internal server error: {0}")]
    InternalError(String),

    #[error("JWT error: {0}")]
    JwtError(#[from] jsonwebtoken::errors::Error),

    #[error("JSON serialization/deserialization error: {0}")]
    SerdeJsonError(#[from] serde_json::Error),
}

impl AppError {
    /// 是否为永久性错误（重投也不会成功），这类错误交给对账任务处理
    pub fn is_permanent(&self) -> bool {
        matches!(
            self,
            AppError::InvalidTransition(_) | AppError::ValidationError(_) | AppError::NotFound(_)
        )
    }
}

impl ResponseError for AppError {
    fn error_response(&self) -> HttpResponse {
        let (status_code, error_code, message) = match self {
            AppError::ValidationError(msg) => {
                log::warn!("Validation error: {msg}");
                (
                    actix_web::http::StatusCode::BAD_REQUEST,
                    "VALIDATION_ERROR",
                    msg.clone(),
                )
            }
            AppError::AuthError(msg) => {
                log::warn!("Authentication error: {msg}");
                (
                    actix_web::http::StatusCode::UNAUTHORIZED,
                    "AUTH_ERROR",
                    msg.clone(),
                )
            }
            AppError::JwtError(err) => {
                log::warn!("JWT error: {err}");
                (
                    actix_web::http::StatusCode::UNAUTHORIZED,
                    "AUTH_ERROR",
                    "Invalid access token".to_string(),
                )
            }
            AppError::Forbidden(msg) => {
                log::warn!("Forbidden: {msg}");
                (
                    actix_web::http::StatusCode::FORBIDDEN,
                    "FORBIDDEN",
                    msg.clone(),
                )
            }
            AppError::NotFound(msg) => (
                actix_web::http::StatusCode::NOT_FOUND,
                "NOT_FOUND",
                msg.clone(),
            ),
            AppError::InvalidTransition(err) => {
                log::warn!("Invalid transition: {err}");
                (
                    actix_web::http::StatusCode::CONFLICT,
                    "INVALID_TRANSITION",
                    err.to_string(),
                )
            }
            AppError::WriteConflict(msg) => {
                log::error!("Write conflict: {msg}");
                (
                    actix_web::http::StatusCode::SERVICE_UNAVAILABLE,
                    "WRITE_CONFLICT",
                    "Concurrent update, retry later".to_string(),
                )
            }
            AppError::GatewayDisabled => {
                log::warn!("Payment gateway disabled");
                (
                    actix_web::http::StatusCode::SERVICE_UNAVAILABLE,
                    "GATEWAY_DISABLED",
                    "Paid plans are currently unavailable".to_string(),
                )
            }
            AppError::GatewayTimeout(msg) => {
                log::error!("Payment gateway timed out: {msg}");
                (
                    actix_web::http::StatusCode::GATEWAY_TIMEOUT,
                    "GATEWAY_TIMEOUT",
                    "Payment provider timed out".to_string(),
                )
            }
            AppError::GatewayError(msg) => {
                log::error!("Payment gateway error: {msg}");
                (
                    actix_web::http::StatusCode::BAD_GATEWAY,
                    "GATEWAY_ERROR",
                    "Payment provider error".to_string(),
                )
            }
            AppError::StripeError(err) => {
                log::error!("Stripe error: {err}");
                (
                    actix_web::http::StatusCode::BAD_GATEWAY,
                    "GATEWAY_ERROR",
                    "Payment provider error".to_string(),
                )
            }
            AppError::DatabaseError(err) => {
                log::error!("Database error: {err}");
                (
                    actix_web::http::StatusCode::INTERNAL_SERVER_ERROR,
                    "DATABASE_ERROR",
                    "Database error".to_string(),
                )
            }
            _ => {
                log::error!("Internal error: {self}");
                (
                    actix_web::http::StatusCode::INTERNAL_SERVER_ERROR,
                    "INTERNAL_ERROR",
                    "Internal server error".to_string(),
                )
            }
        };

        HttpResponse::build(status_code).json(ApiResponse::failure(error_code, message))
    }
}
