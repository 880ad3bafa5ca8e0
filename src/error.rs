use axum::{
    Json,
    extract::rejection::JsonRejection,
    http::{StatusCode, header},
    response::{IntoResponse, Response},
};
use serde::Serialize;
use thiserror::Error;
use tracing::{error, warn};

#[derive(Error, Debug)]
pub enum ServiceError {
    #[error("Failed to set global logger")]
    SetGlobalLogger(#[from] tracing_log::log_tracer::SetLoggerError),
    #[error("Failed to set global subscriber")]
    SetGlobalSubscriber(#[from] tracing::subscriber::SetGlobalDefaultError),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("Failed to parse URL: {0}")]
    UrlParse(#[from] url::ParseError),
    #[error("Failed to serialize payload: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Short code already exists")]
    DuplicateShortCode,
    #[error("Excessive short code collisions")]
    ExcessiveCollisions,

    #[error("Cache error: {0}")]
    Cache(String),
    #[error("Store query timed out")]
    StoreTimeout,
    #[error("Internal server error: {0}")]
    Internal(String),
}

impl ServiceError {
    pub fn is_unique_violation(&self) -> bool {
        match self {
            ServiceError::DuplicateShortCode => true,
            ServiceError::Database(sqlx::Error::Database(db_err)) => db_err.is_unique_violation(),
            _ => false,
        }
    }
}

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("{0}")]
    BadRequest(&'static str),
    #[error("Not found")]
    NotFound,
    #[error("Too many requests")]
    TooManyRequests,
    #[error("Service unavailable")]
    ServiceUnavailable,
    #[error("Invalid JSON")]
    InvalidJson(#[from] JsonRejection),
    #[error("Invalid header value")]
    ResponseHeader(#[from] header::InvalidHeaderValue),
    #[error(transparent)]
    Internal(ServiceError),
}

#[derive(Serialize)]
struct ErrorBody {
    code: &'static str,
    error: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    details: Option<String>,
}

impl From<ServiceError> for ApiError {
    fn from(e: ServiceError) -> Self {
        ApiError::Internal(e)
    }
}

impl From<url::ParseError> for ApiError {
    fn from(err: url::ParseError) -> Self {
        ApiError::from(ServiceError::from(err))
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        // Choose status + public message; log internals.
        //
        // Logging policy:
        // - error!: unexpected conditions that might indicate bugs
        // - warn!: expected failures (client errors, transient issues)
        // - no log: normal validation failures
        let (status, body) = match &self {
            ApiError::BadRequest(msg) => (
                StatusCode::BAD_REQUEST,
                ErrorBody {
                    code: "bad_request",
                    error: msg,
                    details: None,
                },
            ),
            ApiError::NotFound => (
                StatusCode::NOT_FOUND,
                ErrorBody {
                    code: "not_found",
                    error: "Resource not found",
                    details: Some("The requested short link does not exist".to_string()),
                },
            ),
            ApiError::TooManyRequests => (
                StatusCode::TOO_MANY_REQUESTS,
                ErrorBody {
                    code: "too_many_requests",
                    error: "Rate limit exceeded",
                    details: Some("Please wait before making additional requests".to_string()),
                },
            ),
            ApiError::InvalidJson(_) => (
                StatusCode::BAD_REQUEST,
                ErrorBody {
                    code: "invalid_json",
                    error: "Invalid JSON in request body",
                    details: None,
                },
            ),

            ApiError::ResponseHeader(e) => {
                error!(error = ?e, "Failed to construct response header");

                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    ErrorBody {
                        code: "internal_error",
                        error: "Internal server error",
                        details: None,
                    },
                )
            }

            ApiError::ServiceUnavailable => {
                warn!("Service unavailable");

                (
                    StatusCode::SERVICE_UNAVAILABLE,
                    ErrorBody {
                        code: "service_unavailable",
                        error: "Service temporarily unavailable",
                        details: Some("Please try again later".to_string()),
                    },
                )
            }

            ApiError::Internal(e) => match e {
                ServiceError::Database(sqlx::Error::PoolTimedOut) => {
                    warn!("Database pool timeout - server overloaded");

                    (
                        StatusCode::SERVICE_UNAVAILABLE,
                        ErrorBody {
                            code: "service_unavailable",
                            error: "Service temporarily unavailable",
                            details: Some("Store busy, please try again later".to_string()),
                        },
                    )
                }
                ServiceError::StoreTimeout => {
                    warn!("Store query deadline exceeded");

                    (
                        StatusCode::INTERNAL_SERVER_ERROR,
                        ErrorBody {
                            code: "internal_error",
                            error: "Internal server error",
                            details: Some("Store did not respond in time".to_string()),
                        },
                    )
                }
                ServiceError::ExcessiveCollisions => {
                    warn!("Excessive short code collisions - possible capacity issue");

                    (
                        StatusCode::INTERNAL_SERVER_ERROR,
                        ErrorBody {
                            code: "internal_error",
                            error: "Failed to create link",
                            details: Some(
                                "Unable to generate a unique short code, please try again"
                                    .to_string(),
                            ),
                        },
                    )
                }
                other => {
                    error!(error = ?other, "Unexpected internal error");

                    (
                        StatusCode::INTERNAL_SERVER_ERROR,
                        ErrorBody {
                            code: "internal_error",
                            error: "Internal server error",
                            details: None,
                        },
                    )
                }
            },
        };

        (status, Json(body)).into_response()
    }
}
