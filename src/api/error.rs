use crate::application_port::*;
use crate::domain_model::TargetError;
use crate::domain_port::*;
use std::convert::Infallible;
use thiserror::Error;
use tracing::warn;
use warp::http::StatusCode;
use warp::{Rejection, Reply, reject};

/// Turns every rejection into a status code plus a plain-text reason.
pub async fn recover_error(err: Rejection) -> Result<impl Reply, Infallible> {
    let (status, reason) = if let Some(code) = err.find::<ApiErrorCode>() {
        (code.status(), code.to_string())
    } else if err.is_not_found() {
        (StatusCode::NOT_FOUND, "not found".to_string())
    } else if err.find::<reject::MethodNotAllowed>().is_some() {
        (StatusCode::METHOD_NOT_ALLOWED, "method not allowed".to_string())
    } else if err.find::<warp::ws::MissingConnectionUpgrade>().is_some() {
        (StatusCode::BAD_REQUEST, "websocket upgrade required".to_string())
    } else if err.find::<reject::PayloadTooLarge>().is_some() {
        (StatusCode::PAYLOAD_TOO_LARGE, "payload too large".to_string())
    } else if let Some(e) = err.find::<reject::MissingHeader>() {
        (StatusCode::BAD_REQUEST, e.to_string())
    } else if let Some(e) = err.find::<reject::InvalidHeader>() {
        (StatusCode::BAD_REQUEST, e.to_string())
    } else if err.find::<reject::InvalidQuery>().is_some() {
        (StatusCode::BAD_REQUEST, "invalid query".to_string())
    } else {
        warn!("unhandled rejection: {:?}", err);
        (StatusCode::INTERNAL_SERVER_ERROR, "internal error".to_string())
    };

    Ok(warp::reply::with_status(reason, status))
}

pub const NO_STORE: ApiErrorCode = ApiErrorCode::Unavailable("store not configured");

#[derive(Debug, Clone, Error)]
pub enum ApiErrorCode {
    #[error("{0}")]
    BadRequest(String),
    #[error("unauthorized")]
    Unauthorized,
    #[error("forbidden")]
    Forbidden,
    #[error("{0}")]
    NotFound(&'static str),
    #[error("{0}")]
    Conflict(&'static str),
    #[error("payload too large")]
    PayloadTooLarge,
    #[error("rate limit exceeded")]
    RateLimited,
    #[error("{0}")]
    Unavailable(&'static str),
    #[error("{0}")]
    Upstream(String),
    #[error("internal error")]
    InternalError,
}

impl ApiErrorCode {
    pub fn internal<E: std::fmt::Display>(error: E) -> ApiErrorCode {
        warn!("Internal error: {}", error);
        ApiErrorCode::InternalError
    }

    pub fn bad_request(reason: impl Into<String>) -> ApiErrorCode {
        ApiErrorCode::BadRequest(reason.into())
    }

    pub fn status(&self) -> StatusCode {
        match self {
            ApiErrorCode::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiErrorCode::Unauthorized => StatusCode::UNAUTHORIZED,
            ApiErrorCode::Forbidden => StatusCode::FORBIDDEN,
            ApiErrorCode::NotFound(_) => StatusCode::NOT_FOUND,
            ApiErrorCode::Conflict(_) => StatusCode::CONFLICT,
            ApiErrorCode::PayloadTooLarge => StatusCode::PAYLOAD_TOO_LARGE,
            ApiErrorCode::RateLimited => StatusCode::TOO_MANY_REQUESTS,
            ApiErrorCode::Unavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            ApiErrorCode::Upstream(_) => StatusCode::BAD_GATEWAY,
            ApiErrorCode::InternalError => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl reject::Reject for ApiErrorCode {}

impl From<AuthError> for ApiErrorCode {
    fn from(error: AuthError) -> Self {
        match error {
            AuthError::Unavailable => NO_STORE,
            AuthError::InternalError(e) => ApiErrorCode::internal(e),
            AuthError::TokenInvalid(_) | AuthError::TokenExpired | AuthError::TokenRevoked => {
                ApiErrorCode::Unauthorized
            }
        }
    }
}

impl From<StoreError> for ApiErrorCode {
    fn from(error: StoreError) -> Self {
        match error {
            StoreError::NotFound => ApiErrorCode::NotFound("not found"),
            StoreError::Conflict => ApiErrorCode::Conflict("already exists"),
            StoreError::InvalidCredentials => ApiErrorCode::Unauthorized,
            StoreError::Backend(e) => ApiErrorCode::internal(e),
        }
    }
}

impl From<TargetError> for ApiErrorCode {
    fn from(error: TargetError) -> Self {
        ApiErrorCode::BadRequest(error.to_string())
    }
}

impl From<BusError> for ApiErrorCode {
    fn from(error: BusError) -> Self {
        warn!("bus error: {}", error);
        match error {
            BusError::Publish(_) => ApiErrorCode::Upstream("publish failed".to_string()),
            BusError::Subscribe(_) => ApiErrorCode::Upstream("subscribe failed".to_string()),
            BusError::Connect(_) => ApiErrorCode::Upstream("bus unavailable".to_string()),
        }
    }
}
