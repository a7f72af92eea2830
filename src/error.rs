use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: ErrorObject,
}

#[derive(Debug, Serialize)]
pub struct ErrorObject {
    pub code: String,
    pub message: String,
}

#[derive(Debug)]
pub enum ApiError {
    Unauthorized(&'static str, String),
    Forbidden(&'static str, String),
    BadRequest(&'static str, String),
    NotFound(&'static str, String),
    Conflict(&'static str, String),
    /// Upstream partner or payment gateway failed.
    BadGateway(&'static str, String),
    TooManyRequests(String),
    Internal(String),
}

impl ApiError {
    pub fn invalid_credentials() -> Self {
        ApiError::Unauthorized("INVALID_CREDENTIALS", "Email or password is incorrect".into())
    }

    pub fn session_expired() -> Self {
        ApiError::Unauthorized("SESSION_EXPIRED", "Session expired".into())
    }

    pub fn validation(message: impl Into<String>) -> Self {
        ApiError::BadRequest("VALIDATION_ERROR", message.into())
    }

    pub fn not_found(what: &str) -> Self {
        ApiError::NotFound("NOT_FOUND", format!("{what} not found"))
    }

    pub fn db(e: sqlx::Error) -> Self {
        ApiError::Internal(format!("db error: {e}"))
    }

    /// Unique violations become a 409 with `code`; anything else is internal.
    pub fn unique_or_db(e: sqlx::Error, code: &'static str, message: &str) -> Self {
        match e.as_database_error() {
            Some(d) if d.is_unique_violation() => ApiError::Conflict(code, message.to_string()),
            _ => ApiError::db(e),
        }
    }

    pub fn code(&self) -> &str {
        match self {
            ApiError::Unauthorized(code, _)
            | ApiError::Forbidden(code, _)
            | ApiError::BadRequest(code, _)
            | ApiError::NotFound(code, _)
            | ApiError::Conflict(code, _)
            | ApiError::BadGateway(code, _) => code,
            ApiError::TooManyRequests(_) => "RATE_LIMITED",
            ApiError::Internal(_) => "INTERNAL",
        }
    }

    fn to_error_response(code: &str, message: &str) -> Json<ErrorResponse> {
        Json(ErrorResponse {
            error: ErrorObject {
                code: code.to_string(),
                message: message.to_string(),
            },
        })
    }
}

impl From<sqlx::Error> for ApiError {
    fn from(e: sqlx::Error) -> Self {
        ApiError::db(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let code = self.code().to_string();
        match self {
            ApiError::Unauthorized(_, msg) => {
                (StatusCode::UNAUTHORIZED, ApiError::to_error_response(&code, &msg)).into_response()
            }
            ApiError::Forbidden(_, msg) => {
                (StatusCode::FORBIDDEN, ApiError::to_error_response(&code, &msg)).into_response()
            }
            ApiError::BadRequest(_, msg) => {
                (StatusCode::BAD_REQUEST, ApiError::to_error_response(&code, &msg)).into_response()
            }
            ApiError::NotFound(_, msg) => {
                (StatusCode::NOT_FOUND, ApiError::to_error_response(&code, &msg)).into_response()
            }
            ApiError::Conflict(_, msg) => {
                (StatusCode::CONFLICT, ApiError::to_error_response(&code, &msg)).into_response()
            }
            ApiError::BadGateway(_, msg) => {
                tracing::warn!(code = %code, "upstream failure: {msg}");
                (StatusCode::BAD_GATEWAY, ApiError::to_error_response(&code, &msg)).into_response()
            }
            ApiError::TooManyRequests(msg) => (
                StatusCode::TOO_MANY_REQUESTS,
                ApiError::to_error_response(&code, &msg),
            )
                .into_response(),
            ApiError::Internal(msg) => {
                tracing::error!("internal error: {msg}");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    ApiError::to_error_response("INTERNAL", "Something went wrong"),
                )
                    .into_response()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_codes_follow_variant() {
        let cases = [
            (ApiError::session_expired(), StatusCode::UNAUTHORIZED),
            (ApiError::validation("x"), StatusCode::BAD_REQUEST),
            (ApiError::not_found("order"), StatusCode::NOT_FOUND),
            (ApiError::Conflict("ALREADY_PAID", "x".into()), StatusCode::CONFLICT),
            (ApiError::BadGateway("PARTNER_ERROR", "x".into()), StatusCode::BAD_GATEWAY),
            (ApiError::TooManyRequests("x".into()), StatusCode::TOO_MANY_REQUESTS),
            (ApiError::Internal("x".into()), StatusCode::INTERNAL_SERVER_ERROR),
        ];
        for (err, status) in cases {
            assert_eq!(err.into_response().status(), status);
        }
    }

    #[test]
    fn code_is_exposed_for_logging() {
        assert_eq!(ApiError::validation("bad").code(), "VALIDATION_ERROR");
        assert_eq!(ApiError::Internal("boom".into()).code(), "INTERNAL");
    }
}
