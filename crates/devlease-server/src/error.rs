use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use tracing::error;

use devlease::{AdmissionError, AuthenticationError, BookingError, StorageError};
use devlease_protocol::ErrorBody;

/// JSON error response: a status plus a stable `code` and readable `message`.
#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub body: ErrorBody,
}

impl ApiError {
    pub fn new(status: StatusCode, code: &str, message: impl Into<String>) -> Self {
        Self {
            status,
            body: ErrorBody {
                code: code.to_string(),
                message: message.into(),
            },
        }
    }

    pub fn internal() -> Self {
        Self::new(
            StatusCode::INTERNAL_SERVER_ERROR,
            "internal",
            "internal server error",
        )
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(self.body)).into_response()
    }
}

impl From<AuthenticationError> for ApiError {
    fn from(err: AuthenticationError) -> Self {
        match err {
            AuthenticationError::MissingCredentials => Self::new(
                StatusCode::UNAUTHORIZED,
                "missing_credentials",
                "missing bearer token",
            ),
            AuthenticationError::InvalidToken(_) => Self::new(
                StatusCode::FORBIDDEN,
                "invalid_token",
                "token is invalid or expired",
            ),
        }
    }
}

impl From<AdmissionError> for ApiError {
    fn from(err: AdmissionError) -> Self {
        let status = match err {
            AdmissionError::SlotConflict => StatusCode::CONFLICT,
            _ => StatusCode::BAD_REQUEST,
        };
        Self::new(status, err.code(), err.to_string())
    }
}

impl From<StorageError> for ApiError {
    fn from(err: StorageError) -> Self {
        error!(error = %err, "storage failure");
        Self::internal()
    }
}

impl From<BookingError> for ApiError {
    fn from(err: BookingError) -> Self {
        match err {
            BookingError::Authentication(e) => e.into(),
            BookingError::NoIdentity => Self::new(
                StatusCode::FORBIDDEN,
                "no_identity",
                "a user identity is required to book",
            ),
            BookingError::Admission(e) => e.into(),
            BookingError::Storage(e) => e.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeDelta;
    use devlease::VerifyError;

    #[test]
    fn admission_errors_map_to_client_statuses() {
        let conflict = ApiError::from(AdmissionError::SlotConflict);
        assert_eq!(conflict.status, StatusCode::CONFLICT);
        assert_eq!(conflict.body.code, "slot_conflict");

        let too_long = ApiError::from(AdmissionError::DurationExceeded {
            max: TimeDelta::hours(4),
        });
        assert_eq!(too_long.status, StatusCode::BAD_REQUEST);
        assert_eq!(too_long.body.code, "duration_exceeded");
    }

    #[test]
    fn authentication_errors_split_401_and_403() {
        assert_eq!(
            ApiError::from(AuthenticationError::MissingCredentials).status,
            StatusCode::UNAUTHORIZED
        );
        let invalid = ApiError::from(AuthenticationError::InvalidToken(VerifyError::UnknownKey));
        assert_eq!(invalid.status, StatusCode::FORBIDDEN);
        assert_eq!(invalid.body.code, "invalid_token");
    }

    #[test]
    fn storage_details_are_not_exposed() {
        let err = ApiError::from(BookingError::Storage(StorageError::LockPoisoned));
        assert_eq!(err.status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(err.body.message, "internal server error");
    }
}
