use chrono::TimeDelta;
use thiserror::Error;

/// A credential was presented but could not be trusted.
#[derive(Error, Debug)]
pub enum AuthenticationError {
    #[error("missing credentials")]
    MissingCredentials,

    #[error("invalid token: {0}")]
    InvalidToken(#[from] VerifyError),
}

/// Failure reported by a [`crate::principal::TokenVerifier`].
#[derive(Error, Debug)]
pub enum VerifyError {
    #[error("malformed token: {0}")]
    Malformed(String),

    #[error("unsupported signing algorithm")]
    UnsupportedAlgorithm,

    #[error("token header has no key id")]
    MissingKeyId,

    #[error("signing key not found")]
    UnknownKey,

    #[error("signing keys unavailable: {0}")]
    KeySource(String),

    #[error("token rejected: {0}")]
    Rejected(String),
}

/// A reservation request broke one of the booking rules.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdmissionError {
    #[error("reservation must end after it starts")]
    InvalidInterval,

    #[error("reservation exceeds the maximum slot length of {} minutes", .max.num_minutes())]
    DurationExceeded { max: TimeDelta },

    #[error("time slot is already booked")]
    SlotConflict,

    #[error(
        "booking quota reached: {} of {} minutes used",
        .used.num_minutes(),
        .quota.num_minutes()
    )]
    QuotaExceeded { used: TimeDelta, quota: TimeDelta },
}

impl AdmissionError {
    /// Stable machine-readable code for clients.
    pub fn code(&self) -> &'static str {
        match self {
            AdmissionError::InvalidInterval => "invalid_interval",
            AdmissionError::DurationExceeded { .. } => "duration_exceeded",
            AdmissionError::SlotConflict => "slot_conflict",
            AdmissionError::QuotaExceeded { .. } => "quota_exceeded",
        }
    }
}

/// Infrastructure failure in the reservation store. Details are for logs only.
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("store lock poisoned")]
    LockPoisoned,

    #[error("store task failed: {0}")]
    Task(#[from] tokio::task::JoinError),

    #[error("corrupt row: {0}")]
    Corrupt(String),
}

#[derive(Error, Debug)]
pub enum LedgerError {
    #[error(transparent)]
    Admission(#[from] AdmissionError),

    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// Outcome of a failed booking attempt through the hub.
#[derive(Error, Debug)]
pub enum BookingError {
    #[error(transparent)]
    Authentication(#[from] AuthenticationError),

    #[error("principal has no user identity")]
    NoIdentity,

    #[error(transparent)]
    Admission(#[from] AdmissionError),

    #[error(transparent)]
    Storage(#[from] StorageError),
}

impl From<LedgerError> for BookingError {
    fn from(err: LedgerError) -> Self {
        match err {
            LedgerError::Admission(e) => BookingError::Admission(e),
            LedgerError::Storage(e) => BookingError::Storage(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quota_message_reports_minutes() {
        let err = AdmissionError::QuotaExceeded {
            used: TimeDelta::minutes(90),
            quota: TimeDelta::minutes(120),
        };
        assert_eq!(err.to_string(), "booking quota reached: 90 of 120 minutes used");
        assert_eq!(err.code(), "quota_exceeded");
    }

    #[test]
    fn ledger_error_maps_into_booking_error() {
        let err: BookingError = LedgerError::Admission(AdmissionError::SlotConflict).into();
        assert!(matches!(err, BookingError::Admission(AdmissionError::SlotConflict)));
    }
}
