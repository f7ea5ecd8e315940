use thiserror::Error;

/// Error kinds the tracking core distinguishes. Socket paths answer with a
/// per-event error payload carrying [`TrackError::code`]; HTTP paths map
/// through `api::error::ApiError`. None of these abort the process.
#[derive(Debug, Error)]
pub enum TrackError {
    #[error("invalid or expired token")]
    AuthInvalid,

    #[error("token does not belong to a known driver")]
    AuthUnknown,

    #[error("no active assignment for this driver and bus")]
    NoActiveAssignment,

    #[error("coordinates out of range")]
    InvalidCoord,

    #[error("speed out of range (expected 0..=200 km/h)")]
    InvalidSpeed,

    #[error("heading out of range (expected 0..360 degrees)")]
    InvalidHeading,

    #[error("parameter out of range: {0}")]
    BadRange(String),

    #[error("store unavailable: {0}")]
    StoreUnavailable(#[from] sqlx::Error),
}

impl TrackError {
    /// Stable wire code sent in `*:error` payloads and HTTP error bodies.
    pub fn code(&self) -> &'static str {
        match self {
            TrackError::AuthInvalid => "AuthInvalid",
            TrackError::AuthUnknown => "AuthUnknown",
            TrackError::NoActiveAssignment => "NoActiveAssignment",
            TrackError::InvalidCoord => "InvalidCoord",
            TrackError::InvalidSpeed => "InvalidSpeed",
            TrackError::InvalidHeading => "InvalidHeading",
            TrackError::BadRange(_) => "BadRange",
            TrackError::StoreUnavailable(_) => "StoreUnavailable",
        }
    }

    /// Whether a driver-ingress write should be retried before the error
    /// is surfaced to the caller.
    pub fn is_retryable(&self) -> bool {
        matches!(self, TrackError::StoreUnavailable(_))
    }
}
