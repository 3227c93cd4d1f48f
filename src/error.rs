use thiserror::Error;

use crate::cloudcode::reset::format_duration;

#[derive(Debug, Error)]
pub enum Error {
    #[error("authentication error: {0}")]
    Auth(#[from] AuthError),

    #[error("api error: {0}")]
    Api(#[from] ApiError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("http error: {0}")]
    Http(String),
}

#[derive(Debug, Error)]
pub enum AuthError {
    /// The refresh exchange was rejected. Sticky until re-auth.
    #[error("account {email} is invalid: {reason}")]
    Invalid { email: String, reason: String },

    /// Transient transport failure during the refresh exchange. The account
    /// stays valid and the request is retried on another account.
    #[error("token refresh network error: {0}")]
    Network(String),

    /// The backend rejected the access token (401) on every endpoint.
    #[error("access token rejected by backend")]
    TokenRejected,

    /// The account carries no credential for its source.
    #[error("account {email} has no usable credential")]
    MissingCredential { email: String },

    #[error("project discovery failed: {0}")]
    ProjectDiscovery(String),
}

#[derive(Debug, Error)]
pub enum ApiError {
    /// Every account is rate-limited for the model and the shortest wait
    /// exceeds the configured cap.
    #[error("all accounts exhausted on {model}; quota resets in {}", format_duration(reset_at.saturating_sub(*now)))]
    ResourceExhausted { model: String, reset_at: u64, now: u64 },

    /// One account hit 429 on every endpoint. Retried on the next account.
    #[error("rate limited on {model}; retry in {}", format_duration(*reset_ms))]
    RateLimited { model: String, reset_ms: u64 },

    #[error("no accounts available")]
    NoAccountsAvailable,

    #[error("request attempts exhausted")]
    MaxRetriesExceeded,

    #[error("invalid request: {message}")]
    InvalidRequest { message: String },

    #[error("upstream client error ({status}): {body}")]
    Upstream4xx { status: u16, body: String },

    #[error("upstream server error ({status})")]
    Upstream5xx { status: u16 },

    #[error("request body too large: {size} bytes (max: {max} bytes)")]
    RequestTooLarge { size: usize, max: usize },
}

impl Error {
    /// Stable Anthropic-style `error.type` tag for the public API.
    pub fn wire_type(&self) -> &'static str {
        match self {
            Error::Auth(AuthError::Invalid { .. }) | Error::Auth(AuthError::TokenRejected) => {
                "authentication_error"
            }
            Error::Auth(_) => "api_error",
            Error::Api(ApiError::ResourceExhausted { .. })
            | Error::Api(ApiError::RateLimited { .. }) => "rate_limit_error",
            Error::Api(ApiError::NoAccountsAvailable) => "overloaded_error",
            Error::Api(ApiError::InvalidRequest { .. })
            | Error::Api(ApiError::Upstream4xx { .. })
            | Error::Api(ApiError::RequestTooLarge { .. })
            | Error::Json(_) => "invalid_request_error",
            _ => "api_error",
        }
    }

    /// HTTP status surfaced to the caller for this error.
    pub fn status_code(&self) -> u16 {
        match self {
            Error::Auth(AuthError::Invalid { .. }) | Error::Auth(AuthError::TokenRejected) => 401,
            Error::Api(ApiError::ResourceExhausted { .. })
            | Error::Api(ApiError::RateLimited { .. }) => 429,
            Error::Api(ApiError::NoAccountsAvailable) => 503,
            Error::Api(ApiError::InvalidRequest { .. }) | Error::Json(_) => 400,
            Error::Api(ApiError::Upstream4xx { status, .. }) => *status,
            Error::Api(ApiError::RequestTooLarge { .. }) => 413,
            _ => 502,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
