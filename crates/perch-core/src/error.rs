//! Error types for the Perch federation control plane

/// Result type alias using [`Error`]
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Main error type shared across the federation control plane
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Malformed federation URL
    #[error("invalid federation URL: {0}")]
    BadUrl(String),

    /// Unrecognized query option under strict validation
    #[error("unrecognized query option: {0}")]
    UnknownQuery(String),

    /// Schemeless path with no discovery endpoint configured
    #[error("no discovery endpoint available for {0}")]
    NoDiscovery(String),

    /// Federation metadata discovery failed
    #[error("federation discovery failed: {0}")]
    DiscoveryFailed(String),

    /// The director could not be reached at all
    #[error("director unreachable: {0}")]
    DirectorUnreachable(String),

    /// Transient director-side failure worth retrying
    #[error("transient director error ({status}): {message}")]
    DirectorTransient {
        /// HTTP status observed
        status: u16,
        /// Body or status text
        message: String,
    },

    /// No namespace registered for the requested path
    #[error("namespace not registered for path: {0}")]
    NamespaceNotFound(String),

    /// Object not found at any server
    #[error("object not found: {0}")]
    NotFound(String),

    /// Authentication or authorization failure
    #[error("access denied: {0}")]
    Forbidden(String),

    /// A credential is required but none could be acquired
    #[error("credential is required for {0}")]
    CredentialRequired(String),

    /// No server can satisfy the request
    #[error("no suitable server found for {0}")]
    NoCandidates(String),

    /// Advertisement failed verification at ingest
    #[error("advertisement rejected: {0}")]
    AdRejected(String),

    /// A capability was claimed that the registry has not approved
    #[error("capability not approved: {0}")]
    CapabilityViolation(String),

    /// Per-attempt transfer failure
    #[error("transfer failed: {0}")]
    Transfer(String),

    /// The operation was cancelled before completion
    #[error("operation cancelled")]
    Cancelled,

    /// The operation exceeded its deadline
    #[error("operation timed out after {0:?}")]
    Timeout(std::time::Duration),

    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// HTTP protocol error
    #[error("HTTP error: {0}")]
    Http(#[from] http::Error),

    /// Internal error (should not happen in production)
    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Convert error to HTTP status code
    pub fn to_status_code(&self) -> http::StatusCode {
        use http::StatusCode;
        match self {
            Error::BadUrl(_) | Error::UnknownQuery(_) | Error::AdRejected(_) => {
                StatusCode::BAD_REQUEST
            }
            Error::NamespaceNotFound(_) | Error::NotFound(_) => StatusCode::NOT_FOUND,
            Error::Forbidden(_) | Error::CredentialRequired(_) => StatusCode::FORBIDDEN,
            Error::CapabilityViolation(_) => StatusCode::UNPROCESSABLE_ENTITY,
            Error::NoCandidates(_) | Error::DirectorUnreachable(_) => StatusCode::BAD_GATEWAY,
            Error::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
            Error::DirectorTransient { status, .. } => {
                StatusCode::from_u16(*status).unwrap_or(StatusCode::BAD_GATEWAY)
            }
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Whether the client retry loop should attempt again after this error
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::DiscoveryFailed(_)
                | Error::DirectorUnreachable(_)
                | Error::DirectorTransient { .. }
        )
    }

    /// CLI process exit code for this error
    pub fn exit_code(&self) -> i32 {
        match self {
            Error::NotFound(_) | Error::NamespaceNotFound(_) => 2,
            Error::Forbidden(_) | Error::CredentialRequired(_) => 3,
            Error::BadUrl(_) | Error::UnknownQuery(_) | Error::NoDiscovery(_) => 4,
            _ => 1,
        }
    }
}
