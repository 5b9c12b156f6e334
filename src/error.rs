//! Error handling for the scanner bridge

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;

/// Error types
///
/// Every user-visible failure maps onto one of the wire `errorCode` values
/// via [`Error::code`]; the `Display` text becomes the human-readable
/// `message` of the error envelope.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Missing or unusable credentials
    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    /// Token not known to the session store
    #[error("Invalid token: {0}")]
    InvalidToken(String),

    /// Token known but past its expiry
    #[error("Token expired: {0}")]
    TokenExpired(String),

    /// Malformed frame, unknown action, missing required field
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// Unknown backend, unknown device, or device open failure
    #[error("Scanner not found: {0}")]
    ScannerNotFound(String),

    /// Scan already in progress for this session or on the shared device
    #[error("Scanner busy: {0}")]
    ScannerBusy(String),

    /// Acquisition could not start or died mid-job
    #[error("Scan failed: {0}")]
    ScanFailed(String),

    /// Headless acquisition refused by the driver; retry with showUI enabled
    #[error("Scan failed: {0}. Retry with showUI set to true")]
    UiRequired(String),

    /// No backend exposes any device
    #[error("No scanners available: {0}")]
    NoScanners(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// HTTP client error
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Machine-readable error code for the wire envelope
    pub fn code(&self) -> &'static str {
        match self {
            Error::Unauthorized(_) => "UNAUTHORIZED",
            Error::InvalidToken(_) => "INVALID_TOKEN",
            Error::TokenExpired(_) => "TOKEN_EXPIRED",
            Error::InvalidRequest(_) => "INVALID_REQUEST",
            Error::ScannerNotFound(_) => "SCANNER_NOT_FOUND",
            Error::ScannerBusy(_) => "SCANNER_BUSY",
            Error::ScanFailed(_) | Error::UiRequired(_) => "SCAN_FAILED",
            Error::NoScanners(_) => "NO_SCANNERS_AVAILABLE",
            Error::Serialization(_) | Error::Http(_) | Error::Io(_) | Error::Internal(_) => {
                "INTERNAL_ERROR"
            }
        }
    }
}
