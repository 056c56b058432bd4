//! Error types for the extraction pipeline.

/// Result type alias for pipeline operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in the extraction pipeline.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    // =========================================================================
    // Input Errors
    // =========================================================================
    /// Failed to parse a layer descriptor line.
    #[error("invalid layer descriptor: {0}")]
    InvalidDescriptor(String),

    /// Failed to parse a repository reference.
    #[error("invalid reference '{reference}': {reason}")]
    InvalidReference { reference: String, reason: String },

    // =========================================================================
    // Admission Errors
    // =========================================================================
    /// Estimated reservation could not be granted.
    #[error("not enough storage for layer {digest} ({requested} bytes requested)")]
    ReservationDenied { digest: String, requested: u64 },

    // =========================================================================
    // Fetch Errors
    // =========================================================================
    /// HTTP client construction failed.
    #[error("failed to build registry client: {0}")]
    ClientBuild(String),

    /// Token endpoint rejected the auth request.
    #[error("auth failed for scope '{scope}': {reason}")]
    AuthFailed { scope: String, reason: String },

    /// Transport-level failure (DNS, TCP, TLS, non-retryable HTTP).
    #[error("failed to fetch blob {digest}: {reason}")]
    BlobFetchFailed { digest: String, reason: String },

    /// Registry answered 429 too many requests.
    #[error("rate limited while fetching {digest}")]
    RateLimited { digest: String },

    /// Registry answered an HTTP/2 500; the fetcher sheds its client.
    #[error("transient http2 500 for {digest}")]
    ServerTransient { digest: String },

    // =========================================================================
    // Scan Errors
    // =========================================================================
    /// Unrecoverable gzip/tar decoder failure; the layer is partially scanned.
    #[error("decode error in layer {digest}: {reason}")]
    Decode { digest: String, reason: String },

    /// A detection rule failed to compile.
    #[error("invalid detection rule '{id}': {reason}")]
    InvalidRule { id: String, reason: String },

    // =========================================================================
    // Sink Errors
    // =========================================================================
    /// Any write, rotate, or compress failure. Fatal to the sink.
    #[error("sink failure: {0}")]
    Sink(String),

    // =========================================================================
    // I/O Errors
    // =========================================================================
    /// Generic I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Record serialization error.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}
