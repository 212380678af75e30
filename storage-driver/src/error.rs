use std::backtrace::Backtrace;
use std::error::Error as StdError;
use std::fmt;
use std::io;

use tracing_error::SpanTrace;

/// Categorizes storage errors by their semantic meaning, independent of
/// the driver that produced them.
///
/// Callers branch on the kind rather than on error messages: a registry
/// lookup treats [`StorageErrorKind::NotFound`] as "absent", and everything
/// else as a failure of the storage medium.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StorageErrorKind {
    /// The requested object or bucket does not exist.
    ///
    /// **Retryable:** No.
    NotFound,

    /// The driver is not allowed to touch the object.
    ///
    /// **Retryable:** No, unless permissions change.
    PermissionDenied,

    /// Disk or network failure while moving bytes.
    ///
    /// **Retryable:** Maybe, depending on whether the failure is transient.
    Io,

    /// The backing service is temporarily unavailable.
    ///
    /// **Retryable:** Yes, with backoff.
    ServiceUnavailable,

    /// Credentials for the backing service expired.
    ///
    /// **Retryable:** Yes, after refreshing credentials.
    AuthExpired,

    /// The request itself was invalid, e.g. a positional write past the end
    /// of an object.
    ///
    /// **Retryable:** No.
    InvalidRequest,

    /// The driver already retried and gave up.
    ///
    /// **Retryable:** No.
    RetriesExhausted,

    /// Stored data could not be encoded or decoded.
    ///
    /// **Retryable:** No.
    SerializationError,

    /// Anything else.
    Other,
}

impl StorageErrorKind {
    /// Classify an [`io::Error`].
    pub fn from_io(err: &io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::NotFound => StorageErrorKind::NotFound,
            io::ErrorKind::PermissionDenied => StorageErrorKind::PermissionDenied,
            io::ErrorKind::InvalidInput => StorageErrorKind::InvalidRequest,
            io::ErrorKind::InvalidData => StorageErrorKind::SerializationError,
            _ => StorageErrorKind::Io,
        }
    }

    /// Returns whether this error kind typically indicates a retryable condition.
    ///
    /// This is advisory only, callers decide how many attempts make sense.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            StorageErrorKind::ServiceUnavailable
                | StorageErrorKind::AuthExpired
                | StorageErrorKind::Io
        )
    }

    /// Returns whether this error indicates a client-side fault (bad request, invalid params).
    pub fn is_client_fault(&self) -> bool {
        matches!(
            self,
            StorageErrorKind::InvalidRequest
                | StorageErrorKind::PermissionDenied
                | StorageErrorKind::SerializationError
        )
    }

    /// Returns whether this error indicates a server-side fault (service issues).
    pub fn is_server_fault(&self) -> bool {
        matches!(
            self,
            StorageErrorKind::ServiceUnavailable | StorageErrorKind::RetriesExhausted
        )
    }
}

impl fmt::Display for StorageErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StorageErrorKind::NotFound => write!(f, "not found"),
            StorageErrorKind::PermissionDenied => write!(f, "permission denied"),
            StorageErrorKind::Io => write!(f, "I/O error"),
            StorageErrorKind::ServiceUnavailable => write!(f, "service unavailable"),
            StorageErrorKind::AuthExpired => write!(f, "authentication expired"),
            StorageErrorKind::InvalidRequest => write!(f, "invalid request"),
            StorageErrorKind::RetriesExhausted => write!(f, "retries exhausted"),
            StorageErrorKind::SerializationError => write!(f, "serialization error"),
            StorageErrorKind::Other => write!(f, "other error"),
        }
    }
}

#[derive(Debug)]
struct ErrorTrace {
    /// Capture is controlled by `RUST_BACKTRACE`.
    backtrace: Backtrace,

    /// Span context at the point where the error was created, which is the
    /// logical async call stack.
    span_trace: SpanTrace,
}

impl ErrorTrace {
    #[track_caller]
    fn capture() -> Self {
        ErrorTrace {
            backtrace: Backtrace::capture(),
            span_trace: SpanTrace::capture(),
        }
    }
}

/// Storage error with a semantic kind and the bucket/path it concerns.
///
/// # Example
///
/// ```rust
/// use storage_driver::{StorageError, StorageErrorKind};
///
/// fn stat_upload() -> Result<(), StorageError> {
///     match std::fs::metadata("missing/data") {
///         Err(err) => Err(StorageError::builder("local", StorageErrorKind::from_io(&err), err)
///             .bucket("registry")
///             .path("missing/data")
///             .build()),
///         Ok(_) => Ok(()),
///     }
/// }
///
/// assert!(stat_upload().unwrap_err().is_not_found());
/// ```
#[derive(Debug)]
pub struct StorageError {
    kind: StorageErrorKind,

    /// The name of the driver that produced this error.
    engine: &'static str,

    bucket: Option<String>,

    path: Option<String>,

    /// Free-form description of the operation that failed.
    context: Option<String>,

    source: Box<dyn StdError + Send + Sync + 'static>,

    traces: Box<ErrorTrace>,
}

impl StdError for StorageError {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        Some(self.source.as_ref())
    }
}

impl StorageError {
    /// Create a new storage error with the minimum required information.
    ///
    /// For more context, use [`StorageError::builder`].
    #[track_caller]
    pub fn new<E>(engine: &'static str, kind: StorageErrorKind, error: E) -> Self
    where
        E: Into<Box<dyn StdError + Send + Sync + 'static>>,
    {
        Self {
            kind,
            engine,
            bucket: None,
            path: None,
            context: None,
            source: error.into(),
            traces: Box::new(ErrorTrace::capture()),
        }
    }

    /// Create a storage error from an [`io::Error`], classifying it with
    /// [`StorageErrorKind::from_io`].
    #[track_caller]
    pub fn io(engine: &'static str, error: io::Error) -> StorageErrorBuilder {
        let kind = StorageErrorKind::from_io(&error);
        Self::builder(engine, kind, error)
    }

    /// Create a builder for a storage error with bucket, path and context.
    ///
    /// ```rust
    /// use storage_driver::{StorageError, StorageErrorKind};
    ///
    /// let error = StorageError::builder(
    ///     "memory",
    ///     StorageErrorKind::NotFound,
    ///     std::io::Error::new(std::io::ErrorKind::NotFound, "object not found"),
    /// )
    /// .bucket("registry")
    /// .path("blobs/sha256/ab/data")
    /// .context("metadata")
    /// .build();
    /// assert_eq!(error.path(), Some("blobs/sha256/ab/data"));
    /// ```
    pub fn builder<E>(engine: &'static str, kind: StorageErrorKind, error: E) -> StorageErrorBuilder
    where
        E: Into<Box<dyn StdError + Send + Sync + 'static>>,
    {
        StorageErrorBuilder {
            engine,
            kind,
            source: error.into(),
            bucket: None,
            path: None,
            context: None,
        }
    }

    /// Returns a boxed closure that creates a storage error from a downstream error.
    ///
    /// Useful with `.map_err()`:
    ///
    /// ```rust
    /// use storage_driver::{StorageError, StorageErrorKind};
    ///
    /// fn operation() -> Result<(), StorageError> {
    ///     std::fs::File::open("file.txt")
    ///         .map_err(StorageError::with("local", StorageErrorKind::Io))?;
    ///     Ok(())
    /// }
    /// # assert!(operation().is_err());
    /// ```
    pub fn with<E>(
        engine: &'static str,
        kind: StorageErrorKind,
    ) -> Box<dyn FnOnce(E) -> StorageError + Send + Sync>
    where
        E: Into<Box<dyn StdError + Send + Sync + 'static>>,
    {
        Box::new(move |error: E| StorageError::new(engine, kind, error))
    }

    /// Returns the error kind.
    pub fn kind(&self) -> StorageErrorKind {
        self.kind
    }

    /// Shorthand for `kind() == StorageErrorKind::NotFound`.
    pub fn is_not_found(&self) -> bool {
        self.kind == StorageErrorKind::NotFound
    }

    /// Returns the storage engine name.
    pub fn engine(&self) -> &'static str {
        self.engine
    }

    /// Returns the bucket name, if available.
    pub fn bucket(&self) -> Option<&str> {
        self.bucket.as_deref()
    }

    /// Returns the object path, if available.
    pub fn path(&self) -> Option<&str> {
        self.path.as_deref()
    }

    /// Returns additional context, if available.
    pub fn context(&self) -> Option<&str> {
        self.context.as_deref()
    }

    /// Returns whether this error is likely retryable.
    pub fn is_retryable(&self) -> bool {
        self.kind.is_retryable()
    }

    /// Returns whether this error indicates a client-side fault.
    pub fn is_client_fault(&self) -> bool {
        self.kind.is_client_fault()
    }

    /// Returns whether this error indicates a server-side fault.
    pub fn is_server_fault(&self) -> bool {
        self.kind.is_server_fault()
    }

    /// Returns a reference to the captured backtrace.
    pub fn backtrace(&self) -> &Backtrace {
        &self.traces.backtrace
    }

    /// Returns the tracing span context captured when this error was created.
    pub fn span_trace(&self) -> &SpanTrace {
        &self.traces.span_trace
    }
}

impl fmt::Display for StorageError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Storage error [{}] from {}", self.kind, self.engine)?;

        if let Some(bucket) = &self.bucket {
            write!(f, " (bucket: {})", bucket)?;
        }

        if let Some(path) = &self.path {
            write!(f, " (path: {})", path)?;
        }

        if let Some(context) = &self.context {
            write!(f, " ({})", context)?;
        }

        write!(f, ": {}", self.source)
    }
}

/// Builder for a [`StorageError`] with optional context fields.
#[derive(Debug)]
pub struct StorageErrorBuilder {
    kind: StorageErrorKind,
    engine: &'static str,
    source: Box<dyn StdError + Send + Sync + 'static>,
    bucket: Option<String>,
    path: Option<String>,
    context: Option<String>,
}

impl StorageErrorBuilder {
    /// Set the bucket name.
    pub fn bucket(mut self, bucket: impl Into<String>) -> Self {
        self.bucket = Some(bucket.into());
        self
    }

    /// Set the object path.
    pub fn path(mut self, path: impl Into<String>) -> Self {
        self.path = Some(path.into());
        self
    }

    /// Set additional context.
    pub fn context(mut self, context: impl Into<String>) -> Self {
        self.context = Some(context.into());
        self
    }

    /// Build the `StorageError`.
    #[track_caller]
    pub fn build(self) -> StorageError {
        StorageError {
            kind: self.kind,
            engine: self.engine,
            bucket: self.bucket,
            path: self.path,
            context: self.context,
            source: self.source,
            traces: Box::new(ErrorTrace::capture()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn io_errors_are_classified() {
        let err = StorageError::io(
            "test",
            io::Error::new(io::ErrorKind::NotFound, "no such object"),
        )
        .bucket("registry")
        .path("blobs/sha256/00/data")
        .build();

        assert!(err.is_not_found());
        assert!(!err.is_retryable());
        assert_eq!(err.bucket(), Some("registry"));

        let err = StorageError::io("test", io::Error::other("disk on fire")).build();
        assert_eq!(err.kind(), StorageErrorKind::Io);
        assert!(err.is_retryable());
    }

    #[test]
    fn display_includes_context() {
        let err = StorageError::builder(
            "memory",
            StorageErrorKind::InvalidRequest,
            io::Error::new(io::ErrorKind::InvalidInput, "offset past end"),
        )
        .path("uploads/data")
        .context("write_at")
        .build();

        let message = err.to_string();
        assert!(message.contains("invalid request"));
        assert!(message.contains("uploads/data"));
        assert!(message.contains("write_at"));
        assert!(message.ends_with("offset past end"));
    }
}
