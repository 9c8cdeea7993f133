use thiserror::Error;

/// Convenience alias for `Result<T, GraniteError>`.
pub type GraniteResult<T> = Result<T, GraniteError>;

/// Error classification for retry/escalation decisions.
///
/// - `Transient`: tablet not running, lease wait exceeded, write pause failed; retry later
/// - `ClientFixable`: malformed request, schema mismatch, duplicate key; do not retry as-is
/// - `Fatal`: local inconsistency; the tablet is marked FAILED
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Transient,
    ClientFixable,
    Fatal,
}

/// Top-level error type shared by every granite crate.
///
/// Cloneable so that a single terminal status can be delivered to many
/// waiters (aborted tasks, drained operations).
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum GraniteError {
    #[error("Service unavailable: {0}")]
    ServiceUnavailable(String),

    #[error("Timed out: {0}")]
    TimedOut(String),

    #[error("Try again: {0}")]
    TryAgain(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Already present: {0}")]
    AlreadyPresent(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Corruption: {0}")]
    Corruption(String),

    #[error("Illegal state: {0}")]
    IllegalState(String),

    #[error("Shutdown in progress: {0}")]
    ShutdownInProgress(String),

    #[error("Aborted: {0}")]
    Aborted(String),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Consensus error: {0}")]
    Consensus(#[from] ConsensusError),

    /// Should never occur. Carries a stable `error_code` for post-mortem grepping.
    #[error("InternalBug [{error_code}]: {message}")]
    InternalBug {
        error_code: &'static str,
        message: String,
    },
}

/// Storage engine errors.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StorageError {
    #[error("Memtable flush blocked: {0}")]
    FlushBlocked(String),

    #[error("Store is shutting down")]
    ShuttingDown,

    #[error("Snapshot not found: {0}")]
    SnapshotNotFound(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Compaction failed: {0}")]
    Compaction(String),
}

/// Consensus / replicated log errors.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConsensusError {
    #[error("Not the leader (term {term})")]
    NotLeader { term: u64 },

    #[error("Term mismatch: operation bound to term {bound}, current term {current}")]
    TermMismatch { bound: u64, current: u64 },

    #[error("Consensus is not running")]
    NotRunning,

    #[error("Leader has no lease")]
    LeaderHasNoLease,

    #[error("Log is closed")]
    LogClosed,

    #[error("Log index {index} has been garbage collected")]
    LogEntryGone { index: u64 },
}

// ── GraniteError classification & helpers ───────────────────────────────────

impl GraniteError {
    /// Classify this error for retry/escalation decisions.
    pub fn kind(&self) -> ErrorKind {
        match self {
            GraniteError::ServiceUnavailable(_)
            | GraniteError::TimedOut(_)
            | GraniteError::TryAgain(_)
            | GraniteError::ShutdownInProgress(_)
            | GraniteError::Aborted(_) => ErrorKind::Transient,

            GraniteError::Consensus(ConsensusError::NotLeader { .. })
            | GraniteError::Consensus(ConsensusError::TermMismatch { .. })
            | GraniteError::Consensus(ConsensusError::NotRunning)
            | GraniteError::Consensus(ConsensusError::LeaderHasNoLease) => ErrorKind::Transient,
            GraniteError::Storage(StorageError::ShuttingDown)
            | GraniteError::Storage(StorageError::FlushBlocked(_)) => ErrorKind::Transient,

            GraniteError::InvalidArgument(_)
            | GraniteError::AlreadyPresent(_)
            | GraniteError::NotFound(_)
            | GraniteError::Storage(StorageError::SnapshotNotFound(_)) => ErrorKind::ClientFixable,

            GraniteError::Corruption(_)
            | GraniteError::IllegalState(_)
            | GraniteError::InternalBug { .. }
            | GraniteError::Storage(StorageError::Serialization(_))
            | GraniteError::Storage(StorageError::Compaction(_))
            | GraniteError::Consensus(ConsensusError::LogClosed)
            | GraniteError::Consensus(ConsensusError::LogEntryGone { .. }) => ErrorKind::Fatal,
        }
    }

    /// Returns true if the caller may retry the same request later.
    pub fn is_retryable(&self) -> bool {
        matches!(self.kind(), ErrorKind::Transient)
    }

    /// Returns true if the error is a local inconsistency.
    pub fn is_fatal(&self) -> bool {
        matches!(self.kind(), ErrorKind::Fatal)
    }

    pub fn is_already_present(&self) -> bool {
        matches!(self, GraniteError::AlreadyPresent(_))
    }

    pub fn is_shutdown_in_progress(&self) -> bool {
        matches!(self, GraniteError::ShutdownInProgress(_))
    }

    pub fn is_aborted(&self) -> bool {
        matches!(self, GraniteError::Aborted(_))
    }

    pub fn is_timed_out(&self) -> bool {
        matches!(self, GraniteError::TimedOut(_))
    }

    pub fn is_illegal_state(&self) -> bool {
        matches!(self, GraniteError::IllegalState(_))
    }

    /// Short code used in service responses and metric labels.
    pub fn code(&self) -> &'static str {
        match self {
            GraniteError::ServiceUnavailable(_) => "SERVICE_UNAVAILABLE",
            GraniteError::TimedOut(_) => "TIMED_OUT",
            GraniteError::TryAgain(_) => "TRY_AGAIN",
            GraniteError::InvalidArgument(_) => "INVALID_ARGUMENT",
            GraniteError::AlreadyPresent(_) => "ALREADY_PRESENT",
            GraniteError::NotFound(_) => "NOT_FOUND",
            GraniteError::Corruption(_) => "CORRUPTION",
            GraniteError::IllegalState(_) => "ILLEGAL_STATE",
            GraniteError::ShutdownInProgress(_) => "SHUTDOWN_IN_PROGRESS",
            GraniteError::Aborted(_) => "ABORTED",
            GraniteError::Storage(_) => "STORAGE",
            GraniteError::Consensus(ConsensusError::NotLeader { .. }) => "NOT_THE_LEADER",
            GraniteError::Consensus(ConsensusError::LeaderHasNoLease) => "LEADER_HAS_NO_LEASE",
            GraniteError::Consensus(_) => "CONSENSUS",
            GraniteError::InternalBug { .. } => "INTERNAL_BUG",
        }
    }

    /// Construct an internal bug error.
    pub fn internal_bug(error_code: &'static str, message: impl Into<String>) -> Self {
        GraniteError::InternalBug {
            error_code,
            message: message.into(),
        }
    }

    /// Prefix the human-readable message with `context`, keeping the variant.
    pub fn with_context(self, context: &str) -> Self {
        let wrap = |msg: String| format!("{context}: {msg}");
        match self {
            GraniteError::ServiceUnavailable(m) => GraniteError::ServiceUnavailable(wrap(m)),
            GraniteError::TimedOut(m) => GraniteError::TimedOut(wrap(m)),
            GraniteError::TryAgain(m) => GraniteError::TryAgain(wrap(m)),
            GraniteError::InvalidArgument(m) => GraniteError::InvalidArgument(wrap(m)),
            GraniteError::AlreadyPresent(m) => GraniteError::AlreadyPresent(wrap(m)),
            GraniteError::NotFound(m) => GraniteError::NotFound(wrap(m)),
            GraniteError::Corruption(m) => GraniteError::Corruption(wrap(m)),
            GraniteError::IllegalState(m) => GraniteError::IllegalState(wrap(m)),
            GraniteError::ShutdownInProgress(m) => GraniteError::ShutdownInProgress(wrap(m)),
            GraniteError::Aborted(m) => GraniteError::Aborted(wrap(m)),
            GraniteError::InternalBug {
                error_code,
                message,
            } => GraniteError::InternalBug {
                error_code,
                message: wrap(message),
            },
            other @ (GraniteError::Storage(_) | GraniteError::Consensus(_)) => other,
        }
    }

    /// Log this error at error level if it is fatal.
    pub fn log_if_fatal(&self, tablet_id: &str) {
        if self.is_fatal() {
            tracing::error!(
                tablet_id = tablet_id,
                code = self.code(),
                error = %self,
                "fatal local error"
            );
        }
    }
}

/// Attach context to any `GraniteResult`.
pub trait ErrorContext<T> {
    fn ctx(self, context: &str) -> GraniteResult<T>;

    fn ctx_with<F: FnOnce() -> String>(self, f: F) -> GraniteResult<T>;
}

impl<T> ErrorContext<T> for GraniteResult<T> {
    fn ctx(self, context: &str) -> GraniteResult<T> {
        self.map_err(|e| e.with_context(context))
    }

    fn ctx_with<F: FnOnce() -> String>(self, f: F) -> GraniteResult<T> {
        self.map_err(|e| e.with_context(&f()))
    }
}

/// Return early with `GraniteError::IllegalState`.
#[macro_export]
macro_rules! bail_illegal_state {
    ($($arg:tt)*) => {
        return Err($crate::error::GraniteError::IllegalState(format!($($arg)*)))
    };
}

/// Return early with `GraniteError::InvalidArgument`.
#[macro_export]
macro_rules! bail_invalid_argument {
    ($($arg:tt)*) => {
        return Err($crate::error::GraniteError::InvalidArgument(format!($($arg)*)))
    };
}
