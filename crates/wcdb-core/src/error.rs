//! Error types for WCDB operations.

use std::fmt;

/// The primary error type for all WCDB operations.
#[derive(Debug)]
pub enum Error {
    /// Statement text could not be compiled; the statement stays unprepared
    Compile(EngineError),
    /// Parameter index out of range or rejected by the engine
    Bind(EngineError),
    /// Execution failed mid-statement (constraint, corruption, I/O, abort)
    Step(EngineError),
    /// A connection could not be acquired
    HandleUnavailable(HandleError),
    /// A cancellation signal fired during a cancellable operation
    Cancelled,
    /// Programmer error: use after invalidate, double finalize, unbalanced transactions
    Contract(ContractViolation),
    /// Row extraction into a typed value failed
    Type(TypeError),
    /// Configuration errors
    Config(ConfigError),
    /// File system errors from maintenance operations
    Io(std::io::Error),
}

/// Severity attached to an engine error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Level {
    Ignore,
    Debug,
    Notice,
    Warning,
    Error,
    Fatal,
}

impl Level {
    pub const fn as_str(self) -> &'static str {
        match self {
            Level::Ignore => "IGNORE",
            Level::Debug => "DEBUG",
            Level::Notice => "NOTICE",
            Level::Warning => "WARNING",
            Level::Error => "ERROR",
            Level::Fatal => "FATAL",
        }
    }
}

/// An error reported by the native engine.
///
/// The message is the engine's own text, never rewritten.
#[derive(Debug, Clone)]
pub struct EngineError {
    /// Primary result code (low byte of the extended code)
    pub code: i32,
    /// Extended result code
    pub extended_code: i32,
    pub level: Level,
    pub message: String,
    pub sql: Option<String>,
    pub path: Option<String>,
    pub tag: Option<i64>,
}

/// Coarse classification of a native result code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineErrorKind {
    /// SQL error or missing database object
    Sql,
    /// Constraint violation (unique, not null, check, foreign key)
    Constraint,
    /// Database file is malformed or not a database
    Corrupt,
    /// Database or table is locked
    Busy,
    /// Operation interrupted
    Interrupted,
    /// Disk I/O, disk full, cannot open
    Io,
    /// Attempt to write a read-only database
    ReadOnly,
    /// Misuse of the engine interface
    Misuse,
    /// Parameter index out of range
    Range,
    /// Callback requested abort
    Abort,
    /// Anything else
    Other,
}

// Primary result codes of the engine's C interface.
pub(crate) const CODE_ERROR: i32 = 1;
pub(crate) const CODE_ABORT: i32 = 4;
pub(crate) const CODE_BUSY: i32 = 5;
pub(crate) const CODE_LOCKED: i32 = 6;
pub(crate) const CODE_NOMEM: i32 = 7;
pub(crate) const CODE_READONLY: i32 = 8;
pub(crate) const CODE_INTERRUPT: i32 = 9;
pub(crate) const CODE_IOERR: i32 = 10;
pub(crate) const CODE_CORRUPT: i32 = 11;
pub(crate) const CODE_FULL: i32 = 13;
pub(crate) const CODE_CANTOPEN: i32 = 14;
pub(crate) const CODE_CONSTRAINT: i32 = 19;
pub(crate) const CODE_MISUSE: i32 = 21;
pub(crate) const CODE_RANGE: i32 = 25;
pub(crate) const CODE_NOTADB: i32 = 26;

impl EngineError {
    /// Create an engine error from an extended result code and message.
    pub fn new(extended_code: i32, message: impl Into<String>) -> Self {
        let code = extended_code & 0xff;
        Self {
            code,
            extended_code,
            level: Self::level_for(code),
            message: message.into(),
            sql: None,
            path: None,
            tag: None,
        }
    }

    /// Attach the SQL text that produced this error.
    pub fn with_sql(mut self, sql: impl Into<String>) -> Self {
        self.sql = Some(sql.into());
        self
    }

    /// Attach the database path.
    pub fn with_path(mut self, path: impl Into<String>) -> Self {
        self.path = Some(path.into());
        self
    }

    /// Attach the database tag.
    pub fn with_tag(mut self, tag: Option<i64>) -> Self {
        self.tag = tag;
        self
    }

    pub fn kind(&self) -> EngineErrorKind {
        match self.code {
            CODE_ERROR => EngineErrorKind::Sql,
            CODE_CONSTRAINT => EngineErrorKind::Constraint,
            CODE_CORRUPT | CODE_NOTADB => EngineErrorKind::Corrupt,
            CODE_BUSY | CODE_LOCKED => EngineErrorKind::Busy,
            CODE_INTERRUPT => EngineErrorKind::Interrupted,
            CODE_IOERR | CODE_FULL | CODE_CANTOPEN => EngineErrorKind::Io,
            CODE_READONLY => EngineErrorKind::ReadOnly,
            CODE_MISUSE => EngineErrorKind::Misuse,
            CODE_RANGE => EngineErrorKind::Range,
            CODE_ABORT => EngineErrorKind::Abort,
            _ => EngineErrorKind::Other,
        }
    }

    /// Is the database file damaged?
    pub fn is_corruption(&self) -> bool {
        self.kind() == EngineErrorKind::Corrupt
    }

    fn level_for(code: i32) -> Level {
        match code {
            CODE_CORRUPT | CODE_NOTADB | CODE_NOMEM | CODE_FULL | CODE_IOERR => Level::Fatal,
            CODE_MISUSE => Level::Fatal,
            CODE_BUSY | CODE_LOCKED => Level::Warning,
            CODE_INTERRUPT => Level::Notice,
            _ => Level::Error,
        }
    }
}

#[derive(Debug)]
pub struct HandleError {
    pub kind: HandleErrorKind,
    pub message: String,
    /// The database's last engine error, when acquisition failed natively
    pub cause: Option<EngineError>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandleErrorKind {
    /// The database is blockaded and the acquire timeout elapsed
    Blockaded,
    /// The database has been closed
    Closed,
    /// The native connection could not be opened
    OpenFailed,
    /// Waiting for a connection timed out
    Timeout,
    /// The pool has no capacity left
    Exhausted,
}

impl HandleError {
    pub fn new(kind: HandleErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            cause: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ContractViolation {
    pub kind: ContractKind,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContractKind {
    /// Operation on an invalidated handle
    UseAfterInvalidate,
    /// Operation on a finalized statement
    UseAfterFinalize,
    /// Commit or rollback without a matching begin
    NoTransaction,
    /// Extraction while not positioned on a row
    NoRow,
    /// Column index outside the result set
    ColumnOutOfRange,
    /// Operation that needs a compiled statement
    NotPrepared,
}

impl ContractViolation {
    pub fn new(kind: ContractKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

#[derive(Debug)]
pub struct TypeError {
    pub expected: &'static str,
    pub actual: String,
    pub column: Option<String>,
}

#[derive(Debug)]
pub struct ConfigError {
    pub message: String,
}

impl Error {
    /// Build a contract violation error.
    pub fn contract(kind: ContractKind, message: impl Into<String>) -> Self {
        Error::Contract(ContractViolation::new(kind, message))
    }

    /// Build a handle-unavailable error.
    pub fn unavailable(kind: HandleErrorKind, message: impl Into<String>) -> Self {
        Error::HandleUnavailable(HandleError::new(kind, message))
    }

    /// The engine error carried by this error, if any.
    pub fn engine(&self) -> Option<&EngineError> {
        match self {
            Error::Compile(e) | Error::Bind(e) | Error::Step(e) => Some(e),
            Error::HandleUnavailable(h) => h.cause.as_ref(),
            _ => None,
        }
    }

    /// Primary native result code, if this error came from the engine.
    pub fn code(&self) -> Option<i32> {
        self.engine().map(|e| e.code)
    }

    /// Extended native result code, if this error came from the engine.
    pub fn extended_code(&self) -> Option<i32> {
        self.engine().map(|e| e.extended_code)
    }

    /// Get the SQL that caused this error, if available.
    pub fn sql(&self) -> Option<&str> {
        self.engine().and_then(|e| e.sql.as_deref())
    }

    /// Does this error indicate a damaged database file?
    pub fn is_corruption(&self) -> bool {
        self.engine().is_some_and(EngineError::is_corruption)
    }

    /// Is this a retryable error (busy, locked, acquisition timeout)?
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Step(e) => e.kind() == EngineErrorKind::Busy,
            Error::HandleUnavailable(h) => matches!(
                h.kind,
                HandleErrorKind::Timeout | HandleErrorKind::Exhausted | HandleErrorKind::Blockaded
            ),
            _ => false,
        }
    }

    /// Is this a programmer error?
    pub fn is_contract_violation(&self) -> bool {
        matches!(self, Error::Contract(_))
    }

    pub fn contract_kind(&self) -> Option<ContractKind> {
        match self {
            Error::Contract(c) => Some(c.kind),
            _ => None,
        }
    }

    /// Severity of this error.
    pub fn level(&self) -> Level {
        match self {
            Error::Compile(e) | Error::Bind(e) | Error::Step(e) => e.level,
            Error::HandleUnavailable(_) => Level::Error,
            Error::Cancelled => Level::Notice,
            Error::Contract(_) => Level::Fatal,
            Error::Type(_) | Error::Config(_) => Level::Error,
            Error::Io(_) => Level::Error,
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Compile(e) => write!(f, "Compile error: {}", e),
            Error::Bind(e) => write!(f, "Bind error: {}", e),
            Error::Step(e) => write!(f, "Step error: {}", e),
            Error::HandleUnavailable(e) => write!(f, "Handle unavailable: {}", e),
            Error::Cancelled => write!(f, "Operation cancelled"),
            Error::Contract(e) => write!(f, "Contract violation: {}", e.message),
            Error::Type(e) => write!(f, "Type error: {}", e),
            Error::Config(e) => write!(f, "Configuration error: {}", e.message),
            Error::Io(e) => write!(f, "I/O error: {}", e),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Io(e) => Some(e),
            Error::HandleUnavailable(h) => h
                .cause
                .as_ref()
                .map(|e| e as &(dyn std::error::Error + 'static)),
            _ => None,
        }
    }
}

impl fmt::Display for EngineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.extended_code, self.message)?;
        if let Some(sql) = &self.sql {
            write!(f, " (SQL: {})", sql)?;
        }
        Ok(())
    }
}

impl std::error::Error for EngineError {}

impl fmt::Display for HandleError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.cause {
            Some(cause) => write!(f, "{}: {}", self.message, cause),
            None => write!(f, "{}", self.message),
        }
    }
}

impl fmt::Display for ContractViolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl fmt::Display for TypeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(col) = &self.column {
            write!(
                f,
                "expected {} for column '{}', found {}",
                self.expected, col, self.actual
            )
        } else {
            write!(f, "expected {}, found {}", self.expected, self.actual)
        }
    }
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Io(err)
    }
}

impl From<HandleError> for Error {
    fn from(err: HandleError) -> Self {
        Error::HandleUnavailable(err)
    }
}

impl From<ContractViolation> for Error {
    fn from(err: ContractViolation) -> Self {
        Error::Contract(err)
    }
}

impl From<TypeError> for Error {
    fn from(err: TypeError) -> Self {
        Error::Type(err)
    }
}

impl From<ConfigError> for Error {
    fn from(err: ConfigError) -> Self {
        Error::Config(err)
    }
}

/// Result type alias for WCDB operations.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extended_code_splits_primary() {
        // SQLITE_CONSTRAINT_UNIQUE
        let err = EngineError::new(2067, "UNIQUE constraint failed: t.a").with_sql("INSERT");
        assert_eq!(err.code, CODE_CONSTRAINT);
        assert_eq!(err.kind(), EngineErrorKind::Constraint);
        assert_eq!(err.level, Level::Error);

        let err = Error::Step(err);
        assert_eq!(err.code(), Some(CODE_CONSTRAINT));
        assert_eq!(err.extended_code(), Some(2067));
        assert_eq!(err.sql(), Some("INSERT"));
        assert!(!err.is_corruption());
    }

    #[test]
    fn corruption_is_fatal() {
        let err = Error::Step(EngineError::new(CODE_NOTADB, "file is not a database"));
        assert!(err.is_corruption());
        assert_eq!(err.level(), Level::Fatal);
    }

    #[test]
    fn retryable_flags() {
        assert!(Error::Step(EngineError::new(CODE_BUSY, "database is locked")).is_retryable());
        assert!(Error::unavailable(HandleErrorKind::Timeout, "timed out").is_retryable());
        assert!(!Error::Cancelled.is_retryable());
        assert!(!Error::unavailable(HandleErrorKind::Closed, "closed").is_retryable());
    }

    #[test]
    fn handle_error_carries_cause() {
        let mut h = HandleError::new(HandleErrorKind::OpenFailed, "cannot open");
        h.cause = Some(EngineError::new(CODE_CANTOPEN, "unable to open database file"));
        let err = Error::from(h);
        assert_eq!(err.code(), Some(CODE_CANTOPEN));
        assert!(std::error::Error::source(&err).is_some());
        assert!(err.to_string().contains("unable to open database file"));
    }

    #[test]
    fn contract_kind_accessor() {
        let err = Error::contract(ContractKind::NoTransaction, "no nested transaction");
        assert!(err.is_contract_violation());
        assert_eq!(err.contract_kind(), Some(ContractKind::NoTransaction));
    }
}
