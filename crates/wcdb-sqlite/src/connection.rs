//! Native connection and transaction-level state machine.
//!
//! A `SqliteConnection` owns one `sqlite3*`. Statements prepared on it hold
//! a shared reference to the raw connection, so the native handle is closed
//! only after the last statement is finalized.

#![allow(clippy::borrow_as_ptr)]

use crate::ffi;
use crate::statement::PreparedStatement;
use std::ffi::{CStr, CString, c_int};
use std::ptr;
use std::sync::atomic::{AtomicU8, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use wcdb_core::{
    ContractKind, EngineError, Error, HandleError, HandleErrorKind, Level, Result,
    sanitize_identifier,
};

/// Configuration for opening SQLite connections.
#[derive(Debug, Clone)]
pub struct SqliteConfig {
    /// Path to the database file, ":memory:", or a `file:` URI
    pub path: String,
    pub flags: OpenFlags,
    /// Busy timeout in milliseconds
    pub busy_timeout_ms: u32,
}

/// Flags controlling how the database is opened.
#[derive(Debug, Clone, Copy, Default)]
pub struct OpenFlags {
    pub read_only: bool,
    pub read_write: bool,
    /// Create the database if it doesn't exist
    pub create: bool,
    /// Interpret the path as a URI
    pub uri: bool,
    pub no_mutex: bool,
    /// Serialized mode; required when another thread may interrupt
    pub full_mutex: bool,
    pub shared_cache: bool,
    pub private_cache: bool,
}

impl OpenFlags {
    pub fn read_only() -> Self {
        Self {
            read_only: true,
            full_mutex: true,
            ..Default::default()
        }
    }

    /// Read-write access; the database must exist.
    pub fn read_write() -> Self {
        Self {
            read_write: true,
            full_mutex: true,
            ..Default::default()
        }
    }

    /// Read-write access, creating the file if needed.
    pub fn create_read_write() -> Self {
        Self {
            read_write: true,
            create: true,
            full_mutex: true,
            ..Default::default()
        }
    }

    pub fn with_uri(mut self) -> Self {
        self.uri = true;
        self
    }

    pub(crate) fn to_sqlite_flags(self) -> c_int {
        let mut flags = 0;

        if self.read_only {
            flags |= ffi::SQLITE_OPEN_READONLY;
        }
        if self.read_write {
            flags |= ffi::SQLITE_OPEN_READWRITE;
        }
        if self.create {
            flags |= ffi::SQLITE_OPEN_CREATE;
        }
        if self.uri {
            flags |= ffi::SQLITE_OPEN_URI;
        }
        if self.no_mutex {
            flags |= ffi::SQLITE_OPEN_NOMUTEX;
        }
        if self.full_mutex {
            flags |= ffi::SQLITE_OPEN_FULLMUTEX;
        }
        if self.shared_cache {
            flags |= ffi::SQLITE_OPEN_SHAREDCACHE;
        }
        if self.private_cache {
            flags |= ffi::SQLITE_OPEN_PRIVATECACHE;
        }

        // Default to read-write if no mode specified
        if flags & (ffi::SQLITE_OPEN_READONLY | ffi::SQLITE_OPEN_READWRITE) == 0 {
            flags |= ffi::SQLITE_OPEN_READWRITE | ffi::SQLITE_OPEN_CREATE;
        }

        flags
    }
}

impl Default for SqliteConfig {
    fn default() -> Self {
        Self {
            path: ":memory:".to_string(),
            flags: OpenFlags::create_read_write(),
            busy_timeout_ms: 5000,
        }
    }
}

impl SqliteConfig {
    pub fn file(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            ..Default::default()
        }
    }

    pub fn memory() -> Self {
        Self::default()
    }

    pub fn flags(mut self, flags: OpenFlags) -> Self {
        self.flags = flags;
        self
    }

    pub fn busy_timeout(mut self, ms: u32) -> Self {
        self.busy_timeout_ms = ms;
        self
    }
}

/// Receives execution events from a connection and its statements.
pub trait ConnectionObserver: Send + Sync {
    /// A statement started executing.
    fn on_sql(&self, _sql: &str) {}

    /// A statement ran to completion.
    fn on_performance(&self, _sql: &str, _cost: Duration) {}

    /// The engine reported an error.
    fn on_error(&self, _error: &EngineError) {}
}

/// WAL checkpoint modes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckpointMode {
    Passive,
    Full,
    Restart,
    Truncate,
}

impl CheckpointMode {
    fn to_sqlite(self) -> c_int {
        match self {
            CheckpointMode::Passive => ffi::SQLITE_CHECKPOINT_PASSIVE,
            CheckpointMode::Full => ffi::SQLITE_CHECKPOINT_FULL,
            CheckpointMode::Restart => ffi::SQLITE_CHECKPOINT_RESTART,
            CheckpointMode::Truncate => ffi::SQLITE_CHECKPOINT_TRUNCATE,
        }
    }
}

/// Whether an error inside the current transaction forbids committing it.
const TX_ALLOWED: u8 = 0;
const TX_NOT_ALLOWED: u8 = 1;
const TX_FATAL: u8 = 2;

/// The native handle shared by a connection and its statements.
pub(crate) struct RawConnection {
    pub(crate) db: *mut ffi::sqlite3,
    pub(crate) path: String,
    last_error: Mutex<Option<EngineError>>,
    observer: Mutex<Option<Arc<dyn ConnectionObserver>>>,
    transaction_error: AtomicU8,
    /// Bumped whenever every statement is reset behind its owner's back
    reset_epoch: AtomicU64,
    /// Successful native compilations on this connection
    pub(crate) prepares: AtomicU64,
    pub(crate) finalizes: AtomicU64,
}

// SAFETY: connections are opened in serialized mode by default, and all
// mutable state outside the engine is behind a Mutex or an atomic.
unsafe impl Send for RawConnection {}
unsafe impl Sync for RawConnection {}

impl RawConnection {
    /// Build an engine error from the connection's current error state.
    pub(crate) fn engine_error(&self, rc: c_int, sql: Option<&str>) -> EngineError {
        // SAFETY: db is valid for the lifetime of self
        let (extended, message) = unsafe {
            let extended = ffi::sqlite3_extended_errcode(self.db);
            (extended, ffi::errmsg(self.db))
        };
        // The connection's error code can be stale for misuse, so trust rc
        // when the primary codes disagree.
        let code = if extended & 0xff == rc & 0xff { extended } else { rc };
        let message = if message.is_empty() {
            ffi::error_string(rc).to_string()
        } else {
            message
        };
        let mut err = EngineError::new(code, message).with_path(self.path.clone());
        if let Some(sql) = sql {
            err = err.with_sql(sql);
        }
        err
    }

    /// Record an error and update the transaction error state.
    pub(crate) fn notify_error(&self, err: &EngineError) {
        // SAFETY: db is valid
        let in_transaction = unsafe { ffi::sqlite3_get_autocommit(self.db) } == 0;
        if in_transaction && err.level >= Level::Error {
            let state = self.transaction_error.load(Ordering::Acquire);
            if state == TX_NOT_ALLOWED || err.level == Level::Fatal {
                self.transaction_error.store(TX_FATAL, Ordering::Release);
            }
        }
        tracing::debug!(
            code = err.extended_code,
            message = %err.message,
            sql = err.sql.as_deref().unwrap_or(""),
            "engine error"
        );
        *self
            .last_error
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(err.clone());
        if let Some(observer) = self.observer() {
            observer.on_error(err);
        }
    }

    pub(crate) fn observer(&self) -> Option<Arc<dyn ConnectionObserver>> {
        self.observer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub(crate) fn reset_epoch(&self) -> u64 {
        self.reset_epoch.load(Ordering::Acquire)
    }
}

impl Drop for RawConnection {
    fn drop(&mut self) {
        if !self.db.is_null() {
            // SAFETY: db is valid and no statement references it anymore
            let rc = unsafe { ffi::sqlite3_close(self.db) };
            if rc != ffi::SQLITE_OK {
                tracing::warn!(path = %self.path, rc, "closing connection failed");
            } else {
                tracing::debug!(path = %self.path, "connection closed");
            }
        }
    }
}

/// Interrupts a connection from any thread.
#[derive(Clone)]
pub struct InterruptHandle {
    raw: Arc<RawConnection>,
}

impl InterruptHandle {
    /// Make any running step on the connection return `SQLITE_INTERRUPT`.
    pub fn interrupt(&self) {
        // SAFETY: sqlite3_interrupt is safe to call from any thread while
        // the connection is open; the Arc keeps it open
        unsafe { ffi::sqlite3_interrupt(self.raw.db) }
    }
}

/// A connection to a SQLite database.
///
/// Not shareable across threads while in use; ownership moves between
/// threads through the pool.
pub struct SqliteConnection {
    raw: Arc<RawConnection>,
    /// Open transaction levels; 1 is the outermost BEGIN
    level: u32,
}

impl std::fmt::Debug for SqliteConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteConnection")
            .field("path", &self.raw.path)
            .field("level", &self.level)
            .finish()
    }
}

impl SqliteConnection {
    /// Open a new SQLite connection with the given configuration.
    pub fn open(config: &SqliteConfig) -> Result<Self> {
        let c_path = CString::new(config.path.as_str()).map_err(|_| {
            Error::HandleUnavailable(HandleError::new(
                HandleErrorKind::OpenFailed,
                "invalid path: contains null byte",
            ))
        })?;

        let mut db: *mut ffi::sqlite3 = ptr::null_mut();
        let flags = config.flags.to_sqlite_flags();

        // SAFETY: We pass valid pointers and check the return value
        let rc = unsafe { ffi::sqlite3_open_v2(c_path.as_ptr(), &mut db, flags, ptr::null()) };

        if rc != ffi::SQLITE_OK {
            let message = if db.is_null() {
                ffi::error_string(rc).to_string()
            } else {
                // SAFETY: db is valid until closed below
                unsafe {
                    let msg = ffi::errmsg(db);
                    ffi::sqlite3_close(db);
                    msg
                }
            };
            let mut err = HandleError::new(
                HandleErrorKind::OpenFailed,
                format!("failed to open database {}", config.path),
            );
            err.cause = Some(EngineError::new(rc, message).with_path(config.path.clone()));
            return Err(Error::HandleUnavailable(err));
        }

        // SAFETY: db is valid
        unsafe {
            ffi::sqlite3_extended_result_codes(db, 1);
            if config.busy_timeout_ms > 0 {
                ffi::sqlite3_busy_timeout(db, config.busy_timeout_ms as c_int);
            }
        }

        tracing::debug!(path = %config.path, "connection opened");

        Ok(Self {
            raw: Arc::new(RawConnection {
                db,
                path: config.path.clone(),
                last_error: Mutex::new(None),
                observer: Mutex::new(None),
                transaction_error: AtomicU8::new(TX_ALLOWED),
                reset_epoch: AtomicU64::new(0),
                prepares: AtomicU64::new(0),
                finalizes: AtomicU64::new(0),
            }),
            level: 0,
        })
    }

    pub fn open_memory() -> Result<Self> {
        Self::open(&SqliteConfig::memory())
    }

    pub fn open_file(path: impl Into<String>) -> Result<Self> {
        Self::open(&SqliteConfig::file(path))
    }

    pub fn path(&self) -> &str {
        &self.raw.path
    }

    pub(crate) fn raw(&self) -> &Arc<RawConnection> {
        &self.raw
    }

    /// Install an observer for SQL, performance and error events.
    pub fn set_observer(&self, observer: Option<Arc<dyn ConnectionObserver>>) {
        *self
            .raw
            .observer
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = observer;
    }

    /// The most recent engine error seen on this connection.
    pub fn last_error(&self) -> Option<EngineError> {
        self.raw
            .last_error
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Native statements compiled through `PreparedStatement` on this
    /// connection so far.
    pub fn native_prepare_count(&self) -> u64 {
        self.raw.prepares.load(Ordering::Relaxed)
    }

    /// Native statements finalized through `PreparedStatement` so far.
    pub fn native_finalize_count(&self) -> u64 {
        self.raw.finalizes.load(Ordering::Relaxed)
    }

    /// Native statements currently compiled and not yet finalized.
    pub fn live_statement_count(&self) -> usize {
        let mut count = 0;
        // SAFETY: db is valid; walking the list does not modify it
        unsafe {
            let mut stmt = ffi::sqlite3_next_stmt(self.raw.db, ptr::null_mut());
            while !stmt.is_null() {
                count += 1;
                stmt = ffi::sqlite3_next_stmt(self.raw.db, stmt);
            }
        }
        count
    }

    /// Create an unprepared statement bound to this connection.
    pub fn new_statement(&self) -> PreparedStatement {
        PreparedStatement::new(Arc::clone(&self.raw))
    }

    /// Compile `sql` into a new statement.
    pub fn prepare(&self, sql: &str) -> Result<PreparedStatement> {
        let mut stmt = self.new_statement();
        stmt.prepare(sql)?;
        Ok(stmt)
    }

    /// Execute SQL directly without preparing (for DDL, pragmas, etc.)
    pub fn execute_raw(&self, sql: &str) -> Result<()> {
        let c_sql = CString::new(sql).map_err(|_| {
            Error::Compile(EngineError::new(ffi::SQLITE_MISUSE, "SQL contains null byte").with_sql(sql))
        })?;

        let mut errmsg: *mut std::ffi::c_char = ptr::null_mut();

        tracing::trace!(sql = %sql, "execute");
        if let Some(observer) = self.raw.observer() {
            observer.on_sql(sql);
        }

        // SAFETY: All pointers are valid
        let rc = unsafe {
            ffi::sqlite3_exec(self.raw.db, c_sql.as_ptr(), None, ptr::null_mut(), &mut errmsg)
        };

        if !errmsg.is_null() {
            // SAFETY: errmsg was allocated by sqlite3_exec
            unsafe { ffi::sqlite3_free(errmsg.cast()) };
        }

        if rc != ffi::SQLITE_OK {
            let err = self.raw.engine_error(rc, Some(sql));
            self.raw.notify_error(&err);
            if err.code == ffi::SQLITE_INTERRUPT {
                return Err(Error::Cancelled);
            }
            return Err(Error::Step(err));
        }

        Ok(())
    }

    pub fn last_insert_rowid(&self) -> i64 {
        // SAFETY: db is valid
        unsafe { ffi::sqlite3_last_insert_rowid(self.raw.db) }
    }

    /// Rows changed by the most recent statement.
    pub fn changes(&self) -> i64 {
        // SAFETY: db is valid
        unsafe { ffi::sqlite3_changes64(self.raw.db) }
    }

    /// Rows changed since the connection was opened.
    pub fn total_changes(&self) -> i64 {
        // SAFETY: db is valid
        unsafe { ffi::sqlite3_total_changes64(self.raw.db) }
    }

    pub fn set_busy_timeout(&self, ms: u32) {
        // SAFETY: db is valid
        unsafe {
            ffi::sqlite3_busy_timeout(self.raw.db, ms as c_int);
        }
    }

    /// A handle that can interrupt this connection from another thread.
    pub fn interrupt_handle(&self) -> InterruptHandle {
        InterruptHandle {
            raw: Arc::clone(&self.raw),
        }
    }

    /// Does the engine consider this connection inside a transaction?
    pub fn is_in_transaction(&self) -> bool {
        // SAFETY: db is valid
        unsafe { ffi::sqlite3_get_autocommit(self.raw.db) == 0 }
    }

    /// Number of open transaction levels (0 when none).
    pub fn transaction_level(&self) -> u32 {
        self.level
    }

    /// Make any later engine error inside the current transaction fatal.
    pub fn mark_error_not_allowed_within_transaction(&self) {
        let _ = self.raw.transaction_error.compare_exchange(
            TX_ALLOWED,
            TX_NOT_ALLOWED,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
    }

    /// Has a fatal error poisoned the current transaction?
    pub fn is_transaction_fatal(&self) -> bool {
        self.raw.transaction_error.load(Ordering::Acquire) == TX_FATAL
    }

    fn transaction_error_allowed(&self) -> bool {
        self.raw.transaction_error.load(Ordering::Acquire) == TX_ALLOWED
    }

    fn clear_transaction_error(&self) {
        self.raw
            .transaction_error
            .store(TX_ALLOWED, Ordering::Release);
    }

    /// Reset every busy statement on this connection.
    ///
    /// The engine downgrades a connection to a read transaction if any of
    /// its statements is still active at COMMIT or ROLLBACK.
    pub fn reset_all_statements(&self) {
        // SAFETY: db is valid; iteration only touches statements owned by it
        unsafe {
            let mut stmt = ffi::sqlite3_next_stmt(self.raw.db, ptr::null_mut());
            while !stmt.is_null() {
                if ffi::sqlite3_stmt_busy(stmt) != 0 {
                    ffi::sqlite3_reset(stmt);
                }
                stmt = ffi::sqlite3_next_stmt(self.raw.db, stmt);
            }
        }
        self.raw.reset_epoch.fetch_add(1, Ordering::AcqRel);
    }

    fn savepoint_name(level: u32) -> String {
        sanitize_identifier(&format!("wcdb_lv_{}", level))
    }

    /// Begin a transaction, nesting as a savepoint when one is open.
    pub fn begin_transaction(&mut self) -> Result<()> {
        if self.is_in_transaction() {
            if self.level == 0 {
                // Opened by a raw BEGIN outside this state machine.
                self.level = 1;
            }
        } else {
            self.level = 0;
        }

        if self.level > 0 {
            if self.transaction_error_allowed() {
                self.execute_raw(&format!("SAVEPOINT {}", Self::savepoint_name(self.level + 1)))?;
            }
            self.level += 1;
            tracing::debug!(level = self.level, "savepoint begun");
            return Ok(());
        }

        self.execute_raw("BEGIN IMMEDIATE")?;
        self.level = 1;
        tracing::debug!(path = %self.raw.path, "transaction begun");
        Ok(())
    }

    /// Commit the innermost transaction level.
    ///
    /// The outermost commit is refused, and turned into a rollback, once a
    /// fatal error has occurred inside the transaction.
    pub fn commit_transaction(&mut self) -> Result<()> {
        if self.level == 0 {
            return Err(Error::contract(
                ContractKind::NoTransaction,
                "commit without an open transaction",
            ));
        }

        if self.level > 1 {
            if self.transaction_error_allowed() && self.is_in_transaction() {
                self.execute_raw(&format!("RELEASE {}", Self::savepoint_name(self.level)))?;
            }
            self.level -= 1;
            return Ok(());
        }

        if self.is_transaction_fatal() {
            let cause = self.last_error().unwrap_or_else(|| {
                EngineError::new(ffi::SQLITE_ABORT, "transaction aborted after a fatal error")
            });
            tracing::warn!(path = %self.raw.path, "commit refused after fatal error; rolling back");
            self.rollback_transaction();
            return Err(Error::Step(cause));
        }

        self.reset_all_statements();
        // The engine can end a transaction on its own, e.g. after an interrupt.
        if self.is_in_transaction() {
            self.execute_raw("COMMIT")?;
        }
        self.level = 0;
        self.clear_transaction_error();
        tracing::debug!(path = %self.raw.path, "transaction committed");
        Ok(())
    }

    /// Commit, falling back to a rollback when the commit fails.
    pub fn commit_or_rollback_transaction(&mut self) -> Result<()> {
        match self.commit_transaction() {
            Ok(()) => Ok(()),
            Err(err) => {
                if self.level > 0 {
                    self.rollback_transaction();
                }
                Err(err)
            }
        }
    }

    /// Roll back the innermost transaction level.
    ///
    /// Never fails; engine errors are logged.
    pub fn rollback_transaction(&mut self) {
        if self.level == 0 && !self.is_in_transaction() {
            return;
        }

        if self.level > 1 {
            if self.transaction_error_allowed() && self.is_in_transaction() {
                let name = Self::savepoint_name(self.level);
                if let Err(err) =
                    self.execute_raw(&format!("ROLLBACK TO {name}; RELEASE {name}"))
                {
                    tracing::warn!(error = %err, level = self.level, "savepoint rollback failed");
                }
            }
            self.level -= 1;
            return;
        }

        self.reset_all_statements();
        if self.is_in_transaction() {
            if let Err(err) = self.execute_raw("ROLLBACK") {
                tracing::warn!(error = %err, path = %self.raw.path, "rollback failed");
            }
        }
        self.level = 0;
        self.clear_transaction_error();
        tracing::debug!(path = %self.raw.path, "transaction rolled back");
    }

    /// Begin a savepoint-nested transaction (or the outermost one).
    pub fn begin_nested_transaction(&mut self) -> Result<()> {
        self.begin_transaction()
    }

    /// Commit the innermost level opened by `begin_nested_transaction`.
    pub fn commit_nested_transaction(&mut self) -> Result<()> {
        if self.level == 0 {
            return Err(Error::contract(
                ContractKind::NoTransaction,
                "commit of a nested transaction that was never begun",
            ));
        }
        self.commit_or_rollback_transaction()
    }

    /// Roll back the innermost level opened by `begin_nested_transaction`.
    pub fn rollback_nested_transaction(&mut self) -> Result<()> {
        if self.level == 0 {
            return Err(Error::contract(
                ContractKind::NoTransaction,
                "rollback of a nested transaction that was never begun",
            ));
        }
        self.rollback_transaction();
        Ok(())
    }

    /// Run a WAL checkpoint on the main database.
    pub fn checkpoint(&self, mode: CheckpointMode) -> Result<()> {
        // SAFETY: db is valid and "main" is a valid C string
        let rc = unsafe {
            ffi::sqlite3_wal_checkpoint_v2(
                self.raw.db,
                c"main".as_ptr(),
                mode.to_sqlite(),
                ptr::null_mut(),
                ptr::null_mut(),
            )
        };
        if rc != ffi::SQLITE_OK {
            let err = self.raw.engine_error(rc, None);
            self.raw.notify_error(&err);
            return Err(Error::Step(err));
        }
        Ok(())
    }

    /// Does a table (or view) with this name exist in the main schema?
    pub fn table_exists(&self, name: &str) -> Result<bool> {
        let mut stmt = self.prepare(
            "SELECT count(*) FROM sqlite_master WHERE type IN ('table', 'view') AND name = ?1",
        )?;
        stmt.bind_text(name, 1)?;
        let values = stmt.get_one_column()?;
        Ok(values.first().is_some_and(|v| v.as_i64() > 0))
    }

    /// Names of the user tables in a schema, sorted.
    pub fn table_names(&self, schema: &str) -> Result<Vec<String>> {
        let sql = format!(
            "SELECT name FROM {}.sqlite_master WHERE type = 'table' \
             AND name NOT LIKE 'sqlite_%' ORDER BY name",
            sanitize_identifier(schema)
        );
        let mut stmt = self.prepare(&sql)?;
        Ok(stmt
            .get_one_column()?
            .into_iter()
            .map(|v| v.to_text().into_owned())
            .collect())
    }
}

/// The library version of the linked engine.
pub fn library_version() -> &'static str {
    // SAFETY: static string owned by the engine
    unsafe {
        CStr::from_ptr(ffi::sqlite3_libversion())
            .to_str()
            .unwrap_or("unknown")
    }
}
