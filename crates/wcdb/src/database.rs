//! The database: a path, a pool of native connections and everything
//! configured on them.
//!
//! A `Database` is a cheap, cloneable reference. Connections are opened
//! lazily the first time a handle needs one, configured (cipher, journal
//! mode, named configs) and then recycled through the pool.

use crate::config::{
    CipherSettings, CipherVersion, ConfigInvocation, ConfigPriority, ConnectionConfig,
    DatabaseConfig,
};
use crate::handle::Handle;
use crate::migration::MigrationState;
use crate::repair::RepairState;
use crate::trace::{DatabaseObserver, DatabaseOperation, OperationInfo, Tracers};
use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock, RwLockWriteGuard, Weak};
use std::thread::{self, ThreadId};
use std::time::{Duration, Instant};
use wcdb_core::{EngineError, Error, HandleErrorKind, Result};
use wcdb_pool::{ConnectionManager, Pool, PoolConfig, PooledConnection};
use wcdb_sqlite::{CheckpointMode, OpenFlags, SqliteConfig, SqliteConnection};

/// Suffix of the backup copy written next to the database.
pub(crate) const MATERIAL_SUFFIX: &str = "-first.material";
/// Suffix of the directory holding deposited databases.
pub(crate) const DEPOSITED_SUFFIX: &str = ".deposited";

const FILE_SUFFIXES: [&str; 3] = ["-wal", "-shm", "-journal"];

static MEMORY_DATABASES: AtomicU64 = AtomicU64::new(0);

pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Default)]
struct ConfigSet {
    /// Sorted by priority, then insertion order
    entries: Vec<Arc<ConnectionConfig>>,
    generation: u64,
    next_order: u64,
}

#[derive(Default)]
struct CipherState {
    settings: Option<CipherSettings>,
    generation: u64,
}

/// A pooled native connection together with the configs applied to it.
pub struct ConfiguredConnection {
    pub(crate) conn: SqliteConnection,
    applied: Vec<Arc<ConnectionConfig>>,
    generation: Option<u64>,
    cipher_generation: u64,
}

impl std::fmt::Debug for ConfiguredConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConfiguredConnection")
            .field("conn", &self.conn)
            .field("applied", &self.applied.len())
            .finish()
    }
}

/// Opens native connections for one database.
pub struct ConnectionFactory {
    database: Weak<DatabaseInner>,
}

impl ConnectionManager for ConnectionFactory {
    type Connection = ConfiguredConnection;

    fn connect(&self) -> Result<ConfiguredConnection> {
        let inner = self.database.upgrade().ok_or_else(|| {
            Error::unavailable(HandleErrorKind::Closed, "database has been dropped")
        })?;
        let started = Instant::now();
        let conn = inner.open_configured(&self.database)?;
        let open_time = started.elapsed();
        let database = Database::from_inner(inner);
        database.report_operation(
            DatabaseOperation::OpenHandle,
            &OperationInfo {
                // The new connection is already counted by the pool.
                handle_count: database.inner.pool.alive_count(),
                open_time,
            },
        );
        Ok(conn)
    }

    fn is_valid(&self, conn: &mut ConfiguredConnection) -> bool {
        let Some(inner) = self.database.upgrade() else {
            return false;
        };
        if inner.cipher_state().generation != conn.cipher_generation {
            return false;
        }
        match inner.sync_configs(conn) {
            Ok(()) => true,
            Err(err) => {
                tracing::warn!(error = %err, path = %inner.path, "connection config failed; discarding");
                false
            }
        }
    }

    fn recycle(&self, conn: &mut ConfiguredConnection) {
        if conn.conn.transaction_level() > 0 || conn.conn.is_in_transaction() {
            tracing::warn!(path = %conn.conn.path(), "connection returned inside a transaction");
            while conn.conn.transaction_level() > 0 {
                conn.conn.rollback_transaction();
            }
            conn.conn.rollback_transaction();
        }
    }
}

pub(crate) type Lease = PooledConnection<ConnectionFactory>;

pub(crate) struct DatabaseInner {
    pub(crate) path: String,
    pub(crate) in_memory: bool,
    sqlite: SqliteConfig,
    pub(crate) config: DatabaseConfig,
    pub(crate) pool: Pool<ConnectionFactory>,
    /// Keeps an in-memory database alive while the pool is empty
    _keeper: Mutex<Option<SqliteConnection>>,
    tag: Mutex<Option<i64>>,
    configs: RwLock<ConfigSet>,
    cipher: RwLock<CipherState>,
    pub(crate) tracers: RwLock<Tracers>,
    last_error: Mutex<Option<EngineError>>,
    pub(crate) repair: Mutex<RepairState>,
    pub(crate) migration: Mutex<MigrationState>,
    /// Serializes blockading maintenance operations
    maintenance: Mutex<()>,
    /// Handles left inside a transaction by a database-level operation,
    /// bound to the thread that began it until commit or rollback
    transactions: Mutex<HashMap<ThreadId, Handle>>,
}

impl DatabaseInner {
    pub(crate) fn tag(&self) -> Option<i64> {
        *lock(&self.tag)
    }

    pub(crate) fn tracers_mut(&self) -> RwLockWriteGuard<'_, Tracers> {
        self.tracers.write().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn record_error(&self, error: &EngineError) {
        *lock(&self.last_error) = Some(error.clone());
    }

    pub(crate) fn last_error(&self) -> Option<EngineError> {
        lock(&self.last_error).clone()
    }

    fn cipher_state(&self) -> std::sync::RwLockReadGuard<'_, CipherState> {
        self.cipher.read().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn cipher_settings(&self) -> Option<CipherSettings> {
        self.cipher_state().settings.clone()
    }

    pub(crate) fn maintenance_lock(&self) -> MutexGuard<'_, ()> {
        lock(&self.maintenance)
    }

    fn apply_cipher(&self, conn: &SqliteConnection) -> Result<u64> {
        let cipher = self.cipher_state();
        if let Some(settings) = &cipher.settings {
            for pragma in settings.pragmas() {
                conn.execute_raw(&pragma)?;
            }
        }
        Ok(cipher.generation)
    }

    /// Open a connection outside the pool, keyed like pooled ones.
    ///
    /// `path` defaults to the database itself.
    pub(crate) fn open_unpooled(&self, path: Option<&str>) -> Result<SqliteConnection> {
        let config = match path {
            Some(path) => SqliteConfig::file(path).busy_timeout(self.config.busy_timeout_ms),
            None => self.sqlite.clone(),
        };
        let conn = SqliteConnection::open(&config)?;
        self.apply_cipher(&conn)?;
        Ok(conn)
    }

    /// Open a native connection and apply the cipher, journal mode and
    /// every registered config.
    fn open_configured(&self, weak: &Weak<DatabaseInner>) -> Result<ConfiguredConnection> {
        let conn = SqliteConnection::open(&self.sqlite).inspect_err(|err| {
            if let Error::HandleUnavailable(handle) = err {
                if let Some(cause) = &handle.cause {
                    self.record_error(cause);
                }
            }
        })?;
        conn.set_observer(Some(Arc::new(DatabaseObserver::new(weak.clone()))));
        let cipher_generation = self.apply_cipher(&conn)?;

        if !self.in_memory && self.config.wal {
            conn.execute_raw("PRAGMA journal_mode = WAL")?;
        }

        let mut configured = ConfiguredConnection {
            conn,
            applied: Vec::new(),
            generation: None,
            cipher_generation,
        };
        self.sync_configs(&mut configured)?;
        Ok(configured)
    }

    /// Bring a connection's configs up to date: revert the removed ones,
    /// then apply the new ones in priority order.
    fn sync_configs(&self, conn: &mut ConfiguredConnection) -> Result<()> {
        let (entries, generation) = {
            let set = self.configs.read().unwrap_or_else(PoisonError::into_inner);
            if conn.generation == Some(set.generation) {
                return Ok(());
            }
            (set.entries.clone(), set.generation)
        };

        for old in &conn.applied {
            if entries.iter().any(|e| Arc::ptr_eq(e, old)) {
                continue;
            }
            if let Some(uninvoke) = &old.uninvocation {
                uninvoke(&conn.conn)?;
            }
            tracing::debug!(name = %old.name, "config reverted");
        }
        for entry in &entries {
            if conn.applied.iter().any(|a| Arc::ptr_eq(a, entry)) {
                continue;
            }
            (entry.invocation)(&conn.conn)?;
            tracing::debug!(name = %entry.name, "config applied");
        }

        conn.applied = entries;
        conn.generation = Some(generation);
        Ok(())
    }

    /// Lease a connection, attaching the last engine error on failure.
    pub(crate) fn acquire(&self, write: bool) -> Result<Lease> {
        self.pool.acquire(write).map_err(|err| match err {
            Error::HandleUnavailable(mut handle) => {
                if handle.cause.is_none() {
                    handle.cause = self.last_error();
                }
                Error::HandleUnavailable(handle)
            }
            other => other,
        })
    }
}

/// A database at one path.
///
/// Cloning is cheap; all clones share the same pool and configuration.
#[derive(Clone)]
pub struct Database {
    pub(crate) inner: Arc<DatabaseInner>,
}

impl std::fmt::Debug for Database {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Database")
            .field("path", &self.inner.path)
            .field("tag", &self.inner.tag())
            .field("pool", &self.inner.pool)
            .finish()
    }
}

impl Database {
    /// Open (lazily) the database file at `path`.
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self::with_config(path, DatabaseConfig::default())
    }

    pub fn with_config(path: impl AsRef<Path>, config: DatabaseConfig) -> Self {
        let path = path.as_ref().to_string_lossy().into_owned();
        let sqlite = SqliteConfig::file(path.clone()).busy_timeout(config.busy_timeout_ms);
        Self::create(path, sqlite, false, config)
    }

    /// A private in-memory database shared by all of its connections.
    pub fn in_memory() -> Self {
        Self::in_memory_with_config(DatabaseConfig::default())
    }

    pub fn in_memory_with_config(config: DatabaseConfig) -> Self {
        let id = MEMORY_DATABASES.fetch_add(1, Ordering::Relaxed);
        let uri = format!("file:/wcdb-memory-{}?vfs=memdb", id);
        let sqlite = SqliteConfig::file(uri.clone())
            .flags(OpenFlags::create_read_write().with_uri())
            .busy_timeout(config.busy_timeout_ms);
        Self::create(uri, sqlite, true, config)
    }

    fn create(path: String, sqlite: SqliteConfig, in_memory: bool, config: DatabaseConfig) -> Self {
        let pool_config = PoolConfig::new(config.max_handles)
            .acquire_timeout(config.acquire_timeout_ms)
            .test_on_checkout(true);
        let keeper = if in_memory {
            match SqliteConnection::open(&sqlite) {
                Ok(conn) => Some(conn),
                Err(err) => {
                    tracing::warn!(error = %err, path = %path, "in-memory database could not be opened");
                    None
                }
            }
        } else {
            None
        };

        let inner = Arc::new_cyclic(|weak| DatabaseInner {
            path,
            in_memory,
            sqlite,
            config,
            pool: Pool::new(
                ConnectionFactory {
                    database: weak.clone(),
                },
                pool_config,
            ),
            _keeper: Mutex::new(keeper),
            tag: Mutex::new(None),
            configs: RwLock::new(ConfigSet::default()),
            cipher: RwLock::new(CipherState::default()),
            tracers: RwLock::new(Tracers::default()),
            last_error: Mutex::new(None),
            repair: Mutex::new(RepairState::default()),
            migration: Mutex::new(MigrationState::default()),
            maintenance: Mutex::new(()),
            transactions: Mutex::new(HashMap::new()),
        });
        let database = Self { inner };
        tracing::debug!(path = %database.inner.path, "database created");
        database.report_operation(DatabaseOperation::Create, &OperationInfo::default());
        database
    }

    pub(crate) fn from_inner(inner: Arc<DatabaseInner>) -> Self {
        Self { inner }
    }

    pub fn path(&self) -> &str {
        &self.inner.path
    }

    pub fn is_in_memory(&self) -> bool {
        self.inner.in_memory
    }

    pub(crate) fn material_path(&self) -> String {
        format!("{}{}", self.inner.path, MATERIAL_SUFFIX)
    }

    pub(crate) fn deposited_dir(&self) -> PathBuf {
        PathBuf::from(format!("{}{}", self.inner.path, DEPOSITED_SUFFIX))
    }

    /// Every file belonging to this database, whether or not it exists:
    /// the main file, its journals, the backup copy and the deposit
    /// directory.
    pub fn paths(&self) -> Vec<PathBuf> {
        if self.inner.in_memory {
            return Vec::new();
        }
        let mut paths = vec![PathBuf::from(&self.inner.path)];
        paths.extend(
            FILE_SUFFIXES
                .iter()
                .map(|suffix| PathBuf::from(format!("{}{}", self.inner.path, suffix))),
        );
        paths.push(PathBuf::from(self.material_path()));
        paths.push(self.deposited_dir());
        paths
    }

    pub fn set_tag(&self, tag: i64) {
        *lock(&self.inner.tag) = Some(tag);
        self.report_operation(DatabaseOperation::SetTag, &OperationInfo::default());
    }

    pub fn tag(&self) -> Option<i64> {
        self.inner.tag()
    }

    /// The most recent engine error raised on any connection of this database.
    pub fn last_error(&self) -> Option<EngineError> {
        self.inner.last_error()
    }

    /// Can a connection be opened? The connection stays in the pool.
    pub fn can_open(&self) -> bool {
        self.inner.acquire(false).is_ok()
    }

    /// Is at least one native connection alive?
    pub fn is_opened(&self) -> bool {
        self.inner.pool.alive_count() > 0
    }

    /// A handle for running statements. Write handles are serialized.
    pub fn get_handle(&self, write_hint: bool) -> Handle {
        Handle::new(self.clone(), write_hint)
    }

    /// The handle a database-level operation runs on: the transaction
    /// handle bound to the calling thread, or a fresh one.
    pub(crate) fn thread_handle(&self, write_hint: bool) -> Handle {
        let bound = lock(&self.inner.transactions).remove(&thread::current().id());
        bound.unwrap_or_else(|| self.get_handle(write_hint))
    }

    /// Keep `handle`, still inside a transaction, for the calling thread's
    /// next database-level operation.
    pub(crate) fn bind_thread_handle(&self, handle: Handle) {
        let replaced = lock(&self.inner.transactions).insert(thread::current().id(), handle);
        if replaced.is_some() {
            tracing::warn!(path = %self.inner.path, "thread already had a transaction handle");
        }
    }

    /// Is the calling thread inside a transaction begun on the database?
    pub fn is_in_thread_transaction(&self) -> bool {
        lock(&self.inner.transactions).contains_key(&thread::current().id())
    }

    /// Close every native connection.
    ///
    /// Blocks new leases, waits for outstanding ones to come back and
    /// drops all connections. The database stays usable afterwards; the
    /// next handle reopens it.
    pub fn close(&self) {
        self.close_with(|| {});
    }

    /// Like `close`, running `on_closed` while the database is still
    /// blockaded and no connection is alive.
    pub fn close_with<F: FnOnce()>(&self, on_closed: F) {
        // The calling thread's own open transaction would never come back.
        let bound = lock(&self.inner.transactions).remove(&thread::current().id());
        if let Some(mut handle) = bound {
            tracing::warn!(path = %self.inner.path, "closing rolls back the thread's open transaction");
            handle.invalidate();
        }
        let pool = &self.inner.pool;
        pool.blockade();
        if !pool.wait_for_leases(0, self.acquire_timeout()) {
            tracing::warn!(path = %self.inner.path, "closing with connections still leased");
        }
        let closed = pool.purge();
        tracing::debug!(path = %self.inner.path, closed, "database closed");
        on_closed();
        pool.unblockade();
    }

    /// Stop handing out connections until `unblockade`.
    pub fn blockade(&self) {
        self.inner.pool.blockade();
    }

    pub fn unblockade(&self) {
        self.inner.pool.unblockade();
    }

    pub fn is_blockaded(&self) -> bool {
        self.inner.pool.is_blockaded()
    }

    /// Close idle connections.
    pub fn purge(&self) {
        let closed = self.inner.pool.purge();
        tracing::debug!(path = %self.inner.path, closed, "database purged");
    }

    pub fn number_of_alive_handles(&self) -> usize {
        self.inner.pool.alive_count()
    }

    /// Is some thread waiting for the write connection?
    pub fn has_pending_writer(&self) -> bool {
        self.inner.pool.has_pending_writer()
    }

    fn acquire_timeout(&self) -> Duration {
        Duration::from_millis(self.inner.config.acquire_timeout_ms)
    }

    /// Run `f` with the database to itself: no other lease is alive and
    /// no new lease is handed out until `f` returns.
    ///
    /// Refuses to run while someone else holds a blockade.
    pub(crate) fn run_exclusively<T>(&self, operation: &str, f: impl FnOnce() -> Result<T>) -> Result<T> {
        let _maintenance = self.inner.maintenance_lock();
        let pool = &self.inner.pool;
        if !pool.try_blockade() {
            return Err(Error::unavailable(
                HandleErrorKind::Blockaded,
                format!("cannot {} while the database is blockaded", operation),
            ));
        }
        let result = if pool.wait_for_leases(0, self.acquire_timeout()) {
            pool.purge();
            f()
        } else {
            Err(Error::unavailable(
                HandleErrorKind::Timeout,
                format!("cannot {} while handles are in use", operation),
            ))
        };
        pool.unblockade();
        result
    }

    /// Delete every file of this database.
    pub fn remove_files(&self) -> Result<()> {
        self.run_exclusively("remove files", || {
            for path in self.paths() {
                remove_path(&path)?;
            }
            tracing::debug!(path = %self.inner.path, "database files removed");
            Ok(())
        })
    }

    /// Move every existing file of this database into `directory`.
    pub fn move_files(&self, directory: impl AsRef<Path>) -> Result<()> {
        let directory = directory.as_ref();
        self.run_exclusively("move files", || {
            fs::create_dir_all(directory)?;
            for path in self.paths() {
                if !path.exists() {
                    continue;
                }
                if let Some(name) = path.file_name() {
                    fs::rename(&path, directory.join(name))?;
                }
            }
            tracing::debug!(path = %self.inner.path, to = %directory.display(), "database files moved");
            Ok(())
        })
    }

    /// Total size in bytes of the database and its journals.
    pub fn file_size(&self) -> Result<u64> {
        let mut total = 0;
        for path in self.paths() {
            match fs::metadata(&path) {
                Ok(meta) if meta.is_file() => total += meta.len(),
                Ok(_) => {}
                Err(err) if err.kind() == io::ErrorKind::NotFound => {}
                Err(err) => return Err(err.into()),
            }
        }
        Ok(total)
    }

    /// Encrypt connections opened from now on with `key`.
    ///
    /// `None` removes the key. Idle connections opened with the previous
    /// key are closed.
    pub fn set_cipher_key(&self, key: Option<&[u8]>, page_size: u32, version: CipherVersion) {
        {
            let mut cipher = self.inner.cipher.write().unwrap_or_else(PoisonError::into_inner);
            cipher.settings = key.map(|key| CipherSettings {
                key: key.to_vec(),
                page_size,
                version,
            });
            cipher.generation += 1;
        }
        self.inner.pool.purge();
        tracing::debug!(path = %self.inner.path, enabled = key.is_some(), "cipher key changed");
    }

    /// Register (or replace) a named config run on every connection.
    ///
    /// `uninvocation` runs on connections that had the config applied when
    /// it is removed or replaced.
    pub fn set_config(
        &self,
        name: impl Into<String>,
        invocation: ConfigInvocation,
        uninvocation: Option<ConfigInvocation>,
        priority: ConfigPriority,
    ) {
        let name = name.into();
        let mut set = self.inner.configs.write().unwrap_or_else(PoisonError::into_inner);
        set.entries.retain(|c| c.name != name);
        let order = set.next_order;
        set.next_order += 1;
        tracing::debug!(name = %name, ?priority, "config registered");
        set.entries.push(Arc::new(ConnectionConfig {
            name,
            invocation,
            uninvocation,
            priority,
            order,
        }));
        set.entries.sort_by_key(|c| (c.priority, c.order));
        set.generation += 1;
    }

    pub fn remove_config(&self, name: &str) {
        let mut set = self.inner.configs.write().unwrap_or_else(PoisonError::into_inner);
        let before = set.entries.len();
        set.entries.retain(|c| c.name != name);
        if set.entries.len() != before {
            set.generation += 1;
            tracing::debug!(name, "config removed");
        }
    }

    fn checkpoint(&self, mode: CheckpointMode) -> Result<()> {
        let mut handle = self.get_handle(true);
        let result = handle.connection().and_then(|conn| conn.checkpoint(mode));
        handle.invalidate();
        result
    }

    /// Copy committed WAL frames into the database without blocking.
    pub fn passive_checkpoint(&self) -> Result<()> {
        self.checkpoint(CheckpointMode::Passive)
    }

    /// Checkpoint everything and truncate the WAL file.
    pub fn truncate_checkpoint(&self) -> Result<()> {
        self.checkpoint(CheckpointMode::Truncate)
    }
}

pub(crate) fn remove_path(path: &Path) -> io::Result<()> {
    let result = if path.is_dir() {
        fs::remove_dir_all(path)
    } else {
        fs::remove_file(path)
    };
    match result {
        Err(err) if err.kind() != io::ErrorKind::NotFound => Err(err),
        _ => Ok(()),
    }
}
