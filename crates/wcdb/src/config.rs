//! Database configuration.
//!
//! `DatabaseConfig` is fixed when a database is created. Named connection
//! configs and the cipher can change at any time; every native connection
//! is brought up to date the next time it is leased.
//!
//! Process-wide defaults live behind `GlobalConfig`, initialized on first
//! use.
//!
//! # Example
//!
//! ```rust
//! use wcdb::{ConfigPriority, Database, DatabaseConfig, SqliteConnection};
//! use std::sync::Arc;
//!
//! let db = Database::in_memory_with_config(DatabaseConfig::default().max_handles(8));
//! db.set_config(
//!     "foreign_keys",
//!     Arc::new(|conn: &SqliteConnection| conn.execute_raw("PRAGMA foreign_keys = ON")),
//!     Some(Arc::new(|conn: &SqliteConnection| conn.execute_raw("PRAGMA foreign_keys = OFF"))),
//!     ConfigPriority::High,
//! );
//! ```

use crate::trace::{ExceptionTracer, OperationTracer, PerformanceTracer, SqlTracer};
use std::sync::{Arc, OnceLock, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;
use wcdb_core::Result;
use wcdb_sqlite::SqliteConnection;

/// Settings fixed for the lifetime of a database.
#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    /// Maximum number of native connections alive at once
    pub max_handles: usize,
    /// Maximum time to wait for a handle in milliseconds
    pub acquire_timeout_ms: u64,
    /// Busy timeout of every native connection in milliseconds
    pub busy_timeout_ms: u32,
    /// Put file databases in WAL mode
    pub wal: bool,
    /// Minimum time between two automatic backups
    pub auto_backup_interval: Duration,
    /// Pause between automatic migration steps
    pub migration_interval: Duration,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            max_handles: 32,
            acquire_timeout_ms: 30_000,
            busy_timeout_ms: 10_000,
            wal: true,
            auto_backup_interval: Duration::from_secs(600),
            migration_interval: Duration::from_secs(2),
        }
    }
}

impl DatabaseConfig {
    pub fn max_handles(mut self, n: usize) -> Self {
        self.max_handles = n.max(1);
        self
    }

    pub fn acquire_timeout(mut self, ms: u64) -> Self {
        self.acquire_timeout_ms = ms;
        self
    }

    pub fn busy_timeout(mut self, ms: u32) -> Self {
        self.busy_timeout_ms = ms;
        self
    }

    pub fn wal(mut self, enabled: bool) -> Self {
        self.wal = enabled;
        self
    }

    pub fn auto_backup_interval(mut self, interval: Duration) -> Self {
        self.auto_backup_interval = interval;
        self
    }

    pub fn migration_interval(mut self, interval: Duration) -> Self {
        self.migration_interval = interval;
        self
    }
}

/// Order in which named configs run on a new connection.
///
/// Higher priorities run first; equal priorities run in insertion order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub enum ConfigPriority {
    Highest,
    High,
    #[default]
    Default,
    Low,
}

/// Applies (or reverts) a named config on one native connection.
pub type ConfigInvocation = Arc<dyn Fn(&SqliteConnection) -> Result<()> + Send + Sync>;

/// A named config registered with `Database::set_config`.
pub(crate) struct ConnectionConfig {
    pub(crate) name: String,
    pub(crate) invocation: ConfigInvocation,
    pub(crate) uninvocation: Option<ConfigInvocation>,
    pub(crate) priority: ConfigPriority,
    pub(crate) order: u64,
}

impl std::fmt::Debug for ConnectionConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionConfig")
            .field("name", &self.name)
            .field("priority", &self.priority)
            .field("order", &self.order)
            .finish()
    }
}

/// Cipher compatibility level passed to the encryption extension.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum CipherVersion {
    /// Use `GlobalConfig::default_cipher_version`
    #[default]
    Default,
    V1,
    V2,
    V3,
    V4,
}

impl CipherVersion {
    pub(crate) fn compatibility(self) -> Option<u8> {
        match self {
            CipherVersion::Default => None,
            CipherVersion::V1 => Some(1),
            CipherVersion::V2 => Some(2),
            CipherVersion::V3 => Some(3),
            CipherVersion::V4 => Some(4),
        }
    }
}

/// Page size used when a cipher key is set without one.
pub const DEFAULT_CIPHER_PAGE_SIZE: u32 = 4096;

/// Key material issued on every new connection.
#[derive(Clone, PartialEq, Eq)]
pub(crate) struct CipherSettings {
    pub(crate) key: Vec<u8>,
    pub(crate) page_size: u32,
    pub(crate) version: CipherVersion,
}

impl std::fmt::Debug for CipherSettings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CipherSettings")
            .field("key", &"<redacted>")
            .field("page_size", &self.page_size)
            .field("version", &self.version)
            .finish()
    }
}

impl CipherSettings {
    /// Pragmas issued, in order, right after a connection opens.
    pub(crate) fn pragmas(&self) -> Vec<String> {
        let hex: String = self.key.iter().map(|b| format!("{:02X}", b)).collect();
        let mut pragmas = vec![
            format!("PRAGMA key = \"x'{}'\"", hex),
            format!("PRAGMA cipher_page_size = {}", self.page_size),
        ];
        let version = match self.version {
            CipherVersion::Default => GlobalConfig::default_cipher_version(),
            v => v,
        };
        if let Some(level) = version.compatibility() {
            pragmas.push(format!("PRAGMA cipher_compatibility = {}", level));
        }
        pragmas
    }
}

#[derive(Default)]
pub(crate) struct GlobalState {
    pub(crate) default_cipher_version: CipherVersion,
    pub(crate) performance: Option<PerformanceTracer>,
    pub(crate) sql: Option<SqlTracer>,
    pub(crate) exception: Option<ExceptionTracer>,
    pub(crate) operation: Option<OperationTracer>,
}

/// Global state storage using `OnceLock` for thread-safe single initialization.
static GLOBAL: OnceLock<RwLock<GlobalState>> = OnceLock::new();

/// Process-wide defaults shared by every database.
pub struct GlobalConfig;

impl GlobalConfig {
    pub(crate) fn read() -> RwLockReadGuard<'static, GlobalState> {
        GLOBAL
            .get_or_init(RwLock::default)
            .read()
            .unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn write() -> RwLockWriteGuard<'static, GlobalState> {
        GLOBAL
            .get_or_init(RwLock::default)
            .write()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Cipher version used by keys set with `CipherVersion::Default`.
    pub fn default_cipher_version() -> CipherVersion {
        Self::read().default_cipher_version
    }

    pub fn set_default_cipher_version(version: CipherVersion) {
        Self::write().default_cipher_version = version;
    }

    /// Drop every global tracer and restore the defaults.
    pub fn reset_for_testing() {
        *Self::write() = GlobalState::default();
    }
}
