//! WCDB Rust - an embedded SQLite database with pooled handles.
//!
//! A `Database` owns a pool of native connections to one file (or one
//! in-memory database). Work happens through `Handle`s, which lease a
//! connection on first use and give it back when invalidated:
//!
//! - `HandleOperation` typed row-level CRUD and transactions
//! - `HandleOrmOperation` and `Table` the same for `TableBinding` objects
//! - named connection configs, cipher keys and tracers
//! - backup, deposit and retrieve for corrupted databases
//! - incremental migration between tables and database files
//!
//! # Quick Start
//!
//! ```rust
//! use wcdb::{Database, HandleOperation, QueryOptions, Value};
//!
//! let mut db = Database::in_memory();
//! db.execute("CREATE TABLE t (id INTEGER PRIMARY KEY, name TEXT)").unwrap();
//! db.insert_rows(
//!     &[vec![Value::from(1), Value::from("a")], vec![Value::from(2), Value::from("b")]],
//!     &["id", "name"],
//!     "t",
//! )
//! .unwrap();
//!
//! let name = db
//!     .get_value("name", "t", &QueryOptions::new().condition("id = 2"))
//!     .unwrap();
//! assert_eq!(name, Some(Value::Text("b".into())));
//! ```

pub mod config;
pub mod database;
pub mod handle;
pub mod migration;
pub mod operation;
pub mod repair;
pub mod table;
pub mod trace;

pub use config::{
    CipherVersion, ConfigInvocation, ConfigPriority, DEFAULT_CIPHER_PAGE_SIZE, DatabaseConfig,
    GlobalConfig,
};
pub use database::{ConfiguredConnection, ConnectionFactory, Database};
pub use handle::{CancellationGuard, Handle, PausableOutcome};
pub use migration::{MIGRATION_BATCH, MigrationFilter, MigrationInfo, MigrationNotification};
pub use operation::{HandleGuard, HandleOperation, HandleOrmOperation};
pub use repair::{BackupFilter, CorruptionNotification};
pub use table::Table;
pub use trace::{
    DatabaseOperation, ExceptionTracer, OperationInfo, OperationTracer, PerformanceInfo,
    PerformanceTracer, SqlInfo, SqlTracer,
};

pub use wcdb_core::{
    CancellationSignal, ColumnType, ConflictAction, ContractKind, EngineError, EngineErrorKind,
    Error, FromValue, HandleErrorKind, QueryOptions, Result, Row, Statement, StatementDelete,
    StatementInsert, StatementSelect, StatementUpdate, TableBinding, Value,
};
pub use wcdb_core::params;
pub use wcdb_sqlite::{CheckpointMode, SqliteConnection};

/// Version of the linked SQLite library.
pub fn sqlite_version() -> &'static str {
    wcdb_sqlite::sqlite_version()
}
