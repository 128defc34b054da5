//! SQLite statement and connection layer for WCDB Rust.
//!
// FFI bindings require unsafe code - this is expected for database drivers
#![allow(unsafe_code)]
//!
//! This crate owns everything that touches the native engine: compiling and
//! stepping statements, binding and reading values, the per-connection
//! transaction-level state machine, interruption and online backup.
//!
//! # Example
//!
//! ```rust
//! use wcdb_sqlite::{SqliteConnection, StepResult};
//! use wcdb_core::Value;
//!
//! let conn = SqliteConnection::open_memory().unwrap();
//! conn.execute_raw("CREATE TABLE users (id INTEGER PRIMARY KEY, name TEXT)").unwrap();
//!
//! let mut insert = conn.prepare("INSERT INTO users (name) VALUES (?1)").unwrap();
//! insert.bind_text("Alice", 1).unwrap();
//! assert_eq!(insert.step().unwrap(), StepResult::Done);
//!
//! let mut select = conn.prepare("SELECT name FROM users").unwrap();
//! assert_eq!(select.get_one_column().unwrap(), vec![Value::Text("Alice".into())]);
//! ```
//!
//! # Type Mapping
//!
//! | Value | SQLite Type |
//! |-------|-------------|
//! | `Integer(i64)` | INTEGER |
//! | `Float(f64)` | REAL |
//! | `Text(String)` | TEXT |
//! | `Blob(Vec<u8>)` | BLOB |
//! | `Null` | NULL |
//!
//! # Thread Safety
//!
//! Connections are opened in serialized mode. A `SqliteConnection` and its
//! statements are `Send` so the pool can move them between threads, and an
//! `InterruptHandle` may be used from any thread while a statement steps.

pub mod backup;
pub mod connection;
pub mod ffi;
pub mod statement;
pub mod types;

pub use backup::{BackupProgress, backup_database};
pub use connection::{
    CheckpointMode, ConnectionObserver, InterruptHandle, OpenFlags, SqliteConfig,
    SqliteConnection, library_version,
};
pub use statement::{PreparedStatement, StatementState, StepResult};

/// Re-export the SQLite library version.
pub fn sqlite_version() -> &'static str {
    ffi::version()
}

/// Re-export the SQLite library version number.
pub fn sqlite_version_number() -> i32 {
    ffi::version_number()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sqlite_version() {
        let version = sqlite_version();
        assert!(version.starts_with('3'));
        assert_eq!(version, library_version());
        assert!(sqlite_version_number() >= 3_035_000);
    }
}
