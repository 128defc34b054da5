//! Online backup between two open connections.

use crate::connection::SqliteConnection;
use crate::ffi;
use std::ffi::{CString, c_int};
use std::thread;
use std::time::Duration;
use wcdb_core::{EngineError, Error, Result};

/// Progress of a running backup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackupProgress {
    pub remaining: i32,
    pub page_count: i32,
}

impl BackupProgress {
    /// Fraction of pages copied, in `0.0..=1.0`.
    pub fn fraction(&self) -> f64 {
        if self.page_count <= 0 {
            return 1.0;
        }
        f64::from(self.page_count - self.remaining) / f64::from(self.page_count)
    }
}

/// Copy `schema` of `source` into the main schema of `dest`.
///
/// Copies `pages_per_step` pages at a time (all at once when zero) and
/// reports progress after each step. Returning `false` from `progress`
/// abandons the backup with `Error::Cancelled`; the destination is left as
/// it was before the backup began.
pub fn backup_database<F>(
    source: &SqliteConnection,
    schema: &str,
    dest: &SqliteConnection,
    pages_per_step: i32,
    mut progress: F,
) -> Result<()>
where
    F: FnMut(BackupProgress) -> bool,
{
    let c_schema = CString::new(schema).map_err(|_| {
        Error::Step(EngineError::new(ffi::SQLITE_MISUSE, "schema name contains null byte"))
    })?;

    let src = source.raw();
    let dst = dest.raw();

    // SAFETY: both connections are open and outlive the backup object
    let backup = unsafe { ffi::sqlite3_backup_init(dst.db, c"main".as_ptr(), src.db, c_schema.as_ptr()) };
    if backup.is_null() {
        // SAFETY: dst.db is valid
        let rc = unsafe { ffi::sqlite3_errcode(dst.db) };
        let err = dst.engine_error(rc, None);
        dst.notify_error(&err);
        return Err(Error::Step(err));
    }

    tracing::debug!(from = %src.path, to = %dst.path, "backup started");
    let step = if pages_per_step <= 0 { -1 } else { pages_per_step };
    let mut rc: c_int;
    loop {
        // SAFETY: backup is a live backup object
        rc = unsafe { ffi::sqlite3_backup_step(backup, step) };
        let current = unsafe {
            // SAFETY: as above
            BackupProgress {
                remaining: ffi::sqlite3_backup_remaining(backup),
                page_count: ffi::sqlite3_backup_pagecount(backup),
            }
        };
        match rc {
            ffi::SQLITE_OK | ffi::SQLITE_BUSY | ffi::SQLITE_LOCKED => {
                if !progress(current) {
                    // SAFETY: finishing an incomplete backup rolls back dest
                    unsafe { ffi::sqlite3_backup_finish(backup) };
                    tracing::debug!(to = %dst.path, "backup abandoned");
                    return Err(Error::Cancelled);
                }
                if rc != ffi::SQLITE_OK {
                    thread::sleep(Duration::from_millis(10));
                }
            }
            ffi::SQLITE_DONE => {
                progress(current);
                break;
            }
            _ => break,
        }
    }

    // SAFETY: backup is live; finish releases it
    let finish = unsafe { ffi::sqlite3_backup_finish(backup) };
    if rc != ffi::SQLITE_DONE || finish != ffi::SQLITE_OK {
        let code = if rc == ffi::SQLITE_DONE { finish } else { rc };
        let err = dst.engine_error(code, None);
        dst.notify_error(&err);
        return Err(Error::Step(err));
    }
    tracing::debug!(to = %dst.path, "backup finished");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backup_copies_rows_with_progress() {
        let dir = tempfile::tempdir().unwrap();
        let source = SqliteConnection::open_memory().unwrap();
        source
            .execute_raw("CREATE TABLE t (a INTEGER); INSERT INTO t VALUES (1), (2), (3)")
            .unwrap();
        let dest =
            SqliteConnection::open_file(dir.path().join("copy.db").to_string_lossy()).unwrap();

        let mut reports = Vec::new();
        backup_database(&source, "main", &dest, 1, |p| {
            reports.push(p);
            true
        })
        .unwrap();

        assert!(!reports.is_empty());
        assert_eq!(reports.last().map(|p| p.remaining), Some(0));
        assert!((reports.last().unwrap().fraction() - 1.0).abs() < f64::EPSILON);
        let mut stmt = dest.prepare("SELECT count(*) FROM t").unwrap();
        assert_eq!(stmt.get_one_column().unwrap()[0].as_i64(), 3);
    }

    #[test]
    fn test_backup_abandoned_by_monitor() {
        let source = SqliteConnection::open_memory().unwrap();
        source.execute_raw("CREATE TABLE t (a BLOB)").unwrap();
        for _ in 0..20 {
            source
                .execute_raw("INSERT INTO t VALUES (zeroblob(8192))")
                .unwrap();
        }
        let dest = SqliteConnection::open_memory().unwrap();
        let err = backup_database(&source, "main", &dest, 1, |_| false).unwrap_err();
        assert!(matches!(err, Error::Cancelled));
        assert!(!dest.table_exists("t").unwrap());
    }

    #[test]
    fn test_fraction_of_empty_backup() {
        let p = BackupProgress {
            remaining: 0,
            page_count: 0,
        };
        assert!((p.fraction() - 1.0).abs() < f64::EPSILON);
    }
}
