//! SQL, performance, error and lifecycle tracing.
//!
//! Each event goes to the database's own tracer first and then to the
//! global one. Tracers run on the thread that produced the event, so they
//! should be cheap.

use crate::config::GlobalConfig;
use crate::database::{Database, DatabaseInner};
use std::sync::{Arc, PoisonError, Weak};
use std::time::Duration;
use wcdb_core::{EngineError, StatementKind};
use wcdb_sqlite::ConnectionObserver;

/// A statement that ran to completion.
#[derive(Debug, Clone, Copy)]
pub struct PerformanceInfo<'a> {
    pub tag: Option<i64>,
    pub path: &'a str,
    pub sql: &'a str,
    pub cost: Duration,
}

/// A statement about to execute.
#[derive(Debug, Clone, Copy)]
pub struct SqlInfo<'a> {
    pub tag: Option<i64>,
    pub path: &'a str,
    pub sql: &'a str,
}

pub type PerformanceTracer = Arc<dyn Fn(&PerformanceInfo<'_>) + Send + Sync>;
pub type SqlTracer = Arc<dyn Fn(&SqlInfo<'_>) + Send + Sync>;
pub type ExceptionTracer = Arc<dyn Fn(&EngineError) + Send + Sync>;
pub type OperationTracer = Arc<dyn Fn(&Database, DatabaseOperation, &OperationInfo) + Send + Sync>;

/// Database lifecycle events reported to the global operation tracer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DatabaseOperation {
    Create,
    SetTag,
    OpenHandle,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OperationInfo {
    /// Native connections alive after the operation
    pub handle_count: usize,
    /// Time spent opening and configuring the connection
    pub open_time: Duration,
}

#[derive(Default)]
pub(crate) struct Tracers {
    pub(crate) performance: Option<PerformanceTracer>,
    pub(crate) sql: Option<SqlTracer>,
    pub(crate) exception: Option<ExceptionTracer>,
    /// Also trace transaction control statements
    pub(crate) full_sql: bool,
}

/// Transaction control the library issues on its own.
fn is_transaction_control(sql: &str) -> bool {
    match StatementKind::classify(sql) {
        StatementKind::Begin | StatementKind::Commit | StatementKind::Abort => true,
        _ => {
            let head = sql.trim_start().as_bytes();
            let starts_with = |word: &str| {
                head.len() >= word.len() && head[..word.len()].eq_ignore_ascii_case(word.as_bytes())
            };
            starts_with("SAVEPOINT") || starts_with("RELEASE")
        }
    }
}

/// Bridges connection events to the tracers of the owning database.
pub(crate) struct DatabaseObserver {
    database: Weak<DatabaseInner>,
}

impl DatabaseObserver {
    pub(crate) fn new(database: Weak<DatabaseInner>) -> Self {
        Self { database }
    }
}

impl ConnectionObserver for DatabaseObserver {
    fn on_sql(&self, sql: &str) {
        let Some(inner) = self.database.upgrade() else {
            return;
        };
        let (local, full) = {
            let tracers = inner.tracers.read().unwrap_or_else(PoisonError::into_inner);
            (tracers.sql.clone(), tracers.full_sql)
        };
        let global = GlobalConfig::read().sql.clone();
        if (local.is_none() && global.is_none()) || (!full && is_transaction_control(sql)) {
            return;
        }
        let info = SqlInfo {
            tag: inner.tag(),
            path: &inner.path,
            sql,
        };
        if let Some(tracer) = local {
            tracer(&info);
        }
        if let Some(tracer) = global {
            tracer(&info);
        }
    }

    fn on_performance(&self, sql: &str, cost: Duration) {
        let Some(inner) = self.database.upgrade() else {
            return;
        };
        let local = inner
            .tracers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .performance
            .clone();
        let global = GlobalConfig::read().performance.clone();
        if local.is_none() && global.is_none() {
            return;
        }
        let info = PerformanceInfo {
            tag: inner.tag(),
            path: &inner.path,
            sql,
            cost,
        };
        if let Some(tracer) = local {
            tracer(&info);
        }
        if let Some(tracer) = global {
            tracer(&info);
        }
    }

    fn on_error(&self, error: &EngineError) {
        let Some(inner) = self.database.upgrade() else {
            return;
        };
        let error = error.clone().with_tag(inner.tag());
        inner.record_error(&error);

        let local = inner
            .tracers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .exception
            .clone();
        let global = GlobalConfig::read().exception.clone();
        if let Some(tracer) = local {
            tracer(&error);
        }
        if let Some(tracer) = global {
            tracer(&error);
        }

        if error.is_corruption() {
            Database::from_inner(inner).mark_corrupted();
        }
    }
}

impl Database {
    /// Trace statements that ran to completion with their cost.
    pub fn trace_performance(&self, tracer: Option<PerformanceTracer>) {
        self.inner.tracers_mut().performance = tracer;
    }

    /// Trace every statement as it starts executing.
    pub fn trace_sql(&self, tracer: Option<SqlTracer>) {
        self.inner.tracers_mut().sql = tracer;
    }

    /// Trace engine errors raised on this database.
    pub fn trace_exception(&self, tracer: Option<ExceptionTracer>) {
        self.inner.tracers_mut().exception = tracer;
    }

    /// Include BEGIN, COMMIT, ROLLBACK and savepoint statements in the SQL trace.
    pub fn set_full_sql_trace_enable(&self, enable: bool) {
        self.inner.tracers_mut().full_sql = enable;
    }

    pub fn global_trace_performance(tracer: Option<PerformanceTracer>) {
        GlobalConfig::write().performance = tracer;
    }

    pub fn global_trace_sql(tracer: Option<SqlTracer>) {
        GlobalConfig::write().sql = tracer;
    }

    pub fn global_trace_exception(tracer: Option<ExceptionTracer>) {
        GlobalConfig::write().exception = tracer;
    }

    /// Trace creation, tagging and connection opening of every database.
    pub fn global_trace_database_operation(tracer: Option<OperationTracer>) {
        GlobalConfig::write().operation = tracer;
    }

    pub(crate) fn report_operation(&self, operation: DatabaseOperation, info: &OperationInfo) {
        let tracer = GlobalConfig::read().operation.clone();
        if let Some(tracer) = tracer {
            tracer(self, operation, info);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transaction_control_detection() {
        assert!(is_transaction_control("BEGIN IMMEDIATE"));
        assert!(is_transaction_control("COMMIT"));
        assert!(is_transaction_control("  savepoint wcdb_lv_2"));
        assert!(is_transaction_control("RELEASE wcdb_lv_2"));
        assert!(is_transaction_control("ROLLBACK TO wcdb_lv_2; RELEASE wcdb_lv_2"));
        assert!(!is_transaction_control("SELECT 1"));
        assert!(!is_transaction_control("INSERT INTO t VALUES (1)"));
        assert!(!is_transaction_control("REL"));
    }
}
