//! A handle: one leased native connection plus the statements compiled on it.
//!
//! The connection is leased lazily, on the first operation that needs it,
//! and returned to the pool exactly once by `invalidate` (or on drop).

use crate::database::{Database, Lease};
use std::collections::HashMap;
use std::thread;
use std::time::Duration;
use wcdb_core::{CancellationSignal, ContractKind, Error, Result, Statement, Value};
use wcdb_sqlite::{PreparedStatement, SqliteConnection};

/// What the body of a pausable transaction wants next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PausableOutcome {
    /// Call the body again
    Continue,
    /// Commit and return
    Stop,
}

/// Pause between committing a pausable transaction and beginning the next
/// one, so a waiting writer can take the connection.
const PAUSE_YIELD: Duration = Duration::from_micros(100);

/// Clears the interrupt listener installed by
/// `Handle::attach_cancellation_signal` when dropped.
#[must_use = "the signal is detached as soon as the guard is dropped"]
#[derive(Debug)]
pub struct CancellationGuard {
    signal: CancellationSignal,
}

impl Drop for CancellationGuard {
    fn drop(&mut self) {
        self.signal.clear_on_cancel_listener();
    }
}

pub struct Handle {
    database: Database,
    write_hint: bool,
    lease: Option<Lease>,
    main_statement: Option<PreparedStatement>,
    /// Additional statements kept compiled, keyed by SQL text
    statements: HashMap<String, PreparedStatement>,
    cancellation: Option<CancellationSignal>,
    invalidated: bool,
}

impl std::fmt::Debug for Handle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Handle")
            .field("path", &self.database.path())
            .field("write_hint", &self.write_hint)
            .field("leased", &self.lease.is_some())
            .field("statements", &self.statements.len())
            .field("invalidated", &self.invalidated)
            .finish()
    }
}

impl Handle {
    pub(crate) fn new(database: Database, write_hint: bool) -> Self {
        Self {
            database,
            write_hint,
            lease: None,
            main_statement: None,
            statements: HashMap::new(),
            cancellation: None,
            invalidated: false,
        }
    }

    pub fn database(&self) -> &Database {
        &self.database
    }

    pub fn write_hint(&self) -> bool {
        self.write_hint
    }

    pub fn is_invalidated(&self) -> bool {
        self.invalidated
    }

    fn check_valid(&self) -> Result<()> {
        if self.invalidated {
            return Err(Error::contract(
                ContractKind::UseAfterInvalidate,
                "handle used after invalidate",
            ));
        }
        Ok(())
    }

    /// The native connection, leased from the pool on first use.
    pub fn connection(&mut self) -> Result<&mut SqliteConnection> {
        self.check_valid()?;
        let lease = match self.lease.take() {
            Some(lease) => lease,
            None => {
                let lease = self.database.inner.acquire(self.write_hint)?;
                tracing::debug!(path = %self.database.path(), write = self.write_hint, "handle leased connection");
                if let Some(signal) = &self.cancellation {
                    install_interrupt(signal, lease.conn.interrupt_handle());
                }
                lease
            }
        };
        Ok(&mut self.lease.insert(lease).conn)
    }

    fn check_cancellation(&self) -> Result<()> {
        match &self.cancellation {
            Some(signal) => signal.throw_if_canceled(),
            None => Ok(()),
        }
    }

    /// Compile `statement` into the main slot, finalizing what was there.
    ///
    /// The main statement finalizes itself when a step fails.
    pub fn prepared_with_main_statement<S: Statement + ?Sized>(
        &mut self,
        statement: &S,
    ) -> Result<&mut PreparedStatement> {
        self.check_valid()?;
        self.check_cancellation()?;
        if let Some(stmt) = self.main_statement.as_mut() {
            stmt.finalize();
        }
        let mut stmt = self.connection()?.new_statement();
        stmt.set_auto_finalize(true);
        let stmt = self.main_statement.insert(stmt);
        stmt.prepare_statement(statement)?;
        Ok(stmt)
    }

    /// Finalize the main statement, if any.
    pub fn finalize_main_statement(&mut self) {
        if let Some(stmt) = self.main_statement.as_mut() {
            stmt.finalize();
        }
    }

    /// Prepare `statement` in the main slot, bind `params` from index 1,
    /// run `f` and finalize, whatever `f` returns.
    pub(crate) fn with_main_statement<S, R, F>(&mut self, statement: &S, params: &[Value], f: F) -> Result<R>
    where
        S: Statement + ?Sized,
        F: FnOnce(&mut PreparedStatement) -> Result<R>,
    {
        let stmt = self.prepared_with_main_statement(statement)?;
        let result = stmt.bind_row(params).and_then(|()| f(stmt));
        stmt.finalize();
        result
    }

    /// A compiled statement kept across calls, keyed by its SQL text.
    ///
    /// A cached statement is reset before it is returned; one that is no
    /// longer compiled is compiled again.
    pub fn get_or_create_prepared_statement<S: Statement + ?Sized>(
        &mut self,
        statement: &S,
    ) -> Result<&mut PreparedStatement> {
        self.check_valid()?;
        self.check_cancellation()?;
        let sql = statement.sql().into_owned();
        let reusable = self
            .statements
            .get(&sql)
            .is_some_and(PreparedStatement::is_prepared);
        if !reusable {
            let mut stmt = self.connection()?.new_statement();
            stmt.prepare_statement(statement)?;
            self.statements.insert(sql.clone(), stmt);
        }
        let stmt = self
            .statements
            .get_mut(&sql)
            .ok_or_else(|| Error::contract(ContractKind::NotPrepared, "statement cache lost its entry"))?;
        if reusable {
            stmt.reset()?;
        }
        Ok(stmt)
    }

    /// Finalize the cached statements; the main slot is left alone.
    pub fn finalize_all_statements(&mut self) {
        for (_, mut stmt) in self.statements.drain() {
            stmt.finalize();
        }
    }

    /// Run a single statement to completion.
    pub fn execute<S: Statement + ?Sized>(&mut self, statement: &S) -> Result<()> {
        self.execute_with(statement, &[])
    }

    /// Run a single statement to completion with `params` bound from index 1.
    pub fn execute_with<S: Statement + ?Sized>(&mut self, statement: &S, params: &[Value]) -> Result<()> {
        self.with_main_statement(statement, params, |stmt| {
            stmt.step()?;
            Ok(())
        })
    }

    /// Rows changed by the most recent statement.
    pub fn changes(&mut self) -> Result<i64> {
        Ok(self.connection()?.changes())
    }

    pub fn total_changes(&mut self) -> Result<i64> {
        Ok(self.connection()?.total_changes())
    }

    pub fn last_inserted_row_id(&mut self) -> Result<i64> {
        Ok(self.connection()?.last_insert_rowid())
    }

    /// Is the leased connection inside a transaction? `false` without a lease.
    pub fn is_in_transaction(&self) -> bool {
        self.lease
            .as_ref()
            .is_some_and(|lease| lease.conn.is_in_transaction())
    }

    pub fn table_exists(&mut self, name: &str) -> Result<bool> {
        self.connection()?.table_exists(name)
    }

    // ==================== Transactions ====================

    /// Begin a transaction; nests as a savepoint inside an open one.
    pub fn begin_transaction(&mut self) -> Result<()> {
        self.connection()?.begin_transaction()
    }

    /// Commit the innermost level, rolling it back if the commit fails.
    pub fn commit_transaction(&mut self) -> Result<()> {
        let conn = self.connection()?;
        let outermost = conn.transaction_level() == 1;
        conn.commit_or_rollback_transaction()?;
        if outermost {
            self.database.on_write_committed();
        }
        Ok(())
    }

    /// Roll back the innermost level. Never fails.
    pub fn rollback_transaction(&mut self) {
        if self.invalidated {
            return;
        }
        if let Some(lease) = self.lease.as_mut() {
            lease.conn.rollback_transaction();
        }
    }

    pub fn begin_nested_transaction(&mut self) -> Result<()> {
        self.connection()?.begin_nested_transaction()
    }

    pub fn commit_nested_transaction(&mut self) -> Result<()> {
        let conn = self.connection()?;
        let outermost = conn.transaction_level() == 1;
        conn.commit_nested_transaction()?;
        if outermost {
            self.database.on_write_committed();
        }
        Ok(())
    }

    pub fn rollback_nested_transaction(&mut self) -> Result<()> {
        self.connection()?.rollback_nested_transaction()
    }

    /// Run `body` in a transaction: committed when it returns `Ok(true)`,
    /// rolled back otherwise. Returns whether it committed.
    pub fn run_transaction<F>(&mut self, body: F) -> Result<bool>
    where
        F: FnOnce(&mut Handle) -> Result<bool>,
    {
        self.begin_transaction()?;
        self.finish_transaction(body, Self::commit_transaction)
    }

    /// Like `run_transaction`, always nesting as a savepoint when a
    /// transaction is already open.
    pub fn run_nested_transaction<F>(&mut self, body: F) -> Result<bool>
    where
        F: FnOnce(&mut Handle) -> Result<bool>,
    {
        self.begin_nested_transaction()?;
        self.finish_transaction(body, Self::commit_nested_transaction)
    }

    fn finish_transaction<F>(&mut self, body: F, commit: fn(&mut Handle) -> Result<()>) -> Result<bool>
    where
        F: FnOnce(&mut Handle) -> Result<bool>,
    {
        match body(self) {
            Ok(true) => {
                commit(self)?;
                Ok(true)
            }
            Ok(false) => {
                self.rollback_transaction();
                Ok(false)
            }
            Err(err) => {
                self.rollback_transaction();
                Err(err)
            }
        }
    }

    /// Run `body` repeatedly inside write transactions that step aside for
    /// other writers.
    ///
    /// `body` receives `true` as its second argument on the first call of
    /// each new transaction. After every call the transaction is committed
    /// if `body` returned `Stop`, or if another thread is waiting to write;
    /// in the latter case the connection is released briefly and a new
    /// transaction begins. An error rolls back the current transaction.
    pub fn run_pausable_transaction<F>(&mut self, mut body: F) -> Result<()>
    where
        F: FnMut(&mut Handle, bool) -> Result<PausableOutcome>,
    {
        let mut need_begin = true;
        let mut is_new = true;
        loop {
            if need_begin {
                self.begin_transaction()?;
                need_begin = false;
            }
            let outcome = match body(self, is_new) {
                Ok(outcome) => outcome,
                Err(err) => {
                    self.rollback_transaction();
                    return Err(err);
                }
            };
            is_new = false;

            let stop = outcome == PausableOutcome::Stop;
            if stop || self.database.has_pending_writer() {
                self.commit_transaction()?;
                if stop {
                    return Ok(());
                }
                tracing::debug!(path = %self.database.path(), "pausable transaction yielding to writer");
                self.release_connection();
                thread::sleep(PAUSE_YIELD);
                need_begin = true;
                is_new = true;
            }
        }
    }

    // ==================== Cancellation ====================

    /// Interrupt this handle's connection when `signal` fires.
    ///
    /// Statements prepared after the signal fired fail with
    /// `Error::Cancelled`; a statement that is stepping is interrupted and
    /// fails the same way.
    pub fn attach_cancellation_signal(&mut self, signal: &CancellationSignal) -> CancellationGuard {
        if let Some(lease) = &self.lease {
            install_interrupt(signal, lease.conn.interrupt_handle());
        }
        self.cancellation = Some(signal.clone());
        CancellationGuard {
            signal: signal.clone(),
        }
    }

    pub fn detach_cancellation_signal(&mut self) {
        if let Some(signal) = self.cancellation.take() {
            signal.clear_on_cancel_listener();
        }
    }

    // ==================== Lifetime ====================

    /// Finalize every statement and hand the connection back to the pool,
    /// keeping the handle usable.
    fn release_connection(&mut self) {
        self.finalize_main_statement();
        self.main_statement = None;
        self.finalize_all_statements();
        if let Some(signal) = &self.cancellation {
            signal.clear_on_cancel_listener();
        }
        if let Some(mut lease) = self.lease.take() {
            while lease.conn.transaction_level() > 0 {
                lease.conn.rollback_transaction();
            }
            tracing::debug!(path = %self.database.path(), "handle returned connection");
        }
    }

    /// Finalize every statement, roll back any open transaction and return
    /// the connection to the pool. Idempotent; every later operation fails
    /// with a contract violation.
    pub fn invalidate(&mut self) {
        if self.invalidated {
            return;
        }
        self.release_connection();
        self.cancellation = None;
        self.invalidated = true;
    }
}

fn install_interrupt(signal: &CancellationSignal, interrupt: wcdb_sqlite::InterruptHandle) {
    signal.set_on_cancel_listener(Some(move || interrupt.interrupt()));
}

impl Drop for Handle {
    fn drop(&mut self) {
        self.invalidate();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::operation::HandleOperation;
    use wcdb_sqlite::StatementState;

    fn db_with_table() -> Database {
        let db = Database::in_memory();
        let mut handle = db.get_handle(true);
        handle
            .execute("CREATE TABLE t (id INTEGER PRIMARY KEY, v TEXT UNIQUE)")
            .unwrap();
        db
    }

    fn count(handle: &mut Handle) -> i64 {
        handle
            .get_value_from_statement("SELECT count(*) FROM t", &[])
            .unwrap()
            .map(|v| v.as_i64())
            .unwrap_or(-1)
    }

    #[test]
    fn test_lazy_lease_and_invalidate() {
        let db = db_with_table();
        let mut handle = db.get_handle(false);
        assert!(!handle.is_in_transaction());
        assert!(handle.connection().is_ok());
        assert!(db.is_opened());

        handle.invalidate();
        handle.invalidate();
        assert!(handle.is_invalidated());
        let err = handle.execute("SELECT 1").unwrap_err();
        assert_eq!(err.contract_kind(), Some(ContractKind::UseAfterInvalidate));
    }

    #[test]
    fn test_run_transaction_commits_or_rolls_back() {
        let db = db_with_table();
        let mut handle = db.get_handle(true);
        let committed = handle
            .run_transaction(|h| {
                h.execute_with("INSERT INTO t (v) VALUES (?1)", &[Value::from("a")])?;
                Ok(true)
            })
            .unwrap();
        assert!(committed);

        let committed = handle
            .run_transaction(|h| {
                h.execute_with("INSERT INTO t (v) VALUES (?1)", &[Value::from("b")])?;
                Ok(false)
            })
            .unwrap();
        assert!(!committed);

        let err = handle
            .run_transaction(|h| {
                h.execute_with("INSERT INTO t (v) VALUES (?1)", &[Value::from("c")])?;
                h.execute_with("INSERT INTO t (v) VALUES (?1)", &[Value::from("a")])?;
                Ok(true)
            })
            .unwrap_err();
        assert_eq!(err.code(), Some(19));
        assert_eq!(err.extended_code(), Some(2067));
        assert!(!handle.is_in_transaction());
        assert_eq!(count(&mut handle), 1);
    }

    #[test]
    fn test_nested_rollback_keeps_outer_work() {
        let db = db_with_table();
        let mut handle = db.get_handle(true);
        handle
            .run_transaction(|h| {
                h.execute("INSERT INTO t (v) VALUES ('outer')")?;
                let inner = h.run_nested_transaction(|h| {
                    h.execute("INSERT INTO t (v) VALUES ('inner')")?;
                    Ok(false)
                })?;
                assert!(!inner);
                Ok(true)
            })
            .unwrap();
        assert_eq!(count(&mut handle), 1);
    }

    #[test]
    fn test_unbalanced_nested_commit_is_contract_violation() {
        let db = db_with_table();
        let mut handle = db.get_handle(true);
        let err = handle.commit_nested_transaction().unwrap_err();
        assert_eq!(err.contract_kind(), Some(ContractKind::NoTransaction));
        let err = handle.rollback_nested_transaction().unwrap_err();
        assert_eq!(err.contract_kind(), Some(ContractKind::NoTransaction));
    }

    #[test]
    fn test_pausable_transaction_runs_until_stop() {
        let db = db_with_table();
        let mut handle = db.get_handle(true);
        let mut calls = Vec::new();
        handle
            .run_pausable_transaction(|h, is_new| {
                calls.push(is_new);
                h.execute_with("INSERT INTO t (v) VALUES (?1)", &[Value::from(calls.len() as i64)])?;
                Ok(if calls.len() == 3 {
                    PausableOutcome::Stop
                } else {
                    PausableOutcome::Continue
                })
            })
            .unwrap();
        assert_eq!(calls, vec![true, false, false]);
        assert!(!handle.is_in_transaction());
        assert_eq!(count(&mut handle), 3);
    }

    #[test]
    fn test_pausable_transaction_error_rolls_back() {
        let db = db_with_table();
        let mut handle = db.get_handle(true);
        let err = handle
            .run_pausable_transaction(|h, _| {
                h.execute("INSERT INTO t (v) VALUES ('x')")?;
                h.execute("INSERT INTO t (v) VALUES ('x')")?;
                Ok(PausableOutcome::Stop)
            })
            .unwrap_err();
        assert_eq!(err.code(), Some(19));
        assert_eq!(err.extended_code(), Some(2067));
        assert_eq!(count(&mut handle), 0);
    }

    #[test]
    fn test_cached_statement_is_reused_and_reset() {
        let db = db_with_table();
        let mut handle = db.get_handle(true);
        handle.execute("INSERT INTO t (v) VALUES ('a'), ('b')").unwrap();

        let stmt = handle
            .get_or_create_prepared_statement("SELECT v FROM t ORDER BY id")
            .unwrap();
        stmt.step().unwrap();
        assert_eq!(stmt.get_text(0).unwrap(), "a");

        let stmt = handle
            .get_or_create_prepared_statement("SELECT v FROM t ORDER BY id")
            .unwrap();
        assert_eq!(stmt.state(), StatementState::Prepared);
        stmt.step().unwrap();
        assert_eq!(stmt.get_text(0).unwrap(), "a");

        handle.finalize_all_statements();
        handle.invalidate();
    }

    fn statement_counts(handle: &mut Handle) -> (u64, u64, usize) {
        let conn = handle.connection().unwrap();
        (conn.native_prepare_count(), conn.native_finalize_count(), conn.live_statement_count())
    }

    #[test]
    fn test_main_statement_slot_balances_native_calls() {
        let db = db_with_table();
        let mut handle = db.get_handle(true);
        let (prepares, finalizes, live) = statement_counts(&mut handle);

        for i in 0..5 {
            let stmt = handle
                .prepared_with_main_statement(format!("SELECT {}", i).as_str())
                .unwrap();
            stmt.step().unwrap();
            assert_eq!(stmt.get_value(0).unwrap(), Value::Integer(i));
        }
        let (_, _, during) = statement_counts(&mut handle);
        assert_eq!(during, live + 1);

        handle.finalize_main_statement();
        let (prepared, finalized, after) = statement_counts(&mut handle);
        assert_eq!(prepared - prepares, 5);
        assert_eq!(finalized - finalizes, 5);
        assert_eq!(after, live);
    }

    #[test]
    fn test_finalize_all_releases_cached_statements() {
        let db = db_with_table();
        let mut handle = db.get_handle(true);
        let (prepares, finalizes, live) = statement_counts(&mut handle);

        handle.get_or_create_prepared_statement("SELECT 1").unwrap();
        handle.get_or_create_prepared_statement("SELECT 2").unwrap();
        handle.get_or_create_prepared_statement("SELECT 1").unwrap();
        handle.prepared_with_main_statement("SELECT 3").unwrap();
        let (_, _, during) = statement_counts(&mut handle);
        assert_eq!(during, live + 3);

        handle.finalize_all_statements();
        handle.finalize_main_statement();
        let (prepared, finalized, after) = statement_counts(&mut handle);
        assert_eq!(prepared - prepares, 3);
        assert_eq!(finalized - finalizes, 3);
        assert_eq!(after, live);
        handle.invalidate();
    }

    #[test]
    fn test_cancelled_signal_stops_new_statements() {
        let db = db_with_table();
        let mut handle = db.get_handle(false);
        let signal = CancellationSignal::new();
        let _guard = handle.attach_cancellation_signal(&signal);
        handle.execute("SELECT 1").unwrap();
        signal.cancel();
        assert!(matches!(handle.execute("SELECT 1"), Err(Error::Cancelled)));
        handle.detach_cancellation_signal();
        handle.execute("SELECT 1").unwrap();
    }
}
