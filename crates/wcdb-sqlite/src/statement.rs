//! Prepared statements.
//!
//! A `PreparedStatement` owns at most one compiled native statement and
//! moves through `Unprepared -> Prepared -> {Row | Done} -> Finalized`.
//! Preparing again finalizes the previous compilation first, so a slot
//! never holds two native statements.

#![allow(clippy::borrow_as_ptr)]

use crate::connection::RawConnection;
use crate::ffi;
use crate::types;
use std::ffi::{CString, c_char, c_int};
use std::ptr;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Instant;
use wcdb_core::{
    CancellationSignal, ColumnInfo, ColumnType, ContractKind, EngineError, Error, Result, Row,
    Statement, StatementKind, TableBinding, Value, is_blank_sql,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatementState {
    Unprepared,
    Prepared,
    Row,
    Done,
    Finalized,
}

/// Outcome of a successful `step`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepResult {
    Row,
    Done,
}

pub struct PreparedStatement {
    conn: Arc<RawConnection>,
    stmt: *mut ffi::sqlite3_stmt,
    state: StatementState,
    sql: String,
    kind: StatementKind,
    auto_finalize: bool,
    columns: Option<Arc<ColumnInfo>>,
    /// Connection reset epoch observed at the last step
    epoch: u64,
    started: Option<Instant>,
}

// SAFETY: the statement is used by one thread at a time; the connection it
// belongs to is opened in serialized mode.
unsafe impl Send for PreparedStatement {}

impl std::fmt::Debug for PreparedStatement {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PreparedStatement")
            .field("sql", &self.sql)
            .field("state", &self.state)
            .field("auto_finalize", &self.auto_finalize)
            .finish()
    }
}

impl PreparedStatement {
    pub(crate) fn new(conn: Arc<RawConnection>) -> Self {
        Self {
            conn,
            stmt: ptr::null_mut(),
            state: StatementState::Unprepared,
            sql: String::new(),
            kind: StatementKind::Other,
            auto_finalize: false,
            columns: None,
            epoch: 0,
            started: None,
        }
    }

    /// Finalize automatically when `step` fails.
    pub fn set_auto_finalize(&mut self, auto_finalize: bool) {
        self.auto_finalize = auto_finalize;
    }

    pub fn auto_finalize(&self) -> bool {
        self.auto_finalize
    }

    pub fn state(&self) -> StatementState {
        self.effective_state()
    }

    pub fn sql(&self) -> &str {
        &self.sql
    }

    pub fn kind(&self) -> StatementKind {
        self.kind
    }

    pub fn is_prepared(&self) -> bool {
        !self.stmt.is_null()
    }

    pub fn is_done(&self) -> bool {
        self.effective_state() == StatementState::Done
    }

    /// Compile raw SQL, replacing any previous compilation.
    ///
    /// On failure the statement is left unprepared.
    pub fn prepare(&mut self, sql: &str) -> Result<()> {
        self.prepare_with_kind(sql, StatementKind::classify(sql))
    }

    /// Compile a statement object, replacing any previous compilation.
    pub fn prepare_statement<S: Statement + ?Sized>(&mut self, statement: &S) -> Result<()> {
        let sql = statement.sql();
        self.prepare_with_kind(&sql, statement.kind())
    }

    fn prepare_with_kind(&mut self, sql: &str, kind: StatementKind) -> Result<()> {
        self.release_native();
        self.state = StatementState::Unprepared;

        let c_sql = CString::new(sql).map_err(|_| {
            Error::Compile(
                EngineError::new(ffi::SQLITE_MISUSE, "SQL contains null byte").with_sql(sql),
            )
        })?;

        let mut stmt: *mut ffi::sqlite3_stmt = ptr::null_mut();
        let mut tail: *const c_char = ptr::null();
        // SAFETY: all pointers are valid; the connection outlives the call
        let rc = unsafe {
            ffi::sqlite3_prepare_v2(
                self.conn.db,
                c_sql.as_ptr(),
                c_sql.as_bytes().len() as c_int,
                &mut stmt,
                &mut tail,
            )
        };

        if rc != ffi::SQLITE_OK {
            if !stmt.is_null() {
                // SAFETY: stmt came from prepare
                unsafe { ffi::sqlite3_finalize(stmt) };
            }
            let err = self.conn.engine_error(rc, Some(sql));
            self.conn.notify_error(&err);
            return Err(Error::Compile(err));
        }
        if stmt.is_null() {
            // Whitespace or comment only: the engine compiles nothing.
            return Err(Error::Compile(
                EngineError::new(ffi::SQLITE_MISUSE, "statement is empty").with_sql(sql),
            ));
        }

        // The engine compiles the first statement only; anything after it
        // would be dropped silently.
        let consumed = if tail.is_null() {
            sql.len()
        } else {
            (tail as usize).saturating_sub(c_sql.as_ptr() as usize)
        };
        let rest = sql.get(consumed..).unwrap_or_default();
        if !is_blank_sql(rest) {
            // SAFETY: stmt came from prepare and is not stored anywhere
            unsafe { ffi::sqlite3_finalize(stmt) };
            tracing::warn!(sql = %sql, "more than one statement in prepare");
            return Err(Error::Compile(
                EngineError::new(ffi::SQLITE_MISUSE, "only one statement can be prepared at a time")
                    .with_sql(sql),
            ));
        }

        self.conn.prepares.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(sql = %sql, "prepare");

        self.stmt = stmt;
        self.sql = sql.to_string();
        self.kind = kind;
        self.state = StatementState::Prepared;
        self.epoch = self.conn.reset_epoch();
        self.started = None;
        Ok(())
    }

    /// A connection-wide reset invalidates any row this statement was on.
    fn sync_with_connection(&self) -> bool {
        self.epoch == self.conn.reset_epoch()
    }

    fn effective_state(&self) -> StatementState {
        match self.state {
            StatementState::Row | StatementState::Done if !self.sync_with_connection() => {
                StatementState::Prepared
            }
            s => s,
        }
    }

    fn check_usable(&self, action: &str) -> Result<()> {
        match self.state {
            StatementState::Finalized => Err(Error::contract(
                ContractKind::UseAfterFinalize,
                format!("{} on a finalized statement", action),
            )),
            StatementState::Unprepared => Err(Error::contract(
                ContractKind::NotPrepared,
                format!("{} on an unprepared statement", action),
            )),
            _ => Ok(()),
        }
    }

    /// Advance execution by one row.
    ///
    /// With `auto_finalize` set, a failing step finalizes the statement
    /// before the error is returned.
    pub fn step(&mut self) -> Result<StepResult> {
        self.check_usable("step")?;

        if self.started.is_none() {
            if let Some(observer) = self.conn.observer() {
                observer.on_sql(&self.sql);
            }
            self.started = Some(Instant::now());
        }

        // SAFETY: stmt is a valid prepared statement
        let rc = unsafe { ffi::sqlite3_step(self.stmt) };
        self.epoch = self.conn.reset_epoch();

        match rc {
            ffi::SQLITE_ROW => {
                self.state = StatementState::Row;
                Ok(StepResult::Row)
            }
            ffi::SQLITE_DONE => {
                self.state = StatementState::Done;
                self.report_performance();
                Ok(StepResult::Done)
            }
            _ => {
                let err = self.conn.engine_error(rc, Some(&self.sql));
                self.conn.notify_error(&err);
                self.started = None;
                if self.auto_finalize {
                    self.finalize();
                } else {
                    self.state = StatementState::Prepared;
                }
                if err.code == ffi::SQLITE_INTERRUPT {
                    return Err(Error::Cancelled);
                }
                Err(Error::Step(err))
            }
        }
    }

    fn report_performance(&mut self) {
        if let Some(started) = self.started.take() {
            if let Some(observer) = self.conn.observer() {
                observer.on_performance(&self.sql, started.elapsed());
            }
        }
    }

    /// Return to the pre-step condition without recompiling.
    ///
    /// Bindings are kept.
    pub fn reset(&mut self) -> Result<()> {
        self.check_usable("reset")?;
        // The return code repeats the last step error, already reported.
        // SAFETY: stmt is valid
        unsafe { ffi::sqlite3_reset(self.stmt) };
        self.state = StatementState::Prepared;
        self.started = None;
        Ok(())
    }

    /// Detach all bound parameter values.
    pub fn clear_bindings(&mut self) -> Result<()> {
        self.check_usable("clear bindings")?;
        // SAFETY: stmt is valid
        unsafe { ffi::sqlite3_clear_bindings(self.stmt) };
        Ok(())
    }

    fn release_native(&mut self) {
        if !self.stmt.is_null() {
            // SAFETY: stmt is valid and owned exclusively by self
            unsafe { ffi::sqlite3_finalize(self.stmt) };
            self.conn.finalizes.fetch_add(1, Ordering::Relaxed);
            tracing::trace!(sql = %self.sql, "finalize");
            self.stmt = ptr::null_mut();
        }
        self.columns = None;
        self.started = None;
    }

    /// Release the native statement. Calling it again is a no-op.
    pub fn finalize(&mut self) {
        self.release_native();
        self.state = StatementState::Finalized;
    }

    /// Like `finalize`, but a second call is reported as a contract violation.
    pub fn finalize_checked(&mut self) -> Result<()> {
        if self.state == StatementState::Finalized {
            return Err(Error::contract(
                ContractKind::UseAfterFinalize,
                "statement finalized twice",
            ));
        }
        self.finalize();
        Ok(())
    }

    // ==================== Binding ====================

    fn bind_result(&self, rc: c_int, index: usize) -> Result<()> {
        if rc == ffi::SQLITE_OK {
            return Ok(());
        }
        let mut err = self.conn.engine_error(rc, Some(&self.sql));
        err.message = format!("failed to bind parameter {}: {}", index, err.message);
        self.conn.notify_error(&err);
        Err(Error::Bind(err))
    }

    fn bind_index(&self, index: usize) -> Result<c_int> {
        self.check_usable("bind")?;
        c_int::try_from(index).map_err(|_| {
            Error::Bind(
                EngineError::new(ffi::SQLITE_RANGE, "column index out of range")
                    .with_sql(self.sql.clone()),
            )
        })
    }

    /// Bind a value to a 1-based parameter index.
    pub fn bind_value(&mut self, value: &Value, index: usize) -> Result<()> {
        let i = self.bind_index(index)?;
        // SAFETY: stmt is valid
        let rc = unsafe { types::bind_value(self.stmt, i, value) };
        self.bind_result(rc, index)
    }

    pub fn bind_i64(&mut self, value: i64, index: usize) -> Result<()> {
        let i = self.bind_index(index)?;
        // SAFETY: stmt is valid
        let rc = unsafe { types::bind_i64(self.stmt, i, value) };
        self.bind_result(rc, index)
    }

    pub fn bind_f64(&mut self, value: f64, index: usize) -> Result<()> {
        let i = self.bind_index(index)?;
        // SAFETY: stmt is valid
        let rc = unsafe { types::bind_f64(self.stmt, i, value) };
        self.bind_result(rc, index)
    }

    pub fn bind_text(&mut self, value: &str, index: usize) -> Result<()> {
        let i = self.bind_index(index)?;
        // SAFETY: stmt is valid
        let rc = unsafe { types::bind_text(self.stmt, i, value) };
        self.bind_result(rc, index)
    }

    pub fn bind_blob(&mut self, value: &[u8], index: usize) -> Result<()> {
        let i = self.bind_index(index)?;
        // SAFETY: stmt is valid
        let rc = unsafe { types::bind_blob(self.stmt, i, value) };
        self.bind_result(rc, index)
    }

    pub fn bind_null(&mut self, index: usize) -> Result<()> {
        let i = self.bind_index(index)?;
        // SAFETY: stmt is valid
        let rc = unsafe { types::bind_null(self.stmt, i) };
        self.bind_result(rc, index)
    }

    /// Bind a sequence of values positionally, starting at index 1.
    pub fn bind_row(&mut self, values: &[Value]) -> Result<()> {
        for (i, value) in values.iter().enumerate() {
            self.bind_value(value, i + 1)?;
        }
        Ok(())
    }

    /// Bind an object's fields positionally.
    ///
    /// `columns` selects and orders the fields; empty binds all of them.
    pub fn bind_object<T: TableBinding>(&mut self, object: &T, columns: &[&str]) -> Result<()> {
        if columns.is_empty() {
            self.bind_row(&object.values())
        } else {
            self.bind_row(&object.values_for(columns))
        }
    }

    /// Index of a named parameter such as `:name`, if present.
    pub fn bind_parameter_index(&self, name: &str) -> Option<usize> {
        if self.stmt.is_null() {
            return None;
        }
        let c_name = CString::new(name).ok()?;
        // SAFETY: stmt and c_name are valid
        let index = unsafe { ffi::sqlite3_bind_parameter_index(self.stmt, c_name.as_ptr()) };
        usize::try_from(index).ok().filter(|i| *i > 0)
    }

    /// Number of parameters in the compiled statement.
    pub fn bind_parameter_count(&self) -> usize {
        if self.stmt.is_null() {
            return 0;
        }
        // SAFETY: stmt is valid
        unsafe { ffi::sqlite3_bind_parameter_count(self.stmt) as usize }
    }

    // ==================== Extraction ====================

    pub fn column_count(&self) -> usize {
        if self.stmt.is_null() {
            return 0;
        }
        // SAFETY: stmt is valid
        unsafe { ffi::sqlite3_column_count(self.stmt) as usize }
    }

    /// Column names, fetched once per compilation.
    pub fn column_names(&mut self) -> Arc<ColumnInfo> {
        if let Some(columns) = &self.columns {
            return Arc::clone(columns);
        }
        let count = self.column_count();
        let names = (0..count)
            .map(|i| {
                // SAFETY: stmt is valid when count > 0
                unsafe { types::column_name(self.stmt, i as c_int) }
                    .unwrap_or_else(|| format!("col{}", i))
            })
            .collect();
        let columns = Arc::new(ColumnInfo::new(names));
        if !self.stmt.is_null() {
            self.columns = Some(Arc::clone(&columns));
        }
        columns
    }

    pub fn column_name(&mut self, index: usize) -> Option<String> {
        self.column_names().name_at(index).map(str::to_string)
    }

    fn check_row(&self, index: usize) -> Result<c_int> {
        self.check_usable("extract")?;
        if self.effective_state() != StatementState::Row {
            return Err(Error::contract(
                ContractKind::NoRow,
                "extraction while not positioned on a row",
            ));
        }
        let count = self.column_count();
        if index >= count {
            return Err(Error::contract(
                ContractKind::ColumnOutOfRange,
                format!("column {} out of range ({} columns)", index, count),
            ));
        }
        Ok(index as c_int)
    }

    pub fn column_type(&self, index: usize) -> Result<ColumnType> {
        let i = self.check_row(index)?;
        // SAFETY: stmt is on a row and i is in range
        Ok(ColumnType::from_code(unsafe {
            ffi::sqlite3_column_type(self.stmt, i)
        }))
    }

    /// Read a column of the current row (0-based).
    pub fn get_value(&self, index: usize) -> Result<Value> {
        let i = self.check_row(index)?;
        // SAFETY: stmt is on a row and i is in range
        Ok(unsafe { types::read_column(self.stmt, i) })
    }

    pub fn get_i64(&self, index: usize) -> Result<i64> {
        self.get_value(index).map(|v| v.as_i64())
    }

    pub fn get_i32(&self, index: usize) -> Result<i32> {
        self.get_value(index).map(|v| v.as_i32())
    }

    pub fn get_i16(&self, index: usize) -> Result<i16> {
        self.get_value(index).map(|v| v.as_i16())
    }

    pub fn get_i8(&self, index: usize) -> Result<i8> {
        self.get_value(index).map(|v| v.as_i8())
    }

    pub fn get_bool(&self, index: usize) -> Result<bool> {
        self.get_value(index).map(|v| v.as_bool())
    }

    pub fn get_f64(&self, index: usize) -> Result<f64> {
        self.get_value(index).map(|v| v.as_f64())
    }

    pub fn get_f32(&self, index: usize) -> Result<f32> {
        self.get_value(index).map(|v| v.as_f32())
    }

    pub fn get_text(&self, index: usize) -> Result<String> {
        self.get_value(index).map(|v| v.to_text().into_owned())
    }

    pub fn get_blob(&self, index: usize) -> Result<Vec<u8>> {
        self.get_value(index).map(|v| v.to_blob().into_owned())
    }

    /// Read every column of the current row.
    pub fn read_row(&mut self) -> Result<Row> {
        let columns = self.column_names();
        let mut values = Vec::with_capacity(columns.len());
        for i in 0..columns.len() {
            values.push(self.get_value(i)?);
        }
        Ok(Row::with_columns(columns, values))
    }

    /// Step once and return the row, if any, then reset.
    pub fn get_one_row(&mut self) -> Result<Option<Row>> {
        let row = match self.step()? {
            StepResult::Row => Some(self.read_row()?),
            StepResult::Done => None,
        };
        self.reset()?;
        Ok(row)
    }

    /// Step to completion collecting the first column of every row.
    pub fn get_one_column(&mut self) -> Result<Vec<Value>> {
        let mut values = Vec::new();
        while self.step()? == StepResult::Row {
            values.push(self.get_value(0)?);
        }
        Ok(values)
    }

    /// Step to completion collecting every row.
    pub fn get_multi_rows(&mut self) -> Result<Vec<Row>> {
        let mut rows = Vec::new();
        while self.step()? == StepResult::Row {
            rows.push(self.read_row()?);
        }
        Ok(rows)
    }

    /// Like `get_multi_rows`, checking `signal` before every step.
    pub fn get_multi_rows_cancellable(&mut self, signal: &CancellationSignal) -> Result<Vec<Row>> {
        let mut rows = Vec::new();
        loop {
            signal.throw_if_canceled()?;
            match self.step()? {
                StepResult::Row => rows.push(self.read_row()?),
                StepResult::Done => return Ok(rows),
            }
        }
    }

    /// Step once and extract an object, then reset.
    pub fn get_one_object<T: TableBinding>(&mut self) -> Result<Option<T>> {
        self.get_one_row()?.map(|row| T::extract(&row)).transpose()
    }

    /// Step to completion extracting every row as an object.
    pub fn get_all_objects<T: TableBinding>(&mut self) -> Result<Vec<T>> {
        let mut objects = Vec::new();
        while self.step()? == StepResult::Row {
            let row = self.read_row()?;
            objects.push(T::extract(&row)?);
        }
        Ok(objects)
    }

    /// Does the compiled statement leave the database unchanged?
    pub fn is_read_only(&self) -> bool {
        if self.stmt.is_null() {
            return !self.kind.is_write();
        }
        // SAFETY: stmt is valid
        unsafe { ffi::sqlite3_stmt_readonly(self.stmt) != 0 }
    }

    /// Rows changed by the most recent statement on this connection.
    pub fn changes(&self) -> i64 {
        // SAFETY: db is valid while the Arc is held
        unsafe { ffi::sqlite3_changes64(self.conn.db) }
    }

    /// Rowid of the most recent insert on this connection.
    pub fn last_insert_rowid(&self) -> i64 {
        // SAFETY: db is valid while the Arc is held
        unsafe { ffi::sqlite3_last_insert_rowid(self.conn.db) }
    }
}

impl Drop for PreparedStatement {
    fn drop(&mut self) {
        self.release_native();
    }
}

#[cfg(test)]
mod tests {
    use crate::SqliteConnection;
    use super::*;
    use wcdb_core::params;

    fn conn() -> SqliteConnection {
        let conn = SqliteConnection::open_memory().unwrap();
        conn.execute_raw("CREATE TABLE t (a INTEGER, b TEXT)").unwrap();
        conn.execute_raw("INSERT INTO t VALUES (1, 'x'), (2, 'y'), (3, 'z')")
            .unwrap();
        conn
    }

    #[test]
    fn test_step_roundtrip() {
        let conn = conn();
        let mut stmt = conn.prepare("SELECT a, b FROM t ORDER BY a").unwrap();
        assert_eq!(stmt.state(), StatementState::Prepared);
        for expected in 1..=3 {
            assert_eq!(stmt.step().unwrap(), StepResult::Row);
            assert_eq!(stmt.get_i64(0).unwrap(), expected);
        }
        assert_eq!(stmt.step().unwrap(), StepResult::Done);
        assert!(stmt.is_done());

        stmt.finalize();
        assert_eq!(
            stmt.step().unwrap_err().contract_kind(),
            Some(ContractKind::UseAfterFinalize)
        );
        assert_eq!(
            stmt.bind_i64(1, 1).unwrap_err().contract_kind(),
            Some(ContractKind::UseAfterFinalize)
        );
        stmt.finalize();
        assert!(stmt.finalize_checked().is_err());
    }

    #[test]
    fn test_compile_error_leaves_unprepared() {
        let conn = conn();
        let mut stmt = conn.new_statement();
        let err = stmt.prepare("SELEC nonsense").unwrap_err();
        assert!(matches!(err, Error::Compile(_)));
        assert_eq!(stmt.state(), StatementState::Unprepared);
        assert!(!stmt.is_prepared());
        assert_eq!(
            stmt.step().unwrap_err().contract_kind(),
            Some(ContractKind::NotPrepared)
        );
    }

    #[test]
    fn test_bind_out_of_range() {
        let conn = conn();
        let mut stmt = conn.prepare("SELECT * FROM t WHERE a = ?1").unwrap();
        let err = stmt.bind_i64(1, 2).unwrap_err();
        match err {
            Error::Bind(e) => assert_eq!(e.code, ffi::SQLITE_RANGE),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_extract_before_step_is_contract_violation() {
        let conn = conn();
        let mut stmt = conn.prepare("SELECT a FROM t").unwrap();
        assert_eq!(
            stmt.get_value(0).unwrap_err().contract_kind(),
            Some(ContractKind::NoRow)
        );
        stmt.step().unwrap();
        assert_eq!(
            stmt.get_value(5).unwrap_err().contract_kind(),
            Some(ContractKind::ColumnOutOfRange)
        );
    }

    #[test]
    fn test_reset_reuses_compilation() {
        let conn = conn();
        let mut stmt = conn.prepare("INSERT INTO t VALUES (?1, ?2)").unwrap();
        let before = conn.native_prepare_count();
        for i in 10..13 {
            stmt.bind_row(params![i, format!("r{i}")]).unwrap();
            assert_eq!(stmt.step().unwrap(), StepResult::Done);
            stmt.reset().unwrap();
        }
        assert_eq!(conn.native_prepare_count(), before);
        let mut count = conn.prepare("SELECT count(*) FROM t").unwrap();
        assert_eq!(count.get_one_column().unwrap(), vec![Value::Integer(6)]);
    }

    #[test]
    fn test_auto_finalize_on_step_error() {
        let conn = SqliteConnection::open_memory().unwrap();
        conn.execute_raw("CREATE TABLE u (a INTEGER UNIQUE)").unwrap();
        conn.execute_raw("INSERT INTO u VALUES (1)").unwrap();
        let mut stmt = conn.prepare("INSERT INTO u VALUES (1)").unwrap();
        stmt.set_auto_finalize(true);
        let err = stmt.step().unwrap_err();
        match &err {
            Error::Step(e) => assert_eq!(e.code, 19),
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(stmt.state(), StatementState::Finalized);
        assert!(!stmt.is_prepared());
    }

    #[test]
    fn test_value_roundtrip_all_tags() {
        let conn = SqliteConnection::open_memory().unwrap();
        conn.execute_raw("CREATE TABLE v (x)").unwrap();
        let values = [
            Value::Null,
            Value::Integer(-1),
            Value::Float(3.14),
            Value::Text("a'b".into()),
            Value::Blob(vec![0x00, 0xFF]),
        ];
        for value in &values {
            conn.execute_raw("DELETE FROM v").unwrap();
            let mut insert = conn.prepare("INSERT INTO v VALUES (?1)").unwrap();
            insert.bind_value(value, 1).unwrap();
            insert.step().unwrap();
            let mut select = conn.prepare("SELECT x FROM v").unwrap();
            assert_eq!(select.step().unwrap(), StepResult::Row);
            assert_eq!(&select.get_value(0).unwrap(), value);
            assert_eq!(select.column_type(0).unwrap(), value.column_type());
        }
    }

    #[test]
    fn test_narrowing_getters_wrap() {
        let conn = SqliteConnection::open_memory().unwrap();
        let mut stmt = conn.prepare("SELECT 4294967297, 3.99").unwrap();
        stmt.step().unwrap();
        assert_eq!(stmt.get_i32(0).unwrap(), 1);
        assert_eq!(stmt.get_i64(1).unwrap(), 3);
        assert_eq!(stmt.get_text(1).unwrap(), "3.99");
    }

    #[test]
    fn test_column_names_cached() {
        let conn = conn();
        let mut stmt = conn.prepare("SELECT a AS first, b FROM t").unwrap();
        let names = stmt.column_names();
        assert_eq!(names.names(), &["first".to_string(), "b".to_string()]);
        assert!(Arc::ptr_eq(&names, &stmt.column_names()));
        stmt.prepare("SELECT b FROM t").unwrap();
        assert_eq!(stmt.column_name(0).as_deref(), Some("b"));
    }

    #[test]
    fn test_get_one_row_and_multi_rows() {
        let conn = conn();
        let mut stmt = conn.prepare("SELECT a, b FROM t ORDER BY a").unwrap();
        let row = stmt.get_one_row().unwrap().unwrap();
        assert_eq!(row.get_named::<String>("b").unwrap(), "x");
        assert_eq!(stmt.state(), StatementState::Prepared);
        let rows = stmt.get_multi_rows().unwrap();
        assert_eq!(rows.len(), 3);
        assert!(stmt.is_done());
    }

    #[test]
    fn test_cancellable_rows() {
        let conn = conn();
        let signal = CancellationSignal::new();
        let mut stmt = conn.prepare("SELECT a FROM t").unwrap();
        assert_eq!(stmt.get_multi_rows_cancellable(&signal).unwrap().len(), 3);
        stmt.reset().unwrap();
        signal.cancel();
        assert!(matches!(
            stmt.get_multi_rows_cancellable(&signal),
            Err(Error::Cancelled)
        ));
    }

    #[test]
    fn test_trailing_statement_is_rejected() {
        let conn = conn();
        let err = conn.prepare("SELECT 1; DROP TABLE t").err().unwrap();
        assert!(matches!(err, Error::Compile(_)));
        assert_eq!(err.sql(), Some("SELECT 1; DROP TABLE t"));
        assert_eq!(conn.live_statement_count(), 0);
        assert!(conn.table_exists("t").unwrap());

        let mut stmt = conn.prepare("SELECT count(*) FROM t; -- trailing note").unwrap();
        assert_eq!(stmt.get_one_column().unwrap().len(), 1);
    }

    #[test]
    fn test_read_only_and_parameter_lookup() {
        let conn = conn();
        let select = conn.prepare("SELECT * FROM t WHERE a = :a").unwrap();
        assert!(select.is_read_only());
        assert_eq!(select.bind_parameter_index(":a"), Some(1));
        assert_eq!(select.bind_parameter_index(":nope"), None);
        let insert = conn.prepare("INSERT INTO t VALUES (1, 'q')").unwrap();
        assert!(!insert.is_read_only());
        assert_eq!(insert.kind(), StatementKind::Update);
    }

    #[test]
    fn test_prepare_replaces_previous_compilation() {
        let conn = conn();
        let mut stmt = conn.new_statement();
        let prepared = conn.native_prepare_count();
        let finalized = conn.native_finalize_count();
        let live = conn.live_statement_count();
        stmt.prepare("SELECT 1").unwrap();
        stmt.prepare("SELECT 2").unwrap();
        assert_eq!(conn.live_statement_count(), live + 1);
        stmt.finalize();
        assert_eq!(conn.native_prepare_count(), prepared + 2);
        assert_eq!(conn.native_finalize_count(), finalized + 2);
        assert_eq!(conn.live_statement_count(), live);
    }

    #[test]
    fn test_connection_reset_invalidates_row() {
        let conn = conn();
        let mut stmt = conn.prepare("SELECT a FROM t").unwrap();
        stmt.step().unwrap();
        conn.reset_all_statements();
        assert_eq!(
            stmt.get_value(0).unwrap_err().contract_kind(),
            Some(ContractKind::NoRow)
        );
    }
}
