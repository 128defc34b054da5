//! Row and object operations shared by `Handle`, `Database` and `Table`.
//!
//! Every operation obtains a handle through `operation_handle`. An object
//! that auto-invalidates (a database) hands out a fresh handle that is
//! invalidated when the operation ends, on every exit path; a handle lends
//! itself.
//!
//! A transaction begun at database level outlives the call that began it:
//! its handle stays bound to the calling thread, and the thread's later
//! database-level operations run on it until commit or rollback.

use crate::database::Database;
use crate::handle::{Handle, PausableOutcome};
use std::ops::{Deref, DerefMut};
use wcdb_core::{
    ConflictAction, ContractKind, Error, QueryOptions, Result, Row, Statement, StatementDelete,
    StatementInsert, StatementUpdate, TableBinding, Value,
};
use wcdb_sqlite::PreparedStatement;

/// A handle lent to one operation.
pub enum HandleGuard<'a> {
    Borrowed(&'a mut Handle),
    /// Invalidated when the guard drops, or bound to the thread while a
    /// transaction is open on it
    Owned(Handle),
}

impl Deref for HandleGuard<'_> {
    type Target = Handle;

    fn deref(&self) -> &Handle {
        match self {
            HandleGuard::Borrowed(handle) => handle,
            HandleGuard::Owned(handle) => handle,
        }
    }
}

impl DerefMut for HandleGuard<'_> {
    fn deref_mut(&mut self) -> &mut Handle {
        match self {
            HandleGuard::Borrowed(handle) => handle,
            HandleGuard::Owned(handle) => handle,
        }
    }
}

impl Drop for HandleGuard<'_> {
    fn drop(&mut self) {
        let HandleGuard::Owned(handle) = self else {
            return;
        };
        if handle.is_in_transaction() && !handle.is_invalidated() {
            let database = handle.database().clone();
            let detached = Handle::new(database.clone(), handle.write_hint());
            database.bind_thread_handle(std::mem::replace(handle, detached));
        } else {
            handle.invalidate();
        }
    }
}

/// Bind `leading` from index 1, then the parameters of `options`' condition.
fn bind_with_options(stmt: &mut PreparedStatement, leading: &[Value], options: &QueryOptions) -> Result<()> {
    stmt.bind_row(leading)?;
    for (i, value) in options.params.iter().enumerate() {
        stmt.bind_value(value, leading.len() + i + 1)?;
    }
    Ok(())
}

fn insert_rows_into(
    handle: &mut Handle,
    rows: &[Vec<Value>],
    columns: &[&str],
    table: &str,
    conflict: ConflictAction,
) -> Result<()> {
    let statement = StatementInsert::new(table)
        .columns(columns.iter().copied())
        .conflict(conflict);
    let insert = |h: &mut Handle| -> Result<bool> {
        h.with_main_statement(&statement, &[], |stmt| {
            for row in rows {
                stmt.reset()?;
                stmt.bind_row(row)?;
                stmt.step()?;
            }
            Ok(true)
        })
    };
    if rows.len() > 1 {
        handle.run_transaction(insert)?;
    } else {
        insert(handle)?;
    }
    Ok(())
}

fn insert_objects_into<T: TableBinding>(
    handle: &mut Handle,
    objects: &mut [T],
    table: &str,
    conflict: ConflictAction,
) -> Result<()> {
    let columns = T::columns();
    let statement = StatementInsert::new(table)
        .columns(columns.iter().copied())
        .conflict(conflict);
    let auto_index = T::auto_increment_column().and_then(|c| columns.iter().position(|name| *name == c));
    let many = objects.len() > 1;
    let mut insert = |h: &mut Handle| -> Result<bool> {
        h.with_main_statement(&statement, &[], |stmt| {
            for object in objects.iter_mut() {
                stmt.reset()?;
                let mut values = object.values();
                let auto = object.is_auto_increment();
                if auto {
                    if let Some(value) = auto_index.and_then(|i| values.get_mut(i)) {
                        *value = Value::Null;
                    }
                }
                stmt.bind_row(&values)?;
                stmt.step()?;
                if auto {
                    object.set_last_inserted_row_id(stmt.last_insert_rowid());
                }
            }
            Ok(true)
        })
    };
    if many {
        handle.run_transaction(insert)?;
    } else {
        insert(handle)?;
    }
    Ok(())
}

/// Statement, row and transaction operations.
pub trait HandleOperation {
    /// The database operations run against.
    fn operation_database(&self) -> &Database;

    /// Is the handle from `operation_handle` invalidated after each operation?
    fn auto_invalidate_handle(&self) -> bool;

    /// The handle this object lends to its operations, if it has one.
    fn own_handle(&mut self) -> Option<&mut Handle> {
        None
    }

    /// The handle an operation runs on: a handle from the database when
    /// `auto_invalidate_handle`, otherwise `own_handle`.
    fn operation_handle(&mut self, write_hint: bool) -> Result<HandleGuard<'_>> {
        if self.auto_invalidate_handle() {
            return Ok(HandleGuard::Owned(self.operation_database().thread_handle(write_hint)));
        }
        match self.own_handle() {
            Some(handle) => Ok(HandleGuard::Borrowed(handle)),
            None => Err(Error::contract(
                ContractKind::UseAfterInvalidate,
                "no handle to run the operation on",
            )),
        }
    }

    fn execute<S: Statement + ?Sized>(&mut self, statement: &S) -> Result<()> {
        let mut handle = self.operation_handle(statement.kind().is_write())?;
        handle.execute(statement)
    }

    fn execute_with<S: Statement + ?Sized>(&mut self, statement: &S, params: &[Value]) -> Result<()> {
        let mut handle = self.operation_handle(statement.kind().is_write())?;
        handle.execute_with(statement, params)
    }

    // ==================== Insert ====================

    /// Insert rows of `columns` values; several rows go in one transaction.
    fn insert_rows(&mut self, rows: &[Vec<Value>], columns: &[&str], table: &str) -> Result<()> {
        let mut handle = self.operation_handle(true)?;
        insert_rows_into(&mut handle, rows, columns, table, ConflictAction::None)
    }

    fn insert_or_replace_rows(&mut self, rows: &[Vec<Value>], columns: &[&str], table: &str) -> Result<()> {
        let mut handle = self.operation_handle(true)?;
        insert_rows_into(&mut handle, rows, columns, table, ConflictAction::Replace)
    }

    fn insert_or_ignore_rows(&mut self, rows: &[Vec<Value>], columns: &[&str], table: &str) -> Result<()> {
        let mut handle = self.operation_handle(true)?;
        insert_rows_into(&mut handle, rows, columns, table, ConflictAction::Ignore)
    }

    fn insert_row(&mut self, row: Vec<Value>, columns: &[&str], table: &str) -> Result<()> {
        self.insert_rows(&[row], columns, table)
    }

    // ==================== Update / Delete ====================

    /// Set `columns` to `row` on the rows matching `options`; returns the
    /// number of rows changed.
    fn update_row(&mut self, row: &[Value], columns: &[&str], table: &str, options: &QueryOptions) -> Result<i64> {
        let statement = StatementUpdate::new(table)
            .set(columns.iter().copied())
            .options(options.clone());
        let mut handle = self.operation_handle(true)?;
        handle.with_main_statement(&statement, &[], |stmt| {
            bind_with_options(stmt, row, options)?;
            stmt.step()?;
            Ok(stmt.changes())
        })
    }

    fn update_value(&mut self, value: Value, column: &str, table: &str, options: &QueryOptions) -> Result<i64> {
        self.update_row(&[value], &[column], table, options)
    }

    /// Delete the rows matching `options`; returns the number deleted.
    fn delete_values(&mut self, table: &str, options: &QueryOptions) -> Result<i64> {
        let statement = StatementDelete::new(table).options(options.clone());
        let mut handle = self.operation_handle(true)?;
        handle.with_main_statement(&statement, &[], |stmt| {
            bind_with_options(stmt, &[], options)?;
            stmt.step()?;
            Ok(stmt.changes())
        })
    }

    // ==================== Select ====================

    /// First column of the first matching row.
    fn get_value(&mut self, column: &str, table: &str, options: &QueryOptions) -> Result<Option<Value>> {
        Ok(self
            .get_one_row(&[column], table, options)?
            .and_then(|row| row.into_values().into_iter().next()))
    }

    fn get_one_column(&mut self, column: &str, table: &str, options: &QueryOptions) -> Result<Vec<Value>> {
        let mut handle = self.operation_handle(false)?;
        let statement = handle.select_from(&[column], table, options)?;
        handle.with_main_statement(&statement, &options.params, PreparedStatement::get_one_column)
    }

    fn get_one_row(&mut self, columns: &[&str], table: &str, options: &QueryOptions) -> Result<Option<Row>> {
        let options = options.clone().limit(1);
        let mut handle = self.operation_handle(false)?;
        let statement = handle.select_from(columns, table, &options)?;
        handle.with_main_statement(&statement, &options.params, PreparedStatement::get_one_row)
    }

    fn get_all_rows(&mut self, columns: &[&str], table: &str, options: &QueryOptions) -> Result<Vec<Row>> {
        let mut handle = self.operation_handle(false)?;
        let statement = handle.select_from(columns, table, options)?;
        handle.with_main_statement(&statement, &options.params, PreparedStatement::get_multi_rows)
    }

    fn get_value_from_statement<S: Statement + ?Sized>(&mut self, statement: &S, params: &[Value]) -> Result<Option<Value>> {
        Ok(self
            .get_one_row_from_statement(statement, params)?
            .and_then(|row| row.into_values().into_iter().next()))
    }

    fn get_one_row_from_statement<S: Statement + ?Sized>(&mut self, statement: &S, params: &[Value]) -> Result<Option<Row>> {
        let mut handle = self.operation_handle(statement.kind().is_write())?;
        handle.with_main_statement(statement, params, PreparedStatement::get_one_row)
    }

    fn get_one_column_from_statement<S: Statement + ?Sized>(&mut self, statement: &S, params: &[Value]) -> Result<Vec<Value>> {
        let mut handle = self.operation_handle(statement.kind().is_write())?;
        handle.with_main_statement(statement, params, PreparedStatement::get_one_column)
    }

    fn get_all_rows_from_statement<S: Statement + ?Sized>(&mut self, statement: &S, params: &[Value]) -> Result<Vec<Row>> {
        let mut handle = self.operation_handle(statement.kind().is_write())?;
        handle.with_main_statement(statement, params, PreparedStatement::get_multi_rows)
    }

    // ==================== Transactions ====================

    fn begin_transaction(&mut self) -> Result<()> {
        self.operation_handle(true)?.begin_transaction()
    }

    fn commit_transaction(&mut self) -> Result<()> {
        self.operation_handle(true)?.commit_transaction()
    }

    fn rollback_transaction(&mut self) -> Result<()> {
        self.operation_handle(true)?.rollback_transaction();
        Ok(())
    }

    fn begin_nested_transaction(&mut self) -> Result<()> {
        self.operation_handle(true)?.begin_nested_transaction()
    }

    fn commit_nested_transaction(&mut self) -> Result<()> {
        self.operation_handle(true)?.commit_nested_transaction()
    }

    fn rollback_nested_transaction(&mut self) -> Result<()> {
        self.operation_handle(true)?.rollback_nested_transaction()
    }

    fn run_transaction<F>(&mut self, body: F) -> Result<bool>
    where
        F: FnOnce(&mut Handle) -> Result<bool>,
    {
        self.operation_handle(true)?.run_transaction(body)
    }

    fn run_nested_transaction<F>(&mut self, body: F) -> Result<bool>
    where
        F: FnOnce(&mut Handle) -> Result<bool>,
    {
        self.operation_handle(true)?.run_nested_transaction(body)
    }

    fn run_pausable_transaction<F>(&mut self, body: F) -> Result<()>
    where
        F: FnMut(&mut Handle, bool) -> Result<PausableOutcome>,
    {
        self.operation_handle(true)?.run_pausable_transaction(body)
    }
}

/// Object operations over types implementing `TableBinding`.
pub trait HandleOrmOperation: HandleOperation {
    /// `CREATE TABLE IF NOT EXISTS` from the binding's column definitions.
    fn create_table<T: TableBinding>(&mut self, table: &str) -> Result<()> {
        self.execute(&T::create_table_sql(table))
    }

    /// Insert objects; several objects go in one transaction.
    ///
    /// Objects that report `is_auto_increment` get their key from the
    /// engine and receive it through `set_last_inserted_row_id`.
    fn insert_objects<T: TableBinding>(&mut self, objects: &mut [T], table: &str) -> Result<()> {
        let mut handle = self.operation_handle(true)?;
        insert_objects_into(&mut handle, objects, table, ConflictAction::None)
    }

    fn insert_or_replace_objects<T: TableBinding>(&mut self, objects: &mut [T], table: &str) -> Result<()> {
        let mut handle = self.operation_handle(true)?;
        insert_objects_into(&mut handle, objects, table, ConflictAction::Replace)
    }

    fn insert_or_ignore_objects<T: TableBinding>(&mut self, objects: &mut [T], table: &str) -> Result<()> {
        let mut handle = self.operation_handle(true)?;
        insert_objects_into(&mut handle, objects, table, ConflictAction::Ignore)
    }

    /// Write `fields` of `object` to the rows matching `options`.
    fn update_object<T: TableBinding>(&mut self, object: &T, fields: &[&str], table: &str, options: &QueryOptions) -> Result<i64> {
        let values = object.values_for(fields);
        self.update_row(&values, fields, table, options)
    }

    fn delete_objects(&mut self, table: &str, options: &QueryOptions) -> Result<i64> {
        self.delete_values(table, options)
    }

    fn get_first_object<T: TableBinding>(&mut self, table: &str, options: &QueryOptions) -> Result<Option<T>> {
        let options = options.clone().limit(1);
        let mut handle = self.operation_handle(false)?;
        let statement = handle.select_from(T::columns(), table, &options)?;
        handle.with_main_statement(&statement, &options.params, PreparedStatement::get_one_object::<T>)
    }

    fn get_all_objects<T: TableBinding>(&mut self, table: &str, options: &QueryOptions) -> Result<Vec<T>> {
        let mut handle = self.operation_handle(false)?;
        let statement = handle.select_from(T::columns(), table, options)?;
        handle.with_main_statement(&statement, &options.params, PreparedStatement::get_all_objects::<T>)
    }
}

impl HandleOperation for Handle {
    fn operation_database(&self) -> &Database {
        self.database()
    }

    fn auto_invalidate_handle(&self) -> bool {
        false
    }

    fn own_handle(&mut self) -> Option<&mut Handle> {
        Some(self)
    }
}

impl HandleOrmOperation for Handle {}

impl HandleOperation for Database {
    fn operation_database(&self) -> &Database {
        self
    }

    fn auto_invalidate_handle(&self) -> bool {
        true
    }
}

impl HandleOrmOperation for Database {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rows_roundtrip_through_database() {
        let mut db = Database::in_memory();
        db.execute("CREATE TABLE t (a INTEGER, b TEXT)").unwrap();
        db.insert_rows(
            &[
                vec![Value::from(1), Value::from("x")],
                vec![Value::from(2), Value::from("y")],
                vec![Value::from(3), Value::from("z")],
            ],
            &["a", "b"],
            "t",
        )
        .unwrap();

        let options = QueryOptions::new().condition_with("a >= ?", vec![Value::from(2)]).order_by("a");
        let rows = db.get_all_rows(&["a", "b"], "t", &options).unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].get_by_name("b"), Some(&Value::Text("y".into())));

        let changed = db
            .update_value(Value::from("w"), "b", "t", &QueryOptions::new().condition_with("a = ?", vec![Value::from(3)]))
            .unwrap();
        assert_eq!(changed, 1);
        assert_eq!(
            db.get_value("b", "t", &QueryOptions::new().order_by("a DESC")).unwrap(),
            Some(Value::Text("w".into()))
        );

        let deleted = db.delete_values("t", &QueryOptions::new().condition("a < 3")).unwrap();
        assert_eq!(deleted, 2);
        assert_eq!(db.get_one_column("a", "t", &QueryOptions::new()).unwrap(), vec![Value::Integer(3)]);
        assert_eq!(db.number_of_alive_handles(), db.inner.pool.stats().idle_connections);
    }

    #[test]
    fn test_failed_multi_row_insert_is_atomic() {
        let mut db = Database::in_memory();
        db.execute("CREATE TABLE t (a INTEGER PRIMARY KEY)").unwrap();
        let err = db
            .insert_rows(&[vec![Value::from(1)], vec![Value::from(1)]], &["a"], "t")
            .unwrap_err();
        assert_eq!(err.code(), Some(19));
        assert_eq!(err.extended_code(), Some(1555));
        assert!(db.get_one_column("a", "t", &QueryOptions::new()).unwrap().is_empty());

        db.insert_or_ignore_rows(&[vec![Value::from(1)], vec![Value::from(1)]], &["a"], "t")
            .unwrap();
        assert_eq!(db.get_one_column("a", "t", &QueryOptions::new()).unwrap().len(), 1);
    }

    #[test]
    fn test_guard_invalidates_owned_handle_on_error() {
        let mut db = Database::in_memory();
        assert!(db.auto_invalidate_handle());
        assert!(db.execute("NOT SQL").is_err());
        assert_eq!(db.inner.pool.stats().active_connections, 0);
    }

    fn count(db: &mut Database) -> Option<Value> {
        db.get_value("count(*)", "t", &QueryOptions::new()).unwrap()
    }

    #[test]
    fn test_database_transaction_spans_calls() {
        let mut db = Database::in_memory();
        db.execute("CREATE TABLE t (a INTEGER)").unwrap();

        db.begin_transaction().unwrap();
        assert!(db.is_in_thread_transaction());
        db.insert_row(vec![Value::from(1)], &["a"], "t").unwrap();
        assert_eq!(count(&mut db), Some(Value::Integer(1)));
        db.rollback_transaction().unwrap();
        assert!(!db.is_in_thread_transaction());
        assert_eq!(count(&mut db), Some(Value::Integer(0)));
        assert_eq!(db.inner.pool.stats().active_connections, 0);

        db.begin_transaction().unwrap();
        db.insert_row(vec![Value::from(2)], &["a"], "t").unwrap();
        db.commit_transaction().unwrap();
        assert!(!db.is_in_thread_transaction());
        assert_eq!(count(&mut db), Some(Value::Integer(1)));

        let err = db.commit_transaction().unwrap_err();
        assert_eq!(err.contract_kind(), Some(ContractKind::NoTransaction));
    }

    #[test]
    fn test_database_transaction_is_bound_to_its_thread() {
        let dir = tempfile::tempdir().unwrap();
        let mut db = Database::new(dir.path().join("bound.db"));
        db.execute("CREATE TABLE t (a INTEGER)").unwrap();

        db.begin_transaction().unwrap();
        db.insert_row(vec![Value::from(1)], &["a"], "t").unwrap();
        let other = db.clone();
        let seen = std::thread::spawn(move || {
            let mut other = other;
            assert!(!other.is_in_thread_transaction());
            count(&mut other)
        })
        .join()
        .unwrap();
        assert_eq!(seen, Some(Value::Integer(0)));

        db.run_nested_transaction(|h| {
            h.execute("INSERT INTO t VALUES (2)")?;
            Ok(false)
        })
        .unwrap();
        assert!(db.is_in_thread_transaction());
        db.commit_transaction().unwrap();
        assert_eq!(count(&mut db), Some(Value::Integer(1)));
    }

    #[test]
    fn test_close_rolls_back_thread_transaction() {
        let mut db = Database::in_memory();
        db.execute("CREATE TABLE t (a INTEGER)").unwrap();
        db.begin_transaction().unwrap();
        db.insert_row(vec![Value::from(1)], &["a"], "t").unwrap();
        db.close();
        assert!(!db.is_in_thread_transaction());
        assert_eq!(count(&mut db), Some(Value::Integer(0)));
    }
}
