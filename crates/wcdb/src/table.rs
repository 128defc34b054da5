//! A table-bound view of the ORM operations.

use crate::database::Database;
use crate::handle::Handle;
use crate::operation::{HandleOperation, HandleOrmOperation};
use std::marker::PhantomData;
use wcdb_core::{QueryOptions, Result, TableBinding, Value};

enum Target<'a> {
    Database(&'a Database),
    Handle(&'a mut Handle),
}

/// Operations on one table of objects of type `T`.
///
/// Bound to a database, every operation uses its own handle; bound to a
/// handle, operations run on that handle (and inside its transaction).
pub struct Table<'a, T> {
    name: String,
    target: Target<'a>,
    _binding: PhantomData<fn() -> T>,
}

impl<T> std::fmt::Debug for Table<'_, T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Table")
            .field("name", &self.name)
            .field("bound_to_handle", &matches!(self.target, Target::Handle(_)))
            .finish()
    }
}

impl Database {
    /// A view of table `name` holding objects of type `T`.
    pub fn get_table<T: TableBinding>(&self, name: impl Into<String>) -> Table<'_, T> {
        Table {
            name: name.into(),
            target: Target::Database(self),
            _binding: PhantomData,
        }
    }
}

impl<'a, T: TableBinding> Table<'a, T> {
    /// A view of table `name` that runs on `handle`.
    pub fn with_handle(handle: &'a mut Handle, name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            target: Target::Handle(handle),
            _binding: PhantomData,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Create the table from `T`'s column definitions if it is missing.
    pub fn create(&mut self) -> Result<()> {
        let name = self.name.clone();
        HandleOrmOperation::create_table::<T>(self, &name)
    }

    pub fn insert_objects(&mut self, objects: &mut [T]) -> Result<()> {
        let name = self.name.clone();
        HandleOrmOperation::insert_objects(self, objects, &name)
    }

    pub fn insert_or_replace_objects(&mut self, objects: &mut [T]) -> Result<()> {
        let name = self.name.clone();
        HandleOrmOperation::insert_or_replace_objects(self, objects, &name)
    }

    pub fn insert_or_ignore_objects(&mut self, objects: &mut [T]) -> Result<()> {
        let name = self.name.clone();
        HandleOrmOperation::insert_or_ignore_objects(self, objects, &name)
    }

    pub fn update_object(&mut self, object: &T, fields: &[&str], options: &QueryOptions) -> Result<i64> {
        let name = self.name.clone();
        HandleOrmOperation::update_object(self, object, fields, &name, options)
    }

    pub fn delete_objects(&mut self, options: &QueryOptions) -> Result<i64> {
        let name = self.name.clone();
        HandleOrmOperation::delete_objects(self, &name, options)
    }

    pub fn get_first_object(&mut self, options: &QueryOptions) -> Result<Option<T>> {
        let name = self.name.clone();
        HandleOrmOperation::get_first_object::<T>(self, &name, options)
    }

    pub fn get_all_objects(&mut self, options: &QueryOptions) -> Result<Vec<T>> {
        let name = self.name.clone();
        HandleOrmOperation::get_all_objects::<T>(self, &name, options)
    }

    /// First value of `column` among the matching rows.
    pub fn get_value(&mut self, column: &str, options: &QueryOptions) -> Result<Option<Value>> {
        let name = self.name.clone();
        HandleOperation::get_value(self, column, &name, options)
    }

    pub fn update_value(&mut self, value: Value, column: &str, options: &QueryOptions) -> Result<i64> {
        let name = self.name.clone();
        HandleOperation::update_value(self, value, column, &name, options)
    }
}

impl<T> HandleOperation for Table<'_, T> {
    fn operation_database(&self) -> &Database {
        match &self.target {
            Target::Database(database) => database,
            Target::Handle(handle) => handle.database(),
        }
    }

    fn auto_invalidate_handle(&self) -> bool {
        matches!(self.target, Target::Database(_))
    }

    fn own_handle(&mut self) -> Option<&mut Handle> {
        match &mut self.target {
            Target::Database(_) => None,
            Target::Handle(handle) => Some(&mut **handle),
        }
    }
}

impl<T> HandleOrmOperation for Table<'_, T> {}

#[cfg(test)]
mod tests {
    use super::*;
    use wcdb_core::Row;

    #[derive(Debug, Clone, PartialEq)]
    struct Note {
        id: i64,
        body: String,
    }

    impl TableBinding for Note {
        fn columns() -> &'static [&'static str] {
            &["id", "body"]
        }

        fn values(&self) -> Vec<Value> {
            vec![Value::from(self.id), Value::from(self.body.as_str())]
        }

        fn extract(row: &Row) -> Result<Self> {
            Ok(Self {
                id: row.get_as(0)?,
                body: row.get_as(1)?,
            })
        }

        fn column_definitions() -> Vec<String> {
            vec!["id INTEGER PRIMARY KEY".into(), "body TEXT".into()]
        }

        fn auto_increment_column() -> Option<&'static str> {
            Some("id")
        }

        fn is_auto_increment(&self) -> bool {
            self.id == 0
        }

        fn set_last_inserted_row_id(&mut self, row_id: i64) {
            self.id = row_id;
        }
    }

    fn note(body: &str) -> Note {
        Note {
            id: 0,
            body: body.into(),
        }
    }

    #[test]
    fn test_table_on_database() {
        let db = Database::in_memory();
        let mut notes = db.get_table::<Note>("notes");
        notes.create().unwrap();
        let mut batch = vec![note("a"), note("b")];
        notes.insert_objects(&mut batch).unwrap();
        assert_eq!(batch[0].id, 1);
        assert_eq!(batch[1].id, 2);
        assert!(notes.auto_invalidate_handle());

        let first = notes
            .get_first_object(&QueryOptions::new().order_by("id DESC"))
            .unwrap();
        assert_eq!(first.map(|n| n.body), Some("b".to_string()));
        assert_eq!(db.inner.pool.stats().active_connections, 0);
    }

    #[test]
    fn test_table_on_handle_shares_transaction() {
        let db = Database::in_memory();
        db.get_table::<Note>("notes").create().unwrap();

        let mut handle = db.get_handle(true);
        handle
            .run_transaction(|h| {
                let mut notes = Table::<Note>::with_handle(h, "notes");
                assert!(!notes.auto_invalidate_handle());
                notes.insert_objects(&mut [note("kept?")])?;
                Ok(false)
            })
            .unwrap();
        let mut notes = Table::<Note>::with_handle(&mut handle, "notes");
        assert!(notes.get_all_objects(&QueryOptions::new()).unwrap().is_empty());
    }
}
