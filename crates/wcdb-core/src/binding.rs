//! Object <-> row mapping.

use crate::error::Result;
use crate::identifiers::quote_ident;
use crate::row::Row;
use crate::value::Value;

/// Maps a Rust type to the columns of a table.
///
/// Implemented by hand for each persisted type:
///
/// ```
/// use wcdb_core::{Result, Row, TableBinding, Value};
///
/// struct Message {
///     id: i64,
///     content: String,
/// }
///
/// impl TableBinding for Message {
///     fn columns() -> &'static [&'static str] {
///         &["id", "content"]
///     }
///
///     fn values(&self) -> Vec<Value> {
///         vec![Value::from(self.id), Value::from(self.content.as_str())]
///     }
///
///     fn extract(row: &Row) -> Result<Self> {
///         Ok(Self {
///             id: row.get_as(0)?,
///             content: row.get_as(1)?,
///         })
///     }
/// }
/// ```
pub trait TableBinding: Sized {
    /// Column names, in the order `values` returns them.
    fn columns() -> &'static [&'static str];

    /// Field values in `columns()` order.
    fn values(&self) -> Vec<Value>;

    /// Build an object from a row whose columns follow `columns()` order.
    fn extract(row: &Row) -> Result<Self>;

    /// Column definitions used by `create_table_sql`.
    ///
    /// Defaults to the bare column names (no declared type).
    fn column_definitions() -> Vec<String> {
        Self::columns().iter().map(|c| quote_ident(c)).collect()
    }

    /// The integer primary key column filled in by the engine on insert.
    fn auto_increment_column() -> Option<&'static str> {
        None
    }

    /// Should this object's primary key be assigned by the engine?
    fn is_auto_increment(&self) -> bool {
        false
    }

    /// Receive the rowid assigned to an auto-increment insert.
    fn set_last_inserted_row_id(&mut self, _row_id: i64) {}

    /// Value of one field by column name.
    fn field_value(&self, column: &str) -> Option<Value> {
        let index = Self::columns().iter().position(|c| *c == column)?;
        self.values().into_iter().nth(index)
    }

    /// Values for a subset of columns, in the order given.
    fn values_for(&self, columns: &[&str]) -> Vec<Value> {
        let all = self.values();
        columns
            .iter()
            .map(|name| {
                Self::columns()
                    .iter()
                    .position(|c| c == name)
                    .and_then(|i| all.get(i).cloned())
                    .unwrap_or(Value::Null)
            })
            .collect()
    }

    /// `CREATE TABLE IF NOT EXISTS` for this binding.
    fn create_table_sql(table: &str) -> String {
        format!(
            "CREATE TABLE IF NOT EXISTS {}({})",
            quote_ident(table),
            Self::column_definitions().join(", ")
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, PartialEq)]
    struct Pair {
        id: i64,
        name: String,
    }

    impl TableBinding for Pair {
        fn columns() -> &'static [&'static str] {
            &["id", "name"]
        }

        fn values(&self) -> Vec<Value> {
            vec![Value::from(self.id), Value::from(self.name.clone())]
        }

        fn extract(row: &Row) -> Result<Self> {
            Ok(Self {
                id: row.get_as(0)?,
                name: row.get_as(1)?,
            })
        }

        fn column_definitions() -> Vec<String> {
            vec!["\"id\" INTEGER PRIMARY KEY".into(), "\"name\" TEXT".into()]
        }
    }

    #[test]
    fn test_field_lookup() {
        let p = Pair {
            id: 7,
            name: "x".into(),
        };
        assert_eq!(p.field_value("name"), Some(Value::Text("x".into())));
        assert_eq!(p.field_value("nope"), None);
        assert_eq!(
            p.values_for(&["name", "id"]),
            vec![Value::Text("x".into()), Value::Integer(7)]
        );
    }

    #[test]
    fn test_extract_roundtrip() {
        let row = Row::from(vec![Value::Integer(1), Value::Text("a".into())]);
        let p = Pair::extract(&row).unwrap();
        assert_eq!(
            p,
            Pair {
                id: 1,
                name: "a".into()
            }
        );
    }

    #[test]
    fn test_create_table_sql() {
        assert_eq!(
            Pair::create_table_sql("pairs"),
            "CREATE TABLE IF NOT EXISTS \"pairs\"(\"id\" INTEGER PRIMARY KEY, \"name\" TEXT)"
        );
    }
}
