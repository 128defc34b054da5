//! Minimal statement builders used by the ORM facade.
//!
//! Builders render parameterized SQL. Their own parameters are numbered
//! `?1..?n` in column order; a condition supplied through `QueryOptions`
//! uses plain `?` placeholders, which the engine numbers after the highest
//! explicit index, so condition parameters bind after the row values.

use crate::identifiers::quote_ident;
use crate::statement::{Statement, StatementKind};
use crate::value::Value;
use std::borrow::Cow;

/// Conflict resolution for inserts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConflictAction {
    #[default]
    None,
    Replace,
    Ignore,
}

impl ConflictAction {
    const fn as_sql(self) -> &'static str {
        match self {
            ConflictAction::None => "INSERT",
            ConflictAction::Replace => "INSERT OR REPLACE",
            ConflictAction::Ignore => "INSERT OR IGNORE",
        }
    }
}

/// Filtering, ordering and paging applied to select, update and delete.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct QueryOptions {
    pub condition: Option<String>,
    /// Values for the `?` placeholders in `condition`
    pub params: Vec<Value>,
    /// Ordering terms, e.g. `"a DESC"`
    pub order_by: Vec<String>,
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}

impl QueryOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the WHERE expression.
    pub fn condition(mut self, condition: impl Into<String>) -> Self {
        self.condition = Some(condition.into());
        self
    }

    /// Set the WHERE expression together with its parameters.
    pub fn condition_with(mut self, condition: impl Into<String>, params: Vec<Value>) -> Self {
        self.condition = Some(condition.into());
        self.params = params;
        self
    }

    /// Append an ordering term.
    pub fn order_by(mut self, term: impl Into<String>) -> Self {
        self.order_by.push(term.into());
        self
    }

    pub fn limit(mut self, limit: i64) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn offset(mut self, offset: i64) -> Self {
        self.offset = Some(offset);
        self
    }

    fn has_order_or_paging(&self) -> bool {
        !self.order_by.is_empty() || self.limit.is_some() || self.offset.is_some()
    }

    fn push_where(&self, sql: &mut String) {
        if let Some(cond) = &self.condition {
            sql.push_str(" WHERE ");
            sql.push_str(cond);
        }
    }

    fn push_order_and_paging(&self, sql: &mut String) {
        if !self.order_by.is_empty() {
            sql.push_str(" ORDER BY ");
            sql.push_str(&self.order_by.join(", "));
        }
        match (self.limit, self.offset) {
            (Some(limit), Some(offset)) => {
                sql.push_str(&format!(" LIMIT {} OFFSET {}", limit, offset));
            }
            (Some(limit), None) => sql.push_str(&format!(" LIMIT {}", limit)),
            (None, Some(offset)) => sql.push_str(&format!(" LIMIT -1 OFFSET {}", offset)),
            (None, None) => {}
        }
    }

    /// Render the row filter for UPDATE/DELETE.
    ///
    /// Ordering and paging are not accepted by every build of the engine on
    /// UPDATE and DELETE, so they are pushed into a rowid subquery.
    fn push_row_filter(&self, table: &str, sql: &mut String) {
        if self.has_order_or_paging() {
            sql.push_str(" WHERE rowid IN (SELECT rowid FROM ");
            sql.push_str(&quote_ident(table));
            self.push_where(sql);
            self.push_order_and_paging(sql);
            sql.push(')');
        } else {
            self.push_where(sql);
        }
    }
}

fn column_list(columns: &[String]) -> String {
    columns
        .iter()
        .map(|c| quote_ident(c))
        .collect::<Vec<_>>()
        .join(", ")
}

/// `INSERT [OR REPLACE | OR IGNORE] INTO table(columns) VALUES(?1, ..)`
#[derive(Debug, Clone, PartialEq)]
pub struct StatementInsert {
    table: String,
    columns: Vec<String>,
    conflict: ConflictAction,
}

impl StatementInsert {
    pub fn new(table: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            columns: Vec::new(),
            conflict: ConflictAction::None,
        }
    }

    pub fn columns<I, S>(mut self, columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.columns = columns.into_iter().map(Into::into).collect();
        self
    }

    pub fn or_replace(mut self) -> Self {
        self.conflict = ConflictAction::Replace;
        self
    }

    pub fn or_ignore(mut self) -> Self {
        self.conflict = ConflictAction::Ignore;
        self
    }

    pub fn conflict(mut self, action: ConflictAction) -> Self {
        self.conflict = action;
        self
    }

    pub fn column_count(&self) -> usize {
        self.columns.len()
    }
}

impl Statement for StatementInsert {
    fn sql(&self) -> Cow<'_, str> {
        let placeholders = (1..=self.columns.len())
            .map(|i| format!("?{}", i))
            .collect::<Vec<_>>()
            .join(", ");
        let sql = if self.columns.is_empty() {
            format!(
                "{} INTO {} DEFAULT VALUES",
                self.conflict.as_sql(),
                quote_ident(&self.table)
            )
        } else {
            format!(
                "{} INTO {}({}) VALUES({})",
                self.conflict.as_sql(),
                quote_ident(&self.table),
                column_list(&self.columns),
                placeholders
            )
        };
        Cow::Owned(sql)
    }

    fn kind(&self) -> StatementKind {
        StatementKind::Update
    }
}

/// `UPDATE table SET column = ?1, .. [filter]`
#[derive(Debug, Clone, PartialEq)]
pub struct StatementUpdate {
    table: String,
    columns: Vec<String>,
    options: QueryOptions,
}

impl StatementUpdate {
    pub fn new(table: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            columns: Vec::new(),
            options: QueryOptions::default(),
        }
    }

    pub fn set<I, S>(mut self, columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.columns = columns.into_iter().map(Into::into).collect();
        self
    }

    pub fn options(mut self, options: QueryOptions) -> Self {
        self.options = options;
        self
    }
}

impl Statement for StatementUpdate {
    fn sql(&self) -> Cow<'_, str> {
        let assignments = self
            .columns
            .iter()
            .enumerate()
            .map(|(i, c)| format!("{} = ?{}", quote_ident(c), i + 1))
            .collect::<Vec<_>>()
            .join(", ");
        let mut sql = format!("UPDATE {} SET {}", quote_ident(&self.table), assignments);
        self.options.push_row_filter(&self.table, &mut sql);
        Cow::Owned(sql)
    }

    fn kind(&self) -> StatementKind {
        StatementKind::Update
    }
}

/// `DELETE FROM table [filter]`
#[derive(Debug, Clone, PartialEq)]
pub struct StatementDelete {
    table: String,
    options: QueryOptions,
}

impl StatementDelete {
    pub fn new(table: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            options: QueryOptions::default(),
        }
    }

    pub fn options(mut self, options: QueryOptions) -> Self {
        self.options = options;
        self
    }
}

impl Statement for StatementDelete {
    fn sql(&self) -> Cow<'_, str> {
        let mut sql = format!("DELETE FROM {}", quote_ident(&self.table));
        self.options.push_row_filter(&self.table, &mut sql);
        Cow::Owned(sql)
    }

    fn kind(&self) -> StatementKind {
        StatementKind::Update
    }
}

/// `SELECT columns FROM table [WHERE ..] [ORDER BY ..] [LIMIT .. OFFSET ..]`
///
/// Result columns that are plain identifiers are quoted; anything else
/// (`*`, aggregates, expressions) is emitted as written.
#[derive(Debug, Clone, PartialEq)]
pub struct StatementSelect {
    table: String,
    columns: Vec<String>,
    options: QueryOptions,
    /// Rows come from this query, aliased as `table`
    subquery: Option<String>,
}

impl StatementSelect {
    pub fn new(table: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            columns: Vec::new(),
            options: QueryOptions::default(),
            subquery: None,
        }
    }

    /// Read from `query` instead of the table, keeping the table's name as
    /// the alias.
    pub fn from_subquery(mut self, query: impl Into<String>) -> Self {
        self.subquery = Some(query.into());
        self
    }

    pub fn columns<I, S>(mut self, columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.columns = columns.into_iter().map(Into::into).collect();
        self
    }

    pub fn options(mut self, options: QueryOptions) -> Self {
        self.options = options;
        self
    }
}

fn is_plain_identifier(name: &str) -> bool {
    !name.is_empty()
        && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
        && !name.starts_with(|c: char| c.is_ascii_digit())
}

impl Statement for StatementSelect {
    fn sql(&self) -> Cow<'_, str> {
        let columns = if self.columns.is_empty() {
            "*".to_string()
        } else {
            self.columns
                .iter()
                .map(|c| {
                    if is_plain_identifier(c) {
                        quote_ident(c)
                    } else {
                        c.clone()
                    }
                })
                .collect::<Vec<_>>()
                .join(", ")
        };
        let mut sql = match &self.subquery {
            Some(query) => format!("SELECT {} FROM ({}) AS {}", columns, query, quote_ident(&self.table)),
            None => format!("SELECT {} FROM {}", columns, quote_ident(&self.table)),
        };
        self.options.push_where(&mut sql);
        self.options.push_order_and_paging(&mut sql);
        Cow::Owned(sql)
    }

    fn kind(&self) -> StatementKind {
        StatementKind::Select
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insert_sql() {
        let stmt = StatementInsert::new("t").columns(["a", "b"]);
        assert_eq!(stmt.sql(), "INSERT INTO \"t\"(\"a\", \"b\") VALUES(?1, ?2)");
        assert_eq!(
            stmt.clone().or_replace().sql(),
            "INSERT OR REPLACE INTO \"t\"(\"a\", \"b\") VALUES(?1, ?2)"
        );
        assert_eq!(
            stmt.or_ignore().sql(),
            "INSERT OR IGNORE INTO \"t\"(\"a\", \"b\") VALUES(?1, ?2)"
        );
        assert_eq!(
            StatementInsert::new("t").sql(),
            "INSERT INTO \"t\" DEFAULT VALUES"
        );
    }

    #[test]
    fn test_update_sql_plain_condition() {
        let stmt = StatementUpdate::new("t")
            .set(["b"])
            .options(QueryOptions::new().condition("a = ?"));
        assert_eq!(stmt.sql(), "UPDATE \"t\" SET \"b\" = ?1 WHERE a = ?");
        assert_eq!(stmt.kind(), StatementKind::Update);
    }

    #[test]
    fn test_update_with_limit_uses_rowid_subquery() {
        let stmt = StatementUpdate::new("t")
            .set(["b"])
            .options(QueryOptions::new().condition("a > 1").order_by("a DESC").limit(2));
        assert_eq!(
            stmt.sql(),
            "UPDATE \"t\" SET \"b\" = ?1 WHERE rowid IN \
             (SELECT rowid FROM \"t\" WHERE a > 1 ORDER BY a DESC LIMIT 2)"
        );
    }

    #[test]
    fn test_delete_sql() {
        assert_eq!(StatementDelete::new("t").sql(), "DELETE FROM \"t\"");
        let stmt = StatementDelete::new("t").options(QueryOptions::new().offset(3));
        assert_eq!(
            stmt.sql(),
            "DELETE FROM \"t\" WHERE rowid IN (SELECT rowid FROM \"t\" LIMIT -1 OFFSET 3)"
        );
    }

    #[test]
    fn test_select_sql() {
        let stmt = StatementSelect::new("t")
            .columns(["a", "count(*)"])
            .options(QueryOptions::new().order_by("a").limit(5).offset(10));
        assert_eq!(
            stmt.sql(),
            "SELECT \"a\", count(*) FROM \"t\" ORDER BY a LIMIT 5 OFFSET 10"
        );
        assert_eq!(StatementSelect::new("t").sql(), "SELECT * FROM \"t\"");
        assert_eq!(
            StatementSelect::new("t")
                .columns(["a"])
                .from_subquery("SELECT a FROM u")
                .sql(),
            "SELECT \"a\" FROM (SELECT a FROM u) AS \"t\""
        );
        assert!(!stmt.kind().is_write());
    }

    #[test]
    fn test_condition_with_params() {
        let opts = QueryOptions::new().condition_with("a = ?", vec![Value::Integer(1)]);
        assert_eq!(opts.params, vec![Value::Integer(1)]);
    }
}
