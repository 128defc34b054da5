//! Statements and statement classification.

use regex::Regex;
use std::borrow::Cow;
use std::sync::LazyLock;

/// Leading whitespace and SQL comments, stripped before classification.
static LEADING_TRIVIA: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(?s:\s|--[^\n]*(?:\n|$)|/\*.*?\*/)*").expect("valid regex")
});

/// Text with nothing to compile: whitespace, comments and semicolons.
static BLANK_SQL: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(?s:\s|;|--[^\n]*(?:\n|$)|/\*.*?\*/)*$").expect("valid regex")
});

/// Does `sql` contain no statement at all?
pub fn is_blank_sql(sql: &str) -> bool {
    BLANK_SQL.is_match(sql)
}

/// Category of a SQL statement, decided by its first keyword.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StatementKind {
    Select,
    /// INSERT, UPDATE, REPLACE, DELETE
    Update,
    Attach,
    Begin,
    /// COMMIT or END
    Commit,
    /// ROLLBACK
    Abort,
    Pragma,
    /// CREATE, DROP, ALTER
    Ddl,
    /// ANALYZE, DETACH
    Unprepared,
    Other,
}

impl StatementKind {
    /// Classify a statement by the first three letters of its first keyword.
    ///
    /// Statements shorter than three characters, and anything not in the
    /// table (including `WITH`), classify as `Other`.
    pub fn classify(sql: &str) -> Self {
        let body = LEADING_TRIVIA.find(sql).map_or(sql, |m| &sql[m.end()..]);
        let body = body.trim_end();
        let mut prefix = [0_u8; 3];
        let mut chars = body.chars();
        for slot in &mut prefix {
            match chars.next() {
                Some(c) if c.is_ascii() => *slot = c.to_ascii_uppercase() as u8,
                _ => return StatementKind::Other,
            }
        }
        match &prefix {
            b"SEL" => StatementKind::Select,
            b"INS" | b"UPD" | b"REP" | b"DEL" => StatementKind::Update,
            b"ATT" => StatementKind::Attach,
            b"COM" | b"END" => StatementKind::Commit,
            b"ROL" => StatementKind::Abort,
            b"BEG" => StatementKind::Begin,
            b"PRA" => StatementKind::Pragma,
            b"CRE" | b"DRO" | b"ALT" => StatementKind::Ddl,
            b"ANA" | b"DET" => StatementKind::Unprepared,
            _ => StatementKind::Other,
        }
    }

    /// Can a statement of this kind modify the database?
    ///
    /// Unknown kinds are treated as writes.
    pub const fn is_write(self) -> bool {
        !matches!(self, StatementKind::Select | StatementKind::Pragma)
    }
}

/// Is `sql` a statement that needs the writer connection?
pub fn is_write_statement(sql: &str) -> bool {
    StatementKind::classify(sql).is_write()
}

/// Anything that can be compiled by `prepare`.
///
/// A statement renders to SQL text and classifies itself read or write.
pub trait Statement {
    fn sql(&self) -> Cow<'_, str>;

    fn kind(&self) -> StatementKind {
        StatementKind::classify(&self.sql())
    }
}

impl Statement for str {
    fn sql(&self) -> Cow<'_, str> {
        Cow::Borrowed(self)
    }
}

impl Statement for String {
    fn sql(&self) -> Cow<'_, str> {
        Cow::Borrowed(self.as_str())
    }
}

impl<T: Statement + ?Sized> Statement for &T {
    fn sql(&self) -> Cow<'_, str> {
        (**self).sql()
    }

    fn kind(&self) -> StatementKind {
        (**self).kind()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prefix_table() {
        let cases = [
            ("SELECT 1", StatementKind::Select),
            ("insert into t values(1)", StatementKind::Update),
            ("Update t set a=1", StatementKind::Update),
            ("REPLACE INTO t VALUES(1)", StatementKind::Update),
            ("delete from t", StatementKind::Update),
            ("ATTACH 'x' AS y", StatementKind::Attach),
            ("COMMIT", StatementKind::Commit),
            ("END TRANSACTION", StatementKind::Commit),
            ("ROLLBACK", StatementKind::Abort),
            ("BEGIN IMMEDIATE", StatementKind::Begin),
            ("PRAGMA user_version", StatementKind::Pragma),
            ("CREATE TABLE t(a)", StatementKind::Ddl),
            ("DROP TABLE t", StatementKind::Ddl),
            ("ALTER TABLE t ADD b", StatementKind::Ddl),
            ("ANALYZE", StatementKind::Unprepared),
            ("DETACH y", StatementKind::Unprepared),
            ("WITH x AS (SELECT 1) SELECT * FROM x", StatementKind::Other),
            ("VACUUM", StatementKind::Other),
        ];
        for (sql, kind) in cases {
            assert_eq!(StatementKind::classify(sql), kind, "{sql}");
        }
    }

    #[test]
    fn test_short_statement_is_other() {
        assert_eq!(StatementKind::classify("  se "), StatementKind::Other);
        assert_eq!(StatementKind::classify(""), StatementKind::Other);
    }

    #[test]
    fn test_leading_comments_skipped() {
        assert_eq!(
            StatementKind::classify("-- note\n  /* block\n comment */ select 1"),
            StatementKind::Select
        );
        assert_eq!(StatementKind::classify("-- only a comment"), StatementKind::Other);
    }

    #[test]
    fn test_blank_sql() {
        assert!(is_blank_sql(""));
        assert!(is_blank_sql(" ; -- trailing note\n/* done; really */ "));
        assert!(!is_blank_sql("; DROP TABLE t"));
        assert!(!is_blank_sql("-- note\nSELECT 1"));
    }

    #[test]
    fn test_write_detection() {
        assert!(!is_write_statement("SELECT * FROM t"));
        assert!(!is_write_statement("pragma table_info(t)"));
        assert!(is_write_statement("INSERT INTO t VALUES (1)"));
        assert!(is_write_statement("WITH x AS (SELECT 1) DELETE FROM t"));
    }

    #[test]
    fn test_statement_trait_for_strings() {
        let owned = String::from("DELETE FROM t");
        assert_eq!(owned.kind(), StatementKind::Update);
        assert_eq!("SELECT 1".sql(), "SELECT 1");
        assert_eq!((&owned).sql(), "DELETE FROM t");
    }
}
