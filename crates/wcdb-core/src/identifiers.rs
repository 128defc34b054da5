//! SQL identifier quoting and sanitization.

/// Quote a SQL identifier using double quotes.
///
/// Embedded double quotes are escaped by doubling them.
///
/// ```
/// use wcdb_core::quote_ident;
///
/// assert_eq!(quote_ident("users"), "\"users\"");
/// assert_eq!(quote_ident("user\"name"), "\"user\"\"name\"");
/// ```
#[inline]
pub fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// Keep only ASCII alphanumerics and underscores.
///
/// Used where quoting is not possible, such as savepoint and schema names
/// spliced into PRAGMA statements.
///
/// ```
/// use wcdb_core::sanitize_identifier;
///
/// assert_eq!(sanitize_identifier("user;DROP TABLE--"), "userDROPTABLE");
/// ```
#[inline]
pub fn sanitize_identifier(name: &str) -> String {
    name.chars()
        .filter(|c| c.is_ascii_alphanumeric() || *c == '_')
        .collect()
}

/// Quote a string literal with single quotes.
#[inline]
pub fn quote_literal(text: &str) -> String {
    format!("'{}'", text.replace('\'', "''"))
}
