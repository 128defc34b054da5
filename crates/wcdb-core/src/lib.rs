//! Core types for WCDB Rust.
//!
//! This crate provides the foundations shared by the engine binding and the
//! database layer:
//!
//! - `Value` the tagged column value bound to and extracted from statements
//! - `Row` an ordered sequence of values with shared column metadata
//! - `Error` the error taxonomy surfaced to callers
//! - `Statement` and the statement builders consumed by `prepare`
//! - `CancellationSignal` for cooperative cancellation of long operations
//! - `TableBinding` the object <-> row mapping consumed by the ORM facade

pub mod binding;
pub mod builder;
pub mod cancel;
pub mod error;
pub mod identifiers;
pub mod row;
pub mod statement;
pub mod value;

pub use binding::TableBinding;
pub use builder::{
    ConflictAction, QueryOptions, StatementDelete, StatementInsert, StatementSelect,
    StatementUpdate,
};
pub use cancel::{CancellationSignal, CancellationTransport};
pub use error::{
    ConfigError, ContractKind, ContractViolation, EngineError, EngineErrorKind, Error,
    HandleError, HandleErrorKind, Level, Result, TypeError,
};
pub use identifiers::{quote_ident, quote_literal, sanitize_identifier};
pub use row::{ColumnInfo, FromValue, Row};
pub use statement::{Statement, StatementKind, is_blank_sql, is_write_statement};
pub use value::{ColumnType, Value};
