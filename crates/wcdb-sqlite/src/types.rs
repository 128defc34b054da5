//! Value binding and extraction across the native boundary.
//!
//! Binding dispatches on the value's tag. Extraction reads the column's
//! storage class first and then calls the matching getter, never the
//! reverse, so the engine never performs an implicit conversion behind the
//! caller's back.

use crate::ffi;
use std::ffi::{CStr, c_int};
use wcdb_core::Value;

/// Bind a 64-bit integer.
///
/// # Safety
/// `stmt` must be a valid prepared statement.
pub unsafe fn bind_i64(stmt: *mut ffi::sqlite3_stmt, index: c_int, value: i64) -> c_int {
    // SAFETY: caller guarantees stmt is valid
    unsafe { ffi::sqlite3_bind_int64(stmt, index, value) }
}

/// Bind a double.
///
/// # Safety
/// `stmt` must be a valid prepared statement.
pub unsafe fn bind_f64(stmt: *mut ffi::sqlite3_stmt, index: c_int, value: f64) -> c_int {
    // SAFETY: caller guarantees stmt is valid
    unsafe { ffi::sqlite3_bind_double(stmt, index, value) }
}

/// Bind UTF-8 text. The engine copies the bytes.
///
/// # Safety
/// `stmt` must be a valid prepared statement.
pub unsafe fn bind_text(stmt: *mut ffi::sqlite3_stmt, index: c_int, value: &str) -> c_int {
    let bytes = value.as_bytes();
    // SAFETY: the slice is valid for the call and SQLITE_TRANSIENT makes a copy
    unsafe {
        ffi::sqlite3_bind_text(
            stmt,
            index,
            bytes.as_ptr().cast(),
            bytes.len() as c_int,
            ffi::SQLITE_TRANSIENT(),
        )
    }
}

/// Bind a byte sequence. The engine copies the bytes.
///
/// # Safety
/// `stmt` must be a valid prepared statement.
pub unsafe fn bind_blob(stmt: *mut ffi::sqlite3_stmt, index: c_int, value: &[u8]) -> c_int {
    // SAFETY: the slice is valid for the call and SQLITE_TRANSIENT makes a copy
    unsafe {
        ffi::sqlite3_bind_blob(
            stmt,
            index,
            value.as_ptr().cast(),
            value.len() as c_int,
            ffi::SQLITE_TRANSIENT(),
        )
    }
}

/// Bind NULL.
///
/// # Safety
/// `stmt` must be a valid prepared statement.
pub unsafe fn bind_null(stmt: *mut ffi::sqlite3_stmt, index: c_int) -> c_int {
    // SAFETY: caller guarantees stmt is valid
    unsafe { ffi::sqlite3_bind_null(stmt, index) }
}

/// Bind a Value to a 1-based parameter index.
///
/// # Safety
/// `stmt` must be a valid prepared statement.
pub unsafe fn bind_value(stmt: *mut ffi::sqlite3_stmt, index: c_int, value: &Value) -> c_int {
    // SAFETY: forwarded to the typed binders under the same contract
    unsafe {
        match value {
            Value::Null => bind_null(stmt, index),
            Value::Integer(v) => bind_i64(stmt, index, *v),
            Value::Float(v) => bind_f64(stmt, index, *v),
            Value::Text(s) => bind_text(stmt, index, s),
            Value::Blob(b) => bind_blob(stmt, index, b),
        }
    }
}

/// Read a column of the current row.
///
/// # Safety
/// `stmt` must be a valid statement positioned on a row and `index` must be
/// a valid 0-based column index.
pub unsafe fn read_column(stmt: *mut ffi::sqlite3_stmt, index: c_int) -> Value {
    // SAFETY: caller guarantees stmt is on a row; pointers returned by the
    // column getters stay valid until the next step/reset/finalize and are
    // copied out immediately
    unsafe {
        match ffi::sqlite3_column_type(stmt, index) {
            ffi::SQLITE_NULL => Value::Null,
            ffi::SQLITE_INTEGER => Value::Integer(ffi::sqlite3_column_int64(stmt, index)),
            ffi::SQLITE_FLOAT => Value::Float(ffi::sqlite3_column_double(stmt, index)),
            ffi::SQLITE_TEXT => {
                let ptr = ffi::sqlite3_column_text(stmt, index);
                let len = ffi::sqlite3_column_bytes(stmt, index);
                if ptr.is_null() {
                    Value::Text(String::new())
                } else {
                    let slice = std::slice::from_raw_parts(ptr, len as usize);
                    Value::Text(String::from_utf8_lossy(slice).into_owned())
                }
            }
            ffi::SQLITE_BLOB => {
                let ptr = ffi::sqlite3_column_blob(stmt, index);
                let len = ffi::sqlite3_column_bytes(stmt, index);
                if ptr.is_null() || len == 0 {
                    Value::Blob(Vec::new())
                } else {
                    let slice = std::slice::from_raw_parts(ptr.cast::<u8>(), len as usize);
                    Value::Blob(slice.to_vec())
                }
            }
            _ => Value::Null,
        }
    }
}

/// Get the name of a result column.
///
/// # Safety
/// `stmt` must be a valid prepared statement.
pub unsafe fn column_name(stmt: *mut ffi::sqlite3_stmt, index: c_int) -> Option<String> {
    // SAFETY: caller guarantees stmt is valid
    unsafe {
        let ptr = ffi::sqlite3_column_name(stmt, index);
        if ptr.is_null() {
            None
        } else {
            Some(CStr::from_ptr(ptr).to_string_lossy().into_owned())
        }
    }
}
