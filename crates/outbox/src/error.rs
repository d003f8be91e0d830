//! Storage error model shared by every backend.
//!
//! ## SQLx mapping
//!
//! | SQLx error | SQLSTATE | `StoreError` |
//! |---|---|---|
//! | unique violation | `23505` | `Conflict` |
//! | foreign key / check violation | `23503`, `23514` | `Validation` |
//! | serialization failure / deadlock | `40001`, `40P01` | `Transient` |
//! | admin shutdown / cannot connect | `57P01`, `08*` | `Transient` |
//! | io, tls, pool timeout, pool closed | n/a | `Transient` |
//! | any other SQLSTATE | other | `Validation` |
//! | decode / column errors | n/a | `Serialization` |
//! | anything else | n/a | `Transient` |

use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// The database could not complete the operation right now. Callers back
    /// off and retry after a poll interval.
    #[error("transient storage failure: {0}")]
    Transient(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("conflict: {0}")]
    Conflict(String),

    /// The database rejected the data (constraint violation, bad reference).
    #[error("rejected by storage: {0}")]
    Validation(String),

    #[error("row could not be decoded: {0}")]
    Serialization(String),
}

impl StoreError {
    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::Transient(_))
    }

    pub(crate) fn poisoned() -> Self {
        StoreError::Transient("shared state lock poisoned".to_string())
    }
}

pub(crate) fn map_sqlx_error(operation: &str, err: sqlx::Error) -> StoreError {
    match err {
        sqlx::Error::Database(db_err) => {
            let msg = format!("database error in {}: {}", operation, db_err.message());
            match db_err.code().as_deref() {
                Some("23505") => StoreError::Conflict(msg),
                Some("23503") | Some("23514") | Some("22P02") => StoreError::Validation(msg),
                Some("40001") | Some("40P01") | Some("57P01") => StoreError::Transient(msg),
                Some(code) if code.starts_with("08") => StoreError::Transient(msg),
                _ => StoreError::Validation(msg),
            }
        }
        sqlx::Error::RowNotFound => StoreError::NotFound(format!("no row in {}", operation)),
        sqlx::Error::ColumnDecode { .. } | sqlx::Error::ColumnNotFound(_) | sqlx::Error::Decode(_) => {
            StoreError::Serialization(format!("{} in {}", err, operation))
        }
        sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed | sqlx::Error::Io(_) | sqlx::Error::Tls(_) => {
            StoreError::Transient(format!("{} in {}", err, operation))
        }
        _ => StoreError::Transient(format!("sqlx error in {}: {}", operation, err)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pool_errors_are_transient() {
        assert!(map_sqlx_error("claim", sqlx::Error::PoolTimedOut).is_transient());
        assert!(map_sqlx_error("claim", sqlx::Error::PoolClosed).is_transient());
    }

    #[test]
    fn row_not_found_maps_to_not_found() {
        let err = map_sqlx_error("get_event", sqlx::Error::RowNotFound);
        assert!(matches!(err, StoreError::NotFound(ref m) if m.contains("get_event")));
    }
}
