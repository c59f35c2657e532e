//! Classification of raw database errors into the store taxonomy.

use cronvault_core::StoreError;
use rusqlite::ErrorCode;

/// Map a rusqlite error into the store taxonomy: busy/locked is transient,
/// constraint failures are constraint violations, everything else is
/// treated as fatal for this operation.
pub(crate) fn classify(context: &str, e: rusqlite::Error) -> StoreError {
    match &e {
        rusqlite::Error::SqliteFailure(f, _) => match f.code {
            ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked => {
                StoreError::Transient(format!("{context}: {e}"))
            }
            ErrorCode::ConstraintViolation => {
                StoreError::ConstraintViolation(format!("{context}: {e}"))
            }
            _ => StoreError::Fatal(format!("{context}: {e}")),
        },
        _ => StoreError::Fatal(format!("{context}: {e}")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rusqlite::Connection;

    #[test]
    fn test_constraint_maps_to_violation() {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch("CREATE TABLE t (id INTEGER PRIMARY KEY); INSERT INTO t VALUES (1);")
            .unwrap();
        let err = conn
            .execute("INSERT INTO t VALUES (1)", [])
            .map_err(|e| classify("insert t", e))
            .unwrap_err();
        assert!(matches!(err, StoreError::ConstraintViolation(_)));
    }

    #[test]
    fn test_unknown_maps_to_fatal() {
        let conn = Connection::open_in_memory().unwrap();
        let err = conn
            .execute("INSERT INTO missing_table VALUES (1)", [])
            .map_err(|e| classify("insert", e))
            .unwrap_err();
        assert!(err.is_fatal());
    }
}
