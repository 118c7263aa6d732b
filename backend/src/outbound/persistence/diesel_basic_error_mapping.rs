//! Shared Diesel error mapping for the registry repositories.

use tracing::debug;

use super::pool::PoolError;

/// Map pool errors into a repository-specific connection error constructor.
pub fn map_basic_pool_error<E, C>(error: PoolError, connection: C) -> E
where
    C: FnOnce(String) -> E,
{
    let message = match error {
        PoolError::Checkout { message } | PoolError::Build { message } => message,
    };
    connection(message)
}

/// Map Diesel errors into query, connection and conflict constructors.
///
/// Unique violations are routed to `conflict` so callers can tell a lost
/// insert race from a broken query; the message stays generic so no row data
/// leaks into logs above this layer.
pub fn map_basic_diesel_error<E, Q, C, U>(
    error: diesel::result::Error,
    query: Q,
    connection: C,
    conflict: U,
) -> E
where
    Q: Fn(&'static str) -> E,
    C: Fn(&'static str) -> E,
    U: Fn(&'static str) -> E,
{
    use diesel::result::{DatabaseErrorKind, Error as DieselError};

    match &error {
        DieselError::DatabaseError(kind, info) => {
            debug!(?kind, message = info.message(), "diesel operation failed");
        }
        _ => debug!(
            error_type = %std::any::type_name_of_val(&error),
            "diesel operation failed"
        ),
    }

    match error {
        DieselError::NotFound => query("record not found"),
        DieselError::QueryBuilderError(_) => query("database query error"),
        DieselError::DatabaseError(DatabaseErrorKind::ClosedConnection, _) => {
            connection("database connection error")
        }
        DieselError::DatabaseError(DatabaseErrorKind::UniqueViolation, _) => {
            conflict("unique constraint violated")
        }
        DieselError::DatabaseError(_, _) => query("database error"),
        _ => query("database error"),
    }
}

#[cfg(test)]
mod tests {
    use diesel::result::{DatabaseErrorInformation, DatabaseErrorKind, Error as DieselError};
    use rstest::rstest;

    use super::*;

    #[derive(Debug, PartialEq, Eq)]
    enum Mapped {
        Query(&'static str),
        Connection(String),
        Conflict(&'static str),
    }

    struct Info;

    impl DatabaseErrorInformation for Info {
        fn message(&self) -> &str {
            "boom"
        }
        fn details(&self) -> Option<&str> {
            None
        }
        fn hint(&self) -> Option<&str> {
            None
        }
        fn table_name(&self) -> Option<&str> {
            None
        }
        fn column_name(&self) -> Option<&str> {
            None
        }
        fn constraint_name(&self) -> Option<&str> {
            None
        }
        fn statement_position(&self) -> Option<i32> {
            None
        }
    }

    fn map(error: DieselError) -> Mapped {
        map_basic_diesel_error(
            error,
            Mapped::Query,
            |message| Mapped::Connection(message.to_owned()),
            Mapped::Conflict,
        )
    }

    #[rstest]
    #[case(DatabaseErrorKind::UniqueViolation, Mapped::Conflict("unique constraint violated"))]
    #[case(
        DatabaseErrorKind::ClosedConnection,
        Mapped::Connection("database connection error".to_owned())
    )]
    #[case(DatabaseErrorKind::CheckViolation, Mapped::Query("database error"))]
    fn database_errors_map_by_kind(#[case] kind: DatabaseErrorKind, #[case] expected: Mapped) {
        assert_eq!(map(DieselError::DatabaseError(kind, Box::new(Info))), expected);
    }

    #[rstest]
    fn not_found_is_a_query_error() {
        assert_eq!(map(DieselError::NotFound), Mapped::Query("record not found"));
    }

    #[rstest]
    fn pool_errors_become_connection_errors() {
        let mapped = map_basic_pool_error(PoolError::checkout("timed out"), Mapped::Connection);
        assert_eq!(mapped, Mapped::Connection("timed out".to_owned()));
    }
}
