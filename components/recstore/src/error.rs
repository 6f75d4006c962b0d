/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

use error_support::{ErrorHandling, GetErrorHandling};
use interrupt_support::Interrupted;

/// Result enum for the public API
pub type ApiResult<T> = std::result::Result<T, StoreApiError>;

/// Result enum for internal functions
pub type Result<T> = std::result::Result<T, Error>;

// Errors we return via the public interface.
#[derive(Debug, thiserror::Error)]
pub enum StoreApiError {
    #[error("Configuration error: {reason}")]
    ConfigurationError { reason: String },

    #[error("No such record: {reason}")]
    NotFound { reason: String },

    #[error("Transaction timed out")]
    TimeoutError,

    #[error("Operation interrupted")]
    InterruptedError,

    #[error("Error executing SQL: {reason}")]
    BackendError { reason: String },

    #[error("Unexpected error: {reason}")]
    UnexpectedStoreApiError { reason: String },
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Error opening database: {0}")]
    OpenDatabaseError(#[from] sql_support::open_database::Error),

    #[error("Error executing SQL: {0}")]
    SqlError(#[from] rusqlite::Error),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Operation interrupted")]
    InterruptedError(#[from] Interrupted),

    #[error("JSON Error: {0}")]
    JsonError(#[from] serde_json::Error),

    // This will happen if you provide something absurd like "/" or "" as
    // your database path. For more subtly broken paths we'll likely return
    // an IoError.
    #[error("Illegal database path: {0:?}")]
    IllegalDatabasePath(std::path::PathBuf),

    #[error("Unknown table: {0}")]
    UnknownTable(String),

    #[error("Unknown column {column} on table {table}")]
    UnknownColumn { table: String, column: String },

    #[error("Unknown search operator: {0}")]
    UnknownOperator(String),

    #[error("IN / NOT IN requires a non-empty list (column {0})")]
    EmptyInList(String),

    #[error("BETWEEN requires exactly two values (column {0})")]
    InvalidBetween(String),

    #[error("Invalid search conditions: {0}")]
    InvalidPredicate(String),

    #[error("Invalid order by: {0}")]
    InvalidOrderBy(String),

    #[error("Order by mixes ASC and DESC: {0}")]
    MixedOrderDirections(String),

    #[error("Invalid join spec: {0}")]
    InvalidJoinSpec(String),

    #[error("No foreign key links {this} and {other}")]
    CannotResolveJoin { this: String, other: String },

    #[error("Record for table {table} is missing primary key column {column}")]
    MissingPrimaryKey { table: String, column: String },

    #[error("Primary key value contains the reserved separator: {0}")]
    SeparatorInKey(String),

    #[error("No record in {table} with primary key {uid}")]
    NoSuchRecord { table: String, uid: String },

    #[error("A transaction is already in progress")]
    NestedTransaction,

    #[error("The transaction timed out and was rolled back")]
    TransactionTimeout,

    #[error("A mutation actor is required but none was supplied")]
    MissingActor,

    #[error("Change token cannot be resolved: {0}")]
    UnknownToken(String),
}

// Define how our internal errors are handled and converted to external
// errors.  See `support/error` for how this works, especially the warning
// about PII.
impl GetErrorHandling for Error {
    type ExternalError = StoreApiError;

    fn get_error_handling(&self) -> ErrorHandling<Self::ExternalError> {
        match self {
            Self::OpenDatabaseError(e) => ErrorHandling::convert(StoreApiError::BackendError {
                reason: e.to_string(),
            })
            .report_error("recstore-open-database-error"),

            Self::SqlError(e) => ErrorHandling::convert(StoreApiError::BackendError {
                reason: e.to_string(),
            })
            .report_error("recstore-sql-error"),

            Self::IoError(e) => ErrorHandling::convert(StoreApiError::UnexpectedStoreApiError {
                reason: e.to_string(),
            })
            .report_error("recstore-io-error"),

            Self::InterruptedError(_) => ErrorHandling::convert(StoreApiError::InterruptedError),

            Self::JsonError(e) => ErrorHandling::convert(StoreApiError::ConfigurationError {
                reason: e.to_string(),
            })
            .log_warning(),

            Self::IllegalDatabasePath(path) => {
                ErrorHandling::convert(StoreApiError::BackendError {
                    reason: format!("Path not found: {}", path.to_string_lossy()),
                })
                .report_error("recstore-illegal-database-path")
            }

            Self::NoSuchRecord { table, uid } => {
                ErrorHandling::convert(StoreApiError::NotFound {
                    reason: format!("{}/{}", table, uid),
                })
                .log_warning()
            }

            Self::TransactionTimeout => {
                ErrorHandling::convert(StoreApiError::TimeoutError).log_warning()
            }

            // The remaining errors are all misconfigurations of one kind or
            // another, which the caller can fix; log them as warnings.
            e => ErrorHandling::convert(StoreApiError::ConfigurationError {
                reason: e.to_string(),
            })
            .log_warning(),
        }
    }
}
