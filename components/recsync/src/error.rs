/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

use error_support::{ErrorHandling, GetErrorHandling};

/// Result enum for the public API
pub type ApiResult<T> = std::result::Result<T, SyncApiError>;

/// Result enum for internal functions
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum SyncApiError {
    #[error("Sync conflict; refresh and retry: {reason}")]
    Conflict { reason: String },

    #[error("Transport error: {reason}")]
    TransportError { reason: String },

    #[error("Storage error: {reason}")]
    StorageError { reason: String },

    #[error("Unexpected error: {reason}")]
    UnexpectedSyncApiError { reason: String },
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Storage error: {0}")]
    StoreError(#[from] recstore::Error),

    #[error("Error parsing JSON data: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("Error executing SQL: {0}")]
    SqlError(#[from] rusqlite::Error),

    // The skew negotiation could not get the offset under the threshold.
    #[error("Connection too unstable to measure clock skew")]
    UnstableConnection,

    #[error("Malformed sync payload: {0}")]
    MalformedPayload(String),

    #[error("Transport error: {0}")]
    TransportError(String),
}

impl GetErrorHandling for Error {
    type ExternalError = SyncApiError;

    fn get_error_handling(&self) -> ErrorHandling<Self::ExternalError> {
        match self {
            Self::StoreError(e) => ErrorHandling::convert(SyncApiError::StorageError {
                reason: e.to_string(),
            })
            .report_error("recsync-store-error"),

            Self::SqlError(e) => ErrorHandling::convert(SyncApiError::StorageError {
                reason: e.to_string(),
            })
            .report_error("recsync-sql-error"),

            Self::JsonError(e) => ErrorHandling::convert(SyncApiError::UnexpectedSyncApiError {
                reason: e.to_string(),
            })
            .report_error("recsync-json-error"),

            Self::UnstableConnection => ErrorHandling::convert(SyncApiError::TransportError {
                reason: self.to_string(),
            })
            .log_warning(),

            Self::MalformedPayload(reason) => {
                ErrorHandling::convert(SyncApiError::TransportError {
                    reason: reason.clone(),
                })
                .log_warning()
            }

            Self::TransportError(reason) => {
                ErrorHandling::convert(SyncApiError::TransportError {
                    reason: reason.clone(),
                })
                .log_warning()
            }
        }
    }
}
