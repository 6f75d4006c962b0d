/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

use error_support::{ErrorHandling, GetErrorHandling};

/// Result enum for the public API
pub type ApiResult<T> = std::result::Result<T, BlobApiError>;

/// Result enum for internal functions
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum BlobApiError {
    #[error("No binary with uid {uid}")]
    NotFound { uid: String },

    #[error("Storage error: {reason}")]
    StorageError { reason: String },

    #[error("IO error: {reason}")]
    IoError { reason: String },

    #[error("Unexpected error: {reason}")]
    UnexpectedBlobApiError { reason: String },
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Storage error: {0}")]
    StoreError(#[from] recstore::Error),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Error parsing JSON data: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("No binary with uid {0}")]
    NoSuchBinary(String),

    // The file move failed after the metadata commit; the temp file is
    // kept at the reported path so the content can be reconciled.
    #[error("Could not move {temp_path} into place: {source}")]
    RenameFailed {
        temp_path: String,
        source: std::io::Error,
    },

    #[error("Checksum mismatch for {uid}: expected {expected}, file has {actual}")]
    ChecksumMismatch {
        uid: String,
        expected: String,
        actual: String,
    },
}

impl GetErrorHandling for Error {
    type ExternalError = BlobApiError;

    fn get_error_handling(&self) -> ErrorHandling<Self::ExternalError> {
        match self {
            Self::StoreError(e) => ErrorHandling::convert(BlobApiError::StorageError {
                reason: e.to_string(),
            })
            .report_error("blobstore-store-error"),

            Self::IoError(e) => ErrorHandling::convert(BlobApiError::IoError {
                reason: e.to_string(),
            })
            .report_error("blobstore-io-error"),

            Self::JsonError(e) => ErrorHandling::convert(BlobApiError::UnexpectedBlobApiError {
                reason: e.to_string(),
            })
            .report_error("blobstore-json-error"),

            Self::NoSuchBinary(uid) => {
                ErrorHandling::convert(BlobApiError::NotFound { uid: uid.clone() }).log_warning()
            }

            Self::RenameFailed { .. } => ErrorHandling::convert(BlobApiError::IoError {
                reason: self.to_string(),
            })
            .report_error("blobstore-rename-failed"),

            Self::ChecksumMismatch { .. } => {
                ErrorHandling::convert(BlobApiError::UnexpectedBlobApiError {
                    reason: self.to_string(),
                })
                .report_error("blobstore-checksum-mismatch")
            }
        }
    }
}
