/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

//! The transport types: an ordered list of mutations submitted as a unit,
//! with a stable uuid for idempotency and the client's measured clock skew.

use serde_derive::{Deserialize, Serialize};
use types::Timestamp;

/// One uploaded mutation. This is exactly the store's change-request shape;
/// the sync engine adds nothing to individual changes.
pub type Change = recstore::ChangeRequest;
pub type ChangeAction = recstore::ChangeRequestAction;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChangeSet {
    pub uuid: String,
    pub client_date: Timestamp,
    pub time_skew_ms: i64,
    pub changes: Vec<Change>,
}

impl ChangeSet {
    pub fn new(client_date: Timestamp, time_skew_ms: i64, changes: Vec<Change>) -> Self {
        ChangeSet {
            uuid: uuid::Uuid::new_v4().to_string(),
            client_date,
            time_skew_ms,
            changes,
        }
    }

    /// The server-adjusted timestamp every change in this set is compared
    /// at.
    pub fn adjusted_date(&self) -> Timestamp {
        self.client_date.offset_ms(self.time_skew_ms)
    }
}

/// What the server tells the client about an upload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum UploadOutcome {
    /// The batch was applied.
    Applied,
    /// This uuid was seen before; nothing was done.
    AlreadyApplied,
    /// Something went wrong; the batch is logged (and will never be
    /// re-applied) - the client should download fresh state.
    NeedsRefresh,
}

impl UploadOutcome {
    pub fn should_refresh(self) -> bool {
        matches!(self, UploadOutcome::NeedsRefresh)
    }
}
