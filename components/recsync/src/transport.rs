/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

//! The seam between the sync client and whatever carries its bytes. The
//! HTTP surface implements this trait elsewhere; [InProcessTransport] wires
//! a client directly to a server engine for tests and single-process
//! deployments.

use crate::changeset::{ChangeSet, UploadOutcome};
use crate::error::*;
use crate::server::SyncServer;
use recstore::history::Tombstone;
use recstore::{Record, TableSchema};
use std::collections::HashMap;
use std::sync::Arc;
use types::Timestamp;

pub trait SyncTransport: Send + Sync {
    /// Send the client's (skew-adjusted) timestamp; the reply is
    /// `server_now - received_stamp` in milliseconds.
    fn get_time(&self, client_stamp_ms: i64) -> Result<i64>;

    fn upload(&self, changeset: &ChangeSet) -> Result<UploadOutcome>;

    fn schema_version(&self) -> Result<i64>;

    fn fetch_schema(&self) -> Result<Vec<TableSchema>>;

    /// Current `version_table` per tracked table.
    fn table_versions(&self) -> Result<HashMap<String, i64>>;

    fn changed_rows(&self, table: &str, since: i64) -> Result<Vec<Record>>;

    fn fetch_tombstones(&self, table: &str, since: i64) -> Result<Vec<Tombstone>>;
}

/// A transport that talks straight to an in-process [SyncServer].
pub struct InProcessTransport {
    server: Arc<SyncServer>,
    actor: Option<String>,
    /// Added to the server clock in `get_time`, for skew tests.
    pub clock_offset_ms: i64,
}

impl InProcessTransport {
    pub fn new(server: Arc<SyncServer>, actor: Option<String>) -> Self {
        Self {
            server,
            actor,
            clock_offset_ms: 0,
        }
    }
}

impl SyncTransport for InProcessTransport {
    fn get_time(&self, client_stamp_ms: i64) -> Result<i64> {
        let server_now = Timestamp::now().as_millis_i64() + self.clock_offset_ms;
        Ok(server_now - client_stamp_ms)
    }

    fn upload(&self, changeset: &ChangeSet) -> Result<UploadOutcome> {
        self.server.apply(self.actor.as_deref(), changeset)
    }

    fn schema_version(&self) -> Result<i64> {
        self.server.schema_version()
    }

    fn fetch_schema(&self) -> Result<Vec<TableSchema>> {
        self.server.schema()
    }

    fn table_versions(&self) -> Result<HashMap<String, i64>> {
        self.server.table_versions()
    }

    fn changed_rows(&self, table: &str, since: i64) -> Result<Vec<Record>> {
        self.server.changed_rows(table, since)
    }

    fn fetch_tombstones(&self, table: &str, since: i64) -> Result<Vec<Tombstone>> {
        self.server.tombstones(table, since)
    }
}
