/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

//! The client half of the sync engine.
//!
//! Local mutations are queued in `sync_pending` (ordered, JSON change
//! payloads). A sync run measures clock skew, drains the queue into one
//! uploaded change-set, then downloads per table: rows with a server
//! `version_table` past the local watermark, plus tombstones, applied in one
//! transaction with tracking in passthrough mode so the server's version
//! columns land verbatim.
//!
//! At most one sync runs at a time. A `sync()` that arrives while one is
//! running marks a pending flag and returns; the running sync re-runs once
//! before finishing, so requests coalesce instead of queueing timers.

use crate::changeset::{Change, ChangeSet};
use crate::error::*;
use crate::skew::negotiate_skew;
use crate::transport::SyncTransport;
use error_support::{debug, warn};
use parking_lot::Mutex;
use recstore::{
    parse_table_uid, AppliedAction, ChangeRequest, Context, Record, Store, TableSchema,
};
use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use types::Timestamp;

const CREATE_PENDING_SQL: &str = "
    CREATE TABLE IF NOT EXISTS sync_pending (
        id     INTEGER PRIMARY KEY AUTOINCREMENT,
        change TEXT NOT NULL
    )
";

// Tables the download never touches, whatever the server advertises. The
// binaries metadata is tracked like any record table but reconciles through
// the blob store's own three-way sync, not this path.
const NEVER_SYNCED: [&str; 8] = [
    "table_versions",
    "modif_track",
    "delete_track",
    "sequences",
    "sync_log",
    "sync_pending",
    "db_version",
    "binaries",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncOutcome {
    Completed {
        uploaded: usize,
        downloaded_tables: usize,
    },
    /// Another sync was running; this request was folded into it.
    Deferred,
}

pub struct SyncClient {
    store: Arc<Store>,
    transport: Box<dyn SyncTransport>,
    /// Tables to sync; empty means every table the server advertises.
    tables: Vec<String>,
    running: Mutex<()>,
    pending_sync: AtomicBool,
}

impl SyncClient {
    pub fn new(
        store: Arc<Store>,
        transport: Box<dyn SyncTransport>,
        tables: Vec<String>,
    ) -> Result<Self> {
        let ctx = Context::anonymous();
        store.unsafe_scope(&ctx, |s| s.execute_batch(CREATE_PENDING_SQL))?;
        Ok(SyncClient {
            store,
            transport,
            tables,
            running: Mutex::new(()),
            pending_sync: AtomicBool::new(false),
        })
    }

    pub fn store(&self) -> &Arc<Store> {
        &self.store
    }

    /// Apply a change to the local store and queue it for upload. The
    /// queued record carries the local version columns, which is what the
    /// server's conflict logic compares against.
    pub fn apply_local(&self, ctx: &Context, change: &Change) -> Result<Option<Record>> {
        let applied = self.store.changes(ctx, std::slice::from_ref(change))?;
        let applied = applied.into_iter().next().ok_or_else(|| {
            Error::MalformedPayload("change batch applied to nothing".into())
        })?;
        let to_queue = match (&applied.action, &applied.record) {
            (AppliedAction::Inserted, Some(rec)) => {
                ChangeRequest::insert(change.table.clone(), rec.clone())
            }
            (AppliedAction::Updated, Some(rec)) => {
                ChangeRequest::update(change.table.clone(), rec.clone())
            }
            _ => change.clone(),
        };
        self.record_change(&to_queue)?;
        Ok(applied.record)
    }

    /// Queue a change for the next upload without touching local state.
    pub fn record_change(&self, change: &Change) -> Result<()> {
        let payload = serde_json::to_string(change)?;
        let ctx = Context::anonymous();
        self.store.unsafe_scope(&ctx, |s| {
            s.execute(
                "INSERT INTO sync_pending (change) VALUES (?)",
                &[Value::String(payload.clone())],
            )?;
            Ok(())
        })?;
        Ok(())
    }

    pub fn pending_count(&self) -> Result<u64> {
        let ctx = Context::anonymous();
        let rows = self.store.unsafe_scope(&ctx, |s| {
            s.query("SELECT COUNT(*) AS n FROM sync_pending", &[])
        })?;
        Ok(rows
            .first()
            .and_then(|r| r.get("n"))
            .and_then(Value::as_u64)
            .unwrap_or(0))
    }

    /// Upload pending changes, then download new state. Coalesces: at most
    /// one sync runs; overlapping requests fold into the running one.
    pub fn sync(&self) -> Result<SyncOutcome> {
        let guard = match self.running.try_lock() {
            Some(guard) => guard,
            None => {
                self.pending_sync.store(true, Ordering::SeqCst);
                debug!("sync already running; deferring");
                return Ok(SyncOutcome::Deferred);
            }
        };
        let outcome = loop {
            let uploaded = self.upload()?;
            let downloaded_tables = self.download()?;
            if !self.pending_sync.swap(false, Ordering::SeqCst) {
                break SyncOutcome::Completed {
                    uploaded,
                    downloaded_tables,
                };
            }
            debug!("a sync request arrived while syncing; running again");
        };
        drop(guard);
        Ok(outcome)
    }

    fn upload(&self) -> Result<usize> {
        let pending = self.read_pending()?;
        if pending.is_empty() {
            return Ok(0);
        }
        let max_id = pending.last().map(|(id, _)| *id).unwrap_or(0);
        let changes: Vec<Change> = pending.into_iter().map(|(_, c)| c).collect();
        let count = changes.len();

        let skew = negotiate_skew(self.transport.as_ref())?;
        let changeset = ChangeSet::new(Timestamp::now(), skew, changes);
        let outcome = self.transport.upload(&changeset)?;
        // Whatever the outcome, the uuid now lives in the server's log, so
        // re-uploading these changes could never apply them again.
        self.clear_pending(max_id)?;
        if outcome.should_refresh() {
            warn!(
                "server failed to apply change-set {}; downloading fresh state",
                changeset.uuid
            );
        }
        Ok(count)
    }

    fn read_pending(&self) -> Result<Vec<(i64, Change)>> {
        let ctx = Context::anonymous();
        let rows = self.store.unsafe_scope(&ctx, |s| {
            s.query("SELECT id, change FROM sync_pending ORDER BY id", &[])
        })?;
        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            let id = row.get("id").and_then(Value::as_i64).unwrap_or(0);
            let payload = row
                .get("change")
                .and_then(Value::as_str)
                .ok_or_else(|| Error::MalformedPayload("sync_pending row without change".into()))?;
            out.push((id, serde_json::from_str(payload)?));
        }
        Ok(out)
    }

    fn clear_pending(&self, up_to_id: i64) -> Result<()> {
        let ctx = Context::anonymous();
        self.store.unsafe_scope(&ctx, |s| {
            s.execute(
                "DELETE FROM sync_pending WHERE id <= ?",
                &[Value::from(up_to_id)],
            )?;
            Ok(())
        })?;
        Ok(())
    }

    fn download(&self) -> Result<usize> {
        // Schema first: when the server moved ahead, refetch and apply.
        let remote_schema_version = self.transport.schema_version()?;
        let local_schema_version = self.store.schema_version()?;
        if remote_schema_version > local_schema_version {
            debug!(
                "server schema version {} > local {}; refetching schema",
                remote_schema_version, local_schema_version
            );
            let schema = self.transport.fetch_schema()?;
            self.apply_remote_schema(&schema)?;
        }

        let mut remote_versions: Vec<(String, i64)> =
            self.transport.table_versions()?.into_iter().collect();
        remote_versions.sort();

        let mut synced = 0;
        for (table, remote_version) in remote_versions {
            if !self.in_scope(&table) {
                continue;
            }
            let local_version = self.store.table_version(&table)?.unwrap_or(-1);
            if remote_version <= local_version {
                continue;
            }
            let rows = self.transport.changed_rows(&table, local_version)?;
            let tombstones = self.transport.fetch_tombstones(&table, local_version)?;
            debug!(
                "downloading {}: {} rows, {} tombstones ({} -> {})",
                table,
                rows.len(),
                tombstones.len(),
                local_version,
                remote_version
            );

            let ctx = Context::passthrough();
            self.store.transaction(&ctx, |tx| -> Result<()> {
                let catalog = tx.catalog()?;
                let schema = catalog.table(&table)?.clone();
                for row in &rows {
                    let pk = pk_value(&schema, row);
                    if tx.get_raw(&table, &pk)?.is_some() {
                        tx.update(&table, row)?;
                    } else {
                        tx.insert(&table, row)?;
                    }
                }
                for tombstone in &tombstones {
                    let pk = Value::Object(parse_table_uid(&schema, &tombstone.table_uid)?);
                    if tx.get_raw(&table, &pk)?.is_some() {
                        tx.remove(&table, &pk)?;
                    }
                }
                tx.set_table_version(&table, remote_version)?;
                Ok(())
            })?;
            synced += 1;
        }
        Ok(synced)
    }

    fn in_scope(&self, table: &str) -> bool {
        if NEVER_SYNCED.contains(&table) {
            return false;
        }
        self.tables.is_empty() || self.tables.iter().any(|t| t == table)
    }

    /// Create missing tables/columns described by the server's schema, and
    /// register it as overrides so sequences and view-of configurations
    /// travel too.
    fn apply_remote_schema(&self, schemas: &[TableSchema]) -> Result<()> {
        let ctx = Context::anonymous();
        let catalog = self.store.catalog()?;
        self.store.unsafe_scope(&ctx, |s| {
            for ts in schemas {
                if NEVER_SYNCED.contains(&ts.name.as_str()) {
                    continue;
                }
                match catalog.get(&ts.name) {
                    None => {
                        let cols = ts
                            .columns
                            .iter()
                            .map(|c| format!("\"{}\" {}", c.name, column_type_sql(c)))
                            .collect::<Vec<_>>()
                            .join(", ");
                        let pk = ts
                            .pk
                            .iter()
                            .map(|c| format!("\"{}\"", c))
                            .collect::<Vec<_>>()
                            .join(", ");
                        s.execute_batch(&format!(
                            "CREATE TABLE \"{}\" ({}, PRIMARY KEY ({}))",
                            ts.name, cols, pk
                        ))?;
                    }
                    Some(existing) => {
                        for col in &ts.columns {
                            if !existing.has_column(&col.name) {
                                s.execute_batch(&format!(
                                    "ALTER TABLE \"{}\" ADD COLUMN \"{}\" {}",
                                    ts.name,
                                    col.name,
                                    column_type_sql(col)
                                ))?;
                            }
                        }
                    }
                }
            }
            Ok(())
        })?;
        let overrides: Vec<TableSchema> = schemas
            .iter()
            .filter(|ts| !NEVER_SYNCED.contains(&ts.name.as_str()))
            .cloned()
            .collect();
        self.store.add_schema_overrides(overrides)?;
        self.store.prepare_tracking()?;
        Ok(())
    }
}

fn column_type_sql(col: &recstore::ColumnSchema) -> String {
    match col.size {
        Some(size) => format!("{}({})", col.col_type, size),
        None => col.col_type.clone(),
    }
}

fn pk_value(schema: &TableSchema, record: &Record) -> Value {
    Value::Object(
        schema
            .pk
            .iter()
            .map(|c| (c.clone(), record.get(c).cloned().unwrap_or(Value::Null)))
            .collect(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::SyncServer;
    use crate::transport::InProcessTransport;
    use recstore::{Predicate, StoreBuilder};
    use serde_json::json;

    fn record(v: Value) -> Record {
        serde_json::from_value(v).unwrap()
    }

    fn server_with_foo(name: &str) -> Arc<SyncServer> {
        let _ = env_logger::try_init();
        let store = Arc::new(StoreBuilder::in_memory(name).open().unwrap());
        let ctx = Context::anonymous();
        store
            .unsafe_scope(&ctx, |s| {
                s.execute_batch("CREATE TABLE foo (id TEXT PRIMARY KEY, name TEXT, qty INTEGER)")
            })
            .unwrap();
        store.prepare_tracking().unwrap();
        Arc::new(SyncServer::new(store).unwrap())
    }

    fn client_for(server: &Arc<SyncServer>, name: &str) -> SyncClient {
        let store = Arc::new(StoreBuilder::in_memory(name).open().unwrap());
        let transport = InProcessTransport::new(Arc::clone(server), Some("client".into()));
        SyncClient::new(store, Box::new(transport), vec![]).unwrap()
    }

    #[test]
    fn test_roundtrip_upload_and_download() {
        let server = server_with_foo("sync-rt-server");
        let client = client_for(&server, "sync-rt-client");
        let ctx = Context::new("ada");

        // First sync pulls the schema (the client store has no `foo` yet).
        client.sync().unwrap();
        assert!(client.store().catalog().unwrap().get("foo").is_some());

        // Local insert, then sync: the server gets the row.
        client
            .apply_local(
                &ctx,
                &ChangeRequest::insert("foo", record(json!({"id": "a", "name": "x", "qty": 1}))),
            )
            .unwrap();
        assert_eq!(client.pending_count().unwrap(), 1);
        let outcome = client.sync().unwrap();
        assert_eq!(
            outcome,
            SyncOutcome::Completed {
                uploaded: 1,
                downloaded_tables: 1
            }
        );
        assert_eq!(client.pending_count().unwrap(), 0);
        let server_row = server
            .store()
            .get_by_pk(&ctx, "foo", &json!("a"), None)
            .unwrap()
            .unwrap();
        assert_eq!(server_row.get("name"), Some(&json!("x")));

        // Server-side insert, then sync: the client gets the row, version
        // columns intact.
        server
            .store()
            .insert(
                &Context::new("grace"),
                "foo",
                &record(json!({"id": "b", "name": "y", "qty": 2})),
            )
            .unwrap();
        client.sync().unwrap();
        let local_row = client
            .store()
            .get_by_pk(&ctx, "foo", &json!("b"), None)
            .unwrap()
            .unwrap();
        assert_eq!(local_row.get("name"), Some(&json!("y")));
        assert_eq!(local_row.get("version_user"), Some(&json!("grace")));
        // Watermark advanced to the server's version.
        assert_eq!(
            client.store().table_version("foo").unwrap(),
            server.store().table_version("foo").unwrap()
        );
    }

    #[test]
    fn test_download_applies_tombstones() {
        let server = server_with_foo("sync-tomb-server");
        let client = client_for(&server, "sync-tomb-client");
        let ctx = Context::new("ada");

        server
            .store()
            .insert(&ctx, "foo", &record(json!({"id": "a", "name": "x"})))
            .unwrap();
        client.sync().unwrap();
        assert!(client
            .store()
            .get_by_pk(&ctx, "foo", &json!("a"), None)
            .unwrap()
            .is_some());

        server.store().remove(&ctx, "foo", &json!("a")).unwrap();
        client.sync().unwrap();
        assert!(client
            .store()
            .get_by_pk(&ctx, "foo", &json!("a"), None)
            .unwrap()
            .is_none());
        // Passthrough apply: the client didn't grow its own tombstone.
        assert!(client.store().tombstones_since("foo", -1).unwrap().is_empty());
    }

    #[test]
    fn test_local_edit_survives_roundtrip_with_skewed_clock() {
        let server = server_with_foo("sync-skew-server");
        let store = Arc::new(StoreBuilder::in_memory("sync-skew-client").open().unwrap());
        let mut transport = InProcessTransport::new(Arc::clone(&server), Some("client".into()));
        // The client clock is a minute behind the server.
        transport.clock_offset_ms = 60_000;
        let client = SyncClient::new(store, Box::new(transport), vec![]).unwrap();
        let ctx = Context::new("ada");

        client.sync().unwrap();
        client
            .apply_local(
                &ctx,
                &ChangeRequest::insert("foo", record(json!({"id": "a", "name": "x"}))),
            )
            .unwrap();
        client
            .apply_local(
                &ctx,
                &ChangeRequest::update("foo", record(json!({"id": "a", "name": "y"}))),
            )
            .unwrap();
        client.sync().unwrap();
        let row = server
            .store()
            .get_by_pk(&ctx, "foo", &json!("a"), None)
            .unwrap()
            .unwrap();
        assert_eq!(row.get("name"), Some(&json!("y")));
    }

    #[test]
    fn test_remove_where_passes_through() {
        let server = server_with_foo("sync-rw-server");
        let client = client_for(&server, "sync-rw-client");
        let ctx = Context::new("ada");
        for i in 0..3 {
            server
                .store()
                .insert(
                    &ctx,
                    "foo",
                    &record(json!({"id": format!("r{}", i), "name": "doomed"})),
                )
                .unwrap();
        }
        client.sync().unwrap();

        client
            .apply_local(
                &ctx,
                &ChangeRequest::remove_where(
                    "foo",
                    Predicate::from_json(&json!({"name": "doomed"})).unwrap(),
                ),
            )
            .unwrap();
        client.sync().unwrap();
        assert_eq!(
            server
                .store()
                .search(&ctx, "foo", &Predicate::all(), None, None, None, None)
                .unwrap()
                .len(),
            0
        );
    }
}
