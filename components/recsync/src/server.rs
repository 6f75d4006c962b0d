/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

//! Server-side change-set application.
//!
//! Every batch runs in one transaction bracketed by a `sync_log` row
//! (todo -> done). The uuid is the idempotency key: a seen uuid is never
//! re-applied, and a failed batch keeps its uuid (status=error) so a retry
//! is a no-op and the client is told to refresh instead.
//!
//! Conflict resolution is last-writer-wins per column against the
//! skew-adjusted timestamp T. When the recorded history is *newer* than T,
//! the incoming value doesn't touch the row - it is spliced into the history
//! instead: the existing transition's `column_before` is rewritten to the
//! incoming value and a new transition old_before -> incoming is inserted at
//! T, so the chain reads old -> incoming -> current.

use crate::changeset::{ChangeSet, UploadOutcome};
use crate::error::*;
use error_support::{debug, warn};
use recstore::history::{HistoryEntry, Tombstone};
use recstore::{
    table_uid, value_repr, ChangeRequest, ChangeRequestAction, Context, Predicate, Record, Store,
    TableSchema, TxClient, RESERVED_COLUMNS, VERSION_DATE, VERSION_RECORD, VERSION_TABLE,
    VERSION_USER,
};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use types::Timestamp;

const CREATE_SYNC_LOG_SQL: &str = "
    CREATE TABLE IF NOT EXISTS sync_log (
        uuid        TEXT PRIMARY KEY,
        client_date INTEGER,
        sync_date   INTEGER NOT NULL,
        status      TEXT NOT NULL,
        data        TEXT,
        error_msg   TEXT
    )
";

pub struct SyncServer {
    store: Arc<Store>,
}

impl SyncServer {
    pub fn new(store: Arc<Store>) -> Result<Self> {
        let ctx = Context::anonymous();
        store.unsafe_scope(&ctx, |s| s.execute_batch(CREATE_SYNC_LOG_SQL))?;
        Ok(SyncServer { store })
    }

    pub fn store(&self) -> &Arc<Store> {
        &self.store
    }

    /// Apply an uploaded change-set. Never propagates apply failures to the
    /// caller: they're recorded in `sync_log` and surfaced as
    /// [UploadOutcome::NeedsRefresh].
    pub fn apply(&self, actor: Option<&str>, changeset: &ChangeSet) -> Result<UploadOutcome> {
        let ctx = match actor {
            Some(a) => Context::new(a),
            None => Context::anonymous(),
        };
        let t = changeset.adjusted_date();
        let result = self.store.transaction::<_, Error>(&ctx, |tx| {
            if sync_log_contains(tx, &changeset.uuid)? {
                debug!("change-set {} already applied", changeset.uuid);
                return Ok(UploadOutcome::AlreadyApplied);
            }
            write_sync_log(tx, changeset, "todo", None)?;
            for change in &changeset.changes {
                apply_change(tx, &ctx, change, t)?;
            }
            set_sync_log_status(tx, &changeset.uuid, "done", None)?;
            Ok(UploadOutcome::Applied)
        });
        match result {
            Ok(outcome) => Ok(outcome),
            Err(e) => {
                warn!("change-set {} failed to apply: {}", changeset.uuid, e);
                // The transaction rolled back, taking the todo row with it;
                // record the failure so the uuid is never applied again.
                let msg = e.to_string();
                self.store.transaction::<_, Error>(&ctx, |tx| {
                    write_sync_log(tx, changeset, "error", Some(&msg))?;
                    Ok(())
                })?;
                Ok(UploadOutcome::NeedsRefresh)
            }
        }
    }

    pub fn schema_version(&self) -> Result<i64> {
        Ok(self.store.schema_version()?)
    }

    pub fn schema(&self) -> Result<Vec<TableSchema>> {
        let catalog = self.store.catalog()?;
        Ok(catalog.tables().cloned().collect())
    }

    pub fn table_versions(&self) -> Result<HashMap<String, i64>> {
        Ok(self.store.all_table_versions()?.into_iter().collect())
    }

    /// Rows of `table` changed after `since`. For view-of-tables the filter
    /// is an OR across the explicitly configured per-sub-table version
    /// columns.
    pub fn changed_rows(&self, table: &str, since: i64) -> Result<Vec<Record>> {
        let catalog = self.store.catalog()?;
        let schema = catalog.table(table)?;
        let predicate = if schema.view_of.is_empty() {
            Predicate::gt(VERSION_TABLE, since)
        } else {
            Predicate::Or(
                schema
                    .view_of
                    .iter()
                    .map(|v| Predicate::gt(v.version_column.clone(), since))
                    .collect(),
            )
        };
        let ctx = Context::anonymous();
        Ok(self
            .store
            .search(&ctx, table, &predicate, None, None, None, None)?)
    }

    pub fn tombstones(&self, table: &str, since: i64) -> Result<Vec<Tombstone>> {
        Ok(self.store.tombstones_since(table, since)?)
    }
}

fn sync_log_contains(tx: &TxClient<'_>, uuid: &str) -> Result<bool> {
    Ok(!tx
        .search("sync_log", &Predicate::eq("uuid", uuid), None, None, None, Some(1))?
        .is_empty())
}

fn write_sync_log(
    tx: &TxClient<'_>,
    changeset: &ChangeSet,
    status: &str,
    error_msg: Option<&str>,
) -> Result<()> {
    let mut rec = Record::new();
    rec.insert("uuid".into(), Value::String(changeset.uuid.clone()));
    rec.insert(
        "client_date".into(),
        Value::from(changeset.client_date.as_millis_i64()),
    );
    rec.insert(
        "sync_date".into(),
        Value::from(Timestamp::now().as_millis_i64()),
    );
    rec.insert("status".into(), Value::String(status.into()));
    rec.insert(
        "data".into(),
        Value::String(serde_json::to_string(&changeset.changes)?),
    );
    rec.insert(
        "error_msg".into(),
        error_msg.map_or(Value::Null, |m| Value::String(m.into())),
    );
    tx.insert("sync_log", &rec)?;
    Ok(())
}

fn set_sync_log_status(
    tx: &TxClient<'_>,
    uuid: &str,
    status: &str,
    error_msg: Option<&str>,
) -> Result<()> {
    let mut rec = Record::new();
    rec.insert("uuid".into(), Value::String(uuid.into()));
    rec.insert("status".into(), Value::String(status.into()));
    rec.insert(
        "error_msg".into(),
        error_msg.map_or(Value::Null, |m| Value::String(m.into())),
    );
    tx.update("sync_log", &rec)?;
    Ok(())
}

/// Strip the client's version bookkeeping and stamp the adjusted date; the
/// server's own trackers assign version_record/version_table.
fn prepare_for_apply(record: &mut Record, t: Timestamp) {
    record.remove(VERSION_RECORD);
    record.remove(VERSION_TABLE);
    record.remove(VERSION_USER);
    record.insert(VERSION_DATE.into(), Value::from(t.as_millis_i64()));
}

fn apply_change(tx: &TxClient<'_>, ctx: &Context, change: &ChangeRequest, t: Timestamp) -> Result<()> {
    let catalog = tx.catalog()?;
    let schema = catalog.table(&change.table)?.clone();

    match change.action {
        ChangeRequestAction::RemoveWhere => {
            let conditions = change.conditions.as_ref().ok_or_else(|| {
                Error::MalformedPayload(format!("removeWhere on {} without conditions", change.table))
            })?;
            // The WHERE evaluates against current server state.
            tx.remove_where(&change.table, conditions)?;
            Ok(())
        }
        ChangeRequestAction::Remove => {
            let record = required_record(change)?;
            let pk = Value::Object(record.clone());
            if tx.get_raw(&change.table, &pk)?.is_none() {
                debug!("remove of missing row on {}; skipping", change.table);
                return Ok(());
            }
            tx.remove(&change.table, &pk)?;
            Ok(())
        }
        ChangeRequestAction::Insert | ChangeRequestAction::Update | ChangeRequestAction::Auto => {
            apply_upsert(tx, ctx, change, &schema, t)
        }
    }
}

fn required_record(change: &ChangeRequest) -> Result<&Record> {
    change.record.as_ref().ok_or_else(|| {
        Error::MalformedPayload(format!("change on {} without a record", change.table))
    })
}

fn apply_upsert(
    tx: &TxClient<'_>,
    ctx: &Context,
    change: &ChangeRequest,
    schema: &TableSchema,
    t: Timestamp,
) -> Result<()> {
    let incoming = required_record(change)?;
    let has_pk = schema
        .pk
        .iter()
        .all(|c| incoming.get(c).map_or(false, |v| !v.is_null()));

    // No pk supplied: only an insert makes sense, and it can't conflict.
    if !has_pk {
        if change.action == ChangeRequestAction::Update {
            return Err(Error::MalformedPayload(format!(
                "update on {} without a full primary key",
                change.table
            )));
        }
        let mut rec = incoming.clone();
        prepare_for_apply(&mut rec, t);
        tx.insert(&change.table, &rec)?;
        return Ok(());
    }

    let pk_value = Value::Object(
        schema
            .pk
            .iter()
            .map(|c| (c.clone(), incoming.get(c).cloned().unwrap_or(Value::Null)))
            .collect(),
    );
    let uid = table_uid(schema, incoming)?;

    let server_row = tx.get_raw(&change.table, &pk_value)?;
    let server_row = match server_row {
        None => {
            if change.action == ChangeRequestAction::Update
                && tx.tombstone_exists(&change.table, &uid)?
            {
                // Updating a row someone else deleted: the delete wins.
                debug!("update of tombstoned {}/{}; dropping", change.table, uid);
                return Ok(());
            }
            // Insert, or an update upgraded to one.
            let mut rec = incoming.clone();
            prepare_for_apply(&mut rec, t);
            tx.insert(&change.table, &rec)?;
            return Ok(());
        }
        Some(row) => row,
    };

    let incoming_vr = incoming
        .get(VERSION_RECORD)
        .and_then(Value::as_i64)
        .unwrap_or(0);
    let server_vr = server_row
        .get(VERSION_RECORD)
        .and_then(Value::as_i64)
        .unwrap_or(0);

    if incoming_vr > server_vr {
        // The uploader saw a newer record than we hold; it wins outright.
        let mut rec = incoming.clone();
        prepare_for_apply(&mut rec, t);
        tx.update(&change.table, &rec)?;
        return Ok(());
    }

    // The set of columns where the incoming value actually differs from the
    // current one (reserved and masked columns excluded).
    let conflicting: Vec<(&String, &Value)> = incoming
        .iter()
        .filter(|(col, _)| {
            !schema.pk.contains(*col)
                && !RESERVED_COLUMNS.contains(&col.as_str())
                && !tx.is_masked(&change.table, col)
        })
        .filter(|(col, value)| {
            value_repr(value) != server_row.get(*col).and_then(value_repr)
        })
        .collect();

    if conflicting.is_empty() {
        return Ok(());
    }

    let row_date = server_row
        .get(VERSION_DATE)
        .and_then(Value::as_i64)
        .map(|ms| Timestamp(ms.max(0) as u64))
        .unwrap_or_default();

    let mut winners = Record::new();
    if change.action == ChangeRequestAction::Insert {
        // A conflicting insert: the row already exists. Columns whose
        // current stamp is newer than T keep their value; the incoming
        // value is preserved as an audit transition at T.
        let server_vt = server_row
            .get(VERSION_TABLE)
            .and_then(Value::as_i64)
            .unwrap_or(0);
        for (col, value) in conflicting {
            if row_date > t {
                tx.insert_history_entry(&HistoryEntry {
                    table_name: change.table.clone(),
                    table_uid: uid.clone(),
                    column_name: col.clone(),
                    column_before: value_repr(value),
                    column_after: server_row.get(col).and_then(value_repr),
                    version_record: server_vr,
                    version_table: server_vt,
                    version_date: t,
                    version_user: ctx.actor.clone(),
                })?;
            } else {
                winners.insert(col.clone(), value.clone());
            }
        }
    } else {
        // Late-arriving update: consult the per-column history at or past
        // the incoming version_record.
        let history = tx.history_since(&change.table, &uid, incoming_vr)?;
        for (col, value) in conflicting {
            let col_history: Vec<&HistoryEntry> = history
                .iter()
                .filter(|h| &h.column_name == col)
                .collect();
            if col_history.is_empty() {
                // Nothing recorded since the incoming version: fall back to
                // the row's own stamp.
                if row_date <= t {
                    winners.insert(col.clone(), value.clone());
                } else {
                    tx.insert_history_entry(&HistoryEntry {
                        table_name: change.table.clone(),
                        table_uid: uid.clone(),
                        column_name: col.clone(),
                        column_before: value_repr(value),
                        column_after: server_row.get(col).and_then(value_repr),
                        version_record: server_vr,
                        version_table: server_row
                            .get(VERSION_TABLE)
                            .and_then(Value::as_i64)
                            .unwrap_or(0),
                        version_date: t,
                        version_user: ctx.actor.clone(),
                    })?;
                }
            } else if col_history.iter().any(|h| h.version_date <= t) {
                // The recorded change is older than ours; we win.
                winners.insert(col.clone(), value.clone());
            } else {
                // The history is newer than our change: splice ourselves in
                // *before* the earliest newer transition. Rewriting its
                // column_before and inserting the old_before -> incoming
                // transition at T (same version counters, earlier date)
                // keeps the (version_table, version_record, version_date)
                // order reading old -> incoming -> current.
                let existing = col_history[0];
                tx.insert_history_entry(&HistoryEntry {
                    column_before: existing.column_before.clone(),
                    column_after: value_repr(value),
                    version_date: t,
                    version_user: ctx.actor.clone(),
                    ..existing.clone()
                })?;
                tx.set_history_before(existing, value_repr(value).as_deref())?;
            }
        }
    }

    if !winners.is_empty() {
        for col in &schema.pk {
            winners.insert(col.clone(), incoming.get(col).cloned().unwrap_or(Value::Null));
        }
        winners.insert(VERSION_DATE.into(), Value::from(t.as_millis_i64()));
        tx.update(&change.table, &winners)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use recstore::StoreBuilder;
    use serde_json::json;

    fn record(v: Value) -> Record {
        serde_json::from_value(v).unwrap()
    }

    fn new_server(name: &str) -> SyncServer {
        let _ = env_logger::try_init();
        let store = Arc::new(StoreBuilder::in_memory(name).open().unwrap());
        let ctx = Context::anonymous();
        store
            .unsafe_scope(&ctx, |s| {
                s.execute_batch("CREATE TABLE foo (id TEXT PRIMARY KEY, c TEXT, d TEXT)")
            })
            .unwrap();
        store.prepare_tracking().unwrap();
        SyncServer::new(store).unwrap()
    }

    fn upload(server: &SyncServer, uuid: &str, client_date: Timestamp, changes: Vec<ChangeRequest>) -> UploadOutcome {
        let mut cs = ChangeSet::new(client_date, 0, changes);
        cs.uuid = uuid.to_string();
        server.apply(Some("remote"), &cs).unwrap()
    }

    #[test]
    fn test_idempotent_upload() {
        let server = new_server("server-idem");
        let changes = vec![ChangeRequest::insert(
            "foo",
            record(json!({"id": "a", "c": "x"})),
        )];
        let first = upload(&server, "U1", Timestamp::now(), changes.clone());
        assert_eq!(first, UploadOutcome::Applied);
        let second = upload(&server, "U1", Timestamp::now(), changes);
        assert_eq!(second, UploadOutcome::AlreadyApplied);
        assert!(!second.should_refresh());

        // Exactly one sync_log row, status done.
        let ctx = Context::anonymous();
        let logs = server
            .store()
            .search(&ctx, "sync_log", &Predicate::eq("uuid", "U1"), None, None, None, None)
            .unwrap();
        assert_eq!(logs.len(), 1);
        assert_eq!(logs[0].get("status"), Some(&json!("done")));
        // And the row was applied once.
        let row = server
            .store()
            .get_by_pk(&ctx, "foo", &json!("a"), None)
            .unwrap()
            .unwrap();
        assert_eq!(row.get("version_record"), Some(&json!(0)));
    }

    #[test]
    fn test_failed_upload_logs_error_and_stays_idempotent() {
        let server = new_server("server-err");
        // Updating a table that doesn't exist fails the whole batch.
        let changes = vec![ChangeRequest::insert(
            "no_such_table",
            record(json!({"id": "a"})),
        )];
        let outcome = upload(&server, "U2", Timestamp::now(), changes.clone());
        assert_eq!(outcome, UploadOutcome::NeedsRefresh);
        assert!(outcome.should_refresh());

        let ctx = Context::anonymous();
        let logs = server
            .store()
            .search(&ctx, "sync_log", &Predicate::eq("uuid", "U2"), None, None, None, None)
            .unwrap();
        assert_eq!(logs.len(), 1);
        assert_eq!(logs[0].get("status"), Some(&json!("error")));
        assert!(logs[0].get("error_msg").unwrap().is_string());

        // A retry with the same uuid is a no-op, not a second failure.
        let retry = upload(&server, "U2", Timestamp::now(), changes);
        assert_eq!(retry, UploadOutcome::AlreadyApplied);
    }

    #[test]
    fn test_last_writer_wins_with_reorder() {
        let server = new_server("server-lww");
        let ctx = Context::new("local");
        // The row is born, then updated to "S" - that update is the history
        // entry stamped at (wall-clock) T2.
        server
            .store()
            .insert(&ctx, "foo", &record(json!({"id": "a", "c": "initial"})))
            .unwrap();
        server
            .store()
            .update(&ctx, "foo", &record(json!({"id": "a", "c": "S"})))
            .unwrap();

        // A client that last saw version_record 0 uploads {c: "C"} with an
        // adjusted timestamp T1 well before T2.
        let t1 = Timestamp(Timestamp::now().as_millis() - 60_000);
        let outcome = upload(
            &server,
            "U3",
            t1,
            vec![ChangeRequest::update(
                "foo",
                record(json!({"id": "a", "c": "C", "version_record": 0})),
            )],
        );
        assert_eq!(outcome, UploadOutcome::Applied);

        // The row is unchanged: the later server write wins.
        let row = server
            .store()
            .get_by_pk(&ctx, "foo", &json!("a"), None)
            .unwrap()
            .unwrap();
        assert_eq!(row.get("c"), Some(&json!("S")));

        // But the history now reads initial -> C -> S.
        let history = server.store().history_since("foo", "a", 0).unwrap();
        let c_history: Vec<_> = history.iter().filter(|h| h.column_name == "c").collect();
        assert_eq!(c_history.len(), 2);
        assert_eq!(c_history[0].column_before.as_deref(), Some("initial"));
        assert_eq!(c_history[0].column_after.as_deref(), Some("C"));
        assert_eq!(c_history[0].version_date, t1);
        assert_eq!(c_history[1].column_before.as_deref(), Some("C"));
        assert_eq!(c_history[1].column_after.as_deref(), Some("S"));
        assert!(c_history[1].version_date > t1);
    }

    #[test]
    fn test_newer_client_wins() {
        let server = new_server("server-newer");
        let ctx = Context::new("local");
        server
            .store()
            .insert(&ctx, "foo", &record(json!({"id": "a", "c": "old"})))
            .unwrap();

        // The client is at version_record 1 (it saw an update we never
        // got); it wins outright.
        let outcome = upload(
            &server,
            "U4",
            Timestamp::now(),
            vec![ChangeRequest::update(
                "foo",
                record(json!({"id": "a", "c": "new", "version_record": 1})),
            )],
        );
        assert_eq!(outcome, UploadOutcome::Applied);
        let row = server
            .store()
            .get_by_pk(&ctx, "foo", &json!("a"), None)
            .unwrap()
            .unwrap();
        assert_eq!(row.get("c"), Some(&json!("new")));
        assert_eq!(row.get("version_record"), Some(&json!(1)));
    }

    #[test]
    fn test_update_of_tombstoned_row_is_dropped() {
        let server = new_server("server-tomb");
        let ctx = Context::new("local");
        server
            .store()
            .insert(&ctx, "foo", &record(json!({"id": "a", "c": "x"})))
            .unwrap();
        server.store().remove(&ctx, "foo", &json!("a")).unwrap();

        let outcome = upload(
            &server,
            "U5",
            Timestamp::now(),
            vec![ChangeRequest::update(
                "foo",
                record(json!({"id": "a", "c": "resurrected", "version_record": 0})),
            )],
        );
        assert_eq!(outcome, UploadOutcome::Applied);
        assert!(server
            .store()
            .get_by_pk(&ctx, "foo", &json!("a"), None)
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_update_of_unknown_row_upgrades_to_insert() {
        let server = new_server("server-upgrade");
        let ctx = Context::anonymous();
        let outcome = upload(
            &server,
            "U6",
            Timestamp::now(),
            vec![ChangeRequest::update(
                "foo",
                record(json!({"id": "a", "c": "x", "version_record": 3})),
            )],
        );
        assert_eq!(outcome, UploadOutcome::Applied);
        let row = server
            .store()
            .get_by_pk(&ctx, "foo", &json!("a"), None)
            .unwrap()
            .unwrap();
        assert_eq!(row.get("c"), Some(&json!("x")));
        // Freshly inserted on the server: version_record restarts at 0.
        assert_eq!(row.get("version_record"), Some(&json!(0)));
    }

    #[test]
    fn test_conflicting_insert_preserves_newer_columns() {
        let server = new_server("server-confl-insert");
        let ctx = Context::new("local");
        server
            .store()
            .insert(&ctx, "foo", &record(json!({"id": "a", "c": "server", "d": "same"})))
            .unwrap();

        // An insert for the same pk from before the server's write: the
        // server's newer value stays, the incoming one lands in history.
        let t1 = Timestamp(Timestamp::now().as_millis() - 60_000);
        let outcome = upload(
            &server,
            "U7",
            t1,
            vec![ChangeRequest::insert(
                "foo",
                record(json!({"id": "a", "c": "client", "d": "same"})),
            )],
        );
        assert_eq!(outcome, UploadOutcome::Applied);
        let row = server
            .store()
            .get_by_pk(&ctx, "foo", &json!("a"), None)
            .unwrap()
            .unwrap();
        assert_eq!(row.get("c"), Some(&json!("server")));

        let history = server.store().history_since("foo", "a", 0).unwrap();
        let audit: Vec<_> = history.iter().filter(|h| h.column_name == "c").collect();
        assert_eq!(audit.len(), 1);
        assert_eq!(audit[0].column_before.as_deref(), Some("client"));
        assert_eq!(audit[0].column_after.as_deref(), Some("server"));
        assert_eq!(audit[0].version_date, t1);
    }

    #[test]
    fn test_changed_rows_for_view_of_tables() {
        let _ = env_logger::try_init();
        // A view-of table carries one version column per constituent
        // sub-table; selection ORs across them. The version columns come
        // from explicit configuration, never from naming conventions.
        let schema = TableSchema {
            name: "combined".into(),
            columns: vec![],
            pk: vec![],
            fks: vec![],
            view_of: vec![
                recstore::ViewOf {
                    table: "part_a".into(),
                    version_column: "a_version".into(),
                },
                recstore::ViewOf {
                    table: "part_b".into(),
                    version_column: "b_version".into(),
                },
            ],
        };
        let store = Arc::new(
            StoreBuilder::in_memory("server-view-of")
                .schema_overrides(vec![schema])
                .open()
                .unwrap(),
        );
        let ctx = Context::anonymous();
        store
            .unsafe_scope(&ctx, |s| {
                s.execute_batch(
                    "CREATE TABLE combined (id TEXT PRIMARY KEY, val TEXT,
                                            a_version INTEGER, b_version INTEGER);
                     INSERT INTO combined VALUES ('r1', 'x', 1, 1);
                     INSERT INTO combined VALUES ('r2', 'y', 7, 1);
                     INSERT INTO combined VALUES ('r3', 'z', 1, 9);",
                )
            })
            .unwrap();
        let server = SyncServer::new(store).unwrap();

        let rows = server.changed_rows("combined", 5).unwrap();
        let ids: Vec<_> = rows
            .iter()
            .map(|r| r.get("id").unwrap().as_str().unwrap())
            .collect();
        assert_eq!(ids, vec!["r2", "r3"]);
    }

    #[test]
    fn test_remove_of_missing_row_skipped() {
        let server = new_server("server-rm-missing");
        let outcome = upload(
            &server,
            "U8",
            Timestamp::now(),
            vec![ChangeRequest::remove("foo", record(json!({"id": "ghost"})))],
        );
        assert_eq!(outcome, UploadOutcome::Applied);
    }
}
