/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

//! The access client: the connection-scoped object exposing the public
//! operations. One writer connection per [Store], behind a mutex; a
//! [TxClient] is the transaction-scoped clone of the client, and nested
//! transactions are rejected.

use crate::catalog::{statement_is_ddl, Catalog, SchemaCatalog, TableSchema};
use crate::changes::{apply_changes, do_multiread, AppliedChange, ChangeRequest, ReadResult, ReadSpec};
use crate::context::Context;
use crate::db::StoreDb;
use crate::error::*;
use crate::hooks::{AfterFn, BeforeFn, HookRegistry, OpInput, OpKind, OpResult};
use crate::joinfetch::{build_query, run_query, JoinFetch};
use crate::predicate::Predicate;
use crate::query::{column_list, read_record};
use crate::records::{json_to_sql, pk_record, table_uid, Record};
use crate::tracker::{
    ensure_tracking_columns, next_sequence, next_table_version, record_history, record_tombstone,
    stamp_record, TrackedTables, TrackerConfig,
};
use error_support::{debug, warn};
use interrupt_support::{SqlInterruptHandle, SqlInterruptScope};
use parking_lot::{Mutex, MutexGuard};
use rusqlite::Connection;
use serde_json::Value;
use sql_support::ConnExt;
use std::cell::Cell;
use std::collections::HashMap;
use std::path::Path;
use std::sync::mpsc;
use std::sync::Arc;
use std::time::Duration;
use types::Timestamp;

pub const DEFAULT_TRANSACTION_TIMEOUT: Duration = Duration::from_secs(30);

pub(crate) type ViewFn = Box<dyn Fn(&Context) -> String + Send + Sync>;

/// Everything operations need besides the connection. Shared between the
/// store and its transaction clients.
pub(crate) struct StoreState {
    pub catalog: SchemaCatalog,
    pub hooks: HookRegistry,
    pub views: HashMap<String, ViewFn>,
    pub tracker: TrackerConfig,
    pub require_actor: bool,
}

impl StoreState {
    /// The view-rewrite for a table under `ctx`, if one is registered.
    fn resolve_view(&self, ctx: &Context, table: &str) -> Option<String> {
        self.views.get(table).map(|f| f(ctx))
    }
}

pub struct StoreBuilder {
    location: Location,
    overrides: Vec<TableSchema>,
    hooks: HookRegistry,
    views: HashMap<String, ViewFn>,
    tracker: TrackerConfig,
    require_actor: bool,
}

enum Location {
    File(std::path::PathBuf),
    Memory(String),
}

impl StoreBuilder {
    pub fn new(db_path: impl AsRef<Path>) -> Self {
        Self::with_location(Location::File(db_path.as_ref().to_owned()))
    }

    pub fn in_memory(name: &str) -> Self {
        Self::with_location(Location::Memory(name.to_owned()))
    }

    fn with_location(location: Location) -> Self {
        Self {
            location,
            overrides: vec![],
            hooks: HookRegistry::default(),
            views: HashMap::new(),
            tracker: TrackerConfig::default(),
            require_actor: false,
        }
    }

    /// Caller-supplied partial schema, merged column-by-column over the
    /// reflected one.
    pub fn schema_overrides(mut self, tables: Vec<TableSchema>) -> Self {
        self.overrides.extend(tables);
        self
    }

    pub fn tracked_tables(mut self, tables: TrackedTables) -> Self {
        self.tracker.tables = tables;
        self
    }

    /// Exclude `columns` of `table` from history and conflict comparison.
    pub fn mask_columns(mut self, table: &str, columns: &[&str]) -> Self {
        self.tracker
            .masked
            .entry(table.to_string())
            .or_default()
            .extend(columns.iter().map(|c| c.to_string()));
        self
    }

    /// Name the session table so it is never tracked.
    pub fn session_table(mut self, table: &str) -> Self {
        self.tracker.session_table = Some(table.to_string());
        self
    }

    /// When set, mutations without an actor fail instead of stamping a null
    /// `version_user`. This is the production configuration - audit rows
    /// with no actor are holes in the trail.
    pub fn require_actor(mut self, require: bool) -> Self {
        self.require_actor = require;
        self
    }

    pub fn register_before_hook(
        mut self,
        kind: OpKind,
        table: Option<&str>,
        hook: impl Fn(&Context, &mut OpInput<'_>) -> Result<()> + Send + Sync + 'static,
    ) -> Result<Self> {
        self.hooks
            .register_before(kind, table, Box::new(hook) as BeforeFn)?;
        Ok(self)
    }

    pub fn register_after_hook(
        mut self,
        kind: OpKind,
        table: Option<&str>,
        hook: impl Fn(&Context, &str, &mut OpResult) -> Result<()> + Send + Sync + 'static,
    ) -> Result<Self> {
        self.hooks
            .register_after(kind, table, Box::new(hook) as AfterFn)?;
        Ok(self)
    }

    /// Register a SQL expression used in place of `table` in every
    /// SELECT-family query - the row/column authorization seam.
    pub fn register_view(
        mut self,
        table: &str,
        view: impl Fn(&Context) -> String + Send + Sync + 'static,
    ) -> Self {
        self.views.insert(table.to_string(), Box::new(view));
        self
    }

    pub fn open(self) -> Result<Store> {
        let db = match &self.location {
            Location::File(path) => StoreDb::new(path)?,
            Location::Memory(name) => StoreDb::new_memory(name)?,
        };
        let store = Store {
            interrupt_handle: Arc::clone(&db.interrupt_handle),
            db: Mutex::new(db),
            state: Arc::new(StoreState {
                catalog: SchemaCatalog::new(self.overrides),
                hooks: self.hooks,
                views: self.views,
                tracker: self.tracker,
                require_actor: self.require_actor,
            }),
        };
        store.prepare_tracking()?;
        Ok(store)
    }
}

pub struct Store {
    db: Mutex<StoreDb>,
    // Kept outside the mutex so a stuck connection can be interrupted.
    interrupt_handle: Arc<SqlInterruptHandle>,
    state: Arc<StoreState>,
}

thread_local! {
    // Set while this thread is inside `transaction()`; used to reject
    // nesting (and the deadlock it would otherwise become).
    static IN_TRANSACTION: Cell<bool> = const { Cell::new(false) };
}

impl Store {
    /// Add the reserved version columns to tracked tables that miss them.
    /// Runs on open; call it again after creating tables through the unsafe
    /// scope.
    pub fn prepare_tracking(&self) -> Result<()> {
        let db = self.lock_db()?;
        let catalog = self.state.catalog.load(&db)?;
        if ensure_tracking_columns(&db, &catalog, &self.state.tracker)? {
            self.state.catalog.invalidate();
        }
        Ok(())
    }

    /// Run a read-only closure against the locked connection (the history
    /// accessors use this).
    pub(crate) fn with_conn<T>(&self, f: impl FnOnce(&Connection) -> Result<T>) -> Result<T> {
        let db = self.lock_db()?;
        f(&db.writer)
    }

    fn lock_db(&self) -> Result<MutexGuard<'_, StoreDb>> {
        if IN_TRANSACTION.with(|c| c.get()) {
            // The same thread already holds the connection inside
            // `transaction()`; use the TxClient it was handed.
            return Err(Error::NestedTransaction);
        }
        Ok(self.db.lock())
    }

    pub fn interrupt(&self) {
        // Deliberately does not take the db lock - interrupting is how you
        // get a stuck connection back.
        self.interrupt_handle.interrupt();
    }

    /// The current schema version (db_version row or surrogate).
    pub fn schema_version(&self) -> Result<i64> {
        let db = self.lock_db()?;
        self.state.catalog.version(&db)
    }

    pub fn catalog(&self) -> Result<Arc<Catalog>> {
        let db = self.lock_db()?;
        self.state.catalog.load(&db)
    }

    /// Merge more schema overrides (the sync download path uses this after
    /// refetching the server's schema).
    pub fn add_schema_overrides(&self, tables: Vec<TableSchema>) -> Result<()> {
        self.state.catalog.add_overrides(tables);
        let db = self.lock_db()?;
        let catalog = self.state.catalog.load(&db)?;
        if ensure_tracking_columns(&db, &catalog, &self.state.tracker)? {
            self.state.catalog.invalidate();
        }
        Ok(())
    }

    pub fn get_by_pk(
        &self,
        ctx: &Context,
        table: &str,
        pk: &Value,
        joins: Option<&[JoinFetch]>,
    ) -> Result<Option<Record>> {
        let db = self.lock_db()?;
        let scope = db.interrupt_handle.begin_interrupt_scope();
        ops::get_by_pk(&db, &self.state, ctx, &scope, table, pk, joins)
    }

    pub fn search(
        &self,
        ctx: &Context,
        table: &str,
        predicate: &Predicate,
        joins: Option<&[JoinFetch]>,
        order_by: Option<&str>,
        offset: Option<u64>,
        limit: Option<u64>,
    ) -> Result<Vec<Record>> {
        let db = self.lock_db()?;
        let scope = db.interrupt_handle.begin_interrupt_scope();
        ops::search(
            &db, &self.state, ctx, &scope, table, predicate, joins, order_by, offset, limit,
        )
    }

    pub fn search_first(
        &self,
        ctx: &Context,
        table: &str,
        predicate: &Predicate,
        joins: Option<&[JoinFetch]>,
        order_by: Option<&str>,
    ) -> Result<Option<Record>> {
        let db = self.lock_db()?;
        let scope = db.interrupt_handle.begin_interrupt_scope();
        ops::search_first(&db, &self.state, ctx, &scope, table, predicate, joins, order_by)
    }

    pub fn insert(&self, ctx: &Context, table: &str, record: &Record) -> Result<Record> {
        let db = self.lock_db()?;
        let tx = db.unchecked_transaction_imm()?;
        let result = ops::insert(&tx, &self.state, ctx, table, record)?;
        tx.commit()?;
        Ok(result)
    }

    /// Insert a batch in one transaction; returns the inserted records with
    /// generated columns populated.
    pub fn insert_all(&self, ctx: &Context, table: &str, records: &[Record]) -> Result<Vec<Record>> {
        let db = self.lock_db()?;
        let tx = db.unchecked_transaction_imm()?;
        let mut out = Vec::with_capacity(records.len());
        for record in records {
            out.push(ops::insert(&tx, &self.state, ctx, table, record)?);
        }
        tx.commit()?;
        Ok(out)
    }

    pub fn update(&self, ctx: &Context, table: &str, record: &Record) -> Result<Record> {
        let db = self.lock_db()?;
        let tx = db.unchecked_transaction_imm()?;
        let result = ops::update(&tx, &self.state, ctx, table, record)?;
        tx.commit()?;
        Ok(result)
    }

    pub fn remove(&self, ctx: &Context, table: &str, pk: &Value) -> Result<()> {
        let db = self.lock_db()?;
        let tx = db.unchecked_transaction_imm()?;
        ops::remove(&tx, &self.state, ctx, table, pk)?;
        tx.commit()?;
        Ok(())
    }

    pub fn remove_where(
        &self,
        ctx: &Context,
        table: &str,
        predicate: &Predicate,
    ) -> Result<u64> {
        let db = self.lock_db()?;
        let scope = db.interrupt_handle.begin_interrupt_scope();
        let tx = db.unchecked_transaction_imm()?;
        let count = ops::remove_where(&tx, &self.state, ctx, &scope, table, predicate)?;
        tx.commit()?;
        Ok(count)
    }

    /// Run several reads against one consistent connection state.
    pub fn multiread(
        &self,
        ctx: &Context,
        reads: &HashMap<String, ReadSpec>,
    ) -> Result<HashMap<String, ReadResult>> {
        let db = self.lock_db()?;
        let scope = db.interrupt_handle.begin_interrupt_scope();
        do_multiread(&db, &self.state, ctx, &scope, reads)
    }

    /// Apply an ordered batch of writes in one transaction, with `auto`
    /// resolution and `${table.field}` token substitution.
    pub fn changes(&self, ctx: &Context, changes: &[ChangeRequest]) -> Result<Vec<AppliedChange>> {
        self.transaction(ctx, |tx| tx.changes(changes))
    }

    pub fn transaction<T, E>(
        &self,
        ctx: &Context,
        f: impl FnOnce(&TxClient<'_>) -> std::result::Result<T, E>,
    ) -> std::result::Result<T, E>
    where
        E: From<Error>,
    {
        self.transaction_with_timeout(ctx, DEFAULT_TRANSACTION_TIMEOUT, f)
    }

    /// Open a transaction on the writer connection and hand `f` the
    /// transaction-scoped client. Commits when `f` returns Ok, rolls back on
    /// Err. A watchdog interrupts the connection when `timeout` expires
    /// (zero disables) and the caller gets a timeout error after rollback.
    /// Generic over the caller's error type, like the ConnExt helpers.
    pub fn transaction_with_timeout<T, E>(
        &self,
        ctx: &Context,
        timeout: Duration,
        f: impl FnOnce(&TxClient<'_>) -> std::result::Result<T, E>,
    ) -> std::result::Result<T, E>
    where
        E: From<Error>,
    {
        let db = self.lock_db().map_err(E::from)?;
        IN_TRANSACTION.with(|c| c.set(true));
        let result = Self::run_transaction(&db, &self.state, ctx, timeout, f);
        IN_TRANSACTION.with(|c| c.set(false));
        result
    }

    fn run_transaction<T, E>(
        db: &StoreDb,
        state: &Arc<StoreState>,
        ctx: &Context,
        timeout: Duration,
        f: impl FnOnce(&TxClient<'_>) -> std::result::Result<T, E>,
    ) -> std::result::Result<T, E>
    where
        E: From<Error>,
    {
        let tx = db
            .unchecked_transaction_imm()
            .map_err(|e| E::from(Error::from(e)))?;
        let watchdog = Watchdog::arm(Arc::clone(&db.interrupt_handle), timeout);
        let txc = TxClient {
            conn: &db.writer,
            state,
            ctx: ctx.clone(),
            scope: db.interrupt_handle.begin_interrupt_scope(),
        };
        let body = f(&txc);
        let timed_out = watchdog.map_or(false, Watchdog::disarm);
        match body {
            Ok(v) if !timed_out => {
                tx.commit().map_err(|e| E::from(Error::from(e)))?;
                Ok(v)
            }
            Ok(_) => {
                // The deadline passed while the body was finishing; honor it.
                let _ = tx.rollback();
                Err(E::from(Error::TransactionTimeout))
            }
            Err(e) => {
                let _ = tx.rollback();
                if timed_out {
                    warn!("transaction timed out and was rolled back");
                    Err(E::from(Error::TransactionTimeout))
                } else {
                    Err(e)
                }
            }
        }
    }

    /// Temporary privilege escalation: raw SQL, with the view rewrites
    /// bypassed. DDL statements invalidate the schema catalog.
    pub fn unsafe_scope<T>(
        &self,
        ctx: &Context,
        f: impl FnOnce(&UnsafeScope<'_>) -> Result<T>,
    ) -> Result<T> {
        let _ = ctx; // the escalation is per-call; the actor is not recorded
        let db = self.lock_db()?;
        let scope = UnsafeScope {
            conn: &db.writer,
            state: &self.state,
        };
        f(&scope)
    }
}

/// The watchdog that enforces transaction timeouts: a thread parked on a
/// channel; when the receive times out before being cancelled it interrupts
/// the connection.
struct Watchdog {
    fired: Arc<std::sync::atomic::AtomicBool>,
    cancel: mpsc::Sender<()>,
    thread: std::thread::JoinHandle<()>,
}

impl Watchdog {
    fn arm(handle: Arc<SqlInterruptHandle>, timeout: Duration) -> Option<Watchdog> {
        if timeout.is_zero() {
            return None;
        }
        let fired = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let fired2 = Arc::clone(&fired);
        let (cancel, cancel_rx) = mpsc::channel();
        let thread = std::thread::spawn(move || {
            if let Err(mpsc::RecvTimeoutError::Timeout) = cancel_rx.recv_timeout(timeout) {
                debug!("transaction watchdog fired; interrupting the connection");
                fired2.store(true, std::sync::atomic::Ordering::SeqCst);
                handle.interrupt();
            }
        });
        Some(Watchdog {
            fired,
            cancel,
            thread,
        })
    }

    /// Stop the watchdog; returns whether it had already fired.
    fn disarm(self) -> bool {
        let _ = self.cancel.send(());
        let _ = self.thread.join();
        self.fired.load(std::sync::atomic::Ordering::SeqCst)
    }
}

/// The transaction-scoped client. Deliberately has no `transaction` method:
/// nesting is rejected at the type level (and `Store` rejects a re-entrant
/// call on the same thread at runtime).
pub struct TxClient<'a> {
    pub(crate) conn: &'a Connection,
    pub(crate) state: &'a Arc<StoreState>,
    pub(crate) ctx: Context,
    pub(crate) scope: SqlInterruptScope,
}

impl<'a> TxClient<'a> {
    pub fn context(&self) -> &Context {
        &self.ctx
    }

    pub fn get_by_pk(
        &self,
        table: &str,
        pk: &Value,
        joins: Option<&[JoinFetch]>,
    ) -> Result<Option<Record>> {
        ops::get_by_pk(self.conn, self.state, &self.ctx, &self.scope, table, pk, joins)
    }

    pub fn search(
        &self,
        table: &str,
        predicate: &Predicate,
        joins: Option<&[JoinFetch]>,
        order_by: Option<&str>,
        offset: Option<u64>,
        limit: Option<u64>,
    ) -> Result<Vec<Record>> {
        ops::search(
            self.conn, self.state, &self.ctx, &self.scope, table, predicate, joins, order_by,
            offset, limit,
        )
    }

    pub fn search_first(
        &self,
        table: &str,
        predicate: &Predicate,
        joins: Option<&[JoinFetch]>,
        order_by: Option<&str>,
    ) -> Result<Option<Record>> {
        ops::search_first(
            self.conn, self.state, &self.ctx, &self.scope, table, predicate, joins, order_by,
        )
    }

    pub fn insert(&self, table: &str, record: &Record) -> Result<Record> {
        ops::insert(self.conn, self.state, &self.ctx, table, record)
    }

    pub fn update(&self, table: &str, record: &Record) -> Result<Record> {
        ops::update(self.conn, self.state, &self.ctx, table, record)
    }

    pub fn remove(&self, table: &str, pk: &Value) -> Result<()> {
        ops::remove(self.conn, self.state, &self.ctx, table, pk)
    }

    pub fn remove_where(&self, table: &str, predicate: &Predicate) -> Result<u64> {
        ops::remove_where(self.conn, self.state, &self.ctx, &self.scope, table, predicate)
    }

    pub fn changes(&self, changes: &[ChangeRequest]) -> Result<Vec<AppliedChange>> {
        apply_changes(self.conn, self.state, &self.ctx, &self.scope, changes)
    }

    pub fn multiread(
        &self,
        reads: &HashMap<String, ReadSpec>,
    ) -> Result<HashMap<String, ReadResult>> {
        do_multiread(self.conn, self.state, &self.ctx, &self.scope, reads)
    }

    pub fn catalog(&self) -> Result<Arc<Catalog>> {
        self.state.catalog.load(self.conn)
    }

    /// Read the stored row by pk, bypassing hooks and view rewrites. This
    /// is for engines that reconcile against the true state (the sync
    /// server); application reads go through [TxClient::get_by_pk].
    pub fn get_raw(&self, table: &str, pk: &Value) -> Result<Option<Record>> {
        let catalog = self.state.catalog.load(self.conn)?;
        let schema = catalog.table(table)?;
        let pk_rec = ops::normalize_pk(schema, pk)?;
        ops::read_row_by_pk(self.conn, schema, &pk_rec)
    }

    /// Whether `column` of `table` is masked (excluded from history and
    /// conflict comparison).
    pub fn is_masked(&self, table: &str, column: &str) -> bool {
        self.state.tracker.is_masked(table, column)
    }

    pub fn err_if_interrupted(&self) -> Result<()> {
        Ok(self.scope.err_if_interrupted()?)
    }
}

/// Raw-SQL escape hatch handed out by [Store::unsafe_scope].
pub struct UnsafeScope<'a> {
    conn: &'a Connection,
    state: &'a Arc<StoreState>,
}

impl<'a> UnsafeScope<'a> {
    pub fn execute(&self, sql: &str, params: &[Value]) -> Result<usize> {
        let bound: Vec<_> = params.iter().map(json_to_sql).collect();
        let count = self
            .conn
            .execute(sql, rusqlite::params_from_iter(bound.iter()))?;
        if statement_is_ddl(sql) {
            self.state.catalog.invalidate();
        }
        Ok(count)
    }

    pub fn execute_batch(&self, sql: &str) -> Result<()> {
        self.conn.execute_batch(sql)?;
        if statement_is_ddl(sql) {
            self.state.catalog.invalidate();
        }
        Ok(())
    }

    /// Run a raw query; rows come back keyed by the statement's column
    /// names.
    pub fn query(&self, sql: &str, params: &[Value]) -> Result<Vec<Record>> {
        let bound: Vec<_> = params.iter().map(json_to_sql).collect();
        let mut stmt = self.conn.prepare(sql)?;
        let names: Vec<String> = stmt.column_names().iter().map(|s| s.to_string()).collect();
        let mut rows = stmt.query(rusqlite::params_from_iter(bound.iter()))?;
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            let mut rec = Record::new();
            for (i, name) in names.iter().enumerate() {
                rec.insert(name.clone(), crate::records::sql_to_json(row.get_ref(i)?));
            }
            out.push(rec);
        }
        Ok(out)
    }
}

/// The operations themselves, shared by [Store] and [TxClient].
pub(crate) mod ops {
    use super::*;

    fn expect_record(result: OpResult) -> Result<Record> {
        match result {
            OpResult::Record(r) => Ok(r),
            _ => Err(Error::InvalidPredicate(
                "an after hook replaced the result with the wrong shape".into(),
            )),
        }
    }

    fn check_actor(state: &StoreState, ctx: &Context) -> Result<()> {
        if state.require_actor && !ctx.is_passthrough() && ctx.actor.is_none() {
            return Err(Error::MissingActor);
        }
        Ok(())
    }

    /// Normalize the `pk` argument (scalar, array or object) into a record
    /// of pk columns.
    pub(crate) fn normalize_pk(schema: &TableSchema, pk: &Value) -> Result<Record> {
        let mut rec = Record::new();
        match pk {
            Value::Object(obj) => {
                return pk_record(schema, obj);
            }
            Value::Array(items) => {
                if items.len() != schema.pk.len() {
                    return Err(Error::MissingPrimaryKey {
                        table: schema.name.clone(),
                        column: schema.pk.get(items.len()).cloned().unwrap_or_default(),
                    });
                }
                for (col, v) in schema.pk.iter().zip(items) {
                    rec.insert(col.clone(), v.clone());
                }
            }
            scalar => {
                if schema.pk.len() != 1 {
                    return Err(Error::MissingPrimaryKey {
                        table: schema.name.clone(),
                        column: schema.pk.get(1).cloned().unwrap_or_default(),
                    });
                }
                rec.insert(schema.pk[0].clone(), scalar.clone());
            }
        }
        pk_record(schema, &rec)
    }

    /// Read the real row (no view rewrite) by pk - the trackers diff
    /// against the stored values, not the authorized projection.
    pub(crate) fn read_row_by_pk(
        conn: &Connection,
        schema: &TableSchema,
        pk: &Record,
    ) -> Result<Option<Record>> {
        let where_sql = schema
            .pk
            .iter()
            .map(|c| format!("t.\"{}\" = ?", c))
            .collect::<Vec<_>>()
            .join(" AND ");
        let sql = format!(
            "SELECT {} FROM \"{}\" AS t WHERE {}",
            column_list(schema, "t"),
            schema.name,
            where_sql
        );
        let params: Vec<_> = schema
            .pk
            .iter()
            .map(|c| json_to_sql(pk.get(c).unwrap_or(&Value::Null)))
            .collect();
        conn.try_query_row(
            &sql,
            rusqlite::params_from_iter(params.iter()),
            |row| read_record(row, schema, 0),
            true,
        )
    }

    pub fn get_by_pk(
        conn: &Connection,
        state: &StoreState,
        ctx: &Context,
        scope: &SqlInterruptScope,
        table: &str,
        pk: &Value,
        joins: Option<&[JoinFetch]>,
    ) -> Result<Option<Record>> {
        let catalog = state.catalog.load(conn)?;
        let schema = catalog.table(table)?;
        let mut pk_rec = normalize_pk(schema, pk)?;
        state.hooks.run_before(
            ctx,
            OpKind::GetByPk,
            &mut OpInput {
                table,
                record: Some(&mut pk_rec),
                predicate: None,
            },
        )?;
        let predicate = Predicate::all_of(&pk_rec);
        let plan = build_query(
            &catalog,
            &|t| state.resolve_view(ctx, t),
            table,
            &predicate,
            joins.unwrap_or(&[]),
            None,
            None,
            None,
        )?;
        let rows = run_query(conn, &plan, scope)?;
        let mut result = OpResult::MaybeRecord(rows.into_iter().next());
        state.hooks.run_after(ctx, OpKind::GetByPk, table, &mut result)?;
        match result {
            OpResult::MaybeRecord(r) => Ok(r),
            _ => Err(Error::InvalidPredicate(
                "an after hook replaced the result with the wrong shape".into(),
            )),
        }
    }

    #[allow(clippy::too_many_arguments)]
    pub fn search(
        conn: &Connection,
        state: &StoreState,
        ctx: &Context,
        scope: &SqlInterruptScope,
        table: &str,
        predicate: &Predicate,
        joins: Option<&[JoinFetch]>,
        order_by: Option<&str>,
        offset: Option<u64>,
        limit: Option<u64>,
    ) -> Result<Vec<Record>> {
        state.hooks.run_before(
            ctx,
            OpKind::Search,
            &mut OpInput {
                table,
                record: None,
                predicate: Some(predicate),
            },
        )?;
        let catalog = state.catalog.load(conn)?;
        let plan = build_query(
            &catalog,
            &|t| state.resolve_view(ctx, t),
            table,
            predicate,
            joins.unwrap_or(&[]),
            order_by,
            offset,
            limit,
        )?;
        let rows = run_query(conn, &plan, scope)?;
        let mut result = OpResult::Records(rows);
        state.hooks.run_after(ctx, OpKind::Search, table, &mut result)?;
        match result {
            OpResult::Records(rows) => Ok(rows),
            _ => Err(Error::InvalidPredicate(
                "an after hook replaced the result with the wrong shape".into(),
            )),
        }
    }

    pub fn search_first(
        conn: &Connection,
        state: &StoreState,
        ctx: &Context,
        scope: &SqlInterruptScope,
        table: &str,
        predicate: &Predicate,
        joins: Option<&[JoinFetch]>,
        order_by: Option<&str>,
    ) -> Result<Option<Record>> {
        state.hooks.run_before(
            ctx,
            OpKind::SearchFirst,
            &mut OpInput {
                table,
                record: None,
                predicate: Some(predicate),
            },
        )?;
        let catalog = state.catalog.load(conn)?;
        let plan = build_query(
            &catalog,
            &|t| state.resolve_view(ctx, t),
            table,
            predicate,
            joins.unwrap_or(&[]),
            order_by,
            None,
            Some(1),
        )?;
        let rows = run_query(conn, &plan, scope)?;
        let mut result = OpResult::MaybeRecord(rows.into_iter().next());
        state
            .hooks
            .run_after(ctx, OpKind::SearchFirst, table, &mut result)?;
        match result {
            OpResult::MaybeRecord(r) => Ok(r),
            _ => Err(Error::InvalidPredicate(
                "an after hook replaced the result with the wrong shape".into(),
            )),
        }
    }

    /// Insert, filling sequence columns and stamping version columns. Must
    /// run inside a transaction.
    pub fn insert(
        conn: &Connection,
        state: &StoreState,
        ctx: &Context,
        table: &str,
        record: &Record,
    ) -> Result<Record> {
        check_actor(state, ctx)?;
        let catalog = state.catalog.load(conn)?;
        let schema = catalog.table(table)?;
        let mut rec = record.clone();
        state.hooks.run_before(
            ctx,
            OpKind::Insert,
            &mut OpInput {
                table,
                record: Some(&mut rec),
                predicate: None,
            },
        )?;

        for col in &schema.columns {
            if let Some(seq) = &col.sequence {
                let missing = rec.get(&col.name).map_or(true, Value::is_null);
                if missing {
                    rec.insert(col.name.clone(), Value::from(next_sequence(conn, seq)?));
                }
            }
        }

        if state.tracker.is_tracked(table) && !ctx.is_passthrough() {
            stamp_record(conn, ctx, table, &mut rec, None)?;
        }

        for key in rec.keys() {
            schema.check_column(key)?;
        }
        let cols: Vec<&String> = rec.keys().collect();
        let sql = format!(
            "INSERT INTO \"{}\" ({}) VALUES ({})",
            table,
            cols.iter()
                .map(|c| format!("\"{}\"", c))
                .collect::<Vec<_>>()
                .join(", "),
            sql_support::repeat_sql_vars(cols.len()),
        );
        let params: Vec<_> = rec.values().map(json_to_sql).collect();
        conn.execute(&sql, rusqlite::params_from_iter(params.iter()))?;

        // Backend-generated single-column keys (rowid aliases).
        if schema.pk.len() == 1 && !rec.contains_key(&schema.pk[0]) {
            rec.insert(schema.pk[0].clone(), Value::from(conn.last_insert_rowid()));
        }

        let mut result = OpResult::Record(rec);
        state.hooks.run_after(ctx, OpKind::Insert, table, &mut result)?;
        expect_record(result)
    }

    /// Update by full pk; non-pk columns present in the record are set.
    /// Must run inside a transaction.
    pub fn update(
        conn: &Connection,
        state: &StoreState,
        ctx: &Context,
        table: &str,
        record: &Record,
    ) -> Result<Record> {
        check_actor(state, ctx)?;
        let catalog = state.catalog.load(conn)?;
        let schema = catalog.table(table)?;
        let mut rec = record.clone();
        state.hooks.run_before(
            ctx,
            OpKind::Update,
            &mut OpInput {
                table,
                record: Some(&mut rec),
                predicate: None,
            },
        )?;

        let pk = pk_record(schema, &rec)?;
        let uid = table_uid(schema, &pk)?;
        let current = read_row_by_pk(conn, schema, &pk)?.ok_or_else(|| Error::NoSuchRecord {
            table: table.to_string(),
            uid: uid.clone(),
        })?;

        if state.tracker.is_tracked(table) && !ctx.is_passthrough() {
            let old_version = current
                .get(crate::records::VERSION_RECORD)
                .and_then(Value::as_i64)
                .unwrap_or(-1);
            let stamp = stamp_record(conn, ctx, table, &mut rec, Some(old_version))?;
            record_history(
                conn,
                ctx,
                &state.tracker,
                schema,
                &uid,
                &current,
                &rec,
                stamp,
            )?;
        }

        for key in rec.keys() {
            schema.check_column(key)?;
        }
        let set_cols: Vec<&String> = rec.keys().filter(|k| !schema.pk.contains(*k)).collect();
        if !set_cols.is_empty() {
            let sql = format!(
                "UPDATE \"{}\" SET {} WHERE {}",
                table,
                set_cols
                    .iter()
                    .map(|c| format!("\"{}\" = ?", c))
                    .collect::<Vec<_>>()
                    .join(", "),
                schema
                    .pk
                    .iter()
                    .map(|c| format!("\"{}\" = ?", c))
                    .collect::<Vec<_>>()
                    .join(" AND "),
            );
            let mut params: Vec<_> = set_cols
                .iter()
                .map(|c| json_to_sql(rec.get(*c).unwrap_or(&Value::Null)))
                .collect();
            params.extend(schema.pk.iter().map(|c| json_to_sql(pk.get(c).unwrap_or(&Value::Null))));
            conn.execute(&sql, rusqlite::params_from_iter(params.iter()))?;
        }

        let mut merged = current;
        for (k, v) in rec {
            merged.insert(k, v);
        }
        let mut result = OpResult::Record(merged);
        state.hooks.run_after(ctx, OpKind::Update, table, &mut result)?;
        expect_record(result)
    }

    /// Remove one row by pk, writing its tombstone. Must run inside a
    /// transaction.
    pub fn remove(
        conn: &Connection,
        state: &StoreState,
        ctx: &Context,
        table: &str,
        pk: &Value,
    ) -> Result<()> {
        check_actor(state, ctx)?;
        let catalog = state.catalog.load(conn)?;
        let schema = catalog.table(table)?;
        let mut pk_rec = normalize_pk(schema, pk)?;
        state.hooks.run_before(
            ctx,
            OpKind::Remove,
            &mut OpInput {
                table,
                record: Some(&mut pk_rec),
                predicate: None,
            },
        )?;
        let uid = table_uid(schema, &pk_rec)?;
        if read_row_by_pk(conn, schema, &pk_rec)?.is_none() {
            return Err(Error::NoSuchRecord {
                table: table.to_string(),
                uid,
            });
        }
        delete_row(conn, state, ctx, schema, &pk_rec, &uid)?;
        let mut result = OpResult::Unit;
        state.hooks.run_after(ctx, OpKind::Remove, table, &mut result)?;
        Ok(())
    }

    /// Remove every row matching the predicate; one tombstone per row.
    /// Must run inside a transaction.
    pub fn remove_where(
        conn: &Connection,
        state: &StoreState,
        ctx: &Context,
        scope: &SqlInterruptScope,
        table: &str,
        predicate: &Predicate,
    ) -> Result<u64> {
        check_actor(state, ctx)?;
        let catalog = state.catalog.load(conn)?;
        let schema = catalog.table(table)?;
        state.hooks.run_before(
            ctx,
            OpKind::RemoveWhere,
            &mut OpInput {
                table,
                record: None,
                predicate: Some(predicate),
            },
        )?;

        // Read the doomed rows first: the tombstones need their pk tuples.
        let mut where_sql = String::new();
        let mut params = Vec::new();
        predicate.append_sql(schema, "t", &mut where_sql, &mut params)?;
        let sql = format!(
            "SELECT {} FROM \"{}\" AS t WHERE {}",
            column_list(schema, "t"),
            table,
            where_sql
        );
        let doomed: Vec<Record> = conn.query_rows_and_then(
            &sql,
            rusqlite::params_from_iter(params.iter()),
            |row| read_record(row, schema, 0),
        )?;

        let mut count = 0;
        for row in &doomed {
            scope.err_if_interrupted()?;
            let pk = pk_record(schema, row)?;
            let uid = table_uid(schema, &pk)?;
            delete_row(conn, state, ctx, schema, &pk, &uid)?;
            count += 1;
        }

        let mut result = OpResult::Count(count);
        state
            .hooks
            .run_after(ctx, OpKind::RemoveWhere, table, &mut result)?;
        Ok(count)
    }

    fn delete_row(
        conn: &Connection,
        state: &StoreState,
        ctx: &Context,
        schema: &TableSchema,
        pk: &Record,
        uid: &str,
    ) -> Result<()> {
        let sql = format!(
            "DELETE FROM \"{}\" WHERE {}",
            schema.name,
            schema
                .pk
                .iter()
                .map(|c| format!("\"{}\" = ?", c))
                .collect::<Vec<_>>()
                .join(" AND "),
        );
        let params: Vec<_> = schema
            .pk
            .iter()
            .map(|c| json_to_sql(pk.get(c).unwrap_or(&Value::Null)))
            .collect();
        conn.execute(&sql, rusqlite::params_from_iter(params.iter()))?;

        if state.tracker.is_tracked(&schema.name) && !ctx.is_passthrough() {
            let version = next_table_version(conn, &schema.name, Timestamp::now())?;
            record_tombstone(conn, ctx, &schema.name, uid, version)?;
        }
        Ok(())
    }
}


#[cfg(test)]
mod tests {
    use super::test_utils::new_store;
    use super::*;
    use serde_json::json;

    fn record(v: Value) -> Record {
        serde_json::from_value(v).unwrap()
    }

    #[test]
    fn test_insert_stamps_versions() {
        let store = new_store("client-insert");
        let ctx = Context::new("ada");
        let rec = store
            .insert(&ctx, "foo", &record(json!({"id": "a", "name": "x"})))
            .unwrap();
        assert_eq!(rec.get("version_record"), Some(&json!(0)));
        assert_eq!(rec.get("version_table"), Some(&json!(1)));
        assert_eq!(rec.get("version_user"), Some(&json!("ada")));
        assert!(rec.get("version_date").unwrap().as_i64().unwrap() > 0);

        // No history on insert.
        let got = store
            .get_by_pk(&ctx, "foo", &json!("a"), None)
            .unwrap()
            .unwrap();
        assert_eq!(got.get("name"), Some(&json!("x")));
    }

    #[test]
    fn test_update_bumps_and_records_history() {
        let store = new_store("client-update");
        let ctx = Context::new("ada");
        store
            .insert(&ctx, "foo", &record(json!({"id": "a", "name": "x"})))
            .unwrap();
        let updated = store
            .update(&ctx, "foo", &record(json!({"id": "a", "name": "y"})))
            .unwrap();
        assert_eq!(updated.get("version_record"), Some(&json!(1)));
        assert_eq!(updated.get("version_table"), Some(&json!(2)));

        let history = store.history_since("foo", "a", 0).unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].column_name, "name");
        assert_eq!(history[0].column_before.as_deref(), Some("x"));
        assert_eq!(history[0].column_after.as_deref(), Some("y"));
    }

    #[test]
    fn test_update_missing_row() {
        let store = new_store("client-update-missing");
        let ctx = Context::new("ada");
        assert!(matches!(
            store.update(&ctx, "foo", &record(json!({"id": "nope", "name": "y"}))),
            Err(Error::NoSuchRecord { .. })
        ));
    }

    #[test]
    fn test_remove_writes_composite_tombstone() {
        let store = new_store("client-remove");
        let ctx = Context::new("ada");
        store
            .insert(&ctx, "bar", &record(json!({"k1": "1", "k2": "2", "v": "x"})))
            .unwrap();
        store
            .remove(&ctx, "bar", &json!({"k1": "1", "k2": "2"}))
            .unwrap();
        let tombs = store.tombstones_since("bar", -1).unwrap();
        assert_eq!(tombs.len(), 1);
        assert_eq!(tombs[0].table_uid, "1$_$2");
        assert_eq!(tombs[0].deleted_by.as_deref(), Some("ada"));
        assert!(store
            .get_by_pk(&ctx, "bar", &json!({"k1": "1", "k2": "2"}), None)
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_remove_where_tombstones_each_row() {
        let store = new_store("client-remove-where");
        let ctx = Context::new("ada");
        for i in 0..3 {
            store
                .insert(
                    &ctx,
                    "foo",
                    &record(json!({"id": format!("r{}", i), "name": "doomed"})),
                )
                .unwrap();
        }
        store
            .insert(&ctx, "foo", &record(json!({"id": "keep", "name": "fine"})))
            .unwrap();
        let n = store
            .remove_where(
                &ctx,
                "foo",
                &Predicate::from_json(&json!({"name": "doomed"})).unwrap(),
            )
            .unwrap();
        assert_eq!(n, 3);
        assert_eq!(store.tombstones_since("foo", -1).unwrap().len(), 3);
        assert_eq!(
            store
                .search(&ctx, "foo", &Predicate::all(), None, None, None, None)
                .unwrap()
                .len(),
            1
        );
    }

    #[test]
    fn test_transaction_commit_and_rollback() {
        let store = new_store("client-tx");
        let ctx = Context::new("ada");
        store
            .transaction::<_, Error>(&ctx, |tx| {
                tx.insert("foo", &record(json!({"id": "a", "name": "x"})))?;
                tx.insert("foo", &record(json!({"id": "b", "name": "y"})))?;
                Ok(())
            })
            .unwrap();
        assert_eq!(
            store
                .search(&ctx, "foo", &Predicate::all(), None, None, None, None)
                .unwrap()
                .len(),
            2
        );

        let err = store.transaction(&ctx, |tx| {
            tx.insert("foo", &record(json!({"id": "c", "name": "z"})))?;
            Err::<(), _>(Error::MissingActor)
        });
        assert!(err.is_err());
        assert!(store.get_by_pk(&ctx, "foo", &json!("c"), None).unwrap().is_none());
    }

    #[test]
    fn test_nested_transaction_rejected() {
        let store = new_store("client-tx-nested");
        let ctx = Context::new("ada");
        let err = store.transaction(&ctx, |_tx| {
            store.insert(&ctx, "foo", &record(json!({"id": "x"})))
        });
        assert!(matches!(err, Err(Error::NestedTransaction)));
    }

    #[test]
    fn test_transaction_timeout() {
        let store = new_store("client-tx-timeout");
        let ctx = Context::new("ada");
        let err = store.transaction_with_timeout(&ctx, Duration::from_millis(50), |tx| {
            tx.insert("foo", &record(json!({"id": "a", "name": "x"})))?;
            std::thread::sleep(Duration::from_millis(250));
            // The watchdog has fired by now; the next statement is
            // interrupted, or if we did nothing more the commit is refused.
            match tx.search("foo", &Predicate::all(), None, None, None, None) {
                Ok(_) => Ok(()),
                Err(e) => Err(e),
            }
        });
        assert!(matches!(err, Err(Error::TransactionTimeout)));
        // And the insert was rolled back.
        assert!(store.get_by_pk(&ctx, "foo", &json!("a"), None).unwrap().is_none());
    }

    #[test]
    fn test_require_actor() {
        let store = StoreBuilder::in_memory("client-actor")
            .require_actor(true)
            .open()
            .unwrap();
        let anon = Context::anonymous();
        store
            .unsafe_scope(&anon, |s| {
                s.execute_batch("CREATE TABLE foo (id TEXT PRIMARY KEY, name TEXT)")
            })
            .unwrap();
        store.prepare_tracking().unwrap();
        assert!(matches!(
            store.insert(&anon, "foo", &record(json!({"id": "a"}))),
            Err(Error::MissingActor)
        ));
        store
            .insert(&Context::new("ada"), "foo", &record(json!({"id": "a"})))
            .unwrap();
    }

    #[test]
    fn test_hooks_order_and_short_circuit() {
        let store = StoreBuilder::in_memory("client-hooks")
            .register_before_hook(OpKind::Insert, Some("foo"), |_ctx, input| {
                if let Some(rec) = input.record.as_mut() {
                    rec.insert("name".into(), serde_json::json!("hooked"));
                }
                Ok(())
            })
            .unwrap()
            .register_after_hook(OpKind::Insert, Some("foo"), |_ctx, _table, result| {
                if let OpResult::Record(rec) = result {
                    rec.insert("extra".into(), json!(true));
                }
                Ok(())
            })
            .unwrap()
            .register_before_hook(OpKind::Remove, None, |_ctx, _input| {
                Err(Error::MissingActor)
            })
            .unwrap()
            .open()
            .unwrap();
        let ctx = Context::new("ada");
        store
            .unsafe_scope(&ctx, |s| {
                s.execute_batch("CREATE TABLE foo (id TEXT PRIMARY KEY, name TEXT)")
            })
            .unwrap();
        store.prepare_tracking().unwrap();

        let rec = store
            .insert(&ctx, "foo", &record(json!({"id": "a", "name": "original"})))
            .unwrap();
        assert_eq!(rec.get("name"), Some(&json!("hooked")));
        // After hooks mutate the result in place; "extra" is not a column.
        assert_eq!(rec.get("extra"), Some(&json!(true)));
        let stored = store.get_by_pk(&ctx, "foo", &json!("a"), None).unwrap().unwrap();
        assert_eq!(stored.get("name"), Some(&json!("hooked")));

        // The remove hook short-circuits the operation.
        assert!(store.remove(&ctx, "foo", &json!("a")).is_err());
        assert!(store.get_by_pk(&ctx, "foo", &json!("a"), None).unwrap().is_some());
    }

    #[test]
    fn test_view_rewrite_redacts() {
        let store = StoreBuilder::in_memory("client-views")
            .register_view("foo", |_ctx| {
                "SELECT id, name, NULL AS secret, version_record, version_table, \
                 version_date, version_user FROM foo"
                    .to_string()
            })
            .open()
            .unwrap();
        let ctx = Context::new("ada");
        store
            .unsafe_scope(&ctx, |s| {
                s.execute_batch("CREATE TABLE foo (id TEXT PRIMARY KEY, name TEXT, secret TEXT)")
            })
            .unwrap();
        store.prepare_tracking().unwrap();
        store
            .insert(
                &ctx,
                "foo",
                &record(json!({"id": "a", "name": "x", "secret": "hunter2"})),
            )
            .unwrap();
        let got = store.get_by_pk(&ctx, "foo", &json!("a"), None).unwrap().unwrap();
        assert_eq!(got.get("secret"), Some(&json!(null)));
        // The unsafe scope bypasses the rewrite.
        let raw = store
            .unsafe_scope(&ctx, |s| s.query("SELECT secret FROM foo", &[]))
            .unwrap();
        assert_eq!(raw[0].get("secret"), Some(&json!("hunter2")));
    }

    #[test]
    fn test_sequence_columns() {
        let mut schema = TableSchema {
            name: "foo".into(),
            columns: vec![],
            pk: vec![],
            fks: vec![],
            view_of: vec![],
        };
        let mut seqno = crate::catalog::ColumnSchema::new("seqno", "INTEGER");
        seqno.sequence = Some("foo_seq".into());
        schema.columns.push(seqno);

        let store = StoreBuilder::in_memory("client-seq")
            .schema_overrides(vec![schema])
            .open()
            .unwrap();
        let ctx = Context::new("ada");
        store
            .unsafe_scope(&ctx, |s| {
                s.execute_batch("CREATE TABLE foo (id TEXT PRIMARY KEY, seqno INTEGER)")
            })
            .unwrap();
        store.prepare_tracking().unwrap();
        let a = store.insert(&ctx, "foo", &record(json!({"id": "a"}))).unwrap();
        let b = store.insert(&ctx, "foo", &record(json!({"id": "b"}))).unwrap();
        assert_eq!(a.get("seqno"), Some(&json!(1)));
        assert_eq!(b.get("seqno"), Some(&json!(2)));
        // Supplied values win over the sequence.
        let c = store
            .insert(&ctx, "foo", &record(json!({"id": "c", "seqno": 99})))
            .unwrap();
        assert_eq!(c.get("seqno"), Some(&json!(99)));
    }

    #[test]
    fn test_generated_rowid_pk() {
        let store = new_store("client-rowid");
        let ctx = Context::new("ada");
        store
            .unsafe_scope(&ctx, |s| {
                s.execute_batch("CREATE TABLE items (id INTEGER PRIMARY KEY, label TEXT)")
            })
            .unwrap();
        store.prepare_tracking().unwrap();
        let rec = store
            .insert(&ctx, "items", &record(json!({"label": "first"})))
            .unwrap();
        assert_eq!(rec.get("id"), Some(&json!(1)));
    }

    #[test]
    fn test_search_agrees_with_reference_interpreter() {
        let store = new_store("client-reference");
        let ctx = Context::new("ada");
        let rows = [
            json!({"id": "a", "name": "Smith", "qty": 1}),
            json!({"id": "b", "name": "smythe", "qty": 5}),
            json!({"id": "c", "name": "Jones", "qty": 10}),
            json!({"id": "d", "name": null, "qty": 7}),
        ];
        for row in &rows {
            store.insert(&ctx, "foo", &record(row.clone())).unwrap();
        }
        let predicates = [
            json!({"name": "Smith"}),
            json!({"name": "%smi%"}),
            json!({"qty": {"op": ">=", "value": 5}}),
            json!({"qty": {"op": "between", "value": [2, 8]}}),
            json!({"qty": [1, 10]}),
            json!({"name": null}),
            json!({"$or": [{"name": "Jones"}, {"qty": {"op": "<", "value": 3}}]}),
            json!({"$and": [{"qty": {"op": ">", "value": 1}}, {"name": {"op": "<>", "value": "Jones"}}]}),
        ];
        for p in &predicates {
            let predicate = Predicate::from_json(p).unwrap();
            let found: Vec<String> = store
                .search(&ctx, "foo", &predicate, None, Some("id"), None, None)
                .unwrap()
                .iter()
                .map(|r| r.get("id").unwrap().as_str().unwrap().to_string())
                .collect();
            let expected: Vec<String> = rows
                .iter()
                .map(|r| record(r.clone()))
                .filter(|r| predicate.matches(r))
                .map(|r| r.get("id").unwrap().as_str().unwrap().to_string())
                .collect();
            assert_eq!(found, expected, "predicate {}", p);
        }
    }

    #[test]
    fn test_masked_columns_skip_history() {
        let store = StoreBuilder::in_memory("client-masked")
            .mask_columns("users", &["password"])
            .open()
            .unwrap();
        let ctx = Context::new("ada");
        store
            .unsafe_scope(&ctx, |s| {
                s.execute_batch("CREATE TABLE users (id TEXT PRIMARY KEY, name TEXT, password TEXT)")
            })
            .unwrap();
        store.prepare_tracking().unwrap();
        store
            .insert(
                &ctx,
                "users",
                &record(json!({"id": "u1", "name": "ada", "password": "old"})),
            )
            .unwrap();
        store
            .update(
                &ctx,
                "users",
                &record(json!({"id": "u1", "name": "ada l", "password": "new"})),
            )
            .unwrap();
        let history = store.history_since("users", "u1", 0).unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].column_name, "name");
    }
}
