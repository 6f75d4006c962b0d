/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

//! The modification and delete trackers. Every mutation of a tracked table
//! maintains, inside the mutating transaction:
//!
//!   - `version_record`: 0 on insert, old + 1 on update;
//!   - `version_table`: the next value of the table's sequence, mirrored
//!     into the `table_versions` row;
//!   - `version_date`: wall-clock unless the caller supplied one;
//!   - `version_user`: the context's actor;
//!   - one `modif_track` row per column whose textual form changed on an
//!     update;
//!   - one `delete_track` tombstone per removed row.

use crate::catalog::{Catalog, TableSchema};
use crate::context::Context;
use crate::error::*;
use crate::records::{is_reserved_column, value_repr, Record, RESERVED_COLUMNS};
use error_support::trace;
use rusqlite::{named_params, Connection};
use serde_json::Value;
use sql_support::ConnExt;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use types::Timestamp;

/// Tables whose bookkeeping must never itself be tracked. The session table
/// is configured separately (`StoreBuilder::session_table`).
pub(crate) const INTERNAL_TABLES: [&str; 6] = [
    "table_versions",
    "modif_track",
    "delete_track",
    "sequences",
    "sync_log",
    "sync_pending",
];

/// Which tables the trackers instrument.
#[derive(Clone)]
pub enum TrackedTables {
    All,
    Include(HashSet<String>),
    Exclude(HashSet<String>),
    Predicate(Arc<dyn Fn(&str) -> bool + Send + Sync>),
}

impl std::fmt::Debug for TrackedTables {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::All => write!(f, "All"),
            Self::Include(t) => f.debug_tuple("Include").field(t).finish(),
            Self::Exclude(t) => f.debug_tuple("Exclude").field(t).finish(),
            Self::Predicate(_) => write!(f, "Predicate(..)"),
        }
    }
}

#[derive(Debug, Clone)]
pub(crate) struct TrackerConfig {
    pub tables: TrackedTables,
    /// Columns excluded from history and from sync conflict comparison,
    /// e.g. a password column.
    pub masked: HashMap<String, HashSet<String>>,
    pub session_table: Option<String>,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            tables: TrackedTables::All,
            masked: HashMap::new(),
            session_table: None,
        }
    }
}

impl TrackerConfig {
    pub fn is_tracked(&self, table: &str) -> bool {
        if INTERNAL_TABLES.contains(&table)
            || table == "db_version"
            || self.session_table.as_deref() == Some(table)
        {
            return false;
        }
        match &self.tables {
            TrackedTables::All => true,
            TrackedTables::Include(set) => set.contains(table),
            TrackedTables::Exclude(set) => !set.contains(table),
            TrackedTables::Predicate(pred) => pred(table),
        }
    }

    pub fn is_masked(&self, table: &str, column: &str) -> bool {
        self.masked
            .get(table)
            .map_or(false, |cols| cols.contains(column))
    }
}

pub(crate) const CREATE_TRACKING_TABLES_SQL: &str = "
    CREATE TABLE IF NOT EXISTS table_versions (
        table_name    TEXT PRIMARY KEY,
        version_table INTEGER NOT NULL,
        version_date  INTEGER NOT NULL
    ) WITHOUT ROWID;

    CREATE TABLE IF NOT EXISTS modif_track (
        table_name     TEXT NOT NULL,
        table_uid      TEXT NOT NULL,
        column_name    TEXT NOT NULL,
        column_before  TEXT,
        column_after   TEXT,
        version_record INTEGER NOT NULL,
        version_table  INTEGER NOT NULL,
        version_date   INTEGER NOT NULL,
        version_user   TEXT,
        PRIMARY KEY (table_name, table_uid, version_table, version_record, version_date, column_name)
    );

    CREATE INDEX IF NOT EXISTS idx_modif_track_record
        ON modif_track (table_name, table_uid, version_record);

    CREATE TABLE IF NOT EXISTS delete_track (
        table_name    TEXT NOT NULL,
        table_uid     TEXT NOT NULL,
        table_version INTEGER NOT NULL,
        deleted_at    INTEGER NOT NULL,
        deleted_by    TEXT,
        PRIMARY KEY (table_name, table_uid, table_version)
    );

    CREATE INDEX IF NOT EXISTS idx_delete_track_version
        ON delete_track (table_name, table_version);

    CREATE TABLE IF NOT EXISTS sequences (
        name  TEXT PRIMARY KEY,
        value INTEGER NOT NULL
    ) WITHOUT ROWID;
";

/// Make sure every tracked table physically carries the reserved columns.
/// Returns true when any DDL ran (so the caller can invalidate the catalog).
pub(crate) fn ensure_tracking_columns(
    conn: &Connection,
    catalog: &Catalog,
    config: &TrackerConfig,
) -> Result<bool> {
    let mut changed = false;
    for table in catalog.tables() {
        if !config.is_tracked(&table.name) {
            continue;
        }
        for col in RESERVED_COLUMNS {
            if !table.has_column(col) {
                let col_type = if col == "version_user" { "TEXT" } else { "INTEGER" };
                conn.execute_batch(&format!(
                    "ALTER TABLE \"{}\" ADD COLUMN \"{}\" {}",
                    table.name, col, col_type
                ))?;
                changed = true;
            }
        }
    }
    Ok(changed)
}

/// Advance the table's sequence and mirror it into `table_versions`.
/// Must run inside the mutating transaction.
pub(crate) fn next_table_version(
    conn: &Connection,
    table: &str,
    now: Timestamp,
) -> Result<i64> {
    conn.execute_cached(
        "INSERT INTO table_versions (table_name, version_table, version_date)
         VALUES (:table, 1, :now)
         ON CONFLICT(table_name) DO UPDATE SET
             version_table = version_table + 1,
             version_date = :now",
        named_params! { ":table": table, ":now": now },
    )?;
    Ok(conn.query_row_and_then_cachable(
        "SELECT version_table FROM table_versions WHERE table_name = :table",
        named_params! { ":table": table },
        |row| -> Result<i64> { Ok(row.get(0)?) },
        true,
    )?)
}

/// Next value of a named sequence (used for declared sequence columns).
pub(crate) fn next_sequence(conn: &Connection, name: &str) -> Result<i64> {
    conn.execute_cached(
        "INSERT INTO sequences (name, value) VALUES (:name, 1)
         ON CONFLICT(name) DO UPDATE SET value = value + 1",
        named_params! { ":name": name },
    )?;
    Ok(conn.query_row_and_then_cachable(
        "SELECT value FROM sequences WHERE name = :name",
        named_params! { ":name": name },
        |row| -> Result<i64> { Ok(row.get(0)?) },
        true,
    )?)
}

/// The version triplet stamped on a mutation.
#[derive(Debug, Clone, Copy)]
pub(crate) struct VersionStamp {
    pub version_record: i64,
    pub version_table: i64,
    pub version_date: Timestamp,
}

/// Stamp the reserved columns for an insert (version_record = 0) or an
/// update (version_record = old + 1), honoring a caller-supplied
/// version_date.
pub(crate) fn stamp_record(
    conn: &Connection,
    ctx: &Context,
    table: &str,
    record: &mut Record,
    old_version_record: Option<i64>,
) -> Result<VersionStamp> {
    let now = Timestamp::now();
    let version_date = record
        .get("version_date")
        .and_then(Value::as_i64)
        .map(|ms| Timestamp(ms.max(0) as u64))
        .unwrap_or(now);
    let version_record = old_version_record.map_or(0, |v| v + 1);
    let version_table = next_table_version(conn, table, now)?;

    record.insert("version_record".into(), Value::from(version_record));
    record.insert("version_table".into(), Value::from(version_table));
    record.insert(
        "version_date".into(),
        Value::from(version_date.as_millis_i64()),
    );
    record.insert(
        "version_user".into(),
        ctx.actor.clone().map_or(Value::Null, Value::String),
    );

    Ok(VersionStamp {
        version_record,
        version_table,
        version_date,
    })
}

/// Write one `modif_track` row per changed column (textual comparison),
/// reserved and masked columns excepted.
pub(crate) fn record_history(
    conn: &Connection,
    ctx: &Context,
    config: &TrackerConfig,
    schema: &TableSchema,
    table_uid: &str,
    old: &Record,
    new: &Record,
    stamp: VersionStamp,
) -> Result<()> {
    let mut stmt = conn.prepare_cached(
        "INSERT OR REPLACE INTO modif_track (
            table_name, table_uid, column_name, column_before, column_after,
            version_record, version_table, version_date, version_user
         ) VALUES (:table, :uid, :column, :before, :after, :vr, :vt, :vd, :vu)",
    )?;
    for (column, new_value) in new {
        if is_reserved_column(column)
            || config.is_masked(&schema.name, column)
            || schema.pk.contains(column)
        {
            continue;
        }
        let before = old.get(column).and_then(value_repr);
        let after = value_repr(new_value);
        if before == after {
            continue;
        }
        trace!("history: {}/{} {} changed", schema.name, table_uid, column);
        stmt.execute(named_params! {
            ":table": schema.name,
            ":uid": table_uid,
            ":column": column,
            ":before": before,
            ":after": after,
            ":vr": stamp.version_record,
            ":vt": stamp.version_table,
            ":vd": stamp.version_date,
            ":vu": ctx.actor,
        })?;
    }
    Ok(())
}

/// Write the tombstone for a removed row. History rows are never removed.
pub(crate) fn record_tombstone(
    conn: &Connection,
    ctx: &Context,
    table: &str,
    table_uid: &str,
    table_version: i64,
) -> Result<()> {
    conn.execute_cached(
        "INSERT OR REPLACE INTO delete_track
            (table_name, table_uid, table_version, deleted_at, deleted_by)
         VALUES (:table, :uid, :version, :now, :actor)",
        named_params! {
            ":table": table,
            ":uid": table_uid,
            ":version": table_version,
            ":now": Timestamp::now(),
            ":actor": ctx.actor,
        },
    )?;
    Ok(())
}
