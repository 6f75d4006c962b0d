/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

//! Read and maintenance access to the tracker's bookkeeping tables, for the
//! sync engine: column history chains, tombstones and table versions. The
//! write operations exist so conflict resolution can splice audit rows into
//! the history; application code has no business calling them.

use crate::client::{Store, TxClient};
use crate::error::*;
use rusqlite::{named_params, Connection, Row};
use serde_derive::{Deserialize, Serialize};
use sql_support::ConnExt;
use types::Timestamp;

/// One row of `modif_track`: a single column's before/after transition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub table_name: String,
    pub table_uid: String,
    pub column_name: String,
    pub column_before: Option<String>,
    pub column_after: Option<String>,
    pub version_record: i64,
    pub version_table: i64,
    pub version_date: Timestamp,
    pub version_user: Option<String>,
}

/// One row of `delete_track`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tombstone {
    pub table_name: String,
    pub table_uid: String,
    pub table_version: i64,
    pub deleted_at: Timestamp,
    pub deleted_by: Option<String>,
}

fn entry_from_row(row: &Row<'_>) -> Result<HistoryEntry> {
    Ok(HistoryEntry {
        table_name: row.get("table_name")?,
        table_uid: row.get("table_uid")?,
        column_name: row.get("column_name")?,
        column_before: row.get("column_before")?,
        column_after: row.get("column_after")?,
        version_record: row.get("version_record")?,
        version_table: row.get("version_table")?,
        version_date: row.get("version_date")?,
        version_user: row.get("version_user")?,
    })
}

fn tombstone_from_row(row: &Row<'_>) -> Result<Tombstone> {
    Ok(Tombstone {
        table_name: row.get("table_name")?,
        table_uid: row.get("table_uid")?,
        table_version: row.get("table_version")?,
        deleted_at: row.get("deleted_at")?,
        deleted_by: row.get("deleted_by")?,
    })
}

/// History rows for one record with `version_record >= min_version_record`,
/// in chain order.
fn history_since(
    conn: &Connection,
    table: &str,
    table_uid: &str,
    min_version_record: i64,
) -> Result<Vec<HistoryEntry>> {
    conn.query_rows_and_then_cached(
        "SELECT table_name, table_uid, column_name, column_before, column_after,
                version_record, version_table, version_date, version_user
         FROM modif_track
         WHERE table_name = :table AND table_uid = :uid
           AND version_record >= :min_vr
         ORDER BY version_table, version_record, version_date",
        named_params! { ":table": table, ":uid": table_uid, ":min_vr": min_version_record },
        entry_from_row,
    )
}

fn insert_history_entry(conn: &Connection, entry: &HistoryEntry) -> Result<()> {
    conn.execute_cached(
        "INSERT OR REPLACE INTO modif_track (
            table_name, table_uid, column_name, column_before, column_after,
            version_record, version_table, version_date, version_user
         ) VALUES (:table, :uid, :column, :before, :after, :vr, :vt, :vd, :vu)",
        named_params! {
            ":table": entry.table_name,
            ":uid": entry.table_uid,
            ":column": entry.column_name,
            ":before": entry.column_before,
            ":after": entry.column_after,
            ":vr": entry.version_record,
            ":vt": entry.version_table,
            ":vd": entry.version_date,
            ":vu": entry.version_user,
        },
    )?;
    Ok(())
}

/// Rewrite `column_before` of an existing history row, identified by its
/// full primary key.
fn set_history_before(
    conn: &Connection,
    entry: &HistoryEntry,
    new_before: Option<&str>,
) -> Result<()> {
    conn.execute_cached(
        "UPDATE modif_track SET column_before = :new_before
         WHERE table_name = :table AND table_uid = :uid AND column_name = :column
           AND version_table = :vt AND version_record = :vr AND version_date = :vd",
        named_params! {
            ":new_before": new_before,
            ":table": entry.table_name,
            ":uid": entry.table_uid,
            ":column": entry.column_name,
            ":vt": entry.version_table,
            ":vr": entry.version_record,
            ":vd": entry.version_date,
        },
    )?;
    Ok(())
}

fn tombstone_exists(conn: &Connection, table: &str, table_uid: &str) -> Result<bool> {
    Ok(conn
        .try_query_one::<i64, _>(
            "SELECT 1 FROM delete_track WHERE table_name = :table AND table_uid = :uid LIMIT 1",
            named_params! { ":table": table, ":uid": table_uid },
            true,
        )?
        .is_some())
}

fn tombstones_since(conn: &Connection, table: &str, since: i64) -> Result<Vec<Tombstone>> {
    conn.query_rows_and_then_cached(
        "SELECT table_name, table_uid, table_version, deleted_at, deleted_by
         FROM delete_track
         WHERE table_name = :table AND table_version > :since
         ORDER BY table_version",
        named_params! { ":table": table, ":since": since },
        tombstone_from_row,
    )
}

fn table_version(conn: &Connection, table: &str) -> Result<Option<i64>> {
    conn.try_query_one(
        "SELECT version_table FROM table_versions WHERE table_name = :table",
        named_params! { ":table": table },
        true,
    )
    .map_err(Error::from)
}

fn set_table_version(conn: &Connection, table: &str, version: i64) -> Result<()> {
    conn.execute_cached(
        "INSERT INTO table_versions (table_name, version_table, version_date)
         VALUES (:table, :version, :now)
         ON CONFLICT(table_name) DO UPDATE SET
             version_table = :version,
             version_date = :now",
        named_params! { ":table": table, ":version": version, ":now": Timestamp::now() },
    )?;
    Ok(())
}

/// All known table-version rows, for the download protocol.
fn all_table_versions(conn: &Connection) -> Result<Vec<(String, i64)>> {
    conn.query_rows_and_then_cached(
        "SELECT table_name, version_table FROM table_versions ORDER BY table_name",
        [],
        |row| -> Result<(String, i64)> { Ok((row.get(0)?, row.get(1)?)) },
    )
}

impl Store {
    pub fn history_since(
        &self,
        table: &str,
        table_uid: &str,
        min_version_record: i64,
    ) -> Result<Vec<HistoryEntry>> {
        self.with_conn(|conn| history_since(conn, table, table_uid, min_version_record))
    }

    pub fn tombstones_since(&self, table: &str, since: i64) -> Result<Vec<Tombstone>> {
        self.with_conn(|conn| tombstones_since(conn, table, since))
    }

    pub fn table_version(&self, table: &str) -> Result<Option<i64>> {
        self.with_conn(|conn| table_version(conn, table))
    }

    pub fn all_table_versions(&self) -> Result<Vec<(String, i64)>> {
        self.with_conn(all_table_versions)
    }
}

impl<'a> TxClient<'a> {
    pub fn history_since(
        &self,
        table: &str,
        table_uid: &str,
        min_version_record: i64,
    ) -> Result<Vec<HistoryEntry>> {
        history_since(self.conn, table, table_uid, min_version_record)
    }

    pub fn insert_history_entry(&self, entry: &HistoryEntry) -> Result<()> {
        insert_history_entry(self.conn, entry)
    }

    pub fn set_history_before(
        &self,
        entry: &HistoryEntry,
        new_before: Option<&str>,
    ) -> Result<()> {
        set_history_before(self.conn, entry, new_before)
    }

    pub fn tombstone_exists(&self, table: &str, table_uid: &str) -> Result<bool> {
        tombstone_exists(self.conn, table, table_uid)
    }

    pub fn tombstones_since(&self, table: &str, since: i64) -> Result<Vec<Tombstone>> {
        tombstones_since(self.conn, table, since)
    }

    pub fn table_version(&self, table: &str) -> Result<Option<i64>> {
        table_version(self.conn, table)
    }

    /// Overwrite the table's version row (the download path sets it to the
    /// server's value after applying a batch).
    pub fn set_table_version(&self, table: &str, version: i64) -> Result<()> {
        set_table_version(self.conn, table, version)
    }
}
