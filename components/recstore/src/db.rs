/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

use crate::error::*;
use crate::tracker::CREATE_TRACKING_TABLES_SQL;
use interrupt_support::SqlInterruptHandle;
use rusqlite::{Connection, OpenFlags, Transaction};
use sql_support::open_database::{self, ConnectionInitializer};
use std::ops::Deref;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use url::Url;

/// The writer connection for a [crate::Store], plus the interrupt handle the
/// transaction watchdog fires.
pub(crate) struct StoreDb {
    pub writer: Connection,
    pub interrupt_handle: Arc<SqlInterruptHandle>,
}

impl StoreDb {
    pub fn new(db_path: impl AsRef<Path>) -> Result<Self> {
        let db_path = normalize_path(db_path)?;
        Self::new_named(db_path)
    }

    /// Each in-memory database needs a distinct name or they share pages.
    pub fn new_memory(db_path: &str) -> Result<Self> {
        let name = PathBuf::from(format!("file:{}?mode=memory&cache=shared", db_path));
        Self::new_named(name)
    }

    fn new_named(db_path: PathBuf) -> Result<Self> {
        let flags = OpenFlags::SQLITE_OPEN_NO_MUTEX
            | OpenFlags::SQLITE_OPEN_URI
            | OpenFlags::SQLITE_OPEN_CREATE
            | OpenFlags::SQLITE_OPEN_READ_WRITE;

        let conn = open_database::open_database_with_flags(
            db_path,
            flags,
            &StoreConnectionInitializer,
        )?;

        Ok(Self {
            interrupt_handle: Arc::new(SqlInterruptHandle::new(&conn)),
            writer: conn,
        })
    }
}

impl Deref for StoreDb {
    type Target = Connection;

    fn deref(&self) -> &Self::Target {
        &self.writer
    }
}

pub(crate) struct StoreConnectionInitializer;

impl ConnectionInitializer for StoreConnectionInitializer {
    const NAME: &'static str = "recstore db";
    const END_VERSION: u32 = 1;

    fn prepare(&self, conn: &Connection, _db_empty: bool) -> open_database::Result<()> {
        let initial_pragmas = "
            -- use in-memory storage for temp tables
            PRAGMA temp_store = 2;
            -- use write-ahead logging
            PRAGMA journal_mode = WAL;
            PRAGMA foreign_keys = ON;
        ";
        conn.execute_batch(initial_pragmas)?;
        Ok(())
    }

    fn init(&self, tx: &Transaction<'_>) -> open_database::Result<()> {
        tx.execute_batch(CREATE_TRACKING_TABLES_SQL)?;
        Ok(())
    }

    fn upgrade_from(&self, tx: &Transaction<'_>, version: u32) -> open_database::Result<()> {
        match version {
            // Adopting a database created elsewhere (user_version 0, tables
            // already present): just add our bookkeeping tables.
            0 => {
                tx.execute_batch(CREATE_TRACKING_TABLES_SQL)?;
                Ok(())
            }
            _ => Err(open_database::Error::IncompatibleVersion(version)),
        }
    }
}

fn unurl_path(p: impl AsRef<Path>) -> PathBuf {
    p.as_ref()
        .to_str()
        .and_then(|s| Url::parse(s).ok())
        .and_then(|u| {
            if u.scheme() == "file" {
                u.to_file_path().ok()
            } else {
                None
            }
        })
        .unwrap_or_else(|| p.as_ref().to_owned())
}

fn normalize_path(p: impl AsRef<Path>) -> Result<PathBuf> {
    let path = unurl_path(p);
    if let Ok(canonical) = path.canonicalize() {
        return Ok(canonical);
    }
    // It probably doesn't exist yet, so canonicalize the parent directory
    // and append the requested file name onto that.
    let file_name = path
        .file_name()
        .ok_or_else(|| Error::IllegalDatabasePath(path.clone()))?;
    let parent = path
        .parent()
        .ok_or_else(|| Error::IllegalDatabasePath(path.clone()))?;
    let mut canonical = parent.canonicalize()?;
    canonical.push(file_name);
    Ok(canonical)
}
