/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

/// Use this module to open a new SQLite database connection.
///
/// Usage:
///    - Define a struct that implements ConnectionInitializer.  This handles:
///      - Initializing the schema for a new database
///      - Upgrading the schema for an existing database
///      - Extra preparation/finishing steps, for example setting up SQLite
///        functions
///
///    - Call open_database() in your database constructor. The first time
///      this runs it will initialize the schema; on subsequent runs it will
///      upgrade the schema as needed.  Upgrades and initialization run inside
///      a transaction, so a failure part-way leaves the database untouched.
use crate::ConnExt;
use rusqlite::{Connection, OpenFlags, Transaction, TransactionBehavior};
use std::path::Path;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Incompatible database version: {0}")]
    IncompatibleVersion(u32),
    #[error("Error executing SQL: {0}")]
    SqlError(#[from] rusqlite::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

pub trait ConnectionInitializer {
    // Name to display in the logs
    const NAME: &'static str;

    // The version that the last upgrade function upgrades to.
    const END_VERSION: u32;

    // Functions called only for brand new databases
    fn init(&self, tx: &Transaction<'_>) -> Result<()>;

    // Functions called for existing databases, to upgrade from `version` to
    // `version + 1`.
    fn upgrade_from(&self, tx: &Transaction<'_>, version: u32) -> Result<()>;

    // Runs immediately after creation for all types of connections. If a
    // database file was just created, `db_empty` is true.
    fn prepare(&self, _conn: &Connection, _db_empty: bool) -> Result<()> {
        Ok(())
    }

    // Runs for all types of connections, after any init/upgrade work.
    fn finish(&self, _conn: &Connection) -> Result<()> {
        Ok(())
    }
}

pub fn open_database<CI: ConnectionInitializer, P: AsRef<Path>>(
    path: P,
    connection_initializer: &CI,
) -> Result<Connection> {
    open_database_with_flags(path, OpenFlags::default(), connection_initializer)
}

pub fn open_memory_database<CI: ConnectionInitializer>(
    conn_initializer: &CI,
) -> Result<Connection> {
    open_memory_database_with_flags(OpenFlags::default(), conn_initializer)
}

pub fn open_database_with_flags<CI: ConnectionInitializer, P: AsRef<Path>>(
    path: P,
    open_flags: OpenFlags,
    connection_initializer: &CI,
) -> Result<Connection> {
    do_open_database_with_flags(&path, open_flags, connection_initializer)
}

pub fn open_memory_database_with_flags<CI: ConnectionInitializer>(
    flags: OpenFlags,
    conn_initializer: &CI,
) -> Result<Connection> {
    do_open_database_with_flags(":memory:", flags, conn_initializer)
}

fn do_open_database_with_flags<CI: ConnectionInitializer, P: AsRef<Path>>(
    path: P,
    open_flags: OpenFlags,
    connection_initializer: &CI,
) -> Result<Connection> {
    // Try running the migration logic with an existing file
    log::debug!("{}: opening database", CI::NAME);
    let mut conn = Connection::open_with_flags(path, open_flags)?;
    log::debug!("{}: checking if initialization is necessary", CI::NAME);
    let db_empty = is_db_empty(&conn)?;

    log::debug!("{}: preparing", CI::NAME);
    connection_initializer.prepare(&conn, db_empty)?;

    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
    if db_empty {
        log::debug!("{}: initializing new database", CI::NAME);
        connection_initializer.init(&tx)?;
    } else {
        let mut current_version = get_schema_version(&tx)?;
        if current_version > CI::END_VERSION {
            return Err(Error::IncompatibleVersion(current_version));
        }
        while current_version < CI::END_VERSION {
            log::debug!(
                "{}: upgrading database to {}",
                CI::NAME,
                current_version + 1
            );
            connection_initializer.upgrade_from(&tx, current_version)?;
            current_version += 1;
        }
    }
    set_schema_version(&tx, CI::END_VERSION)?;
    tx.commit()?;

    log::debug!("{}: finishing writer database open", CI::NAME);
    connection_initializer.finish(&conn)?;
    log::debug!("{}: database open successful", CI::NAME);
    Ok(conn)
}

fn is_db_empty(conn: &Connection) -> Result<bool> {
    Ok(ConnExt::query_one::<u32>(conn, "SELECT COUNT(*) FROM sqlite_master")? == 0)
}

fn get_schema_version(conn: &Connection) -> Result<u32> {
    let version = conn.query_row("PRAGMA user_version", [], |row| row.get(0))?;
    Ok(version)
}

fn set_schema_version(conn: &Connection, version: u32) -> Result<()> {
    conn.set_pragma("user_version", version)?;
    Ok(())
}

// It would be nice for this to be #[cfg(test)], but that doesn't allow it to
// be used in tests for our other crates.
pub mod test_utils {
    use super::*;
    use std::path::PathBuf;
    use tempfile::TempDir;

    /// Database file that we can programmatically run upgrades on
    ///
    /// We purposefully don't keep a connection to the database around to
    /// force upgrades to always run against a newly opened DB, like they
    /// would in the real world.
    pub struct MigratedDatabaseFile<CI: ConnectionInitializer> {
        // Keep around a TempDir to ensure the database file stays around
        // until this struct is dropped
        _tempdir: TempDir,
        pub connection_initializer: CI,
        pub path: PathBuf,
    }

    impl<CI: ConnectionInitializer> MigratedDatabaseFile<CI> {
        pub fn new(connection_initializer: CI, init_sql: &str, version: u32) -> Self {
            let tempdir = tempfile::tempdir().unwrap();
            let path = tempdir.path().join("db.sql");
            let conn = Connection::open(&path).unwrap();
            conn.execute_batch(init_sql).unwrap();
            set_schema_version(&conn, version).unwrap();
            Self {
                _tempdir: tempdir,
                connection_initializer,
                path,
            }
        }

        pub fn open(&self) -> Connection {
            open_database(&self.path, &self.connection_initializer).unwrap()
        }
    }
}
