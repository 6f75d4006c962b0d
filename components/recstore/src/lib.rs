/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

#![allow(unknown_lints)]
#![warn(rust_2018_idioms)]

//! A generic, schema-driven access layer over SQLite.
//!
//! The [`Store`] is the entry point: it owns the writer connection, reflects
//! the schema into a process-wide catalog, translates example-based searches
//! and recursive join-fetch specs into SQL, and instruments every mutation of
//! a tracked table with version counters, column-level history and delete
//! tombstones - the raw material the sync engine reconciles against.

mod catalog;
mod changes;
mod client;
mod context;
mod db;
mod error;
pub mod history;
mod hooks;
mod joinfetch;
mod predicate;
mod query;
mod records;
mod tracker;

pub use crate::catalog::{Catalog, ColumnSchema, ForeignKey, TableSchema, ViewOf};
pub use crate::changes::{AppliedAction, AppliedChange, ChangeRequest, ChangeRequestAction, ReadResult, ReadSpec};
pub use crate::client::{Store, StoreBuilder, TxClient, UnsafeScope, DEFAULT_TRANSACTION_TIMEOUT};
pub use crate::context::Context;
pub use crate::error::*;
pub use crate::hooks::{OpInput, OpKind, OpResult};
pub use crate::joinfetch::{JoinFetch, JoinKind};
pub use crate::predicate::{FieldOp, OrderBy, Predicate};
pub use crate::records::{
    parse_table_uid, table_uid, value_repr, Record, PK_SEPARATOR, RESERVED_COLUMNS, VERSION_DATE,
    VERSION_RECORD, VERSION_TABLE, VERSION_USER,
};
pub use crate::tracker::TrackedTables;
