/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

#![allow(unknown_lints)]
#![warn(rust_2018_idioms)]

//! The bidirectional synchronization engine over [recstore].
//!
//! The server side applies uploaded change-sets with per-column
//! last-writer-wins against skew-adjusted timestamps, splicing audit rows
//! into the modification history when a late-arriving change is older than
//! what's recorded. The client side measures clock skew, drains its pending
//! queue into uploads, then downloads new rows and tombstones per table by
//! version number. Transport is a trait; HTTP lives elsewhere.

mod changeset;
mod client;
mod error;
mod server;
mod skew;
mod transport;

pub use crate::changeset::{Change, ChangeAction, ChangeSet, UploadOutcome};
pub use crate::client::{SyncClient, SyncOutcome};
pub use crate::error::*;
pub use crate::server::SyncServer;
pub use crate::skew::negotiate_skew;
pub use crate::transport::{InProcessTransport, SyncTransport};
