/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

#![allow(unknown_lints)]
#![warn(rust_2018_idioms)]

//! A content-addressed binary store linked to [recstore] records.
//!
//! Contents are written to a temp path, checksummed, registered in the
//! `binaries` metadata table inside a transaction, then atomically moved to
//! a path derived (once) from a configured pattern. The client side syncs
//! individual blobs with a three-way comparison - local checksum, server
//! checksum, checksum at last successful sync - consulting a pluggable
//! resolver when both sides changed.

mod error;
mod meta;
mod pattern;
mod store;
mod sync;

pub use crate::error::*;
pub use crate::meta::{BinaryMeta, SaveRequest};
pub use crate::pattern::expand_pattern;
pub use crate::store::{BlobStore, BlobStoreConfig, ChecksumAlgorithm};
pub use crate::sync::{
    BlobSyncAction, BlobSyncClient, BlobTransport, ConflictChoice, ConflictResolver,
    InProcessBlobTransport,
};
