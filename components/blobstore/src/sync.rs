/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

//! The client-side three-way blob sync.
//!
//! Per blob, three checksums drive the decision: the local content (Lc),
//! the server content (Sc) and the content at the last successful sync
//! (Fc). Either side alone having moved is an upload or a download; both
//! having moved is a conflict handed to the resolver. When the resolver
//! picks the server copy, the local copy is uploaded *first* as an audit
//! trace - the server's metadata history then shows the losing content
//! before it is overwritten locally.

use crate::error::*;
use crate::meta::{BinaryMeta, SaveRequest};
use crate::store::BlobStore;
use error_support::debug;
use recstore::Context;

/// The transport seam for blob content; the HTTP surface implements this
/// elsewhere.
pub trait BlobTransport: Send + Sync {
    fn fetch_meta(&self, uid: &str) -> Result<Option<BinaryMeta>>;
    fn download(&self, uid: &str) -> Result<(BinaryMeta, Vec<u8>)>;
    fn upload(&self, request: &SaveRequest, contents: &[u8]) -> Result<BinaryMeta>;
}

/// What the resolver decides when both sides changed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConflictChoice {
    /// Upload the local copy; the server's version is superseded.
    KeepLocal,
    /// Take the server copy; the local one is uploaded first as an audit
    /// trace, then overwritten.
    KeepServer,
}

pub trait ConflictResolver: Send + Sync {
    fn resolve(&self, local: &BinaryMeta, server: &BinaryMeta) -> ConflictChoice;
}

/// What a sync did for one blob.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlobSyncAction {
    NoOp,
    Skipped,
    Uploaded,
    Downloaded,
    ConflictUploaded,
    ConflictDownloaded,
}

pub struct BlobSyncClient {
    local: BlobStore,
    transport: Box<dyn BlobTransport>,
    resolver: Box<dyn ConflictResolver>,
}

impl BlobSyncClient {
    pub fn new(
        local: BlobStore,
        transport: Box<dyn BlobTransport>,
        resolver: Box<dyn ConflictResolver>,
    ) -> Self {
        BlobSyncClient {
            local,
            transport,
            resolver,
        }
    }

    pub fn local(&self) -> &BlobStore {
        &self.local
    }

    /// Reconcile one blob with the server.
    pub fn sync_blob(&self, ctx: &Context, uid: &str) -> Result<BlobSyncAction> {
        let local_meta = self.local.meta(ctx, uid)?.filter(|m| self.local.has_file(m));
        let server_meta = self.transport.fetch_meta(uid)?;

        let action = match (&local_meta, &server_meta) {
            (None, None) => BlobSyncAction::Skipped,
            (None, Some(_)) => {
                self.download(ctx, uid)?;
                BlobSyncAction::Downloaded
            }
            (Some(local), None) => {
                self.upload(ctx, local)?;
                BlobSyncAction::Uploaded
            }
            (Some(local), Some(server)) => {
                let lc = local.checksum.as_str();
                let sc = server.checksum.as_str();
                let fc = local.last_sync_checksum.as_deref();
                if lc == sc {
                    // Same content; just remember it as the sync point.
                    self.local.set_last_sync_checksum(uid, Some(lc))?;
                    BlobSyncAction::NoOp
                } else if fc == Some(sc) {
                    // Only we moved.
                    self.upload(ctx, local)?;
                    BlobSyncAction::Uploaded
                } else if fc == Some(lc) {
                    // Only the server moved.
                    self.download(ctx, uid)?;
                    BlobSyncAction::Downloaded
                } else {
                    // Both moved since the last sync.
                    match self.resolver.resolve(local, server) {
                        ConflictChoice::KeepLocal => {
                            debug!("blob {} conflict: keeping local copy", uid);
                            self.upload(ctx, local)?;
                            BlobSyncAction::ConflictUploaded
                        }
                        ConflictChoice::KeepServer => {
                            debug!("blob {} conflict: taking server copy", uid);
                            // Capture the winning server copy, upload the
                            // losing local bytes as an audit trace, then put
                            // the server copy back so it stays current. The
                            // server's metadata history ends up recording
                            // the transition through the local content.
                            let (server_meta, server_bytes) = self.transport.download(uid)?;
                            let (_, local_bytes) = self.local.read(ctx, &local.uid)?;
                            self.transport
                                .upload(&SaveRequest::for_meta(local), &local_bytes)?;
                            self.transport
                                .upload(&SaveRequest::for_meta(&server_meta), &server_bytes)?;
                            let mut request = SaveRequest::for_meta(&server_meta);
                            request.uid = Some(uid.to_string());
                            self.local.save(ctx, &request, &server_bytes)?;
                            self.local
                                .set_last_sync_checksum(uid, Some(&server_meta.checksum))?;
                            BlobSyncAction::ConflictDownloaded
                        }
                    }
                }
            }
        };
        Ok(action)
    }

    fn upload(&self, ctx: &Context, local: &BinaryMeta) -> Result<()> {
        let (_, bytes) = self.local.read(ctx, &local.uid)?;
        let uploaded = self
            .transport
            .upload(&SaveRequest::for_meta(local), &bytes)?;
        self.local
            .set_last_sync_checksum(&local.uid, Some(&uploaded.checksum))?;
        Ok(())
    }

    fn download(&self, ctx: &Context, uid: &str) -> Result<()> {
        let (server_meta, bytes) = self.transport.download(uid)?;
        let mut request = SaveRequest::for_meta(&server_meta);
        request.uid = Some(uid.to_string());
        self.local.save(ctx, &request, &bytes)?;
        self.local
            .set_last_sync_checksum(uid, Some(&server_meta.checksum))?;
        Ok(())
    }
}

/// A transport wired straight to a server-side [BlobStore], for tests and
/// single-process deployments.
pub struct InProcessBlobTransport {
    server: BlobStore,
    actor: Option<String>,
}

impl InProcessBlobTransport {
    pub fn new(server: BlobStore, actor: Option<String>) -> Self {
        Self { server, actor }
    }

    fn ctx(&self) -> Context {
        match &self.actor {
            Some(a) => Context::new(a.clone()),
            None => Context::anonymous(),
        }
    }

    pub fn server(&self) -> &BlobStore {
        &self.server
    }
}

impl BlobTransport for InProcessBlobTransport {
    fn fetch_meta(&self, uid: &str) -> Result<Option<BinaryMeta>> {
        self.server.meta(&self.ctx(), uid)
    }

    fn download(&self, uid: &str) -> Result<(BinaryMeta, Vec<u8>)> {
        self.server.read(&self.ctx(), uid)
    }

    fn upload(&self, request: &SaveRequest, contents: &[u8]) -> Result<BinaryMeta> {
        self.server.save(&self.ctx(), request, contents)
    }
}
