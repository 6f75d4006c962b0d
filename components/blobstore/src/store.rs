/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

//! The store itself: temp-file staging, checksumming, the metadata upsert
//! and the atomic move into the derived path.
//!
//! Ordering is what makes the failure modes safe:
//!   - metadata write fails -> the temp file is deleted, nothing changed;
//!   - the move fails -> the temp file is kept and the metadata row stays,
//!     so the content can be reconciled later.

use crate::error::*;
use crate::meta::{BinaryMeta, SaveRequest};
use crate::pattern::expand_pattern;
use error_support::{debug, warn};
use md5::Md5;
use recstore::{Context, Predicate, Record, Store};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use types::Timestamp;

const CREATE_BINARIES_SQL: &str = "
    CREATE TABLE IF NOT EXISTS binaries (
        uid                TEXT PRIMARY KEY,
        table_name         TEXT NOT NULL,
        table_uid          TEXT NOT NULL,
        checksum           TEXT NOT NULL,
        size               INTEGER NOT NULL,
        creation_ts        INTEGER NOT NULL,
        modification_ts    INTEGER NOT NULL,
        mime_type          TEXT,
        filename           TEXT,
        description        TEXT,
        path               TEXT NOT NULL,
        last_sync_checksum TEXT
    );
    CREATE INDEX IF NOT EXISTS idx_binaries_record ON binaries (table_name, table_uid);
";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ChecksumAlgorithm {
    #[default]
    Md5,
    Sha256,
}

impl ChecksumAlgorithm {
    pub fn hash(self, bytes: &[u8]) -> String {
        match self {
            ChecksumAlgorithm::Md5 => hex(&Md5::digest(bytes)),
            ChecksumAlgorithm::Sha256 => hex(&Sha256::digest(bytes)),
        }
    }
}

fn hex(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        out.push_str(&format!("{:02x}", b));
    }
    out
}

#[derive(Debug, Clone)]
pub struct BlobStoreConfig {
    /// The storage root; files live under it, temp uploads under
    /// `root/temp/`.
    pub root: PathBuf,
    /// Pattern for derived paths, relative to the root.
    pub pattern: String,
    pub algorithm: ChecksumAlgorithm,
}

impl BlobStoreConfig {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        BlobStoreConfig {
            root: root.into(),
            pattern: "{table}/{table_uid}/{uid}.{ext}".to_string(),
            algorithm: ChecksumAlgorithm::default(),
        }
    }
}

pub struct BlobStore {
    store: Arc<Store>,
    config: BlobStoreConfig,
}

impl BlobStore {
    pub fn new(store: Arc<Store>, config: BlobStoreConfig) -> Result<Self> {
        let ctx = Context::anonymous();
        store.unsafe_scope(&ctx, |s| s.execute_batch(CREATE_BINARIES_SQL))?;
        // The binaries table is tracked like any other record table, so the
        // metadata carries version columns and syncs its own history.
        store.prepare_tracking()?;
        fs::create_dir_all(config.root.join("temp"))?;
        Ok(BlobStore { store, config })
    }

    pub fn store(&self) -> &Arc<Store> {
        &self.store
    }

    pub fn algorithm(&self) -> ChecksumAlgorithm {
        self.config.algorithm
    }

    /// Store content: stage to a temp file, checksum, upsert the metadata
    /// row, then move the file into its derived (immutable) path.
    pub fn save(&self, ctx: &Context, request: &SaveRequest, contents: &[u8]) -> Result<BinaryMeta> {
        let temp_path = self
            .config
            .root
            .join("temp")
            .join(uuid::Uuid::new_v4().to_string());
        fs::write(&temp_path, contents)?;

        let checksum = self.config.algorithm.hash(contents);
        let meta = match self.upsert_meta(ctx, request, &checksum, contents.len() as i64) {
            Ok(meta) => meta,
            Err(e) => {
                // Nothing points at the temp file; clean it up.
                let _ = fs::remove_file(&temp_path);
                return Err(e);
            }
        };

        let final_path = self.config.root.join(&meta.path);
        if let Some(parent) = final_path.parent() {
            fs::create_dir_all(parent)?;
        }
        if let Err(source) = fs::rename(&temp_path, &final_path) {
            // The metadata row stays so the content can be reconciled.
            return Err(Error::RenameFailed {
                temp_path: temp_path.to_string_lossy().into_owned(),
                source,
            });
        }
        debug!("stored binary {} at {}", meta.uid, meta.path);
        Ok(meta)
    }

    fn upsert_meta(
        &self,
        ctx: &Context,
        request: &SaveRequest,
        checksum: &str,
        size: i64,
    ) -> Result<BinaryMeta> {
        let now = Timestamp::now();
        self.store.transaction(ctx, |tx| -> Result<BinaryMeta> {
            let existing = match &request.uid {
                Some(uid) => tx.get_raw("binaries", &Value::String(uid.clone()))?,
                None => None,
            };
            match existing {
                None => {
                    let mut meta = BinaryMeta {
                        uid: request
                            .uid
                            .clone()
                            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string()),
                        table_name: request.table_name.clone(),
                        table_uid: request.table_uid.clone(),
                        checksum: checksum.to_string(),
                        size,
                        creation_ts: now,
                        modification_ts: now,
                        mime_type: request.mime_type.clone(),
                        filename: request.filename.clone(),
                        description: request.description.clone(),
                        path: String::new(),
                        last_sync_checksum: None,
                    };
                    meta.path = expand_pattern(&self.config.pattern, &meta, chrono::Utc::now());
                    tx.insert("binaries", &meta.to_record()?)?;
                    Ok(meta)
                }
                Some(row) => {
                    let mut meta = BinaryMeta::from_record(&row)?;
                    meta.table_name = request.table_name.clone();
                    meta.table_uid = request.table_uid.clone();
                    meta.checksum = checksum.to_string();
                    meta.size = size;
                    meta.modification_ts = now;
                    meta.mime_type = request.mime_type.clone();
                    meta.filename = request.filename.clone();
                    meta.description = request.description.clone();
                    // creation_ts and path are preserved; the path never
                    // moves once derived.
                    tx.update("binaries", &meta.to_record()?)?;
                    Ok(meta)
                }
            }
        })
    }

    pub fn meta(&self, ctx: &Context, uid: &str) -> Result<Option<BinaryMeta>> {
        let row = self
            .store
            .get_by_pk(ctx, "binaries", &Value::String(uid.to_string()), None)?;
        row.map(|r| BinaryMeta::from_record(&r)).transpose()
    }

    /// Metadata rows attached to one record (table, table_uid).
    pub fn for_record(&self, ctx: &Context, table: &str, table_uid: &str) -> Result<Vec<BinaryMeta>> {
        let rows = self.store.search(
            ctx,
            "binaries",
            &Predicate::And(vec![
                Predicate::eq("table_name", table),
                Predicate::eq("table_uid", table_uid),
            ]),
            None,
            Some("uid"),
            None,
            None,
        )?;
        rows.iter().map(BinaryMeta::from_record).collect()
    }

    /// The absolute path of a stored blob.
    pub fn file_path(&self, meta: &BinaryMeta) -> PathBuf {
        self.config.root.join(&meta.path)
    }

    /// Read the stored bytes, verifying them against the recorded
    /// checksum.
    pub fn read(&self, ctx: &Context, uid: &str) -> Result<(BinaryMeta, Vec<u8>)> {
        let meta = self
            .meta(ctx, uid)?
            .ok_or_else(|| Error::NoSuchBinary(uid.to_string()))?;
        let bytes = fs::read(self.file_path(&meta))?;
        let actual = self.config.algorithm.hash(&bytes);
        if actual != meta.checksum {
            return Err(Error::ChecksumMismatch {
                uid: uid.to_string(),
                expected: meta.checksum,
                actual,
            });
        }
        Ok((meta, bytes))
    }

    /// Whether the backing file exists for this metadata row.
    pub fn has_file(&self, meta: &BinaryMeta) -> bool {
        self.file_path(meta).exists()
    }

    /// Delete the metadata row and its backing file.
    pub fn delete(&self, ctx: &Context, uid: &str) -> Result<()> {
        let meta = self
            .meta(ctx, uid)?
            .ok_or_else(|| Error::NoSuchBinary(uid.to_string()))?;
        self.store
            .remove(ctx, "binaries", &Value::String(uid.to_string()))?;
        let path = self.file_path(&meta);
        if let Err(e) = fs::remove_file(&path) {
            warn!("binary {} removed but its file did not delete: {}", uid, e);
        }
        Ok(())
    }

    /// Update the remembered last-successful-sync checksum without
    /// disturbing the row's version columns.
    pub(crate) fn set_last_sync_checksum(&self, uid: &str, checksum: Option<&str>) -> Result<()> {
        let ctx = Context::passthrough();
        let mut rec = Record::new();
        rec.insert("uid".into(), Value::String(uid.to_string()));
        rec.insert(
            "last_sync_checksum".into(),
            checksum.map_or(Value::Null, |c| Value::String(c.to_string())),
        );
        self.store.update(&ctx, "binaries", &rec)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use recstore::StoreBuilder;

    pub(crate) fn new_blob_store(name: &str) -> (BlobStore, tempfile::TempDir) {
        let _ = env_logger::try_init();
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(StoreBuilder::in_memory(name).open().unwrap());
        let blob = BlobStore::new(store, BlobStoreConfig::new(dir.path())).unwrap();
        (blob, dir)
    }

    fn request() -> SaveRequest {
        SaveRequest {
            uid: None,
            table_name: "contacts".into(),
            table_uid: "c1".into(),
            mime_type: Some("text/plain".into()),
            filename: Some("note.txt".into()),
            description: None,
        }
    }

    #[test]
    fn test_save_read_roundtrip() {
        let (blob, _dir) = new_blob_store("blob-save");
        let ctx = Context::new("ada");
        let meta = blob.save(&ctx, &request(), b"hello world").unwrap();
        assert_eq!(meta.size, 11);
        assert_eq!(meta.path, format!("contacts/c1/{}.txt", meta.uid));
        // Property: hashing the stored file yields the recorded checksum.
        let (read_meta, bytes) = blob.read(&ctx, &meta.uid).unwrap();
        assert_eq!(bytes, b"hello world");
        assert_eq!(read_meta.checksum, blob.algorithm().hash(b"hello world"));
        // md5 of "hello world", as a spot check of the default algorithm.
        assert_eq!(read_meta.checksum, "5eb63bbbe01eeed093cb22bb8f5acdc3");
    }

    #[test]
    fn test_save_again_keeps_path_and_creation() {
        let (blob, _dir) = new_blob_store("blob-resave");
        let ctx = Context::new("ada");
        let first = blob.save(&ctx, &request(), b"v1").unwrap();
        let mut again = request();
        again.uid = Some(first.uid.clone());
        let second = blob.save(&ctx, &again, b"version two").unwrap();
        assert_eq!(second.uid, first.uid);
        assert_eq!(second.path, first.path);
        assert_eq!(second.creation_ts, first.creation_ts);
        assert_ne!(second.checksum, first.checksum);
        let (_, bytes) = blob.read(&ctx, &first.uid).unwrap();
        assert_eq!(bytes, b"version two");
        // The metadata update bumped the record version.
        let row = blob
            .store()
            .get_by_pk(&ctx, "binaries", &Value::String(first.uid.clone()), None)
            .unwrap()
            .unwrap();
        assert_eq!(row.get("version_record"), Some(&serde_json::json!(1)));
    }

    #[test]
    fn test_temp_dir_left_clean() {
        let (blob, dir) = new_blob_store("blob-temp");
        let ctx = Context::new("ada");
        blob.save(&ctx, &request(), b"data").unwrap();
        let temp_entries: Vec<_> = std::fs::read_dir(dir.path().join("temp"))
            .unwrap()
            .collect();
        assert!(temp_entries.is_empty());
    }

    #[test]
    fn test_delete_removes_file() {
        let (blob, _dir) = new_blob_store("blob-delete");
        let ctx = Context::new("ada");
        let meta = blob.save(&ctx, &request(), b"doomed").unwrap();
        let path = blob.file_path(&meta);
        assert!(path.exists());
        blob.delete(&ctx, &meta.uid).unwrap();
        assert!(!path.exists());
        assert!(blob.meta(&ctx, &meta.uid).unwrap().is_none());
        // Tracked table: the delete left a tombstone.
        assert_eq!(
            blob.store().tombstones_since("binaries", -1).unwrap().len(),
            1
        );
    }

    #[test]
    fn test_for_record_lists_attachments() {
        let (blob, _dir) = new_blob_store("blob-for-record");
        let ctx = Context::new("ada");
        blob.save(&ctx, &request(), b"one").unwrap();
        blob.save(&ctx, &request(), b"two").unwrap();
        let mut other = request();
        other.table_uid = "c2".into();
        blob.save(&ctx, &other, b"three").unwrap();

        let attached = blob.for_record(&ctx, "contacts", "c1").unwrap();
        assert_eq!(attached.len(), 2);
        assert!(attached.iter().all(|m| m.table_uid == "c1"));
    }

    #[test]
    fn test_read_missing_uid() {
        let (blob, _dir) = new_blob_store("blob-missing");
        let ctx = Context::new("ada");
        assert!(matches!(
            blob.read(&ctx, "nope"),
            Err(Error::NoSuchBinary(_))
        ));
    }

    #[test]
    fn test_sha256_algorithm() {
        let _ = env_logger::try_init();
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(StoreBuilder::in_memory("blob-sha").open().unwrap());
        let mut config = BlobStoreConfig::new(dir.path());
        config.algorithm = ChecksumAlgorithm::Sha256;
        let blob = BlobStore::new(store, config).unwrap();
        let ctx = Context::new("ada");
        let meta = blob.save(&ctx, &request(), b"abc").unwrap();
        assert_eq!(
            meta.checksum,
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }
}
