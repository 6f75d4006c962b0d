/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

use crate::error::*;
use recstore::Record;
use serde_derive::{Deserialize, Serialize};
use types::Timestamp;

/// The metadata row for one stored blob. `path` is derived from the
/// configured pattern when the row is first written and never changes;
/// the file at `path` always hashes to `checksum`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BinaryMeta {
    pub uid: String,
    pub table_name: String,
    pub table_uid: String,
    pub checksum: String,
    pub size: i64,
    pub creation_ts: Timestamp,
    pub modification_ts: Timestamp,
    #[serde(default)]
    pub mime_type: Option<String>,
    #[serde(default)]
    pub filename: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    pub path: String,
    /// Client-side only: the checksum at the last successful sync, the
    /// third leg of the three-way comparison.
    #[serde(default)]
    pub last_sync_checksum: Option<String>,
}

impl BinaryMeta {
    pub(crate) fn from_record(record: &Record) -> Result<BinaryMeta> {
        let mut filtered = record.clone();
        // Drop the version columns the tracker added; they're not ours.
        for col in recstore::RESERVED_COLUMNS {
            filtered.remove(col);
        }
        Ok(serde_json::from_value(serde_json::Value::Object(filtered))?)
    }

    pub(crate) fn to_record(&self) -> Result<Record> {
        match serde_json::to_value(self)? {
            serde_json::Value::Object(map) => Ok(map),
            _ => unreachable!("a struct serializes to an object"),
        }
    }

    /// The extension used for the `{ext}` path token: from the filename if
    /// it has one, else from the mime subtype, else "bin".
    pub fn extension(&self) -> String {
        if let Some(filename) = &self.filename {
            if let Some((_, ext)) = filename.rsplit_once('.') {
                if !ext.is_empty() {
                    return ext.to_lowercase();
                }
            }
        }
        if let Some(mime) = &self.mime_type {
            if let Some((_, subtype)) = mime.split_once('/') {
                if !subtype.is_empty() {
                    return subtype.to_lowercase();
                }
            }
        }
        "bin".to_string()
    }
}

/// What a caller supplies when storing content; everything else on
/// [BinaryMeta] is computed.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SaveRequest {
    /// Reuse an existing row's uid to replace its content; a fresh uid is
    /// generated when absent.
    #[serde(default)]
    pub uid: Option<String>,
    pub table_name: String,
    pub table_uid: String,
    #[serde(default)]
    pub mime_type: Option<String>,
    #[serde(default)]
    pub filename: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
}

impl SaveRequest {
    /// A request that would re-upload `meta`'s content elsewhere.
    pub fn for_meta(meta: &BinaryMeta) -> SaveRequest {
        SaveRequest {
            uid: Some(meta.uid.clone()),
            table_name: meta.table_name.clone(),
            table_uid: meta.table_uid.clone(),
            mime_type: meta.mime_type.clone(),
            filename: meta.filename.clone(),
            description: meta.description.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_extension() {
        let mut meta = BinaryMeta {
            uid: "u".into(),
            table_name: "t".into(),
            table_uid: "1".into(),
            checksum: "c".into(),
            size: 0,
            creation_ts: Timestamp(1),
            modification_ts: Timestamp(1),
            mime_type: Some("image/png".into()),
            filename: Some("photo.JPG".into()),
            description: None,
            path: "p".into(),
            last_sync_checksum: None,
        };
        assert_eq!(meta.extension(), "jpg");
        meta.filename = Some("noext".into());
        assert_eq!(meta.extension(), "png");
        meta.mime_type = None;
        assert_eq!(meta.extension(), "bin");
    }

    #[test]
    fn test_record_roundtrip_strips_version_columns() {
        let record: Record = serde_json::from_value(json!({
            "uid": "u1",
            "table_name": "contacts",
            "table_uid": "c1",
            "checksum": "abc",
            "size": 3,
            "creation_ts": 1000,
            "modification_ts": 2000,
            "mime_type": null,
            "filename": "a.txt",
            "description": null,
            "path": "contacts/c1/u1.txt",
            "last_sync_checksum": null,
            "version_record": 4,
            "version_table": 9,
            "version_date": 123,
            "version_user": "ada"
        }))
        .unwrap();
        let meta = BinaryMeta::from_record(&record).unwrap();
        assert_eq!(meta.uid, "u1");
        assert_eq!(meta.size, 3);
        let back = meta.to_record().unwrap();
        assert!(!back.contains_key("version_record"));
    }
}
