/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

//! Storage-path patterns. A pattern is a relative path with tokens:
//! `{table}`, `{table_uid}`, `{uid}`, `{ext}`, `{date}` (UTC YYYYMMDD) and
//! `{time}` (UTC HHMMSS). Expansion happens once, when the metadata row is
//! first written; the result is immutable after that.

use crate::meta::BinaryMeta;
use chrono::{DateTime, Utc};

pub fn expand_pattern(pattern: &str, meta: &BinaryMeta, now: DateTime<Utc>) -> String {
    pattern
        .replace("{table}", &sanitize(&meta.table_name))
        .replace("{table_uid}", &sanitize(&meta.table_uid))
        .replace("{uid}", &sanitize(&meta.uid))
        .replace("{ext}", &sanitize(&meta.extension()))
        .replace("{date}", &now.format("%Y%m%d").to_string())
        .replace("{time}", &now.format("%H%M%S").to_string())
}

/// Keep expanded values path-safe: no separators or parent-dir hops out of
/// token values.
fn sanitize(value: &str) -> String {
    value
        .chars()
        .map(|c| match c {
            '/' | '\\' | ':' => '_',
            c => c,
        })
        .collect::<String>()
        .replace("..", "_")
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use types::Timestamp;

    fn meta() -> BinaryMeta {
        BinaryMeta {
            uid: "u1".into(),
            table_name: "contacts".into(),
            table_uid: "c$_$1".into(),
            checksum: "abc".into(),
            size: 1,
            creation_ts: Timestamp(1),
            modification_ts: Timestamp(1),
            mime_type: None,
            filename: Some("face.png".into()),
            description: None,
            path: String::new(),
            last_sync_checksum: None,
        }
    }

    #[test]
    fn test_expand() {
        let now = Utc.with_ymd_and_hms(2024, 3, 9, 13, 5, 7).unwrap();
        assert_eq!(
            expand_pattern("{table}/{table_uid}/{uid}.{ext}", &meta(), now),
            "contacts/c$_$1/u1.png"
        );
        assert_eq!(
            expand_pattern("{date}/{time}/{uid}", &meta(), now),
            "20240309/130507/u1"
        );
    }

    #[test]
    fn test_sanitize_traversal() {
        let mut m = meta();
        m.table_uid = "../../etc".into();
        let now = Utc.with_ymd_and_hms(2024, 3, 9, 13, 5, 7).unwrap();
        let expanded = expand_pattern("{table}/{table_uid}/{uid}", &m, now);
        assert!(!expanded.contains(".."));
    }
}
