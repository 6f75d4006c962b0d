/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

use crate::catalog::TableSchema;
use crate::error::*;
use rusqlite::types::{Value as SqlValue, ValueRef};
use serde_json::Value;

/// A row, as seen by callers: a JSON object mapping column name to value.
pub type Record = serde_json::Map<String, Value>;

/// The literal delimiter used to serialize pk tuples into the history and
/// tombstone tables. It must not appear in any pk value.
pub const PK_SEPARATOR: &str = "$_$";

pub const VERSION_RECORD: &str = "version_record";
pub const VERSION_TABLE: &str = "version_table";
pub const VERSION_DATE: &str = "version_date";
pub const VERSION_USER: &str = "version_user";

/// Columns maintained by the modification tracker on every tracked table.
pub const RESERVED_COLUMNS: [&str; 4] =
    [VERSION_RECORD, VERSION_TABLE, VERSION_DATE, VERSION_USER];

pub fn is_reserved_column(name: &str) -> bool {
    RESERVED_COLUMNS.contains(&name)
}

/// Convert a JSON value into something rusqlite can bind. Arrays and nested
/// objects are stored as their JSON text.
pub(crate) fn json_to_sql(v: &Value) -> SqlValue {
    match v {
        Value::Null => SqlValue::Null,
        Value::Bool(b) => SqlValue::Integer(i64::from(*b)),
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                SqlValue::Integer(i)
            } else {
                SqlValue::Real(n.as_f64().unwrap_or_default())
            }
        }
        Value::String(s) => SqlValue::Text(s.clone()),
        v => SqlValue::Text(v.to_string()),
    }
}

/// Convert a value read from SQLite back into JSON. Booleans necessarily
/// come back as 0/1 integers - SQLite has no boolean storage class.
pub(crate) fn sql_to_json(v: ValueRef<'_>) -> Value {
    match v {
        ValueRef::Null => Value::Null,
        ValueRef::Integer(i) => Value::from(i),
        ValueRef::Real(f) => serde_json::Number::from_f64(f)
            .map(Value::Number)
            .unwrap_or(Value::Null),
        ValueRef::Text(t) => Value::String(String::from_utf8_lossy(t).into_owned()),
        ValueRef::Blob(b) => {
            // Blobs are rare in the tables we manage; represent them as hex
            // so they survive the JSON roundtrip.
            let mut s = String::with_capacity(b.len() * 2);
            for byte in b {
                s.push_str(&format!("{:02x}", byte));
            }
            Value::String(s)
        }
    }
}

/// The canonical textual form of a value, used to compare columns for the
/// history diff and to serialize pk tuples. None means SQL NULL.
pub fn value_repr(v: &Value) -> Option<String> {
    match v {
        Value::Null => None,
        Value::Bool(b) => Some(b.to_string()),
        Value::Number(n) => Some(n.to_string()),
        Value::String(s) => Some(s.clone()),
        v => Some(v.to_string()),
    }
}

/// Serialize the pk tuple of `record` in declared pk order, joined with
/// [PK_SEPARATOR]. Every pk column must be present and non-null, and no
/// value may contain the separator.
pub fn table_uid(schema: &TableSchema, record: &Record) -> Result<String> {
    let mut parts = Vec::with_capacity(schema.pk.len());
    for col in &schema.pk {
        let part = record
            .get(col)
            .and_then(value_repr)
            .ok_or_else(|| Error::MissingPrimaryKey {
                table: schema.name.clone(),
                column: col.clone(),
            })?;
        if part.contains(PK_SEPARATOR) {
            return Err(Error::SeparatorInKey(part));
        }
        parts.push(part);
    }
    Ok(parts.join(PK_SEPARATOR))
}

/// The inverse of [table_uid]: split a serialized uid back into a record of
/// pk column values (as strings; SQLite's column affinity converts them on
/// comparison).
pub fn parse_table_uid(schema: &TableSchema, uid: &str) -> Result<Record> {
    let parts: Vec<&str> = uid.split(PK_SEPARATOR).collect();
    if parts.len() != schema.pk.len() {
        return Err(Error::InvalidPredicate(format!(
            "uid {:?} does not match the {}-column primary key of {}",
            uid,
            schema.pk.len(),
            schema.name
        )));
    }
    let mut record = Record::new();
    for (col, part) in schema.pk.iter().zip(parts) {
        record.insert(col.clone(), Value::String(part.to_string()));
    }
    Ok(record)
}

/// Extract the pk columns of `record` into a new record, failing if any is
/// missing.
pub(crate) fn pk_record(schema: &TableSchema, record: &Record) -> Result<Record> {
    let mut out = Record::new();
    for col in &schema.pk {
        let v = record.get(col).ok_or_else(|| Error::MissingPrimaryKey {
            table: schema.name.clone(),
            column: col.clone(),
        })?;
        if v.is_null() {
            return Err(Error::MissingPrimaryKey {
                table: schema.name.clone(),
                column: col.clone(),
            });
        }
        out.insert(col.clone(), v.clone());
    }
    Ok(out)
}
