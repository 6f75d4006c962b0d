/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

//! Small shared pieces of SELECT building. The interesting work - join
//! trees, windowed paging, result assembly - lives in `joinfetch`.

use crate::catalog::TableSchema;
use crate::error::*;
use crate::records::{sql_to_json, Record};
use rusqlite::Row;
use serde_json::Value;

/// What a query reads from: the bare table, or the registered view-rewrite
/// expression substituted for it.
#[derive(Debug, Clone)]
pub(crate) struct SelectSource {
    pub table: String,
    pub view_expr: Option<String>,
}

impl SelectSource {
    /// Render as a FROM-clause item bound to `alias`.
    pub fn sql(&self, alias: &str) -> String {
        match &self.view_expr {
            Some(expr) => format!("({}) AS {}", expr, alias),
            None => format!("\"{}\" AS {}", self.table, alias),
        }
    }
}

/// The explicit, aliased column list for a table. We never SELECT *; the
/// declared column order is what positions the row reads below.
pub(crate) fn column_list(schema: &TableSchema, alias: &str) -> String {
    schema
        .columns
        .iter()
        .map(|c| format!("{}.\"{}\"", alias, c.name))
        .collect::<Vec<_>>()
        .join(", ")
}

/// Read one table's columns out of a row, starting at `offset` in the
/// select list.
pub(crate) fn read_record(row: &Row<'_>, schema: &TableSchema, offset: usize) -> Result<Record> {
    let mut record = Record::new();
    for (i, col) in schema.columns.iter().enumerate() {
        let v: Value = sql_to_json(row.get_ref(offset + i)?);
        record.insert(col.name.clone(), v);
    }
    Ok(record)
}

/// True when every pk column of the record at `offset` is NULL - i.e. a
/// LEFT JOIN produced no row on that side.
pub(crate) fn row_side_is_null(
    row: &Row<'_>,
    schema: &TableSchema,
    offset: usize,
) -> Result<bool> {
    for pk_col in &schema.pk {
        let idx = schema
            .columns
            .iter()
            .position(|c| &c.name == pk_col)
            .ok_or_else(|| Error::UnknownColumn {
                table: schema.name.clone(),
                column: pk_col.clone(),
            })?;
        if row.get_ref(offset + idx)? != rusqlite::types::ValueRef::Null {
            return Ok(false);
        }
    }
    Ok(true)
}
