/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

//! Reflects the backend's tables, columns, primary keys and foreign keys
//! into a process-wide, read-mostly catalog. The catalog is cached until a
//! DDL statement (or an explicit override change) invalidates it.

use crate::error::*;
use parking_lot::RwLock;
use rusqlite::Connection;
use serde_derive::{Deserialize, Serialize};
use sql_support::ConnExt;
use std::collections::BTreeMap;
use std::sync::Arc;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnSchema {
    pub name: String,
    #[serde(rename = "type")]
    pub col_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<u32>,
    /// Name of the sequence filling this column on insert when absent from
    /// the input. Only ever set via overrides - SQLite doesn't have
    /// sequences, we emulate them with a counter table.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sequence: Option<String>,
}

impl ColumnSchema {
    pub fn new(name: impl Into<String>, col_type: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            col_type: col_type.into(),
            size: None,
            sequence: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForeignKey {
    pub this_column: String,
    pub target_table: String,
    pub target_column: String,
}

/// One constituent of a "view of tables": a view-typed table whose rows are
/// derived from `table`, with `version_column` carrying that sub-table's
/// version counter. Always configured explicitly - we refuse to infer the
/// column from naming conventions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ViewOf {
    pub table: String,
    pub version_column: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableSchema {
    pub name: String,
    pub columns: Vec<ColumnSchema>,
    /// Ordered primary key columns. Never empty after catalog load: tables
    /// with no declared pk default to the full column list.
    pub pk: Vec<String>,
    #[serde(default)]
    pub fks: Vec<ForeignKey>,
    #[serde(default)]
    pub view_of: Vec<ViewOf>,
}

impl TableSchema {
    pub fn column(&self, name: &str) -> Option<&ColumnSchema> {
        self.columns.iter().find(|c| c.name == name)
    }

    pub fn has_column(&self, name: &str) -> bool {
        self.column(name).is_some()
    }

    /// The first FK from this table to `other`, if any.
    pub fn fk_to(&self, other: &str) -> Option<&ForeignKey> {
        self.fks.iter().find(|fk| fk.target_table == other)
    }

    pub(crate) fn check_column(&self, name: &str) -> Result<()> {
        if self.has_column(name) {
            return Ok(());
        }
        Err(Error::UnknownColumn {
            table: self.name.clone(),
            column: name.to_string(),
        })
    }
}

#[derive(Debug, Clone, Default)]
pub struct Catalog {
    tables: BTreeMap<String, TableSchema>,
}

impl Catalog {
    pub fn table(&self, name: &str) -> Result<&TableSchema> {
        self.tables
            .get(name)
            .ok_or_else(|| Error::UnknownTable(name.to_string()))
    }

    pub fn get(&self, name: &str) -> Option<&TableSchema> {
        self.tables.get(name)
    }

    pub fn tables(&self) -> impl Iterator<Item = &TableSchema> {
        self.tables.values()
    }

    pub fn len(&self) -> usize {
        self.tables.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tables.is_empty()
    }
}

/// The process-wide schema catalog: lock-free reads of an `Arc` snapshot,
/// invalidated whenever we observe DDL.
pub struct SchemaCatalog {
    cache: RwLock<Option<Arc<Catalog>>>,
    overrides: RwLock<Vec<TableSchema>>,
}

impl SchemaCatalog {
    pub fn new(overrides: Vec<TableSchema>) -> Self {
        Self {
            cache: RwLock::new(None),
            overrides: RwLock::new(overrides),
        }
    }

    /// Return the (possibly cached) catalog.
    pub fn load(&self, conn: &Connection) -> Result<Arc<Catalog>> {
        if let Some(catalog) = &*self.cache.read() {
            return Ok(Arc::clone(catalog));
        }
        let mut reflected = reflect(conn)?;
        for over in self.overrides.read().iter() {
            merge_table(&mut reflected, over);
        }
        let catalog = Arc::new(reflected);
        *self.cache.write() = Some(Arc::clone(&catalog));
        Ok(catalog)
    }

    /// Drop the cached catalog. Called when DDL is observed.
    pub fn invalidate(&self) {
        *self.cache.write() = None;
    }

    /// Merge additional caller-supplied schema and invalidate.
    pub fn add_overrides(&self, tables: Vec<TableSchema>) {
        let mut overrides = self.overrides.write();
        for t in tables {
            if let Some(existing) = overrides.iter_mut().find(|o| o.name == t.name) {
                *existing = t;
            } else {
                overrides.push(t);
            }
        }
        drop(overrides);
        self.invalidate();
    }

    /// The schema version: the `db_version` row when the backend has one,
    /// otherwise a surrogate derived from the table and column counts -
    /// monotonic under the assumption that schema only grows.
    pub fn version(&self, conn: &Connection) -> Result<i64> {
        let catalog = self.load(conn)?;
        if catalog.get("db_version").is_some() {
            if let Some(v) =
                conn.try_query_one::<i64, _>("SELECT version FROM db_version LIMIT 1", [], false)?
            {
                return Ok(v);
            }
        }
        let columns: usize = catalog.tables().map(|t| t.columns.len()).sum();
        Ok((catalog.len() + columns) as i64)
    }
}

fn reflect(conn: &Connection) -> Result<Catalog> {
    let names: Vec<String> = conn.query_rows_and_then(
        "SELECT name FROM sqlite_master
         WHERE type IN ('table', 'view') AND name NOT LIKE 'sqlite_%'
         ORDER BY name",
        [],
        |row| -> Result<String> { Ok(row.get(0)?) },
    )?;

    let mut tables = BTreeMap::new();
    for name in names {
        let table = reflect_table(conn, &name)?;
        tables.insert(name, table);
    }
    Ok(Catalog { tables })
}

fn reflect_table(conn: &Connection, name: &str) -> Result<TableSchema> {
    // (ordinal-in-pk, column)
    let mut pk_cols: Vec<(i64, String)> = Vec::new();
    let columns = conn.query_rows_and_then(
        &format!("PRAGMA table_info(\"{}\")", name),
        [],
        |row| -> Result<ColumnSchema> {
            let col_name: String = row.get("name")?;
            let decl_type: String = row.get("type")?;
            let pk_ordinal: i64 = row.get("pk")?;
            if pk_ordinal > 0 {
                pk_cols.push((pk_ordinal, col_name.clone()));
            }
            let (col_type, size) = parse_decl_type(&decl_type);
            Ok(ColumnSchema {
                name: col_name,
                col_type,
                size,
                sequence: None,
            })
        },
    )?;

    pk_cols.sort_by_key(|(ord, _)| *ord);
    let pk: Vec<String> = if pk_cols.is_empty() {
        // No declared pk: every column is part of the key.
        columns.iter().map(|c| c.name.clone()).collect()
    } else {
        pk_cols.into_iter().map(|(_, c)| c).collect()
    };

    let fks = conn.query_rows_and_then(
        &format!("PRAGMA foreign_key_list(\"{}\")", name),
        [],
        |row| -> Result<ForeignKey> {
            let target_table: String = row.get("table")?;
            let this_column: String = row.get("from")?;
            // `to` is NULL when the FK references the target's pk implicitly;
            // we resolve that lazily below, after all tables are loaded, by
            // simply recording the column name as empty and fixing it here
            // with the common single-column-pk assumption.
            let target_column: Option<String> = row.get("to")?;
            Ok(ForeignKey {
                this_column,
                target_table,
                target_column: target_column.unwrap_or_default(),
            })
        },
    )?;
    let fks = fks
        .into_iter()
        .map(|mut fk| {
            if fk.target_column.is_empty() {
                // References the target's (single-column) pk implicitly.
                if let Ok(target) = reflect_table_pk(conn, &fk.target_table) {
                    if let Some(col) = target.first() {
                        fk.target_column = col.clone();
                    }
                }
            }
            fk
        })
        .collect();

    Ok(TableSchema {
        name: name.to_string(),
        columns,
        pk,
        fks,
        view_of: vec![],
    })
}

fn reflect_table_pk(conn: &Connection, name: &str) -> Result<Vec<String>> {
    let mut pk_cols: Vec<(i64, String)> = conn.query_rows_and_then(
        &format!("PRAGMA table_info(\"{}\")", name),
        [],
        |row| -> Result<(i64, String)> { Ok((row.get("pk")?, row.get("name")?)) },
    )?;
    pk_cols.retain(|(ord, _)| *ord > 0);
    pk_cols.sort_by_key(|(ord, _)| *ord);
    Ok(pk_cols.into_iter().map(|(_, c)| c).collect())
}

/// "VARCHAR(40)" -> ("VARCHAR", Some(40))
fn parse_decl_type(decl: &str) -> (String, Option<u32>) {
    match (decl.find('('), decl.rfind(')')) {
        (Some(open), Some(close)) if close > open => {
            let size = decl[open + 1..close].trim().parse().ok();
            (decl[..open].trim().to_string(), size)
        }
        _ => (decl.trim().to_string(), None),
    }
}

/// Merge a caller-supplied table schema into the reflected catalog: existing
/// columns are updated, new ones appended, pk/fks/view_of replaced when
/// supplied.
fn merge_table(catalog: &mut Catalog, over: &TableSchema) {
    match catalog.tables.get_mut(&over.name) {
        None => {
            catalog.tables.insert(over.name.clone(), over.clone());
        }
        Some(existing) => {
            for col in &over.columns {
                match existing.columns.iter_mut().find(|c| c.name == col.name) {
                    Some(c) => *c = col.clone(),
                    None => existing.columns.push(col.clone()),
                }
            }
            if !over.pk.is_empty() {
                existing.pk = over.pk.clone();
            }
            for fk in &over.fks {
                if !existing.fks.contains(fk) {
                    existing.fks.push(fk.clone());
                }
            }
            if !over.view_of.is_empty() {
                existing.view_of = over.view_of.clone();
            }
        }
    }
}

/// Case-insensitive check for DDL keywords in an executed statement, used
/// to decide whether the catalog must be invalidated.
pub(crate) fn statement_is_ddl(sql: &str) -> bool {
    let upper = sql.to_uppercase();
    upper.contains("CREATE") || upper.contains("ALTER")
}
